#[cfg(test)]
mod test_failure_modes;
#[cfg(test)]
mod test_full_flow;
#[cfg(test)]
mod utils;
