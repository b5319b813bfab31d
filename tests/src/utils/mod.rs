pub mod assert;
pub mod harness;
