pub mod batch_file;
pub mod utils;

pub use batch_file::*;
