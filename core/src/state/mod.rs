pub mod batch;
pub mod commit;
pub mod reconciliation;
pub mod record;

pub use batch::*;
pub use commit::*;
pub use reconciliation::*;
pub use record::*;
