//! Core primitives shared by the aggregator, the validator and the operator CLI.
//!
//! Everything in this crate is pure: hashing, tree construction, proof
//! verification and batch state transitions. I/O lives in the `aggregator` crate.

pub mod digest;
pub mod error;
pub mod leaf;
pub mod merkle;
pub mod state;

pub use digest::*;
pub use error::*;
pub use leaf::*;
pub use merkle::*;
pub use state::*;
