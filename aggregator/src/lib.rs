//! OpenVote aggregator: intake queue, batch accumulator, ledger commitment,
//! batch archive and reconciliation, plus the HTTP surface that exposes them.

pub mod accumulator;
pub mod archive;
pub mod auth_middleware;
pub mod config;
pub mod database;
pub mod ledger;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod reconcile;
pub mod retry;
pub mod routes;
pub mod state;
pub mod utils;
