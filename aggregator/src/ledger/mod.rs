//! Ledger commitment client.
//!
//! The ledger is the append-only authority for committed roots and for dedup
//! key uniqueness. Two implementations: [`HttpLedger`] talks to a ledger
//! gateway over JSON, [`InMemoryLedger`] backs dev mode and tests.

mod http;
mod memory;

pub use http::HttpLedger;
pub use memory::InMemoryLedger;

use async_trait::async_trait;
use openvote_core::{CommitRecord, CommitRequest, Digest, Error};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Append `request.root` and atomically record its dedup keys.
    ///
    /// `LedgerRejected` is authoritative (e.g. a dedup key already recorded)
    /// and must not be retried with the same payload. `LedgerUnreachable` is
    /// transient. Submitting the same `submission_id` twice returns the
    /// original record.
    async fn commit(&self, request: &CommitRequest) -> Result<CommitRecord, Error>;

    /// Root committed under `ledger_batch_id`, `None` if there is none yet.
    async fn committed_root(&self, ledger_batch_id: u64) -> Result<Option<Digest>, Error>;

    /// Highest ledger batch id, `None` before the first commit.
    async fn latest_batch_id(&self) -> Result<Option<u64>, Error>;

    /// Push notifications of new ledger batch ids, when the ledger offers them.
    fn subscribe(&self) -> Option<broadcast::Receiver<u64>> {
        None
    }

    /// Short description for logs and health output.
    fn describe(&self) -> String;
}

/// `GET /batches/{id}/root` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootResponse {
    pub ledger_batch_id: u64,
    pub root: Digest,
}

/// `GET /latest` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatestResponse {
    pub latest_batch_id: Option<u64>,
}

/// Error body returned by the gateway on non-2xx responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayError {
    pub error: String,
}
