use std::time::Duration;

use async_trait::async_trait;
use openvote_core::{CommitRecord, CommitRequest, Digest, Error};
use reqwest::{Client, Response, StatusCode};
use tracing::debug;

use super::{GatewayError, LatestResponse, Ledger, RootResponse};

/// Ledger gateway client.
///
/// Protocol (JSON): `POST {base}/commit` with a [`CommitRequest`] returns a
/// [`CommitRecord`]; `GET {base}/batches/{id}/root` returns a
/// [`RootResponse`] or 404; `GET {base}/latest` returns a [`LatestResponse`].
pub struct HttpLedger {
    client: Client,
    base_url: String,
}

impl HttpLedger {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn unreachable(e: reqwest::Error) -> Error {
    Error::LedgerUnreachable(e.to_string())
}

/// 4xx other than timeouts and throttling is the ledger saying no.
fn is_rejection(status: StatusCode) -> bool {
    status.is_client_error()
        && status != StatusCode::REQUEST_TIMEOUT
        && status != StatusCode::TOO_MANY_REQUESTS
}

async fn error_reason(resp: Response) -> String {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<GatewayError>(&body)
        .map(|e| e.error)
        .unwrap_or(body);
    format!("{}: {}", status, detail)
}

#[async_trait]
impl Ledger for HttpLedger {
    async fn commit(&self, request: &CommitRequest) -> Result<CommitRecord, Error> {
        debug!("POST {} submission={}", self.url("/commit"), request.submission_id);
        let resp = self
            .client
            .post(self.url("/commit"))
            .json(request)
            .send()
            .await
            .map_err(unreachable)?;

        let status = resp.status();
        if status.is_success() {
            return resp.json::<CommitRecord>().await.map_err(unreachable);
        }

        let reason = error_reason(resp).await;
        if is_rejection(status) {
            Err(Error::LedgerRejected(reason))
        } else {
            Err(Error::LedgerUnreachable(reason))
        }
    }

    async fn committed_root(&self, ledger_batch_id: u64) -> Result<Option<Digest>, Error> {
        let resp = self
            .client
            .get(self.url(&format!("/batches/{}/root", ledger_batch_id)))
            .send()
            .await
            .map_err(unreachable)?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let body = resp.json::<RootResponse>().await.map_err(unreachable)?;
                Ok(Some(body.root))
            }
            _ => Err(Error::LedgerUnreachable(error_reason(resp).await)),
        }
    }

    async fn latest_batch_id(&self) -> Result<Option<u64>, Error> {
        let resp = self
            .client
            .get(self.url("/latest"))
            .send()
            .await
            .map_err(unreachable)?;

        if !resp.status().is_success() {
            return Err(Error::LedgerUnreachable(error_reason(resp).await));
        }
        let body = resp.json::<LatestResponse>().await.map_err(unreachable)?;
        Ok(body.latest_batch_id)
    }

    fn describe(&self) -> String {
        self.base_url.clone()
    }
}
