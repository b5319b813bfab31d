use reqwest::Client;
use std::process::{Command, Stdio};
use std::{
    net::TcpListener,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::time::sleep;

/// Get an available ephemeral port on localhost.
pub fn find_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral");
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// Resolve a binary of this package from env or common target dirs.
pub fn resolve_binary_path(name: &str) -> String {
    if let Ok(p) = std::env::var(format!("CARGO_BIN_EXE_{}", name)) {
        return p;
    }

    let manifest = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let workspace_root = manifest.parent().unwrap_or(&manifest).to_path_buf();
    let candidates = [
        manifest.join("target/debug").join(name),
        manifest.join("target/release").join(name),
        workspace_root.join("target/debug").join(name),
        workspace_root.join("target/release").join(name),
    ];
    for cand in candidates.iter() {
        if Path::new(&cand).exists() {
            return cand.to_string_lossy().to_string();
        }
    }

    name.to_string()
}

/// Poll /healthz until the server responds OK or timeout.
pub async fn wait_ready(base: &str, timeout_ms: u64) -> anyhow::Result<()> {
    let client = Client::new();
    let mut waited = 0u64;
    loop {
        if waited >= timeout_ms {
            anyhow::bail!("server not ready after {}ms", timeout_ms);
        }
        if let Ok(resp) = client.get(format!("{}/healthz", base)).send().await {
            if resp.status().is_success() {
                return Ok(());
            }
        }
        sleep(Duration::from_millis(50)).await;
        waited += 50;
    }
}

/// GET `url` until it returns 200, then parse the body.
pub async fn poll_json(url: &str, timeout_ms: u64) -> anyhow::Result<serde_json::Value> {
    let client = Client::new();
    let mut waited = 0u64;
    loop {
        let resp = client.get(url).send().await?;
        if resp.status().is_success() {
            return Ok(resp.json().await?);
        }
        if waited >= timeout_ms {
            anyhow::bail!("{} still returned {} after {}ms", url, resp.status(), timeout_ms);
        }
        sleep(Duration::from_millis(50)).await;
        waited += 50;
    }
}

// Struct that ensures the child process is killed on drop
pub struct ChildGuard(std::process::Child);
impl Drop for ChildGuard {
    fn drop(&mut self) {
        let _ = self.0.kill();
    }
}

/// Start the aggregator on a free port with an in-memory database and the
/// dev ledger.
pub async fn setup_server(max_batch_size: usize) -> anyhow::Result<(String, ChildGuard)> {
    let bin = resolve_binary_path("aggregator");
    let bin_path = Path::new(&bin);
    assert!(bin_path.exists(), "binary not found at {}", bin);

    let port = find_free_port();
    let base_url = format!("http://127.0.0.1:{}", port);

    let child = Command::new(&bin)
        .env_remove("LEDGER_URL")
        .env("METRICS_AUTH_TOKEN", "test-token")
        .env("DB_PATH", ":memory:")
        .env("PORT", port.to_string())
        .env("RUST_LOG", "info")
        .env("MAX_BATCH_SIZE", max_batch_size.to_string())
        .env("MAX_BATCH_INTERVAL_MS", "60000")
        .env("RECONCILE_INTERVAL_SECS", "1")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    // Ensure we always try to kill the child on exit
    let guard = ChildGuard(child);

    wait_ready(&base_url, 10_000).await?;

    Ok((base_url, guard))
}
