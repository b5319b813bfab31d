use std::collections::HashMap;
use std::sync::Mutex;

use openvote_core::{FailureKind, ReconciliationStatus, SealTrigger};
use serde_json::{json, Value};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum IntakeOutcome {
    Accepted,
    Rejected,
    PersistFailed,
}

impl IntakeOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            IntakeOutcome::Accepted => "accepted",
            IntakeOutcome::Rejected => "rejected",
            IntakeOutcome::PersistFailed => "persist_failed",
        }
    }
}

#[derive(Default)]
struct Counters {
    intake_total: HashMap<IntakeOutcome, u64>,
    seals_total: HashMap<SealTrigger, u64>,
    sealed_records_total: u64,
    duplicates_filtered_total: u64,
    commits_total: u64,
    commit_failures_total: HashMap<FailureKind, u64>,
    archive_deferred_total: u64,
    reconciliation_attempts_total: HashMap<ReconciliationStatus, u64>,
}

/// Process counters, exposed at `GET /admin/stats`.
#[derive(Default)]
pub struct Metrics {
    counters: Mutex<Counters>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<F: FnOnce(&mut Counters)>(&self, f: F) {
        let mut c = self.counters.lock().expect("metrics mutex poisoned");
        f(&mut c);
    }

    pub fn record_intake(&self, outcome: IntakeOutcome) {
        self.with(|c| *c.intake_total.entry(outcome).or_insert(0) += 1);
    }

    pub fn record_seal(&self, trigger: SealTrigger, records: usize, duplicates: usize) {
        self.with(|c| {
            *c.seals_total.entry(trigger).or_insert(0) += 1;
            c.sealed_records_total += records as u64;
            c.duplicates_filtered_total += duplicates as u64;
        });
    }

    pub fn record_commit(&self) {
        self.with(|c| c.commits_total += 1);
    }

    pub fn record_failure(&self, kind: FailureKind) {
        self.with(|c| *c.commit_failures_total.entry(kind).or_insert(0) += 1);
    }

    /// Archive write gave up inside the pipeline and was left to the repair sweep.
    pub fn record_archive_deferred(&self) {
        self.with(|c| c.archive_deferred_total += 1);
    }

    /// One reconciliation attempt. DATA_UNAVAILABLE batches are attempted
    /// again on every pass; per-batch outcomes live in the report.
    pub fn record_reconciliation_attempt(&self, status: ReconciliationStatus) {
        self.with(|c| *c.reconciliation_attempts_total.entry(status).or_insert(0) += 1);
    }

    pub fn snapshot_as_json(&self, db_path: &str) -> Value {
        let c = self.counters.lock().expect("metrics mutex poisoned");

        let intake: Vec<Value> = c
            .intake_total
            .iter()
            .map(|(outcome, count)| json!({ "outcome": outcome.as_str(), "count": count }))
            .collect();
        let seals: Vec<Value> = c
            .seals_total
            .iter()
            .map(|(trigger, count)| json!({ "trigger": trigger.as_str(), "count": count }))
            .collect();
        let failures: Vec<Value> = c
            .commit_failures_total
            .iter()
            .map(|(kind, count)| json!({ "kind": kind.as_str(), "count": count }))
            .collect();
        let checks: Vec<Value> = c
            .reconciliation_attempts_total
            .iter()
            .map(|(status, count)| json!({ "status": status.as_str(), "count": count }))
            .collect();

        let db_bytes = std::fs::metadata(db_path)
            .ok()
            .and_then(|m| if m.is_file() { Some(m.len()) } else { None });
        let db_mb = db_bytes.map(|b| round2(bytes_to_mb(b)));
        let fs_free_mb = filesystem_free_mb_from_db_path(db_path);

        json!({
            "intake_total": intake,
            "seals_total": seals,
            "sealed_records_total": c.sealed_records_total,
            "duplicates_filtered_total": c.duplicates_filtered_total,
            "commits_total": c.commits_total,
            "commit_failures_total": failures,
            "archive_deferred_total": c.archive_deferred_total,
            "reconciliation_attempts_total": checks,
            "storage": {
                "db_path": db_path,
                "db_size_mb": db_mb,
                "free_storage_mb": fs_free_mb,
            }
        })
    }
}

fn bytes_to_mb(bytes: u64) -> f64 {
    let mb = 1024.0 * 1024.0;
    (bytes as f64) / mb
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn filesystem_free_mb_from_db_path(db_path: &str) -> Option<f64> {
    use sysinfo::Disks;
    let disks = Disks::new_with_refreshed_list();
    let path = std::path::Path::new(db_path);
    let mount = path.canonicalize().ok().and_then(|p| {
        disks
            .iter()
            .filter(|d| p.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
    });

    mount.map(|d| round2(bytes_to_mb(d.available_space())))
}
