//! SQL statement constants for database operations

pub const CREATE_MIGRATIONS_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL,
    description TEXT NOT NULL
)
"#;

pub const CREATE_INTAKE_QUEUE_TABLE_SQL: &str = r#"
CREATE TABLE intake_queue (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    payload BLOB NOT NULL,
    dedup_key TEXT NOT NULL,
    origin TEXT NOT NULL,
    arrival_time INTEGER NOT NULL,
    batch_local_id INTEGER, -- NULL while pending
    duplicate INTEGER NOT NULL DEFAULT 0
)
"#;

pub const CREATE_BATCHES_TABLE_SQL: &str = r#"
CREATE TABLE batches (
    local_id INTEGER PRIMARY KEY,
    state TEXT NOT NULL,
    hash_version TEXT NOT NULL,
    root TEXT NOT NULL,
    seal_trigger TEXT NOT NULL,
    sealed_at TEXT NOT NULL,
    records TEXT NOT NULL, -- JSON array
    ledger_batch_id INTEGER UNIQUE,
    committed_at TEXT,
    failure_kind TEXT,
    failure_reason TEXT,
    failed_at TEXT,
    updated_at TEXT NOT NULL
)
"#;

pub const CREATE_ARCHIVE_TABLE_SQL: &str = r#"
CREATE TABLE archive (
    ledger_batch_id INTEGER PRIMARY KEY,
    hash_version TEXT NOT NULL,
    root TEXT NOT NULL,
    records TEXT NOT NULL, -- JSON array
    stored_at TEXT NOT NULL
)
"#;

pub const CREATE_DB_INDEXES: &[&str] = &[
    "CREATE INDEX idx_intake_pending ON intake_queue(batch_local_id, seq)",
    "CREATE INDEX idx_intake_dedup_key ON intake_queue(dedup_key)",
    "CREATE INDEX idx_batches_state ON batches(state, local_id)",
];

pub const INSERT_INTAKE_SQL: &str =
    "INSERT INTO intake_queue (payload, dedup_key, origin, arrival_time) VALUES (?, ?, ?, ?)";

/// Check and append in one statement. A write statement takes the database
/// write lock before it reads, so two intakes of the same dedup key cannot
/// both see it as new. No row comes back when the key was already accepted.
pub const INSERT_INTAKE_IF_NEW_SQL: &str = r#"
INSERT INTO intake_queue (payload, dedup_key, origin, arrival_time)
SELECT ?, ?, ?, ?
WHERE NOT EXISTS (
    SELECT 1 FROM intake_queue WHERE dedup_key = ? AND duplicate = 0
)
RETURNING seq
"#;

/// Claims the oldest pending rows in one statement so concurrent drains
/// can never pick the same row twice.
pub const CLAIM_PENDING_SQL: &str = r#"
UPDATE intake_queue SET batch_local_id = ?
WHERE seq IN (
    SELECT seq FROM intake_queue
    WHERE batch_local_id IS NULL
    ORDER BY seq
    LIMIT ?
)
RETURNING seq, payload, dedup_key, origin, arrival_time
"#;

pub const MARK_DUPLICATE_SQL: &str = "UPDATE intake_queue SET duplicate = 1 WHERE seq = ?";

pub const COUNT_PENDING_SQL: &str =
    "SELECT COUNT(*) FROM intake_queue WHERE batch_local_id IS NULL";

pub const OLDEST_PENDING_SQL: &str = r#"
SELECT seq, payload, dedup_key, origin, arrival_time FROM intake_queue
WHERE batch_local_id IS NULL
ORDER BY seq
LIMIT 1
"#;

pub const MAX_CLAIMED_LOCAL_ID_SQL: &str = r#"
SELECT MAX(id) FROM (
    SELECT MAX(local_id) AS id FROM batches
    UNION ALL
    SELECT MAX(batch_local_id) AS id FROM intake_queue
)
"#;

pub const INSERT_BATCH_SQL: &str = r#"
INSERT INTO batches
    (local_id, state, hash_version, root, seal_trigger, sealed_at, records,
     ledger_batch_id, committed_at, failure_kind, failure_reason, failed_at, updated_at)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

/// Only the lifecycle columns change after sealing; records and root never do.
pub const UPDATE_BATCH_LIFECYCLE_SQL: &str = r#"
UPDATE batches SET
    state = ?, ledger_batch_id = ?, committed_at = ?,
    failure_kind = ?, failure_reason = ?, failed_at = ?, updated_at = ?
WHERE local_id = ?
"#;

pub const SELECT_BATCH_COLUMNS: &str = "SELECT local_id, state, hash_version, root, seal_trigger, \
     sealed_at, records, ledger_batch_id, committed_at, failure_kind, failure_reason, failed_at \
     FROM batches";

pub const COUNT_BATCHES_BY_STATE_SQL: &str =
    "SELECT state, COUNT(*) AS n FROM batches GROUP BY state";

pub const INSERT_ARCHIVE_SQL: &str = r#"
INSERT OR IGNORE INTO archive (ledger_batch_id, hash_version, root, records, stored_at)
VALUES (?, ?, ?, ?, ?)
"#;

pub const SELECT_ARCHIVE_SQL: &str =
    "SELECT ledger_batch_id, hash_version, root, records FROM archive WHERE ledger_batch_id = ?";
