//! Database migration constants and metadata

/// Current database schema version
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Migration descriptions
pub const MIGRATION_DESCRIPTIONS: &[&str] = &["Intake queue, batch lifecycle and archive tables"];

/// Default database path when DB_PATH is unset
pub const DEFAULT_DB_PATH: &str = "openvote.db";

/// In-memory database marker accepted by DB_PATH
pub const MEMORY_DB_PATH: &str = ":memory:";
