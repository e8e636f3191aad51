//! Constants used throughout the waitlist core crate.
//!
//! This module contains file names, defaults and field limits so that the store,
//! the CLI and the REST server agree on them.

/// Default directory for waitlist data when no explicit directory is configured.
pub const DEFAULT_DATA_DIR: &str = "waitlist_data";

/// Filename of the serialised store state inside the data directory.
pub const STORE_FILENAME: &str = "waitlist.yaml";

/// Filename of the append-only audit log inside the data directory.
pub const AUDIT_LOG_FILENAME: &str = "audit.jsonl";

/// Lock file that marks a data directory as owned by one running process.
pub const LOCK_FILENAME: &str = ".waitlist.lock";

/// Default REST listen address.
pub const DEFAULT_REST_ADDR: &str = "0.0.0.0:3000";

/// Hash the first audit record chains from.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Maximum length of the free-text notes field.
pub const MAX_NOTES_LEN: usize = 255;

/// Maximum length of a court case number.
pub const MAX_JUDICIAL_CASE_NUMBER_LEN: usize = 50;

/// Number of rows kept in each "top procedures" indicator.
pub const INDICATOR_TOP_N: usize = 10;

/// Days subtracted from the first of the current month to start the intake period.
pub const INDICATOR_INTAKE_LOOKBACK_DAYS: i64 = 60;
