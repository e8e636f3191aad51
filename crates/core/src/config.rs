//! Core runtime configuration.
//!
//! Configuration is resolved once at process startup and then passed into the store and
//! services. Nothing in this crate reads process environment variables; the binaries read
//! them and hand the raw values to the `*_from_env_value` helpers below.

use crate::constants::{
    AUDIT_LOG_FILENAME, DEFAULT_DATA_DIR, DEFAULT_REST_ADDR, LOCK_FILENAME, STORE_FILENAME,
};
use crate::{WaitlistError, WaitlistResult};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    data_dir: PathBuf,
    catalog_file: Option<PathBuf>,
    rest_addr: SocketAddr,
}

impl CoreConfig {
    /// Create a new `CoreConfig`.
    ///
    /// A configured catalog file must exist; the data directory is created later by
    /// [`CoreConfig::ensure_data_dir`].
    pub fn new(
        data_dir: PathBuf,
        catalog_file: Option<PathBuf>,
        rest_addr: SocketAddr,
    ) -> WaitlistResult<Self> {
        if data_dir.as_os_str().is_empty() {
            return Err(WaitlistError::Validation("data_dir cannot be empty".into()));
        }
        if let Some(catalog) = &catalog_file {
            if !catalog.is_file() {
                return Err(WaitlistError::Validation(format!(
                    "catalog file {} does not exist",
                    catalog.display()
                )));
            }
        }

        Ok(Self {
            data_dir,
            catalog_file,
            rest_addr,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(STORE_FILENAME)
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.data_dir.join(AUDIT_LOG_FILENAME)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join(LOCK_FILENAME)
    }

    pub fn catalog_file(&self) -> Option<&Path> {
        self.catalog_file.as_deref()
    }

    pub fn rest_addr(&self) -> SocketAddr {
        self.rest_addr
    }

    /// Creates the data directory if it does not exist yet.
    pub fn ensure_data_dir(&self) -> WaitlistResult<()> {
        std::fs::create_dir_all(&self.data_dir).map_err(WaitlistError::DataDirCreation)
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Resolve the data directory from an optional string value.
///
/// If `value` is `None` or empty/whitespace, returns [`DEFAULT_DATA_DIR`].
pub fn data_dir_from_env_value(value: Option<String>) -> PathBuf {
    PathBuf::from(non_blank(value).unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()))
}

/// Resolve the optional catalog file path.
pub fn catalog_file_from_env_value(value: Option<String>) -> Option<PathBuf> {
    non_blank(value).map(PathBuf::from)
}

/// Parse the REST listen address, falling back to [`DEFAULT_REST_ADDR`].
pub fn rest_addr_from_env_value(value: Option<String>) -> WaitlistResult<SocketAddr> {
    let raw = non_blank(value).unwrap_or_else(|| DEFAULT_REST_ADDR.to_string());
    raw.parse()
        .map_err(|_| WaitlistError::Validation(format!("invalid listen address '{raw}'")))
}
