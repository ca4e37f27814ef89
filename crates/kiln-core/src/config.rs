//! Runtime configuration for the Kiln pipeline.
//!
//! Values come from `KILN_*` environment variables, falling back to
//! defaults. Binaries load a `.env` file before calling [`KilnConfig::from_env`].

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KilnError, Result};

/// Default wall-clock limit for a single execution.
pub const DEFAULT_EXECUTION_TIMEOUT_MS: u64 = 30_000;
/// Default wall-clock limit for a single build validation.
pub const DEFAULT_BUILD_TIMEOUT_MS: u64 = 60_000;
/// Default upload size cap (100 MiB).
pub const DEFAULT_UPLOAD_MAX_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KilnConfig {
    /// Root of the filesystem blob store and local database.
    pub storage_path: PathBuf,
    /// Parent directory for per-build and per-execution scratch directories.
    pub scratch_path: PathBuf,
    pub execution_timeout_ms: u64,
    pub build_timeout_ms: u64,
    pub upload_max_bytes: u64,
}

impl Default for KilnConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./storage"),
            scratch_path: std::env::temp_dir(),
            execution_timeout_ms: DEFAULT_EXECUTION_TIMEOUT_MS,
            build_timeout_ms: DEFAULT_BUILD_TIMEOUT_MS,
            upload_max_bytes: DEFAULT_UPLOAD_MAX_BYTES,
        }
    }
}

impl KilnConfig {
    /// Resolve from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve from an arbitrary key lookup (used by tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            storage_path: lookup("KILN_STORAGE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_path),
            scratch_path: lookup("KILN_SCRATCH_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.scratch_path),
            execution_timeout_ms: parse_optional(
                &lookup,
                "KILN_EXECUTION_TIMEOUT_MS",
                defaults.execution_timeout_ms,
            )?,
            build_timeout_ms: parse_optional(
                &lookup,
                "KILN_BUILD_TIMEOUT_MS",
                defaults.build_timeout_ms,
            )?,
            upload_max_bytes: parse_optional(
                &lookup,
                "KILN_UPLOAD_MAX_BYTES",
                defaults.upload_max_bytes,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.execution_timeout_ms == 0 {
            return Err(KilnError::Configuration(
                "KILN_EXECUTION_TIMEOUT_MS must be greater than zero".into(),
            ));
        }
        if self.build_timeout_ms == 0 {
            return Err(KilnError::Configuration(
                "KILN_BUILD_TIMEOUT_MS must be greater than zero".into(),
            ));
        }
        if self.upload_max_bytes == 0 {
            return Err(KilnError::Configuration(
                "KILN_UPLOAD_MAX_BYTES must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_millis(self.build_timeout_ms)
    }
}

fn parse_optional<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|e| {
            KilnError::Configuration(format!("invalid value for {key}: '{raw}' ({e})"))
        }),
        _ => Ok(default),
    }
}
