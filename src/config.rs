//! User configuration at `~/.agentbook/config.json`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::corporate::KeywordClassifier;
use crate::db::{CrmDb, DbOptions, RetryPolicy};
use crate::error::ImportError;
use crate::import::ApplyOptions;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// Overrides `~/.agentbook/agentbook.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_lock_retries")]
    pub lock_retries: u32,
    #[serde(default = "default_lock_backoff_ms")]
    pub lock_backoff_ms: u64,
    /// Recorded as decided_by / approved_by on the decision trail.
    #[serde(default = "default_actor")]
    pub actor: String,
    #[serde(default = "default_true")]
    pub apply_updates: bool,
    #[serde(default)]
    pub verify_same: bool,
    #[serde(default)]
    pub extra_corporate_markers: Vec<String>,
}

fn default_busy_timeout_ms() -> u64 {
    30_000
}

fn default_lock_retries() -> u32 {
    3
}

fn default_lock_backoff_ms() -> u64 {
    200
}

fn default_actor() -> String {
    "operator".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            busy_timeout_ms: default_busy_timeout_ms(),
            lock_retries: default_lock_retries(),
            lock_backoff_ms: default_lock_backoff_ms(),
            actor: default_actor(),
            apply_updates: true,
            verify_same: false,
            extra_corporate_markers: Vec::new(),
        }
    }
}

/// Get the canonical config file path (~/.agentbook/config.json)
pub fn config_path() -> Result<PathBuf, ImportError> {
    let home = dirs::home_dir()
        .ok_or_else(|| ImportError::Config("Could not find home directory".into()))?;
    Ok(home.join(".agentbook").join("config.json"))
}

impl AppConfig {
    /// Load from the canonical path. A missing file means defaults.
    pub fn load() -> Result<Self, ImportError> {
        Self::load_from(&config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self, ImportError> {
        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .map_err(|e| ImportError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        serde_json::from_str(&content)
            .map_err(|e| ImportError::Config(format!("Invalid {}: {}", path.display(), e)))
    }

    pub fn db_options(&self) -> DbOptions {
        DbOptions {
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
            retry: RetryPolicy {
                attempts: self.lock_retries.max(1),
                backoff: Duration::from_millis(self.lock_backoff_ms),
            },
        }
    }

    pub fn db_path(&self) -> Result<PathBuf, ImportError> {
        match self.db_path.as_deref().map(str::trim) {
            Some(p) if !p.is_empty() => Ok(PathBuf::from(p)),
            _ => Ok(CrmDb::default_path()?),
        }
    }

    pub fn open_db(&self) -> Result<CrmDb, ImportError> {
        Ok(CrmDb::open_with(self.db_path()?, self.db_options())?)
    }

    pub fn classifier(&self) -> KeywordClassifier {
        KeywordClassifier::with_extra_markers(self.extra_corporate_markers.iter().cloned())
    }

    pub fn apply_options(&self) -> ApplyOptions {
        ApplyOptions {
            apply_updates: self.apply_updates,
            verify_same: self.verify_same,
            force_holds: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corporate::CorporateClassifier;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.db_options(), DbOptions::default());
        assert_eq!(config.apply_options(), ApplyOptions::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{ "actor": "kim", "lockRetries": 5, "extraCorporateMarkers": ["상회"] }"#,
        )
        .unwrap();
        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.actor, "kim");
        assert_eq!(config.db_options().retry.attempts, 5);
        assert_eq!(config.busy_timeout_ms, 30_000);
        assert!(config.apply_updates);
        assert!(config.classifier().is_corporate("대명상회"));
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        let err = AppConfig::load_from(&path).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_db_path_override() {
        let config = AppConfig {
            db_path: Some("/tmp/book.db".into()),
            ..Default::default()
        };
        assert_eq!(config.db_path().unwrap(), PathBuf::from("/tmp/book.db"));
    }
}
