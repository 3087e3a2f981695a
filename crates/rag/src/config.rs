use std::env;
use std::fs;
use std::path::Path;

use kb_core::ParserConfig;
use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};
use crate::period::ResetInterval;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KbConfig {
    pub quota: QuotaConfig,
    pub ingest: IngestConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub enabled: bool,
    // Limit given to new records of ordinary users; 0 means unlimited.
    pub normal_user_limit: u64,
    pub reset_interval: ResetInterval,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            normal_user_limit: 1_000_000,
            reset_interval: ResetInterval::Monthly,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub embedding_batch_size: usize,
    pub index_bulk_size: usize,
    pub max_workers: usize,
    pub chunk_token_num: usize,
    pub delimiter: String,
    pub mind_map: bool,
    // Per-tenant document cap; 0 disables the check.
    pub max_files_per_user: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        let parser = ParserConfig::default();
        Self {
            embedding_batch_size: 16,
            index_bulk_size: 64,
            max_workers: 12,
            chunk_token_num: parser.chunk_token_num,
            delimiter: parser.delimiter,
            mind_map: true,
            max_files_per_user: 0,
        }
    }
}

impl IngestConfig {
    pub fn parser_config(&self) -> ParserConfig {
        ParserConfig {
            chunk_token_num: self.chunk_token_num,
            delimiter: self.delimiter.clone(),
        }
    }
}

impl KbConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| {
            RagError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| RagError::Config(e.to_string()))
    }

    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| env::var(key).ok())
    }

    pub fn with_env(self) -> Result<Self> {
        self.with_overrides(|key| env::var(key).ok())
    }

    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("KB_TOKEN_LIMIT_ENABLED") {
            self.quota.enabled = parse_bool("KB_TOKEN_LIMIT_ENABLED", &v)?;
        }
        if let Some(v) = lookup("KB_NORMAL_USER_TOKEN_LIMIT") {
            self.quota.normal_user_limit = parse_num("KB_NORMAL_USER_TOKEN_LIMIT", &v)?;
        }
        if let Some(v) = lookup("KB_TOKEN_LIMIT_RESET_INTERVAL") {
            self.quota.reset_interval = ResetInterval::parse(&v).ok_or_else(|| {
                RagError::Config(format!("KB_TOKEN_LIMIT_RESET_INTERVAL: unknown interval {v:?}"))
            })?;
        }
        if let Some(v) = lookup("KB_EMBEDDING_BATCH_SIZE") {
            self.ingest.embedding_batch_size = parse_num("KB_EMBEDDING_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("KB_INDEX_BULK_SIZE") {
            self.ingest.index_bulk_size = parse_num("KB_INDEX_BULK_SIZE", &v)?;
        }
        if let Some(v) = lookup("KB_MAX_WORKERS") {
            self.ingest.max_workers = parse_num("KB_MAX_WORKERS", &v)?;
        }
        if let Some(v) = lookup("KB_MAX_FILE_NUM_PER_USER") {
            self.ingest.max_files_per_user = parse_num("KB_MAX_FILE_NUM_PER_USER", &v)?;
        }
        if let Some(v) = lookup("KB_MIND_MAP") {
            self.ingest.mind_map = parse_bool("KB_MIND_MAP", &v)?;
        }
        Ok(self)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(RagError::Config(format!("{key}: expected a boolean, got {other:?}"))),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| RagError::Config(format!("{key}: expected a number, got {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = KbConfig::from_toml(
            r#"
            [quota]
            normal_user_limit = 500
            reset_interval = "weekly"

            [ingest]
            max_workers = 2
            "#,
        )
        .unwrap();
        assert!(config.quota.enabled);
        assert_eq!(config.quota.normal_user_limit, 500);
        assert_eq!(config.quota.reset_interval, ResetInterval::Weekly);
        assert_eq!(config.ingest.max_workers, 2);
        assert_eq!(config.ingest.embedding_batch_size, 16);
        assert_eq!(config.ingest.index_bulk_size, 64);
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("KB_TOKEN_LIMIT_ENABLED", "false"),
            ("KB_TOKEN_LIMIT_RESET_INTERVAL", "daily"),
            ("KB_MAX_FILE_NUM_PER_USER", "10"),
        ]
        .into_iter()
        .collect();
        let config = KbConfig::default()
            .with_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert!(!config.quota.enabled);
        assert_eq!(config.quota.reset_interval, ResetInterval::Daily);
        assert_eq!(config.ingest.max_files_per_user, 10);
    }

    #[test]
    fn bad_override_is_a_config_error() {
        let err = KbConfig::default()
            .with_overrides(|k| (k == "KB_MAX_WORKERS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, RagError::Config(_)));
    }
}
