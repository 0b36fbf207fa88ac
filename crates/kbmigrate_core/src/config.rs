use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::store::DEFAULT_PAGE_SIZE;

pub const DEFAULT_USER_AGENT: &str = "kbmigrate/0.1";
pub const DEFAULT_OUTPUT_DIR: &str = "exports";
pub const DEFAULT_DOWNLOAD_DIR: &str = "downloads";
pub const DEFAULT_WORKERS: usize = 5;
pub const DEFAULT_RATE_LIMIT_MS: u64 = 100;
pub const DEFAULT_MAX_PER_ARCHIVE: usize = 300;
pub const DEFAULT_ROOT_FOLDER: &str = "knowledge_base";
pub const DEFAULT_ARCHIVE_PREFIX: &str = "kb_export";
pub const DEFAULT_PRIMARY_LOCALE: &str = "ja";
pub const DEFAULT_SECONDARY_LOCALE: &str = "en";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_RETRIES: usize = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 500;
pub const DEFAULT_DOCUMENT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_DOCUMENT_POLL_MS: u64 = 500;
pub const DEFAULT_DOCUMENT_RETRY_BACKOFF_MS: u64 = 2_000;
pub const DEFAULT_DOCUMENT_EXTENSION: &str = "docx";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MigrateConfig {
    #[serde(default)]
    pub source: SourceSection,
    #[serde(default)]
    pub export: ExportSection,
    #[serde(default)]
    pub documents: DocumentsSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SourceSection {
    pub instance: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<usize>,
    pub retry_delay_ms: Option<u64>,
    pub page_size: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ExportSection {
    pub output_dir: Option<String>,
    pub download_dir: Option<String>,
    pub workers: Option<usize>,
    pub rate_limit_ms: Option<u64>,
    pub max_per_archive: Option<usize>,
    pub root_folder: Option<String>,
    pub archive_prefix: Option<String>,
    pub process_embeds: Option<bool>,
    pub keep_directory: Option<bool>,
    pub primary_locale: Option<String>,
    pub secondary_locale: Option<String>,
}

/// External document export command. Empty `command` disables document downloads.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct DocumentsSection {
    #[serde(default)]
    pub command: Vec<String>,
    pub download_dir: Option<String>,
    pub timeout_secs: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub retry_backoff_ms: Option<u64>,
    pub extension: Option<String>,
}

impl MigrateConfig {
    /// Resolve the instance host: env SERVICENOW_INSTANCE > config > None.
    pub fn instance(&self) -> Option<String> {
        env_override("SERVICENOW_INSTANCE").or_else(|| non_empty(&self.source.instance))
    }

    pub fn username(&self) -> Option<String> {
        env_override("SERVICENOW_USERNAME").or_else(|| non_empty(&self.source.username))
    }

    pub fn password(&self) -> Option<String> {
        env_override("SERVICENOW_PASSWORD").or_else(|| non_empty(&self.source.password))
    }

    /// Credentials are the only configuration problem fatal to a run.
    pub fn validate_source(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.instance().is_none() {
            missing.push("SERVICENOW_INSTANCE");
        }
        if self.username().is_none() {
            missing.push("SERVICENOW_USERNAME");
        }
        if self.password().is_none() {
            missing.push("SERVICENOW_PASSWORD");
        }
        if !missing.is_empty() {
            bail!(
                "missing source configuration: {} (set [source] in config or the environment)",
                missing.join(", ")
            );
        }
        Ok(())
    }

    pub fn timeout_ms(&self) -> u64 {
        self.source.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS)
    }

    pub fn max_retries(&self) -> usize {
        self.source.max_retries.unwrap_or(DEFAULT_MAX_RETRIES)
    }

    pub fn retry_delay_ms(&self) -> u64 {
        self.source.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS)
    }

    pub fn page_size(&self) -> usize {
        self.source.page_size.unwrap_or(DEFAULT_PAGE_SIZE).max(1)
    }

    /// Resolve worker count: env KBMIGRATE_WORKERS > config > DEFAULT_WORKERS.
    pub fn workers(&self) -> usize {
        let configured = self.export.workers.unwrap_or(DEFAULT_WORKERS);
        env_value_usize("KBMIGRATE_WORKERS", configured).max(1)
    }

    pub fn rate_limit_ms(&self) -> u64 {
        let configured = self.export.rate_limit_ms.unwrap_or(DEFAULT_RATE_LIMIT_MS);
        env_value_u64("KBMIGRATE_RATE_LIMIT_MS", configured)
    }

    pub fn max_per_archive(&self) -> usize {
        self.export
            .max_per_archive
            .unwrap_or(DEFAULT_MAX_PER_ARCHIVE)
            .max(1)
    }

    pub fn root_folder(&self) -> String {
        non_empty(&self.export.root_folder).unwrap_or_else(|| DEFAULT_ROOT_FOLDER.to_string())
    }

    pub fn archive_prefix(&self) -> String {
        non_empty(&self.export.archive_prefix)
            .unwrap_or_else(|| DEFAULT_ARCHIVE_PREFIX.to_string())
    }

    pub fn process_embeds(&self) -> bool {
        self.export.process_embeds.unwrap_or(true)
    }

    pub fn keep_directory(&self) -> bool {
        self.export.keep_directory.unwrap_or(false)
    }

    pub fn primary_locale(&self) -> String {
        non_empty(&self.export.primary_locale)
            .unwrap_or_else(|| DEFAULT_PRIMARY_LOCALE.to_string())
    }

    pub fn secondary_locale(&self) -> String {
        non_empty(&self.export.secondary_locale)
            .unwrap_or_else(|| DEFAULT_SECONDARY_LOCALE.to_string())
    }

    pub fn document_timeout_secs(&self) -> u64 {
        self.documents
            .timeout_secs
            .unwrap_or(DEFAULT_DOCUMENT_TIMEOUT_SECS)
    }

    pub fn document_poll_interval_ms(&self) -> u64 {
        self.documents
            .poll_interval_ms
            .unwrap_or(DEFAULT_DOCUMENT_POLL_MS)
            .max(1)
    }

    pub fn document_retry_backoff_ms(&self) -> u64 {
        self.documents
            .retry_backoff_ms
            .unwrap_or(DEFAULT_DOCUMENT_RETRY_BACKOFF_MS)
    }

    pub fn document_extension(&self) -> String {
        non_empty(&self.documents.extension)
            .map(|value| value.trim_start_matches('.').to_string())
            .unwrap_or_else(|| DEFAULT_DOCUMENT_EXTENSION.to_string())
    }

    pub fn has_document_command(&self) -> bool {
        self.documents
            .command
            .first()
            .is_some_and(|program| !program.trim().is_empty())
    }
}

/// Load and parse a MigrateConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<MigrateConfig> {
    if !config_path.exists() {
        return Ok(MigrateConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: MigrateConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

pub(crate) fn env_override(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_value_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_value_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}
