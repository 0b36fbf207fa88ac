use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::config::{DEFAULT_DOWNLOAD_DIR, DEFAULT_OUTPUT_DIR, MigrateConfig};

pub const STATE_DIR_NAME: &str = ".kbmigrate";
pub const CONFIG_FILENAME: &str = "config.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Config,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Config => "config",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub config: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        Ok(Self { cwd })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub config_path: PathBuf,
    pub output_dir: PathBuf,
    pub download_dir: PathBuf,
    /// Where the document export command saves files; defaults to `download_dir/documents`.
    pub document_dir: PathBuf,
    pub config_source: ValueSource,
    pub output_source: ValueSource,
    pub download_source: ValueSource,
    pub document_source: ValueSource,
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub config_exists: bool,
    pub output_dir_exists: bool,
    pub download_dir_exists: bool,
    /// Files already present under the download directory, reused on re-runs.
    pub cached_files: usize,
    pub cached_bytes: u64,
    pub warnings: Vec<String>,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={}\nconfig_path={} ({})\noutput_dir={} ({})\ndownload_dir={} ({})\ndocument_dir={} ({})",
            normalize_for_display(&self.project_root),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
            normalize_for_display(&self.output_dir),
            self.output_source.as_str(),
            normalize_for_display(&self.download_dir),
            self.download_source.as_str(),
            normalize_for_display(&self.document_dir),
            self.document_source.as_str(),
        )
    }

    /// Create output and download directories.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.output_dir, &self.download_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Config file location: `--config` > `KBMIGRATE_CONFIG` > `.kbmigrate/config.toml`.
pub fn resolve_config_path(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> (PathBuf, ValueSource) {
    resolve_config_path_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_config_path_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> (PathBuf, ValueSource)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.config.as_deref() {
        (absolutize(path, &context.cwd), ValueSource::Flag)
    } else if let Some(value) = non_blank(lookup_env("KBMIGRATE_CONFIG")) {
        (absolutize(Path::new(&value), &context.cwd), ValueSource::Env)
    } else {
        (
            context.cwd.join(STATE_DIR_NAME).join(CONFIG_FILENAME),
            ValueSource::Default,
        )
    }
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    config: &MigrateConfig,
) -> ResolvedPaths {
    resolve_paths_with_lookup(context, overrides, config, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    config: &MigrateConfig,
    lookup_env: F,
) -> ResolvedPaths
where
    F: Fn(&str) -> Option<String>,
{
    let root = &context.cwd;
    let (config_path, config_source) =
        resolve_config_path_with_lookup(context, overrides, &lookup_env);

    let (output_dir, output_source) = layered(
        root,
        overrides.output_dir.as_deref(),
        lookup_env("KBMIGRATE_OUTPUT_DIR"),
        config.export.output_dir.as_deref(),
        DEFAULT_OUTPUT_DIR,
    );
    let (download_dir, download_source) = layered(
        root,
        None,
        lookup_env("KBMIGRATE_DOWNLOAD_DIR"),
        config.export.download_dir.as_deref(),
        DEFAULT_DOWNLOAD_DIR,
    );
    let (document_dir, document_source) = match config
        .documents
        .download_dir
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        Some(value) => (absolutize(Path::new(value), root), ValueSource::Config),
        None => (download_dir.join("documents"), download_source),
    };

    ResolvedPaths {
        project_root: root.clone(),
        config_path,
        output_dir,
        download_dir,
        document_dir,
        config_source,
        output_source,
        download_source,
        document_source,
    }
}

fn layered(
    root: &Path,
    flag: Option<&Path>,
    env_value: Option<String>,
    config_value: Option<&str>,
    default: &str,
) -> (PathBuf, ValueSource) {
    if let Some(path) = flag {
        return (absolutize(path, root), ValueSource::Flag);
    }
    if let Some(value) = non_blank(env_value) {
        return (absolutize(Path::new(&value), root), ValueSource::Env);
    }
    if let Some(value) = config_value.map(str::trim).filter(|value| !value.is_empty()) {
        return (absolutize(Path::new(value), root), ValueSource::Config);
    }
    (root.join(default), ValueSource::Default)
}

pub fn inspect_runtime(paths: &ResolvedPaths, config: &MigrateConfig) -> RuntimeStatus {
    let config_exists = paths.config_path.exists();
    let output_dir_exists = paths.output_dir.exists();
    let download_dir_exists = paths.download_dir.exists();
    let (cached_files, cached_bytes) = if download_dir_exists {
        directory_usage(&paths.download_dir)
    } else {
        (0, 0)
    };

    let mut warnings = Vec::new();
    if !config_exists {
        warnings.push(format!(
            "{} not found; using defaults and environment",
            normalize_for_display(&paths.config_path)
        ));
    }
    if let Err(error) = config.validate_source() {
        warnings.push(error.to_string());
    }
    if config.process_embeds() && !config.has_document_command() {
        warnings.push(
            "[documents] command is not set; Google Docs embeds will be reported as failures"
                .to_string(),
        );
    }

    RuntimeStatus {
        config_exists,
        output_dir_exists,
        download_dir_exists,
        cached_files,
        cached_bytes,
        warnings,
    }
}

fn directory_usage(root: &Path) -> (usize, u64) {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .fold((0, 0), |(files, bytes), metadata| (files + 1, bytes + metadata.len()))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
