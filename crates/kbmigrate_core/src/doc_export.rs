use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};

use crate::config::MigrateConfig;
use crate::iframe::google_doc_edit_url;

/// Suffixes browsers use while a download is still being written.
const PARTIAL_SUFFIXES: &[&str] = &[".crdownload", ".tmp", ".part"];

/// Downloads run one at a time across the whole process: completion is
/// detected by watching a shared directory for a new file.
static EXPORT_LOCK: Mutex<()> = Mutex::new(());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedDocument {
    pub document_id: String,
    pub file_path: PathBuf,
    pub title: String,
}

/// Exports one externally hosted document to a local file. On `Ok` the file
/// is fully written at `file_path`.
pub trait DocumentExporter: Send + Sync {
    fn export_document(&self, document_id: &str) -> Result<ExportedDocument>;
}

/// Global mutual exclusion plus one retry with backoff around any exporter.
pub struct SerializedExporter<E> {
    inner: E,
    retry_backoff: Duration,
}

impl<E: DocumentExporter> SerializedExporter<E> {
    pub fn new(inner: E, retry_backoff: Duration) -> Self {
        Self {
            inner,
            retry_backoff,
        }
    }
}

impl<E: DocumentExporter> DocumentExporter for SerializedExporter<E> {
    fn export_document(&self, document_id: &str) -> Result<ExportedDocument> {
        let _guard = match EXPORT_LOCK.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match self.inner.export_document(document_id) {
            Ok(document) => Ok(document),
            Err(error) => {
                warn!(document_id, error = %format!("{error:#}"), "document export failed, retrying once");
                sleep(self.retry_backoff);
                self.inner
                    .export_document(document_id)
                    .with_context(|| format!("document {document_id} failed after retry"))
            }
        }
    }
}

/// Waits for a single new, completely written file in a download directory.
#[derive(Debug, Clone)]
pub struct DownloadWatcher {
    dir: PathBuf,
    extension: String,
    timeout: Duration,
    poll_interval: Duration,
}

impl DownloadWatcher {
    pub fn new(dir: PathBuf, extension: &str, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            dir,
            extension: extension.trim_start_matches('.').to_ascii_lowercase(),
            timeout,
            poll_interval,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot(&self) -> Result<HashSet<PathBuf>> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read {}", self.dir.display()))?;
        let mut files = HashSet::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to read {}", self.dir.display()))?;
            files.insert(entry.path());
        }
        Ok(files)
    }

    /// Poll until a file absent from `before` has the expected extension and
    /// the same size on two consecutive polls.
    pub fn wait_for_new_file(&self, before: &HashSet<PathBuf>) -> Result<PathBuf> {
        let started = Instant::now();
        let mut last_sizes: HashMap<PathBuf, u64> = HashMap::new();

        loop {
            let mut candidates = self
                .snapshot()?
                .into_iter()
                .filter(|path| !before.contains(path) && self.is_complete_candidate(path))
                .collect::<Vec<_>>();
            candidates.sort();

            let mut sizes = HashMap::new();
            for path in candidates {
                let Ok(metadata) = fs::metadata(&path) else {
                    continue;
                };
                let size = metadata.len();
                if size > 0 && last_sizes.get(&path) == Some(&size) {
                    info!(file = %path.display(), "download complete");
                    return Ok(path);
                }
                sizes.insert(path, size);
            }
            last_sizes = sizes;

            if started.elapsed() >= self.timeout {
                bail!(
                    "download timeout after {}s in {}",
                    self.timeout.as_secs(),
                    self.dir.display()
                );
            }
            debug!(dir = %self.dir.display(), "waiting for download");
            sleep(self.poll_interval);
        }
    }

    fn is_complete_candidate(&self, path: &Path) -> bool {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if PARTIAL_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
            return false;
        }
        path.extension()
            .is_some_and(|extension| extension.to_string_lossy().eq_ignore_ascii_case(&self.extension))
    }
}

/// Runs an external command that drives the browser download, then waits
/// for the file it produced. `{id}`, `{url}` and `{dir}` in the arguments are
/// substituted per document.
pub struct CommandExporter {
    program: String,
    args: Vec<String>,
    watcher: DownloadWatcher,
}

impl CommandExporter {
    pub fn new(command: &[String], watcher: DownloadWatcher) -> Result<Self> {
        let Some((program, args)) = command.split_first() else {
            bail!("document export command is empty");
        };
        if program.trim().is_empty() {
            bail!("document export command is empty");
        }
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            watcher,
        })
    }

    /// Build from `[documents]`. `None` when no command is configured.
    pub fn from_config(config: &MigrateConfig, default_dir: &Path) -> Result<Option<Self>> {
        if !config.has_document_command() {
            return Ok(None);
        }
        let dir = config
            .documents
            .download_dir
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| default_dir.to_path_buf());
        let watcher = DownloadWatcher::new(
            dir,
            &config.document_extension(),
            Duration::from_secs(config.document_timeout_secs()),
            Duration::from_millis(config.document_poll_interval_ms()),
        );
        Self::new(&config.documents.command, watcher).map(Some)
    }

    fn render_args(&self, document_id: &str) -> Vec<String> {
        let url = google_doc_edit_url(document_id);
        let dir = self.watcher.dir().display().to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{id}", document_id)
                    .replace("{url}", &url)
                    .replace("{dir}", &dir)
            })
            .collect()
    }
}

impl DocumentExporter for CommandExporter {
    fn export_document(&self, document_id: &str) -> Result<ExportedDocument> {
        let before = self.watcher.snapshot()?;
        let output = Command::new(&self.program)
            .args(self.render_args(document_id))
            .output()
            .with_context(|| format!("failed to execute {}", self.program))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            );
        }

        let file_path = self.watcher.wait_for_new_file(&before)?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let title = stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(ToString::to_string)
            .or_else(|| {
                file_path
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().to_string())
            })
            .unwrap_or_else(|| "Untitled".to_string());

        Ok(ExportedDocument {
            document_id: document_id.to_string(),
            file_path,
            title,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use tempfile::tempdir;

    struct FlakyExporter {
        calls: AtomicUsize,
        failures: usize,
    }

    impl DocumentExporter for FlakyExporter {
        fn export_document(&self, document_id: &str) -> Result<ExportedDocument> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                bail!("timeout");
            }
            Ok(ExportedDocument {
                document_id: document_id.to_string(),
                file_path: PathBuf::from(format!("{document_id}.docx")),
                title: "Doc".to_string(),
            })
        }
    }

    #[test]
    fn serialized_exporter_retries_once() {
        let exporter = SerializedExporter::new(
            FlakyExporter {
                calls: AtomicUsize::new(0),
                failures: 1,
            },
            Duration::from_millis(1),
        );
        let document = exporter.export_document("d1").expect("second attempt");
        assert_eq!(document.file_path, PathBuf::from("d1.docx"));
        assert_eq!(exporter.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn serialized_exporter_gives_up_after_retry() {
        let exporter = SerializedExporter::new(
            FlakyExporter {
                calls: AtomicUsize::new(0),
                failures: 5,
            },
            Duration::from_millis(1),
        );
        let error = exporter.export_document("d1").expect_err("must fail");
        assert!(format!("{error:#}").contains("failed after retry"));
        assert_eq!(exporter.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn watcher_ignores_partial_and_existing_files() {
        let temp = tempdir().expect("tempdir");
        fs::write(temp.path().join("old.docx"), b"old").expect("write");
        let watcher = DownloadWatcher::new(
            temp.path().to_path_buf(),
            ".docx",
            Duration::from_secs(2),
            Duration::from_millis(10),
        );
        let before = watcher.snapshot().expect("snapshot");
        fs::write(temp.path().join("new.docx.crdownload"), b"partial").expect("write");
        fs::write(temp.path().join("notes.txt"), b"other").expect("write");
        fs::write(temp.path().join("new.docx"), b"complete").expect("write");

        let found = watcher.wait_for_new_file(&before).expect("new file");
        assert_eq!(found, temp.path().join("new.docx"));
    }

    #[test]
    fn watcher_times_out_without_new_file() {
        let temp = tempdir().expect("tempdir");
        let watcher = DownloadWatcher::new(
            temp.path().to_path_buf(),
            "docx",
            Duration::from_millis(30),
            Duration::from_millis(10),
        );
        let before = watcher.snapshot().expect("snapshot");
        let error = watcher.wait_for_new_file(&before).expect_err("timeout");
        assert!(error.to_string().contains("download timeout"));
    }

    #[test]
    fn command_placeholders_are_substituted() {
        let temp = tempdir().expect("tempdir");
        let watcher = DownloadWatcher::new(
            temp.path().to_path_buf(),
            "docx",
            Duration::from_secs(1),
            Duration::from_millis(10),
        );
        let exporter = CommandExporter::new(
            &[
                "export-doc".to_string(),
                "{url}".to_string(),
                "--id={id}".to_string(),
                "{dir}".to_string(),
            ],
            watcher,
        )
        .expect("exporter");
        let args = exporter.render_args("abc");
        assert_eq!(args[0], "https://docs.google.com/document/d/abc/edit");
        assert_eq!(args[1], "--id=abc");
        assert_eq!(args[2], temp.path().display().to_string());
    }

    #[test]
    fn empty_command_is_rejected() {
        let watcher = DownloadWatcher::new(
            PathBuf::from("unused"),
            "docx",
            Duration::from_secs(1),
            Duration::from_millis(10),
        );
        assert!(CommandExporter::new(&[], watcher).is_err());
    }
}
