use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::Write;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use reqwest::Url;
use serde::Serialize;
use tracing::{debug, info, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::attachments::AttachmentRef;
use crate::fetch::{ArticleFetchResult, ExportDocument};
use crate::markup::rewrite_attributes;
use crate::report::content_sha256;
use crate::translation::LocalePriority;

const MAX_FILENAME_CHARS: usize = 200;
const LINK_TAGS: &[&str] = &["img", "video", "source", "a"];
const LINK_ATTRIBUTES: &[&str] = &["src", "href"];

static HEX_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-fA-F0-9]{32}$").expect("valid regex"));

static PLACEHOLDER_BASE: LazyLock<Option<Url>> =
    LazyLock::new(|| Url::parse("https://placeholder.invalid/").ok());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleOptions {
    pub output_dir: PathBuf,
    pub root_folder: String,
    pub archive_prefix: String,
    pub max_per_archive: usize,
    pub keep_directory: bool,
    /// `%Y%m%d_%H%M%S`, shared by archive names and the articles folder.
    pub timestamp: String,
    pub locales: LocalePriority,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnresolvedLink {
    pub article_number: String,
    pub tag: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundledDocument {
    pub sys_id: String,
    pub file_name: String,
    pub archive: PathBuf,
    pub content_sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveSummary {
    pub path: PathBuf,
    pub articles: usize,
    pub documents: usize,
    pub attachments: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BundleReport {
    pub archives: Vec<ArchiveSummary>,
    pub documents: Vec<BundledDocument>,
    pub unresolved_links: Vec<UnresolvedLink>,
}

impl BundleReport {
    pub fn document(&self, sys_id: &str) -> Option<&BundledDocument> {
        self.documents.iter().find(|document| document.sys_id == sys_id)
    }
}

/// Destination for one archive's entries. Paths are `/`-separated and
/// relative to the archive root.
pub trait BundleSink {
    fn add_file(&mut self, path: &str, bytes: &[u8]) -> Result<()>;

    fn add_file_from_disk(&mut self, path: &str, source: &Path) -> Result<()> {
        let bytes =
            fs::read(source).with_context(|| format!("failed to read {}", source.display()))?;
        self.add_file(path, &bytes)
    }

    fn finish(self: Box<Self>) -> Result<PathBuf>;
}

pub struct ZipSink {
    path: PathBuf,
    writer: ZipWriter<File>,
}

impl ZipSink {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file =
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: ZipWriter::new(file),
        })
    }
}

impl BundleSink for ZipSink {
    fn add_file(&mut self, path: &str, bytes: &[u8]) -> Result<()> {
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
        self.writer
            .start_file(path, options)
            .with_context(|| format!("failed to start archive entry {path}"))?;
        self.writer
            .write_all(bytes)
            .with_context(|| format!("failed to write archive entry {path}"))?;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<PathBuf> {
        self.writer
            .finish()
            .with_context(|| format!("failed to finalize {}", self.path.display()))?;
        Ok(self.path)
    }
}

pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    pub fn create(root: &Path) -> Result<Self> {
        fs::create_dir_all(root).with_context(|| format!("failed to create {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }
}

impl BundleSink for DirectorySink {
    fn add_file(&mut self, path: &str, bytes: &[u8]) -> Result<()> {
        let target = self.root.join(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&target, bytes).with_context(|| format!("failed to write {}", target.display()))
    }

    fn add_file_from_disk(&mut self, path: &str, source: &Path) -> Result<()> {
        let target = self.root.join(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::copy(source, &target).with_context(|| {
            format!("failed to copy {} to {}", source.display(), target.display())
        })?;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<PathBuf> {
        Ok(self.root)
    }
}

/// Consecutive index ranges of at most `max_per_archive` articles.
pub fn plan_batches(total: usize, max_per_archive: usize) -> Vec<Range<usize>> {
    let size = max_per_archive.max(1);
    (0..total.div_ceil(size))
        .map(|index| index * size..((index + 1) * size).min(total))
        .collect()
}

pub fn archive_stem(prefix: &str, timestamp: &str, part: usize, parts: usize) -> String {
    if parts <= 1 {
        format!("{prefix}_{timestamp}")
    } else {
        format!("{prefix}_{timestamp}_part{part}of{parts}")
    }
}

/// Keep letters, digits, `_`, `-` and `.`; everything else becomes `_`.
pub fn sanitize_filename(value: &str) -> String {
    value
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_alphanumeric() || matches!(ch, '_' | '-' | '.') {
                ch
            } else {
                '_'
            }
        })
        .take(MAX_FILENAME_CHARS)
        .collect()
}

/// Numbers of the locale-sorted family joined with `_`.
pub fn combined_number(result: &ArticleFetchResult, locales: &LocalePriority) -> String {
    sorted_family(result, locales)
        .iter()
        .map(|member| sanitize_filename(&member.number))
        .collect::<Vec<_>>()
        .join("_")
}

/// `number-title.html`, or the combined family name for merged documents.
pub fn html_file_name(result: &ArticleFetchResult, locales: &LocalePriority) -> String {
    let family = sorted_family(result, locales);
    let numbers = family
        .iter()
        .map(|member| sanitize_filename(&member.number))
        .collect::<Vec<_>>()
        .join("_");
    let titles = family
        .iter()
        .map(|member| sanitize_filename(member.display_title()))
        .collect::<Vec<_>>()
        .join("_");
    format!("{}.html", sanitize_filename(&format!("{numbers}-{titles}")))
}

fn document_file_name(document: &ExportDocument) -> String {
    format!(
        "{}.html",
        sanitize_filename(&format!("{}-{}", document.number, document.title))
    )
}

fn sorted_family<'a>(
    result: &'a ArticleFetchResult,
    locales: &LocalePriority,
) -> Vec<&'a crate::record::ArticleRecord> {
    let mut family = result.family().collect::<Vec<_>>();
    locales.sort_by_locale(&mut family, |member| member.language.as_str());
    family
}

/// Archive-local names for a family's attachments. A name already taken by
/// another attachment gets the attachment id as prefix.
pub fn attachment_names(attachments: &[AttachmentRef]) -> BTreeMap<String, String> {
    let mut names = BTreeMap::new();
    let mut taken = HashSet::new();
    for attachment in attachments {
        if names.contains_key(&attachment.sys_id) {
            continue;
        }
        let mut name = sanitize_filename(&attachment.file_name);
        if name.is_empty() {
            name = format!("{}.bin", attachment.sys_id);
        }
        if !taken.insert(name.clone()) {
            name = sanitize_filename(&format!("{}_{name}", attachment.sys_id));
            taken.insert(name.clone());
        }
        names.insert(attachment.sys_id.clone(), name);
    }
    names
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkRewrite {
    pub html: String,
    pub rewritten: usize,
    pub unresolved: Vec<UnresolvedLink>,
}

/// Point attachment references at `{folder}/{local name}`.
pub fn rewrite_attachment_links(
    html: &str,
    attachments: &[AttachmentRef],
    names: &BTreeMap<String, String>,
    folder: &str,
    article_number: &str,
) -> LinkRewrite {
    let mut rewritten = 0;
    let mut unresolved = Vec::new();

    let html = rewrite_attributes(html, LINK_TAGS, LINK_ATTRIBUTES, |tag, attribute, url| {
        let expected = if tag == "a" { "href" } else { "src" };
        let url = url.trim();
        if attribute != expected || is_skipped_url(url) {
            return None;
        }
        match resolve_attachment(url, attachments) {
            Some(attachment) => match names.get(&attachment.sys_id) {
                Some(name) => {
                    rewritten += 1;
                    Some(format!("{folder}/{name}"))
                }
                None => {
                    warn!(article = %article_number, tag, url, attachment = %attachment.sys_id, "attachment not bundled, keeping original link");
                    unresolved.push(unresolved_link(article_number, tag, url));
                    None
                }
            },
            None => {
                if tag != "a" || looks_like_attachment(url) {
                    warn!(article = %article_number, tag, url, "could not resolve attachment link");
                    unresolved.push(unresolved_link(article_number, tag, url));
                }
                None
            }
        }
    });

    LinkRewrite {
        html,
        rewritten,
        unresolved,
    }
}

fn unresolved_link(article_number: &str, tag: &str, url: &str) -> UnresolvedLink {
    UnresolvedLink {
        article_number: article_number.to_string(),
        tag: tag.to_string(),
        url: url.to_string(),
    }
}

fn is_skipped_url(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    url.is_empty()
        || url.starts_with('#')
        || ["data:", "mailto:", "javascript:", "tel:"]
            .iter()
            .any(|scheme| lower.starts_with(scheme))
}

fn looks_like_attachment(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.contains("sys_attachment") || lower.contains("attachment.do") || lower.contains("/attachment/")
}

/// Id in the URL, then exact file name, then any known id inside the URL.
pub fn resolve_attachment<'a>(url: &str, attachments: &'a [AttachmentRef]) -> Option<&'a AttachmentRef> {
    let parsed = PLACEHOLDER_BASE
        .as_ref()
        .and_then(|base| base.join(url).ok());

    if let Some(parsed) = &parsed {
        let query_ids = parsed
            .query_pairs()
            .filter(|(key, _)| key == "sys_id")
            .map(|(_, value)| value.into_owned());
        let path_ids = parsed
            .path_segments()
            .into_iter()
            .flatten()
            .map(ToString::to_string);
        for candidate in query_ids.chain(path_ids) {
            if !HEX_ID_RE.is_match(&candidate) {
                continue;
            }
            if let Some(found) = attachments
                .iter()
                .find(|attachment| attachment.sys_id.eq_ignore_ascii_case(&candidate))
            {
                return Some(found);
            }
        }

        if let Some(segment) = parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|segment| !segment.is_empty())
        {
            let decoded = urlencoding::decode(segment)
                .map(|value| value.into_owned())
                .unwrap_or_else(|_| segment.to_string());
            if let Some(found) = attachments
                .iter()
                .find(|attachment| attachment.file_name == decoded)
            {
                return Some(found);
            }
        }
    }

    let lower = url.to_ascii_lowercase();
    attachments.iter().find(|attachment| {
        !attachment.sys_id.is_empty() && lower.contains(&attachment.sys_id.to_ascii_lowercase())
    })
}

/// Writes fetch results into one or more self-contained archives.
pub struct BundleExporter {
    options: BundleOptions,
}

impl BundleExporter {
    pub fn new(options: BundleOptions) -> Self {
        Self { options }
    }

    fn articles_folder(&self) -> String {
        format!(
            "{}/articles_exported_{}",
            self.options.root_folder, self.options.timestamp
        )
    }

    pub fn export(&self, results: &[ArticleFetchResult]) -> Result<BundleReport> {
        let batches = plan_batches(results.len(), self.options.max_per_archive);
        let parts = batches.len();
        let mut report = BundleReport::default();

        for (index, batch) in batches.into_iter().enumerate() {
            let stem = archive_stem(
                &self.options.archive_prefix,
                &self.options.timestamp,
                index + 1,
                parts,
            );
            let sink: Box<dyn BundleSink> = if self.options.keep_directory {
                Box::new(DirectorySink::create(&self.options.output_dir.join(&stem))?)
            } else {
                Box::new(ZipSink::create(
                    &self.options.output_dir.join(format!("{stem}.zip")),
                )?)
            };
            let summary = self.write_archive(sink, &results[batch], &mut report)?;
            info!(
                archive = %summary.path.display(),
                articles = summary.articles,
                documents = summary.documents,
                attachments = summary.attachments,
                "wrote bundle"
            );
            report.archives.push(summary);
        }
        Ok(report)
    }

    fn write_archive(
        &self,
        mut sink: Box<dyn BundleSink>,
        results: &[ArticleFetchResult],
        report: &mut BundleReport,
    ) -> Result<ArchiveSummary> {
        let locales = &self.options.locales;
        let articles_folder = self.articles_folder();
        let mut written = HashSet::new();
        let mut documents = Vec::new();
        let mut attachment_count = 0;

        for result in results {
            let folder = format!("attachments_{}/attachments", combined_number(result, locales));
            let names = attachment_names(&result.attachments);
            // Only attachments present in the archive get their links rewritten.
            let mut bundled = BTreeMap::new();

            for attachment in &result.attachments {
                let Some(name) = names.get(&attachment.sys_id) else {
                    continue;
                };
                let path = format!("{articles_folder}/{folder}/{name}");
                if written.contains(&path) {
                    bundled.insert(attachment.sys_id.clone(), name.clone());
                    continue;
                }
                match sink.add_file_from_disk(&path, &attachment.local_path) {
                    Ok(()) => {
                        written.insert(path);
                        attachment_count += 1;
                        bundled.insert(attachment.sys_id.clone(), name.clone());
                    }
                    Err(error) => {
                        warn!(file = %attachment.local_path.display(), error = %format!("{error:#}"), "skipping attachment");
                    }
                }
            }

            let special = result.requires_special_handling();
            for document in &result.documents {
                let base_name = if special {
                    document_file_name(document)
                } else {
                    html_file_name(result, locales)
                };
                let mut file_name = base_name.clone();
                if written.contains(&format!("{articles_folder}/{file_name}")) {
                    let stem = base_name.trim_end_matches(".html");
                    file_name = format!("{stem}-{}.html", sanitize_filename(&document.sys_id));
                }
                let path = format!("{articles_folder}/{file_name}");
                written.insert(path.clone());

                let rewrite = rewrite_attachment_links(
                    &document.html,
                    &result.attachments,
                    &bundled,
                    &folder,
                    &document.number,
                );
                debug!(file = %file_name, rewritten = rewrite.rewritten, unresolved = rewrite.unresolved.len(), "rewrote attachment links");
                sink.add_file(&path, rewrite.html.as_bytes())?;
                report.unresolved_links.extend(rewrite.unresolved);
                documents.push(BundledDocument {
                    sys_id: document.sys_id.clone(),
                    file_name,
                    archive: PathBuf::new(),
                    content_sha256: content_sha256(&rewrite.html),
                });
            }
        }

        let path = sink.finish()?;
        let document_count = documents.len();
        for mut document in documents {
            document.archive = path.clone();
            report.documents.push(document);
        }
        Ok(ArchiveSummary {
            path,
            articles: results.len(),
            documents: document_count,
            attachments: attachment_count,
        })
    }
}
