use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::iframe::DownloadedDocument;
use crate::record::{ARTICLE_TABLE, ATTACHMENT_TABLE, Record};
use crate::store::{RecordQuery, RecordStore, query_all};

pub const ATTACHMENT_FIELDS: &[&str] = &[
    "sys_id",
    "file_name",
    "content_type",
    "size_bytes",
    "sys_created_on",
    "table_sys_id",
];

pub const ORPHANED_DIR: &str = "orphaned_attachments";
pub const DOCX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

static ATTACHMENT_ID_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)sys_attachment\.do\?sys_id=([a-f0-9]{32})",
        r"(?i)/attachment/([a-f0-9]{32})/",
        r"(?i)attachment\.do\?sys_id=([a-f0-9]{32})",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("valid regex"))
    .collect()
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttachmentSource {
    Article { article_sys_id: String },
    Orphaned,
    EmbeddedDocument { locale: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentRef {
    pub sys_id: String,
    pub file_name: String,
    pub local_path: PathBuf,
    pub size_bytes: u64,
    pub content_type: String,
    pub source: AttachmentSource,
}

impl AttachmentRef {
    pub fn is_embedded_document(&self) -> bool {
        matches!(self.source, AttachmentSource::EmbeddedDocument { .. })
    }
}

/// Attachment row as listed by the store, before download.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AttachmentMeta {
    sys_id: String,
    file_name: String,
    content_type: String,
    size_bytes: u64,
}

impl AttachmentMeta {
    fn from_record(record: &Record) -> Self {
        let sys_id = record.value("sys_id").trim().to_string();
        let file_name = record.value("file_name").trim().to_string();
        Self {
            file_name: if file_name.is_empty() {
                format!("{sys_id}.bin")
            } else {
                file_name
            },
            sys_id,
            content_type: record.value("content_type").trim().to_string(),
            size_bytes: record.value("size_bytes").trim().parse().unwrap_or(0),
        }
    }
}

/// Lists and downloads attachments into `{download_dir}/{article_sys_id}/`.
pub struct AttachmentDownloader<'a, S: RecordStore + ?Sized> {
    store: &'a S,
    download_dir: PathBuf,
    page_size: usize,
}

impl<'a, S: RecordStore + ?Sized> AttachmentDownloader<'a, S> {
    pub fn new(store: &'a S, download_dir: &Path, page_size: usize) -> Self {
        Self {
            store,
            download_dir: download_dir.to_path_buf(),
            page_size,
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    fn list(&self, article_sys_id: &str) -> Result<Vec<AttachmentMeta>> {
        let query = RecordQuery::new(
            ATTACHMENT_TABLE,
            format!("table_name={ARTICLE_TABLE}^table_sys_id={article_sys_id}"),
        )
        .fields(ATTACHMENT_FIELDS);
        let records = query_all(self.store, &query, self.page_size)
            .with_context(|| format!("failed to list attachments of {article_sys_id}"))?;
        let mut metas = records
            .iter()
            .map(AttachmentMeta::from_record)
            .filter(|meta| !meta.sys_id.is_empty())
            .collect::<Vec<_>>();
        metas.sort_by(|left, right| {
            left.file_name
                .cmp(&right.file_name)
                .then_with(|| left.sys_id.cmp(&right.sys_id))
        });
        Ok(metas)
    }

    /// Download every attachment of one article. A failing file is logged
    /// and skipped.
    pub fn download_for_article(&self, article_sys_id: &str) -> Result<Vec<AttachmentRef>> {
        let metas = self.list(article_sys_id)?;
        debug!(article_sys_id, count = metas.len(), "found attachments");
        let target_dir = self.download_dir.join(article_sys_id);
        let mut attachments = Vec::with_capacity(metas.len());
        for meta in metas {
            let source = AttachmentSource::Article {
                article_sys_id: article_sys_id.to_string(),
            };
            match self.download_one(&meta, &target_dir, source) {
                Ok(attachment) => attachments.push(attachment),
                Err(error) => {
                    error!(
                        article_sys_id,
                        file = %meta.file_name,
                        error = %format!("{error:#}"),
                        "failed to download attachment"
                    );
                }
            }
        }
        Ok(attachments)
    }

    /// Attachments of every family member, original first.
    pub fn download_for_family(&self, sys_ids: &[String]) -> Vec<AttachmentRef> {
        let mut attachments = Vec::new();
        for sys_id in sys_ids {
            match self.download_for_article(sys_id) {
                Ok(found) => attachments.extend(found),
                Err(error) => {
                    error!(sys_id = %sys_id, error = %format!("{error:#}"), "failed to fetch attachments");
                }
            }
        }
        attachments
    }

    /// Download attachments referenced from the bodies but not attached to
    /// any family member.
    pub fn fetch_orphans(&self, bodies: &[&str], existing: &[AttachmentRef]) -> Vec<AttachmentRef> {
        let known = existing
            .iter()
            .map(|attachment| attachment.sys_id.to_ascii_lowercase())
            .collect::<HashSet<_>>();
        let orphaned = bodies
            .iter()
            .flat_map(|body| referenced_attachment_ids(body))
            .filter(|sys_id| !known.contains(sys_id))
            .collect::<BTreeSet<_>>();
        if orphaned.is_empty() {
            return Vec::new();
        }
        info!(count = orphaned.len(), "found attachment references not linked to the article");

        let target_dir = self.download_dir.join(ORPHANED_DIR);
        let mut attachments = Vec::new();
        for sys_id in orphaned {
            let result = self
                .store
                .query_records(
                    &RecordQuery::new(ATTACHMENT_TABLE, format!("sys_id={sys_id}"))
                        .fields(ATTACHMENT_FIELDS)
                        .limit(1),
                )
                .and_then(|records| match records.first() {
                    Some(record) => self
                        .download_one(
                            &AttachmentMeta::from_record(record),
                            &target_dir,
                            AttachmentSource::Orphaned,
                        )
                        .map(Some),
                    None => Ok(None),
                });
            match result {
                Ok(Some(attachment)) => {
                    info!(sys_id = %sys_id, file = %attachment.file_name, "downloaded orphaned attachment");
                    attachments.push(attachment);
                }
                Ok(None) => warn!(sys_id = %sys_id, "orphaned attachment not found"),
                Err(error) => {
                    error!(sys_id = %sys_id, error = %format!("{error:#}"), "failed to fetch orphaned attachment");
                }
            }
        }
        attachments
    }

    fn download_one(
        &self,
        meta: &AttachmentMeta,
        target_dir: &Path,
        source: AttachmentSource,
    ) -> Result<AttachmentRef> {
        // One directory per attachment id keeps same-named files apart, so an
        // existing file of the recorded size is this attachment's own bytes.
        let attachment_dir = target_dir.join(disk_file_name(&meta.sys_id));
        let local_path = attachment_dir.join(disk_file_name(&meta.file_name));
        let reusable = meta.size_bytes > 0
            && fs::metadata(&local_path).is_ok_and(|existing| existing.len() == meta.size_bytes);

        let size_bytes = if reusable {
            debug!(file = %local_path.display(), "reusing downloaded attachment");
            meta.size_bytes
        } else {
            let bytes = self.store.get_attachment_bytes(&meta.sys_id)?;
            fs::create_dir_all(&attachment_dir)
                .with_context(|| format!("failed to create {}", attachment_dir.display()))?;
            fs::write(&local_path, &bytes)
                .with_context(|| format!("failed to write {}", local_path.display()))?;
            bytes.len() as u64
        };

        Ok(AttachmentRef {
            sys_id: meta.sys_id.clone(),
            file_name: meta.file_name.clone(),
            local_path,
            size_bytes,
            content_type: meta.content_type.clone(),
            source,
        })
    }
}

/// Lowercased 32-hex attachment ids referenced from a body.
pub fn referenced_attachment_ids(html: &str) -> BTreeSet<String> {
    ATTACHMENT_ID_RES
        .iter()
        .flat_map(|pattern| {
            pattern
                .captures_iter(html)
                .filter_map(|captures| captures.get(1))
                .map(|id| id.as_str().to_ascii_lowercase())
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Attachment entry for a downloaded embedded document.
pub fn document_attachment(document: &DownloadedDocument) -> AttachmentRef {
    let file_name = document
        .file_path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| format!("{}.docx", document.document_id));
    AttachmentRef {
        sys_id: document.document_id.clone(),
        file_name,
        local_path: document.file_path.clone(),
        size_bytes: fs::metadata(&document.file_path).map_or(0, |metadata| metadata.len()),
        content_type: DOCX_CONTENT_TYPE.to_string(),
        source: AttachmentSource::EmbeddedDocument {
            locale: document.locale.clone(),
        },
    }
}

fn disk_file_name(file_name: &str) -> String {
    let cleaned = file_name
        .chars()
        .map(|ch| if matches!(ch, '/' | '\\' | '\0') { '_' } else { ch })
        .collect::<String>();
    let trimmed = cleaned.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        "attachment.bin".to_string()
    } else {
        trimmed.to_string()
    }
}
