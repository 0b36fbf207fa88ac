use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, bail};

use crate::doc_export::{DocumentExporter, ExportedDocument};
use crate::record::{Lookup, Record, STATE_PUBLISHED};
use crate::store::{RecordQuery, RecordStore};

/// In-memory record store keyed by `(table, filter)` for queries and
/// `(table, sys_id)` for single records.
#[derive(Default)]
pub struct MockStore {
    records: BTreeMap<(String, String), Record>,
    queries: BTreeMap<(String, String), Vec<Record>>,
    attachments: BTreeMap<String, Vec<u8>>,
    failing: Vec<String>,
    failing_records: Vec<String>,
    requests: AtomicUsize,
    downloads: AtomicUsize,
}

impl MockStore {
    pub fn add_record(&mut self, table: &str, record: Record) {
        self.records
            .insert((table.to_string(), record.sys_id().to_string()), record);
    }

    pub fn add_query(&mut self, table: &str, filter: &str, records: Vec<Record>) {
        self.queries
            .insert((table.to_string(), filter.to_string()), records);
    }

    pub fn add_attachment(&mut self, sys_id: &str, bytes: Vec<u8>) {
        self.attachments.insert(sys_id.to_string(), bytes);
    }

    pub fn fail_queries_containing(&mut self, needle: &str) {
        self.failing.push(needle.to_string());
    }

    /// Make single-record lookups fail when the sys_id contains `needle`.
    pub fn fail_records_containing(&mut self, needle: &str) {
        self.failing_records.push(needle.to_string());
    }

    pub fn record(&self, table: &str, sys_id: &str) -> Option<Record> {
        self.records
            .get(&(table.to_string(), sys_id.to_string()))
            .cloned()
    }

    pub fn attachment_downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

impl RecordStore for MockStore {
    fn query_records(&self, query: &RecordQuery) -> Result<Vec<Record>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self
            .failing
            .iter()
            .any(|needle| query.filter.contains(needle.as_str()))
        {
            bail!("mock query failure: {}", query.filter);
        }

        let rows = match self
            .queries
            .get(&(query.table.clone(), query.filter.clone()))
        {
            Some(rows) => rows.clone(),
            None if query.filter.is_empty() => self
                .records
                .iter()
                .filter(|((table, _), _)| *table == query.table)
                .map(|(_, record)| record.clone())
                .collect(),
            None => Vec::new(),
        };
        let page = rows.into_iter().skip(query.offset);
        Ok(match query.limit {
            Some(limit) => page.take(limit).collect(),
            None => page.collect(),
        })
    }

    fn get_record(&self, table: &str, sys_id: &str, _fields: &[&str]) -> Result<Lookup<Record>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self
            .failing_records
            .iter()
            .any(|needle| sys_id.contains(needle.as_str()))
        {
            bail!("mock lookup failure: {table}/{sys_id}");
        }
        Ok(match self.record(table, sys_id) {
            Some(record) => Lookup::Found(record),
            None => Lookup::NotFound,
        })
    }

    fn get_attachment_bytes(&self, sys_id: &str) -> Result<Vec<u8>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let Some(bytes) = self.attachments.get(sys_id) else {
            bail!("attachment {sys_id} not found");
        };
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(bytes.clone())
    }

    fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

pub fn article(sys_id: &str, number: &str, language: &str) -> Record {
    Record::default()
        .with_text("sys_id", sys_id)
        .with_text("number", number)
        .with_text("language", language)
        .with_text("short_description", &format!("Article {number}"))
        .with_text("text", &format!("<p>{number}</p>"))
        .with_text("workflow_state", STATE_PUBLISHED)
        .with_text("sys_created_on", "2024-01-01 09:00:00")
        .with_text("sys_updated_on", "2024-02-01 09:00:00")
        .with_reference("author", "u1", "Test Author")
}

pub fn category(sys_id: &str, label: &str, parent: Option<&str>) -> Record {
    let record = Record::default()
        .with_text("sys_id", sys_id)
        .with_text("label", label)
        .with_text("active", "true");
    match parent {
        Some(parent) => record.with_reference("parent_id", parent, ""),
        None => record.with_text("parent_id", ""),
    }
}

pub fn attachment_record(sys_id: &str, file_name: &str, size_bytes: u64) -> Record {
    Record::default()
        .with_text("sys_id", sys_id)
        .with_text("file_name", file_name)
        .with_text("size_bytes", &size_bytes.to_string())
        .with_text("content_type", "application/octet-stream")
}

/// Records every export request; writes a small file when given a directory.
#[derive(Default)]
pub struct CountingExporter {
    dir: Option<PathBuf>,
    calls: Mutex<Vec<String>>,
}

impl CountingExporter {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            dir: Some(dir.to_path_buf()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }
}

impl DocumentExporter for CountingExporter {
    fn export_document(&self, document_id: &str) -> Result<ExportedDocument> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(document_id.to_string());
        let file_path = match &self.dir {
            Some(dir) => {
                let path = dir.join(format!("{document_id}.docx"));
                fs::write(&path, b"docx").expect("write exported document");
                path
            }
            None => PathBuf::from(format!("{document_id}.docx")),
        };
        Ok(ExportedDocument {
            document_id: document_id.to_string(),
            file_path,
            title: format!("Document {document_id}"),
        })
    }
}

pub struct FailingExporter;

impl DocumentExporter for FailingExporter {
    fn export_document(&self, document_id: &str) -> Result<ExportedDocument> {
        bail!("export of {document_id} timed out")
    }
}
