use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::bundle::BundleReport;
use crate::fetch::ArticleFetchResult;
use crate::iframe::BlobResult;
use crate::record::ArticleRecord;
use crate::translation::LocalePriority;

const FAMILY_JOIN: &str = " / ";

pub fn content_sha256(html: &str) -> String {
    format!("{:x}", Sha256::digest(html.as_bytes()))
}

/// One row per physically exported file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReportRow {
    pub article_number: String,
    pub article_title: String,
    pub sys_id: String,
    pub workflow_state: String,
    pub language: String,
    pub has_translations: bool,
    pub translation_count: usize,
    pub category_path: String,
    pub attachments_count: usize,
    pub has_iframes: bool,
    pub google_docs_downloaded: usize,
    pub google_slides_converted: usize,
    pub requires_special_handling: bool,
    pub special_handling_flag: String,
    pub exported_file: String,
    pub content_sha256: String,
    pub created_on: String,
    pub updated_on: String,
    pub author: String,
}

pub fn build_rows(
    results: &[ArticleFetchResult],
    bundle: &BundleReport,
    locales: &LocalePriority,
) -> Vec<ReportRow> {
    let mut rows = Vec::new();
    for result in results {
        if result.requires_special_handling() {
            rows.extend(special_rows(result, bundle, locales));
        } else {
            rows.push(merged_row(result, bundle, locales));
        }
    }
    rows
}

fn merged_row(
    result: &ArticleFetchResult,
    bundle: &BundleReport,
    locales: &LocalePriority,
) -> ReportRow {
    let mut family = result.family().collect::<Vec<_>>();
    locales.sort_by_locale(&mut family, |member| member.language.as_str());
    let join = |field: fn(&ArticleRecord) -> &str| {
        family
            .iter()
            .map(|member| field(member))
            .collect::<Vec<_>>()
            .join(FAMILY_JOIN)
    };

    let iframe = result.iframe_result.as_ref();
    let mut row = base_row(result, &result.article);
    row.article_number = join(|member| &member.number);
    row.article_title = join(ArticleRecord::display_title);
    row.language = family
        .iter()
        .map(|member| locales.normalize(&member.language))
        .collect::<Vec<_>>()
        .join(FAMILY_JOIN);
    row.attachments_count = result.attachments.len();
    row.has_iframes = iframe.is_some_and(|iframe| iframe.blobs().any(|blob| blob.embeds_found > 0));
    row.google_docs_downloaded = iframe.map_or(0, |iframe| iframe.total_downloads());
    row.google_slides_converted = iframe.map_or(0, |iframe| {
        iframe.blobs().map(|blob| blob.slides_converted.len()).sum()
    });
    fill_export(&mut row, bundle, &result.article.sys_id);
    row
}

fn special_rows(
    result: &ArticleFetchResult,
    bundle: &BundleReport,
    locales: &LocalePriority,
) -> Vec<ReportRow> {
    let Some(iframe) = result.iframe_result.as_ref() else {
        return Vec::new();
    };
    let flag = result.special_handling_flag().unwrap_or_default();
    result
        .family()
        .zip(iframe.blobs())
        .enumerate()
        .map(|(index, (member, blob))| {
            let mut row = base_row(result, member);
            row.language = locales.normalize(&member.language).to_string();
            row.attachments_count = if index == 0 { result.attachments.len() } else { 0 };
            apply_blob(&mut row, blob);
            row.requires_special_handling = true;
            row.special_handling_flag = flag.clone();
            fill_export(&mut row, bundle, &member.sys_id);
            row
        })
        .collect()
}

fn base_row(result: &ArticleFetchResult, member: &ArticleRecord) -> ReportRow {
    ReportRow {
        article_number: member.number.clone(),
        article_title: member.display_title().to_string(),
        sys_id: member.sys_id.clone(),
        workflow_state: member.workflow_state.clone(),
        language: member.language.clone(),
        has_translations: !result.translations.is_empty(),
        translation_count: result.translations.len(),
        category_path: result.category_path_string(),
        created_on: member.created_on.clone(),
        updated_on: member.updated_on.clone(),
        author: member.author.clone(),
        ..ReportRow::default()
    }
}

fn apply_blob(row: &mut ReportRow, blob: &BlobResult) {
    row.has_iframes = blob.embeds_found > 0;
    row.google_docs_downloaded = blob.downloaded.len();
    row.google_slides_converted = blob.slides_converted.len();
}

fn fill_export(row: &mut ReportRow, bundle: &BundleReport, sys_id: &str) {
    if let Some(document) = bundle.document(sys_id) {
        row.exported_file = document.file_name.clone();
        row.content_sha256 = document.content_sha256.clone();
    }
}

pub fn write_report(path: &Path, rows: &[ReportRow]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    for row in rows {
        writer
            .serialize(row)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
