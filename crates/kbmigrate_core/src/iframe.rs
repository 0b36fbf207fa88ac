use std::collections::HashSet;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::doc_export::DocumentExporter;
use crate::markup::{escape_attribute, find_iframes, is_embed_only, splice};
use crate::record::ArticleRecord;

static GOOGLE_DOCS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https://docs\.google\.com/document/d/([a-zA-Z0-9_-]+)").expect("valid regex")
});

static GOOGLE_SLIDES_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https://docs\.google\.com/presentation/d/([a-zA-Z0-9_-]+)").expect("valid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbedKind {
    GoogleDocs,
    GoogleSlides,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedRef {
    pub kind: EmbedKind,
    pub src: Option<String>,
    pub document_id: Option<String>,
    pub span: Range<usize>,
}

pub fn classify(src: &str) -> (EmbedKind, Option<String>) {
    if let Some(captures) = GOOGLE_SLIDES_RE.captures(src) {
        return (
            EmbedKind::GoogleSlides,
            captures.get(1).map(|id| id.as_str().to_string()),
        );
    }
    if let Some(captures) = GOOGLE_DOCS_RE.captures(src) {
        return (
            EmbedKind::GoogleDocs,
            captures.get(1).map(|id| id.as_str().to_string()),
        );
    }
    (EmbedKind::Other, None)
}

pub fn detect_embeds(html: &str) -> Vec<EmbedRef> {
    find_iframes(html)
        .into_iter()
        .map(|iframe| {
            let (kind, document_id) = iframe
                .src
                .as_deref()
                .map_or((EmbedKind::Other, None), classify);
            EmbedRef {
                kind,
                src: iframe.src,
                document_id,
                span: iframe.span,
            }
        })
        .collect()
}

pub fn google_doc_edit_url(document_id: &str) -> String {
    format!("https://docs.google.com/document/d/{document_id}/edit")
}

/// Counts and URLs of the embeds in a body, without processing them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EmbedSummary {
    pub total_embeds: usize,
    pub google_docs_count: usize,
    pub google_slides_count: usize,
    pub other_count: usize,
    pub is_embed_only: bool,
    pub google_docs_urls: Vec<String>,
    pub google_slides_urls: Vec<String>,
    pub other_urls: Vec<String>,
}

pub fn summarize_embeds(html: &str) -> EmbedSummary {
    let mut summary = EmbedSummary {
        is_embed_only: is_embed_only(html),
        ..EmbedSummary::default()
    };
    for embed in detect_embeds(html) {
        summary.total_embeds += 1;
        let url = embed.src.unwrap_or_default();
        match embed.kind {
            EmbedKind::GoogleDocs => {
                summary.google_docs_count += 1;
                summary.google_docs_urls.push(url);
            }
            EmbedKind::GoogleSlides => {
                summary.google_slides_count += 1;
                summary.google_slides_urls.push(url);
            }
            EmbedKind::Other => {
                summary.other_count += 1;
                summary.other_urls.push(url);
            }
        }
    }
    summary
}

/// Identity of the body being processed, carried into downloads and failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobContext {
    pub sys_id: String,
    pub number: String,
    pub title: String,
    pub locale: String,
}

impl BlobContext {
    pub fn for_article(article: &ArticleRecord, locale: &str) -> Self {
        Self {
            sys_id: article.sys_id.clone(),
            number: article.number.clone(),
            title: article.display_title().to_string(),
            locale: locale.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadedDocument {
    pub document_id: String,
    pub edit_url: String,
    pub file_path: PathBuf,
    pub title: String,
    pub locale: String,
    pub article_sys_id: String,
    pub article_number: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbedFailure {
    pub document_id: Option<String>,
    pub url: String,
    pub article_sys_id: String,
    pub article_number: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum EmbedOutcome {
    Downloaded { document_id: String },
    DuplicateRemoved { document_id: String },
    LinkedSlides { url: String },
    LinkedOther { url: String },
    Failed { error: String },
}

/// Result of processing the embeds of one body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BlobResult {
    #[serde(skip)]
    pub html: String,
    pub locale: String,
    pub embeds_found: usize,
    pub is_embed_only: bool,
    pub outcomes: Vec<EmbedOutcome>,
    pub downloaded: Vec<DownloadedDocument>,
    pub slides_converted: Vec<String>,
    pub other_converted: Vec<String>,
    pub errors: Vec<String>,
    pub failures: Vec<EmbedFailure>,
}

impl BlobResult {
    fn untouched(html: &str, locale: &str) -> Self {
        Self {
            html: html.to_string(),
            locale: locale.to_string(),
            ..Self::default()
        }
    }
}

/// Applies the per-kind embed actions. Without an exporter, Docs embeds fail
/// and stay in place.
pub struct EmbedProcessor<'a> {
    exporter: Option<&'a dyn DocumentExporter>,
}

impl<'a> EmbedProcessor<'a> {
    pub fn new(exporter: Option<&'a dyn DocumentExporter>) -> Self {
        Self { exporter }
    }

    pub fn process_blob(&self, html: &str, context: &BlobContext) -> BlobResult {
        let embeds = detect_embeds(html);
        let mut result = BlobResult::untouched(html, &context.locale);
        if embeds.is_empty() {
            return result;
        }
        result.embeds_found = embeds.len();
        result.is_embed_only = is_embed_only(html);
        debug!(number = %context.number, embeds = embeds.len(), "processing embeds");

        let mut attempted = HashSet::new();
        let mut replacements = Vec::new();

        for embed in embeds {
            match embed.kind {
                EmbedKind::GoogleDocs => {
                    let document_id = embed.document_id.clone().unwrap_or_default();
                    if attempted.contains(&document_id) {
                        info!(document_id = %document_id, "removing duplicate document embed");
                        replacements.push((embed.span, String::new()));
                        result
                            .outcomes
                            .push(EmbedOutcome::DuplicateRemoved { document_id });
                        continue;
                    }
                    match self.download(&document_id, context) {
                        Ok(document) => {
                            attempted.insert(document_id.clone());
                            replacements.push((embed.span, String::new()));
                            result.outcomes.push(EmbedOutcome::Downloaded {
                                document_id: document_id.clone(),
                            });
                            result.downloaded.push(document);
                        }
                        Err(message) => {
                            let url = google_doc_edit_url(&document_id);
                            error!(
                                document_id = %document_id,
                                url = %url,
                                article = %context.number,
                                title = %context.title,
                                error = %message,
                                "failed to download embedded document"
                            );
                            result
                                .errors
                                .push(format!("Google Docs {document_id}: {message}"));
                            result.failures.push(EmbedFailure {
                                document_id: Some(document_id),
                                url,
                                article_sys_id: context.sys_id.clone(),
                                article_number: context.number.clone(),
                                error: message.clone(),
                            });
                            result.outcomes.push(EmbedOutcome::Failed { error: message });
                        }
                    }
                }
                EmbedKind::GoogleSlides => {
                    let url = embed.src.unwrap_or_default().replace("/embed", "/edit");
                    replacements.push((
                        embed.span,
                        format!(
                            "<p><a href=\"{}\" target=\"_blank\">View Google Slides Presentation</a></p>",
                            escape_attribute(&url)
                        ),
                    ));
                    result.slides_converted.push(url.clone());
                    result.outcomes.push(EmbedOutcome::LinkedSlides { url });
                }
                EmbedKind::Other => match embed.src {
                    Some(url) => {
                        replacements.push((
                            embed.span,
                            format!(
                                "<p><a href=\"{}\" target=\"_blank\">View embedded content</a></p>",
                                escape_attribute(&url)
                            ),
                        ));
                        result.other_converted.push(url.clone());
                        result.outcomes.push(EmbedOutcome::LinkedOther { url });
                    }
                    None => {
                        let message = "iframe has no src attribute".to_string();
                        warn!(article = %context.number, "{message}");
                        result.errors.push(format!("Other iframe: {message}"));
                        result.failures.push(EmbedFailure {
                            document_id: None,
                            url: String::new(),
                            article_sys_id: context.sys_id.clone(),
                            article_number: context.number.clone(),
                            error: message.clone(),
                        });
                        result.outcomes.push(EmbedOutcome::Failed { error: message });
                    }
                },
            }
        }

        result.html = splice(html, &replacements);
        result
    }

    fn download(&self, document_id: &str, context: &BlobContext) -> Result<DownloadedDocument, String> {
        let Some(exporter) = self.exporter else {
            return Err("document exporter not configured".to_string());
        };
        let exported = exporter
            .export_document(document_id)
            .map_err(|error| format!("{error:#}"))?;
        let edit_url = google_doc_edit_url(document_id);
        info!(
            document_id,
            title = %exported.title,
            file = %exported.file_path.display(),
            url = %edit_url,
            article = %context.number,
            "downloaded embedded document"
        );
        Ok(DownloadedDocument {
            document_id: document_id.to_string(),
            edit_url,
            file_path: exported.file_path,
            title: exported.title,
            locale: context.locale.clone(),
            article_sys_id: context.sys_id.clone(),
            article_number: context.number.clone(),
        })
    }
}

/// Embed processing for a whole translation family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IframeResult {
    pub original: BlobResult,
    /// One entry per translation, in family order.
    pub translations: Vec<BlobResult>,
    pub original_has_google_docs: bool,
}

impl IframeResult {
    pub fn has_embeds(&self) -> bool {
        self.original.embeds_found > 0
    }

    /// Docs embeds cannot be inlined into a merged document, so a translated
    /// article with one is exported member by member instead.
    pub fn requires_special_handling(&self) -> bool {
        self.original_has_google_docs && !self.translations.is_empty()
    }

    pub fn total_downloads(&self) -> usize {
        self.blobs().map(|blob| blob.downloaded.len()).sum()
    }

    pub fn blobs(&self) -> impl Iterator<Item = &BlobResult> {
        std::iter::once(&self.original).chain(&self.translations)
    }

    pub fn failures(&self) -> impl Iterator<Item = &EmbedFailure> {
        self.blobs().flat_map(|blob| blob.failures.iter())
    }

    pub fn flag_message(&self) -> Option<String> {
        if !self.requires_special_handling() {
            return None;
        }
        Some(format!(
            "Article contains Google Docs iframe with {} translation(s). Downloaded {} separate DOCX files instead of merging. Manual review recommended for proper organization at the destination.",
            self.translations.len(),
            self.total_downloads()
        ))
    }
}

/// Process the original and every translation body separately.
pub fn process_family(
    processor: &EmbedProcessor<'_>,
    original: &ArticleRecord,
    original_locale: &str,
    translations: &[(ArticleRecord, String)],
) -> IframeResult {
    let original_has_google_docs = detect_embeds(&original.text)
        .iter()
        .any(|embed| embed.kind == EmbedKind::GoogleDocs);

    let original_blob = processor.process_blob(
        &original.text,
        &BlobContext::for_article(original, original_locale),
    );
    let translation_blobs = translations
        .iter()
        .map(|(translation, locale)| {
            processor.process_blob(
                &translation.text,
                &BlobContext::for_article(translation, locale),
            )
        })
        .collect();

    let result = IframeResult {
        original: original_blob,
        translations: translation_blobs,
        original_has_google_docs,
    };
    if let Some(message) = result.flag_message() {
        warn!(number = %original.number, "{message}");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{CountingExporter, FailingExporter, article};

    const DOC: &str = r#"<iframe src="https://docs.google.com/document/d/DOC_1/preview"></iframe>"#;
    const SLIDES: &str =
        r#"<iframe src="https://docs.google.com/presentation/d/SL-2/embed?start=false"></iframe>"#;

    fn context() -> BlobContext {
        BlobContext {
            sys_id: "a1".to_string(),
            number: "KB1".to_string(),
            title: "Guide".to_string(),
            locale: "ja".to_string(),
        }
    }

    fn with_text(sys_id: &str, language: &str, text: &str) -> ArticleRecord {
        ArticleRecord::from_record(&article(sys_id, "KB1", language).with_text("text", text))
    }

    #[test]
    fn classifies_by_url_pattern() {
        assert_eq!(
            classify("https://docs.google.com/document/d/abc-_1/edit"),
            (EmbedKind::GoogleDocs, Some("abc-_1".to_string()))
        );
        assert_eq!(
            classify("https://docs.google.com/presentation/d/p1/embed").0,
            EmbedKind::GoogleSlides
        );
        assert_eq!(classify("https://www.youtube.com/embed/x"), (EmbedKind::Other, None));
    }

    #[test]
    fn docs_are_downloaded_and_removed_slides_become_links() {
        let exporter = CountingExporter::default();
        let processor = EmbedProcessor::new(Some(&exporter));
        let html = format!("<p>Intro</p>{DOC}{SLIDES}");
        let result = processor.process_blob(&html, &context());

        assert_eq!(result.embeds_found, 2);
        assert_eq!(result.downloaded.len(), 1);
        assert_eq!(result.downloaded[0].locale, "ja");
        assert_eq!(
            result.html,
            "<p>Intro</p><p><a href=\"https://docs.google.com/presentation/d/SL-2/edit?start=false\" target=\"_blank\">View Google Slides Presentation</a></p>"
        );
        assert_eq!(exporter.calls(), vec!["DOC_1".to_string()]);
    }

    #[test]
    fn duplicate_documents_download_once() {
        let exporter = CountingExporter::default();
        let processor = EmbedProcessor::new(Some(&exporter));
        let html = format!("{DOC}<p>between</p>{DOC}");
        let result = processor.process_blob(&html, &context());
        assert_eq!(exporter.calls().len(), 1);
        assert_eq!(result.html, "<p>between</p>");
        assert!(matches!(
            result.outcomes[1],
            EmbedOutcome::DuplicateRemoved { .. }
        ));
    }

    #[test]
    fn failed_download_is_recorded_and_processing_continues() {
        let exporter = FailingExporter;
        let processor = EmbedProcessor::new(Some(&exporter));
        let html = format!("{DOC}<iframe src=\"https://example.com/map\"></iframe>");
        let result = processor.process_blob(&html, &context());

        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].document_id.as_deref(), Some("DOC_1"));
        assert_eq!(result.failures[0].article_number, "KB1");
        assert!(result.html.starts_with(DOC));
        assert!(result.html.contains("View embedded content"));
    }

    #[test]
    fn failed_document_is_not_removed_as_duplicate() {
        let exporter = FailingExporter;
        let processor = EmbedProcessor::new(Some(&exporter));
        let html = format!("{DOC}<p>between</p>{DOC}");
        let result = processor.process_blob(&html, &context());

        assert_eq!(result.html, html);
        assert_eq!(result.failures.len(), 2);
        assert!(
            !result
                .outcomes
                .iter()
                .any(|outcome| matches!(outcome, EmbedOutcome::DuplicateRemoved { .. }))
        );
    }

    #[test]
    fn missing_exporter_is_a_recorded_failure() {
        let processor = EmbedProcessor::new(None);
        let result = processor.process_blob(DOC, &context());
        assert_eq!(result.failures[0].error, "document exporter not configured");
        assert_eq!(result.html, DOC);
    }

    #[test]
    fn special_handling_needs_docs_and_translations() {
        let exporter = CountingExporter::default();
        let processor = EmbedProcessor::new(Some(&exporter));
        let original = with_text("a1", "ja", DOC);
        let translation = with_text("t1", "en", "<p>English</p>");

        let with_translation =
            process_family(&processor, &original, "ja", &[(translation, "en".to_string())]);
        assert!(with_translation.requires_special_handling());
        assert!(
            with_translation
                .flag_message()
                .expect("flag")
                .contains("1 translation(s)")
        );

        let alone = process_family(&processor, &original, "ja", &[]);
        assert!(!alone.requires_special_handling());
        assert!(alone.flag_message().is_none());
    }

    #[test]
    fn slides_only_original_never_needs_special_handling() {
        let processor = EmbedProcessor::new(None);
        let original = with_text("a1", "ja", SLIDES);
        let translation = with_text("t1", "en", DOC);
        let result = process_family(&processor, &original, "ja", &[(translation, "en".to_string())]);
        assert!(!result.requires_special_handling());
        assert_eq!(result.translations[0].failures.len(), 1);
    }

    #[test]
    fn summary_counts_each_kind() {
        let html = format!("{DOC}{SLIDES}<iframe src=\"https://example.com\"></iframe>");
        let summary = summarize_embeds(&html);
        assert_eq!(summary.total_embeds, 3);
        assert_eq!(summary.google_docs_count, 1);
        assert_eq!(summary.google_slides_count, 1);
        assert_eq!(summary.other_count, 1);
        assert!(summary.is_embed_only);
    }
}
