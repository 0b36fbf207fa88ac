use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::{Mutex, mpsc};
use std::thread;

use anyhow::{Result, bail};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::attachments::{AttachmentDownloader, AttachmentRef, document_attachment};
use crate::category_cache::{CategoryCache, CategoryRecord, hierarchy_path};
use crate::category_tree::PATH_SEPARATOR;
use crate::doc_export::DocumentExporter;
use crate::iframe::{EmbedFailure, EmbedProcessor, IframeResult, process_family};
use crate::rate_limit::RateLimiter;
use crate::record::{ARTICLE_FIELDS, ARTICLE_TABLE, ArticleRecord, Lookup, STATE_PUBLISHED};
use crate::store::{RecordQuery, RecordStore, query_all};
use crate::translation::{LocalePriority, MergeSection, TranslationResolver, merge_sections};

const PROGRESS_EVERY: usize = 10;

/// Latest published version of every article, newest first.
pub fn list_latest_articles<S: RecordStore + ?Sized>(
    store: &S,
    query: Option<&str>,
    page_size: usize,
) -> Result<Vec<ArticleRecord>> {
    let filter = match query.map(str::trim).filter(|query| !query.is_empty()) {
        Some(query) if query.contains("workflow_state") => {
            format!("{query}^ORDERBYDESCsys_updated_on")
        }
        Some(query) => format!("{query}^workflow_state={STATE_PUBLISHED}^ORDERBYDESCsys_updated_on"),
        None => format!("workflow_state={STATE_PUBLISHED}^ORDERBYDESCsys_updated_on"),
    };
    let records = query_all(
        store,
        &RecordQuery::new(ARTICLE_TABLE, filter)
            .fields(ARTICLE_FIELDS)
            .with_display_values(),
        page_size,
    )?;

    let mut seen_numbers = HashSet::new();
    let total = records.len();
    let latest = records
        .iter()
        .map(ArticleRecord::from_record)
        .filter(|article| !article.number.is_empty() && seen_numbers.insert(article.number.clone()))
        .collect::<Vec<_>>();
    info!(latest = latest.len(), total, "filtered to latest article versions");
    Ok(latest)
}

/// Category include/exclude filter over resolved category hierarchies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategoryFilter {
    /// Case-insensitive substring of the joined path.
    pub include: Option<String>,
    /// Case-insensitive exact match on any single label.
    pub exclude: Option<String>,
}

impl CategoryFilter {
    pub fn is_empty(&self) -> bool {
        self.include.is_none() && self.exclude.is_none()
    }

    pub fn matches(&self, labels: &[&str]) -> bool {
        let joined = labels.join(PATH_SEPARATOR).to_lowercase();
        if let Some(include) = &self.include
            && !joined.contains(&include.to_lowercase())
        {
            return false;
        }
        if let Some(exclude) = &self.exclude {
            let exclude = exclude.to_lowercase();
            if labels.iter().any(|label| label.to_lowercase() == exclude) {
                return false;
            }
        }
        true
    }
}

/// Category chain of an article, root first. `None` when a lookup failed;
/// the failure is logged and not cached, so a later call retries it.
pub fn article_category_chain<S: RecordStore + ?Sized>(
    store: &S,
    cache: &CategoryCache,
    article: &ArticleRecord,
) -> Option<Vec<CategoryRecord>> {
    let Some(category_id) = &article.category_id else {
        return Some(Vec::new());
    };
    match cache.hierarchy(store, category_id) {
        Ok(chain) => Some(chain),
        Err(error) => {
            warn!(
                number = %article.number,
                category = %category_id,
                error = %format!("{error:#}"),
                "category lookup failed"
            );
            None
        }
    }
}

/// Articles whose category path passes `filter`. An article whose category
/// cannot be resolved is skipped.
pub fn filter_by_category<S: RecordStore + ?Sized>(
    store: &S,
    cache: &CategoryCache,
    articles: Vec<ArticleRecord>,
    filter: &CategoryFilter,
) -> Vec<ArticleRecord> {
    if filter.is_empty() {
        return articles;
    }
    let mut kept = Vec::with_capacity(articles.len());
    for article in articles {
        let Some(chain) = article_category_chain(store, cache, &article) else {
            warn!(number = %article.number, "skipping article with unresolved category");
            continue;
        };
        let labels = chain
            .iter()
            .map(|category| category.label.as_str())
            .collect::<Vec<_>>();
        if filter.matches(&labels) {
            kept.push(article);
        } else {
            debug!(number = %article.number, path = %labels.join(PATH_SEPARATOR), "filtered out by category");
        }
    }
    kept
}

/// An article that survived deduplication, with the translations it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedArticle {
    pub article: ArticleRecord,
    pub translations: Vec<ArticleRecord>,
}

/// One physically exported HTML document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportDocument {
    pub sys_id: String,
    pub number: String,
    pub title: String,
    pub locale: String,
    #[serde(skip)]
    pub html: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArticleFetchResult {
    pub article: ArticleRecord,
    pub translations: Vec<ArticleRecord>,
    pub category_path: Vec<CategoryRecord>,
    pub attachments: Vec<AttachmentRef>,
    pub iframe_result: Option<IframeResult>,
    /// Merged family document, or one document per member under special handling.
    pub documents: Vec<ExportDocument>,
}

impl ArticleFetchResult {
    pub fn requires_special_handling(&self) -> bool {
        self.iframe_result
            .as_ref()
            .is_some_and(IframeResult::requires_special_handling)
    }

    pub fn special_handling_flag(&self) -> Option<String> {
        self.iframe_result
            .as_ref()
            .and_then(IframeResult::flag_message)
    }

    pub fn all_sys_ids(&self) -> Vec<String> {
        self.family().map(|article| article.sys_id.clone()).collect()
    }

    /// Original first, then translations in discovery order.
    pub fn family(&self) -> impl Iterator<Item = &ArticleRecord> {
        std::iter::once(&self.article).chain(&self.translations)
    }

    pub fn category_path_string(&self) -> String {
        hierarchy_path(&self.category_path, PATH_SEPARATOR)
    }

    pub fn embed_failures(&self) -> Vec<EmbedFailure> {
        self.iframe_result
            .as_ref()
            .map(|result| result.failures().cloned().collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchFailure {
    pub sys_id: String,
    pub number: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchReport {
    pub results: Vec<ArticleFetchResult>,
    pub failures: Vec<FetchFailure>,
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub workers: usize,
    pub process_embeds: bool,
    pub page_size: usize,
    pub locales: LocalePriority,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            process_embeds: true,
            page_size: crate::store::DEFAULT_PAGE_SIZE,
            locales: LocalePriority::default(),
        }
    }
}

/// Drives retrieval of full article data. Shared read-only between workers.
pub struct ArticleFetcher<'a, S: RecordStore + ?Sized> {
    store: &'a S,
    cache: &'a CategoryCache,
    limiter: &'a RateLimiter,
    exporter: Option<&'a dyn DocumentExporter>,
    downloader: AttachmentDownloader<'a, S>,
    options: FetchOptions,
}

impl<'a, S: RecordStore + ?Sized> ArticleFetcher<'a, S> {
    pub fn new(
        store: &'a S,
        cache: &'a CategoryCache,
        limiter: &'a RateLimiter,
        exporter: Option<&'a dyn DocumentExporter>,
        download_dir: &Path,
        options: FetchOptions,
    ) -> Self {
        Self {
            store,
            cache,
            limiter,
            exporter,
            downloader: AttachmentDownloader::new(store, download_dir, options.page_size),
            options,
        }
    }

    fn resolver(&self) -> TranslationResolver<'_, S> {
        TranslationResolver::new(self.store, &self.options.locales, self.options.page_size)
    }

    /// Sequential deduplication over the input order. A record already
    /// counted as someone's translation is skipped; a kept record claims its
    /// own id and every translation not yet counted.
    pub fn plan(&self, articles: Vec<ArticleRecord>, limit: Option<usize>) -> Vec<PlannedArticle> {
        let total = articles.len();
        let mut counted = HashSet::new();
        let mut planned = Vec::new();

        for article in articles {
            if limit.is_some_and(|limit| planned.len() >= limit) {
                break;
            }
            if counted.contains(&article.sys_id) {
                debug!(number = %article.number, "skipping article already counted as a translation");
                continue;
            }
            counted.insert(article.sys_id.clone());

            self.limiter.acquire();
            let translations = self
                .resolver()
                .find_translations(&article.sys_id)
                .into_iter()
                .filter(|translation| counted.insert(translation.sys_id.clone()))
                .collect::<Vec<_>>();
            if !translations.is_empty() {
                debug!(
                    number = %article.number,
                    translations = ?translations.iter().map(|t| t.number.as_str()).collect::<Vec<_>>(),
                    "keeping article with translations"
                );
            }
            planned.push(PlannedArticle {
                article,
                translations,
            });
        }

        info!(input = total, unique = planned.len(), "deduplicated translation families");
        planned
    }

    /// Fetch every planned article. Results are reported in plan order; a
    /// failed article is logged and dropped.
    pub fn fetch_all(&self, planned: Vec<PlannedArticle>) -> FetchReport
    where
        S: Sync,
    {
        let total = planned.len();
        let workers = self.options.workers.max(1).min(total.max(1));
        info!(total, workers, "fetching articles");

        let mut outcomes = if workers <= 1 {
            let mut outcomes = Vec::with_capacity(total);
            for (index, item) in planned.into_iter().enumerate() {
                let outcome = self.fetch_planned(&item);
                outcomes.push((index, item, outcome));
                log_progress(outcomes.len(), total);
            }
            outcomes
        } else {
            self.fetch_parallel(planned, workers)
        };
        outcomes.sort_by_key(|(index, _, _)| *index);

        let mut report = FetchReport::default();
        for (_, item, outcome) in outcomes {
            match outcome {
                Ok(result) => report.results.push(result),
                Err(error) => {
                    let message = format!("{error:#}");
                    error!(number = %item.article.number, sys_id = %item.article.sys_id, error = %message, "failed to fetch article");
                    report.failures.push(FetchFailure {
                        sys_id: item.article.sys_id,
                        number: item.article.number,
                        error: message,
                    });
                }
            }
        }
        info!(
            fetched = report.results.len(),
            failed = report.failures.len(),
            "article fetch complete"
        );
        report
    }

    fn fetch_parallel(
        &self,
        planned: Vec<PlannedArticle>,
        workers: usize,
    ) -> Vec<(usize, PlannedArticle, Result<ArticleFetchResult>)>
    where
        S: Sync,
    {
        let total = planned.len();
        let queue = Mutex::new(planned.into_iter().enumerate().collect::<VecDeque<_>>());
        let (sender, receiver) = mpsc::channel();
        let mut outcomes = Vec::with_capacity(total);

        thread::scope(|scope| {
            for _ in 0..workers {
                let sender = sender.clone();
                let queue = &queue;
                scope.spawn(move || {
                    loop {
                        let next = match queue.lock() {
                            Ok(mut guard) => guard.pop_front(),
                            Err(poisoned) => poisoned.into_inner().pop_front(),
                        };
                        let Some((index, item)) = next else {
                            break;
                        };
                        let outcome = self.fetch_planned(&item);
                        if sender.send((index, item, outcome)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(sender);

            for outcome in receiver {
                outcomes.push(outcome);
                log_progress(outcomes.len(), total);
            }
        });

        outcomes
    }

    /// Single-article mode: discover translations, then fetch like any other.
    pub fn fetch_single(&self, sys_id: &str) -> Result<ArticleFetchResult> {
        self.limiter.acquire();
        let Lookup::Found(record) = self.store.get_record(ARTICLE_TABLE, sys_id, ARTICLE_FIELDS)?
        else {
            bail!("article {sys_id} not found");
        };
        let article = ArticleRecord::from_record(&record);
        let translations = self.resolver().find_translations(&article.sys_id);
        self.fetch_planned(&PlannedArticle {
            article,
            translations,
        })
    }

    fn fetch_planned(&self, planned: &PlannedArticle) -> Result<ArticleFetchResult> {
        self.limiter.acquire();
        let sys_id = planned.article.sys_id.as_str();
        let Lookup::Found(record) = self.store.get_record(ARTICLE_TABLE, sys_id, ARTICLE_FIELDS)?
        else {
            bail!("article {sys_id} not found");
        };
        let article = ArticleRecord::from_record(&record);
        let translations = planned.translations.clone();

        let category_path =
            article_category_chain(self.store, self.cache, &article).unwrap_or_default();

        let family_ids = std::iter::once(&article)
            .chain(&translations)
            .map(|member| member.sys_id.clone())
            .collect::<Vec<_>>();
        let mut attachments = self.downloader.download_for_family(&family_ids);
        let bodies = std::iter::once(&article)
            .chain(&translations)
            .map(|member| member.text.as_str())
            .collect::<Vec<_>>();
        let orphans = self.downloader.fetch_orphans(&bodies, &attachments);
        attachments.extend(orphans);
        debug!(number = %article.number, attachments = attachments.len(), translations = translations.len(), "fetched attachments");

        let locales = &self.options.locales;
        let original_locale = locales.normalize(&article.language).to_string();
        let iframe_result = if self.options.process_embeds {
            let processor = EmbedProcessor::new(self.exporter);
            let tagged = translations
                .iter()
                .map(|translation| {
                    (
                        translation.clone(),
                        locales.normalize(&translation.language).to_string(),
                    )
                })
                .collect::<Vec<_>>();
            Some(process_family(&processor, &article, &original_locale, &tagged))
        } else {
            None
        };

        if let Some(result) = &iframe_result {
            for blob in result.blobs() {
                attachments.extend(blob.downloaded.iter().map(document_attachment));
            }
        }

        let documents = build_documents(locales, &article, &translations, iframe_result.as_ref());
        if let Some(result) = &iframe_result
            && result.requires_special_handling()
        {
            warn!(
                number = %article.number,
                documents = documents.len(),
                "special handling required, exporting translations separately"
            );
        }

        Ok(ArticleFetchResult {
            article,
            translations,
            category_path,
            attachments,
            iframe_result,
            documents,
        })
    }
}

fn build_documents(
    locales: &LocalePriority,
    article: &ArticleRecord,
    translations: &[ArticleRecord],
    iframe_result: Option<&IframeResult>,
) -> Vec<ExportDocument> {
    let members = std::iter::once(article).chain(translations).collect::<Vec<_>>();
    let bodies = match iframe_result {
        Some(result) => result.blobs().map(|blob| blob.html.as_str()).collect::<Vec<_>>(),
        None => members.iter().map(|member| member.text.as_str()).collect(),
    };

    if iframe_result.is_some_and(IframeResult::requires_special_handling) {
        return members
            .iter()
            .zip(&bodies)
            .map(|(member, html)| ExportDocument {
                sys_id: member.sys_id.clone(),
                number: member.number.clone(),
                title: member.display_title().to_string(),
                locale: locales.normalize(&member.language).to_string(),
                html: (*html).to_string(),
            })
            .collect();
    }

    let html = if translations.is_empty() {
        bodies.first().map(|body| (*body).to_string()).unwrap_or_default()
    } else {
        let sections = members
            .iter()
            .zip(&bodies)
            .map(|(member, html)| MergeSection {
                language: &member.language,
                html,
            })
            .collect::<Vec<_>>();
        merge_sections(locales, &sections)
    };
    vec![ExportDocument {
        sys_id: article.sys_id.clone(),
        number: article.number.clone(),
        title: article.display_title().to_string(),
        locale: locales.normalize(&article.language).to_string(),
        html,
    }]
}

pub(crate) fn log_progress(completed: usize, total: usize) {
    if completed % PROGRESS_EVERY == 0 || completed == total {
        info!("Progress: {completed}/{total} articles processed");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::record::CATEGORY_TABLE;
    use crate::test_support::{CountingExporter, MockStore, article, category};
    use tempfile::tempdir;

    const DOC: &str = r#"<iframe src="https://docs.google.com/document/d/DOC_1/preview"></iframe>"#;

    fn fetcher<'a>(
        store: &'a MockStore,
        cache: &'a CategoryCache,
        limiter: &'a RateLimiter,
        exporter: Option<&'a dyn DocumentExporter>,
        dir: &Path,
        workers: usize,
    ) -> ArticleFetcher<'a, MockStore> {
        ArticleFetcher::new(
            store,
            cache,
            limiter,
            exporter,
            dir,
            FetchOptions {
                workers,
                ..FetchOptions::default()
            },
        )
    }

    fn family_store() -> MockStore {
        let mut store = MockStore::default();
        store.add_record(ARTICLE_TABLE, article("ja1", "KB1", "ja").with_text("text", "<p>ja</p>"));
        store.add_record(ARTICLE_TABLE, article("en1", "KB2", "en").with_text("text", "<p>en</p>"));
        store.add_record(ARTICLE_TABLE, article("solo", "KB3", "ja").with_text("text", "<p>solo</p>"));
        store.add_query(
            ARTICLE_TABLE,
            "parent=ja1^ORtranslated_from=ja1^workflow_state=published",
            vec![article("en1", "KB2", "en").with_text("text", "<p>en</p>")],
        );
        store.add_query(
            ARTICLE_TABLE,
            "parent=en1^ORtranslated_from=en1^workflow_state=published",
            vec![article("ja1", "KB1", "ja")],
        );
        store
    }

    fn listed(store: &MockStore, ids: &[&str]) -> Vec<ArticleRecord> {
        ids.iter()
            .map(|id| {
                let record = store.record(ARTICLE_TABLE, id).expect("record");
                ArticleRecord::from_record(&record)
            })
            .collect()
    }

    #[test]
    fn plan_absorbs_translations_of_earlier_articles() {
        let temp = tempdir().expect("tempdir");
        let store = family_store();
        let cache = CategoryCache::default();
        let limiter = RateLimiter::from_millis(0);
        let fetcher = fetcher(&store, &cache, &limiter, None, temp.path(), 1);

        let planned = fetcher.plan(listed(&store, &["ja1", "en1", "solo"]), None);
        assert_eq!(planned.len(), 2);
        assert_eq!(planned[0].article.sys_id, "ja1");
        assert_eq!(planned[0].translations[0].sys_id, "en1");
        assert_eq!(planned[1].article.sys_id, "solo");
    }

    #[test]
    fn later_article_cannot_claim_an_already_exported_record() {
        let temp = tempdir().expect("tempdir");
        let store = family_store();
        let cache = CategoryCache::default();
        let limiter = RateLimiter::from_millis(0);
        let fetcher = fetcher(&store, &cache, &limiter, None, temp.path(), 1);

        let planned = fetcher.plan(listed(&store, &["solo", "en1", "ja1"]), None);
        let mut seen = HashSet::new();
        for item in &planned {
            assert!(seen.insert(item.article.sys_id.clone()));
            for translation in &item.translations {
                assert!(seen.insert(translation.sys_id.clone()));
            }
        }
        assert_eq!(planned.len(), 2);
    }

    #[test]
    fn limit_applies_after_deduplication() {
        let temp = tempdir().expect("tempdir");
        let store = family_store();
        let cache = CategoryCache::default();
        let limiter = RateLimiter::from_millis(0);
        let fetcher = fetcher(&store, &cache, &limiter, None, temp.path(), 1);
        let planned = fetcher.plan(listed(&store, &["ja1", "en1", "solo"]), Some(2));
        assert_eq!(planned.len(), 2);
        assert_eq!(planned[1].article.sys_id, "solo");
    }

    #[test]
    fn merged_family_produces_one_document() {
        let temp = tempdir().expect("tempdir");
        let store = family_store();
        let cache = CategoryCache::default();
        let limiter = RateLimiter::from_millis(0);
        let fetcher = fetcher(&store, &cache, &limiter, None, temp.path(), 1);

        let planned = fetcher.plan(listed(&store, &["en1", "ja1"]), None);
        let report = fetcher.fetch_all(planned);
        assert_eq!(report.results.len(), 1);
        let result = &report.results[0];
        assert_eq!(result.documents.len(), 1);
        let html = &result.documents[0].html;
        assert!(html.find("data-language=\"ja\"") < html.find("data-language=\"en\""));
        assert!(!result.requires_special_handling());
    }

    #[test]
    fn docs_embed_with_translation_splits_documents() {
        let temp = tempdir().expect("tempdir");
        let mut store = family_store();
        store.add_record(
            ARTICLE_TABLE,
            article("ja1", "KB1", "ja").with_text("text", &format!("<p>ja</p>{DOC}")),
        );
        let cache = CategoryCache::default();
        let limiter = RateLimiter::from_millis(0);
        let exporter = CountingExporter::in_dir(temp.path());
        let fetcher = fetcher(&store, &cache, &limiter, Some(&exporter), temp.path(), 1);

        let planned = fetcher.plan(listed(&store, &["ja1"]), None);
        let report = fetcher.fetch_all(planned);
        let result = &report.results[0];
        assert!(result.requires_special_handling());
        assert_eq!(result.documents.len(), 2);
        assert_eq!(result.documents[0].html, "<p>ja</p>");
        assert!(
            result
                .attachments
                .iter()
                .any(|attachment| attachment.is_embedded_document())
        );
        assert!(result.special_handling_flag().is_some());
    }

    #[test]
    fn parallel_fetch_drops_failures_and_keeps_plan_order() {
        let temp = tempdir().expect("tempdir");
        let mut store = MockStore::default();
        let mut listed_articles = Vec::new();
        for index in 0..12 {
            let id = format!("a{index:02}");
            let record = article(&id, &format!("KB{index:02}"), "ja")
                .with_reference("kb_category", "c1", "IT");
            listed_articles.push(ArticleRecord::from_record(&record));
            if index != 5 {
                store.add_record(ARTICLE_TABLE, record);
            }
        }
        store.add_record(CATEGORY_TABLE, category("c1", "IT", None));
        let cache = CategoryCache::default();
        let limiter = RateLimiter::from_millis(0);
        let fetcher = fetcher(&store, &cache, &limiter, None, temp.path(), 4);

        let planned = fetcher.plan(listed_articles, None);
        let report = fetcher.fetch_all(planned);
        assert_eq!(report.results.len(), 11);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].sys_id, "a05");
        let numbers = report
            .results
            .iter()
            .map(|result| result.article.number.clone())
            .collect::<Vec<_>>();
        let mut sorted = numbers.clone();
        sorted.sort();
        assert_eq!(numbers, sorted);
        assert_eq!(report.results[0].category_path_string(), "IT");
    }

    #[test]
    fn parallel_fetch_keeps_first_claim_on_each_family() {
        let temp = tempdir().expect("tempdir");
        let store = family_store();
        let cache = CategoryCache::default();
        let limiter = RateLimiter::from_millis(0);
        let fetcher = fetcher(&store, &cache, &limiter, None, temp.path(), 4);

        let planned = fetcher.plan(listed(&store, &["ja1", "solo", "en1"]), None);
        let report = fetcher.fetch_all(planned);
        assert!(report.failures.is_empty());
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.results[0].article.sys_id, "ja1");
        assert_eq!(report.results[0].translations[0].sys_id, "en1");
        assert_eq!(report.results[1].article.sys_id, "solo");

        let mut claimed = HashSet::new();
        for result in &report.results {
            for member in std::iter::once(&result.article).chain(&result.translations) {
                assert!(claimed.insert(member.sys_id.clone()));
            }
        }
        assert_eq!(claimed.len(), 3);
    }

    #[test]
    fn category_lookup_failure_skips_only_that_article() {
        let mut store = MockStore::default();
        store.add_record(CATEGORY_TABLE, category("c1", "IT", None));
        store.fail_records_containing("bad");
        let good = ArticleRecord::from_record(
            &article("a1", "KB1", "ja").with_reference("kb_category", "c1", "IT"),
        );
        let broken = ArticleRecord::from_record(
            &article("a2", "KB2", "ja").with_reference("kb_category", "bad_c2", "IT > VPN"),
        );
        let cache = CategoryCache::default();
        let filter = CategoryFilter {
            include: Some("it".to_string()),
            exclude: None,
        };

        let kept = filter_by_category(&store, &cache, vec![good, broken.clone()], &filter);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].sys_id, "a1");
        assert_eq!(article_category_chain(&store, &cache, &broken), None);
    }

    #[test]
    fn category_lookup_failure_still_fetches_article() {
        let temp = tempdir().expect("tempdir");
        let mut store = MockStore::default();
        let record = article("a1", "KB1", "ja").with_reference("kb_category", "bad_c1", "IT");
        store.add_record(ARTICLE_TABLE, record.clone());
        store.add_record(ARTICLE_TABLE, article("a2", "KB2", "ja"));
        store.fail_records_containing("bad");
        let cache = CategoryCache::default();
        let limiter = RateLimiter::from_millis(0);
        let fetcher = fetcher(&store, &cache, &limiter, None, temp.path(), 2);

        let planned = fetcher.plan(listed(&store, &["a1", "a2"]), None);
        let report = fetcher.fetch_all(planned);
        assert!(report.failures.is_empty());
        assert_eq!(report.results.len(), 2);
        assert!(report.results[0].category_path.is_empty());
        assert_eq!(report.results[0].category_path_string(), "");
    }

    #[test]
    fn latest_listing_keeps_first_version_per_number() {
        let mut store = MockStore::default();
        store.add_query(
            ARTICLE_TABLE,
            "workflow_state=published^ORDERBYDESCsys_updated_on",
            vec![
                article("v3", "KB1", "ja"),
                article("v2", "KB1", "ja"),
                article("x1", "KB2", "en"),
            ],
        );
        let latest = list_latest_articles(&store, None, 100).expect("list");
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].sys_id, "v3");
    }

    #[test]
    fn user_query_with_state_is_used_as_is() {
        let mut store = MockStore::default();
        store.add_query(
            ARTICLE_TABLE,
            "workflow_state=draft^ORDERBYDESCsys_updated_on",
            vec![article("d1", "KB1", "ja")],
        );
        let latest = list_latest_articles(&store, Some("workflow_state=draft"), 100).expect("list");
        assert_eq!(latest.len(), 1);
    }

    #[test]
    fn category_filter_semantics() {
        let filter = CategoryFilter {
            include: Some("applications".to_string()),
            exclude: Some("archive".to_string()),
        };
        assert!(filter.matches(&["IT", "Applications", "Figma"]));
        assert!(!filter.matches(&["IT", "Hardware"]));
        assert!(!filter.matches(&["IT", "Applications", "Archive"]));
        assert!(filter.matches(&["IT", "Applications", "Archived tools"]));
    }
}
