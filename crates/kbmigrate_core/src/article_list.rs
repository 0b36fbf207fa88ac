//! Planning export: metadata of every article an export would fetch, written
//! as CSV and JSON. Nothing is downloaded and no bodies are processed.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{Local, NaiveDate, NaiveDateTime};
use serde::Serialize;
use tracing::{info, warn};

use crate::category_cache::{CategoryCache, hierarchy_path};
use crate::category_tree::PATH_SEPARATOR;
use crate::config::MigrateConfig;
use crate::fetch::{
    ArticleFetcher, CategoryFilter, FetchOptions, PlannedArticle, article_category_chain,
    filter_by_category, list_latest_articles, log_progress,
};
use crate::migrate::{TIMESTAMP_FORMAT, source_client};
use crate::rate_limit::RateLimiter;
use crate::record::ArticleRecord;
use crate::runtime::ResolvedPaths;
use crate::store::RecordStore;
use crate::translation::LocalePriority;

pub const LIST_SOURCE: &str = "ServiceNow Knowledge Base";
const TOP_CATEGORIES: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ListFormat {
    Csv,
    Json,
    #[default]
    Both,
}

impl ListFormat {
    fn csv(self) -> bool {
        matches!(self, Self::Csv | Self::Both)
    }

    fn json(self) -> bool {
        matches!(self, Self::Json | Self::Both)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub query: Option<String>,
    pub limit: Option<usize>,
    pub category: CategoryFilter,
    /// Lower bound on `sys_updated_on`, `YYYY-MM-DD` or `YYYY-MM-DD HH:MM:SS`.
    pub updated_after: Option<String>,
    pub updated_before: Option<String>,
    pub format: ListFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranslationMetadata {
    pub translation_sys_id: String,
    pub translation_number: String,
    pub translation_title: String,
    pub translation_language: String,
    pub translation_updated_on: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArticleMetadata {
    pub article_number: String,
    pub article_title: String,
    pub sys_id: String,
    pub workflow_state: String,
    pub language: String,
    pub author: String,
    pub created_on: String,
    pub updated_on: String,
    pub category_path: String,
    pub category_depth: usize,
    pub has_translations: bool,
    pub translation_count: usize,
    pub translations: Vec<TranslationMetadata>,
}

/// CSV row: one per translation, or one per article without translations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArticleListRow {
    pub article_number: String,
    pub article_title: String,
    pub sys_id: String,
    pub workflow_state: String,
    pub language: String,
    pub author: String,
    pub created_on: String,
    pub updated_on: String,
    pub category_path: String,
    pub category_depth: usize,
    pub has_translations: bool,
    pub translation_count: usize,
    pub translation_sys_id: String,
    pub translation_number: String,
    pub translation_title: String,
    pub translation_language: String,
    pub translation_updated_on: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryCount {
    pub category: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArticleListSummary {
    pub total_articles: usize,
    pub articles_with_translations: usize,
    pub total_translations: usize,
    pub unique_categories: usize,
    pub top_categories: Vec<CategoryCount>,
    pub languages: BTreeMap<String, usize>,
    pub workflow_states: BTreeMap<String, usize>,
}

#[derive(Debug, Serialize)]
struct ExportInfo<'a> {
    source: &'a str,
    includes_translations: bool,
    includes_categories: bool,
    export_timestamp: String,
}

#[derive(Debug, Serialize)]
struct ArticleListDocument<'a> {
    total_articles: usize,
    export_info: ExportInfo<'a>,
    articles: &'a [ArticleMetadata],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListReport {
    pub listed: usize,
    pub after_category_filter: usize,
    pub summary: ArticleListSummary,
    pub csv_path: Option<PathBuf>,
    pub json_path: Option<PathBuf>,
    pub request_count: usize,
}

/// Base listing query with the update window appended, `^`-joined.
pub fn build_list_query(
    base: Option<&str>,
    updated_after: Option<&str>,
    updated_before: Option<&str>,
) -> Result<Option<String>> {
    let mut parts = base
        .map(str::trim)
        .filter(|base| !base.is_empty())
        .map(ToString::to_string)
        .into_iter()
        .collect::<Vec<_>>();
    if let Some(after) = updated_after {
        parts.push(format!("sys_updated_on>={}", normalize_bound(after)?));
    }
    if let Some(before) = updated_before {
        parts.push(format!("sys_updated_on<={}", normalize_bound(before)?));
    }
    Ok((!parts.is_empty()).then(|| parts.join("^")))
}

fn normalize_bound(value: &str) -> Result<String> {
    let value = value.trim();
    if NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S").is_ok()
        || NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok()
    {
        return Ok(value.to_string());
    }
    bail!("invalid date `{value}`; expected YYYY-MM-DD or YYYY-MM-DD HH:MM:SS")
}

/// Metadata of each planned article. A category that cannot be resolved
/// leaves the path empty.
pub fn collect_article_metadata<S: RecordStore + ?Sized>(
    store: &S,
    cache: &CategoryCache,
    planned: &[PlannedArticle],
) -> Vec<ArticleMetadata> {
    let total = planned.len();
    planned
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let chain = article_category_chain(store, cache, &item.article).unwrap_or_default();
            let path = hierarchy_path(&chain, PATH_SEPARATOR);
            let metadata = article_metadata(&item.article, &item.translations, &path, chain.len());
            log_progress(index + 1, total);
            metadata
        })
        .collect()
}

fn article_metadata(
    article: &ArticleRecord,
    translations: &[ArticleRecord],
    category_path: &str,
    category_depth: usize,
) -> ArticleMetadata {
    ArticleMetadata {
        article_number: article.number.clone(),
        article_title: article.display_title().to_string(),
        sys_id: article.sys_id.clone(),
        workflow_state: article.workflow_state.clone(),
        language: article.language.clone(),
        author: article.author.clone(),
        created_on: article.created_on.clone(),
        updated_on: article.updated_on.clone(),
        category_path: category_path.to_string(),
        category_depth,
        has_translations: !translations.is_empty(),
        translation_count: translations.len(),
        translations: translations
            .iter()
            .map(|translation| TranslationMetadata {
                translation_sys_id: translation.sys_id.clone(),
                translation_number: translation.number.clone(),
                translation_title: translation.display_title().to_string(),
                translation_language: translation.language.clone(),
                translation_updated_on: translation.updated_on.clone(),
            })
            .collect(),
    }
}

pub fn list_rows(articles: &[ArticleMetadata]) -> Vec<ArticleListRow> {
    let mut rows = Vec::new();
    for article in articles {
        let base = ArticleListRow {
            article_number: article.article_number.clone(),
            article_title: article.article_title.clone(),
            sys_id: article.sys_id.clone(),
            workflow_state: article.workflow_state.clone(),
            language: article.language.clone(),
            author: article.author.clone(),
            created_on: article.created_on.clone(),
            updated_on: article.updated_on.clone(),
            category_path: article.category_path.clone(),
            category_depth: article.category_depth,
            has_translations: article.has_translations,
            translation_count: article.translation_count,
            ..ArticleListRow::default()
        };
        if article.translations.is_empty() {
            rows.push(base);
            continue;
        }
        for translation in &article.translations {
            rows.push(ArticleListRow {
                translation_sys_id: translation.translation_sys_id.clone(),
                translation_number: translation.translation_number.clone(),
                translation_title: translation.translation_title.clone(),
                translation_language: translation.translation_language.clone(),
                translation_updated_on: translation.translation_updated_on.clone(),
                ..base.clone()
            });
        }
    }
    rows
}

pub fn summarize(articles: &[ArticleMetadata]) -> ArticleListSummary {
    let mut categories: BTreeMap<String, usize> = BTreeMap::new();
    let mut languages: BTreeMap<String, usize> = BTreeMap::new();
    let mut workflow_states: BTreeMap<String, usize> = BTreeMap::new();
    for article in articles {
        if !article.category_path.is_empty() {
            *categories.entry(article.category_path.clone()).or_default() += 1;
        }
        *languages.entry(article.language.clone()).or_default() += 1;
        *workflow_states
            .entry(article.workflow_state.clone())
            .or_default() += 1;
    }

    let unique_categories = categories.len();
    let mut top_categories = categories
        .into_iter()
        .map(|(category, count)| CategoryCount { category, count })
        .collect::<Vec<_>>();
    top_categories.sort_by(|left, right| {
        right
            .count
            .cmp(&left.count)
            .then_with(|| left.category.cmp(&right.category))
    });
    top_categories.truncate(TOP_CATEGORIES);

    ArticleListSummary {
        total_articles: articles.len(),
        articles_with_translations: articles
            .iter()
            .filter(|article| article.has_translations)
            .count(),
        total_translations: articles.iter().map(|article| article.translation_count).sum(),
        unique_categories,
        top_categories,
        languages,
        workflow_states,
    }
}

pub fn write_article_list_csv(path: &Path, articles: &[ArticleMetadata]) -> Result<()> {
    create_parent(path)?;
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    for row in list_rows(articles) {
        writer
            .serialize(row)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("failed to flush {}", path.display()))?;
    Ok(())
}

pub fn write_article_list_json(path: &Path, articles: &[ArticleMetadata], timestamp: &str) -> Result<()> {
    create_parent(path)?;
    let document = ArticleListDocument {
        total_articles: articles.len(),
        export_info: ExportInfo {
            source: LIST_SOURCE,
            includes_translations: true,
            includes_categories: true,
            export_timestamp: timestamp.to_string(),
        },
        articles,
    };
    let json = serde_json::to_string_pretty(&document).context("failed to serialize article list")?;
    fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(())
}

pub fn run_list(paths: &ResolvedPaths, config: &MigrateConfig, options: &ListOptions) -> Result<ListReport> {
    let client = source_client(config)?;
    run_list_with_store(paths, config, options, &client)
}

pub fn run_list_with_store<S: RecordStore + ?Sized>(
    paths: &ResolvedPaths,
    config: &MigrateConfig,
    options: &ListOptions,
    store: &S,
) -> Result<ListReport> {
    let page_size = config.page_size();
    let query = build_list_query(
        options.query.as_deref(),
        options.updated_after.as_deref(),
        options.updated_before.as_deref(),
    )?;

    let cache = CategoryCache::default();
    match cache.prefetch_all(store, page_size) {
        Ok(count) => info!(categories = count, "prefetched categories"),
        Err(error) => warn!(error = %format!("{error:#}"), "category prefetch failed; resolving on demand"),
    }

    let listed = list_latest_articles(store, query.as_deref(), page_size).context("failed to list articles")?;
    let listed_count = listed.len();
    let filtered = filter_by_category(store, &cache, listed, &options.category);
    let after_category_filter = filtered.len();

    let limiter = RateLimiter::from_millis(config.rate_limit_ms());
    let fetcher = ArticleFetcher::new(
        store,
        &cache,
        &limiter,
        None,
        &paths.download_dir,
        FetchOptions {
            workers: 1,
            process_embeds: false,
            page_size,
            locales: LocalePriority::new(&config.primary_locale(), &config.secondary_locale()),
        },
    );
    let planned = fetcher.plan(filtered, options.limit);
    let articles = collect_article_metadata(store, &cache, &planned);
    let summary = summarize(&articles);

    let now = Local::now();
    let timestamp = now.format(TIMESTAMP_FORMAT).to_string();
    let csv_path = if options.format.csv() {
        let path = paths.output_dir.join(format!("article_list_{timestamp}.csv"));
        write_article_list_csv(&path, &articles)?;
        info!(file = %path.display(), articles = articles.len(), "wrote article list");
        Some(path)
    } else {
        None
    };
    let json_path = if options.format.json() {
        let path = paths.output_dir.join(format!("article_list_{timestamp}.json"));
        write_article_list_json(&path, &articles, &now.to_rfc3339())?;
        info!(file = %path.display(), articles = articles.len(), "wrote article list");
        Some(path)
    } else {
        None
    };

    Ok(ListReport {
        listed: listed_count,
        after_category_filter,
        summary,
        csv_path,
        json_path,
        request_count: store.request_count(),
    })
}
