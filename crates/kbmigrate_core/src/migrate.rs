use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Local;
use serde::Serialize;
use tracing::{info, warn};

use crate::bundle::{ArchiveSummary, BundleExporter, BundleOptions, UnresolvedLink};
use crate::category_cache::{CategoryCache, CategoryCacheStats, hierarchy_path};
use crate::category_tree::{CategoryForest, CategoryStats, NestedCategory, PATH_SEPARATOR, build_category_forest};
use crate::config::MigrateConfig;
use crate::doc_export::{CommandExporter, DocumentExporter, SerializedExporter};
use crate::fetch::{
    ArticleFetchResult, ArticleFetcher, CategoryFilter, FetchFailure, FetchOptions, FetchReport,
    article_category_chain, filter_by_category, list_latest_articles,
};
use crate::iframe::EmbedFailure;
use crate::rate_limit::RateLimiter;
use crate::report::{build_rows, write_report};
use crate::runtime::ResolvedPaths;
use crate::store::{RecordStore, ServiceNowClient, ServiceNowClientConfig};
use crate::translation::LocalePriority;

pub(crate) const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    pub query: Option<String>,
    pub limit: Option<usize>,
    pub category: CategoryFilter,
    pub workers: Option<usize>,
    pub rate_limit_ms: Option<u64>,
    pub max_per_archive: Option<usize>,
    pub no_embeds: bool,
    pub keep_directory: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpecialHandlingNotice {
    pub sys_id: String,
    pub number: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportReport {
    pub success: bool,
    pub listed: usize,
    pub after_category_filter: usize,
    pub planned: usize,
    pub fetched: usize,
    pub documents: usize,
    pub attachments: usize,
    pub failures: Vec<FetchFailure>,
    pub embed_failures: Vec<EmbedFailure>,
    pub special_handling: Vec<SpecialHandlingNotice>,
    pub unresolved_links: Vec<UnresolvedLink>,
    pub archives: Vec<ArchiveSummary>,
    pub report_path: Option<PathBuf>,
    pub request_count: usize,
    pub category_cache: CategoryCacheStats,
}

/// Fixed configuration shared by the export and single-article modes.
struct RunSettings {
    workers: usize,
    rate_limit_ms: u64,
    max_per_archive: usize,
    process_embeds: bool,
    keep_directory: bool,
    page_size: usize,
    locales: LocalePriority,
}

impl RunSettings {
    fn resolve(config: &MigrateConfig, options: &ExportOptions) -> Self {
        Self {
            workers: options.workers.unwrap_or_else(|| config.workers()).max(1),
            rate_limit_ms: options.rate_limit_ms.unwrap_or_else(|| config.rate_limit_ms()),
            max_per_archive: options
                .max_per_archive
                .unwrap_or_else(|| config.max_per_archive())
                .max(1),
            process_embeds: config.process_embeds() && !options.no_embeds,
            keep_directory: config.keep_directory() || options.keep_directory,
            page_size: config.page_size(),
            locales: LocalePriority::new(&config.primary_locale(), &config.secondary_locale()),
        }
    }

    fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            workers: self.workers,
            process_embeds: self.process_embeds,
            page_size: self.page_size,
            locales: self.locales.clone(),
        }
    }
}

/// Exporter for the configured `[documents]` command, serialized process-wide.
pub fn build_document_exporter(
    paths: &ResolvedPaths,
    config: &MigrateConfig,
) -> Result<Option<SerializedExporter<CommandExporter>>> {
    let Some(exporter) = CommandExporter::from_config(config, &paths.document_dir)? else {
        return Ok(None);
    };
    Ok(Some(SerializedExporter::new(
        exporter,
        Duration::from_millis(config.document_retry_backoff_ms()),
    )))
}

pub fn source_client(config: &MigrateConfig) -> Result<ServiceNowClient> {
    ServiceNowClient::new(ServiceNowClientConfig::from_config(config)?)
}

pub fn run_export(
    paths: &ResolvedPaths,
    config: &MigrateConfig,
    options: &ExportOptions,
) -> Result<ExportReport> {
    let client = source_client(config)?;
    let exporter = build_document_exporter(paths, config)?;
    run_export_with_store(
        paths,
        config,
        options,
        &client,
        exporter.as_ref().map(|exporter| exporter as &dyn DocumentExporter),
    )
}

pub fn run_export_with_store<S: RecordStore + Sync + ?Sized>(
    paths: &ResolvedPaths,
    config: &MigrateConfig,
    options: &ExportOptions,
    store: &S,
    exporter: Option<&dyn DocumentExporter>,
) -> Result<ExportReport> {
    let settings = RunSettings::resolve(config, options);
    paths.ensure_dirs()?;
    let cache = CategoryCache::default();
    if !options.category.is_empty() {
        match cache.prefetch_all(store, settings.page_size) {
            Ok(count) => info!(categories = count, "prefetched categories"),
            Err(error) => warn!(error = %format!("{error:#}"), "category prefetch failed; resolving on demand"),
        }
    }

    let listed = list_latest_articles(store, options.query.as_deref(), settings.page_size)
        .context("failed to list articles")?;
    let listed_count = listed.len();
    let filtered = filter_by_category(store, &cache, listed, &options.category);
    let after_filter = filtered.len();
    if !options.category.is_empty() {
        info!(before = listed_count, after = after_filter, "applied category filter");
    }

    let limiter = RateLimiter::from_millis(settings.rate_limit_ms);
    let fetcher = ArticleFetcher::new(
        store,
        &cache,
        &limiter,
        exporter,
        &paths.download_dir,
        settings.fetch_options(),
    );
    let planned = fetcher.plan(filtered, options.limit);
    let planned_count = planned.len();
    let fetch = fetcher.fetch_all(planned);

    let mut report = finish_export(paths, config, &settings, fetch, store, &cache)?;
    report.listed = listed_count;
    report.after_category_filter = after_filter;
    report.planned = planned_count;
    Ok(report)
}

pub fn run_article(
    paths: &ResolvedPaths,
    config: &MigrateConfig,
    sys_id: &str,
    options: &ExportOptions,
) -> Result<ExportReport> {
    let client = source_client(config)?;
    let exporter = build_document_exporter(paths, config)?;
    run_article_with_store(
        paths,
        config,
        sys_id,
        options,
        &client,
        exporter.as_ref().map(|exporter| exporter as &dyn DocumentExporter),
    )
}

pub fn run_article_with_store<S: RecordStore + Sync + ?Sized>(
    paths: &ResolvedPaths,
    config: &MigrateConfig,
    sys_id: &str,
    options: &ExportOptions,
    store: &S,
    exporter: Option<&dyn DocumentExporter>,
) -> Result<ExportReport> {
    let sys_id = sys_id.trim();
    if sys_id.is_empty() {
        bail!("article sys_id is empty");
    }
    let settings = RunSettings::resolve(config, options);
    paths.ensure_dirs()?;
    let cache = CategoryCache::default();
    let limiter = RateLimiter::from_millis(settings.rate_limit_ms);
    let fetcher = ArticleFetcher::new(
        store,
        &cache,
        &limiter,
        exporter,
        &paths.download_dir,
        settings.fetch_options(),
    );
    let result = fetcher
        .fetch_single(sys_id)
        .with_context(|| format!("failed to fetch article {sys_id}"))?;

    let mut report = finish_export(
        paths,
        config,
        &settings,
        FetchReport {
            results: vec![result],
            failures: Vec::new(),
        },
        store,
        &cache,
    )?;
    report.listed = 1;
    report.after_category_filter = 1;
    report.planned = 1;
    Ok(report)
}

fn finish_export<S: RecordStore + ?Sized>(
    paths: &ResolvedPaths,
    config: &MigrateConfig,
    settings: &RunSettings,
    fetch: FetchReport,
    store: &S,
    cache: &CategoryCache,
) -> Result<ExportReport> {
    let timestamp = Local::now().format(TIMESTAMP_FORMAT).to_string();
    let prefix = config.archive_prefix();
    let results = fetch.results;

    let bundle = BundleExporter::new(BundleOptions {
        output_dir: paths.output_dir.clone(),
        root_folder: config.root_folder(),
        archive_prefix: prefix.clone(),
        max_per_archive: settings.max_per_archive,
        keep_directory: settings.keep_directory,
        timestamp: timestamp.clone(),
        locales: settings.locales.clone(),
    })
    .export(&results)?;

    let report_path = if results.is_empty() {
        None
    } else {
        let path = paths
            .output_dir
            .join(format!("{prefix}_{timestamp}_report.csv"));
        let rows = build_rows(&results, &bundle, &settings.locales);
        write_report(&path, &rows)?;
        info!(report = %path.display(), rows = rows.len(), "wrote export report");
        Some(path)
    };

    let special_handling = results
        .iter()
        .filter_map(|result| {
            result.special_handling_flag().map(|message| SpecialHandlingNotice {
                sys_id: result.article.sys_id.clone(),
                number: result.article.number.clone(),
                message,
            })
        })
        .collect::<Vec<_>>();
    let embed_failures = results
        .iter()
        .flat_map(ArticleFetchResult::embed_failures)
        .collect::<Vec<_>>();

    Ok(ExportReport {
        success: fetch.failures.is_empty(),
        listed: 0,
        after_category_filter: 0,
        planned: 0,
        fetched: results.len(),
        documents: bundle.documents.len(),
        attachments: results.iter().map(|result| result.attachments.len()).sum(),
        failures: fetch.failures,
        embed_failures,
        special_handling,
        unresolved_links: bundle.unresolved_links,
        archives: bundle.archives,
        report_path,
        request_count: store.request_count(),
        category_cache: cache.stats(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategoryFormat {
    Tree,
    Json,
    Csv,
}

#[derive(Debug, Serialize)]
struct CategoryDocument {
    stats: CategoryStats,
    categories: Vec<NestedCategory>,
}

pub fn run_categories(config: &MigrateConfig, query: Option<&str>) -> Result<CategoryForest> {
    let client = source_client(config)?;
    run_categories_with_store(config, query, &client)
}

/// Category hierarchy of the latest published articles.
pub fn run_categories_with_store<S: RecordStore + ?Sized>(
    config: &MigrateConfig,
    query: Option<&str>,
    store: &S,
) -> Result<CategoryForest> {
    let page_size = config.page_size();
    let cache = CategoryCache::default();
    if let Err(error) = cache.prefetch_all(store, page_size) {
        warn!(error = %format!("{error:#}"), "category prefetch failed; resolving on demand");
    }
    let articles = list_latest_articles(store, query, page_size).context("failed to list articles")?;

    let paths = articles
        .iter()
        .map(|article| {
            let chain = article_category_chain(store, &cache, article).unwrap_or_default();
            hierarchy_path(&chain, PATH_SEPARATOR)
        })
        .collect::<Vec<_>>();
    Ok(build_category_forest(paths))
}

pub fn render_categories(forest: &CategoryForest, format: CategoryFormat) -> Result<String> {
    match format {
        CategoryFormat::Tree => Ok(forest.render_tree()),
        CategoryFormat::Json => serde_json::to_string_pretty(&CategoryDocument {
            stats: forest.stats(),
            categories: forest.nested(),
        })
        .context("failed to serialize categories"),
        CategoryFormat::Csv => {
            let mut writer = csv::Writer::from_writer(Vec::new());
            for row in forest.flat() {
                writer
                    .serialize(row)
                    .context("failed to write category row")?;
            }
            let bytes = writer
                .into_inner()
                .context("failed to finish category csv")?;
            String::from_utf8(bytes).context("category csv is not valid UTF-8")
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;

    use super::*;
    use crate::record::{ARTICLE_TABLE, CATEGORY_TABLE};
    use crate::runtime::{PathOverrides, ResolutionContext, resolve_paths};
    use crate::test_support::{MockStore, article, category};
    use tempfile::tempdir;

    const LISTING: &str = "workflow_state=published^ORDERBYDESCsys_updated_on";

    fn paths(root: &std::path::Path) -> ResolvedPaths {
        let mut config = MigrateConfig::default();
        config.export.output_dir = Some(root.join("out").display().to_string());
        config.export.download_dir = Some(root.join("dl").display().to_string());
        resolve_paths(
            &ResolutionContext {
                cwd: root.to_path_buf(),
            },
            &PathOverrides::default(),
            &config,
        )
    }

    fn categorized(sys_id: &str, number: &str, category_id: &str, label: &str) -> crate::record::Record {
        article(sys_id, number, "ja")
            .with_text("short_description", &format!("Title {number}"))
            .with_reference("kb_category", category_id, label)
    }

    fn store() -> MockStore {
        let mut store = MockStore::default();
        store.add_record(CATEGORY_TABLE, category("c1", "IT", None));
        store.add_record(CATEGORY_TABLE, category("c2", "Applications", Some("c1")));
        store.add_record(CATEGORY_TABLE, category("c3", "Archive", Some("c1")));
        let listed = vec![
            categorized("a1", "KB1", "c2", "Applications"),
            categorized("a2", "KB2", "c3", "Archive"),
            categorized("a3", "KB3", "c1", "IT"),
        ];
        for record in &listed {
            store.add_record(ARTICLE_TABLE, record.clone());
        }
        store.add_query(ARTICLE_TABLE, LISTING, listed);
        store
    }

    fn options() -> ExportOptions {
        ExportOptions {
            workers: Some(2),
            rate_limit_ms: Some(0),
            ..ExportOptions::default()
        }
    }

    #[test]
    fn export_writes_archive_and_report() {
        let temp = tempdir().expect("tempdir");
        let paths = paths(temp.path());
        let store = store();
        let report = run_export_with_store(&paths, &MigrateConfig::default(), &options(), &store, None)
            .expect("export");

        assert!(report.success);
        assert_eq!(report.listed, 3);
        assert_eq!(report.fetched, 3);
        assert_eq!(report.archives.len(), 1);
        let archive = zip::ZipArchive::new(File::open(&report.archives[0].path).expect("open"))
            .expect("zip");
        assert_eq!(archive.len(), 3);
        let csv = std::fs::read_to_string(report.report_path.expect("report")).expect("read");
        assert_eq!(csv.lines().count(), 4);
        assert!(csv.contains("IT > Applications"));
    }

    #[test]
    fn category_filters_apply_before_fetch() {
        let temp = tempdir().expect("tempdir");
        let paths = paths(temp.path());
        let store = store();
        let mut options = options();
        options.category = CategoryFilter {
            include: Some("it".to_string()),
            exclude: Some("archive".to_string()),
        };
        let report = run_export_with_store(&paths, &MigrateConfig::default(), &options, &store, None)
            .expect("export");
        assert_eq!(report.after_category_filter, 2);
        assert_eq!(report.fetched, 2);
        assert!(report.category_cache.prefetched);
    }

    #[test]
    fn single_article_mode_fetches_one() {
        let temp = tempdir().expect("tempdir");
        let paths = paths(temp.path());
        let store = store();
        let report =
            run_article_with_store(&paths, &MigrateConfig::default(), "a2", &options(), &store, None)
                .expect("article");
        assert_eq!(report.fetched, 1);
        assert_eq!(report.documents, 1);
        assert!(run_article_with_store(&paths, &MigrateConfig::default(), "nope", &options(), &store, None).is_err());
    }

    #[test]
    fn categories_render_in_every_format() {
        let store = store();
        let forest = run_categories_with_store(&MigrateConfig::default(), None, &store).expect("forest");
        assert_eq!(forest.len(), 3);

        let tree = render_categories(&forest, CategoryFormat::Tree).expect("tree");
        assert!(tree.contains("IT (1 direct, 3 total)"));
        let json = render_categories(&forest, CategoryFormat::Json).expect("json");
        assert!(json.contains("\"total_categories\": 3"));
        let csv = render_categories(&forest, CategoryFormat::Csv).expect("csv");
        assert!(csv.starts_with("name,full_path,parent,ancestors,level,article_count,total_article_count"));
        assert!(csv.contains("Applications,IT > Applications,IT,IT,1,1,1"));
        assert_eq!(csv.lines().count(), 4);
    }

    fn with_broken_category() -> MockStore {
        let mut store = store();
        let broken = categorized("a4", "KB4", "bad_c4", "VPN");
        store.add_record(ARTICLE_TABLE, broken.clone());
        let mut listed = ["a1", "a2", "a3"]
            .iter()
            .map(|id| store.record(ARTICLE_TABLE, id).expect("record"))
            .collect::<Vec<_>>();
        listed.push(broken);
        store.add_query(ARTICLE_TABLE, LISTING, listed);
        store.fail_records_containing("bad");
        store
    }

    #[test]
    fn categories_survive_a_failing_category_lookup() {
        let store = with_broken_category();
        let forest = run_categories_with_store(&MigrateConfig::default(), None, &store).expect("forest");
        assert_eq!(forest.len(), 3);
        let stats = forest.stats();
        assert_eq!(stats.articles_with_category, 3);
        assert_eq!(stats.articles_without_category, 1);
    }

    #[test]
    fn export_survives_a_failing_category_lookup() {
        let temp = tempdir().expect("tempdir");
        let paths = paths(temp.path());
        let store = with_broken_category();

        let report = run_export_with_store(&paths, &MigrateConfig::default(), &options(), &store, None)
            .expect("export");
        assert!(report.success);
        assert_eq!(report.fetched, 4);

        let mut filtered = options();
        filtered.category = CategoryFilter {
            include: Some("it".to_string()),
            exclude: None,
        };
        let report = run_export_with_store(&paths, &MigrateConfig::default(), &filtered, &store, None)
            .expect("filtered export");
        assert_eq!(report.listed, 4);
        assert_eq!(report.after_category_filter, 3);
        assert_eq!(report.fetched, 3);
    }

    fn document_hashes(report: &ExportReport) -> Vec<(String, String)> {
        let path = report.report_path.as_ref().expect("report");
        let mut reader = csv::Reader::from_path(path).expect("open report");
        let headers = reader.headers().expect("headers").clone();
        let column = |name: &str| headers.iter().position(|header| header == name).expect("column");
        let (sys_id, sha) = (column("sys_id"), column("content_sha256"));
        let mut hashes = reader
            .records()
            .map(|row| {
                let row = row.expect("row");
                (row[sys_id].to_string(), row[sha].to_string())
            })
            .collect::<Vec<_>>();
        hashes.sort();
        hashes
    }

    #[test]
    fn repeated_export_produces_identical_documents() {
        let temp = tempdir().expect("tempdir");
        let paths = paths(temp.path());
        let mut store = store();
        store.add_record(
            ARTICLE_TABLE,
            categorized("a1", "KB1", "c2", "Applications")
                .with_text("text", "<p>ja</p><img src=\"/sys_attachment.do?sys_id=0123456789abcdef0123456789abcdef\">"),
        );
        store.add_record(ARTICLE_TABLE, categorized("e1", "KB9", "c2", "Applications").with_text("language", "en"));
        store.add_query(
            ARTICLE_TABLE,
            "parent=a1^ORtranslated_from=a1^workflow_state=published",
            vec![categorized("e1", "KB9", "c2", "Applications").with_text("language", "en")],
        );

        let first = run_export_with_store(&paths, &MigrateConfig::default(), &options(), &store, None)
            .expect("first export");
        let first_hashes = document_hashes(&first);
        let second = run_export_with_store(&paths, &MigrateConfig::default(), &options(), &store, None)
            .expect("second export");
        let second_hashes = document_hashes(&second);

        assert_eq!(first.documents, second.documents);
        assert_eq!(first_hashes.len(), 3);
        assert!(first_hashes.iter().all(|(_, sha)| sha.len() == 64));
        assert_eq!(first_hashes, second_hashes);
    }
}
