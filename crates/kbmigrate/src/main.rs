use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use kbmigrate_core::article_list::{ListFormat, ListOptions, ListReport, run_list};
use kbmigrate_core::config::{MigrateConfig, load_config};
use kbmigrate_core::fetch::CategoryFilter;
use kbmigrate_core::migrate::{
    CategoryFormat, ExportOptions, ExportReport, render_categories, run_article, run_categories,
    run_export,
};
use kbmigrate_core::runtime::{
    PathOverrides, ResolutionContext, ResolvedPaths, inspect_runtime, resolve_config_path,
    resolve_paths,
};

#[derive(Debug, Parser)]
#[command(
    name = "kbmigrate",
    version,
    about = "Export a ServiceNow knowledge base into link-consistent HTML bundles"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    output_dir: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[arg(long, default_value = "text", global = true)]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    config: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            config: cli.config.clone(),
            output_dir: cli.output_dir.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Export published articles into one or more archives")]
    Export(ExportArgs),
    #[command(about = "Export a single article and its translations")]
    Article(ArticleArgs),
    #[command(about = "Write article metadata for export planning, without downloading")]
    List(ListArgs),
    #[command(about = "Print the category hierarchy of published articles")]
    Categories(CategoriesArgs),
    #[command(about = "Print resolved configuration and paths")]
    Config,
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[arg(long, value_name = "QUERY", help = "Encoded query added to the article listing")]
    query: Option<String>,
    #[arg(long, value_name = "N", help = "Maximum articles after translation deduplication")]
    limit: Option<usize>,
    #[arg(short = 'c', long, value_name = "NAME", help = "Only categories whose path contains NAME")]
    category: Option<String>,
    #[arg(long, value_name = "NAME", help = "Skip articles with a category labelled NAME")]
    exclude_category: Option<String>,
    #[arg(long, value_name = "N")]
    workers: Option<usize>,
    #[arg(long, value_name = "MS")]
    rate_limit_ms: Option<u64>,
    #[arg(long, value_name = "N")]
    max_per_archive: Option<usize>,
    #[arg(long, help = "Leave iframes untouched")]
    no_embeds: bool,
    #[arg(long, help = "Write a plain directory instead of zip archives")]
    keep_directory: bool,
    #[arg(long, help = "Print the report as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct ArticleArgs {
    sys_id: String,
    #[arg(long, help = "Leave iframes untouched")]
    no_embeds: bool,
    #[arg(long, help = "Print the report as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long, value_name = "QUERY", help = "Encoded query added to the article listing")]
    query: Option<String>,
    #[arg(long, value_name = "N", help = "Maximum articles after translation deduplication")]
    limit: Option<usize>,
    #[arg(short = 'c', long, value_name = "NAME", help = "Only categories whose path contains NAME")]
    category: Option<String>,
    #[arg(long, value_name = "NAME", help = "Skip articles with a category labelled NAME")]
    exclude_category: Option<String>,
    #[arg(long, value_name = "DATE", help = "Only articles updated on or after DATE")]
    updated_after: Option<String>,
    #[arg(long, value_name = "DATE", help = "Only articles updated on or before DATE")]
    updated_before: Option<String>,
    #[arg(long, value_enum, default_value = "both")]
    format: ListOutput,
    #[arg(long, help = "Print the summary as JSON")]
    json: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ListOutput {
    Csv,
    Json,
    Both,
}

impl From<ListOutput> for ListFormat {
    fn from(value: ListOutput) -> Self {
        match value {
            ListOutput::Csv => Self::Csv,
            ListOutput::Json => Self::Json,
            ListOutput::Both => Self::Both,
        }
    }
}

#[derive(Debug, Args)]
struct CategoriesArgs {
    #[arg(long, value_name = "QUERY")]
    query: Option<String>,
    #[arg(long, value_enum, default_value = "tree")]
    format: CategoryOutput,
    #[arg(long, value_name = "PATH", help = "Write to a file instead of stdout")]
    output: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CategoryOutput {
    Tree,
    Json,
    Csv,
}

impl From<CategoryOutput> for CategoryFormat {
    fn from(value: CategoryOutput) -> Self {
        match value {
            CategoryOutput::Tree => Self::Tree,
            CategoryOutput::Json => Self::Json,
            CategoryOutput::Csv => Self::Csv,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Export(args)) => run_export_command(&runtime, args),
        Some(Commands::Article(args)) => run_article_command(&runtime, args),
        Some(Commands::List(args)) => run_list_command(&runtime, args),
        Some(Commands::Categories(args)) => run_categories_command(&runtime, args),
        Some(Commands::Config) => run_config_command(&runtime),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "kbmigrate=info,kbmigrate_core=info",
        1 => "kbmigrate=debug,kbmigrate_core=debug",
        _ => "kbmigrate=trace,kbmigrate_core=trace",
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

fn run_export_command(runtime: &RuntimeOptions, args: ExportArgs) -> Result<()> {
    let (paths, config) = resolve_runtime(runtime)?;
    let options = ExportOptions {
        query: args.query,
        limit: args.limit,
        category: CategoryFilter {
            include: args.category,
            exclude: args.exclude_category,
        },
        workers: args.workers,
        rate_limit_ms: args.rate_limit_ms,
        max_per_archive: args.max_per_archive,
        no_embeds: args.no_embeds,
        keep_directory: args.keep_directory,
    };
    let report = run_export(&paths, &config, &options)?;
    print_export_report("export", &report, args.json)?;
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_article_command(runtime: &RuntimeOptions, args: ArticleArgs) -> Result<()> {
    let (paths, config) = resolve_runtime(runtime)?;
    let options = ExportOptions {
        no_embeds: args.no_embeds,
        ..ExportOptions::default()
    };
    let report = run_article(&paths, &config, &args.sys_id, &options)?;
    print_export_report("article", &report, args.json)?;
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_list_command(runtime: &RuntimeOptions, args: ListArgs) -> Result<()> {
    let (paths, config) = resolve_runtime(runtime)?;
    let options = ListOptions {
        query: args.query,
        limit: args.limit,
        category: CategoryFilter {
            include: args.category,
            exclude: args.exclude_category,
        },
        updated_after: args.updated_after,
        updated_before: args.updated_before,
        format: args.format.into(),
    };
    let report = run_list(&paths, &config, &options)?;
    print_list_report(&report, args.json)?;
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn print_list_report(report: &ListReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    let summary = &report.summary;
    println!("list");
    println!("listed: {}", report.listed);
    println!("after_category_filter: {}", report.after_category_filter);
    println!("total_articles: {}", summary.total_articles);
    println!("articles_with_translations: {}", summary.articles_with_translations);
    println!("total_translations: {}", summary.total_translations);
    println!("unique_categories: {}", summary.unique_categories);
    for category in &summary.top_categories {
        println!("top_category: {} ({})", category.category, category.count);
    }
    for (language, count) in &summary.languages {
        println!("language: {language} ({count})");
    }
    for (state, count) in &summary.workflow_states {
        println!("workflow_state: {state} ({count})");
    }
    if let Some(path) = &report.csv_path {
        println!("csv: {}", normalize_path(path));
    }
    if let Some(path) = &report.json_path {
        println!("json: {}", normalize_path(path));
    }
    println!("request_count: {}", report.request_count);
    Ok(())
}

fn run_categories_command(runtime: &RuntimeOptions, args: CategoriesArgs) -> Result<()> {
    let (paths, config) = resolve_runtime(runtime)?;
    let forest = run_categories(&config, args.query.as_deref())?;
    let rendered = render_categories(&forest, args.format.into())?;

    match &args.output {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            fs::write(path, &rendered)
                .with_context(|| format!("failed to write {}", path.display()))?;
            let stats = forest.stats();
            println!("categories");
            println!("output: {}", normalize_path(path));
            println!("total_categories: {}", stats.total_categories);
            println!("max_depth: {}", stats.max_depth);
            println!("articles_with_category: {}", stats.articles_with_category);
            println!("articles_without_category: {}", stats.articles_without_category);
        }
        None => print!("{rendered}"),
    }
    for warning in forest.warnings() {
        eprintln!("warning: {warning}");
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_config_command(runtime: &RuntimeOptions) -> Result<()> {
    let (paths, config) = resolve_runtime(runtime)?;
    let status = inspect_runtime(&paths, &config);

    println!("resolved configuration");
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("config_exists: {}", format_flag(status.config_exists));
    println!("instance: {}", config.instance().as_deref().unwrap_or("<unset>"));
    println!("username: {}", config.username().as_deref().unwrap_or("<unset>"));
    println!(
        "password: {}",
        if config.password().is_some() { "<redacted>" } else { "<unset>" }
    );
    println!("page_size: {}", config.page_size());
    println!("timeout_ms: {}", config.timeout_ms());
    println!("max_retries: {}", config.max_retries());
    println!("output_dir: {}", normalize_path(&paths.output_dir));
    println!("output_dir_exists: {}", format_flag(status.output_dir_exists));
    println!("download_dir: {}", normalize_path(&paths.download_dir));
    println!("download_dir_exists: {}", format_flag(status.download_dir_exists));
    println!("cached_files: {}", status.cached_files);
    println!("cached_bytes: {}", status.cached_bytes);
    println!("document_dir: {}", normalize_path(&paths.document_dir));
    println!("workers: {}", config.workers());
    println!("rate_limit_ms: {}", config.rate_limit_ms());
    println!("max_per_archive: {}", config.max_per_archive());
    println!("root_folder: {}", config.root_folder());
    println!("archive_prefix: {}", config.archive_prefix());
    println!("process_embeds: {}", config.process_embeds());
    println!("keep_directory: {}", config.keep_directory());
    println!(
        "locales: {} > {} > others",
        config.primary_locale(),
        config.secondary_locale()
    );
    println!(
        "document_command: {}",
        if config.has_document_command() {
            config.documents.command.join(" ")
        } else {
            "<unset>".to_string()
        }
    );
    if !status.warnings.is_empty() {
        println!("warnings:");
        for warning in &status.warnings {
            println!("  - {warning}");
        }
    }
    println!("\n[diagnostics]\n{}", paths.diagnostics());
    Ok(())
}

fn print_export_report(label: &str, report: &ExportReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("{label}");
    println!("success: {}", format_flag(report.success));
    println!("listed: {}", report.listed);
    println!("after_category_filter: {}", report.after_category_filter);
    println!("planned: {}", report.planned);
    println!("fetched: {}", report.fetched);
    println!("documents: {}", report.documents);
    println!("attachments: {}", report.attachments);
    println!("request_count: {}", report.request_count);
    println!(
        "category_cache: {} cached, {} invalid",
        report.category_cache.cache_size, report.category_cache.invalid_categories
    );
    for archive in &report.archives {
        println!(
            "archive: {} ({} articles, {} documents, {} attachments)",
            normalize_path(&archive.path),
            archive.articles,
            archive.documents,
            archive.attachments
        );
    }
    if let Some(path) = &report.report_path {
        println!("report: {}", normalize_path(path));
    }
    if !report.special_handling.is_empty() {
        println!("special_handling:");
        for notice in &report.special_handling {
            println!("  - {}: {}", notice.number, notice.message);
        }
    }
    if !report.failures.is_empty() {
        println!("failures:");
        for failure in &report.failures {
            println!("  - {} ({}): {}", failure.number, failure.sys_id, failure.error);
        }
    }
    if !report.embed_failures.is_empty() {
        println!("embed_failures:");
        for failure in &report.embed_failures {
            println!(
                "  - {} {}: {}",
                failure.article_number, failure.url, failure.error
            );
        }
    }
    if !report.unresolved_links.is_empty() {
        println!("unresolved_links: {}", report.unresolved_links.len());
    }
    Ok(())
}

fn resolve_runtime(runtime: &RuntimeOptions) -> Result<(ResolvedPaths, MigrateConfig)> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        config: runtime.config.clone(),
        output_dir: runtime.output_dir.clone(),
    };
    let (config_path, _) = resolve_config_path(&context, &overrides);
    let config = load_config(&config_path)?;
    Ok((resolve_paths(&context, &overrides, &config), config))
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
