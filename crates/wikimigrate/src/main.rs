use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use wikimigrate_core::backoff::Pacer;
use wikimigrate_core::config::{MigrateConfig, load_config, resolve_config_path};
use wikimigrate_core::destination::BookStackClient;
use wikimigrate_core::maintenance::{
    EmptyChapterReport, OrphanOptions, OrphanReport, PurgeReport, delete_empty_chapters,
    delete_orphan_pages, purge_destination,
};
use wikimigrate_core::mapper::EntityStats;
use wikimigrate_core::model::EntityId;
use wikimigrate_core::session::DestinationSession;
use wikimigrate_core::source::ConfluenceClient;
use wikimigrate_core::sync::{PlanReport, SyncOptions, SyncReport, plan_tree, run_migration};

#[derive(Debug, Parser)]
#[command(
    name = "wikimigrate",
    version,
    about = "Migrate a Confluence space into a BookStack shelf"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(short, long, global = true, help = "Enable debug logging")]
    verbose: bool,
    #[arg(long, global = true, help = "Print reports as JSON")]
    json: bool,
    #[arg(long, global = true, help = "Print resolved configuration diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    config: Option<PathBuf>,
    json: bool,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            config: cli.config.clone(),
            json: cli.json,
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run one migration pass")]
    Migrate(MigrateArgs),
    #[command(about = "Fetch and classify the source tree without touching the destination")]
    Plan(PlanArgs),
    Cleanup(CleanupArgs),
    #[command(about = "Delete every page, chapter, shelf and book on the destination")]
    Purge(PurgeArgs),
}

#[derive(Debug, Args)]
struct MigrateArgs {
    #[arg(long, help = "Plan every write without performing it")]
    dry_run: bool,
    #[arg(long, help = "Rewrite pages that already exist instead of skipping them")]
    update_existing: bool,
    #[arg(long, value_name = "KEY", help = "Source space key")]
    space: Option<String>,
    #[arg(long, value_name = "NAME", help = "Destination shelf name")]
    shelf: Option<String>,
    #[arg(long, help = "Skip re-reading created pages to verify placement")]
    no_verify: bool,
    #[arg(long, help = "Do not create Introduction pages for container bodies")]
    no_intro_pages: bool,
}

#[derive(Debug, Args)]
struct PlanArgs {
    #[arg(long, value_name = "KEY", help = "Source space key")]
    space: Option<String>,
}

#[derive(Debug, Args)]
struct CleanupArgs {
    #[command(subcommand)]
    command: CleanupSubcommand,
}

#[derive(Debug, Subcommand)]
enum CleanupSubcommand {
    #[command(name = "empty-chapters", about = "Delete chapters that hold no pages")]
    EmptyChapters {
        #[arg(long, value_name = "ID")]
        book_id: Option<EntityId>,
        #[arg(long)]
        dry_run: bool,
    },
    #[command(name = "orphan-pages", about = "Delete pages whose body is effectively empty")]
    OrphanPages {
        #[arg(long, value_name = "NAME", help = "Only pages with exactly this name")]
        title: Option<String>,
        #[arg(long, value_name = "ID")]
        book_id: Option<EntityId>,
        #[arg(long, value_name = "ID")]
        page_id: Option<EntityId>,
        #[arg(long, default_value_t = 10)]
        min_text_length: usize,
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Debug, Args)]
struct PurgeArgs {
    #[arg(long)]
    dry_run: bool,
    #[arg(long, help = "Confirm the purge")]
    yes: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let runtime = RuntimeOptions::from_cli(&cli);
    match cli.command {
        Some(Commands::Migrate(args)) => run_migrate(&runtime, args),
        Some(Commands::Plan(args)) => run_plan(&runtime, args),
        Some(Commands::Cleanup(CleanupArgs { command })) => match command {
            CleanupSubcommand::EmptyChapters { book_id, dry_run } => {
                run_empty_chapters(&runtime, book_id, dry_run)
            }
            CleanupSubcommand::OrphanPages {
                title,
                book_id,
                page_id,
                min_text_length,
                dry_run,
            } => run_orphan_pages(
                &runtime,
                OrphanOptions {
                    title,
                    book_id,
                    page_id,
                    min_text_length,
                },
                dry_run,
            ),
        },
        Some(Commands::Purge(args)) => run_purge(&runtime, args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn load_runtime_config(runtime: &RuntimeOptions) -> Result<(PathBuf, MigrateConfig)> {
    let root = env::current_dir().context("failed to resolve working directory")?;
    let path = resolve_config_path(runtime.config.as_deref(), &root);
    let mut config = load_config(&path)?;
    config.apply_env_overrides();
    debug!(
        config = normalize_path(&path).as_str(),
        exists = path.exists(),
        "loaded configuration"
    );
    Ok((path, config))
}

fn run_migrate(runtime: &RuntimeOptions, args: MigrateArgs) -> Result<()> {
    let (path, mut config) = load_runtime_config(runtime)?;
    if let Some(space) = args.space {
        config.source.space_key = Some(space);
    }
    if let Some(shelf) = args.shelf {
        config.destination.shelf_name = Some(shelf);
    }
    if args.update_existing {
        config.sync.skip_existing = Some(false);
    }
    if args.no_verify {
        config.sync.verify_assignments = Some(false);
    }
    if args.no_intro_pages {
        config.sync.intro_pages = Some(false);
    }

    let source_settings = config.validate_source()?;
    let destination_settings = config.validate_destination()?;
    if runtime.diagnostics {
        print_diagnostics(&path, &config);
    }

    let options = SyncOptions::from_config(&config, &source_settings.space_key, args.dry_run);
    let mut source = ConfluenceClient::new(source_settings)?;
    let mut destination = BookStackClient::new(destination_settings)?;
    let mut pacer = Pacer::new(config.backoff_policy());
    let report = run_migration(&mut source, &mut destination, &mut pacer, &options)?;

    if runtime.json {
        print_json(&report)?;
    } else {
        print_sync_report(&report);
    }
    if !report.success {
        bail!("migration finished with {} error(s)", report.error_count());
    }
    Ok(())
}

fn run_plan(runtime: &RuntimeOptions, args: PlanArgs) -> Result<()> {
    let (path, mut config) = load_runtime_config(runtime)?;
    if let Some(space) = args.space {
        config.source.space_key = Some(space);
    }
    let source_settings = config.validate_source()?;
    if runtime.diagnostics {
        print_diagnostics(&path, &config);
    }

    let options = SyncOptions::from_config(&config, &source_settings.space_key, true);
    let mut source = ConfluenceClient::new(source_settings)?;
    let report = plan_tree(&mut source, &options)?;
    if runtime.json {
        return print_json(&report);
    }
    print_plan_report(&report);
    Ok(())
}

fn run_empty_chapters(
    runtime: &RuntimeOptions,
    book_id: Option<EntityId>,
    dry_run: bool,
) -> Result<()> {
    let report = with_destination(runtime, dry_run, |session| {
        delete_empty_chapters(session, book_id)
    })?;
    if runtime.json {
        return print_json(&report);
    }
    print_empty_chapter_report(&report);
    Ok(())
}

fn run_orphan_pages(runtime: &RuntimeOptions, options: OrphanOptions, dry_run: bool) -> Result<()> {
    let report = with_destination(runtime, dry_run, |session| {
        delete_orphan_pages(session, &options)
    })?;
    if runtime.json {
        return print_json(&report);
    }
    print_orphan_report(&report);
    Ok(())
}

fn run_purge(runtime: &RuntimeOptions, args: PurgeArgs) -> Result<()> {
    if !args.yes && !args.dry_run {
        bail!("purge deletes all destination content; pass --yes to confirm or --dry-run to preview");
    }
    let report = with_destination(runtime, args.dry_run, |session| purge_destination(session))?;
    if runtime.json {
        return print_json(&report);
    }
    print_purge_report(&report);
    Ok(())
}

fn with_destination<T, F>(runtime: &RuntimeOptions, dry_run: bool, operation: F) -> Result<T>
where
    F: FnOnce(&mut DestinationSession<'_, BookStackClient>) -> Result<T>,
{
    let (path, config) = load_runtime_config(runtime)?;
    let settings = config.validate_destination()?;
    if runtime.diagnostics {
        print_diagnostics(&path, &config);
    }
    let mut client = BookStackClient::new(settings)?;
    let mut pacer = Pacer::new(config.backoff_policy());
    let mut session = DestinationSession::new(&mut client, &mut pacer, dry_run);
    operation(&mut session)
}

fn print_json<T: Serialize>(report: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

fn print_stats(label: &str, stats: &EntityStats) {
    println!(
        "{label}: processed={} created={} reused={} updated={} skipped={} errors={}",
        stats.processed, stats.created, stats.reused, stats.updated, stats.skipped, stats.errors
    );
}

fn print_sync_report(report: &SyncReport) {
    println!("migration");
    println!("space_key: {}", report.space_key);
    println!("dry_run: {}", report.dry_run);
    println!(
        "phases: {}",
        report
            .phases
            .iter()
            .map(|phase| phase.as_str())
            .collect::<Vec<_>>()
            .join(" -> ")
    );
    println!(
        "tree: nodes={} book_roots={} chapters={} leaves={} phantoms={} max_depth={}",
        report.tree.total,
        report.tree.book_roots,
        report.tree.chapters,
        report.tree.leaves,
        report.tree.phantoms,
        report.tree.max_depth
    );
    print_stats("books", &report.books);
    print_stats("chapters", &report.chapters);
    print_stats("pages", &report.pages);
    print_stats("intro_pages", &report.intro_pages);
    println!("owner_failures: {}", report.owner_failures);
    println!("verify_mismatches: {}", report.verify_mismatches);
    println!(
        "fallback_book: {}",
        report
            .fallback_book
            .map(|id| id.to_string())
            .unwrap_or_else(|| "<none>".to_string())
    );
    match &report.shelf {
        Some(shelf) => println!(
            "shelf: {} (id {}) books={} created={} updates={}",
            shelf.name,
            shelf.id,
            shelf.books.len(),
            shelf.created,
            shelf.updates
        ),
        None => println!("shelf: <none>"),
    }
    println!("merges: {}", report.merges.len());
    for merge in &report.merges {
        println!(
            "  - {}: survivor={} deleted={:?} chapters_copied={} pages_copied={} errors={}",
            merge.name,
            merge.survivor,
            merge.deleted,
            merge.chapters_copied,
            merge.pages_copied,
            merge.errors
        );
    }
    println!("source_requests: {}", report.source_request_count);
    println!("destination_requests: {}", report.destination_request_count);
    println!("rate_limit_events: {}", report.rate_limit_events);
    println!("retries: {}", report.retries);
    println!("slept_ms: {}", report.slept_ms);
    println!("errors: {}", report.error_count());
    if !report.node_errors.is_empty() || !report.phase_errors.is_empty() {
        println!("error_details:");
        for node_error in &report.node_errors {
            println!(
                "  - {} {} ({}): {}",
                node_error.role.as_str(),
                node_error.title,
                node_error.source_id,
                node_error.message
            );
        }
        for phase_error in &report.phase_errors {
            println!("  - {phase_error}");
        }
    }
    if report.dry_run {
        println!("planned_writes: {}", report.planned_writes.len());
        for write in &report.planned_writes {
            println!(
                "  - {:?} {} {} {}",
                write.action,
                write.kind.as_str(),
                write.id,
                write.name
            );
        }
    }
}

fn print_plan_report(report: &PlanReport) {
    println!("plan");
    println!("space_key: {}", report.space_key);
    println!("scope_book: {}", report.scope_book_name);
    println!(
        "tree: nodes={} book_roots={} chapters={} leaves={} phantoms={}",
        report.tree.total,
        report.tree.book_roots,
        report.tree.chapters,
        report.tree.leaves,
        report.tree.phantoms
    );
    println!("source_requests: {}", report.request_count);
    for node in &report.nodes {
        println!(
            "{}{} [{}{}] -> {}",
            "  ".repeat(node.depth),
            node.title,
            node.role.as_str(),
            if node.phantom { ", phantom" } else { "" },
            node.book.as_deref().unwrap_or(report.scope_book_name.as_str())
        );
    }
}

fn print_empty_chapter_report(report: &EmptyChapterReport) {
    println!("cleanup empty-chapters");
    println!("dry_run: {}", report.dry_run);
    println!("found: {}", report.found);
    println!("deleted: {}", report.deleted);
    println!("errors: {}", report.errors);
    for chapter in &report.chapters {
        println!("  - {} (id {}, book {})", chapter.name, chapter.id, chapter.book_id);
    }
}

fn print_orphan_report(report: &OrphanReport) {
    println!("cleanup orphan-pages");
    println!("dry_run: {}", report.dry_run);
    println!("scanned: {}", report.scanned);
    println!("candidates: {}", report.candidates);
    println!("skipped: {}", report.skipped);
    println!("deleted: {}", report.deleted);
    println!("errors: {}", report.errors);
    for page in &report.pages {
        println!("  - {} (id {}, book {})", page.name, page.id, page.book_id);
    }
}

fn print_purge_report(report: &PurgeReport) {
    println!("purge");
    println!("dry_run: {}", report.dry_run);
    println!("pages: {}", report.pages);
    println!("chapters: {}", report.chapters);
    println!("shelves: {}", report.shelves);
    println!("books: {}", report.books);
    println!("errors: {}", report.errors);
}

fn print_diagnostics(path: &Path, config: &MigrateConfig) {
    println!("[diagnostics]");
    println!("config_path: {}", normalize_path(path));
    println!("config_exists: {}", path.exists());
    println!(
        "source_host: {}",
        config.source.host.as_deref().unwrap_or("<unset>")
    );
    println!(
        "space_key: {}",
        config.source.space_key.as_deref().unwrap_or("<unset>")
    );
    println!(
        "destination_host: {}",
        config.destination.host.as_deref().unwrap_or("<unset>")
    );
    println!(
        "shelf: {}",
        config.destination.shelf_name.as_deref().unwrap_or("<unset>")
    );
    println!("skip_existing: {}", config.skip_existing());
    println!("verify_assignments: {}", config.verify_assignments());
    println!("intro_pages: {}", config.intro_pages());
    println!("scope_book: {}", config.scope_book_name());
    println!("backoff: {:?}", config.backoff_policy());
    println!("identity_overrides: {}", config.identities.len());
    println!("secrets: {:?}", config.secrets);
    println!();
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
