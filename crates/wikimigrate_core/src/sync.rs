use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::backoff::Pacer;
use crate::classify::{SourceTree, TreeStats, classify};
use crate::config::MigrateConfig;
use crate::destination::DestinationApi;
use crate::mapper::{EntityMapper, EntityStats, MapperOptions, NodeError};
use crate::model::{EntityId, Role, Shelf, is_placeholder};
use crate::reconcile::{MergeReport, reconcile_books};
use crate::session::{DestinationSession, PlannedWrite};
use crate::source::{SourceApi, fetch_source_nodes};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Fetch,
    ClassifyBooks,
    CreateBooks,
    ReconcileBooksPass1,
    AttachShelf,
    ReconcileBooksPass2,
    MapContainers,
    MapLeaves,
    Summarize,
}

impl SyncPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::ClassifyBooks => "classify_books",
            Self::CreateBooks => "create_books",
            Self::ReconcileBooksPass1 => "reconcile_books_pass1",
            Self::AttachShelf => "attach_shelf",
            Self::ReconcileBooksPass2 => "reconcile_books_pass2",
            Self::MapContainers => "map_containers",
            Self::MapLeaves => "map_leaves",
            Self::Summarize => "summarize",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub space_key: String,
    pub dry_run: bool,
    pub shelf_name: Option<String>,
    pub shelf_id: Option<EntityId>,
    pub mapper: MapperOptions,
}

impl SyncOptions {
    pub fn from_config(config: &MigrateConfig, space_key: &str, dry_run: bool) -> Self {
        Self {
            space_key: space_key.to_string(),
            dry_run,
            shelf_name: config
                .destination
                .shelf_name
                .clone()
                .filter(|name| !name.trim().is_empty()),
            shelf_id: config.destination.shelf_id,
            mapper: MapperOptions {
                skip_existing: config.skip_existing(),
                verify_assignments: config.verify_assignments(),
                intro_pages: config.intro_pages(),
                scope_book_name: config.scope_book_name(),
                identities: config.identities.clone(),
                default_owner_id: config.destination.default_owner_id,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShelfReport {
    pub id: EntityId,
    pub name: String,
    pub created: bool,
    pub updates: usize,
    pub books: Vec<EntityId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub success: bool,
    pub dry_run: bool,
    pub space_key: String,
    pub phases: Vec<SyncPhase>,
    pub tree: TreeStats,
    pub books: EntityStats,
    pub chapters: EntityStats,
    pub pages: EntityStats,
    pub intro_pages: EntityStats,
    pub owner_failures: usize,
    pub verify_mismatches: usize,
    pub merges: Vec<MergeReport>,
    pub shelf: Option<ShelfReport>,
    pub fallback_book: Option<EntityId>,
    pub node_errors: Vec<NodeError>,
    pub phase_errors: Vec<String>,
    pub mapped_nodes: usize,
    pub source_request_count: usize,
    pub destination_request_count: usize,
    pub rate_limit_events: usize,
    pub retries: usize,
    pub slept_ms: u128,
    pub planned_writes: Vec<PlannedWrite>,
}

impl SyncReport {
    pub fn error_count(&self) -> usize {
        self.books.errors
            + self.chapters.errors
            + self.pages.errors
            + self.intro_pages.errors
            + self.merges.iter().map(|merge| merge.errors).sum::<usize>()
            + self.phase_errors.len()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedNode {
    pub id: String,
    pub title: String,
    pub depth: usize,
    pub role: Role,
    pub phantom: bool,
    /// Title of the book the node lands in; `None` means the scope book.
    pub book: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    pub space_key: String,
    pub scope_book_name: String,
    pub tree: TreeStats,
    pub nodes: Vec<PlannedNode>,
    pub request_count: usize,
}

fn enter(phases: &mut Vec<SyncPhase>, phase: SyncPhase) {
    info!(phase = phase.as_str(), "entering phase");
    phases.push(phase);
}

/// Fetch and classify only; nothing touches the destination.
pub fn plan_tree<S: SourceApi>(source: &mut S, options: &SyncOptions) -> Result<PlanReport> {
    let tree = classify(fetch_source_nodes(source, &options.space_key)?);
    let nodes = tree
        .nodes()
        .iter()
        .map(|item| PlannedNode {
            id: item.id().to_string(),
            title: item.title().to_string(),
            depth: item.depth(),
            role: item.role,
            phantom: item.phantom,
            book: if item.role == Role::BookRoot {
                Some(item.title().to_string())
            } else {
                tree.nearest_book_root(item)
                    .map(|root| root.title().to_string())
            },
        })
        .collect();
    Ok(PlanReport {
        space_key: options.space_key.clone(),
        scope_book_name: options.mapper.scope_book_name.clone(),
        tree: tree.stats(),
        nodes,
        request_count: source.request_count(),
    })
}

/// One full migration pass. Only fetch-phase failures return `Err`; every
/// later failure is counted in the report.
pub fn run_migration<S: SourceApi, A: DestinationApi>(
    source: &mut S,
    destination: &mut A,
    pacer: &mut Pacer,
    options: &SyncOptions,
) -> Result<SyncReport> {
    let mut phases = Vec::new();
    let mut session = DestinationSession::new(destination, pacer, options.dry_run);
    session.reset();

    enter(&mut phases, SyncPhase::Fetch);
    let fetched = fetch_source_nodes(source, &options.space_key)
        .and_then(|nodes| session.books().map(|_| nodes));
    let nodes = match fetched {
        Ok(nodes) => nodes,
        Err(fetch_error) => {
            enter(&mut phases, SyncPhase::Summarize);
            error!(error = %format!("{fetch_error:#}"), "fetch failed, nothing was written");
            return Err(fetch_error.context("migration aborted in fetch phase"));
        }
    };

    enter(&mut phases, SyncPhase::ClassifyBooks);
    let tree = classify(nodes);
    let tree_stats = tree.stats();
    info!(
        nodes = tree_stats.total,
        book_roots = tree_stats.book_roots,
        chapters = tree_stats.chapters,
        leaves = tree_stats.leaves,
        phantoms = tree_stats.phantoms,
        "classified source tree"
    );

    let mut mapper = EntityMapper::new(options.mapper.clone());
    let mut phase_errors = Vec::new();
    let mut merges = Vec::new();
    let mut redirects = BTreeMap::new();

    enter(&mut phases, SyncPhase::CreateBooks);
    for item in tree.with_role(Role::BookRoot) {
        mapper.map_node(&mut session, item);
    }
    if needs_scope_book(&tree)
        && let Err(scope_error) = mapper.ensure_fallback_book(&mut session)
    {
        record_phase_error(&mut phase_errors, SyncPhase::CreateBooks, &scope_error);
    }
    let names = scanned_names(&tree, &mapper);

    enter(&mut phases, SyncPhase::ReconcileBooksPass1);
    reconcile_pass(
        &mut session,
        &mut mapper,
        &names,
        false,
        SyncPhase::ReconcileBooksPass1,
        &mut merges,
        &mut redirects,
        &mut phase_errors,
    );

    enter(&mut phases, SyncPhase::AttachShelf);
    let mut shelf = None;
    update_shelf(
        &mut session,
        options,
        &mut shelf,
        &mapper.mapped_book_ids(),
        &redirects,
        &mut phase_errors,
    );

    enter(&mut phases, SyncPhase::ReconcileBooksPass2);
    let merged = reconcile_pass(
        &mut session,
        &mut mapper,
        &names,
        true,
        SyncPhase::ReconcileBooksPass2,
        &mut merges,
        &mut redirects,
        &mut phase_errors,
    );
    if merged {
        update_shelf(
            &mut session,
            options,
            &mut shelf,
            &mapper.mapped_book_ids(),
            &redirects,
            &mut phase_errors,
        );
    }

    enter(&mut phases, SyncPhase::MapContainers);
    for item in tree.nodes() {
        match item.role {
            Role::BookRoot => mapper.map_intro(&mut session, &tree, item),
            Role::Chapter => {
                if mapper.map_node(&mut session, item).is_some() {
                    mapper.map_intro(&mut session, &tree, item);
                }
            }
            Role::Leaf => {}
        }
    }

    enter(&mut phases, SyncPhase::MapLeaves);
    for item in tree.with_role(Role::Leaf) {
        mapper.map_node(&mut session, item);
    }
    // A scope book created this late still needs shelf membership.
    let mapped_books = mapper.mapped_book_ids();
    if shelf
        .as_ref()
        .is_some_and(|known| !mapped_books.iter().all(|id| known.books.contains(id)))
    {
        update_shelf(
            &mut session,
            options,
            &mut shelf,
            &mapped_books,
            &redirects,
            &mut phase_errors,
        );
    }

    enter(&mut phases, SyncPhase::Summarize);
    let fallback_book = mapper.fallback_book();
    let (identity, stats, node_errors) = mapper.into_parts();
    let pacer = session.pacer();
    let mut report = SyncReport {
        success: true,
        dry_run: options.dry_run,
        space_key: options.space_key.clone(),
        phases,
        tree: tree_stats,
        books: stats.books,
        chapters: stats.chapters,
        pages: stats.pages,
        intro_pages: stats.intro_pages,
        owner_failures: stats.owner_failures,
        verify_mismatches: stats.verify_mismatches,
        merges,
        shelf,
        fallback_book,
        node_errors,
        phase_errors,
        mapped_nodes: identity.len(),
        source_request_count: source.request_count(),
        destination_request_count: session.request_count(),
        rate_limit_events: pacer.rate_limit_events(),
        retries: pacer.retries(),
        slept_ms: pacer.total_slept().as_millis(),
        planned_writes: Vec::new(),
    };
    report.planned_writes = session.take_planned_writes();
    report.success = report.error_count() == 0;

    info!(
        dry_run = report.dry_run,
        books_created = report.books.created,
        chapters_created = report.chapters.created,
        pages_created = report.pages.created,
        pages_updated = report.pages.updated,
        pages_skipped = report.pages.skipped,
        merges = report.merges.len(),
        errors = report.error_count(),
        "migration finished"
    );
    Ok(report)
}

/// Depth-0 leaves have no book ancestor at all.
fn needs_scope_book(tree: &SourceTree) -> bool {
    tree.nodes()
        .iter()
        .any(|item| item.role != Role::BookRoot && tree.nearest_book_root(item).is_none())
}

fn scanned_names(tree: &SourceTree, mapper: &EntityMapper) -> BTreeSet<String> {
    let mut names: BTreeSet<String> = tree
        .with_role(Role::BookRoot)
        .map(|item| item.title().to_string())
        .collect();
    if mapper.fallback_book().is_some() {
        names.insert(mapper.scope_book_name().to_string());
    }
    names
}

/// Returns whether any book was merged away.
#[allow(clippy::too_many_arguments)]
fn reconcile_pass<A: DestinationApi>(
    session: &mut DestinationSession<'_, A>,
    mapper: &mut EntityMapper,
    names: &BTreeSet<String>,
    refresh: bool,
    phase: SyncPhase,
    merges: &mut Vec<MergeReport>,
    redirects: &mut BTreeMap<EntityId, EntityId>,
    phase_errors: &mut Vec<String>,
) -> bool {
    match reconcile_books(session, names, mapper.identity_mut(), refresh) {
        Ok(outcome) => {
            mapper.apply_book_redirects(&outcome.redirects);
            // earlier redirects may point at a book merged away just now
            for survivor in redirects.values_mut() {
                if let Some(next) = outcome.redirects.get(survivor) {
                    *survivor = *next;
                }
            }
            let merged = !outcome.redirects.is_empty();
            redirects.extend(outcome.redirects);
            merges.extend(outcome.merges);
            merged
        }
        Err(pass_error) => {
            record_phase_error(phase_errors, phase, &pass_error);
            false
        }
    }
}

fn update_shelf<A: DestinationApi>(
    session: &mut DestinationSession<'_, A>,
    options: &SyncOptions,
    shelf: &mut Option<ShelfReport>,
    books: &BTreeSet<EntityId>,
    redirects: &BTreeMap<EntityId, EntityId>,
    phase_errors: &mut Vec<String>,
) {
    match attach_shelf(session, options, shelf.as_ref(), books, redirects) {
        Ok(Some(attached)) => *shelf = Some(attached),
        Ok(None) => {}
        Err(shelf_error) => {
            record_phase_error(phase_errors, SyncPhase::AttachShelf, &shelf_error)
        }
    }
}

/// Ensure every mapped book sits on the configured shelf. Existing members
/// are kept; merged-away members are replaced by their survivor.
fn attach_shelf<A: DestinationApi>(
    session: &mut DestinationSession<'_, A>,
    options: &SyncOptions,
    known: Option<&ShelfReport>,
    books: &BTreeSet<EntityId>,
    redirects: &BTreeMap<EntityId, EntityId>,
) -> Result<Option<ShelfReport>> {
    let wanted: Vec<EntityId> = books.iter().copied().collect();
    let (shelf, created, updates) = match known {
        Some(known) if is_placeholder(known.id) => (
            Shelf {
                id: known.id,
                name: known.name.clone(),
                books: known.books.clone(),
            },
            known.created,
            known.updates,
        ),
        Some(known) => (session.get_shelf(known.id)?, known.created, known.updates),
        None => match (options.shelf_id, options.shelf_name.as_deref()) {
            (Some(id), _) => (session.get_shelf(id)?, false, 0),
            (None, Some(name)) => {
                let existing = session
                    .shelves()?
                    .into_iter()
                    .filter(|shelf| shelf.name == name)
                    .min_by_key(|shelf| shelf.id);
                match existing {
                    Some(found) => (session.get_shelf(found.id)?, false, 0),
                    None => (session.create_shelf(name, &wanted)?, true, 0),
                }
            }
            (None, None) => return Ok(None),
        },
    };

    let mut members: Vec<EntityId> = Vec::with_capacity(shelf.books.len() + wanted.len());
    for id in shelf
        .books
        .iter()
        .map(|id| redirects.get(id).copied().unwrap_or(*id))
        .chain(wanted)
    {
        if !members.contains(&id) {
            members.push(id);
        }
    }

    let mut updates = updates;
    if members != shelf.books {
        session.set_shelf_books(&shelf, &members)?;
        updates += 1;
    }
    info!(
        shelf_id = shelf.id,
        name = shelf.name.as_str(),
        books = members.len(),
        created,
        "shelf membership ensured"
    );
    Ok(Some(ShelfReport {
        id: shelf.id,
        name: shelf.name,
        created,
        updates,
        books: members,
    }))
}

fn record_phase_error(phase_errors: &mut Vec<String>, phase: SyncPhase, error: &anyhow::Error) {
    let message = format!("{}: {error:#}", phase.as_str());
    warn!(
        phase = phase.as_str(),
        error = message.as_str(),
        "phase step failed, continuing"
    );
    phase_errors.push(message);
}
