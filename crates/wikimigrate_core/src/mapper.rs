use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::classify::SourceTree;
use crate::content::{DEFAULT_MIN_TEXT_LENGTH, is_html_effectively_empty};
use crate::destination::DestinationApi;
use crate::identity::OwnerResolver;
use crate::model::{
    BookDraft, ChapterDraft, ClassifiedNode, EntityId, EntityKind, EntityRef, IdentityMap,
    PageDraft, Role, is_placeholder,
};
use crate::session::DestinationSession;
use crate::transcode::transcode;

pub const INTRODUCTION_PAGE_NAME: &str = "Introduction";

#[derive(Debug, Clone, Default)]
pub struct MapperOptions {
    pub skip_existing: bool,
    pub verify_assignments: bool,
    pub intro_pages: bool,
    pub scope_book_name: String,
    pub identities: BTreeMap<String, EntityId>,
    pub default_owner_id: Option<EntityId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MapOutcome {
    Created,
    Reused,
    Updated,
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EntityStats {
    pub processed: usize,
    pub created: usize,
    pub reused: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl EntityStats {
    pub fn record(&mut self, outcome: MapOutcome) {
        self.processed += 1;
        match outcome {
            MapOutcome::Created => self.created += 1,
            MapOutcome::Reused => self.reused += 1,
            MapOutcome::Updated => self.updated += 1,
            MapOutcome::Skipped => self.skipped += 1,
        }
    }

    pub fn record_error(&mut self) {
        self.processed += 1;
        self.errors += 1;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MappingStats {
    pub books: EntityStats,
    pub chapters: EntityStats,
    pub pages: EntityStats,
    pub intro_pages: EntityStats,
    pub owner_failures: usize,
    pub verify_mismatches: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeError {
    pub source_id: String,
    pub title: String,
    pub role: Role,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Location {
    book_id: EntityId,
    chapter_id: Option<EntityId>,
    /// A nearer ancestor failed to map, so the page sits further out than
    /// on a clean run.
    degraded: bool,
}

impl Location {
    fn book(book_id: EntityId) -> Self {
        Self {
            book_id,
            chapter_id: None,
            degraded: false,
        }
    }

    fn chapter(book_id: EntityId, chapter_id: EntityId) -> Self {
        Self {
            book_id,
            chapter_id: Some(chapter_id),
            degraded: false,
        }
    }
}

/// Finds or creates the destination entity for each classified node and
/// records it in the run's [`IdentityMap`]. Nodes must be fed ancestors
/// first.
pub struct EntityMapper {
    options: MapperOptions,
    identity: IdentityMap,
    owners: Option<OwnerResolver>,
    /// chapter id -> source id that claimed it this run
    claimed_chapters: HashMap<EntityId, String>,
    chapter_books: HashMap<EntityId, EntityId>,
    /// Introduction pages written or reused this run; leaves never match them.
    intro_pages: BTreeSet<EntityId>,
    fallback_book: Option<EntityId>,
    stats: MappingStats,
    errors: Vec<NodeError>,
}

impl EntityMapper {
    pub fn new(options: MapperOptions) -> Self {
        Self {
            options,
            identity: IdentityMap::new(),
            owners: None,
            claimed_chapters: HashMap::new(),
            chapter_books: HashMap::new(),
            intro_pages: BTreeSet::new(),
            fallback_book: None,
            stats: MappingStats::default(),
            errors: Vec::new(),
        }
    }

    pub fn identity(&self) -> &IdentityMap {
        &self.identity
    }

    pub fn identity_mut(&mut self) -> &mut IdentityMap {
        &mut self.identity
    }

    pub fn stats(&self) -> &MappingStats {
        &self.stats
    }

    pub fn errors(&self) -> &[NodeError] {
        &self.errors
    }

    pub fn fallback_book(&self) -> Option<EntityId> {
        self.fallback_book
    }

    pub fn scope_book_name(&self) -> &str {
        &self.options.scope_book_name
    }

    pub fn into_parts(self) -> (IdentityMap, MappingStats, Vec<NodeError>) {
        (self.identity, self.stats, self.errors)
    }

    /// Every book this run maps onto, fallback included.
    pub fn mapped_book_ids(&self) -> BTreeSet<EntityId> {
        let mut ids: BTreeSet<EntityId> = self
            .identity
            .iter()
            .filter(|(_, target)| target.kind == EntityKind::Book)
            .map(|(_, target)| target.id)
            .collect();
        ids.extend(self.fallback_book);
        ids
    }

    /// Follow book merges (loser -> survivor) outside the identity map.
    pub fn apply_book_redirects(&mut self, redirects: &BTreeMap<EntityId, EntityId>) {
        if let Some(fallback) = self.fallback_book
            && let Some(survivor) = redirects.get(&fallback)
        {
            self.fallback_book = Some(*survivor);
        }
        for book_id in self.chapter_books.values_mut() {
            if let Some(survivor) = redirects.get(book_id) {
                *book_id = *survivor;
            }
        }
    }

    /// Map one node by role. Failures are logged and counted; the node stays
    /// unmapped so its descendants resolve further out.
    pub fn map_node<A: DestinationApi>(
        &mut self,
        session: &mut DestinationSession<'_, A>,
        node: &ClassifiedNode,
    ) -> Option<EntityRef> {
        let result = match node.role {
            Role::BookRoot => self.map_book_root(session, node),
            Role::Chapter => self.map_chapter(session, node),
            Role::Leaf => self.map_leaf(session, node),
        };
        match result {
            Ok(target) => Some(target),
            Err(error) => {
                match node.role {
                    Role::BookRoot => self.stats.books.record_error(),
                    Role::Chapter => self.stats.chapters.record_error(),
                    Role::Leaf => self.stats.pages.record_error(),
                }
                self.record_failure(node, &error);
                None
            }
        }
    }

    fn map_book_root<A: DestinationApi>(
        &mut self,
        session: &mut DestinationSession<'_, A>,
        node: &ClassifiedNode,
    ) -> Result<EntityRef> {
        let candidates = session.books_named(node.title())?;
        let (book_id, outcome) = match candidates.first() {
            Some(existing) => {
                if candidates.len() > 1 {
                    debug!(
                        name = node.title(),
                        candidates = candidates.len(),
                        "duplicate books, using lowest id until reconciled"
                    );
                }
                (existing.id, MapOutcome::Reused)
            }
            None => {
                let book = session.create_book(&BookDraft {
                    name: node.title().to_string(),
                    description: String::new(),
                })?;
                let owner = self.owner_for(session, node);
                self.assert_owner(session, EntityKind::Book, book.id, owner);
                (book.id, MapOutcome::Created)
            }
        };
        let target = EntityRef::book(book_id);
        self.identity.insert(node.id(), target);
        self.stats.books.record(outcome);
        Ok(target)
    }

    fn map_chapter<A: DestinationApi>(
        &mut self,
        session: &mut DestinationSession<'_, A>,
        node: &ClassifiedNode,
    ) -> Result<EntityRef> {
        let book_id = self.resolve_book(session, node)?;
        let title = node.title();

        let mut name = title.to_string();
        let reuse = match self.find_chapter(session, book_id, &name)? {
            Some(existing) if self.is_claimed_by_other(existing, node.id()) => {
                name = disambiguated_name(node);
                debug!(
                    title,
                    name = name.as_str(),
                    "chapter name already claimed, disambiguating"
                );
                self.find_chapter(session, book_id, &name)?
                    .filter(|candidate| !self.is_claimed_by_other(*candidate, node.id()))
            }
            found => found,
        };

        let owner = self.owner_for(session, node);
        let (chapter_id, outcome) = match reuse {
            Some(existing) if self.options.skip_existing => (existing, MapOutcome::Reused),
            Some(existing) => {
                self.assert_owner(session, EntityKind::Chapter, existing, owner);
                (existing, MapOutcome::Updated)
            }
            None => {
                let chapter = session.create_chapter(&ChapterDraft {
                    book_id,
                    name,
                    description: String::new(),
                    owner_id: owner,
                })?;
                self.assert_owner(session, EntityKind::Chapter, chapter.id, owner);
                (chapter.id, MapOutcome::Created)
            }
        };

        self.claimed_chapters
            .insert(chapter_id, node.id().to_string());
        self.chapter_books.insert(chapter_id, book_id);
        let target = EntityRef::chapter(chapter_id);
        self.identity.insert(node.id(), target);
        self.stats.chapters.record(outcome);
        Ok(target)
    }

    fn map_leaf<A: DestinationApi>(
        &mut self,
        session: &mut DestinationSession<'_, A>,
        node: &ClassifiedNode,
    ) -> Result<EntityRef> {
        let location = self.resolve_location(session, node)?;
        let owner = self.owner_for(session, node);
        let draft = PageDraft {
            book_id: location.book_id,
            chapter_id: location.chapter_id,
            name: node.title().to_string(),
            html: Some(transcode(&node.node.body)),
            markdown: None,
            owner_id: owner,
        };
        let (page_id, outcome) = self.upsert_page(session, location, &draft, false)?;
        let target = EntityRef::page(page_id);
        self.identity.insert(node.id(), target);
        self.stats.pages.record(outcome);
        Ok(target)
    }

    /// Carry a container's own body into an "Introduction" page inside it.
    /// When a child page already carries that title the intro is prefixed
    /// with the container title instead.
    pub fn map_intro<A: DestinationApi>(
        &mut self,
        session: &mut DestinationSession<'_, A>,
        tree: &SourceTree,
        node: &ClassifiedNode,
    ) {
        if !self.options.intro_pages
            || node.phantom
            || node.role == Role::Leaf
            || is_html_effectively_empty(&node.node.body, DEFAULT_MIN_TEXT_LENGTH)
        {
            return;
        }
        let location = match self.identity.get(node.id()) {
            Some(EntityRef {
                kind: EntityKind::Book,
                id,
            }) => Location::book(id),
            Some(EntityRef {
                kind: EntityKind::Chapter,
                id,
            }) => match self.chapter_books.get(&id) {
                Some(book_id) => Location::chapter(*book_id, id),
                None => return,
            },
            _ => return,
        };

        let owner = self.owner_for(session, node);
        let draft = PageDraft {
            book_id: location.book_id,
            chapter_id: location.chapter_id,
            name: intro_page_name(tree, node),
            html: Some(transcode(&node.node.body)),
            markdown: None,
            owner_id: owner,
        };
        match self.upsert_page(session, location, &draft, true) {
            Ok((page_id, outcome)) => {
                self.intro_pages.insert(page_id);
                self.stats.intro_pages.record(outcome);
            }
            Err(error) => {
                self.stats.intro_pages.record_error();
                self.record_failure(node, &error);
            }
        }
    }

    /// Match by name in the target location; a degraded location also
    /// accepts a same-named page anywhere in the book, which is where a
    /// clean earlier run put it.
    fn upsert_page<A: DestinationApi>(
        &mut self,
        session: &mut DestinationSession<'_, A>,
        location: Location,
        draft: &PageDraft,
        intro: bool,
    ) -> Result<(EntityId, MapOutcome)> {
        let intro_pages = &self.intro_pages;
        let pages = session.pages(location.book_id)?;
        let mut candidates = pages
            .iter()
            .filter(|page| page.name == draft.name && (intro || !intro_pages.contains(&page.id)));
        let exact = candidates
            .clone()
            .find(|page| page.chapter_id == location.chapter_id);
        let existing = match exact {
            Some(page) => Some((page.id, page.chapter_id)),
            None if location.degraded => candidates
                .next()
                .map(|page| (page.id, page.chapter_id)),
            None => None,
        };

        match existing {
            Some((page_id, _)) if self.options.skip_existing => {
                debug!(page_id, name = draft.name.as_str(), "page exists, skipping");
                Ok((page_id, MapOutcome::Skipped))
            }
            Some((page_id, chapter_id)) => {
                // Leave a page found outside a degraded location where it is.
                let draft = PageDraft {
                    chapter_id,
                    ..draft.clone()
                };
                session.update_page(page_id, &draft)?;
                self.assert_owner(session, EntityKind::Page, page_id, draft.owner_id);
                info!(page_id, name = draft.name.as_str(), "updated page");
                Ok((page_id, MapOutcome::Updated))
            }
            None => {
                let page = session.place_page(draft)?;
                self.assert_owner(session, EntityKind::Page, page.id, draft.owner_id);
                self.verify_page(session, page.id, location);
                Ok((page.id, MapOutcome::Created))
            }
        }
    }

    fn verify_page<A: DestinationApi>(
        &mut self,
        session: &mut DestinationSession<'_, A>,
        page_id: EntityId,
        location: Location,
    ) {
        if !self.options.verify_assignments || session.is_dry_run() || is_placeholder(page_id) {
            return;
        }
        match session.get_page(page_id) {
            Ok(detail)
                if detail.book_id == location.book_id
                    && detail.chapter_id == location.chapter_id => {}
            Ok(detail) => {
                self.stats.verify_mismatches += 1;
                warn!(
                    page_id,
                    expected_book = location.book_id,
                    expected_chapter = ?location.chapter_id,
                    actual_book = detail.book_id,
                    actual_chapter = ?detail.chapter_id,
                    "page landed outside its expected location"
                );
            }
            Err(error) => warn!(page_id, error = %format!("{error:#}"), "could not verify page"),
        }
    }

    /// Nearest mapped ancestor wins: a chapter places the page inside it, a
    /// book places it at book level.
    fn resolve_location<A: DestinationApi>(
        &mut self,
        session: &mut DestinationSession<'_, A>,
        node: &ClassifiedNode,
    ) -> Result<Location> {
        let mut degraded = false;
        for ancestor in node.node.ancestors.iter().rev() {
            let location = match self.identity.get(&ancestor.id) {
                Some(EntityRef {
                    kind: EntityKind::Chapter,
                    id,
                }) => self
                    .chapter_books
                    .get(&id)
                    .map(|book_id| Location::chapter(*book_id, id)),
                Some(EntityRef {
                    kind: EntityKind::Book,
                    id,
                }) => Some(Location::book(id)),
                _ => None,
            };
            match location {
                Some(location) => return Ok(Location { degraded, ..location }),
                None => degraded = true,
            }
        }
        Ok(Location {
            degraded,
            ..Location::book(self.ensure_fallback_book(session)?)
        })
    }

    /// Chapters cannot nest, so only mapped book ancestors count.
    fn resolve_book<A: DestinationApi>(
        &mut self,
        session: &mut DestinationSession<'_, A>,
        node: &ClassifiedNode,
    ) -> Result<EntityId> {
        let book = node
            .node
            .ancestors
            .iter()
            .rev()
            .find_map(|ancestor| self.identity.book_id(&ancestor.id));
        match book {
            Some(book_id) => Ok(book_id),
            None => self.ensure_fallback_book(session),
        }
    }

    /// Book for nodes with no resolvable book ancestor; created on first use.
    pub fn ensure_fallback_book<A: DestinationApi>(
        &mut self,
        session: &mut DestinationSession<'_, A>,
    ) -> Result<EntityId> {
        if let Some(book_id) = self.fallback_book {
            return Ok(book_id);
        }
        let name = self.options.scope_book_name.clone();
        let book_id = match session.books_named(&name)?.first() {
            Some(existing) => {
                self.stats.books.record(MapOutcome::Reused);
                existing.id
            }
            None => {
                let book = session.create_book(&BookDraft {
                    name: name.clone(),
                    description: String::new(),
                })?;
                self.stats.books.record(MapOutcome::Created);
                book.id
            }
        };
        info!(book_id, name = name.as_str(), "using scope fallback book");
        self.fallback_book = Some(book_id);
        Ok(book_id)
    }

    fn find_chapter<A: DestinationApi>(
        &self,
        session: &mut DestinationSession<'_, A>,
        book_id: EntityId,
        name: &str,
    ) -> Result<Option<EntityId>> {
        let wanted = name.to_lowercase();
        let chapters = session.chapters(book_id)?;
        // Prefer an unclaimed match when several chapters share a name.
        let mut matches = chapters
            .iter()
            .filter(|chapter| chapter.name.to_lowercase() == wanted)
            .map(|chapter| chapter.id);
        let first = matches.next();
        let unclaimed = first
            .into_iter()
            .chain(matches)
            .find(|id| !self.claimed_chapters.contains_key(id));
        Ok(unclaimed.or(first))
    }

    fn is_claimed_by_other(&self, chapter_id: EntityId, source_id: &str) -> bool {
        self.claimed_chapters
            .get(&chapter_id)
            .is_some_and(|owner| owner != source_id)
    }

    fn owner_for<A: DestinationApi>(
        &mut self,
        session: &mut DestinationSession<'_, A>,
        node: &ClassifiedNode,
    ) -> Option<EntityId> {
        let creator = node.node.created_by.as_ref()?;
        if self.owners.is_none() {
            let users = match session.users() {
                Ok(users) => users.to_vec(),
                Err(error) => {
                    warn!(error = %format!("{error:#}"), "destination users unavailable, owners will not be set");
                    Vec::new()
                }
            };
            self.owners = Some(OwnerResolver::new(
                &users,
                &self.options.identities,
                self.options.default_owner_id,
            ));
        }
        self.owners
            .as_mut()
            .and_then(|resolver| resolver.resolve(Some(creator)))
            .map(|resolution| resolution.user_id)
    }

    fn assert_owner<A: DestinationApi>(
        &mut self,
        session: &mut DestinationSession<'_, A>,
        kind: EntityKind,
        id: EntityId,
        owner: Option<EntityId>,
    ) {
        let Some(user_id) = owner else {
            return;
        };
        if let Err(error) = session.assign_owner(kind, id, user_id) {
            self.stats.owner_failures += 1;
            warn!(kind = kind.as_str(), id, user_id, error = %format!("{error:#}"), "owner not set");
        }
    }

    fn record_failure(&mut self, node: &ClassifiedNode, error: &anyhow::Error) {
        let message = format!("{error:#}");
        warn!(
            source_id = node.id(),
            title = node.title(),
            role = node.role.as_str(),
            error = message.as_str(),
            "node skipped"
        );
        self.errors.push(NodeError {
            source_id: node.id().to_string(),
            title: node.title().to_string(),
            role: node.role,
            message,
        });
    }
}

fn intro_page_name(tree: &SourceTree, node: &ClassifiedNode) -> String {
    let taken = tree.nodes().iter().any(|other| {
        other.role == Role::Leaf
            && other.title() == INTRODUCTION_PAGE_NAME
            && other.node.parent().is_some_and(|parent| parent.id == node.id())
    });
    if taken {
        format!("{} - {}", node.title(), INTRODUCTION_PAGE_NAME)
    } else {
        INTRODUCTION_PAGE_NAME.to_string()
    }
}

fn disambiguated_name(node: &ClassifiedNode) -> String {
    match node.node.parent() {
        Some(parent) => format!("{} - {}", parent.title, node.title()),
        None => node.title().to_string(),
    }
}
