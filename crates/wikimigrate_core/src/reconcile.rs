//! Merges same-named destination books into a single survivor.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::destination::DestinationApi;
use crate::model::{
    Book, ChapterDraft, EntityId, EntityKind, EntityRef, IdentityMap, Page, PageDraft,
};
use crate::session::DestinationSession;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub name: String,
    pub survivor: EntityId,
    pub losers: Vec<EntityId>,
    pub deleted: Vec<EntityId>,
    pub chapters_copied: usize,
    pub pages_copied: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileOutcome {
    pub merges: Vec<MergeReport>,
    /// Deleted loser book -> survivor.
    pub redirects: BTreeMap<EntityId, EntityId>,
}

impl ReconcileOutcome {
    pub fn errors(&self) -> usize {
        self.merges.iter().map(|merge| merge.errors).sum()
    }
}

#[derive(Debug, Default)]
struct LoserCopy {
    chapters: HashMap<EntityId, EntityId>,
    pages: Vec<(EntityId, EntityId)>,
    failures: usize,
}

/// Merge every duplicate group among `names`. `refresh` re-lists books first
/// so books created concurrently by another writer are seen.
pub fn reconcile_books<A: DestinationApi>(
    session: &mut DestinationSession<'_, A>,
    names: &BTreeSet<String>,
    identity: &mut IdentityMap,
    refresh: bool,
) -> Result<ReconcileOutcome> {
    let books = if refresh {
        session.refresh_books()?.to_vec()
    } else {
        session.books()?.to_vec()
    };

    let mut groups: BTreeMap<String, Vec<Book>> = BTreeMap::new();
    for book in books.into_iter().filter(|book| names.contains(&book.name)) {
        groups.entry(book.name.clone()).or_default().push(book);
    }

    let mut outcome = ReconcileOutcome::default();
    for (name, candidates) in groups {
        if candidates.len() < 2 {
            continue;
        }
        info!(
            name = name.as_str(),
            candidates = candidates.len(),
            "merging duplicate books"
        );
        let report = merge_group(session, identity, &name, candidates);
        for loser in &report.deleted {
            outcome.redirects.insert(*loser, report.survivor);
        }
        outcome.merges.push(report);
    }
    Ok(outcome)
}

fn merge_group<A: DestinationApi>(
    session: &mut DestinationSession<'_, A>,
    identity: &mut IdentityMap,
    name: &str,
    candidates: Vec<Book>,
) -> MergeReport {
    let mut report = MergeReport {
        name: name.to_string(),
        ..MergeReport::default()
    };

    let mut counted = Vec::with_capacity(candidates.len());
    for book in candidates {
        match content_count(session, book.id) {
            Ok(count) => counted.push((count, book)),
            Err(error) => {
                // Without every count the survivor choice is unreliable.
                warn!(name, book_id = book.id, error = %format!("{error:#}"), "duplicate group left unmerged");
                report.errors += 1;
                return report;
            }
        }
    }
    counted.sort_by(|(left_count, left), (right_count, right)| {
        right_count.cmp(left_count).then(left.id.cmp(&right.id))
    });

    let mut ordered = counted.into_iter().map(|(_, book)| book);
    let Some(survivor) = ordered.next() else {
        return report;
    };
    report.survivor = survivor.id;

    for loser in ordered {
        report.losers.push(loser.id);
        let copy = match copy_into(session, &loser, survivor.id) {
            Ok(copy) => copy,
            Err(error) => {
                warn!(name, loser = loser.id, error = %format!("{error:#}"), "could not read duplicate book");
                report.errors += 1;
                continue;
            }
        };
        report.chapters_copied += copy.chapters.len();
        report.pages_copied += copy.pages.len();
        if copy.failures > 0 {
            warn!(
                name,
                loser = loser.id,
                failures = copy.failures,
                "copy incomplete, duplicate book kept"
            );
            report.errors += copy.failures;
            continue;
        }
        if let Err(error) = session.delete_book(loser.id, &loser.name) {
            warn!(name, loser = loser.id, error = %format!("{error:#}"), "duplicate book not deleted");
            report.errors += 1;
            continue;
        }

        identity.retarget(EntityRef::book(loser.id), EntityRef::book(survivor.id));
        for (old, new) in &copy.chapters {
            identity.retarget(EntityRef::chapter(*old), EntityRef::chapter(*new));
        }
        for (old, new) in &copy.pages {
            identity.retarget(EntityRef::page(*old), EntityRef::page(*new));
        }
        report.deleted.push(loser.id);
    }

    info!(
        name,
        survivor = report.survivor,
        deleted = report.deleted.len(),
        chapters = report.chapters_copied,
        pages = report.pages_copied,
        errors = report.errors,
        "merged duplicate books"
    );
    report
}

fn content_count<A: DestinationApi>(
    session: &mut DestinationSession<'_, A>,
    book_id: EntityId,
) -> Result<usize> {
    let chapters = session.chapters(book_id)?.len();
    let pages = session.pages(book_id)?.len();
    Ok(chapters + pages)
}

/// Copy chapters, then pages, of `loser` into `survivor`. Individual write
/// failures are counted; only listing failures abort.
fn copy_into<A: DestinationApi>(
    session: &mut DestinationSession<'_, A>,
    loser: &Book,
    survivor: EntityId,
) -> Result<LoserCopy> {
    let chapters = session.chapters(loser.id)?.to_vec();
    let pages = session.pages(loser.id)?.to_vec();
    let mut copy = LoserCopy::default();

    for chapter in &chapters {
        let draft = ChapterDraft {
            book_id: survivor,
            name: chapter.name.clone(),
            description: chapter.description.clone(),
            owner_id: chapter.owned_by,
        };
        match session.create_chapter(&draft) {
            Ok(created) => {
                copy_owner(session, EntityKind::Chapter, created.id, chapter.owned_by);
                copy.chapters.insert(chapter.id, created.id);
            }
            Err(error) => {
                warn!(chapter_id = chapter.id, error = %format!("{error:#}"), "chapter copy failed");
                copy.failures += 1;
            }
        }
    }

    for page in &pages {
        match copy_page(session, page, survivor, &copy.chapters) {
            Ok(created) => copy.pages.push((page.id, created)),
            Err(error) => {
                warn!(page_id = page.id, error = %format!("{error:#}"), "page copy failed");
                copy.failures += 1;
            }
        }
    }
    Ok(copy)
}

fn copy_page<A: DestinationApi>(
    session: &mut DestinationSession<'_, A>,
    page: &Page,
    survivor: EntityId,
    chapters: &HashMap<EntityId, EntityId>,
) -> Result<EntityId> {
    let detail = session.get_page(page.id)?;
    let chapter_id = match page.chapter_id {
        Some(old) => Some(
            chapters
                .get(&old)
                .copied()
                .with_context(|| format!("chapter {old} of page {} was not copied", page.id))?,
        ),
        None => None,
    };
    let (html, markdown) = match detail.markdown.filter(|markdown| !markdown.trim().is_empty()) {
        Some(markdown) => (None, Some(markdown)),
        None => (Some(detail.html.unwrap_or_default()), None),
    };
    let created = session.place_page(&PageDraft {
        book_id: survivor,
        chapter_id,
        name: page.name.clone(),
        html,
        markdown,
        owner_id: page.owned_by,
    })?;
    copy_owner(session, EntityKind::Page, created.id, page.owned_by);
    Ok(created.id)
}

fn copy_owner<A: DestinationApi>(
    session: &mut DestinationSession<'_, A>,
    kind: EntityKind,
    id: EntityId,
    owner: Option<EntityId>,
) {
    if let Some(user_id) = owner
        && let Err(error) = session.assign_owner(kind, id, user_id)
    {
        warn!(kind = kind.as_str(), id, error = %format!("{error:#}"), "owner not carried over");
    }
}
