//! Destination cleanup: empty chapters, orphaned pages, and full purges.

use std::collections::HashSet;

use anyhow::{Result, bail};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::content::{DEFAULT_MIN_TEXT_LENGTH, is_page_effectively_empty};
use crate::destination::DestinationApi;
use crate::model::{Chapter, EntityId, Page, PageDetail};
use crate::session::DestinationSession;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupTarget {
    pub id: EntityId,
    pub book_id: EntityId,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EmptyChapterReport {
    pub dry_run: bool,
    pub found: usize,
    pub deleted: usize,
    pub errors: usize,
    pub chapters: Vec<CleanupTarget>,
}

#[derive(Debug, Clone)]
pub struct OrphanOptions {
    /// Only pages whose name matches exactly.
    pub title: Option<String>,
    pub book_id: Option<EntityId>,
    pub page_id: Option<EntityId>,
    pub min_text_length: usize,
}

impl Default for OrphanOptions {
    fn default() -> Self {
        Self {
            title: None,
            book_id: None,
            page_id: None,
            min_text_length: DEFAULT_MIN_TEXT_LENGTH,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OrphanReport {
    pub dry_run: bool,
    pub scanned: usize,
    pub candidates: usize,
    pub skipped: usize,
    pub deleted: usize,
    pub errors: usize,
    pub pages: Vec<CleanupTarget>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PurgeReport {
    pub dry_run: bool,
    pub pages: usize,
    pub chapters: usize,
    pub shelves: usize,
    pub books: usize,
    pub errors: usize,
}

/// Chapters without a single page. Membership comes from one page listing.
pub fn find_empty_chapters<A: DestinationApi>(
    session: &mut DestinationSession<'_, A>,
    book_id: Option<EntityId>,
) -> Result<Vec<Chapter>> {
    let book_ids: Vec<EntityId> = match book_id {
        Some(id) => {
            if !session.books()?.iter().any(|book| book.id == id) {
                bail!("book {id} not found");
            }
            vec![id]
        }
        None => session.books()?.iter().map(|book| book.id).collect(),
    };
    let pages = match book_id {
        Some(id) => session.pages(id)?.to_vec(),
        None => session.all_pages()?,
    };
    let with_pages: HashSet<EntityId> = pages.iter().filter_map(|page| page.chapter_id).collect();
    debug!(
        books = book_ids.len(),
        chapters_with_pages = with_pages.len(),
        "scanning for empty chapters"
    );

    let mut empty = Vec::new();
    for id in book_ids {
        empty.extend(
            session
                .chapters(id)?
                .iter()
                .filter(|chapter| !with_pages.contains(&chapter.id))
                .cloned(),
        );
    }
    Ok(empty)
}

pub fn delete_empty_chapters<A: DestinationApi>(
    session: &mut DestinationSession<'_, A>,
    book_id: Option<EntityId>,
) -> Result<EmptyChapterReport> {
    let empty = find_empty_chapters(session, book_id)?;
    let mut report = EmptyChapterReport {
        dry_run: session.is_dry_run(),
        found: empty.len(),
        ..EmptyChapterReport::default()
    };
    for chapter in &empty {
        report.chapters.push(CleanupTarget {
            id: chapter.id,
            book_id: chapter.book_id,
            name: chapter.name.clone(),
        });
        match session.delete_chapter(chapter) {
            Ok(()) if report.dry_run => {}
            Ok(()) => report.deleted += 1,
            Err(error) => {
                warn!(chapter_id = chapter.id, error = %format!("{error:#}"), "empty chapter not deleted");
                report.errors += 1;
            }
        }
    }
    info!(
        found = report.found,
        deleted = report.deleted,
        errors = report.errors,
        "empty chapter cleanup finished"
    );
    Ok(report)
}

/// Delete pages whose body is effectively empty. A page whose details
/// cannot be read is kept.
pub fn delete_orphan_pages<A: DestinationApi>(
    session: &mut DestinationSession<'_, A>,
    options: &OrphanOptions,
) -> Result<OrphanReport> {
    let listed: Vec<(Page, Option<PageDetail>)> = match (options.page_id, options.book_id) {
        (Some(page_id), _) => {
            let detail = session.get_page(page_id)?;
            vec![(summary_of(&detail), Some(detail))]
        }
        (None, Some(book_id)) => session
            .pages(book_id)?
            .iter()
            .map(|page| (page.clone(), None))
            .collect(),
        (None, None) => session
            .all_pages()?
            .into_iter()
            .map(|page| (page, None))
            .collect(),
    };

    let mut seen = HashSet::new();
    let pages: Vec<(Page, Option<PageDetail>)> = listed
        .into_iter()
        .filter(|(page, _)| seen.insert(page.id))
        .collect();

    let mut report = OrphanReport {
        dry_run: session.is_dry_run(),
        scanned: pages.len(),
        ..OrphanReport::default()
    };

    for (page, detail) in pages {
        if options
            .title
            .as_deref()
            .is_some_and(|title| page.name != title)
        {
            report.skipped += 1;
            continue;
        }
        let detail = match detail {
            Some(detail) => detail,
            None => match session.get_page(page.id) {
                Ok(detail) => detail,
                Err(error) => {
                    warn!(page_id = page.id, error = %format!("{error:#}"), "page unreadable, keeping it");
                    report.skipped += 1;
                    continue;
                }
            },
        };
        if !is_page_effectively_empty(&detail, options.min_text_length) {
            report.skipped += 1;
            continue;
        }

        report.candidates += 1;
        report.pages.push(CleanupTarget {
            id: page.id,
            book_id: page.book_id,
            name: page.name.clone(),
        });
        match session.delete_page(&page) {
            Ok(()) if report.dry_run => {}
            Ok(()) => report.deleted += 1,
            Err(error) => {
                warn!(page_id = page.id, error = %format!("{error:#}"), "orphan page not deleted");
                report.errors += 1;
            }
        }
    }
    info!(
        scanned = report.scanned,
        candidates = report.candidates,
        deleted = report.deleted,
        errors = report.errors,
        "orphan page cleanup finished"
    );
    Ok(report)
}

/// Remove every page and chapter of every book, then every shelf, then every
/// book.
pub fn purge_destination<A: DestinationApi>(
    session: &mut DestinationSession<'_, A>,
) -> Result<PurgeReport> {
    let books = session.books()?.to_vec();
    let mut report = PurgeReport {
        dry_run: session.is_dry_run(),
        ..PurgeReport::default()
    };
    warn!(books = books.len(), dry_run = report.dry_run, "purging destination");

    for book in &books {
        let (pages, chapters) = match book_contents(session, book.id) {
            Ok(contents) => contents,
            Err(error) => {
                warn!(book_id = book.id, error = %format!("{error:#}"), "book contents unreadable");
                report.errors += 1;
                continue;
            }
        };
        for page in &pages {
            match session.delete_page(page) {
                Ok(()) => report.pages += 1,
                Err(_) => report.errors += 1,
            }
        }
        for chapter in &chapters {
            match session.delete_chapter(chapter) {
                Ok(()) => report.chapters += 1,
                Err(_) => report.errors += 1,
            }
        }
    }

    for shelf in session.shelves()? {
        match session.delete_shelf(&shelf) {
            Ok(()) => report.shelves += 1,
            Err(_) => report.errors += 1,
        }
    }

    for book in &books {
        match session.delete_book(book.id, &book.name) {
            Ok(()) => report.books += 1,
            Err(_) => report.errors += 1,
        }
    }
    info!(
        pages = report.pages,
        chapters = report.chapters,
        shelves = report.shelves,
        books = report.books,
        errors = report.errors,
        "purge finished"
    );
    Ok(report)
}

fn book_contents<A: DestinationApi>(
    session: &mut DestinationSession<'_, A>,
    book_id: EntityId,
) -> Result<(Vec<Page>, Vec<Chapter>)> {
    let pages = session.pages(book_id)?.to_vec();
    let chapters = session.chapters(book_id)?.to_vec();
    Ok((pages, chapters))
}

fn summary_of(detail: &PageDetail) -> Page {
    Page {
        id: detail.id,
        book_id: detail.book_id,
        chapter_id: detail.chapter_id,
        name: detail.name.clone(),
        owned_by: detail.owned_by,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::{BackoffPolicy, Pacer};
    use crate::test_support::FakeDestination;

    fn pacer() -> Pacer {
        Pacer::without_sleeping(BackoffPolicy::default())
    }

    #[test]
    fn chapters_without_pages_are_found_and_deleted() {
        let mut api = FakeDestination::default();
        let ops = api.add_book("Ops");
        let used = api.add_chapter(ops, "Runbooks");
        let unused = api.add_chapter(ops, "Drafts");
        api.add_page(ops, Some(used), "Restart", "<p>restart steps here</p>");
        let other = api.add_book("Other");
        let elsewhere = api.add_chapter(other, "Empty too");

        let mut pacer = pacer();
        let mut session = DestinationSession::new(&mut api, &mut pacer, false);
        let scoped = find_empty_chapters(&mut session, Some(ops)).expect("scan");
        assert_eq!(scoped.iter().map(|c| c.id).collect::<Vec<_>>(), vec![unused]);

        let report = delete_empty_chapters(&mut session, None).expect("cleanup");
        drop(session);
        assert_eq!((report.found, report.deleted, report.errors), (2, 2, 0));
        assert!(api.chapters.contains_key(&used));
        assert!(!api.chapters.contains_key(&unused));
        assert!(!api.chapters.contains_key(&elsewhere));
    }

    #[test]
    fn unknown_book_is_an_error() {
        let mut api = FakeDestination::default();
        let mut pacer = pacer();
        let mut session = DestinationSession::new(&mut api, &mut pacer, false);
        assert!(find_empty_chapters(&mut session, Some(42)).is_err());
    }

    #[test]
    fn dry_run_lists_empty_chapters_only() {
        let mut api = FakeDestination::default();
        let ops = api.add_book("Ops");
        api.add_chapter(ops, "Drafts");
        let mut pacer = pacer();
        let mut session = DestinationSession::new(&mut api, &mut pacer, true);
        let report = delete_empty_chapters(&mut session, None).expect("cleanup");
        drop(session);
        assert_eq!((report.found, report.deleted), (1, 0));
        assert_eq!(report.chapters[0].name, "Drafts");
        assert!(api.mutations.is_empty());
    }

    #[test]
    fn orphan_cleanup_respects_title_filter_and_unreadable_pages() {
        let mut api = FakeDestination::default();
        let ops = api.add_book("Ops");
        let blank_intro = api.add_page(ops, None, "Introduction", "<p><br></p>");
        let real_intro = api.add_page(ops, None, "Introduction", "<h2>Overview</h2>");
        let blank_other = api.add_page(ops, None, "Scratch", "<p></p>");
        let unreadable = api.add_page(ops, None, "Introduction", "<p></p>");
        api.fail(&format!("get_page:{unreadable}"));

        let mut pacer = pacer();
        let mut session = DestinationSession::new(&mut api, &mut pacer, false);
        let report = delete_orphan_pages(
            &mut session,
            &OrphanOptions {
                title: Some("Introduction".to_string()),
                book_id: Some(ops),
                ..OrphanOptions::default()
            },
        )
        .expect("cleanup");
        drop(session);

        assert_eq!(report.scanned, 4);
        assert_eq!(report.candidates, 1);
        assert_eq!(report.deleted, 1);
        assert_eq!(report.skipped, 3);
        assert!(!api.pages.contains_key(&blank_intro));
        assert!(api.pages.contains_key(&real_intro));
        assert!(api.pages.contains_key(&blank_other));
        assert!(api.pages.contains_key(&unreadable));
    }

    #[test]
    fn single_page_mode_checks_only_that_page() {
        let mut api = FakeDestination::default();
        let ops = api.add_book("Ops");
        let target = api.add_page(ops, None, "Scratch", "<p>&nbsp;</p>");
        let untouched = api.add_page(ops, None, "Other", "<p></p>");
        let mut pacer = pacer();
        let mut session = DestinationSession::new(&mut api, &mut pacer, false);
        let report = delete_orphan_pages(
            &mut session,
            &OrphanOptions {
                page_id: Some(target),
                ..OrphanOptions::default()
            },
        )
        .expect("cleanup");
        drop(session);
        assert_eq!((report.scanned, report.deleted), (1, 1));
        assert!(api.pages.contains_key(&untouched));
    }

    #[test]
    fn purge_removes_everything_in_order() {
        let mut api = FakeDestination::default();
        let ops = api.add_book("Ops");
        let runbooks = api.add_chapter(ops, "Runbooks");
        api.add_page(ops, Some(runbooks), "Restart", "<p>x</p>");
        api.add_page(ops, None, "Overview", "<p>y</p>");
        api.add_book("Empty");
        api.add_shelf("Wiki", &[ops]);

        let mut pacer = pacer();
        let mut session = DestinationSession::new(&mut api, &mut pacer, false);
        let report = purge_destination(&mut session).expect("purge");
        drop(session);

        assert_eq!(
            (report.pages, report.chapters, report.shelves, report.books),
            (2, 1, 1, 2)
        );
        assert!(api.books.is_empty() && api.pages.is_empty() && api.shelves.is_empty());
        let first_book_delete = api
            .mutations
            .iter()
            .position(|entry| entry.starts_with("delete_book"))
            .expect("book deleted");
        let last_page_delete = api
            .mutations
            .iter()
            .rposition(|entry| entry.starts_with("delete_page"))
            .expect("page deleted");
        assert!(last_page_delete < first_book_delete);
    }

    #[test]
    fn purge_dry_run_touches_nothing() {
        let mut api = FakeDestination::default();
        let ops = api.add_book("Ops");
        api.add_page(ops, None, "Overview", "<p>y</p>");
        let mut pacer = pacer();
        let mut session = DestinationSession::new(&mut api, &mut pacer, true);
        let report = purge_destination(&mut session).expect("purge");
        assert_eq!(session.planned_writes().len(), 2);
        drop(session);
        assert_eq!((report.pages, report.books), (1, 1));
        assert!(api.mutations.is_empty());
    }
}
