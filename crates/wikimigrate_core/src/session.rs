use std::collections::{BTreeSet, HashMap};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info};

use crate::backoff::Pacer;
use crate::destination::DestinationApi;
use crate::model::{
    Book, BookDraft, Chapter, ChapterDraft, DestinationUser, EntityId, EntityKind, Page,
    PageDetail, PageDraft, Shelf, is_placeholder,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteAction {
    Create,
    Update,
    Delete,
    AssignOwner,
    UpdateShelf,
}

/// A mutation that a dry run would have performed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedWrite {
    pub action: WriteAction,
    pub kind: EntityKind,
    pub id: EntityId,
    pub name: String,
}

/// Name lookups for one run. Populated lazily, emptied by `reset`.
#[derive(Debug, Default)]
struct DestinationIndex {
    books: Option<Vec<Book>>,
    chapters_by_book: HashMap<EntityId, Vec<Chapter>>,
    pages_by_book: HashMap<EntityId, Vec<Page>>,
    users: Option<Vec<DestinationUser>>,
    /// Books deleted (or planned for deletion) this run.
    deleted_books: BTreeSet<EntityId>,
    /// Dry-run books that exist only in this session.
    placeholder_books: Vec<Book>,
}

/// Every destination read and write of a run goes through here: reads are
/// guarded and cached, writes are paced, and in dry-run writes become
/// placeholder entities with negative ids.
pub struct DestinationSession<'a, A: DestinationApi> {
    api: &'a mut A,
    pacer: &'a mut Pacer,
    dry_run: bool,
    index: DestinationIndex,
    last_placeholder: EntityId,
    planned: Vec<PlannedWrite>,
}

impl<'a, A: DestinationApi> DestinationSession<'a, A> {
    pub fn new(api: &'a mut A, pacer: &'a mut Pacer, dry_run: bool) -> Self {
        Self {
            api,
            pacer,
            dry_run,
            index: DestinationIndex::default(),
            last_placeholder: 0,
            planned: Vec::new(),
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn reset(&mut self) {
        self.index = DestinationIndex::default();
    }

    pub fn pacer(&self) -> &Pacer {
        &*self.pacer
    }

    pub fn request_count(&self) -> usize {
        self.api.request_count()
    }

    pub fn planned_writes(&self) -> &[PlannedWrite] {
        &self.planned
    }

    pub fn take_planned_writes(&mut self) -> Vec<PlannedWrite> {
        std::mem::take(&mut self.planned)
    }

    fn placeholder(&mut self) -> EntityId {
        self.last_placeholder -= 1;
        self.last_placeholder
    }

    fn plan(&mut self, action: WriteAction, kind: EntityKind, id: EntityId, name: &str) {
        info!(
            action = ?action,
            kind = kind.as_str(),
            id,
            name,
            "dry-run: planned write"
        );
        self.planned.push(PlannedWrite {
            action,
            kind,
            id,
            name: name.to_string(),
        });
    }

    // ---- reads ----

    pub fn books(&mut self) -> Result<&[Book]> {
        if self.index.books.is_none() {
            let fetched = self
                .pacer
                .guarded("list_books", || self.api.list_books())
                .context("failed to list destination books")?;
            debug!(books = fetched.len(), "loaded destination books");
            self.index.books = Some(fetched);
        }
        Ok(self.index.books.as_deref().unwrap_or(&[]))
    }

    /// Drop the book cache and fetch it again. Books this run deleted stay
    /// gone and dry-run placeholders stay present, so a refresh in dry-run
    /// sees the same state a real run would.
    pub fn refresh_books(&mut self) -> Result<&[Book]> {
        self.index.books = None;
        self.books()?;
        let deleted = &self.index.deleted_books;
        let placeholders: Vec<Book> = self
            .index
            .placeholder_books
            .iter()
            .filter(|book| !deleted.contains(&book.id))
            .cloned()
            .collect();
        if let Some(books) = self.index.books.as_mut() {
            books.retain(|book| !deleted.contains(&book.id));
            books.extend(placeholders);
        }
        Ok(self.index.books.as_deref().unwrap_or(&[]))
    }

    /// Books whose name matches exactly, ascending id.
    pub fn books_named(&mut self, name: &str) -> Result<Vec<Book>> {
        let mut matches: Vec<Book> = self
            .books()?
            .iter()
            .filter(|book| book.name == name)
            .cloned()
            .collect();
        matches.sort_by_key(|book| book.id);
        Ok(matches)
    }

    pub fn chapters(&mut self, book_id: EntityId) -> Result<&[Chapter]> {
        if !self.index.chapters_by_book.contains_key(&book_id) {
            let fetched = if is_placeholder(book_id) {
                Vec::new()
            } else {
                self.pacer
                    .guarded("list_chapters", || self.api.list_chapters(Some(book_id)))
                    .with_context(|| format!("failed to list chapters of book {book_id}"))?
            };
            self.index.chapters_by_book.insert(book_id, fetched);
        }
        Ok(self
            .index
            .chapters_by_book
            .get(&book_id)
            .map(Vec::as_slice)
            .unwrap_or(&[]))
    }

    pub fn pages(&mut self, book_id: EntityId) -> Result<&[Page]> {
        if !self.index.pages_by_book.contains_key(&book_id) {
            let fetched = if is_placeholder(book_id) {
                Vec::new()
            } else {
                self.pacer
                    .guarded("list_pages", || self.api.list_pages(Some(book_id)))
                    .with_context(|| format!("failed to list pages of book {book_id}"))?
            };
            self.index.pages_by_book.insert(book_id, fetched);
        }
        Ok(self
            .index
            .pages_by_book
            .get(&book_id)
            .map(Vec::as_slice)
            .unwrap_or(&[]))
    }

    pub fn users(&mut self) -> Result<&[DestinationUser]> {
        if self.index.users.is_none() {
            let fetched = self
                .pacer
                .guarded("list_users", || self.api.list_users())
                .context("failed to list destination users")?;
            self.index.users = Some(fetched);
        }
        Ok(self.index.users.as_deref().unwrap_or(&[]))
    }

    pub fn get_page(&mut self, id: EntityId) -> Result<PageDetail> {
        self.pacer
            .guarded("get_page", || self.api.get_page(id))
            .with_context(|| format!("failed to read page {id}"))
    }

    /// Uncached listing across the whole instance.
    pub fn all_chapters(&mut self) -> Result<Vec<Chapter>> {
        self.pacer
            .guarded("list_chapters", || self.api.list_chapters(None))
            .context("failed to list destination chapters")
    }

    /// Uncached listing across the whole instance.
    pub fn all_pages(&mut self) -> Result<Vec<Page>> {
        self.pacer
            .guarded("list_pages", || self.api.list_pages(None))
            .context("failed to list destination pages")
    }

    pub fn shelves(&mut self) -> Result<Vec<Shelf>> {
        self.pacer
            .guarded("list_shelves", || self.api.list_shelves())
            .context("failed to list destination shelves")
    }

    pub fn get_shelf(&mut self, id: EntityId) -> Result<Shelf> {
        self.pacer
            .guarded("get_shelf", || self.api.get_shelf(id))
            .with_context(|| format!("failed to read shelf {id}"))
    }

    // ---- writes ----

    pub fn create_book(&mut self, draft: &BookDraft) -> Result<Book> {
        let book = if self.dry_run {
            let id = self.placeholder();
            self.plan(WriteAction::Create, EntityKind::Book, id, &draft.name);
            Book {
                id,
                name: draft.name.clone(),
                description: draft.description.clone(),
                owned_by: None,
            }
        } else {
            let book = self
                .pacer
                .paced("create_book", || self.api.create_book(draft))
                .with_context(|| format!("failed to create book {}", draft.name))?;
            info!(book_id = book.id, name = book.name.as_str(), "created book");
            book
        };
        if is_placeholder(book.id) {
            self.index.placeholder_books.push(book.clone());
        }
        if let Some(books) = self.index.books.as_mut() {
            books.push(book.clone());
        }
        Ok(book)
    }

    pub fn delete_book(&mut self, id: EntityId, name: &str) -> Result<()> {
        if self.dry_run || is_placeholder(id) {
            self.plan(WriteAction::Delete, EntityKind::Book, id, name);
        } else {
            self.pacer
                .paced("delete_book", || self.api.delete_book(id))
                .with_context(|| format!("failed to delete book {id} ({name})"))?;
            info!(book_id = id, name, "deleted book");
        }
        self.index.deleted_books.insert(id);
        if let Some(books) = self.index.books.as_mut() {
            books.retain(|book| book.id != id);
        }
        self.index.chapters_by_book.remove(&id);
        self.index.pages_by_book.remove(&id);
        Ok(())
    }

    pub fn create_chapter(&mut self, draft: &ChapterDraft) -> Result<Chapter> {
        let chapter = if self.dry_run || is_placeholder(draft.book_id) {
            let id = self.placeholder();
            self.plan(WriteAction::Create, EntityKind::Chapter, id, &draft.name);
            Chapter {
                id,
                book_id: draft.book_id,
                name: draft.name.clone(),
                description: draft.description.clone(),
                owned_by: None,
            }
        } else {
            let chapter = self
                .pacer
                .paced("create_chapter", || self.api.create_chapter(draft))
                .with_context(|| format!("failed to create chapter {}", draft.name))?;
            info!(
                chapter_id = chapter.id,
                book_id = chapter.book_id,
                name = chapter.name.as_str(),
                "created chapter"
            );
            chapter
        };
        self.cache_chapter(chapter.clone());
        Ok(chapter)
    }

    pub fn update_chapter(&mut self, id: EntityId, draft: &ChapterDraft) -> Result<Chapter> {
        let chapter = if self.dry_run || is_placeholder(id) {
            self.plan(WriteAction::Update, EntityKind::Chapter, id, &draft.name);
            Chapter {
                id,
                book_id: draft.book_id,
                name: draft.name.clone(),
                description: draft.description.clone(),
                owned_by: None,
            }
        } else {
            self.pacer
                .paced("update_chapter", || self.api.update_chapter(id, draft))
                .with_context(|| format!("failed to update chapter {id}"))?
        };
        for chapters in self.index.chapters_by_book.values_mut() {
            chapters.retain(|existing| existing.id != id);
        }
        self.cache_chapter(chapter.clone());
        Ok(chapter)
    }

    pub fn delete_chapter(&mut self, chapter: &Chapter) -> Result<()> {
        if self.dry_run || is_placeholder(chapter.id) {
            self.plan(
                WriteAction::Delete,
                EntityKind::Chapter,
                chapter.id,
                &chapter.name,
            );
        } else {
            self.pacer
                .paced("delete_chapter", || self.api.delete_chapter(chapter.id))
                .with_context(|| format!("failed to delete chapter {}", chapter.id))?;
            info!(chapter_id = chapter.id, name = chapter.name.as_str(), "deleted chapter");
        }
        if let Some(chapters) = self.index.chapters_by_book.get_mut(&chapter.book_id) {
            chapters.retain(|existing| existing.id != chapter.id);
        }
        Ok(())
    }

    pub fn create_page(&mut self, draft: &PageDraft) -> Result<Page> {
        let page = if self.dry_run || is_placeholder(draft.book_id) {
            let id = self.placeholder();
            self.plan(WriteAction::Create, EntityKind::Page, id, &draft.name);
            Page {
                id,
                book_id: draft.book_id,
                chapter_id: draft.chapter_id,
                name: draft.name.clone(),
                owned_by: None,
            }
        } else {
            let page = self
                .pacer
                .paced("create_page", || self.api.create_page(draft))
                .with_context(|| format!("failed to create page {}", draft.name))?;
            info!(
                page_id = page.id,
                book_id = page.book_id,
                name = page.name.as_str(),
                "created page"
            );
            page
        };
        self.cache_page(page.clone());
        Ok(page)
    }

    pub fn update_page(&mut self, id: EntityId, draft: &PageDraft) -> Result<Page> {
        let page = if self.dry_run || is_placeholder(id) || is_placeholder(draft.book_id) {
            self.plan(WriteAction::Update, EntityKind::Page, id, &draft.name);
            Page {
                id,
                book_id: draft.book_id,
                chapter_id: draft.chapter_id,
                name: draft.name.clone(),
                owned_by: None,
            }
        } else {
            self.pacer
                .paced("update_page", || self.api.update_page(id, draft))
                .with_context(|| format!("failed to update page {id}"))?
        };
        for pages in self.index.pages_by_book.values_mut() {
            pages.retain(|existing| existing.id != id);
        }
        self.cache_page(page.clone());
        Ok(page)
    }

    /// Create a page and re-assert its chapter with a follow-up update; the
    /// create endpoint does not reliably keep it.
    pub fn place_page(&mut self, draft: &PageDraft) -> Result<Page> {
        let created = self.create_page(draft)?;
        if draft.chapter_id.is_none() || is_placeholder(created.id) {
            return Ok(created);
        }
        let reassert = PageDraft {
            html: None,
            markdown: None,
            ..draft.clone()
        };
        self.update_page(created.id, &reassert)
    }

    pub fn delete_page(&mut self, page: &Page) -> Result<()> {
        if self.dry_run || is_placeholder(page.id) {
            self.plan(WriteAction::Delete, EntityKind::Page, page.id, &page.name);
        } else {
            self.pacer
                .paced("delete_page", || self.api.delete_page(page.id))
                .with_context(|| format!("failed to delete page {}", page.id))?;
            info!(page_id = page.id, name = page.name.as_str(), "deleted page");
        }
        if let Some(pages) = self.index.pages_by_book.get_mut(&page.book_id) {
            pages.retain(|existing| existing.id != page.id);
        }
        Ok(())
    }

    pub fn assign_owner(
        &mut self,
        kind: EntityKind,
        id: EntityId,
        user_id: EntityId,
    ) -> Result<()> {
        if self.dry_run || is_placeholder(id) {
            self.plan(WriteAction::AssignOwner, kind, id, &user_id.to_string());
            return Ok(());
        }
        self.pacer
            .paced("assign_owner", || self.api.assign_owner(kind, id, user_id))
            .with_context(|| format!("failed to assign owner {user_id} to {kind} {id}"))?;
        debug!(kind = kind.as_str(), id, user_id, "assigned owner");
        Ok(())
    }

    pub fn create_shelf(&mut self, name: &str, books: &[EntityId]) -> Result<Shelf> {
        let real: Vec<EntityId> = books.iter().copied().filter(|id| !is_placeholder(*id)).collect();
        if self.dry_run {
            let id = self.placeholder();
            self.plan(WriteAction::Create, EntityKind::Shelf, id, name);
            return Ok(Shelf {
                id,
                name: name.to_string(),
                books: books.to_vec(),
            });
        }
        let shelf = self
            .pacer
            .paced("create_shelf", || self.api.create_shelf(name, &real))
            .with_context(|| format!("failed to create shelf {name}"))?;
        info!(shelf_id = shelf.id, name, "created shelf");
        Ok(shelf)
    }

    /// Replace the shelf's member list. Placeholder ids are dropped.
    pub fn set_shelf_books(&mut self, shelf: &Shelf, books: &[EntityId]) -> Result<()> {
        if self.dry_run || is_placeholder(shelf.id) {
            self.plan(WriteAction::UpdateShelf, EntityKind::Shelf, shelf.id, &shelf.name);
            return Ok(());
        }
        let real: Vec<EntityId> = books.iter().copied().filter(|id| !is_placeholder(*id)).collect();
        self.pacer
            .paced("update_shelf_books", || {
                self.api.update_shelf_books(shelf.id, &real)
            })
            .with_context(|| format!("failed to update shelf {}", shelf.id))?;
        info!(shelf_id = shelf.id, books = real.len(), "updated shelf members");
        Ok(())
    }

    pub fn delete_shelf(&mut self, shelf: &Shelf) -> Result<()> {
        if self.dry_run || is_placeholder(shelf.id) {
            self.plan(WriteAction::Delete, EntityKind::Shelf, shelf.id, &shelf.name);
            return Ok(());
        }
        self.pacer
            .paced("delete_shelf", || self.api.delete_shelf(shelf.id))
            .with_context(|| format!("failed to delete shelf {}", shelf.id))?;
        info!(shelf_id = shelf.id, name = shelf.name.as_str(), "deleted shelf");
        Ok(())
    }

    fn cache_chapter(&mut self, chapter: Chapter) {
        if is_placeholder(chapter.book_id) {
            self.index
                .chapters_by_book
                .entry(chapter.book_id)
                .or_default()
                .push(chapter);
        } else if let Some(chapters) = self.index.chapters_by_book.get_mut(&chapter.book_id) {
            chapters.push(chapter);
        }
    }

    fn cache_page(&mut self, page: Page) {
        if is_placeholder(page.book_id) {
            self.index
                .pages_by_book
                .entry(page.book_id)
                .or_default()
                .push(page);
        } else if let Some(pages) = self.index.pages_by_book.get_mut(&page.book_id) {
            pages.push(page);
        }
    }
}
