//! In-memory destination used by the unit tests of every engine module.

use std::collections::{BTreeMap, BTreeSet};

use crate::destination::DestinationApi;
use crate::error::ApiError;
use crate::model::{
    Book, BookDraft, Chapter, ChapterDraft, DestinationUser, EntityId, EntityKind, Page,
    PageDetail, PageDraft, Shelf,
};

/// Ids are allocated per kind, so a book and a chapter can share an id the
/// way they do on a real instance. `create_page` ignores `chapter_id`; only
/// an update places a page in a chapter.
#[derive(Default)]
pub(crate) struct FakeDestination {
    pub(crate) books: BTreeMap<EntityId, Book>,
    pub(crate) chapters: BTreeMap<EntityId, Chapter>,
    pub(crate) pages: BTreeMap<EntityId, PageDetail>,
    pub(crate) shelves: BTreeMap<EntityId, Shelf>,
    pub(crate) users: Vec<DestinationUser>,
    pub(crate) owners: BTreeMap<(EntityKind, EntityId), EntityId>,
    /// `"<operation>:<name or id>"` keys that fail with HTTP 500.
    pub(crate) failures: BTreeSet<String>,
    /// Operation name -> number of 429 responses still to return.
    pub(crate) rate_limits: BTreeMap<String, usize>,
    /// Book names whose creation also creates a same-named twin.
    pub(crate) racing_books: BTreeSet<String>,
    pub(crate) mutations: Vec<String>,
    pub(crate) request_count: usize,
    counters: BTreeMap<EntityKind, EntityId>,
}

impl FakeDestination {
    fn allocate(&mut self, kind: EntityKind) -> EntityId {
        let counter = self.counters.entry(kind).or_insert(0);
        *counter += 1;
        *counter
    }

    pub(crate) fn add_book(&mut self, name: &str) -> EntityId {
        let id = self.allocate(EntityKind::Book);
        self.books.insert(
            id,
            Book {
                id,
                name: name.to_string(),
                description: String::new(),
                owned_by: None,
            },
        );
        id
    }

    pub(crate) fn add_chapter(&mut self, book_id: EntityId, name: &str) -> EntityId {
        let id = self.allocate(EntityKind::Chapter);
        self.chapters.insert(
            id,
            Chapter {
                id,
                book_id,
                name: name.to_string(),
                description: format!("{name} description"),
                owned_by: None,
            },
        );
        id
    }

    pub(crate) fn add_page(
        &mut self,
        book_id: EntityId,
        chapter_id: Option<EntityId>,
        name: &str,
        html: &str,
    ) -> EntityId {
        let id = self.allocate(EntityKind::Page);
        self.pages.insert(
            id,
            PageDetail {
                id,
                book_id,
                chapter_id,
                name: name.to_string(),
                html: Some(html.to_string()),
                markdown: None,
                owned_by: None,
            },
        );
        id
    }

    pub(crate) fn add_user(&mut self, name: &str, email: &str) -> EntityId {
        let id = 100 + self.users.len() as EntityId + 1;
        self.users.push(DestinationUser {
            id,
            name: name.to_string(),
            email: Some(email.to_string()),
        });
        id
    }

    pub(crate) fn add_shelf(&mut self, name: &str, books: &[EntityId]) -> EntityId {
        let id = self.allocate(EntityKind::Shelf);
        self.shelves.insert(
            id,
            Shelf {
                id,
                name: name.to_string(),
                books: books.to_vec(),
            },
        );
        id
    }

    pub(crate) fn fail(&mut self, key: &str) {
        self.failures.insert(key.to_string());
    }

    pub(crate) fn books_named(&self, name: &str) -> Vec<&Book> {
        self.books.values().filter(|book| book.name == name).collect()
    }

    pub(crate) fn pages_in_book(&self, book_id: EntityId) -> Vec<&PageDetail> {
        self.pages
            .values()
            .filter(|page| page.book_id == book_id)
            .collect()
    }

    pub(crate) fn chapters_in_book(&self, book_id: EntityId) -> Vec<&Chapter> {
        self.chapters
            .values()
            .filter(|chapter| chapter.book_id == book_id)
            .collect()
    }

    pub(crate) fn page_named(&self, name: &str) -> Option<&PageDetail> {
        self.pages.values().find(|page| page.name == name)
    }

    fn check(&mut self, operation: &str, subject: &str) -> Result<(), ApiError> {
        self.request_count += 1;
        if let Some(remaining) = self.rate_limits.get_mut(operation)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(ApiError::RateLimited {
                retry_after_secs: None,
            });
        }
        if self.failures.contains(&format!("{operation}:{subject}")) {
            return Err(ApiError::Http {
                status: 500,
                body: format!("{operation} failed for {subject}"),
            });
        }
        Ok(())
    }

    fn record(&mut self, entry: String) {
        self.mutations.push(entry);
    }

    fn book_exists(&self, id: EntityId) -> Result<(), ApiError> {
        if self.books.contains_key(&id) {
            Ok(())
        } else {
            Err(ApiError::NotFound(format!("book {id}")))
        }
    }
}

fn as_page(detail: &PageDetail) -> Page {
    Page {
        id: detail.id,
        book_id: detail.book_id,
        chapter_id: detail.chapter_id,
        name: detail.name.clone(),
        owned_by: detail.owned_by,
    }
}

impl DestinationApi for FakeDestination {
    fn list_books(&mut self) -> Result<Vec<Book>, ApiError> {
        self.check("list_books", "")?;
        Ok(self.books.values().cloned().collect())
    }

    fn list_shelves(&mut self) -> Result<Vec<Shelf>, ApiError> {
        self.check("list_shelves", "")?;
        Ok(self
            .shelves
            .values()
            .map(|shelf| Shelf {
                books: Vec::new(),
                ..shelf.clone()
            })
            .collect())
    }

    fn get_shelf(&mut self, id: EntityId) -> Result<Shelf, ApiError> {
        self.check("get_shelf", &id.to_string())?;
        self.shelves
            .get(&id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("shelf {id}")))
    }

    fn list_chapters(&mut self, book_id: Option<EntityId>) -> Result<Vec<Chapter>, ApiError> {
        self.check("list_chapters", &format!("{book_id:?}"))?;
        Ok(self
            .chapters
            .values()
            .filter(|chapter| book_id.is_none_or(|id| chapter.book_id == id))
            .cloned()
            .collect())
    }

    fn list_pages(&mut self, book_id: Option<EntityId>) -> Result<Vec<Page>, ApiError> {
        self.check("list_pages", &format!("{book_id:?}"))?;
        Ok(self
            .pages
            .values()
            .filter(|page| book_id.is_none_or(|id| page.book_id == id))
            .map(as_page)
            .collect())
    }

    fn get_page(&mut self, id: EntityId) -> Result<PageDetail, ApiError> {
        self.check("get_page", &id.to_string())?;
        self.pages
            .get(&id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("page {id}")))
    }

    fn list_users(&mut self) -> Result<Vec<DestinationUser>, ApiError> {
        self.check("list_users", "")?;
        Ok(self.users.clone())
    }

    fn create_shelf(&mut self, name: &str, books: &[EntityId]) -> Result<Shelf, ApiError> {
        self.check("create_shelf", name)?;
        self.record(format!("create_shelf:{name}"));
        let id = self.add_shelf(name, books);
        Ok(self.shelves[&id].clone())
    }

    fn update_shelf_books(&mut self, id: EntityId, books: &[EntityId]) -> Result<(), ApiError> {
        self.check("update_shelf_books", &id.to_string())?;
        self.record(format!("update_shelf_books:{id}"));
        let shelf = self
            .shelves
            .get_mut(&id)
            .ok_or_else(|| ApiError::NotFound(format!("shelf {id}")))?;
        shelf.books = books.to_vec();
        Ok(())
    }

    fn delete_shelf(&mut self, id: EntityId) -> Result<(), ApiError> {
        self.check("delete_shelf", &id.to_string())?;
        self.record(format!("delete_shelf:{id}"));
        self.shelves
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| ApiError::NotFound(format!("shelf {id}")))
    }

    fn create_book(&mut self, draft: &BookDraft) -> Result<Book, ApiError> {
        self.check("create_book", &draft.name)?;
        self.record(format!("create_book:{}", draft.name));
        if self.racing_books.remove(&draft.name) {
            self.add_book(&draft.name);
        }
        let id = self.add_book(&draft.name);
        let book = self.books.get_mut(&id).ok_or_else(|| ApiError::NotFound(id.to_string()))?;
        book.description = draft.description.clone();
        Ok(book.clone())
    }

    fn delete_book(&mut self, id: EntityId) -> Result<(), ApiError> {
        self.check("delete_book", &id.to_string())?;
        self.book_exists(id)?;
        self.record(format!("delete_book:{id}"));
        self.books.remove(&id);
        self.chapters.retain(|_, chapter| chapter.book_id != id);
        self.pages.retain(|_, page| page.book_id != id);
        Ok(())
    }

    fn create_chapter(&mut self, draft: &ChapterDraft) -> Result<Chapter, ApiError> {
        self.check("create_chapter", &draft.name)?;
        self.book_exists(draft.book_id)?;
        self.record(format!("create_chapter:{}", draft.name));
        let id = self.add_chapter(draft.book_id, &draft.name);
        let chapter = self
            .chapters
            .get_mut(&id)
            .ok_or_else(|| ApiError::NotFound(id.to_string()))?;
        chapter.description = draft.description.clone();
        Ok(chapter.clone())
    }

    fn update_chapter(
        &mut self,
        id: EntityId,
        draft: &ChapterDraft,
    ) -> Result<Chapter, ApiError> {
        self.check("update_chapter", &draft.name)?;
        self.record(format!("update_chapter:{id}"));
        let chapter = self
            .chapters
            .get_mut(&id)
            .ok_or_else(|| ApiError::NotFound(format!("chapter {id}")))?;
        chapter.book_id = draft.book_id;
        chapter.name = draft.name.clone();
        chapter.description = draft.description.clone();
        Ok(chapter.clone())
    }

    fn delete_chapter(&mut self, id: EntityId) -> Result<(), ApiError> {
        self.check("delete_chapter", &id.to_string())?;
        self.record(format!("delete_chapter:{id}"));
        self.chapters
            .remove(&id)
            .ok_or_else(|| ApiError::NotFound(format!("chapter {id}")))?;
        self.pages.retain(|_, page| page.chapter_id != Some(id));
        Ok(())
    }

    fn create_page(&mut self, draft: &PageDraft) -> Result<Page, ApiError> {
        self.check("create_page", &draft.name)?;
        self.book_exists(draft.book_id)?;
        self.record(format!("create_page:{}", draft.name));
        let id = self.add_page(draft.book_id, None, &draft.name, "");
        let page = self
            .pages
            .get_mut(&id)
            .ok_or_else(|| ApiError::NotFound(id.to_string()))?;
        page.html = draft.html.clone();
        page.markdown = draft.markdown.clone();
        Ok(as_page(page))
    }

    fn update_page(&mut self, id: EntityId, draft: &PageDraft) -> Result<Page, ApiError> {
        self.check("update_page", &draft.name)?;
        self.record(format!("update_page:{id}"));
        if let Some(chapter_id) = draft.chapter_id
            && !self.chapters.contains_key(&chapter_id)
        {
            return Err(ApiError::NotFound(format!("chapter {chapter_id}")));
        }
        let page = self
            .pages
            .get_mut(&id)
            .ok_or_else(|| ApiError::NotFound(format!("page {id}")))?;
        page.book_id = draft.book_id;
        page.chapter_id = draft.chapter_id;
        page.name = draft.name.clone();
        if draft.html.is_some() || draft.markdown.is_some() {
            page.html = draft.html.clone();
            page.markdown = draft.markdown.clone();
        }
        Ok(as_page(page))
    }

    fn delete_page(&mut self, id: EntityId) -> Result<(), ApiError> {
        self.check("delete_page", &id.to_string())?;
        self.record(format!("delete_page:{id}"));
        self.pages
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| ApiError::NotFound(format!("page {id}")))
    }

    fn assign_owner(
        &mut self,
        kind: EntityKind,
        id: EntityId,
        user_id: EntityId,
    ) -> Result<(), ApiError> {
        self.check("assign_owner", &format!("{kind}:{id}"))?;
        self.record(format!("assign_owner:{kind}:{id}:{user_id}"));
        self.owners.insert((kind, id), user_id);
        match kind {
            EntityKind::Page => {
                if let Some(page) = self.pages.get_mut(&id) {
                    page.owned_by = Some(user_id);
                }
            }
            EntityKind::Chapter => {
                if let Some(chapter) = self.chapters.get_mut(&id) {
                    chapter.owned_by = Some(user_id);
                }
            }
            EntityKind::Book => {
                if let Some(book) = self.books.get_mut(&id) {
                    book.owned_by = Some(user_id);
                }
            }
            EntityKind::Shelf => {}
        }
        Ok(())
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}
