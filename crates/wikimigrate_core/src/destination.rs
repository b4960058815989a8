use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, RETRY_AFTER, USER_AGENT};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;

use crate::config::DestinationSettings;
use crate::error::ApiError;
use crate::model::{
    Book, BookDraft, Chapter, ChapterDraft, DestinationUser, EntityId, EntityKind, Page,
    PageDetail, PageDraft, Shelf,
};

pub const LIST_PAGE_SIZE: usize = 500;
const ERROR_BODY_LIMIT: usize = 500;

/// The destination wiki's REST surface. Every call is a single request (or a
/// paginated listing); pacing and retries live in the caller.
pub trait DestinationApi {
    fn list_books(&mut self) -> Result<Vec<Book>, ApiError>;
    /// Shelves without their member lists; see [`DestinationApi::get_shelf`].
    fn list_shelves(&mut self) -> Result<Vec<Shelf>, ApiError>;
    fn get_shelf(&mut self, id: EntityId) -> Result<Shelf, ApiError>;
    fn list_chapters(&mut self, book_id: Option<EntityId>) -> Result<Vec<Chapter>, ApiError>;
    fn list_pages(&mut self, book_id: Option<EntityId>) -> Result<Vec<Page>, ApiError>;
    fn get_page(&mut self, id: EntityId) -> Result<PageDetail, ApiError>;
    fn list_users(&mut self) -> Result<Vec<DestinationUser>, ApiError>;

    fn create_shelf(&mut self, name: &str, books: &[EntityId]) -> Result<Shelf, ApiError>;
    /// Replaces the full member list.
    fn update_shelf_books(&mut self, id: EntityId, books: &[EntityId]) -> Result<(), ApiError>;
    fn delete_shelf(&mut self, id: EntityId) -> Result<(), ApiError>;

    fn create_book(&mut self, draft: &BookDraft) -> Result<Book, ApiError>;
    fn delete_book(&mut self, id: EntityId) -> Result<(), ApiError>;

    fn create_chapter(&mut self, draft: &ChapterDraft) -> Result<Chapter, ApiError>;
    fn update_chapter(&mut self, id: EntityId, draft: &ChapterDraft)
    -> Result<Chapter, ApiError>;
    fn delete_chapter(&mut self, id: EntityId) -> Result<(), ApiError>;

    fn create_page(&mut self, draft: &PageDraft) -> Result<Page, ApiError>;
    fn update_page(&mut self, id: EntityId, draft: &PageDraft) -> Result<Page, ApiError>;
    fn delete_page(&mut self, id: EntityId) -> Result<(), ApiError>;

    fn assign_owner(
        &mut self,
        kind: EntityKind,
        id: EntityId,
        user_id: EntityId,
    ) -> Result<(), ApiError>;

    fn request_count(&self) -> usize;
}

pub struct BookStackClient {
    client: Client,
    settings: DestinationSettings,
    request_count: usize,
}

impl BookStackClient {
    pub fn new(settings: DestinationSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .context("failed to build BookStack HTTP client")?;
        Ok(Self {
            client,
            settings,
            request_count: 0,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/api/{}", self.settings.host, path.trim_start_matches('/'));
        self.client
            .request(method, url)
            .header(
                AUTHORIZATION,
                format!(
                    "Token {}:{}",
                    self.settings.token_id, self.settings.token_secret
                ),
            )
            .header(USER_AGENT, self.settings.user_agent.clone())
    }

    fn send(&mut self, request: RequestBuilder) -> Result<Response, ApiError> {
        self.request_count += 1;
        let response = request.send()?;
        check_status(response)
    }

    fn get_json<T: DeserializeOwned>(
        &mut self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let request = self.request(Method::GET, path).query(query);
        let response = self.send(request)?;
        decode(response)
    }

    fn send_json<T: DeserializeOwned>(
        &mut self,
        method: Method,
        path: &str,
        body: &Value,
    ) -> Result<T, ApiError> {
        let request = self.request(method, path).json(body);
        let response = self.send(request)?;
        decode(response)
    }

    fn send_delete(&mut self, path: &str) -> Result<(), ApiError> {
        let request = self.request(Method::DELETE, path);
        self.send(request)?;
        Ok(())
    }

    fn list_all<T: DeserializeOwned>(
        &mut self,
        path: &str,
        filters: &[(&str, String)],
    ) -> Result<Vec<T>, ApiError> {
        let mut items = Vec::new();
        let mut offset = 0usize;
        loop {
            let mut query: Vec<(&str, String)> = vec![
                ("count", LIST_PAGE_SIZE.to_string()),
                ("offset", offset.to_string()),
            ];
            query.extend(filters.iter().cloned());
            let page: ListResponse<T> = self.get_json(path, &query)?;
            let fetched = page.data.len();
            items.extend(page.data);
            offset += fetched;
            debug!(path, fetched, offset, "listed destination entities");
            let exhausted = page.total.is_some_and(|total| offset >= total);
            if fetched < LIST_PAGE_SIZE || exhausted {
                break;
            }
        }
        Ok(items)
    }
}

impl DestinationApi for BookStackClient {
    fn list_books(&mut self) -> Result<Vec<Book>, ApiError> {
        let books: Vec<WireBook> = self.list_all("books", &[])?;
        Ok(books.into_iter().map(WireBook::into_book).collect())
    }

    fn list_shelves(&mut self) -> Result<Vec<Shelf>, ApiError> {
        let shelves: Vec<WireShelf> = self.list_all("shelves", &[])?;
        Ok(shelves.into_iter().map(WireShelf::into_shelf).collect())
    }

    fn get_shelf(&mut self, id: EntityId) -> Result<Shelf, ApiError> {
        let shelf: WireShelf = self.get_json(&format!("shelves/{id}"), &[])?;
        Ok(shelf.into_shelf())
    }

    fn list_chapters(&mut self, book_id: Option<EntityId>) -> Result<Vec<Chapter>, ApiError> {
        let filters = book_filter(book_id);
        let chapters: Vec<WireChapter> = self.list_all("chapters", &filters)?;
        Ok(chapters.into_iter().map(WireChapter::into_chapter).collect())
    }

    fn list_pages(&mut self, book_id: Option<EntityId>) -> Result<Vec<Page>, ApiError> {
        let filters = book_filter(book_id);
        let pages: Vec<WirePage> = self.list_all("pages", &filters)?;
        Ok(pages.into_iter().map(WirePage::into_page).collect())
    }

    fn get_page(&mut self, id: EntityId) -> Result<PageDetail, ApiError> {
        let page: WirePage = self.get_json(&format!("pages/{id}"), &[])?;
        Ok(page.into_detail())
    }

    fn list_users(&mut self) -> Result<Vec<DestinationUser>, ApiError> {
        self.list_all("users", &[])
    }

    fn create_shelf(&mut self, name: &str, books: &[EntityId]) -> Result<Shelf, ApiError> {
        let shelf: WireShelf = self.send_json(
            Method::POST,
            "shelves",
            &json!({ "name": name, "books": books }),
        )?;
        Ok(shelf.into_shelf())
    }

    fn update_shelf_books(&mut self, id: EntityId, books: &[EntityId]) -> Result<(), ApiError> {
        let _: Value = self.send_json(
            Method::PUT,
            &format!("shelves/{id}"),
            &json!({ "books": books }),
        )?;
        Ok(())
    }

    fn delete_shelf(&mut self, id: EntityId) -> Result<(), ApiError> {
        self.send_delete(&format!("shelves/{id}"))
    }

    fn create_book(&mut self, draft: &BookDraft) -> Result<Book, ApiError> {
        let book: WireBook = self.send_json(
            Method::POST,
            "books",
            &json!({ "name": draft.name, "description": draft.description }),
        )?;
        Ok(book.into_book())
    }

    fn delete_book(&mut self, id: EntityId) -> Result<(), ApiError> {
        self.send_delete(&format!("books/{id}"))
    }

    fn create_chapter(&mut self, draft: &ChapterDraft) -> Result<Chapter, ApiError> {
        let chapter: WireChapter =
            self.send_json(Method::POST, "chapters", &chapter_payload(draft))?;
        Ok(chapter.into_chapter())
    }

    fn update_chapter(
        &mut self,
        id: EntityId,
        draft: &ChapterDraft,
    ) -> Result<Chapter, ApiError> {
        let chapter: WireChapter = self.send_json(
            Method::PUT,
            &format!("chapters/{id}"),
            &chapter_payload(draft),
        )?;
        Ok(chapter.into_chapter())
    }

    fn delete_chapter(&mut self, id: EntityId) -> Result<(), ApiError> {
        self.send_delete(&format!("chapters/{id}"))
    }

    fn create_page(&mut self, draft: &PageDraft) -> Result<Page, ApiError> {
        let page: WirePage = self.send_json(Method::POST, "pages", &page_payload(draft))?;
        Ok(page.into_page())
    }

    fn update_page(&mut self, id: EntityId, draft: &PageDraft) -> Result<Page, ApiError> {
        let page: WirePage =
            self.send_json(Method::PUT, &format!("pages/{id}"), &page_payload(draft))?;
        Ok(page.into_page())
    }

    fn delete_page(&mut self, id: EntityId) -> Result<(), ApiError> {
        self.send_delete(&format!("pages/{id}"))
    }

    fn assign_owner(
        &mut self,
        kind: EntityKind,
        id: EntityId,
        user_id: EntityId,
    ) -> Result<(), ApiError> {
        let _: Value = self.send_json(
            Method::PUT,
            &format!("content-permissions/{}/{id}", kind.as_str()),
            &json!({ "owner_id": user_id }),
        )?;
        Ok(())
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

fn book_filter(book_id: Option<EntityId>) -> Vec<(&'static str, String)> {
    book_id
        .map(|id| vec![("filter[book_id]", id.to_string())])
        .unwrap_or_default()
}

fn chapter_payload(draft: &ChapterDraft) -> Value {
    json!({
        "book_id": draft.book_id,
        "name": draft.name,
        "description": draft.description,
    })
}

fn page_payload(draft: &PageDraft) -> Value {
    let mut payload = json!({ "book_id": draft.book_id, "name": draft.name });
    if let Some(chapter_id) = draft.chapter_id {
        payload["chapter_id"] = json!(chapter_id);
    }
    // No body at all means "keep the current one" on update.
    match (&draft.markdown, &draft.html) {
        (Some(markdown), _) => payload["markdown"] = json!(markdown),
        (None, Some(html)) => payload["html"] = json!(html),
        (None, None) => {}
    }
    payload
}

fn check_status(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());
        return Err(ApiError::RateLimited { retry_after_secs });
    }

    let mut body = response.text().unwrap_or_default();
    if body.len() > ERROR_BODY_LIMIT {
        let mut cut = ERROR_BODY_LIMIT;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    Err(match status {
        StatusCode::NOT_FOUND => ApiError::NotFound(body),
        StatusCode::REQUEST_TIMEOUT
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => ApiError::Transient(format!("HTTP {status}")),
        _ => ApiError::Http {
            status: status.as_u16(),
            body,
        },
    })
}

fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let bytes = response.bytes()?;
    if bytes.is_empty() {
        return serde_json::from_slice(b"null").map_err(|error| ApiError::Decode(error.to_string()));
    }
    serde_json::from_slice(&bytes).map_err(|error| ApiError::Decode(error.to_string()))
}

/// BookStack returns `owned_by` as an id in listings and as an object on
/// single-entity reads.
fn owner_id(value: &Option<Value>) -> Option<EntityId> {
    let value = value.as_ref()?;
    value
        .as_i64()
        .or_else(|| value.get("id").and_then(Value::as_i64))
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    data: Vec<T>,
    #[serde(default)]
    total: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct WireBook {
    id: EntityId,
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    owned_by: Option<Value>,
}

impl WireBook {
    fn into_book(self) -> Book {
        Book {
            owned_by: owner_id(&self.owned_by),
            id: self.id,
            name: self.name,
            description: self.description.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireShelfBook {
    id: EntityId,
}

#[derive(Debug, Deserialize)]
struct WireShelf {
    id: EntityId,
    name: String,
    #[serde(default)]
    books: Vec<WireShelfBook>,
}

impl WireShelf {
    fn into_shelf(self) -> Shelf {
        Shelf {
            id: self.id,
            name: self.name,
            books: self.books.into_iter().map(|book| book.id).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireChapter {
    id: EntityId,
    book_id: EntityId,
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    owned_by: Option<Value>,
}

impl WireChapter {
    fn into_chapter(self) -> Chapter {
        Chapter {
            owned_by: owner_id(&self.owned_by),
            id: self.id,
            book_id: self.book_id,
            name: self.name,
            description: self.description.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WirePage {
    id: EntityId,
    book_id: EntityId,
    #[serde(default)]
    chapter_id: Option<EntityId>,
    name: String,
    #[serde(default)]
    html: Option<String>,
    #[serde(default)]
    markdown: Option<String>,
    #[serde(default)]
    owned_by: Option<Value>,
}

impl WirePage {
    /// Pages outside a chapter report `chapter_id: 0`.
    fn chapter(&self) -> Option<EntityId> {
        self.chapter_id.filter(|id| *id > 0)
    }

    fn into_page(self) -> Page {
        Page {
            chapter_id: self.chapter(),
            owned_by: owner_id(&self.owned_by),
            id: self.id,
            book_id: self.book_id,
            name: self.name,
        }
    }

    fn into_detail(self) -> PageDetail {
        PageDetail {
            chapter_id: self.chapter(),
            owned_by: owner_id(&self.owned_by),
            id: self.id,
            book_id: self.book_id,
            name: self.name,
            html: self.html,
            markdown: self.markdown.filter(|markdown| !markdown.is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_payload_prefers_markdown_and_sets_chapter() {
        let draft = PageDraft {
            book_id: 4,
            chapter_id: Some(9),
            name: "Runbook".to_string(),
            html: Some("<p>x</p>".to_string()),
            markdown: Some("# x".to_string()),
            owner_id: None,
        };
        let payload = page_payload(&draft);
        assert_eq!(payload["chapter_id"], json!(9));
        assert_eq!(payload["book_id"], json!(4));
        assert_eq!(payload["markdown"], json!("# x"));
        assert!(payload.get("html").is_none());

        let bare = page_payload(&PageDraft {
            book_id: 4,
            name: "Empty".to_string(),
            ..PageDraft::default()
        });
        assert!(bare.get("chapter_id").is_none());
        assert!(bare.get("html").is_none() && bare.get("markdown").is_none());
    }

    #[test]
    fn wire_page_maps_zero_chapter_and_owner_object() {
        let page: WirePage = serde_json::from_value(json!({
            "id": 10,
            "book_id": 2,
            "chapter_id": 0,
            "name": "Loose",
            "html": "<p>hi</p>",
            "markdown": "",
            "owned_by": { "id": 7, "name": "Alice" }
        }))
        .expect("decode page");
        let detail = page.into_detail();
        assert_eq!(detail.chapter_id, None);
        assert_eq!(detail.owned_by, Some(7));
        assert_eq!(detail.markdown, None);
        assert_eq!(detail.html.as_deref(), Some("<p>hi</p>"));
    }

    #[test]
    fn list_response_decodes_books_with_numeric_owner() {
        let listing: ListResponse<WireBook> = serde_json::from_value(json!({
            "data": [
                { "id": 1, "name": "Ops", "owned_by": 3 },
                { "id": 2, "name": "Dev", "description": "team docs" }
            ],
            "total": 2
        }))
        .expect("decode listing");
        let books: Vec<Book> = listing.data.into_iter().map(WireBook::into_book).collect();
        assert_eq!(books[0].owned_by, Some(3));
        assert_eq!(books[1].description, "team docs");
        assert_eq!(listing.total, Some(2));
    }

    #[test]
    fn shelf_members_flatten_to_ids() {
        let shelf: WireShelf = serde_json::from_value(json!({
            "id": 5,
            "name": "Engineering",
            "books": [{ "id": 1, "name": "Ops" }, { "id": 2, "name": "Dev" }]
        }))
        .expect("decode shelf");
        assert_eq!(shelf.into_shelf().books, vec![1, 2]);
    }
}
