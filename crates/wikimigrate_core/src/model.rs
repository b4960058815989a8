use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Destination ids are integers that are only unique per entity kind.
/// Negative values are dry-run placeholders and never reach the remote API.
pub type EntityId = i64;

pub fn is_placeholder(id: EntityId) -> bool {
    id < 0
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AncestorRef {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceIdentity {
    pub account_id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

/// One page fetched from the source wiki. `ancestors` is root-first and its
/// length is the node's depth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceNode {
    pub id: String,
    pub title: String,
    pub ancestors: Vec<AncestorRef>,
    pub body: String,
    pub created_by: Option<SourceIdentity>,
}

impl SourceNode {
    pub fn depth(&self) -> usize {
        self.ancestors.len()
    }

    pub fn parent(&self) -> Option<&AncestorRef> {
        self.ancestors.last()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    BookRoot,
    Chapter,
    Leaf,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BookRoot => "book",
            Self::Chapter => "chapter",
            Self::Leaf => "page",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassifiedNode {
    pub node: SourceNode,
    pub role: Role,
    pub has_children: bool,
    pub phantom: bool,
}

impl ClassifiedNode {
    pub fn id(&self) -> &str {
        &self.node.id
    }

    pub fn title(&self) -> &str {
        &self.node.title
    }

    pub fn depth(&self) -> usize {
        self.node.depth()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Shelf,
    Book,
    Chapter,
    Page,
}

impl EntityKind {
    /// Path segment used by the content-permissions endpoint.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shelf => "bookshelf",
            Self::Book => "book",
            Self::Chapter => "chapter",
            Self::Page => "page",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: EntityId,
}

impl EntityRef {
    pub fn book(id: EntityId) -> Self {
        Self {
            kind: EntityKind::Book,
            id,
        }
    }

    pub fn chapter(id: EntityId) -> Self {
        Self {
            kind: EntityKind::Chapter,
            id,
        }
    }

    pub fn page(id: EntityId) -> Self {
        Self {
            kind: EntityKind::Page,
            id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shelf {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub books: Vec<EntityId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub owned_by: Option<EntityId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub id: EntityId,
    pub book_id: EntityId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub owned_by: Option<EntityId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub id: EntityId,
    pub book_id: EntityId,
    #[serde(default)]
    pub chapter_id: Option<EntityId>,
    pub name: String,
    #[serde(default)]
    pub owned_by: Option<EntityId>,
}

/// Full page payload; the list endpoints omit the body fields.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PageDetail {
    pub id: EntityId,
    pub book_id: EntityId,
    #[serde(default)]
    pub chapter_id: Option<EntityId>,
    pub name: String,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub markdown: Option<String>,
    #[serde(default)]
    pub owned_by: Option<EntityId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationUser {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct BookDraft {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ChapterDraft {
    pub book_id: EntityId,
    pub name: String,
    pub description: String,
    pub owner_id: Option<EntityId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct PageDraft {
    pub book_id: EntityId,
    pub chapter_id: Option<EntityId>,
    pub name: String,
    pub html: Option<String>,
    pub markdown: Option<String>,
    pub owner_id: Option<EntityId>,
}

/// Run-scoped source id -> destination entity map. Built in tree order and
/// rewritten in place when duplicate books are merged.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IdentityMap {
    entries: BTreeMap<String, EntityRef>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, source_id: impl Into<String>, target: EntityRef) {
        self.entries.insert(source_id.into(), target);
    }

    pub fn get(&self, source_id: &str) -> Option<EntityRef> {
        self.entries.get(source_id).copied()
    }

    pub fn book_id(&self, source_id: &str) -> Option<EntityId> {
        self.get(source_id)
            .filter(|target| target.kind == EntityKind::Book)
            .map(|target| target.id)
    }

    pub fn chapter_id(&self, source_id: &str) -> Option<EntityId> {
        self.get(source_id)
            .filter(|target| target.kind == EntityKind::Chapter)
            .map(|target| target.id)
    }

    /// Rewrite every entry pointing at `from` to point at `to`. Returns the
    /// number of rewritten entries.
    pub fn retarget(&mut self, from: EntityRef, to: EntityRef) -> usize {
        let mut rewritten = 0;
        for target in self.entries.values_mut() {
            if *target == from {
                *target = to;
                rewritten += 1;
            }
        }
        rewritten
    }

    pub fn contains_target(&self, target: EntityRef) -> bool {
        self.entries.values().any(|value| *value == target)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &EntityRef)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_is_ancestor_count() {
        let node = SourceNode {
            id: "3".to_string(),
            title: "C".to_string(),
            ancestors: vec![
                AncestorRef {
                    id: "1".to_string(),
                    title: "A".to_string(),
                },
                AncestorRef {
                    id: "2".to_string(),
                    title: "B".to_string(),
                },
            ],
            body: String::new(),
            created_by: None,
        };
        assert_eq!(node.depth(), 2);
        assert_eq!(node.parent().map(|parent| parent.id.as_str()), Some("2"));
    }

    #[test]
    fn retarget_rewrites_only_matching_kind_and_id() {
        let mut map = IdentityMap::new();
        map.insert("a", EntityRef::book(7));
        map.insert("b", EntityRef::book(7));
        map.insert("c", EntityRef::chapter(7));
        map.insert("d", EntityRef::book(9));

        let rewritten = map.retarget(EntityRef::book(7), EntityRef::book(3));

        assert_eq!(rewritten, 2);
        assert_eq!(map.book_id("a"), Some(3));
        assert_eq!(map.book_id("b"), Some(3));
        assert_eq!(map.chapter_id("c"), Some(7));
        assert_eq!(map.book_id("d"), Some(9));
        assert!(!map.contains_target(EntityRef::book(7)));
    }

    #[test]
    fn typed_lookups_filter_by_kind() {
        let mut map = IdentityMap::new();
        map.insert("x", EntityRef::page(4));
        assert_eq!(map.book_id("x"), None);
        assert_eq!(map.chapter_id("x"), None);
        assert_eq!(map.get("x"), Some(EntityRef::page(4)));
        assert!(is_placeholder(-1));
        assert!(!is_placeholder(1));
    }
}
