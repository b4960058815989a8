use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;

use crate::model::{ClassifiedNode, Role, SourceNode};

/// Deepest ancestor chain length at which a node with children still becomes
/// its own book.
pub const MAX_BOOK_ROOT_DEPTH: usize = 2;

/// Classified source tree in breadth order (ascending depth, then discovery
/// order). Ancestor chains must be acyclic; a cycle is a caller bug.
#[derive(Debug, Clone, Default)]
pub struct SourceTree {
    nodes: Vec<ClassifiedNode>,
    positions: HashMap<String, usize>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TreeStats {
    pub total: usize,
    pub phantoms: usize,
    pub book_roots: usize,
    pub chapters: usize,
    pub leaves: usize,
    pub max_depth: usize,
}

pub fn classify_role(depth: usize, has_children: bool) -> Role {
    match (has_children, depth <= MAX_BOOK_ROOT_DEPTH) {
        (true, true) => Role::BookRoot,
        (true, false) => Role::Chapter,
        (false, _) => Role::Leaf,
    }
}

pub fn classify(nodes: Vec<SourceNode>) -> SourceTree {
    // Pass 1: index fetched nodes, then synthesize every missing ancestor.
    let mut ordered: Vec<(SourceNode, bool)> = Vec::with_capacity(nodes.len());
    let mut seen: HashSet<String> = HashSet::new();
    for node in nodes {
        if seen.insert(node.id.clone()) {
            ordered.push((node, false));
        }
    }

    let mut phantoms = Vec::new();
    for (node, _) in &ordered {
        for (position, ancestor) in node.ancestors.iter().enumerate() {
            if seen.insert(ancestor.id.clone()) {
                phantoms.push(SourceNode {
                    id: ancestor.id.clone(),
                    title: ancestor.title.clone(),
                    ancestors: node.ancestors[..position].to_vec(),
                    body: String::new(),
                    created_by: None,
                });
            }
        }
    }
    ordered.extend(phantoms.into_iter().map(|node| (node, true)));

    // Pass 2: parent links decide has_children, then roles.
    let parents: HashSet<String> = ordered
        .iter()
        .filter_map(|(node, _)| node.parent().map(|parent| parent.id.clone()))
        .collect();

    let mut classified: Vec<(usize, ClassifiedNode)> = ordered
        .into_iter()
        .enumerate()
        .map(|(discovery, (node, phantom))| {
            let has_children = parents.contains(&node.id);
            let role = classify_role(node.depth(), has_children);
            (
                discovery,
                ClassifiedNode {
                    node,
                    role,
                    has_children,
                    phantom,
                },
            )
        })
        .collect();
    classified.sort_by_key(|(discovery, item)| (item.depth(), *discovery));

    let nodes: Vec<ClassifiedNode> = classified.into_iter().map(|(_, item)| item).collect();
    let positions = nodes
        .iter()
        .enumerate()
        .map(|(index, item)| (item.node.id.clone(), index))
        .collect();
    SourceTree { nodes, positions }
}

impl SourceTree {
    pub fn nodes(&self) -> &[ClassifiedNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ClassifiedNode> {
        self.positions.get(id).map(|index| &self.nodes[*index])
    }

    pub fn role_of(&self, id: &str) -> Option<Role> {
        self.get(id).map(|item| item.role)
    }

    pub fn with_role(&self, role: Role) -> impl Iterator<Item = &ClassifiedNode> {
        self.nodes.iter().filter(move |item| item.role == role)
    }

    /// Closest BookRoot strictly above `node`, walking from the immediate
    /// parent outward.
    pub fn nearest_book_root(&self, node: &ClassifiedNode) -> Option<&ClassifiedNode> {
        node.node
            .ancestors
            .iter()
            .rev()
            .filter_map(|ancestor| self.get(&ancestor.id))
            .find(|ancestor| ancestor.role == Role::BookRoot)
    }

    /// Chapter ancestors of `node` between it and its book root, nearest
    /// first.
    pub fn chapter_ancestors<'a>(&'a self, node: &'a ClassifiedNode) -> Vec<&'a ClassifiedNode> {
        let mut chapters = Vec::new();
        for ancestor in node.node.ancestors.iter().rev() {
            let Some(item) = self.get(&ancestor.id) else {
                continue;
            };
            match item.role {
                Role::BookRoot => break,
                Role::Chapter => chapters.push(item),
                Role::Leaf => {}
            }
        }
        chapters
    }

    pub fn stats(&self) -> TreeStats {
        let mut stats = TreeStats {
            total: self.nodes.len(),
            ..TreeStats::default()
        };
        for item in &self.nodes {
            if item.phantom {
                stats.phantoms += 1;
            }
            match item.role {
                Role::BookRoot => stats.book_roots += 1,
                Role::Chapter => stats.chapters += 1,
                Role::Leaf => stats.leaves += 1,
            }
            stats.max_depth = stats.max_depth.max(item.depth());
        }
        stats
    }

    /// Node ids grouped by depth, for plan rendering.
    pub fn levels(&self) -> BTreeMap<usize, Vec<&ClassifiedNode>> {
        let mut levels: BTreeMap<usize, Vec<&ClassifiedNode>> = BTreeMap::new();
        for item in &self.nodes {
            levels.entry(item.depth()).or_default().push(item);
        }
        levels
    }
}
