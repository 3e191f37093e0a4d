//! Arena holding the tile tree and the expanded set.
//!
//! Nodes reference each other only by [`TileId`]: children by list, and the
//! hide-dependency pair by `pending` on the parent and `waiting_parent` on
//! the child. All mutation goes through this type so the pair stays matched.

use std::collections::{HashMap, HashSet};

use crate::error::Result;
use crate::fetch::Endpoint;
use crate::types::{ContentKind, ContentState, TileContent, TileDescriptor, TileId, TileNode, TileStats};

#[derive(Debug, Default)]
pub(crate) struct TileTree {
    nodes: HashMap<TileId, TileNode>,
    expanded: HashSet<TileId>,
    root: Option<TileId>,
    next_id: u64,
}

impl TileTree {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn root(&self) -> Option<TileId> {
        self.root
    }

    pub(crate) fn set_root(&mut self, id: TileId) {
        self.root = Some(id);
    }

    pub(crate) fn get(&self, id: TileId) -> Option<&TileNode> {
        self.nodes.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: TileId) -> Option<&mut TileNode> {
        self.nodes.get_mut(&id)
    }

    pub(crate) fn contains(&self, id: TileId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub(crate) fn is_expanded(&self, id: TileId) -> bool {
        self.expanded.contains(&id)
    }

    /// Returns false if the node was already expanded.
    pub(crate) fn mark_expanded(&mut self, id: TileId) -> bool {
        self.expanded.insert(id)
    }

    pub(crate) fn unmark_expanded(&mut self, id: TileId) {
        self.expanded.remove(&id);
    }

    /// Expanded ids in a stable order, detached from the live set.
    pub(crate) fn expanded_snapshot(&self) -> Vec<TileId> {
        let mut ids: Vec<TileId> = self.expanded.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Direct children of `id` that carry content.
    pub(crate) fn children_with_content(&self, id: TileId) -> Vec<TileId> {
        let Some(node) = self.nodes.get(&id) else {
            return Vec::new();
        };
        node.children
            .iter()
            .copied()
            .filter(|child| self.nodes.get(child).is_some_and(|c| c.content.is_some()))
            .collect()
    }

    /// Build nodes for a descriptor and everything below it.
    ///
    /// Nothing is inserted unless the whole descriptor resolves.
    pub(crate) fn insert_descriptor(
        &mut self,
        descriptor: &TileDescriptor,
        endpoint: &Endpoint,
        session: Option<&str>,
    ) -> Result<TileId> {
        let mut built = Vec::new();
        let id = self.build(descriptor, endpoint, session, &mut built)?;
        self.nodes
            .extend(built.into_iter().map(|node| (node.id, node)));
        Ok(id)
    }

    fn build(
        &mut self,
        descriptor: &TileDescriptor,
        endpoint: &Endpoint,
        session: Option<&str>,
        out: &mut Vec<TileNode>,
    ) -> Result<TileId> {
        let id = TileId(self.next_id);
        self.next_id += 1;

        let content = match &descriptor.content {
            Some(c) => Some(TileContent {
                uri: c.uri.clone(),
                kind: ContentKind::from_uri(&c.uri),
                url: endpoint.content_url(&c.uri, session)?,
            }),
            None => None,
        };

        let children = descriptor
            .children
            .iter()
            .map(|child| self.build(child, endpoint, session, out))
            .collect::<Result<Vec<_>>>()?;

        out.push(TileNode {
            id,
            bounding_box: descriptor.oriented_box(),
            geometric_error: descriptor.geometric_error,
            content,
            children,
            pending: HashSet::new(),
            waiting_parent: None,
            state: ContentState::Unloaded,
            hidden: false,
        });
        Ok(id)
    }

    /// Make `child`'s expansion a precondition for hiding `parent`.
    pub(crate) fn register_dependency(&mut self, parent: TileId, child: TileId) {
        let Some(parent_node) = self.nodes.get_mut(&parent) else {
            return;
        };
        parent_node.pending.insert(child);
        if let Some(child_node) = self.nodes.get_mut(&child) {
            child_node.waiting_parent = Some(parent);
        }
    }

    /// Clear `child`'s dependency pair.
    ///
    /// Returns the parent when this emptied its pending set.
    pub(crate) fn release_dependency(&mut self, child: TileId) -> Option<TileId> {
        let parent = self.nodes.get_mut(&child)?.waiting_parent.take()?;
        let parent_node = self.nodes.get_mut(&parent)?;
        if parent_node.pending.remove(&child) && parent_node.pending.is_empty() {
            Some(parent)
        } else {
            None
        }
    }

    /// Remove every descendant of `id` from the arena and return them.
    ///
    /// Destroyed nodes leave the expanded set, and any dependency pair with
    /// one end inside the destroyed subtree is cleared on the surviving end.
    pub(crate) fn destroy_children(&mut self, id: TileId) -> Vec<TileNode> {
        let Some(node) = self.nodes.get_mut(&id) else {
            return Vec::new();
        };
        let mut stack = std::mem::take(&mut node.children);
        let mut destroyed = Vec::new();

        while let Some(current) = stack.pop() {
            let Some(removed) = self.nodes.remove(&current) else {
                continue;
            };
            self.expanded.remove(&current);
            stack.extend(removed.children.iter().copied());

            if let Some(parent) = removed.waiting_parent {
                if let Some(parent_node) = self.nodes.get_mut(&parent) {
                    parent_node.pending.remove(&current);
                }
            }
            for waiting in &removed.pending {
                if let Some(waiting_node) = self.nodes.get_mut(waiting) {
                    waiting_node.waiting_parent = None;
                }
            }
            destroyed.push(removed);
        }

        destroyed
    }

    pub(crate) fn stats(&self) -> TileStats {
        let mut stats = TileStats {
            nodes: self.nodes.len(),
            expanded: self.expanded.len(),
            ..TileStats::default()
        };
        for node in self.nodes.values() {
            match node.state {
                ContentState::Loaded => stats.loaded += 1,
                ContentState::Loading => stats.loading += 1,
                ContentState::Unloaded => {}
            }
            if node.hidden {
                stats.hidden += 1;
            }
        }
        stats
    }
}
