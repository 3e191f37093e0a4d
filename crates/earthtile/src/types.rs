//! Tile tree types.
//!
//! These types represent the decoded tileset documents (the serde
//! descriptors) and the run-time node records the manager keeps in its
//! arena.

use std::collections::HashSet;
use std::fmt;

use glam::{DMat3, DVec3};
use reqwest::Url;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Stable identity of a node within one manager.
///
/// Identifiers are handed out monotonically and never reused, so a stale id
/// held by an in-flight task can only miss, never alias another node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileId(pub(crate) u64);

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tile#{}", self.0)
    }
}

/// An oriented bounding box in the dataset's Z-up frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrientedBox {
    /// Center of the box.
    pub center: DVec3,
    /// Half-axis vectors, one per column.
    pub half_axes: DMat3,
}

impl OrientedBox {
    /// Build a box from the 12-number 3D Tiles layout: center followed by
    /// the x, y and z half-axis vectors.
    #[must_use]
    pub fn from_array(values: &[f64; 12]) -> Self {
        let [cx, cy, cz, xx, xy, xz, yx, yy, yz, zx, zy, zz] = *values;
        Self {
            center: DVec3::new(cx, cy, cz),
            half_axes: DMat3::from_cols(
                DVec3::new(xx, xy, xz),
                DVec3::new(yx, yy, yz),
                DVec3::new(zx, zy, zz),
            ),
        }
    }

    /// Length of the longest half-axis.
    #[must_use]
    pub fn max_half_extent(&self) -> f64 {
        self.half_axes
            .x_axis
            .length()
            .max(self.half_axes.y_axis.length())
            .max(self.half_axes.z_axis.length())
    }
}

/// What a content URI points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    /// Renderable content handed to the load/unload/show/hide handlers.
    Mesh,
    /// A nested tileset document whose root becomes this node's child.
    Subtree,
}

impl ContentKind {
    /// Classify a URI by the suffix of its path component.
    #[must_use]
    pub fn from_uri(uri: &str) -> Self {
        let path = uri.split(['?', '#']).next().unwrap_or(uri);
        if path.ends_with(".json") {
            ContentKind::Subtree
        } else {
            ContentKind::Mesh
        }
    }
}

/// A node's content reference.
#[derive(Debug, Clone, PartialEq)]
pub struct TileContent {
    /// URI as written in the tileset document.
    pub uri: String,
    /// Mesh or nested subtree.
    pub kind: ContentKind,
    /// Fully resolved request URL, including the API key and the session
    /// once one is established.
    pub url: Url,
}

/// Load lifecycle of a node's own content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentState {
    /// Nothing requested, or released again.
    #[default]
    Unloaded,
    /// A load or subtree fetch is in flight.
    Loading,
    /// The handler finished loading, or the subtree document was applied.
    Loaded,
}

/// One region of the dataset at one level of detail.
///
/// Handlers and visibility policies receive snapshots of this record.
#[derive(Debug, Clone)]
pub struct TileNode {
    pub(crate) id: TileId,
    pub(crate) bounding_box: Option<OrientedBox>,
    pub(crate) geometric_error: Option<f64>,
    pub(crate) content: Option<TileContent>,
    pub(crate) children: Vec<TileId>,
    /// Subtree roots that must finish expanding before our content hides.
    pub(crate) pending: HashSet<TileId>,
    /// Node whose `pending` set holds us.
    pub(crate) waiting_parent: Option<TileId>,
    pub(crate) state: ContentState,
    pub(crate) hidden: bool,
}

impl TileNode {
    /// Stable identity of this node.
    #[must_use]
    pub fn id(&self) -> TileId {
        self.id
    }

    /// Bounding box, if the descriptor had one.
    #[must_use]
    pub fn bounding_box(&self) -> Option<&OrientedBox> {
        self.bounding_box.as_ref()
    }

    /// Geometric error from the descriptor.
    #[must_use]
    pub fn geometric_error(&self) -> Option<f64> {
        self.geometric_error
    }

    /// Content reference, if any.
    #[must_use]
    pub fn content(&self) -> Option<&TileContent> {
        self.content.as_ref()
    }

    /// Content URI, if any.
    #[must_use]
    pub fn content_uri(&self) -> Option<&str> {
        self.content.as_ref().map(|c| c.uri.as_str())
    }

    /// Whether the node carries renderable mesh content.
    #[must_use]
    pub fn has_mesh(&self) -> bool {
        self.content
            .as_ref()
            .is_some_and(|c| c.kind == ContentKind::Mesh)
    }

    /// Child node ids, in document order.
    #[must_use]
    pub fn children(&self) -> &[TileId] {
        &self.children
    }

    /// Whether this node currently has children, i.e. is an expandable subtree.
    #[must_use]
    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    /// Number of fetched subtree roots still gating this node's hide.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// The node this one will release once it has expanded.
    #[must_use]
    pub fn waiting_parent(&self) -> Option<TileId> {
        self.waiting_parent
    }

    /// Load lifecycle of the node's content.
    #[must_use]
    pub fn state(&self) -> ContentState {
        self.state
    }

    /// Whether the node's content is suppressed in favour of its children.
    #[must_use]
    pub fn is_hidden(&self) -> bool {
        self.hidden
    }
}

/// A tileset document: only `root` matters for streaming.
#[derive(Debug, Clone, Deserialize)]
pub struct TilesetDocument {
    /// Root tile descriptor.
    pub root: TileDescriptor,
}

impl TilesetDocument {
    /// Parse a tileset document from a JSON body.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// A tile as described in a tileset document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileDescriptor {
    /// Bounding volume; only the `box` form is understood.
    #[serde(default)]
    pub bounding_volume: Option<BoundingVolumeDescriptor>,
    /// Geometric error in meters.
    #[serde(default)]
    pub geometric_error: Option<f64>,
    /// Content reference.
    #[serde(default)]
    pub content: Option<ContentDescriptor>,
    /// Child tiles.
    #[serde(default)]
    pub children: Vec<TileDescriptor>,
}

/// Bounding volume of a descriptor.
#[derive(Debug, Clone, Deserialize)]
pub struct BoundingVolumeDescriptor {
    /// Center plus three half-axis vectors.
    #[serde(rename = "box", default)]
    pub bbox: Option<[f64; 12]>,
}

/// Content reference of a descriptor.
#[derive(Debug, Clone, Deserialize)]
pub struct ContentDescriptor {
    /// Content URI, relative to the API base URL.
    pub uri: String,
}

impl TileDescriptor {
    /// Oriented box of this descriptor, if it has one.
    #[must_use]
    pub fn oriented_box(&self) -> Option<OrientedBox> {
        self.bounding_volume
            .as_ref()
            .and_then(|v| v.bbox.as_ref())
            .map(OrientedBox::from_array)
    }
}

/// Counters describing the manager's current tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TileStats {
    /// Nodes alive in the arena.
    pub nodes: usize,
    /// Nodes currently expanded.
    pub expanded: usize,
    /// Nodes whose content is loaded.
    pub loaded: usize,
    /// Nodes whose content is in flight.
    pub loading: usize,
    /// Nodes whose content is hidden behind loaded children.
    pub hidden: usize,
}

pub(crate) fn invalid_uri(uri: &str, e: impl fmt::Display) -> Error {
    Error::InvalidData {
        context: "content uri",
        detail: format!("{uri}: {e}"),
    }
}
