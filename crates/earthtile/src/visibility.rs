//! Visibility policies deciding which nodes stay expanded.
//!
//! A policy is consulted every tick for each expanded node and for each of
//! its expandable children. It is a pure function of the node and the camera.

use glam::DVec3;

use crate::geodetic::z_up_to_y_up;
use crate::types::TileNode;

/// Default multiplier applied to a node's extent to get its switch distance.
pub const DEFAULT_RANGE_MULTIPLIER: f64 = 4.0;

/// Default floor for a node's extent, so tiny tiles do not thrash.
pub const DEFAULT_MIN_EXTENT: f64 = 100.0;

/// Decides whether a node should be expanded for a given camera position.
pub trait VisibilityPolicy: Send + Sync {
    /// Whether the node is inside the view. The default accepts everything.
    fn in_view(&self, _tile: &TileNode) -> bool {
        true
    }

    /// Whether the camera is close enough to prefer the node's children.
    fn in_range(&self, tile: &TileNode, camera: DVec3) -> bool;

    /// Combined test used by the manager.
    fn accepts(&self, tile: &TileNode, camera: DVec3) -> bool {
        self.in_view(tile) && self.in_range(tile, camera)
    }
}

/// Camera-distance policy: a node stays expanded while the camera is closer
/// than `range_multiplier × max(longest half-axis, min_extent)` to its center.
#[derive(Debug, Clone, Copy)]
pub struct DistancePolicy {
    /// Multiplier on the node's extent.
    pub range_multiplier: f64,
    /// Floor on the node's extent.
    pub min_extent: f64,
}

impl Default for DistancePolicy {
    fn default() -> Self {
        Self {
            range_multiplier: DEFAULT_RANGE_MULTIPLIER,
            min_extent: DEFAULT_MIN_EXTENT,
        }
    }
}

impl DistancePolicy {
    /// Create a policy with the default multiplier and floor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Distance below which the node's children are preferred.
    #[must_use]
    pub fn switch_distance(&self, tile: &TileNode) -> Option<f64> {
        let bbox = tile.bounding_box()?;
        Some(bbox.max_half_extent().max(self.min_extent) * self.range_multiplier)
    }
}

impl VisibilityPolicy for DistancePolicy {
    fn in_range(&self, tile: &TileNode, camera: DVec3) -> bool {
        let (Some(bbox), Some(switch_distance)) = (tile.bounding_box(), self.switch_distance(tile))
        else {
            // Without a box there is nothing to measure against.
            return false;
        };

        let center = z_up_to_y_up(bbox.center);
        camera.distance(center) < switch_distance
    }
}
