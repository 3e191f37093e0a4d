//! Camera-driven streaming of Google's photorealistic 3D Tiles.
//!
//! This crate keeps track of which parts of a 3D Tiles hierarchy should be
//! resident for a given camera position. It fetches tileset documents from
//! the Map Tiles API, follows nested subtree documents, and tells an
//! engine-supplied [`TileHandlers`] implementation when to load, unload,
//! show and hide mesh content.
//!
//! # Design principles
//!
//! - **Engine-agnostic**: All rendering goes through [`TileHandlers`]
//! - **Non-blocking ticks**: [`TileManager::update`] never awaits; expansions
//!   run as background tasks
//! - **No popping**: A parent's mesh stays visible until everything that
//!   replaces it has loaded
//!
//! # Example
//!
//! ```ignore
//! use earthtile::{LoggingHandlers, ManagerConfig, TileManager, geodetic_to_ecef, z_up_to_y_up};
//!
//! let manager = TileManager::new(ManagerConfig::new(api_key), Arc::new(LoggingHandlers))?;
//! manager.start().await?;
//!
//! let camera = z_up_to_y_up(geodetic_to_ecef(-74.0, 40.7, 500.0));
//! manager.update(camera);
//! manager.settle().await;
//! ```

mod config;
mod error;
pub mod fetch;
pub mod geodetic;
pub mod handlers;
mod loader;
mod manager;
mod tree;
pub mod types;
pub mod visibility;

#[cfg(test)]
mod test_support;

pub use config::{DEFAULT_API_URL, ManagerConfig};
pub use error::{Error, Result};
pub use fetch::{Endpoint, Fetched, Fetcher, HttpFetcher};
pub use geodetic::{Geodetic, ecef_to_geodetic, geodetic_to_ecef, y_up_to_z_up, z_up_to_y_up};
pub use handlers::{LoggingHandlers, NoopHandlers, TileHandlers};
pub use manager::{TileManager, TileManagerBuilder};
pub use types::{
    ContentKind, ContentState, OrientedBox, TileContent, TileId, TileNode, TileStats,
    TilesetDocument,
};
pub use visibility::{DistancePolicy, VisibilityPolicy};
