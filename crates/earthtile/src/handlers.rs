//! Engine-side content handlers.
//!
//! The manager never touches a scene graph itself. It drives one
//! [`TileHandlers`] implementation supplied by the caller, with the same
//! boxed-future shape the rest of the crate uses for async seams.
//!
//! # Implementations
//!
//! - [`NoopHandlers`]: Accepts everything and renders nothing
//! - [`LoggingHandlers`]: Logs every call, for headless runs

use std::future::Future;
use std::pin::Pin;

use crate::error::Result;
use crate::types::TileNode;

/// Future type for handler load operations.
pub type LoadFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// The four capabilities the manager needs from a rendering engine.
///
/// Every call receives a snapshot of the node; `tile.content()` carries the
/// resolved URL for mesh content.
///
/// `unload`, `show` and `hide` run while the manager holds its tree lock, in
/// the order the manager decided them. They must return promptly and must not
/// call back into the [`TileManager`](crate::TileManager).
pub trait TileHandlers: Send + Sync {
    /// Fetch and instantiate the tile's mesh content.
    ///
    /// The manager awaits this before deciding whether the parent can hide.
    fn load<'a>(&'a self, tile: &'a TileNode) -> LoadFuture<'a>;

    /// Release the tile's mesh content.
    fn unload(&self, tile: &TileNode);

    /// Make the tile's content visible again.
    fn show(&self, tile: &TileNode);

    /// Suppress the tile's content in favour of its loaded children.
    fn hide(&self, tile: &TileNode);
}

/// Handlers that accept every call and do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandlers;

impl TileHandlers for NoopHandlers {
    fn load<'a>(&'a self, _tile: &'a TileNode) -> LoadFuture<'a> {
        Box::pin(async { Ok(()) })
    }

    fn unload(&self, _tile: &TileNode) {}

    fn show(&self, _tile: &TileNode) {}

    fn hide(&self, _tile: &TileNode) {}
}

/// Handlers that only log, useful when driving the manager headless.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandlers;

impl TileHandlers for LoggingHandlers {
    fn load<'a>(&'a self, tile: &'a TileNode) -> LoadFuture<'a> {
        Box::pin(async move {
            tracing::info!(tile = %tile.id(), uri = tile.content_uri(), "load");
            Ok(())
        })
    }

    fn unload(&self, tile: &TileNode) {
        tracing::info!(tile = %tile.id(), uri = tile.content_uri(), "unload");
    }

    fn show(&self, tile: &TileNode) {
        tracing::info!(tile = %tile.id(), uri = tile.content_uri(), "show");
    }

    fn hide(&self, tile: &TileNode) {
        tracing::info!(tile = %tile.id(), uri = tile.content_uri(), "hide");
    }
}
