//! Expansion controller: decides which nodes are expanded and drives the
//! loader accordingly.
//!
//! Each tick, [`TileManager::update`] checks every expanded node against the
//! visibility policy. Rejected nodes collapse immediately; accepted
//! expandable children are expanded on background tasks. A node's own mesh
//! is hidden once its children have loaded, except that a node whose
//! children came from freshly fetched subtree documents stays visible until
//! each of those subtree roots has itself expanded.

use std::sync::{Arc, Mutex, MutexGuard};

use glam::DVec3;
use tokio::runtime::Handle;
use tokio_util::task::TaskTracker;

use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::fetch::{Fetcher, HttpFetcher};
use crate::handlers::TileHandlers;
use crate::loader::{ContentLoader, Effect, lock_tree};
use crate::tree::TileTree;
use crate::types::{TileId, TileNode, TileStats};
use crate::visibility::{DistancePolicy, VisibilityPolicy};

/// Streams a 3D Tiles dataset in and out based on camera position.
///
/// Cloning is cheap and every clone drives the same tree.
///
/// # Example
///
/// ```ignore
/// let manager = TileManager::new(ManagerConfig::new(api_key), Arc::new(MyHandlers))?;
/// manager.start().await?;
/// loop {
///     manager.update(camera_position);
///     // ...render a frame...
/// }
/// ```
#[derive(Clone)]
pub struct TileManager {
    inner: Arc<Inner>,
}

struct Inner {
    tree: Mutex<TileTree>,
    loader: ContentLoader,
    policy: Box<dyn VisibilityPolicy>,
    tasks: TaskTracker,
    runtime: Handle,
}

/// Builder for a [`TileManager`] with a custom policy, fetcher or runtime.
pub struct TileManagerBuilder {
    config: ManagerConfig,
    policy: Box<dyn VisibilityPolicy>,
    fetcher: Option<Arc<dyn Fetcher>>,
    runtime: Option<Handle>,
}

impl TileManagerBuilder {
    /// Use a different visibility policy. Defaults to [`DistancePolicy`].
    #[must_use]
    pub fn with_policy(mut self, policy: impl VisibilityPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    /// Use a different fetcher. Defaults to [`HttpFetcher`].
    #[must_use]
    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Spawn background work on this runtime instead of the current one.
    #[must_use]
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Build the manager.
    ///
    /// Fails if the configuration is invalid, or if no runtime was given and
    /// this is not called from inside a Tokio runtime.
    pub fn build(self, handlers: Arc<dyn TileHandlers>) -> Result<TileManager> {
        let endpoint = self.config.endpoint()?;
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|e| Error::InvalidConfig {
                detail: format!("no tokio runtime available: {e}"),
            })?,
        };
        let fetcher: Arc<dyn Fetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpFetcher::new()),
        };

        Ok(TileManager {
            inner: Arc::new(Inner {
                tree: Mutex::new(TileTree::new()),
                loader: ContentLoader::new(endpoint, fetcher, handlers),
                policy: self.policy,
                tasks: TaskTracker::new(),
                runtime,
            }),
        })
    }
}

impl TileManager {
    /// Create a manager with the default HTTP fetcher and distance policy.
    pub fn new(config: ManagerConfig, handlers: Arc<dyn TileHandlers>) -> Result<Self> {
        Self::builder(config).build(handlers)
    }

    /// Start configuring a manager.
    #[must_use]
    pub fn builder(config: ManagerConfig) -> TileManagerBuilder {
        TileManagerBuilder {
            config,
            policy: Box::new(DistancePolicy::new()),
            fetcher: None,
            runtime: None,
        }
    }

    /// Fetch the root tileset and expand its root node.
    ///
    /// Errors from the root fetch or the root's expansion propagate. Calling
    /// this again once a root exists is a no-op.
    pub async fn start(&self) -> Result<TileId> {
        let existing = self.inner.tree().root();
        if let Some(root) = existing {
            tracing::warn!(%root, "tile manager already started");
            return Ok(root);
        }

        let endpoint = self.inner.loader.endpoint();
        let url = endpoint.root_url()?;
        let document = self.inner.loader.fetch_document(&url).await?;

        let root = {
            let mut tree = self.inner.tree();
            if let Some(root) = tree.root() {
                return Ok(root);
            }
            let root = tree.insert_descriptor(&document.root, endpoint, self.inner.loader.session())?;
            tree.set_root(root);
            root
        };
        tracing::info!(%root, "root tileset loaded");

        self.inner.expand(root).await?;
        Ok(root)
    }

    /// Expand a node: load its children's content and, once they are all
    /// loaded, hide its own mesh. No-op if the node is already expanded.
    pub async fn expand(&self, id: TileId) -> Result<()> {
        self.inner.expand(id).await
    }

    /// Collapse a node: unload its direct children and show its own content.
    pub fn collapse(&self, id: TileId) {
        self.inner.collapse(id);
    }

    /// Re-evaluate every expanded node against the camera position.
    ///
    /// Collapses happen before this returns; expansions run in the
    /// background and can be awaited with [`settle`](Self::settle).
    pub fn update(&self, camera: DVec3) {
        let mut expansions = Vec::new();

        for id in self.inner.tree().expanded_snapshot() {
            let accepted = {
                let tree = self.inner.tree();
                let Some(node) = tree.get(id) else {
                    continue;
                };
                self.inner.policy.accepts(node, camera)
            };
            if !accepted {
                tracing::debug!(tile = %id, "out of range, collapsing");
                self.inner.collapse(id);
            }

            let tree = self.inner.tree();
            let Some(node) = tree.get(id) else {
                continue;
            };
            expansions.extend(node.children().iter().copied().filter(|child| {
                tree.get(*child).is_some_and(|c| {
                    c.has_children() && self.inner.policy.accepts(c, camera)
                })
            }));
        }

        for id in expansions {
            self.spawn_expand(id);
        }
    }

    /// Wait until every background expansion and load has finished.
    pub async fn settle(&self) {
        let tasks = &self.inner.tasks;
        tasks.close();
        tasks.wait().await;
        tasks.reopen();
    }

    fn spawn_expand(&self, id: TileId) {
        let inner = Arc::clone(&self.inner);
        self.inner.tasks.spawn_on(
            async move {
                if let Err(e) = inner.expand(id).await {
                    tracing::warn!(tile = %id, error = %e, "error expanding node");
                }
            },
            &self.inner.runtime,
        );
    }

    /// Root node, once started.
    #[must_use]
    pub fn root(&self) -> Option<TileId> {
        self.inner.tree().root()
    }

    /// Snapshot of a node.
    #[must_use]
    pub fn node(&self, id: TileId) -> Option<TileNode> {
        self.inner.tree().get(id).cloned()
    }

    /// Whether a node is currently expanded.
    #[must_use]
    pub fn is_expanded(&self, id: TileId) -> bool {
        self.inner.tree().is_expanded(id)
    }

    /// Currently expanded nodes.
    #[must_use]
    pub fn expanded(&self) -> Vec<TileId> {
        self.inner.tree().expanded_snapshot()
    }

    /// The session token, once the first subtree fetch established it.
    #[must_use]
    pub fn session(&self) -> Option<String> {
        self.inner.loader.session().map(str::to_string)
    }

    /// Counters describing the current tree.
    #[must_use]
    pub fn stats(&self) -> TileStats {
        self.inner.tree().stats()
    }
}

impl Inner {
    fn tree(&self) -> MutexGuard<'_, TileTree> {
        lock_tree(&self.tree)
    }

    async fn expand(self: &Arc<Self>, id: TileId) -> Result<()> {
        let children = {
            let mut tree = self.tree();
            if !tree.contains(id) || !tree.mark_expanded(id) {
                return Ok(());
            }
            tree.children_with_content(id)
        };
        tracing::debug!(tile = %id, children = children.len(), "expanding");

        // Each load is its own task: a failure ends the join below without
        // cancelling the siblings already in flight.
        let loads: Vec<_> = children
            .into_iter()
            .map(|child| {
                let inner = Arc::clone(self);
                self.tasks.spawn_on(
                    async move { inner.loader.load_content(&inner.tree, child, id).await },
                    &self.runtime,
                )
            })
            .collect();

        let joined =
            futures::future::try_join_all(loads.into_iter().map(|load| async move { load.await? }))
                .await;
        if let Err(e) = joined {
            // Leave the node collapsed so a later tick can try again.
            self.tree().unmark_expanded(id);
            return Err(e);
        }

        let mut effects = Vec::new();
        {
            let mut tree = self.tree();
            let expanded = tree.is_expanded(id);
            if let Some(node) = tree.get_mut(id) {
                if expanded && node.has_mesh() && node.pending.is_empty() {
                    node.hidden = true;
                    effects.push(Effect::Hide(node.clone()));
                }
            }

            if let Some(parent) = tree.release_dependency(id) {
                let parent_expanded = tree.is_expanded(parent);
                if let Some(parent_node) = tree.get_mut(parent) {
                    if parent_expanded && parent_node.has_mesh() {
                        tracing::debug!(tile = %id, %parent, "last dependency expanded, hiding parent");
                        parent_node.hidden = true;
                        effects.push(Effect::Hide(parent_node.clone()));
                    }
                }
            }
            self.loader.apply(effects);
        }

        Ok(())
    }

    fn collapse(&self, id: TileId) {
        let mut effects = Vec::new();
        {
            let mut tree = self.tree();
            for child in tree.children_with_content(id) {
                self.loader.unload_content(&mut tree, child, &mut effects);
            }
            if let Some(node) = tree.get_mut(id) {
                if node.content.is_some() {
                    node.hidden = false;
                    effects.push(Effect::Show(node.clone()));
                }
            }
            tree.unmark_expanded(id);
            self.loader.apply(effects);
        }
    }
}
