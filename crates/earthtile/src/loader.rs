//! Per-node content loading and unloading.
//!
//! Mesh content goes through the injected [`TileHandlers`]; subtree content
//! is fetched here, parsed, and grafted into the tree as the node's only
//! child. The loader also owns the session token, which is acquired by the
//! first subtree fetch and shared by every later request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use reqwest::Url;
use tokio::sync::{OnceCell, broadcast};

use crate::error::{Error, Result};
use crate::fetch::{Endpoint, Fetcher, session_from_url};
use crate::handlers::TileHandlers;
use crate::tree::TileTree;
use crate::types::{ContentKind, ContentState, TileId, TileNode, TilesetDocument};

/// A handler call decided under the tree lock and issued before releasing it.
#[derive(Debug)]
pub(crate) enum Effect {
    Unload(TileNode),
    Show(TileNode),
    Hide(TileNode),
}

pub(crate) fn lock_tree(tree: &Mutex<TileTree>) -> MutexGuard<'_, TileTree> {
    tree.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How a mesh load request was taken up.
enum MeshClaim {
    /// This caller runs the load and settles the node.
    Started(TileNode, broadcast::Sender<Result<()>>),
    /// A load was already running; wait for its result.
    Joined(broadcast::Receiver<Result<()>>),
}

pub(crate) struct ContentLoader {
    endpoint: Endpoint,
    fetcher: Arc<dyn Fetcher>,
    handlers: Arc<dyn TileHandlers>,
    /// Set once, by whichever subtree fetch runs first. `None` inside means
    /// the server did not hand out a session.
    session: OnceCell<Option<String>>,
    /// Mesh loads still running, keyed by node. Later callers subscribe to
    /// the result instead of loading again. Only touched under the tree lock.
    in_flight: Mutex<HashMap<TileId, broadcast::Sender<Result<()>>>>,
}

impl ContentLoader {
    pub(crate) fn new(
        endpoint: Endpoint,
        fetcher: Arc<dyn Fetcher>,
        handlers: Arc<dyn TileHandlers>,
    ) -> Self {
        Self {
            endpoint,
            fetcher,
            handlers,
            session: OnceCell::new(),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub(crate) fn session(&self) -> Option<&str> {
        self.session.get().and_then(Option::as_deref)
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<TileId, broadcast::Sender<Result<()>>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issue handler calls. Callers hold the tree lock, so calls reach the
    /// handlers in the order they were decided.
    pub(crate) fn apply(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Unload(tile) => self.handlers.unload(&tile),
                Effect::Show(tile) => self.handlers.show(&tile),
                Effect::Hide(tile) => self.handlers.hide(&tile),
            }
        }
    }

    /// Fetch and parse a tileset document.
    pub(crate) async fn fetch_document(&self, url: &Url) -> Result<TilesetDocument> {
        let fetched = self.fetcher.fetch(url).await?;
        TilesetDocument::from_slice(&fetched.body)
    }

    /// Load `id`'s content on behalf of its parent `parent`.
    pub(crate) async fn load_content(
        &self,
        tree: &Mutex<TileTree>,
        id: TileId,
        parent: TileId,
    ) -> Result<()> {
        let subtree = {
            let mut tree = lock_tree(tree);
            let Some(node) = tree.get_mut(id) else {
                return Ok(());
            };
            match node.content.as_ref().map(|c| c.kind) {
                None => return Ok(()),
                Some(ContentKind::Mesh) => None,
                Some(ContentKind::Subtree) => {
                    node.state = ContentState::Loading;
                    Some(node.clone())
                }
            }
        };

        match subtree {
            Some(snapshot) => self.load_subtree(tree, snapshot, parent).await,
            None => self.load_mesh(tree, id).await,
        }
    }

    /// Load a mesh through the handlers, or wait on the load already running
    /// for it. A node reclaimed between an unload and the landing of its load
    /// never gets a second `load` call; the first caller settles its state.
    async fn load_mesh(&self, tree: &Mutex<TileTree>, id: TileId) -> Result<()> {
        let claim = {
            let mut tree = lock_tree(tree);
            let Some(node) = tree.get_mut(id) else {
                return Ok(());
            };
            if node.state == ContentState::Loaded {
                tracing::debug!(tile = %id, "content already loaded");
                return Ok(());
            }
            node.state = ContentState::Loading;

            let mut in_flight = self.in_flight();
            if let Some(tx) = in_flight.get(&id) {
                // Reclaimed before its load landed.
                MeshClaim::Joined(tx.subscribe())
            } else {
                let (tx, _rx) = broadcast::channel(1);
                in_flight.insert(id, tx.clone());
                MeshClaim::Started(node.clone(), tx)
            }
        };

        let (snapshot, sender) = match claim {
            MeshClaim::Started(snapshot, sender) => (snapshot, sender),
            MeshClaim::Joined(mut rx) => {
                tracing::debug!(tile = %id, "joining in-flight load");
                return rx.recv().await.unwrap_or_else(|e| {
                    Err(Error::Task {
                        message: format!("in-flight load of {id} abandoned: {e}"),
                    })
                });
            }
        };

        let result = self.handlers.load(&snapshot).await;

        {
            let mut tree = lock_tree(tree);
            self.in_flight().remove(&id);
            // No waiters is fine.
            let _ = sender.send(result.clone());
            let mut effects = Vec::new();
            match (tree.get_mut(id), &result) {
                (None, Ok(())) => {
                    // Destroyed while loading; nothing else can release it now.
                    effects.push(Effect::Unload(snapshot));
                }
                (None, Err(_)) => {}
                (Some(node), Ok(())) => {
                    if node.state == ContentState::Unloaded {
                        tracing::debug!(tile = %id, "unloaded while loading, releasing");
                        effects.push(Effect::Unload(node.clone()));
                    } else {
                        node.state = ContentState::Loaded;
                        if node.hidden {
                            effects.push(Effect::Hide(node.clone()));
                        }
                    }
                }
                (Some(node), Err(_)) => node.state = ContentState::Unloaded,
            }
            self.apply(effects);
        }

        result
    }

    async fn load_subtree(
        &self,
        tree: &Mutex<TileTree>,
        snapshot: TileNode,
        parent: TileId,
    ) -> Result<()> {
        let id = snapshot.id;
        let Some(uri) = snapshot.content_uri() else {
            return Ok(());
        };

        let document = match self.fetch_subtree(uri).await {
            Ok(document) => document,
            Err(e) => {
                if let Some(node) = lock_tree(tree).get_mut(id) {
                    node.state = ContentState::Unloaded;
                }
                return Err(e);
            }
        };

        {
            let mut tree = lock_tree(tree);
            match tree.get(id).map(TileNode::state) {
                None => {
                    tracing::debug!(tile = %id, uri, "subtree node destroyed while fetching");
                    return Ok(());
                }
                Some(ContentState::Unloaded) => {
                    tracing::debug!(tile = %id, uri, "subtree unloaded while fetching, dropping it");
                    return Ok(());
                }
                Some(_) => {}
            }

            let child = match tree.insert_descriptor(&document.root, &self.endpoint, self.session()) {
                Ok(child) => child,
                Err(e) => {
                    if let Some(node) = tree.get_mut(id) {
                        node.state = ContentState::Unloaded;
                    }
                    return Err(e);
                }
            };
            let effects = tree
                .destroy_children(id)
                .into_iter()
                .filter(|n| n.has_mesh() && n.state == ContentState::Loaded)
                .map(Effect::Unload)
                .collect();
            if let Some(node) = tree.get_mut(id) {
                node.children = vec![child];
                node.state = ContentState::Loaded;
            }
            tree.register_dependency(parent, child);
            tracing::debug!(tile = %id, %child, %parent, "subtree attached");
            self.apply(effects);
        }

        Ok(())
    }

    /// Fetch a subtree document, establishing the session on first use.
    ///
    /// Concurrent first callers queue behind the one acquiring the session,
    /// then issue their own request with it.
    async fn fetch_subtree(&self, uri: &str) -> Result<TilesetDocument> {
        if let Some(session) = self.session.get() {
            let url = self.endpoint.content_url(uri, session.as_deref())?;
            return self.fetch_document(&url).await;
        }

        let mut first = None;
        let slot = &mut first;
        let session = self
            .session
            .get_or_try_init(move || async move {
                let url = self.endpoint.content_url(uri, None)?;
                let fetched = self.fetcher.fetch(&url).await?;
                let session = session_from_url(&fetched.url).or_else(|| session_from_url(&url));
                *slot = Some(TilesetDocument::from_slice(&fetched.body)?);
                match &session {
                    Some(token) => tracing::info!(session = token.as_str(), "session established"),
                    None => tracing::warn!(uri, "no session in first subtree response"),
                }
                Ok::<_, Error>(session)
            })
            .await?;

        if let Some(document) = first {
            return Ok(document);
        }
        let url = self.endpoint.content_url(uri, session.as_deref())?;
        self.fetch_document(&url).await
    }

    /// Release `id`'s content, recording the handler calls in `effects`.
    ///
    /// Meshes are unloaded; subtree nodes drop their fetched children, which
    /// also takes the subtree node out of the expanded set.
    pub(crate) fn unload_content(&self, tree: &mut TileTree, id: TileId, effects: &mut Vec<Effect>) {
        let Some(node) = tree.get_mut(id) else {
            return;
        };
        let Some(kind) = node.content.as_ref().map(|c| c.kind) else {
            return;
        };

        match kind {
            ContentKind::Mesh => {
                let previous = std::mem::replace(&mut node.state, ContentState::Unloaded);
                // A load still in flight releases itself when it lands.
                if previous == ContentState::Loaded {
                    effects.push(Effect::Unload(node.clone()));
                }
            }
            ContentKind::Subtree => {
                node.state = ContentState::Unloaded;
                effects.extend(
                    tree.destroy_children(id)
                        .into_iter()
                        .filter(|n| n.has_mesh() && n.state == ContentState::Loaded)
                        .map(Effect::Unload),
                );
                tree.unmark_expanded(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Call, MemoryFetcher, RecordingHandlers, document, endpoint};

    fn loader(fetcher: &Arc<MemoryFetcher>, handlers: &Arc<RecordingHandlers>) -> ContentLoader {
        ContentLoader::new(endpoint(), fetcher.clone(), handlers.clone())
    }

    fn tree_with(json: &str) -> (Mutex<TileTree>, TileId) {
        let mut tree = TileTree::new();
        let root = tree
            .insert_descriptor(&document(json).root, &endpoint(), None)
            .unwrap();
        tree.set_root(root);
        (Mutex::new(tree), root)
    }

    fn first_child(tree: &Mutex<TileTree>, id: TileId) -> TileId {
        lock_tree(tree).get(id).unwrap().children()[0]
    }

    #[tokio::test]
    async fn test_mesh_load_marks_loaded() {
        let fetcher = Arc::new(MemoryFetcher::new());
        let handlers = Arc::new(RecordingHandlers::new());
        let loader = loader(&fetcher, &handlers);
        let (tree, root) = tree_with(r#"{"root":{"children":[{"content":{"uri":"a.glb"}}]}}"#);
        let child = first_child(&tree, root);

        loader.load_content(&tree, child, root).await.unwrap();

        assert_eq!(handlers.calls(), vec![Call::Load("a.glb".to_string())]);
        assert_eq!(lock_tree(&tree).get(child).unwrap().state(), ContentState::Loaded);
    }

    #[tokio::test]
    async fn test_mesh_reload_restores_hidden() {
        let fetcher = Arc::new(MemoryFetcher::new());
        let handlers = Arc::new(RecordingHandlers::new());
        let loader = loader(&fetcher, &handlers);
        let (tree, root) = tree_with(r#"{"root":{"children":[{"content":{"uri":"a.glb"}}]}}"#);
        let child = first_child(&tree, root);
        lock_tree(&tree).get_mut(child).unwrap().hidden = true;

        loader.load_content(&tree, child, root).await.unwrap();

        assert_eq!(
            handlers.calls(),
            vec![Call::Load("a.glb".to_string()), Call::Hide("a.glb".to_string())]
        );
    }

    #[tokio::test]
    async fn test_failed_mesh_load_reverts_state() {
        let fetcher = Arc::new(MemoryFetcher::new());
        let handlers = Arc::new(RecordingHandlers::new());
        handlers.fail_on("a.glb");
        let loader = loader(&fetcher, &handlers);
        let (tree, root) = tree_with(r#"{"root":{"children":[{"content":{"uri":"a.glb"}}]}}"#);
        let child = first_child(&tree, root);

        let err = loader.load_content(&tree, child, root).await.unwrap_err();

        assert!(matches!(err, Error::Handler { .. }));
        assert_eq!(lock_tree(&tree).get(child).unwrap().state(), ContentState::Unloaded);
    }

    #[tokio::test]
    async fn test_subtree_load_attaches_root_and_registers_dependency() {
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.serve(
            "/s.json",
            r#"{"root":{"content":{"uri":"deep.glb"},"children":[{}]}}"#,
        );
        let handlers = Arc::new(RecordingHandlers::new());
        let loader = loader(&fetcher, &handlers);
        let (tree, root) = tree_with(r#"{"root":{"children":[{"content":{"uri":"s.json?session=xyz"}}]}}"#);
        let subtree = first_child(&tree, root);

        loader.load_content(&tree, subtree, root).await.unwrap();

        let guard = lock_tree(&tree);
        let attached = guard.get(subtree).unwrap().children()[0];
        assert_eq!(guard.get(attached).unwrap().content_uri(), Some("deep.glb"));
        assert_eq!(guard.get(attached).unwrap().waiting_parent(), Some(root));
        assert_eq!(guard.get(root).unwrap().pending_count(), 1);
        assert_eq!(loader.session(), Some("xyz"));
        // Content fetched after the session exists carries it.
        let url = guard.get(attached).unwrap().content().unwrap().url.clone();
        assert_eq!(session_from_url(&url).as_deref(), Some("xyz"));
    }

    #[tokio::test]
    async fn test_subtree_http_error_propagates() {
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.fail("/s.json", 500);
        let handlers = Arc::new(RecordingHandlers::new());
        let loader = loader(&fetcher, &handlers);
        let (tree, root) = tree_with(r#"{"root":{"children":[{"content":{"uri":"s.json"}}]}}"#);
        let subtree = first_child(&tree, root);

        let err = loader.load_content(&tree, subtree, root).await.unwrap_err();

        assert!(matches!(err, Error::HttpStatus { status: 500, .. }));
        assert!(err.is_network());
        assert_eq!(loader.session(), None);
        assert_eq!(lock_tree(&tree).get(subtree).unwrap().state(), ContentState::Unloaded);
    }

    #[tokio::test]
    async fn test_session_taken_from_final_response_url() {
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.serve("/s.json", r#"{"root":{"content":{"uri":"deep.glb"}}}"#);
        fetcher.redirect("/s.json", "https://tiles.test/s.json?key=k&session=issued");
        let handlers = Arc::new(RecordingHandlers::new());
        let loader = loader(&fetcher, &handlers);
        let (tree, root) = tree_with(r#"{"root":{"children":[{"content":{"uri":"s.json"}}]}}"#);
        let subtree = first_child(&tree, root);

        loader.load_content(&tree, subtree, root).await.unwrap();

        assert_eq!(loader.session(), Some("issued"));
        // The request itself went out without one.
        assert_eq!(session_from_url(&fetcher.requests()[0]), None);
    }

    #[tokio::test]
    async fn test_subtree_landing_after_unload_is_dropped() {
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.serve("/s.json", r#"{"root":{"content":{"uri":"deep.glb"}}}"#);
        let handlers = Arc::new(RecordingHandlers::new());
        let loader = loader(&fetcher, &handlers);
        let (tree, root) = tree_with(r#"{"root":{"children":[{"content":{"uri":"s.json"}}]}}"#);
        let subtree = first_child(&tree, root);

        // Polled while the fetch is parked in the fetcher.
        let unload_midway = async {
            let mut effects = Vec::new();
            loader.unload_content(&mut lock_tree(&tree), subtree, &mut effects);
            assert!(effects.is_empty());
        };
        let (loaded, ()) = tokio::join!(loader.load_content(&tree, subtree, root), unload_midway);
        loaded.unwrap();

        let guard = lock_tree(&tree);
        assert!(!guard.get(subtree).unwrap().has_children());
        assert_eq!(guard.get(subtree).unwrap().state(), ContentState::Unloaded);
        assert_eq!(guard.get(root).unwrap().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_reload_while_loading_joins_in_flight_load() {
        let fetcher = Arc::new(MemoryFetcher::new());
        let handlers = Arc::new(RecordingHandlers::new());
        let gate = handlers.gate("a.glb");
        let loader = loader(&fetcher, &handlers);
        let (tree, root) = tree_with(r#"{"root":{"children":[{"content":{"uri":"a.glb"}}]}}"#);
        let child = first_child(&tree, root);

        let reclaim = async {
            // Let the first load reach the gate.
            for _ in 0..4 {
                tokio::task::yield_now().await;
            }
            let mut effects = Vec::new();
            loader.unload_content(&mut lock_tree(&tree), child, &mut effects);
            assert!(effects.is_empty());
            let second = loader.load_content(&tree, child, root);
            gate.add_permits(2);
            second.await
        };
        let (first, second) = tokio::join!(loader.load_content(&tree, child, root), reclaim);
        first.unwrap();
        second.unwrap();

        assert_eq!(handlers.calls(), vec![Call::Load("a.glb".to_string())]);
        assert_eq!(lock_tree(&tree).get(child).unwrap().state(), ContentState::Loaded);
    }

    #[tokio::test]
    async fn test_concurrent_first_fetches_share_one_session() {
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.serve("/a.json", r#"{"root":{}}"#);
        fetcher.serve("/b.json", r#"{"root":{}}"#);
        let handlers = Arc::new(RecordingHandlers::new());
        let loader = loader(&fetcher, &handlers);
        let (tree, root) = tree_with(
            r#"{"root":{"children":[{"content":{"uri":"a.json?session=first"}},{"content":{"uri":"b.json"}}]}}"#,
        );
        let children = lock_tree(&tree).get(root).unwrap().children().to_vec();

        let (a, b) = tokio::join!(
            loader.load_content(&tree, children[0], root),
            loader.load_content(&tree, children[1], root),
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(loader.session(), Some("first"));
        let requested = fetcher.requests();
        assert_eq!(requested.len(), 2);
        let b_request = requested.iter().find(|u| u.path() == "/b.json").unwrap();
        assert_eq!(session_from_url(b_request).as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_unload_subtree_discards_children() {
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.serve("/s.json", r#"{"root":{"content":{"uri":"deep.glb"}}}"#);
        let handlers = Arc::new(RecordingHandlers::new());
        let loader = loader(&fetcher, &handlers);
        let (tree, root) = tree_with(r#"{"root":{"children":[{"content":{"uri":"s.json"}}]}}"#);
        let subtree = first_child(&tree, root);
        loader.load_content(&tree, subtree, root).await.unwrap();
        let attached = first_child(&tree, subtree);
        loader.load_content(&tree, attached, subtree).await.unwrap();

        let mut effects = Vec::new();
        {
            let mut guard = lock_tree(&tree);
            guard.mark_expanded(subtree);
            loader.unload_content(&mut guard, subtree, &mut effects);
            assert!(!guard.contains(attached));
            assert!(!guard.is_expanded(subtree));
            assert_eq!(guard.get(root).unwrap().pending_count(), 0);
        }
        loader.apply(effects);

        assert_eq!(handlers.count(&Call::Unload("deep.glb".to_string())), 1);
    }

    #[tokio::test]
    async fn test_load_landing_after_unload_is_released() {
        let fetcher = Arc::new(MemoryFetcher::new());
        let handlers = Arc::new(RecordingHandlers::new());
        let loader = loader(&fetcher, &handlers);
        let (tree, root) = tree_with(r#"{"root":{"children":[{"content":{"uri":"a.glb"}}]}}"#);
        let child = first_child(&tree, root);

        // Polled after the load has started and parked inside the handler.
        let unload_midway = async {
            let mut effects = Vec::new();
            loader.unload_content(&mut lock_tree(&tree), child, &mut effects);
            assert!(effects.is_empty());
        };
        let (loaded, ()) = tokio::join!(loader.load_content(&tree, child, root), unload_midway);
        loaded.unwrap();

        assert_eq!(
            handlers.calls(),
            vec![Call::Load("a.glb".to_string()), Call::Unload("a.glb".to_string())]
        );
        assert_eq!(lock_tree(&tree).get(child).unwrap().state(), ContentState::Unloaded);
    }
}
