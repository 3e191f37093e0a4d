//! In-memory fetcher and recording handlers shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use reqwest::Url;
use tokio::sync::Semaphore;

use crate::config::ManagerConfig;
use crate::error::Error;
use crate::fetch::{Endpoint, FetchFuture, Fetched, Fetcher};
use crate::handlers::{LoadFuture, TileHandlers};
use crate::types::{ContentState, OrientedBox, TileId, TileNode, TilesetDocument};

pub(crate) const API_URL: &str = "https://tiles.test/";
pub(crate) const API_KEY: &str = "k";

pub(crate) fn config() -> ManagerConfig {
    ManagerConfig::new(API_KEY).with_api_url(API_URL)
}

pub(crate) fn endpoint() -> Endpoint {
    Endpoint::new(Url::parse(API_URL).unwrap(), API_KEY.to_string())
}

pub(crate) fn document(json: &str) -> TilesetDocument {
    TilesetDocument::from_slice(json.as_bytes()).unwrap()
}

pub(crate) fn node_with_box(values: [f64; 12]) -> TileNode {
    TileNode {
        id: TileId(0),
        bounding_box: Some(OrientedBox::from_array(&values)),
        geometric_error: None,
        content: None,
        children: Vec::new(),
        pending: HashSet::new(),
        waiting_parent: None,
        state: ContentState::Unloaded,
        hidden: false,
    }
}

enum Response {
    Body(String),
    Status(u16),
}

/// Serves canned responses keyed by URL path. Unknown paths are 404s.
#[derive(Default)]
pub(crate) struct MemoryFetcher {
    responses: Mutex<HashMap<String, Response>>,
    requests: Mutex<Vec<Url>>,
    redirects: Mutex<HashMap<String, Url>>,
}

impl MemoryFetcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn serve(&self, path: &str, json: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(path.to_string(), Response::Body(json.to_string()));
    }

    pub(crate) fn fail(&self, path: &str, status: u16) {
        self.responses
            .lock()
            .unwrap()
            .insert(path.to_string(), Response::Status(status));
    }

    /// Report `path` as served from `to`, as a redirect would.
    pub(crate) fn redirect(&self, path: &str, to: &str) {
        self.redirects
            .lock()
            .unwrap()
            .insert(path.to_string(), Url::parse(to).unwrap());
    }

    pub(crate) fn requests(&self) -> Vec<Url> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn count_path(&self, path: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|url| url.path() == path)
            .count()
    }
}

impl Fetcher for MemoryFetcher {
    fn fetch(&self, url: &Url) -> FetchFuture<'_> {
        let url = url.clone();
        Box::pin(async move {
            self.requests.lock().unwrap().push(url.clone());
            // Give concurrent callers a chance to interleave.
            tokio::task::yield_now().await;

            let body = match self.responses.lock().unwrap().get(url.path()) {
                Some(Response::Body(json)) => json.clone().into_bytes(),
                Some(Response::Status(status)) => {
                    return Err(Error::HttpStatus {
                        url: url.to_string(),
                        status: *status,
                    });
                }
                None => {
                    return Err(Error::HttpStatus {
                        url: url.to_string(),
                        status: 404,
                    });
                }
            };
            let url = self
                .redirects
                .lock()
                .unwrap()
                .get(url.path())
                .cloned()
                .unwrap_or(url);
            Ok(Fetched { url, body })
        })
    }
}

/// A handler call, identified by the node's content URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Load(String),
    Unload(String),
    Show(String),
    Hide(String),
}

fn uri_of(tile: &TileNode) -> String {
    tile.content_uri().unwrap_or_default().to_string()
}

#[derive(Default)]
pub(crate) struct RecordingHandlers {
    calls: Mutex<Vec<Call>>,
    failing: Mutex<HashSet<String>>,
    gates: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl RecordingHandlers {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Make loads of `uri` fail until cleared.
    pub(crate) fn fail_on(&self, uri: &str) {
        self.failing.lock().unwrap().insert(uri.to_string());
    }

    /// Park loads of `uri` until a permit is added to the returned gate.
    pub(crate) fn gate(&self, uri: &str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.gates
            .lock()
            .unwrap()
            .insert(uri.to_string(), Arc::clone(&gate));
        gate
    }

    pub(crate) fn clear_failures(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, call: &Call) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl TileHandlers for RecordingHandlers {
    fn load<'a>(&'a self, tile: &'a TileNode) -> LoadFuture<'a> {
        Box::pin(async move {
            let uri = uri_of(tile);
            self.record(Call::Load(uri.clone()));
            tokio::task::yield_now().await;
            let gate = self.gates.lock().unwrap().get(&uri).cloned();
            if let Some(gate) = gate {
                gate.acquire().await.unwrap().forget();
            }
            if self.failing.lock().unwrap().contains(&uri) {
                return Err(Error::handler(&uri, "refused by test"));
            }
            Ok(())
        })
    }

    fn unload(&self, tile: &TileNode) {
        self.record(Call::Unload(uri_of(tile)));
    }

    fn show(&self, tile: &TileNode) {
        self.record(Call::Show(uri_of(tile)));
    }

    fn hide(&self, tile: &TileNode) {
        self.record(Call::Hide(uri_of(tile)));
    }
}
