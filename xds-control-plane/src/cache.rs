pub mod snapshot;

use discovery_api::envoy::config::core::v3::Node;
use discovery_api::envoy::service::discovery::v3::DiscoveryRequest;
use discovery_api::google::protobuf::Any;
use tokio::sync::oneshot;
use tracing::debug;

/// A configuration response produced by the cache. The stream turns it into
/// a `DiscoveryResponse` when it assigns the nonce.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub version: String,
    pub resources: Vec<Any>,
}

/// Source of watches for the discovery server. `SnapshotCache` is the
/// canonical implementation; tests substitute mocks.
pub trait ConfigWatcher: Send + Sync + 'static {
    /// Returns a watch for the request. The watch either already carries a
    /// response (the caller's receiver resolves immediately) or stays open
    /// until a matching snapshot is installed or the watch is cancelled.
    fn create_watch(&self, request: &DiscoveryRequest) -> Watch;
}

/// Maps a client identity to the node group whose snapshot it receives.
pub trait NodeGroup: Send + Sync + 'static {
    fn hash(&self, node: Option<&Node>) -> String;
}

/// Groups clients by their node id. Clients without a node share the
/// empty-string group.
#[derive(Debug, Default)]
pub struct IdNodeGroup;

impl NodeGroup for IdNodeGroup {
    fn hash(&self, node: Option<&Node>) -> String {
        node.map_or_else(String::new, |node| node.id.clone())
    }
}

type CancelHook = Box<dyn FnOnce() + Send + 'static>;

/// One open subscription: the originating request plus a single-shot channel
/// that delivers at most one [`Response`] before the watch is finished.
///
/// The cache installs a cancel hook before handing the watch out; cancelling
/// (or dropping the [`WatchHandle`]) runs the hook, which removes any parked
/// state from the cache.
pub struct Watch {
    id: u64,
    request: DiscoveryRequest,
    rx: oneshot::Receiver<Response>,
    on_cancel: Option<CancelHook>,
}

impl std::fmt::Debug for Watch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watch")
            .field("id", &self.id)
            .field("request", &self.request)
            .finish()
    }
}

impl Watch {
    pub(crate) fn new(id: u64, request: DiscoveryRequest) -> (Self, WatchEmitter) {
        let (tx, rx) = oneshot::channel();
        let watch = Self {
            id,
            request,
            rx,
            on_cancel: None,
        };
        let emitter = WatchEmitter {
            id,
            tx: Some(tx),
        };
        (watch, emitter)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn request(&self) -> &DiscoveryRequest {
        &self.request
    }

    pub(crate) fn set_cancel(&mut self, hook: CancelHook) {
        self.on_cancel = Some(hook);
    }

    /// Cancels without consuming the watch. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(hook) = self.on_cancel.take() {
            hook();
        }
    }

    /// Splits into the cancellation handle and the response receiver, so the
    /// consumer can await the emission while retaining the ability to cancel.
    pub fn split(self) -> (WatchHandle, oneshot::Receiver<Response>) {
        (
            WatchHandle {
                id: self.id,
                on_cancel: self.on_cancel,
            },
            self.rx,
        )
    }
}

/// Cancellation half of a split [`Watch`]. Dropping the handle cancels, so a
/// torn-down stream cannot leak parked watches.
pub struct WatchHandle {
    id: u64,
    on_cancel: Option<CancelHook>,
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle").field("id", &self.id).finish()
    }
}

impl WatchHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&mut self) {
        if let Some(hook) = self.on_cancel.take() {
            hook();
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Producer half of a watch, parked inside the cache. Emission consumes the
/// sender, so a watch can never deliver twice.
#[derive(Debug)]
pub(crate) struct WatchEmitter {
    id: u64,
    tx: Option<oneshot::Sender<Response>>,
}

impl WatchEmitter {
    /// Delivers the single allowed response. Non-blocking, safe to call with
    /// the cache lock held. Returns false if the response could not be
    /// delivered (already emitted, or the consumer went away).
    pub(crate) fn emit(&mut self, response: Response) -> bool {
        match self.tx.take() {
            Some(tx) => match tx.send(response) {
                Ok(()) => true,
                Err(_) => {
                    debug!("watch {} receiver dropped before emission", self.id);
                    false
                }
            },
            None => {
                debug!("watch {} already emitted", self.id);
                false
            }
        }
    }
}
