
use crate::cache::{ConfigWatcher, Response, WatchHandle};
use crate::error::StreamError;
use crate::snapshot::type_url::{self, ANY_TYPE};
use discovery_api::envoy::config::core::v3::Node;
use discovery_api::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tonic::Status;
use tracing::{debug, error, info, warn};

static STREAM_COUNT: AtomicU64 = AtomicU64::new(0);

/// A watch emission routed back to its stream, tagged with the type URL and
/// watch id so replaced watches can be told apart from live ones.
pub struct Emission {
    type_url: String,
    watch_id: u64,
    result: Result<Response, oneshot::error::RecvError>,
}

type EmissionFuture = Pin<Box<dyn Future<Output = Emission> + Send>>;

/// Per-stream request/response state machine.
///
/// Holds at most one live watch per type URL, the last nonce sent per type,
/// and a monotone nonce counter. All five discovery endpoints run this
/// machine; they differ only in `default_type_url` (empty for ADS).
pub struct Stream<C> {
    cache: Arc<C>,
    tx: mpsc::Sender<Result<DiscoveryResponse, Status>>,
    default_type_url: &'static str,
    stream_id: u64,
    node: Option<Node>,
    watches: HashMap<String, WatchHandle>,
    emissions: FuturesUnordered<EmissionFuture>,
    nonces: HashMap<String, String>,
    stream_nonce: u64,
}

impl<C: ConfigWatcher> Stream<C> {
    pub fn new(
        tx: mpsc::Sender<Result<DiscoveryResponse, Status>>,
        default_type_url: &'static str,
        cache: Arc<C>,
    ) -> Self {
        let stream_id = STREAM_COUNT.fetch_add(1, Ordering::Relaxed);
        info!("[{}] open stream for {:?}", stream_id, default_type_url);
        Self {
            cache,
            tx,
            default_type_url,
            stream_id,
            node: None,
            watches: HashMap::new(),
            emissions: FuturesUnordered::new(),
            nonces: HashMap::new(),
            stream_nonce: 0,
        }
    }

    /// Ingests one client request: validates it, applies the per-type nonce
    /// guard and, if the request is current, replaces the type's watch.
    pub async fn handle_client_request(
        &mut self,
        mut request: DiscoveryRequest,
    ) -> Result<(), StreamError> {
        // Clients send their identity on the first request only; carry it
        // forward so every watch reaches the right node group.
        if request.node.is_some() {
            self.node = request.node.clone();
        } else {
            request.node = self.node.clone();
        }

        if self.default_type_url == ANY_TYPE {
            if request.type_url.is_empty() {
                return Err(self.fail(StreamError::MissingTypeUrl).await);
            }
        } else if request.type_url.is_empty() {
            request.type_url = self.default_type_url.to_string();
        }

        info!(
            "[{}] request {}[{}] with nonce {} from version {}",
            self.stream_id,
            request.type_url,
            request.resource_names.join(", "),
            request.response_nonce,
            request.version_info,
        );

        if let Some(detail) = &request.error_detail {
            warn!(
                "[{}] client NACKed {} at version {} nonce {}: {}",
                self.stream_id,
                request.type_url,
                request.version_info,
                request.response_nonce,
                detail.message,
            );
        }

        if !type_url::contains(&request.type_url) {
            debug!(
                "[{}] ignoring request for unknown type URL {}",
                self.stream_id, request.type_url,
            );
            return Ok(());
        }

        // A nonce that does not match the last response for this type
        // acknowledges a superseded response.
        if let Some(last_nonce) = self.nonces.get(&request.type_url) {
            if *last_nonce != request.response_nonce {
                debug!(
                    "[{}] ignoring {} request with stale nonce {} (last sent {})",
                    self.stream_id, request.type_url, request.response_nonce, last_nonce,
                );
                return Ok(());
            }
        }

        let type_url = request.type_url.clone();
        if let Some(mut old_watch) = self.watches.remove(&type_url) {
            old_watch.cancel();
        }

        let watch = self.cache.create_watch(&request);
        let (handle, rx) = watch.split();
        let watch_id = handle.id();
        self.watches.insert(type_url.clone(), handle);
        self.emissions.push(Box::pin(async move {
            Emission {
                type_url,
                watch_id,
                result: rx.await,
            }
        }));
        Ok(())
    }

    /// Resolves once any pending watch emits (or fails). Returns `None` when
    /// no watches are pending.
    pub async fn next_emission(&mut self) -> Option<Emission> {
        self.emissions.next().await
    }

    /// Delivers a watch emission to the client, unless the watch has been
    /// replaced since it fired.
    pub async fn handle_emission(&mut self, emission: Emission) -> Result<(), StreamError> {
        let live = self
            .watches
            .get(&emission.type_url)
            .is_some_and(|handle| handle.id() == emission.watch_id);
        if !live {
            debug!(
                "[{}] dropping emission from replaced {} watch {}",
                self.stream_id, emission.type_url, emission.watch_id,
            );
            return Ok(());
        }

        match emission.result {
            Ok(response) => {
                // The watch is done; the client's ACK opens the next one.
                self.watches.remove(&emission.type_url);
                self.send(response, &emission.type_url).await
            }
            Err(_) => {
                let err = StreamError::WatchFailed {
                    type_url: emission.type_url,
                };
                Err(self.fail(err).await)
            }
        }
    }

    /// Writes one response. The nonce is assigned here, so nonces follow
    /// write order exactly: 0, 1, 2, ...
    async fn send(&mut self, response: Response, type_url: &str) -> Result<(), StreamError> {
        let nonce = self.stream_nonce.to_string();
        self.stream_nonce += 1;

        let discovery = DiscoveryResponse {
            version_info: response.version,
            resources: response.resources,
            type_url: type_url.to_string(),
            nonce: nonce.clone(),
            ..DiscoveryResponse::default()
        };

        info!(
            "[{}] response {} with nonce {} version {}",
            self.stream_id, type_url, nonce, discovery.version_info,
        );

        self.tx
            .send(Ok(discovery))
            .await
            .map_err(|_| StreamError::Disconnected)?;
        self.nonces.insert(type_url.to_string(), nonce);
        Ok(())
    }

    /// Forwards an upstream transport error to the client verbatim.
    pub async fn forward_error(&mut self, status: Status) {
        let _ = self.tx.send(Err(status)).await;
    }

    async fn fail(&mut self, err: StreamError) -> StreamError {
        if let Some(status) = err.to_status() {
            let _ = self.tx.send(Err(status)).await;
        }
        err
    }

    /// Cancels every live watch, releasing their parked state in the cache.
    pub fn cancel_all(&mut self) {
        for (_, mut handle) in self.watches.drain() {
            handle.cancel();
        }
    }
}

/// Drives one discovery stream to completion: ingests requests, forwards
/// watch emissions, and tears every watch down when the stream ends.
pub async fn handle_stream<R, C>(
    mut requests: R,
    tx: mpsc::Sender<Result<DiscoveryResponse, Status>>,
    default_type_url: &'static str,
    cache: Arc<C>,
) where
    R: futures::Stream<Item = Result<DiscoveryRequest, Status>> + Unpin,
    C: ConfigWatcher,
{
    let mut stream = Stream::new(tx, default_type_url, cache);
    loop {
        tokio::select! {
            request = requests.next() => match request {
                Some(Ok(request)) => {
                    if let Err(err) = stream.handle_client_request(request).await {
                        error!("[{}] stream failed: {}", stream.stream_id, err);
                        break;
                    }
                }
                Some(Err(status)) => {
                    error!("[{}] stream closed with error: {}", stream.stream_id, status);
                    stream.forward_error(status).await;
                    break;
                }
                None => {
                    info!("[{}] stream closed", stream.stream_id);
                    break;
                }
            },
            Some(emission) = stream.next_emission() => {
                if let Err(err) = stream.handle_emission(emission).await {
                    if !matches!(err, StreamError::Disconnected) {
                        error!("[{}] stream failed: {}", stream.stream_id, err);
                    }
                    break;
                }
            }
        }
    }
    stream.cancel_all();
}
