use crate::cache::ConfigWatcher;
use crate::service::stream::handle_stream;
use discovery_api::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response};
use tonic::{Status, Streaming};

/// One discovery endpoint. The same service type backs all five RPC
/// surfaces; each registration picks its default type URL.
pub struct Service<C> {
    cache: Arc<C>,
}

pub type StreamResponse<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send + 'static>>;

impl<C: ConfigWatcher> Service<C> {
    pub fn new(cache: Arc<C>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<C> {
        &self.cache
    }

    pub fn stream(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
        type_url: &'static str,
    ) -> Result<Response<StreamResponse<DiscoveryResponse>>, Status> {
        let input = request.into_inner();
        // Capacity 1: a slow client backpressures its own stream only.
        let (tx, rx) = mpsc::channel(1);
        let output = ReceiverStream::new(rx);
        let cache = self.cache.clone();
        tokio::spawn(async move { handle_stream(input, tx, type_url, cache).await });
        Ok(Response::new(
            Box::pin(output) as StreamResponse<DiscoveryResponse>
        ))
    }
}
