use crate::cache::ConfigWatcher;
use crate::service::common::{Service, StreamResponse};
use crate::snapshot::type_url::LISTENER;
use discovery_api::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use discovery_api::envoy::service::listener::v3::listener_discovery_service_server::ListenerDiscoveryService;
use tonic::{Request, Response, Status, Streaming};

#[tonic::async_trait]
impl<C: ConfigWatcher> ListenerDiscoveryService for Service<C> {
    type StreamListenersStream = StreamResponse<DiscoveryResponse>;

    async fn stream_listeners(
        &self,
        req: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamListenersStream>, Status> {
        self.stream(req, LISTENER)
    }
}
