use crate::cache::ConfigWatcher;
use crate::service::common::{Service, StreamResponse};
use crate::snapshot::type_url::ENDPOINT;
use discovery_api::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use discovery_api::envoy::service::endpoint::v3::endpoint_discovery_service_server::EndpointDiscoveryService;
use tonic::{Request, Response, Status, Streaming};

#[tonic::async_trait]
impl<C: ConfigWatcher> EndpointDiscoveryService for Service<C> {
    type StreamEndpointsStream = StreamResponse<DiscoveryResponse>;

    async fn stream_endpoints(
        &self,
        req: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamEndpointsStream>, Status> {
        self.stream(req, ENDPOINT)
    }
}
