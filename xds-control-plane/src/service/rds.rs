use crate::cache::ConfigWatcher;
use crate::service::common::{Service, StreamResponse};
use crate::snapshot::type_url::ROUTE;
use discovery_api::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use discovery_api::envoy::service::route::v3::route_discovery_service_server::RouteDiscoveryService;
use tonic::{Request, Response, Status, Streaming};

#[tonic::async_trait]
impl<C: ConfigWatcher> RouteDiscoveryService for Service<C> {
    type StreamRoutesStream = StreamResponse<DiscoveryResponse>;

    async fn stream_routes(
        &self,
        req: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamRoutesStream>, Status> {
        self.stream(req, ROUTE)
    }
}
