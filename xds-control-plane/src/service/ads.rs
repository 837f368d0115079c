use crate::cache::ConfigWatcher;
use crate::service::common::{Service, StreamResponse};
use crate::snapshot::type_url::ANY_TYPE;
use discovery_api::envoy::service::discovery::v3::aggregated_discovery_service_server::AggregatedDiscoveryService;
use discovery_api::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use tonic::{Request, Response, Status, Streaming};

#[tonic::async_trait]
impl<C: ConfigWatcher> AggregatedDiscoveryService for Service<C> {
    type StreamAggregatedResourcesStream = StreamResponse<DiscoveryResponse>;

    async fn stream_aggregated_resources(
        &self,
        req: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        self.stream(req, ANY_TYPE)
    }
}
