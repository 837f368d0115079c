use crate::cache::ConfigWatcher;
use crate::service::common::{Service, StreamResponse};
use crate::snapshot::type_url::CLUSTER;
use discovery_api::envoy::service::cluster::v3::cluster_discovery_service_server::ClusterDiscoveryService;
use discovery_api::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use tonic::{Request, Response, Status, Streaming};

#[tonic::async_trait]
impl<C: ConfigWatcher> ClusterDiscoveryService for Service<C> {
    type StreamClustersStream = StreamResponse<DiscoveryResponse>;

    async fn stream_clusters(
        &self,
        req: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamClustersStream>, Status> {
        self.stream(req, CLUSTER)
    }
}
