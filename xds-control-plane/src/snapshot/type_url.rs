macro_rules! prefix {
    ($type:literal) => {
        concat!("type.googleapis.com/", $type)
    };
}

/// Sentinel used by ADS streams, where each request carries its own type URL.
pub const ANY_TYPE: &str = "";

pub const CLUSTER: &str = prefix!("envoy.config.cluster.v3.Cluster");
pub const ENDPOINT: &str = prefix!("envoy.config.endpoint.v3.ClusterLoadAssignment");
pub const LISTENER: &str = prefix!("envoy.config.listener.v3.Listener");
pub const ROUTE: &str = prefix!("envoy.config.route.v3.RouteConfiguration");

/// Every type URL the server responds to. Iteration order carries no
/// protocol meaning.
pub const TYPE_URLS: [&str; 4] = [CLUSTER, ENDPOINT, LISTENER, ROUTE];

pub fn contains(type_url: &str) -> bool {
    TYPE_URLS.contains(&type_url)
}
