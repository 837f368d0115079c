use crate::cache::{ConfigWatcher, IdNodeGroup, NodeGroup, Response, Watch, WatchEmitter};
use crate::snapshot::{Resources, Snapshot};
use discovery_api::envoy::config::core::v3::Node;
use discovery_api::envoy::service::discovery::v3::DiscoveryRequest;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::{debug, info};

/// Stores one versioned [`Snapshot`] per node group and parks watches until
/// the snapshot they are waiting for arrives.
///
/// In ADS mode, requests that name resources are responded to only once every
/// named resource is present in the snapshot for that type. It is expected
/// that the CDS response names all EDS clusters and the LDS response names
/// all RDS routes, so that the client eventually requests everything the
/// snapshot carries.
pub struct SnapshotCache {
    ads: bool,
    node_group: Box<dyn NodeGroup>,
    inner: Arc<RwLock<CacheState>>,
}

struct CacheState {
    snapshots: HashMap<String, Snapshot>,
    statuses: HashMap<String, CacheStatusInfo>,
    watch_count: u64,
}

struct ParkedWatch {
    request: DiscoveryRequest,
    emitter: WatchEmitter,
}

/// Per-group bookkeeping. Only touched with the cache write lock held.
struct CacheStatusInfo {
    node: Option<Node>,
    last_watch_request_time: Instant,
    watches: HashMap<u64, ParkedWatch>,
}

impl CacheStatusInfo {
    fn new(node: Option<Node>) -> Self {
        Self {
            node,
            last_watch_request_time: Instant::now(),
            watches: HashMap::new(),
        }
    }

    fn set_watch(&mut self, watch_id: u64, watch: ParkedWatch) {
        self.watches.insert(watch_id, watch);
    }

    fn remove_watch(&mut self, watch_id: u64) {
        self.watches.remove(&watch_id);
    }

    // The predicate may emit on the watch before asking for its removal.
    fn remove_if(&mut self, mut predicate: impl FnMut(u64, &mut ParkedWatch) -> bool) {
        self.watches.retain(|id, watch| !predicate(*id, watch));
    }

    fn set_last_watch_request_time(&mut self, time: Instant) {
        self.last_watch_request_time = time;
    }

    fn view(&self) -> StatusInfo {
        StatusInfo {
            node: self.node.clone(),
            last_watch_request_time: self.last_watch_request_time,
            num_watches: self.watches.len(),
        }
    }
}

/// Read-only view of a group's status, taken under the cache read lock.
#[derive(Debug, Clone)]
pub struct StatusInfo {
    node: Option<Node>,
    last_watch_request_time: Instant,
    num_watches: usize,
}

impl StatusInfo {
    pub fn node(&self) -> Option<&Node> {
        self.node.as_ref()
    }

    pub fn last_watch_request_time(&self) -> Instant {
        self.last_watch_request_time
    }

    pub fn num_watches(&self) -> usize {
        self.num_watches
    }
}

impl SnapshotCache {
    /// A cache that groups clients by node id.
    ///
    /// `ads` delays responses to named-resource requests until the snapshot
    /// covers every requested name.
    pub fn new(ads: bool) -> Self {
        Self::with_node_group(ads, IdNodeGroup)
    }

    pub fn with_node_group(ads: bool, node_group: impl NodeGroup) -> Self {
        Self {
            ads,
            node_group: Box::new(node_group),
            inner: Arc::new(RwLock::new(CacheState {
                snapshots: HashMap::new(),
                statuses: HashMap::new(),
                watch_count: 0,
            })),
        }
    }

    /// Installs the snapshot for a group, replacing any previous one, and
    /// responds to every parked watch whose request version is now stale.
    pub fn set_snapshot(&self, group: &str, snapshot: Snapshot) {
        let mut state = self.inner.write().expect("cache lock poisoned");
        state.snapshots.insert(group.to_string(), snapshot);

        let CacheState {
            snapshots,
            statuses,
            ..
        } = &mut *state;
        let Some(status) = statuses.get_mut(group) else {
            return;
        };
        let snapshot = &snapshots[group];
        let ads = self.ads;

        status.remove_if(|watch_id, watch| {
            let version = snapshot.version(&watch.request.type_url);
            if watch.request.version_info == version {
                // The request version matches the new snapshot, so we keep
                // waiting for a later one.
                return false;
            }
            match try_respond(&watch.request, snapshot, ads, group) {
                Some(response) => {
                    info!(
                        "responding to open watch {} for {}[{}] with new version {}",
                        watch_id,
                        watch.request.type_url,
                        watch.request.resource_names.join(", "),
                        response.version,
                    );
                    watch.emitter.emit(response);
                    // Discard the watch. A new one is created when the client
                    // ACKs the response.
                    true
                }
                // Blocked by the ADS rule; the watch stays parked until a
                // covering snapshot arrives.
                None => false,
            }
        });
    }

    pub fn snapshot(&self, group: &str) -> Option<Snapshot> {
        let state = self.inner.read().expect("cache lock poisoned");
        state.snapshots.get(group).cloned()
    }

    /// Removes the snapshot for a group. Parked watches are unaffected; they
    /// respond once a new snapshot is installed.
    pub fn clear_snapshot(&self, group: &str) {
        let mut state = self.inner.write().expect("cache lock poisoned");
        state.snapshots.remove(group);
    }

    pub fn groups(&self) -> Vec<String> {
        let state = self.inner.read().expect("cache lock poisoned");
        state.statuses.keys().cloned().collect()
    }

    pub fn status_info(&self, group: &str) -> Option<StatusInfo> {
        let state = self.inner.read().expect("cache lock poisoned");
        state.statuses.get(group).map(CacheStatusInfo::view)
    }
}

impl ConfigWatcher for SnapshotCache {
    fn create_watch(&self, request: &DiscoveryRequest) -> Watch {
        let group = self.node_group.hash(request.node.as_ref());
        let mut state = self.inner.write().expect("cache lock poisoned");

        state.watch_count += 1;
        let watch_id = state.watch_count;

        let status = state
            .statuses
            .entry(group.clone())
            .or_insert_with(|| CacheStatusInfo::new(request.node.clone()));
        status.set_last_watch_request_time(Instant::now());

        let (mut watch, mut emitter) = Watch::new(watch_id, request.clone());

        if let Some(snapshot) = state.snapshots.get(&group) {
            let version = snapshot.version(&request.type_url);
            if request.version_info != version {
                if let Some(response) = try_respond(request, snapshot, self.ads, &group) {
                    info!(
                        "responding to {}[{}] from node {} with version {}",
                        request.type_url,
                        request.resource_names.join(", "),
                        group,
                        response.version,
                    );
                    emitter.emit(response);
                    return watch;
                }
                // The ADS rule blocks the response; fall through and park.
            }
        }

        // The requested version is up to date (or no snapshot exists yet, or
        // ADS is holding the response back), so leave an open watch.
        info!(
            "open watch {} for {}[{}] from node {} for version {}",
            watch_id,
            request.type_url,
            request.resource_names.join(", "),
            group,
            request.version_info,
        );
        state
            .statuses
            .get_mut(&group)
            .expect("status created above")
            .set_watch(
                watch_id,
                ParkedWatch {
                    request: request.clone(),
                    emitter,
                },
            );

        let inner = Arc::clone(&self.inner);
        watch.set_cancel(Box::new(move || {
            let mut state = inner.write().expect("cache lock poisoned");
            if let Some(status) = state.statuses.get_mut(&group) {
                status.remove_watch(watch_id);
            }
        }));
        watch
    }
}

/// Builds the response for a request against a snapshot, or `None` when the
/// ADS resource-naming rule holds it back.
fn try_respond(
    request: &DiscoveryRequest,
    snapshot: &Snapshot,
    ads: bool,
    group: &str,
) -> Option<Response> {
    let resources = snapshot.resources(&request.type_url);
    let version = snapshot.version(&request.type_url);

    if ads && !request.resource_names.is_empty() {
        let missing: Vec<&str> = request
            .resource_names
            .iter()
            .filter(|name| !resources.is_some_and(|r| r.items.contains_key(*name)))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            debug!(
                "not responding in ADS mode for {} from node {} at version {} since [{}] is missing from the snapshot",
                request.type_url,
                group,
                version,
                missing.join(", "),
            );
            return None;
        }
    }

    Some(build_response(request, resources, version))
}

fn build_response(
    request: &DiscoveryRequest,
    resources: Option<&Resources>,
    version: &str,
) -> Response {
    let mut filtered = Vec::new();
    if let Some(resources) = resources {
        if request.resource_names.is_empty() {
            filtered = resources.items.values().cloned().collect();
        } else {
            // Requested order, skipping names the snapshot does not carry.
            for name in &request.resource_names {
                if let Some(any) = resources.items.get(name) {
                    filtered.push(any.clone());
                }
            }
        }
    }
    Response {
        version: version.to_string(),
        resources: filtered,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::type_url;
    use discovery_api::google::protobuf::Any;
    use pretty_assertions::assert_eq;

    fn any(name: &str) -> Any {
        Any {
            type_url: type_url::CLUSTER.to_string(),
            value: name.as_bytes().to_vec(),
        }
    }

    fn request(node_id: &str, type_url: &str, version: &str, names: &[&str]) -> DiscoveryRequest {
        DiscoveryRequest {
            node: Some(Node {
                id: node_id.to_string(),
                ..Node::default()
            }),
            type_url: type_url.to_string(),
            version_info: version.to_string(),
            resource_names: names.iter().map(|name| name.to_string()).collect(),
            ..DiscoveryRequest::default()
        }
    }

    fn snapshot_of(type_url: &str, version: &str, names: &[&str]) -> Snapshot {
        let mut snapshot = Snapshot::new();
        snapshot.insert(
            type_url,
            Resources::with_items(
                version,
                names.iter().map(|name| (name.to_string(), any(name))),
            ),
        );
        snapshot
    }

    fn sorted_names(response: &Response) -> Vec<String> {
        let mut names: Vec<String> = response
            .resources
            .iter()
            .map(|any| String::from_utf8(any.value.clone()).unwrap())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn cold_start_parks_a_watch() {
        let cache = SnapshotCache::new(false);
        let watch = cache.create_watch(&request("node-a", type_url::CLUSTER, "", &[]));
        let (_handle, mut rx) = watch.split();
        assert!(rx.try_recv().is_err());
        let status = cache.status_info("node-a").unwrap();
        assert_eq!(status.num_watches(), 1);
        assert_eq!(status.node().unwrap().id, "node-a");
    }

    #[test]
    fn snapshot_update_triggers_parked_watch() {
        let cache = SnapshotCache::new(false);
        let watch = cache.create_watch(&request("node-a", type_url::CLUSTER, "", &[]));
        let (_handle, mut rx) = watch.split();

        cache.set_snapshot("node-a", snapshot_of(type_url::CLUSTER, "v1", &["a", "b"]));

        let response = rx.try_recv().unwrap();
        assert_eq!(response.version, "v1");
        assert_eq!(sorted_names(&response), vec!["a", "b"]);
        assert_eq!(cache.status_info("node-a").unwrap().num_watches(), 0);
    }

    #[test]
    fn up_to_date_request_parks_until_next_version() {
        let cache = SnapshotCache::new(false);
        cache.set_snapshot("node-a", snapshot_of(type_url::CLUSTER, "v1", &["a"]));

        let watch = cache.create_watch(&request("node-a", type_url::CLUSTER, "v1", &[]));
        let (_handle, mut rx) = watch.split();
        assert!(rx.try_recv().is_err());
        assert_eq!(cache.status_info("node-a").unwrap().num_watches(), 1);

        cache.set_snapshot("node-a", snapshot_of(type_url::CLUSTER, "v2", &["a", "c"]));
        let response = rx.try_recv().unwrap();
        assert_eq!(response.version, "v2");
        assert_eq!(sorted_names(&response), vec!["a", "c"]);
    }

    #[test]
    fn stale_version_is_answered_immediately() {
        let cache = SnapshotCache::new(false);
        cache.set_snapshot("node-a", snapshot_of(type_url::CLUSTER, "v2", &["a"]));

        let watch = cache.create_watch(&request("node-a", type_url::CLUSTER, "v1", &[]));
        let (_handle, mut rx) = watch.split();
        let response = rx.try_recv().unwrap();
        assert_eq!(response.version, "v2");
        assert_eq!(cache.status_info("node-a").unwrap().num_watches(), 0);
    }

    #[test]
    fn named_resources_come_back_in_request_order() {
        let cache = SnapshotCache::new(false);
        cache.set_snapshot(
            "node-a",
            snapshot_of(type_url::CLUSTER, "v1", &["a", "b", "c"]),
        );

        let watch = cache.create_watch(&request(
            "node-a",
            type_url::CLUSTER,
            "",
            &["c", "a", "missing"],
        ));
        let (_handle, mut rx) = watch.split();
        let response = rx.try_recv().unwrap();
        let names: Vec<String> = response
            .resources
            .iter()
            .map(|any| String::from_utf8(any.value.clone()).unwrap())
            .collect();
        assert_eq!(names, vec!["c", "a"]);
    }

    #[test]
    fn ads_holds_response_until_names_are_covered() {
        let cache = SnapshotCache::new(true);
        cache.set_snapshot("node-a", snapshot_of(type_url::ENDPOINT, "v2", &["a", "b"]));

        let watch = cache.create_watch(&request(
            "node-a",
            type_url::ENDPOINT,
            "",
            &["a", "b", "c"],
        ));
        let (_handle, mut rx) = watch.split();
        assert!(rx.try_recv().is_err());
        assert_eq!(cache.status_info("node-a").unwrap().num_watches(), 1);

        cache.set_snapshot(
            "node-a",
            snapshot_of(type_url::ENDPOINT, "v3", &["a", "b", "c"]),
        );
        let response = rx.try_recv().unwrap();
        assert_eq!(response.version, "v3");
        assert_eq!(sorted_names(&response), vec!["a", "b", "c"]);
    }

    #[test]
    fn ads_retains_blocked_watch_across_updates() {
        let cache = SnapshotCache::new(true);
        let watch = cache.create_watch(&request("node-a", type_url::ENDPOINT, "", &["a", "z"]));
        let (_handle, mut rx) = watch.split();

        cache.set_snapshot("node-a", snapshot_of(type_url::ENDPOINT, "v1", &["a"]));
        assert!(rx.try_recv().is_err());
        assert_eq!(cache.status_info("node-a").unwrap().num_watches(), 1);

        cache.set_snapshot("node-a", snapshot_of(type_url::ENDPOINT, "v2", &["a", "z"]));
        let response = rx.try_recv().unwrap();
        assert_eq!(response.version, "v2");
    }

    #[test]
    fn without_ads_missing_names_are_skipped() {
        let cache = SnapshotCache::new(false);
        cache.set_snapshot("node-a", snapshot_of(type_url::ENDPOINT, "v2", &["a", "b"]));

        let watch = cache.create_watch(&request(
            "node-a",
            type_url::ENDPOINT,
            "",
            &["a", "b", "c"],
        ));
        let (_handle, mut rx) = watch.split();
        let response = rx.try_recv().unwrap();
        assert_eq!(response.version, "v2");
        assert_eq!(sorted_names(&response), vec!["a", "b"]);
    }

    #[test]
    fn cancel_removes_the_parked_watch() {
        let cache = SnapshotCache::new(false);
        let watch = cache.create_watch(&request("node-a", type_url::CLUSTER, "", &[]));
        let (mut handle, mut rx) = watch.split();

        handle.cancel();
        assert_eq!(cache.status_info("node-a").unwrap().num_watches(), 0);
        assert!(matches!(
            rx.try_recv(),
            Err(tokio::sync::oneshot::error::TryRecvError::Closed)
        ));

        // A snapshot installed after cancellation emits nothing.
        cache.set_snapshot("node-a", snapshot_of(type_url::CLUSTER, "v1", &["a"]));
    }

    #[test]
    fn dropping_the_handle_cancels_too() {
        let cache = SnapshotCache::new(false);
        let watch = cache.create_watch(&request("node-a", type_url::CLUSTER, "", &[]));
        let (handle, _rx) = watch.split();
        drop(handle);
        assert_eq!(cache.status_info("node-a").unwrap().num_watches(), 0);
    }

    #[test]
    fn cancel_after_emission_is_harmless() {
        let cache = SnapshotCache::new(false);
        let watch = cache.create_watch(&request("node-a", type_url::CLUSTER, "", &[]));
        let (mut handle, mut rx) = watch.split();

        cache.set_snapshot("node-a", snapshot_of(type_url::CLUSTER, "v1", &["a"]));
        assert!(rx.try_recv().is_ok());
        handle.cancel();
        assert_eq!(cache.status_info("node-a").unwrap().num_watches(), 0);
    }

    #[test]
    fn snapshot_accessors_round_trip() {
        let cache = SnapshotCache::new(false);
        assert!(cache.snapshot("node-a").is_none());

        cache.set_snapshot("node-a", snapshot_of(type_url::CLUSTER, "v1", &["a"]));
        assert_eq!(
            cache.snapshot("node-a").unwrap().version(type_url::CLUSTER),
            "v1"
        );

        cache.clear_snapshot("node-a");
        assert!(cache.snapshot("node-a").is_none());
    }

    #[test]
    fn watches_for_different_types_are_independent() {
        let cache = SnapshotCache::new(false);
        let cluster_watch = cache.create_watch(&request("node-a", type_url::CLUSTER, "", &[]));
        let listener_watch = cache.create_watch(&request("node-a", type_url::LISTENER, "", &[]));
        let (_ch, mut cluster_rx) = cluster_watch.split();
        let (_lh, mut listener_rx) = listener_watch.split();

        let mut snapshot = snapshot_of(type_url::CLUSTER, "v1", &["a"]);
        snapshot.insert(type_url::LISTENER, Resources::new("v1"));
        cache.set_snapshot("node-a", snapshot);

        assert_eq!(cluster_rx.try_recv().unwrap().version, "v1");
        let listener_response = listener_rx.try_recv().unwrap();
        assert_eq!(listener_response.version, "v1");
        assert!(listener_response.resources.is_empty());
    }

    #[test]
    fn watch_ids_are_monotone() {
        let cache = SnapshotCache::new(false);
        let first = cache.create_watch(&request("node-a", type_url::CLUSTER, "", &[]));
        let second = cache.create_watch(&request("node-a", type_url::LISTENER, "", &[]));
        assert!(second.id() > first.id());
    }

    #[test]
    fn last_watch_request_time_moves_forward() {
        let cache = SnapshotCache::new(false);
        let before = Instant::now();
        let _watch = cache.create_watch(&request("node-a", type_url::CLUSTER, "", &[]));
        let status = cache.status_info("node-a").unwrap();
        assert!(status.last_watch_request_time() >= before);
        assert_eq!(cache.groups(), vec!["node-a".to_string()]);
    }

    struct SharedGroup;

    impl NodeGroup for SharedGroup {
        fn hash(&self, _node: Option<&Node>) -> String {
            "default".to_string()
        }
    }

    #[test]
    fn custom_node_group_shares_snapshots() {
        let cache = SnapshotCache::with_node_group(false, SharedGroup);
        cache.set_snapshot("default", snapshot_of(type_url::CLUSTER, "v1", &["a"]));

        let watch = cache.create_watch(&request("some-node", type_url::CLUSTER, "", &[]));
        let (_handle, mut rx) = watch.split();
        assert_eq!(rx.try_recv().unwrap().version, "v1");
    }
}
