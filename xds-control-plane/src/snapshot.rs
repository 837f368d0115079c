pub mod type_url;

use discovery_api::google::protobuf::Any;
use std::collections::HashMap;

/// An immutable bundle of versioned resources for one node group.
///
/// A snapshot may be partial: types it does not mention report version `""`
/// and no resources. The cache replaces snapshots wholesale, so once
/// installed a snapshot is never mutated.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    resources: HashMap<String, Resources>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self {
            resources: HashMap::new(),
        }
    }

    pub fn insert(&mut self, type_url: impl Into<String>, resources: Resources) {
        self.resources.insert(type_url.into(), resources);
    }

    /// Version of the given type, or `""` if the snapshot does not carry it.
    /// Version equality is the only signal used to decide whether a client
    /// is up to date.
    pub fn version(&self, type_url: &str) -> &str {
        self.resources
            .get(type_url)
            .map_or("", |resources| &resources.version)
    }

    pub fn resources(&self, type_url: &str) -> Option<&Resources> {
        self.resources.get(type_url)
    }
}

/// The resources of a single type within a snapshot, keyed by name.
/// Payloads are opaque packed `Any` values; the server never decodes them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resources {
    pub version: String,
    pub items: HashMap<String, Any>,
}

impl Resources {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            items: HashMap::new(),
        }
    }

    pub fn with_items(
        version: impl Into<String>,
        items: impl IntoIterator<Item = (String, Any)>,
    ) -> Self {
        Self {
            version: version.into(),
            items: items.into_iter().collect(),
        }
    }
}
