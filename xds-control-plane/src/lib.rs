//! An xDS control-plane server core.
//!
//! The crate tracks what each connected data-plane client has, detects what
//! it should have, and pushes updates in protocol-correct order:
//!
//! - [`cache::snapshot::SnapshotCache`] stores one versioned [`snapshot::Snapshot`]
//!   per node group and parks [`cache::Watch`]es until a matching snapshot
//!   version arrives.
//! - [`service::common::Service`] exposes the five discovery stream endpoints
//!   (ADS/CDS/EDS/LDS/RDS), all backed by the same per-stream state machine
//!   in [`service::stream`].
//!
//! Snapshot contents, node grouping policy, and transport wiring are the
//! caller's concern; resource payloads are opaque packed `Any` values.

pub mod cache;
pub mod error;
pub mod service;
pub mod snapshot;
