//! Generated discovery protocol types and gRPC service definitions.

#![allow(clippy::all)]

include!(concat!(env!("OUT_DIR"), "/mod.rs"));
