//! TrueNAS CSI Driver Library
//!
//! Kubernetes CSI driver that implements the Container Storage Interface
//! against a TrueNAS SCALE appliance's JSON-RPC-over-WebSocket middleware.
//!
//! This library provides:
//! - CSI Identity, Controller, and Node service implementations
//! - The Volume Lifecycle Engine that turns CSI calls into appliance calls
//! - Health checking and orphan adoption
//! - Platform-specific mount/attach operations

/// CSI proto generated types
pub mod csi {
    tonic::include_proto!("csi.v1");
}

pub mod controller;
pub mod engine;
pub mod health;
pub mod identity;
pub mod metrics;
pub mod node;
pub mod platform;
pub mod types;

pub use controller::ControllerService;
pub use engine::Engine;
pub use identity::IdentityService;
pub use node::NodeService;
