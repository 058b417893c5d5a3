//! Wire layer and typed client for talking to a TrueNAS SCALE appliance's
//! JSON-RPC-over-WebSocket middleware, plus the metadata convention the CSI
//! driver uses to keep ZFS datasets as its only durable state.

pub mod client;
pub mod config;
pub mod error;
pub mod metadata;
pub mod transport;

pub use client::{ApplianceClient, Dataset, DatasetApi, DatasetCreateSpec, DatasetType};
pub use config::{ApiKey, ApplianceConfig, MethodNames};
pub use error::{ApplianceError, Result};
pub use metadata::{MetadataStore, PropertyKey, Protocol, SnapshotRef, VolumeRecord};
pub use transport::{ConnectionState, Multiplexer};
