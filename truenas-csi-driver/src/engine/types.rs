//! Shared types for the Volume Lifecycle Engine: the plan handed to a
//! [`super::ProtocolEngine`] on provision, the binding handed back, the
//! error enum the whole engine speaks, and the rollback bookkeeping that
//! undoes a partially completed `CreateVolume`.

use std::collections::BTreeMap;

use thiserror::Error;
use tonic::Status;
use tracing::warn;
use truenas_appliance_client::ApplianceError;
use truenas_appliance_client::metadata::Protocol;

use crate::types::StorageClassParams;

/// Everything a [`super::ProtocolEngine`] needs to provision a fresh
/// dataset's protocol binding. Built once per `CreateVolume` call.
#[derive(Debug, Clone)]
pub struct ProvisionPlan {
    pub dataset: String,
    pub capacity_bytes: u64,
    pub params: StorageClassParams,
}

/// What a protocol binding looks like once it exists, in the shape both the
/// CSI `volume_context` and the rollback stack need: enough identifiers to
/// tear it back down without re-deriving them from a half-written record.
#[derive(Debug, Clone, Default)]
pub struct Binding {
    pub volume_context: BTreeMap<String, String>,
    pub nfs_share_id: Option<i64>,
    pub nfs_share_path: Option<String>,
    pub nvme_subsystem_id: Option<i64>,
    pub nvme_subsystem_nqn: Option<String>,
    pub nvme_namespace_id: Option<i64>,
}

impl Binding {
    /// Folds this binding's protocol-specific identifiers into a property
    /// map destined for `set_user_properties`, so a volume's binding
    /// survives a controller restart the same way everything else does:
    /// written on the dataset, nowhere else.
    pub fn merge_into(&self, props: &mut BTreeMap<String, String>) {
        use truenas_appliance_client::metadata::PropertyKey;
        if let Some(id) = self.nfs_share_id {
            props.insert(PropertyKey::NfsShareId.to_string(), id.to_string());
        }
        if let Some(path) = &self.nfs_share_path {
            props.insert(PropertyKey::NfsSharePath.to_string(), path.clone());
        }
        if let Some(id) = self.nvme_subsystem_id {
            props.insert(PropertyKey::NvmeSubsystemId.to_string(), id.to_string());
        }
        if let Some(nqn) = &self.nvme_subsystem_nqn {
            props.insert(PropertyKey::NvmeSubsystemNqn.to_string(), nqn.clone());
        }
        if let Some(id) = self.nvme_namespace_id {
            props.insert(PropertyKey::NvmeNamespaceId.to_string(), id.to_string());
        }
    }

    /// Reconstructs a binding's identifiers from a decoded volume record, so
    /// `DeleteVolume` can call `unbind` without ever having run `provision`
    /// in this process.
    pub fn from_record(record: &truenas_appliance_client::metadata::VolumeRecord) -> Binding {
        Binding {
            volume_context: BTreeMap::new(),
            nfs_share_id: record.nfs_share_id,
            nfs_share_path: record.nfs_share_path.clone(),
            nvme_subsystem_id: record.nvme_subsystem_id,
            nvme_subsystem_nqn: record.nvme_subsystem_nqn.clone(),
            nvme_namespace_id: record.nvme_namespace_id,
        }
    }
}

/// The engine's own error taxonomy, one layer up from [`ApplianceError`].
/// Every variant maps onto exactly one gRPC status per the error table:
/// transport/timeout are retryable `Unavailable`, has-dependents is a
/// retryable `FailedPrecondition`, everything else follows CSI convention.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("appliance connection unavailable")]
    Unavailable,

    #[error("appliance authentication failed: {0}")]
    AuthFailed(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists with incompatible parameters: {0}")]
    AlreadyExists(String),

    #[error("has dependents: {0}")]
    HasDependents(String),

    #[error("insufficient space: {0}")]
    ResourceExhausted(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ApplianceError> for EngineError {
    fn from(err: ApplianceError) -> Self {
        match err {
            ApplianceError::TransportLost | ApplianceError::Timeout | ApplianceError::Closed => {
                EngineError::Unavailable
            }
            ApplianceError::AuthenticationFailed(msg) => EngineError::AuthFailed(msg),
            ApplianceError::NotFound(msg) => EngineError::NotFound(msg),
            ApplianceError::AlreadyExists(msg) => EngineError::AlreadyExists(msg),
            ApplianceError::HasDependents(msg) => EngineError::HasDependents(msg),
            ApplianceError::InvalidArgument(msg) => EngineError::InvalidArgument(msg),
            ApplianceError::Decode(msg) => EngineError::Internal(msg),
            ApplianceError::Rpc { code, message } => {
                let lower = message.to_lowercase();
                if lower.contains("out of space") || lower.contains("no space") {
                    EngineError::ResourceExhausted(message)
                } else {
                    EngineError::Internal(format!("appliance error {code}: {message}"))
                }
            }
        }
    }
}

impl From<EngineError> for Status {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Unavailable => Status::unavailable(err.to_string()),
            EngineError::AuthFailed(_) => Status::failed_precondition(err.to_string()),
            EngineError::InvalidArgument(_) => Status::invalid_argument(err.to_string()),
            EngineError::NotFound(_) => Status::not_found(err.to_string()),
            EngineError::AlreadyExists(_) => Status::already_exists(err.to_string()),
            EngineError::HasDependents(_) => Status::failed_precondition(err.to_string()),
            EngineError::ResourceExhausted(_) => Status::resource_exhausted(err.to_string()),
            EngineError::Internal(_) => Status::internal(err.to_string()),
        }
    }
}

/// A step compensating for a partially completed `CreateVolume`, in the
/// order it was performed. `RollbackStack::run` walks these in reverse.
pub enum RollbackStep {
    DeleteDataset(String),
    Unbind(Protocol, Binding),
}

/// Reverse-order, not-found-tolerant compensation for a `CreateVolume` that
/// failed partway through. A failure here is logged, never propagated: the
/// original error is always what the caller sees.
#[derive(Default)]
pub struct RollbackStack(Vec<RollbackStep>);

impl RollbackStack {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, step: RollbackStep) {
        self.0.push(step);
    }

    pub async fn run(&mut self, engine: &super::Engine) {
        while let Some(step) = self.0.pop() {
            match step {
                RollbackStep::DeleteDataset(path) => {
                    if let Err(e) = engine.client.datasets.delete(&path, false).await {
                        if !e.is_not_found() {
                            warn!(dataset = %path, error = %e, "rollback: failed to delete dataset");
                        }
                    }
                }
                RollbackStep::Unbind(protocol, binding) => {
                    if let Err(e) = engine.protocol_for(protocol).unbind(&binding).await {
                        warn!(?protocol, error = %e, "rollback: failed to unbind protocol resource");
                    }
                }
            }
        }
    }
}
