//! The block protocol binding: an NVMe-over-TCP namespace exposing the
//! volume's zvol under a pre-existing subsystem.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;
use truenas_appliance_client::ApplianceClient;
use truenas_appliance_client::client::NvmePort;
use truenas_appliance_client::metadata::VolumeRecord;

use super::types::{Binding, EngineError, ProvisionPlan};
use super::ProtocolEngine;

pub struct BlockEngine {
    client: Arc<ApplianceClient>,
}

impl BlockEngine {
    pub fn new(client: Arc<ApplianceClient>) -> Self {
        Self { client }
    }

    fn device_path(&self, dataset: &str) -> String {
        format!("/dev/zvol/{dataset}")
    }
}

#[async_trait]
impl ProtocolEngine for BlockEngine {
    #[instrument(skip(self, plan))]
    async fn provision(&self, plan: &ProvisionPlan) -> Result<Binding, EngineError> {
        let nqn = plan.params.subsystem_nqn.as_deref().ok_or_else(|| {
            EngineError::InvalidArgument("block volumes require a subsystemNQN".into())
        })?;
        let subsystem = self
            .client
            .block
            .subsystem_by_nqn(nqn)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("nvme subsystem '{nqn}' not found")))?;

        let ports = self.client.block.ports_list().await?;
        if ports.is_empty() {
            return Err(EngineError::Internal(
                "no NVMe-oF ports configured on appliance".into(),
            ));
        }

        let device_path = self.device_path(&plan.dataset);
        let namespace = self
            .client
            .block
            .namespace_create(subsystem.id, &device_path)
            .await?;

        Ok(binding_for(&subsystem, namespace.id, &device_path, &ports))
    }

    #[instrument(skip(self, record))]
    async fn bind(&self, record: &VolumeRecord) -> Result<Binding, EngineError> {
        let nqn = record.nvme_subsystem_nqn.clone().ok_or_else(|| {
            EngineError::Internal(format!(
                "volume '{}' has no recorded nvme subsystem nqn",
                record.dataset
            ))
        })?;
        let subsystem = self
            .client
            .block
            .subsystem_by_nqn(&nqn)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("nvme subsystem '{nqn}' not found")))?;
        let ports = self.client.block.ports_list().await?;

        let device_path = self.device_path(&record.dataset);
        let namespace_id = match record.nvme_namespace_id {
            Some(id) => id,
            None => {
                self.client
                    .block
                    .namespace_create(subsystem.id, &device_path)
                    .await?
                    .id
            }
        };

        Ok(binding_for(&subsystem, namespace_id, &device_path, &ports))
    }

    #[instrument(skip(self, binding))]
    async fn unbind(&self, binding: &Binding) -> Result<(), EngineError> {
        let Some(namespace_id) = binding.nvme_namespace_id else {
            return Ok(());
        };
        match self.client.block.namespace_delete(namespace_id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, record))]
    async fn health(&self, record: &VolumeRecord) -> Result<bool, EngineError> {
        let Some(nqn) = &record.nvme_subsystem_nqn else {
            return Ok(false);
        };
        Ok(self.client.block.subsystem_by_nqn(nqn).await?.is_some() && record.nvme_namespace_id.is_some())
    }
}

fn binding_for(
    subsystem: &truenas_appliance_client::client::NvmeSubsystem,
    namespace_id: i64,
    device_path: &str,
    ports: &[NvmePort],
) -> Binding {
    let mut volume_context = std::collections::BTreeMap::new();
    volume_context.insert("protocol".to_string(), "block".to_string());
    volume_context.insert("nvmeSubsystemNQN".to_string(), subsystem.nqn.clone());
    volume_context.insert("nvmeNamespaceId".to_string(), namespace_id.to_string());
    volume_context.insert("devicePath".to_string(), device_path.to_string());
    if let Some(port) = ports.first() {
        volume_context.insert("nvmeTransportAddr".to_string(), port.addr_traddr.clone());
        volume_context.insert("nvmeTransportPort".to_string(), port.addr_trsvcid.clone());
    }
    Binding {
        volume_context,
        nfs_share_id: None,
        nfs_share_path: None,
        nvme_subsystem_id: Some(subsystem.id),
        nvme_subsystem_nqn: Some(subsystem.nqn.clone()),
        nvme_namespace_id: Some(namespace_id),
    }
}
