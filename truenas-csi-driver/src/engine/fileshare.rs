//! The file-share protocol binding: an NFS export rooted at the volume's
//! dataset mountpoint.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;
use truenas_appliance_client::ApplianceClient;
use truenas_appliance_client::client::NfsShareSpec;
use truenas_appliance_client::metadata::VolumeRecord;

use super::types::{Binding, EngineError, ProvisionPlan};
use super::ProtocolEngine;

pub struct FileShareEngine {
    client: Arc<ApplianceClient>,
}

impl FileShareEngine {
    pub fn new(client: Arc<ApplianceClient>) -> Self {
        Self { client }
    }

    fn export_path(&self, dataset: &str) -> String {
        format!("/mnt/{dataset}")
    }
}

#[async_trait]
impl ProtocolEngine for FileShareEngine {
    #[instrument(skip(self))]
    async fn provision(&self, plan: &ProvisionPlan) -> Result<Binding, EngineError> {
        let path = self.export_path(&plan.dataset);
        if let Some(existing) = self.client.shares.query_by_path(&path).await? {
            return Ok(binding_for(existing.id, &path));
        }
        let share = self
            .client
            .shares
            .create(NfsShareSpec {
                path: path.clone(),
                networks: Vec::new(),
                hosts: Vec::new(),
                read_only: false,
                maproot_user: Some("root".to_string()),
            })
            .await?;
        Ok(binding_for(share.id, &path))
    }

    #[instrument(skip(self, record))]
    async fn bind(&self, record: &VolumeRecord) -> Result<Binding, EngineError> {
        let path = record
            .nfs_share_path
            .clone()
            .unwrap_or_else(|| self.export_path(&record.dataset));
        if let Some(existing) = self.client.shares.query_by_path(&path).await? {
            return Ok(binding_for(existing.id, &path));
        }
        let share = self
            .client
            .shares
            .create(NfsShareSpec {
                path: path.clone(),
                networks: Vec::new(),
                hosts: Vec::new(),
                read_only: false,
                maproot_user: Some("root".to_string()),
            })
            .await?;
        Ok(binding_for(share.id, &path))
    }

    #[instrument(skip(self, binding))]
    async fn unbind(&self, binding: &Binding) -> Result<(), EngineError> {
        let id = match binding.nfs_share_id {
            Some(id) => Some(id),
            None => match &binding.nfs_share_path {
                Some(path) => self.client.shares.query_by_path(path).await?.map(|s| s.id),
                None => None,
            },
        };
        match id {
            Some(id) => match self.client.shares.delete(id).await {
                Ok(()) => Ok(()),
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => Err(e.into()),
            },
            None => Ok(()),
        }
    }

    #[instrument(skip(self, record))]
    async fn health(&self, record: &VolumeRecord) -> Result<bool, EngineError> {
        let path = record
            .nfs_share_path
            .clone()
            .unwrap_or_else(|| self.export_path(&record.dataset));
        Ok(self
            .client
            .shares
            .query_by_path(&path)
            .await?
            .map(|s| s.enabled)
            .unwrap_or(false))
    }
}

fn binding_for(share_id: i64, path: &str) -> Binding {
    let mut volume_context = std::collections::BTreeMap::new();
    volume_context.insert("protocol".to_string(), "file-share".to_string());
    volume_context.insert("nfsSharePath".to_string(), path.to_string());
    Binding {
        volume_context,
        nfs_share_id: Some(share_id),
        nfs_share_path: Some(path.to_string()),
        nvme_subsystem_id: None,
        nvme_subsystem_nqn: None,
        nvme_namespace_id: None,
    }
}
