//! Health & Adoption (component E): orphan detection, cross-cluster
//! adoption, and the health check `ControllerGetVolume` and external
//! collaborators (the CLI plugin, the dashboard) use to assert a volume is
//! still serviceable.
//!
//! None of this holds any state of its own; everything here re-derives its
//! answer from the appliance through the same [`Engine`] the CSI surface
//! uses, per the metadata-on-the-backing-store design in spec §9.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, instrument};
use truenas_appliance_client::metadata::{PropertyKey, VolumeRecord};

use crate::engine::{Engine, EngineError};

/// The three checks that together decide whether a managed volume is
/// usable: the dataset backing it exists, its protocol binding exists, and
/// (file-share only) the export is actually enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeHealth {
    pub dataset_exists: bool,
    pub binding_healthy: bool,
}

impl VolumeHealth {
    pub fn is_healthy(&self) -> bool {
        self.dataset_exists && self.binding_healthy
    }
}

pub struct HealthChecker {
    engine: Arc<Engine>,
}

impl HealthChecker {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Dataset-exists-and-binding-healthy, per spec §4.5. `find_by_csi_name`
    /// already implies dataset existence (it only decodes datasets that are
    /// still there and still carry `managed_by`), so a not-found there
    /// collapses straight to an unhealthy report rather than an error.
    #[instrument(skip(self))]
    pub async fn check_volume(
        &self,
        root: &str,
        csi_volume_name: &str,
    ) -> Result<VolumeHealth, EngineError> {
        let record = match self.engine.metadata.find_by_csi_name(root, csi_volume_name).await? {
            Some(record) => record,
            None => {
                return Ok(VolumeHealth {
                    dataset_exists: false,
                    binding_healthy: false,
                });
            }
        };
        let binding_healthy = self
            .engine
            .protocol_for(record.protocol)
            .health(&record)
            .await?;
        Ok(VolumeHealth {
            dataset_exists: true,
            binding_healthy,
        })
    }

    /// Orphan detection per spec §4.5: every managed dataset under `root`
    /// whose `csi_volume_name` the orchestrator no longer recognizes as a
    /// live PersistentVolume. `known_ids` is supplied by the caller (the
    /// orchestrator-side inventory is external to this driver).
    #[instrument(skip(self, known_ids))]
    pub async fn find_orphans(
        &self,
        root: &str,
        known_ids: &HashSet<String>,
    ) -> Result<Vec<VolumeRecord>, EngineError> {
        let managed = self.engine.list_volumes(root).await?;
        Ok(managed
            .into_iter()
            .filter(|v| !known_ids.contains(&v.csi_volume_name))
            .collect())
    }

    /// Adoption per spec §4.5 and §9: flips `adoptable=true` on an orphaned
    /// dataset so a future `CreateVolume` with the same id rebinds it
    /// instead of failing with already-exists-incompatible.
    #[instrument(skip(self))]
    pub async fn mark_adoptable(&self, dataset: &str) -> Result<(), EngineError> {
        let mut props = std::collections::BTreeMap::new();
        props.insert(PropertyKey::Adoptable.to_string(), "true".to_string());
        self.engine.client.datasets.set_user_properties(dataset, props).await?;
        info!(dataset = %dataset, "marked dataset adoptable");
        Ok(())
    }

    /// The inverse of [`Self::mark_adoptable`], for an operator pulling a
    /// dataset back out of the adoption pool.
    #[instrument(skip(self))]
    pub async fn clear_adoptable(&self, dataset: &str) -> Result<(), EngineError> {
        let mut props = std::collections::BTreeMap::new();
        props.insert(PropertyKey::Adoptable.to_string(), "false".to_string());
        self.engine.client.datasets.set_user_properties(dataset, props).await?;
        info!(dataset = %dataset, "cleared dataset adoptable flag");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unhealthy_when_nothing_checked() {
        let health = VolumeHealth {
            dataset_exists: false,
            binding_healthy: false,
        };
        assert!(!health.is_healthy());
    }

    #[test]
    fn healthy_requires_both_checks() {
        let health = VolumeHealth {
            dataset_exists: true,
            binding_healthy: false,
        };
        assert!(!health.is_healthy());

        let health = VolumeHealth {
            dataset_exists: true,
            binding_healthy: true,
        };
        assert!(health.is_healthy());
    }
}
