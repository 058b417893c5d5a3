//! Volume Lifecycle Engine: turns CSI `CreateVolume`/`DeleteVolume`/
//! `CreateSnapshot`/`DeleteSnapshot`/`ControllerExpandVolume` calls into
//! appliance operations, with idempotent lookup-before-act, adoption, and
//! rollback-without-transactions as its three cross-cutting behaviors.
//!
//! Protocol-specific work (NFS exports vs NVMe-oF namespaces) is isolated
//! behind the [`ProtocolEngine`] trait rather than an inheritance hierarchy:
//! a tagged variant plus two small function tables, dispatched by
//! [`Engine::protocol_for`].

mod block;
mod fileshare;
pub mod types;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument};
use truenas_appliance_client::client::DatasetCreateSpec;
use truenas_appliance_client::client::DatasetType;
use truenas_appliance_client::metadata::{
    self, CloneMode, PropertyKey, Protocol, SnapshotRecord, SnapshotRef, VolumeRecord,
};
use truenas_appliance_client::{ApplianceClient, MetadataStore};

pub use block::BlockEngine;
pub use fileshare::FileShareEngine;
pub use types::{Binding, EngineError, ProvisionPlan, RollbackStack, RollbackStep};

/// The per-protocol half of volume lifecycle: provisioning a fresh binding,
/// re-establishing one for an adopted dataset, tearing one down, and
/// reporting whether it is still healthy.
#[async_trait]
pub trait ProtocolEngine: Send + Sync {
    async fn provision(&self, plan: &ProvisionPlan) -> Result<Binding, EngineError>;
    async fn bind(&self, record: &VolumeRecord) -> Result<Binding, EngineError>;
    async fn unbind(&self, binding: &Binding) -> Result<(), EngineError>;
    async fn health(&self, record: &VolumeRecord) -> Result<bool, EngineError>;
}

/// Where a new volume's data should come from.
#[derive(Debug, Clone)]
pub enum ContentSource {
    Snapshot(String),
    Volume(String),
}

/// Everything `CreateVolume` needs that isn't already captured by
/// [`crate::types::StorageClassParams`].
#[derive(Debug, Clone)]
pub struct CreateVolumeArgs {
    pub csi_volume_name: String,
    pub capacity_bytes: u64,
    pub content_source: Option<ContentSource>,
    pub pvc_name: Option<String>,
    pub pvc_namespace: Option<String>,
    pub storage_class: Option<String>,
}

/// A created or adopted snapshot, in the shape `controller.rs` converts to
/// a CSI `Snapshot` message.
#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub id: String,
    pub source_volume_id: String,
    pub size_bytes: u64,
    pub ready: bool,
}

pub struct Engine {
    pub client: Arc<ApplianceClient>,
    pub metadata: MetadataStore,
    fileshare: FileShareEngine,
    block: BlockEngine,
}

impl Engine {
    pub fn new(client: Arc<ApplianceClient>) -> Self {
        let metadata = MetadataStore::new(Arc::new(client.datasets.clone()));
        Self {
            fileshare: FileShareEngine::new(client.clone()),
            block: BlockEngine::new(client.clone()),
            client,
            metadata,
        }
    }

    pub fn protocol_for(&self, protocol: Protocol) -> &dyn ProtocolEngine {
        match protocol {
            Protocol::FileShare => &self.fileshare,
            Protocol::Block => &self.block,
        }
    }

    /// `CreateVolume`: lookup-before-act, adoption, clone-from-snapshot and
    /// clone-from-volume, and rollback of everything done so far on any
    /// failure after the dataset step.
    #[instrument(skip(self, params, args))]
    pub async fn create_volume(
        &self,
        params: &crate::types::StorageClassParams,
        args: CreateVolumeArgs,
    ) -> Result<(VolumeRecord, Binding), EngineError> {
        let root = params.root();

        if let Some(existing) = self
            .metadata
            .find_by_csi_name(&root, &args.csi_volume_name)
            .await?
        {
            if existing.adoptable {
                info!(volume = %args.csi_volume_name, dataset = %existing.dataset, "adopting orphaned volume");
                let binding = self.protocol_for(existing.protocol).bind(&existing).await?;
                self.clear_adoptable(&existing).await?;
                return Ok((existing, binding));
            }
            if existing.protocol == params.protocol && existing.capacity_bytes >= args.capacity_bytes
            {
                let binding = self.protocol_for(existing.protocol).bind(&existing).await?;
                return Ok((existing, binding));
            }
            return Err(EngineError::AlreadyExists(format!(
                "volume '{}' already exists with incompatible parameters",
                args.csi_volume_name
            )));
        }

        let dataset_path = params.dataset_path(&args.csi_volume_name);
        let mut rollback = RollbackStack::new();

        let mut clone_mode = None;
        let mut origin_snapshot = None;
        let mut content_source_type = None;
        let mut content_source_id = None;

        match &args.content_source {
            None => {
                self.create_fresh_dataset(params, &dataset_path, args.capacity_bytes)
                    .await?;
                rollback.push(RollbackStep::DeleteDataset(dataset_path.clone()));
            }
            Some(ContentSource::Snapshot(snapshot_id)) => {
                let (mode, origin, src_type, src_id) = self
                    .clone_from_snapshot(params, &dataset_path, snapshot_id)
                    .await?;
                rollback.push(RollbackStep::DeleteDataset(dataset_path.clone()));
                clone_mode = Some(mode);
                origin_snapshot = origin;
                content_source_type = Some(src_type);
                content_source_id = Some(src_id);
            }
            Some(ContentSource::Volume(source_volume_id)) => {
                let (mode, origin) = self
                    .clone_from_volume(&root, params, &dataset_path, source_volume_id)
                    .await?;
                rollback.push(RollbackStep::DeleteDataset(dataset_path.clone()));
                clone_mode = Some(mode);
                origin_snapshot = origin;
                content_source_type = Some("volume".to_string());
                content_source_id = Some(source_volume_id.clone());
            }
        }

        let plan = ProvisionPlan {
            dataset: dataset_path.clone(),
            capacity_bytes: args.capacity_bytes,
            params: params.clone(),
        };
        let binding = match self.protocol_for(params.protocol).provision(&plan).await {
            Ok(binding) => binding,
            Err(e) => {
                rollback.run(self).await;
                return Err(e);
            }
        };
        rollback.push(RollbackStep::Unbind(params.protocol, binding.clone()));

        let mut props = metadata::user_properties_for_new_volume(
            &args.csi_volume_name,
            params.protocol,
            args.capacity_bytes,
            params.delete_strategy,
            args.pvc_name.as_deref(),
            args.pvc_namespace.as_deref(),
            args.storage_class.as_deref(),
        );
        if let Some(mode) = clone_mode {
            props.insert(PropertyKey::CloneMode.to_string(), mode.as_str().into());
        }
        if let Some(origin) = &origin_snapshot {
            props.insert(PropertyKey::OriginSnapshot.to_string(), origin.clone());
        }
        if let (Some(t), Some(id)) = (&content_source_type, &content_source_id) {
            props.insert(PropertyKey::ContentSourceType.to_string(), t.clone());
            props.insert(PropertyKey::ContentSourceId.to_string(), id.clone());
        }
        binding.merge_into(&mut props);

        if let Err(e) = self.client.datasets.set_user_properties(&dataset_path, props).await {
            rollback.run(self).await;
            return Err(e.into());
        }

        let record = self
            .metadata
            .find_by_csi_name(&root, &args.csi_volume_name)
            .await?
            .ok_or_else(|| EngineError::Internal("volume vanished immediately after creation".into()))?;
        Ok((record, binding))
    }

    async fn create_fresh_dataset(
        &self,
        params: &crate::types::StorageClassParams,
        dataset_path: &str,
        capacity_bytes: u64,
    ) -> Result<(), EngineError> {
        let dataset_type = match params.protocol {
            Protocol::Block => DatasetType::Volume,
            Protocol::FileShare => DatasetType::Filesystem,
        };
        let volsize_bytes = match params.protocol {
            Protocol::Block => Some(capacity_bytes),
            Protocol::FileShare => None,
        };
        let mut zfs_properties = BTreeMap::new();
        if let Some(compression) = &params.zfs.compression {
            zfs_properties.insert("compression".to_string(), compression.clone());
        }
        if let Some(sync) = &params.zfs.sync {
            zfs_properties.insert("sync".to_string(), sync.clone());
        }
        match params.protocol {
            Protocol::FileShare => {
                if let Some(recordsize) = &params.zfs.recordsize {
                    zfs_properties.insert("recordsize".to_string(), recordsize.clone());
                }
            }
            Protocol::Block => {
                if let Some(volblocksize) = &params.zfs.volblocksize {
                    zfs_properties.insert("volblocksize".to_string(), volblocksize.clone());
                }
            }
        }
        self.client
            .datasets
            .create(DatasetCreateSpec {
                name: dataset_path.to_string(),
                dataset_type,
                volsize_bytes,
                user_properties: BTreeMap::new(),
                zfs_properties,
            })
            .await?;
        Ok(())
    }

    async fn clone_from_snapshot(
        &self,
        params: &crate::types::StorageClassParams,
        dataset_path: &str,
        snapshot_id: &str,
    ) -> Result<(CloneMode, Option<String>, String, String), EngineError> {
        match SnapshotRef::decode(snapshot_id) {
            Some(SnapshotRef::Attached { dataset, tag }) => {
                let source = format!("{dataset}@{tag}");
                self.client.snapshots.clone_to(&source, dataset_path).await?;
                let mode = if params.detached {
                    self.client.snapshots.promote(dataset_path).await?;
                    CloneMode::Promoted
                } else {
                    CloneMode::Cow
                };
                Ok((mode, Some(source), "snapshot".to_string(), snapshot_id.to_string()))
            }
            Some(SnapshotRef::Detached { dataset }) => {
                let tag = format!("csi-clone-{}", uuid::Uuid::new_v4());
                self.client.snapshots.create(&dataset, &tag).await?;
                let transient_snap = format!("{dataset}@{tag}");
                let result = self
                    .client
                    .snapshots
                    .replicate_local(&transient_snap, dataset_path)
                    .await;
                let _ = self.client.snapshots.delete(&dataset, &tag).await;
                result?;
                Ok((CloneMode::Detached, None, "snapshot".to_string(), snapshot_id.to_string()))
            }
            None => Err(EngineError::InvalidArgument(format!(
                "malformed snapshot id '{snapshot_id}'"
            ))),
        }
    }

    async fn clone_from_volume(
        &self,
        root: &str,
        params: &crate::types::StorageClassParams,
        dataset_path: &str,
        source_volume_id: &str,
    ) -> Result<(CloneMode, Option<String>), EngineError> {
        let source = self
            .metadata
            .find_by_csi_name(root, source_volume_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("source volume '{source_volume_id}' not found")))?;

        let tag = format!("csi-clone-{}", uuid::Uuid::new_v4());
        self.client.snapshots.create(&source.dataset, &tag).await?;
        let transient_snap = format!("{}@{}", source.dataset, tag);

        if params.detached {
            let result = self
                .client
                .snapshots
                .replicate_local(&transient_snap, dataset_path)
                .await;
            let _ = self.client.snapshots.delete(&source.dataset, &tag).await;
            result?;
            Ok((CloneMode::Detached, None))
        } else {
            self.client.snapshots.clone_to(&transient_snap, dataset_path).await?;
            Ok((CloneMode::Cow, Some(transient_snap)))
        }
    }

    /// `DeleteVolume`: not-found is success, `retain` strips the
    /// management properties and leaves the dataset, `reclaim` unbinds the
    /// protocol resource and destroys the dataset, surfacing dependents.
    #[instrument(skip(self))]
    pub async fn delete_volume(&self, root: &str, csi_volume_name: &str) -> Result<(), EngineError> {
        let Some(record) = self.metadata.find_by_csi_name(root, csi_volume_name).await? else {
            return Ok(());
        };

        if record.delete_strategy == metadata::DeleteStrategy::Retain {
            let keys: Vec<String> = PropertyKey::ALL.iter().map(|k| k.to_string()).collect();
            let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
            self.client
                .datasets
                .clear_user_properties(&record.dataset, &key_refs)
                .await?;
            return Ok(());
        }

        let binding = Binding::from_record(&record);
        match self.protocol_for(record.protocol).unbind(&binding).await {
            Ok(()) => {}
            Err(EngineError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        match self.client.datasets.delete(&record.dataset, false).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) if e.is_has_dependents() => Err(EngineError::HasDependents(record.dataset)),
            Err(e) => Err(e.into()),
        }
    }

    /// `ControllerExpandVolume`: grows the dataset's size property, returns
    /// whether node-side filesystem expansion is required (true for block
    /// volumes carrying a filesystem, false for file-shares which have
    /// none).
    #[instrument(skip(self))]
    pub async fn expand_volume(
        &self,
        root: &str,
        csi_volume_name: &str,
        new_size_bytes: u64,
    ) -> Result<(u64, bool), EngineError> {
        let record = self
            .metadata
            .find_by_csi_name(root, csi_volume_name)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("volume '{csi_volume_name}' not found")))?;

        let property = match record.protocol {
            Protocol::Block => serde_json::json!({ "volsize": new_size_bytes }),
            Protocol::FileShare => serde_json::json!({ "quota": new_size_bytes }),
        };
        self.client.datasets.update(&record.dataset, property).await?;

        let mut props = BTreeMap::new();
        props.insert(PropertyKey::CapacityBytes.to_string(), new_size_bytes.to_string());
        self.client
            .datasets
            .set_user_properties(&record.dataset, props)
            .await?;

        let node_expansion_required = record.protocol == Protocol::Block;
        Ok((new_size_bytes, node_expansion_required))
    }

    /// `CreateSnapshot`: attached (cheap, in-place ZFS snapshot) or detached
    /// (materialized as its own dataset via `zfs send | zfs receive`).
    #[instrument(skip(self))]
    pub async fn create_snapshot(
        &self,
        root: &str,
        source_volume_id: &str,
        name: &str,
        detached: bool,
        detached_parent: Option<&str>,
    ) -> Result<SnapshotInfo, EngineError> {
        let source = self
            .metadata
            .find_by_csi_name(root, source_volume_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("source volume '{source_volume_id}' not found")))?;

        if !detached {
            let id = SnapshotRef::encode_attached(&source.dataset, name);
            match self.client.snapshots.create(&source.dataset, name).await {
                Ok(_) => Ok(SnapshotInfo {
                    id,
                    source_volume_id: source_volume_id.to_string(),
                    size_bytes: source.capacity_bytes,
                    ready: true,
                }),
                Err(e) if e.is_already_exists() => {
                    if self.attached_snapshot_exists(&source.dataset, name).await? {
                        Ok(SnapshotInfo {
                            id,
                            source_volume_id: source_volume_id.to_string(),
                            size_bytes: source.capacity_bytes,
                            ready: true,
                        })
                    } else {
                        Err(e.into())
                    }
                }
                Err(e) => Err(e.into()),
            }
        } else {
            let parent = detached_parent.ok_or_else(|| {
                EngineError::InvalidArgument(
                    "detachedSnapshotsParentDataset is required for detached snapshots".into(),
                )
            })?;
            let target_dataset = format!("{parent}/{name}");
            let tag = format!("csi-snap-{}", uuid::Uuid::new_v4());
            self.client.snapshots.create(&source.dataset, &tag).await?;
            let transient_snap = format!("{}@{}", source.dataset, tag);
            let result = self
                .client
                .snapshots
                .replicate_local(&transient_snap, &target_dataset)
                .await;
            let _ = self.client.snapshots.delete(&source.dataset, &tag).await;
            result?;

            let mut props = BTreeMap::new();
            props.insert(PropertyKey::ManagedBy.to_string(), metadata::MANAGED_BY_VALUE.to_string());
            props.insert(PropertyKey::DetachedSnapshot.to_string(), "true".to_string());
            let snapshot_id = SnapshotRef::encode_detached(&target_dataset);
            props.insert(PropertyKey::SnapshotId.to_string(), snapshot_id.clone());
            props.insert(PropertyKey::SourceVolumeId.to_string(), source_volume_id.to_string());
            props.insert(PropertyKey::SourceDataset.to_string(), source.dataset.clone());
            props.insert(PropertyKey::Protocol.to_string(), source.protocol.as_str().to_string());
            props.insert(
                PropertyKey::DeleteStrategy.to_string(),
                source.delete_strategy.as_str().to_string(),
            );
            props.insert(PropertyKey::CapacityBytes.to_string(), source.capacity_bytes.to_string());
            self.client.datasets.set_user_properties(&target_dataset, props).await?;

            Ok(SnapshotInfo {
                id: snapshot_id,
                source_volume_id: source_volume_id.to_string(),
                size_bytes: source.capacity_bytes,
                ready: true,
            })
        }
    }

    async fn attached_snapshot_exists(&self, dataset: &str, tag: &str) -> Result<bool, EngineError> {
        let name = format!("{dataset}@{tag}");
        let snaps = self
            .client
            .snapshots
            .query(vec![truenas_appliance_client::client::QueryFilter::eq(
                "name", name,
            )])
            .await?;
        Ok(!snaps.is_empty())
    }

    /// `DeleteSnapshot`: not-found (including a malformed id) is success.
    #[instrument(skip(self))]
    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), EngineError> {
        let Some(reference) = SnapshotRef::decode(snapshot_id) else {
            return Ok(());
        };
        match reference {
            SnapshotRef::Attached { dataset, tag } => match self.client.snapshots.delete(&dataset, &tag).await {
                Ok(()) => Ok(()),
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) if e.is_has_dependents() => {
                    Err(EngineError::HasDependents(format!("{dataset}@{tag}")))
                }
                Err(e) => Err(e.into()),
            },
            SnapshotRef::Detached { dataset } => match self.client.datasets.delete(&dataset, false).await {
                Ok(()) => Ok(()),
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) if e.is_has_dependents() => Err(EngineError::HasDependents(dataset)),
                Err(e) => Err(e.into()),
            },
        }
    }

    pub async fn get_volume(&self, root: &str, csi_volume_name: &str) -> Result<VolumeRecord, EngineError> {
        self.metadata
            .find_by_csi_name(root, csi_volume_name)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("volume '{csi_volume_name}' not found")))
    }

    pub async fn list_volumes(&self, root: &str) -> Result<Vec<VolumeRecord>, EngineError> {
        Ok(self.metadata.list_under(root).await?)
    }

    /// `ListSnapshots`: one managed snapshot, or every one under `root`
    /// optionally narrowed to a single source volume, combining attached ZFS
    /// snapshots (looked up against their still-living origin dataset) and
    /// detached ones (materialized datasets carrying `DetachedSnapshot`).
    #[instrument(skip(self))]
    pub async fn list_snapshots(
        &self,
        root: &str,
        source_volume_id: Option<&str>,
        snapshot_id: Option<&str>,
    ) -> Result<Vec<SnapshotInfo>, EngineError> {
        if let Some(id) = snapshot_id {
            return match self.get_snapshot(id).await {
                Ok(info) => Ok(vec![info]),
                Err(EngineError::NotFound(_)) => Ok(vec![]),
                Err(e) => Err(e),
            };
        }

        let all_datasets = self.client.datasets.query(Vec::new(), None).await?;
        let under_root: Vec<&truenas_appliance_client::client::Dataset> = all_datasets
            .iter()
            .filter(|d| d.name.starts_with(root))
            .collect();

        let mut out = Vec::new();

        for dataset in &under_root {
            if let Ok(record) = SnapshotRecord::try_from(*dataset) {
                if source_volume_id.is_some_and(|id| id != record.source_volume_id) {
                    continue;
                }
                out.push(SnapshotInfo {
                    id: SnapshotRef::encode_detached(&record.dataset),
                    source_volume_id: record.source_volume_id,
                    size_bytes: record.capacity_bytes,
                    ready: true,
                });
            }
        }

        let volumes_by_dataset: std::collections::HashMap<&str, VolumeRecord> = under_root
            .iter()
            .filter_map(|d| VolumeRecord::try_from(*d).ok().map(|r| (d.name.as_str(), r)))
            .collect();

        let snaps = self
            .client
            .snapshots
            .query(vec![])
            .await?
            .into_iter()
            .filter(|s| s.dataset.starts_with(root));
        for snap in snaps {
            let Some(record) = volumes_by_dataset.get(snap.dataset.as_str()) else {
                continue;
            };
            if source_volume_id.is_some_and(|id| id != record.csi_volume_name) {
                continue;
            }
            out.push(SnapshotInfo {
                id: SnapshotRef::encode_attached(&snap.dataset, &snap.snapshot_name),
                source_volume_id: record.csi_volume_name.clone(),
                size_bytes: record.capacity_bytes,
                ready: true,
            });
        }

        Ok(out)
    }

    async fn get_snapshot(&self, snapshot_id: &str) -> Result<SnapshotInfo, EngineError> {
        let reference = SnapshotRef::decode(snapshot_id)
            .ok_or_else(|| EngineError::NotFound(format!("malformed snapshot id '{snapshot_id}'")))?;
        match reference {
            SnapshotRef::Attached { dataset, tag } => {
                if !self.attached_snapshot_exists(&dataset, &tag).await? {
                    return Err(EngineError::NotFound(snapshot_id.to_string()));
                }
                let volume = self.client.datasets.get(&dataset).await?;
                let record = VolumeRecord::try_from(&volume).map_err(|_| {
                    EngineError::NotFound(format!(
                        "source volume for snapshot '{snapshot_id}' not found"
                    ))
                })?;
                Ok(SnapshotInfo {
                    id: snapshot_id.to_string(),
                    source_volume_id: record.csi_volume_name,
                    size_bytes: record.capacity_bytes,
                    ready: true,
                })
            }
            SnapshotRef::Detached { dataset } => {
                let ds = match self.client.datasets.get(&dataset).await {
                    Ok(ds) => ds,
                    Err(e) if e.is_not_found() => {
                        return Err(EngineError::NotFound(snapshot_id.to_string()));
                    }
                    Err(e) => return Err(e.into()),
                };
                let record = SnapshotRecord::try_from(&ds).map_err(|_| {
                    EngineError::NotFound(format!("'{snapshot_id}' is not a managed snapshot"))
                })?;
                Ok(SnapshotInfo {
                    id: snapshot_id.to_string(),
                    source_volume_id: record.source_volume_id,
                    size_bytes: record.capacity_bytes,
                    ready: true,
                })
            }
        }
    }

    async fn clear_adoptable(&self, record: &VolumeRecord) -> Result<(), EngineError> {
        let mut props = BTreeMap::new();
        props.insert(PropertyKey::Adoptable.to_string(), "false".to_string());
        self.client.datasets.set_user_properties(&record.dataset, props).await?;
        Ok(())
    }
}
