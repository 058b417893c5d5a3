//! Decodes and writes the ZFS user-properties that are this driver's only
//! durable state. Nothing about a volume, snapshot, or its protocol binding
//! is kept anywhere but on the dataset itself; a controller restart has
//! nothing to reload because it never held anything to begin with.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::client::{Dataset, DatasetApi};
use crate::error::ApplianceError;

/// Namespace prefix for every property this driver writes, so datasets
/// created by other tooling are never mistaken for ours.
pub const PREFIX: &str = "csi.truenas.github.io";

macro_rules! property_keys {
    ($($variant:ident => $suffix:literal),+ $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum PropertyKey {
            $($variant),+
        }

        impl PropertyKey {
            pub const ALL: &'static [PropertyKey] = &[$(PropertyKey::$variant),+];

            pub fn suffix(self) -> &'static str {
                match self {
                    $(PropertyKey::$variant => $suffix),+
                }
            }
        }

        impl FromStr for PropertyKey {
            type Err = ();

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let suffix = s.strip_prefix(PREFIX).and_then(|rest| rest.strip_prefix(':'));
                match suffix {
                    $(Some($suffix) => Ok(PropertyKey::$variant),)+
                    _ => Err(()),
                }
            }
        }
    };
}

property_keys! {
    ManagedBy => "managed_by",
    CsiVolumeName => "csi_volume_name",
    Protocol => "protocol",
    CapacityBytes => "capacity_bytes",
    CreatedAt => "created_at",
    DeleteStrategy => "delete_strategy",
    Adoptable => "adoptable",
    NfsSharePath => "nfs_share_path",
    NfsShareId => "nfs_share_id",
    NvmeSubsystemId => "nvme_subsystem_id",
    NvmeSubsystemNqn => "nvme_subsystem_nqn",
    NvmeNamespaceId => "nvme_namespace_id",
    ContentSourceType => "content_source_type",
    ContentSourceId => "content_source_id",
    CloneMode => "clone_mode",
    OriginSnapshot => "origin_snapshot",
    DetachedSnapshot => "detached_snapshot",
    SnapshotId => "snapshot_id",
    SourceVolumeId => "source_volume_id",
    SourceDataset => "source_dataset",
    PvcName => "pvc_name",
    PvcNamespace => "pvc_namespace",
    StorageClass => "storage_class",
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PREFIX}:{}", self.suffix())
    }
}

/// Value every volume dataset carries to mark it as ours; anything missing
/// this property is invisible to `find_by_*` regardless of what else lives
/// under the parent dataset.
pub const MANAGED_BY_VALUE: &str = "truenas-csi-driver";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    FileShare,
    Block,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::FileShare => "file-share",
            Protocol::Block => "block",
        }
    }
}

impl FromStr for Protocol {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file-share" => Ok(Protocol::FileShare),
            "block" => Ok(Protocol::Block),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteStrategy {
    Reclaim,
    Retain,
}

impl FromStr for DeleteStrategy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reclaim" => Ok(DeleteStrategy::Reclaim),
            "retain" => Ok(DeleteStrategy::Retain),
            _ => Err(()),
        }
    }
}

impl DeleteStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            DeleteStrategy::Reclaim => "reclaim",
            DeleteStrategy::Retain => "retain",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneMode {
    Cow,
    Promoted,
    Detached,
}

impl FromStr for CloneMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cow" => Ok(CloneMode::Cow),
            "promoted" => Ok(CloneMode::Promoted),
            "detached" => Ok(CloneMode::Detached),
            _ => Err(()),
        }
    }
}

impl CloneMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CloneMode::Cow => "cow",
            CloneMode::Promoted => "promoted",
            CloneMode::Detached => "detached",
        }
    }
}

/// A volume's full durable state, reconstructed from its dataset's
/// user-properties. Any record missing `managed_by` never becomes a
/// `VolumeRecord` in the first place: invariant 1 is enforced right here at
/// the decode boundary, not re-checked by every caller.
#[derive(Debug, Clone)]
pub struct VolumeRecord {
    pub dataset: String,
    pub csi_volume_name: String,
    pub protocol: Protocol,
    pub capacity_bytes: u64,
    pub created_at: String,
    pub delete_strategy: DeleteStrategy,
    pub adoptable: bool,
    pub nfs_share_path: Option<String>,
    pub nfs_share_id: Option<i64>,
    pub nvme_subsystem_id: Option<i64>,
    pub nvme_subsystem_nqn: Option<String>,
    pub nvme_namespace_id: Option<i64>,
    pub content_source_type: Option<String>,
    pub content_source_id: Option<String>,
    pub clone_mode: Option<CloneMode>,
    pub origin_snapshot: Option<String>,
}

impl TryFrom<&Dataset> for VolumeRecord {
    type Error = ();

    fn try_from(dataset: &Dataset) -> Result<Self, Self::Error> {
        let props = &dataset.user_properties;
        let get = |k: PropertyKey| props.get(&k.to_string()).cloned();

        if get(PropertyKey::ManagedBy).as_deref() != Some(MANAGED_BY_VALUE) {
            return Err(());
        }
        let csi_volume_name = get(PropertyKey::CsiVolumeName).ok_or(())?;
        let protocol = get(PropertyKey::Protocol)
            .and_then(|s| s.parse().ok())
            .ok_or(())?;
        let capacity_bytes = get(PropertyKey::CapacityBytes)
            .and_then(|s| s.parse().ok())
            .unwrap_or(dataset.volsize_bytes.unwrap_or(0));
        let created_at = get(PropertyKey::CreatedAt).unwrap_or_default();
        let delete_strategy = get(PropertyKey::DeleteStrategy)
            .and_then(|s| s.parse().ok())
            .unwrap_or(DeleteStrategy::Reclaim);
        let adoptable = get(PropertyKey::Adoptable).as_deref() == Some("true");

        Ok(VolumeRecord {
            dataset: dataset.name.clone(),
            csi_volume_name,
            protocol,
            capacity_bytes,
            created_at,
            delete_strategy,
            adoptable,
            nfs_share_path: get(PropertyKey::NfsSharePath),
            nfs_share_id: get(PropertyKey::NfsShareId).and_then(|s| s.parse().ok()),
            nvme_subsystem_id: get(PropertyKey::NvmeSubsystemId).and_then(|s| s.parse().ok()),
            nvme_subsystem_nqn: get(PropertyKey::NvmeSubsystemNqn),
            nvme_namespace_id: get(PropertyKey::NvmeNamespaceId).and_then(|s| s.parse().ok()),
            content_source_type: get(PropertyKey::ContentSourceType),
            content_source_id: get(PropertyKey::ContentSourceId),
            clone_mode: get(PropertyKey::CloneMode).and_then(|s| s.parse().ok()),
            origin_snapshot: get(PropertyKey::OriginSnapshot),
        })
    }
}

/// A detached snapshot materialized as its own dataset, distinct from an
/// attached ZFS snapshot that still lives alongside its origin.
#[derive(Debug, Clone)]
pub struct SnapshotRecord {
    pub dataset: String,
    pub source_volume_id: String,
    pub source_dataset: String,
    pub capacity_bytes: u64,
}

impl TryFrom<&Dataset> for SnapshotRecord {
    type Error = ();

    fn try_from(dataset: &Dataset) -> Result<Self, Self::Error> {
        let props = &dataset.user_properties;
        let get = |k: PropertyKey| props.get(&k.to_string()).cloned();

        if get(PropertyKey::ManagedBy).as_deref() != Some(MANAGED_BY_VALUE) {
            return Err(());
        }
        let source_volume_id = get(PropertyKey::SourceVolumeId).ok_or(())?;
        let source_dataset = get(PropertyKey::SourceDataset).ok_or(())?;
        let capacity_bytes = get(PropertyKey::CapacityBytes)
            .and_then(|s| s.parse().ok())
            .unwrap_or(dataset.volsize_bytes.unwrap_or(0));

        Ok(SnapshotRecord {
            dataset: dataset.name.clone(),
            source_volume_id,
            source_dataset,
            capacity_bytes,
        })
    }
}

/// A snapshot id resolves to one of two shapes: an attached ZFS snapshot
/// still hanging off its origin dataset, or a detached one materialized as
/// its own dataset via `replicate_local`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotRef {
    Attached { dataset: String, tag: String },
    Detached { dataset: String },
}

const ATTACHED_PREFIX: &str = "attached:";
const DETACHED_PREFIX: &str = "detached:";

impl SnapshotRef {
    pub fn encode_attached(dataset: &str, tag: &str) -> String {
        format!("{ATTACHED_PREFIX}{dataset}@{tag}")
    }

    pub fn encode_detached(dataset: &str) -> String {
        format!("{DETACHED_PREFIX}{dataset}")
    }

    pub fn decode(id: &str) -> Option<SnapshotRef> {
        if let Some(rest) = id.strip_prefix(ATTACHED_PREFIX) {
            let (dataset, tag) = rest.split_once('@')?;
            return Some(SnapshotRef::Attached {
                dataset: dataset.to_string(),
                tag: tag.to_string(),
            });
        }
        if let Some(rest) = id.strip_prefix(DETACHED_PREFIX) {
            return Some(SnapshotRef::Detached {
                dataset: rest.to_string(),
            });
        }
        None
    }

    pub fn id(&self) -> String {
        match self {
            SnapshotRef::Attached { dataset, tag } => Self::encode_attached(dataset, tag),
            SnapshotRef::Detached { dataset } => Self::encode_detached(dataset),
        }
    }
}

/// True if `name` is `root` itself or a child dataset under it. A plain
/// `starts_with` would also match an unrelated sibling like `tank/csi-other`
/// against root `tank/csi`.
fn under_root(name: &str, root: &str) -> bool {
    name == root || name.starts_with(&format!("{root}/"))
}

/// Reads and writes volume/snapshot state as ZFS user-properties. Every
/// lookup goes straight to the appliance; there is no cache to invalidate
/// because there is no cache.
#[derive(Clone)]
pub struct MetadataStore {
    datasets: Arc<DatasetApi>,
}

impl MetadataStore {
    pub fn new(datasets: Arc<DatasetApi>) -> Self {
        Self { datasets }
    }

    pub async fn find_by_csi_name(
        &self,
        root: &str,
        csi_volume_name: &str,
    ) -> Result<Option<VolumeRecord>, ApplianceError> {
        let matches = self
            .find_by_property(root, PropertyKey::CsiVolumeName, csi_volume_name)
            .await?;
        Ok(matches.into_iter().next())
    }

    /// Returns every managed volume under `root` whose `key` property is set
    /// to `value`, or every managed volume that has `key` set at all when
    /// `value` is empty.
    pub async fn find_by_property(
        &self,
        root: &str,
        key: PropertyKey,
        value: &str,
    ) -> Result<Vec<VolumeRecord>, ApplianceError> {
        let all = self.datasets.query(Vec::new(), None).await?;
        Ok(all
            .iter()
            .filter(|d| under_root(&d.name, root))
            .filter(|d| match d.user_properties.get(&key.to_string()) {
                Some(v) => value.is_empty() || v == value,
                None => false,
            })
            .filter_map(|d| VolumeRecord::try_from(d).ok())
            .collect())
    }

    pub async fn list_under(&self, root: &str) -> Result<Vec<VolumeRecord>, ApplianceError> {
        let all = self.datasets.query(Vec::new(), None).await?;
        Ok(all
            .iter()
            .filter(|d| under_root(&d.name, root))
            .filter_map(|d| VolumeRecord::try_from(d).ok())
            .collect())
    }
}

pub fn user_properties_for_new_volume(
    csi_volume_name: &str,
    protocol: Protocol,
    capacity_bytes: u64,
    delete_strategy: DeleteStrategy,
    pvc_name: Option<&str>,
    pvc_namespace: Option<&str>,
    storage_class: Option<&str>,
) -> BTreeMap<String, String> {
    let mut props = BTreeMap::new();
    props.insert(PropertyKey::ManagedBy.to_string(), MANAGED_BY_VALUE.into());
    props.insert(
        PropertyKey::CsiVolumeName.to_string(),
        csi_volume_name.to_string(),
    );
    props.insert(PropertyKey::Protocol.to_string(), protocol.as_str().into());
    props.insert(
        PropertyKey::CapacityBytes.to_string(),
        capacity_bytes.to_string(),
    );
    props.insert(
        PropertyKey::CreatedAt.to_string(),
        chrono::Utc::now().to_rfc3339(),
    );
    props.insert(
        PropertyKey::DeleteStrategy.to_string(),
        delete_strategy.as_str().into(),
    );
    props.insert(PropertyKey::Adoptable.to_string(), "false".into());
    if let Some(name) = pvc_name {
        props.insert(PropertyKey::PvcName.to_string(), name.into());
    }
    if let Some(ns) = pvc_namespace {
        props.insert(PropertyKey::PvcNamespace.to_string(), ns.into());
    }
    if let Some(class) = storage_class {
        props.insert(PropertyKey::StorageClass.to_string(), class.into());
    }
    props
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_key_round_trips_through_display_and_parse() {
        for key in PropertyKey::ALL {
            let rendered = key.to_string();
            let parsed: PropertyKey = rendered.parse().unwrap();
            assert_eq!(parsed, *key);
        }
    }

    #[test]
    fn snapshot_ref_round_trips_attached() {
        let id = SnapshotRef::encode_attached("tank/csi/vol-1", "snap-1");
        match SnapshotRef::decode(&id).unwrap() {
            SnapshotRef::Attached { dataset, tag } => {
                assert_eq!(dataset, "tank/csi/vol-1");
                assert_eq!(tag, "snap-1");
            }
            other => panic!("expected attached, got {other:?}"),
        }
    }

    #[test]
    fn snapshot_ref_round_trips_detached() {
        let id = SnapshotRef::encode_detached("tank/csi/snaps/snap-1");
        assert_eq!(
            SnapshotRef::decode(&id).unwrap(),
            SnapshotRef::Detached {
                dataset: "tank/csi/snaps/snap-1".to_string()
            }
        );
    }

    #[test]
    fn volume_record_rejects_dataset_without_managed_by() {
        let dataset = Dataset {
            name: "tank/csi/vol-1".into(),
            ..Default::default()
        };
        assert!(VolumeRecord::try_from(&dataset).is_err());
    }

    #[test]
    fn volume_record_decodes_from_user_properties() {
        let mut props = BTreeMap::new();
        props.insert(PropertyKey::ManagedBy.to_string(), MANAGED_BY_VALUE.into());
        props.insert(PropertyKey::CsiVolumeName.to_string(), "pvc-1".into());
        props.insert(PropertyKey::Protocol.to_string(), "block".into());
        props.insert(PropertyKey::CapacityBytes.to_string(), "1073741824".into());
        let dataset = Dataset {
            name: "tank/csi/vol-1".into(),
            user_properties: props,
            ..Default::default()
        };
        let record = VolumeRecord::try_from(&dataset).unwrap();
        assert_eq!(record.csi_volume_name, "pvc-1");
        assert_eq!(record.protocol, Protocol::Block);
        assert_eq!(record.capacity_bytes, 1_073_741_824);
        assert!(!record.adoptable);
    }

    #[test]
    fn under_root_excludes_prefix_sharing_siblings() {
        assert!(under_root("tank/csi", "tank/csi"));
        assert!(under_root("tank/csi/vol-1", "tank/csi"));
        assert!(!under_root("tank/csi-other", "tank/csi"));
        assert!(!under_root("tank/csireplica", "tank/csi"));
        assert!(!under_root("tank", "tank/csi"));
    }

    #[test]
    fn user_properties_for_new_volume_includes_created_at() {
        let props = user_properties_for_new_volume(
            "pvc-1",
            Protocol::FileShare,
            1_073_741_824,
            DeleteStrategy::Reclaim,
            None,
            None,
            None,
        );
        let created_at = props
            .get(&PropertyKey::CreatedAt.to_string())
            .expect("created_at must be written for new volumes");
        assert!(chrono::DateTime::parse_from_rfc3339(created_at).is_ok());
    }
}
