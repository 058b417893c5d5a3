//! Type-safe wrappers for CSI parameters.
//!
//! These types provide compile-time safety for parameters that are parsed
//! from StorageClass parameters and volume contexts, per the StorageClass
//! parameter table (`protocol`, `pool`, `parentDataset`, `subsystemNQN`,
//! `deleteStrategy`, `detached`, ZFS pass-through properties, fstype).

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::str::FromStr;

pub use truenas_appliance_client::metadata::{DeleteStrategy, Protocol};

/// Error returned when a StorageClass parameter is missing or malformed.
#[derive(Debug, Clone)]
pub struct ParamsError(pub String);

impl Display for ParamsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid StorageClass parameters: {}", self.0)
    }
}

impl std::error::Error for ParamsError {}

/// ZFS properties passed straight through to dataset creation, unvalidated
/// beyond being present as strings (the appliance is the authority on
/// whether a given compression algorithm or recordsize is legal).
#[derive(Debug, Clone, Default)]
pub struct ZfsProperties {
    pub compression: Option<String>,
    pub recordsize: Option<String>,
    pub volblocksize: Option<String>,
    pub sync: Option<String>,
}

/// One StorageClass's worth of parsed parameters, as consumed by the
/// Volume Lifecycle Engine for every `CreateVolume` call.
#[derive(Debug, Clone)]
pub struct StorageClassParams {
    pub protocol: Protocol,
    pub pool: String,
    pub parent_dataset: Option<String>,
    pub server: Option<String>,
    pub subsystem_nqn: Option<String>,
    pub delete_strategy: DeleteStrategy,
    pub detached: bool,
    pub detached_snapshots_parent_dataset: Option<String>,
    pub zfs: ZfsProperties,
    pub fstype: Option<String>,
}

impl StorageClassParams {
    pub fn from_map(params: &BTreeMap<String, String>) -> Result<Self, ParamsError> {
        let protocol = params
            .get("protocol")
            .ok_or_else(|| ParamsError("missing 'protocol'".into()))?
            .parse::<Protocol>()
            .map_err(|_| ParamsError("'protocol' must be 'file-share' or 'block'".into()))?;

        let pool = params
            .get("pool")
            .ok_or_else(|| ParamsError("missing 'pool'".into()))?
            .clone();

        let delete_strategy = match params.get("deleteStrategy").map(String::as_str) {
            None => DeleteStrategy::Reclaim,
            Some(s) => s
                .parse()
                .map_err(|_| ParamsError("'deleteStrategy' must be 'reclaim' or 'retain'".into()))?,
        };

        let detached = match params.get("detached").map(String::as_str) {
            None => false,
            Some("true") => true,
            Some("false") => false,
            Some(other) => {
                return Err(ParamsError(format!(
                    "'detached' must be 'true' or 'false', got '{other}'"
                )));
            }
        };

        if protocol == Protocol::Block && params.get("subsystemNQN").is_none() {
            return Err(ParamsError(
                "'subsystemNQN' is required when protocol='block'".into(),
            ));
        }

        Ok(StorageClassParams {
            protocol,
            pool,
            parent_dataset: params.get("parentDataset").cloned(),
            server: params.get("server").cloned(),
            subsystem_nqn: params.get("subsystemNQN").cloned(),
            delete_strategy,
            detached,
            detached_snapshots_parent_dataset: params
                .get("detachedSnapshotsParentDataset")
                .cloned(),
            zfs: ZfsProperties {
                compression: params.get("zfs.compression").cloned(),
                recordsize: params.get("zfs.recordsize").cloned(),
                volblocksize: params.get("zfs.volblocksize").cloned(),
                sync: params.get("zfs.sync").cloned(),
            },
            fstype: params.get("csi.storage.k8s.io/fstype").cloned(),
        })
    }

    /// The dataset path volumes under this class are created at, e.g.
    /// `tank/csi/pvc-001` from pool `tank`, parent `csi`, id `pvc-001`.
    pub fn dataset_path(&self, volume_id: &str) -> String {
        match &self.parent_dataset {
            Some(parent) => format!("{}/{}/{}", self.pool, parent, volume_id),
            None => format!("{}/{}", self.pool, volume_id),
        }
    }

    /// The root under which this class's volumes live, used by the
    /// Metadata Store to scope `find_by_property` queries.
    pub fn root(&self) -> String {
        match &self.parent_dataset {
            Some(parent) => format!("{}/{}", self.pool, parent),
            None => self.pool.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_minimal_file_share_class() {
        let parsed = StorageClassParams::from_map(&params(&[
            ("protocol", "file-share"),
            ("pool", "tank"),
        ]))
        .unwrap();
        assert_eq!(parsed.protocol, Protocol::FileShare);
        assert_eq!(parsed.delete_strategy, DeleteStrategy::Reclaim);
        assert!(!parsed.detached);
    }

    #[test]
    fn block_requires_subsystem_nqn() {
        let err = StorageClassParams::from_map(&params(&[("protocol", "block"), ("pool", "tank")]))
            .unwrap_err();
        assert!(err.0.contains("subsystemNQN"));
    }

    #[test]
    fn dataset_path_includes_parent() {
        let parsed = StorageClassParams::from_map(&params(&[
            ("protocol", "file-share"),
            ("pool", "tank"),
            ("parentDataset", "csi"),
        ]))
        .unwrap();
        assert_eq!(parsed.dataset_path("pvc-001"), "tank/csi/pvc-001");
        assert_eq!(parsed.root(), "tank/csi");
    }
}
