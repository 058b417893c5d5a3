//! Typed façade over the raw [`Multiplexer::call`] surface.
//!
//! One struct per appliance resource family, each building the
//! `serde_json::Value` params the middleware expects and decoding its result
//! into a small internal type. None of these hold any state of their own;
//! all of them share one multiplexer.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::instrument;

use crate::config::MethodNames;
use crate::error::ApplianceError;
use crate::transport::Multiplexer;

const DEFAULT_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetType {
    Filesystem,
    Volume,
}

impl DatasetType {
    fn as_str(self) -> &'static str {
        match self {
            DatasetType::Filesystem => "FILESYSTEM",
            DatasetType::Volume => "VOLUME",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub name: String,
    pub dataset_type: Option<DatasetType>,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub volsize_bytes: Option<u64>,
    pub user_properties: BTreeMap<String, String>,
}

impl Dataset {
    fn from_value(v: &Value) -> Dataset {
        let name = v
            .get("id")
            .or_else(|| v.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let dataset_type = match v.get("type").and_then(Value::as_str) {
            Some("FILESYSTEM") => Some(DatasetType::Filesystem),
            Some("VOLUME") => Some(DatasetType::Volume),
            _ => None,
        };
        let used_bytes = property_parsed_u64(v, "used");
        let available_bytes = property_parsed_u64(v, "available");
        let volsize_bytes = if dataset_type == Some(DatasetType::Volume) {
            Some(property_parsed_u64(v, "volsize"))
        } else {
            None
        };
        let user_properties = v
            .get("user_properties")
            .and_then(Value::as_object)
            .map(|props| {
                props
                    .iter()
                    .filter_map(|(k, val)| {
                        val.get("value")
                            .and_then(Value::as_str)
                            .map(|s| (k.clone(), s.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Dataset {
            name,
            dataset_type,
            used_bytes,
            available_bytes,
            volsize_bytes,
            user_properties,
        }
    }
}

fn property_parsed_u64(v: &Value, key: &str) -> u64 {
    v.get(key)
        .and_then(|p| p.get("parsed"))
        .and_then(Value::as_u64)
        .or_else(|| v.get(key).and_then(Value::as_u64))
        .unwrap_or(0)
}

#[derive(Debug, Clone, Default)]
pub struct DatasetCreateSpec {
    pub name: String,
    pub dataset_type: DatasetType,
    pub volsize_bytes: Option<u64>,
    pub user_properties: BTreeMap<String, String>,
    /// Native ZFS properties passed straight through to dataset creation
    /// (`compression`, `recordsize`, `volblocksize`, `sync`), not to be
    /// confused with `user_properties` (the driver's namespaced metadata).
    pub zfs_properties: BTreeMap<String, String>,
}

impl Default for DatasetType {
    fn default() -> Self {
        DatasetType::Filesystem
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub field: String,
    pub op: &'static str,
    pub value: Value,
}

impl QueryFilter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op: "=",
            value: value.into(),
        }
    }

    fn to_value(&self) -> Value {
        json!([self.field, self.op, self.value])
    }
}

#[derive(Clone)]
pub struct DatasetApi {
    mux: Arc<Multiplexer>,
    methods: Arc<MethodNames>,
}

impl DatasetApi {
    pub fn new(mux: Arc<Multiplexer>, methods: Arc<MethodNames>) -> Self {
        Self { mux, methods }
    }

    #[instrument(skip(self))]
    pub async fn create(&self, spec: DatasetCreateSpec) -> Result<Dataset, ApplianceError> {
        let mut payload = serde_json::Map::new();
        payload.insert("name".into(), Value::String(spec.name.clone()));
        payload.insert(
            "type".into(),
            Value::String(spec.dataset_type.as_str().into()),
        );
        if let Some(size) = spec.volsize_bytes {
            payload.insert("volsize".into(), json!(size));
            payload.insert("sparse".into(), Value::Bool(true));
        }
        for (key, value) in &spec.zfs_properties {
            payload.insert(key.clone(), Value::String(value.clone()));
        }
        if !spec.user_properties.is_empty() {
            payload.insert(
                "user_properties".into(),
                user_properties_to_value(&spec.user_properties),
            );
        }

        let result = self
            .mux
            .call(
                &self.methods.dataset_create,
                json!([payload]),
                Some(DEFAULT_DEADLINE),
            )
            .await?;
        Ok(Dataset::from_value(&result))
    }

    #[instrument(skip(self, properties))]
    pub async fn update(
        &self,
        path: &str,
        properties: Value,
    ) -> Result<Dataset, ApplianceError> {
        let result = self
            .mux
            .call(
                &self.methods.dataset_update,
                json!([path, properties]),
                Some(DEFAULT_DEADLINE),
            )
            .await?;
        Ok(Dataset::from_value(&result))
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, path: &str, recursive: bool) -> Result<(), ApplianceError> {
        self.mux
            .call(
                &self.methods.dataset_delete,
                json!([path, { "recursive": recursive }]),
                Some(DEFAULT_DEADLINE),
            )
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get(&self, path: &str) -> Result<Dataset, ApplianceError> {
        let mut results = self.query(vec![QueryFilter::eq("id", path)], None).await?;
        results
            .pop()
            .ok_or_else(|| ApplianceError::NotFound(path.to_string()))
    }

    #[instrument(skip(self, filters, properties))]
    pub async fn query(
        &self,
        filters: Vec<QueryFilter>,
        properties: Option<Vec<String>>,
    ) -> Result<Vec<Dataset>, ApplianceError> {
        let filter_values: Vec<Value> = filters.iter().map(QueryFilter::to_value).collect();
        let mut options = serde_json::Map::new();
        if let Some(props) = properties {
            options.insert(
                "properties".into(),
                Value::Array(props.into_iter().map(Value::String).collect()),
            );
        }
        let params = json!([filter_values, options]);
        let result = self
            .mux
            .call(&self.methods.dataset_query, params, Some(DEFAULT_DEADLINE))
            .await?;
        let datasets = result
            .as_array()
            .map(|rows| rows.iter().map(Dataset::from_value).collect())
            .unwrap_or_default();
        Ok(datasets)
    }

    #[instrument(skip(self, properties))]
    pub async fn set_user_properties(
        &self,
        path: &str,
        properties: BTreeMap<String, String>,
    ) -> Result<(), ApplianceError> {
        let payload = json!({ "user_properties_update": user_properties_update(&properties) });
        self.mux
            .call(
                &self.methods.dataset_update,
                json!([path, payload]),
                Some(DEFAULT_DEADLINE),
            )
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn clear_user_properties(
        &self,
        path: &str,
        keys: &[&str],
    ) -> Result<(), ApplianceError> {
        let removals: Vec<Value> = keys
            .iter()
            .map(|k| json!({ "key": k, "remove": true }))
            .collect();
        let payload = json!({ "user_properties_update": removals });
        self.mux
            .call(
                &self.methods.dataset_update,
                json!([path, payload]),
                Some(DEFAULT_DEADLINE),
            )
            .await?;
        Ok(())
    }
}

fn user_properties_to_value(properties: &BTreeMap<String, String>) -> Value {
    Value::Object(
        properties
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

fn user_properties_update(properties: &BTreeMap<String, String>) -> Value {
    Value::Array(
        properties
            .iter()
            .map(|(k, v)| json!({ "key": k, "value": v }))
            .collect(),
    )
}

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub name: String,
    pub dataset: String,
    pub snapshot_name: String,
}

impl Snapshot {
    fn from_value(v: &Value) -> Snapshot {
        let name = v
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let (dataset, snapshot_name) = name
            .split_once('@')
            .map(|(d, s)| (d.to_string(), s.to_string()))
            .unwrap_or_default();
        Snapshot {
            name,
            dataset,
            snapshot_name,
        }
    }
}

#[derive(Clone)]
pub struct SnapshotApi {
    mux: Arc<Multiplexer>,
    methods: Arc<MethodNames>,
}

impl SnapshotApi {
    pub fn new(mux: Arc<Multiplexer>, methods: Arc<MethodNames>) -> Self {
        Self { mux, methods }
    }

    #[instrument(skip(self))]
    pub async fn create(&self, dataset: &str, tag: &str) -> Result<Snapshot, ApplianceError> {
        let result = self
            .mux
            .call(
                &self.methods.snapshot_create,
                json!([{ "dataset": dataset, "name": tag }]),
                Some(DEFAULT_DEADLINE),
            )
            .await?;
        Ok(Snapshot::from_value(&result))
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, dataset: &str, tag: &str) -> Result<(), ApplianceError> {
        let id = format!("{dataset}@{tag}");
        self.mux
            .call(
                &self.methods.snapshot_delete,
                json!([id]),
                Some(DEFAULT_DEADLINE),
            )
            .await?;
        Ok(())
    }

    #[instrument(skip(self, filters))]
    pub async fn query(&self, filters: Vec<QueryFilter>) -> Result<Vec<Snapshot>, ApplianceError> {
        let filter_values: Vec<Value> = filters.iter().map(QueryFilter::to_value).collect();
        let result = self
            .mux
            .call(
                &self.methods.snapshot_query,
                json!([filter_values]),
                Some(DEFAULT_DEADLINE),
            )
            .await?;
        let snapshots = result
            .as_array()
            .map(|rows| rows.iter().map(Snapshot::from_value).collect())
            .unwrap_or_default();
        Ok(snapshots)
    }

    #[instrument(skip(self))]
    pub async fn clone_to(&self, snapshot: &str, target: &str) -> Result<Dataset, ApplianceError> {
        let result = self
            .mux
            .call(
                &self.methods.snapshot_clone,
                json!([{ "snapshot": snapshot, "dataset_dst": target }]),
                Some(DEFAULT_DEADLINE),
            )
            .await?;
        Ok(Dataset::from_value(&result))
    }

    #[instrument(skip(self))]
    pub async fn promote(&self, dataset: &str) -> Result<(), ApplianceError> {
        self.mux
            .call(
                &self.methods.snapshot_promote,
                json!([dataset]),
                Some(DEFAULT_DEADLINE),
            )
            .await?;
        Ok(())
    }

    /// Runs a one-time local `zfs send | zfs receive` between two datasets on
    /// the same appliance, used to materialize a detached snapshot.
    #[instrument(skip(self))]
    pub async fn replicate_local(
        &self,
        source_snapshot: &str,
        target_dataset: &str,
    ) -> Result<(), ApplianceError> {
        let payload = json!({
            "direction": "PUSH",
            "transport": "LOCAL",
            "source_datasets": [source_snapshot.split('@').next().unwrap_or(source_snapshot)],
            "target_dataset": target_dataset,
            "recursive": false,
            "also_include_naming_schema": [],
            "name_regex": regex_for_snapshot(source_snapshot),
            "readonly": "IGNORE",
        });
        self.mux
            .call(
                &self.methods.replication_run_onetime,
                json!([payload]),
                Some(Duration::from_secs(600)),
            )
            .await?;
        Ok(())
    }
}

fn regex_for_snapshot(snapshot: &str) -> String {
    let tag = snapshot.split_once('@').map(|(_, t)| t).unwrap_or(snapshot);
    format!("^{}$", regex_escape(tag))
}

fn regex_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if "\\.+*?()|[]{}^$".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[derive(Debug, Clone, Default)]
pub struct NfsShareSpec {
    pub path: String,
    pub networks: Vec<String>,
    pub hosts: Vec<String>,
    pub read_only: bool,
    pub maproot_user: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NfsShare {
    pub id: i64,
    pub path: String,
    pub enabled: bool,
}

impl NfsShare {
    fn from_value(v: &Value) -> NfsShare {
        NfsShare {
            id: v.get("id").and_then(Value::as_i64).unwrap_or_default(),
            path: v
                .get("path")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            enabled: v
                .get("enabled")
                .and_then(Value::as_bool)
                .unwrap_or(true),
        }
    }
}

#[derive(Clone)]
pub struct ShareApi {
    mux: Arc<Multiplexer>,
    methods: Arc<MethodNames>,
}

impl ShareApi {
    pub fn new(mux: Arc<Multiplexer>, methods: Arc<MethodNames>) -> Self {
        Self { mux, methods }
    }

    #[instrument(skip(self))]
    pub async fn list(&self) -> Result<Vec<NfsShare>, ApplianceError> {
        let result = self
            .mux
            .call(&self.methods.nfs_share_query, json!([]), Some(DEFAULT_DEADLINE))
            .await?;
        Ok(result
            .as_array()
            .map(|rows| rows.iter().map(NfsShare::from_value).collect())
            .unwrap_or_default())
    }

    #[instrument(skip(self))]
    pub async fn query_by_path(&self, path: &str) -> Result<Option<NfsShare>, ApplianceError> {
        let filters = json!([["path", "=", path]]);
        let result = self
            .mux
            .call(&self.methods.nfs_share_query, json!([filters]), Some(DEFAULT_DEADLINE))
            .await?;
        Ok(result
            .as_array()
            .and_then(|rows| rows.first())
            .map(NfsShare::from_value))
    }

    #[instrument(skip(self))]
    pub async fn create(&self, spec: NfsShareSpec) -> Result<NfsShare, ApplianceError> {
        let payload = json!({
            "path": spec.path,
            "networks": spec.networks,
            "hosts": spec.hosts,
            "ro": spec.read_only,
            "maproot_user": spec.maproot_user,
            "enabled": true,
        });
        let result = self
            .mux
            .call(&self.methods.nfs_share_create, json!([payload]), Some(DEFAULT_DEADLINE))
            .await?;
        Ok(NfsShare::from_value(&result))
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: i64) -> Result<(), ApplianceError> {
        self.mux
            .call(&self.methods.nfs_share_delete, json!([id]), Some(DEFAULT_DEADLINE))
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct NvmeSubsystem {
    pub id: i64,
    pub nqn: String,
}

#[derive(Debug, Clone, Default)]
pub struct NvmeNamespace {
    pub id: i64,
    pub subsystem_id: i64,
    pub device_path: String,
}

#[derive(Debug, Clone, Default)]
pub struct NvmePort {
    pub id: i64,
    pub addr_traddr: String,
    pub addr_trsvcid: String,
}

#[derive(Clone)]
pub struct BlockApi {
    mux: Arc<Multiplexer>,
    methods: Arc<MethodNames>,
}

impl BlockApi {
    pub fn new(mux: Arc<Multiplexer>, methods: Arc<MethodNames>) -> Self {
        Self { mux, methods }
    }

    #[instrument(skip(self))]
    pub async fn subsystems_list(&self) -> Result<Vec<NvmeSubsystem>, ApplianceError> {
        let result = self
            .mux
            .call(&self.methods.nvmet_subsys_query, json!([]), Some(DEFAULT_DEADLINE))
            .await?;
        Ok(result
            .as_array()
            .map(|rows| rows.iter().map(nvme_subsystem_from_value).collect())
            .unwrap_or_default())
    }

    #[instrument(skip(self))]
    pub async fn subsystem_by_nqn(&self, nqn: &str) -> Result<Option<NvmeSubsystem>, ApplianceError> {
        let filters = json!([["nqn", "=", nqn]]);
        let result = self
            .mux
            .call(&self.methods.nvmet_subsys_query, json!([filters]), Some(DEFAULT_DEADLINE))
            .await?;
        Ok(result
            .as_array()
            .and_then(|rows| rows.first())
            .map(nvme_subsystem_from_value))
    }

    #[instrument(skip(self))]
    pub async fn namespace_create(
        &self,
        subsystem_id: i64,
        zvol_path: &str,
    ) -> Result<NvmeNamespace, ApplianceError> {
        let payload = json!({
            "subsys_id": subsystem_id,
            "device_type": "ZVOL",
            "device_path": zvol_path,
        });
        let result = self
            .mux
            .call(&self.methods.nvmet_namespace_create, json!([payload]), Some(DEFAULT_DEADLINE))
            .await?;
        Ok(nvme_namespace_from_value(&result))
    }

    #[instrument(skip(self))]
    pub async fn namespace_delete(&self, id: i64) -> Result<(), ApplianceError> {
        self.mux
            .call(&self.methods.nvmet_namespace_delete, json!([id]), Some(DEFAULT_DEADLINE))
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn ports_list(&self) -> Result<Vec<NvmePort>, ApplianceError> {
        let result = self
            .mux
            .call(&self.methods.nvmet_port_query, json!([]), Some(DEFAULT_DEADLINE))
            .await?;
        Ok(result
            .as_array()
            .map(|rows| rows.iter().map(nvme_port_from_value).collect())
            .unwrap_or_default())
    }
}

fn nvme_subsystem_from_value(v: &Value) -> NvmeSubsystem {
    NvmeSubsystem {
        id: v.get("id").and_then(Value::as_i64).unwrap_or_default(),
        nqn: v
            .get("nqn")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

fn nvme_namespace_from_value(v: &Value) -> NvmeNamespace {
    NvmeNamespace {
        id: v.get("id").and_then(Value::as_i64).unwrap_or_default(),
        subsystem_id: v
            .get("subsys_id")
            .and_then(Value::as_i64)
            .unwrap_or_default(),
        device_path: v
            .get("device_path")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

fn nvme_port_from_value(v: &Value) -> NvmePort {
    NvmePort {
        id: v.get("id").and_then(Value::as_i64).unwrap_or_default(),
        addr_traddr: v
            .get("addr_traddr")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        addr_trsvcid: v
            .get("addr_trsvcid")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

/// Top-level handle bundling one client per resource family behind a single
/// shared multiplexer, the way the teacher's `ZfsManager`/`NvmeofManager`
/// share one underlying `ctld` config file.
#[derive(Clone)]
pub struct ApplianceClient {
    pub datasets: DatasetApi,
    pub snapshots: SnapshotApi,
    pub shares: ShareApi,
    pub block: BlockApi,
}

impl ApplianceClient {
    pub fn new(mux: Arc<Multiplexer>, method_names: MethodNames) -> Self {
        let methods = Arc::new(method_names);
        Self {
            datasets: DatasetApi::new(mux.clone(), methods.clone()),
            snapshots: SnapshotApi::new(mux.clone(), methods.clone()),
            shares: ShareApi::new(mux.clone(), methods.clone()),
            block: BlockApi::new(mux, methods),
        }
    }
}
