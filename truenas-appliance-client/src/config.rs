use std::time::Duration;

/// Connection parameters for the TrueNAS appliance, supplied by the binary's
/// CLI layer.
#[derive(Debug, Clone)]
pub struct ApplianceConfig {
    /// Websocket URL of the middleware endpoint, e.g.
    /// `wss://truenas.example.internal/websocket`.
    pub url: String,
    pub api_key: ApiKey,
    pub insecure_skip_verify: bool,
    pub ping_interval: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub method_names: MethodNames,
}

impl ApplianceConfig {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: ApiKey(api_key.into()),
            insecure_skip_verify: false,
            ping_interval: Duration::from_secs(30),
            read_timeout: Duration::from_secs(120),
            write_timeout: Duration::from_secs(10),
            method_names: MethodNames::default(),
        }
    }
}

/// Wraps the appliance API key so it never ends up in a `Debug` or log line
/// by accident.
#[derive(Clone)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

/// Binds the logical operations the appliance client needs onto the
/// middleware's actual JSON-RPC method names. Kept configurable rather than
/// hardcoded so a different TrueNAS SCALE release, or a differently namespaced
/// middleware, can be supported without a code change.
#[derive(Debug, Clone)]
pub struct MethodNames {
    pub auth_login_with_api_key: String,
    pub core_ping: String,

    pub dataset_create: String,
    pub dataset_update: String,
    pub dataset_delete: String,
    pub dataset_query: String,

    pub snapshot_create: String,
    pub snapshot_delete: String,
    pub snapshot_query: String,
    pub snapshot_clone: String,
    pub snapshot_promote: String,
    pub replication_run_onetime: String,

    pub nfs_share_query: String,
    pub nfs_share_create: String,
    pub nfs_share_update: String,
    pub nfs_share_delete: String,

    pub nvmet_subsys_query: String,
    pub nvmet_namespace_create: String,
    pub nvmet_namespace_delete: String,
    pub nvmet_port_query: String,
}

impl Default for MethodNames {
    fn default() -> Self {
        Self {
            auth_login_with_api_key: "auth.login_with_api_key".into(),
            core_ping: "core.ping".into(),

            dataset_create: "pool.dataset.create".into(),
            dataset_update: "pool.dataset.update".into(),
            dataset_delete: "pool.dataset.delete".into(),
            dataset_query: "pool.dataset.query".into(),

            snapshot_create: "zfs.snapshot.create".into(),
            snapshot_delete: "zfs.snapshot.delete".into(),
            snapshot_query: "zfs.snapshot.query".into(),
            snapshot_clone: "zfs.snapshot.clone".into(),
            snapshot_promote: "zfs.snapshot.promote".into(),
            replication_run_onetime: "replication.run_onetime".into(),

            nfs_share_query: "sharing.nfs.query".into(),
            nfs_share_create: "sharing.nfs.create".into(),
            nfs_share_update: "sharing.nfs.update".into(),
            nfs_share_delete: "sharing.nfs.delete".into(),

            nvmet_subsys_query: "nvmet.subsys.query".into(),
            nvmet_namespace_create: "nvmet.namespace.create".into(),
            nvmet_namespace_delete: "nvmet.namespace.delete".into(),
            nvmet_port_query: "nvmet.port.query".into(),
        }
    }
}
