//! TrueNAS CSI Driver binary entrypoint.
//!
//! Parses CLI/env configuration, opens the appliance websocket connection,
//! and serves the CSI Identity/Controller/Node services over a unix domain
//! socket, the way Kubernetes' `external-provisioner`/kubelet sidecars expect.

use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use truenas_appliance_client::{ApplianceClient, ApplianceConfig, ConnectionState, Multiplexer};
use truenas_csi_driver::csi::controller_server::ControllerServer;
use truenas_csi_driver::csi::identity_server::IdentityServer;
use truenas_csi_driver::csi::node_server::NodeServer;
use truenas_csi_driver::identity::ReadinessState;
use truenas_csi_driver::{ControllerService, Engine, IdentityService, NodeService};

/// CLI arguments for the CSI driver
#[derive(Parser, Debug)]
#[command(name = "truenas-csi-driver")]
#[command(about = "CSI driver for TrueNAS SCALE-backed ZFS storage")]
struct Args {
    /// CSI endpoint (unix socket path), e.g. `unix:///var/run/csi/csi.sock`
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///var/run/csi/csi.sock")]
    endpoint: String,

    /// Node ID for this CSI node
    #[arg(long, env = "CSI_NODE_ID")]
    node_id: Option<String>,

    /// TrueNAS SCALE middleware websocket URL, e.g.
    /// `wss://truenas.example.internal/websocket`
    #[arg(long, env = "TRUENAS_URL")]
    truenas_url: Option<String>,

    /// Path to a file containing the TrueNAS SCALE API key, kept out of argv
    /// and the process environment
    #[arg(long, env = "TRUENAS_API_KEY_FILE")]
    appliance_api_key_file: Option<String>,

    /// Skip TLS certificate verification when connecting to the appliance
    #[arg(long, env = "TRUENAS_INSECURE_SKIP_VERIFY", default_value = "false")]
    insecure_skip_verify: bool,

    /// Run in controller mode (enables the Controller service)
    #[arg(long, default_value = "false")]
    controller: bool,

    /// Run in node mode (enables the Node service)
    #[arg(long, default_value = "true")]
    node: bool,

    /// Prometheus metrics listen address, e.g. `0.0.0.0:9100`
    #[arg(long, env = "METRICS_LISTEN")]
    metrics_listen: Option<std::net::SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Mirrors the multiplexer's connection state into the CSI-facing
/// `csi_appliance_connected`/`csi_appliance_connection_attempts` metrics,
/// which live in this crate's Prometheus registry rather than the appliance
/// client's (the client has no opinion on what scrapes it).
async fn watch_appliance_connection(mut state: tokio::sync::watch::Receiver<ConnectionState>) {
    loop {
        let current = *state.borrow();
        match current {
            ConnectionState::Connected => {
                truenas_csi_driver::metrics::set_appliance_connected(true);
                truenas_csi_driver::metrics::record_connection_attempt(true);
            }
            ConnectionState::Reconnecting => {
                truenas_csi_driver::metrics::set_appliance_connected(false);
                truenas_csi_driver::metrics::record_connection_attempt(false);
            }
            ConnectionState::Closed => {
                truenas_csi_driver::metrics::set_appliance_connected(false);
                return;
            }
            ConnectionState::Connecting => {}
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

fn unix_socket_path(endpoint: &str) -> Result<&str, Box<dyn std::error::Error>> {
    endpoint
        .strip_prefix("unix://")
        .ok_or_else(|| format!("unsupported endpoint scheme: '{endpoint}' (only unix:// is supported)").into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let node_id = match args.node_id {
        Some(id) => id,
        None => hostname::get()?.to_string_lossy().to_string(),
    };

    info!(
        endpoint = %args.endpoint,
        node_id = %node_id,
        controller_mode = args.controller,
        node_mode = args.node,
        "Starting TrueNAS CSI Driver"
    );

    if let Some(addr) = args.metrics_listen {
        truenas_csi_driver::metrics::init_metrics(addr)?;
    }

    let readiness = Arc::new(ReadinessState::new());
    let server = Server::builder();
    let identity = IdentityService::with_readiness(readiness.clone());

    // The Engine only needs to exist when this process will actually serve
    // Controller or Node RPCs; a pure sidecar role (neither flag set) would
    // still want Identity up for liveness, so the appliance connection is
    // built whenever either mode is requested.
    let engine = if args.controller || args.node {
        let url = args.truenas_url.ok_or("--truenas-url is required in controller/node mode")?;
        let key_file = args
            .appliance_api_key_file
            .ok_or("--appliance-api-key-file is required in controller/node mode")?;
        let api_key = std::fs::read_to_string(&key_file)
            .map_err(|e| format!("failed to read --appliance-api-key-file '{key_file}': {e}"))?
            .trim()
            .to_string();
        let mut config = ApplianceConfig::new(url, api_key);
        config.insecure_skip_verify = args.insecure_skip_verify;

        let mux = Multiplexer::connect(config.clone());
        tokio::spawn(watch_appliance_connection(mux.watch_state()));
        let client = Arc::new(ApplianceClient::new(mux, config.method_names));
        Some(Arc::new(Engine::new(client)))
    } else {
        None
    };

    let router = server.add_service(IdentityServer::new(identity));

    let router = if args.controller {
        let engine = engine.clone().expect("engine constructed above when controller mode is set");
        router.add_service(ControllerServer::new(ControllerService::new(engine)))
    } else {
        router
    };

    let router = if args.node {
        router.add_service(NodeServer::new(NodeService::new(node_id)))
    } else {
        router
    };

    let socket_path = unix_socket_path(&args.endpoint)?;
    if Path::new(socket_path).metadata().map(|m| m.file_type().is_socket()).unwrap_or(false) {
        std::fs::remove_file(socket_path)?;
    }
    if let Some(parent) = Path::new(socket_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(socket_path)?;
    let incoming = UnixListenerStream::new(listener);

    readiness.set_ready(true);
    info!(socket = %socket_path, "CSI driver listening");

    router.serve_with_incoming(incoming).await?;

    Ok(())
}
