//! CSI Controller Service Implementation
//!
//! Turns `CreateVolume`/`DeleteVolume`/`ControllerExpandVolume`/
//! `CreateSnapshot`/`DeleteSnapshot`/list/validate RPCs into calls against
//! the [`Engine`](crate::engine::Engine), translating `StorageClass`
//! parameters and CSI request shapes on the way in and [`VolumeRecord`]s and
//! [`Binding`]s on the way out.

use std::collections::HashMap;
use std::sync::Arc;

use prost_types::Timestamp;
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument};
use truenas_appliance_client::metadata::VolumeRecord;

use crate::csi;
use crate::engine::{Binding, ContentSource, CreateVolumeArgs, Engine, EngineError, SnapshotInfo};
use crate::metrics::OperationTimer;
use crate::types::StorageClassParams;

/// Fallback size when a `CreateVolumeRequest` carries no capacity range, per
/// the CSI spec's allowance for a plugin-defined default.
const DEFAULT_VOLUME_SIZE_BYTES: i64 = 1024 * 1024 * 1024;

/// Every managed dataset's `csi_volume_name` is unique appliance-wide (spec
/// §3.3 invariant 2), so operations that only carry a `volume_id` — delete,
/// expand, get, snapshot lookups — search the whole appliance rather than a
/// single StorageClass's root. Only `CreateVolume` has a `StorageClass`'s
/// `pool`/`parentDataset` to scope the search with.
const SEARCH_ALL: &str = "";

pub struct ControllerService {
    engine: Arc<Engine>,
}

impl ControllerService {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    fn volume_size_bytes(capacity_range: Option<&csi::CapacityRange>) -> u64 {
        match capacity_range {
            Some(range) if range.required_bytes > 0 => range.required_bytes as u64,
            Some(range) if range.limit_bytes > 0 => range.limit_bytes as u64,
            _ => DEFAULT_VOLUME_SIZE_BYTES as u64,
        }
    }

    fn content_source(req: &csi::VolumeContentSource) -> Option<ContentSource> {
        match &req.r#type {
            Some(csi::volume_content_source::Type::Snapshot(s)) => {
                Some(ContentSource::Snapshot(s.snapshot_id.clone()))
            }
            Some(csi::volume_content_source::Type::Volume(v)) => {
                Some(ContentSource::Volume(v.volume_id.clone()))
            }
            None => None,
        }
    }

    fn volume_to_csi(record: &VolumeRecord, binding: &Binding, server: Option<&str>) -> csi::Volume {
        let mut volume_context: HashMap<String, String> =
            binding.volume_context.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        volume_context.insert("datasetPath".to_string(), record.dataset.clone());
        if let Some(server) = server {
            volume_context.insert("server".to_string(), server.to_string());
        }
        csi::Volume {
            capacity_bytes: record.capacity_bytes as i64,
            volume_id: record.csi_volume_name.clone(),
            volume_context,
            content_source: None,
            accessible_topology: vec![],
        }
    }

    /// The same shape [`Self::volume_to_csi`] produces, reconstructed from a
    /// bare record for paths that never run `provision`/`bind` (i.e.
    /// `ControllerGetVolume`, `ValidateVolumeCapabilities`).
    fn volume_context_from_record(record: &VolumeRecord) -> HashMap<String, String> {
        let binding = Binding::from_record(record);
        let mut ctx: HashMap<String, String> = HashMap::new();
        ctx.insert("protocol".to_string(), record.protocol.as_str().to_string());
        ctx.insert("datasetPath".to_string(), record.dataset.clone());
        if let Some(path) = &binding.nfs_share_path {
            ctx.insert("nfsSharePath".to_string(), path.clone());
        }
        if let Some(nqn) = &binding.nvme_subsystem_nqn {
            ctx.insert("nvmeSubsystemNQN".to_string(), nqn.clone());
        }
        if let Some(id) = binding.nvme_namespace_id {
            ctx.insert("nvmeNamespaceId".to_string(), id.to_string());
        }
        ctx
    }

    fn snapshot_to_csi(info: &SnapshotInfo) -> csi::Snapshot {
        csi::Snapshot {
            size_bytes: info.size_bytes as i64,
            snapshot_id: info.id.clone(),
            source_volume_id: info.source_volume_id.clone(),
            creation_time: Some(Timestamp { seconds: 0, nanos: 0 }),
            ready_to_use: info.ready,
        }
    }

    /// Parses the page token used by `ListVolumes`/`ListSnapshots`: a plain
    /// decimal offset into the (order-stable) appliance listing. There is no
    /// cursor state to keep server-side; the token is entirely derivable
    /// from the previous response, consistent with the driver holding no
    /// state beyond the appliance itself.
    fn parse_page_token(token: &str) -> Result<usize, Status> {
        if token.is_empty() {
            return Ok(0);
        }
        token
            .parse::<usize>()
            .map_err(|_| Status::invalid_argument("invalid starting_token"))
    }

    /// Times an engine call under `operation` and records its outcome,
    /// keeping `csi_operation_duration_seconds`/`csi_operations_total`
    /// bucketed by CSI RPC name rather than by `EngineError` variant.
    async fn timed<T>(
        operation: &'static str,
        fut: impl std::future::Future<Output = Result<T, EngineError>>,
    ) -> Result<T, Status> {
        let timer = OperationTimer::new(operation);
        match fut.await {
            Ok(value) => {
                timer.success();
                Ok(value)
            }
            Err(err) => {
                let status: Status = err.into();
                timer.failure(&format!("{:?}", status.code()));
                Err(status)
            }
        }
    }
}

#[tonic::async_trait]
impl csi::controller_server::Controller for ControllerService {
    #[instrument(skip(self, request))]
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> Result<Response<csi::CreateVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.name.is_empty() {
            return Err(Status::invalid_argument("volume name is required"));
        }

        let pvc_name = req.parameters_pvc_name();
        let pvc_namespace = req.parameters_pvc_namespace();
        let storage_class = req.parameters_storage_class();

        let params_map: std::collections::BTreeMap<String, String> =
            req.parameters.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let params =
            StorageClassParams::from_map(&params_map).map_err(|e| Status::invalid_argument(e.to_string()))?;
        let capacity_bytes = Self::volume_size_bytes(req.capacity_range.as_ref());
        let content_source = req.volume_content_source.as_ref().and_then(Self::content_source);

        info!(name = %req.name, capacity_bytes, protocol = ?params.protocol, "CreateVolume request");

        let args = CreateVolumeArgs {
            csi_volume_name: req.name.clone(),
            capacity_bytes,
            content_source,
            pvc_name,
            pvc_namespace,
            storage_class,
        };

        let (record, binding) =
            Self::timed("create_volume", self.engine.create_volume(&params, args)).await?;
        debug!(volume_id = %record.csi_volume_name, dataset = %record.dataset, "volume ready");

        Ok(Response::new(csi::CreateVolumeResponse {
            volume: Some(Self::volume_to_csi(&record, &binding, params.server.as_deref())),
        }))
    }

    #[instrument(skip(self, request))]
    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> Result<Response<csi::DeleteVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume_id is required"));
        }

        info!(volume_id = %req.volume_id, "DeleteVolume request");
        Self::timed("delete_volume", self.engine.delete_volume(SEARCH_ALL, &req.volume_id)).await?;
        Ok(Response::new(csi::DeleteVolumeResponse {}))
    }

    #[instrument(skip(self, request))]
    async fn controller_expand_volume(
        &self,
        request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume_id is required"));
        }
        let new_size = Self::volume_size_bytes(req.capacity_range.as_ref());

        info!(volume_id = %req.volume_id, new_size, "ControllerExpandVolume request");
        let (capacity_bytes, node_expansion_required) = Self::timed(
            "controller_expand_volume",
            self.engine.expand_volume(SEARCH_ALL, &req.volume_id, new_size),
        )
        .await?;

        Ok(Response::new(csi::ControllerExpandVolumeResponse {
            capacity_bytes: capacity_bytes as i64,
            node_expansion_required,
        }))
    }

    #[instrument(skip(self, request))]
    async fn controller_get_volume(
        &self,
        request: Request<csi::ControllerGetVolumeRequest>,
    ) -> Result<Response<csi::ControllerGetVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume_id is required"));
        }

        let record = self.engine.get_volume(SEARCH_ALL, &req.volume_id).await?;
        let volume = csi::Volume {
            capacity_bytes: record.capacity_bytes as i64,
            volume_id: record.csi_volume_name.clone(),
            volume_context: Self::volume_context_from_record(&record),
            content_source: None,
            accessible_topology: vec![],
        };

        Ok(Response::new(csi::ControllerGetVolumeResponse {
            volume: Some(volume),
            status: Some(csi::controller_get_volume_response::VolumeStatus {
                published_node_ids: vec![],
            }),
        }))
    }

    #[instrument(skip(self, request))]
    async fn validate_volume_capabilities(
        &self,
        request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume_id is required"));
        }

        self.engine.get_volume(SEARCH_ALL, &req.volume_id).await?;

        Ok(Response::new(csi::ValidateVolumeCapabilitiesResponse {
            confirmed: Some(csi::validate_volume_capabilities_response::Confirmed {
                parameters: req.parameters,
                volume_capabilities: req.volume_capabilities,
                volume_context: req.volume_context,
            }),
            message: String::new(),
        }))
    }

    #[instrument(skip(self, _request))]
    async fn list_volumes(
        &self,
        _request: Request<csi::ListVolumesRequest>,
    ) -> Result<Response<csi::ListVolumesResponse>, Status> {
        let req = _request.into_inner();
        let offset = Self::parse_page_token(&req.starting_token)?;
        let records = self.engine.list_volumes(SEARCH_ALL).await?;

        let page_size = if req.max_entries > 0 { req.max_entries as usize } else { records.len() };
        let page: Vec<VolumeRecord> = records.into_iter().skip(offset).take(page_size).collect();
        let next_offset = offset + page.len();

        let entries = page
            .iter()
            .map(|record| csi::list_volumes_response::Entry {
                volume: Some(csi::Volume {
                    capacity_bytes: record.capacity_bytes as i64,
                    volume_id: record.csi_volume_name.clone(),
                    volume_context: Self::volume_context_from_record(record),
                    content_source: None,
                    accessible_topology: vec![],
                }),
                status: Some(csi::list_volumes_response::VolumeStatus { published_node_ids: vec![] }),
            })
            .collect();

        Ok(Response::new(csi::ListVolumesResponse {
            entries,
            next_token: next_offset.to_string(),
        }))
    }

    #[instrument(skip(self, _request))]
    async fn get_capacity(
        &self,
        _request: Request<csi::GetCapacityRequest>,
    ) -> Result<Response<csi::GetCapacityResponse>, Status> {
        Err(Status::unimplemented(
            "GetCapacity is not supported; capacity is enforced by the appliance's pool",
        ))
    }

    #[instrument(skip(self, request))]
    async fn create_snapshot(
        &self,
        request: Request<csi::CreateSnapshotRequest>,
    ) -> Result<Response<csi::CreateSnapshotResponse>, Status> {
        let req = request.into_inner();
        if req.source_volume_id.is_empty() {
            return Err(Status::invalid_argument("source_volume_id is required"));
        }
        if req.name.is_empty() {
            return Err(Status::invalid_argument("snapshot name is required"));
        }

        let detached = matches!(req.parameters.get("detached").map(String::as_str), Some("true"));
        let detached_parent = req.parameters.get("detachedSnapshotsParentDataset").map(String::as_str);

        info!(
            source_volume_id = %req.source_volume_id,
            name = %req.name,
            detached,
            "CreateSnapshot request"
        );

        let info = Self::timed(
            "create_snapshot",
            self.engine.create_snapshot(SEARCH_ALL, &req.source_volume_id, &req.name, detached, detached_parent),
        )
        .await?;

        Ok(Response::new(csi::CreateSnapshotResponse {
            snapshot: Some(Self::snapshot_to_csi(&info)),
        }))
    }

    #[instrument(skip(self, request))]
    async fn delete_snapshot(
        &self,
        request: Request<csi::DeleteSnapshotRequest>,
    ) -> Result<Response<csi::DeleteSnapshotResponse>, Status> {
        let req = request.into_inner();
        if req.snapshot_id.is_empty() {
            return Err(Status::invalid_argument("snapshot_id is required"));
        }

        info!(snapshot_id = %req.snapshot_id, "DeleteSnapshot request");
        Self::timed("delete_snapshot", self.engine.delete_snapshot(&req.snapshot_id)).await?;
        Ok(Response::new(csi::DeleteSnapshotResponse {}))
    }

    #[instrument(skip(self, request))]
    async fn list_snapshots(
        &self,
        request: Request<csi::ListSnapshotsRequest>,
    ) -> Result<Response<csi::ListSnapshotsResponse>, Status> {
        let req = request.into_inner();
        let offset = Self::parse_page_token(&req.starting_token)?;

        let source_volume_id = (!req.source_volume_id.is_empty()).then_some(req.source_volume_id.as_str());
        let snapshot_id = (!req.snapshot_id.is_empty()).then_some(req.snapshot_id.as_str());
        let snapshots = self.engine.list_snapshots(SEARCH_ALL, source_volume_id, snapshot_id).await?;

        let page_size = if req.max_entries > 0 { req.max_entries as usize } else { snapshots.len() };
        let page: Vec<SnapshotInfo> = snapshots.into_iter().skip(offset).take(page_size).collect();
        let next_offset = offset + page.len();

        let entries = page
            .iter()
            .map(|s| csi::list_snapshots_response::Entry { snapshot: Some(Self::snapshot_to_csi(s)) })
            .collect();

        Ok(Response::new(csi::ListSnapshotsResponse {
            entries,
            next_token: next_offset.to_string(),
        }))
    }

    #[instrument(skip(self, _request))]
    async fn controller_get_capabilities(
        &self,
        _request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        use csi::controller_service_capability::{Rpc, Type as CapType, rpc::Type as RpcType};

        let rpc = |t: RpcType| csi::ControllerServiceCapability {
            r#type: Some(CapType::Rpc(Rpc { r#type: t as i32 })),
        };

        Ok(Response::new(csi::ControllerGetCapabilitiesResponse {
            capabilities: vec![
                rpc(RpcType::CreateDeleteVolume),
                rpc(RpcType::CreateDeleteSnapshot),
                rpc(RpcType::ListVolumes),
                rpc(RpcType::ListSnapshots),
                rpc(RpcType::ExpandVolume),
                rpc(RpcType::GetVolume),
            ],
        }))
    }

    /// Publishing happens entirely node-side (the node connects the
    /// NVMe-oF namespace or mounts the NFS export itself); the appliance has
    /// no notion of a controller-side attach step to perform first.
    async fn controller_publish_volume(
        &self,
        _request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        Err(Status::unimplemented("ControllerPublishVolume is not supported"))
    }

    async fn controller_unpublish_volume(
        &self,
        _request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        Err(Status::unimplemented("ControllerUnpublishVolume is not supported"))
    }
}

/// Small extension trait over the raw CSI request so the well-known
/// `external-provisioner` parameter keys used to thread PVC/StorageClass
/// identity through to the user-property record (spec §3.2) don't clutter
/// `create_volume` itself.
trait PvcHints {
    fn parameters_pvc_name(&self) -> Option<String>;
    fn parameters_pvc_namespace(&self) -> Option<String>;
    fn parameters_storage_class(&self) -> Option<String>;
}

impl PvcHints for csi::CreateVolumeRequest {
    fn parameters_pvc_name(&self) -> Option<String> {
        self.parameters.get("csi.storage.k8s.io/pvc/name").cloned()
    }

    fn parameters_pvc_namespace(&self) -> Option<String> {
        self.parameters.get("csi.storage.k8s.io/pvc/namespace").cloned()
    }

    fn parameters_storage_class(&self) -> Option<String> {
        self.parameters.get("storageClassName").cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_volume_size_used_when_no_capacity_range() {
        assert_eq!(
            ControllerService::volume_size_bytes(None),
            DEFAULT_VOLUME_SIZE_BYTES as u64
        );
    }

    #[test]
    fn required_bytes_takes_precedence_over_limit() {
        let range = csi::CapacityRange { required_bytes: 2 << 30, limit_bytes: 5 << 30 };
        assert_eq!(ControllerService::volume_size_bytes(Some(&range)), 2 << 30);
    }

    #[test]
    fn falls_back_to_limit_bytes() {
        let range = csi::CapacityRange { required_bytes: 0, limit_bytes: 5 << 30 };
        assert_eq!(ControllerService::volume_size_bytes(Some(&range)), 5 << 30);
    }

    #[test]
    fn page_token_defaults_to_zero() {
        assert_eq!(ControllerService::parse_page_token("").unwrap(), 0);
        assert_eq!(ControllerService::parse_page_token("12").unwrap(), 12);
        assert!(ControllerService::parse_page_token("nope").is_err());
    }
}
