//! CSI Node Service Implementation
//!
//! Stages, publishes, and tears down volumes on a Kubernetes node: connects
//! the NVMe-oF namespace or mounts the NFS export, formats/grows the
//! resulting filesystem, and bind-mounts it into the pod's target path. None
//! of this talks to the appliance directly; everything it needs travels in
//! `volume_context`/`publish_context`, set by [`crate::engine::fileshare`]
//! and [`crate::engine::block`] at `CreateVolume` time.

use std::collections::HashMap;

use tonic::{Request, Response, Status};
use tracing::{info, instrument, warn};

use crate::csi;
use crate::platform;

pub struct NodeService {
    node_id: String,
    max_volumes_per_node: i64,
}

impl NodeService {
    pub fn new(node_id: String) -> Self {
        Self { node_id, max_volumes_per_node: 0 }
    }

    fn protocol(volume_context: &HashMap<String, String>) -> Result<&str, Status> {
        volume_context
            .get("protocol")
            .map(String::as_str)
            .ok_or_else(|| Status::invalid_argument("volume_context missing 'protocol'"))
    }

    fn fs_type(volume_capability: Option<&csi::VolumeCapability>) -> &str {
        match volume_capability.and_then(|c| c.access_type.as_ref()) {
            Some(csi::volume_capability::AccessType::Mount(mount)) if !mount.fs_type.is_empty() => {
                &mount.fs_type
            }
            _ => platform::default_fs_type(),
        }
    }

    fn is_block(volume_capability: Option<&csi::VolumeCapability>) -> bool {
        matches!(
            volume_capability.and_then(|c| c.access_type.as_ref()),
            Some(csi::volume_capability::AccessType::Block(_))
        )
    }

    /// Stages a block volume: connects NVMe-oF, formats the namespace on
    /// first use, and mounts it (raw block volumes skip the filesystem step
    /// entirely and are bind-mounted node-side at publish time instead).
    async fn stage_block(
        volume_context: &HashMap<String, String>,
        staging_target_path: &str,
        fs_type: &str,
    ) -> Result<(), Status> {
        let nqn = volume_context
            .get("nvmeSubsystemNQN")
            .ok_or_else(|| Status::invalid_argument("volume_context missing 'nvmeSubsystemNQN'"))?;
        let transport_addr = volume_context.get("nvmeTransportAddr").map(String::as_str);
        let transport_port = volume_context.get("nvmeTransportPort").map(String::as_str);

        let device = platform::connect_nvmeof(nqn, transport_addr, transport_port)?;

        if fs_type != "raw" {
            if platform::needs_formatting(&device)? {
                platform::format_device(&device, fs_type)?;
            }
            platform::mount_device(&device, staging_target_path, fs_type)?;
        }

        Ok(())
    }

    async fn stage_file_share(
        volume_context: &HashMap<String, String>,
        staging_target_path: &str,
        server: &str,
        read_only: bool,
    ) -> Result<(), Status> {
        let export_path = volume_context
            .get("nfsSharePath")
            .ok_or_else(|| Status::invalid_argument("volume_context missing 'nfsSharePath'"))?;
        platform::mount_nfs(server, export_path, staging_target_path, read_only)
    }
}

#[tonic::async_trait]
impl csi::node_server::Node for NodeService {
    #[instrument(skip(self, request))]
    async fn node_stage_volume(
        &self,
        request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume_id is required"));
        }
        if req.staging_target_path.is_empty() {
            return Err(Status::invalid_argument("staging_target_path is required"));
        }

        let protocol = Self::protocol(&req.volume_context)?;
        let fs_type = Self::fs_type(req.volume_capability.as_ref());
        let read_only = matches!(
            req.volume_capability.as_ref().and_then(|c| c.access_mode.as_ref()).map(|m| m.mode()),
            Some(csi::volume_capability::access_mode::Mode::SingleNodeReaderOnly)
                | Some(csi::volume_capability::access_mode::Mode::MultiNodeReaderOnly)
        );

        info!(volume_id = %req.volume_id, protocol, fs_type, "NodeStageVolume request");

        match protocol {
            "block" => {
                let fs_type = if Self::is_block(req.volume_capability.as_ref()) { "raw" } else { fs_type };
                Self::stage_block(&req.volume_context, &req.staging_target_path, fs_type).await?;
            }
            "file-share" => {
                let server = req
                    .volume_context
                    .get("server")
                    .ok_or_else(|| Status::invalid_argument("volume_context missing 'server'"))?;
                Self::stage_file_share(&req.volume_context, &req.staging_target_path, server, read_only).await?;
            }
            other => return Err(Status::invalid_argument(format!("unknown protocol '{other}'"))),
        }

        Ok(Response::new(csi::NodeStageVolumeResponse {}))
    }

    #[instrument(skip(self, request))]
    async fn node_unstage_volume(
        &self,
        request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume_id is required"));
        }
        if req.staging_target_path.is_empty() {
            return Err(Status::invalid_argument("staging_target_path is required"));
        }

        info!(volume_id = %req.volume_id, "NodeUnstageVolume request");

        // NodeUnstageVolumeRequest carries no volume_context, so the device
        // backing this mount (and therefore whether it's NVMeoF at all) has
        // to be recovered from the mount table before it's torn down.
        let device = platform::device_for_mount(&req.staging_target_path)?;

        if platform::is_mounted(&req.staging_target_path)? {
            platform::unmount(&req.staging_target_path)?;
        }

        if let Some(device) = device {
            if device.contains("nvme") {
                if let Err(e) = platform::disconnect_nvmeof_by_device(&device) {
                    warn!(volume_id = %req.volume_id, error = %e, "failed to disconnect nvmeof device on unstage");
                }
            }
        }

        Ok(Response::new(csi::NodeUnstageVolumeResponse {}))
    }

    #[instrument(skip(self, request))]
    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume_id is required"));
        }
        if req.target_path.is_empty() {
            return Err(Status::invalid_argument("target_path is required"));
        }

        info!(volume_id = %req.volume_id, target_path = %req.target_path, "NodePublishVolume request");

        if Self::is_block(req.volume_capability.as_ref()) {
            let device = platform::device_for_mount(&req.staging_target_path)?
                .ok_or_else(|| Status::failed_precondition("staging path has no backing device"))?;
            platform::bind_mount(&device, &req.target_path)?;
        } else {
            if req.staging_target_path.is_empty() {
                return Err(Status::invalid_argument("staging_target_path is required"));
            }
            platform::bind_mount(&req.staging_target_path, &req.target_path)?;
        }

        Ok(Response::new(csi::NodePublishVolumeResponse {}))
    }

    #[instrument(skip(self, request))]
    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume_id is required"));
        }
        if req.target_path.is_empty() {
            return Err(Status::invalid_argument("target_path is required"));
        }

        info!(volume_id = %req.volume_id, target_path = %req.target_path, "NodeUnpublishVolume request");
        if platform::is_mounted(&req.target_path)? {
            platform::unmount(&req.target_path)?;
        }

        Ok(Response::new(csi::NodeUnpublishVolumeResponse {}))
    }

    #[instrument(skip(self, request))]
    async fn node_get_volume_stats(
        &self,
        request: Request<csi::NodeGetVolumeStatsRequest>,
    ) -> Result<Response<csi::NodeGetVolumeStatsResponse>, Status> {
        let req = request.into_inner();
        if req.volume_path.is_empty() {
            return Err(Status::invalid_argument("volume_path is required"));
        }
        if !platform::is_mounted(&req.volume_path)? {
            return Err(Status::not_found(format!("'{}' is not mounted", req.volume_path)));
        }

        let (available, total, used) = platform::disk_usage(&req.volume_path)?;
        Ok(Response::new(csi::NodeGetVolumeStatsResponse {
            usage: vec![csi::VolumeUsage {
                available: available as i64,
                total: total as i64,
                used: used as i64,
                unit: csi::volume_usage::Unit::Bytes as i32,
            }],
        }))
    }

    #[instrument(skip(self, request))]
    async fn node_expand_volume(
        &self,
        request: Request<csi::NodeExpandVolumeRequest>,
    ) -> Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume_id is required"));
        }
        let target = if !req.staging_target_path.is_empty() { &req.staging_target_path } else { &req.volume_path };
        if target.is_empty() {
            return Err(Status::invalid_argument("volume_path or staging_target_path is required"));
        }

        info!(volume_id = %req.volume_id, target, "NodeExpandVolume request");
        platform::resize_filesystem(target)?;

        let capacity_bytes = req.capacity_range.as_ref().map(|r| r.required_bytes).unwrap_or(0);
        Ok(Response::new(csi::NodeExpandVolumeResponse { capacity_bytes }))
    }

    #[instrument(skip(self, _request))]
    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        use csi::node_service_capability::{rpc::Type as RpcType, Rpc, Type as CapType};

        let rpc = |t: RpcType| csi::NodeServiceCapability { r#type: Some(CapType::Rpc(Rpc { r#type: t as i32 })) };

        Ok(Response::new(csi::NodeGetCapabilitiesResponse {
            capabilities: vec![
                rpc(RpcType::StageUnstageVolume),
                rpc(RpcType::GetVolumeStats),
                rpc(RpcType::ExpandVolume),
            ],
        }))
    }

    #[instrument(skip(self, _request))]
    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: self.max_volumes_per_node,
            accessible_topology: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fs_type_defaults_when_capability_missing() {
        assert_eq!(NodeService::fs_type(None), platform::default_fs_type());
    }

    #[test]
    fn fs_type_uses_mount_capability() {
        let cap = csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Mount(csi::volume_capability::MountVolume {
                fs_type: "xfs".to_string(),
                mount_flags: vec![],
            })),
            access_mode: None,
        };
        assert_eq!(NodeService::fs_type(Some(&cap)), "xfs");
    }

    #[test]
    fn is_block_detects_block_access_type() {
        let cap = csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Block(csi::volume_capability::BlockVolume {})),
            access_mode: None,
        };
        assert!(NodeService::is_block(Some(&cap)));
        assert!(!NodeService::is_block(None));
    }

    #[test]
    fn protocol_requires_volume_context_key() {
        let ctx = HashMap::new();
        assert!(NodeService::protocol(&ctx).is_err());
    }
}
