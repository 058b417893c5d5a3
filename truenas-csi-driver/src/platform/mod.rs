//! Platform abstraction for CSI Node operations on Linux.
//!
//! Kubernetes nodes running this driver are Linux hosts; the appliance side
//! (TrueNAS SCALE) is reached entirely through the appliance client, never
//! through a local platform tool. This module only wraps the node-local
//! commands needed to connect an NVMe-oF namespace, mount an NFS export, and
//! format/grow/mount the resulting filesystem.

mod linux;

use tonic::Status;

/// Result type for platform operations
pub type PlatformResult<T> = Result<T, Status>;

pub use linux::{
    bind_mount, connect_nvmeof, default_fs_type, device_for_mount, disconnect_nvmeof,
    disconnect_nvmeof_by_device, disk_usage, find_nvmeof_device, format_device, is_mounted,
    mount_device, mount_nfs, needs_formatting, resize_filesystem, unmount, validate_fs_type,
    DEFAULT_FS_TYPE,
};
