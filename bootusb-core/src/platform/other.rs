use crate::device::BlockDevice;
use std::path::{Path, PathBuf};

/// Device discovery is only implemented for Linux; other targets see no devices.
pub fn get_removable_devices() -> Vec<BlockDevice> {
    tracing::debug!("Removable device discovery is not supported on this platform");
    Vec::new()
}

pub fn mounted_partitions(_device: &Path) -> Vec<PathBuf> {
    Vec::new()
}
