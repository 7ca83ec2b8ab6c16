use crate::device::{BlockDevice, UNKNOWN_MODEL, UNKNOWN_SIZE, human_size, parent_disk_name};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// sysfs always reports `size` in 512-byte units, whatever the logical block size.
const SECTOR_SIZE: u64 = 512;

/// Helper to read a single attribute file, trimmed.
fn read_attr(dir: &Path, attr: &str) -> Option<String> {
    fs::read_to_string(dir.join(attr))
        .ok()
        .map(|s| s.trim().to_string())
}

/// Parses a sysfs `uevent` file into its `KEY=value` pairs.
fn read_uevent(dir: &Path) -> HashMap<String, String> {
    read_attr(dir, "uevent")
        .unwrap_or_default()
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Walks up from a block device to the USB device it hangs off, if any.
fn find_usb_parent(syspath: &Path, devices_root: Option<&Path>) -> Option<PathBuf> {
    syspath
        .ancestors()
        .skip(1)
        .take_while(|dir| devices_root.is_none_or(|root| dir.starts_with(root) && *dir != root))
        .find(|dir| read_uevent(dir).get("DEVTYPE").map(String::as_str) == Some("usb_device"))
        .map(Path::to_path_buf)
}

/// Finds the whole disk that holds the root filesystem, so it is never offered.
fn system_disk() -> Option<PathBuf> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .find(|disk| disk.mount_point() == Path::new("/"))
        .and_then(|disk| {
            let node = PathBuf::from("/dev/").join(disk.name());
            let name = node.file_name()?.to_str()?.to_string();
            Some(PathBuf::from("/dev").join(parent_disk_name(&name)))
        })
}

/// Scans for all USB-attached whole disks on a Linux system.
///
/// Devices are discovered through sysfs, the same tree udev reads:
/// 1.  Enumerate `/sys/class/block`.
/// 2.  Keep entries whose `uevent` reports `DEVTYPE=disk` (not partitions).
/// 3.  Keep disks with an ancestor whose `DEVTYPE` is `usb_device`.
/// 4.  Drop the disk that holds the root filesystem.
///
/// A missing model or size is replaced by placeholder text. If sysfs itself
/// cannot be read the result is empty, which callers cannot tell apart from
/// "no devices plugged in".
pub fn get_removable_devices() -> Vec<BlockDevice> {
    let mut devices = scan_sysfs(Path::new("/sys"), Path::new("/dev"));
    if let Some(system_disk) = system_disk() {
        devices.retain(|d| d.path != system_disk);
    }
    devices
}

/// The discovery behind [`get_removable_devices`], rooted at arbitrary
/// sysfs and devfs directories.
pub fn scan_sysfs(sys_root: &Path, dev_root: &Path) -> Vec<BlockDevice> {
    let class_dir = sys_root.join("class").join("block");
    let entries = match fs::read_dir(&class_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("Cannot enumerate {}: {}", class_dir.display(), e);
            return Vec::new();
        }
    };
    let devices_root = fs::canonicalize(sys_root.join("devices")).ok();

    let mut devices = Vec::new();
    for entry in entries.filter_map(Result::ok) {
        let entry_name = entry.file_name().to_string_lossy().to_string();
        let Ok(syspath) = fs::canonicalize(entry.path()) else {
            continue;
        };

        let uevent = read_uevent(&syspath);
        if uevent.get("DEVTYPE").map(String::as_str) != Some("disk") {
            continue;
        }

        let Some(usb_parent) = find_usb_parent(&syspath, devices_root.as_deref()) else {
            continue;
        };

        let name = uevent.get("DEVNAME").cloned().unwrap_or(entry_name);
        let display_model = read_attr(&usb_parent, "product")
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| UNKNOWN_MODEL.to_string());

        let size_bytes = read_attr(&syspath, "size")
            .and_then(|s| s.parse::<u64>().ok())
            .map(|sectors| sectors.saturating_mul(SECTOR_SIZE));
        let size_label = size_bytes
            .map(human_size)
            .unwrap_or_else(|| UNKNOWN_SIZE.to_string());

        devices.push(BlockDevice {
            path: dev_root.join(&name),
            name,
            display_model,
            size_bytes: size_bytes.unwrap_or(0),
            size_label,
        });
    }

    devices.sort_by(|a, b| a.path.cmp(&b.path));
    devices
}

/// Lists the mount points of partitions of `device` (or of `device` itself).
pub fn mounted_partitions(device: &Path) -> Vec<PathBuf> {
    let Some(device_name) = device.file_name().and_then(|n| n.to_str()) else {
        return Vec::new();
    };

    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|disk| {
            let node = PathBuf::from("/dev/").join(disk.name());
            node.parent() == device.parent()
                && node
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n == device_name || parent_disk_name(n) == device_name)
        })
        .map(|disk| disk.mount_point().to_path_buf())
        .filter(|mp| !mp.as_os_str().is_empty())
        .collect()
}
