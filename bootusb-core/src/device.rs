use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// Placeholder model name for devices that do not report a product string.
pub const UNKNOWN_MODEL: &str = "USB Disk";
/// Placeholder size label for devices that do not report their size.
pub const UNKNOWN_SIZE: &str = "Unknown";

/// A removable block device discovered on the system.
///
/// This is a snapshot taken at enumeration time; the device node may vanish
/// if the drive is unplugged. It is populated by the platform-specific
/// discovery functions in the [`crate::platform`] module.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BlockDevice {
    /// The device node (e.g., `/dev/sdb`).
    pub path: PathBuf,
    /// The kernel-provided name of the device (e.g., "sdb").
    pub name: String,
    /// The product string of the USB device, or [`UNKNOWN_MODEL`].
    pub display_model: String,
    /// Capacity in bytes, `0` if unknown.
    pub size_bytes: u64,
    /// Human-readable capacity, or [`UNKNOWN_SIZE`].
    pub size_label: String,
}

impl fmt::Display for BlockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<15} {} ({})",
            self.path.display(),
            self.display_model,
            self.size_label
        )
    }
}

/// Formats a byte count with binary (1024-based) units and two decimals.
///
/// The unit is the largest of B, KB, MB, GB, TB that keeps the value at or
/// above 1, so `1536` becomes `"1.50 KB"`. Sizes beyond the TB range stay in TB.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    // Scale on the rounded value so 1023.999 KB prints as 1.00 MB.
    while unit < UNITS.len() - 1 && (value * 100.0).round() >= 102_400.0 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

/// Name prefixes of disks whose own name ends in a digit. Their partitions
/// carry a `p` separator (`nvme0n1p1`, `mmcblk0p2`).
const DIGIT_SUFFIXED_DISKS: [&str; 5] = ["nvme", "mmcblk", "loop", "nbd", "md"];

/// Returns the whole-disk name for a partition name (`sdb1` -> `sdb`,
/// `nvme0n1p2` -> `nvme0n1`). Whole-disk names are returned unchanged.
pub fn parent_disk_name(name: &str) -> &str {
    let stem = name.trim_end_matches(|c: char| c.is_ascii_digit());
    if stem.len() == name.len() {
        return name;
    }
    if DIGIT_SUFFIXED_DISKS.iter().any(|p| name.starts_with(p)) {
        return match stem.strip_suffix('p') {
            Some(base) if base.ends_with(|c: char| c.is_ascii_digit()) => base,
            _ => name,
        };
    }
    stem
}

/// The device node of partition `number` on `device`.
pub fn partition_path(device: &Path, number: u32) -> PathBuf {
    let mut node = device.as_os_str().to_os_string();
    if device
        .to_string_lossy()
        .ends_with(|c: char| c.is_ascii_digit())
    {
        node.push("p");
    }
    node.push(number.to_string());
    PathBuf::from(node)
}
