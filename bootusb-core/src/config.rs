//! The configuration of a single imaging run.
//!
//! An [`ImagingConfig`] is built once by the caller, either with
//! [`ImagingConfig::new`] and the `with_*` setters or from a JSON file, and is
//! then moved into the pipeline. It is never modified while a run is active.
use crate::error::{BootloaderError, ConfigError, FormatError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default chunk size for the write phase.
pub const DEFAULT_BUFFER_SIZE: usize = 4 * 1024 * 1024; // 4 MiB

pub const DEFAULT_VOLUME_LABEL: &str = "BOOTUSB";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilesystemType {
    #[serde(rename = "FAT32", alias = "fat32", alias = "vfat")]
    Fat32,
    #[serde(rename = "NTFS", alias = "ntfs")]
    Ntfs,
    #[serde(rename = "EXT4", alias = "ext4")]
    Ext4,
}

impl FilesystemType {
    /// The filesystem name `parted` expects in `mkpart`.
    pub fn parted_name(self) -> &'static str {
        match self {
            FilesystemType::Fat32 => "fat32",
            FilesystemType::Ntfs => "ntfs",
            FilesystemType::Ext4 => "ext4",
        }
    }

    /// Longest volume label the filesystem can store, in bytes.
    pub fn max_label_len(self) -> usize {
        match self {
            FilesystemType::Fat32 => 11,
            FilesystemType::Ntfs => 32,
            FilesystemType::Ext4 => 16,
        }
    }

    /// The label as the format tool will write it. FAT labels are stored in
    /// upper case, which can change their length (`ß` becomes `SS`).
    pub fn stored_label(self, label: &str) -> String {
        match self {
            FilesystemType::Fat32 => label.to_uppercase(),
            FilesystemType::Ntfs | FilesystemType::Ext4 => label.to_string(),
        }
    }
}

impl fmt::Display for FilesystemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FilesystemType::Fat32 => "FAT32",
            FilesystemType::Ntfs => "NTFS",
            FilesystemType::Ext4 => "ext4",
        };
        f.write_str(name)
    }
}

impl FromStr for FilesystemType {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fat32" | "vfat" => Ok(FilesystemType::Fat32),
            "ntfs" => Ok(FilesystemType::Ntfs),
            "ext4" => Ok(FilesystemType::Ext4),
            _ => Err(FormatError::UnsupportedFilesystem(s.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BootloaderType {
    #[serde(alias = "none")]
    None,
    #[serde(alias = "syslinux")]
    Syslinux,
    #[serde(rename = "GRUB", alias = "grub")]
    Grub,
}

impl fmt::Display for BootloaderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BootloaderType::None => "None",
            BootloaderType::Syslinux => "Syslinux",
            BootloaderType::Grub => "GRUB",
        };
        f.write_str(name)
    }
}

impl FromStr for BootloaderType {
    type Err = BootloaderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" => Ok(BootloaderType::None),
            "syslinux" => Ok(BootloaderType::Syslinux),
            "grub" => Ok(BootloaderType::Grub),
            _ => Err(BootloaderError::UnsupportedBootloader(s.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionScheme {
    #[serde(rename = "MBR", alias = "mbr", alias = "msdos")]
    Mbr,
    #[serde(rename = "GPT", alias = "gpt")]
    Gpt,
}

impl PartitionScheme {
    /// The disk label type passed to `parted mklabel`.
    pub fn parted_label(self) -> &'static str {
        match self {
            PartitionScheme::Mbr => "msdos",
            PartitionScheme::Gpt => "gpt",
        }
    }
}

impl fmt::Display for PartitionScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PartitionScheme::Mbr => "MBR",
            PartitionScheme::Gpt => "GPT",
        })
    }
}

impl FromStr for PartitionScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mbr" | "msdos" => Ok(PartitionScheme::Mbr),
            "gpt" => Ok(PartitionScheme::Gpt),
            _ => Err(format!("unsupported partition scheme: {s}")),
        }
    }
}

/// A persistence partition appended after the image (for live systems).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentStorage {
    pub enabled: bool,
    pub size_gib: u32,
}

/// Everything one pipeline run needs to know.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagingConfig {
    #[serde(default)]
    pub source_image_path: PathBuf,
    #[serde(default)]
    pub target_device_path: PathBuf,
    #[serde(default = "default_filesystem")]
    pub filesystem_type: FilesystemType,
    #[serde(default = "default_bootloader")]
    pub bootloader_type: BootloaderType,
    #[serde(default = "default_scheme")]
    pub partition_scheme: PartitionScheme,
    #[serde(default = "default_label")]
    pub volume_label: String,
    #[serde(default = "default_buffer_size")]
    pub buffer_size_bytes: usize,
    #[serde(default)]
    pub verify_after_write: bool,
    #[serde(default)]
    pub persistent_storage: Option<PersistentStorage>,
}

fn default_filesystem() -> FilesystemType {
    FilesystemType::Fat32
}

fn default_bootloader() -> BootloaderType {
    BootloaderType::None
}

fn default_scheme() -> PartitionScheme {
    PartitionScheme::Mbr
}

fn default_label() -> String {
    DEFAULT_VOLUME_LABEL.to_string()
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

impl ImagingConfig {
    pub fn new(source_image_path: impl Into<PathBuf>, target_device_path: impl Into<PathBuf>) -> Self {
        Self {
            source_image_path: source_image_path.into(),
            target_device_path: target_device_path.into(),
            filesystem_type: default_filesystem(),
            bootloader_type: default_bootloader(),
            partition_scheme: default_scheme(),
            volume_label: default_label(),
            buffer_size_bytes: DEFAULT_BUFFER_SIZE,
            verify_after_write: false,
            persistent_storage: None,
        }
    }

    /// Loads a config from a JSON file. Every field is optional; missing paths
    /// are reported by [`ImagingConfig::validate`].
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn with_filesystem(mut self, filesystem_type: FilesystemType) -> Self {
        self.filesystem_type = filesystem_type;
        self
    }

    pub fn with_bootloader(mut self, bootloader_type: BootloaderType) -> Self {
        self.bootloader_type = bootloader_type;
        self
    }

    pub fn with_partition_scheme(mut self, partition_scheme: PartitionScheme) -> Self {
        self.partition_scheme = partition_scheme;
        self
    }

    pub fn with_volume_label(mut self, label: impl Into<String>) -> Self {
        self.volume_label = label.into();
        self
    }

    pub fn with_buffer_size(mut self, buffer_size_bytes: usize) -> Self {
        self.buffer_size_bytes = buffer_size_bytes;
        self
    }

    pub fn with_verify(mut self, verify_after_write: bool) -> Self {
        self.verify_after_write = verify_after_write;
        self
    }

    pub fn with_persistent_storage(mut self, size_gib: u32) -> Self {
        self.persistent_storage = Some(PersistentStorage {
            enabled: true,
            size_gib,
        });
        self
    }

    /// The persistence size in GiB, if persistence is requested.
    pub fn persistence_gib(&self) -> Option<u32> {
        self.persistent_storage
            .filter(|p| p.enabled)
            .map(|p| p.size_gib)
    }

    /// Checks the invariants that do not depend on the state of the system.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source_image_path.as_os_str().is_empty() {
            return Err(ConfigError::MissingSource);
        }
        if self.target_device_path.as_os_str().is_empty() {
            return Err(ConfigError::MissingTarget);
        }
        if self.buffer_size_bytes == 0 {
            return Err(ConfigError::ZeroBufferSize);
        }
        let max = self.filesystem_type.max_label_len();
        if self.filesystem_type.stored_label(&self.volume_label).len() > max {
            return Err(ConfigError::LabelTooLong {
                label: self.volume_label.clone(),
                filesystem: self.filesystem_type,
                max,
            });
        }
        if self.persistence_gib() == Some(0) {
            return Err(ConfigError::EmptyPersistentStorage);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = ImagingConfig::new("/tmp/image.iso", "/dev/sdx");
        assert_eq!(config.buffer_size_bytes, 4 * 1024 * 1024);
        assert_eq!(config.filesystem_type, FilesystemType::Fat32);
        assert_eq!(config.bootloader_type, BootloaderType::None);
        assert_eq!(config.partition_scheme, PartitionScheme::Mbr);
        assert!(!config.verify_after_write);
        assert!(config.persistence_gib().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_buffer_is_rejected() {
        let config = ImagingConfig::new("/tmp/image.iso", "/dev/sdx").with_buffer_size(0);
        assert!(matches!(config.validate(), Err(ConfigError::ZeroBufferSize)));
    }

    #[test]
    fn fat_label_length_is_limited() {
        let config = ImagingConfig::new("/tmp/image.iso", "/dev/sdx")
            .with_volume_label("MUCH_TOO_LONG_LABEL");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::LabelTooLong { max: 11, .. })
        ));

        let ext4 = config.with_filesystem(FilesystemType::Ext4);
        assert!(ext4.validate().is_err());
        let ntfs = ext4.with_filesystem(FilesystemType::Ntfs);
        assert!(ntfs.validate().is_ok());
    }

    #[test]
    fn fat_label_is_measured_after_upper_casing() {
        // Eleven characters, but `ß` upper-cases to `SS`.
        let config = ImagingConfig::new("/tmp/image.iso", "/dev/sdx")
            .with_volume_label("ßßßßßßßßßßß");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::LabelTooLong { max: 11, .. })
        ));
        let accented = config.with_volume_label("ÉTÉ");
        assert!(accented.validate().is_ok());
    }

    #[test]
    fn parses_tool_spellings() {
        assert_eq!("vfat".parse::<FilesystemType>().unwrap(), FilesystemType::Fat32);
        assert_eq!("EXT4".parse::<FilesystemType>().unwrap(), FilesystemType::Ext4);
        assert_eq!("msdos".parse::<PartitionScheme>().unwrap(), PartitionScheme::Mbr);
        assert_eq!("GRUB".parse::<BootloaderType>().unwrap(), BootloaderType::Grub);
    }

    #[test]
    fn unknown_names_are_precondition_errors() {
        assert!(matches!(
            "btrfs".parse::<FilesystemType>(),
            Err(FormatError::UnsupportedFilesystem(name)) if name == "btrfs"
        ));
        assert!(matches!(
            "lilo".parse::<BootloaderType>(),
            Err(BootloaderError::UnsupportedBootloader(_))
        ));
    }

    #[test]
    fn json_fills_in_defaults() {
        let config: ImagingConfig = serde_json::from_str(
            r#"{
                "source_image_path": "/srv/debian.iso",
                "target_device_path": "/dev/sdx",
                "filesystem_type": "ext4",
                "verify_after_write": true,
                "persistent_storage": { "enabled": true, "size_gib": 4 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.filesystem_type, FilesystemType::Ext4);
        assert_eq!(config.bootloader_type, BootloaderType::None);
        assert_eq!(config.buffer_size_bytes, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.volume_label, "BOOTUSB");
        assert!(config.verify_after_write);
        assert_eq!(config.persistence_gib(), Some(4));
    }

    #[test]
    fn file_without_paths_loads_but_does_not_validate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bootusb.json");
        fs::write(&path, r#"{ "bootloader_type": "grub", "partition_scheme": "gpt" }"#).unwrap();

        let config = ImagingConfig::from_json_file(&path).unwrap();
        assert_eq!(config.bootloader_type, BootloaderType::Grub);
        assert_eq!(config.partition_scheme, PartitionScheme::Gpt);
        assert!(matches!(config.validate(), Err(ConfigError::MissingSource)));
    }

    #[test]
    fn unreadable_config_file_is_reported_with_its_path() {
        let err = ImagingConfig::from_json_file(Path::new("/nonexistent/bootusb.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { ref path, .. } if path.ends_with("bootusb.json")));
    }

    #[test]
    fn disabled_persistence_is_ignored() {
        let mut config = ImagingConfig::new("/tmp/image.iso", "/dev/sdx");
        config.persistent_storage = Some(PersistentStorage {
            enabled: false,
            size_gib: 0,
        });
        assert!(config.persistence_gib().is_none());
        assert!(config.validate().is_ok());
    }
}
