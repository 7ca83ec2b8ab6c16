//! Partitioning and formatting of the target device.
//!
//! The disk gets a fresh partition table holding one primary partition that
//! starts at 1 MiB (for alignment and room for the table) and runs to the end
//! of the device. The filesystem is then created on that partition. All the
//! work is done by `parted` and the `mkfs.*` tools.
use crate::command::{CommandRunner, ToolCommand, run_checked, validate_path};
use crate::config::{FilesystemType, PartitionScheme};
use crate::device::partition_path;
use crate::error::FormatError;
use std::path::{Path, PathBuf};

/// Label given to the persistence partition; live systems look for it by name.
pub const PERSISTENCE_LABEL: &str = "casper-rw";

pub struct PartitionFormatter<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> PartitionFormatter<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }

    /// Partitions `device` and creates `filesystem` on its first partition.
    ///
    /// Returns the path of the formatted partition. Arguments are validated
    /// before any tool is started, so a rejected call leaves the device untouched.
    pub fn format(
        &self,
        device: &Path,
        filesystem: FilesystemType,
        scheme: PartitionScheme,
        label: &str,
    ) -> Result<PathBuf, FormatError> {
        let partition = partition_path(device, 1);
        let parted = partition_table_command(device, filesystem, scheme)?;
        let mkfs = mkfs_command(filesystem, &partition, label)?;

        tracing::info!(
            "Creating {} partition table with one {} partition on {}",
            scheme,
            filesystem,
            device.display()
        );
        run_checked(self.runner, &parted)?;
        self.settle();

        tracing::info!("Creating {} filesystem on {}", filesystem, partition.display());
        run_checked(self.runner, &mkfs)?;
        Ok(partition)
    }

    /// Appends an ext4 partition of `size_gib` GiB at the end of `device`.
    pub fn create_persistent_partition(
        &self,
        device: &Path,
        size_gib: u32,
    ) -> Result<PathBuf, FormatError> {
        let mkpart = ToolCommand::new("parted")
            .arg("-s")
            .path(device)?
            // `--` keeps parted from reading the negative offset as an option.
            .arg("--")
            .arg("mkpart")
            .arg("primary")
            .arg("ext4")
            .arg(format!("-{size_gib}GiB"))
            .arg("100%");
        run_checked(self.runner, &mkpart)?;
        self.settle();

        let print = ToolCommand::new("parted")
            .arg("-s")
            .arg("-m")
            .path(device)?
            .arg("print");
        let output = run_checked(self.runner, &print)?;
        let number = last_partition_number(&output.stdout)
            .ok_or_else(|| FormatError::PartitionNotFound(device.to_path_buf()))?;

        let partition = partition_path(device, number);
        tracing::info!(
            "Creating {} GiB persistence partition {}",
            size_gib,
            partition.display()
        );
        let mkfs = mkfs_command(FilesystemType::Ext4, &partition, PERSISTENCE_LABEL)?;
        run_checked(self.runner, &mkfs)?;
        Ok(partition)
    }

    /// Waits for udev to create nodes for new partitions. Best effort.
    fn settle(&self) {
        if let Err(e) = run_checked(self.runner, &ToolCommand::new("udevadm").arg("settle")) {
            tracing::debug!("udevadm settle: {}", e);
        }
    }
}

/// `parted -s <device> mklabel <scheme> mkpart primary <fs> 1MiB 100%`
pub fn partition_table_command(
    device: &Path,
    filesystem: FilesystemType,
    scheme: PartitionScheme,
) -> Result<ToolCommand, FormatError> {
    Ok(ToolCommand::new("parted")
        .arg("-s")
        .path(device)?
        .arg("mklabel")
        .arg(scheme.parted_label())
        .arg("mkpart")
        .arg("primary")
        .arg(filesystem.parted_name())
        .arg("1MiB")
        .arg("100%"))
}

/// The `mkfs.*` invocation for `filesystem`. An empty label omits the label flag.
pub fn mkfs_command(
    filesystem: FilesystemType,
    partition: &Path,
    label: &str,
) -> Result<ToolCommand, FormatError> {
    validate_path(partition)?;
    let label = filesystem.stored_label(label);
    let max = filesystem.max_label_len();
    if label.len() > max {
        return Err(FormatError::InvalidLabel {
            label,
            filesystem,
            max,
        });
    }

    let (command, label_flag) = match filesystem {
        FilesystemType::Fat32 => (ToolCommand::new("mkfs.vfat").arg("-F").arg("32"), "-n"),
        // -f: quick format, skip zeroing the whole partition.
        FilesystemType::Ntfs => (ToolCommand::new("mkfs.ntfs").arg("-f"), "-L"),
        FilesystemType::Ext4 => (ToolCommand::new("mkfs.ext4").arg("-F"), "-L"),
    };

    let command = if label.is_empty() {
        command
    } else {
        command.arg(label_flag).value(&label)?
    };
    Ok(command.path(partition)?)
}

/// Reads the highest partition number from `parted -m print` output.
fn last_partition_number(machine_output: &str) -> Option<u32> {
    machine_output
        .lines()
        .filter_map(|line| line.split(':').next()?.parse::<u32>().ok())
        .max()
}
