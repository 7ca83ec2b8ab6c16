//! Bootloader installation onto a written device.
//!
//! Syslinux installs straight into the FAT partition. GRUB needs the boot
//! partition mounted so it can place its files under `<mount>/boot`; the mount
//! is scoped to the installation and is released on every exit path.
use crate::command::{CommandRunner, ToolCommand, run_checked};
use crate::config::BootloaderType;
use crate::device::partition_path;
use crate::error::{BootloaderError, ToolError};
use std::path::{Path, PathBuf};

/// BIOS target used for GRUB installs.
pub const GRUB_TARGET: &str = "i386-pc";

pub struct BootloaderInstaller<'a> {
    runner: &'a dyn CommandRunner,
    mount_parent: Option<PathBuf>,
}

impl<'a> BootloaderInstaller<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self {
            runner,
            mount_parent: None,
        }
    }

    /// Creates temporary mount points under `dir` instead of the system temp dir.
    pub fn with_mount_parent(mut self, dir: impl Into<PathBuf>) -> Self {
        self.mount_parent = Some(dir.into());
        self
    }

    /// Installs `bootloader` onto `device`.
    ///
    /// `on_warning` receives problems that do not change the outcome, such as
    /// an unmount that failed after the installer already finished.
    pub fn install<W>(
        &self,
        device: &Path,
        bootloader: BootloaderType,
        mut on_warning: W,
    ) -> Result<(), BootloaderError>
    where
        W: FnMut(String),
    {
        match bootloader {
            BootloaderType::None => {
                tracing::info!("No bootloader requested");
                Ok(())
            }
            BootloaderType::Syslinux => {
                let partition = partition_path(device, 1);
                let cmd = syslinux_command(&partition)?;
                tracing::info!("Installing Syslinux on {}", partition.display());
                run_checked(self.runner, &cmd).map_err(BootloaderError::InstallerFailed)?;
                Ok(())
            }
            BootloaderType::Grub => self.install_grub(device, &mut on_warning),
        }
    }

    fn install_grub(
        &self,
        device: &Path,
        on_warning: &mut dyn FnMut(String),
    ) -> Result<(), BootloaderError> {
        let partition = partition_path(device, 1);
        let mount = ScopedMount::mount(self.runner, &partition, self.mount_parent.as_deref())?;

        tracing::info!(
            "Installing GRUB on {} (boot directory {})",
            device.display(),
            mount.path().join("boot").display()
        );
        let installed = grub_command(device, mount.path())
            .map_err(BootloaderError::from)
            .and_then(|cmd| {
                run_checked(self.runner, &cmd).map_err(BootloaderError::InstallerFailed)
            });

        if let Err(e) = mount.release() {
            on_warning(format!("Failed to unmount boot partition: {e}"));
        }
        installed.map(|_| ())
    }
}

/// `syslinux --install <partition>`
pub fn syslinux_command(partition: &Path) -> Result<ToolCommand, BootloaderError> {
    Ok(ToolCommand::new("syslinux").arg("--install").path(partition)?)
}

/// `grub-install --target=i386-pc --boot-directory=<mount>/boot <device>`
pub fn grub_command(device: &Path, mount_point: &Path) -> Result<ToolCommand, BootloaderError> {
    Ok(ToolCommand::new("grub-install")
        .arg(format!("--target={GRUB_TARGET}"))
        .path_option("boot-directory", &mount_point.join("boot"))?
        .path(device)?)
}

/// A partition mounted on a fresh temporary directory.
///
/// [`ScopedMount::release`] unmounts and removes the directory. If the value
/// is dropped without being released (early return, panic), the drop handler
/// unmounts instead.
struct ScopedMount<'a> {
    runner: &'a dyn CommandRunner,
    dir: PathBuf,
    umount: ToolCommand,
    mounted: bool,
}

impl<'a> ScopedMount<'a> {
    fn mount(
        runner: &'a dyn CommandRunner,
        partition: &Path,
        parent: Option<&Path>,
    ) -> Result<Self, BootloaderError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("bootusb-mount-");
        let temp = match parent {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        }
        .map_err(|source| BootloaderError::MountPoint { source })?;
        // Removed by hand: a recursive delete must never run over a live mount.
        let dir = temp.keep();

        // Both commands are validated before anything is mounted.
        let commands = ToolCommand::new("mount")
            .path(partition)
            .and_then(|cmd| cmd.path(&dir))
            .and_then(|mount| Ok((mount, ToolCommand::new("umount").path(&dir)?)));
        let mounted = match commands {
            Ok((mount, umount)) => run_checked(runner, &mount)
                .map(|_| umount)
                .map_err(BootloaderError::MountFailed),
            Err(e) => Err(e.into()),
        };
        let umount = match mounted {
            Ok(umount) => umount,
            Err(e) => {
                if let Err(rm) = std::fs::remove_dir(&dir) {
                    tracing::debug!("Could not remove {}: {}", dir.display(), rm);
                }
                return Err(e);
            }
        };

        tracing::debug!("Mounted {} on {}", partition.display(), dir.display());
        Ok(Self {
            runner,
            dir,
            umount,
            mounted: true,
        })
    }

    fn path(&self) -> &Path {
        &self.dir
    }

    fn release(mut self) -> Result<(), ToolError> {
        self.unmount()
    }

    fn unmount(&mut self) -> Result<(), ToolError> {
        if !self.mounted {
            return Ok(());
        }
        self.mounted = false;
        run_checked(self.runner, &self.umount)?;
        if let Err(e) = std::fs::remove_dir(&self.dir) {
            tracing::debug!("Could not remove {}: {}", self.dir.display(), e);
        }
        Ok(())
    }
}

impl Drop for ScopedMount<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.unmount() {
            tracing::warn!("Failed to unmount {}: {}", self.dir.display(), e);
        }
    }
}
