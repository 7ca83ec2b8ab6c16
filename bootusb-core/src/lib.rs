//! The core, UI-agnostic library for the `bootusb` imaging utility.
//!
//! `bootusb-core` turns an ISO image into a bootable USB drive: it partitions
//! and formats the target, streams the image onto it, optionally verifies the
//! result byte for byte and installs a bootloader. Front ends only build an
//! [`ImagingConfig`], start the pipeline and render the events it emits.
//!
//! The library is structured into several key modules:
//! - [`device`] and [`platform`]: discovery of removable block devices.
//! - [`mod@format`]: partition table and filesystem creation.
//! - [`mod@write`] and [`verify`]: the chunked copy and its read-back check.
//! - [`bootloader`]: Syslinux and GRUB installation.
//! - [`pipeline`]: the state machine that runs all of the above in order.
//!
//! External tools are invoked through [`command::CommandRunner`] and device
//! I/O goes through [`image_io::ImageIo`], so every phase can be exercised
//! without real hardware.
//!
//! ## Example: Creating a bootable drive
//!
//! ```rust,no_run
//! use bootusb_core::{BootloaderType, FilesystemType, ImagingConfig, LogEntry, ProgressEvent};
//!
//! let devices = bootusb_core::list_devices();
//! let Some(device) = devices.first() else {
//!     println!("No removable devices found.");
//!     return;
//! };
//!
//! let config = ImagingConfig::new("debian-12.iso", &device.path)
//!     .with_filesystem(FilesystemType::Fat32)
//!     .with_bootloader(BootloaderType::Syslinux)
//!     .with_verify(true);
//!
//! let result = bootusb_core::run_pipeline(
//!     config,
//!     |event: ProgressEvent| println!("{}: {:.1}%", event.phase, event.percent()),
//!     |entry: LogEntry| println!("{entry}"),
//! );
//! println!("{result}");
//! ```

pub mod bootloader;
pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod format;
pub mod image_io;
pub mod pipeline;
pub mod platform;
pub mod progress;
pub mod source;
pub mod verify;
pub mod write;

pub use config::{BootloaderType, FilesystemType, ImagingConfig, PartitionScheme, PersistentStorage};
pub use device::BlockDevice;
pub use pipeline::{ImagingPipeline, Outcome, PipelineResult, PipelineState, PipelineWorker};
pub use progress::{
    CancelToken, ChannelObserver, FnObserver, LogEntry, LogLevel, Phase, PipelineEvent,
    PipelineObserver, ProgressEvent,
};

/// Enumerates removable (USB) whole-disk devices.
///
/// An empty result means either that no device is plugged in or that the
/// device subsystem could not be queried. The two cases are not told apart.
pub fn list_devices() -> Vec<BlockDevice> {
    platform::get_removable_devices()
}

/// Runs one imaging pipeline to completion on the calling thread.
///
/// Use [`ImagingPipeline::spawn`] to run it on a worker and keep the ability
/// to cancel it.
pub fn run_pipeline<P, L>(config: ImagingConfig, on_progress: P, on_log: L) -> PipelineResult
where
    P: FnMut(ProgressEvent),
    L: FnMut(LogEntry),
{
    ImagingPipeline::new(config).run(&mut FnObserver::new(on_progress, on_log))
}
