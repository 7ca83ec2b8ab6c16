//! Error types for each stage of the imaging pipeline.
//!
//! Every component returns its own error enum so the pipeline can map a
//! failure onto the matching [`crate::pipeline::Outcome`] without inspecting
//! strings. I/O variants keep the underlying [`std::io::Error`] as their
//! source, tool variants keep the raw exit status.
use crate::config::FilesystemType;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Problems with an [`crate::config::ImagingConfig`] detected before a run starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("buffer size must be greater than zero")]
    ZeroBufferSize,

    #[error("no source image selected")]
    MissingSource,

    #[error("no target device selected")]
    MissingTarget,

    #[error("volume label {label:?} is too long for {filesystem} (max {max} bytes)")]
    LabelTooLong {
        label: String,
        filesystem: FilesystemType,
        max: usize,
    },

    #[error("persistent storage is enabled but its size is 0 GiB")]
    EmptyPersistentStorage,

    #[error("failed to read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// An argument rejected while building an external tool invocation.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: PathBuf, reason: &'static str },

    #[error("invalid argument {arg:?}: {reason}")]
    InvalidArgument { arg: String, reason: &'static str },
}

/// Failure of an external tool, either at spawn time or through its exit status.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to run {program}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} {}{}", exit_label(.exit_code), stderr_suffix(.stderr))]
    Exit {
        program: String,
        exit_code: Option<i32>,
        stderr: String,
    },
}

impl ToolError {
    /// The raw exit code, if the tool ran and exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ToolError::Spawn { .. } => None,
            ToolError::Exit { exit_code, .. } => *exit_code,
        }
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match *code {
        Some(code) => format!("exited with status {code}"),
        None => "was terminated by a signal".to_string(),
    }
}

fn stderr_suffix(stderr: &str) -> String {
    match stderr.lines().find(|l| !l.trim().is_empty()) {
        Some(line) => format!(": {}", line.trim()),
        None => String::new(),
    }
}

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("unsupported filesystem type: {0}")]
    UnsupportedFilesystem(String),

    #[error(transparent)]
    InvalidArgument(#[from] CommandError),

    #[error("volume label {label:?} is too long for {filesystem} (max {max} bytes)")]
    InvalidLabel {
        label: String,
        filesystem: FilesystemType,
        max: usize,
    },

    #[error(transparent)]
    ToolFailed(#[from] ToolError),

    #[error("could not find the new partition on {0}")]
    PartitionNotFound(PathBuf),
}

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("buffer size must be greater than zero")]
    ZeroBufferSize,

    #[error("failed to open source image {path}")]
    OpenSourceFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to open destination {path}")]
    OpenDestFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read source image at byte {offset}")]
    ReadFailed {
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error("failed to write destination at byte {offset}")]
    WriteFailed {
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error("failed to flush written data to the destination")]
    SyncFailed {
        #[source]
        source: io::Error,
    },

    #[error("image is {image} bytes but the destination only holds {capacity} bytes")]
    ImageTooLarge { image: u64, capacity: u64 },

    #[error("operation cancelled by user after {offset} bytes")]
    Cancelled { offset: u64 },

    #[error("verification failed: {0}")]
    VerifyFailed(String),
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("failed to open source image {path}")]
    OpenSourceFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to open destination {path}")]
    OpenDestFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read {side} at byte {offset}")]
    ReadFailed {
        side: &'static str,
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error("verification cancelled by user after {offset} bytes")]
    Cancelled { offset: u64 },
}

#[derive(Debug, Error)]
pub enum BootloaderError {
    #[error("unsupported bootloader type: {0}")]
    UnsupportedBootloader(String),

    #[error(transparent)]
    InvalidArgument(#[from] CommandError),

    #[error("failed to create a temporary mount point")]
    MountPoint {
        #[source]
        source: io::Error,
    },

    #[error("failed to mount the boot partition")]
    MountFailed(#[source] ToolError),

    #[error("bootloader installer failed")]
    InstallerFailed(#[source] ToolError),
}

/// Errors raised while preparing (decompressing) a source image.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to open source image {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to decompress {path}")]
    Decompress {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("decompression cancelled by user")]
    Cancelled,
}
