//! The imaging state machine.
//!
//! One run moves through `Formatting → Writing → [Verifying] →
//! InstallingBootloader → Complete`, stopping in `Failed(outcome)` when the
//! write, the verification or the bootloader installation fails. Formatting
//! failures only warn: the image is then written over the raw device.
//!
//! Every transition and every failure is reported twice: through `tracing`
//! for diagnostics and as a [`LogEntry`] for the caller.
use crate::bootloader::BootloaderInstaller;
use crate::command::{CommandRunner, SystemRunner, ToolCommand, run_checked};
use crate::config::ImagingConfig;
use crate::error::CopyError;
use crate::format::PartitionFormatter;
use crate::image_io::{FileIo, ImageIo};
use crate::platform;
use crate::progress::{CancelToken, LogEntry, LogLevel, Phase, PipelineObserver, ProgressEvent};
use crate::device::human_size;
use crate::source::{self, Compression, PreparedImage};
use crate::verify::{self, Verdict};
use crate::write;
use std::error::Error;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Decompression has no phase of its own; it is reported as a log line
/// every time this many more bytes have been produced.
const DECOMPRESS_LOG_STEP: u64 = 256 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    /// Reserved for callers that treat formatting as fatal. The pipeline
    /// itself downgrades formatting failures to warnings.
    FormatFailed,
    WriteFailed,
    VerifyFailed,
    BootloaderFailed,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outcome::Success => "Success",
            Outcome::FormatFailed => "Format failed",
            Outcome::WriteFailed => "Write failed",
            Outcome::VerifyFailed => "Verification failed",
            Outcome::BootloaderFailed => "Bootloader installation failed",
        })
    }
}

/// The terminal value of one run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineResult {
    pub outcome: Outcome,
    pub message: String,
}

impl PipelineResult {
    pub fn new(outcome: Outcome, message: impl Into<String>) -> Self {
        Self {
            outcome,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

impl fmt::Display for PipelineResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.outcome, self.message)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Formatting,
    Writing,
    Verifying,
    InstallingBootloader,
    Complete,
    Failed(Outcome),
}

/// Orchestrates one imaging run under a fixed [`ImagingConfig`].
///
/// External tools run through a [`CommandRunner`] and device I/O goes
/// through an [`ImageIo`]; both default to the real system.
pub struct ImagingPipeline {
    config: ImagingConfig,
    runner: Arc<dyn CommandRunner>,
    io: Arc<dyn ImageIo>,
    cancel: CancelToken,
    state: PipelineState,
}

impl ImagingPipeline {
    pub fn new(config: ImagingConfig) -> Self {
        Self {
            config,
            runner: Arc::new(SystemRunner),
            io: Arc::new(FileIo),
            cancel: CancelToken::new(),
            state: PipelineState::Idle,
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_io(mut self, io: Arc<dyn ImageIo>) -> Self {
        self.io = io;
        self
    }

    /// Shares an existing token, e.g. one already wired to a signal handler.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Requests cancellation. Honored at the next chunk boundary of the
    /// write or verify phase.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Runs the whole pipeline on a dedicated worker thread.
    pub fn spawn<O>(mut self, mut observer: O) -> io::Result<PipelineWorker>
    where
        O: PipelineObserver + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let handle = thread::Builder::new()
            .name("bootusb-worker".to_string())
            .spawn(move || self.run(&mut observer))?;
        Ok(PipelineWorker { cancel, handle })
    }

    /// Runs the whole pipeline on the current thread.
    pub fn run(&mut self, observer: &mut dyn PipelineObserver) -> PipelineResult {
        let mut reporter = Reporter { observer };
        let target = self.config.target_device_path.clone();
        let runner = Arc::clone(&self.runner);

        if let Err(e) = self.config.validate() {
            return self.fail(&mut reporter, Outcome::WriteFailed, format!("Invalid configuration: {e}"));
        }
        if let Err(e) = self.io.source_len(&self.config.source_image_path) {
            return self.fail(
                &mut reporter,
                Outcome::WriteFailed,
                format!(
                    "Cannot read source image {}: {e}",
                    self.config.source_image_path.display()
                ),
            );
        }

        let image = match self.prepare_source(&mut reporter) {
            Ok(image) => image,
            Err(message) => return self.fail(&mut reporter, Outcome::WriteFailed, message),
        };
        let len = match self.check_capacity(image.path(), &target) {
            Ok(len) => len,
            Err(message) => return self.fail(&mut reporter, Outcome::WriteFailed, message),
        };

        self.enter(&mut reporter, PipelineState::Formatting);
        reporter.progress(Phase::Formatting, 0, len);
        self.unmount_target(&mut reporter, &target);
        let formatter = PartitionFormatter::new(&*runner);
        match formatter.format(
            &target,
            self.config.filesystem_type,
            self.config.partition_scheme,
            &self.config.volume_label,
        ) {
            Ok(partition) => reporter.info(format!("Formatted {}", partition.display())),
            Err(e) => reporter.warn(format!(
                "Formatting failed ({}), writing the raw image instead",
                describe(&e)
            )),
        }

        self.enter(&mut reporter, PipelineState::Writing);
        let written = write::copy_with(
            &*self.io,
            image.path(),
            &target,
            self.config.buffer_size_bytes,
            &self.cancel,
            |done, total| reporter.progress(Phase::Writing, done, total),
        );
        match written {
            Ok(bytes) => reporter.info(format!("Wrote {bytes} bytes to {}", target.display())),
            Err(e) => return self.fail(&mut reporter, Outcome::WriteFailed, describe(&e)),
        }

        if self.config.verify_after_write {
            self.enter(&mut reporter, PipelineState::Verifying);
            if let Err(e) = self.verify(&mut reporter, image.path(), &target) {
                return self.fail(&mut reporter, Outcome::VerifyFailed, describe(&e));
            }
            reporter.info("Verification passed");
        }

        self.enter(&mut reporter, PipelineState::InstallingBootloader);
        reporter.progress(Phase::InstallingBootloader, 0, len);
        let installed = BootloaderInstaller::new(&*runner).install(
            &target,
            self.config.bootloader_type,
            |warning| reporter.warn(warning),
        );
        if let Err(e) = installed {
            return self.fail(&mut reporter, Outcome::BootloaderFailed, describe(&e));
        }

        if let Some(size_gib) = self.config.persistence_gib() {
            match formatter.create_persistent_partition(&target, size_gib) {
                Ok(partition) => reporter.info(format!(
                    "Created {size_gib} GiB persistent storage on {}",
                    partition.display()
                )),
                Err(e) => reporter.warn(format!(
                    "Persistent storage could not be created: {}",
                    describe(&e)
                )),
            }
        }

        self.enter(&mut reporter, PipelineState::Complete);
        reporter.progress(Phase::Complete, len, len);
        let message = format!(
            "{} written to {}",
            self.config.source_image_path.display(),
            target.display()
        );
        reporter.info(message.clone());
        PipelineResult::new(Outcome::Success, message)
    }

    fn prepare_source(&self, reporter: &mut Reporter<'_>) -> Result<PreparedImage, String> {
        let path = &self.config.source_image_path;
        if Compression::from_path(path).is_some() {
            reporter.info(format!("Decompressing {}", path.display()));
        }
        let mut steps = ByteSteps::new(DECOMPRESS_LOG_STEP);
        let image = source::prepare(path, &self.cancel, |done| {
            if steps.crossed(done) {
                reporter.info(format!("Decompressed {} so far", human_size(done)));
            }
        })
        .map_err(|e| describe(&e))?;
        if image.is_decompressed() {
            reporter.info(format!("Decompressed {}", path.display()));
        }
        Ok(image)
    }

    /// Returns the image length once it is known to fit on the target.
    fn check_capacity(&self, image: &Path, target: &Path) -> Result<u64, String> {
        let len = self
            .io
            .source_len(image)
            .map_err(|e| format!("Cannot read source image {}: {e}", image.display()))?;
        let capacity = self
            .io
            .capacity(target)
            .map_err(|e| format!("Cannot determine the size of {}: {e}", target.display()))?;
        match capacity {
            Some(capacity) if len > capacity => Err(CopyError::ImageTooLarge {
                image: len,
                capacity,
            }
            .to_string()),
            _ => Ok(len),
        }
    }

    /// Releases mounted partitions of the target so it can be repartitioned.
    fn unmount_target(&self, reporter: &mut Reporter<'_>, target: &Path) {
        for mount_point in platform::mounted_partitions(target) {
            let unmounted = ToolCommand::new("umount")
                .path(&mount_point)
                .map_err(|e| e.to_string())
                .and_then(|cmd| run_checked(&*self.runner, &cmd).map_err(|e| e.to_string()));
            match unmounted {
                Ok(_) => reporter.info(format!("Unmounted {}", mount_point.display())),
                Err(e) => reporter.warn(format!("Could not unmount {}: {e}", mount_point.display())),
            }
        }
    }

    fn verify(
        &self,
        reporter: &mut Reporter<'_>,
        image: &Path,
        target: &Path,
    ) -> Result<(), CopyError> {
        let verdict = verify::verify_with(&*self.io, image, target, &self.cancel, |done, total| {
            reporter.progress(Phase::Verifying, done, total)
        })
        .map_err(|e| CopyError::VerifyFailed(describe(&e)))?;

        match verdict {
            Verdict::Matched => Ok(()),
            Verdict::Mismatch { offset } => Err(CopyError::VerifyFailed(format!(
                "destination differs from the image at byte {offset}"
            ))),
            Verdict::ShortRead { offset } => Err(CopyError::VerifyFailed(format!(
                "destination ended at byte {offset}"
            ))),
        }
    }

    fn enter(&mut self, reporter: &mut Reporter<'_>, state: PipelineState) {
        tracing::debug!("Pipeline state {:?} -> {:?}", self.state, state);
        self.state = state;
        let message = match state {
            PipelineState::Formatting => format!("Formatting {}", self.config.target_device_path.display()),
            PipelineState::Writing => format!(
                "Writing {} to {}",
                self.config.source_image_path.display(),
                self.config.target_device_path.display()
            ),
            PipelineState::Verifying => "Verifying written data".to_string(),
            PipelineState::InstallingBootloader => {
                format!("Installing bootloader: {}", self.config.bootloader_type)
            }
            PipelineState::Complete => "Complete".to_string(),
            PipelineState::Idle | PipelineState::Failed(_) => return,
        };
        reporter.info(message);
    }

    fn fail(&mut self, reporter: &mut Reporter<'_>, outcome: Outcome, message: String) -> PipelineResult {
        self.state = PipelineState::Failed(outcome);
        reporter.error(format!("{outcome}: {message}"));
        PipelineResult::new(outcome, message)
    }
}

/// A pipeline running on its worker thread.
pub struct PipelineWorker {
    cancel: CancelToken,
    handle: JoinHandle<PipelineResult>,
}

impl PipelineWorker {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the run to end. A panicking worker is reported as a failed write.
    pub fn join(self) -> PipelineResult {
        self.handle.join().unwrap_or_else(|_| {
            tracing::error!("Pipeline worker panicked");
            PipelineResult::new(Outcome::WriteFailed, "pipeline worker panicked")
        })
    }
}

/// Sends events to the observer and mirrors log lines into `tracing`.
struct Reporter<'o> {
    observer: &'o mut dyn PipelineObserver,
}

impl Reporter<'_> {
    fn progress(&mut self, phase: Phase, done: u64, total: u64) {
        self.observer.on_progress(ProgressEvent::new(phase, done, total));
    }

    fn info(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{}", message);
        self.observer.on_log(LogEntry::new(LogLevel::Info, message));
    }

    fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{}", message);
        self.observer.on_log(LogEntry::new(LogLevel::Warn, message));
    }

    fn error(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("{}", message);
        self.observer.on_log(LogEntry::new(LogLevel::Error, message));
    }
}

/// Tracks a growing byte count and fires once per `step` bytes crossed.
struct ByteSteps {
    step: u64,
    next: u64,
}

impl ByteSteps {
    fn new(step: u64) -> Self {
        Self { step, next: step }
    }

    fn crossed(&mut self, done: u64) -> bool {
        if done < self.next {
            return false;
        }
        self.next = (done / self.step + 1) * self.step;
        true
    }
}

/// Joins an error with its source chain: `outer: inner: os error`.
fn describe(error: &dyn Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
