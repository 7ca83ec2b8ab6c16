//! Progress and log events delivered to the caller, and cooperative cancellation.
//!
//! All events are plain values. The pipeline invokes the observer from its
//! worker thread, so a front end must marshal them onto its own context before
//! touching its own state. [`ChannelObserver`] does exactly that over an
//! `mpsc` channel.
use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;

/// A stage of the pipeline, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Phase {
    Formatting,
    Writing,
    Verifying,
    InstallingBootloader,
    Complete,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Phase::Formatting => "Formatting",
            Phase::Writing => "Writing",
            Phase::Verifying => "Verifying",
            Phase::InstallingBootloader => "Installing bootloader",
            Phase::Complete => "Complete",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub phase: Phase,
}

impl ProgressEvent {
    pub fn new(phase: Phase, bytes_done: u64, bytes_total: u64) -> Self {
        Self {
            bytes_done,
            bytes_total,
            phase,
        }
    }

    /// Completion of the current phase in percent. An empty phase counts as done.
    pub fn percent(&self) -> f64 {
        if self.bytes_total == 0 {
            return 100.0;
        }
        (self.bytes_done as f64 * 100.0 / self.bytes_total as f64).min(100.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// A timestamped, user-visible log line.
#[derive(Clone, Debug, PartialEq)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            level,
            message: message.into(),
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.timestamp.format("%H:%M:%S"), self.message)
    }
}

/// Receives the event stream of one pipeline run.
pub trait PipelineObserver {
    fn on_progress(&mut self, event: ProgressEvent);
    fn on_log(&mut self, entry: LogEntry);
}

/// Adapts a pair of closures into a [`PipelineObserver`].
pub struct FnObserver<P, L> {
    on_progress: P,
    on_log: L,
}

impl<P, L> FnObserver<P, L>
where
    P: FnMut(ProgressEvent),
    L: FnMut(LogEntry),
{
    pub fn new(on_progress: P, on_log: L) -> Self {
        Self {
            on_progress,
            on_log,
        }
    }
}

impl<P, L> PipelineObserver for FnObserver<P, L>
where
    P: FnMut(ProgressEvent),
    L: FnMut(LogEntry),
{
    fn on_progress(&mut self, event: ProgressEvent) {
        (self.on_progress)(event)
    }

    fn on_log(&mut self, entry: LogEntry) {
        (self.on_log)(entry)
    }
}

#[derive(Clone, Debug)]
pub enum PipelineEvent {
    Progress(ProgressEvent),
    Log(LogEntry),
}

/// Forwards every event to a channel. Events are dropped once the receiver is gone.
pub struct ChannelObserver {
    tx: Sender<PipelineEvent>,
}

impl ChannelObserver {
    pub fn new(tx: Sender<PipelineEvent>) -> Self {
        Self { tx }
    }
}

impl PipelineObserver for ChannelObserver {
    fn on_progress(&mut self, event: ProgressEvent) {
        let _ = self.tx.send(PipelineEvent::Progress(event));
    }

    fn on_log(&mut self, entry: LogEntry) {
        let _ = self.tx.send(PipelineEvent::Log(entry));
    }
}

/// A shared flag checked between chunks. Cancellation is never preemptive.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
