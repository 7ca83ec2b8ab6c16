#![allow(dead_code)]

use bootusb_core::command::{CommandRunner, ToolCommand, ToolOutput};
use bootusb_core::image_io::{ImageIo, SourceImage, SyncWrite};
use bootusb_core::{LogEntry, Phase, PipelineObserver, ProgressEvent};
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const SOURCE: &str = "/srv/images/live.iso";
pub const TARGET: &str = "/dev/bootusb-test";

/// Byte `offset` of a pattern image.
pub fn pattern_byte(offset: u64) -> u8 {
    (offset % 251) as u8
}

/// Records tool invocations and answers from a per-program script.
#[derive(Default)]
pub struct FakeRunner {
    calls: Mutex<Vec<ToolCommand>>,
    responses: Mutex<Vec<(String, i32)>>,
}

impl FakeRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, program: &str, code: i32) {
        self.responses
            .lock()
            .unwrap()
            .push((program.to_string(), code));
    }

    pub fn programs(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.program().to_string())
            .collect()
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, command: &ToolCommand) -> io::Result<ToolOutput> {
        self.calls.lock().unwrap().push(command.clone());
        let mut responses = self.responses.lock().unwrap();
        let code = match responses.iter().position(|(p, _)| p == command.program()) {
            Some(index) => responses.remove(index).1,
            None => 0,
        };
        Ok(ToolOutput {
            exit_code: Some(code),
            stdout: String::new(),
            stderr: if code == 0 { String::new() } else { "simulated failure".to_string() },
        })
    }
}

/// An in-memory source image and target device.
pub struct MemoryIo {
    source: Source,
    device: Arc<Mutex<Vec<u8>>>,
    fail_write_at: Option<u64>,
    corrupt_readback_at: Option<u64>,
    capacity: Option<u64>,
    open_handles: Arc<AtomicUsize>,
    opened: AtomicUsize,
}

enum Source {
    Pattern(u64),
    Data(Arc<Vec<u8>>),
}

impl Source {
    fn len(&self) -> u64 {
        match self {
            Source::Pattern(len) => *len,
            Source::Data(data) => data.len() as u64,
        }
    }
}

impl MemoryIo {
    /// A source of `len` pattern bytes, generated on the fly.
    pub fn pattern(len: u64) -> Self {
        Self::new(Source::Pattern(len))
    }

    pub fn with_data(data: Vec<u8>) -> Self {
        Self::new(Source::Data(Arc::new(data)))
    }

    fn new(source: Source) -> Self {
        Self {
            source,
            device: Arc::default(),
            fail_write_at: None,
            corrupt_readback_at: None,
            capacity: None,
            open_handles: Arc::default(),
            opened: AtomicUsize::new(0),
        }
    }

    /// Destination writes fail once `offset` bytes have been accepted.
    pub fn fail_writes_at(mut self, offset: u64) -> Self {
        self.fail_write_at = Some(offset);
        self
    }

    /// Reading the destination back returns a flipped byte at `offset`.
    pub fn corrupt_readback_at(mut self, offset: u64) -> Self {
        self.corrupt_readback_at = Some(offset);
        self
    }

    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Handles currently open.
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    /// Handles opened over the lifetime of this double.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn device_contents(&self) -> Vec<u8> {
        self.device.lock().unwrap().clone()
    }

    pub fn inspect_device<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.device.lock().unwrap())
    }

    pub fn device_len(&self) -> u64 {
        self.device.lock().unwrap().len() as u64
    }

    fn guard(&self) -> HandleGuard {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.open_handles.fetch_add(1, Ordering::SeqCst);
        HandleGuard(Arc::clone(&self.open_handles))
    }

    fn check_source(&self, path: &Path) -> io::Result<()> {
        if path == Path::new(SOURCE) {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::NotFound, "no such image"))
        }
    }
}

impl ImageIo for MemoryIo {
    fn source_len(&self, path: &Path) -> io::Result<u64> {
        self.check_source(path)?;
        Ok(self.source.len())
    }

    fn open_source(&self, path: &Path) -> io::Result<SourceImage> {
        self.check_source(path)?;
        let guard = self.guard();
        let reader: Box<dyn Read + Send> = match &self.source {
            Source::Pattern(len) => Box::new(PatternReader {
                pos: 0,
                len: *len,
                _guard: guard,
            }),
            Source::Data(data) => Box::new(Guarded {
                inner: Cursor::new(data.to_vec()),
                _guard: guard,
            }),
        };
        Ok(SourceImage {
            reader,
            len: self.source.len(),
        })
    }

    fn open_destination(&self, _path: &Path) -> io::Result<Box<dyn SyncWrite + Send>> {
        Ok(Box::new(MemoryWriter {
            device: Arc::clone(&self.device),
            pos: 0,
            fail_at: self.fail_write_at,
            _guard: self.guard(),
        }))
    }

    fn open_readback(&self, _path: &Path) -> io::Result<Box<dyn Read + Send>> {
        let mut contents = self.device_contents();
        if let Some(byte) = self
            .corrupt_readback_at
            .and_then(|offset| contents.get_mut(offset as usize))
        {
            *byte ^= 0xFF;
        }
        Ok(Box::new(Guarded {
            inner: Cursor::new(contents),
            _guard: self.guard(),
        }))
    }

    fn capacity(&self, _path: &Path) -> io::Result<Option<u64>> {
        Ok(self.capacity)
    }
}

struct HandleGuard(Arc<AtomicUsize>);

impl Drop for HandleGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Guarded<T> {
    inner: T,
    _guard: HandleGuard,
}

impl<T: Read> Read for Guarded<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

struct PatternReader {
    pos: u64,
    len: u64,
    _guard: HandleGuard,
}

impl Read for PatternReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min((self.len - self.pos) as usize);
        for (i, byte) in buf[..n].iter_mut().enumerate() {
            *byte = pattern_byte(self.pos + i as u64);
        }
        self.pos += n as u64;
        Ok(n)
    }
}

struct MemoryWriter {
    device: Arc<Mutex<Vec<u8>>>,
    pos: u64,
    fail_at: Option<u64>,
    _guard: HandleGuard,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut n = buf.len();
        if let Some(fail_at) = self.fail_at {
            if self.pos >= fail_at {
                return Err(io::Error::other("simulated write error"));
            }
            n = n.min((fail_at - self.pos) as usize);
        }
        let mut device = self.device.lock().unwrap();
        let start = self.pos as usize;
        let end = start + n;
        if device.len() < end {
            device.resize(end, 0);
        }
        device[start..end].copy_from_slice(&buf[..n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SyncWrite for MemoryWriter {
    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Keeps every event of a run.
#[derive(Default)]
pub struct Recorder {
    pub events: Vec<ProgressEvent>,
    pub logs: Vec<LogEntry>,
}

impl Recorder {
    /// The phases entered, in order.
    pub fn phases(&self) -> Vec<Phase> {
        let mut phases: Vec<Phase> = self.events.iter().map(|e| e.phase).collect();
        phases.dedup();
        phases
    }

    pub fn last_of(&self, phase: Phase) -> Option<ProgressEvent> {
        self.events.iter().rev().find(|e| e.phase == phase).copied()
    }
}

impl PipelineObserver for Recorder {
    fn on_progress(&mut self, event: ProgressEvent) {
        self.events.push(event);
    }

    fn on_log(&mut self, entry: LogEntry) {
        self.logs.push(entry);
    }
}

pub fn source_path() -> PathBuf {
    PathBuf::from(SOURCE)
}

pub fn target_path() -> PathBuf {
    PathBuf::from(TARGET)
}
