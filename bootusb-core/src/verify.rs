//! Post-write verification.
//!
//! The source and the destination are read back in lock-step and compared
//! byte for byte. The comparison stops at the first difference.
use crate::error::VerifyError;
use crate::image_io::{FileIo, ImageIo, SourceImage};
use crate::progress::CancelToken;
use std::io::{self, Read};
use std::path::Path;

/// Chunk size for verification, independent of the write buffer.
pub const VERIFY_BUFFER_SIZE: usize = 1024 * 1024; // 1 MiB

/// Result of a completed comparison.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Matched,
    /// The first differing byte.
    Mismatch { offset: u64 },
    /// The destination ended before the source did.
    ShortRead { offset: u64 },
}

impl Verdict {
    pub fn matched(&self) -> bool {
        matches!(self, Verdict::Matched)
    }
}

/// Compares the image at `source` with the start of `dest`.
pub fn verify<F>(
    source: &Path,
    dest: &Path,
    cancel: &CancelToken,
    on_progress: F,
) -> Result<Verdict, VerifyError>
where
    F: FnMut(u64, u64),
{
    verify_with(&FileIo, source, dest, cancel, on_progress)
}

pub fn verify_with<F>(
    io: &dyn ImageIo,
    source: &Path,
    dest: &Path,
    cancel: &CancelToken,
    on_progress: F,
) -> Result<Verdict, VerifyError>
where
    F: FnMut(u64, u64),
{
    let SourceImage { mut reader, len } =
        io.open_source(source)
            .map_err(|e| VerifyError::OpenSourceFailed {
                path: source.to_path_buf(),
                source: e,
            })?;
    let mut device = io
        .open_readback(dest)
        .map_err(|e| VerifyError::OpenDestFailed {
            path: dest.to_path_buf(),
            source: e,
        })?;

    verify_stream(&mut *reader, len, &mut *device, cancel, on_progress)
}

/// Compares the first `total` bytes of `source` and `dest`.
pub fn verify_stream<S, D, F>(
    source: &mut S,
    total: u64,
    dest: &mut D,
    cancel: &CancelToken,
    mut on_progress: F,
) -> Result<Verdict, VerifyError>
where
    S: Read + ?Sized,
    D: Read + ?Sized,
    F: FnMut(u64, u64),
{
    let mut source_buf = vec![0u8; VERIFY_BUFFER_SIZE];
    let mut device_buf = vec![0u8; VERIFY_BUFFER_SIZE];
    let mut verified: u64 = 0;
    on_progress(verified, total);

    while verified < total {
        if cancel.is_cancelled() {
            return Err(VerifyError::Cancelled { offset: verified });
        }

        let chunk = std::cmp::min(VERIFY_BUFFER_SIZE as u64, total - verified) as usize;
        source
            .read_exact(&mut source_buf[..chunk])
            .map_err(|e| VerifyError::ReadFailed {
                side: "source image",
                offset: verified,
                source: e,
            })?;

        let got = read_full(dest, &mut device_buf[..chunk]).map_err(|e| VerifyError::ReadFailed {
            side: "destination",
            offset: verified,
            source: e,
        })?;

        let compared = &source_buf[..got];
        if let Some(pos) = compared
            .iter()
            .zip(&device_buf[..got])
            .position(|(a, b)| a != b)
        {
            return Ok(Verdict::Mismatch {
                offset: verified + pos as u64,
            });
        }
        if got < chunk {
            return Ok(Verdict::ShortRead {
                offset: verified + got as u64,
            });
        }

        verified += chunk as u64;
        on_progress(verified, total);
    }

    Ok(Verdict::Matched)
}

/// Reads until `buf` is full or the reader is exhausted.
fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
