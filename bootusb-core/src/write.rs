//! Contains the logic for streaming an image onto a device.
//!
//! The copy reads the source in fixed-size chunks and writes each chunk in
//! full before reading the next one. After the last chunk the destination is
//! synced, so a successful return means the data is on the device and not
//! just in a page cache.
use crate::error::CopyError;
use crate::image_io::{FileIo, ImageIo, SourceImage, SyncWrite};
use crate::progress::CancelToken;
use std::io::Read;
use std::path::Path;

pub use crate::config::DEFAULT_BUFFER_SIZE;

/// Writes the image at `source` to `dest` using real files.
///
/// `on_progress` receives `(bytes_written, total_bytes)` once before the first
/// chunk and then after every completed chunk. Returns the number of bytes
/// written.
///
/// # Errors
///
/// - [`CopyError::OpenSourceFailed`] / [`CopyError::OpenDestFailed`] if either side cannot be opened.
/// - [`CopyError::ReadFailed`] / [`CopyError::WriteFailed`] for an I/O error mid-stream.
/// - [`CopyError::SyncFailed`] if the final flush fails.
/// - [`CopyError::Cancelled`] if `cancel` was set at a chunk boundary.
pub fn copy<F>(
    source: &Path,
    dest: &Path,
    buffer_size: usize,
    cancel: &CancelToken,
    on_progress: F,
) -> Result<u64, CopyError>
where
    F: FnMut(u64, u64),
{
    copy_with(&FileIo, source, dest, buffer_size, cancel, on_progress)
}

/// Same as [`copy`], opening both sides through `io`.
pub fn copy_with<F>(
    io: &dyn ImageIo,
    source: &Path,
    dest: &Path,
    buffer_size: usize,
    cancel: &CancelToken,
    on_progress: F,
) -> Result<u64, CopyError>
where
    F: FnMut(u64, u64),
{
    if buffer_size == 0 {
        return Err(CopyError::ZeroBufferSize);
    }

    let SourceImage { mut reader, len } =
        io.open_source(source)
            .map_err(|e| CopyError::OpenSourceFailed {
                path: source.to_path_buf(),
                source: e,
            })?;

    let mut device = io
        .open_destination(dest)
        .map_err(|e| CopyError::OpenDestFailed {
            path: dest.to_path_buf(),
            source: e,
        })?;

    tracing::debug!(
        "Copying {} bytes from {} to {} in {} byte chunks",
        len,
        source.display(),
        dest.display(),
        buffer_size
    );

    // Both handles are dropped on return, whatever the outcome.
    copy_stream(&mut *reader, len, &mut *device, buffer_size, cancel, on_progress)
}

/// The chunk loop behind [`copy`]: moves exactly `total` bytes from `reader` to `writer`.
pub fn copy_stream<R, W, F>(
    reader: &mut R,
    total: u64,
    writer: &mut W,
    buffer_size: usize,
    cancel: &CancelToken,
    mut on_progress: F,
) -> Result<u64, CopyError>
where
    R: Read + ?Sized,
    W: SyncWrite + ?Sized,
    F: FnMut(u64, u64),
{
    if buffer_size == 0 {
        return Err(CopyError::ZeroBufferSize);
    }

    let mut buffer = vec![0u8; buffer_size];
    let mut written: u64 = 0;
    on_progress(written, total);

    while written < total {
        if cancel.is_cancelled() {
            return Err(CopyError::Cancelled { offset: written });
        }

        let to_read = std::cmp::min(buffer_size as u64, total - written) as usize;
        reader
            .read_exact(&mut buffer[..to_read])
            .map_err(|source| CopyError::ReadFailed {
                offset: written,
                source,
            })?;

        writer
            .write_all(&buffer[..to_read])
            .map_err(|source| CopyError::WriteFailed {
                offset: written,
                source,
            })?;

        written += to_read as u64;
        on_progress(written, total);
    }

    writer.flush().map_err(|source| CopyError::WriteFailed {
        offset: written,
        source,
    })?;
    writer.sync().map_err(|source| CopyError::SyncFailed { source })?;

    Ok(written)
}
