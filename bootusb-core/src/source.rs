//! Preparation of the source image before a run.
//!
//! ISO images are used as they are. Images compressed with gzip, xz or zstd
//! are decompressed to a temporary file first, because both the write and the
//! verify phase need a seekable source of known size.
use crate::error::SourceError;
use crate::progress::CancelToken;
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempPath};
use xz2::read::XzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Xz,
    Zstd,
}

impl Compression {
    /// Detects compression from the file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        match ext.as_str() {
            "gz" | "gzip" => Some(Compression::Gzip),
            "xz" => Some(Compression::Xz),
            "zst" | "zstd" => Some(Compression::Zstd),
            _ => None,
        }
    }
}

/// The image the pipeline actually reads.
///
/// If the image was decompressed, the temporary file lives as long as this
/// value and is deleted on drop.
#[derive(Debug)]
pub struct PreparedImage {
    path: PathBuf,
    _temp_handle: Option<TempPath>,
}

impl PreparedImage {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_decompressed(&self) -> bool {
        self._temp_handle.is_some()
    }
}

/// Decompresses `input_path` to a temporary file if necessary.
///
/// `on_progress` receives the number of decompressed bytes so far.
pub fn prepare<F>(
    input_path: &Path,
    cancel: &CancelToken,
    mut on_progress: F,
) -> Result<PreparedImage, SourceError>
where
    F: FnMut(u64),
{
    let Some(compression) = Compression::from_path(input_path) else {
        return Ok(PreparedImage {
            path: input_path.to_path_buf(),
            _temp_handle: None,
        });
    };

    let open_err = |source| SourceError::Open {
        path: input_path.to_path_buf(),
        source,
    };
    let decompress_err = |source| SourceError::Decompress {
        path: input_path.to_path_buf(),
        source,
    };

    let input_file = File::open(input_path).map_err(open_err)?;
    let mut reader: Box<dyn Read> = match compression {
        Compression::Gzip => Box::new(GzDecoder::new(BufReader::new(input_file))),
        Compression::Xz => Box::new(XzDecoder::new(BufReader::new(input_file))),
        Compression::Zstd => Box::new(ZstdDecoder::new(input_file).map_err(decompress_err)?),
    };

    tracing::info!("Decompressing {} ({:?})", input_path.display(), compression);

    let mut temp_file = NamedTempFile::new().map_err(decompress_err)?;
    {
        let mut writer = BufWriter::new(&mut temp_file);
        let mut buffer = vec![0u8; 64 * 1024];
        let mut total: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(SourceError::Cancelled);
            }

            let n = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(decompress_err(e)),
            };
            writer.write_all(&buffer[..n]).map_err(decompress_err)?;
            total += n as u64;
            on_progress(total);
        }
        writer.flush().map_err(decompress_err)?;
    }

    // The temp path now owns the file and removes it on drop.
    let temp_path = temp_file.into_temp_path();
    Ok(PreparedImage {
        path: temp_path.to_path_buf(),
        _temp_handle: Some(temp_path),
    })
}
