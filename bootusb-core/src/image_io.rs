//! Opening sources and destinations for the copy and verify engines.
//!
//! The engines never open files themselves; they go through an [`ImageIo`]
//! so the pipeline can be driven against in-memory devices in tests. The real
//! implementation, [`FileIo`], opens the destination for synchronous writes so
//! every completed chunk is on the device before it is reported. Sources are
//! held under a shared `flock` for as long as they are open.
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

#[cfg(unix)]
use nix::errno::Errno;
#[cfg(unix)]
use nix::fcntl::{Flock, FlockArg};
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

#[cfg(target_os = "linux")]
nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// A writer that can be forced to durable storage.
pub trait SyncWrite: Write {
    fn sync(&mut self) -> io::Result<()>;
}

impl SyncWrite for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

/// In-memory buffers are durable as soon as they are written.
impl SyncWrite for Vec<u8> {
    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A source opened for reading, with its size fixed at open time.
pub struct SourceImage {
    pub reader: Box<dyn Read + Send>,
    pub len: u64,
}

pub trait ImageIo: Send + Sync {
    /// Size of the source. Fails unless `path` is a readable regular file.
    fn source_len(&self, path: &Path) -> io::Result<u64>;

    /// Opens the source for reading. No writer may hold it while it is open.
    fn open_source(&self, path: &Path) -> io::Result<SourceImage>;

    fn open_destination(&self, path: &Path) -> io::Result<Box<dyn SyncWrite + Send>>;

    /// Opens the destination again for reading back what was written.
    fn open_readback(&self, path: &Path) -> io::Result<Box<dyn Read + Send>>;

    /// How many bytes the destination can hold, or `None` if it is unbounded.
    fn capacity(&self, path: &Path) -> io::Result<Option<u64>>;
}

/// Real files and block devices.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileIo;

impl ImageIo for FileIo {
    fn source_len(&self, path: &Path) -> io::Result<u64> {
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        // Fail here rather than after formatting if the file is unreadable.
        File::open(path)?;
        Ok(metadata.len())
    }

    fn open_source(&self, path: &Path) -> io::Result<SourceImage> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(SourceImage {
            reader: lock_source(file)?,
            len,
        })
    }

    fn open_destination(&self, path: &Path) -> io::Result<Box<dyn SyncWrite + Send>> {
        let mut options = OpenOptions::new();
        options.write(true);
        #[cfg(unix)]
        options.custom_flags(libc::O_SYNC);
        Ok(Box::new(options.open(path)?))
    }

    fn open_readback(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        let file = File::open(path)?;
        drop_cached_pages(&file);
        Ok(Box::new(file))
    }

    fn capacity(&self, path: &Path) -> io::Result<Option<u64>> {
        let file = File::open(path)?;
        block_device_size(&file)
    }
}

/// A source file under a shared lock, released when the reader is dropped.
#[cfg(unix)]
struct LockedSource(Flock<File>);

#[cfg(unix)]
impl Read for LockedSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

#[cfg(unix)]
fn lock_source(file: File) -> io::Result<Box<dyn Read + Send>> {
    match Flock::lock(file, FlockArg::LockSharedNonblock) {
        Ok(locked) => Ok(Box::new(LockedSource(locked))),
        Err((_, errno)) if errno == Errno::EWOULDBLOCK => Err(io::Error::new(
            io::ErrorKind::WouldBlock,
            "the image is locked for writing by another process",
        )),
        Err((_, errno)) => Err(io::Error::from(errno)),
    }
}

#[cfg(not(unix))]
fn lock_source(file: File) -> io::Result<Box<dyn Read + Send>> {
    Ok(Box::new(file))
}

/// Evicts cached pages of `file` so reads come from the medium. The writer
/// has synced by now, so every cached page is clean and can be dropped.
#[cfg(target_os = "linux")]
fn drop_cached_pages(file: &File) {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the descriptor is valid for the duration of the call.
    let rc = unsafe { libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_DONTNEED) };
    if rc != 0 {
        tracing::debug!(
            "posix_fadvise(DONTNEED) failed: {}",
            io::Error::from_raw_os_error(rc)
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn drop_cached_pages(_file: &File) {}

#[cfg(target_os = "linux")]
fn block_device_size(file: &File) -> io::Result<Option<u64>> {
    use std::os::unix::fs::FileTypeExt;
    use std::os::unix::io::AsRawFd;

    if !file.metadata()?.file_type().is_block_device() {
        return Ok(None);
    }
    let mut size_bytes: u64 = 0;
    // SAFETY: BLKGETSIZE64 writes a single u64 through the pointer we pass.
    unsafe { blkgetsize64(file.as_raw_fd(), &mut size_bytes) }.map_err(io::Error::from)?;
    Ok(Some(size_bytes))
}

#[cfg(not(target_os = "linux"))]
fn block_device_size(_file: &File) -> io::Result<Option<u64>> {
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_len_requires_a_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileIo.source_len(dir.path()).is_err());
        assert!(FileIo.source_len(&dir.path().join("missing.iso")).is_err());

        let path = dir.path().join("image.iso");
        std::fs::write(&path, vec![7u8; 1536]).unwrap();
        assert_eq!(FileIo.source_len(&path).unwrap(), 1536);
    }

    #[test]
    fn regular_file_destinations_are_unbounded() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(FileIo.capacity(file.path()).unwrap(), None);
    }

    #[test]
    fn destination_is_not_truncated_on_open() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[1u8; 64]).unwrap();
        {
            let mut dest = FileIo.open_destination(file.path()).unwrap();
            dest.write_all(&[2u8; 16]).unwrap();
            dest.sync().unwrap();
        }
        let content = std::fs::read(file.path()).unwrap();
        assert_eq!(content.len(), 64);
        assert_eq!(&content[..16], &[2u8; 16]);
        assert_eq!(&content[16..], &[1u8; 48]);
    }

    #[test]
    fn readback_returns_what_was_synced() {
        let file = tempfile::NamedTempFile::new().unwrap();
        {
            let mut dest = FileIo.open_destination(file.path()).unwrap();
            dest.write_all(&[9u8; 8192]).unwrap();
            dest.sync().unwrap();
        }
        let mut back = Vec::new();
        FileIo
            .open_readback(file.path())
            .unwrap()
            .read_to_end(&mut back)
            .unwrap();
        assert_eq!(back, vec![9u8; 8192]);
    }

    #[cfg(unix)]
    fn try_exclusive(path: &Path) -> bool {
        Flock::lock(File::open(path).unwrap(), FlockArg::LockExclusiveNonblock).is_ok()
    }

    #[cfg(unix)]
    #[test]
    fn open_source_holds_a_shared_lock_until_dropped() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), [1u8; 512]).unwrap();

        let source = FileIo.open_source(file.path()).unwrap();
        assert!(!try_exclusive(file.path()));
        // Other readers are still welcome.
        let second = FileIo.open_source(file.path()).unwrap();
        drop(source);
        drop(second);
        assert!(try_exclusive(file.path()));
    }

    #[cfg(unix)]
    #[test]
    fn source_locked_by_a_writer_is_refused() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), [1u8; 512]).unwrap();
        let _writer =
            Flock::lock(File::open(file.path()).unwrap(), FlockArg::LockExclusiveNonblock)
                .unwrap();

        match FileIo.open_source(file.path()) {
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::WouldBlock),
            Ok(_) => panic!("opened a source that a writer holds"),
        }
    }
}
