//! Files opened inside an archive
//!
//! An [`ArchiveFile`] owns two buffers that are allocated on first use: a
//! name buffer the engine writes the archived path into, and a read buffer
//! sized to the file. Both are released when the file is closed. Data handed
//! to callers is always an owned copy, never a view into these buffers.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::engine::{Engine, MAX_PATH, RawHandle};
use crate::error::{MpqError, Result};
use crate::info::{self, BufferRequest, InfoClass, InfoValue};
use crate::locale::{self, LocaleRef};

/// A file opened inside an archive
///
/// Implements [`Read`] and [`Seek`] for streaming access. The engine keeps
/// one read position per file, shared by every access path.
pub struct ArchiveFile<E: Engine> {
    engine: Arc<E>,
    handle: Option<RawHandle>,
    name_buffer: Option<Box<[u8; MAX_PATH]>>,
    read_buffer: Option<Vec<u8>>,
    position: u64,
}

impl<E: Engine> std::fmt::Debug for ArchiveFile<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveFile")
            .field("handle", &self.handle)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

impl<E: Engine> ArchiveFile<E> {
    /// Wrap a file handle the engine opened
    pub const fn new(engine: Arc<E>, handle: RawHandle) -> Self {
        Self {
            engine,
            handle: Some(handle),
            name_buffer: None,
            read_buffer: None,
            position: 0,
        }
    }

    /// Check if the file is still open
    pub const fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    fn handle(&self, operation: &'static str) -> Result<RawHandle> {
        self.handle.ok_or(MpqError::InvalidHandle { operation })
    }

    /// Archived path of the file
    pub fn name(&mut self) -> Result<String> {
        let handle = self.handle("file name")?;
        let buffer = self
            .name_buffer
            .get_or_insert_with(|| Box::new([0; MAX_PATH]));
        self.engine
            .file_name(handle, buffer)
            .map_err(|code| MpqError::engine("file name", code))?;

        let len = buffer.iter().position(|&b| b == 0).unwrap_or(MAX_PATH);
        Ok(String::from_utf8_lossy(&buffer[..len]).into_owned())
    }

    /// Uncompressed size
    pub fn size(&self) -> Result<u64> {
        let handle = self.handle("file size")?;
        self.engine
            .file_size(handle)
            .map_err(|code| MpqError::engine("file size", code))
    }

    /// Read position last set through this handle
    pub const fn position(&self) -> u64 {
        self.position
    }

    /// Move the read position to an absolute offset
    pub fn set_position(&mut self, position: u64) -> Result<()> {
        let handle = self.handle("set position")?;
        self.position = self
            .engine
            .set_file_pointer(handle, position)
            .map_err(|code| MpqError::engine("set position", code))?;
        Ok(())
    }

    /// Read the whole file from the start
    ///
    /// Leaves the read position at the end of the file. A failed read
    /// releases the read buffer.
    pub fn read(&mut self) -> Result<Bytes> {
        let handle = self.handle("read")?;
        let result = self.fill(handle);
        if result.is_err() {
            self.read_buffer = None;
        }
        result
    }

    fn fill(&mut self, handle: RawHandle) -> Result<Bytes> {
        let size = usize::try_from(self.size()?).map_err(|_| {
            MpqError::engine("read", crate::engine::ErrorCode::NOT_SUPPORTED)
        })?;
        self.set_position(0)?;

        let buffer = self.read_buffer.get_or_insert_with(Vec::new);
        buffer.resize(size, 0);

        let mut filled = 0;
        while filled < size {
            let count = self
                .engine
                .read_file(handle, &mut buffer[filled..])
                .map_err(|code| MpqError::engine("read", code))?;
            if count == 0 {
                break;
            }
            filled += count;
        }
        self.position = filled as u64;

        if filled < size {
            debug!("Short read: {filled} of {size} bytes");
        }
        Ok(Bytes::copy_from_slice(&buffer[..filled]))
    }

    /// Move the file's entry to another locale
    pub fn set_locale<'a>(&mut self, locale: impl Into<LocaleRef<'a>>) -> Result<()> {
        let handle = self.handle("set file locale")?;
        let code = locale::resolve(Some(locale))?;
        self.engine
            .set_file_locale(handle, code)
            .map_err(|code| MpqError::engine("set file locale", code))
    }

    /// Query a file info class
    pub fn get_info(&self, class: InfoClass) -> Result<InfoValue> {
        self.get_info_by_id(class.id())
    }

    /// Query a file info class with a fixed buffer size
    pub fn get_info_sized(&self, class: InfoClass, size: usize) -> Result<InfoValue> {
        let handle = self.handle("get file info")?;
        info::fetch(
            self.engine.as_ref(),
            handle,
            class.id(),
            BufferRequest::explicit(size),
            "get file info",
        )
    }

    /// Query an info class by numeric id
    pub fn get_info_by_id(&self, class: u32) -> Result<InfoValue> {
        let handle = self.handle("get file info")?;
        info::fetch(
            self.engine.as_ref(),
            handle,
            class,
            BufferRequest::initial(),
            "get file info",
        )
    }

    /// Close the file and release its buffers
    ///
    /// Closing a closed file does nothing. If the engine fails to close the
    /// file it stays open and keeps its buffers.
    pub fn close(&mut self) -> Result<()> {
        let Some(handle) = self.handle else {
            return Ok(());
        };
        self.engine
            .close_file(handle)
            .map_err(|code| MpqError::engine("close file", code))?;

        self.handle = None;
        self.name_buffer = None;
        self.read_buffer = None;
        Ok(())
    }
}

impl<E: Engine> Read for ArchiveFile<E> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let handle = self.handle("read").map_err(io::Error::other)?;
        let count = self
            .engine
            .read_file(handle, buf)
            .map_err(|code| io::Error::other(MpqError::engine("read", code)))?;
        self.position += count as u64;
        Ok(count)
    }
}

impl<E: Engine> Seek for ArchiveFile<E> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => self
                .size()
                .map_err(io::Error::other)?
                .checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of file")
        })?;

        self.set_position(target).map_err(io::Error::other)?;
        Ok(self.position)
    }
}

impl<E: Engine> Drop for ArchiveFile<E> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take()
            && let Err(code) = self.engine.close_file(handle)
        {
            warn!("Failed to close file handle {handle} on drop: engine error {code}");
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use tempfile::TempDir;

    fn open_sample(content: &[u8]) -> (TempDir, Arc<MemoryEngine>, ArchiveFile<MemoryEngine>) {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(MemoryEngine::new());
        let archive = engine
            .create_archive(&dir.path().join("file.mpq"), 0, 16)
            .unwrap();
        let source = dir.path().join("source");
        std::fs::write(&source, content).unwrap();
        engine
            .add_file(archive, &source, "data\\sample.txt", 0, 0, 0)
            .unwrap();
        let handle = engine.open_file(archive, "data\\sample.txt", 0).unwrap();
        let file = ArchiveFile::new(Arc::clone(&engine), handle);
        (dir, engine, file)
    }

    #[test]
    fn test_name_and_size() {
        let (_dir, _engine, mut file) = open_sample(b"0123456789");
        assert_eq!(file.name().unwrap(), "data\\sample.txt");
        assert_eq!(file.name().unwrap(), "data\\sample.txt");
        assert_eq!(file.size().unwrap(), 10);
    }

    #[test]
    fn test_read_rewinds_and_copies() {
        let (_dir, _engine, mut file) = open_sample(b"0123456789");
        file.set_position(4).unwrap();
        let first = file.read().unwrap();
        assert_eq!(&first[..], b"0123456789");
        assert_eq!(file.position(), 10);

        let second = file.read().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_stream_access() {
        let (_dir, _engine, mut file) = open_sample(b"0123456789");
        file.seek(SeekFrom::End(-3)).unwrap();
        let mut tail = String::new();
        file.read_to_string(&mut tail).unwrap();
        assert_eq!(tail, "789");

        file.seek(SeekFrom::Start(2)).unwrap();
        file.seek(SeekFrom::Current(1)).unwrap();
        let mut three = [0u8; 3];
        file.read_exact(&mut three).unwrap();
        assert_eq!(&three, b"345");

        assert!(file.seek(SeekFrom::Current(-100)).is_err());
    }

    #[test]
    fn test_close_is_idempotent_and_invalidates() {
        let (_dir, engine, mut file) = open_sample(b"x");
        file.read().unwrap();
        file.close().unwrap();
        file.close().unwrap();
        assert!(!file.is_open());
        assert!(file.read().unwrap_err().is_invalid_handle());
        assert!(file.size().unwrap_err().is_invalid_handle());
        assert!(file.name().unwrap_err().is_invalid_handle());
        assert!(file.get_info(InfoClass::FileSize).unwrap_err().is_invalid_handle());
        assert_eq!(engine.open_handle_count(), 1);
    }

    #[test]
    fn test_failed_read_releases_buffer() {
        let (_dir, engine, mut file) = open_sample(b"0123456789");
        file.read().unwrap();
        assert_eq!(file.read_buffer.as_ref().map(Vec::len), Some(10));

        engine.close_file(file.handle.unwrap()).unwrap();
        let err = file.read().unwrap_err();
        assert_eq!(err.engine_code(), Some(crate::engine::ErrorCode::INVALID_HANDLE));
        assert!(file.read_buffer.is_none());
        assert!(file.is_open());
        file.handle = None;
    }

    #[test]
    fn test_drop_closes_handle() {
        let (_dir, engine, file) = open_sample(b"x");
        assert_eq!(engine.open_handle_count(), 2);
        drop(file);
        assert_eq!(engine.open_handle_count(), 1);
    }
}
