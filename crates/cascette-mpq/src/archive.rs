//! Open archives

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::config::{CreateMode, OpenMode, check_max_files};
use crate::engine::{Engine, ErrorCode, RawHandle, SEARCH_SCOPE_ARCHIVE, SIGNATURE_TYPE_WEAK};
use crate::error::{MpqError, Result};
use crate::file::ArchiveFile;
use crate::flags::{
    self, CodecSelection, CompressionInput, FileFlags, FlagInput, FlagSet, VerifyFlags,
};
use crate::info::{self, BufferRequest, InfoClass, InfoValue};
use crate::locale::{self, LocaleRef};
use crate::search::{self, SearchRecord};
use crate::storm;
use crate::verify;

/// An open archive
///
/// The archive is closed by [`Archive::close`] or, failing that, when it is
/// dropped. Every operation on a closed archive fails with
/// [`MpqError::InvalidHandle`] without reaching the engine.
///
/// Operations that change the archive take `&mut self`; the engine does not
/// serialize calls on one handle.
pub struct Archive<E: Engine> {
    engine: Arc<E>,
    handle: Option<RawHandle>,
    path: PathBuf,
}

impl<E: Engine> std::fmt::Debug for Archive<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archive")
            .field("handle", &self.handle)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl<E: Engine> Archive<E> {
    /// Adopt a handle the engine already opened
    pub fn from_raw(engine: Arc<E>, handle: RawHandle, path: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            handle: Some(handle),
            path: path.into(),
        }
    }

    /// Open an existing archive
    pub fn open(engine: Arc<E>, path: impl AsRef<Path>, mode: OpenMode) -> Result<Self> {
        let path = path.as_ref();
        let handle = engine
            .open_archive(path, 0, mode.bits())
            .map_err(|code| MpqError::engine("open archive", code))?;

        info!("Opened archive {}", path.display());
        Ok(Self::from_raw(engine, handle, path))
    }

    /// Create a new archive
    pub fn create(engine: Arc<E>, path: impl AsRef<Path>, mode: CreateMode) -> Result<Self> {
        let path = path.as_ref();
        let handle = match mode {
            CreateMode::Default => engine.create_archive_with(path, &CreateMode::default_info()),
            CreateMode::Flags { flags, max_files } => {
                check_max_files(max_files)?;
                engine.create_archive(path, flags, max_files)
            }
            CreateMode::Options(options) => {
                engine.create_archive_with(path, &options.to_create_info()?)
            }
        }
        .map_err(|code| MpqError::engine("create archive", code))?;

        info!("Created archive {}", path.display());
        Ok(Self::from_raw(engine, handle, path))
    }

    /// Write `bytes` to `path` and open the result
    pub fn from_bytes(
        engine: Arc<E>,
        bytes: &[u8],
        path: impl AsRef<Path>,
        mode: OpenMode,
    ) -> Result<Self> {
        fs::write(path.as_ref(), bytes)?;
        Self::open(engine, path, mode)
    }

    /// Path the archive was opened from
    pub fn file_path(&self) -> &Path {
        &self.path
    }

    /// Engine handle, `None` once closed
    pub const fn raw_handle(&self) -> Option<RawHandle> {
        self.handle
    }

    /// Check if the archive is still open
    pub const fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    fn handle(&self, operation: &'static str) -> Result<RawHandle> {
        self.handle.ok_or(MpqError::InvalidHandle { operation })
    }

    /// Close the archive, writing pending changes
    ///
    /// Closing a closed archive does nothing. If the engine fails to close
    /// the archive it stays open and the next call tries again.
    pub fn close(&mut self) -> Result<()> {
        let Some(handle) = self.handle else {
            return Ok(());
        };
        self.engine
            .close_archive(handle)
            .map_err(|code| MpqError::engine("close archive", code))?;

        self.handle = None;
        info!("Closed archive {}", self.path.display());
        Ok(())
    }

    /// Check whether a file exists
    pub fn has_file(&self, name: &str) -> Result<bool> {
        let handle = self.handle("has file")?;
        match self.engine.has_file(handle, name) {
            Ok(()) => Ok(true),
            Err(code) if code == ErrorCode::FILE_NOT_FOUND => Ok(false),
            Err(code) => Err(MpqError::engine("has file", code)),
        }
    }

    /// Open a file for reading
    pub fn open_file(&self, name: &str) -> Result<ArchiveFile<E>> {
        let handle = self.handle("open file")?;
        let file = self
            .engine
            .open_file(handle, name, SEARCH_SCOPE_ARCHIVE)
            .map_err(|code| MpqError::engine("open file", code))?;

        debug!("Opened {} in {}", name, self.path.display());
        Ok(ArchiveFile::new(Arc::clone(&self.engine), file))
    }

    /// Read a whole file into an owned buffer
    pub fn read_file(&self, name: &str) -> Result<Bytes> {
        let mut file = self.open_file(name)?;
        let data = file.read()?;
        file.close()?;
        Ok(data)
    }

    /// Read a whole file as UTF-8 text
    pub fn read_file_to_string(&self, name: &str) -> Result<String> {
        let data = self.read_file(name)?;
        Ok(String::from_utf8(data.to_vec())?)
    }

    /// Query an info class of one file
    pub fn get_file_info(&self, name: &str, class: InfoClass) -> Result<InfoValue> {
        let mut file = self.open_file(name)?;
        let value = file.get_info(class)?;
        file.close()?;
        Ok(value)
    }

    /// Layer a patch archive over this one
    pub fn patch(&mut self, path: impl AsRef<Path>, prefix: &str) -> Result<()> {
        let handle = self.handle("patch")?;
        self.engine
            .open_patch_archive(handle, path.as_ref(), prefix, 0)
            .map_err(|code| MpqError::engine("patch", code))?;

        info!(
            "Patched {} with {}",
            self.path.display(),
            path.as_ref().display()
        );
        Ok(())
    }

    /// Check if patches are layered over the archive
    pub fn is_patched(&self) -> Result<bool> {
        let handle = self.handle("is patched")?;
        Ok(self.engine.is_patched_archive(handle))
    }

    /// Enumerate entries matching `mask`
    ///
    /// `listfile` supplies names the archive does not record itself.
    pub fn search(&self, mask: &str, listfile: Option<&Path>) -> Result<Vec<SearchRecord>> {
        let handle = self.handle("search")?;
        search::search(self.engine.as_ref(), handle, mask, listfile)
    }

    /// Rebuild the archive without gaps
    pub fn compact(&mut self, listfile: Option<&Path>) -> Result<()> {
        let handle = self.handle("compact")?;
        self.engine
            .compact_archive(handle, listfile)
            .map_err(|code| MpqError::engine("compact", code))
    }

    /// Merge an external listfile into the archive's name table
    pub fn add_listfile(&mut self, listfile: impl AsRef<Path>) -> Result<()> {
        let handle = self.handle("add listfile")?;
        self.engine
            .add_listfile(handle, listfile.as_ref())
            .map_err(|code| MpqError::engine("add listfile", code))
    }

    /// Add a weak signature
    pub fn sign(&mut self) -> Result<()> {
        let handle = self.handle("sign")?;
        self.engine
            .sign_archive(handle, SIGNATURE_TYPE_WEAK)
            .map_err(|code| MpqError::engine("sign", code))
    }

    /// Write pending changes to disk
    pub fn flush(&mut self) -> Result<()> {
        let handle = self.handle("flush")?;
        self.engine
            .flush_archive(handle)
            .map_err(|code| MpqError::engine("flush", code))
    }

    /// Flush, then read the archive file back from disk
    pub fn to_bytes(&mut self) -> Result<Bytes> {
        self.flush()?;
        Ok(Bytes::from(fs::read(&self.path)?))
    }

    /// Raw signature status
    pub fn verify_status(&self) -> Result<u32> {
        let handle = self.handle("verify")?;
        Ok(self.engine.verify_archive(handle))
    }

    /// Check the archive signature
    ///
    /// An archive without a signature passes.
    pub fn verify(&self) -> Result<()> {
        let status = self.verify_status()?;
        if verify::archive_passed(status) {
            Ok(())
        } else {
            Err(MpqError::ArchiveVerification { status })
        }
    }

    /// Raw status bitmask of a file verification
    ///
    /// `None` runs every check.
    pub fn verify_file_status(
        &self,
        name: &str,
        checks: Option<&FlagInput<VerifyFlags>>,
    ) -> Result<u32> {
        let handle = self.handle("verify file")?;
        let checks = flags::encode(checks)?;
        Ok(self.engine.verify_file(handle, name, checks))
    }

    /// Verify a file, failing if any requested check fails
    pub fn verify_file(&self, name: &str, checks: Option<&FlagInput<VerifyFlags>>) -> Result<()> {
        let status = self.verify_file_status(name, checks)?;
        if verify::file_passed(status) {
            Ok(())
        } else {
            Err(MpqError::FileVerification {
                name: name.to_string(),
                status,
            })
        }
    }

    /// Resize the hash table
    pub fn set_max_files(&mut self, count: u32) -> Result<()> {
        let handle = self.handle("set max files")?;
        check_max_files(count)?;
        self.engine
            .set_max_file_count(handle, count)
            .map_err(|code| MpqError::engine("set max files", code))
    }

    /// Add a host file
    ///
    /// `flags` defaults to compressed and encrypted, replacing an existing
    /// entry of the same name. Named flags
    /// also carry the compression: `compressionHeader` for the first sector
    /// (falling back to `compression`) and `compression` for the rest.
    /// Missing selections use PKWARE.
    pub fn add_file(
        &mut self,
        source: impl AsRef<Path>,
        archived_name: &str,
        flags: Option<&FlagInput<FileFlags>>,
    ) -> Result<()> {
        let (first, next) = match flags {
            Some(FlagInput::Named(named)) => (
                named.header_compression_bits()?,
                named.compression_bits()?,
            ),
            _ => (None, None),
        };
        self.insert(
            source.as_ref(),
            archived_name,
            flags,
            first.unwrap_or(CodecSelection::DEFAULT),
            next.unwrap_or(CodecSelection::DEFAULT),
        )
    }

    /// Add a host file with explicit compression
    ///
    /// `compression_next` defaults to `compression`.
    pub fn add_file_with_compression(
        &mut self,
        source: impl AsRef<Path>,
        archived_name: &str,
        flags: Option<&FlagInput<FileFlags>>,
        compression: &CompressionInput,
        compression_next: Option<&CompressionInput>,
    ) -> Result<()> {
        let first = compression.encode()?;
        let next = compression_next.map_or(Ok(first), FlagInput::encode)?;
        self.insert(source.as_ref(), archived_name, flags, first, next)
    }

    /// Add a file from memory
    ///
    /// The bytes are staged in a temporary file that is removed afterwards,
    /// whether or not the insert succeeds.
    pub fn add_file_from_bytes(
        &mut self,
        archived_name: &str,
        data: &[u8],
        flags: Option<&FlagInput<FileFlags>>,
    ) -> Result<()> {
        let mut staged = tempfile::NamedTempFile::new()?;
        staged.write_all(data)?;
        staged.flush()?;
        self.add_file(staged.path(), archived_name, flags)
    }

    fn insert(
        &mut self,
        source: &Path,
        archived_name: &str,
        flags: Option<&FlagInput<FileFlags>>,
        compression: u32,
        compression_next: u32,
    ) -> Result<()> {
        let handle = self.handle("add file")?;
        let bits = flags::encode(flags)?;
        if bits & FileFlags::IMPLODE != 0 && bits & FileFlags::COMPRESS != 0 {
            return Err(MpqError::InvalidOptionCombination(
                "implode and compress are mutually exclusive".to_string(),
            ));
        }

        self.engine
            .add_file(handle, source, archived_name, bits, compression, compression_next)
            .map_err(|code| MpqError::engine("add file", code))?;

        debug!(
            "Added {} as {} (flags 0x{:08x}, compression 0x{:02x}/0x{:02x})",
            source.display(),
            archived_name,
            bits,
            compression,
            compression_next
        );
        Ok(())
    }

    /// Remove a file
    pub fn remove_file(&mut self, name: &str) -> Result<()> {
        let handle = self.handle("remove file")?;
        self.engine
            .remove_file(handle, name, SEARCH_SCOPE_ARCHIVE)
            .map_err(|code| MpqError::engine("remove file", code))
    }

    /// Rename a file
    pub fn rename_file(&mut self, old_name: &str, new_name: &str) -> Result<()> {
        let handle = self.handle("rename file")?;
        self.engine
            .rename_file(handle, old_name, new_name)
            .map_err(|code| MpqError::engine("rename file", code))
    }

    /// Write a file to the host filesystem
    pub fn extract_file(&self, name: &str, destination: impl AsRef<Path>) -> Result<()> {
        let handle = self.handle("extract file")?;
        self.engine
            .extract_file(handle, name, destination.as_ref(), SEARCH_SCOPE_ARCHIVE)
            .map_err(|code| MpqError::engine("extract file", code))
    }

    /// Query an archive info class
    pub fn get_info(&self, class: InfoClass) -> Result<InfoValue> {
        self.get_info_by_id(class.id())
    }

    /// Query an archive info class with a fixed buffer size
    ///
    /// The buffer is not grown; a too-small size surfaces the engine error.
    pub fn get_info_sized(&self, class: InfoClass, size: usize) -> Result<InfoValue> {
        let handle = self.handle("get info")?;
        info::fetch(
            self.engine.as_ref(),
            handle,
            class.id(),
            BufferRequest::explicit(size),
            "get info",
        )
    }

    /// Query an info class by numeric id
    pub fn get_info_by_id(&self, class: u32) -> Result<InfoValue> {
        let handle = self.handle("get info")?;
        info::fetch(
            self.engine.as_ref(),
            handle,
            class,
            BufferRequest::initial(),
            "get info",
        )
    }

    /// Engine-wide locale, as a culture name
    pub fn locale(&self) -> Result<&'static str> {
        locale::format(Some(self.engine.locale()))
    }

    /// Change the engine-wide locale, returning its canonical name
    pub fn set_locale<'a>(&self, locale: impl Into<LocaleRef<'a>>) -> Result<&'static str> {
        storm::apply_locale(self.engine.as_ref(), locale)
    }
}

impl<E: Engine> Drop for Archive<E> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take()
            && let Err(code) = self.engine.close_archive(handle)
        {
            warn!(
                "Failed to close archive {} on drop: engine error {}",
                self.path.display(),
                code
            );
        }
    }
}
