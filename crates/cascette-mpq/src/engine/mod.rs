//! Boundary to the archive engine
//!
//! The engine owns everything about the container format: table parsing,
//! sector compression, encryption, layout changes. This crate only talks
//! to it through the [`Engine`] trait, a one-to-one rendering of the
//! engine's C function table where every `bool` + last-error pair becomes
//! a `Result<_, ErrorCode>`.
//!
//! Two implementations ship with the crate:
//!
//! - [`MemoryEngine`] keeps archives in process memory and persists them as
//!   JSON documents. Tests and tools that do not need real MPQ files use it.
//! - `StormLibEngine` (feature `stormlib`) binds the trait to the native
//!   library.

pub mod memory;
#[cfg(all(feature = "stormlib", not(windows)))]
pub mod stormlib;

use std::fmt;
use std::num::NonZeroUsize;
use std::path::Path;

pub use memory::MemoryEngine;
#[cfg(all(feature = "stormlib", not(windows)))]
pub use stormlib::StormLibEngine;

/// Result of an engine call
pub type EngineResult<T> = std::result::Result<T, ErrorCode>;

/// Smallest hash table the engine accepts
pub const HASH_TABLE_SIZE_MIN: u32 = 0x0000_0004;

/// Largest hash table the engine accepts
pub const HASH_TABLE_SIZE_MAX: u32 = 0x0008_0000;

/// Longest path the engine writes into a name buffer, including the NUL
pub const MAX_PATH: usize = 260;

/// Search scope: only the archive itself, no patches
pub const SEARCH_SCOPE_ARCHIVE: u32 = 0;

/// Weak (RSA-512) signature, the only type the engine can write
pub const SIGNATURE_TYPE_WEAK: u32 = 0x1;

/// Stream flag: open without write access
pub const STREAM_FLAG_READ_ONLY: u32 = 0x0000_0100;

/// Create flag: write a `(listfile)`
pub const CREATE_LISTFILE: u32 = 0x0010_0000;
/// Create flag: write `(attributes)`
pub const CREATE_ATTRIBUTES: u32 = 0x0020_0000;
/// Create flag: reserve space for a weak signature
pub const CREATE_SIGNATURE: u32 = 0x0040_0000;
/// Create flags: zero-based format version
pub const CREATE_VERSION_MASK: u32 = 0x0F00_0000;

/// Sector size used when none is given
pub const DEFAULT_SECTOR_SIZE: u32 = 0x1000;

/// Opaque engine handle for an archive, file or search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(NonZeroUsize);

impl RawHandle {
    /// Wrap a raw handle value, `None` for the null handle
    pub const fn new(value: usize) -> Option<Self> {
        match NonZeroUsize::new(value) {
            Some(value) => Some(Self(value)),
            None => None,
        }
    }

    /// Raw handle value
    pub const fn get(self) -> usize {
        self.0.get()
    }
}

impl fmt::Display for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Engine error code as reported by the engine's last-error slot
///
/// Codes follow the engine's platform convention: Win32 codes on Windows,
/// errno values plus a private range elsewhere. Only the sentinels this
/// crate special-cases get a name beyond the common ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    /// No error
    pub const SUCCESS: Self = Self(0);
    /// File or archive not found
    pub const FILE_NOT_FOUND: Self = Self(2);

    /// Access denied
    #[cfg(windows)]
    pub const ACCESS_DENIED: Self = Self(5);
    /// Access denied
    #[cfg(not(windows))]
    pub const ACCESS_DENIED: Self = Self(1);

    /// Handle not known to the engine
    #[cfg(windows)]
    pub const INVALID_HANDLE: Self = Self(6);
    /// Handle not known to the engine
    #[cfg(not(windows))]
    pub const INVALID_HANDLE: Self = Self(9);

    /// Bad argument
    #[cfg(windows)]
    pub const INVALID_PARAMETER: Self = Self(87);
    /// Bad argument
    #[cfg(not(windows))]
    pub const INVALID_PARAMETER: Self = Self(22);

    /// Entry already exists
    #[cfg(windows)]
    pub const ALREADY_EXISTS: Self = Self(183);
    /// Entry already exists
    #[cfg(not(windows))]
    pub const ALREADY_EXISTS: Self = Self(17);

    /// Table full
    #[cfg(windows)]
    pub const DISK_FULL: Self = Self(112);
    /// Table full
    #[cfg(not(windows))]
    pub const DISK_FULL: Self = Self(28);

    /// Caller buffer too small, required length reported separately
    #[cfg(windows)]
    pub const INSUFFICIENT_BUFFER: Self = Self(122);
    /// Caller buffer too small, required length reported separately
    #[cfg(all(not(windows), target_os = "macos"))]
    pub const INSUFFICIENT_BUFFER: Self = Self(55);
    /// Caller buffer too small, required length reported separately
    #[cfg(all(not(windows), not(target_os = "macos")))]
    pub const INSUFFICIENT_BUFFER: Self = Self(105);

    /// Operation not supported for this handle
    #[cfg(windows)]
    pub const NOT_SUPPORTED: Self = Self(50);
    /// Operation not supported for this handle
    #[cfg(all(not(windows), target_os = "macos"))]
    pub const NOT_SUPPORTED: Self = Self(45);
    /// Operation not supported for this handle
    #[cfg(all(not(windows), not(target_os = "macos")))]
    pub const NOT_SUPPORTED: Self = Self(95);

    /// Search exhausted
    #[cfg(windows)]
    pub const NO_MORE_FILES: Self = Self(18);
    /// Search exhausted
    #[cfg(not(windows))]
    pub const NO_MORE_FILES: Self = Self(1001);

    /// Read past the end of a file
    #[cfg(windows)]
    pub const HANDLE_EOF: Self = Self(38);
    /// Read past the end of a file
    #[cfg(not(windows))]
    pub const HANDLE_EOF: Self = Self(1002);

    /// Archive data is damaged
    #[cfg(windows)]
    pub const FILE_CORRUPT: Self = Self(1392);
    /// Archive data is damaged
    #[cfg(not(windows))]
    pub const FILE_CORRUPT: Self = Self(1004);

    /// Raw code value
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ErrorCode {
    fn from(code: u32) -> Self {
        Self(code)
    }
}

/// Failed info query: error code plus the length the engine wanted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfoFailure {
    /// Reason for the failure
    pub code: ErrorCode,
    /// Required buffer length, meaningful for [`ErrorCode::INSUFFICIENT_BUFFER`]
    pub required: u32,
}

/// One search result as the engine fills it in
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FindRecord {
    /// Full path inside the archive
    pub file_name: String,
    /// Name without directories
    pub plain_name: String,
    /// Hash table slot
    pub hash_index: u32,
    /// Block table slot
    pub block_index: u32,
    /// Uncompressed size
    pub file_size: u32,
    /// Stored flags
    pub file_flags: u32,
    /// Compressed size
    pub comp_size: u32,
    /// Low word of the file time
    pub file_time_lo: u32,
    /// High word of the file time
    pub file_time_hi: u32,
    /// Locale code
    pub locale: u32,
}

/// Parameters for creating an archive with explicit layout options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateInfo {
    /// Format version, zero-based (0 = version 1)
    pub mpq_version: u32,
    /// Stream flags
    pub stream_flags: u32,
    /// File flags for `(listfile)`
    pub file_flags_listfile: u32,
    /// File flags for `(attributes)`
    pub file_flags_attributes: u32,
    /// File flags for `(signature)`
    pub file_flags_signature: u32,
    /// Attribute flags
    pub attr_flags: u32,
    /// Sector size in bytes
    pub sector_size: u32,
    /// Raw chunk size for MD5 chunks
    pub raw_chunk_size: u32,
    /// Maximum number of files
    pub max_file_count: u32,
}

/// The archive engine's function table
///
/// Handles are opaque; the engine validates them and reports
/// [`ErrorCode::INVALID_HANDLE`] for unknown ones. Calls are synchronous
/// and not assumed to be reentrant: callers serialize access per handle.
pub trait Engine {
    /// Open an existing archive
    fn open_archive(&self, path: &Path, priority: u32, flags: u32) -> EngineResult<RawHandle>;

    /// Create an archive from packed create flags
    fn create_archive(&self, path: &Path, flags: u32, max_file_count: u32)
    -> EngineResult<RawHandle>;

    /// Create an archive from explicit layout options
    fn create_archive_with(&self, path: &Path, info: &CreateInfo) -> EngineResult<RawHandle>;

    /// Close an archive, writing pending changes
    fn close_archive(&self, archive: RawHandle) -> EngineResult<()>;

    /// Write pending changes without closing
    fn flush_archive(&self, archive: RawHandle) -> EngineResult<()>;

    /// Rebuild the archive without gaps
    fn compact_archive(&self, archive: RawHandle, listfile: Option<&Path>) -> EngineResult<()>;

    /// Merge an external listfile into the name table
    fn add_listfile(&self, archive: RawHandle, listfile: &Path) -> EngineResult<()>;

    /// Write a signature of the given type
    fn sign_archive(&self, archive: RawHandle, signature_type: u32) -> EngineResult<()>;

    /// Check the archive signature, returning the engine's status code
    fn verify_archive(&self, archive: RawHandle) -> u32;

    /// Check a file, returning the engine's status bitmask
    fn verify_file(&self, archive: RawHandle, name: &str, flags: u32) -> u32;

    /// Grow or shrink the hash table
    fn set_max_file_count(&self, archive: RawHandle, count: u32) -> EngineResult<()>;

    /// Layer a patch archive over an open archive
    fn open_patch_archive(
        &self,
        archive: RawHandle,
        path: &Path,
        prefix: &str,
        flags: u32,
    ) -> EngineResult<()>;

    /// Check if patches are layered over the archive
    fn is_patched_archive(&self, archive: RawHandle) -> bool;

    /// Check for a file; absence is [`ErrorCode::FILE_NOT_FOUND`]
    fn has_file(&self, archive: RawHandle, name: &str) -> EngineResult<()>;

    /// Open a file inside the archive
    fn open_file(&self, archive: RawHandle, name: &str, search_scope: u32)
    -> EngineResult<RawHandle>;

    /// Close a file
    fn close_file(&self, file: RawHandle) -> EngineResult<()>;

    /// Write the file's archived name into `buffer` as a NUL-terminated string
    fn file_name(&self, file: RawHandle, buffer: &mut [u8; MAX_PATH]) -> EngineResult<()>;

    /// Uncompressed size of a file
    fn file_size(&self, file: RawHandle) -> EngineResult<u64>;

    /// Move the read position to an absolute offset, returning the new position
    fn set_file_pointer(&self, file: RawHandle, position: u64) -> EngineResult<u64>;

    /// Read from the current position, returning the byte count (0 at end of file)
    fn read_file(&self, file: RawHandle, buffer: &mut [u8]) -> EngineResult<usize>;

    /// Change the locale of an open file's entry
    fn set_file_locale(&self, file: RawHandle, locale: u32) -> EngineResult<()>;

    /// Fetch one info class into `buffer`, returning the used length
    fn get_info(
        &self,
        handle: RawHandle,
        class: u32,
        buffer: &mut [u8],
    ) -> std::result::Result<u32, InfoFailure>;

    /// Start a search; an empty result is [`ErrorCode::NO_MORE_FILES`]
    fn find_first(
        &self,
        archive: RawHandle,
        mask: &str,
        listfile: Option<&Path>,
    ) -> EngineResult<(RawHandle, FindRecord)>;

    /// Continue a search; any error ends it
    fn find_next(&self, search: RawHandle) -> EngineResult<FindRecord>;

    /// Release a search handle
    fn find_close(&self, search: RawHandle) -> EngineResult<()>;

    /// Insert a host file
    fn add_file(
        &self,
        archive: RawHandle,
        source: &Path,
        archived_name: &str,
        flags: u32,
        compression: u32,
        compression_next: u32,
    ) -> EngineResult<()>;

    /// Remove a file
    fn remove_file(&self, archive: RawHandle, name: &str, search_scope: u32) -> EngineResult<()>;

    /// Rename a file
    fn rename_file(&self, archive: RawHandle, old_name: &str, new_name: &str) -> EngineResult<()>;

    /// Write a file to the host filesystem
    fn extract_file(
        &self,
        archive: RawHandle,
        name: &str,
        destination: &Path,
        search_scope: u32,
    ) -> EngineResult<()>;

    /// Locale used for subsequent opens and inserts
    fn locale(&self) -> u32;

    /// Set the locale used for subsequent opens and inserts, returning it
    fn set_locale(&self, locale: u32) -> u32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_handle_rejects_null() {
        assert!(RawHandle::new(0).is_none());
        assert_eq!(RawHandle::new(7).map(RawHandle::get), Some(7));
    }

    #[test]
    fn test_sentinels_are_distinct() {
        let sentinels = [
            ErrorCode::FILE_NOT_FOUND,
            ErrorCode::INSUFFICIENT_BUFFER,
            ErrorCode::NO_MORE_FILES,
            ErrorCode::INVALID_HANDLE,
        ];
        for (i, a) in sentinels.iter().enumerate() {
            for b in &sentinels[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
