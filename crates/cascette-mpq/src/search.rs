//! Archive enumeration
//!
//! [`search`] drives the engine's find-first/find-next iteration and
//! collects every record. A search that matches nothing is an empty result,
//! not an error. The engine's search handle is released on every exit path
//! by [`FindGuard`].

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::engine::{Engine, ErrorCode, FindRecord, RawHandle};
use crate::error::{MpqError, Result};

/// One archive entry found by a search
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRecord {
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

impl SearchRecord {
    /// File time as a single 64-bit FILETIME value
    pub const fn file_time(&self) -> u64 {
        ((self.file_time_hi as u64) << 32) | self.file_time_lo as u64
    }
}

impl From<FindRecord> for SearchRecord {
    fn from(record: FindRecord) -> Self {
        Self {
            file_name: record.file_name,
            plain_name: record.plain_name,
            hash_index: record.hash_index,
            block_index: record.block_index,
            file_size: record.file_size,
            file_flags: record.file_flags,
            comp_size: record.comp_size,
            file_time_lo: record.file_time_lo,
            file_time_hi: record.file_time_hi,
            locale: record.locale,
        }
    }
}

/// Closes an engine search handle when dropped
pub struct FindGuard<'a, E: Engine + ?Sized> {
    engine: &'a E,
    handle: RawHandle,
}

impl<'a, E: Engine + ?Sized> FindGuard<'a, E> {
    /// Take ownership of a search handle
    pub const fn new(engine: &'a E, handle: RawHandle) -> Self {
        Self { engine, handle }
    }

    /// Fetch the next record, `None` once the engine stops
    pub fn next_record(&self) -> Option<FindRecord> {
        self.engine.find_next(self.handle).ok()
    }
}

impl<E: Engine + ?Sized> Drop for FindGuard<'_, E> {
    fn drop(&mut self) {
        if let Err(code) = self.engine.find_close(self.handle) {
            warn!("Failed to close search handle {}: engine error {}", self.handle, code);
        }
    }
}

/// Enumerate the entries of an archive matching `mask`
///
/// `listfile` names an external listfile that supplies names the archive
/// itself does not record.
pub fn search<E: Engine + ?Sized>(
    engine: &E,
    archive: RawHandle,
    mask: &str,
    listfile: Option<&Path>,
) -> Result<Vec<SearchRecord>> {
    let (handle, first) = match engine.find_first(archive, mask, listfile) {
        Ok(found) => found,
        Err(code) if code == ErrorCode::NO_MORE_FILES => {
            debug!("Search for {mask:?} matched nothing");
            return Ok(Vec::new());
        }
        Err(code) => return Err(MpqError::engine("search", code)),
    };

    let guard = FindGuard::new(engine, handle);
    let mut records = vec![SearchRecord::from(first)];
    while let Some(record) = guard.next_record() {
        records.push(record.into());
    }

    debug!("Search for {:?} found {} entries", mask, records.len());
    Ok(records)
}
