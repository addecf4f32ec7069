//! In-process engine backed by JSON archive images
//!
//! Archives live in memory while open and are written to their path as a
//! JSON document on flush and close. The image keeps the pieces the info
//! and verify queries need (hash slots, block order, MD5 digests) so the
//! typed layer above sees the same shapes it would get from the native
//! library. Names compare case-insensitively with `/` and `\` treated alike.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use binrw::{BinResult, BinWrite, BinWriterExt};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    CREATE_ATTRIBUTES, CREATE_VERSION_MASK, CreateInfo, DEFAULT_SECTOR_SIZE, Engine,
    EngineResult, ErrorCode, FindRecord, HASH_TABLE_SIZE_MAX, HASH_TABLE_SIZE_MIN, InfoFailure,
    MAX_PATH, RawHandle, SIGNATURE_TYPE_WEAK, STREAM_FLAG_READ_ONLY,
};
use crate::flags::{AttributeFlags, EntryFlags, FileFlags, VerifyFlags};
use crate::info::InfoClass;
use crate::verify::{
    ARCHIVE_NO_SIGNATURE, ARCHIVE_VERIFY_FAILED, ARCHIVE_WEAK_SIGNATURE_ERROR,
    ARCHIVE_WEAK_SIGNATURE_OK, VERIFY_FILE_CHECKSUM_ERROR, VERIFY_FILE_HAS_CHECKSUM,
    VERIFY_FILE_HAS_MD5, VERIFY_FILE_HAS_RAW_MD5, VERIFY_FILE_HAS_SECTOR_CRC,
    VERIFY_FILE_MD5_ERROR, VERIFY_FILE_RAW_MD5_ERROR, VERIFY_FILE_SECTOR_CRC_ERROR,
    VERIFY_OPEN_ERROR,
};

/// Size of one hash or block table entry on disk
const TABLE_ENTRY_SIZE: u64 = 16;

/// Archive flag: opened without write access
const ARCHIVE_FLAG_READ_ONLY: u32 = 0x1;
/// Archive flag: unsaved changes
const ARCHIVE_FLAG_CHANGED: u32 = 0x2;

/// 100ns intervals between 1601-01-01 and 1970-01-01
const FILETIME_UNIX_EPOCH: u64 = 116_444_736_000_000_000;

/// Hash table entry as laid out in an archive
#[derive(Debug, Clone, Copy, BinWrite)]
#[bw(little)]
struct HashTableEntry {
    name1: u32,
    name2: u32,
    locale: u16,
    platform: u16,
    block_index: u32,
}

impl HashTableEntry {
    const EMPTY: Self = Self {
        name1: u32::MAX,
        name2: u32::MAX,
        locale: u16::MAX,
        platform: u16::MAX,
        block_index: u32::MAX,
    };
}

/// Block table entry as laid out in an archive
#[derive(Debug, Clone, Copy, BinWrite)]
#[bw(little)]
struct BlockTableEntry {
    offset: u32,
    compressed_size: u32,
    file_size: u32,
    flags: u32,
}

/// One archived file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredEntry {
    name: String,
    locale: u32,
    flags: u32,
    compression: u32,
    compression_next: u32,
    file_time: u64,
    hash_index: u32,
    md5: [u8; 16],
    data: Vec<u8>,
}

impl StoredEntry {
    fn size(&self) -> u32 {
        u32::try_from(self.data.len()).unwrap_or(u32::MAX)
    }
}

/// Persisted archive contents
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArchiveImage {
    format_version: u32,
    sector_size: u32,
    raw_chunk_size: u32,
    attr_flags: u32,
    max_file_count: u32,
    hash_table_size: u32,
    signature: Option<[u8; 16]>,
    entries: Vec<StoredEntry>,
}

/// Uppercase name with `\` separators, the form names are hashed in
fn name_key(name: &str) -> String {
    name.chars()
        .map(|c| if c == '/' { '\\' } else { c.to_ascii_uppercase() })
        .collect()
}

/// Four hash words of a name
fn name_hashes(name: &str) -> [u32; 4] {
    let digest = md5::compute(name_key(name).as_bytes()).0;
    let mut words = [0u32; 4];
    for (word, chunk) in words.iter_mut().zip(digest.chunks_exact(4)) {
        *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    words
}

fn hash_table_size_for(max_file_count: u32) -> u32 {
    max_file_count
        .next_power_of_two()
        .clamp(HASH_TABLE_SIZE_MIN, HASH_TABLE_SIZE_MAX)
}

fn now_filetime() -> u64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let intervals =
        since_epoch.as_secs() * 10_000_000 + u64::from(since_epoch.subsec_nanos() / 100);
    intervals + FILETIME_UNIX_EPOCH
}

impl ArchiveImage {
    fn new(
        format_version: u32,
        sector_size: u32,
        raw_chunk_size: u32,
        attr_flags: u32,
        max_file_count: u32,
    ) -> Self {
        Self {
            format_version,
            sector_size,
            raw_chunk_size,
            attr_flags,
            max_file_count,
            hash_table_size: hash_table_size_for(max_file_count),
            signature: None,
            entries: Vec::new(),
        }
    }

    const fn header_size(&self) -> u32 {
        match self.format_version {
            0 => 0x20,
            1 => 0x2C,
            2 => 0x44,
            _ => 0xD0,
        }
    }

    fn find_exact(&self, name: &str, locale: u32) -> Option<usize> {
        let key = name_key(name);
        self.entries
            .iter()
            .position(|entry| entry.locale == locale && name_key(&entry.name) == key)
    }

    /// Entry for `name`, preferring `locale`, then neutral, then any locale
    fn find(&self, name: &str, locale: u32) -> Option<usize> {
        let key = name_key(name);
        self.find_exact(name, locale)
            .or_else(|| self.find_exact(name, 0))
            .or_else(|| {
                self.entries
                    .iter()
                    .position(|entry| name_key(&entry.name) == key)
            })
    }

    fn free_slot(&self, name: &str) -> Option<u32> {
        let occupied: HashSet<u32> = self.entries.iter().map(|entry| entry.hash_index).collect();
        let start = name_hashes(name)[0] % self.hash_table_size;
        (0..self.hash_table_size)
            .map(|step| (start + step) % self.hash_table_size)
            .find(|slot| !occupied.contains(slot))
    }

    /// Reassign hash slots after the table size changed
    fn rehash(&mut self) {
        let entries = std::mem::take(&mut self.entries);
        for mut entry in entries {
            entry.hash_index = self.free_slot(&entry.name).unwrap_or(0);
            self.entries.push(entry);
        }
    }

    fn byte_offset(&self, index: usize) -> u64 {
        u64::from(self.header_size())
            + self.entries[..index]
                .iter()
                .map(|entry| u64::from(entry.size()))
                .sum::<u64>()
    }

    fn hash_table_offset(&self) -> u64 {
        self.byte_offset(self.entries.len())
    }

    fn block_table_offset(&self) -> u64 {
        self.hash_table_offset() + u64::from(self.hash_table_size) * TABLE_ENTRY_SIZE
    }

    fn block_table_bytes_len(&self) -> u64 {
        self.entries.len() as u64 * TABLE_ENTRY_SIZE
    }

    fn archive_size(&self) -> u64 {
        self.block_table_offset() + self.block_table_bytes_len()
    }

    fn hash_table_bytes(&self) -> BinResult<Vec<u8>> {
        let mut table = vec![HashTableEntry::EMPTY; self.hash_table_size as usize];
        for (block_index, entry) in self.entries.iter().enumerate() {
            let hashes = name_hashes(&entry.name);
            if let Some(slot) = table.get_mut(entry.hash_index as usize) {
                *slot = HashTableEntry {
                    name1: hashes[1],
                    name2: hashes[2],
                    locale: u16::try_from(entry.locale).unwrap_or(u16::MAX),
                    platform: 0,
                    block_index: u32::try_from(block_index).unwrap_or(u32::MAX),
                };
            }
        }

        let mut cursor = Cursor::new(Vec::with_capacity(table.len() * 16));
        for slot in &table {
            cursor.write_le(slot)?;
        }
        Ok(cursor.into_inner())
    }

    fn block_table_bytes(&self) -> BinResult<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::with_capacity(self.entries.len() * 16));
        for (index, entry) in self.entries.iter().enumerate() {
            BlockTableEntry {
                offset: u32::try_from(self.byte_offset(index)).unwrap_or(u32::MAX),
                compressed_size: entry.size(),
                file_size: entry.size(),
                flags: entry.flags,
            }
            .write_le(&mut cursor)?;
        }
        Ok(cursor.into_inner())
    }

    /// Digest over every name and payload in block order
    fn content_digest(&self) -> [u8; 16] {
        let mut content = Vec::new();
        for entry in &self.entries {
            content.extend_from_slice(name_key(&entry.name).as_bytes());
            content.extend_from_slice(&entry.data);
        }
        md5::compute(&content).0
    }
}

fn io_code(err: &io::Error) -> ErrorCode {
    match err.kind() {
        io::ErrorKind::NotFound => ErrorCode::FILE_NOT_FOUND,
        io::ErrorKind::PermissionDenied => ErrorCode::ACCESS_DENIED,
        io::ErrorKind::AlreadyExists => ErrorCode::ALREADY_EXISTS,
        _ => err
            .raw_os_error()
            .and_then(|code| u32::try_from(code).ok())
            .map_or(ErrorCode::ACCESS_DENIED, ErrorCode),
    }
}

fn load_image(path: &Path) -> EngineResult<ArchiveImage> {
    let raw = fs::read(path).map_err(|err| io_code(&err))?;
    serde_json::from_slice(&raw).map_err(|err| {
        warn!("Archive image {} is damaged: {}", path.display(), err);
        ErrorCode::FILE_CORRUPT
    })
}

fn store_image(path: &Path, image: &ArchiveImage) -> EngineResult<()> {
    let raw = serde_json::to_vec(image).map_err(|_| ErrorCode::FILE_CORRUPT)?;
    fs::write(path, raw).map_err(|err| io_code(&err))
}

/// Match `name` against a mask with `*` and `?` wildcards
fn wildcard_match(mask: &str, name: &str) -> bool {
    let mask: Vec<char> = name_key(mask).chars().collect();
    let name: Vec<char> = name_key(name).chars().collect();

    let (mut m, mut n) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while n < name.len() {
        match mask.get(m) {
            Some('*') => {
                backtrack = Some((m, n));
                m += 1;
            }
            Some(&c) if c == '?' || c == name[n] => {
                m += 1;
                n += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    m = star + 1;
                    n = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }
    mask[m..].iter().all(|&c| c == '*')
}

fn plain_name(name: &str) -> &str {
    name.rsplit(['\\', '/']).next().unwrap_or(name)
}

fn word(value: u32) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

fn pair(value: u64) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

fn truncate_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

struct OpenArchive {
    path: PathBuf,
    image: ArchiveImage,
    stream_flags: u32,
    dirty: bool,
    patches: Vec<ArchiveImage>,
}

impl OpenArchive {
    const fn read_only(&self) -> bool {
        self.stream_flags & STREAM_FLAG_READ_ONLY != 0
    }

    const fn writable(&self) -> EngineResult<()> {
        if self.read_only() {
            Err(ErrorCode::ACCESS_DENIED)
        } else {
            Ok(())
        }
    }

    fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.read_only() {
            flags |= ARCHIVE_FLAG_READ_ONLY;
        }
        if self.dirty {
            flags |= ARCHIVE_FLAG_CHANGED;
        }
        flags
    }

    fn flush(&mut self) -> EngineResult<()> {
        if self.dirty && !self.read_only() {
            store_image(&self.path, &self.image)?;
            self.dirty = false;
            debug!("Wrote archive image {}", self.path.display());
        }
        Ok(())
    }

    /// Patches newest first, then the base archive
    fn lookup(&self, name: &str, locale: u32) -> Option<(&ArchiveImage, usize)> {
        self.patches
            .iter()
            .rev()
            .chain(std::iter::once(&self.image))
            .find_map(|image| image.find(name, locale).map(|index| (image, index)))
    }

    fn info(&self, class: InfoClass) -> EngineResult<Vec<u8>> {
        let image = &self.image;
        let entry_count = u32::try_from(image.entries.len()).unwrap_or(u32::MAX);
        Ok(match class {
            InfoClass::FileName => {
                let mut name = self.path.to_string_lossy().into_owned().into_bytes();
                name.push(0);
                name
            }
            InfoClass::HeaderOffset => pair(0),
            InfoClass::HeaderSize => word(image.header_size()),
            InfoClass::HashTableOffset => pair(image.hash_table_offset()),
            InfoClass::HashTableSize64 => {
                pair(u64::from(image.hash_table_size) * TABLE_ENTRY_SIZE)
            }
            InfoClass::HashTableSize => word(image.hash_table_size),
            InfoClass::HashTable => image
                .hash_table_bytes()
                .map_err(|_| ErrorCode::FILE_CORRUPT)?,
            InfoClass::BlockTableOffset => pair(image.block_table_offset()),
            InfoClass::BlockTableSize64 => pair(image.block_table_bytes_len()),
            InfoClass::BlockTableSize => word(entry_count),
            InfoClass::BlockTable => image
                .block_table_bytes()
                .map_err(|_| ErrorCode::FILE_CORRUPT)?,
            InfoClass::Signatures => word(u32::from(image.signature.is_some())),
            InfoClass::ArchiveSize64 => pair(image.archive_size()),
            InfoClass::ArchiveSize => word(truncate_u32(image.archive_size())),
            InfoClass::MaxFileCount => word(image.max_file_count),
            InfoClass::FileTableSize | InfoClass::NumberOfFiles => word(entry_count),
            InfoClass::SectorSize => word(image.sector_size),
            InfoClass::RawChunkSize => word(image.raw_chunk_size),
            InfoClass::StreamFlags => word(self.stream_flags),
            InfoClass::ArchiveFlags => word(self.flags()),
            _ => return Err(ErrorCode::INVALID_PARAMETER),
        })
    }
}

struct OpenFile {
    archive: usize,
    name: String,
    locale: u32,
    flags: u32,
    file_time: u64,
    hash_index: u32,
    block_index: u32,
    byte_offset: u64,
    data: Bytes,
    position: u64,
}

impl OpenFile {
    fn info(&self, class: InfoClass) -> EngineResult<Vec<u8>> {
        let hashes = name_hashes(&self.name);
        let size = u32::try_from(self.data.len()).unwrap_or(u32::MAX);
        Ok(match class {
            InfoClass::HashIndex => word(self.hash_index),
            InfoClass::NameHash1 => word(hashes[1]),
            InfoClass::NameHash2 => word(hashes[2]),
            InfoClass::NameHash3 => pair((u64::from(hashes[3]) << 32) | u64::from(hashes[2])),
            InfoClass::Locale => word(self.locale),
            InfoClass::FileIndex => word(self.block_index),
            InfoClass::ByteOffset => pair(self.byte_offset),
            InfoClass::FileTime => pair(self.file_time),
            InfoClass::FileSize | InfoClass::CompressedSize => word(size),
            InfoClass::FileFlags => word(self.flags),
            _ => return Err(ErrorCode::INVALID_PARAMETER),
        })
    }
}

enum Slot {
    Archive(OpenArchive),
    File(OpenFile),
    Search(std::vec::IntoIter<FindRecord>),
}

struct State {
    next_handle: usize,
    handles: HashMap<usize, Slot>,
    locale: u32,
}

impl State {
    fn insert(&mut self, slot: Slot) -> RawHandle {
        let value = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(value, slot);
        RawHandle::new(value).unwrap_or_else(|| unreachable!("handle counter starts at 1"))
    }

    fn archive(&self, handle: RawHandle) -> EngineResult<&OpenArchive> {
        match self.handles.get(&handle.get()) {
            Some(Slot::Archive(archive)) => Ok(archive),
            _ => Err(ErrorCode::INVALID_HANDLE),
        }
    }

    fn archive_mut(&mut self, handle: RawHandle) -> EngineResult<&mut OpenArchive> {
        self.archive_by_id_mut(handle.get())
    }

    fn archive_by_id_mut(&mut self, id: usize) -> EngineResult<&mut OpenArchive> {
        match self.handles.get_mut(&id) {
            Some(Slot::Archive(archive)) => Ok(archive),
            _ => Err(ErrorCode::INVALID_HANDLE),
        }
    }

    fn file(&self, handle: RawHandle) -> EngineResult<&OpenFile> {
        match self.handles.get(&handle.get()) {
            Some(Slot::File(file)) => Ok(file),
            _ => Err(ErrorCode::INVALID_HANDLE),
        }
    }

    fn file_mut(&mut self, handle: RawHandle) -> EngineResult<&mut OpenFile> {
        match self.handles.get_mut(&handle.get()) {
            Some(Slot::File(file)) => Ok(file),
            _ => Err(ErrorCode::INVALID_HANDLE),
        }
    }
}

/// Engine that keeps archives in memory and persists them as JSON
pub struct MemoryEngine {
    state: Mutex<State>,
}

impl MemoryEngine {
    /// Create an engine with no open handles and the neutral locale
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_handle: 1,
                handles: HashMap::new(),
                locale: 0,
            }),
        }
    }

    /// Number of archive, file and search handles currently open
    pub fn open_handle_count(&self) -> usize {
        self.state.lock().handles.len()
    }

    fn create(
        &self,
        path: &Path,
        image: ArchiveImage,
        stream_flags: u32,
    ) -> EngineResult<RawHandle> {
        if !(HASH_TABLE_SIZE_MIN..=HASH_TABLE_SIZE_MAX).contains(&image.max_file_count) {
            return Err(ErrorCode::INVALID_PARAMETER);
        }
        if path.exists() {
            return Err(ErrorCode::ALREADY_EXISTS);
        }
        store_image(path, &image)?;

        info!(
            "Created archive {} (version {}, max {} files)",
            path.display(),
            image.format_version + 1,
            image.max_file_count
        );
        Ok(self.state.lock().insert(Slot::Archive(OpenArchive {
            path: path.to_path_buf(),
            image,
            stream_flags,
            dirty: false,
            patches: Vec::new(),
        })))
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("open_handles", &self.open_handle_count())
            .finish()
    }
}

impl Engine for MemoryEngine {
    fn open_archive(&self, path: &Path, _priority: u32, flags: u32) -> EngineResult<RawHandle> {
        let image = load_image(path)?;
        debug!(
            "Opened archive {} with {} entries",
            path.display(),
            image.entries.len()
        );
        Ok(self.state.lock().insert(Slot::Archive(OpenArchive {
            path: path.to_path_buf(),
            image,
            stream_flags: flags,
            dirty: false,
            patches: Vec::new(),
        })))
    }

    fn create_archive(
        &self,
        path: &Path,
        flags: u32,
        max_file_count: u32,
    ) -> EngineResult<RawHandle> {
        let version = (flags & CREATE_VERSION_MASK) >> 24;
        let attr_flags = if flags & CREATE_ATTRIBUTES == 0 {
            0
        } else {
            AttributeFlags::CRC32 | AttributeFlags::FILETIME | AttributeFlags::MD5
        };
        let image = ArchiveImage::new(version, DEFAULT_SECTOR_SIZE, 0, attr_flags, max_file_count);
        self.create(path, image, flags & 0xFFFF)
    }

    fn create_archive_with(&self, path: &Path, info: &CreateInfo) -> EngineResult<RawHandle> {
        let image = ArchiveImage::new(
            info.mpq_version,
            info.sector_size,
            info.raw_chunk_size,
            info.attr_flags,
            info.max_file_count,
        );
        self.create(path, image, info.stream_flags)
    }

    fn close_archive(&self, archive: RawHandle) -> EngineResult<()> {
        let mut state = self.state.lock();
        // a failed flush keeps the handle so the close can be retried
        state.archive_mut(archive)?.flush()?;
        state.handles.remove(&archive.get());
        Ok(())
    }

    fn flush_archive(&self, archive: RawHandle) -> EngineResult<()> {
        self.state.lock().archive_mut(archive)?.flush()
    }

    fn compact_archive(&self, archive: RawHandle, listfile: Option<&Path>) -> EngineResult<()> {
        if let Some(listfile) = listfile {
            fs::metadata(listfile).map_err(|err| io_code(&err))?;
        }
        let mut state = self.state.lock();
        let open = state.archive_mut(archive)?;
        open.writable()?;
        open.image.rehash();
        open.dirty = true;
        Ok(())
    }

    fn add_listfile(&self, archive: RawHandle, listfile: &Path) -> EngineResult<()> {
        let names = fs::read_to_string(listfile).map_err(|err| io_code(&err))?;
        let state = self.state.lock();
        let open = state.archive(archive)?;
        let known = names
            .lines()
            .filter(|name| open.image.find(name.trim(), 0).is_some())
            .count();
        debug!("Listfile {} names {} known entries", listfile.display(), known);
        Ok(())
    }

    fn sign_archive(&self, archive: RawHandle, signature_type: u32) -> EngineResult<()> {
        let mut state = self.state.lock();
        let open = state.archive_mut(archive)?;
        if signature_type != SIGNATURE_TYPE_WEAK {
            return Err(ErrorCode::NOT_SUPPORTED);
        }
        open.writable()?;
        open.image.signature = Some(open.image.content_digest());
        open.dirty = true;
        Ok(())
    }

    fn verify_archive(&self, archive: RawHandle) -> u32 {
        let state = self.state.lock();
        let Ok(open) = state.archive(archive) else {
            return ARCHIVE_VERIFY_FAILED;
        };
        match open.image.signature {
            None => ARCHIVE_NO_SIGNATURE,
            Some(signature) if signature == open.image.content_digest() => {
                ARCHIVE_WEAK_SIGNATURE_OK
            }
            Some(_) => ARCHIVE_WEAK_SIGNATURE_ERROR,
        }
    }

    fn verify_file(&self, archive: RawHandle, name: &str, flags: u32) -> u32 {
        let state = self.state.lock();
        let Ok(open) = state.archive(archive) else {
            return VERIFY_OPEN_ERROR;
        };
        let Some((image, index)) = open.lookup(name, state.locale) else {
            return VERIFY_OPEN_ERROR;
        };
        let entry = &image.entries[index];
        let intact = md5::compute(&entry.data).0 == entry.md5;

        let mut status = 0;
        let mut check = |wanted: bool, present: u32, failed: u32| {
            if wanted {
                status |= present;
                if !intact {
                    status |= failed;
                }
            }
        };
        check(
            flags & VerifyFlags::SECTOR_CRC != 0 && entry.flags & FileFlags::SECTOR_CRC != 0,
            VERIFY_FILE_HAS_SECTOR_CRC,
            VERIFY_FILE_SECTOR_CRC_ERROR,
        );
        check(
            flags & VerifyFlags::FILE_CRC != 0 && image.attr_flags & AttributeFlags::CRC32 != 0,
            VERIFY_FILE_HAS_CHECKSUM,
            VERIFY_FILE_CHECKSUM_ERROR,
        );
        check(
            flags & VerifyFlags::FILE_MD5 != 0 && image.attr_flags & AttributeFlags::MD5 != 0,
            VERIFY_FILE_HAS_MD5,
            VERIFY_FILE_MD5_ERROR,
        );
        check(
            flags & VerifyFlags::RAW_MD5 != 0 && image.raw_chunk_size != 0,
            VERIFY_FILE_HAS_RAW_MD5,
            VERIFY_FILE_RAW_MD5_ERROR,
        );
        status
    }

    fn set_max_file_count(&self, archive: RawHandle, count: u32) -> EngineResult<()> {
        let mut state = self.state.lock();
        let open = state.archive_mut(archive)?;
        open.writable()?;
        if !(HASH_TABLE_SIZE_MIN..=HASH_TABLE_SIZE_MAX).contains(&count) {
            return Err(ErrorCode::INVALID_PARAMETER);
        }
        if (count as usize) < open.image.entries.len() {
            return Err(ErrorCode::DISK_FULL);
        }
        open.image.max_file_count = count;
        open.image.hash_table_size = hash_table_size_for(count);
        open.image.rehash();
        open.dirty = true;
        Ok(())
    }

    fn open_patch_archive(
        &self,
        archive: RawHandle,
        path: &Path,
        prefix: &str,
        _flags: u32,
    ) -> EngineResult<()> {
        let patch = load_image(path)?;
        let mut state = self.state.lock();
        let open = state.archive_mut(archive)?;
        debug!(
            "Layered patch {} (prefix {:?}) over {}",
            path.display(),
            prefix,
            open.path.display()
        );
        open.patches.push(patch);
        Ok(())
    }

    fn is_patched_archive(&self, archive: RawHandle) -> bool {
        self.state
            .lock()
            .archive(archive)
            .is_ok_and(|open| !open.patches.is_empty())
    }

    fn has_file(&self, archive: RawHandle, name: &str) -> EngineResult<()> {
        let state = self.state.lock();
        state
            .archive(archive)?
            .lookup(name, state.locale)
            .map(|_| ())
            .ok_or(ErrorCode::FILE_NOT_FOUND)
    }

    fn open_file(
        &self,
        archive: RawHandle,
        name: &str,
        _search_scope: u32,
    ) -> EngineResult<RawHandle> {
        let mut state = self.state.lock();
        let open = state.archive(archive)?;
        let (image, index) = open
            .lookup(name, state.locale)
            .ok_or(ErrorCode::FILE_NOT_FOUND)?;
        let entry = &image.entries[index];
        let file = OpenFile {
            archive: archive.get(),
            name: entry.name.clone(),
            locale: entry.locale,
            flags: entry.flags,
            file_time: entry.file_time,
            hash_index: entry.hash_index,
            block_index: u32::try_from(index).unwrap_or(u32::MAX),
            byte_offset: image.byte_offset(index),
            data: Bytes::from(entry.data.clone()),
            position: 0,
        };
        Ok(state.insert(Slot::File(file)))
    }

    fn close_file(&self, file: RawHandle) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.file(file)?;
        state.handles.remove(&file.get());
        Ok(())
    }

    fn file_name(&self, file: RawHandle, buffer: &mut [u8; MAX_PATH]) -> EngineResult<()> {
        let state = self.state.lock();
        let name = state.file(file)?.name.as_bytes();
        let len = name.len().min(MAX_PATH - 1);
        buffer[..len].copy_from_slice(&name[..len]);
        buffer[len] = 0;
        Ok(())
    }

    fn file_size(&self, file: RawHandle) -> EngineResult<u64> {
        Ok(self.state.lock().file(file)?.data.len() as u64)
    }

    fn set_file_pointer(&self, file: RawHandle, position: u64) -> EngineResult<u64> {
        let mut state = self.state.lock();
        let open = state.file_mut(file)?;
        open.position = position;
        Ok(position)
    }

    fn read_file(&self, file: RawHandle, buffer: &mut [u8]) -> EngineResult<usize> {
        let mut state = self.state.lock();
        let open = state.file_mut(file)?;
        let start = usize::try_from(open.position)
            .unwrap_or(usize::MAX)
            .min(open.data.len());
        let count = (open.data.len() - start).min(buffer.len());
        buffer[..count].copy_from_slice(&open.data[start..start + count]);
        open.position += count as u64;
        Ok(count)
    }

    fn set_file_locale(&self, file: RawHandle, locale: u32) -> EngineResult<()> {
        let mut state = self.state.lock();
        let (archive_id, name, old_locale) = {
            let open = state.file(file)?;
            (open.archive, open.name.clone(), open.locale)
        };

        let archive = state.archive_by_id_mut(archive_id)?;
        archive.writable()?;
        if archive.image.find_exact(&name, locale).is_some() {
            return Err(ErrorCode::ALREADY_EXISTS);
        }
        let index = archive
            .image
            .find_exact(&name, old_locale)
            .ok_or(ErrorCode::FILE_NOT_FOUND)?;
        archive.image.entries[index].locale = locale;
        archive.dirty = true;

        state.file_mut(file)?.locale = locale;
        Ok(())
    }

    fn get_info(
        &self,
        handle: RawHandle,
        class: u32,
        buffer: &mut [u8],
    ) -> Result<u32, InfoFailure> {
        let fail = |code| InfoFailure { code, required: 0 };
        let state = self.state.lock();
        let class = InfoClass::from_id(class).ok_or_else(|| fail(ErrorCode::INVALID_PARAMETER))?;
        let value = match state.handles.get(&handle.get()) {
            Some(Slot::Archive(archive)) => archive.info(class),
            Some(Slot::File(file)) => file.info(class),
            Some(Slot::Search(_)) | None => Err(ErrorCode::INVALID_HANDLE),
        }
        .map_err(fail)?;

        let required = u32::try_from(value.len()).unwrap_or(u32::MAX);
        if buffer.len() < value.len() {
            return Err(InfoFailure {
                code: ErrorCode::INSUFFICIENT_BUFFER,
                required,
            });
        }
        buffer[..value.len()].copy_from_slice(&value);
        Ok(required)
    }

    fn find_first(
        &self,
        archive: RawHandle,
        mask: &str,
        listfile: Option<&Path>,
    ) -> EngineResult<(RawHandle, FindRecord)> {
        if let Some(listfile) = listfile {
            fs::metadata(listfile).map_err(|err| io_code(&err))?;
        }
        let mut state = self.state.lock();
        let image = &state.archive(archive)?.image;

        let mut records: Vec<FindRecord> = image
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| wildcard_match(mask, &entry.name))
            .map(|(index, entry)| FindRecord {
                file_name: entry.name.clone(),
                plain_name: plain_name(&entry.name).to_string(),
                hash_index: entry.hash_index,
                block_index: u32::try_from(index).unwrap_or(u32::MAX),
                file_size: entry.size(),
                file_flags: entry.flags,
                comp_size: entry.size(),
                file_time_lo: entry.file_time as u32,
                file_time_hi: (entry.file_time >> 32) as u32,
                locale: entry.locale,
            })
            .collect();
        records.sort_by_key(|record| record.hash_index);

        let mut records = records.into_iter();
        let first = records.next().ok_or(ErrorCode::NO_MORE_FILES)?;
        Ok((state.insert(Slot::Search(records)), first))
    }

    fn find_next(&self, search: RawHandle) -> EngineResult<FindRecord> {
        match self.state.lock().handles.get_mut(&search.get()) {
            Some(Slot::Search(records)) => records.next().ok_or(ErrorCode::NO_MORE_FILES),
            _ => Err(ErrorCode::INVALID_HANDLE),
        }
    }

    fn find_close(&self, search: RawHandle) -> EngineResult<()> {
        let mut state = self.state.lock();
        match state.handles.get(&search.get()) {
            Some(Slot::Search(_)) => {
                state.handles.remove(&search.get());
                Ok(())
            }
            _ => Err(ErrorCode::INVALID_HANDLE),
        }
    }

    fn add_file(
        &self,
        archive: RawHandle,
        source: &Path,
        archived_name: &str,
        flags: u32,
        compression: u32,
        compression_next: u32,
    ) -> EngineResult<()> {
        let data = fs::read(source).map_err(|err| io_code(&err))?;
        let mut state = self.state.lock();
        let locale = state.locale;
        let open = state.archive_mut(archive)?;
        open.writable()?;

        let image = &mut open.image;
        if let Some(existing) = image.find_exact(archived_name, locale) {
            if flags & FileFlags::REPLACE_EXISTING == 0 {
                return Err(ErrorCode::ALREADY_EXISTS);
            }
            image.entries.remove(existing);
        }
        if image.entries.len() >= image.max_file_count as usize {
            return Err(ErrorCode::DISK_FULL);
        }
        let hash_index = image.free_slot(archived_name).ok_or(ErrorCode::DISK_FULL)?;

        debug!(
            "Adding {} ({} bytes, flags 0x{:08x}) to {}",
            archived_name,
            data.len(),
            flags,
            open.path.display()
        );
        let entry = StoredEntry {
            name: archived_name.to_string(),
            locale,
            flags: flags | EntryFlags::EXISTS,
            compression,
            compression_next,
            file_time: now_filetime(),
            hash_index,
            md5: md5::compute(&data).0,
            data,
        };
        open.image.entries.push(entry);
        open.dirty = true;
        Ok(())
    }

    fn remove_file(&self, archive: RawHandle, name: &str, _search_scope: u32) -> EngineResult<()> {
        let mut state = self.state.lock();
        let locale = state.locale;
        let open = state.archive_mut(archive)?;
        open.writable()?;
        let index = open
            .image
            .find(name, locale)
            .ok_or(ErrorCode::FILE_NOT_FOUND)?;
        open.image.entries.remove(index);
        open.dirty = true;
        Ok(())
    }

    fn rename_file(&self, archive: RawHandle, old_name: &str, new_name: &str) -> EngineResult<()> {
        let mut state = self.state.lock();
        let locale = state.locale;
        let open = state.archive_mut(archive)?;
        open.writable()?;
        let index = open
            .image
            .find(old_name, locale)
            .ok_or(ErrorCode::FILE_NOT_FOUND)?;
        let entry_locale = open.image.entries[index].locale;
        if open.image.find_exact(new_name, entry_locale).is_some() {
            return Err(ErrorCode::ALREADY_EXISTS);
        }
        open.image.entries[index].name = new_name.to_string();
        open.dirty = true;
        Ok(())
    }

    fn extract_file(
        &self,
        archive: RawHandle,
        name: &str,
        destination: &Path,
        _search_scope: u32,
    ) -> EngineResult<()> {
        let state = self.state.lock();
        let (image, index) = state
            .archive(archive)?
            .lookup(name, state.locale)
            .ok_or(ErrorCode::FILE_NOT_FOUND)?;
        fs::write(destination, &image.entries[index].data).map_err(|err| io_code(&err))
    }

    fn locale(&self) -> u32 {
        self.state.lock().locale
    }

    fn set_locale(&self, locale: u32) -> u32 {
        self.state.lock().locale = locale;
        locale
    }
}
