//! Native StormLib binding
//!
//! Links against `libstorm` and forwards every [`Engine`] call to the
//! matching `SFile*` export. On this platform the library's `TCHAR` is
//! `char`, so host paths pass through as raw bytes.
//!
//! The library keeps its last-error slot in a process global. Every call
//! and the error read that follows it run under one lock so that errors
//! cannot be picked up by the wrong caller.

use std::ffi::CString;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

use libc::{c_char, c_int, c_uint, c_void};
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{
    CreateInfo, Engine, EngineResult, ErrorCode, FindRecord, InfoFailure, MAX_PATH, RawHandle,
};

type Handle = *mut c_void;

const SFILE_INVALID_SIZE: c_uint = 0xFFFF_FFFF;
const SFILE_INVALID_POS: c_uint = 0xFFFF_FFFF;
const FILE_BEGIN: c_uint = 0;

#[repr(C)]
struct SfileCreateMpq {
    cb_size: c_uint,
    mpq_version: c_uint,
    user_data: *mut c_void,
    cb_user_data: c_uint,
    stream_flags: c_uint,
    file_flags_listfile: c_uint,
    file_flags_attributes: c_uint,
    file_flags_signature: c_uint,
    attr_flags: c_uint,
    sector_size: c_uint,
    raw_chunk_size: c_uint,
    max_file_count: c_uint,
}

#[repr(C)]
struct SfileFindData {
    file_name: [c_char; MAX_PATH],
    plain_name: *mut c_char,
    hash_index: c_uint,
    block_index: c_uint,
    file_size: c_uint,
    file_flags: c_uint,
    comp_size: c_uint,
    file_time_lo: c_uint,
    file_time_hi: c_uint,
    locale: c_uint,
}

impl SfileFindData {
    const fn zeroed() -> Self {
        Self {
            file_name: [0; MAX_PATH],
            plain_name: ptr::null_mut(),
            hash_index: 0,
            block_index: 0,
            file_size: 0,
            file_flags: 0,
            comp_size: 0,
            file_time_lo: 0,
            file_time_hi: 0,
            locale: 0,
        }
    }

    fn into_record(self) -> FindRecord {
        let bytes: Vec<u8> = self
            .file_name
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        let file_name = String::from_utf8_lossy(&bytes).into_owned();
        let plain_name = file_name
            .rsplit('\\')
            .next()
            .unwrap_or(&file_name)
            .to_string();

        FindRecord {
            file_name,
            plain_name,
            hash_index: self.hash_index,
            block_index: self.block_index,
            file_size: self.file_size,
            file_flags: self.file_flags,
            comp_size: self.comp_size,
            file_time_lo: self.file_time_lo,
            file_time_hi: self.file_time_hi,
            locale: self.locale,
        }
    }
}

#[allow(unsafe_code)]
#[link(name = "storm")]
unsafe extern "C" {
    fn SFileOpenArchive(name: *const c_char, priority: c_uint, flags: c_uint, mpq: *mut Handle)
    -> bool;
    fn SFileCreateArchive(
        name: *const c_char,
        create_flags: c_uint,
        max_file_count: c_uint,
        mpq: *mut Handle,
    ) -> bool;
    fn SFileCreateArchive2(
        name: *const c_char,
        create_info: *mut SfileCreateMpq,
        mpq: *mut Handle,
    ) -> bool;
    fn SFileFlushArchive(mpq: Handle) -> bool;
    fn SFileCloseArchive(mpq: Handle) -> bool;
    fn SFileCompactArchive(mpq: Handle, listfile: *const c_char, reserved: bool) -> bool;
    fn SFileAddListFile(mpq: Handle, listfile: *const c_char) -> c_uint;
    fn SFileSignArchive(mpq: Handle, signature_type: c_uint) -> bool;
    fn SFileVerifyArchive(mpq: Handle) -> c_uint;
    fn SFileVerifyFile(mpq: Handle, name: *const c_char, flags: c_uint) -> c_uint;
    fn SFileSetMaxFileCount(mpq: Handle, count: c_uint) -> bool;
    fn SFileOpenPatchArchive(
        mpq: Handle,
        name: *const c_char,
        prefix: *const c_char,
        flags: c_uint,
    ) -> bool;
    fn SFileIsPatchedArchive(mpq: Handle) -> bool;
    fn SFileHasFile(mpq: Handle, name: *const c_char) -> bool;
    fn SFileOpenFileEx(mpq: Handle, name: *const c_char, scope: c_uint, file: *mut Handle) -> bool;
    fn SFileCloseFile(file: Handle) -> bool;
    fn SFileGetFileName(file: Handle, buffer: *mut c_char) -> bool;
    fn SFileGetFileSize(file: Handle, high: *mut c_uint) -> c_uint;
    fn SFileSetFilePointer(file: Handle, low: c_int, high: *mut c_int, method: c_uint) -> c_uint;
    fn SFileReadFile(
        file: Handle,
        buffer: *mut c_void,
        to_read: c_uint,
        read: *mut c_uint,
        overlapped: *mut c_void,
    ) -> bool;
    fn SFileSetFileLocale(file: Handle, locale: c_uint) -> bool;
    fn SFileGetFileInfo(
        handle: Handle,
        class: c_uint,
        buffer: *mut c_void,
        length: c_uint,
        needed: *mut c_uint,
    ) -> bool;
    fn SFileFindFirstFile(
        mpq: Handle,
        mask: *const c_char,
        data: *mut SfileFindData,
        listfile: *const c_char,
    ) -> Handle;
    fn SFileFindNextFile(find: Handle, data: *mut SfileFindData) -> bool;
    fn SFileFindClose(find: Handle) -> bool;
    fn SFileAddFileEx(
        mpq: Handle,
        source: *const c_char,
        archived_name: *const c_char,
        flags: c_uint,
        compression: c_uint,
        compression_next: c_uint,
    ) -> bool;
    fn SFileRemoveFile(mpq: Handle, name: *const c_char, scope: c_uint) -> bool;
    fn SFileRenameFile(mpq: Handle, old_name: *const c_char, new_name: *const c_char) -> bool;
    fn SFileExtractFile(
        mpq: Handle,
        name: *const c_char,
        destination: *const c_char,
        scope: c_uint,
    ) -> bool;
    safe fn SFileGetLocale() -> c_uint;
    safe fn SFileSetLocale(locale: c_uint) -> c_uint;
    safe fn GetLastError() -> c_uint;
    safe fn SetLastError(code: c_uint);
}

fn c_path(path: &Path) -> EngineResult<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| ErrorCode::INVALID_PARAMETER)
}

fn c_name(name: &str) -> EngineResult<CString> {
    CString::new(name).map_err(|_| ErrorCode::INVALID_PARAMETER)
}

fn to_ptr(handle: RawHandle) -> Handle {
    ptr::with_exposed_provenance_mut(handle.get())
}

fn from_ptr(handle: Handle) -> Option<RawHandle> {
    RawHandle::new(handle.expose_provenance())
}

fn last_error() -> ErrorCode {
    ErrorCode(GetLastError())
}

fn check(ok: bool) -> EngineResult<()> {
    if ok { Ok(()) } else { Err(last_error()) }
}

fn take_handle(ok: bool, handle: Handle) -> EngineResult<RawHandle> {
    check(ok)?;
    from_ptr(handle).ok_or(ErrorCode::INVALID_HANDLE)
}

/// [`Engine`] backed by the native StormLib library
#[derive(Debug, Default)]
pub struct StormLibEngine {
    call: Mutex<()>,
}

impl StormLibEngine {
    /// Bind to the linked library
    pub fn new() -> Self {
        info!("Using native StormLib engine");
        Self::default()
    }
}

#[allow(unsafe_code)]
impl Engine for StormLibEngine {
    fn open_archive(&self, path: &Path, priority: u32, flags: u32) -> EngineResult<RawHandle> {
        let path = c_path(path)?;
        let mut handle: Handle = ptr::null_mut();
        let _call = self.call.lock();
        // SAFETY: `path` is NUL-terminated and outlives the call; `handle` is a valid out slot.
        let ok = unsafe { SFileOpenArchive(path.as_ptr(), priority, flags, &raw mut handle) };
        take_handle(ok, handle)
    }

    fn create_archive(
        &self,
        path: &Path,
        flags: u32,
        max_file_count: u32,
    ) -> EngineResult<RawHandle> {
        let path = c_path(path)?;
        let mut handle: Handle = ptr::null_mut();
        let _call = self.call.lock();
        // SAFETY: `path` is NUL-terminated and outlives the call; `handle` is a valid out slot.
        let ok =
            unsafe { SFileCreateArchive(path.as_ptr(), flags, max_file_count, &raw mut handle) };
        take_handle(ok, handle)
    }

    fn create_archive_with(&self, path: &Path, info: &CreateInfo) -> EngineResult<RawHandle> {
        let path = c_path(path)?;
        let mut create = SfileCreateMpq {
            cb_size: mem::size_of::<SfileCreateMpq>() as c_uint,
            mpq_version: info.mpq_version,
            user_data: ptr::null_mut(),
            cb_user_data: 0,
            stream_flags: info.stream_flags,
            file_flags_listfile: info.file_flags_listfile,
            file_flags_attributes: info.file_flags_attributes,
            file_flags_signature: info.file_flags_signature,
            attr_flags: info.attr_flags,
            sector_size: info.sector_size,
            raw_chunk_size: info.raw_chunk_size,
            max_file_count: info.max_file_count,
        };
        let mut handle: Handle = ptr::null_mut();
        let _call = self.call.lock();
        // SAFETY: `create` matches the library's SFILE_CREATE_MPQ layout and its
        // size field is set; all pointers are valid for the call.
        let ok = unsafe { SFileCreateArchive2(path.as_ptr(), &raw mut create, &raw mut handle) };
        take_handle(ok, handle)
    }

    fn close_archive(&self, archive: RawHandle) -> EngineResult<()> {
        let _call = self.call.lock();
        // SAFETY: the library validates the handle and fails on unknown ones.
        check(unsafe { SFileCloseArchive(to_ptr(archive)) })
    }

    fn flush_archive(&self, archive: RawHandle) -> EngineResult<()> {
        let _call = self.call.lock();
        // SAFETY: the library validates the handle.
        check(unsafe { SFileFlushArchive(to_ptr(archive)) })
    }

    fn compact_archive(&self, archive: RawHandle, listfile: Option<&Path>) -> EngineResult<()> {
        let listfile = listfile.map(c_path).transpose()?;
        let listfile_ptr = listfile.as_ref().map_or(ptr::null(), |l| l.as_ptr());
        let _call = self.call.lock();
        // SAFETY: `listfile_ptr` is null or points into `listfile`, alive for the call.
        check(unsafe { SFileCompactArchive(to_ptr(archive), listfile_ptr, false) })
    }

    fn add_listfile(&self, archive: RawHandle, listfile: &Path) -> EngineResult<()> {
        let listfile = c_path(listfile)?;
        let _call = self.call.lock();
        // SAFETY: `listfile` is NUL-terminated and outlives the call.
        let code = unsafe { SFileAddListFile(to_ptr(archive), listfile.as_ptr()) };
        if code == 0 { Ok(()) } else { Err(ErrorCode(code)) }
    }

    fn sign_archive(&self, archive: RawHandle, signature_type: u32) -> EngineResult<()> {
        let _call = self.call.lock();
        // SAFETY: the library validates the handle.
        check(unsafe { SFileSignArchive(to_ptr(archive), signature_type) })
    }

    fn verify_archive(&self, archive: RawHandle) -> u32 {
        let _call = self.call.lock();
        // SAFETY: the library validates the handle.
        unsafe { SFileVerifyArchive(to_ptr(archive)) }
    }

    fn verify_file(&self, archive: RawHandle, name: &str, flags: u32) -> u32 {
        let Ok(name) = c_name(name) else {
            return crate::verify::VERIFY_OPEN_ERROR;
        };
        let _call = self.call.lock();
        // SAFETY: `name` is NUL-terminated and outlives the call.
        unsafe { SFileVerifyFile(to_ptr(archive), name.as_ptr(), flags) }
    }

    fn set_max_file_count(&self, archive: RawHandle, count: u32) -> EngineResult<()> {
        let _call = self.call.lock();
        // SAFETY: the library validates the handle.
        check(unsafe { SFileSetMaxFileCount(to_ptr(archive), count) })
    }

    fn open_patch_archive(
        &self,
        archive: RawHandle,
        path: &Path,
        prefix: &str,
        flags: u32,
    ) -> EngineResult<()> {
        let path = c_path(path)?;
        let prefix = c_name(prefix)?;
        let _call = self.call.lock();
        // SAFETY: both strings are NUL-terminated and outlive the call.
        check(unsafe {
            SFileOpenPatchArchive(to_ptr(archive), path.as_ptr(), prefix.as_ptr(), flags)
        })
    }

    fn is_patched_archive(&self, archive: RawHandle) -> bool {
        let _call = self.call.lock();
        // SAFETY: the library validates the handle.
        unsafe { SFileIsPatchedArchive(to_ptr(archive)) }
    }

    fn has_file(&self, archive: RawHandle, name: &str) -> EngineResult<()> {
        let name = c_name(name)?;
        let _call = self.call.lock();
        // SAFETY: `name` is NUL-terminated and outlives the call.
        check(unsafe { SFileHasFile(to_ptr(archive), name.as_ptr()) })
    }

    fn open_file(
        &self,
        archive: RawHandle,
        name: &str,
        search_scope: u32,
    ) -> EngineResult<RawHandle> {
        let name = c_name(name)?;
        let mut handle: Handle = ptr::null_mut();
        let _call = self.call.lock();
        // SAFETY: `name` is NUL-terminated; `handle` is a valid out slot.
        let ok = unsafe {
            SFileOpenFileEx(to_ptr(archive), name.as_ptr(), search_scope, &raw mut handle)
        };
        take_handle(ok, handle)
    }

    fn close_file(&self, file: RawHandle) -> EngineResult<()> {
        let _call = self.call.lock();
        // SAFETY: the library validates the handle.
        check(unsafe { SFileCloseFile(to_ptr(file)) })
    }

    fn file_name(&self, file: RawHandle, buffer: &mut [u8; MAX_PATH]) -> EngineResult<()> {
        let _call = self.call.lock();
        // SAFETY: the library writes at most MAX_PATH bytes including the NUL.
        check(unsafe { SFileGetFileName(to_ptr(file), buffer.as_mut_ptr().cast()) })
    }

    fn file_size(&self, file: RawHandle) -> EngineResult<u64> {
        let mut high: c_uint = 0;
        let _call = self.call.lock();
        SetLastError(0);
        // SAFETY: `high` is a valid out slot.
        let low = unsafe { SFileGetFileSize(to_ptr(file), &raw mut high) };
        if low == SFILE_INVALID_SIZE && last_error() != ErrorCode::SUCCESS {
            return Err(last_error());
        }
        Ok((u64::from(high) << 32) | u64::from(low))
    }

    fn set_file_pointer(&self, file: RawHandle, position: u64) -> EngineResult<u64> {
        let low = position as u32 as c_int;
        let mut high = (position >> 32) as u32 as c_int;
        let _call = self.call.lock();
        SetLastError(0);
        // SAFETY: `high` is a valid in/out slot.
        let result = unsafe { SFileSetFilePointer(to_ptr(file), low, &raw mut high, FILE_BEGIN) };
        if result == SFILE_INVALID_POS && last_error() != ErrorCode::SUCCESS {
            return Err(last_error());
        }
        Ok((u64::from(high as u32) << 32) | u64::from(result))
    }

    fn read_file(&self, file: RawHandle, buffer: &mut [u8]) -> EngineResult<usize> {
        let to_read = c_uint::try_from(buffer.len()).unwrap_or(c_uint::MAX);
        let mut read: c_uint = 0;
        let _call = self.call.lock();
        // SAFETY: `buffer` holds at least `to_read` writable bytes.
        let ok = unsafe {
            SFileReadFile(
                to_ptr(file),
                buffer.as_mut_ptr().cast(),
                to_read,
                &raw mut read,
                ptr::null_mut(),
            )
        };
        match check(ok) {
            Ok(()) => Ok(read as usize),
            Err(code) if code == ErrorCode::HANDLE_EOF => Ok(read as usize),
            Err(code) => Err(code),
        }
    }

    fn set_file_locale(&self, file: RawHandle, locale: u32) -> EngineResult<()> {
        let _call = self.call.lock();
        // SAFETY: the library validates the handle.
        check(unsafe { SFileSetFileLocale(to_ptr(file), locale) })
    }

    fn get_info(
        &self,
        handle: RawHandle,
        class: u32,
        buffer: &mut [u8],
    ) -> std::result::Result<u32, InfoFailure> {
        let length = c_uint::try_from(buffer.len()).unwrap_or(c_uint::MAX);
        let mut needed: c_uint = 0;
        let _call = self.call.lock();
        // SAFETY: `buffer` holds `length` writable bytes; `needed` is a valid out slot.
        let ok = unsafe {
            SFileGetFileInfo(
                to_ptr(handle),
                class,
                buffer.as_mut_ptr().cast(),
                length,
                &raw mut needed,
            )
        };
        if ok {
            Ok(needed)
        } else {
            Err(InfoFailure {
                code: last_error(),
                required: needed,
            })
        }
    }

    fn find_first(
        &self,
        archive: RawHandle,
        mask: &str,
        listfile: Option<&Path>,
    ) -> EngineResult<(RawHandle, FindRecord)> {
        let mask = c_name(mask)?;
        let listfile = listfile.map(c_path).transpose()?;
        let listfile_ptr = listfile.as_ref().map_or(ptr::null(), |l| l.as_ptr());
        let mut data = SfileFindData::zeroed();
        let _call = self.call.lock();
        // SAFETY: `data` matches SFILE_FIND_DATA; strings are alive for the call.
        let find = unsafe {
            SFileFindFirstFile(to_ptr(archive), mask.as_ptr(), &raw mut data, listfile_ptr)
        };
        match from_ptr(find) {
            Some(handle) => Ok((handle, data.into_record())),
            None => Err(last_error()),
        }
    }

    fn find_next(&self, search: RawHandle) -> EngineResult<FindRecord> {
        let mut data = SfileFindData::zeroed();
        let _call = self.call.lock();
        // SAFETY: `data` matches SFILE_FIND_DATA.
        check(unsafe { SFileFindNextFile(to_ptr(search), &raw mut data) })?;
        Ok(data.into_record())
    }

    fn find_close(&self, search: RawHandle) -> EngineResult<()> {
        let _call = self.call.lock();
        // SAFETY: the library validates the handle.
        check(unsafe { SFileFindClose(to_ptr(search)) })
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
        let source = c_path(source)?;
        let archived_name = c_name(archived_name)?;
        debug!(
            "SFileAddFileEx flags=0x{flags:08x} codec=0x{compression:02x}/0x{compression_next:02x}"
        );
        let _call = self.call.lock();
        // SAFETY: both strings are NUL-terminated and outlive the call.
        check(unsafe {
            SFileAddFileEx(
                to_ptr(archive),
                source.as_ptr(),
                archived_name.as_ptr(),
                flags,
                compression,
                compression_next,
            )
        })
    }

    fn remove_file(&self, archive: RawHandle, name: &str, search_scope: u32) -> EngineResult<()> {
        let name = c_name(name)?;
        let _call = self.call.lock();
        // SAFETY: `name` is NUL-terminated and outlives the call.
        check(unsafe { SFileRemoveFile(to_ptr(archive), name.as_ptr(), search_scope) })
    }

    fn rename_file(&self, archive: RawHandle, old_name: &str, new_name: &str) -> EngineResult<()> {
        let old_name = c_name(old_name)?;
        let new_name = c_name(new_name)?;
        let _call = self.call.lock();
        // SAFETY: both strings are NUL-terminated and outlive the call.
        check(unsafe { SFileRenameFile(to_ptr(archive), old_name.as_ptr(), new_name.as_ptr()) })
    }

    fn extract_file(
        &self,
        archive: RawHandle,
        name: &str,
        destination: &Path,
        search_scope: u32,
    ) -> EngineResult<()> {
        let name = c_name(name)?;
        let destination = c_path(destination)?;
        let _call = self.call.lock();
        // SAFETY: both strings are NUL-terminated and outlive the call.
        check(unsafe {
            SFileExtractFile(
                to_ptr(archive),
                name.as_ptr(),
                destination.as_ptr(),
                search_scope,
            )
        })
    }

    fn locale(&self) -> u32 {
        let _call = self.call.lock();
        SFileGetLocale()
    }

    fn set_locale(&self, locale: u32) -> u32 {
        let _call = self.call.lock();
        SFileSetLocale(locale)
    }
}
