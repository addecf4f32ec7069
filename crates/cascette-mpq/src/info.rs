//! Metadata queries against archives and files
//!
//! The engine answers an info query by filling a caller-supplied buffer and
//! reporting how many bytes it used. When the buffer is too small it fails
//! with [`ErrorCode::INSUFFICIENT_BUFFER`] and reports the length it needs.
//! [`next_step`] turns one engine reply into the next action, so the retry
//! loop in [`fetch`] carries no protocol logic of its own.
//!
//! Each [`InfoClass`] has a fixed [`ValueKind`] that says how the returned
//! bytes are decoded. Archive classes occupy ids 0-39, file classes 40-56;
//! both share one table.

use std::fmt;
use std::str::FromStr;

use tracing::debug;

use crate::engine::{Engine, ErrorCode, InfoFailure, RawHandle};
use crate::error::{MpqError, Result};
use crate::flags::EntryFlags;
use crate::locale;

/// Buffer size of the first attempt
pub const MIN_INFO_BUFFER: usize = 12;

/// Extra bytes added to the engine-reported length on retry
pub const INFO_BUFFER_SLACK: usize = 4;

/// How the bytes of an info class are interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// NUL-terminated text
    String,
    /// 32-bit truth value, decoded as its integer
    ///
    /// No [`InfoClass`] carries this kind: classes the engine tags as byte
    /// data are returned as [`ValueKind::RawBytes`]. It stays for callers
    /// that pass their own kind to [`decode`].
    Bool,
    /// 32-bit unsigned integer
    Int32,
    /// 64-bit value as `[low, high]` words
    Int64Pair,
    /// Engine address; opaque, never dereferenced
    Pointer,
    /// 32-bit locale code, decoded to its culture name
    LocaleCode,
    /// 32-bit entry flags, decoded to [`EntryFlags`]
    FlagBitmask,
    /// Bytes returned as-is
    RawBytes,
}

/// Which handle an info class belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InfoScope {
    /// Archive handle
    Archive,
    /// File handle
    File,
}

macro_rules! info_classes {
    ($($variant:ident = $id:literal, $name:literal, $kind:ident;)+) => {
        /// Queryable attribute of an archive or a file
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum InfoClass {
            $(
                #[doc = concat!("`", $name, "`")]
                $variant = $id,
            )+
        }

        impl InfoClass {
            /// Every class in id order
            pub const ALL: &'static [Self] = &[$(Self::$variant,)+];

            /// Canonical option name
            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)+
                }
            }

            /// How this class's bytes are decoded
            pub const fn value_kind(self) -> ValueKind {
                match self {
                    $(Self::$variant => ValueKind::$kind,)+
                }
            }

            /// Look up a class by id
            pub const fn from_id(id: u32) -> Option<Self> {
                match id {
                    $($id => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

info_classes! {
    FileName = 0, "fileName", String;
    StreamBitmap = 1, "streamBitmap", RawBytes;
    UserDataOffset = 2, "userDataOffset", Int64Pair;
    UserDataHeader = 3, "userDataHeader", RawBytes;
    UserData = 4, "userData", RawBytes;
    HeaderOffset = 5, "headerOffset", Int64Pair;
    HeaderSize = 6, "headerSize", Int32;
    Header = 7, "header", RawBytes;
    HetTableOffset = 8, "hetTableOffset", Int64Pair;
    HetTableSize = 9, "hetTableSize", Int64Pair;
    HetHeader = 10, "hetHeader", RawBytes;
    HetTable = 11, "hetTable", Pointer;
    BetTableOffset = 12, "betTableOffset", Int64Pair;
    BetTableSize = 13, "betTableSize", Int64Pair;
    BetHeader = 14, "betHeader", RawBytes;
    BetTable = 15, "betTable", Pointer;
    HashTableOffset = 16, "hashTableOffset", Int64Pair;
    HashTableSize64 = 17, "hashTableSize64", Int64Pair;
    HashTableSize = 18, "hashTableSize", Int32;
    HashTable = 19, "hashTable", RawBytes;
    BlockTableOffset = 20, "blockTableOffset", Int64Pair;
    BlockTableSize64 = 21, "blockTableSize64", Int64Pair;
    BlockTableSize = 22, "blockTableSize", Int32;
    BlockTable = 23, "blockTable", RawBytes;
    HiBlockTableOffset = 24, "hiBlockTableOffset", Int64Pair;
    HiBlockTableSize64 = 25, "hiBlockTableSize64", Int64Pair;
    HiBlockTable = 26, "hiBlockTable", RawBytes;
    Signatures = 27, "signatures", Int32;
    StrongSignatureOffset = 28, "strongSignatureOffset", Int64Pair;
    StrongSignatureSize = 29, "strongSignatureSize", Int32;
    StrongSignature = 30, "strongSignature", RawBytes;
    ArchiveSize64 = 31, "archiveSize64", Int64Pair;
    ArchiveSize = 32, "archiveSize", Int32;
    MaxFileCount = 33, "maxFileCount", Int32;
    FileTableSize = 34, "fileTableSize", Int32;
    SectorSize = 35, "sectorSize", Int32;
    NumberOfFiles = 36, "numberOfFiles", Int32;
    RawChunkSize = 37, "rawChunkSize", Int32;
    StreamFlags = 38, "streamFlags", Int32;
    ArchiveFlags = 39, "flags", Int32;
    PatchChain = 40, "patchChain", RawBytes;
    FileEntry = 41, "fileEntry", RawBytes;
    HashEntry = 42, "hashEntry", RawBytes;
    HashIndex = 43, "hashIndex", Int32;
    NameHash1 = 44, "nameHash1", Int32;
    NameHash2 = 45, "nameHash2", Int32;
    NameHash3 = 46, "nameHash3", Int64Pair;
    Locale = 47, "locale", LocaleCode;
    FileIndex = 48, "fileIndex", Int32;
    ByteOffset = 49, "byteOffset", Int64Pair;
    FileTime = 50, "fileTime", Int64Pair;
    FileSize = 51, "fileSize", Int32;
    CompressedSize = 52, "compressedSize", Int32;
    FileFlags = 53, "flags", FlagBitmask;
    EncryptionKey = 54, "encryptionKey", Int32;
    EncryptionKeyRaw = 55, "encryptionKeyRaw", Int32;
    Crc32 = 56, "crc32", Int32;
}

/// First id of the file classes
pub const FIRST_FILE_CLASS: u32 = InfoClass::PatchChain as u32;

impl InfoClass {
    /// Numeric id passed to the engine
    pub const fn id(self) -> u32 {
        self as u32
    }

    /// Handle kind this class belongs to
    pub const fn scope(self) -> InfoScope {
        if self.id() < FIRST_FILE_CLASS {
            InfoScope::Archive
        } else {
            InfoScope::File
        }
    }

    /// Look up a class by option name within a scope
    ///
    /// `"flags"` names [`InfoClass::ArchiveFlags`] for archives and
    /// [`InfoClass::FileFlags`] for files. Archives also accept `"mpqName"`
    /// and `"name"` for [`InfoClass::FileName`].
    pub fn from_name(name: &str, scope: InfoScope) -> Option<Self> {
        if scope == InfoScope::Archive && matches!(name, "mpqName" | "name") {
            return Some(Self::FileName);
        }
        Self::ALL
            .iter()
            .copied()
            .find(|class| class.scope() == scope && class.name() == name)
    }
}

impl FromStr for InfoClass {
    type Err = MpqError;

    /// Archive classes first, then file classes
    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s, InfoScope::Archive)
            .or_else(|| Self::from_name(s, InfoScope::File))
            .ok_or_else(|| MpqError::UnknownInfoClass(s.to_string()))
    }
}

impl fmt::Display for InfoClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Value kind for a numeric class id; ids outside the table are raw bytes
pub fn value_kind_for_id(id: u32) -> ValueKind {
    InfoClass::from_id(id).map_or(ValueKind::RawBytes, InfoClass::value_kind)
}

/// Decoded info value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoValue {
    /// Text value
    Text(String),
    /// 32-bit value
    Int32(u32),
    /// 64-bit value as `[low, high]`
    Pair([u32; 2]),
    /// Opaque engine address
    Pointer(u32),
    /// Culture name of a locale code
    Locale(&'static str),
    /// Decoded entry flags
    Flags(EntryFlags),
    /// Uninterpreted bytes
    Bytes(Vec<u8>),
}

impl InfoValue {
    /// 32-bit value of an integer or pointer
    pub const fn as_u32(&self) -> Option<u32> {
        match self {
            Self::Int32(value) | Self::Pointer(value) => Some(*value),
            _ => None,
        }
    }

    /// `[low, high]` words of a 64-bit value
    pub const fn as_pair(&self) -> Option<[u32; 2]> {
        match self {
            Self::Pair(pair) => Some(*pair),
            _ => None,
        }
    }

    /// 64-bit value assembled from its words
    pub const fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Pair([low, high]) => Some(((*high as u64) << 32) | *low as u64),
            Self::Int32(value) => Some(*value as u64),
            _ => None,
        }
    }

    /// Text or locale name
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Locale(name) => Some(name),
            _ => None,
        }
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Decoded entry flags
    pub const fn as_flags(&self) -> Option<EntryFlags> {
        match self {
            Self::Flags(flags) => Some(*flags),
            _ => None,
        }
    }
}

/// Buffer size for one engine attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRequest {
    /// Buffer length in bytes
    pub size: usize,
    /// Size chosen by the caller; such requests are never grown
    pub explicit: bool,
}

impl BufferRequest {
    /// First attempt without a caller-chosen size
    pub const fn initial() -> Self {
        Self {
            size: MIN_INFO_BUFFER,
            explicit: false,
        }
    }

    /// Attempt with a caller-chosen size
    ///
    /// A size of 0 means no size was chosen and gives [`Self::initial`].
    pub const fn explicit(size: usize) -> Self {
        if size == 0 {
            return Self::initial();
        }
        Self {
            size,
            explicit: true,
        }
    }
}

impl Default for BufferRequest {
    fn default() -> Self {
        Self::initial()
    }
}

/// What to do after one engine reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoStep {
    /// Decode the first `used` bytes of the buffer
    Decode {
        /// Bytes written by the engine
        used: usize,
    },
    /// Ask again with a larger buffer
    Retry(BufferRequest),
    /// Surface the engine error
    Fail(ErrorCode),
    /// Engine wants a buffer no larger than the one it was given
    Stalled {
        /// Length the engine reported
        required: usize,
    },
}

/// Decide the next action from the current request and the engine reply
pub fn next_step(
    request: BufferRequest,
    reply: std::result::Result<u32, InfoFailure>,
) -> InfoStep {
    match reply {
        Ok(used) => InfoStep::Decode {
            used: (used as usize).min(request.size),
        },
        Err(failure) if failure.code == ErrorCode::INSUFFICIENT_BUFFER && !request.explicit => {
            let required = failure.required as usize;
            let size = required + INFO_BUFFER_SLACK;
            if size <= request.size {
                InfoStep::Stalled { required }
            } else {
                InfoStep::Retry(BufferRequest {
                    size,
                    explicit: false,
                })
            }
        }
        Err(failure) => InfoStep::Fail(failure.code),
    }
}

/// Query one info class, growing the buffer as the engine asks
pub fn fetch<E: Engine + ?Sized>(
    engine: &E,
    handle: RawHandle,
    class: u32,
    mut request: BufferRequest,
    operation: &'static str,
) -> Result<InfoValue> {
    loop {
        let mut buffer = vec![0u8; request.size];
        let reply = engine.get_info(handle, class, &mut buffer);

        match next_step(request, reply) {
            InfoStep::Decode { used } => {
                buffer.truncate(used);
                return decode(value_kind_for_id(class), &buffer);
            }
            InfoStep::Retry(next) => {
                debug!(
                    "Info class {class} needs {} bytes, retrying (had {})",
                    next.size, request.size
                );
                request = next;
            }
            InfoStep::Fail(code) => return Err(MpqError::engine(operation, code)),
            InfoStep::Stalled { required } => {
                return Err(MpqError::InsufficientBufferExceeded {
                    class,
                    requested: request.size,
                    required,
                });
            }
        }
    }
}

/// Little-endian word at `index`, zero-padded past the end of `bytes`
fn word(bytes: &[u8], index: usize) -> u32 {
    let mut raw = [0u8; 4];
    if let Some(tail) = bytes.get(index * 4..) {
        let len = tail.len().min(4);
        raw[..len].copy_from_slice(&tail[..len]);
    }
    u32::from_le_bytes(raw)
}

/// Decode the used part of an info buffer
pub fn decode(kind: ValueKind, bytes: &[u8]) -> Result<InfoValue> {
    Ok(match kind {
        ValueKind::String => {
            let text = bytes.strip_suffix(&[0]).unwrap_or(bytes);
            InfoValue::Text(String::from_utf8_lossy(text).into_owned())
        }
        ValueKind::Bool | ValueKind::Int32 => InfoValue::Int32(word(bytes, 0)),
        ValueKind::Pointer => InfoValue::Pointer(word(bytes, 0)),
        ValueKind::Int64Pair => InfoValue::Pair([word(bytes, 0), word(bytes, 1)]),
        ValueKind::LocaleCode => InfoValue::Locale(locale::format(Some(word(bytes, 0)))?),
        ValueKind::FlagBitmask => InfoValue::Flags(EntryFlags::decode(word(bytes, 0))),
        ValueKind::RawBytes => InfoValue::Bytes(bytes.to_vec()),
    })
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn insufficient(required: u32) -> std::result::Result<u32, InfoFailure> {
        Err(InfoFailure {
            code: ErrorCode::INSUFFICIENT_BUFFER,
            required,
        })
    }

    #[test]
    fn test_table_layout() {
        assert_eq!(InfoClass::ALL.len(), 57);
        for (index, class) in InfoClass::ALL.iter().enumerate() {
            assert_eq!(class.id() as usize, index);
            assert_eq!(InfoClass::from_id(class.id()), Some(*class));
        }
        assert_eq!(InfoClass::PatchChain.id(), 40);
        assert_eq!(InfoClass::FileFlags.id(), 53);
        assert_eq!(InfoClass::from_id(57), None);
    }

    #[test]
    fn test_value_kinds() {
        assert_eq!(InfoClass::FileName.value_kind(), ValueKind::String);
        assert_eq!(InfoClass::HashTableSize64.value_kind(), ValueKind::Int64Pair);
        assert_eq!(InfoClass::HashTableSize.value_kind(), ValueKind::Int32);
        assert_eq!(InfoClass::HashTable.value_kind(), ValueKind::RawBytes);
        assert_eq!(InfoClass::HetTable.value_kind(), ValueKind::Pointer);
        assert_eq!(InfoClass::Locale.value_kind(), ValueKind::LocaleCode);
        assert_eq!(InfoClass::FileFlags.value_kind(), ValueKind::FlagBitmask);
        assert_eq!(value_kind_for_id(200), ValueKind::RawBytes);
    }

    #[test]
    fn test_names_by_scope() {
        assert_eq!(
            InfoClass::from_name("flags", InfoScope::Archive),
            Some(InfoClass::ArchiveFlags)
        );
        assert_eq!(
            InfoClass::from_name("flags", InfoScope::File),
            Some(InfoClass::FileFlags)
        );
        assert_eq!(
            InfoClass::from_name("mpqName", InfoScope::Archive),
            Some(InfoClass::FileName)
        );
        assert_eq!(InfoClass::from_name("locale", InfoScope::Archive), None);
        assert_eq!("locale".parse::<InfoClass>().unwrap(), InfoClass::Locale);
        assert!(matches!(
            "bogus".parse::<InfoClass>(),
            Err(MpqError::UnknownInfoClass(_))
        ));
    }

    #[test]
    fn test_step_success_clamps_used_length() {
        let request = BufferRequest::initial();
        assert_eq!(next_step(request, Ok(4)), InfoStep::Decode { used: 4 });
        assert_eq!(next_step(request, Ok(400)), InfoStep::Decode { used: 12 });
    }

    #[test]
    fn test_step_grows_implicit_request() {
        let step = next_step(BufferRequest::initial(), insufficient(16384));
        assert_eq!(
            step,
            InfoStep::Retry(BufferRequest {
                size: 16388,
                explicit: false
            })
        );
    }

    #[test]
    fn test_step_explicit_request_is_fatal() {
        let step = next_step(BufferRequest::explicit(8), insufficient(64));
        assert_eq!(step, InfoStep::Fail(ErrorCode::INSUFFICIENT_BUFFER));
    }

    #[test]
    fn test_explicit_zero_means_unset() {
        assert_eq!(BufferRequest::explicit(0), BufferRequest::initial());
        let step = next_step(BufferRequest::explicit(0), insufficient(64));
        assert_eq!(
            step,
            InfoStep::Retry(BufferRequest {
                size: 68,
                explicit: false
            })
        );
    }

    #[test]
    fn test_bool_kind_is_unused_by_classes() {
        assert!(
            InfoClass::ALL
                .iter()
                .all(|class| class.value_kind() != ValueKind::Bool)
        );
        assert_eq!(
            decode(ValueKind::Bool, &1u32.to_le_bytes()).unwrap(),
            InfoValue::Int32(1)
        );
    }

    #[test]
    fn test_step_other_errors_are_fatal() {
        let step = next_step(
            BufferRequest::initial(),
            Err(InfoFailure {
                code: ErrorCode::INVALID_PARAMETER,
                required: 0,
            }),
        );
        assert_eq!(step, InfoStep::Fail(ErrorCode::INVALID_PARAMETER));
    }

    #[test]
    fn test_step_detects_stall() {
        let step = next_step(
            BufferRequest {
                size: 20,
                explicit: false,
            },
            insufficient(8),
        );
        assert_eq!(step, InfoStep::Stalled { required: 8 });
    }

    #[test]
    fn test_decode_string_strips_one_nul() {
        let value = decode(ValueKind::String, b"/tests/a.mpq\0").unwrap();
        assert_eq!(value, InfoValue::Text("/tests/a.mpq".into()));

        let value = decode(ValueKind::String, b"ab\0\0").unwrap();
        assert_eq!(value, InfoValue::Text("ab\0".into()));
    }

    #[test]
    fn test_decode_integers() {
        let bytes = [0x00, 0x04, 0x00, 0x00, 0xFF, 0xFF, 0xFF, 0xFF];
        assert_eq!(
            decode(ValueKind::Int32, &bytes).unwrap(),
            InfoValue::Int32(0x400)
        );
        assert_eq!(
            decode(ValueKind::Pointer, &bytes).unwrap(),
            InfoValue::Pointer(0x400)
        );
        assert_eq!(
            decode(ValueKind::Int64Pair, &bytes).unwrap(),
            InfoValue::Pair([0x400, 0xFFFF_FFFF])
        );
        assert_eq!(
            decode(ValueKind::Int64Pair, &bytes[..4]).unwrap(),
            InfoValue::Pair([0x400, 0])
        );
        assert_eq!(
            decode(ValueKind::Int64Pair, &bytes).unwrap().as_u64(),
            Some(0xFFFF_FFFF_0000_0400)
        );
    }

    #[test]
    fn test_decode_locale_and_flags() {
        assert_eq!(
            decode(ValueKind::LocaleCode, &0x409u32.to_le_bytes()).unwrap(),
            InfoValue::Locale("en_US")
        );
        assert_eq!(
            decode(ValueKind::LocaleCode, &[0, 0, 0, 0]).unwrap(),
            InfoValue::Locale("Neutral")
        );
        assert!(decode(ValueKind::LocaleCode, &0x7777u32.to_le_bytes()).is_err());

        let value = decode(ValueKind::FlagBitmask, &0x8000_0200u32.to_le_bytes()).unwrap();
        let flags = value.as_flags().unwrap();
        assert!(flags.compress);
        assert!(flags.exists);
    }

    #[test]
    fn test_decode_raw_bytes() {
        let value = decode(ValueKind::RawBytes, &[1, 2, 3]).unwrap();
        assert_eq!(value.as_bytes(), Some(&[1u8, 2, 3][..]));
    }
}
