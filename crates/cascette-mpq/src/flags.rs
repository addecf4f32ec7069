//! Flag codecs between named option sets and the engine's packed bitmasks
//!
//! Every flag argument the engine takes is a packed `u32`. Callers may hand
//! over that integer directly ([`FlagInput::Raw`], accepted verbatim) or a
//! named option set ([`FlagInput::Named`]) that is translated bit by bit.
//! A missing argument encodes to the domain's default.
//!
//! Four domains exist: [`FileFlags`] (how an entry is stored),
//! [`AttributeFlags`] (which extended attributes the archive keeps),
//! [`CodecSelection`] (compression algorithms) and [`VerifyFlags`]
//! (which checks a file verification runs). [`EntryFlags`] is the decoded
//! view of the flags stored for an existing entry.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MpqError, Result};

/// A packed integer domain with named bits
pub trait FlagSet {
    /// Value used when the caller passes no argument
    const DEFAULT: u32;

    /// Pack the named option set into the engine bitmask
    fn bits(&self) -> Result<u32>;
}

/// Flag argument given either as a raw bitmask or as named options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagInput<T> {
    /// Bitmask passed to the engine unchanged
    Raw(u32),
    /// Named options translated bit by bit
    Named(T),
}

impl<T: FlagSet> FlagInput<T> {
    /// Pack this argument into the engine bitmask
    pub fn encode(&self) -> Result<u32> {
        match self {
            Self::Raw(bits) => Ok(*bits),
            Self::Named(named) => named.bits(),
        }
    }
}

impl<T> From<u32> for FlagInput<T> {
    fn from(bits: u32) -> Self {
        Self::Raw(bits)
    }
}

/// Pack an optional flag argument, falling back to the domain default
pub fn encode<T: FlagSet>(input: Option<&FlagInput<T>>) -> Result<u32> {
    input.map_or(Ok(T::DEFAULT), FlagInput::encode)
}

/// Storage flags for an archived file
///
/// `compression` doubles as an alias for `compress`: a non-empty selection
/// sets the compress bit. It also carries the algorithms used when the
/// file is added, with `compression_header` overriding them for the first
/// sector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct FileFlags {
    /// Legacy PKWARE implode
    pub implode: bool,
    /// Multi-algorithm compression
    pub compress: bool,
    /// Encrypt the file data
    pub encrypt: bool,
    /// Adjust the encryption key by block position
    pub fix_key: bool,
    /// Store as a single unit instead of sectors
    pub single_unit: bool,
    /// Deletion marker
    pub deleted: bool,
    /// Store a CRC per sector
    #[serde(rename = "sectorCRC")]
    pub sector_crc: bool,
    /// Overwrite an existing entry of the same name
    pub replace: bool,
    /// Compression algorithms for the file
    pub compression: Option<CompressionInput>,
    /// Compression algorithms for the first sector only
    pub compression_header: Option<CompressionInput>,
}

impl FileFlags {
    /// Imploded with PKWARE DCL
    pub const IMPLODE: u32 = 0x0000_0100;
    /// Compressed with one or more codecs
    pub const COMPRESS: u32 = 0x0000_0200;
    /// Encrypted
    pub const ENCRYPTED: u32 = 0x0001_0000;
    /// Encryption key adjusted by block offset
    pub const FIX_KEY: u32 = 0x0002_0000;
    /// Stored as a single unit
    pub const SINGLE_UNIT: u32 = 0x0100_0000;
    /// Deletion marker
    pub const DELETE_MARKER: u32 = 0x0200_0000;
    /// Per-sector CRC present
    pub const SECTOR_CRC: u32 = 0x0400_0000;
    /// Replace existing entry. Calling convention of the add operation, never stored.
    pub const REPLACE_EXISTING: u32 = 0x8000_0000;

    /// Flags used when the caller passes none
    pub const DEFAULT_BITS: u32 = 0x8001_0200;

    /// Compression for the whole file, `None` if not given
    pub fn compression_bits(&self) -> Result<Option<u32>> {
        self.compression.as_ref().map(FlagInput::encode).transpose()
    }

    /// Compression for the first sector: the header selection if given,
    /// otherwise the file selection
    pub fn header_compression_bits(&self) -> Result<Option<u32>> {
        match &self.compression_header {
            Some(header) => header.encode().map(Some),
            None => self.compression_bits(),
        }
    }

    fn compression_selected(&self) -> bool {
        self.compression.as_ref().is_some_and(|selection| match selection {
            FlagInput::Raw(bits) => *bits != 0,
            FlagInput::Named(CodecSelection::One(name)) => !name.is_empty(),
            FlagInput::Named(CodecSelection::Many(_)) => true,
        })
    }
}

impl FlagSet for FileFlags {
    const DEFAULT: u32 = Self::DEFAULT_BITS;

    fn bits(&self) -> Result<u32> {
        // Reject unknown codec names even though only the alias bit is used here
        self.compression_bits()?;
        self.header_compression_bits()?;

        let mut bits = 0;
        if self.implode {
            bits |= Self::IMPLODE;
        }
        if self.compress || self.compression_selected() {
            bits |= Self::COMPRESS;
        }
        if self.encrypt {
            bits |= Self::ENCRYPTED;
        }
        if self.fix_key {
            bits |= Self::FIX_KEY;
        }
        if self.single_unit {
            bits |= Self::SINGLE_UNIT;
        }
        if self.deleted {
            bits |= Self::DELETE_MARKER;
        }
        if self.sector_crc {
            bits |= Self::SECTOR_CRC;
        }
        if self.replace {
            bits |= Self::REPLACE_EXISTING;
        }
        Ok(bits)
    }
}

impl From<FileFlags> for FlagInput<FileFlags> {
    fn from(flags: FileFlags) -> Self {
        Self::Named(flags)
    }
}

/// Extended attributes kept by an archive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct AttributeFlags {
    /// CRC32 of each file
    pub crc32: bool,
    /// File time of each file
    pub time: bool,
    /// MD5 of each file
    pub md5: bool,
    /// Patch bit of each file
    pub patch_bit: bool,
}

impl AttributeFlags {
    /// CRC32 attribute
    pub const CRC32: u32 = 0x1;
    /// File time attribute
    pub const FILETIME: u32 = 0x2;
    /// MD5 attribute
    pub const MD5: u32 = 0x4;
    /// Patch bit attribute
    pub const PATCH_BIT: u32 = 0x8;
}

impl FlagSet for AttributeFlags {
    const DEFAULT: u32 = 0;

    fn bits(&self) -> Result<u32> {
        Ok([
            (self.crc32, Self::CRC32),
            (self.time, Self::FILETIME),
            (self.md5, Self::MD5),
            (self.patch_bit, Self::PATCH_BIT),
        ]
        .iter()
        .filter(|(set, _)| *set)
        .fold(0, |acc, (_, bit)| acc | bit))
    }
}

impl From<AttributeFlags> for FlagInput<AttributeFlags> {
    fn from(flags: AttributeFlags) -> Self {
        Self::Named(flags)
    }
}

/// Checks run by a file verification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VerifyFlags {
    /// Verify sector CRCs
    #[serde(rename = "sectorCRC")]
    pub sector_crc: bool,
    /// Verify the file CRC32 attribute
    #[serde(rename = "fileCRC")]
    pub file_crc: bool,
    /// Verify the file MD5 attribute
    #[serde(rename = "fileMD5")]
    pub file_md5: bool,
    /// Verify the raw data MD5
    #[serde(rename = "rawMD5")]
    pub raw_md5: bool,
}

impl VerifyFlags {
    /// Sector CRC check
    pub const SECTOR_CRC: u32 = 0x1;
    /// File CRC check
    pub const FILE_CRC: u32 = 0x2;
    /// File MD5 check
    pub const FILE_MD5: u32 = 0x4;
    /// Raw MD5 check
    pub const RAW_MD5: u32 = 0x8;
    /// Every check
    pub const ALL: u32 = 0xF;
}

impl FlagSet for VerifyFlags {
    const DEFAULT: u32 = Self::ALL;

    fn bits(&self) -> Result<u32> {
        Ok([
            (self.sector_crc, Self::SECTOR_CRC),
            (self.file_crc, Self::FILE_CRC),
            (self.file_md5, Self::FILE_MD5),
            (self.raw_md5, Self::RAW_MD5),
        ]
        .iter()
        .filter(|(set, _)| *set)
        .fold(0, |acc, (_, bit)| acc | bit))
    }
}

impl From<VerifyFlags> for FlagInput<VerifyFlags> {
    fn from(flags: VerifyFlags) -> Self {
        Self::Named(flags)
    }
}

/// Compression algorithm known to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    /// Huffman (WAVE files only)
    Huffman,
    /// Deflate
    Zlib,
    /// PKWARE DCL implode
    Pkware,
    /// bzip2
    Bzip2,
    /// LZMA
    Lzma,
    /// Sparse
    Sparse,
    /// IMA ADPCM mono
    AdpcmMono,
    /// IMA ADPCM stereo
    AdpcmStereo,
}

impl Codec {
    /// All codecs in bit order
    pub const ALL: [Self; 8] = [
        Self::Huffman,
        Self::Zlib,
        Self::Pkware,
        Self::Bzip2,
        Self::Lzma,
        Self::Sparse,
        Self::AdpcmMono,
        Self::AdpcmStereo,
    ];

    /// Engine bitmask for this codec
    pub const fn bits(self) -> u32 {
        match self {
            Self::Huffman => 0x01,
            Self::Zlib => 0x02,
            Self::Pkware => 0x08,
            Self::Bzip2 => 0x10,
            Self::Lzma => 0x12,
            Self::Sparse => 0x20,
            Self::AdpcmMono => 0x40,
            Self::AdpcmStereo => 0x80,
        }
    }

    /// Option name of this codec
    pub const fn name(self) -> &'static str {
        match self {
            Self::Huffman => "huffman",
            Self::Zlib => "zlib",
            Self::Pkware => "pkware",
            Self::Bzip2 => "bzip2",
            Self::Lzma => "lzma",
            Self::Sparse => "sparse",
            Self::AdpcmMono => "adpcmMono",
            Self::AdpcmStereo => "adpcmStereo",
        }
    }
}

impl FromStr for Codec {
    type Err = MpqError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|codec| codec.name() == s)
            .ok_or_else(|| MpqError::UnknownFlagName(format!("compression type {s}")))
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Compression given by codec name, or an ordered list of names
///
/// A list ORs its codecs together, so order does not change the result.
/// An empty list selects nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CodecSelection {
    /// Single codec name
    One(String),
    /// Codec names combined
    Many(Vec<String>),
}

/// Compression argument: raw bitmask or codec names
pub type CompressionInput = FlagInput<CodecSelection>;

impl FlagSet for CodecSelection {
    const DEFAULT: u32 = Codec::Pkware.bits();

    fn bits(&self) -> Result<u32> {
        match self {
            Self::One(name) => name.parse::<Codec>().map(Codec::bits),
            Self::Many(names) => names
                .iter()
                .map(|name| name.parse::<Codec>().map(Codec::bits))
                .try_fold(0, |acc, bits| bits.map(|bits| acc | bits)),
        }
    }
}

impl From<Codec> for CompressionInput {
    fn from(codec: Codec) -> Self {
        Self::Named(CodecSelection::One(codec.name().to_string()))
    }
}

impl From<&str> for CompressionInput {
    fn from(name: &str) -> Self {
        Self::Named(CodecSelection::One(name.to_string()))
    }
}

impl From<&[&str]> for CompressionInput {
    fn from(names: &[&str]) -> Self {
        Self::Named(CodecSelection::Many(
            names.iter().map(ToString::to_string).collect(),
        ))
    }
}

impl From<&[Codec]> for CompressionInput {
    fn from(codecs: &[Codec]) -> Self {
        Self::Named(CodecSelection::Many(
            codecs.iter().map(|codec| codec.name().to_string()).collect(),
        ))
    }
}

/// Decoded flags of an existing archive entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryFlags {
    /// Imploded with PKWARE DCL
    pub implode: bool,
    /// Compressed
    pub compress: bool,
    /// Encrypted
    pub encrypt: bool,
    /// Key adjusted by block offset
    pub fix_key: bool,
    /// Stored as a single unit
    pub single_unit: bool,
    /// Deletion marker
    pub deleted: bool,
    /// Per-sector CRC present
    #[serde(rename = "sectorCRC")]
    pub sector_crc: bool,
    /// Bit 28, set by some writers; meaning undocumented
    #[serde(rename = "0x10000000")]
    pub unknown_0x10000000: bool,
    /// Entry exists
    pub exists: bool,
    /// Flags as stored
    pub raw_flags: u32,
}

impl EntryFlags {
    /// Undocumented bit 28
    pub const UNKNOWN_0X10000000: u32 = 0x1000_0000;
    /// Entry exists
    pub const EXISTS: u32 = 0x8000_0000;

    /// Decode a stored flags value
    pub const fn decode(raw: u32) -> Self {
        Self {
            implode: raw & FileFlags::IMPLODE != 0,
            compress: raw & FileFlags::COMPRESS != 0,
            encrypt: raw & FileFlags::ENCRYPTED != 0,
            fix_key: raw & FileFlags::FIX_KEY != 0,
            single_unit: raw & FileFlags::SINGLE_UNIT != 0,
            deleted: raw & FileFlags::DELETE_MARKER != 0,
            sector_crc: raw & FileFlags::SECTOR_CRC != 0,
            unknown_0x10000000: raw & Self::UNKNOWN_0X10000000 != 0,
            exists: raw & Self::EXISTS != 0,
            raw_flags: raw,
        }
    }

    /// Check if a raw flag is set
    pub const fn has(&self, flag: u32) -> bool {
        (self.raw_flags & flag) != 0
    }
}

impl From<u32> for EntryFlags {
    fn from(raw: u32) -> Self {
        Self::decode(raw)
    }
}

impl fmt::Display for EntryFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.raw_flags)
    }
}
