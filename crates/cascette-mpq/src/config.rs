//! Options for opening and creating archives
//!
//! Both option sets deserialize from JSON with camelCase keys, so tool
//! configuration can be kept next to the archives it describes:
//!
//! ```
//! use cascette_mpq::config::CreateOptions;
//!
//! let options = CreateOptions::from_json(r#"{ "version": 2, "maxFiles": 64 }"#).unwrap();
//! assert_eq!(options.max_files, 64);
//! ```

use serde::{Deserialize, Serialize};

use crate::engine::{
    CreateInfo, DEFAULT_SECTOR_SIZE, HASH_TABLE_SIZE_MAX, HASH_TABLE_SIZE_MIN,
    STREAM_FLAG_READ_ONLY,
};
use crate::error::{MpqError, Result};
use crate::flags::{self, AttributeFlags, FileFlags, FlagInput};

/// Maximum file count used when none is given
pub const DEFAULT_MAX_FILES: u32 = 1000;

/// Named open flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct OpenOptions {
    /// Open without write access
    pub read_only: bool,
    /// Partial (trial) archive
    pub partial: bool,
    /// Encrypted MPQE archive
    pub mpqe: bool,
    /// Archive split into 16 KiB blocks with MD5s
    pub block4: bool,
    /// Use the file bitmap of a partial download
    pub use_bitmap: bool,
    /// Ignore the `(listfile)`
    pub no_listfile: bool,
    /// Ignore `(attributes)`
    pub no_attributes: bool,
    /// Only look for the header at offset 0
    pub no_header_search: bool,
    /// Treat the archive as format version 1
    pub force_mpq_v1: bool,
    /// Check sector CRCs while reading
    #[serde(rename = "checkSectorCRC")]
    pub check_sector_crc: bool,
}

impl OpenOptions {
    /// Partial stream provider
    pub const PARTIAL: u32 = 0x0000_0010;
    /// Encrypted stream provider
    pub const MPQE: u32 = 0x0000_0020;
    /// Block4 stream provider
    pub const BLOCK4: u32 = 0x0000_0030;
    /// Use the stream bitmap
    pub const USE_BITMAP: u32 = 0x0000_0400;
    /// Skip the listfile
    pub const NO_LISTFILE: u32 = 0x0001_0000;
    /// Skip the attributes file
    pub const NO_ATTRIBUTES: u32 = 0x0002_0000;
    /// No header search
    pub const NO_HEADER_SEARCH: u32 = 0x0004_0000;
    /// Force version 1
    pub const FORCE_MPQ_V1: u32 = 0x0008_0000;
    /// Check sector CRCs
    pub const CHECK_SECTOR_CRC: u32 = 0x0010_0000;

    /// Read-only open options
    pub const fn read_only() -> Self {
        Self {
            read_only: true,
            partial: false,
            mpqe: false,
            block4: false,
            use_bitmap: false,
            no_listfile: false,
            no_attributes: false,
            no_header_search: false,
            force_mpq_v1: false,
            check_sector_crc: false,
        }
    }

    /// Set read-only access
    #[must_use]
    pub const fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Skip the listfile
    #[must_use]
    pub const fn with_no_listfile(mut self, no_listfile: bool) -> Self {
        self.no_listfile = no_listfile;
        self
    }

    /// Check sector CRCs while reading
    #[must_use]
    pub const fn with_check_sector_crc(mut self, check: bool) -> Self {
        self.check_sector_crc = check;
        self
    }

    /// Pack into the engine's open flags
    pub fn bits(&self) -> u32 {
        [
            (self.read_only, STREAM_FLAG_READ_ONLY),
            (self.partial, Self::PARTIAL),
            (self.mpqe, Self::MPQE),
            (self.block4, Self::BLOCK4),
            (self.use_bitmap, Self::USE_BITMAP),
            (self.no_listfile, Self::NO_LISTFILE),
            (self.no_attributes, Self::NO_ATTRIBUTES),
            (self.no_header_search, Self::NO_HEADER_SEARCH),
            (self.force_mpq_v1, Self::FORCE_MPQ_V1),
            (self.check_sector_crc, Self::CHECK_SECTOR_CRC),
        ]
        .iter()
        .filter(|(set, _)| *set)
        .fold(0, |acc, (_, bit)| acc | bit)
    }
}

/// How an archive is opened
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OpenMode {
    /// Read-write, no special handling
    #[default]
    Default,
    /// Read-only
    ReadOnly,
    /// Flags passed to the engine unchanged
    Raw(u32),
    /// Named options
    Options(OpenOptions),
}

impl OpenMode {
    /// Pack into the engine's open flags
    pub fn bits(&self) -> u32 {
        match self {
            Self::Default => 0,
            Self::ReadOnly => STREAM_FLAG_READ_ONLY,
            Self::Raw(bits) => *bits,
            Self::Options(options) => options.bits(),
        }
    }
}

impl From<OpenOptions> for OpenMode {
    fn from(options: OpenOptions) -> Self {
        Self::Options(options)
    }
}

impl From<u32> for OpenMode {
    fn from(bits: u32) -> Self {
        Self::Raw(bits)
    }
}

/// Layout options for a new archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct CreateOptions {
    /// Format version, 1 to 4
    pub version: u32,
    /// Stream flags
    pub stream_flags: u32,
    /// Flags for the `(listfile)` entry
    pub file_flags_listfile: Option<FlagInput<FileFlags>>,
    /// Flags for the `(attributes)` entry
    pub file_flags_attributes: Option<FlagInput<FileFlags>>,
    /// Flags for the `(signature)` entry
    pub file_flags_signature: Option<FlagInput<FileFlags>>,
    /// Extended attributes to keep
    pub attribute_flags: Option<FlagInput<AttributeFlags>>,
    /// Sector size in bytes
    pub sector_size: u32,
    /// Raw chunk size for MD5 chunks, 0 for none
    pub raw_chunk_size: u32,
    /// Maximum number of files
    pub max_files: u32,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            version: 1,
            stream_flags: 0,
            file_flags_listfile: None,
            file_flags_attributes: None,
            file_flags_signature: None,
            attribute_flags: None,
            sector_size: DEFAULT_SECTOR_SIZE,
            raw_chunk_size: 0,
            max_files: DEFAULT_MAX_FILES,
        }
    }
}

impl CreateOptions {
    /// Create options with every field at its default
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse options from a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Set the format version (1-based)
    #[must_use]
    pub const fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Set the maximum file count
    #[must_use]
    pub const fn with_max_files(mut self, max_files: u32) -> Self {
        self.max_files = max_files;
        self
    }

    /// Set the sector size
    #[must_use]
    pub const fn with_sector_size(mut self, sector_size: u32) -> Self {
        self.sector_size = sector_size;
        self
    }

    /// Set the raw chunk size
    #[must_use]
    pub const fn with_raw_chunk_size(mut self, raw_chunk_size: u32) -> Self {
        self.raw_chunk_size = raw_chunk_size;
        self
    }

    /// Set the attribute flags
    #[must_use]
    pub fn with_attributes(mut self, attributes: impl Into<FlagInput<AttributeFlags>>) -> Self {
        self.attribute_flags = Some(attributes.into());
        self
    }

    /// Set the flags of the `(listfile)` entry
    #[must_use]
    pub fn with_listfile_flags(mut self, flags: impl Into<FlagInput<FileFlags>>) -> Self {
        self.file_flags_listfile = Some(flags.into());
        self
    }

    /// Translate into the engine's create parameters
    pub fn to_create_info(&self) -> Result<CreateInfo> {
        let mpq_version = self.version.checked_sub(1).ok_or_else(|| {
            MpqError::InvalidOptionCombination("archive version starts at 1".to_string())
        })?;

        Ok(CreateInfo {
            mpq_version,
            stream_flags: self.stream_flags,
            file_flags_listfile: flags::encode(self.file_flags_listfile.as_ref())?,
            file_flags_attributes: flags::encode(self.file_flags_attributes.as_ref())?,
            file_flags_signature: flags::encode(self.file_flags_signature.as_ref())?,
            attr_flags: flags::encode(self.attribute_flags.as_ref())?,
            sector_size: self.sector_size,
            raw_chunk_size: self.raw_chunk_size,
            max_file_count: self.max_files,
        })
    }
}

/// How an archive is created
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CreateMode {
    /// Version 1 archive with a listfile and room for 1000 files
    #[default]
    Default,
    /// Packed create flags
    Flags {
        /// Create flags passed to the engine unchanged
        flags: u32,
        /// Maximum number of files
        max_files: u32,
    },
    /// Explicit layout options
    Options(CreateOptions),
}

impl CreateMode {
    /// Packed create flags with the default file limit
    pub const fn flags(flags: u32) -> Self {
        Self::Flags {
            flags,
            max_files: DEFAULT_MAX_FILES,
        }
    }

    /// Parameters for the default layout
    pub const fn default_info() -> CreateInfo {
        CreateInfo {
            mpq_version: 0,
            stream_flags: 0,
            file_flags_listfile: FileFlags::DEFAULT_BITS,
            file_flags_attributes: 0,
            file_flags_signature: 0,
            attr_flags: 0,
            sector_size: DEFAULT_SECTOR_SIZE,
            raw_chunk_size: 0,
            max_file_count: DEFAULT_MAX_FILES,
        }
    }
}

impl From<CreateOptions> for CreateMode {
    fn from(options: CreateOptions) -> Self {
        Self::Options(options)
    }
}

/// Reject file counts the engine's hash table cannot hold
pub const fn check_max_files(count: u32) -> Result<()> {
    if count < HASH_TABLE_SIZE_MIN || count > HASH_TABLE_SIZE_MAX {
        return Err(MpqError::MaxFileCountOutOfRange {
            count,
            min: HASH_TABLE_SIZE_MIN,
            max: HASH_TABLE_SIZE_MAX,
        });
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_open_modes() {
        assert_eq!(OpenMode::Default.bits(), 0);
        assert_eq!(OpenMode::ReadOnly.bits(), 0x100);
        assert_eq!(OpenMode::Raw(0x30).bits(), 0x30);
        assert_eq!(OpenMode::from(OpenOptions::read_only()).bits(), 0x100);
    }

    #[test]
    fn test_open_options_bits() {
        let options = OpenOptions::default()
            .with_read_only(true)
            .with_no_listfile(true)
            .with_check_sector_crc(true);
        assert_eq!(options.bits(), 0x0011_0100);
    }

    #[test]
    fn test_open_options_from_json() {
        let options: OpenOptions =
            serde_json::from_str(r#"{ "forceMpqV1": true, "checkSectorCRC": true }"#).unwrap();
        assert_eq!(options.bits(), 0x0018_0000);

        let unknown = serde_json::from_str::<OpenOptions>(r#"{ "writeable": true }"#);
        assert!(unknown.is_err());
    }

    #[test]
    fn test_create_options_defaults() {
        let info = CreateOptions::default().to_create_info().unwrap();
        assert_eq!(info.mpq_version, 0);
        assert_eq!(info.file_flags_listfile, FileFlags::DEFAULT_BITS);
        assert_eq!(info.attr_flags, 0);
        assert_eq!(info.sector_size, 0x1000);
        assert_eq!(info.max_file_count, 1000);
    }

    #[test]
    fn test_create_options_from_json() {
        let options = CreateOptions::from_json(
            r#"{
                "version": 2,
                "attributeFlags": { "crc32": true, "md5": true },
                "fileFlagsListfile": 512,
                "maxFiles": 64
            }"#,
        )
        .unwrap();
        let info = options.to_create_info().unwrap();
        assert_eq!(info.mpq_version, 1);
        assert_eq!(info.attr_flags, 0x5);
        assert_eq!(info.file_flags_listfile, 0x200);
        assert_eq!(info.max_file_count, 64);
    }

    #[test]
    fn test_create_options_version_zero() {
        let err = CreateOptions::new()
            .with_version(0)
            .to_create_info()
            .expect_err("version 0 is not a format");
        assert!(matches!(err, MpqError::InvalidOptionCombination(_)));
    }

    #[test]
    fn test_create_options_unknown_flag() {
        let options = CreateOptions::from_json(
            r#"{ "fileFlagsListfile": { "compression": "snappy" } }"#,
        )
        .unwrap();
        assert!(matches!(
            options.to_create_info(),
            Err(MpqError::UnknownFlagName(_))
        ));
    }

    #[test]
    fn test_default_info() {
        let info = CreateMode::default_info();
        assert_eq!(info.file_flags_listfile, 0x8001_0200);
        assert_eq!(info.max_file_count, 1000);
    }

    #[test]
    fn test_check_max_files() {
        check_max_files(4).unwrap();
        check_max_files(0x8_0000).unwrap();
        assert!(matches!(
            check_max_files(3),
            Err(MpqError::MaxFileCountOutOfRange { count: 3, .. })
        ));
        assert!(check_max_files(0x8_0001).is_err());
    }
}
