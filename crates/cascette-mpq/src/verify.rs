//! Verification status codes and their acceptance rules

/// Archive status: no signature present
pub const ARCHIVE_NO_SIGNATURE: u32 = 0;
/// Archive status: verification could not run
pub const ARCHIVE_VERIFY_FAILED: u32 = 1;
/// Archive status: weak signature checks out
pub const ARCHIVE_WEAK_SIGNATURE_OK: u32 = 2;
/// Archive status: weak signature does not match
pub const ARCHIVE_WEAK_SIGNATURE_ERROR: u32 = 3;
/// Archive status: strong signature checks out
pub const ARCHIVE_STRONG_SIGNATURE_OK: u32 = 4;
/// Archive status: strong signature does not match
pub const ARCHIVE_STRONG_SIGNATURE_ERROR: u32 = 5;

/// File could not be opened
pub const VERIFY_OPEN_ERROR: u32 = 0x0001;
/// File could not be read
pub const VERIFY_READ_ERROR: u32 = 0x0002;
/// File has sector CRCs
pub const VERIFY_FILE_HAS_SECTOR_CRC: u32 = 0x0004;
/// A sector CRC did not match
pub const VERIFY_FILE_SECTOR_CRC_ERROR: u32 = 0x0008;
/// File has a CRC32 attribute
pub const VERIFY_FILE_HAS_CHECKSUM: u32 = 0x0010;
/// CRC32 attribute did not match
pub const VERIFY_FILE_CHECKSUM_ERROR: u32 = 0x0020;
/// File has an MD5 attribute
pub const VERIFY_FILE_HAS_MD5: u32 = 0x0040;
/// MD5 attribute did not match
pub const VERIFY_FILE_MD5_ERROR: u32 = 0x0080;
/// File has raw chunk MD5s
pub const VERIFY_FILE_HAS_RAW_MD5: u32 = 0x0100;
/// A raw chunk MD5 did not match
pub const VERIFY_FILE_RAW_MD5_ERROR: u32 = 0x0200;

/// Every failure bit of a file verification
pub const VERIFY_FILE_ERROR_MASK: u32 = VERIFY_OPEN_ERROR
    | VERIFY_READ_ERROR
    | VERIFY_FILE_SECTOR_CRC_ERROR
    | VERIFY_FILE_CHECKSUM_ERROR
    | VERIFY_FILE_MD5_ERROR
    | VERIFY_FILE_RAW_MD5_ERROR;

/// Check if an archive status counts as verified
///
/// Even statuses pass: no signature, or a signature that checks out.
pub const fn archive_passed(status: u32) -> bool {
    status & 1 == 0
}

/// Check if a file status has no failure bit set
pub const fn file_passed(status: u32) -> bool {
    status & VERIFY_FILE_ERROR_MASK == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mask() {
        assert_eq!(VERIFY_FILE_ERROR_MASK, 0x2AB);
    }

    #[test]
    fn test_archive_statuses() {
        assert!(archive_passed(ARCHIVE_NO_SIGNATURE));
        assert!(archive_passed(ARCHIVE_WEAK_SIGNATURE_OK));
        assert!(archive_passed(ARCHIVE_STRONG_SIGNATURE_OK));
        assert!(!archive_passed(ARCHIVE_VERIFY_FAILED));
        assert!(!archive_passed(ARCHIVE_WEAK_SIGNATURE_ERROR));
        assert!(!archive_passed(ARCHIVE_STRONG_SIGNATURE_ERROR));
    }

    #[test]
    fn test_file_statuses() {
        assert!(file_passed(0));
        assert!(file_passed(VERIFY_FILE_HAS_MD5));
        assert!(file_passed(VERIFY_FILE_HAS_CHECKSUM | VERIFY_FILE_HAS_SECTOR_CRC));
        assert!(!file_passed(VERIFY_OPEN_ERROR));
        assert!(!file_passed(VERIFY_FILE_HAS_CHECKSUM | VERIFY_FILE_RAW_MD5_ERROR));
        assert!(!file_passed(VERIFY_FILE_MD5_ERROR));
    }
}
