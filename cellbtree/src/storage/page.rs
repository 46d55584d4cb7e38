//! Page types and constants for the storage engine.
//!
//! Every tree file is a sequence of 8KB pages. A `Page` handed out by a
//! page store is leased from a [`BufferPool`]; holding it is what pins the
//! buffer, and dropping it returns the buffer to the pool.

use std::sync::Arc;

use crate::storage::buffer_pool::BufferPool;

/// Page size in bytes (8KB).
pub const PAGE_SIZE: usize = 8192;

/// Page size as u64 for offset calculations.
pub const PAGE_SIZE_U64: u64 = PAGE_SIZE as u64;

/// Index of a page inside one logical file (0-indexed).
pub type PageIndex = u32;

/// On-disk encoding of "no page" in page links (`-1` as a signed int32).
pub const NO_PAGE: u32 = u32::MAX;

/// Page type identifiers stored in page headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    /// Main file entry point (page 0 only)
    EntryPoint = 0x01,
    /// Leaf bucket
    LeafBucket = 0x02,
    /// Non-leaf bucket
    NonLeafBucket = 0x03,
    /// Null file entry point (page 0 only)
    NullEntryPoint = 0x04,
    /// Bucket of values stored under the null key
    NullBucket = 0x05,
}

impl TryFrom<u8> for PageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::EntryPoint),
            0x02 => Ok(Self::LeafBucket),
            0x03 => Ok(Self::NonLeafBucket),
            0x04 => Ok(Self::NullEntryPoint),
            0x05 => Ok(Self::NullBucket),
            _ => Err(value),
        }
    }
}

/// Common page header present at the start of every page.
///
/// Layout:
/// - `page_type`: 1 byte
/// - `flags`: 1 byte
/// - `checksum`: 4 bytes (CRC32)
/// - `reserved`: 2 bytes
///
/// Total: 8 bytes
#[derive(Debug, Copy, Clone)]
pub struct PageHeader {
    pub page_type: PageType,
    pub flags: u8,
    pub checksum: u32,
}

impl PageHeader {
    /// Size of the page header in bytes.
    pub const SIZE: usize = 8;

    /// Offset of the checksum field inside the header.
    pub const CHECKSUM_OFFSET: usize = 2;

    /// Serialize the header to bytes.
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.page_type as u8;
        buf[1] = self.flags;
        buf[2..6].copy_from_slice(&self.checksum.to_le_bytes());
        // bytes 6-7 reserved
        buf
    }

    /// Deserialize a header from bytes.
    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Result<Self, PageError> {
        let page_type = PageType::try_from(bytes[0]).map_err(PageError::InvalidPageType)?;
        let flags = bytes[1];
        let checksum = u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);

        Ok(Self {
            page_type,
            flags,
            checksum,
        })
    }

    /// Write a fresh header of the given type (checksum left to the store).
    pub fn init(page: &mut Page, page_type: PageType) {
        let header = Self {
            page_type,
            flags: 0,
            checksum: 0,
        };
        page.write_bytes(0, &header.to_bytes());
    }
}

/// Backing buffer of a page that is never read before it is written.
static EMPTY_PAGE: [u8; PAGE_SIZE] = [0u8; PAGE_SIZE];

/// A raw page buffer.
///
/// Pages leased from a pool hand their buffer back on drop. Pages created
/// with [`Page::new`] own a private buffer.
pub struct Page {
    data: Option<Box<[u8; PAGE_SIZE]>>,
    pool: Option<Arc<BufferPool>>,
}

impl Page {
    /// Create a new zeroed page that does not belong to any pool.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Some(Box::new([0u8; PAGE_SIZE])),
            pool: None,
        }
    }

    /// Wrap a buffer leased from `pool`; the buffer goes back on drop.
    #[must_use]
    pub const fn from_pool(buffer: Box<[u8; PAGE_SIZE]>, pool: Arc<BufferPool>) -> Self {
        Self {
            data: Some(buffer),
            pool: Some(pool),
        }
    }

    /// Copy this page into a new page that does not hold a pool buffer.
    #[must_use]
    pub fn detached_copy(&self) -> Self {
        let mut copy = Self::new();
        copy.as_bytes_mut().copy_from_slice(self.as_bytes());
        copy
    }

    /// Get the raw page data.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        self.data.as_deref().unwrap_or(&EMPTY_PAGE)
    }

    /// Get mutable access to the raw page data.
    pub fn as_bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        self.data.get_or_insert_with(|| Box::new([0u8; PAGE_SIZE]))
    }

    /// Read bytes at a specific offset.
    #[must_use]
    pub fn read_bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.as_bytes()[offset..offset + len]
    }

    /// Write bytes at a specific offset.
    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.as_bytes_mut()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Read a u8 at the given offset.
    #[must_use]
    pub fn read_u8(&self, offset: usize) -> u8 {
        self.as_bytes()[offset]
    }

    /// Write a u8 at the given offset.
    pub fn write_u8(&mut self, offset: usize, value: u8) {
        self.as_bytes_mut()[offset] = value;
    }

    /// Read a u16 (little-endian) at the given offset.
    #[must_use]
    pub fn read_u16(&self, offset: usize) -> u16 {
        let data = self.as_bytes();
        u16::from_le_bytes([data[offset], data[offset + 1]])
    }

    /// Write a u16 (little-endian) at the given offset.
    pub fn write_u16(&mut self, offset: usize, value: u16) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    /// Read a u32 (little-endian) at the given offset.
    #[must_use]
    pub fn read_u32(&self, offset: usize) -> u32 {
        let data = self.as_bytes();
        u32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ])
    }

    /// Write a u32 (little-endian) at the given offset.
    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    /// Read an i64 (little-endian) at the given offset.
    #[must_use]
    pub fn read_i64(&self, offset: usize) -> i64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.read_bytes(offset, 8));
        i64::from_le_bytes(buf)
    }

    /// Write an i64 (little-endian) at the given offset.
    pub fn write_i64(&mut self, offset: usize, value: i64) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    /// Read a page link; [`NO_PAGE`] decodes to `None`.
    #[must_use]
    pub fn read_link(&self, offset: usize) -> Option<PageIndex> {
        let value = self.read_u32(offset);
        (value != NO_PAGE).then_some(value)
    }

    /// Write a page link; `None` is stored as [`NO_PAGE`].
    pub fn write_link(&mut self, offset: usize, link: Option<PageIndex>) {
        self.write_u32(offset, link.unwrap_or(NO_PAGE));
    }

    /// Type byte of the page header, if it names a known page type.
    pub fn page_type(&self) -> Result<PageType, PageError> {
        PageType::try_from(self.read_u8(0)).map_err(PageError::InvalidPageType)
    }

    /// Whether the page has never been written (all header bytes zero).
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.as_bytes()[..PageHeader::SIZE].iter().all(|b| *b == 0)
    }

    /// Compute CRC32 checksum of the page data (excluding the checksum field itself).
    #[must_use]
    pub fn compute_checksum(&self) -> u32 {
        let data = self.as_bytes();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&data[0..2]); // page_type + flags
        hasher.update(&[0u8; 4]); // zero out checksum field
        hasher.update(&data[6..]); // rest of page
        hasher.finalize()
    }

    /// Stored checksum from the header.
    #[must_use]
    pub fn stored_checksum(&self) -> u32 {
        self.read_u32(PageHeader::CHECKSUM_OFFSET)
    }

    /// Recompute and store the header checksum.
    pub fn seal(&mut self) {
        let checksum = self.compute_checksum();
        self.write_u32(PageHeader::CHECKSUM_OFFSET, checksum);
    }

    /// Verify the stored checksum of a written page. Blank pages pass.
    pub fn verify_checksum(&self) -> Result<(), PageError> {
        if self.is_blank() {
            return Ok(());
        }
        let expected = self.stored_checksum();
        let actual = self.compute_checksum();
        if expected == actual {
            Ok(())
        } else {
            Err(PageError::ChecksumMismatch { expected, actual })
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        if let (Some(pool), Some(buffer)) = (self.pool.take(), self.data.take()) {
            pool.return_buffer(buffer);
        }
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("first_16_bytes", &&self.as_bytes()[..16])
            .field("pooled", &self.pool.is_some())
            .finish_non_exhaustive()
    }
}

/// Errors related to page operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageError {
    /// Invalid page type byte.
    InvalidPageType(u8),
    /// Checksum mismatch.
    ChecksumMismatch { expected: u32, actual: u32 },
}

impl std::fmt::Display for PageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPageType(v) => write!(f, "invalid page type: 0x{v:02x}"),
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: expected {expected}, got {actual}")
            }
        }
    }
}

impl std::error::Error for PageError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_header_roundtrip() {
        let header = PageHeader {
            page_type: PageType::LeafBucket,
            flags: 0x42,
            checksum: 0xDEAD_BEEF,
        };

        let bytes = header.to_bytes();
        let restored = PageHeader::from_bytes(bytes).expect("should parse");

        assert_eq!(restored.page_type, PageType::LeafBucket);
        assert_eq!(restored.flags, 0x42);
        assert_eq!(restored.checksum, 0xDEAD_BEEF);
    }

    #[test]
    fn test_page_read_write() {
        let mut page = Page::new();

        page.write_u8(0, 0xFF);
        assert_eq!(page.read_u8(0), 0xFF);

        page.write_u16(50, 0xBEEF);
        assert_eq!(page.read_u16(50), 0xBEEF);

        page.write_u32(100, 0x1234_5678);
        assert_eq!(page.read_u32(100), 0x1234_5678);

        page.write_i64(200, -42);
        assert_eq!(page.read_i64(200), -42);

        page.write_bytes(500, b"hello");
        assert_eq!(page.read_bytes(500, 5), b"hello");
    }

    #[test]
    fn test_links_encode_missing_page_as_minus_one() {
        let mut page = Page::new();
        page.write_link(16, None);
        assert_eq!(page.read_bytes(16, 4), (-1i32).to_le_bytes());
        assert_eq!(page.read_link(16), None);

        page.write_link(16, Some(7));
        assert_eq!(page.read_link(16), Some(7));
    }

    #[test]
    fn test_page_type_conversion() {
        assert_eq!(PageType::try_from(0x01), Ok(PageType::EntryPoint));
        assert_eq!(PageType::try_from(0x05), Ok(PageType::NullBucket));
        assert!(PageType::try_from(0xFF).is_err());
    }

    #[test]
    fn test_checksum_detects_modification() {
        let mut page = Page::new();
        PageHeader::init(&mut page, PageType::NullBucket);
        page.write_u32(100, 12);
        page.seal();
        assert!(page.verify_checksum().is_ok());

        page.write_u8(4000, 1);
        assert!(matches!(
            page.verify_checksum(),
            Err(PageError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_blank_page_passes_verification() {
        let page = Page::new();
        assert!(page.is_blank());
        assert!(page.verify_checksum().is_ok());
    }

    #[test]
    fn test_detached_copy_leaves_pool() {
        let pool = BufferPool::new(1);
        let mut page = pool.lease_page_zeroed().expect("lease");
        page.write_u32(8, 99);

        let copy = page.detached_copy();
        drop(page);
        assert_eq!(pool.available(), 1);
        assert_eq!(copy.read_u32(8), 99);
    }
}
