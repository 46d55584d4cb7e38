//! Bucket pages of the main tree file.
//!
//! A bucket is either a leaf, holding sorted `(key, [rid])` cells and links
//! to its left and right siblings, or a non-leaf, holding sorted separator
//! cells `(key, left child, right child)`.
//!
//! # Page Layout
//!
//! ```text
//! +----------+--------------------------------------------------+
//! | 0-7      | page header (type: leaf / non-leaf bucket)       |
//! | 8-11     | cell count (u32)                                 |
//! | 12-15    | free pointer: start of the cell heap (u32)       |
//! | 16-19    | left sibling (leaf only, -1 if none)             |
//! | 20-23    | right sibling (leaf only, -1 if none)            |
//! | 24-...   | cell offsets (u16 each), growing upwards         |
//! | ...-8191 | cells, growing downwards from the page end       |
//! +----------+--------------------------------------------------+
//! ```
//!
//! Leaf cell: `[key_len: u32][key][value_count: u32][rid; value_count]`.
//! Non-leaf cell: `[key_len: u32][key][left: i32][right: i32]`.
//!
//! Keys are stored in their serialized (and possibly encrypted) form. The
//! codec never compares keys; ordering is the tree's job.

#![allow(clippy::cast_possible_truncation)]

use std::cmp::Ordering;

use crate::storage::page::{PAGE_SIZE, Page, PageHeader, PageIndex, PageType};
use crate::types::rid::{RID_SIZE, Rid};

const SIZE_OFFSET: usize = PageHeader::SIZE;
const FREE_POINTER_OFFSET: usize = SIZE_OFFSET + 4;
const LEFT_SIBLING_OFFSET: usize = FREE_POINTER_OFFSET + 4;
const RIGHT_SIBLING_OFFSET: usize = LEFT_SIBLING_OFFSET + 4;

/// Offset of the cell offset array.
pub const BUCKET_HEADER_SIZE: usize = RIGHT_SIBLING_OFFSET + 4;

/// Size of one entry of the offset array.
const OFFSET_SIZE: usize = 2;

/// Fixed bytes of a leaf cell besides key and values: key length + value count.
const LEAF_CELL_OVERHEAD: usize = 4 + 4;

/// Fixed bytes of a non-leaf cell besides the key: key length + two children.
const NON_LEAF_CELL_OVERHEAD: usize = 4 + 4 + 4;

/// Largest stored key that still lets a non-leaf bucket hold four cells.
///
/// With this bound a full non-leaf bucket always has at least three cells
/// to split, and a leaf cell with one value always fits an empty leaf.
pub const MAX_KEY_SIZE_LIMIT: usize =
    (PAGE_SIZE - BUCKET_HEADER_SIZE) / 4 - OFFSET_SIZE - NON_LEAF_CELL_OVERHEAD;

/// A leaf cell: one key and every value stored under it in this bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafCell {
    pub key: Vec<u8>,
    pub values: Vec<Rid>,
}

impl LeafCell {
    const fn encoded_size(&self) -> usize {
        LEAF_CELL_OVERHEAD + self.key.len() + self.values.len() * RID_SIZE
    }
}

/// A non-leaf cell: a separator key and the children on both sides of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonLeafCell {
    pub key: Vec<u8>,
    pub left: PageIndex,
    pub right: PageIndex,
}

impl NonLeafCell {
    const fn encoded_size(&self) -> usize {
        NON_LEAF_CELL_OVERHEAD + self.key.len()
    }
}

/// A leaf bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeafBucket {
    pub left_sibling: Option<PageIndex>,
    pub right_sibling: Option<PageIndex>,
    pub cells: Vec<LeafCell>,
}

impl LeafBucket {
    /// Create an empty leaf without siblings.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            left_sibling: None,
            right_sibling: None,
            cells: Vec::new(),
        }
    }

    /// Bytes the bucket occupies when written.
    #[must_use]
    pub fn used_space(&self) -> usize {
        BUCKET_HEADER_SIZE
            + self
                .cells
                .iter()
                .map(|cell| OFFSET_SIZE + cell.encoded_size())
                .sum::<usize>()
    }

    fn has_room_for(&self, bytes: usize) -> bool {
        self.used_space() + bytes <= PAGE_SIZE
    }

    /// Insert a new cell at `index` holding one value.
    ///
    /// Returns false, leaving the bucket unchanged, if the cell does not fit.
    pub fn add_new_entry(&mut self, index: usize, key: Vec<u8>, value: Rid) -> bool {
        let needed = OFFSET_SIZE + LEAF_CELL_OVERHEAD + key.len() + RID_SIZE;
        if !self.has_room_for(needed) {
            return false;
        }
        self.cells.insert(
            index,
            LeafCell {
                key,
                values: vec![value],
            },
        );
        true
    }

    /// Append a value to the cell at `index`.
    ///
    /// Returns false, leaving the bucket unchanged, if the value does not fit.
    pub fn append_value(&mut self, index: usize, value: Rid) -> bool {
        if !self.has_room_for(RID_SIZE) {
            return false;
        }
        self.cells[index].values.push(value);
        true
    }

    /// Remove one occurrence of `value` from the cell at `index`.
    ///
    /// A cell left without values is removed. Returns whether the value was found.
    pub fn remove_value(&mut self, index: usize, value: Rid) -> bool {
        let cell = &mut self.cells[index];
        let Some(position) = cell.values.iter().position(|v| *v == value) else {
            return false;
        };
        cell.values.remove(position);
        if cell.values.is_empty() {
            self.cells.remove(index);
        }
        true
    }
}

/// A non-leaf bucket.
///
/// For every `i > 0`, `cells[i].left == cells[i - 1].right`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NonLeafBucket {
    pub cells: Vec<NonLeafCell>,
}

impl NonLeafBucket {
    /// Bytes the bucket occupies when written.
    #[must_use]
    pub fn used_space(&self) -> usize {
        BUCKET_HEADER_SIZE
            + self
                .cells
                .iter()
                .map(|cell| OFFSET_SIZE + cell.encoded_size())
                .sum::<usize>()
    }

    /// Whether a separator of `key_len` bytes fits.
    #[must_use]
    pub fn can_fit(&self, key_len: usize) -> bool {
        self.used_space() + OFFSET_SIZE + NON_LEAF_CELL_OVERHEAD + key_len <= PAGE_SIZE
    }

    /// Insert a separator at `index`, pointing the neighbouring cells at
    /// the new children.
    ///
    /// Returns false, leaving the bucket unchanged, if the cell does not fit.
    pub fn add_entry(
        &mut self,
        index: usize,
        key: Vec<u8>,
        left: PageIndex,
        right: PageIndex,
    ) -> bool {
        if !self.can_fit(key.len()) {
            return false;
        }
        self.cells.insert(index, NonLeafCell { key, left, right });
        if index > 0 {
            self.cells[index - 1].right = left;
        }
        if let Some(next) = self.cells.get_mut(index + 1) {
            next.left = right;
        }
        true
    }

    /// Child to descend into for a search result in this bucket.
    ///
    /// An exact match routes right of the matching separator, a miss routes
    /// left of the insertion point, and a miss past the end routes right of
    /// the last separator. `None` for an empty bucket.
    #[must_use]
    pub fn child_for(&self, search: Result<usize, usize>) -> Option<PageIndex> {
        match search {
            Ok(index) => self.cells.get(index).map(|cell| cell.right),
            Err(index) if index < self.cells.len() => Some(self.cells[index].left),
            Err(_) => self.cells.last().map(|cell| cell.right),
        }
    }

    /// Child pointer `j` of the bucket, `0 <= j <= cells.len()`.
    #[must_use]
    pub fn child(&self, j: usize) -> Option<PageIndex> {
        match self.cells.get(j) {
            Some(cell) => Some(cell.left),
            None if j == self.cells.len() => self.cells.last().map(|cell| cell.right),
            None => None,
        }
    }
}

/// A decoded bucket page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bucket {
    Leaf(LeafBucket),
    NonLeaf(NonLeafBucket),
}

impl Bucket {
    /// Number of cells.
    #[must_use]
    pub const fn len(&self) -> usize {
        match self {
            Self::Leaf(leaf) => leaf.cells.len(),
            Self::NonLeaf(node) => node.cells.len(),
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf(_))
    }

    /// Stored key of cell `index`.
    #[must_use]
    pub fn key(&self, index: usize) -> &[u8] {
        match self {
            Self::Leaf(leaf) => &leaf.cells[index].key,
            Self::NonLeaf(node) => &node.cells[index].key,
        }
    }

    /// Read a bucket from a page.
    pub fn from_page(page: &Page) -> Result<Self, BucketError> {
        let page_type = page
            .page_type()
            .map_err(|e| BucketError::Malformed(e.to_string()))?;
        let size = page.read_u32(SIZE_OFFSET) as usize;
        let offsets_end = BUCKET_HEADER_SIZE + size * OFFSET_SIZE;
        if offsets_end > PAGE_SIZE {
            return Err(BucketError::Malformed(format!("cell count {size} too large")));
        }
        let reader = CellReader {
            page,
            heap_start: offsets_end,
        };

        match page_type {
            PageType::LeafBucket => {
                let mut cells = Vec::with_capacity(size);
                for i in 0..size {
                    let mut pos = reader.cell_offset(i)?;
                    let key = reader.read_key(&mut pos)?;
                    let count = reader.read_u32(&mut pos)? as usize;
                    let raw = reader.read_bytes(&mut pos, count.saturating_mul(RID_SIZE))?;
                    let values = raw
                        .chunks_exact(RID_SIZE)
                        .filter_map(Rid::from_bytes)
                        .collect();
                    cells.push(LeafCell { key, values });
                }
                Ok(Self::Leaf(LeafBucket {
                    left_sibling: page.read_link(LEFT_SIBLING_OFFSET),
                    right_sibling: page.read_link(RIGHT_SIBLING_OFFSET),
                    cells,
                }))
            }
            PageType::NonLeafBucket => {
                let mut cells = Vec::with_capacity(size);
                for i in 0..size {
                    let mut pos = reader.cell_offset(i)?;
                    let key = reader.read_key(&mut pos)?;
                    let left = reader.read_u32(&mut pos)?;
                    let right = reader.read_u32(&mut pos)?;
                    cells.push(NonLeafCell { key, left, right });
                }
                Ok(Self::NonLeaf(NonLeafBucket { cells }))
            }
            other => Err(BucketError::WrongPageType(other)),
        }
    }

    /// Write the bucket to a page, replacing its whole content.
    ///
    /// The bucket must fit; callers check with the `add_*` methods.
    pub fn write_to_page(&self, page: &mut Page) {
        page.as_bytes_mut().fill(0);
        let (page_type, left, right) = match self {
            Self::Leaf(leaf) => (PageType::LeafBucket, leaf.left_sibling, leaf.right_sibling),
            Self::NonLeaf(_) => (PageType::NonLeafBucket, None, None),
        };
        PageHeader::init(page, page_type);
        page.write_u32(SIZE_OFFSET, self.len() as u32);
        page.write_link(LEFT_SIBLING_OFFSET, left);
        page.write_link(RIGHT_SIBLING_OFFSET, right);

        let mut free_pointer = PAGE_SIZE;
        let mut cell = Vec::with_capacity(64);
        for i in 0..self.len() {
            cell.clear();
            match self {
                Self::Leaf(leaf) => {
                    let c = &leaf.cells[i];
                    cell.extend_from_slice(&(c.key.len() as u32).to_le_bytes());
                    cell.extend_from_slice(&c.key);
                    cell.extend_from_slice(&(c.values.len() as u32).to_le_bytes());
                    for value in &c.values {
                        cell.extend_from_slice(&value.to_bytes());
                    }
                }
                Self::NonLeaf(node) => {
                    let c = &node.cells[i];
                    cell.extend_from_slice(&(c.key.len() as u32).to_le_bytes());
                    cell.extend_from_slice(&c.key);
                    cell.extend_from_slice(&c.left.to_le_bytes());
                    cell.extend_from_slice(&c.right.to_le_bytes());
                }
            }
            free_pointer -= cell.len();
            page.write_bytes(free_pointer, &cell);
            page.write_u16(BUCKET_HEADER_SIZE + i * OFFSET_SIZE, free_pointer as u16);
        }
        page.write_u32(FREE_POINTER_OFFSET, free_pointer as u32);
    }
}

/// Binary search over `len` sorted cells.
///
/// `compare(i)` orders cell `i` against the search key and may fail when
/// the stored key cannot be decoded. Returns `Ok(index)` when found and
/// `Err(insertion_point)` when absent.
pub fn search<E>(
    len: usize,
    mut compare: impl FnMut(usize) -> Result<Ordering, E>,
) -> Result<Result<usize, usize>, E> {
    let mut low = 0;
    let mut high = len;
    while low < high {
        let mid = low + (high - low) / 2;
        match compare(mid)? {
            Ordering::Less => low = mid + 1,
            Ordering::Greater => high = mid,
            Ordering::Equal => return Ok(Ok(mid)),
        }
    }
    Ok(Err(low))
}

struct CellReader<'a> {
    page: &'a Page,
    heap_start: usize,
}

impl CellReader<'_> {
    fn cell_offset(&self, index: usize) -> Result<usize, BucketError> {
        let offset = usize::from(self.page.read_u16(BUCKET_HEADER_SIZE + index * OFFSET_SIZE));
        if offset < self.heap_start || offset >= PAGE_SIZE {
            return Err(BucketError::Malformed(format!(
                "cell {index} at offset {offset} outside the cell heap"
            )));
        }
        Ok(offset)
    }

    fn read_bytes(&self, pos: &mut usize, len: usize) -> Result<&[u8], BucketError> {
        let end = pos.checked_add(len).filter(|end| *end <= PAGE_SIZE).ok_or_else(|| {
            BucketError::Malformed(format!("{len} bytes at offset {pos} overrun the page"))
        })?;
        let bytes = &self.page.as_bytes()[*pos..end];
        *pos = end;
        Ok(bytes)
    }

    fn read_u32(&self, pos: &mut usize) -> Result<u32, BucketError> {
        let raw = self.read_bytes(pos, 4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn read_key(&self, pos: &mut usize) -> Result<Vec<u8>, BucketError> {
        let len = self.read_u32(pos)? as usize;
        Ok(self.read_bytes(pos, len)?.to_vec())
    }
}

/// Errors that can occur when decoding a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketError {
    /// The page is not a bucket page.
    WrongPageType(PageType),
    /// The page content is inconsistent.
    Malformed(String),
}

impl std::fmt::Display for BucketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WrongPageType(t) => write!(f, "expected a bucket page, found {t:?}"),
            Self::Malformed(msg) => write!(f, "malformed bucket: {msg}"),
        }
    }
}

impl std::error::Error for BucketError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid(i: i64) -> Rid {
        Rid::new(1, i)
    }

    #[test]
    fn test_leaf_roundtrip() {
        let mut leaf = LeafBucket {
            left_sibling: Some(4),
            right_sibling: None,
            cells: Vec::new(),
        };
        assert!(leaf.add_new_entry(0, b"m".to_vec(), rid(1)));
        assert!(leaf.add_new_entry(0, b"a".to_vec(), rid(2)));
        assert!(leaf.append_value(1, rid(3)));

        let mut page = Page::new();
        Bucket::Leaf(leaf.clone()).write_to_page(&mut page);
        assert_eq!(page.page_type().expect("type"), PageType::LeafBucket);
        assert_eq!(page.read_bytes(RIGHT_SIBLING_OFFSET, 4), (-1i32).to_le_bytes());

        let Bucket::Leaf(restored) = Bucket::from_page(&page).expect("decode") else {
            panic!("expected leaf");
        };
        assert_eq!(restored, leaf);
        assert_eq!(restored.cells[1].values, vec![rid(1), rid(3)]);
    }

    #[test]
    fn test_cells_grow_down_from_page_end() {
        let mut leaf = LeafBucket::new();
        leaf.add_new_entry(0, b"abc".to_vec(), rid(1));
        let mut page = Page::new();
        Bucket::Leaf(leaf).write_to_page(&mut page);

        let cell_size = LEAF_CELL_OVERHEAD + 3 + RID_SIZE;
        assert_eq!(page.read_u32(SIZE_OFFSET), 1);
        assert_eq!(page.read_u32(FREE_POINTER_OFFSET) as usize, PAGE_SIZE - cell_size);
        assert_eq!(usize::from(page.read_u16(BUCKET_HEADER_SIZE)), PAGE_SIZE - cell_size);
    }

    #[test]
    fn test_non_leaf_add_entry_relinks_neighbours() {
        let mut node = NonLeafBucket::default();
        assert!(node.add_entry(0, b"d".to_vec(), 2, 3));
        assert!(node.add_entry(1, b"h".to_vec(), 3, 4));
        // A child split between them
        assert!(node.add_entry(1, b"f".to_vec(), 3, 7));

        assert_eq!(node.cells[0].right, 3);
        assert_eq!(node.cells[1].left, 3);
        assert_eq!(node.cells[1].right, 7);
        assert_eq!(node.cells[2].left, 7);
        for pair in node.cells.windows(2) {
            assert_eq!(pair[0].right, pair[1].left);
        }

        let mut page = Page::new();
        Bucket::NonLeaf(node.clone()).write_to_page(&mut page);
        assert_eq!(Bucket::from_page(&page).expect("decode"), Bucket::NonLeaf(node));
    }

    #[test]
    fn test_child_routing() {
        let node = NonLeafBucket {
            cells: vec![
                NonLeafCell {
                    key: b"d".to_vec(),
                    left: 2,
                    right: 3,
                },
                NonLeafCell {
                    key: b"h".to_vec(),
                    left: 3,
                    right: 4,
                },
            ],
        };
        assert_eq!(node.child_for(Ok(0)), Some(3));
        assert_eq!(node.child_for(Err(0)), Some(2));
        assert_eq!(node.child_for(Err(1)), Some(3));
        assert_eq!(node.child_for(Err(2)), Some(4));
        assert_eq!(node.child(0), Some(2));
        assert_eq!(node.child(2), Some(4));
        assert_eq!(node.child(3), None);
        assert_eq!(NonLeafBucket::default().child_for(Err(0)), None);
    }

    #[test]
    fn test_remove_value_drops_empty_cell() {
        let mut leaf = LeafBucket::new();
        leaf.add_new_entry(0, b"k".to_vec(), rid(1));
        leaf.append_value(0, rid(2));

        assert!(!leaf.remove_value(0, rid(9)));
        assert!(leaf.remove_value(0, rid(1)));
        assert_eq!(leaf.cells[0].values, vec![rid(2)]);
        assert!(leaf.remove_value(0, rid(2)));
        assert!(leaf.cells.is_empty());
    }

    #[test]
    fn test_leaf_rejects_overflow() {
        let mut leaf = LeafBucket::new();
        leaf.add_new_entry(0, vec![7; 100], rid(0));
        let mut appended = 0;
        while leaf.append_value(0, rid(appended)) {
            appended += 1;
        }
        assert!(leaf.used_space() <= PAGE_SIZE);
        assert!(leaf.used_space() + RID_SIZE > PAGE_SIZE);
        assert!(!leaf.add_new_entry(1, b"z".to_vec(), rid(0)));

        let mut page = Page::new();
        Bucket::Leaf(leaf.clone()).write_to_page(&mut page);
        assert_eq!(Bucket::from_page(&page).expect("decode"), Bucket::Leaf(leaf));
    }

    #[test]
    fn test_max_key_size_leaves_room_for_four_separators() {
        let mut node = NonLeafBucket::default();
        for i in 0..4u32 {
            assert!(node.add_entry(i as usize, vec![i as u8; MAX_KEY_SIZE_LIMIT], i, i + 1));
        }
        assert!(!node.can_fit(MAX_KEY_SIZE_LIMIT));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let mut page = Page::new();
        PageHeader::init(&mut page, PageType::LeafBucket);
        page.write_u32(SIZE_OFFSET, 1);
        page.write_u16(BUCKET_HEADER_SIZE, 3);
        assert!(matches!(Bucket::from_page(&page), Err(BucketError::Malformed(_))));

        page.write_u16(BUCKET_HEADER_SIZE, (PAGE_SIZE - 4) as u16);
        page.write_u32(PAGE_SIZE - 4, 1000);
        assert!(matches!(Bucket::from_page(&page), Err(BucketError::Malformed(_))));

        let mut entry = Page::new();
        PageHeader::init(&mut entry, PageType::EntryPoint);
        assert_eq!(
            Bucket::from_page(&entry),
            Err(BucketError::WrongPageType(PageType::EntryPoint))
        );
    }

    #[test]
    fn test_search() {
        let keys = [10, 20, 30, 40];
        let find = |target: i32| {
            search::<()>(keys.len(), |i| Ok(keys[i].cmp(&target))).expect("infallible")
        };
        assert_eq!(find(30), Ok(2));
        assert_eq!(find(5), Err(0));
        assert_eq!(find(25), Err(2));
        assert_eq!(find(45), Err(4));
        assert_eq!(search::<()>(0, |_| Ok(Ordering::Equal)), Ok(Err(0)));
    }
}
