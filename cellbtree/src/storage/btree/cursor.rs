//! Cursors over the leaf chain.
//!
//! A cursor does not hold locks or pages between calls. Each time its
//! buffer runs dry it takes the tree's read lock, descends to the key it
//! stopped at and walks the leaf chain collecting the next batch. A batch
//! never ends inside the value list of a key, so the key it ended with
//! becomes an exclusive bound for the next batch.
//!
//! Range bounds that are composite keys shorter than the index arity are
//! padded with sentinel components, see [`PartialSearchMode`].

use std::cmp::Ordering;
use std::collections::VecDeque;

use crate::storage::btree::error::TreeError;
use crate::storage::btree::tree::{CellBTree, Direction};
use crate::storage::io::PageReader;
use crate::types::key::{IndexKey, PartialSearchMode};
use crate::types::rid::Rid;
use crate::types::serializer::KeySerializer;

/// One key/value pair produced by a cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorEntry<K> {
    pub key: K,
    pub value: Rid,
}

/// One end of a key range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Boundary<K> {
    pub(super) key: K,
    pub(super) inclusive: bool,
}

impl<K: Ord> Boundary<K> {
    pub(super) const fn inclusive(key: K) -> Self {
        Self {
            key,
            inclusive: true,
        }
    }

    const fn exclusive(key: K) -> Self {
        Self {
            key,
            inclusive: false,
        }
    }

    /// Whether `key` lies before this lower bound.
    fn excludes_below(&self, key: &K) -> bool {
        match key.cmp(&self.key) {
            Ordering::Less => true,
            Ordering::Equal => !self.inclusive,
            Ordering::Greater => false,
        }
    }

    /// Whether `key` lies past this upper bound.
    fn excludes_above(&self, key: &K) -> bool {
        match key.cmp(&self.key) {
            Ordering::Greater => true,
            Ordering::Equal => !self.inclusive,
            Ordering::Less => false,
        }
    }
}

/// Keys collected by one walk, each with all of its values, in walk order.
pub(super) struct Batch<K> {
    pub(super) groups: Vec<(K, Vec<Rid>)>,
    /// The walk reached the end of the range.
    pub(super) exhausted: bool,
}

struct Collector<K> {
    groups: Vec<(K, Vec<Rid>)>,
    count: usize,
    limit: usize,
    count_values: bool,
}

impl<K: Ord> Collector<K> {
    const fn new(limit: usize, count_values: bool) -> Self {
        Self {
            groups: Vec::new(),
            count: 0,
            limit,
            count_values,
        }
    }

    fn push(&mut self, key: K, values: &[Rid]) {
        match self.groups.last_mut() {
            Some((last, existing)) if *last == key => {
                existing.extend_from_slice(values);
                if self.count_values {
                    self.count += values.len();
                }
            }
            _ => {
                self.count += if self.count_values { values.len() } else { 1 };
                self.groups.push((key, values.to_vec()));
            }
        }
    }

    /// Whether the batch may stop before `key`.
    fn can_stop_before(&self, key: &K) -> bool {
        self.count >= self.limit && self.groups.last().is_none_or(|(last, _)| last != key)
    }

    fn finish(self, exhausted: bool) -> Batch<K> {
        Batch {
            groups: self.groups,
            exhausted,
        }
    }
}

impl<K: IndexKey, S: KeySerializer<K>> CellBTree<K, S> {
    /// Entries with keys between `from` and `to`.
    pub fn iterate_entries_between(
        &self,
        from: K,
        from_inclusive: bool,
        to: K,
        to_inclusive: bool,
        ascending: bool,
    ) -> Result<CellBTreeCursor<'_, K, S>, TreeError> {
        let lower = self.lower_bound(from, from_inclusive)?;
        let upper = self.upper_bound(to, to_inclusive)?;
        Ok(CellBTreeCursor::new(self, Some(lower), Some(upper), ascending))
    }

    /// Entries with keys above `key`.
    pub fn iterate_entries_major(
        &self,
        key: K,
        inclusive: bool,
        ascending: bool,
    ) -> Result<CellBTreeCursor<'_, K, S>, TreeError> {
        let lower = self.lower_bound(key, inclusive)?;
        Ok(CellBTreeCursor::new(self, Some(lower), None, ascending))
    }

    /// Entries with keys below `key`.
    pub fn iterate_entries_minor(
        &self,
        key: K,
        inclusive: bool,
        ascending: bool,
    ) -> Result<CellBTreeCursor<'_, K, S>, TreeError> {
        let upper = self.upper_bound(key, inclusive)?;
        Ok(CellBTreeCursor::new(self, None, Some(upper), ascending))
    }

    /// Every entry with a non-null key.
    #[must_use]
    pub const fn iterate_all(&self, ascending: bool) -> CellBTreeCursor<'_, K, S> {
        CellBTreeCursor::new(self, None, None, ascending)
    }

    /// Every distinct non-null key in ascending order.
    #[must_use]
    pub const fn key_cursor(&self) -> KeyCursor<'_, K, S> {
        KeyCursor {
            tree: self,
            lower: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    fn lower_bound(&self, key: K, inclusive: bool) -> Result<Boundary<K>, TreeError> {
        let key = self.preprocess(key)?.pad_to_arity(
            self.key_def.key_size,
            PartialSearchMode::for_lower_bound(inclusive),
        );
        Ok(Boundary { key, inclusive })
    }

    fn upper_bound(&self, key: K, inclusive: bool) -> Result<Boundary<K>, TreeError> {
        let key = self.preprocess(key)?.pad_to_arity(
            self.key_def.key_size,
            PartialSearchMode::for_upper_bound(inclusive),
        );
        Ok(Boundary { key, inclusive })
    }

    /// Walk right from `lower` collecting keys up to `upper`.
    ///
    /// Stops once `limit` values (or keys, if `count_values` is false) are
    /// collected and the next cell holds a different key.
    pub(super) fn collect_ascending<R: PageReader + ?Sized>(
        &self,
        reader: &R,
        lower: Option<&Boundary<K>>,
        upper: Option<&Boundary<K>>,
        limit: usize,
        count_values: bool,
    ) -> Result<Batch<K>, TreeError> {
        let mut collector = Collector::new(limit, count_values);
        let (mut leaf, mut index) = match lower {
            None => match self.edge_leaf(reader, Direction::Left)? {
                Some((_, leaf)) => (leaf, 0),
                None => return Ok(collector.finish(true)),
            },
            Some(bound) => {
                let search = self.find_leaf(reader, &bound.key)?;
                let index = match search.found {
                    Ok(i) if !bound.inclusive => i + 1,
                    Ok(i) | Err(i) => i,
                };
                if bound.inclusive && index == 0 {
                    // The bound key may continue in the left neighbours
                    let mut spilled =
                        self.boundary_siblings(reader, &search.leaf, Direction::Left, &bound.key)?;
                    spilled.reverse();
                    for (_, sibling, i) in spilled {
                        collector.push(bound.key.clone(), &sibling.cells[i].values);
                    }
                }
                (search.leaf, index)
            }
        };

        let hop_limit = self.chain_limit(reader)?;
        let mut hops = 0u32;
        loop {
            while let Some(cell) = leaf.cells.get(index) {
                index += 1;
                let key = self.decode_key(&cell.key)?;
                if lower.is_some_and(|bound| bound.excludes_below(&key)) {
                    continue;
                }
                if upper.is_some_and(|bound| bound.excludes_above(&key)) {
                    return Ok(collector.finish(true));
                }
                if collector.can_stop_before(&key) {
                    return Ok(collector.finish(false));
                }
                collector.push(key, &cell.values);
            }
            let Some(next) = leaf.right_sibling else {
                return Ok(collector.finish(true));
            };
            hops += 1;
            if hops > hop_limit {
                return Err(self.corrupted(format!("leaf chain through page {next} loops")));
            }
            leaf = self.read_leaf(reader, next)?;
            index = 0;
        }
    }

    /// Walk left from `upper` collecting keys down to `lower`.
    pub(super) fn collect_descending<R: PageReader + ?Sized>(
        &self,
        reader: &R,
        lower: Option<&Boundary<K>>,
        upper: Option<&Boundary<K>>,
        limit: usize,
    ) -> Result<Batch<K>, TreeError> {
        let mut collector = Collector::new(limit, true);
        // Cells before `end` are still to be visited
        let (mut leaf, mut end) = match upper {
            None => match self.edge_leaf(reader, Direction::Right)? {
                Some((_, leaf)) => {
                    let len = leaf.cells.len();
                    (leaf, len)
                }
                None => return Ok(collector.finish(true)),
            },
            Some(bound) => {
                let search = self.find_leaf(reader, &bound.key)?;
                let end = match search.found {
                    Ok(i) if bound.inclusive => i + 1,
                    Ok(i) | Err(i) => i,
                };
                if bound.inclusive && end == search.leaf.cells.len() {
                    let mut spilled =
                        self.boundary_siblings(reader, &search.leaf, Direction::Right, &bound.key)?;
                    spilled.reverse();
                    for (_, sibling, i) in spilled {
                        collector.push(bound.key.clone(), &sibling.cells[i].values);
                    }
                }
                (search.leaf, end)
            }
        };

        let hop_limit = self.chain_limit(reader)?;
        let mut hops = 0u32;
        loop {
            while end > 0 {
                end -= 1;
                let cell = &leaf.cells[end];
                let key = self.decode_key(&cell.key)?;
                if upper.is_some_and(|bound| bound.excludes_above(&key)) {
                    continue;
                }
                if lower.is_some_and(|bound| bound.excludes_below(&key)) {
                    return Ok(collector.finish(true));
                }
                if collector.can_stop_before(&key) {
                    return Ok(collector.finish(false));
                }
                collector.push(key, &cell.values);
            }
            let Some(previous) = leaf.left_sibling else {
                return Ok(collector.finish(true));
            };
            hops += 1;
            if hops > hop_limit {
                return Err(self.corrupted(format!("leaf chain through page {previous} loops")));
            }
            leaf = self.read_leaf(reader, previous)?;
            end = leaf.cells.len();
        }
    }
}

/// Forward or backward cursor over the entries of a key range.
///
/// Iterating yields one [`CursorEntry`] per value. The cursor is finite and
/// cannot be restarted; create a new one to scan again.
pub struct CellBTreeCursor<'a, K: IndexKey, S: KeySerializer<K>> {
    tree: &'a CellBTree<K, S>,
    ascending: bool,
    lower: Option<Boundary<K>>,
    upper: Option<Boundary<K>>,
    buffer: VecDeque<CursorEntry<K>>,
    exhausted: bool,
}

impl<'a, K: IndexKey, S: KeySerializer<K>> CellBTreeCursor<'a, K, S> {
    const fn new(
        tree: &'a CellBTree<K, S>,
        lower: Option<Boundary<K>>,
        upper: Option<Boundary<K>>,
        ascending: bool,
    ) -> Self {
        Self {
            tree,
            ascending,
            lower,
            upper,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Next entry, fetching up to `prefetch` entries if the buffer is empty.
    ///
    /// `prefetch` is clamped to `1..=cursor_prefetch_size`. A key with more
    /// values than `prefetch` is still fetched whole.
    pub fn next_entry(&mut self, prefetch: usize) -> Result<Option<CursorEntry<K>>, TreeError> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fill(prefetch)?;
        }
        Ok(self.buffer.pop_front())
    }

    fn fill(&mut self, prefetch: usize) -> Result<(), TreeError> {
        let tree = self.tree;
        let limit = prefetch.clamp(1, tree.config.cursor_prefetch_size);
        let batch = {
            let _lock = tree.manager.acquire_read_lock(&tree.name);
            let _guard = tree.read_guard();
            if self.ascending {
                tree.collect_ascending(
                    tree.store(),
                    self.lower.as_ref(),
                    self.upper.as_ref(),
                    limit,
                    true,
                )?
            } else {
                tree.collect_descending(
                    tree.store(),
                    self.lower.as_ref(),
                    self.upper.as_ref(),
                    limit,
                )?
            }
        };

        self.exhausted = batch.exhausted || batch.groups.is_empty();
        if let Some((last, _)) = batch.groups.last() {
            let resume = Some(Boundary::exclusive(last.clone()));
            if self.ascending {
                self.lower = resume;
            } else {
                self.upper = resume;
            }
        }
        for (key, values) in batch.groups {
            self.buffer.extend(values.into_iter().map(|value| CursorEntry {
                key: key.clone(),
                value,
            }));
        }
        Ok(())
    }
}

impl<K: IndexKey, S: KeySerializer<K>> Iterator for CellBTreeCursor<'_, K, S> {
    type Item = Result<CursorEntry<K>, TreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        let prefetch = self.tree.config.cursor_prefetch_size;
        match self.next_entry(prefetch) {
            Ok(entry) => entry.map(Ok),
            Err(e) => {
                self.exhausted = true;
                self.buffer.clear();
                Some(Err(e))
            }
        }
    }
}

/// Cursor over the distinct non-null keys of a tree, in ascending order.
pub struct KeyCursor<'a, K: IndexKey, S: KeySerializer<K>> {
    tree: &'a CellBTree<K, S>,
    lower: Option<Boundary<K>>,
    buffer: VecDeque<K>,
    exhausted: bool,
}

impl<K: IndexKey, S: KeySerializer<K>> KeyCursor<'_, K, S> {
    /// Next key, fetching up to `prefetch` keys if the buffer is empty.
    pub fn next_key(&mut self, prefetch: usize) -> Result<Option<K>, TreeError> {
        if self.buffer.is_empty() && !self.exhausted {
            let tree = self.tree;
            let limit = prefetch.clamp(1, tree.config.cursor_prefetch_size);
            let batch = {
                let _lock = tree.manager.acquire_read_lock(&tree.name);
                let _guard = tree.read_guard();
                tree.collect_ascending(tree.store(), self.lower.as_ref(), None, limit, false)?
            };
            self.exhausted = batch.exhausted || batch.groups.is_empty();
            if let Some((last, _)) = batch.groups.last() {
                self.lower = Some(Boundary::exclusive(last.clone()));
            }
            self.buffer.extend(batch.groups.into_iter().map(|(key, _)| key));
        }
        Ok(self.buffer.pop_front())
    }
}

impl<K: IndexKey, S: KeySerializer<K>> Iterator for KeyCursor<'_, K, S> {
    type Item = Result<K, TreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        let prefetch = self.tree.config.cursor_prefetch_size;
        match self.next_key(prefetch) {
            Ok(key) => key.map(Ok),
            Err(e) => {
                self.exhausted = true;
                self.buffer.clear();
                Some(Err(e))
            }
        }
    }
}
