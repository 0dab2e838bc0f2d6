//! Multi-index record store over an ordered key-value [`Backend`].
//!
//! Each store owns three regions under the prefix `scope ‖ table`:
//!
//! ```text
//! prefix ‖ 0x00                              -> next available primary key
//! prefix ‖ 0x01 ‖ id                         -> encoded row
//! prefix ‖ 0x02 ‖ index# ‖ secondary ‖ id    -> (empty)
//! ```
//!
//! All integers are big-endian, so byte order is numeric order and rows that
//! share a secondary value come out in primary key order. Rows are stored
//! once; index entries only reference them by id.
//!
//! Every insert or erase goes to the backend as one [`WriteBatch`], so the
//! secondary views never disagree with the rows.

use std::marker::PhantomData;
use std::ops::{Bound, RangeBounds};

use tracing::debug;

use crate::clock::Clock;
use crate::error::{LedgerError, Result};
use crate::name::Name;
use crate::storage::{Backend, WriteBatch};

const REGION_META: u8 = 0x00;
const REGION_ROWS: u8 = 0x01;
const REGION_INDEX: u8 = 0x02;

/// Reserved: a counter at this value has no keys left to hand out.
pub const NO_AVAILABLE_KEY: u64 = u64::MAX;

/// A record type that can live in an [`IndexedStore`].
pub trait Row: Sized {
    /// Secondary index names, in storage position order.
    const INDEXES: &'static [&'static str];

    fn primary_key(&self) -> u64;

    /// One key per entry of [`Row::INDEXES`], in the same order.
    fn secondary_keys(&self) -> Vec<u64>;

    fn encode(&self) -> Result<Vec<u8>>;

    fn decode(bytes: &[u8]) -> Result<Self>;
}

/// What the store hands a constructor: the allocated key and the clock reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowStamp {
    pub id: u64,
    pub created_at: u64,
}

/// Position in primary key order. `None` is one past the last row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor(Option<u64>);

impl Cursor {
    pub const END: Cursor = Cursor(None);

    pub fn id(self) -> Option<u64> {
        self.0
    }

    pub fn is_end(self) -> bool {
        self.0.is_none()
    }
}

pub struct IndexedStore<'a, T, B: ?Sized> {
    backend: &'a mut B,
    clock: &'a dyn Clock,
    scope: Name,
    table: Name,
    _row: PhantomData<fn() -> T>,
}

impl<'a, T: Row, B: Backend + ?Sized> IndexedStore<'a, T, B> {
    pub fn new(backend: &'a mut B, clock: &'a dyn Clock, scope: Name, table: Name) -> Self {
        Self {
            backend,
            clock,
            scope,
            table,
            _row: PhantomData,
        }
    }

    pub fn scope(&self) -> Name {
        self.scope
    }

    pub fn table(&self) -> Name {
        self.table
    }

    // --- KEY LAYOUT ---

    fn prefix(&self, region: u8) -> Vec<u8> {
        let mut key = Vec::with_capacity(34);
        key.extend_from_slice(&self.scope.value().to_be_bytes());
        key.extend_from_slice(&self.table.value().to_be_bytes());
        key.push(region);
        key
    }

    fn meta_key(&self) -> Vec<u8> {
        self.prefix(REGION_META)
    }

    fn row_key(&self, id: u64) -> Vec<u8> {
        let mut key = self.prefix(REGION_ROWS);
        key.extend_from_slice(&id.to_be_bytes());
        key
    }

    fn index_prefix(&self, position: u8) -> Vec<u8> {
        let mut key = self.prefix(REGION_INDEX);
        key.push(position);
        key
    }

    fn index_key(&self, position: u8, secondary: u64, id: u64) -> Vec<u8> {
        let mut key = self.index_prefix(position);
        key.extend_from_slice(&secondary.to_be_bytes());
        key.extend_from_slice(&id.to_be_bytes());
        key
    }

    fn id_from_tail(&self, key: &[u8]) -> Result<u64> {
        let tail = key
            .len()
            .checked_sub(8)
            .map(|start| &key[start..])
            .ok_or_else(|| LedgerError::Corruption(format!("short key in table {}", self.table)))?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(tail);
        Ok(u64::from_be_bytes(buf))
    }

    fn index_position(&self, index: &str) -> Result<u8> {
        T::INDEXES
            .iter()
            .position(|name| *name == index)
            .map(|p| p as u8)
            .ok_or_else(|| LedgerError::UnknownIndex {
                table: self.table,
                index: index.to_string(),
            })
    }

    // --- KEY ALLOCATION ---

    /// The key the next insert will receive. Never decreases, even when the
    /// highest row is erased or the store is drained.
    pub fn available_primary_key(&self) -> Result<u64> {
        match self.backend.get(&self.meta_key())? {
            None => Ok(0),
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    LedgerError::Corruption(format!("key counter of table {} is {} bytes", self.table, bytes.len()))
                })?;
                Ok(u64::from_be_bytes(raw))
            }
        }
    }

    // --- WRITES ---

    /// Allocates the next key and stores the row `build` produces for it.
    pub fn insert<F>(&mut self, build: F) -> Result<u64>
    where
        F: FnOnce(RowStamp) -> T,
    {
        let id = self.available_primary_key()?;
        if id == NO_AVAILABLE_KEY {
            return Err(LedgerError::CapacityExceeded { table: self.table });
        }
        let stamp = RowStamp { id, created_at: self.clock.now() };
        let row = build(stamp);

        if row.primary_key() != id {
            return Err(LedgerError::InvalidOperation(format!(
                "row built with id {} but key {} was allocated",
                row.primary_key(),
                id
            )));
        }
        let row_key = self.row_key(id);
        if self.backend.get(&row_key)?.is_some() {
            return Err(LedgerError::Corruption(format!(
                "key {} of table {} is already taken",
                id, self.table
            )));
        }

        let mut batch = WriteBatch::new();
        batch.put(row_key, row.encode()?);
        for (position, secondary) in row.secondary_keys().into_iter().enumerate() {
            batch.put(self.index_key(position as u8, secondary, id), Vec::new());
        }
        batch.put(self.meta_key(), (id + 1).to_be_bytes().to_vec());
        self.backend.write(batch)?;

        debug!(scope = %self.scope, table = %self.table, id, created_at = stamp.created_at, "row inserted");
        Ok(id)
    }

    /// Removes a row and all of its index entries.
    pub fn erase(&mut self, id: u64) -> Result<()> {
        let row_key = self.row_key(id);
        let bytes = self
            .backend
            .get(&row_key)?
            .ok_or(LedgerError::NotFound { table: self.table, id })?;
        let row = T::decode(&bytes)?;

        let mut batch = WriteBatch::new();
        batch.erase(row_key);
        for (position, secondary) in row.secondary_keys().into_iter().enumerate() {
            batch.erase(self.index_key(position as u8, secondary, id));
        }
        self.backend.write(batch)?;

        debug!(scope = %self.scope, table = %self.table, id, "row erased");
        Ok(())
    }

    // --- CURSORS ---

    fn seek_row(&self, from: u64) -> Result<Cursor> {
        let end = self.prefix(REGION_ROWS + 1);
        match self.backend.seek(&self.row_key(from), Some(end.as_slice()))? {
            Some((key, _)) => Ok(Cursor(Some(self.id_from_tail(&key)?))),
            None => Ok(Cursor::END),
        }
    }

    /// Cursor at the lowest live primary key.
    pub fn begin(&self) -> Result<Cursor> {
        self.seek_row(0)
    }

    /// Cursor at the next live row after `cursor`.
    pub fn advance(&self, cursor: Cursor) -> Result<Cursor> {
        match cursor.0 {
            None => Ok(Cursor::END),
            Some(u64::MAX) => Ok(Cursor::END),
            Some(id) => self.seek_row(id + 1),
        }
    }

    /// Erases the row under `cursor` and returns a cursor at the next live
    /// row, or the end cursor. The result is looked up after the erase, so
    /// it is valid however the erase reshaped the regions.
    pub fn erase_at(&mut self, cursor: Cursor) -> Result<Cursor> {
        let id = cursor
            .0
            .ok_or_else(|| LedgerError::InvalidOperation("cannot erase at the end cursor".to_string()))?;
        self.erase(id)?;
        self.advance(cursor)
    }

    /// Erases every row and returns how many were removed. The key counter
    /// is left alone.
    pub fn drain_all(&mut self) -> Result<u64> {
        let mut removed = 0u64;
        let mut cursor = self.begin()?;
        while !cursor.is_end() {
            cursor = self.erase_at(cursor)?;
            removed += 1;
        }
        debug!(scope = %self.scope, table = %self.table, removed, "table drained");
        Ok(removed)
    }

    // --- READS ---

    pub fn find_by_primary(&self, id: u64) -> Result<Option<T>> {
        match self.backend.get(&self.row_key(id))? {
            Some(bytes) => Ok(Some(T::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Rows with primary keys in `range`, ascending.
    pub fn scan_primary<R: RangeBounds<u64>>(&self, range: R) -> Result<RowScan<'_, T, B>> {
        let ids = match inclusive(range) {
            None => Vec::new(),
            Some((lo, hi)) => {
                let end = match hi.checked_add(1) {
                    Some(next) => self.row_key(next),
                    None => self.prefix(REGION_ROWS + 1),
                };
                self.backend
                    .scan(&self.row_key(lo), Some(end.as_slice()))?
                    .into_iter()
                    .map(|(key, _)| self.id_from_tail(&key))
                    .collect::<Result<Vec<_>>>()?
            }
        };
        Ok(RowScan::new(self, ids))
    }

    /// Rows whose `index` key lies in `range`, ordered by that key and then
    /// by primary key. The set of rows is fixed when the call is made.
    pub fn scan_by_secondary<R: RangeBounds<u64>>(&self, index: &str, range: R) -> Result<RowScan<'_, T, B>> {
        let position = self.index_position(index)?;
        let ids = match inclusive(range) {
            None => Vec::new(),
            Some((lo, hi)) => self.secondary_ids(position, (lo, 0), hi)?,
        };
        Ok(RowScan::new(self, ids))
    }

    /// Like [`scan_by_secondary`](Self::scan_by_secondary), but starts at the
    /// entry `(secondary, id)` so a page can resume inside a run of equal
    /// secondary keys. `hi` is inclusive.
    pub fn scan_by_secondary_from(&self, index: &str, start: (u64, u64), hi: u64) -> Result<RowScan<'_, T, B>> {
        let position = self.index_position(index)?;
        let ids = if start.0 > hi {
            Vec::new()
        } else {
            self.secondary_ids(position, start, hi)?
        };
        Ok(RowScan::new(self, ids))
    }

    fn secondary_ids(&self, position: u8, start: (u64, u64), hi: u64) -> Result<Vec<u64>> {
        let from = self.index_key(position, start.0, start.1);
        let end = match hi.checked_add(1) {
            Some(next) => self.index_key(position, next, 0),
            None => self.index_prefix(position + 1),
        };
        self.backend
            .scan(&from, Some(end.as_slice()))?
            .into_iter()
            .map(|(key, _)| self.id_from_tail(&key))
            .collect()
    }

    /// Number of live rows. Only keys are visited.
    pub fn len(&self) -> Result<usize> {
        let end = self.prefix(REGION_ROWS + 1);
        self.backend.count(&self.prefix(REGION_ROWS), Some(end.as_slice()))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.begin()?.is_end())
    }
}

/// Converts any `u64` range into inclusive bounds, or `None` when empty.
fn inclusive<R: RangeBounds<u64>>(range: R) -> Option<(u64, u64)> {
    let lo = match range.start_bound() {
        Bound::Included(&v) => v,
        Bound::Excluded(&v) => v.checked_add(1)?,
        Bound::Unbounded => 0,
    };
    let hi = match range.end_bound() {
        Bound::Included(&v) => v,
        Bound::Excluded(&v) => v.checked_sub(1)?,
        Bound::Unbounded => u64::MAX,
    };
    (lo <= hi).then_some((lo, hi))
}

/// Lazily decodes rows for a fixed list of primary keys.
pub struct RowScan<'s, T, B: ?Sized> {
    store: &'s IndexedStore<'s, T, B>,
    ids: std::vec::IntoIter<u64>,
}

impl<'s, T: Row, B: Backend + ?Sized> RowScan<'s, T, B> {
    fn new(store: &'s IndexedStore<'s, T, B>, ids: Vec<u64>) -> Self {
        Self { store, ids: ids.into_iter() }
    }

    /// Rows not yet yielded.
    pub fn remaining(&self) -> usize {
        self.ids.len()
    }
}

impl<T: Row, B: Backend + ?Sized> Iterator for RowScan<'_, T, B> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.ids.next()?;
        match self.store.find_by_primary(id) {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => Some(Err(LedgerError::Corruption(format!(
                "index entry points at missing row {}",
                id
            )))),
            Err(e) => Some(Err(e)),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.ids.size_hint()
    }
}
