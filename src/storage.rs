use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use tracing::{debug, error, info, warn};

use crate::error::{LedgerError, Result};

// Frame header: [Length u32 LE][SeaHash u64 LE]
const FRAME_HEADER: usize = 12;
const COMPACTION_CHUNK: usize = 1024;

/// One change to the ordered keyspace.
#[derive(Archive, RkyvDeserialize, RkyvSerialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub enum Mutation {
    Put { key: Vec<u8>, value: Vec<u8> },
    Erase { key: Vec<u8> },
}

/// Mutations applied all together or not at all.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct WriteBatch {
    mutations: Vec<Mutation>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.mutations.push(Mutation::Put { key, value });
    }

    pub fn erase(&mut self, key: Vec<u8>) {
        self.mutations.push(Mutation::Erase { key });
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }
}

/// Ordered byte-keyed storage that an [`IndexedStore`](crate::index::IndexedStore)
/// lays its row and index regions over.
///
/// Ranges are half-open: `from` is inclusive and `end`, when given, exclusive.
pub trait Backend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// First entry with `from <= key < end`.
    fn seek(&self, from: &[u8], end: Option<&[u8]>) -> Result<Option<(Vec<u8>, Vec<u8>)>>;

    /// Every entry with `from <= key < end`, in key order.
    fn scan(&self, from: &[u8], end: Option<&[u8]>) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Number of entries with `from <= key < end`.
    fn count(&self, from: &[u8], end: Option<&[u8]>) -> Result<usize> {
        Ok(self.scan(from, end)?.len())
    }

    /// Applies the whole batch atomically.
    fn write(&mut self, batch: WriteBatch) -> Result<()>;
}

fn range_bounds<'a>(from: &'a [u8], end: Option<&'a [u8]>) -> (Bound<&'a [u8]>, Bound<&'a [u8]>) {
    let upper = match end {
        Some(e) => Bound::Excluded(e),
        None => Bound::Unbounded,
    };
    (Bound::Included(from), upper)
}

fn is_empty_range(from: &[u8], end: Option<&[u8]>) -> bool {
    matches!(end, Some(e) if e <= from)
}

// --- IN-MEMORY ---

#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn apply(&mut self, mutations: Vec<Mutation>) {
        for m in mutations {
            match m {
                Mutation::Put { key, value } => {
                    self.map.insert(key, value);
                }
                Mutation::Erase { key } => {
                    self.map.remove(&key);
                }
            }
        }
    }

    fn entries(&self) -> impl Iterator<Item = (&Vec<u8>, &Vec<u8>)> {
        self.map.iter()
    }
}

impl Backend for MemoryBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.get(key).cloned())
    }

    fn seek(&self, from: &[u8], end: Option<&[u8]>) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if is_empty_range(from, end) {
            return Ok(None);
        }
        Ok(self
            .map
            .range::<[u8], _>(range_bounds(from, end))
            .next()
            .map(|(k, v)| (k.clone(), v.clone())))
    }

    fn scan(&self, from: &[u8], end: Option<&[u8]>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        if is_empty_range(from, end) {
            return Ok(Vec::new());
        }
        Ok(self
            .map
            .range::<[u8], _>(range_bounds(from, end))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn count(&self, from: &[u8], end: Option<&[u8]>) -> Result<usize> {
        if is_empty_range(from, end) {
            return Ok(0);
        }
        Ok(self.map.range::<[u8], _>(range_bounds(from, end)).count())
    }

    fn write(&mut self, batch: WriteBatch) -> Result<()> {
        self.apply(batch.mutations);
        Ok(())
    }
}

// --- STAGING OVERLAY ---

/// Buffers writes on top of a read-only base so an invocation can be
/// committed as a single batch, or dropped without touching the base.
pub struct Staged<'a, B: ?Sized> {
    base: &'a B,
    // None marks a staged erase
    pending: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<'a, B: Backend + ?Sized> Staged<'a, B> {
    pub fn new(base: &'a B) -> Self {
        Self { base, pending: BTreeMap::new() }
    }

    pub fn into_batch(self) -> WriteBatch {
        let mut batch = WriteBatch::new();
        for (key, value) in self.pending {
            match value {
                Some(v) => batch.put(key, v),
                None => batch.erase(key),
            }
        }
        batch
    }
}

impl<B: Backend + ?Sized> Backend for Staged<'_, B> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.pending.get(key) {
            Some(staged) => Ok(staged.clone()),
            None => self.base.get(key),
        }
    }

    fn seek(&self, from: &[u8], end: Option<&[u8]>) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut from = from.to_vec();
        loop {
            if is_empty_range(&from, end) {
                return Ok(None);
            }
            let base = self.base.seek(&from, end)?;
            let staged = self
                .pending
                .range::<[u8], _>(range_bounds(&from, end))
                .next()
                .map(|(k, v)| (k.clone(), v.clone()));

            let (key, value) = match (base, staged) {
                (None, None) => return Ok(None),
                (Some(b), None) => return Ok(Some(b)),
                (Some(b), Some(s)) if b.0 < s.0 => return Ok(Some(b)),
                (_, Some(s)) => s,
            };
            match value {
                Some(v) => return Ok(Some((key, v))),
                None => {
                    // Skip the tombstone; key ‖ 0x00 is its immediate successor
                    from = key;
                    from.push(0);
                }
            }
        }
    }

    fn scan(&self, from: &[u8], end: Option<&[u8]>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = self.base.scan(from, end)?.into_iter().collect();
        if !is_empty_range(from, end) {
            for (key, value) in self.pending.range::<[u8], _>(range_bounds(from, end)) {
                match value {
                    Some(v) => {
                        merged.insert(key.clone(), v.clone());
                    }
                    None => {
                        merged.remove(key);
                    }
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    fn count(&self, from: &[u8], end: Option<&[u8]>) -> Result<usize> {
        let mut count = self.base.count(from, end)?;
        if is_empty_range(from, end) {
            return Ok(count);
        }
        for (key, value) in self.pending.range::<[u8], _>(range_bounds(from, end)) {
            let in_base = self.base.get(key)?.is_some();
            match (value.is_some(), in_base) {
                (true, false) => count += 1,
                (false, true) => count -= 1,
                _ => {}
            }
        }
        Ok(count)
    }

    fn write(&mut self, batch: WriteBatch) -> Result<()> {
        for m in batch.mutations {
            match m {
                Mutation::Put { key, value } => {
                    self.pending.insert(key, Some(value));
                }
                Mutation::Erase { key } => {
                    self.pending.insert(key, None);
                }
            }
        }
        Ok(())
    }
}

// --- SEGMENT LOG ---

#[derive(Archive, RkyvDeserialize, RkyvSerialize, Debug)]
#[archive(check_bytes)]
struct Frame {
    mutations: Vec<Mutation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CompactionStats {
    pub live_entries: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

/// Backends that can shed dead entries from their durable form.
pub trait Compact {
    fn compact(&mut self) -> Result<CompactionStats>;
}

impl Compact for MemoryBackend {
    fn compact(&mut self) -> Result<CompactionStats> {
        Ok(CompactionStats {
            live_entries: self.len(),
            bytes_before: 0,
            bytes_after: 0,
        })
    }
}

impl Compact for SegmentBackend {
    fn compact(&mut self) -> Result<CompactionStats> {
        SegmentBackend::compact(self)
    }
}

/// Durable backend: an append-only log of checksummed batch frames, replayed
/// into an ordered map on open.
#[derive(Debug)]
pub struct SegmentBackend {
    pub file_path: PathBuf,
    file: File,
    current_offset: u64,
    strict: bool,
    wedged: bool,
    state: MemoryBackend,
}

impl SegmentBackend {
    pub fn open(path: &Path, strict: bool) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let len = file.metadata()?.len();
        let mut state = MemoryBackend::new();
        let (valid_len, frames) = if len == 0 {
            (0, 0)
        } else {
            // SAFETY: the log is only written through this handle
            let mmap = unsafe { Mmap::map(&file)? };
            replay(&mmap, &mut state)?
        };

        if valid_len < len {
            warn!(
                path = %path.display(),
                dropped = len - valid_len,
                "truncating torn tail of segment log"
            );
            file.set_len(valid_len)?;
        }
        file.seek(SeekFrom::Start(valid_len))?;

        info!(path = %path.display(), frames, entries = state.len(), "segment log opened");

        Ok(Self {
            file_path: path.to_path_buf(),
            file,
            current_offset: valid_len,
            strict,
            wedged: false,
            state,
        })
    }

    pub fn size_bytes(&self) -> u64 {
        self.current_offset
    }

    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    fn append(&mut self, mutations: &[Mutation]) -> Result<u64> {
        if self.wedged {
            return Err(LedgerError::InvalidOperation(
                "segment log could not be rolled back after a failed append; reopen it".into(),
            ));
        }
        let start = self.current_offset;
        match append_frame(&mut self.file, start, self.strict, mutations) {
            Ok(written) => {
                self.current_offset += written;
                Ok(start)
            }
            Err(AppendError::RolledBack(e)) => Err(e),
            Err(AppendError::Wedged(e)) => {
                self.wedged = true;
                Err(e)
            }
        }
    }

    /// Rewrites the log so it holds only live entries, then swaps it in.
    pub fn compact(&mut self) -> Result<CompactionStats> {
        let bytes_before = self.current_offset;
        let new_path = self.file_path.with_extension("compacted");

        // The handle follows the inode through the rename, so no reopen is needed
        let mut out = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&new_path)?;
        let bytes_after = match write_live_state(&mut out, &self.state) {
            Ok(len) => len,
            Err(e) => {
                let _ = fs::remove_file(&new_path);
                return Err(e);
            }
        };
        if let Err(e) = fs::rename(&new_path, &self.file_path) {
            let _ = fs::remove_file(&new_path);
            return Err(e.into());
        }
        self.file = out;
        self.current_offset = bytes_after;
        self.wedged = false;

        let stats = CompactionStats {
            live_entries: self.state.len(),
            bytes_before,
            bytes_after: self.current_offset,
        };
        info!(
            live = stats.live_entries,
            before = stats.bytes_before,
            after = stats.bytes_after,
            "segment log compacted"
        );
        Ok(stats)
    }
}

impl Backend for SegmentBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.state.get(key)
    }

    fn seek(&self, from: &[u8], end: Option<&[u8]>) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.state.seek(from, end)
    }

    fn scan(&self, from: &[u8], end: Option<&[u8]>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.state.scan(from, end)
    }

    fn count(&self, from: &[u8], end: Option<&[u8]>) -> Result<usize> {
        self.state.count(from, end)
    }

    fn write(&mut self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let offset = self.append(batch.mutations())?;
        debug!(offset, mutations = batch.len(), "frame appended");
        self.state.write(batch)
    }
}

/// Writes every live entry as a fresh log and syncs it. Returns its length.
fn write_live_state(out: &mut File, state: &MemoryBackend) -> Result<u64> {
    let mut len = 0;
    let mut chunk = Vec::with_capacity(COMPACTION_CHUNK);
    for (key, value) in state.entries() {
        chunk.push(Mutation::Put { key: key.clone(), value: value.clone() });
        if chunk.len() == COMPACTION_CHUNK {
            len += write_frame(out, &chunk)?;
            chunk.clear();
        }
    }
    if !chunk.is_empty() {
        len += write_frame(out, &chunk)?;
    }
    out.sync_all()?;
    Ok(len)
}

/// The append end of a segment log.
trait LogFile: Write + Seek {
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
}

impl LogFile for File {
    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

#[derive(Debug)]
enum AppendError {
    /// The log was cut back to its last good frame.
    RolledBack(LedgerError),
    /// The log may hold a partial or unacknowledged frame.
    Wedged(LedgerError),
}

/// Appends one frame at `offset`. On failure the log is truncated back to
/// `offset`, so a rejected batch never reaches replay.
fn append_frame<L: LogFile>(log: &mut L, offset: u64, strict: bool, mutations: &[Mutation]) -> std::result::Result<u64, AppendError> {
    let res = write_frame(log, mutations).and_then(|written| {
        if strict {
            log.sync()?;
        }
        Ok(written)
    });

    match res {
        Ok(written) => Ok(written),
        Err(e) => {
            let undo = log
                .truncate_to(offset)
                .and_then(|_| log.seek(SeekFrom::Start(offset)))
                .and_then(|_| if strict { log.sync() } else { Ok(()) });
            match undo {
                Ok(()) => {
                    warn!(offset, error = %e, "append failed, log rolled back");
                    Err(AppendError::RolledBack(e))
                }
                Err(undo) => {
                    error!(offset, error = %e, rollback = %undo, "append failed and the log could not be rolled back");
                    Err(AppendError::Wedged(e))
                }
            }
        }
    }
}

fn write_frame<W: Write>(out: &mut W, mutations: &[Mutation]) -> Result<u64> {
    let frame = Frame { mutations: mutations.to_vec() };
    let bytes = rkyv::to_bytes::<_, 4096>(&frame)
        .map_err(|e| LedgerError::Serialization(e.to_string()))?;

    // Length-prefixed, checksummed: [Length (4b)][SeaHash (8b)][Data (N bytes)]
    let mut buf = Vec::with_capacity(FRAME_HEADER + bytes.len());
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(&seahash::hash(&bytes).to_le_bytes());
    buf.extend_from_slice(&bytes);
    out.write_all(&buf)?;
    Ok(buf.len() as u64)
}

/// Replays every intact frame. Returns the length of the valid prefix and the
/// number of frames applied.
fn replay(data: &[u8], state: &mut MemoryBackend) -> Result<(u64, usize)> {
    let mut offset = 0usize;
    let mut frames = 0usize;

    while offset < data.len() {
        if data.len() - offset < FRAME_HEADER {
            break;
        }
        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(&data[offset..offset + 4]);
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut sum_buf = [0u8; 8];
        sum_buf.copy_from_slice(&data[offset + 4..offset + FRAME_HEADER]);
        let checksum = u64::from_le_bytes(sum_buf);

        let body_start = offset + FRAME_HEADER;
        if data.len() - body_start < len {
            break;
        }
        let body = &data[body_start..body_start + len];
        let is_last = body_start + len == data.len();

        if seahash::hash(body) != checksum {
            if is_last {
                break;
            }
            return Err(LedgerError::Corruption(format!(
                "checksum mismatch in frame at offset {}",
                offset
            )));
        }

        let mut aligned = rkyv::AlignedVec::with_capacity(len);
        aligned.extend_from_slice(body);
        let archived = rkyv::check_archived_root::<Frame>(&aligned)
            .map_err(|e| LedgerError::Corruption(format!("frame at offset {}: {:?}", offset, e)))?;
        let frame: Frame = archived
            .deserialize(&mut rkyv::Infallible)
            .unwrap_or_else(|never| match never {});

        state.apply(frame.mutations);
        offset = body_start + len;
        frames += 1;
    }

    Ok((offset as u64, frames))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn batch(puts: &[(&str, &str)], erases: &[&str]) -> WriteBatch {
        let mut b = WriteBatch::new();
        for (k, v) in puts {
            b.put(k.as_bytes().to_vec(), v.as_bytes().to_vec());
        }
        for k in erases {
            b.erase(k.as_bytes().to_vec());
        }
        b
    }

    fn keys(entries: Vec<(Vec<u8>, Vec<u8>)>) -> Vec<Vec<u8>> {
        entries.into_iter().map(|(k, _)| k).collect()
    }

    fn k(s: &str) -> Vec<u8> {
        s.as_bytes().to_vec()
    }

    #[test]
    fn test_memory_seek_and_scan_are_half_open() {
        let mut mem = MemoryBackend::new();
        mem.write(batch(&[("a", "1"), ("b", "2"), ("c", "3")], &[])).unwrap();

        assert_eq!(keys(mem.scan(b"a", Some(&b"c"[..])).unwrap()), vec![k("a"), k("b")]);
        assert_eq!(mem.seek(b"b", None).unwrap().unwrap().0, k("b"));
        assert_eq!(mem.seek(b"bb", None).unwrap().unwrap().0, k("c"));
        assert!(mem.seek(b"c", Some(&b"c"[..])).unwrap().is_none());
        assert!(mem.scan(b"z", Some(&b"a"[..])).unwrap().is_empty());
    }

    #[test]
    fn test_staged_reads_through_and_hides_erases() {
        let mut mem = MemoryBackend::new();
        mem.write(batch(&[("a", "1"), ("b", "2"), ("c", "3")], &[])).unwrap();

        let mut staged = Staged::new(&mem);
        staged.write(batch(&[("bb", "x")], &["a", "b"])).unwrap();

        assert_eq!(staged.get(b"a").unwrap(), None);
        assert_eq!(staged.get(b"c").unwrap(), Some(k("3")));
        assert_eq!(staged.seek(b"a", None).unwrap().unwrap().0, k("bb"));
        assert_eq!(keys(staged.scan(b"a", None).unwrap()), vec![k("bb"), k("c")]);

        let out = staged.into_batch();
        assert_eq!(out.len(), 3);
        // Base is untouched until the batch is written back
        assert_eq!(mem.len(), 3);
        mem.write(out).unwrap();
        assert_eq!(keys(mem.scan(b"", None).unwrap()), vec![k("bb"), k("c")]);
    }

    #[test]
    fn test_staged_count_merges_pending_writes() {
        let mut mem = MemoryBackend::new();
        mem.write(batch(&[("a", "1"), ("b", "2"), ("c", "3")], &[])).unwrap();
        assert_eq!(mem.count(b"a", Some(&b"c"[..])).unwrap(), 2);

        let mut staged = Staged::new(&mem);
        staged.write(batch(&[("b", "changed"), ("bb", "new"), ("d", "4")], &["a", "zz"])).unwrap();
        assert_eq!(staged.count(b"a", Some(&b"c"[..])).unwrap(), 2);
        assert_eq!(staged.count(b"a", None).unwrap(), 4);
        assert_eq!(staged.count(b"c", Some(&b"a"[..])).unwrap(), 0);
        assert_eq!(staged.count(b"", None).unwrap(), staged.scan(b"", None).unwrap().len());
    }

    #[test]
    fn test_staged_seek_skips_runs_of_tombstones() {
        let mut mem = MemoryBackend::new();
        mem.write(batch(&[("k1", ""), ("k2", ""), ("k3", ""), ("k4", "")], &[])).unwrap();

        let mut staged = Staged::new(&mem);
        staged.write(batch(&[], &["k1", "k2", "k3"])).unwrap();
        assert_eq!(staged.seek(b"k", Some(&b"l"[..])).unwrap().unwrap().0, k("k4"));

        staged.write(batch(&[], &["k4"])).unwrap();
        assert!(staged.seek(b"k", Some(&b"l"[..])).unwrap().is_none());
    }

    #[test]
    fn test_segment_replays_after_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.log");
        {
            let mut seg = SegmentBackend::open(&path, true).unwrap();
            seg.write(batch(&[("a", "1"), ("b", "2")], &[])).unwrap();
            seg.write(batch(&[("c", "3")], &["a"])).unwrap();
        }
        let seg = SegmentBackend::open(&path, true).unwrap();
        assert_eq!(seg.get(b"a").unwrap(), None);
        assert_eq!(seg.get(b"b").unwrap(), Some(k("2")));
        assert_eq!(seg.get(b"c").unwrap(), Some(k("3")));
    }

    #[test]
    fn test_segment_drops_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.log");
        let intact_len = {
            let mut seg = SegmentBackend::open(&path, false).unwrap();
            seg.write(batch(&[("a", "1")], &[])).unwrap();
            let len = seg.size_bytes();
            seg.write(batch(&[("b", "2")], &[])).unwrap();
            len
        };
        // Chop the second frame in half
        let full = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(intact_len + (full - intact_len) / 2).unwrap();
        drop(file);

        let mut seg = SegmentBackend::open(&path, false).unwrap();
        assert_eq!(seg.get(b"a").unwrap(), Some(k("1")));
        assert_eq!(seg.get(b"b").unwrap(), None);
        assert_eq!(seg.size_bytes(), intact_len);

        // Appending after recovery keeps the log readable
        seg.write(batch(&[("c", "3")], &[])).unwrap();
        drop(seg);
        let seg = SegmentBackend::open(&path, false).unwrap();
        assert_eq!(seg.len(), 2);
    }

    #[test]
    fn test_segment_detects_corruption_before_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.log");
        {
            let mut seg = SegmentBackend::open(&path, false).unwrap();
            seg.write(batch(&[("a", "1")], &[])).unwrap();
            seg.write(batch(&[("b", "2")], &[])).unwrap();
        }
        let mut bytes = fs::read(&path).unwrap();
        bytes[FRAME_HEADER + 1] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        assert!(matches!(SegmentBackend::open(&path, false), Err(LedgerError::Corruption(_))));
    }

    #[test]
    fn test_compaction_preserves_live_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.log");
        let mut seg = SegmentBackend::open(&path, false).unwrap();
        for i in 0..50 {
            let key = format!("key{:02}", i);
            seg.write(batch(&[(key.as_str(), "v")], &[])).unwrap();
        }
        for i in 0..40 {
            let key = format!("key{:02}", i);
            seg.write(batch(&[], &[key.as_str()])).unwrap();
        }

        let stats = seg.compact().unwrap();
        assert_eq!(stats.live_entries, 10);
        assert!(stats.bytes_after < stats.bytes_before);

        seg.write(batch(&[("new", "v")], &[])).unwrap();
        drop(seg);

        let seg = SegmentBackend::open(&path, false).unwrap();
        assert_eq!(seg.len(), 11);
        assert_eq!(seg.get(b"key45").unwrap(), Some(k("v")));
        assert_eq!(seg.get(b"key05").unwrap(), None);
        assert!(!path.with_extension("compacted").exists());
    }

    /// In-memory log whose writes and syncs can be made to fail.
    struct FlakyLog {
        data: io::Cursor<Vec<u8>>,
        budget: usize,
        fail_sync: bool,
        fail_truncate: bool,
    }

    impl FlakyLog {
        fn new() -> Self {
            Self {
                data: io::Cursor::new(Vec::new()),
                budget: usize::MAX,
                fail_sync: false,
                fail_truncate: false,
            }
        }

        fn bytes(&self) -> &[u8] {
            self.data.get_ref()
        }
    }

    impl Write for FlakyLog {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "no space left on device"));
            }
            let n = buf.len().min(self.budget);
            self.budget -= n;
            self.data.write(&buf[..n])
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for FlakyLog {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.data.seek(pos)
        }
    }

    impl LogFile for FlakyLog {
        fn truncate_to(&mut self, len: u64) -> io::Result<()> {
            if self.fail_truncate {
                return Err(io::Error::new(io::ErrorKind::Other, "read-only file system"));
            }
            self.data.get_mut().truncate(len as usize);
            Ok(())
        }

        fn sync(&mut self) -> io::Result<()> {
            if self.fail_sync {
                return Err(io::Error::new(io::ErrorKind::Other, "sync failed"));
            }
            Ok(())
        }
    }

    fn replayed(bytes: &[u8]) -> (MemoryBackend, usize) {
        let mut state = MemoryBackend::new();
        let (valid, frames) = replay(bytes, &mut state).unwrap();
        assert_eq!(valid, bytes.len() as u64);
        (state, frames)
    }

    #[test]
    fn test_partial_append_is_cut_back() {
        let mut log = FlakyLog::new();
        let end = append_frame(&mut log, 0, false, batch(&[("a", "1")], &[]).mutations()).unwrap();

        log.budget = 5;
        let err = append_frame(&mut log, end, false, batch(&[("b", "2")], &[]).mutations()).unwrap_err();
        assert!(matches!(err, AppendError::RolledBack(LedgerError::Io(_))));
        assert_eq!(log.bytes().len() as u64, end);

        log.budget = usize::MAX;
        append_frame(&mut log, end, false, batch(&[("c", "3")], &[]).mutations()).unwrap();

        let (state, frames) = replayed(log.bytes());
        assert_eq!(frames, 2);
        assert_eq!(state.get(b"a").unwrap(), Some(k("1")));
        assert_eq!(state.get(b"b").unwrap(), None);
        assert_eq!(state.get(b"c").unwrap(), Some(k("3")));
    }

    #[test]
    fn test_failed_sync_discards_the_whole_frame() {
        let mut log = FlakyLog::new();
        let end = append_frame(&mut log, 0, true, batch(&[("a", "1")], &[]).mutations()).unwrap();

        log.fail_sync = true;
        assert!(append_frame(&mut log, end, true, batch(&[("b", "2")], &[]).mutations()).is_err());
        assert_eq!(log.bytes().len() as u64, end);

        let (state, frames) = replayed(log.bytes());
        assert_eq!(frames, 1);
        assert_eq!(state.get(b"b").unwrap(), None);
    }

    #[test]
    fn test_unrecoverable_append_is_reported() {
        let mut log = FlakyLog::new();
        log.budget = 3;
        log.fail_truncate = true;
        let err = append_frame(&mut log, 0, false, batch(&[("a", "1")], &[]).mutations()).unwrap_err();
        assert!(matches!(err, AppendError::Wedged(_)));
    }

    #[test]
    fn test_compaction_keeps_appending_to_the_new_log() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.log");
        let mut seg = SegmentBackend::open(&path, true).unwrap();
        seg.write(batch(&[("a", "1"), ("b", "2")], &[])).unwrap();
        seg.write(batch(&[], &["a"])).unwrap();

        let stats = seg.compact().unwrap();
        assert_eq!(stats.bytes_after, fs::metadata(&path).unwrap().len());

        seg.write(batch(&[("c", "3")], &[])).unwrap();
        assert_eq!(seg.size_bytes(), fs::metadata(&path).unwrap().len());
        drop(seg);

        let seg = SegmentBackend::open(&path, true).unwrap();
        assert_eq!(seg.len(), 2);
        assert_eq!(seg.get(b"c").unwrap(), Some(k("3")));
    }
}
