//! Sorters: the shuffle stage between mappers and reducers.
//!
//! A sorter receives intermediate pairs from concurrently running mappers
//! through per-partition collectors, seals the store at the map/reduce
//! barrier, and then serves each output partition's records back as
//! sorted per-key groups. Two strategies are provided: [`MemSorter`]
//! keeps everything in one growing buffer per partition, [`FileSorter`]
//! spills to KV files and sorts on demand so intermediates larger than
//! RAM survive.
//!
//! Keys order by unsigned lexicographic comparison of their encoded
//! bytes. Within a key group, values keep a deterministic
//! arrival-derived order (stable sort for [`MemSorter`], file order for
//! [`FileSorter`]).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crossbeam_channel as channel;
use tracing::debug;

use crate::api::{CollectCloser, PartCollector, Reducer, SvIter};
use crate::codec::{sv_bytes, Len, Sv};
use crate::error::{Error, Result};
use crate::fs::FsPath;
use crate::kvfile::{read_as_byte_offs, write_byte_offs, KvReader, KvWriter};

/// Drives a reducer over one partition's sorted key groups.
pub trait ReduceIterator {
    /// Calls `r.reduce` once per unique key in ascending byte order,
    /// then `r.reduce_end` exactly once. A reducer that returns without
    /// exhausting its value iterator is drained silently so the next
    /// group starts aligned.
    fn iterate(&mut self, c: &mut [Box<dyn CollectCloser>], r: &mut dyn Reducer) -> Result<()>;
}

/// Receives all intermediate pairs from the map phase, sorts them, and
/// serves them to the reduce phase.
pub trait Sorter: Send + Sync {
    /// Returns the collector mappers of input partition `in_part` route
    /// records through. Collectors are invoked concurrently.
    fn new_part_collector<'a>(&'a self, in_part: usize) -> Result<Box<dyn PartCollector + 'a>>;

    /// Seals the intermediate store. The driver calls this once, after
    /// every mapper has finished.
    fn close_part_collectors(&self) -> Result<()>;

    /// Output partitions holding at least one record.
    fn reduce_parts(&self) -> Vec<usize>;

    /// Opens the reduce iterator for one partition. Valid only after
    /// [`Sorter::close_part_collectors`], at most once per partition.
    fn new_reduce_iterator<'a>(&'a self, part: usize) -> Result<Box<dyn ReduceIterator + 'a>>;
}

fn part_name(part: usize) -> String {
    format!("part-{part:05}")
}

/*
 * MemSorter
 */

/// One partition's intermediate store: records packed back-to-back in a
/// single growing buffer, with offset vectors locating each encoded key
/// and value. `key_offs[i]..val_offs[i]` is record i's key,
/// `val_offs[i]..val_ends[i]` its value.
#[derive(Debug, Default)]
struct MemPart {
    buffer: Vec<u8>,
    key_offs: Vec<usize>,
    val_offs: Vec<usize>,
    val_ends: Vec<usize>,
}

impl MemPart {
    fn key(&self, i: usize) -> &[u8] {
        &self.buffer[self.key_offs[i]..self.val_offs[i]]
    }
}

/// All-in-memory sort strategy.
#[derive(Debug, Default)]
pub struct MemSorter {
    parts: RwLock<HashMap<usize, Arc<Mutex<MemPart>>>>,
}

impl MemSorter {
    pub fn new() -> Self {
        MemSorter::default()
    }
}

impl PartCollector for MemSorter {
    fn collect_to(&self, part: usize, key: &dyn Sv, val: &dyn Sv) -> Result<()> {
        // fast path under the read lock; re-check under the write lock
        // before inserting
        let slot = { self.parts.read().unwrap().get(&part).cloned() };
        let slot = match slot {
            Some(s) => s,
            None => Arc::clone(self.parts.write().unwrap().entry(part).or_default()),
        };

        let mut guard = slot.lock().unwrap();
        let p = &mut *guard;
        p.key_offs.push(p.buffer.len());
        key.encode(&mut p.buffer)?;
        p.val_offs.push(p.buffer.len());
        val.encode(&mut p.buffer)?;
        p.val_ends.push(p.buffer.len());
        Ok(())
    }
}

impl Sorter for MemSorter {
    fn new_part_collector<'a>(&'a self, _in_part: usize) -> Result<Box<dyn PartCollector + 'a>> {
        // the sorter itself routes records
        Ok(Box::new(self))
    }

    fn close_part_collectors(&self) -> Result<()> {
        Ok(())
    }

    fn reduce_parts(&self) -> Vec<usize> {
        self.parts.read().unwrap().keys().copied().collect()
    }

    fn new_reduce_iterator<'a>(&'a self, part: usize) -> Result<Box<dyn ReduceIterator + 'a>> {
        let slot = self
            .parts
            .read()
            .unwrap()
            .get(&part)
            .cloned()
            .ok_or_else(|| Error::Config(format!("partition {part} has no collected records")))?;
        let data = std::mem::take(&mut *slot.lock().unwrap());

        let mut order: Vec<usize> = (0..data.key_offs.len()).collect();
        order.sort_by(|&a, &b| data.key(a).cmp(data.key(b)));
        debug!(part, records = order.len(), "sorted in-memory partition");

        Ok(Box::new(MemReduceIter {
            buffer: data.buffer,
            key_offs: order.iter().map(|&i| data.key_offs[i]).collect(),
            val_offs: order.iter().map(|&i| data.val_offs[i]).collect(),
            val_ends: order.iter().map(|&i| data.val_ends[i]).collect(),
        }))
    }
}

struct MemReduceIter {
    buffer: Vec<u8>,
    key_offs: Vec<usize>,
    val_offs: Vec<usize>,
    val_ends: Vec<usize>,
}

impl ReduceIterator for MemReduceIter {
    fn iterate(&mut self, c: &mut [Box<dyn CollectCloser>], r: &mut dyn Reducer) -> Result<()> {
        let mut key = r.new_key();
        let mut val = r.new_val();
        let n = self.key_offs.len();
        let mut idx = 0;
        while idx < n {
            let kb = &self.buffer[self.key_offs[idx]..self.val_offs[idx]];
            let mut kr: &[u8] = kb;
            key.decode(&mut kr, Len::Known(kb.len()))?;

            let mut cur = Some(idx);
            idx += 1;
            let mut vals = MemValueIter {
                buffer: &self.buffer,
                key_offs: &self.key_offs,
                val_offs: &self.val_offs,
                val_ends: &self.val_ends,
                idx: &mut idx,
                cur: &mut cur,
                val: &mut val,
            };
            r.reduce(&*key, &mut vals, c)?;
            // the reducer may return before exhausting the group
            while vals.next()?.is_some() {}
        }
        r.reduce_end(c)
    }
}

/// Value iterator over one in-memory key group. `cur` indexes the
/// pending value; advancing looks ahead one record to decide whether the
/// group continues.
struct MemValueIter<'a> {
    buffer: &'a [u8],
    key_offs: &'a [usize],
    val_offs: &'a [usize],
    val_ends: &'a [usize],
    idx: &'a mut usize,
    cur: &'a mut Option<usize>,
    val: &'a mut Box<dyn Sv>,
}

impl SvIter for MemValueIter<'_> {
    fn next(&mut self) -> Result<Option<&dyn Sv>> {
        let Some(c) = *self.cur else {
            return Ok(None);
        };
        let vb = &self.buffer[self.val_offs[c]..self.val_ends[c]];
        let mut vr: &[u8] = vb;
        self.val.decode(&mut vr, Len::Known(vb.len()))?;
        *self.cur = None;

        let i = *self.idx;
        if i < self.key_offs.len() {
            let prev = &self.buffer[self.key_offs[i - 1]..self.val_offs[i - 1]];
            let here = &self.buffer[self.key_offs[i]..self.val_offs[i]];
            if prev == here {
                *self.cur = Some(i);
                *self.idx += 1;
            }
        }
        Ok(Some(&**self.val))
    }
}

/*
 * FileSorter
 */

const PATH_MAP_OUT: &str = "mapOut";
const PATH_SORTED: &str = "sorted";

/// Default number of partitions sorted concurrently; bounds peak memory
/// during the reduce fan-out.
pub const DEFAULT_SORT_TOKENS: usize = 2;

struct SpillPart {
    raw_path: FsPath,
    writer: Mutex<Option<KvWriter>>,
}

/// Spill-to-disk sort strategy.
///
/// Every output partition gets a dedicated KV file under
/// `<tmp>/mapOut/`; `new_reduce_iterator` loads, sorts and rewrites one
/// partition at a time under `<tmp>/sorted/`, holding a sort token so at
/// most a fixed number of partitions are resident during sorting.
pub struct FileSorter {
    tmp: FsPath,
    spills: RwLock<HashMap<usize, Arc<SpillPart>>>,
    token_tx: channel::Sender<()>,
    token_rx: channel::Receiver<()>,
}

impl FileSorter {
    /// A FileSorter spilling under `tmp`, with the default sort-token
    /// capacity.
    pub fn new(tmp: FsPath) -> Self {
        FileSorter::with_sort_tokens(tmp, DEFAULT_SORT_TOKENS)
    }

    /// A FileSorter allowing `tokens` concurrent partition sorts.
    ///
    /// Stale spill directories from a previous run are removed.
    pub fn with_sort_tokens(tmp: FsPath, tokens: usize) -> Self {
        let tokens = tokens.max(1);
        let (token_tx, token_rx) = channel::bounded(tokens);
        for _ in 0..tokens {
            let _ = token_tx.send(());
        }
        let _ = tmp.join(PATH_MAP_OUT).remove();
        let _ = tmp.join(PATH_SORTED).remove();
        FileSorter { tmp, spills: RwLock::default(), token_tx, token_rx }
    }

    fn spill(&self, part: usize) -> Result<Arc<SpillPart>> {
        // fast path under the read lock; re-check under the write lock
        // before creating the file
        if let Some(s) = self.spills.read().unwrap().get(&part) {
            return Ok(Arc::clone(s));
        }
        let mut map = self.spills.write().unwrap();
        if let Some(s) = map.get(&part) {
            return Ok(Arc::clone(s));
        }
        let dir = self.tmp.join(PATH_MAP_OUT);
        dir.mkdir()?;
        let raw_path = dir.join(part_name(part));
        let writer = KvWriter::create(&raw_path)?;
        let spill = Arc::new(SpillPart { raw_path, writer: Mutex::new(Some(writer)) });
        map.insert(part, Arc::clone(&spill));
        Ok(spill)
    }
}

impl PartCollector for FileSorter {
    fn collect_to(&self, part: usize, key: &dyn Sv, val: &dyn Sv) -> Result<()> {
        let spill = self.spill(part)?;
        let mut writer = spill.writer.lock().unwrap();
        match writer.as_mut() {
            Some(w) => w.collect(key, val),
            None => Err(Error::InvariantViolated(format!(
                "collect to partition {part} after the store was sealed"
            ))),
        }
    }
}

impl Sorter for FileSorter {
    fn new_part_collector<'a>(&'a self, _in_part: usize) -> Result<Box<dyn PartCollector + 'a>> {
        Ok(Box::new(self))
    }

    fn close_part_collectors(&self) -> Result<()> {
        let spills = self.spills.read().unwrap();
        let mut res = Ok(());
        for spill in spills.values() {
            if let Some(mut w) = spill.writer.lock().unwrap().take() {
                if let Err(e) = w.close() {
                    res = Err(e);
                }
            }
        }
        res
    }

    fn reduce_parts(&self) -> Vec<usize> {
        self.spills.read().unwrap().keys().copied().collect()
    }

    fn new_reduce_iterator<'a>(&'a self, part: usize) -> Result<Box<dyn ReduceIterator + 'a>> {
        let spill = self
            .spills
            .read()
            .unwrap()
            .get(&part)
            .cloned()
            .ok_or_else(|| Error::Config(format!("partition {part} has no spill file")))?;

        let token = SortToken::acquire(&self.token_rx, &self.token_tx);
        let sorted = (|| -> Result<FsPath> {
            let mut offs = read_as_byte_offs(&spill.raw_path)?;
            offs.sort_by_key();
            debug!(part, records = offs.len(), "sorted spilled partition");
            let dir = self.tmp.join(PATH_SORTED);
            dir.mkdir()?;
            let sorted = dir.join(part_name(part));
            write_byte_offs(&sorted, &offs)?;
            Ok(sorted)
        })();
        // sorting is the memory-bounded step; reduce iteration runs
        // without a token
        drop(token);

        let reader = KvReader::open(&sorted?)?;
        Ok(Box::new(FileReduceIter { reader }))
    }
}

struct SortToken<'a> {
    tx: &'a channel::Sender<()>,
}

impl<'a> SortToken<'a> {
    fn acquire(rx: &channel::Receiver<()>, tx: &'a channel::Sender<()>) -> Self {
        // both endpoints live in the sorter, so the channel cannot be
        // disconnected while we hold &self
        let _ = rx.recv();
        SortToken { tx }
    }
}

impl Drop for SortToken<'_> {
    fn drop(&mut self) {
        let _ = self.tx.send(());
    }
}

struct FileReduceIter {
    reader: KvReader,
}

impl ReduceIterator for FileReduceIter {
    fn iterate(&mut self, c: &mut [Box<dyn CollectCloser>], r: &mut dyn Reducer) -> Result<()> {
        let mut key = r.new_key();
        let mut val = r.new_val();
        let mut next_key = r.new_key();
        let mut next_val = r.new_val();

        let mut have = self.reader.next(&mut *key, &mut *val)?;
        let mut key_bytes = if have { sv_bytes(&*key)? } else { Vec::new() };
        while have {
            let mut has_cur = true;
            let mut has_next = false;
            {
                let mut vals = FileValueIter {
                    reader: &mut self.reader,
                    key_bytes: &key_bytes,
                    val: &mut val,
                    next_key: &mut next_key,
                    next_val: &mut next_val,
                    has_cur: &mut has_cur,
                    has_next: &mut has_next,
                };
                r.reduce(&*key, &mut vals, c)?;
                // the reducer may return before exhausting the group
                while vals.next()?.is_some() {}
            }
            if !has_next {
                break;
            }
            // the lookahead record is the next group's first pair
            std::mem::swap(&mut key, &mut next_key);
            std::mem::swap(&mut val, &mut next_val);
            key_bytes = sv_bytes(&*key)?;
        }
        let res = r.reduce_end(c);
        let closed = self.reader.close();
        res.and(closed)
    }
}

/// Value iterator over one key group of a sorted KV file. Keeps
/// one-record lookahead in `next_key`/`next_val` to detect the group
/// boundary; slots are swapped rather than copied so the handed-out
/// value stays untouched until the following call.
struct FileValueIter<'a> {
    reader: &'a mut KvReader,
    key_bytes: &'a [u8],
    val: &'a mut Box<dyn Sv>,
    next_key: &'a mut Box<dyn Sv>,
    next_val: &'a mut Box<dyn Sv>,
    has_cur: &'a mut bool,
    has_next: &'a mut bool,
}

impl SvIter for FileValueIter<'_> {
    fn next(&mut self) -> Result<Option<&dyn Sv>> {
        if !*self.has_cur {
            return Ok(None);
        }
        *self.has_cur = false;

        if self.reader.next(&mut **self.next_key, &mut **self.next_val)? {
            *self.has_next = true;
            if sv_bytes(&**self.next_key)? == self.key_bytes {
                // same key: the lookahead value becomes the pending one
                std::mem::swap(self.val, self.next_val);
                *self.has_cur = true;
                return Ok(Some(&**self.next_val));
            }
        } else {
            *self.has_next = false;
        }
        Ok(Some(&**self.val))
    }
}
