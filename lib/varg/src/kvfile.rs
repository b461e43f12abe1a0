//! Sequential key-value file format.
//!
//! A KV file is a self-framed record stream with no header, footer or
//! magic:
//!
//! ```text
//! [ VInt(key_len) key_bytes VInt(val_len) val_bytes ]*
//! ```
//!
//! An empty file holds zero records. End of file at a record boundary is
//! the normal terminator; a record cut anywhere else surfaces
//! [`Error::UnexpectedEof`], and a decoded field that disagrees with its
//! declared length surfaces [`Error::BadFormat`].

use crate::api::{CollectCloser, Collector, IterateCloser};
use crate::codec::{Len, Sv, VInt};
use crate::error::{Error, Result};
use crate::fs::FsPath;
use crate::io::{CountingReader, ReadCloser, Reader, WriteCloser, Writer};

/// Writes records to a KV file.
///
/// Keys and values are serialized into a reusable scratch buffer first so
/// their length prefix can be emitted ahead of the payload; the scratch is
/// reset, not freed, between fields to keep allocations amortized.
pub struct KvWriter {
    writer: Box<dyn WriteCloser + Send>,
    scratch: Vec<u8>,
    closed: bool,
}

impl KvWriter {
    /// Creates (truncating) the file at `fp`.
    pub fn create(fp: &FsPath) -> Result<Self> {
        let writer = fp.create()?;
        Ok(KvWriter { writer, scratch: Vec::new(), closed: false })
    }

    /// Appends one record.
    pub fn collect(&mut self, key: &dyn Sv, val: &dyn Sv) -> Result<()> {
        self.write_field(key)?;
        self.write_field(val)
    }

    fn write_field(&mut self, sv: &dyn Sv) -> Result<()> {
        self.scratch.clear();
        sv.encode(&mut self.scratch)?;
        VInt(self.scratch.len() as u64).encode(&mut self.writer)?;
        self.writer.write_all(&self.scratch)
    }

    /// Flushes and closes the underlying sink.
    pub fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.writer.close()
    }
}

impl Drop for KvWriter {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.writer.close();
        }
    }
}

impl Collector for KvWriter {
    fn collect(&mut self, key: &dyn Sv, val: &dyn Sv) -> Result<()> {
        KvWriter::collect(self, key, val)
    }
}

impl CollectCloser for KvWriter {
    fn close(&mut self) -> Result<()> {
        KvWriter::close(self)
    }
}

/// Reads records from a KV file into caller-owned slots.
pub struct KvReader {
    reader: CountingReader<Box<dyn ReadCloser + Send>>,
}

impl KvReader {
    pub fn open(fp: &FsPath) -> Result<Self> {
        let reader = fp.open()?;
        Ok(KvReader { reader: CountingReader::new(reader) })
    }

    /// Decodes the next record into `key` and `val`, validating that each
    /// field consumed exactly its declared extent. `Ok(false)` is the
    /// clean end of the file.
    pub fn next(&mut self, key: &mut dyn Sv, val: &mut dyn Sv) -> Result<bool> {
        let mut len = VInt(0);
        match len.decode(&mut self.reader, Len::Unknown) {
            Ok(()) => {}
            Err(Error::Eof) => return Ok(false),
            Err(e) => return Err(e),
        }
        self.read_field(key, len.0)?;

        // the key is already consumed, so a missing value is truncation
        let mut len = VInt(0);
        match len.decode(&mut self.reader, Len::Unknown) {
            Ok(()) => {}
            Err(Error::Eof) | Err(Error::UnexpectedEof) => return Err(Error::UnexpectedEof),
            Err(e) => return Err(e),
        }
        self.read_field(val, len.0)?;
        Ok(true)
    }

    fn read_field(&mut self, sv: &mut dyn Sv, len: u64) -> Result<()> {
        let end = self.reader.pos() + len;
        match sv.decode(&mut self.reader, Len::Known(len as usize)) {
            Ok(()) => {}
            Err(Error::Eof) | Err(Error::UnexpectedEof) => return Err(Error::UnexpectedEof),
            Err(e) => return Err(e),
        }
        if self.reader.pos() != end {
            return Err(Error::BadFormat);
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        self.reader.get_mut().close()
    }
}

impl IterateCloser for KvReader {
    fn next(&mut self, key: &mut dyn Sv, val: &mut dyn Sv) -> Result<bool> {
        KvReader::next(self, key, val)
    }

    fn close(&mut self) -> Result<()> {
        KvReader::close(self)
    }
}

/// A KV file loaded whole into memory, with parallel offset slices
/// locating every key and value byte range in `buffer`.
///
/// Invariant per record `i`:
/// `key_offs[i] <= key_ends[i] <= val_offs[i] <= val_ends[i] <= buffer.len()`.
#[derive(Debug, Default, Clone)]
pub struct ByteOffs {
    pub buffer: Vec<u8>,
    pub key_offs: Vec<usize>,
    pub key_ends: Vec<usize>,
    pub val_offs: Vec<usize>,
    pub val_ends: Vec<usize>,
}

impl ByteOffs {
    pub fn len(&self) -> usize {
        self.key_offs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key_offs.is_empty()
    }

    pub fn key(&self, i: usize) -> &[u8] {
        &self.buffer[self.key_offs[i]..self.key_ends[i]]
    }

    pub fn val(&self, i: usize) -> &[u8] {
        &self.buffer[self.val_offs[i]..self.val_ends[i]]
    }

    /// Stable-sorts the records by unsigned lexicographic byte order of
    /// their keys. Only the offset slices move; the buffer stays put.
    pub fn sort_by_key(&mut self) {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.sort_by(|&a, &b| self.key(a).cmp(self.key(b)));
        self.key_offs = order.iter().map(|&i| self.key_offs[i]).collect();
        self.key_ends = order.iter().map(|&i| self.key_ends[i]).collect();
        self.val_offs = order.iter().map(|&i| self.val_offs[i]).collect();
        self.val_ends = order.iter().map(|&i| self.val_ends[i]).collect();
    }
}

/// Loads the whole KV file at `fp` and scans it into a [`ByteOffs`]
/// bundle without decoding any payload.
pub fn read_as_byte_offs(fp: &FsPath) -> Result<ByteOffs> {
    let size = fp.stat()?.size as usize;
    let mut reader = fp.open()?;
    let mut buffer = vec![0u8; size];
    let res = if size > 0 { reader.read_full(&mut buffer) } else { Ok(()) };
    let closed = reader.close();
    res?;
    closed?;

    let mut offs = ByteOffs { buffer, ..ByteOffs::default() };
    let mut r = CountingReader::new(&offs.buffer[..]);
    while (r.pos() as usize) < offs.buffer.len() {
        offs.key_offs.push(scan_field_start(&mut r)?);
        offs.key_ends.push(r.pos() as usize);
        offs.val_offs.push(scan_field_start(&mut r)?);
        offs.val_ends.push(r.pos() as usize);
    }
    Ok(offs)
}

/// Reads one `VInt` length and skips the payload, returning the payload's
/// start offset. Any framing defect in the in-memory image is
/// [`Error::BadFormat`].
fn scan_field_start(r: &mut CountingReader<&[u8]>) -> Result<usize> {
    let mut len = VInt(0);
    len.decode(r, Len::Unknown).map_err(|_| Error::BadFormat)?;
    let start = r.pos() as usize;
    if r.skip(len.0)? != len.0 {
        return Err(Error::BadFormat);
    }
    Ok(start)
}

/// Writes a KV file from a [`ByteOffs`] bundle, re-framing each record
/// with fresh length prefixes.
pub fn write_byte_offs(fp: &FsPath, offs: &ByteOffs) -> Result<()> {
    let n = offs.key_offs.len();
    if offs.key_ends.len() != n || offs.val_offs.len() != n || offs.val_ends.len() != n {
        return Err(Error::InvariantViolated(format!(
            "offset slices must have equal lengths: key_offs={} key_ends={} val_offs={} val_ends={}",
            offs.key_offs.len(),
            offs.key_ends.len(),
            offs.val_offs.len(),
            offs.val_ends.len(),
        )));
    }

    let mut writer = fp.create()?;
    let res = (|| {
        for i in 0..n {
            VInt((offs.key_ends[i] - offs.key_offs[i]) as u64).encode(&mut writer)?;
            writer.write_all(&offs.buffer[offs.key_offs[i]..offs.key_ends[i]])?;
            VInt((offs.val_ends[i] - offs.val_offs[i]) as u64).encode(&mut writer)?;
            writer.write_all(&offs.buffer[offs.val_offs[i]..offs.val_ends[i]])?;
        }
        Ok(())
    })();
    let closed = writer.close();
    res.and(closed)
}
