//! Serializable-value (SV) catalogue.
//!
//! Every value that crosses the engine — record keys, record values,
//! intermediates — implements [`Sv`]: a length-framed binary encode plus an
//! in-place decode. Decoding overwrites the receiver so one slot can be
//! reused across an entire record stream without reallocating; callers that
//! retain contents across records must copy.
//!
//! Wire encodings:
//!
//! ```text
//! I32      4 bytes, little-endian
//! VInt     base-128 LEB, 7-bit groups LSB first, 0x80 = continuation
//! RawVInt  minimal little-endian bytes, length supplied by outer frame
//! Bytes    VInt(n) then n bytes
//! RawBytes n bytes, length supplied by outer frame
//! Str      as Bytes (UTF-8)
//! RawStr   as RawBytes (UTF-8)
//! Null     zero bytes
//! Time     Bytes frame of [secs i64 LE][subsec nanos u32 LE]
//! ```

use std::any::Any;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::io::{Reader, Writer};

/// Declared byte length handed to [`Sv::decode`] by a self-describing
/// outer frame. `Unknown` means the value must frame itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Len {
    Unknown,
    Known(usize),
}

impl Len {
    pub fn known(self) -> Option<usize> {
        match self {
            Len::Unknown => None,
            Len::Known(n) => Some(n),
        }
    }
}

/// Object-safe downcast support for [`Sv`] trait objects.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A serializable value.
///
/// Types that require a known length (the `Raw*` family) fail with
/// [`Error::BadFormat`] when decoded with [`Len::Unknown`]; self-framed
/// types ignore the declared length. An implementation must never consume
/// bytes beyond its declared extent, and it never logs — errors are
/// returned, not reported.
pub trait Sv: AsAny + Send + fmt::Debug {
    fn encode(&self, w: &mut dyn Writer) -> Result<()>;
    fn decode(&mut self, r: &mut dyn Reader, len: Len) -> Result<()>;
}

impl dyn Sv + '_ {
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.as_any().downcast_ref()
    }

    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut()
    }
}

/// Encodes an SV into a fresh byte vector.
///
/// Sorters use this to compare keys by their encoded form.
pub fn sv_bytes(sv: &dyn Sv) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    sv.encode(&mut buf)?;
    Ok(buf)
}

/// Fixed-width 32-bit integer, little-endian.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct I32(pub i32);

impl Sv for I32 {
    fn encode(&self, w: &mut dyn Writer) -> Result<()> {
        w.write_all(&self.0.to_le_bytes())
    }

    fn decode(&mut self, r: &mut dyn Reader, len: Len) -> Result<()> {
        if !matches!(len, Len::Unknown | Len::Known(4)) {
            return Err(Error::BadFormat);
        }
        let mut arr = [0u8; 4];
        r.read_full(&mut arr)?;
        self.0 = i32::from_le_bytes(arr);
        Ok(())
    }
}

/// Variable-length integer, base-128 LEB.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VInt(pub u64);

impl Sv for VInt {
    fn encode(&self, w: &mut dyn Writer) -> Result<()> {
        let mut arr = [0u8; 10];
        let mut v = self.0;
        let mut n = 0;
        while v > 0x7f {
            arr[n] = (v as u8 & 0x7f) | 0x80;
            n += 1;
            v >>= 7;
        }
        arr[n] = v as u8;
        w.write_all(&arr[..=n])
    }

    fn decode(&mut self, r: &mut dyn Reader, _len: Len) -> Result<()> {
        let mut b = r.read_byte()?;
        let mut v = (b & 0x7f) as u64;
        let mut shift = 7u32;
        while b & 0x80 != 0 {
            b = match r.read_byte() {
                Ok(b) => b,
                Err(Error::Eof) => return Err(Error::UnexpectedEof),
                Err(e) => return Err(e),
            };
            if shift < 64 {
                v |= ((b & 0x7f) as u64) << shift;
            }
            shift += 7;
        }
        self.0 = v;
        Ok(())
    }
}

/// Integer stored as its minimal little-endian byte sequence; zero is
/// zero bytes. The outer frame supplies the length.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RawVInt(pub u64);

impl Sv for RawVInt {
    fn encode(&self, w: &mut dyn Writer) -> Result<()> {
        let mut arr = [0u8; 8];
        let mut v = self.0;
        let mut n = 0;
        while v != 0 {
            arr[n] = v as u8;
            n += 1;
            v >>= 8;
        }
        w.write_all(&arr[..n])
    }

    fn decode(&mut self, r: &mut dyn Reader, len: Len) -> Result<()> {
        let Some(mut left) = len.known() else {
            return Err(Error::BadFormat);
        };
        let mut v = 0u64;
        let mut shift = 0u32;
        while left > 0 {
            let b = match r.read_byte() {
                Ok(b) => b,
                Err(Error::Eof) => return Err(Error::UnexpectedEof),
                Err(e) => return Err(e),
            };
            if shift < 64 {
                v |= (b as u64) << shift;
            }
            shift += 8;
            left -= 1;
        }
        self.0 = v;
        Ok(())
    }
}

/// Length-prefixed byte buffer: `VInt(n)` then `n` bytes.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bytes(pub Vec<u8>);

impl Sv for Bytes {
    fn encode(&self, w: &mut dyn Writer) -> Result<()> {
        VInt(self.0.len() as u64).encode(w)?;
        w.write_all(&self.0)
    }

    fn decode(&mut self, r: &mut dyn Reader, _len: Len) -> Result<()> {
        let mut sz = VInt(0);
        sz.decode(r, Len::Unknown)?;
        self.0.clear();
        self.0.resize(sz.0 as usize, 0);
        r.read_full(&mut self.0)
    }
}

/// Byte buffer without a length prefix; the outer frame supplies the
/// length.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RawBytes(pub Vec<u8>);

impl Sv for RawBytes {
    fn encode(&self, w: &mut dyn Writer) -> Result<()> {
        w.write_all(&self.0)
    }

    fn decode(&mut self, r: &mut dyn Reader, len: Len) -> Result<()> {
        let Some(sz) = len.known() else {
            return Err(Error::BadFormat);
        };
        self.0.clear();
        self.0.resize(sz, 0);
        r.read_full(&mut self.0)
    }
}

/// UTF-8 string encoded as [`Bytes`]. Invalid UTF-8 decodes to
/// [`Error::BadFormat`]; use [`Bytes`] for byte-transparent payloads.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Str(pub String);

impl Str {
    pub fn new(s: impl Into<String>) -> Self {
        Str(s.into())
    }
}

impl Sv for Str {
    fn encode(&self, w: &mut dyn Writer) -> Result<()> {
        VInt(self.0.len() as u64).encode(w)?;
        w.write_all(self.0.as_bytes())
    }

    fn decode(&mut self, r: &mut dyn Reader, _len: Len) -> Result<()> {
        // reuse the slot's allocation across records
        let mut ba = Bytes(std::mem::take(&mut self.0).into_bytes());
        ba.decode(r, Len::Unknown)?;
        self.0 = String::from_utf8(ba.0).map_err(|_| Error::BadFormat)?;
        Ok(())
    }
}

/// UTF-8 string without a length prefix.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RawStr(pub String);

impl RawStr {
    pub fn new(s: impl Into<String>) -> Self {
        RawStr(s.into())
    }
}

impl Sv for RawStr {
    fn encode(&self, w: &mut dyn Writer) -> Result<()> {
        w.write_all(self.0.as_bytes())
    }

    fn decode(&mut self, r: &mut dyn Reader, len: Len) -> Result<()> {
        let buf = std::mem::take(&mut self.0).into_bytes();
        let mut ba = RawBytes(buf);
        ba.decode(r, len)?;
        self.0 = String::from_utf8(ba.0).map_err(|_| Error::BadFormat)?;
        Ok(())
    }
}

/// The empty value: encodes to zero bytes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Null;

impl Sv for Null {
    fn encode(&self, _w: &mut dyn Writer) -> Result<()> {
        Ok(())
    }

    fn decode(&mut self, _r: &mut dyn Reader, len: Len) -> Result<()> {
        if !matches!(len, Len::Unknown | Len::Known(0)) {
            return Err(Error::BadFormat);
        }
        Ok(())
    }
}

/// A point in time, carried as a [`Bytes`] frame holding seconds since
/// the Unix epoch (`i64` LE) and subsecond nanos (`u32` LE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Time(pub SystemTime);

impl Default for Time {
    fn default() -> Self {
        Time(UNIX_EPOCH)
    }
}

impl Sv for Time {
    fn encode(&self, w: &mut dyn Writer) -> Result<()> {
        let (secs, nanos) = match self.0.duration_since(UNIX_EPOCH) {
            Ok(d) => (d.as_secs() as i64, d.subsec_nanos()),
            Err(e) => {
                let d = e.duration();
                if d.subsec_nanos() == 0 {
                    (-(d.as_secs() as i64), 0)
                } else {
                    (-(d.as_secs() as i64) - 1, 1_000_000_000 - d.subsec_nanos())
                }
            }
        };
        let mut payload = [0u8; 12];
        payload[..8].copy_from_slice(&secs.to_le_bytes());
        payload[8..].copy_from_slice(&nanos.to_le_bytes());
        VInt(12).encode(w)?;
        w.write_all(&payload)
    }

    fn decode(&mut self, r: &mut dyn Reader, len: Len) -> Result<()> {
        let mut frame = Bytes(Vec::new());
        frame.decode(r, len)?;
        if frame.0.len() != 12 {
            return Err(Error::BadFormat);
        }
        let mut secs = [0u8; 8];
        secs.copy_from_slice(&frame.0[..8]);
        let secs = i64::from_le_bytes(secs);
        let mut nanos = [0u8; 4];
        nanos.copy_from_slice(&frame.0[8..]);
        let nanos = u32::from_le_bytes(nanos);
        if nanos >= 1_000_000_000 {
            return Err(Error::BadFormat);
        }
        self.0 = if secs >= 0 {
            UNIX_EPOCH + Duration::new(secs as u64, nanos)
        } else {
            // secs is the floor of the timestamp; nanos counts up from it
            let whole = (-(secs + 1)) as u64 + 1;
            UNIX_EPOCH - Duration::from_secs(whole) + Duration::new(0, nanos)
        };
        Ok(())
    }
}

/// Reads a [`Str`] that frames itself.
pub fn read_str(r: &mut dyn Reader) -> Result<Str> {
    let mut s = Str::default();
    s.decode(r, Len::Unknown)?;
    Ok(s)
}

/// Writes `VInt(count)` then each string as [`Str`]. Read back with
/// [`read_str_slice`].
pub fn write_str_slice(w: &mut dyn Writer, sl: &[String]) -> Result<()> {
    VInt(sl.len() as u64).encode(w)?;
    for s in sl {
        VInt(s.len() as u64).encode(w)?;
        w.write_all(s.as_bytes())?;
    }
    Ok(())
}

/// Reads a string slice written by [`write_str_slice`], reusing the
/// destination's allocation where possible.
pub fn read_str_slice(r: &mut dyn Reader, sl: &mut Vec<String>) -> Result<()> {
    let mut count = VInt(0);
    count.decode(r, Len::Unknown)?;
    sl.clear();
    let mut s = Str::default();
    for _ in 0..count.0 {
        s.decode(r, Len::Unknown)?;
        sl.push(std::mem::take(&mut s.0));
    }
    Ok(())
}
