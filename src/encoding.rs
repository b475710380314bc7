//! Binary primitives shared by the log file and the index file: fixed-width little-endian
//! integers, LEB128 varints, length-prefixed byte strings, CRC32 and delta-coded postings.

use crate::error::IndexError;
use crate::types::SeriesId;

use crc32fast::Hasher as Crc32;
use std::io::{Read, Write};

pub fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}
pub fn write_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Reads a little-endian u32 at `off`, or `None` when out of bounds.
#[inline]
pub(crate) fn u32_at(bytes: &[u8], off: usize) -> Option<u32> {
    let b = bytes.get(off..off.checked_add(4)?)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Reads a little-endian u64 at `off`, or `None` when out of bounds.
#[inline]
pub(crate) fn u64_at(bytes: &[u8], off: usize) -> Option<u64> {
    let b = bytes.get(off..off.checked_add(8)?)?;
    let mut a = [0u8; 8];
    a.copy_from_slice(b);
    Some(u64::from_le_bytes(a))
}

#[inline]
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut h = Crc32::new();
    h.update(bytes);
    h.finalize()
}

pub(crate) fn write_var_u64(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

pub(crate) fn write_var_u32(buf: &mut Vec<u8>, v: u32) {
    write_var_u64(buf, v as u64);
}

pub(crate) fn read_var_u64<R: Read>(r: &mut R) -> Result<u64, String> {
    let mut out: u64 = 0;
    let mut shift: u32 = 0;
    for _ in 0..10 {
        let mut b = [0u8; 1];
        r.read_exact(&mut b)
            .map_err(|e| format!("Truncated varint: {}", e))?;
        let byte = b[0];
        out |= ((byte & 0x7F) as u64) << shift;
        if (byte & 0x80) == 0 {
            return Ok(out);
        }
        shift = shift.saturating_add(7);
    }
    Err("Varint too long".to_string())
}

pub(crate) fn read_var_u32<R: Read>(r: &mut R) -> Result<u32, String> {
    let v = read_var_u64(r)?;
    if v > u32::MAX as u64 {
        return Err("Varint does not fit in u32".to_string());
    }
    Ok(v as u32)
}

/// Decodes a varint from the front of `bytes`, returning (value, bytes consumed).
#[inline]
pub(crate) fn var_u64_at(bytes: &[u8]) -> Result<(u64, usize), String> {
    let mut out: u64 = 0;
    for (i, &byte) in bytes.iter().take(10).enumerate() {
        out |= ((byte & 0x7F) as u64) << (7 * i as u32);
        if (byte & 0x80) == 0 {
            return Ok((out, i + 1));
        }
    }
    if bytes.len() < 10 {
        Err("Truncated varint".to_string())
    } else {
        Err("Varint too long".to_string())
    }
}

pub(crate) fn write_var_bytes(buf: &mut Vec<u8>, b: &[u8]) {
    write_var_u64(buf, b.len() as u64);
    buf.extend_from_slice(b);
}

pub(crate) fn read_var_bytes<R: Read>(r: &mut R) -> Result<Vec<u8>, String> {
    let n = read_var_u64(r)?;
    if n > u32::MAX as u64 {
        return Err("Byte string too long".to_string());
    }
    let mut b = Vec::new();
    (&mut *r)
        .take(n)
        .read_to_end(&mut b)
        .map_err(|e| format!("Truncated byte string: {}", e))?;
    if b.len() as u64 != n {
        return Err("Truncated byte string".to_string());
    }
    Ok(b)
}

/// Splits a length-prefixed byte string off the front of `bytes`: (value, rest).
#[inline]
pub(crate) fn split_var_bytes(bytes: &[u8]) -> Result<(&[u8], &[u8]), String> {
    let (n, used) = var_u64_at(bytes)?;
    let rest = &bytes[used..];
    let n = usize::try_from(n).map_err(|_| "Byte string too long".to_string())?;
    if n > rest.len() {
        return Err("Truncated byte string".to_string());
    }
    Ok(rest.split_at(n))
}

/// Encodes a strictly ascending id list as `count` followed by delta varints.
pub(crate) fn encode_postings(out: &mut Vec<u8>, ids: &[SeriesId]) -> Result<(), IndexError> {
    write_var_u64(out, ids.len() as u64);
    let mut prev = 0u64;
    for (i, &id) in ids.iter().enumerate() {
        if i > 0 && id <= prev {
            return Err(IndexError::Encoding(format!(
                "Postings must be strictly ascending ({} after {})",
                id, prev
            )));
        }
        write_var_u64(out, id - prev);
        prev = id;
    }
    Ok(())
}

/// Lazy decoder over a delta-coded postings list.
///
/// Holds only offsets; every call takes the list's bytes, so the cursor can live next to
/// an owner of those bytes. Clones continue from the same position.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PostingsCursor {
    pos: usize,
    remaining: u64,
    prev: u64,
}

impl PostingsCursor {
    pub(crate) fn new(bytes: &[u8]) -> Result<Self, String> {
        let (count, used) = var_u64_at(bytes)?;
        // Every id takes at least one byte.
        if count > (bytes.len() - used) as u64 {
            return Err("Postings count exceeds payload".to_string());
        }
        Ok(Self {
            pos: used,
            remaining: count,
            prev: 0,
        })
    }

    pub(crate) fn len(&self) -> u64 {
        self.remaining
    }

    pub(crate) fn next_id(&mut self, bytes: &[u8]) -> Option<Result<SeriesId, String>> {
        if self.remaining == 0 {
            return None;
        }
        let decoded = bytes
            .get(self.pos..)
            .ok_or_else(|| "Postings cursor out of range".to_string())
            .and_then(var_u64_at);
        let (delta, used) = match decoded {
            Ok(v) => v,
            Err(e) => {
                self.remaining = 0;
                return Some(Err(e));
            }
        };
        if delta == 0 && self.prev != 0 {
            self.remaining = 0;
            return Some(Err("Postings are not strictly ascending".to_string()));
        }
        self.pos += used;
        self.remaining -= 1;
        self.prev = match self.prev.checked_add(delta) {
            Some(v) => v,
            None => {
                self.remaining = 0;
                return Some(Err("Postings id overflow".to_string()));
            }
        };
        Some(Ok(self.prev))
    }
}

/// Decodes a whole postings list.
pub(crate) fn decode_postings(bytes: &[u8]) -> Result<Vec<SeriesId>, String> {
    let mut cur = PostingsCursor::new(bytes)?;
    let mut out = Vec::with_capacity(cur.len().min(1 << 20) as usize);
    while let Some(id) = cur.next_id(bytes) {
        out.push(id?);
    }
    Ok(out)
}

/// Outcome of reading one framed record (`len u32 | crc32 u32 | payload`).
#[derive(Debug)]
pub(crate) enum Framed {
    Record(Vec<u8>),
    /// Clean end of input at a record boundary.
    End,
    /// The input ends inside a record (a torn append).
    Torn,
}

/// Upper bound on a single framed record; anything larger is treated as corruption.
pub(crate) const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

/// Appends `len | crc | payload` to `buf` and returns the frame length.
pub(crate) fn frame_into(buf: &mut Vec<u8>, payload: &[u8]) -> Result<u64, IndexError> {
    if payload.len() > MAX_RECORD_LEN {
        return Err(IndexError::Internal(format!(
            "Record too large ({} bytes)",
            payload.len()
        )));
    }
    buf.reserve(8 + payload.len());
    write_u32(buf, payload.len() as u32);
    write_u32(buf, crc32(payload));
    buf.extend_from_slice(payload);
    Ok(8 + payload.len() as u64)
}

/// Writes one frame with a single `write_all`.
pub(crate) fn write_framed<W: Write>(w: &mut W, payload: &[u8]) -> Result<u64, IndexError> {
    let mut frame = Vec::new();
    let n = frame_into(&mut frame, payload)?;
    w.write_all(&frame)?;
    Ok(n)
}

/// Reads one framed record. A CRC mismatch on a complete record is reported as `Err`;
/// callers decide whether it is fatal.
pub(crate) fn read_framed<R: Read>(r: &mut R) -> Result<Framed, String> {
    let mut hdr = [0u8; 8];
    let mut filled = 0;
    while filled < hdr.len() {
        match r.read(&mut hdr[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.to_string()),
        }
    }
    if filled == 0 {
        return Ok(Framed::End);
    }
    if filled < hdr.len() {
        return Ok(Framed::Torn);
    }
    let len = u32::from_le_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]) as usize;
    let expected_crc = u32::from_le_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]);
    if len > MAX_RECORD_LEN {
        return Err(format!("Record length {} exceeds limit", len));
    }
    let mut payload = Vec::with_capacity(len);
    (&mut *r)
        .take(len as u64)
        .read_to_end(&mut payload)
        .map_err(|e| e.to_string())?;
    if payload.len() < len {
        return Ok(Framed::Torn);
    }
    if crc32(&payload) != expected_crc {
        return Err("Record CRC mismatch".to_string());
    }
    Ok(Framed::Record(payload))
}
