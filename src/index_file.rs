//! Immutable index file: binary layout and the read path.
//!
//! ```text
//! Header (16 bytes):   "TSIIDX01" | version u32 | page_size u32
//! Measurement blobs:   per live measurement, in name order: postings lists, tag-value
//!                      directories, tag-key directory, measurement series list
//! Series block:        directory keyed by big-endian series id -> encoded SeriesKey
//! Bloom block:         num_hashes u32 | num_bits u64 | bit bytes (empty when disabled)
//! Measurement dir:     directory keyed by measurement name -> MeasurementDescriptor
//! Trailer (80 bytes):  "TSITRL01" | mdir off/len | series off/len | bloom off/len |
//!                      series count | measurement count (u64 each) | crc32 u32 | pad u32
//! ```
//!
//! Offsets inside a measurement blob are relative to the blob start.

use crate::bloom::{self, BloomFilter};
use crate::compactor::{MeasurementPart, SeriesState};
use crate::directory::{Directory, EntryCursor};
use crate::encoding::{
    crc32, decode_postings, u32_at, u64_at, write_u32, write_u64, PostingsCursor,
};
use crate::error::IndexError;
use crate::series_set::SeriesIdSet;
use crate::telemetry::{IndexEvent, IndexEventListener};
use crate::types::{SeriesId, SeriesKey};

use memmap2::Mmap;
use std::collections::HashSet;
use std::fs::File;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

pub(crate) const INDEX_MAGIC: &[u8; 8] = b"TSIIDX01";
pub(crate) const INDEX_VERSION: u32 = 1;
pub(crate) const HEADER_LEN: usize = 16;
pub(crate) const TRAILER_MAGIC: &[u8; 8] = b"TSITRL01";
pub(crate) const TRAILER_LEN: usize = 80;
pub(crate) const MIN_PAGE_SIZE: u32 = 64;

/// Conventional extension for index files.
pub const INDEX_FILE_EXT: &str = "tsi";

/// Fixed-width value stored in the measurement directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MeasurementDescriptor {
    pub(crate) blob_off: u64,
    pub(crate) blob_len: u64,
    pub(crate) blob_crc: u32,
    pub(crate) tag_key_dir_off: u64,
    pub(crate) tag_key_dir_len: u64,
    pub(crate) series_off: u64,
    pub(crate) series_len: u64,
    pub(crate) series_count: u64,
}

impl MeasurementDescriptor {
    pub(crate) const ENCODED_LEN: usize = 60;

    pub(crate) fn encode_into(&self, out: &mut Vec<u8>) {
        write_u64(out, self.blob_off);
        write_u64(out, self.blob_len);
        write_u32(out, self.blob_crc);
        write_u64(out, self.tag_key_dir_off);
        write_u64(out, self.tag_key_dir_len);
        write_u64(out, self.series_off);
        write_u64(out, self.series_len);
        write_u64(out, self.series_count);
    }

    pub(crate) fn decode(b: &[u8]) -> Result<Self, String> {
        if b.len() != Self::ENCODED_LEN {
            return Err(format!("Measurement descriptor has {} bytes", b.len()));
        }
        let field = |off| u64_at(b, off).ok_or_else(|| "Truncated descriptor".to_string());
        Ok(Self {
            blob_off: field(0)?,
            blob_len: field(8)?,
            blob_crc: u32_at(b, 16).ok_or("Truncated descriptor")?,
            tag_key_dir_off: field(20)?,
            tag_key_dir_len: field(28)?,
            series_off: field(36)?,
            series_len: field(44)?,
            series_count: field(52)?,
        })
    }

    fn blob_range(&self) -> Result<Range<usize>, String> {
        range(self.blob_off, self.blob_len)
    }

    fn tag_key_dir_range(&self) -> Result<Range<usize>, String> {
        sub_range(self.blob_len, self.tag_key_dir_off, self.tag_key_dir_len)
    }

    fn series_range(&self) -> Result<Range<usize>, String> {
        sub_range(self.blob_len, self.series_off, self.series_len)
    }
}

/// Blob-relative `(offset u64, len u64)` value used by tag-key and tag-value directories.
pub(crate) fn encode_span(out: &mut Vec<u8>, off: u64, len: u64) {
    write_u64(out, off);
    write_u64(out, len);
}

fn decode_span(b: &[u8], blob_len: u64) -> Result<Range<usize>, String> {
    if b.len() != 16 {
        return Err(format!("Span value has {} bytes", b.len()));
    }
    let off = u64_at(b, 0).ok_or("Truncated span")?;
    let len = u64_at(b, 8).ok_or("Truncated span")?;
    sub_range(blob_len, off, len)
}

fn range(off: u64, len: u64) -> Result<Range<usize>, String> {
    let start = usize::try_from(off).map_err(|_| "Offset out of range".to_string())?;
    let len = usize::try_from(len).map_err(|_| "Length out of range".to_string())?;
    let end = start.checked_add(len).ok_or("Section end overflows")?;
    Ok(start..end)
}

fn sub_range(outer_len: u64, off: u64, len: u64) -> Result<Range<usize>, String> {
    if off.checked_add(len).map(|e| e > outer_len).unwrap_or(true) {
        return Err(format!("Span {}+{} exceeds enclosing {} bytes", off, len, outer_len));
    }
    range(off, len)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Trailer {
    pub(crate) mdir_off: u64,
    pub(crate) mdir_len: u64,
    pub(crate) series_off: u64,
    pub(crate) series_len: u64,
    pub(crate) bloom_off: u64,
    pub(crate) bloom_len: u64,
    pub(crate) series_count: u64,
    pub(crate) measurement_count: u64,
}

impl Trailer {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(TRAILER_LEN);
        out.extend_from_slice(TRAILER_MAGIC);
        for v in [
            self.mdir_off,
            self.mdir_len,
            self.series_off,
            self.series_len,
            self.bloom_off,
            self.bloom_len,
            self.series_count,
            self.measurement_count,
        ] {
            write_u64(&mut out, v);
        }
        let crc = crc32(&out);
        write_u32(&mut out, crc);
        write_u32(&mut out, 0);
        out
    }

    fn decode(b: &[u8]) -> Result<Self, String> {
        if b.len() != TRAILER_LEN || &b[..8] != TRAILER_MAGIC {
            return Err("Missing index file trailer".to_string());
        }
        let crc = u32_at(b, 72).ok_or("Truncated trailer")?;
        if crc32(&b[..72]) != crc {
            return Err("Trailer CRC mismatch".to_string());
        }
        let field = |i: usize| u64_at(b, 8 + i * 8).ok_or_else(|| "Truncated trailer".to_string());
        Ok(Self {
            mdir_off: field(0)?,
            mdir_len: field(1)?,
            series_off: field(2)?,
            series_len: field(3)?,
            bloom_off: field(4)?,
            bloom_len: field(5)?,
            series_count: field(6)?,
            measurement_count: field(7)?,
        })
    }
}

#[derive(Debug)]
enum Backing {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Backing::Mapped(m) => &m[..],
            Backing::Owned(v) => v.as_slice(),
        }
    }
}

/// Parsed, validated view shared by a handle, its iterators and compactions reading it.
#[derive(Debug)]
pub(crate) struct IndexData {
    backing: Backing,
    path: Option<PathBuf>,
    page_size: u32,
    trailer: Trailer,
    mdir: Range<usize>,
    series: Range<usize>,
    bloom: Option<BloomFilter>,
    /// Blob offsets whose CRC has already matched.
    checked_blobs: RwLock<HashSet<usize>>,
}

impl IndexData {
    fn parse(backing: Backing, path: Option<PathBuf>) -> Result<Self, IndexError> {
        let fail = |details: String| IndexError::format(details, path.as_deref());
        let bytes = backing.bytes();
        let len = bytes.len();
        if len < HEADER_LEN + TRAILER_LEN {
            return Err(fail(format!(
                "File too small for an index file ({} bytes)",
                len
            )));
        }
        if &bytes[..8] != INDEX_MAGIC {
            return Err(fail("Bad index file magic".to_string()));
        }
        let version = u32_at(bytes, 8).unwrap_or(0);
        if version != INDEX_VERSION {
            return Err(fail(format!("Unsupported index file version {}", version)));
        }
        let page_size = u32_at(bytes, 12).unwrap_or(0);
        if page_size < MIN_PAGE_SIZE {
            return Err(fail(format!("Invalid page size {}", page_size)));
        }
        let trailer = Trailer::decode(&bytes[len - TRAILER_LEN..]).map_err(&fail)?;

        let body = HEADER_LEN..len - TRAILER_LEN;
        let section = |name: &str, off: u64, slen: u64| -> Result<Range<usize>, IndexError> {
            let r = range(off, slen).map_err(|e| fail(format!("{} section: {}", name, e)))?;
            if r.start < body.start || r.end > body.end {
                return Err(fail(format!("{} section out of bounds", name)));
            }
            Ok(r)
        };
        let mdir = section("Measurement directory", trailer.mdir_off, trailer.mdir_len)?;
        let series = section("Series block", trailer.series_off, trailer.series_len)?;
        let bloom_range = section("Bloom", trailer.bloom_off, trailer.bloom_len)?;

        let mdir_view = Directory::parse(&bytes[mdir.clone()])
            .and_then(|d| d.check_pages().map(|_| d))
            .map_err(|e| fail(format!("Measurement directory: {}", e)))?;
        if mdir_view.len() as u64 != trailer.measurement_count {
            return Err(fail("Measurement count mismatch".to_string()));
        }
        let series_view = Directory::parse(&bytes[series.clone()])
            .and_then(|d| d.check_pages().map(|_| d))
            .map_err(|e| fail(format!("Series block: {}", e)))?;
        if series_view.len() as u64 != trailer.series_count {
            return Err(fail("Series count mismatch".to_string()));
        }

        for entry in mdir_view.iter() {
            let (name, value) = entry.map_err(|e| fail(format!("Measurement directory: {}", e)))?;
            let d = MeasurementDescriptor::decode(value)
                .map_err(|e| fail(format!("Measurement {:?}: {}", lossy(name), e)))?;
            let blob = d
                .blob_range()
                .map_err(|e| fail(format!("Measurement {:?}: {}", lossy(name), e)))?;
            if blob.start < body.start || blob.end > body.end {
                return Err(fail(format!("Measurement {:?} blob out of bounds", lossy(name))));
            }
            d.tag_key_dir_range()
                .and(d.series_range())
                .map_err(|e| fail(format!("Measurement {:?}: {}", lossy(name), e)))?;
        }

        let bloom = if bloom_range.is_empty() {
            None
        } else {
            Some(
                BloomFilter::decode(&bytes[bloom_range])
                    .map_err(|e| fail(format!("Bloom block: {}", e)))?,
            )
        };

        Ok(Self {
            backing,
            path,
            page_size,
            trailer,
            mdir,
            series,
            bloom,
            checked_blobs: RwLock::new(HashSet::new()),
        })
    }

    fn bytes(&self) -> &[u8] {
        self.backing.bytes()
    }

    fn corrupt(&self, details: impl Into<String>) -> IndexError {
        IndexError::format(details, self.path.as_deref())
    }

    fn mdir(&self) -> Result<Directory<'_>, IndexError> {
        Directory::parse(&self.bytes()[self.mdir.clone()]).map_err(|e| self.corrupt(e))
    }

    fn series_dir(&self) -> Result<Directory<'_>, IndexError> {
        Directory::parse(&self.bytes()[self.series.clone()]).map_err(|e| self.corrupt(e))
    }

    fn may_contain(&self, item: &[u8]) -> bool {
        self.bloom.as_ref().map(|b| b.contains(item)).unwrap_or(true)
    }

    fn descriptor(&self, name: &[u8]) -> Result<Option<MeasurementDescriptor>, IndexError> {
        if !self.may_contain(&bloom::measurement_key(name)) {
            return Ok(None);
        }
        match self.mdir()?.get(name).map_err(|e| self.corrupt(e))? {
            Some(v) => MeasurementDescriptor::decode(v)
                .map(Some)
                .map_err(|e| self.corrupt(e)),
            None => Ok(None),
        }
    }

    /// Absolute start and bytes of a measurement blob. The blob CRC is checked on first
    /// access, so nothing is read out of a damaged blob.
    fn blob(&self, d: &MeasurementDescriptor) -> Result<(usize, &[u8]), IndexError> {
        let r = d.blob_range().map_err(|e| self.corrupt(e))?;
        let start = r.start;
        let blob = self
            .bytes()
            .get(r)
            .ok_or_else(|| self.corrupt("Measurement blob out of bounds"))?;
        if !self.checked_blobs.read()?.contains(&start) {
            if crc32(blob) != d.blob_crc {
                return Err(self.corrupt(format!(
                    "Measurement blob at offset {} fails its CRC",
                    start
                )));
            }
            self.checked_blobs.write()?.insert(start);
        }
        Ok((start, blob))
    }

    /// Absolute start and view of a measurement's tag-key directory.
    fn tag_key_dir(&self, d: &MeasurementDescriptor) -> Result<(usize, Directory<'_>), IndexError> {
        let (base, blob) = self.blob(d)?;
        let r = d.tag_key_dir_range().map_err(|e| self.corrupt(e))?;
        let start = base + r.start;
        let dir = Directory::parse(&blob[r])
            .map_err(|e| self.corrupt(format!("Tag key directory: {}", e)))?;
        Ok((start, dir))
    }

    fn tag_value_dir(
        &self,
        d: &MeasurementDescriptor,
        key: &[u8],
    ) -> Result<Option<(usize, Directory<'_>)>, IndexError> {
        let (base, blob) = self.blob(d)?;
        let (_, tk) = self.tag_key_dir(d)?;
        let span = match tk.get(key).map_err(|e| self.corrupt(e))? {
            Some(v) => decode_span(v, d.blob_len).map_err(|e| self.corrupt(e))?,
            None => return Ok(None),
        };
        let start = base + span.start;
        let dir = Directory::parse(&blob[span])
            .map_err(|e| self.corrupt(format!("Tag value directory: {}", e)))?;
        Ok(Some((start, dir)))
    }

    fn postings_range(
        &self,
        d: &MeasurementDescriptor,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<Range<usize>>, IndexError> {
        let Some((_, tv)) = self.tag_value_dir(d, key)? else {
            return Ok(None);
        };
        match tv.get(value).map_err(|e| self.corrupt(e))? {
            Some(v) => {
                let span = decode_span(v, d.blob_len).map_err(|e| self.corrupt(e))?;
                let base = d.blob_off as usize;
                Ok(Some(base + span.start..base + span.end))
            }
            None => Ok(None),
        }
    }

    fn series_key_bytes(&self, id: SeriesId) -> Result<Option<&[u8]>, IndexError> {
        self.series_dir()?
            .get(&id.to_be_bytes())
            .map_err(|e| self.corrupt(e))
    }

    fn decode_tags(
        &self,
        d: &MeasurementDescriptor,
    ) -> Result<Vec<(Vec<u8>, Vec<(Vec<u8>, Vec<SeriesId>)>)>, IndexError> {
        let (_, blob) = self.blob(d)?;
        let (_, tk) = self.tag_key_dir(d)?;
        let mut tags = Vec::with_capacity(tk.len() as usize);
        for entry in tk.iter() {
            let (key, span) = entry.map_err(|e| self.corrupt(e))?;
            let span = decode_span(span, d.blob_len).map_err(|e| self.corrupt(e))?;
            let tv = Directory::parse(&blob[span]).map_err(|e| self.corrupt(e))?;
            let mut values = Vec::with_capacity(tv.len() as usize);
            for entry in tv.iter() {
                let (value, span) = entry.map_err(|e| self.corrupt(e))?;
                let span = decode_span(span, d.blob_len).map_err(|e| self.corrupt(e))?;
                let ids = decode_postings(&blob[span]).map_err(|e| self.corrupt(e))?;
                values.push((value.to_vec(), ids));
            }
            tags.push((key.to_vec(), values));
        }
        Ok(tags)
    }

    /// Materializes one measurement for re-compaction. Every series here is live.
    pub(crate) fn measurement_part(
        &self,
        name: &[u8],
    ) -> Result<Option<MeasurementPart>, IndexError> {
        let Some(d) = self.descriptor(name)? else {
            return Ok(None);
        };
        let (_, blob) = self.blob(&d)?;
        let r = d.series_range().map_err(|e| self.corrupt(e))?;
        let ids = decode_postings(&blob[r]).map_err(|e| self.corrupt(e))?;
        let mut series = Vec::with_capacity(ids.len());
        for id in ids {
            let key = self
                .series_key_bytes(id)?
                .ok_or_else(|| self.corrupt(format!("Series {} missing from series block", id)))?;
            series.push(SeriesState {
                id,
                seq: 0,
                live: true,
                key: key.to_vec(),
            });
        }
        let tags = self.decode_tags(&d)?;
        Ok(Some(MeasurementPart { series, tags }))
    }

    pub(crate) fn trailer_measurement_count(&self) -> u64 {
        self.trailer.measurement_count
    }

    pub(crate) fn measurement_cursor(self: &Arc<Self>) -> Result<KeyIter, IndexError> {
        let dir = self.mdir()?;
        Ok(KeyIter::new(Arc::clone(self), self.mdir.start, &dir))
    }

    fn verify(&self) -> Result<(), IndexError> {
        let mdir = self.mdir()?;
        mdir.check_entries().map_err(|e| self.corrupt(e))?;
        let mut total = 0u64;
        for entry in mdir.iter() {
            let (name, value) = entry.map_err(|e| self.corrupt(e))?;
            let d = MeasurementDescriptor::decode(value).map_err(|e| self.corrupt(e))?;
            let (_, blob) = self.blob(&d)?;
            let (_, tk) = self.tag_key_dir(&d)?;
            tk.check_entries().map_err(|e| self.corrupt(e))?;
            for entry in tk.iter() {
                let (_, span) = entry.map_err(|e| self.corrupt(e))?;
                let span = decode_span(span, d.blob_len).map_err(|e| self.corrupt(e))?;
                Directory::parse(&blob[span])
                    .and_then(|tv| tv.check_entries())
                    .map_err(|e| self.corrupt(e))?;
            }
            self.decode_tags(&d)?;
            let r = d.series_range().map_err(|e| self.corrupt(e))?;
            let ids = decode_postings(&blob[r]).map_err(|e| self.corrupt(e))?;
            if ids.len() as u64 != d.series_count {
                return Err(self.corrupt(format!(
                    "Measurement {:?} series count mismatch",
                    lossy(name)
                )));
            }
            total += d.series_count;
        }
        let series = self.series_dir()?;
        series.check_entries().map_err(|e| self.corrupt(e))?;
        for entry in series.iter() {
            let (id, key) = entry.map_err(|e| self.corrupt(e))?;
            if id.len() != 8 {
                return Err(self.corrupt("Series block key is not a u64"));
            }
            SeriesKey::decode(key).map_err(|e| self.corrupt(e))?;
        }
        if total != self.trailer.series_count {
            return Err(self.corrupt("Series total does not match trailer"));
        }
        Ok(())
    }
}

fn lossy(b: &[u8]) -> String {
    String::from_utf8_lossy(b).into_owned()
}

/// Lazy iterator over the keys of one directory (measurement names, tag keys or tag
/// values). A clone resumes from the same position, so cloning before iterating gives a
/// restartable sequence.
#[derive(Debug, Clone)]
pub struct KeyIter {
    data: Option<Arc<IndexData>>,
    entries: Range<usize>,
    cursor: EntryCursor,
}

impl KeyIter {
    fn new(data: Arc<IndexData>, start: usize, dir: &Directory<'_>) -> Self {
        Self {
            entries: start..start + dir.entries().len(),
            cursor: dir.cursor(),
            data: Some(data),
        }
    }

    fn empty() -> Self {
        Self {
            data: None,
            entries: 0..0,
            cursor: EntryCursor::exhausted(),
        }
    }

    /// Like `next`, but surfaces a malformed entry instead of ending the iteration.
    pub fn next_checked(&mut self) -> Option<Result<Vec<u8>, IndexError>> {
        let data = self.data.as_ref()?;
        let entries = data.bytes().get(self.entries.clone())?;
        match self.cursor.next_entry(entries)? {
            Ok((k, _)) => Some(Ok(k.to_vec())),
            Err(e) => Some(Err(data.corrupt(e))),
        }
    }
}

/// Yields keys until the first malformed entry. The bytes come from a CRC-checked blob
/// or a page-checked directory; `next_checked` reports what stopped the iteration.
impl Iterator for KeyIter {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        self.next_checked().and_then(Result::ok)
    }
}

/// Lazy ascending iterator over a postings list.
#[derive(Debug, Clone)]
pub struct SeriesIdIter {
    data: Option<Arc<IndexData>>,
    postings: Range<usize>,
    cursor: PostingsCursor,
}

impl SeriesIdIter {
    fn new(data: Arc<IndexData>, postings: Range<usize>) -> Result<Self, IndexError> {
        let cursor = data
            .bytes()
            .get(postings.clone())
            .ok_or_else(|| "Postings out of bounds".to_string())
            .and_then(PostingsCursor::new)
            .map_err(|e| data.corrupt(e))?;
        Ok(Self {
            data: Some(data),
            postings,
            cursor,
        })
    }

    fn empty() -> Self {
        Self {
            data: None,
            postings: 0..0,
            cursor: PostingsCursor::default(),
        }
    }

    /// Ids not yet yielded.
    pub fn remaining(&self) -> u64 {
        self.cursor.len()
    }

    pub fn next_checked(&mut self) -> Option<Result<SeriesId, IndexError>> {
        let data = self.data.as_ref()?;
        let bytes = data.bytes().get(self.postings.clone())?;
        match self.cursor.next_id(bytes)? {
            Ok(id) => Some(Ok(id)),
            Err(e) => Some(Err(data.corrupt(e))),
        }
    }
}

/// Yields ids until the first malformed delta. Postings are only reachable through a
/// CRC-checked blob; `next_checked` reports what stopped the iteration.
impl Iterator for SeriesIdIter {
    type Item = SeriesId;

    fn next(&mut self) -> Option<SeriesId> {
        self.next_checked().and_then(Result::ok)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.cursor.len() as usize))
    }
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Unopened,
    Open(Arc<IndexData>),
    Closed,
}

/// Read handle on an index file.
///
/// `Unopened -> Open -> Closed`. Lookups never materialize the file; iterators hold
/// their own reference to the bytes and stay valid after [`IndexFile::close`].
#[derive(Debug, Default)]
pub struct IndexFile {
    state: State,
    event_listener: Option<Arc<dyn IndexEventListener>>,
}

impl IndexFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_listener(listener: Arc<dyn IndexEventListener>) -> Self {
        Self {
            state: State::Unopened,
            event_listener: Some(listener),
        }
    }

    /// Opens and memory-maps `path`.
    pub fn open<P: AsRef<Path>>(&mut self, path: P) -> Result<(), IndexError> {
        self.ensure_unopened()?;
        let path = path.as_ref();
        let file = File::open(path)?;
        let meta = file.metadata()?;
        if meta.is_dir() {
            return Err(IndexError::format("Path is a directory", Some(path)));
        }
        if (meta.len() as usize) < HEADER_LEN + TRAILER_LEN {
            return Err(IndexError::format(
                format!("File too small for an index file ({} bytes)", meta.len()),
                Some(path),
            ));
        }
        // The file is immutable once published; compaction never rewrites it in place.
        let mmap = unsafe { Mmap::map(&file)? };
        let data = IndexData::parse(Backing::Mapped(mmap), Some(path.to_path_buf()))?;
        self.install(data);
        Ok(())
    }

    /// Opens an index file from an owned buffer.
    pub fn unmarshal_binary(&mut self, bytes: impl Into<Vec<u8>>) -> Result<(), IndexError> {
        self.ensure_unopened()?;
        let data = IndexData::parse(Backing::Owned(bytes.into()), None)?;
        self.install(data);
        Ok(())
    }

    /// Convenience for `new` + `open`.
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self, IndexError> {
        let mut f = Self::new();
        f.open(path)?;
        Ok(f)
    }

    fn install(&mut self, data: IndexData) {
        if let Some(l) = &self.event_listener {
            l.on_event(IndexEvent::IndexFileOpened {
                path: data.path.clone(),
                bytes: data.bytes().len() as u64,
            });
        }
        self.state = State::Open(Arc::new(data));
    }

    fn ensure_unopened(&self) -> Result<(), IndexError> {
        match self.state {
            State::Unopened => Ok(()),
            State::Open(_) => Err(IndexError::Internal("index file is already open".to_string())),
            State::Closed => Err(IndexError::Closed("index file")),
        }
    }

    pub(crate) fn data(&self) -> Result<&Arc<IndexData>, IndexError> {
        match &self.state {
            State::Open(d) => Ok(d),
            State::Unopened => Err(IndexError::NotOpen("index file")),
            State::Closed => Err(IndexError::Closed("index file")),
        }
    }

    /// Releases this handle's reference to the bytes. Idempotent.
    pub fn close(&mut self) {
        self.state = State::Closed;
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, State::Open(_))
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.state {
            State::Open(d) => d.path.as_deref(),
            _ => None,
        }
    }

    pub fn size(&self) -> Result<u64, IndexError> {
        Ok(self.data()?.bytes().len() as u64)
    }

    pub fn page_size(&self) -> Result<u32, IndexError> {
        Ok(self.data()?.page_size)
    }

    pub fn series_count(&self) -> Result<u64, IndexError> {
        Ok(self.data()?.trailer.series_count)
    }

    pub fn measurement_count(&self) -> Result<u64, IndexError> {
        Ok(self.data()?.trailer.measurement_count)
    }

    pub fn measurement_exists(&self, name: &[u8]) -> Result<bool, IndexError> {
        Ok(self.data()?.descriptor(name)?.is_some())
    }

    pub fn measurement_names(&self) -> Result<KeyIter, IndexError> {
        self.data()?.measurement_cursor()
    }

    pub fn tag_keys(&self, name: &[u8]) -> Result<KeyIter, IndexError> {
        let data = self.data()?;
        let Some(d) = data.descriptor(name)? else {
            return Ok(KeyIter::empty());
        };
        let (start, dir) = data.tag_key_dir(&d)?;
        Ok(KeyIter::new(Arc::clone(data), start, &dir))
    }

    pub fn tag_values(&self, name: &[u8], key: &[u8]) -> Result<KeyIter, IndexError> {
        let data = self.data()?;
        let Some(d) = data.descriptor(name)? else {
            return Ok(KeyIter::empty());
        };
        match data.tag_value_dir(&d, key)? {
            Some((start, dir)) => Ok(KeyIter::new(Arc::clone(data), start, &dir)),
            None => Ok(KeyIter::empty()),
        }
    }

    pub fn series_ids_for_tag_value(
        &self,
        name: &[u8],
        key: &[u8],
        value: &[u8],
    ) -> Result<SeriesIdIter, IndexError> {
        let data = self.data()?;
        if !data.may_contain(&bloom::tag_value_key(name, key, value)) {
            return Ok(SeriesIdIter::empty());
        }
        let Some(d) = data.descriptor(name)? else {
            return Ok(SeriesIdIter::empty());
        };
        match data.postings_range(&d, key, value)? {
            Some(r) => SeriesIdIter::new(Arc::clone(data), r),
            None => Ok(SeriesIdIter::empty()),
        }
    }

    /// Live series of one measurement, ascending.
    pub fn measurement_series_ids(&self, name: &[u8]) -> Result<SeriesIdIter, IndexError> {
        let data = self.data()?;
        let Some(d) = data.descriptor(name)? else {
            return Ok(SeriesIdIter::empty());
        };
        let (base, _) = data.blob(&d)?;
        let r = d.series_range().map_err(|e| data.corrupt(e))?;
        SeriesIdIter::new(Arc::clone(data), base + r.start..base + r.end)
    }

    /// Every series in the file.
    pub fn series_ids(&self) -> Result<SeriesIdSet, IndexError> {
        let data = self.data()?;
        let mut set = SeriesIdSet::new();
        for entry in data.series_dir()?.iter() {
            let (k, _) = entry.map_err(|e| data.corrupt(e))?;
            let id: [u8; 8] = k
                .try_into()
                .map_err(|_| data.corrupt("Series block key is not a u64"))?;
            set.insert(u64::from_be_bytes(id));
        }
        Ok(set)
    }

    pub fn series_key(&self, id: SeriesId) -> Result<Option<SeriesKey>, IndexError> {
        let data = self.data()?;
        match data.series_key_bytes(id)? {
            Some(b) => SeriesKey::decode(b).map(Some).map_err(|e| data.corrupt(e)),
            None => Ok(None),
        }
    }

    /// Full structural check: every directory, postings list, series key and blob CRC.
    pub fn verify(&self) -> Result<(), IndexError> {
        self.data()?.verify()
    }
}
