//! Builds an immutable index file from log segments and existing index files.
//!
//! Inputs are merged one measurement at a time with a k-way heap merge over their sorted
//! measurement names. Measurements are encoded in parallel batches; only the coordinating
//! thread writes to the sink, so blob offsets are assigned in name order.

use crate::bloom::{self, BloomFilter};
use crate::directory::DirectoryWriter;
use crate::encoding::{crc32, encode_postings, write_u32};
use crate::error::IndexError;
use crate::index_file::{
    encode_span, IndexData, IndexFile, MeasurementDescriptor, Trailer, INDEX_MAGIC, INDEX_VERSION,
    MIN_PAGE_SIZE,
};
use crate::log_file::{LogFile, LogSnapshot};
use crate::series_set::SeriesIdSet;
use crate::telemetry::{index_metrics, noop_event_listener, IndexEvent, IndexEventListener};
use crate::types::SeriesId;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BinaryHeap};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Directory page granularity in bytes; also recorded in the file header.
    pub page_size: u32,
    /// Worker threads used to encode measurements.
    pub concurrency: usize,
    /// Target false positive rate of the existence filter. `0.0` disables the filter.
    pub bloom_false_positive_rate: f64,
    #[serde(skip, default = "noop_event_listener")]
    pub event_listener: Arc<dyn IndexEventListener>,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            page_size: crate::DEFAULT_PAGE_SIZE,
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            bloom_false_positive_rate: 0.01,
            event_listener: noop_event_listener(),
        }
    }
}

impl CompactionConfig {
    pub fn validate(&self) -> Result<(), IndexError> {
        if self.page_size < MIN_PAGE_SIZE {
            return Err(IndexError::Config(format!(
                "page_size must be at least {} (got {})",
                MIN_PAGE_SIZE, self.page_size
            )));
        }
        if self.concurrency == 0 {
            return Err(IndexError::Config("concurrency must be at least 1".to_string()));
        }
        let p = self.bloom_false_positive_rate;
        if !(0.0..1.0).contains(&p) {
            return Err(IndexError::Config(format!(
                "bloom_false_positive_rate must be in [0, 1) (got {})",
                p
            )));
        }
        Ok(())
    }
}

/// Cooperative cancellation flag shared between a compaction and its owner.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Reported after every encoded batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionProgress {
    pub measurements_done: u64,
    /// Known only when there is a single input.
    pub measurements_total: Option<u64>,
    pub bytes_written: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionSummary {
    pub measurements: u64,
    pub series: u64,
    pub bytes_written: u64,
}

/// One series as reported by an input: its last state there and the entry that set it.
#[derive(Debug, Clone)]
pub(crate) struct SeriesState {
    pub(crate) id: SeriesId,
    pub(crate) seq: u64,
    pub(crate) live: bool,
    /// Encoded `SeriesKey`.
    pub(crate) key: Vec<u8>,
}

/// Everything one input knows about one measurement.
#[derive(Debug, Clone, Default)]
pub(crate) struct MeasurementPart {
    pub(crate) series: Vec<SeriesState>,
    /// key -> value -> series, both levels ascending
    pub(crate) tags: Vec<(Vec<u8>, Vec<(Vec<u8>, Vec<SeriesId>)>)>,
}

#[derive(Debug, Clone)]
enum Input {
    Log(LogSnapshot),
    Index(Arc<IndexData>),
}

impl Input {
    fn measurement_count(&self) -> u64 {
        match self {
            Input::Log(s) => s.all_measurement_names().count() as u64,
            Input::Index(d) => d.trailer_measurement_count(),
        }
    }

    fn names(&self) -> Result<NameStream<'_>, IndexError> {
        let stream: NameStream<'_> = match self {
            Input::Log(s) => Box::new(
                s.all_measurement_names()
                    .map(|n| Ok::<_, IndexError>(n.to_vec())),
            ),
            Input::Index(d) => {
                let mut it = d.measurement_cursor()?;
                Box::new(std::iter::from_fn(move || it.next_checked()))
            }
        };
        Ok(stream)
    }

    fn part(&self, name: &[u8]) -> Result<Option<MeasurementPart>, IndexError> {
        match self {
            Input::Log(s) => Ok(s.measurement_part(name)),
            Input::Index(d) => d.measurement_part(name),
        }
    }
}

type NameStream<'a> = Box<dyn Iterator<Item = Result<Vec<u8>, IndexError>> + 'a>;

/// k-way merge over the inputs' ascending measurement names.
struct NameMerge<'a> {
    streams: Vec<NameStream<'a>>,
    last: Vec<Option<Vec<u8>>>,
    heap: BinaryHeap<Reverse<(Vec<u8>, usize)>>,
}

impl<'a> NameMerge<'a> {
    fn new(inputs: &'a [Input]) -> Result<Self, IndexError> {
        let streams = inputs.iter().map(Input::names).collect::<Result<Vec<_>, _>>()?;
        let mut merge = Self {
            last: vec![None; streams.len()],
            streams,
            heap: BinaryHeap::new(),
        };
        for i in 0..merge.streams.len() {
            merge.advance(i)?;
        }
        Ok(merge)
    }

    fn advance(&mut self, i: usize) -> Result<(), IndexError> {
        let name = match self.streams[i].next() {
            None => return Ok(()),
            Some(r) => r?,
        };
        if let Some(prev) = &self.last[i] {
            if name <= *prev {
                return Err(IndexError::Encoding(format!(
                    "Input {} yields measurement {:?} after {:?}",
                    i,
                    String::from_utf8_lossy(&name),
                    String::from_utf8_lossy(prev)
                )));
            }
        }
        self.last[i] = Some(name.clone());
        self.heap.push(Reverse((name, i)));
        Ok(())
    }

    /// Next measurement name and the ascending positions of the inputs holding it.
    fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<usize>)>, IndexError> {
        let Some(Reverse((name, first))) = self.heap.pop() else {
            return Ok(None);
        };
        let mut sources = vec![first];
        self.advance(first)?;
        while let Some(Reverse((next, _))) = self.heap.peek() {
            if *next != name {
                break;
            }
            if let Some(Reverse((_, j))) = self.heap.pop() {
                sources.push(j);
                self.advance(j)?;
            }
        }
        sources.sort_unstable();
        Ok(Some((name, sources)))
    }
}

/// A measurement encoded by a worker; offsets are relative to `blob`.
#[derive(Debug)]
struct EncodedMeasurement {
    name: Vec<u8>,
    blob: Vec<u8>,
    tag_key_dir: (u64, u64),
    series_list: (u64, u64),
    series: Vec<(SeriesId, Vec<u8>)>,
    bloom_keys: Vec<Vec<u8>>,
}

struct CountingSink<'w, W: Write> {
    inner: &'w mut W,
    written: u64,
}

impl<W: Write> CountingSink<'_, W> {
    fn emit(&mut self, bytes: &[u8]) -> Result<(), IndexError> {
        self.inner.write_all(bytes)?;
        self.written += bytes.len() as u64;
        Ok(())
    }
}

/// Merges its inputs into a single index file. Add inputs oldest first: for a series
/// present in several inputs, the state from the latest input wins.
///
/// Measurement blobs stream to the sink one batch at a time, but three sections are
/// written after the last blob and stay in memory until the trailer: the series block
/// (every live id with its encoded key), the bloom keys (one per measurement and one per
/// tag value), and the measurement directory (one fixed-size descriptor per measurement).
/// Peak memory therefore grows with the live series count of the output, plus one batch
/// of `concurrency * 4` encoded measurements.
#[derive(Debug)]
pub struct Compactor {
    config: CompactionConfig,
    inputs: Vec<Input>,
    cancel: CancellationToken,
}

impl Compactor {
    pub fn new(config: CompactionConfig) -> Result<Self, IndexError> {
        config.validate()?;
        Ok(Self {
            config,
            inputs: Vec::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Adds a point-in-time snapshot of an open log segment.
    pub fn add_log_file(&mut self, log: &LogFile) -> Result<(), IndexError> {
        let snapshot = log.snapshot()?;
        self.add_log_snapshot(snapshot);
        Ok(())
    }

    pub fn add_log_snapshot(&mut self, snapshot: LogSnapshot) {
        self.inputs.push(Input::Log(snapshot));
    }

    /// Adds an open index file. The compactor keeps the file's bytes alive even if the
    /// handle is closed afterwards.
    pub fn add_index_file(&mut self, file: &IndexFile) -> Result<(), IndexError> {
        let data = Arc::clone(file.data()?);
        self.inputs.push(Input::Index(data));
        Ok(())
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    /// Token that cancels this compactor's runs.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn set_cancellation_token(&mut self, token: CancellationToken) {
        self.cancel = token;
    }

    /// Writes the merged index file to `sink`.
    pub fn compact_to<W: Write>(
        &self,
        sink: &mut W,
        progress: Option<&mut dyn FnMut(&CompactionProgress)>,
    ) -> Result<CompactionSummary, IndexError> {
        let listener = &self.config.event_listener;
        listener.on_event(IndexEvent::CompactionStarted {
            inputs: self.inputs.len(),
        });
        let started = Instant::now();
        let result = self.run(sink, progress);
        match &result {
            Ok(s) => {
                index_metrics::record_compaction(started.elapsed(), s.bytes_written);
                listener.on_event(IndexEvent::CompactionFinished {
                    measurements: s.measurements,
                    series: s.series,
                    bytes: s.bytes_written,
                });
            }
            Err(IndexError::Cancelled) => listener.on_event(IndexEvent::CompactionCancelled),
            Err(e) => listener.on_event(IndexEvent::CompactionFailed {
                error: e.to_string(),
            }),
        }
        result
    }

    /// Compacts into a temp file next to `path` and renames it into place on success.
    /// On any failure, including cancellation, nothing is left at `path`.
    pub fn compact_to_path<P: AsRef<Path>>(
        &self,
        path: P,
        progress: Option<&mut dyn FnMut(&CompactionProgress)>,
    ) -> Result<CompactionSummary, IndexError> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::Builder::new()
            .prefix(".tsi-compact-")
            .suffix(".tmp")
            .tempfile_in(dir)?;
        let summary = {
            let mut w = BufWriter::new(tmp.as_file_mut());
            let summary = self.compact_to(&mut w, progress)?;
            w.flush()?;
            summary
        };
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| IndexError::Io(e.error))?;
        sync_parent_dir(dir)?;
        Ok(summary)
    }

    fn run<W: Write>(
        &self,
        sink: &mut W,
        mut progress: Option<&mut dyn FnMut(&CompactionProgress)>,
    ) -> Result<CompactionSummary, IndexError> {
        let page_size = self.config.page_size;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.concurrency)
            .build()
            .map_err(|e| IndexError::Config(e.to_string()))?;
        let batch_size = self.config.concurrency.saturating_mul(4).max(1);
        let measurements_total = match self.inputs.as_slice() {
            [only] => Some(only.measurement_count()),
            _ => None,
        };

        let mut out = CountingSink {
            inner: sink,
            written: 0,
        };
        let mut header = Vec::with_capacity(16);
        header.extend_from_slice(INDEX_MAGIC);
        write_u32(&mut header, INDEX_VERSION);
        write_u32(&mut header, page_size);
        out.emit(&header)?;

        let mut merge = NameMerge::new(&self.inputs)?;
        let mut mdir = DirectoryWriter::new(page_size);
        let mut series_block: BTreeMap<SeriesId, Vec<u8>> = BTreeMap::new();
        let mut bloom_keys: Vec<Vec<u8>> = Vec::new();
        let mut done = 0u64;

        loop {
            if self.cancel.is_cancelled() {
                return Err(IndexError::Cancelled);
            }

            let mut batch = Vec::with_capacity(batch_size);
            while batch.len() < batch_size {
                let Some((name, sources)) = merge.next()? else {
                    break;
                };
                let mut parts = Vec::with_capacity(sources.len());
                for pos in sources {
                    if let Some(part) = self.inputs[pos].part(&name)? {
                        parts.push((pos, part));
                    }
                }
                batch.push((name, parts));
            }
            if batch.is_empty() {
                break;
            }
            let n = batch.len() as u64;

            let encoded: Vec<Result<Option<EncodedMeasurement>, IndexError>> = pool.install(|| {
                batch
                    .into_par_iter()
                    .map(|(name, parts)| encode_measurement(name, parts, page_size))
                    .collect()
            });

            for m in encoded {
                let Some(m) = m? else { continue };
                let blob_off = out.written;
                out.emit(&m.blob)?;
                let desc = MeasurementDescriptor {
                    blob_off,
                    blob_len: m.blob.len() as u64,
                    blob_crc: crc32(&m.blob),
                    tag_key_dir_off: m.tag_key_dir.0,
                    tag_key_dir_len: m.tag_key_dir.1,
                    series_off: m.series_list.0,
                    series_len: m.series_list.1,
                    series_count: m.series.len() as u64,
                };
                let mut value = Vec::with_capacity(MeasurementDescriptor::ENCODED_LEN);
                desc.encode_into(&mut value);
                mdir.push(&m.name, &value)?;

                for (id, key) in m.series {
                    match series_block.entry(id) {
                        Entry::Vacant(v) => {
                            v.insert(key);
                        }
                        Entry::Occupied(o) if *o.get() != key => {
                            return Err(IndexError::Encoding(format!(
                                "Series {} maps to more than one key",
                                id
                            )));
                        }
                        Entry::Occupied(_) => {}
                    }
                }
                bloom_keys.extend(m.bloom_keys);
            }

            done += n;
            if let Some(cb) = progress.as_deref_mut() {
                cb(&CompactionProgress {
                    measurements_done: done,
                    measurements_total,
                    bytes_written: out.written,
                });
            }
        }

        let mut trailer = Trailer {
            series_count: series_block.len() as u64,
            measurement_count: mdir.len() as u64,
            ..Trailer::default()
        };

        trailer.series_off = out.written;
        let mut series_dir = DirectoryWriter::new(page_size);
        for (id, key) in &series_block {
            series_dir.push(&id.to_be_bytes(), key)?;
        }
        let series_bytes = series_dir.finish()?;
        out.emit(&series_bytes)?;
        trailer.series_len = series_bytes.len() as u64;

        trailer.bloom_off = out.written;
        if self.config.bloom_false_positive_rate > 0.0 {
            let mut filter =
                BloomFilter::new(bloom_keys.len() as u64, self.config.bloom_false_positive_rate);
            for k in &bloom_keys {
                filter.insert(k);
            }
            let mut bytes = Vec::new();
            filter.encode_into(&mut bytes);
            out.emit(&bytes)?;
            trailer.bloom_len = bytes.len() as u64;
        }

        trailer.mdir_off = out.written;
        let mdir_bytes = mdir.finish()?;
        out.emit(&mdir_bytes)?;
        trailer.mdir_len = mdir_bytes.len() as u64;

        out.emit(&trailer.encode())?;
        out.inner.flush()?;

        Ok(CompactionSummary {
            measurements: trailer.measurement_count,
            series: trailer.series_count,
            bytes_written: out.written,
        })
    }
}

/// Resolves liveness and encodes one measurement. `None` when no series survives.
fn encode_measurement(
    name: Vec<u8>,
    parts: Vec<(usize, MeasurementPart)>,
    page_size: u32,
) -> Result<Option<EncodedMeasurement>, IndexError> {
    // Greatest (input position, seq) decides each series' state.
    let mut latest: BTreeMap<SeriesId, ((usize, u64), bool, Vec<u8>)> = BTreeMap::new();
    for (pos, part) in &parts {
        for s in &part.series {
            let stamp = (*pos, s.seq);
            match latest.entry(s.id) {
                Entry::Vacant(v) => {
                    v.insert((stamp, s.live, s.key.clone()));
                }
                Entry::Occupied(mut o) => {
                    if stamp > o.get().0 {
                        o.insert((stamp, s.live, s.key.clone()));
                    }
                }
            }
        }
    }
    let live: SeriesIdSet = latest
        .iter()
        .filter(|(_, (_, is_live, _))| *is_live)
        .map(|(id, _)| *id)
        .collect();
    if live.is_empty() {
        return Ok(None);
    }

    let mut tags: BTreeMap<Vec<u8>, BTreeMap<Vec<u8>, SeriesIdSet>> = BTreeMap::new();
    for (_, part) in parts {
        for (key, values) in part.tags {
            let merged = tags.entry(key).or_default();
            for (value, ids) in values {
                merged.entry(value).or_default().extend(ids);
            }
        }
    }
    for values in tags.values_mut() {
        for set in values.values_mut() {
            set.intersect_with(&live);
        }
        values.retain(|_, set| !set.is_empty());
    }
    tags.retain(|_, values| !values.is_empty());

    let mut blob = Vec::new();
    let mut bloom_keys = vec![bloom::measurement_key(&name)];

    // Postings lists.
    let mut postings_spans = Vec::with_capacity(tags.len());
    for (key, values) in &tags {
        let mut spans = Vec::with_capacity(values.len());
        for (value, set) in values {
            let off = blob.len() as u64;
            encode_postings(&mut blob, &set.to_vec())?;
            spans.push((value, off, blob.len() as u64 - off));
            bloom_keys.push(bloom::tag_value_key(&name, key, value));
        }
        postings_spans.push((key, spans));
    }

    // Tag-value directories, then the tag-key directory pointing at them.
    let mut tag_key_dir = DirectoryWriter::new(page_size);
    for (key, spans) in postings_spans {
        let mut dir = DirectoryWriter::new(page_size);
        for (value, off, len) in spans {
            let mut span = Vec::with_capacity(16);
            encode_span(&mut span, off, len);
            dir.push(value, &span)?;
        }
        let off = blob.len() as u64;
        dir.finish_into(&mut blob)?;
        let mut span = Vec::with_capacity(16);
        encode_span(&mut span, off, blob.len() as u64 - off);
        tag_key_dir.push(key, &span)?;
    }
    let tk_off = blob.len() as u64;
    tag_key_dir.finish_into(&mut blob)?;
    let tk_len = blob.len() as u64 - tk_off;

    let ids = live.to_vec();
    let series_off = blob.len() as u64;
    encode_postings(&mut blob, &ids)?;
    let series_len = blob.len() as u64 - series_off;

    let series = ids
        .into_iter()
        .filter_map(|id| latest.remove(&id).map(|(_, _, key)| (id, key)))
        .collect();

    Ok(Some(EncodedMeasurement {
        name,
        blob,
        tag_key_dir: (tk_off, tk_len),
        series_list: (series_off, series_len),
        series,
        bloom_keys,
    }))
}

fn sync_parent_dir(dir: &Path) -> Result<(), IndexError> {
    let dir = File::open(dir)?;
    dir.sync_all()?;
    Ok(())
}
