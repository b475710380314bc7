//! Append-only log segment: the unit of ingestion.
//!
//! File layout: `"TSILOG01" | version u32` followed by framed records
//! (`len u32 | crc32 u32 | bincode LogEntry`). The in-memory [`LogIndex`] is kept strictly
//! consistent with the appended records and is shared with readers as a copy-on-write
//! [`LogSnapshot`].

use crate::compactor::{
    CompactionConfig, CompactionProgress, Compactor, MeasurementPart, SeriesState,
};
use crate::encoding::{frame_into, read_framed, Framed};
use crate::error::IndexError;
use crate::series_file::SeriesIdentityResolver;
use crate::series_set::SeriesIdSet;
use crate::telemetry::{index_metrics, noop_event_listener, IndexEvent, IndexEventListener};
use crate::types::{SeriesId, SeriesKey, Tags};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

pub(crate) const LOG_MAGIC: &[u8; 8] = b"TSILOG01";
const LOG_VERSION: u32 = 1;
const LOG_HEADER_LEN: u64 = 12;

/// Conventional extension for log segment files.
pub const LOG_FILE_EXT: &str = "tsl";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogFileConfig {
    /// fsync after every appended batch.
    pub sync_on_append: bool,
    /// Open without write access: replay only, no header creation, no tail truncation.
    pub read_only: bool,
    #[serde(skip, default = "noop_event_listener")]
    pub event_listener: Arc<dyn IndexEventListener>,
}

impl Default for LogFileConfig {
    fn default() -> Self {
        Self {
            sync_on_append: false,
            read_only: false,
            event_listener: noop_event_listener(),
        }
    }
}

/// One logged mutation. `seq` is assigned by the segment and strictly increases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEntry {
    AddSeries {
        seq: u64,
        id: SeriesId,
        key: SeriesKey,
        /// Whether the resolver created the id for this entry.
        created: bool,
    },
    DeleteSeries {
        seq: u64,
        id: SeriesId,
        key: SeriesKey,
    },
}

impl LogEntry {
    pub fn seq(&self) -> u64 {
        match self {
            LogEntry::AddSeries { seq, .. } | LogEntry::DeleteSeries { seq, .. } => *seq,
        }
    }
}

/// Result of [`LogFile::add_series_list`]: ids in input order plus the batch as a set.
#[derive(Debug, Clone, Default)]
pub struct AddedSeries {
    pub ids: Vec<SeriesId>,
    pub set: SeriesIdSet,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogStats {
    pub entries: u64,
    pub live_series: u64,
    pub deleted_series: u64,
    pub measurements: u64,
    pub file_size: u64,
}

#[derive(Debug, Clone)]
struct SeriesLog {
    key: SeriesKey,
    seq: u64,
    live: bool,
}

#[derive(Debug, Clone, Default)]
struct MeasurementLog {
    /// Every series this segment has seen for the measurement, live or not.
    series: SeriesIdSet,
    live: SeriesIdSet,
    /// key -> value -> live series
    tags: BTreeMap<Vec<u8>, BTreeMap<Vec<u8>, SeriesIdSet>>,
}

/// In-memory index derived from a segment's entries.
#[derive(Debug, Clone, Default)]
pub struct LogIndex {
    measurements: BTreeMap<Vec<u8>, MeasurementLog>,
    series: BTreeMap<SeriesId, SeriesLog>,
    live: SeriesIdSet,
    deleted: SeriesIdSet,
    last_seq: u64,
    entries: u64,
}

impl LogIndex {
    fn apply(&mut self, entry: &LogEntry) {
        match entry {
            LogEntry::AddSeries { seq, id, key, .. } => {
                let m = self
                    .measurements
                    .entry(key.measurement().to_vec())
                    .or_default();
                m.series.insert(*id);
                m.live.insert(*id);
                for t in key.tags() {
                    m.tags
                        .entry(t.key.clone())
                        .or_default()
                        .entry(t.value.clone())
                        .or_default()
                        .insert(*id);
                }
                self.series.insert(
                    *id,
                    SeriesLog {
                        key: key.clone(),
                        seq: *seq,
                        live: true,
                    },
                );
                self.live.insert(*id);
                self.deleted.remove(*id);
            }
            LogEntry::DeleteSeries { seq, id, key } => {
                let m = self
                    .measurements
                    .entry(key.measurement().to_vec())
                    .or_default();
                m.series.insert(*id);
                m.live.remove(*id);
                for t in key.tags() {
                    if let Some(values) = m.tags.get_mut(t.key.as_slice()) {
                        let emptied = match values.get_mut(t.value.as_slice()) {
                            Some(set) => {
                                set.remove(*id);
                                set.is_empty()
                            }
                            None => false,
                        };
                        if emptied {
                            values.remove(t.value.as_slice());
                        }
                        if values.is_empty() {
                            m.tags.remove(t.key.as_slice());
                        }
                    }
                }
                self.series.insert(
                    *id,
                    SeriesLog {
                        key: key.clone(),
                        seq: *seq,
                        live: false,
                    },
                );
                self.live.remove(*id);
                self.deleted.insert(*id);
            }
        }
        self.last_seq = self.last_seq.max(entry.seq());
        self.entries += 1;
    }

    fn is_live(&self, id: SeriesId) -> bool {
        self.series.get(&id).map(|s| s.live).unwrap_or(false)
    }

    /// Number of entries applied (including replayed ones).
    pub fn entry_count(&self) -> u64 {
        self.entries
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Measurements with at least one live series, ascending.
    pub fn measurement_names(&self) -> Vec<Vec<u8>> {
        self.measurements
            .iter()
            .filter(|(_, m)| !m.live.is_empty())
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn measurement_exists(&self, name: &[u8]) -> bool {
        self.measurements
            .get(name)
            .map(|m| !m.live.is_empty())
            .unwrap_or(false)
    }

    pub fn tag_keys(&self, name: &[u8]) -> Vec<Vec<u8>> {
        self.measurements
            .get(name)
            .map(|m| m.tags.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn tag_values(&self, name: &[u8], key: &[u8]) -> Vec<Vec<u8>> {
        self.measurements
            .get(name)
            .and_then(|m| m.tags.get(key))
            .map(|values| values.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn series_ids_for_tag_value(&self, name: &[u8], key: &[u8], value: &[u8]) -> SeriesIdSet {
        self.measurements
            .get(name)
            .and_then(|m| m.tags.get(key))
            .and_then(|values| values.get(value))
            .cloned()
            .unwrap_or_default()
    }

    pub fn measurement_series_ids(&self, name: &[u8]) -> SeriesIdSet {
        self.measurements
            .get(name)
            .map(|m| m.live.clone())
            .unwrap_or_default()
    }

    /// Live series.
    pub fn series_ids(&self) -> SeriesIdSet {
        self.live.clone()
    }

    /// Series whose latest entry in this segment is a tombstone.
    pub fn deleted_series_ids(&self) -> SeriesIdSet {
        self.deleted.clone()
    }

    pub fn series_key(&self, id: SeriesId) -> Option<&SeriesKey> {
        self.series.get(&id).map(|s| &s.key)
    }

    /// Every measurement the segment has an entry for, including fully deleted ones.
    pub(crate) fn all_measurement_names(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.measurements.keys().map(Vec::as_slice)
    }

    pub(crate) fn measurement_part(&self, name: &[u8]) -> Option<MeasurementPart> {
        let m = self.measurements.get(name)?;
        let series = m
            .series
            .iter()
            .filter_map(|id| {
                self.series.get(&id).map(|s| SeriesState {
                    id,
                    seq: s.seq,
                    live: s.live,
                    key: s.key.encode(),
                })
            })
            .collect();
        let tags = m
            .tags
            .iter()
            .map(|(k, values)| {
                let values = values
                    .iter()
                    .map(|(v, set)| (v.clone(), set.to_vec()))
                    .collect();
                (k.clone(), values)
            })
            .collect();
        Some(MeasurementPart { series, tags })
    }
}

/// Point-in-time view of a segment's index. Cheap to clone; later appends do not affect it.
#[derive(Debug, Clone)]
pub struct LogSnapshot {
    index: Arc<LogIndex>,
}

impl Deref for LogSnapshot {
    type Target = LogIndex;

    fn deref(&self) -> &LogIndex {
        &self.index
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Unopened,
    Open,
    /// A failed batch could not be cut back off the file.
    Failed,
    Closed,
}

/// Byte sink under a writable segment.
trait SegmentSink: Write + Send + Sync + std::fmt::Debug {
    /// Cuts the sink back to `len` bytes and moves the write position to the new end.
    fn truncate(&mut self, len: u64) -> std::io::Result<()>;

    fn sync_data(&self) -> std::io::Result<()>;
}

impl SegmentSink for File {
    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len)?;
        self.seek(SeekFrom::End(0))?;
        Ok(())
    }

    fn sync_data(&self) -> std::io::Result<()> {
        File::sync_data(self)
    }
}

type SegmentWriter = BufWriter<Box<dyn SegmentSink>>;

#[derive(Debug)]
struct LogState {
    lifecycle: Lifecycle,
    writer: Option<SegmentWriter>,
    index: Arc<LogIndex>,
    file_len: u64,
}

/// Append-only log segment with derived in-memory indexes.
///
/// One logical writer appends; any number of readers may inspect it or take snapshots
/// concurrently.
#[derive(Debug)]
pub struct LogFile {
    path: PathBuf,
    resolver: Arc<dyn SeriesIdentityResolver>,
    config: LogFileConfig,
    state: RwLock<LogState>,
}

impl LogFile {
    pub fn new(
        resolver: Arc<dyn SeriesIdentityResolver>,
        path: impl Into<PathBuf>,
        config: LogFileConfig,
    ) -> Self {
        Self {
            path: path.into(),
            resolver,
            config,
            state: RwLock::new(LogState {
                lifecycle: Lifecycle::Unopened,
                writer: None,
                index: Arc::new(LogIndex::default()),
                file_len: 0,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the file, or replays an existing one and truncates a torn tail.
    pub fn open(&self) -> Result<(), IndexError> {
        let mut st = self.state.write()?;
        match st.lifecycle {
            Lifecycle::Open => {
                return Err(IndexError::Internal("log file is already open".to_string()))
            }
            Lifecycle::Failed => return Err(failed()),
            Lifecycle::Closed => return Err(IndexError::Closed("log file")),
            Lifecycle::Unopened => {}
        }

        if self.path.is_dir() {
            return Err(IndexError::format("Path is a directory", Some(&self.path)));
        }
        let read_only = self.config.read_only;
        let mut file = if read_only {
            File::open(&self.path)?
        } else {
            OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&self.path)?
        };

        let file_len = file.metadata()?.len();
        let (index, valid_len) = if file_len == 0 {
            if read_only {
                return Err(IndexError::format("Empty log file", Some(&self.path)));
            }
            file.write_all(LOG_MAGIC)?;
            file.write_all(&LOG_VERSION.to_le_bytes())?;
            file.sync_data()?;
            (LogIndex::default(), LOG_HEADER_LEN)
        } else {
            replay(&mut file, &self.path)?
        };

        let mut len = file_len.max(valid_len);
        if valid_len < file_len && !read_only {
            file.set_len(valid_len)?;
            file.sync_data()?;
            len = valid_len;
            self.config.event_listener.on_event(IndexEvent::LogTailTruncated {
                path: self.path.clone(),
                valid_len,
                file_len,
            });
        }

        let writer = if read_only {
            None
        } else {
            file.seek(SeekFrom::End(0))?;
            let sink: Box<dyn SegmentSink> = Box::new(file);
            Some(BufWriter::new(sink))
        };

        self.config.event_listener.on_event(IndexEvent::LogOpened {
            path: self.path.clone(),
            entries: index.entries,
        });

        st.writer = writer;
        st.index = Arc::new(index);
        st.file_len = len;
        st.lifecycle = Lifecycle::Open;
        Ok(())
    }

    /// Registers a batch of series. `names[i]` pairs with `tag_sets[i]`.
    ///
    /// The whole batch is validated before anything is appended, and it is written as one
    /// unit: on a write error no entry of the batch is logged or indexed. Series already
    /// live in this segment are not logged again but their ids are still returned.
    pub fn add_series_list<N: AsRef<[u8]>>(
        &self,
        names: &[N],
        tag_sets: &[Tags],
    ) -> Result<AddedSeries, IndexError> {
        if names.len() != tag_sets.len() {
            return Err(IndexError::InvalidSeries(format!(
                "{} measurement names but {} tag sets",
                names.len(),
                tag_sets.len()
            )));
        }
        let keys = names
            .iter()
            .zip(tag_sets)
            .map(|(n, t)| {
                let key = SeriesKey::new(n.as_ref(), t.clone());
                key.validate().map(|_| key)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut st = self.state.write()?;
        ensure_open(&st)?;

        let mut added = AddedSeries::default();
        let mut pending = Vec::new();
        let mut batch_ids = SeriesIdSet::new();
        let first_seq = st.index.last_seq + 1;
        for key in keys {
            let (id, created) = self
                .resolver
                .assign_or_get_id(key.measurement(), key.tags())
                .map_err(|e| match e {
                    IndexError::Lookup(_) => e,
                    other => IndexError::Lookup(other.to_string()),
                })?;
            added.ids.push(id);
            added.set.insert(id);
            if st.index.is_live(id) || !batch_ids.insert(id) {
                continue;
            }
            pending.push(LogEntry::AddSeries {
                seq: first_seq + pending.len() as u64,
                id,
                key,
                created,
            });
        }
        let logged = pending.len() as u64;
        let bytes = self.commit(&mut st, &pending)?;

        index_metrics::record_series_added(logged);
        index_metrics::record_log_bytes_written(bytes);
        if logged > 0 {
            self.config
                .event_listener
                .on_event(IndexEvent::SeriesAdded { count: logged });
        }
        Ok(added)
    }

    /// Appends a tombstone for `id`. Deleting a series already deleted here is a no-op.
    pub fn delete_series(&self, id: SeriesId) -> Result<(), IndexError> {
        let mut st = self.state.write()?;
        ensure_open(&st)?;

        let key = match st.index.series.get(&id) {
            Some(s) if !s.live => return Ok(()),
            Some(s) => s.key.clone(),
            None => self.resolver.resolve(id)?,
        };
        let entry = LogEntry::DeleteSeries {
            seq: st.index.last_seq + 1,
            id,
            key,
        };
        let bytes = self.commit(&mut st, &[entry])?;

        index_metrics::record_series_deleted();
        index_metrics::record_log_bytes_written(bytes);
        self.config
            .event_listener
            .on_event(IndexEvent::SeriesDeleted { id });
        Ok(())
    }

    /// Frames `entries`, writes and flushes them as one batch, then applies them to the
    /// index. A failed write is cut back off the file so the segment stays replayable.
    fn commit(&self, st: &mut LogState, entries: &[LogEntry]) -> Result<u64, IndexError> {
        if entries.is_empty() {
            return Ok(0);
        }
        let mut batch = Vec::new();
        for entry in entries {
            let payload =
                bincode::serialize(entry).map_err(|e| IndexError::Serialization(e.to_string()))?;
            frame_into(&mut batch, &payload)?;
        }
        let w = st
            .writer
            .as_mut()
            .ok_or_else(|| IndexError::Internal("log file is opened read-only".to_string()))?;
        if let Err(e) = write_batch(w, &batch, self.config.sync_on_append) {
            let rolled_back = rollback(st);
            self.config.event_listener.on_event(IndexEvent::LogAppendFailed {
                path: self.path.clone(),
                error: e.to_string(),
                rolled_back,
            });
            return Err(e.into());
        }
        st.file_len += batch.len() as u64;
        let index = Arc::make_mut(&mut st.index);
        for entry in entries {
            index.apply(entry);
        }
        Ok(batch.len() as u64)
    }

    /// Flushes buffered records and fsyncs the file.
    pub fn flush(&self) -> Result<(), IndexError> {
        let mut st = self.state.write()?;
        ensure_open(&st)?;
        if let Some(w) = st.writer.as_mut() {
            w.flush()?;
            w.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Compacts this segment alone into an index file written to `sink`. Returns the
    /// number of bytes written.
    pub fn compact_to<W: Write>(
        &self,
        sink: &mut W,
        page_size: u32,
        concurrency: usize,
        progress: Option<&mut dyn FnMut(&CompactionProgress)>,
    ) -> Result<u64, IndexError> {
        let snapshot = self.snapshot()?;
        let config = CompactionConfig {
            page_size,
            concurrency,
            event_listener: Arc::clone(&self.config.event_listener),
            ..CompactionConfig::default()
        };
        let mut compactor = Compactor::new(config)?;
        compactor.add_log_snapshot(snapshot);
        let summary = compactor.compact_to(sink, progress)?;
        Ok(summary.bytes_written)
    }

    /// Flushes and releases the file. Closing twice is a no-op.
    pub fn close(&self) -> Result<(), IndexError> {
        let mut st = self.state.write()?;
        if st.lifecycle == Lifecycle::Closed {
            return Ok(());
        }
        st.lifecycle = Lifecycle::Closed;
        if let Some(mut w) = st.writer.take() {
            w.flush()?;
            w.get_ref().sync_data()?;
        }
        st.index = Arc::new(LogIndex::default());
        Ok(())
    }

    pub fn snapshot(&self) -> Result<LogSnapshot, IndexError> {
        self.with_index(|ix| LogSnapshot {
            index: Arc::clone(ix),
        })
    }

    pub fn series_ids(&self) -> Result<SeriesIdSet, IndexError> {
        self.with_index(|ix| ix.series_ids())
    }

    pub fn deleted_series_ids(&self) -> Result<SeriesIdSet, IndexError> {
        self.with_index(|ix| ix.deleted_series_ids())
    }

    pub fn measurement_names(&self) -> Result<Vec<Vec<u8>>, IndexError> {
        self.with_index(|ix| ix.measurement_names())
    }

    pub fn measurement_exists(&self, name: &[u8]) -> Result<bool, IndexError> {
        self.with_index(|ix| ix.measurement_exists(name))
    }

    pub fn tag_keys(&self, name: &[u8]) -> Result<Vec<Vec<u8>>, IndexError> {
        self.with_index(|ix| ix.tag_keys(name))
    }

    pub fn tag_values(&self, name: &[u8], key: &[u8]) -> Result<Vec<Vec<u8>>, IndexError> {
        self.with_index(|ix| ix.tag_values(name, key))
    }

    pub fn series_ids_for_tag_value(
        &self,
        name: &[u8],
        key: &[u8],
        value: &[u8],
    ) -> Result<SeriesIdSet, IndexError> {
        self.with_index(|ix| ix.series_ids_for_tag_value(name, key, value))
    }

    pub fn stats(&self) -> Result<LogStats, IndexError> {
        let st = self.state.read()?;
        ensure_open(&st)?;
        let ix = &st.index;
        Ok(LogStats {
            entries: ix.entries,
            live_series: ix.live.len(),
            deleted_series: ix.deleted.len(),
            measurements: ix.measurements.values().filter(|m| !m.live.is_empty()).count() as u64,
            file_size: st.file_len,
        })
    }

    fn with_index<T>(&self, f: impl FnOnce(&Arc<LogIndex>) -> T) -> Result<T, IndexError> {
        let st = self.state.read()?;
        ensure_open(&st)?;
        Ok(f(&st.index))
    }
}

impl Drop for LogFile {
    fn drop(&mut self) {
        if let Ok(mut st) = self.state.write() {
            if let Some(w) = st.writer.as_mut() {
                let _ = w.flush();
            }
        }
    }
}

fn ensure_open(st: &LogState) -> Result<(), IndexError> {
    match st.lifecycle {
        Lifecycle::Open => Ok(()),
        Lifecycle::Unopened => Err(IndexError::NotOpen("log file")),
        Lifecycle::Failed => Err(failed()),
        Lifecycle::Closed => Err(IndexError::Closed("log file")),
    }
}

fn failed() -> IndexError {
    IndexError::Internal(
        "log file holds a partial write; open a new handle to replay it".to_string(),
    )
}

fn write_batch(w: &mut SegmentWriter, batch: &[u8], sync: bool) -> std::io::Result<()> {
    w.write_all(batch)?;
    w.flush()?;
    if sync {
        w.get_ref().sync_data()?;
    }
    Ok(())
}

/// Drops the buffered part of a failed batch and truncates the file to the last committed
/// length. Returns false, and fails the segment, when the file cannot be cut back.
fn rollback(st: &mut LogState) -> bool {
    let Some(w) = st.writer.take() else {
        return true;
    };
    let (mut sink, _unwritten) = w.into_parts();
    match sink.truncate(st.file_len) {
        Ok(()) => {
            st.writer = Some(BufWriter::new(sink));
            true
        }
        Err(_) => {
            st.lifecycle = Lifecycle::Failed;
            false
        }
    }
}

/// Rebuilds the index from `file`; returns it with the length of the valid prefix.
fn replay(file: &mut File, path: &Path) -> Result<(LogIndex, u64), IndexError> {
    file.seek(SeekFrom::Start(0))?;
    let mut reader = BufReader::new(&mut *file);
    let mut magic = [0u8; 8];
    if reader.read_exact(&mut magic).is_err() || &magic != LOG_MAGIC {
        return Err(IndexError::format("Bad log file magic", Some(path)));
    }
    let mut ver = [0u8; 4];
    reader
        .read_exact(&mut ver)
        .map_err(|_| IndexError::format("Truncated log file header", Some(path)))?;
    let version = u32::from_le_bytes(ver);
    if version != LOG_VERSION {
        return Err(IndexError::format(
            format!("Unsupported log file version {}", version),
            Some(path),
        ));
    }

    let mut index = LogIndex::default();
    let mut valid_len = LOG_HEADER_LEN;
    loop {
        let payload = match read_framed(&mut reader) {
            Ok(Framed::Record(p)) => p,
            Ok(Framed::End) | Ok(Framed::Torn) => break,
            Err(details) => {
                return Err(IndexError::format(
                    format!("Log record at offset {}: {}", valid_len, details),
                    Some(path),
                ))
            }
        };
        let entry: LogEntry = bincode::deserialize(&payload).map_err(|e| {
            IndexError::format(
                format!("Undecodable log record at offset {}: {}", valid_len, e),
                Some(path),
            )
        })?;
        if entry.seq() <= index.last_seq {
            return Err(IndexError::format(
                format!(
                    "Log sequence went backwards at offset {} ({} after {})",
                    valid_len,
                    entry.seq(),
                    index.last_seq
                ),
                Some(path),
            ));
        }
        index.apply(&entry);
        valid_len += 8 + payload.len() as u64;
    }
    Ok((index, valid_len))
}

/// True when the file at `path` starts with the log segment magic.
pub fn is_log_file(path: &Path) -> bool {
    let mut magic = [0u8; 8];
    File::open(path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .map(|_| &magic == LOG_MAGIC)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series_file::SeriesFile;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    fn open_log(dir: &TempDir) -> LogFile {
        let lf = LogFile::new(
            Arc::new(SeriesFile::in_memory()),
            dir.path().join("0001.tsl"),
            LogFileConfig::default(),
        );
        lf.open().unwrap();
        lf
    }

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        Tags::from_pairs(pairs).unwrap()
    }

    #[test]
    fn add_series_updates_indexes() {
        let dir = TempDir::new().unwrap();
        let lf = open_log(&dir);
        let added = lf
            .add_series_list(
                &["mem", "cpu", "cpu"],
                &[
                    tags(&[("region", "east")]),
                    tags(&[("region", "east")]),
                    tags(&[("region", "west")]),
                ],
            )
            .unwrap();
        assert_eq!(added.ids.len(), 3);
        assert_eq!(added.set.len(), 3);
        assert_eq!(lf.measurement_names().unwrap(), vec![b"cpu".to_vec(), b"mem".to_vec()]);
        assert_eq!(
            lf.tag_values(b"cpu", b"region").unwrap(),
            vec![b"east".to_vec(), b"west".to_vec()]
        );
        let east = lf.series_ids_for_tag_value(b"cpu", b"region", b"east").unwrap();
        assert_eq!(east.to_vec(), vec![added.ids[1]]);
        assert_eq!(lf.stats().unwrap().entries, 3);
    }

    #[test]
    fn live_series_are_not_logged_twice() {
        let dir = TempDir::new().unwrap();
        let lf = open_log(&dir);
        let t = tags(&[("host", "a")]);
        let a = lf.add_series_list(&["cpu"], &[t.clone()]).unwrap();
        let b = lf.add_series_list(&["cpu", "cpu"], &[t.clone(), t]).unwrap();
        assert_eq!(b.ids, vec![a.ids[0], a.ids[0]]);
        assert_eq!(lf.stats().unwrap().entries, 1);
    }

    #[test]
    fn invalid_batch_appends_nothing() {
        let dir = TempDir::new().unwrap();
        let lf = open_log(&dir);
        let r = lf.add_series_list(&["cpu", ""], &[tags(&[("a", "1")]), Tags::default()]);
        assert!(matches!(r, Err(IndexError::InvalidSeries(_))));
        let r = lf.add_series_list(&["cpu"], &[tags(&[("a", "")])]);
        assert!(matches!(r, Err(IndexError::InvalidSeries(_))));
        let r = lf.add_series_list(&["cpu"], &[]);
        assert!(matches!(r, Err(IndexError::InvalidSeries(_))));
        assert_eq!(lf.stats().unwrap().entries, 0);
    }

    #[test]
    fn delete_then_re_add() {
        let dir = TempDir::new().unwrap();
        let lf = open_log(&dir);
        let t = tags(&[("host", "a")]);
        let id = lf.add_series_list(&["cpu"], &[t.clone()]).unwrap().ids[0];
        lf.delete_series(id).unwrap();
        assert!(!lf.measurement_exists(b"cpu").unwrap());
        assert!(lf.tag_keys(b"cpu").unwrap().is_empty());
        assert!(lf.deleted_series_ids().unwrap().contains(id));

        let again = lf.add_series_list(&["cpu"], &[t]).unwrap().ids[0];
        assert_eq!(again, id);
        assert!(lf.measurement_exists(b"cpu").unwrap());
        assert!(lf.deleted_series_ids().unwrap().is_empty());
        assert_eq!(lf.stats().unwrap().entries, 3);
    }

    #[test]
    fn deleting_unknown_series_is_not_found() {
        let dir = TempDir::new().unwrap();
        let lf = open_log(&dir);
        assert!(matches!(lf.delete_series(77), Err(IndexError::NotFound(77))));
    }

    #[test]
    fn snapshot_is_isolated_from_later_appends() {
        let dir = TempDir::new().unwrap();
        let lf = open_log(&dir);
        lf.add_series_list(&["cpu"], &[tags(&[("host", "a")])]).unwrap();
        let snap = lf.snapshot().unwrap();
        lf.add_series_list(&["mem"], &[tags(&[("host", "a")])]).unwrap();
        assert!(!snap.measurement_exists(b"mem"));
        assert!(lf.measurement_exists(b"mem").unwrap());
    }

    #[test]
    fn lifecycle_errors() {
        let dir = TempDir::new().unwrap();
        let lf = LogFile::new(
            Arc::new(SeriesFile::in_memory()),
            dir.path().join("x.tsl"),
            LogFileConfig::default(),
        );
        assert!(matches!(lf.series_ids(), Err(IndexError::NotOpen(_))));
        lf.open().unwrap();
        assert!(matches!(lf.open(), Err(IndexError::Internal(_))));
        lf.close().unwrap();
        lf.close().unwrap();
        assert!(matches!(lf.series_ids(), Err(IndexError::Closed(_))));
        assert!(matches!(
            lf.add_series_list(&["cpu"], &[tags(&[("a", "b")])]),
            Err(IndexError::Closed(_))
        ));
        assert!(matches!(lf.open(), Err(IndexError::Closed(_))));
    }

    /// Passes writes through until `fail` is set, then lets a few bytes reach the file
    /// before erroring.
    #[derive(Debug)]
    struct FlakySink {
        inner: Box<dyn SegmentSink>,
        fail: Arc<AtomicBool>,
        can_truncate: bool,
    }

    impl Write for FlakySink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.fail.load(Ordering::SeqCst) {
                self.inner.write_all(&buf[..buf.len().min(5)])?;
                self.inner.flush()?;
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "no space left on device",
                ));
            }
            self.inner.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.inner.flush()
        }
    }

    impl SegmentSink for FlakySink {
        fn truncate(&mut self, len: u64) -> std::io::Result<()> {
            if !self.can_truncate {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "read-only fs"));
            }
            self.inner.truncate(len)
        }

        fn sync_data(&self) -> std::io::Result<()> {
            self.inner.sync_data()
        }
    }

    fn install_flaky_sink(lf: &LogFile, can_truncate: bool) -> Arc<AtomicBool> {
        let fail = Arc::new(AtomicBool::new(true));
        let mut st = lf.state.write().unwrap();
        let inner = st.writer.take().unwrap().into_inner().unwrap();
        let sink: Box<dyn SegmentSink> = Box::new(FlakySink {
            inner,
            fail: Arc::clone(&fail),
            can_truncate,
        });
        st.writer = Some(BufWriter::new(sink));
        fail
    }

    #[test]
    fn failed_batch_is_cut_back_and_the_segment_stays_replayable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0001.tsl");
        let sfile = Arc::new(SeriesFile::in_memory());
        let lf = LogFile::new(sfile.clone(), &path, LogFileConfig::default());
        lf.open().unwrap();
        lf.add_series_list(&["cpu"], &[tags(&[("host", "a")])]).unwrap();
        let before = lf.stats().unwrap();

        let fail = install_flaky_sink(&lf, true);
        let err = lf
            .add_series_list(&["cpu", "mem"], &[tags(&[("host", "b")]), tags(&[("host", "c")])])
            .unwrap_err();
        assert!(matches!(err, IndexError::Io(_)), "{:?}", err);
        assert_eq!(lf.stats().unwrap(), before);
        assert!(!lf.measurement_exists(b"mem").unwrap());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), before.file_size);

        fail.store(false, Ordering::SeqCst);
        lf.add_series_list(&["disk"], &[tags(&[("host", "d")])]).unwrap();
        lf.close().unwrap();

        let reopened = LogFile::new(sfile, &path, LogFileConfig::default());
        reopened.open().unwrap();
        assert_eq!(
            reopened.measurement_names().unwrap(),
            vec![b"cpu".to_vec(), b"disk".to_vec()]
        );
        let stats = reopened.stats().unwrap();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.file_size, std::fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn unrecoverable_write_failure_fences_the_segment() {
        let dir = TempDir::new().unwrap();
        let lf = open_log(&dir);
        let added = lf.add_series_list(&["cpu"], &[tags(&[("host", "a")])]).unwrap();

        install_flaky_sink(&lf, false);
        assert!(matches!(lf.delete_series(added.ids[0]), Err(IndexError::Io(_))));
        assert!(matches!(
            lf.add_series_list(&["cpu"], &[tags(&[("host", "b")])]),
            Err(IndexError::Internal(_))
        ));
        assert!(matches!(lf.series_ids(), Err(IndexError::Internal(_))));
        assert!(matches!(lf.open(), Err(IndexError::Internal(_))));
        lf.close().unwrap();
        assert!(matches!(lf.series_ids(), Err(IndexError::Closed(_))));
    }

    #[test]
    fn duplicate_keys_in_one_batch_are_logged_once() {
        let dir = TempDir::new().unwrap();
        let lf = open_log(&dir);
        let t = tags(&[("host", "a")]);
        let added = lf
            .add_series_list(&["cpu", "cpu", "mem"], &[t.clone(), t.clone(), t])
            .unwrap();
        assert_eq!(added.ids[0], added.ids[1]);
        assert_eq!(added.set.len(), 2);
        let stats = lf.stats().unwrap();
        assert_eq!(stats.entries, 2);
        assert_eq!(lf.snapshot().unwrap().last_seq(), 2);
    }

    #[test]
    fn entries_encode_with_bincode() {
        let entry = LogEntry::DeleteSeries {
            seq: 9,
            id: 4,
            key: SeriesKey::new("cpu", tags(&[("host", "a")])),
        };
        let bytes = bincode::serialize(&entry).unwrap();
        let back: LogEntry = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, entry);
        assert_eq!(back.seq(), 9);
    }
}
