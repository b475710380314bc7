//! Series identity resolution: the narrow interface the index consumes, plus a reference
//! series file that assigns monotonically increasing ids and can journal them to disk.

use crate::encoding::{read_framed, write_framed, Framed};
use crate::error::IndexError;
use crate::types::{SeriesId, SeriesKey, Tags};

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

const SERIES_FILE_MAGIC: &[u8; 8] = b"TSISER01";
const SERIES_FILE_VERSION: u32 = 1;
const HEADER_LEN: u64 = 12;

/// Maps series identity to stable ids. Implementations must be safe to share across threads.
pub trait SeriesIdentityResolver: std::fmt::Debug + Send + Sync {
    /// Returns the id for `(measurement, tags)`, creating it if absent. The flag is true
    /// when the id was created by this call.
    fn assign_or_get_id(&self, measurement: &[u8], tags: &Tags)
        -> Result<(SeriesId, bool), IndexError>;

    fn exists(&self, id: SeriesId) -> bool;

    /// Reverse lookup; fails with `NotFound` for unknown ids.
    fn resolve(&self, id: SeriesId) -> Result<SeriesKey, IndexError>;
}

#[derive(Debug, Default)]
struct SeriesFileState {
    by_key: HashMap<SeriesKey, SeriesId>,
    by_id: HashMap<SeriesId, SeriesKey>,
    next_id: SeriesId,
}

/// Reference series file.
///
/// In-memory by default; [`SeriesFile::open`] adds an append-only journal so ids survive
/// restarts. Ids start at 1 and are never reused.
#[derive(Debug)]
pub struct SeriesFile {
    path: Option<PathBuf>,
    state: RwLock<SeriesFileState>,
    journal: Mutex<Option<BufWriter<File>>>,
}

impl SeriesFile {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(SeriesFileState {
                next_id: 1,
                ..Default::default()
            }),
            journal: Mutex::new(None),
        }
    }

    /// Opens (or creates) a journal-backed series file, replaying existing assignments.
    /// A torn final record is dropped; a corrupt complete record is a `Format` error.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, IndexError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let mut state = SeriesFileState {
            next_id: 1,
            ..Default::default()
        };

        let len = file.metadata()?.len();
        let valid_len = if len == 0 {
            file.write_all(SERIES_FILE_MAGIC)?;
            file.write_all(&SERIES_FILE_VERSION.to_le_bytes())?;
            file.sync_data()?;
            HEADER_LEN
        } else {
            replay(&mut file, &path, &mut state)?
        };
        if valid_len < file.metadata()?.len() {
            file.set_len(valid_len)?;
        }
        file.seek(SeekFrom::End(0))?;

        Ok(Self {
            path: Some(path),
            state: RwLock::new(state),
            journal: Mutex::new(Some(BufWriter::new(file))),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of assigned series.
    pub fn len(&self) -> usize {
        self.state.read().map(|s| s.by_id.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up an existing id without creating one.
    pub fn series_id(&self, measurement: &[u8], tags: &Tags) -> Option<SeriesId> {
        let key = SeriesKey::new(measurement, tags.clone());
        self.state.read().ok()?.by_key.get(&key).copied()
    }

    /// Flushes and fsyncs the journal.
    pub fn sync(&self) -> Result<(), IndexError> {
        let mut guard = self.journal.lock()?;
        if let Some(w) = guard.as_mut() {
            w.flush()?;
            w.get_ref().sync_data()?;
        }
        Ok(())
    }
}

impl SeriesIdentityResolver for SeriesFile {
    fn assign_or_get_id(
        &self,
        measurement: &[u8],
        tags: &Tags,
    ) -> Result<(SeriesId, bool), IndexError> {
        let key = SeriesKey::new(measurement, tags.clone());
        key.validate()?;
        if let Some(&id) = self.state.read()?.by_key.get(&key) {
            return Ok((id, false));
        }

        let mut st = self.state.write()?;
        if let Some(&id) = st.by_key.get(&key) {
            return Ok((id, false));
        }
        let id = st.next_id;
        let next = id
            .checked_add(1)
            .ok_or_else(|| IndexError::Lookup("series id space exhausted".to_string()))?;

        // Journal before publishing the id so a crash cannot hand out an unrecorded id.
        {
            let mut journal = self.journal.lock()?;
            if let Some(w) = journal.as_mut() {
                let mut payload = Vec::with_capacity(16);
                payload.extend_from_slice(&id.to_le_bytes());
                key.encode_into(&mut payload);
                write_framed(w, &payload)?;
                w.flush()?;
            }
        }

        st.next_id = next;
        st.by_id.insert(id, key.clone());
        st.by_key.insert(key, id);
        Ok((id, true))
    }

    fn exists(&self, id: SeriesId) -> bool {
        self.state
            .read()
            .map(|s| s.by_id.contains_key(&id))
            .unwrap_or(false)
    }

    fn resolve(&self, id: SeriesId) -> Result<SeriesKey, IndexError> {
        self.state
            .read()?
            .by_id
            .get(&id)
            .cloned()
            .ok_or(IndexError::NotFound(id))
    }
}

fn replay(file: &mut File, path: &Path, state: &mut SeriesFileState) -> Result<u64, IndexError> {
    file.seek(SeekFrom::Start(0))?;
    let mut reader = BufReader::new(&mut *file);
    let mut magic = [0u8; 8];
    let mut ver = [0u8; 4];
    if reader.read_exact(&mut magic).is_err() || &magic != SERIES_FILE_MAGIC {
        return Err(IndexError::format("Bad series file magic", Some(path)));
    }
    reader
        .read_exact(&mut ver)
        .map_err(|_| IndexError::format("Truncated series file header", Some(path)))?;
    let version = u32::from_le_bytes(ver);
    if version != SERIES_FILE_VERSION {
        return Err(IndexError::format(
            format!("Unsupported series file version {}", version),
            Some(path),
        ));
    }

    let mut valid_len = HEADER_LEN;
    loop {
        let payload = match read_framed(&mut reader) {
            Ok(Framed::Record(p)) => p,
            Ok(Framed::End) | Ok(Framed::Torn) => break,
            Err(details) => {
                return Err(IndexError::format(
                    format!("Series file record at offset {}: {}", valid_len, details),
                    Some(path),
                ))
            }
        };
        if payload.len() < 8 {
            return Err(IndexError::format("Short series file record", Some(path)));
        }
        let mut idb = [0u8; 8];
        idb.copy_from_slice(&payload[..8]);
        let id = u64::from_le_bytes(idb);
        let key = SeriesKey::decode(&payload[8..])
            .map_err(|d| IndexError::format(format!("Series file key: {}", d), Some(path)))?;
        valid_len += 8 + payload.len() as u64;
        state.next_id = state.next_id.max(id.saturating_add(1));
        state.by_id.insert(id, key.clone());
        state.by_key.insert(key, id);
    }
    Ok(valid_len)
}
