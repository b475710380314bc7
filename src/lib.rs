//! On-disk time-series inverted index.
//!
//! Series identity (measurement name + tag set) is mapped to stable series ids. New series
//! land in an append-only [`LogFile`]; a [`Compactor`] merges log segments and older
//! [`IndexFile`]s into a new immutable, memory-mappable index file that answers
//! measurement, tag-key and tag-value lookups without being materialized.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tsindex::{IndexFile, LogFile, LogFileConfig, SeriesFile, Tags};
//!
//! # fn main() -> Result<(), tsindex::IndexError> {
//! let log = LogFile::new(Arc::new(SeriesFile::in_memory()), "0001.tsl", LogFileConfig::default());
//! log.open()?;
//! log.add_series_list(&["cpu"], &[Tags::from_pairs(&[("region", "east")])?])?;
//!
//! let mut buf = Vec::new();
//! log.compact_to(&mut buf, 4096, 4, None)?;
//!
//! let mut index = IndexFile::new();
//! index.unmarshal_binary(buf)?;
//! assert!(index.measurement_exists(b"cpu")?);
//! # Ok(())
//! # }
//! ```

mod bloom;
pub mod compactor;
mod directory;
pub mod encoding;
pub mod error;
pub mod index_file;
pub mod log_file;
pub mod series_file;
pub mod series_set;
pub mod telemetry;
pub mod types;

/// Merges log segments and index files into a new index file.
pub use crate::compactor::{
    CancellationToken, CompactionConfig, CompactionProgress, CompactionSummary, Compactor,
};
/// Error type for index operations.
pub use crate::error::IndexError;
/// Read handle on an immutable index file.
pub use crate::index_file::{IndexFile, KeyIter, SeriesIdIter, INDEX_FILE_EXT};
/// Append-only log segment.
pub use crate::log_file::{
    is_log_file, AddedSeries, LogEntry, LogFile, LogFileConfig, LogSnapshot, LogStats,
    LOG_FILE_EXT,
};
/// Series id assignment.
pub use crate::series_file::{SeriesFile, SeriesIdentityResolver};
/// Mergeable set of series ids.
pub use crate::series_set::SeriesIdSet;
/// Structured event hook for observability.
pub use crate::telemetry::{IndexEvent, IndexEventListener};
/// Series identity types.
pub use crate::types::{SeriesId, SeriesKey, Tag, TagSet, Tags};

/// Default directory page size of compacted index files.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;
