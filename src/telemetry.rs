use std::path::PathBuf;
use std::sync::Arc;

/// Receives index lifecycle events.
///
/// Nothing in the crate prints. Hosts that want logs install a listener that forwards
/// events to their own logger.
pub trait IndexEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: IndexEvent);
}

/// Structured events emitted by the log file, the compactor and the index reader.
#[derive(Debug, Clone)]
pub enum IndexEvent {
    LogOpened { path: PathBuf, entries: u64 },
    LogTailTruncated { path: PathBuf, valid_len: u64, file_len: u64 },
    SeriesAdded { count: u64 },
    SeriesDeleted { id: u64 },
    /// A batch failed to reach the file. When `rolled_back` is false the segment refuses
    /// further work.
    LogAppendFailed { path: PathBuf, error: String, rolled_back: bool },

    CompactionStarted { inputs: usize },
    CompactionFinished { measurements: u64, series: u64, bytes: u64 },
    CompactionFailed { error: String },
    CompactionCancelled,

    IndexFileOpened { path: Option<PathBuf>, bytes: u64 },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl IndexEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: IndexEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn IndexEventListener> {
    Arc::new(NoopEventListener)
}

/// Metrics emitted through the `metrics` facade.
///
/// Library-safe: every call is effectively a no-op until the host installs a recorder.
pub mod index_metrics {
    use ::metrics::{describe_counter, describe_histogram, Unit};
    use std::sync::Once;
    use std::time::Duration;

    // --- metric names ---
    //
    // Counters are exposed as `<name>_total` by the Prometheus exporter.

    pub const SERIES_ADDED: &str = "tsi_log_series_added";
    pub const SERIES_DELETED: &str = "tsi_log_series_deleted";
    pub const LOG_BYTES_WRITTEN: &str = "tsi_log_bytes_written";
    pub const COMPACTION_BYTES_WRITTEN: &str = "tsi_compaction_bytes_written";
    pub const COMPACTION_DURATION_SECONDS: &str = "tsi_compaction_duration_seconds";

    static DESCRIBE: Once = Once::new();

    #[inline]
    pub fn record_series_added(count: u64) {
        describe_all();
        if count > 0 {
            ::metrics::counter!(SERIES_ADDED).increment(count);
        }
    }

    #[inline]
    pub fn record_series_deleted() {
        describe_all();
        ::metrics::counter!(SERIES_DELETED).increment(1);
    }

    #[inline]
    pub fn record_log_bytes_written(bytes: u64) {
        if bytes > 0 {
            ::metrics::counter!(LOG_BYTES_WRITTEN).increment(bytes);
        }
    }

    #[inline]
    pub fn record_compaction(duration: Duration, bytes: u64) {
        describe_all();
        ::metrics::histogram!(COMPACTION_DURATION_SECONDS).record(duration.as_secs_f64());
        ::metrics::counter!(COMPACTION_BYTES_WRITTEN).increment(bytes);
    }

    fn describe_all() {
        DESCRIBE.call_once(|| {
            describe_counter!(
                SERIES_ADDED,
                Unit::Count,
                "Total number of series add entries appended to log files."
            );
            describe_counter!(
                SERIES_DELETED,
                Unit::Count,
                "Total number of series tombstones appended to log files."
            );
            describe_counter!(
                LOG_BYTES_WRITTEN,
                Unit::Bytes,
                "Total number of record bytes appended to log files."
            );
            describe_counter!(
                COMPACTION_BYTES_WRITTEN,
                Unit::Bytes,
                "Total number of index file bytes produced by compaction."
            );
            describe_histogram!(
                COMPACTION_DURATION_SECONDS,
                Unit::Seconds,
                "Wall time of a single compaction."
            );
        });
    }
}
