//! Inspection tool for index files (`.tsi`) and log segments (`.tsl`).
//!
//! Read-only: log segments are replayed without truncating a torn tail. Exits with status
//! 1 on the first path that cannot be opened or read.

use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tsindex::{
    is_log_file, IndexError, IndexFile, LogFile, LogFileConfig, SeriesFile, SeriesId, SeriesIdSet,
    SeriesKey, LOG_FILE_EXT,
};

/// Dump the contents of TSI index files and log segments.
#[derive(Parser, Debug)]
#[command(name = "tsi-dump", version, about)]
pub struct Cli {
    /// Print every series id with its key.
    #[arg(long, env = "TSI_DUMP_SERIES", default_value_t = false)]
    pub series: bool,

    /// Print measurement names.
    #[arg(long, env = "TSI_DUMP_MEASUREMENTS", default_value_t = false)]
    pub measurements: bool,

    /// Print tag keys under each measurement.
    #[arg(long, env = "TSI_DUMP_TAG_KEYS", default_value_t = false)]
    pub tag_keys: bool,

    /// Print tag values with their series ids under each tag key.
    #[arg(long, env = "TSI_DUMP_TAG_VALUE_SERIES", default_value_t = false)]
    pub tag_value_series: bool,

    /// Index files or log segments to inspect.
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,
}

enum Source {
    Index(IndexFile),
    Log(LogFile),
}

impl Source {
    fn open(path: &Path) -> Result<Self, IndexError> {
        let meta = std::fs::metadata(path)?;
        if meta.is_dir() {
            return Err(IndexError::Format {
                details: "Path is a directory".to_string(),
                path: Some(path.to_path_buf()),
            });
        }
        let is_log = path.extension().and_then(|e| e.to_str()) == Some(LOG_FILE_EXT)
            || is_log_file(path);
        if is_log {
            let config = LogFileConfig {
                read_only: true,
                ..LogFileConfig::default()
            };
            let log = LogFile::new(Arc::new(SeriesFile::in_memory()), path, config);
            log.open()?;
            Ok(Source::Log(log))
        } else {
            Ok(Source::Index(IndexFile::open_path(path)?))
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Source::Index(_) => "index file",
            Source::Log(_) => "log file",
        }
    }

    fn measurement_names(&self) -> Result<Vec<Vec<u8>>, IndexError> {
        match self {
            Source::Index(f) => collect_keys(f.measurement_names()?),
            Source::Log(l) => l.measurement_names(),
        }
    }

    fn tag_keys(&self, name: &[u8]) -> Result<Vec<Vec<u8>>, IndexError> {
        match self {
            Source::Index(f) => collect_keys(f.tag_keys(name)?),
            Source::Log(l) => l.tag_keys(name),
        }
    }

    fn tag_values(&self, name: &[u8], key: &[u8]) -> Result<Vec<Vec<u8>>, IndexError> {
        match self {
            Source::Index(f) => collect_keys(f.tag_values(name, key)?),
            Source::Log(l) => l.tag_values(name, key),
        }
    }

    fn series_ids_for_tag_value(
        &self,
        name: &[u8],
        key: &[u8],
        value: &[u8],
    ) -> Result<Vec<SeriesId>, IndexError> {
        match self {
            Source::Index(f) => {
                let mut it = f.series_ids_for_tag_value(name, key, value)?;
                let mut ids = Vec::new();
                while let Some(id) = it.next_checked() {
                    ids.push(id?);
                }
                Ok(ids)
            }
            Source::Log(l) => Ok(l.series_ids_for_tag_value(name, key, value)?.to_vec()),
        }
    }

    fn series(&self) -> Result<Vec<(SeriesId, Option<SeriesKey>, bool)>, IndexError> {
        match self {
            Source::Index(f) => f
                .series_ids()?
                .iter()
                .map(|id| -> Result<_, IndexError> { Ok((id, f.series_key(id)?, false)) })
                .collect(),
            Source::Log(l) => {
                let snap = l.snapshot()?;
                let mut all: SeriesIdSet = snap.series_ids();
                let deleted = snap.deleted_series_ids();
                all.union_with(&deleted);
                Ok(all
                    .iter()
                    .map(|id| (id, snap.series_key(id).cloned(), deleted.contains(id)))
                    .collect())
            }
        }
    }

    fn summary<W: Write>(&self, out: &mut W) -> Result<(), IndexError> {
        match self {
            Source::Index(f) => {
                writeln!(out, "  size:         {}", f.size()?)?;
                writeln!(out, "  page size:    {}", f.page_size()?)?;
                writeln!(out, "  measurements: {}", f.measurement_count()?)?;
                writeln!(out, "  series:       {}", f.series_count()?)?;
            }
            Source::Log(l) => {
                let s = l.stats()?;
                writeln!(out, "  size:         {}", s.file_size)?;
                writeln!(out, "  entries:      {}", s.entries)?;
                writeln!(out, "  measurements: {}", s.measurements)?;
                writeln!(
                    out,
                    "  series:       {} live, {} deleted",
                    s.live_series, s.deleted_series
                )?;
            }
        }
        Ok(())
    }
}

fn collect_keys(mut it: tsindex::KeyIter) -> Result<Vec<Vec<u8>>, IndexError> {
    let mut keys = Vec::new();
    while let Some(k) = it.next_checked() {
        keys.push(k?);
    }
    Ok(keys)
}

fn lossy(b: &[u8]) -> std::borrow::Cow<'_, str> {
    String::from_utf8_lossy(b)
}

fn dump<W: Write>(cli: &Cli, path: &Path, out: &mut W) -> Result<(), IndexError> {
    let source = Source::open(path)?;
    if let Source::Index(f) = &source {
        f.verify()?;
    }
    writeln!(out, "[{}] {}", source.kind(), path.display())?;
    source.summary(out)?;

    if cli.series {
        writeln!(out, "series:")?;
        for (id, key, deleted) in source.series()? {
            let key = key.map(|k| k.to_string()).unwrap_or_else(|| "?".to_string());
            let mark = if deleted { " (deleted)" } else { "" };
            writeln!(out, "  {} {}{}", id, key, mark)?;
        }
    }

    if cli.measurements || cli.tag_keys || cli.tag_value_series {
        writeln!(out, "measurements:")?;
        for name in source.measurement_names()? {
            writeln!(out, "  {}", lossy(&name))?;
            if !(cli.tag_keys || cli.tag_value_series) {
                continue;
            }
            for key in source.tag_keys(&name)? {
                writeln!(out, "    {}", lossy(&key))?;
                if !cli.tag_value_series {
                    continue;
                }
                for value in source.tag_values(&name, &key)? {
                    let ids = source.series_ids_for_tag_value(&name, &key, &value)?;
                    let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
                    writeln!(out, "      {}: [{}]", lossy(&value), ids.join(", "))?;
                }
            }
        }
    }

    if let Source::Log(l) = &source {
        l.close()?;
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    for path in &cli.paths {
        if let Err(e) = dump(&cli, path, &mut out) {
            let _ = out.flush();
            eprintln!("tsi-dump: {}: {}", path.display(), e);
            return ExitCode::from(1);
        }
    }
    if let Err(e) = out.flush() {
        eprintln!("tsi-dump: {}", e);
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}
