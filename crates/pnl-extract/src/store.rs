//! On-disk persistence under the data directory.
//!
//! Ingested streams are appended to CSV files batch by batch so an interrupted
//! run keeps everything it fetched. Derived artifacts are JSON, rewritten whole.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use pnl_common::{dedup_by_id, ApiTrade, Fill, Identified, Redemption, SnapshotPoint};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::ingest::RecordSink;

/// File names (descriptive of what they contain).
pub const FILLS_FILE: &str = "fills.csv";
pub const REDEMPTIONS_FILE: &str = "redemptions.csv";
pub const SNAPSHOTS_FILE: &str = "snapshots.csv";
pub const TRADES_FILE: &str = "api_trades.csv";
pub const PNL_RECORDS_FILE: &str = "pnl_records.csv";
pub const MARKETS_FILE: &str = "markets.json";
pub const ASSET_MAP_FILE: &str = "asset_map.json";
pub const SUBGRAPH_PNL_FILE: &str = "subgraph_pnl.json";
pub const RECONCILIATION_FILE: &str = "reconciliation.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error in {path:?}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError {
    let path = path.to_path_buf();
    move |source| StoreError::Io { path, source }
}

/// Rows read back from a CSV file.
#[derive(Debug, Clone)]
pub struct Loaded<R> {
    pub records: Vec<R>,
    /// Rows that failed to deserialize.
    pub malformed: usize,
    /// Rows dropped because their identifier appeared earlier.
    pub duplicates: usize,
}

/// Append-mode CSV writer that adds a header only to a new file.
pub struct CsvSink<R> {
    path: PathBuf,
    writer: csv::Writer<File>,
    _record: PhantomData<fn(R)>,
}

impl<R: Serialize> CsvSink<R> {
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_error(&path))?;

        // Check if file is empty (new file) to write headers
        let needs_headers = file.metadata().map_err(io_error(&path))?.len() == 0;
        let writer = csv::WriterBuilder::new()
            .has_headers(needs_headers)
            .from_writer(file);

        Ok(Self {
            path,
            writer,
            _record: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<R: Serialize> RecordSink<R> for CsvSink<R> {
    fn write_batch(&mut self, records: &[R]) -> Result<(), StoreError> {
        for record in records {
            self.writer.serialize(record)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        self.writer.flush().map_err(io_error(&self.path))
    }
}

/// Files rooted at one data directory.
#[derive(Debug, Clone)]
pub struct DataStore {
    root: PathBuf,
}

impl DataStore {
    /// Creates the directory if it doesn't exist.
    pub fn open<P: Into<PathBuf>>(root: P) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(io_error(&root))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path(name).exists()
    }

    pub fn csv_sink<R: Serialize>(&self, name: &str) -> Result<CsvSink<R>, StoreError> {
        CsvSink::open(self.path(name))
    }

    /// Read every row, skipping the ones that fail to parse. A missing file is empty.
    pub fn read_csv<R: DeserializeOwned>(&self, name: &str) -> Result<(Vec<R>, usize), StoreError> {
        let path = self.path(name);
        if !path.exists() {
            return Ok((Vec::new(), 0));
        }
        let mut reader = csv::Reader::from_path(&path)?;
        let mut records = Vec::new();
        let mut malformed = 0;
        for (row, result) in reader.deserialize().enumerate() {
            match result {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!("Skipping malformed row {} in {:?}: {}", row + 1, path, e);
                    malformed += 1;
                }
            }
        }
        debug!("Read {} rows from {:?}", records.len(), path);
        Ok((records, malformed))
    }

    /// Read rows and drop repeated identifiers, keeping the first.
    pub fn load<R: DeserializeOwned + Identified>(
        &self,
        name: &str,
    ) -> Result<Loaded<R>, StoreError> {
        let (rows, malformed) = self.read_csv(name)?;
        let (records, duplicates) = dedup_by_id(rows);
        Ok(Loaded {
            records,
            malformed,
            duplicates,
        })
    }

    /// Identifiers already on disk, for resuming ingestion.
    pub fn seen_ids<R: DeserializeOwned + Identified>(
        &self,
        name: &str,
    ) -> Result<HashSet<String>, StoreError> {
        let (rows, _) = self.read_csv::<R>(name)?;
        Ok(rows.iter().map(|r| r.id().into_owned()).collect())
    }

    /// Replace a CSV file with `records`.
    pub fn write_csv<R: Serialize>(&self, name: &str, records: &[R]) -> Result<(), StoreError> {
        let path = self.path(name);
        let mut writer = csv::Writer::from_path(&path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush().map_err(io_error(&path))
    }

    pub fn write_json<T: Serialize + ?Sized>(
        &self,
        name: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let path = self.path(name);
        let text = serde_json::to_string_pretty(value).map_err(|source| StoreError::Json {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, text).map_err(io_error(&path))
    }

    /// `None` when the file does not exist.
    pub fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, StoreError> {
        let path = self.path(name);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path).map_err(io_error(&path))?;
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| StoreError::Json { path, source })
    }

    pub fn load_fills(&self) -> Result<Loaded<Fill>, StoreError> {
        self.load(FILLS_FILE)
    }

    pub fn load_redemptions(&self) -> Result<Loaded<Redemption>, StoreError> {
        self.load(REDEMPTIONS_FILE)
    }

    pub fn load_snapshots(&self) -> Result<Loaded<SnapshotPoint>, StoreError> {
        self.load(SNAPSHOTS_FILE)
    }

    pub fn load_trades(&self) -> Result<Loaded<ApiTrade>, StoreError> {
        self.load(TRADES_FILE)
    }
}
