//! Storage collaborator: writes record batches as JSON and/or CSV files.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::CountRecord;
use crate::config::{OutputFormat, StorageConfig};
use crate::error::{PipelineError, Result};

/// Destination for flushed count records.
pub trait CountStore: Send + Sync {
    /// Persist one batch in `format`. A failed write must leave no partial
    /// file behind under a final name.
    fn write(&self, records: &[CountRecord], format: OutputFormat) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchMetadata {
    pub saved_at: DateTime<Utc>,
    pub record_count: usize,
    pub interval_seconds: f64,
}

/// Layout of a JSON batch file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchDocument {
    pub metadata: BatchMetadata,
    pub records: Vec<CountRecord>,
}

/// Writes `vehicle_counts_<timestamp>_<batch>.{json,csv}[.gz]` files into a
/// directory.
#[derive(Debug)]
pub struct FileStore {
    output_dir: PathBuf,
    compression: bool,
    interval_seconds: f64,
    batch: AtomicU64,
}

impl FileStore {
    pub fn new(output_dir: impl Into<PathBuf>, compression: bool) -> Self {
        Self {
            output_dir: output_dir.into(),
            compression,
            interval_seconds: 0.0,
            batch: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            interval_seconds: config.save_interval.as_secs_f64(),
            ..Self::new(&config.output_dir, config.compression)
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn path_for(&self, stem: &str, extension: &str) -> PathBuf {
        let name = if self.compression {
            format!("{stem}.{extension}.gz")
        } else {
            format!("{stem}.{extension}")
        };
        self.output_dir.join(name)
    }

    /// Write `body` to `<path>.partial`. The partial file is removed on error.
    fn stage(
        &self,
        path: &Path,
        body: impl FnOnce(&mut dyn Write) -> Result<()>,
    ) -> Result<Staged> {
        let mut partial = path.as_os_str().to_owned();
        partial.push(".partial");
        let staged = Staged {
            partial: PathBuf::from(partial),
            path: path.to_path_buf(),
        };

        let result = (|| -> Result<()> {
            let file = BufWriter::new(File::create(&staged.partial)?);
            if self.compression {
                let mut encoder = GzEncoder::new(file, Compression::default());
                body(&mut encoder)?;
                encoder.finish()?.flush()?;
            } else {
                let mut file = file;
                body(&mut file)?;
                file.flush()?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => Ok(staged),
            Err(err) => {
                let _ = fs::remove_file(&staged.partial);
                Err(err)
            }
        }
    }

    fn stage_batch(
        &self,
        stem: &str,
        records: &[CountRecord],
        format: OutputFormat,
        saved_at: DateTime<Utc>,
        staged: &mut Vec<Staged>,
    ) -> Result<()> {
        if format.writes_json() {
            let path = self.path_for(stem, "json");
            let document = BatchDocument {
                metadata: BatchMetadata {
                    saved_at,
                    record_count: records.len(),
                    interval_seconds: self.interval_seconds,
                },
                records: records.to_vec(),
            };
            staged.push(self.stage(&path, |w| Ok(serde_json::to_writer_pretty(w, &document)?))?);
        }

        if format.writes_csv() {
            let path = self.path_for(stem, "csv");
            staged.push(self.stage(&path, |w| {
                let mut writer = csv::Writer::from_writer(w);
                for record in records {
                    writer.serialize(record)?;
                }
                writer.flush()?;
                Ok(())
            })?);
        }
        Ok(())
    }
}

/// A fully written temporary file and the name it is published under.
struct Staged {
    partial: PathBuf,
    path: PathBuf,
}

impl CountStore for FileStore {
    /// Every requested format is staged first and only then renamed into
    /// place, so a failed batch leaves no file under a final name and a retry
    /// cannot duplicate records.
    fn write(&self, records: &[CountRecord], format: OutputFormat) -> Result<()> {
        fs::create_dir_all(&self.output_dir)?;
        let saved_at = Utc::now();
        let batch = self.batch.fetch_add(1, Ordering::SeqCst);
        let stem = format!("vehicle_counts_{}_{batch:04}", saved_at.format("%Y%m%d_%H%M%S"));

        let mut staged = Vec::new();
        if let Err(err) = self.stage_batch(&stem, records, format, saved_at, &mut staged) {
            for file in &staged {
                let _ = fs::remove_file(&file.partial);
            }
            return Err(err);
        }

        for (index, file) in staged.iter().enumerate() {
            if let Err(err) = fs::rename(&file.partial, &file.path) {
                for published in &staged[..index] {
                    let _ = fs::remove_file(&published.path);
                }
                for pending in &staged[index..] {
                    let _ = fs::remove_file(&pending.partial);
                }
                return Err(err.into());
            }
            debug!(path = %file.path.display(), records = records.len(), "batch file written");
        }
        Ok(())
    }
}

/// Read back a batch file written by [`FileStore`], by extension.
pub fn read_batch(path: impl AsRef<Path>) -> Result<Vec<CountRecord>> {
    let path = path.as_ref();
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| PipelineError::persistence(format!("bad batch path {}", path.display())))?;

    let file = BufReader::new(File::open(path)?);
    let (reader, name): (Box<dyn Read>, &str) = match name.strip_suffix(".gz") {
        Some(inner) => (Box::new(GzDecoder::new(file)), inner),
        None => (Box::new(file), name),
    };

    if name.ends_with(".json") {
        let document: BatchDocument = serde_json::from_reader(reader)?;
        Ok(document.records)
    } else if name.ends_with(".csv") {
        csv::Reader::from_reader(reader)
            .deserialize()
            .map(|row| row.map_err(PipelineError::from))
            .collect()
    } else {
        Err(PipelineError::persistence(format!(
            "unrecognised batch file {}",
            path.display()
        )))
    }
}
