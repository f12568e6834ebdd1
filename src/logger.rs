use chrono::{DateTime, Utc};
use log::info;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{io::Write, path::PathBuf};

use crate::error::VnaError;
use crate::types::ErrorEntry;

/// One dispatched operation as recorded in a session transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub command: String,
    pub kind: OperationKind,
    pub elapsed_ms: f64,
    /// `"ok"` or the error message
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<ErrorEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Action,
    Query,
    Group,
    Upload,
    Download,
}

/// Buffered JSONL writer. Intermediate flushes append lines; `finalize_as_json`
/// optionally rewrites the file as a single JSON array.
#[derive(Debug)]
pub struct Logger<T>
where
    T: Serialize + Clone + DeserializeOwned,
{
    buffer: Vec<T>,
    buffer_size: usize,
    file_path: PathBuf,
    final_format_json: bool,
    flush_failures: usize,
    max_flush_failures: usize,
}

impl<T> Logger<T>
where
    T: Serialize + Clone + DeserializeOwned,
{
    pub fn new<P: Into<PathBuf>>(file_path: P, buffer_size: usize, final_format_json: bool) -> Self {
        let mut path = file_path.into();
        let extension = if final_format_json { "json" } else { "jsonl" };
        if path.extension() != Some(std::ffi::OsStr::new(extension)) {
            path.set_extension(extension);
        }

        Self {
            buffer: Vec::with_capacity(buffer_size),
            buffer_size: buffer_size.max(1),
            file_path: path,
            final_format_json,
            flush_failures: 0,
            max_flush_failures: 10,
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.file_path
    }

    pub fn add(&mut self, data: T) -> Result<(), VnaError> {
        self.buffer.push(data);

        if self.buffer.len() >= self.buffer_size {
            self.flush()?;
        }

        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), VnaError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let write_result = (|| {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.file_path)?;
            let mut writer = std::io::BufWriter::new(file);
            for data in &self.buffer {
                let json_line = serde_json::to_string(data)?;
                writeln!(writer, "{}", json_line)?;
            }
            writer.flush()
        })();

        match write_result {
            Ok(()) => {
                self.flush_failures = 0;
                self.buffer.clear();
                log::debug!("Transcript flushed to {:?}", self.file_path);
                Ok(())
            }
            Err(e) => {
                self.flush_failures += 1;
                log::error!(
                    "Flush failure {}/{}: {}",
                    self.flush_failures,
                    self.max_flush_failures,
                    e
                );

                if self.flush_failures % 3 == 0 {
                    log::warn!(
                        "Experiencing intermittent flush failures ({}/{})",
                        self.flush_failures,
                        self.max_flush_failures
                    );
                }

                if self.flush_failures >= self.max_flush_failures {
                    return Err(VnaError::LocalFile {
                        path: self.file_path.clone(),
                        source: e,
                    });
                }

                // Keep the entries buffered and retry on the next flush
                Ok(())
            }
        }
    }

    /// Convert the JSONL file to a JSON array (no-op unless requested at construction)
    pub fn finalize_as_json(&mut self) -> Result<(), VnaError> {
        if !self.final_format_json {
            return Ok(());
        }

        self.flush()?;

        let local = |source| VnaError::LocalFile {
            path: self.file_path.clone(),
            source,
        };
        let content = match std::fs::read_to_string(&self.file_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(local(e)),
        };

        // Already an array if finalized before
        if content.trim_start().starts_with('[') {
            return Ok(());
        }

        let entries = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str::<T>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| local(e.into()))?;

        let json_output = serde_json::to_string_pretty(&entries).map_err(|e| local(e.into()))?;
        std::fs::write(&self.file_path, json_output).map_err(local)?;

        info!("Converted {} transcript entries to JSON", entries.len());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl<T> Drop for Logger<T>
where
    T: Serialize + Clone + DeserializeOwned,
{
    fn drop(&mut self) {
        let _ = self.flush();
        let _ = self.finalize_as_json();
    }
}

/// Session transcript writer
pub type TranscriptLogger = Logger<TranscriptEntry>;

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(sequence: u64) -> TranscriptEntry {
        TranscriptEntry {
            sequence,
            timestamp: Utc::now(),
            command: "*IDN?".to_string(),
            kind: OperationKind::Query,
            elapsed_ms: 1.5,
            outcome: "ok".to_string(),
            warnings: Vec::new(),
        }
    }

    #[test]
    fn test_buffered_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = TranscriptLogger::new(dir.path().join("session"), 2, false);
        assert_eq!(logger.path().extension().unwrap(), "jsonl");

        logger.add(entry(1)).unwrap();
        assert_eq!(logger.len(), 1);
        logger.add(entry(2)).unwrap();
        assert!(logger.is_empty());

        let content = std::fs::read_to_string(logger.path()).unwrap();
        assert_eq!(content.lines().count(), 2);
        let first: TranscriptEntry = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(first.sequence, 1);
    }

    #[test]
    fn test_finalize_as_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let mut logger = TranscriptLogger::new(dir.path().join("session"), 10, true);
            logger.add(entry(1)).unwrap();
            logger.add(entry(2)).unwrap();
            logger.finalize_as_json().unwrap();
            logger.path().to_path_buf()
        };
        let entries: Vec<TranscriptEntry> =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].sequence, 2);
    }
}
