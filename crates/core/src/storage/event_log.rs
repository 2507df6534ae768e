use crate::events::{Event, EventSink};
use crate::types::ExecutionId;
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Flush once this many events are buffered
const FLUSH_THRESHOLD: usize = 100;

/// Event log using gzip-compressed JSONL files, one per execution and day
pub struct JsonlEventLog {
    base_path: PathBuf,
    // Buffered events not yet written to disk
    buffer: Mutex<Vec<Event>>,
}

impl JsonlEventLog {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path).context("Failed to create event log directory")?;
        Ok(Self {
            base_path,
            buffer: Mutex::new(Vec::new()),
        })
    }

    /// Format: <base>/YYYY/MM/DD/<execution_id>.jsonl.gz
    fn event_log_path(&self, execution_id: &ExecutionId, date: &DateTime<Utc>) -> PathBuf {
        self.base_path
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{:02}", date.day()))
            .join(format!("{}.jsonl.gz", execution_id))
    }

    /// Write buffered events to disk
    pub fn flush(&self) -> Result<()> {
        let events: Vec<Event> = {
            let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            buffer.drain(..).collect()
        };
        if events.is_empty() {
            return Ok(());
        }

        // Group events by file
        let mut by_path: HashMap<PathBuf, Vec<Event>> = HashMap::new();
        for event in events {
            let path = self.event_log_path(&event.execution_id, &event.timestamp);
            by_path.entry(path).or_default().push(event);
        }

        for (path, events) in by_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .context("Failed to create event log directory")?;
            }

            let mut all_events = if path.exists() {
                read_jsonl_gz(&path)?
            } else {
                Vec::new()
            };
            all_events.extend(events);

            write_jsonl_gz(&path, &all_events)?;
        }

        Ok(())
    }

    /// All recorded events of an execution, ordered by timestamp
    pub fn read_events(&self, execution_id: &ExecutionId) -> Result<Vec<Event>> {
        self.flush()?;

        let filename = format!("{}.jsonl.gz", execution_id);
        let mut events = Vec::new();
        for file in find_files(&self.base_path, &filename, 3)? {
            events.extend(read_jsonl_gz(&file)?);
        }

        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }
}

impl EventSink for JsonlEventLog {
    fn emit(&self, event: Event) {
        let should_flush = {
            let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            buffer.push(event);
            buffer.len() > FLUSH_THRESHOLD
        };

        if should_flush {
            if let Err(e) = self.flush() {
                tracing::error!("Failed to flush event log: {:#}", e);
            }
        }
    }
}

impl Drop for JsonlEventLog {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::error!("Failed to flush event log on shutdown: {:#}", e);
        }
    }
}

fn read_jsonl_gz(path: &Path) -> Result<Vec<Event>> {
    let file = std::fs::File::open(path).context("Failed to open event log")?;
    let reader = std::io::BufReader::new(GzDecoder::new(file));

    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line.context("Failed to read line from event log")?;
        if line.trim().is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(&line).context("Failed to parse event")?;
        events.push(event);
    }

    Ok(events)
}

fn write_jsonl_gz(path: &Path, events: &[Event]) -> Result<()> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());

    for event in events {
        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        encoder
            .write_all(json.as_bytes())
            .context("Failed to write event")?;
        encoder.write_all(b"\n").context("Failed to write newline")?;
    }

    let compressed = encoder.finish().context("Failed to finish compression")?;
    std::fs::write(path, compressed).context("Failed to write event log file")?;

    Ok(())
}

/// Walk the year/month/day directories looking for `filename`
fn find_files(dir: &Path, filename: &str, depth: usize) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    if depth == 0 {
        let candidate = dir.join(filename);
        return Ok(if candidate.exists() {
            vec![candidate]
        } else {
            Vec::new()
        });
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).context("Failed to read event log directory")? {
        let entry = entry.context("Failed to read directory entry")?;
        if entry.path().is_dir() {
            files.extend(find_files(&entry.path(), filename, depth - 1)?);
        }
    }
    Ok(files)
}
