//! Durable job and event storage
//!
//! Layout of [`FileJobStore`]:
//!
//! ```text
//! <data_dir>/
//! ├── jobs/<job_id>.json       ← latest job snapshot
//! └── events/<job_id>.jsonl    ← append-only event log, one event per line
//! ```

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use uuid::Uuid;

use super::model::{Event, Job};
use crate::error::StoreError;

/// Persistence backend for jobs and their event logs.
///
/// Calls are made while the caller holds its own `std::sync::Mutex`, on a
/// tokio worker thread. [`FileJobStore`] writes synchronously there, which
/// holds only for small job snapshots and single-line event appends.
/// Implementations must not block on anything but local IO.
pub trait JobStore: Send + Sync {
    fn save_job(&self, job: &Job) -> Result<(), StoreError>;
    fn append_event(&self, event: &Event) -> Result<(), StoreError>;
    fn load_jobs(&self) -> Result<Vec<Job>, StoreError>;
    fn load_events(&self, job_id: Uuid) -> Result<Vec<Event>, StoreError>;
    fn purge(&self, job_id: Uuid) -> Result<(), StoreError>;
}

/// Process-lifetime store; nothing survives a restart.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
    events: Mutex<HashMap<Uuid, Vec<Event>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.insert(job.id, job.clone());
        }
        Ok(())
    }

    fn append_event(&self, event: &Event) -> Result<(), StoreError> {
        if let Ok(mut events) = self.events.lock() {
            events.entry(event.job_id).or_default().push(event.clone());
        }
        Ok(())
    }

    fn load_jobs(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .jobs
            .lock()
            .map(|jobs| jobs.values().cloned().collect())
            .unwrap_or_default())
    }

    fn load_events(&self, job_id: Uuid) -> Result<Vec<Event>, StoreError> {
        Ok(self
            .events
            .lock()
            .map(|events| events.get(&job_id).cloned().unwrap_or_default())
            .unwrap_or_default())
    }

    fn purge(&self, job_id: Uuid) -> Result<(), StoreError> {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.remove(&job_id);
        }
        if let Ok(mut events) = self.events.lock() {
            events.remove(&job_id);
        }
        Ok(())
    }
}

/// JSON files under a data directory.
pub struct FileJobStore {
    jobs_dir: PathBuf,
    events_dir: PathBuf,
}

impl FileJobStore {
    /// Open (and create if needed) a store rooted at `data_dir`.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let data_dir = data_dir.as_ref();
        let jobs_dir = data_dir.join("jobs");
        let events_dir = data_dir.join("events");
        fs::create_dir_all(&jobs_dir)?;
        fs::create_dir_all(&events_dir)?;
        Ok(Self {
            jobs_dir,
            events_dir,
        })
    }

    fn job_path(&self, job_id: Uuid) -> PathBuf {
        self.jobs_dir.join(format!("{}.json", job_id))
    }

    fn events_path(&self, job_id: Uuid) -> PathBuf {
        self.events_dir.join(format!("{}.jsonl", job_id))
    }
}

impl JobStore for FileJobStore {
    fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        let path = self.job_path(job.id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(job)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn append_event(&self, event: &Event) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.events_path(event.job_id))?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    fn load_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs = Vec::new();
        for entry in fs::read_dir(&self.jobs_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                let bytes = fs::read(&path)?;
                match serde_json::from_slice::<Job>(&bytes) {
                    Ok(job) => jobs.push(job),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping unreadable job file")
                    }
                }
            }
        }
        Ok(jobs)
    }

    fn load_events(&self, job_id: Uuid) -> Result<Vec<Event>, StoreError> {
        let path = self.events_path(job_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(fs::File::open(path)?);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            // A torn final line from a crash is dropped
            match serde_json::from_str::<Event>(&line) {
                Ok(event) => events.push(event),
                Err(e) => tracing::warn!(job_id = %job_id, error = %e, "skipping corrupt event line"),
            }
        }
        Ok(events)
    }

    fn purge(&self, job_id: Uuid) -> Result<(), StoreError> {
        for path in [self.job_path(job_id), self.events_path(job_id)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
