//! # Record Store
//!
//! Session and evaluation records, keyed by session id.
//!
//! `JsonRecordStore` keeps live records in memory and, when persistence is enabled,
//! writes each record to its own file (`sessions/<id>.json`,
//! `evaluations/<id>.json`) after every mutation. Writes to one record are
//! serialized; writes to different records never wait on each other, and no file
//! I/O happens while the in-memory tables are locked.
//!
//! Every write operation is safe to repeat: creates keep the existing record,
//! transcript entries are keyed by batch sequence, and a completed evaluation is
//! never overwritten.
//!
//! ## Memory:
//! Once a record is final (a completed session, an evaluation with its report) and
//! on disk, it is dropped from memory and served from its file afterwards. Without
//! a data directory nothing is ever evicted, since memory holds the only copy.
//!
//! ## Failure model:
//! The in-memory update always happens first. A failed file write is reported as
//! `PersistenceFailure` but the in-memory record stays updated.

use crate::error::{EvalResult, EvaluationError};
use crate::scoring::{FinalReport, LiveSummary};
use crate::session::SessionState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

const SESSIONS_DIR: &str = "sessions";
const EVALUATIONS_DIR: &str = "evaluations";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub presentation_id: String,
    pub status: SessionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Averages of the live scores, written when the session finalizes
    pub analysis: Option<LiveSummary>,
}

impl SessionRecord {
    pub fn new(id: &str, presentation_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            presentation_id: presentation_id.to_string(),
            status: SessionState::Created,
            created_at: now,
            updated_at: now,
            analysis: None,
        }
    }
}

/// One transcribed batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub sequence: u64,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub session_id: String,
    pub presentation_id: String,
    pub transcript: Vec<TranscriptEntry>,
    pub report: Option<FinalReport>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create_session(&self, record: SessionRecord) -> EvalResult<()>;

    async fn update_status(&self, session_id: &str, status: SessionState) -> EvalResult<()>;

    async fn update_analysis(&self, session_id: &str, summary: &LiveSummary) -> EvalResult<()>;

    async fn create_evaluation(&self, session_id: &str, presentation_id: &str) -> EvalResult<()>;

    async fn append_transcript_entry(&self, session_id: &str, entry: TranscriptEntry) -> EvalResult<()>;

    async fn complete_evaluation(&self, session_id: &str, report: &FinalReport) -> EvalResult<()>;

    async fn get_session(&self, session_id: &str) -> EvalResult<Option<SessionRecord>>;

    async fn get_evaluation(&self, session_id: &str) -> EvalResult<Option<EvaluationRecord>>;
}

#[derive(Debug, Default)]
struct Records {
    sessions: HashMap<String, SessionRecord>,
    evaluations: HashMap<String, EvaluationRecord>,
}

/// A record type with its own table and directory.
trait Stored: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static {
    const DIR: &'static str;

    fn table(records: &Records) -> &HashMap<String, Self>;

    fn table_mut(records: &mut Records) -> &mut HashMap<String, Self>;

    /// Final records never change again and may leave memory once written.
    fn is_final(&self) -> bool;
}

impl Stored for SessionRecord {
    const DIR: &'static str = SESSIONS_DIR;

    fn table(records: &Records) -> &HashMap<String, Self> {
        &records.sessions
    }

    fn table_mut(records: &mut Records) -> &mut HashMap<String, Self> {
        &mut records.sessions
    }

    fn is_final(&self) -> bool {
        self.status == SessionState::Completed
    }
}

impl Stored for EvaluationRecord {
    const DIR: &'static str = EVALUATIONS_DIR;

    fn table(records: &Records) -> &HashMap<String, Self> {
        &records.evaluations
    }

    fn table_mut(records: &mut Records) -> &mut HashMap<String, Self> {
        &mut records.evaluations
    }

    fn is_final(&self) -> bool {
        self.report.is_some()
    }
}

pub struct JsonRecordStore {
    records: Mutex<Records>,
    /// One lock per record file, held for the duration of a write.
    write_locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
    data_dir: Option<PathBuf>,
}

impl JsonRecordStore {
    /// A store that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self {
            records: Mutex::new(Records::default()),
            write_locks: Mutex::new(HashMap::new()),
            data_dir: None,
        }
    }

    /// Open (or create) a file-backed store under `data_dir`. Records written by a
    /// previous run are read from disk on demand.
    pub async fn open(data_dir: impl AsRef<Path>) -> EvalResult<Self> {
        let dir = data_dir.as_ref().to_path_buf();
        for table in [SESSIONS_DIR, EVALUATIONS_DIR] {
            let path = dir.join(table);
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|e| persistence(&path, e))?;
        }

        info!(data_dir = %dir.display(), "Record store opened");

        Ok(Self {
            records: Mutex::new(Records::default()),
            write_locks: Mutex::new(HashMap::new()),
            data_dir: Some(dir),
        })
    }

    /// File for record `id`, if the store is file-backed and the id is safe to use
    /// as a file name.
    fn record_path<T: Stored>(&self, id: &str) -> Option<PathBuf> {
        let dir = self.data_dir.as_ref()?;
        is_safe_id(id).then(|| dir.join(T::DIR).join(format!("{}.json", id)))
    }

    fn write_lock(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.write_locks.lock().entry(path.to_path_buf()).or_default())
    }

    fn cached<T: Stored>(&self, id: &str) -> Option<T> {
        let records = self.records.lock();
        T::table(&records).get(id).cloned()
    }

    async fn read_from_disk<T: Stored>(&self, id: &str) -> EvalResult<Option<T>> {
        let Some(path) = self.record_path::<T>(id) else {
            return Ok(None);
        };

        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| EvaluationError::PersistenceFailure(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(persistence(&path, e)),
        }
    }

    async fn fetch<T: Stored>(&self, id: &str) -> EvalResult<Option<T>> {
        match self.cached::<T>(id) {
            Some(record) => Ok(Some(record)),
            None => self.read_from_disk(id).await,
        }
    }

    /// Insert `record` unless one already exists in memory or on disk.
    async fn insert<T: Stored>(&self, id: &str, record: T) -> EvalResult<()> {
        if self.fetch::<T>(id).await?.is_some() {
            return Ok(());
        }

        let inserted = {
            let mut records = self.records.lock();
            match T::table_mut(&mut records).entry(id.to_string()) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(record);
                    true
                }
            }
        };

        if inserted {
            self.flush::<T>(id).await
        } else {
            Ok(())
        }
    }

    /// Apply `change` to record `id`, reloading it from disk if it was evicted.
    /// `change` returns false when it left the record untouched.
    async fn modify<T, F>(&self, id: &str, change: F) -> EvalResult<()>
    where
        T: Stored,
        F: FnOnce(&mut T) -> bool + Send,
    {
        let mut reloaded = None;
        if self.cached::<T>(id).is_none() {
            if let Some(stored) = self.read_from_disk::<T>(id).await? {
                T::table_mut(&mut self.records.lock())
                    .entry(id.to_string())
                    .or_insert_with(|| stored.clone());
                reloaded = Some(stored);
            }
        }

        let changed = {
            let mut records = self.records.lock();
            let record = T::table_mut(&mut records)
                .get_mut(id)
                .ok_or_else(|| EvaluationError::SessionNotFound(id.to_string()))?;
            change(record)
        };

        if changed {
            return self.flush::<T>(id).await;
        }

        // A no-op on a record read back from disk: the file is still current.
        if let Some(stored) = reloaded.filter(|r| r.is_final()) {
            self.evict_if_current(id, &stored);
        }
        Ok(())
    }

    /// Drop a final record from memory if it still matches what was written.
    fn evict_if_current<T: Stored>(&self, id: &str, written: &T) -> bool {
        let mut records = self.records.lock();
        let table = T::table_mut(&mut records);
        if table.get(id) == Some(written) {
            table.remove(id);
            true
        } else {
            false
        }
    }

    /// Write the current state of record `id` to its file.
    ///
    /// The snapshot is taken after acquiring the record's write lock, so a later
    /// flush always writes state at least as new as an earlier one.
    async fn flush<T: Stored>(&self, id: &str) -> EvalResult<()> {
        let Some(path) = self.record_path::<T>(id) else {
            return Ok(());
        };

        let lock = self.write_lock(&path);
        let _guard = lock.lock().await;

        // Gone from memory means an earlier flush already wrote the final state.
        let Some(record) = self.cached::<T>(id) else {
            return Ok(());
        };

        let json = serde_json::to_vec_pretty(&record)
            .map_err(|e| EvaluationError::PersistenceFailure(e.to_string()))?;

        let tmp = path.with_file_name(format!("{}.{}.tmp", id, Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, json).await.map_err(|e| persistence(&tmp, e))?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| persistence(&path, e))?;
        debug!(path = %path.display(), "Record flushed");

        if record.is_final() && self.evict_if_current(id, &record) {
            self.write_locks.lock().remove(&path);
            debug!(path = %path.display(), "Final record evicted from memory");
        }

        Ok(())
    }

    #[cfg(test)]
    fn cached_counts(&self) -> (usize, usize) {
        let records = self.records.lock();
        (records.sessions.len(), records.evaluations.len())
    }
}

/// Session ids are UUIDs; anything else that could escape the data directory
/// never reaches the filesystem.
fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn persistence(path: &Path, err: std::io::Error) -> EvaluationError {
    EvaluationError::PersistenceFailure(format!("{}: {}", path.display(), err))
}

#[async_trait]
impl RecordStore for JsonRecordStore {
    async fn create_session(&self, record: SessionRecord) -> EvalResult<()> {
        let id = record.id.clone();
        self.insert(&id, record).await
    }

    async fn update_status(&self, session_id: &str, status: SessionState) -> EvalResult<()> {
        self.modify(session_id, |record: &mut SessionRecord| {
            record.status = status;
            record.updated_at = Utc::now();
            true
        })
        .await
    }

    async fn update_analysis(&self, session_id: &str, summary: &LiveSummary) -> EvalResult<()> {
        let summary = summary.clone();
        self.modify(session_id, move |record: &mut SessionRecord| {
            record.analysis = Some(summary);
            record.updated_at = Utc::now();
            true
        })
        .await
    }

    async fn create_evaluation(&self, session_id: &str, presentation_id: &str) -> EvalResult<()> {
        let record = EvaluationRecord {
            session_id: session_id.to_string(),
            presentation_id: presentation_id.to_string(),
            transcript: Vec::new(),
            report: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        self.insert(session_id, record).await
    }

    async fn append_transcript_entry(&self, session_id: &str, entry: TranscriptEntry) -> EvalResult<()> {
        self.modify(session_id, move |evaluation: &mut EvaluationRecord| {
            if evaluation.report.is_some() || evaluation.transcript.iter().any(|e| e.sequence == entry.sequence) {
                return false;
            }
            evaluation.transcript.push(entry);
            evaluation.transcript.sort_by_key(|e| e.sequence);
            true
        })
        .await
    }

    async fn complete_evaluation(&self, session_id: &str, report: &FinalReport) -> EvalResult<()> {
        let report = report.clone();
        self.modify(session_id, move |evaluation: &mut EvaluationRecord| {
            if evaluation.report.is_some() {
                return false;
            }
            evaluation.completed_at = Some(report.completed_at);
            evaluation.report = Some(report);
            true
        })
        .await
    }

    async fn get_session(&self, session_id: &str) -> EvalResult<Option<SessionRecord>> {
        self.fetch(session_id).await
    }

    async fn get_evaluation(&self, session_id: &str) -> EvalResult<Option<EvaluationRecord>> {
        self.fetch(session_id).await
    }
}
