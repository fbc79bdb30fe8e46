//! # Session Recording Module
//!
//! Persists workout sessions and their per-second samples.
//!
//! ## Architecture
//! - **SessionStore**: storage contract (insert session, update it with final
//!   counters, append samples, read back)
//! - **MemoryStore**: in-process store, shareable so callers can inspect it
//! - **JsonStore**: `sessions.json` index plus one `session_<id>.jsonl` sample
//!   log per session
//! - **Recorder**: background writer thread that owns the store. Samples are
//!   fire-and-forget; session start and finalisation wait for the writer.
//!
//! ## Shutdown
//! Dropping the `Recorder` queues `Stop` behind any pending work and joins the
//! writer, so a finalisation issued before shutdown always reaches the store.

use crate::config::RunMode;
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

pub type SessionId = i64;

const INDEX_FILE: &str = "sessions.json";

/// Final counters written when a session ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub end_time: DateTime<Utc>,
    pub duration_seconds: u64,
    pub avg_bpm: u16,
    pub max_bpm: u16,
    pub target_zone_seconds: u64,
    /// Seconds in absolute zones 1..=5
    pub zone_seconds: [u64; 5],
    pub no_data_seconds: u64,
    pub distance_km: f64,
    pub avg_pace_min_per_km: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub start_time: DateTime<Utc>,
    pub run_mode: RunMode,
    pub summary: Option<SessionSummary>,
}

impl SessionRecord {
    /// A record that has not been assigned an id yet.
    pub fn new(start_time: DateTime<Utc>, run_mode: RunMode) -> Self {
        Self {
            id: 0,
            start_time,
            run_mode,
            summary: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HrSample {
    pub session_id: SessionId,
    pub elapsed_seconds: u64,
    /// 0 when no heart rate was available for this second
    pub raw_bpm: u16,
    pub smoothed_bpm: u16,
    pub connection_state: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub pace_min_per_km: Option<f64>,
}

pub trait SessionStore: Send {
    fn insert_session(&mut self, record: &SessionRecord) -> Result<SessionId, StoreError>;
    fn update_session(&mut self, id: SessionId, summary: &SessionSummary) -> Result<(), StoreError>;
    fn insert_sample(&mut self, sample: &HrSample) -> Result<(), StoreError>;
    fn session(&self, id: SessionId) -> Result<Option<SessionRecord>, StoreError>;
    fn samples(&self, id: SessionId) -> Result<Vec<HrSample>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryData {
    sessions: Vec<SessionRecord>,
    samples: Vec<HrSample>,
}

/// In-process store. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Arc<Mutex<MemoryData>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryData> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.lock().sessions.clone()
    }
}

impl SessionStore for MemoryStore {
    fn insert_session(&mut self, record: &SessionRecord) -> Result<SessionId, StoreError> {
        let mut data = self.lock();
        let id = next_id(&data.sessions);
        data.sessions.push(SessionRecord {
            id,
            ..record.clone()
        });
        Ok(id)
    }

    fn update_session(&mut self, id: SessionId, summary: &SessionSummary) -> Result<(), StoreError> {
        let mut data = self.lock();
        let record = data
            .sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(StoreError::UnknownSession(id))?;
        record.summary = Some(summary.clone());
        Ok(())
    }

    fn insert_sample(&mut self, sample: &HrSample) -> Result<(), StoreError> {
        let mut data = self.lock();
        if !data.sessions.iter().any(|s| s.id == sample.session_id) {
            return Err(StoreError::UnknownSession(sample.session_id));
        }
        data.samples.push(sample.clone());
        Ok(())
    }

    fn session(&self, id: SessionId) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.lock().sessions.iter().find(|s| s.id == id).cloned())
    }

    fn samples(&self, id: SessionId) -> Result<Vec<HrSample>, StoreError> {
        Ok(self
            .lock()
            .samples
            .iter()
            .filter(|s| s.session_id == id)
            .cloned()
            .collect())
    }
}

/// File-backed store under one directory.
pub struct JsonStore {
    dir: PathBuf,
    sessions: Vec<SessionRecord>,
}

impl JsonStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let index = dir.join(INDEX_FILE);
        let sessions = if index.exists() {
            serde_json::from_str(&fs::read_to_string(&index)?)?
        } else {
            Vec::new()
        };
        log::info!("Session store opened at: {}", dir.display());
        Ok(Self { dir, sessions })
    }

    pub fn default_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("zone-coach"))
    }

    fn samples_path(&self, id: SessionId) -> PathBuf {
        self.dir.join(format!("session_{}.jsonl", id))
    }

    fn write_index(&self) -> Result<(), StoreError> {
        let tmp = self.dir.join(format!("{}.tmp", INDEX_FILE));
        fs::write(&tmp, serde_json::to_string_pretty(&self.sessions)?)?;
        fs::rename(&tmp, self.dir.join(INDEX_FILE))?;
        Ok(())
    }
}

impl SessionStore for JsonStore {
    fn insert_session(&mut self, record: &SessionRecord) -> Result<SessionId, StoreError> {
        let id = next_id(&self.sessions);
        self.sessions.push(SessionRecord {
            id,
            ..record.clone()
        });
        self.write_index()?;
        Ok(id)
    }

    fn update_session(&mut self, id: SessionId, summary: &SessionSummary) -> Result<(), StoreError> {
        let record = self
            .sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(StoreError::UnknownSession(id))?;
        record.summary = Some(summary.clone());
        self.write_index()
    }

    fn insert_sample(&mut self, sample: &HrSample) -> Result<(), StoreError> {
        if !self.sessions.iter().any(|s| s.id == sample.session_id) {
            return Err(StoreError::UnknownSession(sample.session_id));
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.samples_path(sample.session_id))?;
        writeln!(file, "{}", serde_json::to_string(sample)?)?;
        Ok(())
    }

    fn session(&self, id: SessionId) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.sessions.iter().find(|s| s.id == id).cloned())
    }

    fn samples(&self, id: SessionId) -> Result<Vec<HrSample>, StoreError> {
        let path = self.samples_path(id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(fs::File::open(path)?);
        let mut samples = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            samples.push(serde_json::from_str(&line)?);
        }
        Ok(samples)
    }
}

fn next_id(sessions: &[SessionRecord]) -> SessionId {
    sessions.iter().map(|s| s.id).max().unwrap_or(0) + 1
}

/// Command sent to the writer thread
enum RecorderCommand {
    StartSession {
        record: SessionRecord,
        reply: Sender<Result<SessionId, StoreError>>,
    },
    Sample(HrSample),
    Finalize {
        id: SessionId,
        summary: SessionSummary,
        ack: Sender<Result<(), StoreError>>,
    },
    Stop,
}

/// Owns a `SessionStore` on a background writer thread.
pub struct Recorder {
    command_tx: Sender<RecorderCommand>,
    writer_thread: Option<thread::JoinHandle<()>>,
}

impl Recorder {
    pub fn new(store: Box<dyn SessionStore>) -> Self {
        let (command_tx, command_rx) = unbounded();
        let writer_thread = thread::spawn(move || {
            Self::writer_loop(command_rx, store);
        });

        Recorder {
            command_tx,
            writer_thread: Some(writer_thread),
        }
    }

    /// Create the session record and return its id.
    pub fn start_session(&self, record: SessionRecord) -> Result<SessionId, StoreError> {
        let (reply, response) = bounded(1);
        self.command_tx
            .send(RecorderCommand::StartSession { record, reply })
            .map_err(|_| StoreError::WriterUnavailable)?;
        response.recv().map_err(|_| StoreError::WriterUnavailable)?
    }

    /// Queue one sample. Never blocks; failures are logged by the writer.
    pub fn record_sample(&self, sample: HrSample) {
        if self.command_tx.send(RecorderCommand::Sample(sample)).is_err() {
            log::warn!("Dropping sample: {}", StoreError::WriterUnavailable);
        }
    }

    /// Write the final counters and wait until the store has them.
    pub fn finalize(&self, id: SessionId, summary: SessionSummary) -> Result<(), StoreError> {
        let (ack, done) = bounded(1);
        self.command_tx
            .send(RecorderCommand::Finalize { id, summary, ack })
            .map_err(|_| StoreError::WriterUnavailable)?;
        done.recv().map_err(|_| StoreError::WriterUnavailable)?
    }

    fn writer_loop(command_rx: Receiver<RecorderCommand>, mut store: Box<dyn SessionStore>) {
        loop {
            match command_rx.recv() {
                Ok(RecorderCommand::StartSession { record, reply }) => {
                    let result = store.insert_session(&record);
                    match &result {
                        Ok(id) => log::info!("Session {} started", id),
                        Err(e) => log::error!("Failed to create session: {}", e),
                    }
                    let _ = reply.send(result);
                }
                Ok(RecorderCommand::Sample(sample)) => {
                    if let Err(e) = store.insert_sample(&sample) {
                        log::warn!("Failed to store sample: {}", e);
                    }
                }
                Ok(RecorderCommand::Finalize { id, summary, ack }) => {
                    let result = store.update_session(id, &summary);
                    match &result {
                        Ok(()) => log::info!(
                            "Session {} finalized ({}s, avg {} bpm)",
                            id,
                            summary.duration_seconds,
                            summary.avg_bpm
                        ),
                        Err(e) => log::error!("Failed to finalize session {}: {}", id, e),
                    }
                    let _ = ack.send(result);
                }
                Ok(RecorderCommand::Stop) => {
                    log::info!("Writer thread stopped");
                    break;
                }
                Err(_) => {
                    log::info!("Writer thread: command channel closed");
                    break;
                }
            }
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        // Queued behind pending samples and finalisation
        let _ = self.command_tx.send(RecorderCommand::Stop);

        if let Some(handle) = self.writer_thread.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(session_id: SessionId, elapsed_seconds: u64, bpm: u16) -> HrSample {
        HrSample {
            session_id,
            elapsed_seconds,
            raw_bpm: bpm,
            smoothed_bpm: bpm,
            connection_state: "connected".to_string(),
            latitude: None,
            longitude: None,
            pace_min_per_km: None,
        }
    }

    fn summary(duration_seconds: u64) -> SessionSummary {
        SessionSummary {
            end_time: Utc::now(),
            duration_seconds,
            avg_bpm: 131,
            max_bpm: 150,
            target_zone_seconds: 40,
            zone_seconds: [5, 40, 15, 0, 0],
            no_data_seconds: 0,
            distance_km: 0.0,
            avg_pace_min_per_km: 0.0,
        }
    }

    #[test]
    fn test_memory_store_assigns_increasing_ids() {
        let mut store = MemoryStore::new();
        let record = SessionRecord::new(Utc::now(), RunMode::Treadmill);
        assert_eq!(store.insert_session(&record).unwrap(), 1);
        assert_eq!(store.insert_session(&record).unwrap(), 2);
        assert!(matches!(
            store.update_session(9, &summary(1)),
            Err(StoreError::UnknownSession(9))
        ));
    }

    #[test]
    fn test_recorder_round_trip_through_writer() {
        let store = MemoryStore::new();
        let recorder = Recorder::new(Box::new(store.clone()));

        let id = recorder
            .start_session(SessionRecord::new(Utc::now(), RunMode::Outdoor))
            .unwrap();
        for second in 1..=3 {
            recorder.record_sample(sample(id, second, 120 + second as u16));
        }
        recorder.finalize(id, summary(3)).unwrap();

        let stored = store.session(id).unwrap().unwrap();
        assert_eq!(stored.summary.map(|s| s.duration_seconds), Some(3));
        // Finalize is acknowledged after earlier samples were applied
        assert_eq!(store.samples(id).unwrap().len(), 3);
    }

    #[test]
    fn test_drop_drains_pending_samples() {
        let store = MemoryStore::new();
        let id = {
            let recorder = Recorder::new(Box::new(store.clone()));
            let id = recorder
                .start_session(SessionRecord::new(Utc::now(), RunMode::Treadmill))
                .unwrap();
            for second in 1..=50 {
                recorder.record_sample(sample(id, second, 130));
            }
            id
        };
        assert_eq!(store.samples(id).unwrap().len(), 50);
    }

    #[test]
    fn test_sample_for_unknown_session_is_dropped() {
        let store = MemoryStore::new();
        let recorder = Recorder::new(Box::new(store.clone()));
        recorder.record_sample(sample(42, 1, 100));
        drop(recorder);
        assert!(store.samples(42).unwrap().is_empty());
    }

    #[test]
    fn test_json_store_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let id = {
            let mut store = JsonStore::open(dir.path()).unwrap();
            let id = store
                .insert_session(&SessionRecord::new(Utc::now(), RunMode::Outdoor))
                .unwrap();
            store.insert_sample(&sample(id, 1, 118)).unwrap();
            store.insert_sample(&sample(id, 2, 121)).unwrap();
            store.update_session(id, &summary(2)).unwrap();
            id
        };

        let store = JsonStore::open(dir.path()).unwrap();
        let record = store.session(id).unwrap().unwrap();
        assert_eq!(record.run_mode, RunMode::Outdoor);
        assert_eq!(record.summary.unwrap().zone_seconds, [5, 40, 15, 0, 0]);

        let samples = store.samples(id).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].raw_bpm, 121);
        assert!(dir.path().join("session_1.jsonl").exists());
    }

    #[test]
    fn test_json_store_rejects_unknown_session() {
        let dir = tempdir().unwrap();
        let mut store = JsonStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.insert_sample(&sample(7, 1, 100)),
            Err(StoreError::UnknownSession(7))
        ));
        assert!(store.samples(7).unwrap().is_empty());
    }
}
