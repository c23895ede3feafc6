//! Resume records
//!
//! Progress is kept as an append-only log of JSON lines, one full
//! [`UploadSession`] snapshot per line. The last line that parses wins, so a
//! write torn by a crash only costs the most recent chunk.
//!
//! Next to the state log (`<key>.rcd`) the file store keeps a human-readable
//! event log (`<key>.log`). It is only ever appended to.

use super::session::UploadSession;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Current record schema
pub const RECORD_VERSION: u32 = 1;

const STATE_EXTENSION: &str = "rcd";
const EVENT_EXTENSION: &str = "log";

/// Bytes read per step while scanning a state log backward
const SCAN_WINDOW: u64 = 64 * 1024;

/// Record errors
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("Record IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl RecordError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        RecordError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Identifies the persisted state of one local file.
///
/// Derived from the canonical path and the file size, so the same file
/// uploaded from a different working directory maps to the same record,
/// while a file that changed size does not.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey(String);

impl SessionKey {
    /// Derive the key for `path` with `file_size` bytes
    pub fn derive(path: &Path, file_size: u64) -> Self {
        let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());

        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string_lossy().as_bytes());
        hasher.update(file_size.to_be_bytes());
        let digest = hex::encode(hasher.finalize());

        let basename = canonical
            .file_name()
            .map(|name| sanitize(&name.to_string_lossy()))
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "upload".to_string());

        Self(format!("{}-{}", basename, &digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// One line of the state log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeRecord {
    pub version: u32,
    pub written_at: DateTime<Utc>,
    pub session: UploadSession,
}

impl ResumeRecord {
    pub fn new(session: UploadSession) -> Self {
        Self {
            version: RECORD_VERSION,
            written_at: Utc::now(),
            session,
        }
    }
}

/// Severity of an event log line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLevel::Info => "INFO",
            EventLevel::Warn => "WARN",
            EventLevel::Error => "ERROR",
        }
    }
}

/// Durable storage for upload progress
pub trait ResumeStore: Send + Sync {
    /// Last valid snapshot for `key`. Missing or unreadable state is `None`.
    fn load(&self, key: &SessionKey) -> Result<Option<UploadSession>, RecordError>;

    /// Append a snapshot. The line is complete once this returns.
    fn append(&self, key: &SessionKey, session: &UploadSession) -> Result<(), RecordError>;

    /// Drop all state for `key`. Failures are logged, never returned.
    fn clear(&self, key: &SessionKey);

    /// Note a human-readable event
    fn event(&self, _key: &SessionKey, _level: EventLevel, _message: &str) {}
}

/// Resume store backed by files in one directory
pub struct FileResumeStore {
    dir: PathBuf,
    sync_writes: bool,
    write_lock: Mutex<()>,
}

impl FileResumeStore {
    pub fn new(dir: impl Into<PathBuf>, sync_writes: bool) -> Self {
        Self {
            dir: dir.into(),
            sync_writes,
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the state log for `key`
    pub fn state_path(&self, key: &SessionKey) -> PathBuf {
        self.dir
            .join(format!("{}.{}", key.as_str(), STATE_EXTENSION))
    }

    /// Path of the event log for `key`
    pub fn event_path(&self, key: &SessionKey) -> PathBuf {
        self.dir
            .join(format!("{}.{}", key.as_str(), EVENT_EXTENSION))
    }

    fn append_line(&self, path: &Path, line: &[u8], sync: bool) -> Result<(), RecordError> {
        let _guard = self.write_lock.lock();

        fs::create_dir_all(&self.dir).map_err(|e| RecordError::io(&self.dir, e))?;

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .map_err(|e| RecordError::io(path, e))?;

        // A torn last line must not swallow the next entry
        let torn = ends_torn(&mut file).map_err(|e| RecordError::io(path, e))?;
        if torn {
            file.write_all(b"\n").map_err(|e| RecordError::io(path, e))?;
        }

        file.write_all(line).map_err(|e| RecordError::io(path, e))?;

        if sync {
            file.sync_data().map_err(|e| RecordError::io(path, e))?;
        }

        Ok(())
    }
}

impl ResumeStore for FileResumeStore {
    fn load(&self, key: &SessionKey) -> Result<Option<UploadSession>, RecordError> {
        let path = self.state_path(key);

        let mut file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(RecordError::io(&path, e)),
        };

        last_valid_session(&mut file, &path).map_err(|e| RecordError::io(&path, e))
    }

    fn append(&self, key: &SessionKey, session: &UploadSession) -> Result<(), RecordError> {
        let mut line = serde_json::to_vec(&ResumeRecord::new(session.clone()))?;
        line.push(b'\n');
        self.append_line(&self.state_path(key), &line, self.sync_writes)
    }

    fn clear(&self, key: &SessionKey) {
        let _guard = self.write_lock.lock();

        for path in [self.state_path(key), self.event_path(key)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to remove resume record"
                    );
                }
            }
        }
    }

    fn event(&self, key: &SessionKey, level: EventLevel, message: &str) {
        let line = format!(
            "{} {} {}\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            level.as_str(),
            message
        );

        if let Err(e) = self.append_line(&self.event_path(key), line.as_bytes(), false) {
            tracing::debug!(error = %e, "Failed to write upload event");
        }
    }
}

fn ends_torn(file: &mut fs::File) -> std::io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

/// Scan the log backward from its end and return the newest snapshot that
/// parses and carries the current schema version. Only the tail up to that
/// snapshot is read.
fn last_valid_session<R: Read + Seek>(
    log: &mut R,
    path: &Path,
) -> std::io::Result<Option<UploadSession>> {
    let mut pos = log.seek(SeekFrom::End(0))?;
    let mut pending: Vec<u8> = Vec::new();
    let mut skipped = 0usize;

    while pos > 0 {
        let start = pos.saturating_sub(SCAN_WINDOW);
        let mut window = vec![0u8; (pos - start) as usize];
        log.seek(SeekFrom::Start(start))?;
        log.read_exact(&mut window)?;
        window.extend_from_slice(&pending);
        pending = window;
        pos = start;

        // Everything after a newline is a complete line
        while let Some(newline) = pending.iter().rposition(|b| *b == b'\n') {
            if let Some(session) = parse_entry(&pending[newline + 1..], path, &mut skipped) {
                return Ok(Some(session));
            }
            pending.truncate(newline);
        }
    }

    let session = parse_entry(&pending, path, &mut skipped);
    if session.is_none() && skipped > 0 {
        tracing::warn!(
            path = %path.display(),
            skipped,
            "No usable resume entry, starting fresh"
        );
    }

    Ok(session)
}

fn parse_entry(line: &[u8], path: &Path, skipped: &mut usize) -> Option<UploadSession> {
    if line.iter().all(|b| b.is_ascii_whitespace()) {
        return None;
    }

    match serde_json::from_slice::<ResumeRecord>(line) {
        Ok(record) if record.version == RECORD_VERSION => {
            if *skipped > 0 {
                tracing::warn!(
                    path = %path.display(),
                    skipped = *skipped,
                    "Skipped unreadable resume entries"
                );
            }
            Some(record.session)
        }
        Ok(record) => {
            tracing::warn!(
                path = %path.display(),
                version = record.version,
                "Ignoring resume entry with unknown version"
            );
            *skipped += 1;
            None
        }
        Err(_) => {
            *skipped += 1;
            None
        }
    }
}

/// Newest snapshot of one key and how many were appended
struct LatestSnapshot {
    session: UploadSession,
    appended: usize,
}

/// In-process resume store
#[derive(Default)]
pub struct MemoryResumeStore {
    sessions: Mutex<HashMap<SessionKey, LatestSnapshot>>,
    events: Mutex<HashMap<SessionKey, Vec<String>>>,
}

impl MemoryResumeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of snapshots appended for `key` since the last clear
    pub fn snapshot_count(&self, key: &SessionKey) -> usize {
        self.sessions
            .lock()
            .get(key)
            .map_or(0, |latest| latest.appended)
    }

    /// Events noted for `key` since the last clear
    pub fn events(&self, key: &SessionKey) -> Vec<String> {
        self.events.lock().get(key).cloned().unwrap_or_default()
    }
}

impl ResumeStore for MemoryResumeStore {
    fn load(&self, key: &SessionKey) -> Result<Option<UploadSession>, RecordError> {
        Ok(self
            .sessions
            .lock()
            .get(key)
            .map(|latest| latest.session.clone()))
    }

    fn append(&self, key: &SessionKey, session: &UploadSession) -> Result<(), RecordError> {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(key) {
            Some(latest) => {
                latest.session = session.clone();
                latest.appended += 1;
            }
            None => {
                sessions.insert(
                    key.clone(),
                    LatestSnapshot {
                        session: session.clone(),
                        appended: 1,
                    },
                );
            }
        }
        Ok(())
    }

    fn clear(&self, key: &SessionKey) {
        self.sessions.lock().remove(key);
        self.events.lock().remove(key);
    }

    fn event(&self, key: &SessionKey, level: EventLevel, message: &str) {
        self.events
            .lock()
            .entry(key.clone())
            .or_default()
            .push(format!("{} {}", level.as_str(), message));
    }
}
