use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, RuntimeError};
use crate::state::{EngineStatus, ExecutionState};

/// Version of the on-disk record layout. Records with another version are
/// rejected on load.
pub const FORMAT_VERSION: u32 = 1;

const SESSION_EXT: &str = "json";

/// A lock file older than this was left behind by a writer that died
/// mid-save and is reclaimed.
pub const STALE_LOCK_AGE: Duration = Duration::from_secs(30);

// ============================================================================
// Record
// ============================================================================

/// A persisted engine: execution state plus bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub format_version: u32,
    /// Bumped on every successful save; a save carrying a stale revision is
    /// refused.
    pub revision: u64,
    pub status: EngineStatus,
    #[serde(flatten)]
    pub state: ExecutionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(state: ExecutionState, status: EngineStatus) -> Self {
        let now = Utc::now();
        Self {
            format_version: FORMAT_VERSION,
            revision: 0,
            status,
            state,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.state.session_id
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| RuntimeError::Serialization(e.to_string()))
    }

    /// Decode and validate a record. Corrupt input, a foreign format version,
    /// and an out-of-range instruction pointer are all serialization errors.
    pub fn from_json(text: &str) -> Result<Self> {
        let raw: Value =
            serde_json::from_str(text).map_err(|e| RuntimeError::Serialization(e.to_string()))?;
        let version = raw.get("formatVersion").and_then(Value::as_u64);
        if version != Some(FORMAT_VERSION as u64) {
            return Err(RuntimeError::Serialization(format!(
                "unsupported session format version {}; expected {}",
                version.map_or_else(|| "<missing>".to_string(), |v| v.to_string()),
                FORMAT_VERSION
            )));
        }
        let record: SessionRecord =
            serde_json::from_value(raw).map_err(|e| RuntimeError::Serialization(e.to_string()))?;
        if record.state.ip > record.state.statements.len() {
            return Err(RuntimeError::Serialization(format!(
                "instruction pointer {} is past the end of {} statements",
                record.state.ip,
                record.state.statements.len()
            )));
        }
        Ok(record)
    }
}

/// One line of `sessions` output.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub session_id: String,
    pub filename: Option<String>,
    pub status: EngineStatus,
    pub messages: usize,
    pub updated_at: DateTime<Utc>,
}

impl From<&SessionRecord> for SessionSummary {
    fn from(record: &SessionRecord) -> Self {
        Self {
            session_id: record.state.session_id.clone(),
            filename: record.state.filename.clone(),
            status: record.status,
            messages: record.state.conversation.len(),
            updated_at: record.updated_at,
        }
    }
}

// ============================================================================
// Store
// ============================================================================

pub trait SessionStore {
    fn load(&self, session_id: &str) -> Result<SessionRecord>;

    /// Persist `record`. On success the record's revision and `updated_at`
    /// are advanced to what was written.
    fn save(&self, record: &mut SessionRecord) -> Result<()>;

    /// All readable sessions, most recently updated first.
    fn list(&self) -> Result<Vec<SessionSummary>>;
}

/// One JSON file per session, `<dir>/<session_id>.json`.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, session_id: &str) -> Result<PathBuf> {
        validate_id(session_id)?;
        Ok(self.dir.join(format!("{}.{}", session_id, SESSION_EXT)))
    }

    fn stored_revision(path: &Path) -> Result<Option<u64>> {
        match fs::read_to_string(path) {
            Ok(text) => {
                let raw: Value = serde_json::from_str(&text)
                    .map_err(|e| RuntimeError::Serialization(e.to_string()))?;
                Ok(Some(raw.get("revision").and_then(Value::as_u64).unwrap_or(0)))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Take `<id>.lock`. The file holds the owner's pid and start time; a lock
    /// older than [`STALE_LOCK_AGE`] is removed and taken over.
    fn lock(&self, session_id: &str) -> Result<LockGuard> {
        let lock_path = self.dir.join(format!("{}.lock", session_id));
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
                Ok(mut file) => {
                    let guard = LockGuard(lock_path);
                    writeln!(file, "{} {}", std::process::id(), Utc::now().to_rfc3339())?;
                    return Ok(guard);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if !is_stale(&lock_path) {
                        break;
                    }
                    tracing::warn!(lock = %lock_path.display(), "removing stale session lock");
                    match fs::remove_file(&lock_path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(RuntimeError::SessionConflict(format!(
            "session '{}' is being saved by another process (lock file {})",
            session_id,
            lock_path.display()
        )))
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self, session_id: &str) -> Result<SessionRecord> {
        let path = self.path_for(session_id)?;
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(RuntimeError::SessionNotFound(session_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        SessionRecord::from_json(&text)
    }

    fn save(&self, record: &mut SessionRecord) -> Result<()> {
        let session_id = record.session_id().to_string();
        let path = self.path_for(&session_id)?;
        fs::create_dir_all(&self.dir)?;

        let _lock = self.lock(&session_id)?;

        let on_disk = Self::stored_revision(&path)?.unwrap_or(0);
        if on_disk != record.revision {
            return Err(RuntimeError::SessionConflict(format!(
                "session '{}' is at revision {} on disk but this copy was loaded at revision {}",
                session_id, on_disk, record.revision
            )));
        }

        let mut next = record.clone();
        next.revision += 1;
        next.updated_at = Utc::now();
        let text = next.to_json()?;

        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", session_id, uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, text)?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        tracing::debug!(session = %session_id, revision = next.revision, "session saved");

        *record = next;
        Ok(())
    }

    fn list(&self) -> Result<Vec<SessionSummary>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut summaries = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SESSION_EXT) {
                continue;
            }
            let Ok(text) = fs::read_to_string(&path) else {
                continue;
            };
            match SessionRecord::from_json(&text) {
                Ok(record) => summaries.push(SessionSummary::from(&record)),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable session")
                }
            }
        }
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }
}

fn is_stale(lock_path: &Path) -> bool {
    fs::metadata(lock_path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age > STALE_LOCK_AGE)
}

struct LockGuard(PathBuf);

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.0);
    }
}

fn validate_id(session_id: &str) -> Result<()> {
    let valid = !session_id.is_empty()
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(RuntimeError::InvalidArgument(format!(
            "invalid session id '{}'",
            session_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dotprompt_common::{Message, Role, Statement, StatementKind};
    use serde_json::json;

    fn record(id: &str) -> SessionRecord {
        let mut state = ExecutionState::new(
            id,
            vec![
                Statement::new(1, StatementKind::UserMsg, "hi"),
                Statement::new(2, StatementKind::Exec, ""),
            ],
        );
        state.ip = 1;
        state.conversation.push(Message::text(Role::User, "hi"));
        state.variables.set("city", json!("Paris")).unwrap();
        SessionRecord::new(state, EngineStatus::Suspended)
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        let mut rec = record("abc-1");
        store.save(&mut rec).unwrap();
        assert_eq!(rec.revision, 1);

        let loaded = store.load("abc-1").unwrap();
        assert_eq!(loaded, rec);
        assert_eq!(loaded.state.ip, 1);
        assert_eq!(loaded.state.variables.get_str("city"), Some("Paris"));
    }

    #[test]
    fn stale_revision_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        let mut first = record("s");
        store.save(&mut first).unwrap();

        let mut a = store.load("s").unwrap();
        let mut b = store.load("s").unwrap();
        store.save(&mut a).unwrap();
        let err = store.save(&mut b).unwrap_err();
        assert!(matches!(err, RuntimeError::SessionConflict(_)));
        assert_eq!(b.revision, 1);
        assert_eq!(store.load("s").unwrap().revision, 2);
    }

    #[test]
    fn held_lock_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        fs::write(dir.path().join("s.lock"), "").unwrap();
        let mut rec = record("s");
        assert!(matches!(
            store.save(&mut rec),
            Err(RuntimeError::SessionConflict(_))
        ));
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        let lock = dir.path().join("s.lock");
        fs::write(&lock, "4242 2026-01-01T00:00:00Z\n").unwrap();
        let old = std::time::SystemTime::now() - STALE_LOCK_AGE * 4;
        fs::File::options()
            .write(true)
            .open(&lock)
            .unwrap()
            .set_modified(old)
            .unwrap();

        let mut rec = record("s");
        store.save(&mut rec).unwrap();
        assert_eq!(rec.revision, 1);
        assert!(!lock.exists());
        assert_eq!(store.load("s").unwrap().revision, 1);
    }

    #[test]
    fn missing_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        assert!(matches!(
            store.load("nope"),
            Err(RuntimeError::SessionNotFound(_))
        ));
    }

    #[test]
    fn corrupt_and_foreign_version_rejected() {
        assert!(matches!(
            SessionRecord::from_json("{not json"),
            Err(RuntimeError::Serialization(_))
        ));

        let mut value = serde_json::to_value(record("x")).unwrap();
        value["formatVersion"] = json!(99);
        assert!(matches!(
            SessionRecord::from_json(&value.to_string()),
            Err(RuntimeError::Serialization(_))
        ));

        let mut value = serde_json::to_value(record("x")).unwrap();
        value["instructionPointer"] = json!(10);
        assert!(matches!(
            SessionRecord::from_json(&value.to_string()),
            Err(RuntimeError::Serialization(_))
        ));
    }

    #[test]
    fn path_traversal_rejected() {
        let store = FileSessionStore::new("/tmp");
        assert!(matches!(
            store.path_for("../etc/passwd"),
            Err(RuntimeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn list_newest_first_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        let mut a = record("a");
        store.save(&mut a).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let mut b = record("b");
        store.save(&mut b).unwrap();
        fs::write(dir.path().join("junk.json"), "garbage").unwrap();

        let ids: Vec<String> = store.list().unwrap().into_iter().map(|s| s.session_id).collect();
        assert_eq!(ids, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn list_missing_dir_is_empty() {
        let store = FileSessionStore::new("/nonexistent/sessions");
        assert!(store.list().unwrap().is_empty());
    }
}
