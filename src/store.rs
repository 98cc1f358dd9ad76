//! Completed-lesson persistence.
//!
//! A string key-value backend (`KeyValueStore`) holds one JSON object under
//! `completed_lessons`: `{ "<lessonId>": "<ISO-8601 timestamp>", ... }`.
//! `CompletionStore` fails soft: unreadable or corrupt data reads as "nothing completed",
//! and a missing backend turns every operation into a no-op.

use std::{
  collections::{BTreeMap, HashMap},
  io::Write,
  path::PathBuf,
  sync::{Arc, Mutex},
};

use chrono::{SecondsFormat, Utc};
use tracing::{debug, error, instrument};

pub const COMPLETED_LESSONS_KEY: &str = "completed_lessons";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  #[error("storage I/O error: {0}")]
  Io(#[from] std::io::Error),
  #[error("invalid storage key: {0}")]
  InvalidKey(String),
  #[error("storage lock poisoned")]
  Poisoned,
}

/// String-keyed storage with get/set semantics.
pub trait KeyValueStore: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
  fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// One file per key under a data directory.
pub struct FileKeyValueStore {
  dir: PathBuf,
  // serializes writers inside this process; other processes still race (last write wins)
  write_lock: Mutex<()>,
}

impl FileKeyValueStore {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self { dir: dir.into(), write_lock: Mutex::new(()) }
  }

  fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
    let valid = !key.is_empty()
      && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
      return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(self.dir.join(format!("{}.json", key)))
  }
}

impl KeyValueStore for FileKeyValueStore {
  fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
    let path = self.path_for(key)?;
    match std::fs::read_to_string(&path) {
      Ok(s) => Ok(Some(s)),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(e.into()),
    }
  }

  fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
    let path = self.path_for(key)?;
    let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
    std::fs::create_dir_all(&self.dir)?;
    let tmp = path.with_extension("json.tmp");
    {
      let mut f = std::fs::File::create(&tmp)?;
      f.write_all(value.as_bytes())?;
      f.sync_all()?;
    }
    std::fs::rename(&tmp, &path)?;
    Ok(())
  }
}

#[derive(Default)]
pub struct MemoryKeyValueStore {
  entries: Mutex<HashMap<String, String>>,
}

impl KeyValueStore for MemoryKeyValueStore {
  fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
    let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
    Ok(entries.get(key).cloned())
  }

  fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
    let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
    entries.insert(key.to_string(), value.to_string());
    Ok(())
  }
}

/// Lesson id -> completion timestamp, over an optional durable backend.
///
/// Clones share the backend and the merge lock, so concurrent saves in one process never
/// drop each other's entries.
#[derive(Clone)]
pub struct CompletionStore {
  backend: Option<Arc<dyn KeyValueStore>>,
  merge_lock: Arc<Mutex<()>>,
}

impl CompletionStore {
  pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
    Self { backend: Some(backend), merge_lock: Arc::default() }
  }

  /// No durable storage: reads are empty, writes are dropped.
  pub fn unavailable() -> Self {
    Self { backend: None, merge_lock: Arc::default() }
  }

  pub fn is_durable(&self) -> bool {
    self.backend.is_some()
  }

  #[instrument(level = "debug", skip(self))]
  pub fn get_completed_lessons(&self) -> BTreeMap<String, String> {
    let Some(backend) = &self.backend else { return BTreeMap::new() };
    let raw = match backend.get(COMPLETED_LESSONS_KEY) {
      Ok(Some(raw)) => raw,
      Ok(None) => return BTreeMap::new(),
      Err(e) => {
        error!(target: "lesson", error = %e, "Error getting completed lessons");
        return BTreeMap::new();
      }
    };
    match serde_json::from_str::<BTreeMap<String, String>>(&raw) {
      Ok(map) => map,
      Err(e) => {
        error!(target: "lesson", error = %e, "Stored completed lessons are malformed; treating as empty");
        BTreeMap::new()
      }
    }
  }

  /// Merge `{lesson_id: now}` into the stored mapping and write it back. Returns the timestamp.
  #[instrument(level = "info", skip(self))]
  pub fn save_completed_lesson(&self, lesson_id: &str) -> Option<String> {
    let backend = self.backend.as_ref()?;
    // read-merge-write as one step
    let _guard = self.merge_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut completed = self.get_completed_lessons();
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    completed.insert(lesson_id.to_string(), now.clone());

    let encoded = match serde_json::to_string(&completed) {
      Ok(s) => s,
      Err(e) => {
        error!(target: "lesson", error = %e, "Error encoding completed lessons");
        return None;
      }
    };
    match backend.set(COMPLETED_LESSONS_KEY, &encoded) {
      Ok(()) => {
        debug!(target: "lesson", %lesson_id, completed_at = %now, "Saved completed lesson");
        Some(now)
      }
      Err(e) => {
        error!(target: "lesson", %lesson_id, error = %e, "Error saving completed lesson");
        None
      }
    }
  }

  pub fn is_lesson_completed(&self, lesson_id: &str) -> bool {
    self.get_completed_lessons().get(lesson_id).is_some_and(|ts| !ts.is_empty())
  }
}
