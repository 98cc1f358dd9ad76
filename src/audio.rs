//! Transient audio clips.
//!
//! Generated speech is registered as a short-lived clip (served at `/api/v1/audio/{id}`
//! while alive) and handed to an `AudioPlayer`. The `ClipLease` returned by the registry
//! releases the clip when dropped, so release happens exactly once whether playback
//! finishes, fails, or the playing task is aborted.

use std::{
  collections::HashMap,
  sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

pub const MPEG_MIME: &str = "audio/mpeg";

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
  #[error("no audio to play")]
  Empty,
  #[error("audio delivery failed: {0}")]
  Delivery(String),
}

#[derive(Debug)]
pub struct AudioClip {
  pub id: Uuid,
  pub mime: &'static str,
  pub bytes: Vec<u8>,
}

impl AudioClip {
  pub fn url(&self) -> String {
    format!("/api/v1/audio/{}", self.id)
  }
}

/// Live clips by id. Cloning shares the same registry.
#[derive(Clone, Default)]
pub struct ClipRegistry {
  clips: Arc<Mutex<HashMap<Uuid, Arc<AudioClip>>>>,
}

impl ClipRegistry {
  fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<AudioClip>>> {
    self.clips.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  pub fn lease(&self, bytes: Vec<u8>, mime: &'static str) -> ClipLease {
    let clip = Arc::new(AudioClip { id: Uuid::new_v4(), mime, bytes });
    self.lock().insert(clip.id, clip.clone());
    debug!(target: "habla_backend", clip_id = %clip.id, bytes = clip.bytes.len(), "Audio clip registered");
    ClipLease { registry: self.clone(), clip }
  }

  pub fn get(&self, id: &Uuid) -> Option<Arc<AudioClip>> {
    self.lock().get(id).cloned()
  }

  pub fn live(&self) -> usize {
    self.lock().len()
  }

  fn release(&self, id: &Uuid) {
    if self.lock().remove(id).is_some() {
      debug!(target: "habla_backend", clip_id = %id, "Audio clip released");
    }
  }
}

/// Keeps a clip registered until dropped.
pub struct ClipLease {
  registry: ClipRegistry,
  clip: Arc<AudioClip>,
}

impl ClipLease {
  pub fn clip(&self) -> &AudioClip {
    &self.clip
  }
}

impl Drop for ClipLease {
  fn drop(&mut self) {
    self.registry.release(&self.clip.id);
  }
}

/// Something that plays (or delivers for playback) a registered clip.
#[async_trait]
pub trait AudioPlayer: Send + Sync {
  async fn play(&self, clip: &AudioClip) -> Result<(), AudioError>;
}

/// Register `bytes`, play them, release the clip. Release also happens if this future is dropped.
pub async fn play_audio(
  registry: &ClipRegistry,
  bytes: Vec<u8>,
  player: &dyn AudioPlayer,
) -> Result<(), AudioError> {
  if bytes.is_empty() {
    return Err(AudioError::Empty);
  }
  let lease = registry.lease(bytes, MPEG_MIME);
  let result = player.play(lease.clip()).await;
  if let Err(e) = &result {
    warn!(target: "habla_backend", clip_id = %lease.clip().id, error = %e, "Audio playback failed");
  }
  result
}
