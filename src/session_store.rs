//! Capture session store
//!
//! ## Responsibilities
//!
//! - Time-boxed, quota-bounded windows during which frames from one
//!   camera are copied into the labeled dataset
//! - Persist sessions to a JSON document shared with an external
//!   labeling workflow (separate process)
//! - Serialize every read-modify-write so concurrent in-process callers
//!   cannot lose updates; rewrite the document atomically so external
//!   readers never observe a torn file

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;

use crate::error::Result;

pub const DEFAULT_TTL_SEC: u64 = 10;
pub const DEFAULT_MAX_IMAGES: u32 = 50;

/// One capture session, keyed by `"{category}:{camera_ip}"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSession {
    pub category: String,
    pub camera_ip: String,
    pub base_name: String,
    pub ttl_sec: u64,
    pub max_images: u32,
    pub count: u32,
    /// Unix timestamp in seconds.
    pub last_updated: f64,
}

impl CaptureSession {
    /// Active while under quota and touched within the ttl window.
    fn is_active_at(&self, now: f64) -> bool {
        self.count < self.max_images && now - self.last_updated <= self.ttl_sec as f64
    }
}

/// Persisted capture-session map plus the dataset write path.
pub struct CaptureSessionStore {
    sessions_file: PathBuf,
    data_dir: PathBuf,
    /// Serializes every read-modify-write on the shared document.
    lock: Mutex<()>,
}

impl CaptureSessionStore {
    pub fn new(sessions_file: PathBuf, data_dir: PathBuf) -> Self {
        Self {
            sessions_file,
            data_dir,
            lock: Mutex::new(()),
        }
    }

    fn key(category: &str, camera_ip: &str) -> String {
        format!("{}:{}", category, camera_ip)
    }

    fn now() -> f64 {
        Utc::now().timestamp_micros() as f64 / 1e6
    }

    /// A corrupt or missing document is an empty one, never an error.
    async fn load(&self) -> HashMap<String, CaptureSession> {
        match fs::read(&self.sessions_file).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Session document unreadable, treating as empty");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        }
    }

    async fn save(&self, sessions: &HashMap<String, CaptureSession>) -> Result<()> {
        if let Some(parent) = self.sessions_file.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = self.sessions_file.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(sessions)?).await?;
        // Rename is atomic: external readers see old or new, never torn.
        fs::rename(&tmp, &self.sessions_file).await?;
        Ok(())
    }

    /// Start (or silently reset) the session for a category+camera key.
    pub async fn start_session(
        &self,
        category: &str,
        camera_ip: &str,
        base_name: &str,
        ttl_sec: u64,
        max_images: u32,
    ) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut sessions = self.load().await;
        sessions.insert(
            Self::key(category, camera_ip),
            CaptureSession {
                category: category.to_string(),
                camera_ip: camera_ip.to_string(),
                base_name: base_name.to_string(),
                ttl_sec,
                max_images,
                count: 0,
                last_updated: Self::now(),
            },
        );
        self.save(&sessions).await?;
        tracing::info!(
            category = %category,
            camera_ip = %camera_ip,
            base_name = %base_name,
            ttl_sec = ttl_sec,
            max_images = max_images,
            "Capture session started"
        );
        Ok(())
    }

    /// Whether the session exists, is under quota, and within its ttl.
    pub async fn is_active(&self, category: &str, camera_ip: &str) -> bool {
        let _guard = self.lock.lock().await;
        let sessions = self.load().await;
        sessions
            .get(&Self::key(category, camera_ip))
            .map(|s| s.is_active_at(Self::now()))
            .unwrap_or(false)
    }

    /// Extend the window without resetting the image count. No-op for
    /// unknown keys.
    pub async fn touch(&self, category: &str, camera_ip: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut sessions = self.load().await;
        if let Some(session) = sessions.get_mut(&Self::key(category, camera_ip)) {
            session.last_updated = Self::now();
            self.save(&sessions).await?;
        }
        Ok(())
    }

    /// Copy an image into the known dataset under the session's subject
    /// directory. Returns false (and copies nothing) unless the session
    /// is active; filesystem failures also answer false.
    pub async fn append_image(&self, category: &str, camera_ip: &str, source_path: &Path) -> bool {
        let _guard = self.lock.lock().await;
        let mut sessions = self.load().await;
        let key = Self::key(category, camera_ip);
        let Some(session) = sessions.get_mut(&key) else {
            return false;
        };
        if !session.is_active_at(Self::now()) {
            return false;
        }

        let count = session.count + 1;
        let dest = dataset_path(&self.data_dir, session, count);
        if let Some(parent) = dest.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                tracing::debug!(error = %e, "Failed to create dataset directory");
                return false;
            }
        }
        if let Err(e) = fs::copy(source_path, &dest).await {
            tracing::debug!(
                source = %source_path.display(),
                dest = %dest.display(),
                error = %e,
                "Failed to copy image into dataset"
            );
            return false;
        }

        session.count = count;
        session.last_updated = Self::now();
        if let Err(e) = self.save(&sessions).await {
            tracing::warn!(error = %e, "Failed to persist session update");
            return false;
        }

        tracing::debug!(
            category = %category,
            camera_ip = %camera_ip,
            count = count,
            dest = %dest.display(),
            "Image appended to dataset"
        );
        true
    }
}

/// `{data_dir}/{category}/known/{subject}/{stem}_{NNN}.{ext}` where
/// `subject` is the first underscore-delimited token of the stem.
fn dataset_path(data_dir: &Path, session: &CaptureSession, count: u32) -> PathBuf {
    let (stem, ext) = match session.base_name.rsplit_once('.') {
        Some((stem, ext)) => (stem, ext),
        None => (session.base_name.as_str(), "png"),
    };
    let subject = stem.split('_').next().unwrap_or(stem);
    data_dir
        .join(&session.category)
        .join("known")
        .join(subject)
        .join(format!("{}_{:03}.{}", stem, count, ext))
}
