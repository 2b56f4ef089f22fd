//! Update offset cursor ("next update_id to request").
//!
//! The cursor only moves forward. It is advanced after an update has been
//! handed to the queue and persisted in batches through an [`OffsetStore`].

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{domain::UpdateId, errors::Error, Result};

/// Where the cursor survives restarts.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    async fn load(&self) -> Result<Option<i64>>;
    async fn save(&self, cursor: i64) -> Result<()>;
}

/// Persists the cursor as a single decimal integer.
#[derive(Clone, Debug)]
pub struct FileOffsetStore {
    path: PathBuf,
}

impl FileOffsetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl OffsetStore for FileOffsetStore {
    async fn load(&self) -> Result<Option<i64>> {
        let txt = match tokio::fs::read_to_string(&self.path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        };
        let trimmed = txt.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        trimmed.parse::<i64>().map(Some).map_err(|_| {
            Error::Config(format!(
                "offset file {} does not contain an integer",
                self.path.display()
            ))
        })
    }

    async fn save(&self, cursor: i64) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir).await?;
            }
        }
        // Write-then-rename so a crash never leaves a torn file behind.
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, format!("{cursor}\n")).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// In-memory store, mostly for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryOffsetStore {
    value: std::sync::Mutex<Option<i64>>,
    saves: AtomicI64,
}

impl MemoryOffsetStore {
    pub fn with_value(cursor: i64) -> Self {
        Self {
            value: std::sync::Mutex::new(Some(cursor)),
            saves: AtomicI64::new(0),
        }
    }

    pub fn value(&self) -> Option<i64> {
        self.value.lock().map(|v| *v).unwrap_or(None)
    }

    pub fn save_count(&self) -> i64 {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OffsetStore for MemoryOffsetStore {
    async fn load(&self) -> Result<Option<i64>> {
        Ok(self.value())
    }

    async fn save(&self, cursor: i64) -> Result<()> {
        let mut guard = self
            .value
            .lock()
            .map_err(|_| Error::External("offset store poisoned".to_string()))?;
        *guard = Some(cursor);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Single-writer cursor with lock-free reads.
pub struct OffsetTracker {
    cursor: AtomicI64,
    persisted: Mutex<i64>,
    store: Option<Arc<dyn OffsetStore>>,
}

impl OffsetTracker {
    /// Tracker without persistence, starting at `cursor`.
    pub fn new(cursor: i64) -> Self {
        Self {
            cursor: AtomicI64::new(cursor),
            persisted: Mutex::new(cursor),
            store: None,
        }
    }

    /// Tracker that starts from the persisted value (0 when nothing was saved yet).
    pub async fn restore(store: Arc<dyn OffsetStore>) -> Result<Self> {
        let cursor = store.load().await?.unwrap_or(0).max(0);
        tracing::info!(cursor, "offset cursor restored");
        Ok(Self {
            cursor: AtomicI64::new(cursor),
            persisted: Mutex::new(cursor),
            store: Some(store),
        })
    }

    pub fn next_cursor(&self) -> i64 {
        self.cursor.load(Ordering::Acquire)
    }

    /// Acknowledge `update_id`. Returns `true` if the cursor moved.
    ///
    /// Out-of-order calls are no-ops: `advance(5)` then `advance(3)` leaves 6.
    pub fn advance(&self, update_id: UpdateId) -> bool {
        let next = update_id.0.saturating_add(1);
        let prev = self.cursor.fetch_max(next, Ordering::AcqRel);
        next > prev
    }

    /// `true` if `update_id` was already acknowledged.
    pub fn is_acknowledged(&self, update_id: UpdateId) -> bool {
        update_id.0 < self.next_cursor()
    }

    /// Persist the cursor if it moved since the last flush.
    pub async fn flush(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let mut persisted = self.persisted.lock().await;
        let current = self.next_cursor();
        if current == *persisted {
            return Ok(());
        }
        store.save(current).await?;
        *persisted = current;
        tracing::debug!(cursor = current, "offset cursor persisted");
        Ok(())
    }
}

impl std::fmt::Debug for OffsetTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffsetTracker")
            .field("cursor", &self.next_cursor())
            .field("persistent", &self.store.is_some())
            .finish()
    }
}
