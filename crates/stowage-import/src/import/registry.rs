//! In-flight and recently finished uploads

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::progress::{Progress, ProgressBroadcaster, ProgressSubscription};
use super::types::UploadReport;
use crate::error::{ImportError, ImportResult};

/// Shared state of one upload
#[derive(Debug)]
pub struct UploadHandle {
    pub id: Uuid,
    pub table_key: String,
    pub file_name: String,
    cancel: CancellationToken,
    progress: ProgressBroadcaster,
    result: Mutex<Option<UploadReport>>,
    finished_at: Mutex<Option<Instant>>,
}

impl UploadHandle {
    fn new(id: Uuid, table_key: String, file_name: String, file_size: Option<u64>) -> Self {
        let progress = ProgressBroadcaster::new(Progress::new(id, file_name.clone(), file_size));
        Self {
            id,
            table_key,
            file_name,
            cancel: CancellationToken::new(),
            progress,
            result: Mutex::new(None),
            finished_at: Mutex::new(None),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn progress(&self) -> &ProgressBroadcaster {
        &self.progress
    }

    pub fn subscribe(&self) -> ProgressSubscription {
        self.progress.subscribe()
    }

    pub fn result(&self) -> Option<UploadReport> {
        lock(&self.result).clone()
    }

    pub fn is_finished(&self) -> bool {
        lock(&self.finished_at).is_some()
    }

    /// Store the final report, then publish the terminal snapshot so that
    /// anyone woken by it can read the report.
    pub fn finish(&self, report: UploadReport) {
        let terminal = report.clone();
        *lock(&self.result) = Some(report);
        *lock(&self.finished_at) = Some(Instant::now());

        self.progress.update(|p| {
            p.phase = terminal.phase;
            p.current_row = terminal.total_rows;
            p.total_rows = Some(terminal.total_rows);
            p.inserted = terminal.inserted;
            p.skipped = terminal.skipped;
            p.failed = terminal.failed;
            p.error = terminal.error.clone();
        });
    }

    fn expired(&self, retention: Duration, now: Instant) -> bool {
        lock(&self.finished_at).is_some_and(|at| now.duration_since(at) >= retention)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Registry of uploads, bounded by a concurrency limit
#[derive(Debug)]
pub struct UploadRegistry {
    uploads: Mutex<HashMap<Uuid, Arc<UploadHandle>>>,
    slots: Arc<Semaphore>,
    retention: Duration,
}

impl UploadRegistry {
    pub fn new(max_concurrent: usize, retention: Duration) -> Self {
        Self {
            uploads: Mutex::new(HashMap::new()),
            slots: Arc::new(Semaphore::new(max_concurrent)),
            retention,
        }
    }

    /// Claim a slot and register a new upload. Fails with `Busy` at once
    /// when every slot is taken. The permit must live as long as the
    /// upload task.
    pub fn register(
        &self,
        table_key: &str,
        file_name: &str,
        file_size: Option<u64>,
    ) -> ImportResult<(Arc<UploadHandle>, OwnedSemaphorePermit)> {
        let permit = self
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| ImportError::Busy)?;

        let handle = Arc::new(UploadHandle::new(
            Uuid::new_v4(),
            table_key.to_string(),
            file_name.to_string(),
            file_size,
        ));

        let mut uploads = lock(&self.uploads);
        Self::sweep_locked(&mut uploads, self.retention);
        uploads.insert(handle.id, handle.clone());

        debug!(upload_id = %handle.id, table_key, "Registered upload");
        Ok((handle, permit))
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<UploadHandle>> {
        let mut uploads = lock(&self.uploads);
        Self::sweep_locked(&mut uploads, self.retention);
        uploads.get(&id).cloned()
    }

    pub fn cancel(&self, id: Uuid) -> ImportResult<()> {
        let handle = self.get(id).ok_or(ImportError::NotFound(id))?;
        if !handle.is_finished() {
            info!(upload_id = %id, "Cancelling upload");
            handle.cancel.cancel();
        }
        Ok(())
    }

    /// Uploads currently holding a slot
    pub fn active_count(&self) -> usize {
        lock(&self.uploads)
            .values()
            .filter(|h| !h.is_finished())
            .count()
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Drop finished uploads older than the retention window.
    pub fn sweep_expired(&self) -> usize {
        Self::sweep_locked(&mut lock(&self.uploads), self.retention)
    }

    fn sweep_locked(uploads: &mut HashMap<Uuid, Arc<UploadHandle>>, retention: Duration) -> usize {
        let now = Instant::now();
        let before = uploads.len();
        uploads.retain(|_, handle| !handle.expired(retention, now));
        let removed = before - uploads.len();
        if removed > 0 {
            debug!(removed, "Swept expired uploads");
        }
        removed
    }
}
