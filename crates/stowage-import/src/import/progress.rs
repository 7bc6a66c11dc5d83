//! Live progress for a running upload
//!
//! Each upload owns one `watch` channel holding the latest [`Progress`]
//! snapshot. Publishing never blocks the worker; subscribers wake up, read
//! the newest snapshot, and skip anything they already saw. Once a
//! terminal snapshot is published it is never replaced.

use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

/// Lifecycle phase of an upload; only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Starting,
    Reading,
    Validating,
    Inserting,
    Complete,
    Failed,
    Cancelled,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Starting => "starting",
            Phase::Reading => "reading",
            Phase::Validating => "validating",
            Phase::Inserting => "inserting",
            Phase::Complete => "complete",
            Phase::Failed => "failed",
            Phase::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Complete | Phase::Failed | Phase::Cancelled)
    }

    fn rank(&self) -> u8 {
        match self {
            Phase::Starting => 0,
            Phase::Reading => 1,
            Phase::Validating => 2,
            Phase::Inserting => 3,
            Phase::Complete | Phase::Failed | Phase::Cancelled => 4,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<String> for Phase {
    fn from(s: String) -> Self {
        match s.as_str() {
            "reading" => Phase::Reading,
            "validating" => Phase::Validating,
            "inserting" => Phase::Inserting,
            "complete" => Phase::Complete,
            "failed" => Phase::Failed,
            "cancelled" => Phase::Cancelled,
            _ => Phase::Starting,
        }
    }
}

/// Latest known state of an upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub upload_id: Uuid,
    pub phase: Phase,
    pub current_row: u64,
    /// Exact once complete, otherwise estimated from bytes read
    pub total_rows: Option<u64>,
    pub inserted: u64,
    pub skipped: u64,
    pub failed: u64,
    pub bytes_read: u64,
    pub file_name: String,
    pub file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub sequence: u64,
}

impl Progress {
    pub fn new(upload_id: Uuid, file_name: impl Into<String>, file_size: Option<u64>) -> Self {
        Self {
            upload_id,
            phase: Phase::Starting,
            current_row: 0,
            total_rows: None,
            inserted: 0,
            skipped: 0,
            failed: 0,
            bytes_read: 0,
            file_name: file_name.into(),
            file_size,
            error: None,
            sequence: 0,
        }
    }
}

/// Publishing side, owned by the upload handle
#[derive(Debug)]
pub struct ProgressBroadcaster {
    tx: watch::Sender<Progress>,
}

impl ProgressBroadcaster {
    pub fn new(initial: Progress) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Apply `update` to a copy of the current snapshot and publish it.
    ///
    /// Returns `false` when nothing was published: the upload already
    /// reached a terminal phase, or the update changed nothing.
    pub fn update(&self, update: impl FnOnce(&mut Progress)) -> bool {
        self.tx.send_if_modified(|current| {
            if current.phase.is_terminal() {
                return false;
            }

            let mut next = current.clone();
            update(&mut next);
            next.current_row = next.current_row.max(current.current_row);
            if next.phase.rank() < current.phase.rank() {
                next.phase = current.phase;
            }
            next.sequence = current.sequence;
            if next == *current {
                return false;
            }

            next.sequence += 1;
            *current = next;
            true
        })
    }

    pub fn snapshot(&self) -> Progress {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> ProgressSubscription {
        ProgressSubscription::new(self.tx.subscribe(), None)
    }

    /// Subscribe, skipping every snapshot up to and including `last_event_id`.
    pub fn subscribe_after(&self, last_event_id: u64) -> ProgressSubscription {
        ProgressSubscription::new(self.tx.subscribe(), Some(last_event_id))
    }
}

/// One event on the wire; `id` is the snapshot sequence number
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub id: u64,
    pub progress: Progress,
}

impl ProgressEvent {
    pub fn event_name(&self) -> &'static str {
        if self.progress.phase.is_terminal() {
            "complete"
        } else {
            "progress"
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.progress.phase.is_terminal()
    }

    /// Render as a server-sent-events frame.
    pub fn to_sse(&self) -> Result<String, serde_json::Error> {
        let data = serde_json::to_string(&self.progress)?;
        Ok(format!(
            "id: {}\nevent: {}\ndata: {}\n\n",
            self.id,
            self.event_name(),
            data
        ))
    }
}

/// Receiving side; yields each new snapshot once and ends after the
/// terminal one.
#[derive(Debug)]
pub struct ProgressSubscription {
    rx: watch::Receiver<Progress>,
    last_seen: Option<u64>,
    done: bool,
}

impl ProgressSubscription {
    fn new(rx: watch::Receiver<Progress>, last_seen: Option<u64>) -> Self {
        Self {
            rx,
            last_seen,
            done: false,
        }
    }

    fn unseen(&self, progress: &Progress) -> bool {
        self.last_seen.is_none_or(|seen| progress.sequence > seen)
    }

    fn emit(&mut self, progress: Progress) -> ProgressEvent {
        self.last_seen = Some(progress.sequence);
        self.done = progress.phase.is_terminal();
        ProgressEvent {
            id: progress.sequence,
            progress,
        }
    }

    /// Wait for the next unseen snapshot. `None` once the terminal
    /// snapshot has been delivered or the upload was dropped.
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        if self.done {
            return None;
        }

        loop {
            let current = self.rx.borrow_and_update().clone();
            if self.unseen(&current) {
                return Some(self.emit(current));
            }
            if current.phase.is_terminal() {
                self.done = true;
                return None;
            }

            if self.rx.changed().await.is_err() {
                let last = self.rx.borrow().clone();
                self.done = true;
                return self.unseen(&last).then(|| self.emit(last));
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> + Send {
        stream::unfold(self, |mut subscription| async move {
            subscription
                .next()
                .await
                .map(|event| (event, subscription))
        })
    }
}
