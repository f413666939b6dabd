use crate::task::TaskSnapshot;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEventKind {
    Snapshot { snapshot: TaskSnapshot },
    Removed,
    HistoryWriteFailed { message: String },
}

/// A change notification for the interactive side. `seq` grows by one per
/// published event, so a consumer can tell when it missed some.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskEvent {
    pub seq: u64,
    pub task_id: String,
    #[serde(flatten)]
    pub kind: TaskEventKind,
}

impl TaskEvent {
    pub fn snapshot(&self) -> Option<&TaskSnapshot> {
        match &self.kind {
            TaskEventKind::Snapshot { snapshot } => Some(snapshot),
            _ => None,
        }
    }
}

/// Non-blocking hand-off from the runner to one subscriber.
///
/// A full channel drops the event and a gone subscriber makes publishing a
/// no-op; the queue itself stays the source of truth.
#[derive(Debug, Default)]
pub struct ProgressRelay {
    sender: Mutex<Option<SyncSender<TaskEvent>>>,
    seq: AtomicU64,
    dropped: AtomicU64,
}

impl ProgressRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any previous subscriber.
    pub fn subscribe(&self, capacity: usize) -> Receiver<TaskEvent> {
        let (tx, rx) = sync_channel(capacity.max(1));
        *self.sender.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    pub fn publish(&self, task_id: &str, kind: TaskEventKind) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = sender.as_ref() else {
            return;
        };
        let event = TaskEvent {
            seq,
            task_id: task_id.to_string(),
            kind,
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => {
                *sender = None;
            }
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn last_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }
}
