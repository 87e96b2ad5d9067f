//! Sequential, priority-ordered update queue.
//!
//! Used as the transport for updates when versioning is disabled. Jobs run one
//! at a time through a caller-supplied executor; a failing job is retried up to
//! its `max_retries` and then dropped and reported.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use versync_core::{StateValue, UpdateId};

use crate::events::{Event, EventBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

pub const DEFAULT_MAX_RETRIES: u32 = 3;

type SuccessHook = Box<dyn FnOnce(UpdateId) + Send>;
type ErrorHook = Box<dyn FnOnce(UpdateId, &str) + Send>;

pub struct QueuedUpdate {
    pub key: String,
    pub kind: String,
    pub source: String,
    pub payload: StateValue,
    pub priority: UpdatePriority,
    pub max_retries: u32,
    on_success: Option<SuccessHook>,
    on_error: Option<ErrorHook>,
}

impl fmt::Debug for QueuedUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedUpdate")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("source", &self.source)
            .field("priority", &self.priority)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl QueuedUpdate {
    pub fn new(
        key: impl Into<String>,
        kind: impl Into<String>,
        source: impl Into<String>,
        payload: StateValue,
    ) -> Self {
        Self {
            key: key.into(),
            kind: kind.into(),
            source: source.into(),
            payload,
            priority: UpdatePriority::Normal,
            max_retries: DEFAULT_MAX_RETRIES,
            on_success: None,
            on_error: None,
        }
    }

    pub fn with_priority(mut self, priority: UpdatePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn on_success(mut self, hook: impl FnOnce(UpdateId) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(hook));
        self
    }

    pub fn on_error(mut self, hook: impl FnOnce(UpdateId, &str) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(hook));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueEventKind {
    Enqueued,
    Success,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Enqueued {
        id: UpdateId,
        priority: UpdatePriority,
    },
    Success {
        id: UpdateId,
        attempts: u32,
    },
    /// The job exhausted its retries and was dropped.
    Error {
        id: UpdateId,
        error: String,
        attempts: u32,
    },
    Cancelled {
        id: UpdateId,
    },
}

impl Event for QueueEvent {
    type Kind = QueueEventKind;

    fn kind(&self) -> QueueEventKind {
        match self {
            Self::Enqueued { .. } => QueueEventKind::Enqueued,
            Self::Success { .. } => QueueEventKind::Success,
            Self::Error { .. } => QueueEventKind::Error,
            Self::Cancelled { .. } => QueueEventKind::Cancelled,
        }
    }
}

/// What happened to the job handled by one `process_next` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded { id: UpdateId },
    Retrying { id: UpdateId, attempt: u32 },
    DeadLettered { id: UpdateId, error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub current_queue_size: usize,
    pub processed: u64,
    pub failed: u64,
    pub retried: u64,
    pub cancelled: u64,
    pub paused: bool,
}

struct QueueEntry {
    id: UpdateId,
    attempts: u32,
    update: QueuedUpdate,
}

#[derive(Default)]
pub struct UpdateQueue {
    entries: VecDeque<QueueEntry>,
    paused: bool,
    stats: QueueStats,
    events: EventBus<QueueEvent>,
}

impl UpdateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &EventBus<QueueEvent> {
        &self.events
    }

    pub fn enqueue(&mut self, update: QueuedUpdate) -> UpdateId {
        let id = UpdateId::new();
        let priority = update.priority;
        self.insert(QueueEntry {
            id,
            attempts: 0,
            update,
        });
        debug!(%id, ?priority, "update enqueued");
        self.events.emit(&QueueEvent::Enqueued { id, priority });
        id
    }

    /// Higher priority first; FIFO within a priority.
    fn insert(&mut self, entry: QueueEntry) {
        let priority = entry.update.priority;
        let position = self
            .entries
            .iter()
            .position(|e| e.update.priority < priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(position, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Remove one queued job without running it.
    pub fn cancel(&mut self, id: UpdateId) -> bool {
        let Some(position) = self.entries.iter().position(|e| e.id == id) else {
            return false;
        };
        self.entries.remove(position);
        self.stats.cancelled += 1;
        self.events.emit(&QueueEvent::Cancelled { id });
        true
    }

    /// Drop every queued job. Returns how many were removed.
    pub fn clear(&mut self) -> usize {
        let drained: Vec<QueueEntry> = self.entries.drain(..).collect();
        for entry in &drained {
            self.events.emit(&QueueEvent::Cancelled { id: entry.id });
        }
        self.stats.cancelled += drained.len() as u64;
        drained.len()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            current_queue_size: self.entries.len(),
            paused: self.paused,
            ..self.stats
        }
    }

    /// Run the next job. Returns `None` when paused or empty.
    pub fn process_next<F, E>(&mut self, execute: F) -> Option<JobOutcome>
    where
        F: FnOnce(&QueuedUpdate) -> Result<(), E>,
        E: fmt::Display,
    {
        if self.paused {
            return None;
        }
        let mut entry = self.entries.pop_front()?;
        entry.attempts += 1;
        let id = entry.id;

        match execute(&entry.update) {
            Ok(()) => {
                self.stats.processed += 1;
                if let Some(hook) = entry.update.on_success.take() {
                    hook(id);
                }
                self.events.emit(&QueueEvent::Success {
                    id,
                    attempts: entry.attempts,
                });
                Some(JobOutcome::Succeeded { id })
            }
            Err(e) if entry.attempts <= entry.update.max_retries => {
                let attempt = entry.attempts;
                debug!(%id, attempt, error = %e, "update failed; retrying");
                self.stats.retried += 1;
                self.insert(entry);
                Some(JobOutcome::Retrying { id, attempt })
            }
            Err(e) => {
                let error = e.to_string();
                warn!(%id, attempts = entry.attempts, %error, "update dropped after exhausting retries");
                self.stats.failed += 1;
                if let Some(hook) = entry.update.on_error.take() {
                    hook(id, &error);
                }
                self.events.emit(&QueueEvent::Error {
                    id,
                    error: error.clone(),
                    attempts: entry.attempts,
                });
                Some(JobOutcome::DeadLettered { id, error })
            }
        }
    }

    /// Run jobs until the queue is empty or paused.
    pub fn drain<F, E>(&mut self, mut execute: F) -> Vec<JobOutcome>
    where
        F: FnMut(&QueuedUpdate) -> Result<(), E>,
        E: fmt::Display,
    {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.process_next(&mut execute) {
            outcomes.push(outcome);
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn job(key: &str) -> QueuedUpdate {
        QueuedUpdate::new(key, "filter", "sync", StateValue::Null)
    }

    #[test]
    fn runs_highest_priority_first_then_fifo() {
        let mut queue = UpdateQueue::new();
        queue.enqueue(job("low").with_priority(UpdatePriority::Low));
        queue.enqueue(job("normal-1"));
        queue.enqueue(job("critical").with_priority(UpdatePriority::Critical));
        queue.enqueue(job("normal-2"));

        let mut order = Vec::new();
        queue.drain(|update| {
            order.push(update.key.clone());
            Ok::<(), String>(())
        });
        assert_eq!(order, vec!["critical", "normal-1", "normal-2", "low"]);
        assert_eq!(queue.stats().processed, 4);
    }

    #[test]
    fn retries_then_dead_letters() {
        let mut queue = UpdateQueue::new();
        let reported = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&reported);
        let id = queue.enqueue(job("flaky").with_max_retries(2).on_error(move |id, error| {
            *sink.lock().unwrap() = Some((id, error.to_string()));
        }));

        let outcomes = queue.drain(|_| Err("backend down"));
        assert_eq!(
            outcomes,
            vec![
                JobOutcome::Retrying { id, attempt: 1 },
                JobOutcome::Retrying { id, attempt: 2 },
                JobOutcome::DeadLettered {
                    id,
                    error: "backend down".into()
                },
            ]
        );
        assert_eq!(*reported.lock().unwrap(), Some((id, "backend down".to_string())));

        let stats = queue.stats();
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.current_queue_size, 0);
    }

    #[test]
    fn success_hook_and_event_fire() {
        let mut queue = UpdateQueue::new();
        let (_, rx) = queue.events().subscribe_channel(Some(QueueEventKind::Success));
        let succeeded = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&succeeded);
        let id = queue.enqueue(job("k").on_success(move |_| *flag.lock().unwrap() = true));

        // Fails once, succeeds on retry
        let mut calls = 0;
        queue.drain(|_| {
            calls += 1;
            if calls == 1 { Err("transient") } else { Ok(()) }
        });

        assert!(*succeeded.lock().unwrap());
        assert_eq!(rx.try_recv().ok(), Some(QueueEvent::Success { id, attempts: 2 }));
    }

    #[test]
    fn pause_blocks_processing() {
        let mut queue = UpdateQueue::new();
        queue.enqueue(job("k"));
        queue.pause();
        assert!(queue.process_next(|_| Ok::<(), String>(())).is_none());
        assert!(queue.stats().paused);
        assert_eq!(queue.len(), 1);

        queue.resume();
        assert!(matches!(
            queue.process_next(|_| Ok::<(), String>(())),
            Some(JobOutcome::Succeeded { .. })
        ));
    }

    #[test]
    fn clear_and_cancel_emit_cancelled() {
        let mut queue = UpdateQueue::new();
        let (_, rx) = queue.events().subscribe_channel(Some(QueueEventKind::Cancelled));
        let first = queue.enqueue(job("a"));
        queue.enqueue(job("b"));
        queue.enqueue(job("c"));

        assert!(queue.cancel(first));
        assert!(!queue.cancel(first));
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        assert_eq!(rx.try_iter().count(), 3);
        assert_eq!(queue.stats().cancelled, 3);
    }
}
