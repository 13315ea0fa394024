//! Action queue.
//!
//! Every stimulus the engine reacts to (timer expiry, a front-end request, a
//! completion callback) becomes a [`QueueEntry`]. Entries are drained strictly
//! FIFO by the queue processor; anything produced while draining goes to the
//! tail.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::alarm::{AlarmDefinition, AlarmId};
use crate::dispatch::FollowUp;

/// What to do with the alarm an entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Fire unconditionally.
    Trigger,
    /// Fire only what is actually due.
    HandleIfDue,
    /// Remove the alarm.
    Cancel,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueueEntry {
    /// A freshly built definition to store and then handle.
    NewAlarm {
        definition: Box<AlarmDefinition>,
        mode: QueueMode,
    },
    ById { id: AlarmId, mode: QueueMode },
    /// Defer the alarm (or its reminder) until `until`.
    Defer {
        id: AlarmId,
        until: DateTime<Utc>,
        reminder: bool,
    },
    /// Completion of an asynchronous dispatch.
    FollowUp(FollowUp),
}

impl QueueEntry {
    pub fn by_id(id: impl Into<AlarmId>, mode: QueueMode) -> Self {
        QueueEntry::ById {
            id: id.into(),
            mode,
        }
    }
}

#[derive(Debug, Default)]
pub struct ActionQueue {
    entries: VecDeque<QueueEntry>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry. Returns false if an identical `HandleIfDue` request
    /// for the same id is already waiting.
    pub fn enqueue(&mut self, entry: QueueEntry) -> bool {
        if let QueueEntry::ById {
            id,
            mode: QueueMode::HandleIfDue,
        } = &entry
        {
            let queued = self.entries.iter().any(|e| {
                matches!(e, QueueEntry::ById { id: other, mode: QueueMode::HandleIfDue } if other == id)
            });
            if queued {
                return false;
            }
        }
        self.entries.push_back(entry);
        true
    }

    pub fn drain_next(&mut self) -> Option<QueueEntry> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
