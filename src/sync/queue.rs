//! Ordered, deduplicating task queue and its persisted snapshot

use crate::error::Result;
use crate::metadata::{MetadataStore, SYNC_QUEUE_KEY};
use crate::sync::task::{Task, TaskState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Tasks in insertion order, addressable by id.
///
/// Each enqueued task gets a sequence number that never changes, so
/// removing from the middle keeps the order of everything else.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: BTreeMap<u64, Task>,
    index: HashMap<String, u64>,
    next_seq: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a queue from a snapshot.
    ///
    /// Tasks that were `Pending` when the snapshot was taken never reported
    /// an outcome and go back to `Queued`.
    pub fn from_tasks(tasks: Vec<Task>) -> Self {
        let mut queue = TaskQueue::new();
        for task in tasks {
            queue.enqueue(task);
        }
        queue.reset_pending();
        queue
    }

    /// Append `task` unless a task with the same id is already queued.
    /// Returns true if it was added.
    pub fn enqueue(&mut self, task: Task) -> bool {
        if self.index.contains_key(&task.id) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(task.id.clone(), seq);
        self.tasks.insert(seq, task);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.index.get(id).and_then(|seq| self.tasks.get(seq))
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        let seq = *self.index.get(id)?;
        self.tasks.get_mut(&seq)
    }

    pub fn remove(&mut self, id: &str) -> Option<Task> {
        let seq = self.index.remove(id)?;
        self.tasks.remove(&seq)
    }

    /// Ids of tasks a pass should run, front to back
    pub fn runnable_ids(&self) -> Vec<String> {
        self.tasks
            .values()
            .filter(|task| task.is_runnable())
            .map(|task| task.id.clone())
            .collect()
    }

    pub fn reset_pending(&mut self) {
        for task in self.tasks.values_mut() {
            if task.state == TaskState::Pending {
                task.state = TaskState::Queued;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn to_vec(&self) -> Vec<Task> {
        self.tasks.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats::from_tasks(self.tasks.values())
    }
}

/// Task counts by state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub total: usize,
    pub queued: usize,
    pub pending: usize,
    pub failed: usize,
}

impl QueueStats {
    fn from_tasks<'a>(tasks: impl Iterator<Item = &'a Task>) -> Self {
        let mut stats = QueueStats::default();
        for task in tasks {
            stats.total += 1;
            match task.state {
                TaskState::Queued => stats.queued += 1,
                TaskState::Pending => stats.pending += 1,
                TaskState::Failed => stats.failed += 1,
            }
        }
        stats
    }
}

impl fmt::Display for QueueStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Total: {}, Queued: {}, Pending: {}, Failed: {}",
            self.total, self.queued, self.pending, self.failed
        )
    }
}

/// Both queues as persisted under [`SYNC_QUEUE_KEY`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub bucket_queue: Vec<Task>,
    pub pinning_queue: Vec<Task>,
}

impl QueueSnapshot {
    /// Load the last saved snapshot, if any
    pub fn load(metadata: &MetadataStore) -> Result<Option<Self>> {
        match metadata.get_state(SYNC_QUEUE_KEY)? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    pub fn save(&self, metadata: &MetadataStore) -> Result<()> {
        let data = serde_json::to_vec(self)?;
        metadata.save_state(SYNC_QUEUE_KEY, &data)
    }

    pub fn bucket_stats(&self) -> QueueStats {
        QueueStats::from_tasks(self.bucket_queue.iter())
    }

    pub fn pinning_stats(&self) -> QueueStats {
        QueueStats::from_tasks(self.pinning_queue.iter())
    }
}

impl fmt::Display for QueueSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bucket queue: {}; Pinning queue: {}",
            self.bucket_stats(),
            self.pinning_stats()
        )
    }
}
