//! Synchronizer tasks

use crate::config::UNLIMITED_RETRIES;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a task does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    AddItem,
    RemoveItem,
    PinFile,
    UnpinFile,
    CreateBucket,
    BackupOn,
    BackupOff,
    RestoreBucket,
    RestoreFile,
}

/// The two synchronizer queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Sequential bucket bookkeeping
    Bucket,
    /// Parallel content transfer to and from the mirror
    Pinning,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::AddItem => "AddItem",
            TaskKind::RemoveItem => "RemoveItem",
            TaskKind::PinFile => "PinFile",
            TaskKind::UnpinFile => "UnpinFile",
            TaskKind::CreateBucket => "CreateBucket",
            TaskKind::BackupOn => "BackupOn",
            TaskKind::BackupOff => "BackupOff",
            TaskKind::RestoreBucket => "RestoreBucket",
            TaskKind::RestoreFile => "RestoreFile",
        }
    }

    pub fn queue(&self) -> QueueKind {
        match self {
            TaskKind::PinFile | TaskKind::UnpinFile | TaskKind::RestoreFile => QueueKind::Pinning,
            _ => QueueKind::Bucket,
        }
    }

    pub fn parallelizable(&self) -> bool {
        self.queue() == QueueKind::Pinning
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueKind::Bucket => f.write_str("buckets"),
            QueueKind::Pinning => f.write_str("file pinning"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Queued,
    Pending,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    pub state: TaskState,
    pub args: Vec<String>,
    pub retries: u32,
    /// -1 retries forever
    pub max_retries: i32,
    pub parallelizable: bool,
}

/// Stable id of a task: BLAKE3 over the kind and its arguments
pub fn task_id(kind: TaskKind, args: &[String]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(kind.as_str().as_bytes());
    for arg in args {
        hasher.update(&[0]);
        hasher.update(arg.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

impl Task {
    pub fn new(kind: TaskKind, args: Vec<String>) -> Self {
        Task {
            id: task_id(kind, &args),
            kind,
            state: TaskState::Queued,
            args,
            retries: 0,
            max_retries: UNLIMITED_RETRIES,
            parallelizable: kind.parallelizable(),
        }
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Argument `index`, or `UnexpectedTask` if the task is malformed
    pub fn arg(&self, index: usize) -> Result<&str> {
        self.args.get(index).map(String::as_str).ok_or_else(|| {
            Error::UnexpectedTask(format!("{} is missing argument {}", self.kind, index))
        })
    }

    /// True once a failed task has used up its retries
    pub fn retries_exhausted(&self) -> bool {
        self.max_retries != UNLIMITED_RETRIES && i64::from(self.retries) > i64::from(self.max_retries)
    }

    pub fn is_runnable(&self) -> bool {
        matches!(self.state, TaskState::Queued | TaskState::Failed)
    }
}
