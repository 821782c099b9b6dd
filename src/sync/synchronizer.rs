//! Background synchronizer
//!
//! Two queue workers mirror local bucket changes to the backup hub. The
//! bucket queue runs its tasks one at a time and stops at the first
//! failure; the pinning queue runs file transfers in parallel. Producers
//! only ever touch a [`SyncNotifier`]: tasks travel over a channel into the
//! worker's inbox and a [`Notify`] wakes the worker loop.

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::metadata::MetadataStore;
use crate::sync::executor::TaskExecutor;
use crate::sync::queue::{QueueSnapshot, TaskQueue};
use crate::sync::task::{QueueKind, Task, TaskKind, TaskState};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Ids of every task sitting in an inbox or on either queue.
///
/// Producers consult it before sending, so re-notifying a change whose
/// task has not finished yet is a no-op. An id leaves the set only when
/// its task leaves the queue.
#[derive(Clone, Default)]
struct TrackedIds(Arc<parking_lot::Mutex<HashSet<String>>>);

impl TrackedIds {
    fn insert(&self, id: &str) -> bool {
        self.0.lock().insert(id.to_string())
    }

    fn remove(&self, id: &str) {
        self.0.lock().remove(id);
    }
}

#[derive(Clone)]
struct QueueInbox {
    tx: mpsc::UnboundedSender<Task>,
    signal: Arc<Notify>,
}

impl QueueInbox {
    fn push(&self, task: Task, tracked: &TrackedIds) {
        if !tracked.insert(&task.id) {
            debug!("{} {:?} already scheduled", task.kind, task.args);
            return;
        }
        let (kind, id) = (task.kind, task.id.clone());
        if self.tx.send(task).is_err() {
            debug!("Synchronizer is gone, dropping {} task", kind);
            tracked.remove(&id);
            return;
        }
        self.signal.notify_one();
    }
}

/// Handle producers use to schedule sync work
#[derive(Clone)]
pub struct SyncNotifier {
    bucket: QueueInbox,
    pinning: QueueInbox,
    tracked: TrackedIds,
    max_retries: i32,
}

impl SyncNotifier {
    /// Schedule a task on the queue its kind belongs to, unless the same
    /// task is still queued or running
    pub fn enqueue(&self, kind: TaskKind, args: &[&str]) {
        let task = Task::new(kind, args.iter().map(|a| a.to_string()).collect())
            .with_max_retries(self.max_retries);
        match kind.queue() {
            QueueKind::Bucket => self.bucket.push(task, &self.tracked),
            QueueKind::Pinning => self.pinning.push(task, &self.tracked),
        }
    }

    pub fn notify_item_added(&self, slug: &str, path: &str) {
        self.enqueue(TaskKind::AddItem, &[slug, path]);
        self.enqueue(TaskKind::PinFile, &[slug, path]);
    }

    pub fn notify_item_removed(&self, slug: &str, path: &str) {
        self.enqueue(TaskKind::RemoveItem, &[slug, path]);
        self.enqueue(TaskKind::UnpinFile, &[slug, path]);
    }

    pub fn notify_bucket_created(&self, slug: &str) {
        self.enqueue(TaskKind::CreateBucket, &[slug]);
    }

    pub fn notify_bucket_backup_on(&self, slug: &str) {
        self.enqueue(TaskKind::BackupOn, &[slug]);
    }

    pub fn notify_bucket_backup_off(&self, slug: &str) {
        self.enqueue(TaskKind::BackupOff, &[slug]);
    }

    pub fn notify_bucket_restore(&self, slug: &str) {
        self.enqueue(TaskKind::RestoreBucket, &[slug]);
    }

    pub fn notify_file_restore(&self, slug: &str, path: &str) {
        self.enqueue(TaskKind::RestoreFile, &[slug, path]);
    }
}

struct QueueWorker {
    queue: TaskQueue,
    inbox: mpsc::UnboundedReceiver<Task>,
}

impl QueueWorker {
    fn drain_inbox(&mut self) -> usize {
        let mut added = 0;
        while let Ok(task) = self.inbox.try_recv() {
            if self.queue.enqueue(task) {
                added += 1;
            }
        }
        added
    }
}

/// One queue, its worker and everything a pass needs.
///
/// Lock order: `pass`, then any bucket lock taken by an executor, then
/// `worker`, then the tracked ids and the snapshot. The `worker` lock is
/// never held across an await, so executors run with the queue unlocked.
struct QueueRunner {
    kind: QueueKind,
    /// Serializes passes over this queue
    pass: Mutex<()>,
    worker: parking_lot::Mutex<QueueWorker>,
    signal: Arc<Notify>,
    executor: Arc<dyn TaskExecutor>,
    notifier: SyncNotifier,
    tracked: TrackedIds,
    limiter: Arc<Semaphore>,
    snapshot: Arc<parking_lot::Mutex<QueueSnapshot>>,
    metadata: MetadataStore,
}

impl QueueRunner {
    /// Drain the inbox, then run every queued or failed task once
    async fn run_pass(&self) {
        let _pass = self.pass.lock().await;
        let ids = {
            let mut worker = self.worker.lock();
            if worker.drain_inbox() > 0 {
                self.publish(&worker.queue);
            }
            if worker.queue.is_empty() {
                return;
            }
            debug!("Sync [{}]: pass start, {}", self.kind, worker.queue.stats());
            worker.queue.runnable_ids()
        };

        let mut running = JoinSet::new();
        for id in ids {
            let Some(task) = self.mark_pending(&id) else {
                continue;
            };
            debug!("Sync [{}]: processing {} {:?}", self.kind, task.kind, task.args);

            if task.parallelizable {
                let Ok(permit) = self.limiter.clone().acquire_owned().await else {
                    break;
                };
                let executor = self.executor.clone();
                let notifier = self.notifier.clone();
                running.spawn(async move {
                    let _permit = permit;
                    let result = executor.execute(&task, &notifier).await;
                    (task.id, result)
                });
            } else {
                let result = self.executor.execute(&task, &self.notifier).await;
                let failed = result.is_err();
                self.record_outcome(&task.id, result);
                if failed {
                    break;
                }
            }
        }

        while let Some(joined) = running.join_next().await {
            match joined {
                Ok((id, result)) => self.record_outcome(&id, result),
                Err(e) => error!("Sync [{}]: task did not finish: {}", self.kind, e),
            }
        }

        let mut worker = self.worker.lock();
        worker.queue.reset_pending();
        self.publish(&worker.queue);
        debug!("Sync [{}]: pass end, {}", self.kind, worker.queue.stats());
    }

    /// Flag a task as running and hand out a copy of it
    fn mark_pending(&self, id: &str) -> Option<Task> {
        let mut worker = self.worker.lock();
        let task = worker.queue.get_mut(id)?;
        task.state = TaskState::Pending;
        let task = task.clone();
        self.publish(&worker.queue);
        Some(task)
    }

    fn record_outcome(&self, id: &str, result: Result<()>) {
        let mut worker = self.worker.lock();
        let queue = &mut worker.queue;
        match result {
            Ok(()) => {
                if let Some(task) = queue.remove(id) {
                    self.tracked.remove(id);
                    debug!("Sync [{}]: {} completed", self.kind, task.kind);
                }
            }
            Err(e) => {
                let Some(task) = queue.get_mut(id) else {
                    return;
                };
                task.retries += 1;
                if task.retries_exhausted() {
                    let kind = task.kind;
                    queue.remove(id);
                    self.tracked.remove(id);
                    error!(
                        "Sync [{}]: dropping {}: {}, last error: {}",
                        self.kind,
                        kind,
                        Error::MaxRetriesExceeded(id.to_string()),
                        e
                    );
                } else {
                    task.state = TaskState::Failed;
                    warn!(
                        "Sync [{}]: {} failed (attempt {}): {}",
                        self.kind, task.kind, task.retries, e
                    );
                }
            }
        }
        self.publish(queue);
    }

    /// Replace this queue's half of the snapshot and persist it
    fn publish(&self, queue: &TaskQueue) {
        let mut snapshot = self.snapshot.lock();
        match self.kind {
            QueueKind::Bucket => snapshot.bucket_queue = queue.to_vec(),
            QueueKind::Pinning => snapshot.pinning_queue = queue.to_vec(),
        }
        if let Err(e) = snapshot.save(&self.metadata) {
            error!("Failed to store sync queue snapshot: {}", e);
        }
    }

    async fn restore(&self, tasks: Vec<Task>) {
        let _pass = self.pass.lock().await;
        let mut worker = self.worker.lock();
        let mut queue = TaskQueue::from_tasks(tasks);
        for task in worker.queue.iter() {
            queue.enqueue(task.clone());
        }
        for task in queue.iter() {
            self.tracked.insert(&task.id);
        }
        worker.queue = queue;
        self.publish(&worker.queue);
    }

    fn tasks(&self) -> Vec<Task> {
        let mut worker = self.worker.lock();
        if worker.drain_inbox() > 0 {
            self.publish(&worker.queue);
        }
        worker.queue.to_vec()
    }
}

async fn run_loop(runner: Arc<QueueRunner>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    // first tick fires immediately: initial pass on start
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = runner.signal.notified() => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        if *shutdown.borrow() {
            break;
        }
        runner.run_pass().await;
    }
    debug!("Sync [{}]: loop stopped", runner.kind);
}

pub struct Synchronizer {
    metadata: MetadataStore,
    config: SyncConfig,
    notifier: SyncNotifier,
    bucket: Arc<QueueRunner>,
    pinning: Arc<QueueRunner>,
    snapshot: Arc<parking_lot::Mutex<QueueSnapshot>>,
    shutdown: watch::Sender<bool>,
    loops: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Synchronizer {
    pub fn new(metadata: MetadataStore, config: SyncConfig, executor: Arc<dyn TaskExecutor>) -> Self {
        let (bucket_tx, bucket_rx) = mpsc::unbounded_channel();
        let (pinning_tx, pinning_rx) = mpsc::unbounded_channel();
        let bucket_signal = Arc::new(Notify::new());
        let pinning_signal = Arc::new(Notify::new());

        let tracked = TrackedIds::default();
        let notifier = SyncNotifier {
            bucket: QueueInbox {
                tx: bucket_tx,
                signal: bucket_signal.clone(),
            },
            pinning: QueueInbox {
                tx: pinning_tx,
                signal: pinning_signal.clone(),
            },
            tracked: tracked.clone(),
            max_retries: config.default_max_retries,
        };

        let snapshot = Arc::new(parking_lot::Mutex::new(QueueSnapshot::default()));
        let limiter = Arc::new(Semaphore::new(config.max_parallel_tasks.max(1)));
        let runner = |kind, inbox, signal| {
            Arc::new(QueueRunner {
                kind,
                pass: Mutex::new(()),
                worker: parking_lot::Mutex::new(QueueWorker {
                    queue: TaskQueue::new(),
                    inbox,
                }),
                signal,
                executor: executor.clone(),
                notifier: notifier.clone(),
                tracked: tracked.clone(),
                limiter: limiter.clone(),
                snapshot: snapshot.clone(),
                metadata: metadata.clone(),
            })
        };
        let bucket = runner(QueueKind::Bucket, bucket_rx, bucket_signal);
        let pinning = runner(QueueKind::Pinning, pinning_rx, pinning_signal);
        let (shutdown, _) = watch::channel(false);

        Synchronizer {
            metadata,
            config,
            notifier,
            bucket,
            pinning,
            snapshot,
            shutdown,
            loops: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn notifier(&self) -> SyncNotifier {
        self.notifier.clone()
    }

    /// Spawn both queue loops on the current runtime
    pub fn start(&self) {
        if !self.config.enabled {
            info!("Synchronizer disabled by configuration");
            return;
        }
        let mut loops = self.loops.lock();
        if !loops.is_empty() {
            return;
        }

        let period = Duration::from_secs(self.config.interval_secs.max(1));
        for runner in [&self.bucket, &self.pinning] {
            loops.push(tokio::spawn(run_loop(
                runner.clone(),
                period,
                self.shutdown.subscribe(),
            )));
        }
        info!("Synchronizer started, interval {}s", period.as_secs());
    }

    /// Stop both loops after their current pass and flush the store
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let loops = std::mem::take(&mut *self.loops.lock());
        for handle in loops {
            if let Err(e) = handle.await {
                error!("Sync loop ended abnormally: {}", e);
            }
        }
        if let Err(e) = self.metadata.flush() {
            warn!("Failed to flush metadata on shutdown: {}", e);
        }
        info!("Synchronizer stopped");
    }

    /// Load the persisted snapshot into both queues. Call before `start`.
    pub async fn restore_queue(&self) -> Result<()> {
        let Some(snapshot) = QueueSnapshot::load(&self.metadata)? else {
            debug!("No sync queue snapshot to restore");
            return Ok(());
        };
        self.bucket.restore(snapshot.bucket_queue).await;
        self.pinning.restore(snapshot.pinning_queue).await;
        info!("Restored sync queue. {}", self);
        Ok(())
    }

    /// Run one pass on each queue now
    pub async fn sync_now(&self) {
        self.bucket.run_pass().await;
        self.pinning.run_pass().await;
    }

    /// Every task not yet completed: bucket queue first, then pinning
    pub fn pending_tasks(&self) -> Vec<Task> {
        let mut tasks = self.bucket.tasks();
        tasks.extend(self.pinning.tasks());
        tasks
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.snapshot.lock().clone()
    }
}

impl fmt::Display for Synchronizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot.lock();
        fmt::Display::fmt(&*snapshot, f)
    }
}
