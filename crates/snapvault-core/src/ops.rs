//! Background operation manager: a bounded worker pool running long
//! cache/sync operations with progress reporting, cooperative
//! cancellation, in-worker retry of transient failures, and bounded
//! retention of finished records.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use snapvault_types::{Result, SnapError};

/// What a background operation does, for display and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    SyncMetadata,
    Publish,
    DeleteSession,
    RebuildManifest,
    RebuildIndexes,
    Repair,
    ValidateCache,
    DownloadBody,
}

/// Operation lifecycle. Transitions are monotonic:
///
/// ```text
/// pending -> running -> completed
///                    \-> failed
/// running -> cancelling -> cancelled
/// pending -> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OpState {
    Pending,
    Running,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl OpState {
    pub fn is_terminal(self) -> bool {
        matches!(self, OpState::Completed | OpState::Failed | OpState::Cancelled)
    }

    /// Whether `self -> next` is a legal transition.
    fn allows(self, next: OpState) -> bool {
        use OpState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelling)
                | (Cancelling, Cancelled)
                | (Cancelling, Failed)
        )
    }
}

/// Snapshot of one operation's record.
#[derive(Debug, Clone, Serialize)]
pub struct OpRecord {
    pub id: String,
    pub kind: OpKind,
    pub state: OpState,
    /// Fraction complete in `[0, 1]`.
    pub progress: f64,
    pub message: String,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Cooperative cancellation flag, checked at suspension points: before
/// each remote call, between per-entry steps, and during backoff waits.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Suspension-point check.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(SnapError::Cancelled)
        } else {
            Ok(())
        }
    }
}

type ProgressCallback = Arc<dyn Fn(f64, &str) + Send + Sync>;

/// Forwards progress into the operation record and to the submitter's
/// callback. Callbacks run on worker threads; marshalling to a UI thread
/// is the caller's concern.
pub struct ProgressSink {
    op_id: String,
    shared: Arc<Shared>,
    callback: Option<ProgressCallback>,
}

impl ProgressSink {
    pub fn report(&self, fraction: f64, message: &str) {
        let fraction = fraction.clamp(0.0, 1.0);
        {
            let mut records = self.shared.records.lock().unwrap();
            if let Some(entry) = records.get_mut(&self.op_id) {
                entry.record.progress = fraction;
                entry.record.message = message.to_string();
            }
        }
        if let Some(callback) = &self.callback {
            callback(fraction, message);
        }
    }

    /// Detached sink for running an operation synchronously, outside the
    /// manager.
    pub fn detached() -> Self {
        Self {
            op_id: String::new(),
            shared: Arc::new(Shared::new(0, Duration::from_secs(0), usize::MAX)),
            callback: None,
        }
    }

    /// Detached sink that forwards to a callback, for synchronous drives.
    pub fn forwarding(callback: impl Fn(f64, &str) + Send + Sync + 'static) -> Self {
        Self {
            op_id: String::new(),
            shared: Arc::new(Shared::new(0, Duration::from_secs(0), usize::MAX)),
            callback: Some(Arc::new(callback)),
        }
    }
}

/// A resubmittable unit of work. `Fn` (not `FnOnce`) so the worker can
/// re-invoke it when a transient error asks for a retry.
pub type OpJob = Box<dyn Fn(&CancelToken, &ProgressSink) -> Result<serde_json::Value> + Send + Sync>;

struct Entry {
    record: OpRecord,
    token: CancelToken,
    callback: Option<ProgressCallback>,
    /// Approximate heap size of `record.result`, for the memory cap.
    result_bytes: usize,
}

struct Shared {
    records: Mutex<HashMap<String, Entry>>,
    counter: AtomicU64,
    retry_max: u32,
    retention: Duration,
    result_cap_bytes: usize,
}

impl Shared {
    fn new(retry_max: u32, retention: Duration, result_cap_bytes: usize) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(1),
            retry_max,
            retention,
            result_cap_bytes,
        }
    }

    /// Apply a state transition if legal; returns whether it happened.
    fn transition(&self, op_id: &str, next: OpState) -> bool {
        let mut records = self.records.lock().unwrap();
        let Some(entry) = records.get_mut(op_id) else {
            return false;
        };
        if !entry.record.state.allows(next) {
            debug!(
                "ignoring illegal transition {:?} -> {next:?} for {op_id}",
                entry.record.state
            );
            return false;
        }
        entry.record.state = next;
        match next {
            OpState::Running => entry.record.started_at = Some(Utc::now()),
            s if s.is_terminal() => entry.record.finished_at = Some(Utc::now()),
            _ => {}
        }
        true
    }
}

struct QueuedJob {
    op_id: String,
    job: OpJob,
}

/// The bounded worker pool.
pub struct OpManager {
    shared: Arc<Shared>,
    sender: Option<crossbeam_channel::Sender<QueuedJob>>,
    workers: Vec<JoinHandle<()>>,
}

impl OpManager {
    pub fn new(workers: usize, retry_max: u32, retention: Duration, result_cap_bytes: usize) -> Self {
        let workers = workers.max(1);
        let shared = Arc::new(Shared::new(retry_max, retention, result_cap_bytes));
        // Bounded queue: a flooded submitter blocks instead of growing an
        // unbounded backlog.
        let (sender, receiver) = crossbeam_channel::bounded::<QueuedJob>(workers * 32);

        let handles = (0..workers)
            .map(|i| {
                let shared = Arc::clone(&shared);
                let receiver = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("snapvault-worker-{i}"))
                    .spawn(move || worker_loop(&shared, &receiver))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        info!("operation manager started with {workers} workers");
        Self {
            shared,
            sender: Some(sender),
            workers: handles,
        }
    }

    /// Queue an operation. Returns its id immediately.
    pub fn submit(
        &self,
        kind: OpKind,
        job: OpJob,
        on_progress: Option<ProgressCallback>,
    ) -> String {
        let n = self.shared.counter.fetch_add(1, Ordering::SeqCst);
        let op_id = format!("op-{n}");

        let record = OpRecord {
            id: op_id.clone(),
            kind,
            state: OpState::Pending,
            progress: 0.0,
            message: String::new(),
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        self.shared.records.lock().unwrap().insert(
            op_id.clone(),
            Entry {
                record,
                token: CancelToken::new(),
                callback: on_progress,
                result_bytes: 0,
            },
        );

        if let Some(sender) = &self.sender {
            // Blocks when the queue is full: backpressure on submitters.
            if sender
                .send(QueuedJob {
                    op_id: op_id.clone(),
                    job,
                })
                .is_err()
            {
                warn!("operation queue closed; marking {op_id} failed");
                self.finish_with_error(&op_id, "operation manager is shut down");
            }
        } else {
            self.finish_with_error(&op_id, "operation manager is shut down");
        }
        op_id
    }

    fn finish_with_error(&self, op_id: &str, message: &str) {
        let mut records = self.shared.records.lock().unwrap();
        if let Some(entry) = records.get_mut(op_id) {
            entry.record.state = OpState::Failed;
            entry.record.error = Some(message.to_string());
            entry.record.finished_at = Some(Utc::now());
        }
    }

    /// Request cancellation. Returns false for unknown or already
    /// terminal operations.
    pub fn cancel(&self, op_id: &str) -> bool {
        let mut records = self.shared.records.lock().unwrap();
        let Some(entry) = records.get_mut(op_id) else {
            return false;
        };
        match entry.record.state {
            OpState::Pending => {
                entry.record.state = OpState::Cancelled;
                entry.record.finished_at = Some(Utc::now());
                entry.token.cancel();
                true
            }
            OpState::Running => {
                entry.record.state = OpState::Cancelling;
                entry.token.cancel();
                true
            }
            OpState::Cancelling => true,
            _ => false,
        }
    }

    pub fn status(&self, op_id: &str) -> Option<OpRecord> {
        self.shared
            .records
            .lock()
            .unwrap()
            .get(op_id)
            .map(|e| e.record.clone())
    }

    pub fn list(&self) -> Vec<OpRecord> {
        let mut records: Vec<OpRecord> = self
            .shared
            .records
            .lock()
            .unwrap()
            .values()
            .map(|e| e.record.clone())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    /// Block until the operation reaches a terminal state or the timeout
    /// elapses.
    pub fn wait(&self, op_id: &str, timeout: Duration) -> Option<OpRecord> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match self.status(op_id) {
                Some(record) if record.state.is_terminal() => return Some(record),
                Some(_) => {}
                None => return None,
            }
            if std::time::Instant::now() >= deadline {
                return self.status(op_id);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Drop terminal records older than the retention window, then shed
    /// the oldest retained results while over the memory cap.
    pub fn cleanup(&self) {
        let now = Utc::now();
        let retention =
            chrono::Duration::from_std(self.shared.retention).unwrap_or(chrono::Duration::zero());
        let mut records = self.shared.records.lock().unwrap();

        let expired: Vec<String> = records
            .iter()
            .filter(|(_, e)| {
                e.record.state.is_terminal()
                    && e.record
                        .finished_at
                        .is_some_and(|t| now.signed_duration_since(t) > retention)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            records.remove(id);
        }
        if !expired.is_empty() {
            debug!("cleaned up {} finished operations", expired.len());
        }

        let mut total: usize = records.values().map(|e| e.result_bytes).sum();
        if total > self.shared.result_cap_bytes {
            let mut finished: Vec<(String, DateTime<Utc>)> = records
                .iter()
                .filter(|(_, e)| e.record.state.is_terminal() && e.result_bytes > 0)
                .map(|(id, e)| (id.clone(), e.record.finished_at.unwrap_or(e.record.created_at)))
                .collect();
            finished.sort_by_key(|(_, t)| *t);
            for (id, _) in finished {
                if total <= self.shared.result_cap_bytes {
                    break;
                }
                if let Some(entry) = records.get_mut(&id) {
                    total -= entry.result_bytes;
                    entry.result_bytes = 0;
                    entry.record.result = None;
                    debug!("dropped retained result of {id} under memory pressure");
                }
            }
        }
    }

    /// Stop accepting work and join the workers. Already-queued
    /// operations are drained before the workers exit.
    pub fn shutdown(&mut self) {
        self.sender = None; // closes the channel; workers drain and exit
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked during shutdown");
            }
        }
        info!("operation manager shut down");
    }
}

impl Drop for OpManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Arc<Shared>, receiver: &crossbeam_channel::Receiver<QueuedJob>) {
    while let Ok(queued) = receiver.recv() {
        let (token, callback) = {
            let records = shared.records.lock().unwrap();
            match records.get(&queued.op_id) {
                // Cancelled while still queued: skip without running.
                Some(entry) if entry.record.state == OpState::Cancelled => continue,
                Some(entry) => (entry.token.clone(), entry.callback.clone()),
                None => continue,
            }
        };
        if !shared.transition(&queued.op_id, OpState::Running) {
            continue;
        }

        let sink = ProgressSink {
            op_id: queued.op_id.clone(),
            shared: Arc::clone(shared),
            callback,
        };

        let outcome = run_with_retry(shared, &queued, &token, &sink);
        settle(shared, &queued.op_id, &token, outcome);
    }
}

/// Run the job, replaying transient failures with exponential backoff
/// (base 1 s, factor 2) up to the retry budget. Backoff sleeps observe
/// the cancellation token.
fn run_with_retry(
    shared: &Arc<Shared>,
    queued: &QueuedJob,
    token: &CancelToken,
    sink: &ProgressSink,
) -> Result<serde_json::Value> {
    let mut delay = Duration::from_secs(1);
    let mut attempt: u32 = 0;
    loop {
        match (queued.job)(token, sink) {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < shared.retry_max => {
                attempt += 1;
                warn!(
                    "operation {} transient failure (attempt {attempt}/{}): {e}",
                    queued.op_id, shared.retry_max
                );
                // Sleep in short slices so cancellation stays responsive.
                let deadline = std::time::Instant::now() + delay;
                while std::time::Instant::now() < deadline {
                    if token.is_cancelled() {
                        return Err(SnapError::Cancelled);
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                delay = (delay * 2).min(Duration::from_secs(60));
            }
            Err(e) => return Err(e),
        }
    }
}

fn settle(
    shared: &Arc<Shared>,
    op_id: &str,
    token: &CancelToken,
    outcome: Result<serde_json::Value>,
) {
    match outcome {
        Ok(value) => {
            // A cancelled operation never completes, even if the job
            // returned a value before noticing the token.
            if token.is_cancelled() {
                shared.transition(op_id, OpState::Cancelled);
                return;
            }
            let size = value.to_string().len();
            let mut records = shared.records.lock().unwrap();
            if let Some(entry) = records.get_mut(op_id) {
                if entry.record.state.allows(OpState::Completed) {
                    entry.record.state = OpState::Completed;
                    entry.record.progress = 1.0;
                    entry.record.result = Some(value);
                    entry.result_bytes = size;
                    entry.record.finished_at = Some(Utc::now());
                } else {
                    entry.record.state = OpState::Cancelled;
                    entry.record.finished_at = Some(Utc::now());
                }
            }
        }
        Err(SnapError::Cancelled) => {
            // Usually arrives via cancelling, but a job may also observe
            // cancellation through its own token while still `running`.
            let mut records = shared.records.lock().unwrap();
            if let Some(entry) = records.get_mut(op_id) {
                if !entry.record.state.is_terminal() {
                    entry.record.state = OpState::Cancelled;
                    entry.record.finished_at = Some(Utc::now());
                }
            }
        }
        Err(e) => {
            let mut records = shared.records.lock().unwrap();
            if let Some(entry) = records.get_mut(op_id) {
                let next = if entry.record.state == OpState::Cancelling {
                    OpState::Cancelled
                } else {
                    OpState::Failed
                };
                entry.record.state = next;
                entry.record.error = Some(e.to_string());
                entry.record.finished_at = Some(Utc::now());
            }
        }
    }
}
