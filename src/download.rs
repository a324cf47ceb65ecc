use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_RANGE, ETAG, HeaderMap, HeaderValue, RANGE, USER_AGENT};
use sha2::{Digest, Sha256};
use url::Url;

use crate::catalog::Checksum;
use crate::domain::{AssetRole, EventId, ItemId};
use crate::error::StormsightError;
use crate::store::{DownloadRecord, ResumeState, Store};

const CHUNK_SIZE: usize = 64 * 1024;
const SIDECAR_INTERVAL: u64 = 4 * 1024 * 1024;
const BASE_DELAY_MS: u64 = 200;
const MAX_BACKOFF_MS: u64 = 5_000;
const SLEEP_SLICE_MS: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    InProgress,
    Paused,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskState::Queued => "queued",
            TaskState::InProgress => "in-progress",
            TaskState::Paused => "paused",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub event: EventId,
    pub item: ItemId,
    pub role: AssetRole,
    pub url: Url,
    pub destination: Utf8PathBuf,
    pub total: Option<u64>,
    pub checksum: Option<Checksum>,
}

#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub item: ItemId,
    pub role: AssetRole,
    pub destination: Utf8PathBuf,
    pub state: TaskState,
    pub bytes: u64,
    pub total: Option<u64>,
    pub retry_count: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub enum TaskEvent {
    Queued { id: TaskId },
    Started { id: TaskId, attempt: u32 },
    Progress { id: TaskId, bytes: u64, total: Option<u64> },
    Paused { id: TaskId, bytes: u64 },
    ResumeDowngraded { id: TaskId, reason: String },
    RetryScheduled { id: TaskId, attempt: u32, delay_ms: u64 },
    IntegrityRetry { id: TaskId },
    Completed { id: TaskId, bytes: u64 },
    Failed { id: TaskId, error: String },
    Cancelled { id: TaskId },
}

impl TaskEvent {
    pub fn id(&self) -> TaskId {
        match self {
            TaskEvent::Queued { id }
            | TaskEvent::Started { id, .. }
            | TaskEvent::Progress { id, .. }
            | TaskEvent::Paused { id, .. }
            | TaskEvent::ResumeDowngraded { id, .. }
            | TaskEvent::RetryScheduled { id, .. }
            | TaskEvent::IntegrityRetry { id }
            | TaskEvent::Completed { id, .. }
            | TaskEvent::Failed { id, .. }
            | TaskEvent::Cancelled { id } => *id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelPolicy {
    /// Keep the partial file and sidecar for a later resume.
    #[default]
    KeepPartial,
    /// Remove the partial file and sidecar.
    Discard,
}

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub workers: usize,
    pub retry_limit: u32,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            retry_limit: 3,
        }
    }
}

/// One response body, positioned at the requested offset when `ranged`.
pub struct FetchBody {
    /// Whether the server honored the byte-range request.
    pub ranged: bool,
    /// Size of the complete remote object, when the server declares it.
    pub total: Option<u64>,
    pub etag: Option<String>,
    pub reader: Box<dyn Read + Send>,
}

pub trait AssetFetcher: Send + Sync {
    fn fetch(&self, url: &Url, offset: u64) -> Result<FetchBody, StormsightError>;
}

pub struct HttpAssetFetcher {
    client: Client,
}

impl HttpAssetFetcher {
    /// No overall request deadline: imagery bodies run to gigabytes.
    /// Stalls surface through the connect timeout and read errors.
    pub fn new() -> Result<Self, StormsightError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("stormsight/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| StormsightError::Filesystem(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .timeout(None)
            .build()
            .map_err(|err| StormsightError::DownloadHttp(err.to_string()))?;
        Ok(Self { client })
    }
}

impl AssetFetcher for HttpAssetFetcher {
    fn fetch(&self, url: &Url, offset: u64) -> Result<FetchBody, StormsightError> {
        let mut request = self.client.get(url.clone());
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        let response = request
            .send()
            .map_err(|err| StormsightError::DownloadHttp(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(StormsightError::DownloadStatus {
                status: status.as_u16(),
                message: url.to_string(),
            });
        }
        let ranged = status.as_u16() == 206;
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(normalize_etag);
        let total = if ranged {
            response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_content_range_total)
        } else {
            response.content_length()
        };
        Ok(FetchBody {
            ranged,
            total,
            etag,
            reader: Box::new(response),
        })
    }
}

fn normalize_etag(raw: &str) -> String {
    raw.trim_start_matches("W/").trim_matches('"').to_string()
}

fn parse_content_range_total(raw: &str) -> Option<u64> {
    raw.rsplit('/').next().and_then(|total| total.trim().parse().ok())
}

#[derive(Default)]
struct TaskControl {
    pause: AtomicBool,
    cancel: AtomicBool,
    policy: Mutex<CancelPolicy>,
}

struct Task {
    request: DownloadRequest,
    state: TaskState,
    bytes: u64,
    total: Option<u64>,
    retry_count: u32,
    integrity_retried: bool,
    error: Option<String>,
    control: Arc<TaskControl>,
}

impl Task {
    fn snapshot(&self, id: TaskId) -> TaskSnapshot {
        TaskSnapshot {
            id,
            item: self.request.item.clone(),
            role: self.request.role.clone(),
            destination: self.request.destination.clone(),
            state: self.state,
            bytes: self.bytes,
            total: self.total,
            retry_count: self.retry_count,
            error: self.error.clone(),
        }
    }
}

struct Inner<F: AssetFetcher> {
    fetcher: F,
    options: DownloadOptions,
    // lock order: tasks before queue, never the reverse
    queue: Mutex<VecDeque<TaskId>>,
    queue_ready: Condvar,
    tasks: Mutex<BTreeMap<TaskId, Task>>,
    tasks_changed: Condvar,
    subscribers: Mutex<Vec<Sender<TaskEvent>>>,
    next_id: AtomicU64,
    shutdown: AtomicBool,
}

impl<F: AssetFetcher> Inner<F> {
    fn emit(&self, event: TaskEvent) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

/// Bounded worker pool over a task registry. Tasks move through
/// queued -> in-progress -> completed | failed | paused; completed and
/// failed are terminal, paused tasks re-enter the queue on `resume`.
pub struct DownloadManager<F: AssetFetcher + 'static> {
    inner: Arc<Inner<F>>,
    workers: Vec<JoinHandle<()>>,
}

impl<F: AssetFetcher + 'static> DownloadManager<F> {
    pub fn new(fetcher: F, options: DownloadOptions) -> Self {
        let workers = options.workers.max(1);
        let inner = Arc::new(Inner {
            fetcher,
            options,
            queue: Mutex::new(VecDeque::new()),
            queue_ready: Condvar::new(),
            tasks: Mutex::new(BTreeMap::new()),
            tasks_changed: Condvar::new(),
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        });
        let handles = (0..workers)
            .map(|_| {
                let inner = Arc::clone(&inner);
                thread::spawn(move || worker_loop(inner))
            })
            .collect();
        Self {
            inner,
            workers: handles,
        }
    }

    pub fn subscribe(&self) -> Receiver<TaskEvent> {
        let (sender, receiver) = mpsc::channel();
        self.inner.subscribers.lock().unwrap().push(sender);
        receiver
    }

    pub fn enqueue(&self, request: DownloadRequest) -> TaskId {
        let id = TaskId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let task = Task {
            total: request.total,
            request,
            state: TaskState::Queued,
            bytes: 0,
            retry_count: 0,
            integrity_retried: false,
            error: None,
            control: Arc::new(TaskControl::default()),
        };
        {
            let mut tasks = self.inner.tasks.lock().unwrap();
            tasks.insert(id, task);
            let mut queue = self.inner.queue.lock().unwrap();
            queue.push_back(id);
        }
        self.inner.queue_ready.notify_one();
        self.inner.emit(TaskEvent::Queued { id });
        id
    }

    /// Queued tasks park immediately; in-progress tasks finish their
    /// current chunk, persist the sidecar, and park.
    pub fn pause(&self, id: TaskId) -> Result<(), StormsightError> {
        let mut tasks = self.inner.tasks.lock().unwrap();
        let task = tasks
            .get_mut(&id)
            .ok_or(StormsightError::TaskNotFound(id.0))?;
        match task.state {
            TaskState::Queued => {
                {
                    let mut queue = self.inner.queue.lock().unwrap();
                    queue.retain(|queued| *queued != id);
                }
                task.state = TaskState::Paused;
                let bytes = task.bytes;
                drop(tasks);
                self.inner.tasks_changed.notify_all();
                self.inner.emit(TaskEvent::Paused { id, bytes });
                Ok(())
            }
            TaskState::InProgress => {
                task.control.pause.store(true, Ordering::SeqCst);
                Ok(())
            }
            state => Err(transition_error(id, state, "pause")),
        }
    }

    pub fn resume(&self, id: TaskId) -> Result<(), StormsightError> {
        let mut tasks = self.inner.tasks.lock().unwrap();
        let task = tasks
            .get_mut(&id)
            .ok_or(StormsightError::TaskNotFound(id.0))?;
        match task.state {
            TaskState::Paused => {
                task.state = TaskState::Queued;
                task.control.pause.store(false, Ordering::SeqCst);
                {
                    let mut queue = self.inner.queue.lock().unwrap();
                    queue.push_back(id);
                }
                drop(tasks);
                self.inner.queue_ready.notify_one();
                self.inner.tasks_changed.notify_all();
                self.inner.emit(TaskEvent::Queued { id });
                Ok(())
            }
            state => Err(transition_error(id, state, "resume")),
        }
    }

    pub fn cancel(&self, id: TaskId, policy: CancelPolicy) -> Result<(), StormsightError> {
        let mut tasks = self.inner.tasks.lock().unwrap();
        let task = tasks
            .get_mut(&id)
            .ok_or(StormsightError::TaskNotFound(id.0))?;
        match task.state {
            TaskState::Queued | TaskState::Paused => {
                if task.state == TaskState::Queued {
                    let mut queue = self.inner.queue.lock().unwrap();
                    queue.retain(|queued| *queued != id);
                }
                let destination = task.request.destination.clone();
                tasks.remove(&id);
                drop(tasks);
                if policy == CancelPolicy::Discard {
                    if let Err(err) = Store::remove_artifacts(&destination) {
                        tracing::warn!(%err, "failed to discard partial download");
                    }
                }
                self.inner.tasks_changed.notify_all();
                self.inner.emit(TaskEvent::Cancelled { id });
                Ok(())
            }
            TaskState::InProgress => {
                *task.control.policy.lock().unwrap() = policy;
                task.control.cancel.store(true, Ordering::SeqCst);
                Ok(())
            }
            state => Err(transition_error(id, state, "cancel")),
        }
    }

    /// Removes a terminal task from the registry and returns its last
    /// snapshot.
    pub fn acknowledge(&self, id: TaskId) -> Result<TaskSnapshot, StormsightError> {
        let mut tasks = self.inner.tasks.lock().unwrap();
        let task = tasks.get(&id).ok_or(StormsightError::TaskNotFound(id.0))?;
        if !task.state.is_terminal() {
            return Err(transition_error(id, task.state, "acknowledge"));
        }
        let snapshot = task.snapshot(id);
        tasks.remove(&id);
        Ok(snapshot)
    }

    pub fn snapshot(&self, id: TaskId) -> Result<TaskSnapshot, StormsightError> {
        let tasks = self.inner.tasks.lock().unwrap();
        tasks
            .get(&id)
            .map(|task| task.snapshot(id))
            .ok_or(StormsightError::TaskNotFound(id.0))
    }

    pub fn snapshots(&self) -> Vec<TaskSnapshot> {
        let tasks = self.inner.tasks.lock().unwrap();
        tasks.iter().map(|(id, task)| task.snapshot(*id)).collect()
    }

    /// Blocks until none of `ids` is queued or in progress, then returns
    /// their snapshots. Cancelled tasks have no snapshot to return.
    pub fn wait_for(
        &self,
        ids: &[TaskId],
        timeout: Duration,
    ) -> Result<Vec<TaskSnapshot>, StormsightError> {
        let deadline = Instant::now() + timeout;
        let mut tasks = self.inner.tasks.lock().unwrap();
        loop {
            let unsettled = ids.iter().any(|id| {
                tasks
                    .get(id)
                    .map(|task| matches!(task.state, TaskState::Queued | TaskState::InProgress))
                    .unwrap_or(false)
            });
            if !unsettled {
                return Ok(ids
                    .iter()
                    .filter_map(|id| tasks.get(id).map(|task| task.snapshot(*id)))
                    .collect());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(StormsightError::DownloadStalled(timeout.as_secs()));
            }
            let (guard, _) = self
                .inner
                .tasks_changed
                .wait_timeout(tasks, remaining)
                .unwrap();
            tasks = guard;
        }
    }
}

impl<F: AssetFetcher + 'static> Drop for DownloadManager<F> {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.queue_ready.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn transition_error(id: TaskId, state: TaskState, action: &str) -> StormsightError {
    StormsightError::TaskTransition {
        id: id.0,
        state: state.to_string(),
        action: action.to_string(),
    }
}

fn worker_loop<F: AssetFetcher>(inner: Arc<Inner<F>>) {
    loop {
        let id = {
            let mut queue = inner.queue.lock().unwrap();
            loop {
                if inner.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                match queue.pop_front() {
                    Some(id) => break id,
                    None => queue = inner.queue_ready.wait(queue).unwrap(),
                }
            }
        };
        run_task(&inner, id);
    }
}

enum Transfer {
    Done { bytes: u64 },
    Paused { bytes: u64 },
    Cancelled,
}

fn run_task<F: AssetFetcher>(inner: &Inner<F>, id: TaskId) {
    let (request, control) = {
        let mut tasks = inner.tasks.lock().unwrap();
        let Some(task) = tasks.get_mut(&id) else { return };
        if task.state != TaskState::Queued {
            // pause or cancel won the race for this queue entry
            return;
        }
        task.state = TaskState::InProgress;
        task.error = None;
        (task.request.clone(), Arc::clone(&task.control))
    };
    inner.tasks_changed.notify_all();
    inner.emit(TaskEvent::Started { id, attempt: 1 });

    loop {
        match execute_transfer(inner, id, &request, &control) {
            Ok(Transfer::Done { bytes }) => {
                if complete_task(inner, id, &request, bytes) {
                    return;
                }
                // checksum mismatch burned the one re-download; go again
            }
            Ok(Transfer::Paused { bytes }) => {
                park_task(inner, id, bytes);
                return;
            }
            Ok(Transfer::Cancelled) => {
                discard_task(inner, id, &request, &control);
                return;
            }
            Err(err) if err.is_transient() => {
                let attempt = {
                    let mut tasks = inner.tasks.lock().unwrap();
                    let Some(task) = tasks.get_mut(&id) else { return };
                    task.retry_count += 1;
                    task.retry_count
                };
                if attempt > inner.options.retry_limit {
                    fail_task(inner, id, err);
                    return;
                }
                let delay_ms = retry_delay_ms(attempt);
                inner.emit(TaskEvent::RetryScheduled {
                    id,
                    attempt,
                    delay_ms,
                });
                if !sleep_before_retry(inner, &control, delay_ms) {
                    if control.cancel.load(Ordering::SeqCst) {
                        discard_task(inner, id, &request, &control);
                    } else {
                        let bytes = inner
                            .tasks
                            .lock()
                            .unwrap()
                            .get(&id)
                            .map(|task| task.bytes)
                            .unwrap_or(0);
                        park_task(inner, id, bytes);
                    }
                    return;
                }
                inner.emit(TaskEvent::Started {
                    id,
                    attempt: attempt + 1,
                });
            }
            Err(err) => {
                fail_task(inner, id, err);
                return;
            }
        }
    }
}

/// Verifies, records, and marks the task completed. Returns false when a
/// checksum mismatch consumed the single automatic re-download and the
/// transfer must run once more.
fn complete_task<F: AssetFetcher>(
    inner: &Inner<F>,
    id: TaskId,
    request: &DownloadRequest,
    bytes: u64,
) -> bool {
    let mut digest = None;
    if let Some(expected) = &request.checksum {
        let actual = match sha256_file(&request.destination) {
            Ok(actual) => actual,
            Err(err) => {
                fail_task(inner, id, err);
                return true;
            }
        };
        if actual != expected.as_hex() {
            let already_retried = {
                let mut tasks = inner.tasks.lock().unwrap();
                let Some(task) = tasks.get_mut(&id) else { return true };
                let previous = task.integrity_retried;
                task.integrity_retried = true;
                task.bytes = 0;
                previous
            };
            if already_retried {
                fail_task(
                    inner,
                    id,
                    StormsightError::Integrity {
                        item: request.item.to_string(),
                        expected: expected.as_hex().to_string(),
                        actual,
                    },
                );
                return true;
            }
            if let Err(err) = Store::remove_artifacts(&request.destination) {
                fail_task(inner, id, err);
                return true;
            }
            inner.emit(TaskEvent::IntegrityRetry { id });
            return false;
        }
        digest = Some(actual);
    }
    if let Err(err) = Store::clear_resume_state(&request.destination) {
        fail_task(inner, id, err);
        return true;
    }
    let record = DownloadRecord {
        event_id: request.event.to_string(),
        item_id: request.item.to_string(),
        role: request.role.to_string(),
        url: request.url.to_string(),
        bytes,
        verified: digest.is_some(),
        sha256: digest,
        completed_at: Utc::now().to_rfc3339(),
        tool: format!("stormsight {}", env!("CARGO_PKG_VERSION")),
    };
    if let Err(err) = Store::write_record(&request.destination, &record) {
        fail_task(inner, id, err);
        return true;
    }
    {
        let mut tasks = inner.tasks.lock().unwrap();
        if let Some(task) = tasks.get_mut(&id) {
            task.state = TaskState::Completed;
            task.bytes = bytes;
        }
    }
    inner.tasks_changed.notify_all();
    inner.emit(TaskEvent::Completed { id, bytes });
    true
}

fn fail_task<F: AssetFetcher>(inner: &Inner<F>, id: TaskId, err: StormsightError) {
    let message = err.to_string();
    {
        let mut tasks = inner.tasks.lock().unwrap();
        if let Some(task) = tasks.get_mut(&id) {
            task.state = TaskState::Failed;
            task.error = Some(message.clone());
        }
    }
    inner.tasks_changed.notify_all();
    inner.emit(TaskEvent::Failed { id, error: message });
}

fn park_task<F: AssetFetcher>(inner: &Inner<F>, id: TaskId, bytes: u64) {
    {
        let mut tasks = inner.tasks.lock().unwrap();
        let Some(task) = tasks.get_mut(&id) else { return };
        task.state = TaskState::Paused;
        task.bytes = bytes;
        task.control.pause.store(false, Ordering::SeqCst);
    }
    inner.tasks_changed.notify_all();
    inner.emit(TaskEvent::Paused { id, bytes });
}

fn discard_task<F: AssetFetcher>(
    inner: &Inner<F>,
    id: TaskId,
    request: &DownloadRequest,
    control: &TaskControl,
) {
    let policy = *control.policy.lock().unwrap();
    if policy == CancelPolicy::Discard {
        if let Err(err) = Store::remove_artifacts(&request.destination) {
            tracing::warn!(%err, "failed to discard partial download");
        }
    }
    {
        let mut tasks = inner.tasks.lock().unwrap();
        tasks.remove(&id);
    }
    inner.tasks_changed.notify_all();
    inner.emit(TaskEvent::Cancelled { id });
}

/// Exponential backoff, capped. The shift amount is clamped so arbitrarily
/// large attempt numbers cannot overflow it.
fn retry_delay_ms(attempt: u32) -> u64 {
    (BASE_DELAY_MS << attempt.saturating_sub(1).min(5)).min(MAX_BACKOFF_MS)
}

fn sleep_before_retry<F: AssetFetcher>(
    inner: &Inner<F>,
    control: &TaskControl,
    delay_ms: u64,
) -> bool {
    let interrupted = || {
        inner.shutdown.load(Ordering::SeqCst)
            || control.cancel.load(Ordering::SeqCst)
            || control.pause.load(Ordering::SeqCst)
    };
    let mut remaining = delay_ms;
    while remaining > 0 {
        if interrupted() {
            return false;
        }
        let slice = remaining.min(SLEEP_SLICE_MS);
        thread::sleep(Duration::from_millis(slice));
        remaining -= slice;
    }
    !interrupted()
}

#[derive(Debug, PartialEq, Eq)]
struct ResumePlan {
    offset: u64,
    etag: Option<String>,
}

/// Offset to resume from, derived only from what is on disk and what the
/// sidecar confirms. The minimum of the two is always safe: bytes beyond
/// it are either unwritten or unconfirmed.
fn resume_plan(file_len: u64, sidecar: Option<&ResumeState>) -> ResumePlan {
    match sidecar {
        Some(state) => ResumePlan {
            offset: file_len.min(state.bytes_confirmed),
            etag: state.etag.clone(),
        },
        None => ResumePlan {
            offset: 0,
            etag: None,
        },
    }
}

fn execute_transfer<F: AssetFetcher>(
    inner: &Inner<F>,
    id: TaskId,
    request: &DownloadRequest,
    control: &TaskControl,
) -> Result<Transfer, StormsightError> {
    Store::ensure_parent(&request.destination)?;
    let dest = request.destination.as_std_path();
    let file_len = fs::metadata(dest).map(|meta| meta.len()).unwrap_or(0);
    let sidecar = Store::load_resume_state(&request.destination)?;
    let plan = resume_plan(file_len, sidecar.as_ref());

    let mut body = inner.fetcher.fetch(&request.url, plan.offset)?;
    let mut offset = plan.offset;
    if offset > 0 {
        if !body.ranged {
            inner.emit(TaskEvent::ResumeDowngraded {
                id,
                reason: "range requests unsupported".to_string(),
            });
            offset = 0;
        } else if matches!((&plan.etag, &body.etag), (Some(old), Some(new)) if old != new) {
            inner.emit(TaskEvent::ResumeDowngraded {
                id,
                reason: "remote object changed".to_string(),
            });
            offset = 0;
            body = inner.fetcher.fetch(&request.url, 0)?;
        }
    }
    let wire_total = body.total;
    let total = body.total.or(request.total);
    {
        let mut tasks = inner.tasks.lock().unwrap();
        if let Some(task) = tasks.get_mut(&id) {
            task.total = total;
            task.bytes = offset;
        }
    }

    let map_fs = |err: std::io::Error| StormsightError::Filesystem(err.to_string());
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(dest)
        .map_err(map_fs)?;
    file.set_len(offset).map_err(map_fs)?;
    file.seek(SeekFrom::Start(offset)).map_err(map_fs)?;

    let etag = body.etag.clone();
    let mut written = offset;
    let mut last_sidecar = offset;
    // Written before the first byte so a bare destination file is never
    // mistaken for a finished download.
    persist_sidecar(request, &etag, written)?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = match body.reader.read(&mut buf) {
            Ok(n) => n,
            Err(err) => {
                let _ = file.flush();
                persist_sidecar(request, &etag, written)?;
                return Err(StormsightError::DownloadHttp(err.to_string()));
            }
        };
        if control.cancel.load(Ordering::SeqCst) {
            if *control.policy.lock().unwrap() == CancelPolicy::KeepPartial {
                file.flush().map_err(map_fs)?;
                persist_sidecar(request, &etag, written)?;
            }
            return Ok(Transfer::Cancelled);
        }
        if control.pause.load(Ordering::SeqCst) || inner.shutdown.load(Ordering::SeqCst) {
            // the unconfirmed chunk is discarded; only written bytes count
            file.flush().map_err(map_fs)?;
            persist_sidecar(request, &etag, written)?;
            return Ok(Transfer::Paused { bytes: written });
        }
        if n == 0 {
            break;
        }
        if let Err(err) = file.write_all(&buf[..n]) {
            persist_sidecar(request, &etag, written)?;
            return Err(StormsightError::Filesystem(err.to_string()));
        }
        written += n as u64;
        {
            let mut tasks = inner.tasks.lock().unwrap();
            if let Some(task) = tasks.get_mut(&id) {
                task.bytes = written;
            }
        }
        if written - last_sidecar >= SIDECAR_INTERVAL {
            file.flush().map_err(map_fs)?;
            persist_sidecar(request, &etag, written)?;
            last_sidecar = written;
        }
        inner.emit(TaskEvent::Progress {
            id,
            bytes: written,
            total,
        });
    }
    if let Some(expected) = wire_total {
        if written != expected {
            file.flush().map_err(map_fs)?;
            persist_sidecar(request, &etag, written)?;
            return Err(StormsightError::DownloadHttp(format!(
                "connection closed at byte {written} of {expected}"
            )));
        }
    }
    file.flush().map_err(map_fs)?;
    Ok(Transfer::Done { bytes: written })
}

fn persist_sidecar(
    request: &DownloadRequest,
    etag: &Option<String>,
    written: u64,
) -> Result<(), StormsightError> {
    Store::save_resume_state(
        &request.destination,
        &ResumeState {
            url: request.url.to_string(),
            etag: etag.clone(),
            bytes_confirmed: written,
            updated_at: Utc::now().to_rfc3339(),
        },
    )
}

fn sha256_file(path: &Utf8Path) -> Result<String, StormsightError> {
    let mut file =
        fs::File::open(path.as_std_path()).map_err(|err| StormsightError::Filesystem(err.to_string()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|err| StormsightError::Filesystem(err.to_string()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
