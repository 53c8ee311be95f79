//! Host-side handle to the worker process.
//!
//! One-way messages go through an unbounded FIFO drained by a writer task, so
//! sending never blocks the caller. Requests register a oneshot waiter keyed by
//! [`RequestId`] before they are queued; the reader task resolves waiters as
//! responses arrive and drops responses nobody waits for anymore.
//!
//! The worker's pipes and both channel tasks live on a small runtime owned by
//! the handle, so they keep making progress while the caller's thread is
//! blocked in [`WorkerHandle::shutdown_blocking`].

mod launcher;

pub use launcher::LaunchSpec;
pub use launcher::ProcessLauncher;
pub use launcher::WORKER_PROGRAM;
pub use launcher::WorkerLauncher;
pub use launcher::WorkerTransport;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::OnceLock;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use indexmap::IndexMap;
use runkit_protocol::HostMessage;
use runkit_protocol::OutputChunk;
use runkit_protocol::RemoteRun;
use runkit_protocol::RequestId;
use runkit_protocol::RunMode;
use runkit_protocol::RunRecord;
use runkit_protocol::StreamName;
use runkit_protocol::WorkerMessage;
use runkit_protocol::WorkerNotification;
use runkit_protocol::WorkerRequest;
use runkit_protocol::WorkerResult;
use runkit_protocol::message::decode_line;
use runkit_protocol::message::encode_line;
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::io::Lines;
use tokio::process::Child;
use tokio::runtime::Handle;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::error::Result;
use crate::error::RunkitErr;

const IO_THREAD_NAME: &str = "runkit-worker-io";
/// Slack on top of the shutdown budget before a blocking caller stops waiting.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

type WorkerLines = Lines<BufReader<Box<dyn AsyncRead + Send + Unpin>>>;
type PendingResponses = Arc<Mutex<HashMap<RequestId, oneshot::Sender<WorkerResult>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Unlaunched,
    Launched,
    Connected,
    ShuttingDown,
    Closed,
}

pub struct WorkerHandle {
    mode: RunMode,
    launcher: Arc<dyn WorkerLauncher>,
    launch_claimed: AtomicBool,
    state: Mutex<WorkerState>,
    io: OnceLock<IoRuntime>,
    link: OnceLock<Arc<WorkerLink>>,
}

struct WorkerLink {
    outbound: mpsc::UnboundedSender<HostMessage>,
    pending: PendingResponses,
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
    pid: u32,
    child: Mutex<Option<Child>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    startup_timeout: Duration,
    shutdown_timeout: Duration,
}

struct IoRuntime {
    handle: Handle,
    runtime: Option<Runtime>,
}

impl IoRuntime {
    fn new() -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(IO_THREAD_NAME)
            .enable_all()
            .build()?;
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
        })
    }
}

impl Drop for IoRuntime {
    // Dropped from async code as often as not, where a blocking runtime drop
    // would panic.
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl WorkerHandle {
    pub fn new(mode: RunMode, launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self {
            mode,
            launcher,
            launch_claimed: AtomicBool::new(false),
            state: Mutex::new(WorkerState::Unlaunched),
            io: OnceLock::new(),
            link: OnceLock::new(),
        }
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn state(&self) -> WorkerState {
        *lock(&self.state)
    }

    /// PID the worker reported in its ready message.
    pub fn pid(&self) -> Option<u32> {
        self.link.get().map(|link| link.pid)
    }

    /// Starts the worker and waits for its ready message. A handle launches at
    /// most once, even if the first attempt failed.
    pub async fn launch(&self, spec: &LaunchSpec) -> Result<()> {
        if self.launch_claimed.swap(true, Ordering::SeqCst) {
            return Err(RunkitErr::AlreadyLaunched);
        }

        let io = IoRuntime::new()
            .map_err(|err| RunkitErr::launch_io("failed to start worker I/O runtime", err))?;
        let io_handle = io.handle.clone();
        if self.io.set(io).is_err() {
            return Err(RunkitErr::AlreadyLaunched);
        }

        let starting = io_handle.spawn(start_worker(Arc::clone(&self.launcher), spec.clone()));
        let link = match starting.await {
            Ok(link) => link?,
            Err(err) => return Err(RunkitErr::launch(format!("worker launch task failed: {err}"))),
        };
        let pid = link.pid;
        if self.link.set(Arc::new(link)).is_err() {
            return Err(RunkitErr::AlreadyLaunched);
        }
        *lock(&self.state) = WorkerState::Launched;
        info!(pid, mode = %self.mode, "worker launched");
        Ok(())
    }

    /// Confirms the worker answers requests.
    pub async fn connect(&self) -> Result<()> {
        let timeout = self.link()?.startup_timeout;
        match self.send_sync(WorkerRequest::Ping, timeout).await? {
            WorkerResult::Pong => {
                let mut state = lock(&self.state);
                if *state == WorkerState::Launched {
                    *state = WorkerState::Connected;
                }
                debug!("worker connected");
                Ok(())
            }
            other => Err(RunkitErr::Protocol(format!("expected pong, got {other:?}"))),
        }
    }

    /// Queues a one-way message. Delivery order matches call order.
    pub fn send_async(&self, body: WorkerNotification) -> Result<()> {
        let link = self.link()?;
        link.outbound
            .send(HostMessage::Notification { body })
            .map_err(|_| RunkitErr::ChannelClosed)
    }

    /// Sends a request and waits up to `timeout` for its response. Timing out
    /// does not cancel the request in the worker.
    pub async fn send_sync(&self, body: WorkerRequest, timeout: Duration) -> Result<WorkerResult> {
        let link = self.link()?;
        let id = RequestId(link.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        lock(&link.pending).insert(id, tx);
        if link.closed.load(Ordering::Acquire)
            || link.outbound.send(HostMessage::Request { id, body }).is_err()
        {
            lock(&link.pending).remove(&id);
            return Err(RunkitErr::ChannelClosed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(WorkerResult::Error { message })) => Err(RunkitErr::Worker(message)),
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(RunkitErr::ChannelClosed),
            Err(_) => {
                lock(&link.pending).remove(&id);
                debug!(%id, ?timeout, "request timed out; a late response will be dropped");
                Err(RunkitErr::HandshakeTimeout { timeout })
            }
        }
    }

    /// Registers `run` with the remote service through the worker.
    pub async fn send_run_sync(&self, run: RunRecord, timeout: Duration) -> Result<RemoteRun> {
        match self.send_sync(WorkerRequest::SyncRun { run }, timeout).await? {
            WorkerResult::Run { run } => Ok(run),
            other => Err(RunkitErr::Protocol(format!(
                "expected run in response, got {other:?}"
            ))),
        }
    }

    pub fn send_run(&self, run: RunRecord) -> Result<()> {
        self.send_async(WorkerNotification::Run { run })
    }

    pub fn send_output(&self, stream: StreamName, chunk: &[u8]) -> Result<()> {
        self.send_async(WorkerNotification::Output {
            chunk: OutputChunk::new(stream, chunk),
        })
    }

    pub fn send_config(&self, config: IndexMap<String, Value>) -> Result<()> {
        self.send_async(WorkerNotification::Config { config })
    }

    pub fn send_history(&self, row: IndexMap<String, Value>) -> Result<()> {
        self.send_async(WorkerNotification::History { row })
    }

    /// Asks the worker to flush and exit, then reaps it. Safe to call more
    /// than once; every send fails with [`RunkitErr::ChannelClosed`] once it
    /// has started.
    pub async fn shutdown(&self) -> Result<()> {
        let Some((link, io)) = self.begin_shutdown() else {
            return Ok(());
        };
        if let Err(err) = io.spawn(close(link)).await {
            warn!("worker shutdown task failed: {err}");
        }
        *lock(&self.state) = WorkerState::Closed;
        Ok(())
    }

    /// [`shutdown`](Self::shutdown) for callers that cannot await, such as
    /// exit hooks running from `Drop`. Blocks the calling thread until the
    /// worker has flushed and exited, or was killed after the shutdown timeout.
    pub fn shutdown_blocking(&self) {
        let Some((link, io)) = self.begin_shutdown() else {
            return;
        };
        let limit = link.shutdown_timeout * 2 + SHUTDOWN_GRACE;
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        io.spawn(async move {
            close(link).await;
            let _ = done_tx.send(());
        });
        if done_rx.recv_timeout(limit).is_err() {
            warn!("worker did not finish shutting down within {limit:?}");
        }
        *lock(&self.state) = WorkerState::Closed;
    }

    /// Moves the handle to `ShuttingDown` and queues the shutdown message
    /// behind everything already sent. `None` when there is nothing to close.
    fn begin_shutdown(&self) -> Option<(Arc<WorkerLink>, Handle)> {
        {
            let mut state = lock(&self.state);
            match *state {
                WorkerState::ShuttingDown | WorkerState::Closed => return None,
                WorkerState::Unlaunched => {
                    *state = WorkerState::Closed;
                    return None;
                }
                WorkerState::Launched | WorkerState::Connected => {
                    *state = WorkerState::ShuttingDown;
                }
            }
        }

        match (self.link.get(), self.io.get()) {
            (Some(link), Some(io)) => {
                let _ = link.outbound.send(HostMessage::Notification {
                    body: WorkerNotification::Shutdown,
                });
                Some((Arc::clone(link), io.handle.clone()))
            }
            _ => {
                *lock(&self.state) = WorkerState::Closed;
                None
            }
        }
    }

    fn link(&self) -> Result<&WorkerLink> {
        match self.state() {
            WorkerState::Unlaunched => Err(RunkitErr::NotLaunched),
            WorkerState::ShuttingDown | WorkerState::Closed => Err(RunkitErr::ChannelClosed),
            WorkerState::Launched | WorkerState::Connected => self
                .link
                .get()
                .map(Arc::as_ref)
                .ok_or(RunkitErr::NotLaunched),
        }
    }
}

async fn start_worker(launcher: Arc<dyn WorkerLauncher>, spec: LaunchSpec) -> Result<WorkerLink> {
    let WorkerTransport {
        writer,
        reader,
        child,
    } = launcher.launch(&spec).await?;
    let mut lines = BufReader::new(reader).lines();

    let pid = match tokio::time::timeout(spec.startup_timeout, wait_for_ready(&mut lines)).await {
        Ok(Ok(pid)) => pid,
        Ok(Err(err)) => {
            abandon(child);
            return Err(err);
        }
        Err(_) => {
            abandon(child);
            return Err(RunkitErr::launch(format!(
                "worker did not become ready within {:?}",
                spec.startup_timeout
            )));
        }
    };

    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let pending = PendingResponses::default();
    let closed = Arc::new(AtomicBool::new(false));
    let writer_task = tokio::spawn(write_loop(writer, outbound_rx));
    let reader_task = tokio::spawn(read_loop(lines, Arc::clone(&pending), Arc::clone(&closed)));

    Ok(WorkerLink {
        outbound,
        pending,
        closed,
        next_id: AtomicU64::new(1),
        pid,
        child: Mutex::new(child),
        tasks: Mutex::new(vec![writer_task, reader_task]),
        startup_timeout: spec.startup_timeout,
        shutdown_timeout: spec.shutdown_timeout,
    })
}

/// Waits for the worker to exit (killing it after the shutdown timeout), then
/// for the channel tasks to finish.
async fn close(link: Arc<WorkerLink>) {
    let child = lock(&link.child).take();
    if let Some(mut child) = child {
        match tokio::time::timeout(link.shutdown_timeout, child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "worker exited"),
            Ok(Err(err)) => warn!("failed to wait for worker: {err}"),
            Err(_) => {
                warn!(
                    "worker did not exit within {:?}; killing it",
                    link.shutdown_timeout
                );
                if let Err(err) = child.kill().await {
                    warn!("failed to kill worker: {err}");
                }
            }
        }
    }

    let tasks = std::mem::take(&mut *lock(&link.tasks));
    let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
    let joined = tokio::time::timeout(link.shutdown_timeout, async {
        for task in tasks {
            let _ = task.await;
        }
    })
    .await;
    if joined.is_err() {
        debug!("worker channel tasks still running; aborting them");
        for abort in aborts {
            abort.abort();
        }
    }
    lock(&link.pending).clear();
    info!(pid = link.pid, "worker shut down");
}

async fn wait_for_ready(lines: &mut WorkerLines) -> Result<u32> {
    loop {
        let line = lines
            .next_line()
            .await
            .map_err(|err| RunkitErr::launch_io("failed to read from worker", err))?;
        let Some(line) = line else {
            return Err(RunkitErr::launch("worker exited before becoming ready"));
        };
        match decode_line::<WorkerMessage>(&line) {
            Ok(WorkerMessage::Ready { pid, version }) => {
                debug!(pid, %version, "worker ready");
                return Ok(pid);
            }
            Ok(other) => warn!("ignoring worker message before ready: {other:?}"),
            Err(err) => warn!("ignoring malformed worker line: {err}"),
        }
    }
}

async fn write_loop(
    mut writer: Box<dyn AsyncWrite + Send + Unpin>,
    mut outbound: mpsc::UnboundedReceiver<HostMessage>,
) {
    while let Some(message) = outbound.recv().await {
        let last = matches!(
            message,
            HostMessage::Notification {
                body: WorkerNotification::Shutdown
            }
        );
        let line = match encode_line(&message) {
            Ok(line) => line,
            Err(err) => {
                warn!("failed to encode worker message: {err}");
                continue;
            }
        };
        if let Err(err) = writer.write_all(line.as_bytes()).await {
            warn!("failed to write to worker: {err}");
            break;
        }
        if let Err(err) = writer.flush().await {
            warn!("failed to flush worker channel: {err}");
            break;
        }
        if last {
            break;
        }
    }
    // Closing stdin tells the worker no more input is coming.
    let _ = writer.shutdown().await;
}

async fn read_loop(mut lines: WorkerLines, pending: PendingResponses, closed: Arc<AtomicBool>) {
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!("failed to read from worker: {err}");
                break;
            }
        };
        match decode_line::<WorkerMessage>(&line) {
            Ok(WorkerMessage::Response { id, result }) => {
                let waiter = lock(&pending).remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(result);
                    }
                    None => debug!(%id, "dropping response nobody is waiting for"),
                }
            }
            Ok(WorkerMessage::Ready { .. }) => trace!("duplicate ready message"),
            Err(err) => warn!("malformed worker message: {err}"),
        }
    }
    closed.store(true, Ordering::Release);
    // Dropping the senders wakes every waiter with a closed-channel error.
    lock(&pending).clear();
    debug!("worker channel closed");
}

fn abandon(child: Option<Child>) {
    if let Some(mut child) = child
        && let Err(err) = child.start_kill()
    {
        debug!("failed to kill worker: {err}");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct NeverLaunch;

    #[async_trait::async_trait]
    impl WorkerLauncher for NeverLaunch {
        async fn launch(&self, _spec: &LaunchSpec) -> Result<WorkerTransport> {
            Err(RunkitErr::launch("launcher disabled in tests"))
        }
    }

    fn handle() -> WorkerHandle {
        WorkerHandle::new(RunMode::Offline, Arc::new(NeverLaunch))
    }

    fn spec() -> LaunchSpec {
        LaunchSpec {
            mode: RunMode::Offline,
            api_key: None,
            base_url: "http://localhost".to_string(),
            log_path: "worker.log".into(),
            data_path: "run.jsonl".into(),
            startup_timeout: Duration::from_millis(100),
            shutdown_timeout: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn operations_before_launch_fail_with_not_launched() {
        let worker = handle();
        assert!(matches!(worker.connect().await, Err(RunkitErr::NotLaunched)));
        assert!(matches!(
            worker.send_output(StreamName::Stdout, b"x"),
            Err(RunkitErr::NotLaunched)
        ));
        assert!(matches!(
            worker
                .send_sync(WorkerRequest::Ping, Duration::from_millis(10))
                .await,
            Err(RunkitErr::NotLaunched)
        ));
        assert_eq!(worker.state(), WorkerState::Unlaunched);
    }

    #[tokio::test]
    async fn launch_is_claimed_even_when_it_fails() {
        let worker = handle();
        assert!(matches!(
            worker.launch(&spec()).await,
            Err(RunkitErr::Launch { .. })
        ));
        assert!(matches!(
            worker.launch(&spec()).await,
            Err(RunkitErr::AlreadyLaunched)
        ));
    }

    #[tokio::test]
    async fn shutdown_of_unlaunched_handle_closes_it() {
        let worker = handle();
        worker.shutdown().await.expect("shutdown");
        worker.shutdown().await.expect("second shutdown");
        assert_eq!(worker.state(), WorkerState::Closed);
        assert!(matches!(
            worker.send_run(RunRecord::new("abc")),
            Err(RunkitErr::ChannelClosed)
        ));
    }
}
