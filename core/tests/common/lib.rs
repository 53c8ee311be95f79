//! Shared helpers for runkit integration tests: an in-process worker that
//! speaks the control protocol over an in-memory pipe and records everything
//! the host sends it.

use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use runkit_core::CaptureMode;
use runkit_core::Result;
use runkit_core::RunkitErr;
use runkit_core::Settings;
use runkit_core::worker::LaunchSpec;
use runkit_core::worker::WorkerLauncher;
use runkit_core::worker::WorkerTransport;
use runkit_protocol::HostMessage;
use runkit_protocol::RemoteRun;
use runkit_protocol::RunRecord;
use runkit_protocol::WorkerMessage;
use runkit_protocol::WorkerNotification;
use runkit_protocol::WorkerRequest;
use runkit_protocol::WorkerResult;
use runkit_protocol::message::decode_line;
use runkit_protocol::message::encode_line;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::io::DuplexStream;
use tokio::io::WriteHalf;

pub const TEST_API_KEY: &str = "rk-test-0123456789abcdef";

/// Settings for a test run rooted at `root`: a pre-supplied key, no stream
/// capture, short timeouts.
pub fn test_settings(root: &Path) -> Settings {
    Settings {
        api_key: Some(TEST_API_KEY.to_string()),
        capture: CaptureMode::Off,
        root_dir: root.to_path_buf(),
        home_dir: Some(root.join("home")),
        startup_timeout_ms: 2_000,
        online_sync_timeout_ms: 2_000,
        async_sync_timeout_ms: 2_000,
        shutdown_timeout_ms: 2_000,
        ..Default::default()
    }
}

/// How the fake worker answers `sync_run`.
#[derive(Debug, Clone)]
pub enum SyncBehavior {
    /// Answer with a remote run after `delay`.
    Respond { delay: Duration },
    /// Never answer.
    Never,
    /// Answer with an error.
    Fail(String),
}

impl Default for SyncBehavior {
    fn default() -> Self {
        Self::Respond {
            delay: Duration::ZERO,
        }
    }
}

#[derive(Clone, Default)]
pub struct FakeLauncher {
    inner: Arc<FakeInner>,
}

#[derive(Default)]
struct FakeInner {
    launches: AtomicUsize,
    fail_launch: Mutex<Option<String>>,
    sync: Mutex<SyncBehavior>,
    specs: Mutex<Vec<LaunchSpec>>,
    received: Mutex<Vec<HostMessage>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sync(self, behavior: SyncBehavior) -> Self {
        *lock(&self.inner.sync) = behavior;
        self
    }

    pub fn failing_launch(self, message: &str) -> Self {
        *lock(&self.inner.fail_launch) = Some(message.to_string());
        self
    }

    pub fn launches(&self) -> usize {
        self.inner.launches.load(Ordering::SeqCst)
    }

    pub fn specs(&self) -> Vec<LaunchSpec> {
        lock(&self.inner.specs).clone()
    }

    pub fn received(&self) -> Vec<HostMessage> {
        lock(&self.inner.received).clone()
    }

    pub fn notifications(&self) -> Vec<WorkerNotification> {
        self.received()
            .into_iter()
            .filter_map(|message| match message {
                HostMessage::Notification { body } => Some(body),
                HostMessage::Request { .. } => None,
            })
            .collect()
    }

    /// Fire-and-forget run deliveries.
    pub fn run_notifications(&self) -> Vec<RunRecord> {
        self.notifications()
            .into_iter()
            .filter_map(|body| match body {
                WorkerNotification::Run { run } => Some(run),
                _ => None,
            })
            .collect()
    }

    pub fn sync_requests(&self) -> Vec<RunRecord> {
        self.received()
            .into_iter()
            .filter_map(|message| match message {
                HostMessage::Request {
                    body: WorkerRequest::SyncRun { run },
                    ..
                } => Some(run),
                _ => None,
            })
            .collect()
    }

    /// Polls until `predicate` holds for the received messages or `timeout`
    /// passes. Returns whether it held.
    pub async fn wait_for<F>(&self, timeout: Duration, predicate: F) -> bool
    where
        F: Fn(&[HostMessage]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if predicate(&self.received()) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl WorkerLauncher for FakeLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<WorkerTransport> {
        self.inner.launches.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.specs).push(spec.clone());
        if let Some(message) = lock(&self.inner.fail_launch).clone() {
            return Err(RunkitErr::Launch {
                message,
                source: None,
            });
        }

        let (host_side, worker_side) = tokio::io::duplex(64 * 1024);
        let (host_read, host_write) = tokio::io::split(host_side);
        tokio::spawn(serve(worker_side, Arc::clone(&self.inner)));
        Ok(WorkerTransport {
            writer: Box::new(host_write),
            reader: Box::new(host_read),
            child: None,
        })
    }
}

type SharedWriter = Arc<tokio::sync::Mutex<WriteHalf<DuplexStream>>>;

async fn serve(stream: DuplexStream, inner: Arc<FakeInner>) {
    let (read, write) = tokio::io::split(stream);
    let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(write));
    send(
        &writer,
        &WorkerMessage::Ready {
            pid: std::process::id(),
            version: "test".to_string(),
        },
    )
    .await;

    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(message) = decode_line::<HostMessage>(&line) else {
            continue;
        };
        lock(&inner.received).push(message.clone());
        match message {
            HostMessage::Request {
                id,
                body: WorkerRequest::Ping,
            } => {
                send(
                    &writer,
                    &WorkerMessage::Response {
                        id,
                        result: WorkerResult::Pong,
                    },
                )
                .await;
            }
            HostMessage::Request {
                id,
                body: WorkerRequest::SyncRun { run },
            } => {
                let behavior = lock(&inner.sync).clone();
                let writer = Arc::clone(&writer);
                tokio::spawn(async move {
                    let result = match behavior {
                        SyncBehavior::Respond { delay } => {
                            tokio::time::sleep(delay).await;
                            WorkerResult::Run {
                                run: remote_run_for(&run),
                            }
                        }
                        SyncBehavior::Never => return,
                        SyncBehavior::Fail(message) => WorkerResult::Error { message },
                    };
                    send(&writer, &WorkerMessage::Response { id, result }).await;
                });
            }
            HostMessage::Notification {
                body: WorkerNotification::Shutdown,
            } => break,
            HostMessage::Notification { .. } => {}
        }
    }
    let _ = writer.lock().await.shutdown().await;
}

/// The remote run the fake answers `sync_run` with.
pub fn remote_run_for(run: &RunRecord) -> RemoteRun {
    RemoteRun {
        id: format!("remote-{}", run.run_id),
        name: run.name.clone(),
        url: Some(format!("https://app.runkit.test/runs/{}", run.run_id)),
        extra: Default::default(),
    }
}

async fn send<W>(writer: &Arc<tokio::sync::Mutex<W>>, message: &WorkerMessage)
where
    W: AsyncWrite + Unpin,
{
    let Ok(line) = encode_line(message) else {
        return;
    };
    let mut writer = writer.lock().await;
    let _ = writer.write_all(line.as_bytes()).await;
    let _ = writer.flush().await;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
