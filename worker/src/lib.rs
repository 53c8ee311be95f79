//! The `runkit-worker` process: reads host messages from stdin, answers on
//! stdout, persists what the run sends, and talks to the remote service.

mod remote;
mod store;

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use runkit_protocol::HostMessage;
use runkit_protocol::RequestId;
use runkit_protocol::RunMode;
use runkit_protocol::WorkerMessage;
use runkit_protocol::WorkerNotification;
use runkit_protocol::WorkerRequest;
use runkit_protocol::WorkerResult;
use runkit_protocol::message::decode_line;
use runkit_protocol::message::encode_line;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::debug;
use tracing::info;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub use remote::RemoteClient;
pub use remote::RemoteError;
pub use store::DataStore;

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const LOG_FILTER_ENV_VAR: &str = "RUNKIT_LOG";

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub mode: RunMode,
    pub data_file: PathBuf,
    pub base_url: String,
    pub api_key: Option<String>,
    /// How long to wait for in-flight uploads once input ends.
    pub drain_timeout: Duration,
}

impl WorkerOptions {
    pub fn new(mode: RunMode, data_file: PathBuf, base_url: String) -> Self {
        Self {
            mode,
            data_file,
            base_url,
            api_key: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// Serves one host over `input`/`output` until the host sends `shutdown` or
/// closes `input`.
pub async fn run_main<R, W>(opts: WorkerOptions, input: R, output: W) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(output, out_rx));

    let remote = if opts.mode.uses_network() {
        match RemoteClient::new(&opts.base_url, opts.api_key.as_deref()) {
            Ok(client) => Some(client),
            Err(err) => {
                warn!("remote service unavailable: {err}");
                None
            }
        }
    } else {
        None
    };
    let mut store = DataStore::open(&opts.data_file, opts.mode.persists_locally())
        .await
        .with_context(|| format!("failed to open data file {}", opts.data_file.display()))?;

    let _ = out_tx.send(WorkerMessage::Ready {
        pid: std::process::id(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    });
    info!(mode = %opts.mode, data_file = %opts.data_file.display(), "worker ready");

    let mut background = JoinSet::new();
    let mut lines = BufReader::new(input).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("host closed the channel");
                break;
            }
            Err(err) => {
                warn!("failed to read from host: {err}");
                break;
            }
        };
        let message = match decode_line::<HostMessage>(&line) {
            Ok(message) => message,
            Err(err) => {
                warn!("ignoring malformed host message: {err}");
                continue;
            }
        };

        match message {
            HostMessage::Request { id, body } => {
                handle_request(id, body, opts.mode, remote.as_ref(), &out_tx, &mut background);
            }
            HostMessage::Notification {
                body: WorkerNotification::Shutdown,
            } => {
                info!("shutdown requested");
                break;
            }
            HostMessage::Notification { body } => {
                if let Err(err) = store.append(&body).await {
                    warn!("failed to persist record: {err}");
                }
                if let (WorkerNotification::Run { run }, Some(client)) = (&body, &remote) {
                    let client = client.clone();
                    let run = run.clone();
                    background.spawn(async move {
                        match client.upsert_run(&run).await {
                            Ok(remote) => debug!(run_id = %run.run_id, remote_id = %remote.id, "run uploaded"),
                            Err(err) => warn!(run_id = %run.run_id, "run upload failed: {err}"),
                        }
                    });
                }
            }
        }

        while let Some(result) = background.try_join_next() {
            if let Err(err) = result {
                warn!("background task failed: {err}");
            }
        }
    }

    // Local data must not depend on the remote service: flush before waiting
    // on uploads, which the host may cut short by killing the process.
    store.flush().await.context("failed to flush data file")?;

    if !background.is_empty() {
        debug!(pending = background.len(), "draining background work");
        let drained = tokio::time::timeout(opts.drain_timeout, async {
            while background.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "background work still running after {:?}; abandoning it",
                opts.drain_timeout
            );
            background.abort_all();
        }
    }

    info!(records = store.records(), "worker exiting");
    drop(out_tx);
    drop(background);
    if let Err(err) = writer.await {
        warn!("output task failed: {err}");
    }
    Ok(())
}

fn handle_request(
    id: RequestId,
    body: WorkerRequest,
    mode: RunMode,
    remote: Option<&RemoteClient>,
    out_tx: &mpsc::UnboundedSender<WorkerMessage>,
    background: &mut JoinSet<()>,
) {
    match body {
        WorkerRequest::Ping => {
            let _ = out_tx.send(WorkerMessage::Response {
                id,
                result: WorkerResult::Pong,
            });
        }
        WorkerRequest::SyncRun { run } => {
            let Some(client) = remote.cloned() else {
                let _ = out_tx.send(WorkerMessage::Response {
                    id,
                    result: WorkerResult::Error {
                        message: format!("run registration is unavailable in {mode} mode"),
                    },
                });
                return;
            };
            let out_tx = out_tx.clone();
            background.spawn(async move {
                let result = match client.upsert_run(&run).await {
                    Ok(run) => WorkerResult::Run { run },
                    Err(err) => WorkerResult::Error {
                        message: err.to_string(),
                    },
                };
                let _ = out_tx.send(WorkerMessage::Response { id, result });
            });
        }
    }
}

async fn write_loop<W>(mut output: W, mut messages: mpsc::UnboundedReceiver<WorkerMessage>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = messages.recv().await {
        let line = match encode_line(&message) {
            Ok(line) => line,
            Err(err) => {
                warn!("failed to encode message: {err}");
                continue;
            }
        };
        if let Err(err) = output.write_all(line.as_bytes()).await {
            warn!("failed to write to host: {err}");
            break;
        }
        if let Err(err) = output.flush().await {
            warn!("failed to flush host channel: {err}");
            break;
        }
    }
    let _ = output.shutdown().await;
}

/// Logs to `path`, appending. The guard flushes on drop.
pub fn init_logging(path: &Path) -> anyhow::Result<WorkerGuard> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(file);
    let filter =
        EnvFilter::try_from_env(LOG_FILTER_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("debug"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to install logger: {err}"))?;
    Ok(guard)
}
