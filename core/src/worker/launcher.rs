use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use runkit_protocol::API_KEY_ENV_VAR;
use runkit_protocol::BASE_URL_ENV_VAR;
use runkit_protocol::RunMode;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::ChildStderr;
use tokio::process::Command;
use tracing::debug;

use crate::error::Result;
use crate::error::RunkitErr;
use crate::settings::Settings;

pub const WORKER_PROGRAM: &str = "runkit-worker";

/// Everything a worker needs to know at startup.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub mode: RunMode,
    pub api_key: Option<String>,
    pub base_url: String,
    pub log_path: PathBuf,
    pub data_path: PathBuf,
    pub startup_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl LaunchSpec {
    pub fn new(
        settings: &Settings,
        api_key: Option<String>,
        log_path: PathBuf,
        data_path: PathBuf,
    ) -> Self {
        Self {
            mode: settings.effective_mode(),
            api_key,
            base_url: settings.base_url.clone(),
            log_path,
            data_path,
            startup_timeout: settings.startup_timeout(),
            shutdown_timeout: settings.shutdown_timeout(),
        }
    }

    /// How long the worker may wait on in-flight uploads after input ends.
    /// Half the host's shutdown budget, so the worker flushes and exits before
    /// the host gives up and kills it.
    pub fn drain_timeout(&self) -> Duration {
        self.shutdown_timeout / 2
    }
}

/// The duplex byte channel to a started worker. `child` is `None` when the
/// worker does not live in a separate OS process.
pub struct WorkerTransport {
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub child: Option<Child>,
}

/// Starts a worker and hands back its channel.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<WorkerTransport>;
}

/// Launches the `runkit-worker` binary as a child process speaking the
/// protocol over its stdin/stdout. The child is a fresh exec, so it inherits
/// no locks or threads from the host.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        match &settings.worker_program {
            Some(program) => Self::new(program.clone()),
            None => Self::new(default_worker_program()),
        }
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<WorkerTransport> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--mode")
            .arg(spec.mode.to_string())
            .arg("--log-file")
            .arg(&spec.log_path)
            .arg("--data-file")
            .arg(&spec.data_path)
            .arg("--drain-timeout-ms")
            .arg(spec.drain_timeout().as_millis().to_string())
            .env(BASE_URL_ENV_VAR, &spec.base_url)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match &spec.api_key {
            Some(key) => cmd.env(API_KEY_ENV_VAR, key),
            None => cmd.env_remove(API_KEY_ENV_VAR),
        };

        #[cfg(target_os = "linux")]
        {
            // SAFETY: getpid has no preconditions.
            let parent_pid = unsafe { libc::getpid() };
            // SAFETY: the hook only issues async-signal-safe syscalls.
            unsafe {
                cmd.pre_exec(move || {
                    crate::process_death::set_parent_death(parent_pid);
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn().map_err(|err| {
            RunkitErr::launch_io(format!("failed to spawn {}", self.program.display()), err)
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RunkitErr::launch("worker stdin was not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunkitErr::launch("worker stdout was not captured"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr));
        }
        debug!(program = %self.program.display(), pid = ?child.id(), "spawned worker");

        Ok(WorkerTransport {
            writer: Box::new(stdin),
            reader: Box::new(stdout),
            child: Some(child),
        })
    }
}

// Worker stderr must never reach the host's stderr: that stream may be
// captured and mirrored back into the worker.
async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "runkit::worker", "{line}");
    }
}

/// Prefers a worker binary next to the current executable, then `PATH`.
fn default_worker_program() -> PathBuf {
    let file_name = format!("{WORKER_PROGRAM}{}", std::env::consts::EXE_SUFFIX);
    if let Some(dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(PathBuf::from))
    {
        let candidate = dir.join(&file_name);
        if candidate.is_file() {
            return candidate;
        }
    }
    which::which(WORKER_PROGRAM).unwrap_or_else(|_| PathBuf::from(file_name))
}
