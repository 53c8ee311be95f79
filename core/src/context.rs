//! Process-level state shared by every run started from one context.

use std::fs::OpenOptions;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Local;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::auth::CredentialProvider;
use crate::auth::InteractiveCredentials;
use crate::error::Result;
use crate::error::RunkitErr;
use crate::error::SettingsError;
use crate::exit_hooks::ExitHooks;
use crate::init::InitParams;
use crate::published::PublishedRuns;
use crate::run::RunId;
use crate::run::RunSession;
use crate::settings::Settings;
use crate::worker::ProcessLauncher;
use crate::worker::WorkerLauncher;

const LOG_DIR_NAME: &str = "runkit";
const LOG_FILTER_ENV_VAR: &str = "RUNKIT_LOG";
const DEFAULT_LOG_FILTER: &str = "runkit_core=debug,runkit=debug";

/// Where a context writes its logs and its runs write their data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPaths {
    pub dir: PathBuf,
    pub debug_log: PathBuf,
    pub internal_log: PathBuf,
    timespec: String,
}

impl LogPaths {
    pub fn new(root_dir: &Path, started_at: DateTime<Local>, pid: u32) -> Self {
        let dir = root_dir.join(LOG_DIR_NAME);
        let timespec = started_at.format("%Y%m%d_%H%M%S").to_string();
        Self {
            debug_log: dir.join(format!("runkit-{timespec}-{pid}-debug.log")),
            internal_log: dir.join(format!("runkit-{timespec}-{pid}-debug-internal.log")),
            dir,
            timespec,
        }
    }

    /// JSONL file the worker of run `id` persists into.
    pub fn data_file(&self, id: &RunId) -> PathBuf {
        self.dir.join(format!("run-{}-{id}.jsonl", self.timespec))
    }

    /// Creates the log directory and checks it accepts new files.
    pub fn ensure_dir(&self) -> std::result::Result<(), SettingsError> {
        let log_dir_err = |source| SettingsError::LogDir {
            path: self.dir.clone(),
            source,
        };
        std::fs::create_dir_all(&self.dir).map_err(log_dir_err)?;
        let marker = self.dir.join(format!(".write-test-{}", std::process::id()));
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&marker)
            .map_err(log_dir_err)?;
        let _ = std::fs::remove_file(&marker);
        Ok(())
    }
}

/// Holds what used to be ambient process state: resolved settings, the exit
/// hook registry, the published runs, and the capabilities runs are started
/// with. Cheap to clone.
#[derive(Clone)]
pub struct RunkitContext {
    settings: Arc<Settings>,
    paths: LogPaths,
    exit_hooks: ExitHooks,
    published: PublishedRuns,
    interrupt: CancellationToken,
    launcher: Arc<dyn WorkerLauncher>,
    credentials: Arc<dyn CredentialProvider>,
}

impl RunkitContext {
    /// Loads settings from the default locations and the environment.
    pub fn from_env() -> Result<Self> {
        Self::new(Settings::load()?)
    }

    pub fn new(settings: Settings) -> Result<Self> {
        let paths = LogPaths::new(&settings.root_dir, Local::now(), std::process::id());
        paths.ensure_dir()?;
        let launcher = Arc::new(ProcessLauncher::from_settings(&settings));
        Ok(Self {
            settings: Arc::new(settings),
            paths,
            exit_hooks: ExitHooks::new(),
            published: PublishedRuns::new(),
            interrupt: CancellationToken::new(),
            launcher,
            credentials: Arc::new(InteractiveCredentials::default()),
        })
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn WorkerLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Sends runkit's own tracing output to the debug log. The returned guard
    /// flushes the log when dropped. Fails if a global subscriber is already
    /// installed.
    pub fn init_logging(&self) -> Result<WorkerGuard> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.paths.debug_log)?;
        let (writer, guard) = tracing_appender::non_blocking(file);
        let filter = EnvFilter::try_from_env(LOG_FILTER_ENV_VAR)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true)
            .try_init()
            .map_err(|err| RunkitErr::Io(std::io::Error::other(err.to_string())))?;
        Ok(guard)
    }

    /// Starts a run. See [`crate::init`].
    #[track_caller]
    pub fn start(
        &self,
        params: InitParams,
    ) -> impl Future<Output = Result<Option<RunSession>>> + Send + '_ {
        crate::init::start(self, params, std::panic::Location::caller())
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    pub fn paths(&self) -> &LogPaths {
        &self.paths
    }

    pub fn exit_hooks(&self) -> &ExitHooks {
        &self.exit_hooks
    }

    pub fn published(&self) -> &PublishedRuns {
        &self.published
    }

    /// The most recently started run that has not finished.
    pub fn current_run(&self) -> Option<RunSession> {
        self.published.current()
    }

    /// Cancelling this token interrupts any initialization in progress.
    pub fn interrupt_token(&self) -> &CancellationToken {
        &self.interrupt
    }

    pub fn launcher(&self) -> &Arc<dyn WorkerLauncher> {
        &self.launcher
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialProvider> {
        &self.credentials
    }

    /// Runs every pending cleanup. Call before the process exits.
    pub async fn shutdown(&self) {
        self.exit_hooks.run_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn paths_follow_the_naming_scheme() {
        let started_at = Local
            .with_ymd_and_hms(2024, 3, 9, 14, 5, 7)
            .single()
            .expect("valid time");
        let paths = LogPaths::new(Path::new("/work"), started_at, 4242);

        assert_eq!(paths.dir, PathBuf::from("/work/runkit"));
        assert_eq!(
            paths.debug_log,
            PathBuf::from("/work/runkit/runkit-20240309_140507-4242-debug.log")
        );
        assert_eq!(
            paths.internal_log,
            PathBuf::from("/work/runkit/runkit-20240309_140507-4242-debug-internal.log")
        );
        assert_eq!(
            paths.data_file(&RunId::from("abc123xy".to_string())),
            PathBuf::from("/work/runkit/run-20240309_140507-abc123xy.jsonl")
        );
    }

    #[test]
    fn new_context_creates_the_log_dir() {
        let root = tempdir().expect("tempdir");
        let ctx = RunkitContext::new(Settings {
            root_dir: root.path().to_path_buf(),
            ..Default::default()
        })
        .expect("context");

        assert!(ctx.paths().dir.is_dir());
        assert!(ctx.current_run().is_none());
        assert!(ctx.exit_hooks().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn unwritable_log_dir_is_reported() {
        let root = tempdir().expect("tempdir");
        let blocker = root.path().join("file");
        std::fs::write(&blocker, "").expect("write");

        let err = RunkitContext::new(Settings {
            root_dir: blocker,
            ..Default::default()
        })
        .err()
        .expect("log dir error");
        assert!(matches!(
            err,
            RunkitErr::Settings(SettingsError::LogDir { .. })
        ));
    }
}
