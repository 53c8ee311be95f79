use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::OnceLock;
use std::sync::PoisonError;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use indexmap::IndexMap;
use rand::Rng;
use runkit_protocol::RemoteRun;
use runkit_protocol::RunMode;
use runkit_protocol::RunRecord;
use serde_json::Value;
use tracing::debug;
use tracing::warn;

use crate::capture::StreamCapture;
use crate::config::Config;
use crate::error::Result;
use crate::exit_hooks::ExitHook;
use crate::exit_hooks::HookRegistration;
use crate::published::PublishedRuns;
use crate::settings::Settings;
use crate::terminal::termlog;
use crate::worker::WorkerHandle;

const RUN_ID_LEN: usize = 8;
const RUN_ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// History key carrying the row's sequence number.
pub const STEP_KEY: &str = "_step";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunId(String);

impl RunId {
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let id = (0..RUN_ID_LEN)
            .map(|_| char::from(RUN_ID_CHARSET[rng.random_range(0..RUN_ID_CHARSET.len())]))
            .collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RunId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata hints recorded with a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunMetadata {
    pub project: Option<String>,
    pub entity: Option<String>,
    pub group: Option<String>,
    pub name: Option<String>,
}

/// Shared view of a run's configuration. Every stored write is mirrored to the
/// worker as a full snapshot.
#[derive(Clone)]
pub struct RunConfig {
    config: Arc<Mutex<Config>>,
    worker: Arc<WorkerHandle>,
}

impl RunConfig {
    fn new(config: Config, worker: Arc<WorkerHandle>) -> Self {
        Self {
            config: Arc::new(Mutex::new(config)),
            worker,
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    /// Returns whether the write was stored; writes to keys locked by another
    /// writer are dropped.
    pub fn set(&self, key: impl Into<String>, value: Value, writer: Option<&str>) -> Result<bool> {
        let stored = self.lock().set(key, value, writer);
        if stored {
            self.sync()?;
        }
        Ok(stored)
    }

    pub fn update<I>(&self, entries: I, writer: Option<&str>) -> Result<usize>
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let stored = self.lock().update(entries, writer);
        if stored > 0 {
            self.sync()?;
        }
        Ok(stored)
    }

    pub fn setdefaults<I>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        self.lock().setdefaults(entries);
        self.sync()
    }

    pub fn update_locked<I>(&self, entries: I, writer: &str) -> Result<usize>
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let stored = self.lock().update_locked(entries, writer);
        if stored > 0 {
            self.sync()?;
        }
        Ok(stored)
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().into_iter().map(str::to_string).collect()
    }

    pub fn locked_by(&self, key: &str) -> Option<String> {
        self.lock().locked_by(key).map(str::to_string)
    }

    pub fn snapshot(&self) -> IndexMap<String, Value> {
        self.lock().as_map().clone()
    }

    fn sync(&self) -> Result<()> {
        let snapshot = self.snapshot();
        self.worker.send_config(snapshot)
    }

    fn lock(&self) -> MutexGuard<'_, Config> {
        self.config.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A tracked run. Cheap to clone; every clone refers to the same run.
#[derive(Clone)]
pub struct RunSession {
    inner: Arc<RunInner>,
}

struct RunInner {
    id: RunId,
    settings: Arc<Settings>,
    metadata: RunMetadata,
    config: RunConfig,
    worker: Arc<WorkerHandle>,
    remote: OnceLock<RemoteRun>,
    data_path: PathBuf,
    cleanup: Arc<CleanupAction>,
    step: AtomicU64,
    started: AtomicBool,
    finished: AtomicBool,
}

impl RunSession {
    pub(crate) fn new(
        id: RunId,
        settings: Arc<Settings>,
        metadata: RunMetadata,
        config: Config,
        worker: Arc<WorkerHandle>,
        data_path: PathBuf,
        cleanup: Arc<CleanupAction>,
    ) -> Self {
        let run = Self {
            inner: Arc::new(RunInner {
                id,
                settings,
                metadata,
                config: RunConfig::new(config, Arc::clone(&worker)),
                worker,
                remote: OnceLock::new(),
                data_path,
                cleanup: Arc::clone(&cleanup),
                step: AtomicU64::new(0),
                started: AtomicBool::new(false),
                finished: AtomicBool::new(false),
            }),
        };
        cleanup.attach(&run);
        run
    }

    pub fn id(&self) -> &RunId {
        &self.inner.id
    }

    pub fn mode(&self) -> RunMode {
        self.inner.worker.mode()
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn metadata(&self) -> &RunMetadata {
        &self.inner.metadata
    }

    pub fn config(&self) -> &RunConfig {
        &self.inner.config
    }

    pub fn worker(&self) -> &Arc<WorkerHandle> {
        &self.inner.worker
    }

    /// Set only after a successful synchronous handshake.
    pub fn remote(&self) -> Option<&RemoteRun> {
        self.inner.remote.get()
    }

    pub fn url(&self) -> Option<&str> {
        self.remote().and_then(|remote| remote.url.as_deref())
    }

    pub fn data_path(&self) -> &Path {
        &self.inner.data_path
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }

    /// The record sent to the worker and remote service.
    pub fn descriptor(&self) -> RunRecord {
        let metadata = &self.inner.metadata;
        RunRecord {
            run_id: self.inner.id.to_string(),
            project: metadata.project.clone(),
            entity: metadata.entity.clone(),
            group: metadata.group.clone(),
            name: metadata.name.clone(),
            config: self.inner.config.snapshot(),
        }
    }

    /// Appends a history row, stamping it with the next step number unless
    /// the row already carries one.
    pub fn log(&self, mut row: IndexMap<String, Value>) -> Result<u64> {
        let step = self.inner.step.fetch_add(1, Ordering::Relaxed);
        row.entry(STEP_KEY.to_string()).or_insert(Value::from(step));
        self.inner.worker.send_history(row)?;
        Ok(step)
    }

    /// Finishes the run: restores captured streams and waits for the worker to
    /// flush and exit.
    pub async fn join(&self) {
        self.inner.cleanup.run().await;
    }

    pub(crate) fn attach_remote(&self, remote: RemoteRun) {
        if self.inner.remote.set(remote).is_err() {
            debug!(run_id = %self.inner.id, "remote run already attached");
        }
    }

    pub(crate) fn on_start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let id = &self.inner.id;
        match self.url() {
            Some(url) => termlog(&format!("Tracking run {id} at {url}")),
            None => termlog(&format!("Tracking run {id} ({})", self.mode())),
        }
        if self.mode() == RunMode::Offline {
            termlog(&format!(
                "Run data is saved locally in {}",
                self.inner.data_path.display()
            ));
        }
    }

    pub(crate) fn on_finish(&self) {
        if self.inner.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        let id = &self.inner.id;
        match self.url() {
            Some(url) => termlog(&format!("Finished run {id}: {url}")),
            None => termlog(&format!("Finished run {id}")),
        }
    }
}

impl fmt::Debug for RunSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunSession")
            .field("id", &self.inner.id)
            .field("mode", &self.mode())
            .field("remote", &self.remote())
            .finish_non_exhaustive()
    }
}

/// Tears a run down: uninstalls captures (newest first), shuts the worker
/// down, then emits the finish notification and drops its exit hook.
/// Effective once; later calls return immediately.
pub struct CleanupAction {
    done: AtomicBool,
    captures: Mutex<Vec<Arc<StreamCapture>>>,
    worker: Arc<WorkerHandle>,
    published: PublishedRuns,
    run: OnceLock<Weak<RunInner>>,
    registration: OnceLock<HookRegistration>,
}

impl CleanupAction {
    pub(crate) fn new(worker: Arc<WorkerHandle>, published: PublishedRuns) -> Arc<Self> {
        Arc::new(Self {
            done: AtomicBool::new(false),
            captures: Mutex::new(Vec::new()),
            worker,
            published,
            run: OnceLock::new(),
            registration: OnceLock::new(),
        })
    }

    pub(crate) fn set_registration(&self, registration: HookRegistration) {
        if self.registration.set(registration).is_err() {
            debug!("cleanup already registered");
        }
    }

    pub(crate) fn add_capture(&self, capture: Arc<StreamCapture>) {
        self.lock_captures().push(capture);
    }

    fn attach(&self, run: &RunSession) {
        let _ = self.run.set(Arc::downgrade(&run.inner));
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub async fn run(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        self.uninstall_captures();
        if let Err(err) = self.worker.shutdown().await {
            warn!("failed to shut down worker: {err}");
        }
        self.finish_run();
    }

    /// Same teardown for callers that cannot await. Blocks until the worker
    /// has flushed and exited, bounded by its shutdown timeout.
    pub fn run_blocking(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        self.uninstall_captures();
        self.worker.shutdown_blocking();
        self.finish_run();
    }

    fn uninstall_captures(&self) {
        let captures = std::mem::take(&mut *self.lock_captures());
        for capture in captures.iter().rev() {
            if let Err(err) = capture.uninstall() {
                warn!(stream = %capture.name(), "failed to restore stream: {err}");
            }
        }
    }

    fn finish_run(&self) {
        if let Some(registration) = self.registration.get() {
            registration.unregister();
        }
        let Some(inner) = self.run.get().and_then(Weak::upgrade) else {
            return;
        };
        let run = RunSession { inner };
        run.on_finish();
        self.published.remove(run.id());
    }

    fn lock_captures(&self) -> MutexGuard<'_, Vec<Arc<StreamCapture>>> {
        self.captures.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ExitHook for CleanupAction {
    async fn run(&self) {
        CleanupAction::run(self).await;
    }

    fn run_blocking(&self) {
        CleanupAction::run_blocking(self);
    }
}
