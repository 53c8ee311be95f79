//! Run initialization.
//!
//! Resolve settings, obtain a credential, launch and connect the worker,
//! install stream capture, build the session, register its metadata, then
//! publish it. Any failure is reported once, with the caller's location, and
//! the failure policy decides what the caller sees.

use std::panic::Location;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use chrono::Local;
use indexmap::IndexMap;
use runkit_protocol::RunMode;
use runkit_protocol::StreamName;
use serde_json::Value;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::auth::ensure_credential;
use crate::capture::CaptureCallback;
use crate::capture::StreamCapture;
use crate::config::Config;
use crate::context::LogPaths;
use crate::context::RunkitContext;
use crate::error::CredentialError;
use crate::error::Result;
use crate::error::RunkitErr;
use crate::exit_hooks::ExitHook;
use crate::run::CleanupAction;
use crate::run::RunId;
use crate::run::RunMetadata;
use crate::run::RunSession;
use crate::settings::CaptureMode;
use crate::settings::FailurePolicy;
use crate::settings::Settings;
use crate::settings::SettingsOverrides;
use crate::terminal::termwarn;
use crate::worker::LaunchSpec;
use crate::worker::WorkerHandle;

/// Options for one [`RunkitContext::start`] call. Unset fields fall back to the
/// context's settings.
#[derive(Debug, Clone, Default)]
pub struct InitParams {
    pub settings: SettingsOverrides,
    pub mode: Option<RunMode>,
    pub project: Option<String>,
    pub entity: Option<String>,
    pub group: Option<String>,
    pub name: Option<String>,
    pub config: Option<IndexMap<String, Value>>,
    pub reinit: Option<bool>,
}

impl InitParams {
    pub fn with_mode(mode: RunMode) -> Self {
        Self {
            mode: Some(mode),
            ..Default::default()
        }
    }
}

type Registered = Mutex<Option<Arc<CleanupAction>>>;

/// `Ok(None)` means there is no active session: either the mode is disabled or
/// initialization failed under a non-fatal policy.
///
/// Interrupts come from the context's interrupt token. Once it is cancelled,
/// every later call fails with [`RunkitErr::UserInterrupt`], which goes through
/// the failure policy like any other error.
pub(crate) async fn start(
    ctx: &RunkitContext,
    params: InitParams,
    caller: &'static Location<'static>,
) -> Result<Option<RunSession>> {
    let settings = Arc::new(resolve_settings(ctx.settings(), &params));
    let policy = settings.problem;
    let registered = Registered::default();

    let outcome = tokio::select! {
        biased;
        _ = ctx.interrupt_token().cancelled() => Err(RunkitErr::UserInterrupt),
        result = initialize(ctx, Arc::clone(&settings), params, &registered) => result,
    };

    let err = match outcome {
        Ok(run) => return Ok(run),
        Err(err) => err,
    };

    let pending = registered
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if let Some(cleanup) = pending {
        cleanup.run().await;
    }

    error!(
        location = %caller,
        mode = %settings.effective_mode(),
        "run initialization failed: {err}"
    );
    match policy {
        FailurePolicy::Fatal => Err(err),
        FailurePolicy::Warn => {
            termwarn(&format!("run initialization failed: {err}"));
            Ok(None)
        }
        FailurePolicy::Silent => Ok(None),
    }
}

fn resolve_settings(base: &Settings, params: &InitParams) -> Settings {
    let mut settings = base.with_overrides(&params.settings);
    if let Some(mode) = params.mode {
        settings.mode = mode;
    }
    if let Some(project) = &params.project {
        settings.project = Some(project.clone());
    }
    if let Some(entity) = &params.entity {
        settings.entity = Some(entity.clone());
    }
    if let Some(group) = &params.group {
        settings.group = Some(group.clone());
    }
    if let Some(name) = &params.name {
        settings.run_name = Some(name.clone());
    }
    if let Some(reinit) = params.reinit {
        settings.reinit = reinit;
    }
    settings
}

async fn initialize(
    ctx: &RunkitContext,
    settings: Arc<Settings>,
    params: InitParams,
    registered: &Registered,
) -> Result<Option<RunSession>> {
    let mode = settings.effective_mode();
    if mode.is_disabled() {
        debug!("runkit is disabled; not starting a run");
        return Ok(None);
    }

    let api_key = ensure_credential(&settings, ctx.credentials().as_ref())
        .await
        .map_err(|err| match err {
            CredentialError::Interrupted => RunkitErr::UserInterrupt,
            other => RunkitErr::Credential(other),
        })?;

    let id = RunId::generate();
    let paths = if settings.root_dir == ctx.settings().root_dir {
        ctx.paths().clone()
    } else {
        let paths = LogPaths::new(&settings.root_dir, Local::now(), std::process::id());
        paths.ensure_dir()?;
        paths
    };
    let data_path = paths.data_file(&id);
    let spec = LaunchSpec::new(
        &settings,
        Some(api_key),
        paths.internal_log.clone(),
        data_path.clone(),
    );

    let worker = Arc::new(WorkerHandle::new(mode, Arc::clone(ctx.launcher())));
    worker.launch(&spec).await?;

    let cleanup = CleanupAction::new(Arc::clone(&worker), ctx.published().clone());
    let hook: Arc<dyn ExitHook> = cleanup.clone();
    let hook_id = ctx.exit_hooks().register(hook);
    cleanup.set_registration(ctx.exit_hooks().registration(hook_id));
    *registered.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&cleanup));

    worker.connect().await?;

    if settings.capture == CaptureMode::Tee {
        install_captures(&worker, &cleanup)?;
    }

    let metadata = RunMetadata {
        project: settings.project.clone(),
        entity: settings.entity.clone(),
        group: settings.group.clone(),
        name: settings.run_name.clone(),
    };
    let config = Config::from_map(params.config.unwrap_or_default());
    let run = RunSession::new(
        id,
        Arc::clone(&settings),
        metadata,
        config,
        worker,
        data_path,
        cleanup,
    );

    sync_run(&run, &settings).await?;

    run.on_start();
    ctx.published().publish(run.clone(), settings.reinit);
    info!(run_id = %run.id(), %mode, "run started");
    Ok(Some(run))
}

fn install_captures(worker: &Arc<WorkerHandle>, cleanup: &CleanupAction) -> Result<()> {
    for name in [StreamName::Stdout, StreamName::Stderr] {
        let forward = Arc::clone(worker);
        let callback: CaptureCallback = Arc::new(move |stream, chunk: &[u8]| {
            // Nothing useful can be done with a failure here; the worker is
            // gone or shutting down.
            let _ = forward.send_output(stream, chunk);
        });
        let capture = Arc::new(StreamCapture::new(name, callback));
        capture.install().map_err(RunkitErr::Capture)?;
        cleanup.add_capture(capture);
    }
    Ok(())
}

/// Registers run metadata according to the run's mode.
async fn sync_run(run: &RunSession, settings: &Settings) -> Result<()> {
    let worker = run.worker();
    match run.mode() {
        RunMode::Online => {
            let remote = worker
                .send_run_sync(run.descriptor(), settings.online_sync_timeout())
                .await?;
            run.attach_remote(remote);
        }
        RunMode::Offline | RunMode::Dryrun => worker.send_run(run.descriptor())?,
        RunMode::Async | RunMode::Run => {
            let descriptor = run.descriptor();
            match worker
                .send_run_sync(descriptor.clone(), settings.async_sync_timeout())
                .await
            {
                Ok(remote) => run.attach_remote(remote),
                Err(err @ RunkitErr::HandshakeTimeout { .. }) => {
                    info!("run registration did not complete, continuing: {err}");
                }
                Err(err) => return Err(err),
            }
            // Sent even after a successful handshake; the receiving side
            // tolerates the duplicate.
            worker.send_run(descriptor)?;
        }
        RunMode::Disabled => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn explicit_options_override_settings_but_not_force_mode() {
        let base = Settings {
            project: Some("base".to_string()),
            force_mode: Some(RunMode::Offline),
            ..Default::default()
        };
        let params = InitParams {
            settings: SettingsOverrides {
                project: Some("override".to_string()),
                entity: Some("team".to_string()),
                ..Default::default()
            },
            mode: Some(RunMode::Online),
            project: Some("explicit".to_string()),
            reinit: Some(true),
            ..Default::default()
        };

        let settings = resolve_settings(&base, &params);

        assert_eq!(settings.project.as_deref(), Some("explicit"));
        assert_eq!(settings.entity.as_deref(), Some("team"));
        assert_eq!(settings.mode, RunMode::Online);
        assert_eq!(settings.effective_mode(), RunMode::Offline);
        assert!(settings.reinit);
    }
}
