//! Layered run settings.
//!
//! Resolution order, lowest to highest: built-in defaults, the global settings
//! file, the project-local settings file, `RUNKIT_*` environment variables,
//! then per-call overrides. `force_mode` beats every other mode source.

use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use runkit_protocol::RunMode;
use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;
use strum_macros::EnumString;

use crate::error::SettingsError;

pub const DEFAULT_BASE_URL: &str = "https://api.runkit.dev";

const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_ONLINE_SYNC_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_ASYNC_SYNC_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

const SETTINGS_FILE_NAME: &str = "settings.toml";
const LOCAL_SETTINGS_DIR: &str = "runkit";

/// What initialization does with an error it cannot recover from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum FailurePolicy {
    /// Return the error to the caller.
    Fatal,
    /// Tell the user, then continue without a run.
    Warn,
    /// Continue without a run; the error only reaches the debug log.
    #[default]
    Silent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum CaptureMode {
    /// Tee stdout/stderr into the worker.
    #[default]
    Tee,
    Off,
}

/// A fully resolved settings snapshot. Shared as `Arc<Settings>` once
/// resolved and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    pub mode: RunMode,
    pub force_mode: Option<RunMode>,
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub project: Option<String>,
    pub entity: Option<String>,
    pub group: Option<String>,
    pub run_name: Option<String>,
    pub problem: FailurePolicy,
    pub reinit: bool,
    pub capture: CaptureMode,
    pub root_dir: PathBuf,
    pub home_dir: Option<PathBuf>,
    pub worker_program: Option<PathBuf>,
    pub startup_timeout_ms: u64,
    pub online_sync_timeout_ms: u64,
    pub async_sync_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mode: RunMode::default(),
            force_mode: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            project: None,
            entity: None,
            group: None,
            run_name: None,
            problem: FailurePolicy::default(),
            reinit: false,
            capture: CaptureMode::default(),
            root_dir: PathBuf::from("."),
            home_dir: None,
            worker_program: None,
            startup_timeout_ms: DEFAULT_STARTUP_TIMEOUT_MS,
            online_sync_timeout_ms: DEFAULT_ONLINE_SYNC_TIMEOUT_MS,
            async_sync_timeout_ms: DEFAULT_ASYNC_SYNC_TIMEOUT_MS,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
        }
    }
}

impl Settings {
    /// Loads settings for the current process: default file locations and the
    /// process environment.
    pub fn load() -> Result<Self, SettingsError> {
        let mut files = Vec::new();
        if let Some(config_dir) = dirs::config_dir() {
            files.push(config_dir.join("runkit").join(SETTINGS_FILE_NAME));
        }
        files.push(PathBuf::from(LOCAL_SETTINGS_DIR).join(SETTINGS_FILE_NAME));
        Self::load_from(&files, std::env::vars())
    }

    /// Layers `files` (in order, missing files skipped) and then `env` over
    /// the defaults.
    pub fn load_from<I>(files: &[PathBuf], env: I) -> Result<Self, SettingsError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut settings = Settings::default();
        for path in files {
            if let Some(layer) = SettingsOverrides::from_toml_file(path)? {
                settings = settings.with_overrides(&layer);
            }
        }
        let env_layer = SettingsOverrides::from_env(env)?;
        Ok(settings.with_overrides(&env_layer))
    }

    /// Returns a copy with every field set in `overrides` replaced.
    pub fn with_overrides(&self, overrides: &SettingsOverrides) -> Settings {
        let mut next = self.clone();
        let o = overrides.clone();
        if let Some(v) = o.mode {
            next.mode = v;
        }
        if let Some(v) = o.force_mode {
            next.force_mode = Some(v);
        }
        if let Some(v) = o.base_url {
            next.base_url = v;
        }
        if let Some(v) = o.api_key {
            next.api_key = Some(v);
        }
        if let Some(v) = o.project {
            next.project = Some(v);
        }
        if let Some(v) = o.entity {
            next.entity = Some(v);
        }
        if let Some(v) = o.group {
            next.group = Some(v);
        }
        if let Some(v) = o.run_name {
            next.run_name = Some(v);
        }
        if let Some(v) = o.problem {
            next.problem = v;
        }
        if let Some(v) = o.reinit {
            next.reinit = v;
        }
        if let Some(v) = o.capture {
            next.capture = v;
        }
        if let Some(v) = o.root_dir {
            next.root_dir = v;
        }
        if let Some(v) = o.home_dir {
            next.home_dir = Some(v);
        }
        if let Some(v) = o.worker_program {
            next.worker_program = Some(v);
        }
        if let Some(v) = o.startup_timeout_ms {
            next.startup_timeout_ms = v;
        }
        if let Some(v) = o.online_sync_timeout_ms {
            next.online_sync_timeout_ms = v;
        }
        if let Some(v) = o.async_sync_timeout_ms {
            next.async_sync_timeout_ms = v;
        }
        if let Some(v) = o.shutdown_timeout_ms {
            next.shutdown_timeout_ms = v;
        }
        next
    }

    /// The mode a run actually uses.
    pub fn effective_mode(&self) -> RunMode {
        self.force_mode.unwrap_or(self.mode)
    }

    /// Where the stored credentials file lives.
    pub fn home(&self) -> PathBuf {
        match &self.home_dir {
            Some(dir) => dir.clone(),
            None => dirs::config_dir()
                .map(|dir| dir.join("runkit"))
                .unwrap_or_else(|| self.root_dir.join(".runkit")),
        }
    }

    /// Web front-end URL derived from the API base URL.
    pub fn app_url(&self) -> String {
        self.base_url
            .trim_end_matches('/')
            .replacen("//api.", "//app.", 1)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn online_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.online_sync_timeout_ms)
    }

    pub fn async_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.async_sync_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// A partial settings layer. Every unset field leaves the lower layer alone.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SettingsOverrides {
    pub mode: Option<RunMode>,
    pub force_mode: Option<RunMode>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub project: Option<String>,
    pub entity: Option<String>,
    pub group: Option<String>,
    pub run_name: Option<String>,
    pub problem: Option<FailurePolicy>,
    pub reinit: Option<bool>,
    pub capture: Option<CaptureMode>,
    pub root_dir: Option<PathBuf>,
    pub home_dir: Option<PathBuf>,
    pub worker_program: Option<PathBuf>,
    pub startup_timeout_ms: Option<u64>,
    pub online_sync_timeout_ms: Option<u64>,
    pub async_sync_timeout_ms: Option<u64>,
    pub shutdown_timeout_ms: Option<u64>,
}

impl SettingsOverrides {
    /// Reads a TOML layer. A missing file is not an error.
    pub fn from_toml_file(path: &Path) -> Result<Option<Self>, SettingsError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(SettingsError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        toml::from_str(&contents)
            .map(Some)
            .map_err(|source| SettingsError::Parse {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Builds a layer from `RUNKIT_*` variables; other variables are ignored.
    pub fn from_env<I>(vars: I) -> Result<Self, SettingsError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut layer = SettingsOverrides::default();
        for (key, value) in vars {
            if value.trim().is_empty() {
                continue;
            }
            match key.as_str() {
                "RUNKIT_MODE" => layer.mode = Some(parse_value("RUNKIT_MODE", &value)?),
                "RUNKIT_FORCE_MODE" => {
                    layer.force_mode = Some(parse_value("RUNKIT_FORCE_MODE", &value)?)
                }
                "RUNKIT_BASE_URL" => layer.base_url = Some(value),
                "RUNKIT_API_KEY" => layer.api_key = Some(value.trim().to_string()),
                "RUNKIT_PROJECT" => layer.project = Some(value),
                "RUNKIT_ENTITY" => layer.entity = Some(value),
                "RUNKIT_RUN_GROUP" => layer.group = Some(value),
                "RUNKIT_NAME" => layer.run_name = Some(value),
                "RUNKIT_PROBLEM" => layer.problem = Some(parse_value("RUNKIT_PROBLEM", &value)?),
                "RUNKIT_REINIT" => layer.reinit = Some(parse_bool("RUNKIT_REINIT", &value)?),
                "RUNKIT_CAPTURE" => layer.capture = Some(parse_value("RUNKIT_CAPTURE", &value)?),
                "RUNKIT_DIR" => layer.root_dir = Some(PathBuf::from(value)),
                "RUNKIT_HOME" => layer.home_dir = Some(PathBuf::from(value)),
                "RUNKIT_WORKER" => layer.worker_program = Some(PathBuf::from(value)),
                "RUNKIT_STARTUP_TIMEOUT_MS" => {
                    layer.startup_timeout_ms = Some(parse_value("RUNKIT_STARTUP_TIMEOUT_MS", &value)?)
                }
                "RUNKIT_SHUTDOWN_TIMEOUT_MS" => {
                    layer.shutdown_timeout_ms =
                        Some(parse_value("RUNKIT_SHUTDOWN_TIMEOUT_MS", &value)?)
                }
                _ => {}
            }
        }
        Ok(layer)
    }
}

fn parse_value<T: FromStr>(key: &'static str, value: &str) -> Result<T, SettingsError> {
    value
        .trim()
        .parse()
        .map_err(|_| SettingsError::InvalidValue {
            key,
            value: value.to_string(),
        })
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, SettingsError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SettingsError::InvalidValue {
            key,
            value: value.to_string(),
        }),
    }
}
