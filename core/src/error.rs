use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RunkitErr>;

#[derive(Debug, Error)]
pub enum RunkitErr {
    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    /// The worker process could not be started or never reported ready.
    #[error("failed to launch worker: {message}")]
    Launch {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("worker already launched")]
    AlreadyLaunched,

    #[error("worker not launched")]
    NotLaunched,

    /// A correlated request did not get its response in time. The worker may
    /// still complete it; the late response is discarded.
    #[error("worker did not answer within {timeout:?}")]
    HandshakeTimeout { timeout: Duration },

    #[error("worker handle closed")]
    ChannelClosed,

    #[error("interrupted")]
    UserInterrupt,

    /// The worker answered a request with an error.
    #[error("worker error: {0}")]
    Worker(String),

    #[error("unexpected worker message: {0}")]
    Protocol(String),

    #[error("stream capture failed: {0}")]
    Capture(#[source] std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RunkitErr {
    pub(crate) fn launch(message: impl Into<String>) -> Self {
        Self::Launch {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn launch_io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Launch {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::HandshakeTimeout { .. })
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no API key available; set RUNKIT_API_KEY or log in")]
    Missing,

    #[error("API key prompt was declined")]
    Declined,

    #[error("API key prompt was interrupted")]
    Interrupted,

    #[error("cannot prompt for an API key without an attended terminal")]
    Unattended,

    #[error("failed to prompt for API key: {0}")]
    Prompt(String),

    #[error("failed to access credentials file {path}: {source}")]
    Store {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },

    #[error("log directory {path} is not writable: {source}")]
    LogDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
