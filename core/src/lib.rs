//! Host side of runkit: starts a tracked run, keeps a worker process alive for
//! it, and mirrors the process's output into that worker.

pub mod auth;
pub mod capture;
pub mod config;
mod context;
pub mod error;
pub mod exit_hooks;
mod init;
#[cfg(target_os = "linux")]
mod process_death;
mod published;
mod run;
pub mod settings;
pub mod terminal;
pub mod worker;

pub use auth::CredentialProvider;
pub use auth::FrontEnd;
pub use auth::InteractiveCredentials;
pub use auth::StaticCredentials;
pub use capture::StreamCapture;
pub use config::Config;
pub use context::LogPaths;
pub use context::RunkitContext;
pub use error::CredentialError;
pub use error::Result;
pub use error::RunkitErr;
pub use error::SettingsError;
pub use init::InitParams;
pub use published::PublishedRuns;
pub use run::CleanupAction;
pub use run::RunConfig;
pub use run::RunId;
pub use run::RunMetadata;
pub use run::RunSession;
pub use run::STEP_KEY;
pub use settings::CaptureMode;
pub use settings::FailurePolicy;
pub use settings::Settings;
pub use settings::SettingsOverrides;
pub use worker::WorkerHandle;
pub use worker::WorkerState;

pub use runkit_protocol::RemoteRun;
pub use runkit_protocol::RunMode;
pub use runkit_protocol::RunRecord;
pub use runkit_protocol::StreamName;
