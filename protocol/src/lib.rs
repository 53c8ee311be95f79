//! Messages exchanged between a host process and its `runkit-worker`.
//!
//! The control channel is newline-delimited JSON: the host writes
//! [`HostMessage`] values to the worker's stdin and reads [`WorkerMessage`]
//! values from its stdout.

pub mod message;
pub mod mode;
pub mod run;

pub use message::HostMessage;
pub use message::OutputChunk;
pub use message::RequestId;
pub use message::WorkerMessage;
pub use message::WorkerNotification;
pub use message::WorkerRequest;
pub use message::WorkerResult;
pub use mode::RunMode;
pub use mode::StreamName;
pub use run::RemoteRun;
pub use run::RunRecord;

/// Environment variable carrying the bearer credential into the worker.
pub const API_KEY_ENV_VAR: &str = "RUNKIT_API_KEY";

/// Environment variable carrying the remote base URL into the worker.
pub const BASE_URL_ENV_VAR: &str = "RUNKIT_BASE_URL";
