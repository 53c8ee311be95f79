use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;
use strum_macros::EnumString;

/// How a run synchronizes its metadata with the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum RunMode {
    /// Blocking handshake; a failed handshake fails initialization.
    Online,
    /// Local persistence only.
    Offline,
    /// Neither network nor local persistence.
    Dryrun,
    /// No worker, no run.
    #[serde(alias = "noop")]
    #[strum(to_string = "disabled", serialize = "noop")]
    Disabled,
    /// Bounded handshake followed by a fire-and-forget delivery.
    #[default]
    Async,
    /// Same policy as [`RunMode::Async`].
    Run,
}

impl RunMode {
    pub fn is_disabled(self) -> bool {
        matches!(self, RunMode::Disabled)
    }

    /// Whether the worker talks to the remote service in this mode.
    pub fn uses_network(self) -> bool {
        matches!(self, RunMode::Online | RunMode::Async | RunMode::Run)
    }

    /// Whether the worker appends records to its data file in this mode.
    pub fn persists_locally(self) -> bool {
        !matches!(self, RunMode::Dryrun | RunMode::Disabled)
    }
}

/// A host stream that can be captured and mirrored to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StreamName {
    Stdout,
    Stderr,
}
