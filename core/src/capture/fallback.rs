use std::io;
use std::time::Duration;

use runkit_protocol::StreamName;
use tracing::warn;

use super::CaptureCallback;

/// Descriptor-level capture is unix-only; elsewhere installing succeeds but
/// nothing is mirrored.
pub(super) struct Redirect;

impl Redirect {
    pub(super) fn install(
        name: StreamName,
        _target: i32,
        _callback: CaptureCallback,
    ) -> io::Result<Self> {
        warn!(stream = %name, "stream capture is not supported on this platform");
        Ok(Self)
    }

    pub(super) fn restore(self, _drain_timeout: Duration) -> io::Result<()> {
        Ok(())
    }
}
