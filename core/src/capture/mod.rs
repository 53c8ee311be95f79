//! Tee a standard stream into a callback without taking it away from its
//! original destination.
//!
//! On unix the redirect happens at the file-descriptor level, so output from
//! child processes and C code sharing the descriptor is captured too.

use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use runkit_protocol::StreamName;
use tracing::debug;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as backend;

#[cfg(not(unix))]
mod fallback;
#[cfg(not(unix))]
use fallback as backend;

/// Receives every captured chunk while the capture is installed. Runs on the
/// capture's reader thread, so it must not write to the captured stream.
pub type CaptureCallback = Arc<dyn Fn(StreamName, &[u8]) + Send + Sync>;

/// How long `uninstall` waits for the reader to drain what was already
/// written before detaching it.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

pub struct StreamCapture {
    name: StreamName,
    target: i32,
    callback: CaptureCallback,
    // Guards install/uninstall only; the write path never takes this lock.
    installed: Mutex<Option<backend::Redirect>>,
}

impl StreamCapture {
    pub fn new(name: StreamName, callback: CaptureCallback) -> Self {
        let target = match name {
            StreamName::Stdout => 1,
            StreamName::Stderr => 2,
        };
        Self::with_fd(name, target, callback)
    }

    /// Captures an arbitrary descriptor, reporting its chunks as `name`.
    pub fn with_fd(name: StreamName, fd: i32, callback: CaptureCallback) -> Self {
        Self {
            name,
            target: fd,
            callback,
            installed: Mutex::new(None),
        }
    }

    pub fn name(&self) -> StreamName {
        self.name
    }

    pub fn is_installed(&self) -> bool {
        self.installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Starts teeing. Installing an installed capture does nothing.
    pub fn install(&self) -> io::Result<()> {
        let mut slot = self.installed.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Ok(());
        }
        let redirect = backend::Redirect::install(self.name, self.target, self.callback.clone())?;
        debug!(stream = %self.name, fd = self.target, "stream capture installed");
        *slot = Some(redirect);
        Ok(())
    }

    /// Restores the original destination and unregisters the callback.
    /// Uninstalling a capture that is not installed does nothing.
    pub fn uninstall(&self) -> io::Result<()> {
        let redirect = self
            .installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match redirect {
            Some(redirect) => {
                redirect.restore(DRAIN_TIMEOUT)?;
                debug!(stream = %self.name, "stream capture removed");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for StreamCapture {
    fn drop(&mut self) {
        if let Err(err) = self.uninstall() {
            debug!(stream = %self.name, "failed to restore captured stream: {err}");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs::File;
    use std::io::Write;
    use std::os::fd::AsRawFd;

    fn recorder() -> (CaptureCallback, Arc<Mutex<Vec<u8>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: CaptureCallback = Arc::new(move |_, chunk: &[u8]| {
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(chunk);
        });
        (callback, seen)
    }

    fn captured(seen: &Arc<Mutex<Vec<u8>>>) -> String {
        String::from_utf8_lossy(&seen.lock().unwrap_or_else(PoisonError::into_inner)).into_owned()
    }

    #[test]
    fn tees_to_original_and_callback_until_uninstalled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.txt");
        let mut file = File::create(&path).expect("create");
        let (callback, seen) = recorder();
        let capture = StreamCapture::with_fd(StreamName::Stdout, file.as_raw_fd(), callback);

        capture.install().expect("install");
        assert!(capture.is_installed());
        file.write_all(b"during\n").expect("write during");
        capture.uninstall().expect("uninstall");
        file.write_all(b"after\n").expect("write after");

        assert!(!capture.is_installed());
        assert_eq!(captured(&seen), "during\n");
        assert_eq!(
            std::fs::read_to_string(&path).expect("read"),
            "during\nafter\n"
        );
    }

    #[test]
    fn repeated_install_and_uninstall_are_noops() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("err.txt");
        let mut file = File::create(&path).expect("create");
        let (callback, seen) = recorder();
        let capture = StreamCapture::with_fd(StreamName::Stderr, file.as_raw_fd(), callback);

        capture.install().expect("install");
        capture.install().expect("second install");
        file.write_all(b"once\n").expect("write");
        capture.uninstall().expect("uninstall");
        capture.uninstall().expect("second uninstall");

        assert_eq!(captured(&seen), "once\n");
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "once\n");
    }

    #[test]
    fn uninstall_from_another_thread_restores_the_stream() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.txt");
        let mut file = File::create(&path).expect("create");
        let (callback, seen) = recorder();
        let capture = Arc::new(StreamCapture::with_fd(
            StreamName::Stdout,
            file.as_raw_fd(),
            callback,
        ));

        capture.install().expect("install");
        file.write_all(b"mirrored\n").expect("write");
        let remote = Arc::clone(&capture);
        std::thread::spawn(move || remote.uninstall())
            .join()
            .expect("join")
            .expect("uninstall");
        file.write_all(b"direct\n").expect("write");

        assert_eq!(captured(&seen), "mirrored\n");
        assert_eq!(
            std::fs::read_to_string(&path).expect("read"),
            "mirrored\ndirect\n"
        );
    }
}
