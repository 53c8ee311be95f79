use std::fs::File;
use std::io;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use runkit_protocol::StreamName;
use tracing::trace;

use super::CaptureCallback;

const READ_CHUNK_SIZE: usize = 8192;

/// An installed descriptor redirect: `target` points at a pipe whose reader
/// thread copies everything to `saved` (the original destination) and to the
/// callback.
pub(super) struct Redirect {
    target: RawFd,
    saved: OwnedFd,
    active: Arc<AtomicBool>,
    reader: thread::JoinHandle<()>,
    drained: mpsc::Receiver<()>,
}

impl Redirect {
    pub(super) fn install(
        name: StreamName,
        target: RawFd,
        callback: CaptureCallback,
    ) -> io::Result<Self> {
        flush_std(target);
        let (read_end, write_end) = pipe()?;
        let saved = dup_cloexec(target)?;
        let passthrough = saved.try_clone()?;

        // SAFETY: both descriptors are open for the duration of the call;
        // dup2 only rebinds `target`.
        cvt(unsafe { libc::dup2(write_end.as_raw_fd(), target) })?;
        // `target` now holds the only write end.
        drop(write_end);

        let active = Arc::new(AtomicBool::new(true));
        let (done_tx, drained) = mpsc::channel();
        let pump_active = Arc::clone(&active);
        let spawned = thread::Builder::new()
            .name(format!("runkit-capture-{name}"))
            .spawn(move || {
                pump(
                    name,
                    File::from(read_end),
                    File::from(passthrough),
                    &callback,
                    &pump_active,
                );
                let _ = done_tx.send(());
            });

        match spawned {
            Ok(reader) => Ok(Self {
                target,
                saved,
                active,
                reader,
                drained,
            }),
            Err(err) => {
                // SAFETY: `saved` is owned and open; this undoes the redirect.
                cvt(unsafe { libc::dup2(saved.as_raw_fd(), target) })?;
                Err(err)
            }
        }
    }

    pub(super) fn restore(self, drain_timeout: Duration) -> io::Result<()> {
        flush_std(self.target);
        // SAFETY: `saved` is owned and open. Rebinding `target` closes the
        // pipe's write end, which only the reader observes.
        cvt(unsafe { libc::dup2(self.saved.as_raw_fd(), self.target) })?;

        // Closing the last write end lets the reader hit EOF once it has
        // copied everything already in the pipe. A child process that
        // inherited the descriptor keeps the pipe open; give up on it then.
        match self.drained.recv_timeout(drain_timeout) {
            Ok(()) => {
                if self.reader.join().is_err() {
                    trace!("capture reader panicked");
                }
            }
            Err(_) => trace!(fd = self.target, "capture reader still busy; detaching"),
        }
        self.active.store(false, Ordering::Release);
        Ok(())
    }
}

fn pump(
    name: StreamName,
    mut source: File,
    mut passthrough: File,
    callback: &CaptureCallback,
    active: &AtomicBool,
) {
    let mut buf = [0u8; READ_CHUNK_SIZE];
    loop {
        match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let chunk = &buf[..n];
                if let Err(err) = passthrough.write_all(chunk) {
                    trace!(stream = %name, "capture passthrough failed: {err}");
                }
                if active.load(Ordering::Acquire) {
                    callback(name, chunk);
                }
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                trace!(stream = %name, "capture read failed: {err}");
                break;
            }
        }
    }
}

/// Pushes buffered Rust-side output through before the descriptor changes.
fn flush_std(target: RawFd) {
    let _ = match target {
        libc::STDOUT_FILENO => io::stdout().flush(),
        libc::STDERR_FILENO => io::stderr().flush(),
        _ => Ok(()),
    };
}

fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [0; 2];
    // SAFETY: `fds` has room for the two descriptors pipe(2) writes.
    cvt(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
    // SAFETY: pipe(2) succeeded, so both descriptors are open and owned by us.
    let (read_end, write_end) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    set_cloexec(read_end.as_raw_fd())?;
    set_cloexec(write_end.as_raw_fd())?;
    Ok((read_end, write_end))
}

fn dup_cloexec(fd: RawFd) -> io::Result<OwnedFd> {
    // SAFETY: F_DUPFD_CLOEXEC reads no memory; an invalid `fd` yields EBADF.
    let duplicate = cvt(unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) })?;
    // SAFETY: fcntl returned a fresh descriptor that nothing else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(duplicate) })
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: F_GETFD/F_SETFD only touch descriptor flags of `fd`, which the
    // caller owns.
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    // SAFETY: as above.
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) })?;
    Ok(())
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn has_cloexec(fd: &OwnedFd) -> bool {
        // SAFETY: `fd` is borrowed and open for the duration of the call.
        let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD) };
        flags != -1 && flags & libc::FD_CLOEXEC != 0
    }

    #[test]
    fn helper_descriptors_are_close_on_exec() {
        let (read_end, write_end) = pipe().expect("pipe");
        let duplicate = dup_cloexec(write_end.as_raw_fd()).expect("dup");

        assert!(has_cloexec(&read_end));
        assert!(has_cloexec(&write_end));
        assert!(has_cloexec(&duplicate));
        assert_ne!(duplicate.as_raw_fd(), write_end.as_raw_fd());
    }
}
