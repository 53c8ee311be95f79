// Ties the worker's lifetime to the host on platforms that support it.
// On Linux the worker gets SIGTERM when the host dies, and exits right away if
// the host already died between fork and exec.

/// Runs in the forked child before exec; only async-signal-safe calls here.
///
/// # Arguments
///
/// * `parent_pid` - PID of the host captured before fork.
pub(crate) fn set_parent_death(parent_pid: libc::pid_t) {
    // SAFETY: prctl, getppid, getpid and kill are async-signal-safe and take
    // no pointers.
    unsafe {
        // Ignore errors: losing the death signal only loses the fast path,
        // the worker still exits on stdin EOF.
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
        if libc::getppid() != parent_pid {
            libc::kill(libc::getpid(), libc::SIGTERM);
        }
    }
}
