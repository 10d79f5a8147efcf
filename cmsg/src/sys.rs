//! Small platform shims: local host name, socket buffer sizing, and the
//! process SIGPIPE mask.

use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Canonical name of the local host, falling back to `localhost` when the
/// platform refuses to say.
pub fn local_host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Requests a send-buffer size on a socket. Failure is harmless (the
/// kernel keeps its default), so the result is advisory.
pub fn set_send_buffer<S: AsRawFd>(sock: &S, size: usize) {
    let val = size as libc::c_int;
    unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &val as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

/// Requests a receive-buffer size on a socket.
pub fn set_recv_buffer<S: AsRawFd>(sock: &S, size: usize) {
    let val = size as libc::c_int;
    unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &val as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

// Live-connection count; SIGPIPE stays blocked while it is nonzero. A
// write to a dead socket must surface as an error, not kill the process.
static LIVE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

/// Adds SIGPIPE to the process signal mask for the lifetime of a
/// connection.
pub fn block_sigpipe() {
    if LIVE_CONNECTIONS.fetch_add(1, Ordering::SeqCst) == 0 {
        unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, libc::SIGPIPE);
            libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
        }
    }
}

/// Removes SIGPIPE from the mask once the last connection is gone.
pub fn restore_sigpipe() {
    if LIVE_CONNECTIONS.fetch_sub(1, Ordering::SeqCst) == 1 {
        unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, libc::SIGPIPE);
            libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut());
        }
    }
}
