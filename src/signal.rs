//! Unix signal handling (SIGINT, SIGTERM).
//!
//! The daemon turns either signal into a shutdown request, which the main
//! loop notices and handles like the `shutdown` RPC: interrupt any build,
//! wait for it, then exit.  A second signal while shutting down kills us.

use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

fn set_action(sig: libc::c_int, handler: libc::sighandler_t) {
    // Safety: registering a signal handler is libc unsafe code.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handler;
        libc::sigaction(sig, &sa, std::ptr::null_mut());
    }
}

extern "C" fn shutdown_handler(sig: libc::c_int) {
    // Only async-signal-safe work here: an atomic store and sigaction.
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    set_action(sig, libc::SIG_DFL);
}

pub fn register() {
    set_action(libc::SIGINT, shutdown_handler as libc::sighandler_t);
    set_action(libc::SIGTERM, shutdown_handler as libc::sighandler_t);
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}
