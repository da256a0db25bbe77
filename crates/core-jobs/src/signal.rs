//! Fatal-signal latch. SIGINT, SIGTERM, and SIGHUP set a process-wide
//! flag; the scheduler checks it at every wait boundary and unwinds to a
//! consistent state before propagating termination to its children.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;

static EXIT_ASAP: AtomicBool = AtomicBool::new(false);
static INSTALL: Once = Once::new();

extern "C" fn on_fatal_signal(_sig: libc::c_int) {
    EXIT_ASAP.store(true, Ordering::SeqCst);
}

/// Install the latch handlers. Idempotent.
pub fn install_exit_signals() {
    INSTALL.call_once(|| unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = on_fatal_signal as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        for sig in [libc::SIGINT, libc::SIGTERM, libc::SIGHUP] {
            libc::sigaction(sig, &sa, std::ptr::null_mut());
        }
    });
}

/// Whether a fatal signal has been received.
pub fn exit_asap() -> bool {
    EXIT_ASAP.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_sets_on_signal() {
        install_exit_signals();
        assert!(!exit_asap());
        unsafe {
            libc::raise(libc::SIGHUP);
        }
        assert!(exit_asap());
        EXIT_ASAP.store(false, Ordering::SeqCst);
    }
}
