//! Cooperative cancellation.
//!
//! SIGINT/SIGTERM set a global flag; collectors check it at every wait and
//! shut their workers down cleanly. Nothing is torn down from inside the
//! signal handler itself.

use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

extern "C" fn handle_signal(_: i32) {
    INTERRUPTED.store(true, Ordering::Relaxed);
}

/// Install the handlers. Called once at startup, before threads exist.
pub fn install_handlers() {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    let action = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // Only fails for invalid signal numbers.
    unsafe {
        let _ = sigaction(Signal::SIGINT, &action);
        let _ = sigaction(Signal::SIGTERM, &action);
    }
}
