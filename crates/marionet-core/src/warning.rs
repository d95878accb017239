//! Throttled warning channel.
//!
//! Solvers run every frame, so a broken rig would otherwise repeat the same
//! message at frame rate. The channel is a process-wide latch: the first
//! warning of an episode is emitted through [`log::warn!`], further warnings
//! are swallowed until [`reset`] re-arms the latch.

use std::sync::atomic::{AtomicBool, Ordering};

static LOGGED: AtomicBool = AtomicBool::new(false);

/// Emit `message` if no warning has been emitted since the last [`reset`].
///
/// Returns `true` if the message was actually emitted.
pub fn log(message: &str) -> bool {
    if LOGGED.swap(true, Ordering::Relaxed) {
        return false;
    }
    log::warn!("{message}");
    true
}

/// Whether a warning has been emitted since the last [`reset`].
pub fn logged() -> bool {
    LOGGED.load(Ordering::Relaxed)
}

/// Re-arm the channel so the next warning is emitted again.
pub fn reset() {
    LOGGED.store(false, Ordering::Relaxed);
}
