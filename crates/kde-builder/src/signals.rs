//! Signal supervisor.
//!
//! `SIGHUP` requests a graceful stop: the current project finishes, then
//! the run winds down. `SIGINT`/`SIGTERM` (and friends) request a hard
//! stop: the task manager kills its children, the lock is released, and
//! the process exits with the signal number. Handlers only set flags; all
//! real work happens on the main thread between projects, which is enough
//! for a tool whose unit of work is a whole subprocess.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::{Context, Result};
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};

#[derive(Debug, Clone, Default)]
pub struct SignalState {
    stop_requested: Arc<AtomicBool>,
    hard_signal: Arc<AtomicUsize>,
}

impl SignalState {
    /// Graceful-stop flag (SIGHUP or `stop-on-failure`).
    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Relaxed)
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Relaxed);
    }

    /// The hard signal received, if any.
    pub fn hard_signal(&self) -> Option<i32> {
        match self.hard_signal.load(Ordering::Relaxed) {
            0 => None,
            n => Some(n as i32),
        }
    }
}

/// Install the handlers and return the shared state.
pub fn install() -> Result<SignalState> {
    let state = SignalState::default();

    signal_hook::flag::register(SIGHUP, Arc::clone(&state.stop_requested))
        .context("failed to install SIGHUP handler")?;
    for sig in [SIGINT, SIGTERM, SIGQUIT] {
        signal_hook::flag::register_usize(
            sig,
            Arc::clone(&state.hard_signal),
            sig as usize,
        )
        .with_context(|| format!("failed to install handler for signal {sig}"))?;
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_start_clear() {
        let state = SignalState::default();
        assert!(!state.stop_requested());
        assert_eq!(state.hard_signal(), None);
    }

    #[test]
    fn request_stop_sets_the_flag() {
        let state = SignalState::default();
        state.request_stop();
        assert!(state.stop_requested());
    }

    #[test]
    fn hard_signal_round_trips() {
        let state = SignalState::default();
        state.hard_signal.store(SIGINT as usize, Ordering::Relaxed);
        assert_eq!(state.hard_signal(), Some(SIGINT));
    }

    #[test]
    fn clones_share_state() {
        let state = SignalState::default();
        let view = state.clone();
        state.request_stop();
        assert!(view.stop_requested());
    }
}
