/// Async-safe interruption routing for the orchestrator
///
/// SIGTERM and SIGHUP request shutdown: the wait loop notices the flag and
/// moves the session into teardown. SIGINT only gets recorded; it belongs to
/// the interactive shell in the same terminal.
use crate::config::types::Result;
use log::{debug, info};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Global shutdown flag (async-safe atomic)
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Last signal received (async-safe atomic)
static SIGNAL_RECEIVED: AtomicU32 = AtomicU32::new(0);

/// Number of SIGINTs seen while a session was active
static INTERRUPTS_SEEN: AtomicU32 = AtomicU32::new(0);

/// Signal handler state
pub struct SignalHandler;

impl SignalHandler {
    /// Install handlers for SIGINT, SIGTERM and SIGHUP.
    ///
    /// SIGINT gets a recording handler rather than `SIG_IGN`, because an
    /// ignored disposition would be inherited by the session's command.
    pub fn init() -> Result<Self> {
        let shutdown = SigAction::new(
            SigHandler::Handler(Self::shutdown_handler),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        let interrupt = SigAction::new(
            SigHandler::Handler(Self::interrupt_handler),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        // SAFETY: both handlers only touch atomics.
        unsafe {
            signal::sigaction(Signal::SIGTERM, &shutdown)?;
            signal::sigaction(Signal::SIGHUP, &shutdown)?;
            signal::sigaction(Signal::SIGINT, &interrupt)?;
        }

        debug!("Signal handlers installed (SIGINT, SIGTERM, SIGHUP)");
        Ok(Self)
    }

    /// Only performs atomic operations - no allocations, no locks, no I/O
    extern "C" fn shutdown_handler(signal: libc::c_int) {
        SIGNAL_RECEIVED.store(signal as u32, Ordering::SeqCst);
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    }

    extern "C" fn interrupt_handler(signal: libc::c_int) {
        SIGNAL_RECEIVED.store(signal as u32, Ordering::SeqCst);
        INTERRUPTS_SEEN.fetch_add(1, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
    }

    /// Get signal that was received (0 if none)
    pub fn get_signal(&self) -> u32 {
        SIGNAL_RECEIVED.load(Ordering::SeqCst)
    }

    pub fn interrupts_seen(&self) -> u32 {
        INTERRUPTS_SEEN.load(Ordering::SeqCst)
    }

    /// Clear recorded state before a new session
    pub fn reset(&self) {
        SHUTDOWN_REQUESTED.store(false, Ordering::SeqCst);
        SIGNAL_RECEIVED.store(0, Ordering::SeqCst);
        INTERRUPTS_SEEN.store(0, Ordering::SeqCst);
    }

    /// Log what arrived during the session
    pub fn report(&self) {
        let interrupts = self.interrupts_seen();
        if interrupts > 0 {
            debug!("{} SIGINT(s) left to the session command", interrupts);
        }
        if self.shutdown_requested() {
            info!("Shutdown requested by signal {}", self.get_signal());
        }
    }
}

/// Main loop helper that checks for signals
/// Returns true if should continue, false if should shutdown
pub fn should_continue() -> bool {
    !SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_handler_init() {
        assert!(SignalHandler::init().is_ok());
    }

    // One test touches the global flags so parallel tests cannot race on them.
    #[test]
    fn test_interrupt_then_shutdown() {
        let handler = SignalHandler::init().unwrap();
        handler.reset();

        SignalHandler::interrupt_handler(libc::SIGINT);
        assert_eq!(handler.interrupts_seen(), 1);
        assert!(!handler.shutdown_requested());
        assert!(should_continue());

        SignalHandler::shutdown_handler(libc::SIGTERM);
        assert!(handler.shutdown_requested());
        assert!(!should_continue());
        assert_eq!(handler.get_signal(), libc::SIGTERM as u32);

        handler.reset();
        assert!(should_continue());
    }
}
