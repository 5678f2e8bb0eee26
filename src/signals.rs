// Polling-based Unix signal handling (lock-free).

use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;

static RECEIVED_SIGNAL: AtomicUsize = AtomicUsize::new(0);

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

        pub type Caught = Signal;

        extern "C" fn handler(sig: i32) {
            RECEIVED_SIGNAL.store(sig as usize, Ordering::SeqCst);
        }

        pub fn install_signal_handlers() -> Result<()> {
            let action = SigAction::new(SigHandler::Handler(handler), SaFlags::empty(), SigSet::empty());
            for sig in [Signal::SIGINT, Signal::SIGTERM] {
                // SAFETY: the handler only stores into an atomic
                unsafe { signal::sigaction(sig, &action) }
                    .map_err(|e| anyhow::anyhow!("Failed to register {sig:?} handler: {e}"))?;
            }
            Ok(())
        }

        /// Non-blocking check, returns Some(signal) once per delivery.
        pub fn check_signals() -> Option<Caught> {
            let val = RECEIVED_SIGNAL.swap(0, Ordering::AcqRel);
            if val == 0 {
                return None;
            }
            match Signal::try_from(val as i32) {
                Ok(sig) => Some(sig),
                Err(e) => {
                    log::error!("BUG: Invalid signal number {val} from signal handler: {e}");
                    None
                }
            }
        }
    } else {
        pub type Caught = usize;

        pub fn install_signal_handlers() -> Result<()> {
            log::warn!("signal handling unavailable on this platform; Ctrl-C ends the supervisor without stopping its services");
            Ok(())
        }

        pub fn check_signals() -> Option<Caught> {
            match RECEIVED_SIGNAL.swap(0, Ordering::AcqRel) {
                0 => None,
                val => Some(val),
            }
        }
    }
}
