//! Termination signals delivered to the dispatch loop as [`DaemonMessage::Quit`].
//!
//! The first SIGINT or SIGTERM asks the loop to shut down cleanly: final
//! cycle, controllers closed, checkpoint saved. A second one while that is
//! still running exits immediately.

use std::thread;

use crossbeam_channel::Sender;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use tracing::{info, warn};

use crate::error::Result;
use crate::orchestrator::DaemonMessage;

/// Stops listening when dropped.
pub struct SignalForwarder {
    handle: Handle,
    listener: Option<thread::JoinHandle<()>>,
}

/// Starts a listener thread that turns termination signals into
/// [`DaemonMessage::Quit`] on `tx`.
pub fn forward_termination(tx: Sender<DaemonMessage>) -> Result<SignalForwarder> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let handle = signals.handle();
    let listener = thread::Builder::new()
        .name("volindex-signals".into())
        .spawn(move || {
            let mut requested = false;
            for signal in signals.forever() {
                if requested {
                    warn!(signal, "second termination signal, exiting without flushing");
                    std::process::exit(128 + signal);
                }
                requested = true;
                info!(signal, "termination signal received, shutting down");
                if tx.send(DaemonMessage::Quit).is_err() {
                    break;
                }
            }
        })?;

    Ok(SignalForwarder {
        handle,
        listener: Some(listener),
    })
}

impl Drop for SignalForwarder {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(listener) = self.listener.take() {
            let _ = listener.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn sigterm_becomes_a_quit_message() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let forwarder = forward_termination(tx).unwrap();

        signal_hook::low_level::raise(SIGTERM).unwrap();
        let message = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(message, DaemonMessage::Quit));

        drop(forwarder);
    }
}
