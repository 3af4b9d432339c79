//! One-shot phase signalling for the capella benchmark.
//!
//! A run has exactly one phase change that matters: the deadline. Every sender
//! must stop generating once it passes, and none of them may miss it. This
//! crate provides the mechanism as a `Broadcaster` and a `Watcher`. The
//! `Broadcaster` fires once, consuming itself. The `Watcher` observes the
//! firing either by awaiting [`Watcher::recv`] or, in tight loops that must
//! not yield, by polling [`Watcher::has_fired`].
//!
//! There is only one `Broadcaster` and potentially many `Watcher` instances.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Instant,
};

use tokio::sync::broadcast::{self, error};
use tracing::debug;

/// Construct a `Watcher` and `Broadcaster` pair.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    // The broadcast channel is never sent on. Dropping the sender closes the
    // channel, which wakes every receiver exactly once.
    let (sender, receiver) = broadcast::channel(1);
    let fired = Arc::new(AtomicBool::new(false));

    let w = Watcher {
        fired: Arc::clone(&fired),
        receiver,
    };
    let b = Broadcaster { fired, sender };

    (w, b)
}

/// Errors produced by [`Broadcaster::signal_at`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The timer thread could not be spawned.
    #[error("Failed to spawn timer thread: {0}")]
    Spawn(#[from] io::Error),
}

#[derive(Debug)]
/// Mechanism to notify one or more `Watcher` instances that the phase has been
/// reached.
pub struct Broadcaster {
    /// Set once the signal is sent, read without synchronization by watchers.
    fired: Arc<AtomicBool>,
    /// Dropped to wake any `Watcher` parked in `recv`.
    sender: broadcast::Sender<()>,
}

impl Broadcaster {
    /// Send the signal through any `Watcher` instances.
    ///
    /// Function does not block.
    pub fn signal(self) {
        self.fired.store(true, Ordering::Release);
        drop(self.sender);
    }

    /// Send the signal once `deadline` passes.
    ///
    /// The wait happens on a dedicated OS thread, not on the async runtime, so
    /// the signal fires on time even when every runtime worker is busy in a
    /// loop that never yields. The thread is detached; it exits right after
    /// signalling.
    ///
    /// # Errors
    ///
    /// Returns an error if the timer thread cannot be spawned. The signal is
    /// not sent in that case.
    pub fn signal_at(self, deadline: Instant) -> Result<(), Error> {
        thread::Builder::new()
            .name("capella-deadline".to_string())
            .spawn(move || {
                let now = Instant::now();
                if deadline > now {
                    thread::sleep(deadline - now);
                }
                debug!("deadline reached, signalling watchers");
                self.signal();
            })?;
        Ok(())
    }
}

#[derive(Debug)]
/// Mechanism to watch for the phase change, typically the run deadline.
pub struct Watcher {
    /// Shared with the `Broadcaster`.
    fired: Arc<AtomicBool>,
    /// Closed by the `Broadcaster` when the signal is sent.
    receiver: broadcast::Receiver<()>,
}

impl Watcher {
    /// Check whether the signal has been sent, without blocking.
    ///
    /// This is a single atomic load and is cheap enough to call once per loop
    /// iteration on a hot path.
    #[inline]
    #[must_use]
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Receive the signal. This function will wait if the signal has not
    /// already been sent and returns immediately otherwise.
    ///
    /// # Panics
    ///
    /// Panics if the broadcast receiver has lagged behind. Nothing is ever sent
    /// on the channel so this indicates a programming error in this crate.
    pub async fn recv(mut self) {
        if self.has_fired() {
            return;
        }

        match self.receiver.recv().await {
            Ok(()) | Err(error::RecvError::Closed) => {}
            Err(error::RecvError::Lagged(_)) => {
                panic!("Catastrophic programming error: lagged behind");
            }
        }
    }
}

impl Clone for Watcher {
    fn clone(&self) -> Self {
        Self {
            fired: Arc::clone(&self.fired),
            receiver: self.receiver.resubscribe(),
        }
    }
}
