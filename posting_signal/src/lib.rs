//! One-shot phase signal for the posting emulator.
//!
//! The emulator loop runs until the process is told to stop. That instruction
//! arrives from outside, ctrl-c in the binary or a test harness, and has to
//! reach a loop that is usually asleep or waiting on in-flight requests. The
//! mechanism here has two halves: a single `Broadcaster` that fires exactly
//! once, and any number of `Watcher` instances that observe the firing.
//!
//! Watchers are checked only at the loop's suspension points, so a signal never
//! interrupts a cycle half way through its dispatch.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![deny(unreachable_pub)]

use tokio::sync::watch;
use tracing::info;

/// Construct a `Watcher` and `Broadcaster` pair.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    let (sender, receiver) = watch::channel(false);
    (Watcher { receiver }, Broadcaster { sender })
}

#[derive(Debug)]
/// Fires the signal for every `Watcher` derived from the same pair.
pub struct Broadcaster {
    sender: watch::Sender<bool>,
}

impl Broadcaster {
    /// Send the signal to all `Watcher` instances.
    ///
    /// Function will NOT wait for watchers to observe the signal.
    pub fn signal(self) {
        self.sender.send_replace(true);
    }

    /// Send the signal to all `Watcher` instances.
    ///
    /// Function WILL wait until every `Watcher` has been dropped, that is,
    /// until every component holding one has wound down.
    pub async fn signal_and_wait(self) {
        self.sender.send_replace(true);
        let peers = self.sender.receiver_count();
        if peers > 0 {
            info!("Waiting for {peers} peers");
        }
        self.sender.closed().await;
    }
}

#[derive(Debug, Clone)]
/// Observes the signal sent by a `Broadcaster`.
pub struct Watcher {
    receiver: watch::Receiver<bool>,
}

impl Watcher {
    /// Wait for the signal. Returns immediately if it has already been sent.
    ///
    /// A `Broadcaster` dropped without signalling counts as signalled: nobody
    /// is left who could ever fire it. This future is cancel safe and may be
    /// polled repeatedly from a `select!` loop.
    pub async fn recv(&mut self) {
        // An error here means the broadcaster is gone.
        let _ = self.receiver.wait_for(|signalled| *signalled).await;
    }
}
