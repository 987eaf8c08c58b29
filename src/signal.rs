//! One-shot signalling primitives for connection establishment.

use tokio::sync::watch;

/// One-shot "it happened" signal with any number of waiters.
///
/// Built on a `watch` channel so that a waiter subscribing after the signal
/// fired still observes it (the same semantics as closing a channel).
#[derive(Debug, Clone)]
pub struct Signal {
    tx: watch::Sender<bool>,
}

/// Waiter half of a [`Signal`].
#[derive(Debug, Clone)]
pub struct SignalWaiter {
    rx: watch::Receiver<bool>,
}

pub fn signal_pair() -> (Signal, SignalWaiter) {
    let (tx, rx) = watch::channel(false);
    (Signal { tx }, SignalWaiter { rx })
}

impl Signal {
    /// Fire the signal. Subsequent calls are no-ops.
    pub fn notify(&self) {
        let _ = self.tx.send(true);
    }

    pub fn waiter(&self) -> SignalWaiter {
        SignalWaiter {
            rx: self.tx.subscribe(),
        }
    }
}

impl SignalWaiter {
    /// Wait until the signal fires. Returns `false` if every [`Signal`]
    /// handle was dropped without firing.
    pub async fn wait(&mut self) -> bool {
        self.rx.wait_for(|fired| *fired).await.is_ok()
    }
}

/// Wait until a `watch`-carried flag becomes true. A dropped sender counts
/// as triggered, so a vanished controller behaves like a shutdown.
pub async fn wait_flag(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|flag| *flag).await;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FuseState {
    Unset,
    Latched(bool),
}

/// One-shot boolean latch: the first [`fuse`](BooleanFuse::fuse) call wins,
/// later calls are ignored. Exactly one transition happens per serve attempt.
#[derive(Debug)]
pub struct BooleanFuse {
    tx: watch::Sender<FuseState>,
}

impl BooleanFuse {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(FuseState::Unset);
        Self { tx }
    }

    pub fn fuse(&self, value: bool) {
        self.tx.send_if_modified(|state| {
            if *state == FuseState::Unset {
                *state = FuseState::Latched(value);
                true
            } else {
                false
            }
        });
    }

    pub fn value(&self) -> bool {
        matches!(*self.tx.borrow(), FuseState::Latched(true))
    }

    /// Wait for the latch and return its value.
    pub async fn await_value(&self) -> bool {
        let mut rx = self.tx.subscribe();
        let result = match rx.wait_for(|state| *state != FuseState::Unset).await {
            Ok(state) => *state == FuseState::Latched(true),
            // All senders gone can't happen while `self` is alive; treat
            // defensively as "never connected".
            Err(_) => false,
        };
        result
    }
}

impl Default for BooleanFuse {
    fn default() -> Self {
        Self::new()
    }
}
