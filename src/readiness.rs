// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Readiness Signal
//!
//! A level signal meaning "a usable session exists now". It is not an event queue:
//! the connection manager overwrites the current value on every change, and a
//! reader only ever sees the latest one. Each successful (re)connection carries a
//! new generation number, so a reader that slept through several reconnects still
//! notices that the session it last used has been replaced.

use tokio::sync::watch;

/// Current readiness as published by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    NotReady,
    /// A session exists; the number identifies the connection that created it.
    Ready(u64),
    Closed,
}

/// Read-only handle to the readiness of a connection manager.
#[derive(Debug, Clone)]
pub struct ReadinessSignal {
    rx: watch::Receiver<Readiness>,
    seen: u64,
}

impl ReadinessSignal {
    pub(crate) fn new(rx: watch::Receiver<Readiness>) -> Self {
        ReadinessSignal { rx, seen: 0 }
    }

    /// The latest published value.
    pub fn current(&self) -> Readiness {
        *self.rx.borrow()
    }

    /// Waits until a generation newer than the last one returned by this handle is
    /// ready and returns it. Returns `None` once the manager is closed.
    pub async fn ready(&mut self) -> Option<u64> {
        loop {
            let current = *self.rx.borrow_and_update();
            match current {
                Readiness::Ready(generation) if generation > self.seen => {
                    self.seen = generation;
                    return Some(generation);
                }
                Readiness::Closed => return None,
                _ => {}
            }

            if self.rx.changed().await.is_err() {
                return None;
            }
        }
    }
}

/// Writing side, owned by the connection manager.
#[derive(Debug)]
pub(crate) struct ReadinessPublisher {
    tx: watch::Sender<Readiness>,
}

impl ReadinessPublisher {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(Readiness::NotReady);
        ReadinessPublisher { tx }
    }

    pub(crate) fn subscribe(&self) -> ReadinessSignal {
        ReadinessSignal::new(self.tx.subscribe())
    }

    /// Overwrites the current value. Never blocks, even with no reader.
    pub(crate) fn post(&self, readiness: Readiness) {
        self.tx.send_replace(readiness);
    }
}
