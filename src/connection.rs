// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Manager
//!
//! Owns the single broker connection of the process and its session. The first
//! [`connect`](ConnectionManager::connect) retries until the broker answers; after
//! that a watcher task listens for connection failures and reconnects with the
//! same backoff, posting a new generation on the readiness signal each time a
//! session becomes usable.
//!
//! States move `Disconnected → Connecting → Connected`, back to `Connecting` on a
//! connection failure, and to `Closed` (terminal) on [`close`](ConnectionManager::close).
//! While reconnecting no session is handed out, so publishers fail fast with
//! [`AmqpError::NotReady`] instead of waiting for the reconnect lock.

use crate::{
    backoff::Backoff,
    configs::{BrokerEndpoint, RabbitMQConfigs},
    channel::LapinConnector,
    errors::AmqpError,
    readiness::{Readiness, ReadinessPublisher, ReadinessSignal},
    session::{BrokerConnection, Connector, Established, Session},
    topology::Topology,
};
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, Notify},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle state of the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// Tunables of a [`ConnectionManager`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub backoff: Backoff,
    /// Re-declare the last declared topology after every reconnect.
    pub redeclare_topology: bool,
}

type LossReceiver = mpsc::UnboundedReceiver<AmqpError>;

/// Bound on releasing the resources of a failed connection before redialing.
const STALE_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

struct Slot {
    state: ConnectionState,
    generation: u64,
    connection: Option<Arc<dyn BrokerConnection>>,
    session: Option<Arc<dyn Session>>,
}

struct Inner {
    endpoint: BrokerEndpoint,
    connector: Arc<dyn Connector>,
    options: ConnectionOptions,
    slot: Mutex<Slot>,
    // serialises connect and reconnect sequences
    reconnect: tokio::sync::Mutex<()>,
    readiness: ReadinessPublisher,
    // raised when a handed-out session turned out to be closed
    stale: Notify,
    shutdown: CancellationToken,
    watcher: Mutex<Option<JoinHandle<()>>>,
    topology: Mutex<Option<Topology>>,
}

/// Handle to the shared connection. Clones refer to the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        endpoint: BrokerEndpoint,
        options: ConnectionOptions,
    ) -> Self {
        ConnectionManager {
            inner: Arc::new(Inner {
                endpoint,
                connector,
                options,
                slot: Mutex::new(Slot {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    connection: None,
                    session: None,
                }),
                reconnect: tokio::sync::Mutex::new(()),
                readiness: ReadinessPublisher::new(),
                stale: Notify::new(),
                shutdown: CancellationToken::new(),
                watcher: Mutex::new(None),
                topology: Mutex::new(None),
            }),
        }
    }

    /// Builds a manager backed by lapin from the loaded configuration.
    pub fn from_configs(cfg: &RabbitMQConfigs) -> Result<Self, AmqpError> {
        Ok(Self::new(
            LapinConnector::new(&cfg.connection_name),
            cfg.endpoint()?,
            ConnectionOptions {
                backoff: cfg.backoff(),
                redeclare_topology: cfg.redeclare_topology,
            },
        ))
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.inner.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.slot.lock().state
    }

    /// Waits until a connection and a session are established, retrying forever.
    ///
    /// Returns immediately when already connected, and returns without a
    /// connection if [`close`](Self::close) is called while retrying.
    pub async fn connect(&self) {
        let _guard = self.inner.reconnect.lock().await;

        {
            let mut slot = self.inner.slot.lock();
            match slot.state {
                ConnectionState::Connected | ConnectionState::Closed => return,
                _ => slot.state = ConnectionState::Connecting,
            }
        }

        if let Some(lost) = self.establish("connect").await {
            let manager = self.clone();
            let handle = tokio::spawn(async move { manager.watch(lost).await });
            *self.inner.watcher.lock() = Some(handle);
        }
    }

    /// Returns the current session, or [`AmqpError::NotReady`] if there is none.
    ///
    /// A session the broker closed while its connection stayed up (a channel
    /// exception) is reported as not ready and wakes the watcher, which replaces
    /// the connection.
    pub fn session(&self) -> Result<Arc<dyn Session>, AmqpError> {
        let slot = self.inner.slot.lock();
        match (&slot.state, &slot.session) {
            (ConnectionState::Connected, Some(session)) if session.is_open() => {
                Ok(session.clone())
            }
            (ConnectionState::Connected, Some(_)) => {
                self.inner.stale.notify_one();
                Err(AmqpError::NotReady)
            }
            _ => Err(AmqpError::NotReady),
        }
    }

    /// Whether a usable session exists. Like [`session`](Self::session), a session
    /// found closed by the broker starts recovery.
    pub fn check_session(&self) -> bool {
        self.session().is_ok()
    }

    /// Delay schedule shared by dials and by callers retrying against the broker.
    pub fn backoff(&self) -> Backoff {
        self.inner.options.backoff
    }

    /// Returns a handle on the readiness signal.
    pub fn notify_ready(&self) -> ReadinessSignal {
        self.inner.readiness.subscribe()
    }

    /// Declares `topology` on the current session and remembers it for
    /// re-declaration after reconnects when that option is enabled.
    pub async fn declare_topology(&self, topology: &Topology) -> Result<(), AmqpError> {
        let session = self.session()?;

        topology.install(session.as_ref()).await?;
        *self.inner.topology.lock() = Some(topology.clone());
        info!(
            exchanges = topology.exchanges().len(),
            queues = topology.queues().len(),
            bindings = topology.bindings().len(),
            "topology declared"
        );

        Ok(())
    }

    /// Stops the watcher and closes session then connection. Safe to call many times.
    pub async fn close(&self) {
        let (session, connection) = {
            let mut slot = self.inner.slot.lock();
            if slot.state == ConnectionState::Closed {
                return;
            }
            slot.state = ConnectionState::Closed;
            (slot.session.take(), slot.connection.take())
        };

        self.inner.shutdown.cancel();
        self.inner.readiness.post(Readiness::Closed);

        if let Some(session) = session {
            if let Err(err) = session.close().await {
                warn!(error = err.to_string(), "failure to close channel");
            }
        }

        if let Some(connection) = connection {
            if let Err(err) = connection.close().await {
                warn!(error = err.to_string(), "failure to close connection");
            }
        }

        let watcher = self.inner.watcher.lock().take();
        if let Some(handle) = watcher {
            if let Err(err) = handle.await {
                error!(error = err.to_string(), "reconnect watcher failed");
            }
        }

        info!("connection closed gracefully");
    }

    async fn watch(self, mut lost: LossReceiver) {
        loop {
            let reason = tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => return,
                reason = lost.recv() => Some(reason.unwrap_or_else(|| {
                    AmqpError::ConnectionLost("connection dropped".to_owned())
                })),
                _ = self.inner.stale.notified() => self.closed_session(),
            };

            // a stale wake-up may predate the last reconnect
            let Some(reason) = reason else {
                continue;
            };

            warn!(error = reason.to_string(), "connection lost, reconnecting...");

            match self.reconnect().await {
                Some(next) => lost = next,
                None => return,
            }
        }
    }

    /// The reason to reconnect when the current session is closed while the
    /// manager still counts as connected.
    fn closed_session(&self) -> Option<AmqpError> {
        let slot = self.inner.slot.lock();
        match (&slot.state, &slot.session) {
            (ConnectionState::Connected, Some(session)) if !session.is_open() => Some(
                AmqpError::ChannelClosed("channel closed by the broker".to_owned()),
            ),
            _ => None,
        }
    }

    async fn reconnect(&self) -> Option<LossReceiver> {
        let _guard = self.inner.reconnect.lock().await;

        let (session, connection) = {
            let mut slot = self.inner.slot.lock();
            if slot.state == ConnectionState::Closed {
                return None;
            }
            slot.state = ConnectionState::Connecting;
            (slot.session.take(), slot.connection.take())
        };
        self.inner.readiness.post(Readiness::NotReady);

        // the connection may still be up when only the channel failed
        if let Some(session) = session {
            match tokio::time::timeout(STALE_CLOSE_TIMEOUT, session.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(error = err.to_string(), "failure to close stale channel"),
                Err(_) => debug!("timed out closing stale channel"),
            }
        }
        if let Some(connection) = connection {
            match tokio::time::timeout(STALE_CLOSE_TIMEOUT, connection.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    debug!(error = err.to_string(), "failure to close stale connection")
                }
                Err(_) => debug!("timed out closing stale connection"),
            }
        }

        self.establish("reconnect").await
    }

    /// Dials until a session exists or the manager is closed.
    async fn establish(&self, operation: &str) -> Option<LossReceiver> {
        let mut attempt: u32 = 0;

        loop {
            let dialed = tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => return None,
                dialed = self.inner.connector.connect(&self.inner.endpoint) => dialed,
            };

            match dialed {
                Ok(established) => return self.install(established).await,
                Err(err) => {
                    let delay = self.inner.options.backoff.delay(attempt);
                    warn!(
                        error = err.to_string(),
                        attempt,
                        delay_secs = delay.as_secs_f64(),
                        "{} failed, retrying",
                        operation
                    );

                    tokio::select! {
                        biased;
                        _ = self.inner.shutdown.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    async fn install(&self, established: Established) -> Option<LossReceiver> {
        let Established {
            connection,
            session,
            lost,
        } = established;

        if self.inner.options.redeclare_topology {
            let topology = self.inner.topology.lock().clone();
            if let Some(topology) = topology {
                debug!("re-declaring topology");
                if let Err(err) = topology.install(session.as_ref()).await {
                    error!(error = err.to_string(), "failure to re-declare topology");
                }
            }
        }

        let generation = {
            let mut slot = self.inner.slot.lock();
            if slot.state == ConnectionState::Closed {
                None
            } else {
                slot.generation += 1;
                slot.state = ConnectionState::Connected;
                slot.session = Some(session.clone());
                slot.connection = Some(connection.clone());
                Some(slot.generation)
            }
        };

        let Some(generation) = generation else {
            // closed while dialing
            let _ = session.close().await;
            let _ = connection.close().await;
            return None;
        };

        info!(
            endpoint = %self.inner.endpoint,
            generation,
            "connected to the broker"
        );
        self.inner.readiness.post(Readiness::Ready(generation));

        Some(lost)
    }
}
