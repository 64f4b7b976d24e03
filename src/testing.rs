// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the unit tests.
//!
//! It models what the connection layer cares about: refused dials, dropped
//! connections (with unacknowledged deliveries returned to their queue), routing
//! through bindings, manual acknowledgements and publish failures.

use crate::{
    configs::BrokerEndpoint,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    session::{
        Acknowledger, BrokerConnection, Connector, Delivery, DeliveryStream, Established,
        OutboundMessage, Session,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::mpsc, time::Instant};

/// How a delivery was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settlement {
    Ack,
    Nack { requeue: bool },
}

#[derive(Debug, Clone)]
struct Pending {
    data: Vec<u8>,
    redelivered: bool,
    deliveries: i64,
}

struct Unacked {
    generation: u64,
    queue: String,
    pending: Pending,
}

type Subscriber = (u64, mpsc::UnboundedSender<Result<Delivery, AmqpError>>);

#[derive(Default)]
struct State {
    refuse: u32,
    attempts: Vec<Instant>,
    connections: u64,
    live: u64,
    loss: Option<mpsc::UnboundedSender<AmqpError>>,
    closed_sessions: u32,
    closed_connections: u32,
    fail_session_close: bool,
    // generations whose channel the broker closed while the connection stayed up
    broken_channels: BTreeSet<u64>,
    strict_topology: bool,
    fail_queue_declarations: bool,
    exchanges: BTreeSet<String>,
    queues: BTreeSet<String>,
    bindings: BTreeSet<(String, String, String)>,
    messages: HashMap<String, VecDeque<Pending>>,
    subscribers: HashMap<String, Subscriber>,
    unacked: HashMap<u64, Unacked>,
    next_tag: u64,
    settlements: Vec<(Vec<u8>, Settlement)>,
    dead_lettered: Vec<Vec<u8>>,
    fail_publishes: u32,
    hang_publishes: bool,
    publish_attempts: u32,
    published: Vec<OutboundMessage>,
}

impl State {
    fn break_channel(&mut self, generation: u64) {
        self.broken_channels.insert(generation);
        self.release(generation);
    }

    /// Ends the consumers of `generation` and returns its unacked deliveries to
    /// the front of their queue.
    fn release(&mut self, generation: u64) {
        self.subscribers.retain(|_, (g, _)| *g != generation);

        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, unacked)| unacked.generation == generation)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();

        for tag in tags.into_iter().rev() {
            if let Some(unacked) = self.unacked.remove(&tag) {
                let mut pending = unacked.pending;
                pending.redelivered = true;
                self.messages
                    .entry(unacked.queue)
                    .or_default()
                    .push_front(pending);
            }
        }
    }
}

#[derive(Clone, Default)]
pub(crate) struct FakeBroker {
    state: Arc<Mutex<State>>,
}

impl FakeBroker {
    pub(crate) fn new() -> Self {
        FakeBroker::default()
    }

    pub(crate) fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(FakeConnector {
            broker: self.clone(),
        })
    }

    /// Refuses the next `n` dials.
    pub(crate) fn refuse_connections(&self, n: u32) {
        self.state.lock().refuse = n;
    }

    pub(crate) fn connect_attempts(&self) -> usize {
        self.state.lock().attempts.len()
    }

    /// Time elapsed between consecutive dials.
    pub(crate) fn connect_gaps(&self) -> Vec<Duration> {
        let state = self.state.lock();
        state
            .attempts
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .collect()
    }

    /// Kills the live connection: its sessions stop working, consumer streams end
    /// and unacknowledged deliveries go back to their queue.
    pub(crate) fn drop_connection(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let dead = state.live;
        state.live = 0;

        if let Some(loss) = state.loss.take() {
            let _ = loss.send(AmqpError::ConnectionLost("connection reset by peer".to_owned()));
        }

        state.release(dead);
    }

    /// Closes the live channel the way a channel exception does: the connection
    /// stays up and no loss is reported on it.
    pub(crate) fn close_channel(&self) {
        let mut state = self.state.lock();
        let live = state.live;
        state.break_channel(live);
    }

    /// Closes the channel on a publish to an undeclared exchange or a consume from
    /// an undeclared queue, as RabbitMQ does with a `404 NOT_FOUND`.
    pub(crate) fn strict_topology(&self) {
        self.state.lock().strict_topology = true;
    }

    /// Declares `queue` from outside the client, like another service would.
    pub(crate) fn create_queue(&self, queue: &str) {
        self.state.lock().queues.insert(queue.to_owned());
    }

    pub(crate) fn fail_session_close(&self) {
        self.state.lock().fail_session_close = true;
    }

    pub(crate) fn closed_sessions(&self) -> u32 {
        self.state.lock().closed_sessions
    }

    pub(crate) fn closed_connections(&self) -> u32 {
        self.state.lock().closed_connections
    }

    pub(crate) fn exchanges(&self) -> Vec<String> {
        self.state.lock().exchanges.iter().cloned().collect()
    }

    pub(crate) fn queues(&self) -> Vec<String> {
        self.state.lock().queues.iter().cloned().collect()
    }

    pub(crate) fn bindings(&self) -> Vec<(String, String, String)> {
        self.state.lock().bindings.iter().cloned().collect()
    }

    /// Simulates a broker that lost its declared topology.
    pub(crate) fn forget_topology(&self) {
        let mut state = self.state.lock();
        state.exchanges.clear();
        state.queues.clear();
        state.bindings.clear();
    }

    pub(crate) fn fail_queue_declarations(&self, fail: bool) {
        self.state.lock().fail_queue_declarations = fail;
    }

    /// Fails the next `n` publishes.
    pub(crate) fn fail_publishes(&self, n: u32) {
        self.state.lock().fail_publishes = n;
    }

    /// Makes every publish wait forever.
    pub(crate) fn hang_publishes(&self) {
        self.state.lock().hang_publishes = true;
    }

    pub(crate) fn publish_attempts(&self) -> u32 {
        self.state.lock().publish_attempts
    }

    pub(crate) fn published(&self) -> Vec<OutboundMessage> {
        self.state.lock().published.clone()
    }

    /// Puts a message straight into `queue`.
    pub(crate) fn enqueue(&self, queue: &str, data: &[u8]) {
        self.state
            .lock()
            .messages
            .entry(queue.to_owned())
            .or_default()
            .push_back(Pending {
                data: data.to_vec(),
                redelivered: false,
                deliveries: 0,
            });
        self.pump();
    }

    pub(crate) fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .messages
            .get(queue)
            .map_or(0, VecDeque::len)
    }

    pub(crate) fn settlements(&self) -> Vec<(Vec<u8>, Settlement)> {
        self.state.lock().settlements.clone()
    }

    pub(crate) fn dead_lettered(&self) -> Vec<Vec<u8>> {
        self.state.lock().dead_lettered.clone()
    }

    pub(crate) fn has_subscriber(&self, queue: &str) -> bool {
        self.state.lock().subscribers.contains_key(queue)
    }

    /// Hands ready messages to the subscriber of their queue.
    fn pump(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let queues: Vec<String> = state.subscribers.keys().cloned().collect();

        for queue in queues {
            loop {
                let Some((generation, tx)) = state.subscribers.get(&queue).cloned() else {
                    break;
                };
                let Some(pending) = state.messages.get_mut(&queue).and_then(VecDeque::pop_front)
                else {
                    break;
                };

                state.next_tag += 1;
                let tag = state.next_tag;
                let delivery = Delivery::new(
                    tag,
                    pending.data.clone(),
                    Box::new(FakeAcker {
                        broker: self.clone(),
                        tag,
                    }),
                )
                .routing_key(&queue)
                .redelivered(pending.redelivered)
                .delivery_count((pending.deliveries > 0).then_some(pending.deliveries));

                if tx.send(Ok(delivery)).is_err() {
                    state.subscribers.remove(&queue);
                    state
                        .messages
                        .entry(queue.clone())
                        .or_default()
                        .push_front(pending);
                    break;
                }

                state.unacked.insert(
                    tag,
                    Unacked {
                        generation,
                        queue: queue.clone(),
                        pending,
                    },
                );
            }
        }
    }

    fn settle(&self, tag: u64, settlement: Settlement) -> Result<(), AmqpError> {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let live = state.live;
            let Some(unacked) = state.unacked.remove(&tag) else {
                return Err(AmqpError::AckMessageError);
            };
            if unacked.generation != live {
                state.unacked.insert(tag, unacked);
                return Err(AmqpError::AckMessageError);
            }

            state
                .settlements
                .push((unacked.pending.data.clone(), settlement));

            match settlement {
                Settlement::Ack => {}
                Settlement::Nack { requeue: true } => {
                    let mut pending = unacked.pending;
                    pending.redelivered = true;
                    pending.deliveries += 1;
                    state
                        .messages
                        .entry(unacked.queue)
                        .or_default()
                        .push_back(pending);
                }
                Settlement::Nack { requeue: false } => {
                    state.dead_lettered.push(unacked.pending.data);
                }
            }
        }

        self.pump();
        Ok(())
    }
}

/// Polls `cond` until it holds.
pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

struct FakeConnector {
    broker: FakeBroker,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _endpoint: &BrokerEndpoint) -> Result<Established, AmqpError> {
        let mut state = self.broker.state.lock();
        state.attempts.push(Instant::now());

        if state.refuse > 0 {
            state.refuse -= 1;
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        state.connections += 1;
        state.live = state.connections;
        let (tx, lost) = mpsc::unbounded_channel();
        state.loss = Some(tx);

        Ok(Established {
            connection: Arc::new(FakeConnection {
                broker: self.broker.clone(),
            }),
            session: Arc::new(FakeSession {
                broker: self.broker.clone(),
                generation: state.live,
                closed: AtomicBool::new(false),
            }),
            lost,
        })
    }
}

struct FakeConnection {
    broker: FakeBroker,
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.state.lock().closed_connections += 1;
        Ok(())
    }
}

struct FakeSession {
    broker: FakeBroker,
    generation: u64,
    closed: AtomicBool,
}

impl FakeSession {
    fn check_open(&self) -> Result<(), AmqpError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(AmqpError::ChannelClosed("channel is not open".to_owned()))
        }
    }
}

#[async_trait]
impl Session for FakeSession {
    fn is_open(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let state = self.broker.state.lock();
        state.live == self.generation && !state.broken_channels.contains(&self.generation)
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.check_open()?;
        self.broker
            .state
            .lock()
            .exchanges
            .insert(def.name().to_owned());
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.check_open()?;
        let mut state = self.broker.state.lock();
        if state.fail_queue_declarations {
            return Err(AmqpError::DeclareQueueError(def.name().to_owned()));
        }
        state.queues.insert(def.name().to_owned());
        Ok(())
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.check_open()?;
        self.broker.state.lock().bindings.insert((
            binding.exchange_name().to_owned(),
            binding.key().to_owned(),
            binding.queue_name().to_owned(),
        ));
        Ok(())
    }

    async fn publish(&self, msg: &OutboundMessage) -> Result<(), AmqpError> {
        self.check_open()?;

        let hang = {
            let mut guard = self.broker.state.lock();
            let state = &mut *guard;
            state.publish_attempts += 1;

            if state.strict_topology
                && !msg.exchange.is_empty()
                && !state.exchanges.contains(&msg.exchange)
            {
                state.break_channel(self.generation);
                return Err(AmqpError::ChannelClosed(format!(
                    "NOT_FOUND - no exchange '{}'",
                    msg.exchange
                )));
            } else if state.hang_publishes {
                true
            } else if state.fail_publishes > 0 {
                state.fail_publishes -= 1;
                return Err(AmqpError::PublishingError("broker refused message".to_owned()));
            } else {
                state.published.push(msg.clone());
                let targets: Vec<String> = if msg.exchange.is_empty() {
                    vec![msg.routing_key.clone()]
                } else {
                    state
                        .bindings
                        .iter()
                        .filter(|(exchange, key, _)| {
                            *exchange == msg.exchange && *key == msg.routing_key
                        })
                        .map(|(_, _, queue)| queue.clone())
                        .collect()
                };
                for queue in targets {
                    state.messages.entry(queue).or_default().push_back(Pending {
                        data: msg.payload.clone(),
                        redelivered: false,
                        deliveries: 0,
                    });
                }
                false
            }
        };

        if hang {
            std::future::pending::<()>().await;
        }

        self.broker.pump();
        Ok(())
    }

    async fn consume(&self, queue: &str, _tag: &str) -> Result<DeliveryStream, AmqpError> {
        self.check_open()?;

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.broker.state.lock();
            if state.strict_topology && !state.queues.contains(queue) {
                state.break_channel(self.generation);
                return Err(AmqpError::ChannelClosed(format!(
                    "NOT_FOUND - no queue '{}'",
                    queue
                )));
            }
            state.subscribers.insert(queue.to_owned(), (self.generation, tx));
        }
        self.broker.pump();

        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.broker.state.lock();
        if state.fail_session_close {
            return Err(AmqpError::ChannelError("close refused".to_owned()));
        }
        self.closed.store(true, Ordering::SeqCst);
        state.closed_sessions += 1;
        Ok(())
    }
}

struct FakeAcker {
    broker: FakeBroker,
    tag: u64,
}

#[async_trait]
impl Acknowledger for FakeAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.broker.settle(self.tag, Settlement::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.broker.settle(self.tag, Settlement::Nack { requeue })
    }
}
