//! In-memory scripted broker for tests.
//!
//! Records every call made through the [`Connector`] traits and lets a test
//! script dial refusals, missing confirm support, nacks, failed publishes,
//! refused channel operations, deliveries and broker-side channel closes.

use crate::broker::{
    Arguments, Channel, Confirmation, Connection, Connector, Delivery, ExchangeKind,
    ExchangeOptions, Publishing, QueueOptions,
};
use crate::error::{AmqpError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

const FEED_CAPACITY: usize = 4096;

/// A call observed by the mock broker. `session` numbers start at 1 per dial.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerCall {
    Connect {
        session: usize,
    },
    DeclareExchange {
        name: String,
        kind: ExchangeKind,
        options: ExchangeOptions,
        arguments: Arguments,
    },
    BindExchange {
        destination: String,
        source: String,
    },
    DeclareQueue {
        name: String,
        options: QueueOptions,
        arguments: Arguments,
    },
    BindQueue {
        queue: String,
        exchange: String,
    },
    UnbindQueue {
        queue: String,
        exchange: String,
    },
    Qos {
        prefetch: u16,
    },
    ConfirmSelect {
        session: usize,
    },
    Publish {
        session: usize,
        exchange: String,
        message: Publishing,
    },
    PublishFailed {
        session: usize,
        body: Vec<u8>,
    },
    Consume {
        session: usize,
        queue: String,
        exclusive: bool,
    },
    Ack {
        session: usize,
        delivery_tag: u64,
        multiple: bool,
    },
    Close {
        session: usize,
    },
}

/// Channel operations a test can make the broker refuse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    DeclareExchange,
    BindExchange,
    DeclareQueue,
    BindQueue,
    UnbindQueue,
    Qos,
    Consume,
}

struct ChannelState {
    session: usize,
    closed: AtomicBool,
    delivery_seq: AtomicU64,
    publish_seq: AtomicU64,
    confirm_mode: AtomicBool,
    confirms: Mutex<Option<mpsc::UnboundedSender<Confirmation>>>,
    close_listeners: Mutex<Vec<mpsc::UnboundedSender<String>>>,
}

impl ChannelState {
    fn shut(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut confirms) = self.confirms.lock() {
            confirms.take();
        }
    }
}

#[derive(Default)]
struct MockState {
    max_dials: Option<usize>,
    dials: usize,
    confirms_unsupported: bool,
    publish_attempts: usize,
    nack_attempts: HashSet<usize>,
    fail_attempts: HashSet<usize>,
    refused: HashSet<Operation>,
    calls: Vec<BrokerCall>,
    backlog: HashMap<String, VecDeque<(Arguments, Vec<u8>)>>,
    consumers: HashMap<String, (Arc<ChannelState>, mpsc::Sender<Delivery>)>,
    channels: Vec<Arc<ChannelState>>,
}

/// Scriptable broker implementing [`Connector`]
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<MockState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every dial after the first `max` succeeded
    pub fn with_max_dials(self, max: usize) -> Self {
        self.state().max_dials = Some(max);
        self
    }

    /// Reject confirm mode on every channel
    pub fn without_confirms(self) -> Self {
        self.state().confirms_unsupported = true;
        self
    }

    /// Nack the `attempt`-th publish call (1-based, counted across sessions)
    pub fn nack_publish(self, attempt: usize) -> Self {
        self.state().nack_attempts.insert(attempt);
        self
    }

    /// Fail the `attempt`-th publish call with an I/O error
    pub fn fail_publish(self, attempt: usize) -> Self {
        self.state().fail_attempts.insert(attempt);
        self
    }

    /// Refuse every call of `operation` with a channel error, as the broker
    /// would for a precondition or access failure
    pub fn fail_operation(self, operation: Operation) -> Self {
        self.state().refused.insert(operation);
        self
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Hand a message to the consumer of `queue`, or hold it until one appears
    pub fn deliver(&self, queue: &str, headers: Arguments, body: impl Into<Vec<u8>>) {
        let body = body.into();
        let mut state = self.state();
        if let Some((channel, feed)) = state.consumers.get(queue) {
            if !channel.closed.load(Ordering::SeqCst) {
                let delivery_tag = channel.delivery_seq.fetch_add(1, Ordering::SeqCst) + 1;
                if feed
                    .try_send(Delivery {
                        delivery_tag,
                        headers: headers.clone(),
                        body: body.clone(),
                    })
                    .is_ok()
                {
                    return;
                }
            }
        }
        state
            .backlog
            .entry(queue.to_owned())
            .or_default()
            .push_back((headers, body));
    }

    /// Close every open channel as if the broker had dropped them
    pub fn close_channels(&self, reason: &str) {
        let mut state = self.state();
        state.consumers.clear();
        for channel in state.channels.drain(..) {
            channel.shut();
            if let Ok(mut listeners) = channel.close_listeners.lock() {
                for listener in listeners.drain(..) {
                    let _ = listener.send(reason.to_owned());
                }
            }
        }
    }

    pub fn calls(&self) -> Vec<BrokerCall> {
        self.state().calls.clone()
    }

    pub fn dials(&self) -> usize {
        self.state().dials
    }

    /// Bodies of accepted publishes with the session they went out on
    pub fn published(&self) -> Vec<(usize, Vec<u8>)> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                BrokerCall::Publish {
                    session, message, ..
                } => Some((*session, message.body.clone())),
                _ => None,
            })
            .collect()
    }

    /// Delivery tags acknowledged, in order
    pub fn acks(&self) -> Vec<u64> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                BrokerCall::Ack { delivery_tag, .. } => Some(*delivery_tag),
                _ => None,
            })
            .collect()
    }

    /// Whether a consumer is currently attached to `queue`
    pub fn has_consumer(&self, queue: &str) -> bool {
        self.state()
            .consumers
            .get(queue)
            .is_some_and(|(channel, _)| !channel.closed.load(Ordering::SeqCst))
    }

    /// Poll the recorded calls until `predicate` holds or `timeout` elapses
    pub async fn wait_until<F>(&self, timeout: Duration, predicate: F) -> bool
    where
        F: Fn(&[BrokerCall]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if predicate(&self.state().calls) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn record(&self, call: BrokerCall) {
        self.state().calls.push(call);
    }
}

#[async_trait]
impl Connector for MockBroker {
    async fn connect(&self, _url: &str) -> Result<Arc<dyn Connection>> {
        let session = {
            let mut state = self.state();
            if state.max_dials.is_some_and(|max| state.dials >= max) {
                return Err(AmqpError::dial("connection refused"));
            }
            state.dials += 1;
            let session = state.dials;
            state.calls.push(BrokerCall::Connect { session });
            session
        };
        Ok(Arc::new(MockConnection {
            broker: self.clone(),
            session,
        }))
    }
}

struct MockConnection {
    broker: MockBroker,
    session: usize,
}

#[async_trait]
impl Connection for MockConnection {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>> {
        let channel = Arc::new(ChannelState {
            session: self.session,
            closed: AtomicBool::new(false),
            delivery_seq: AtomicU64::new(0),
            publish_seq: AtomicU64::new(0),
            confirm_mode: AtomicBool::new(false),
            confirms: Mutex::new(None),
            close_listeners: Mutex::new(Vec::new()),
        });
        self.broker.state().channels.push(Arc::clone(&channel));
        Ok(Arc::new(MockChannel {
            broker: self.broker.clone(),
            channel,
        }))
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.broker.state();
        state.calls.push(BrokerCall::Close {
            session: self.session,
        });
        let session = self.session;
        state
            .consumers
            .retain(|_, (channel, _)| channel.session != session);
        state.channels.retain(|channel| {
            if channel.session == session {
                channel.shut();
                false
            } else {
                true
            }
        });
        Ok(())
    }
}

struct MockChannel {
    broker: MockBroker,
    channel: Arc<ChannelState>,
}

impl MockChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.channel.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::channel("channel closed"));
        }
        Ok(())
    }

    fn record(&self, call: BrokerCall) -> Result<()> {
        self.ensure_open()?;
        self.broker.record(call);
        Ok(())
    }

    /// Record `call` unless the test refused `operation`
    fn attempt(&self, operation: Operation, call: BrokerCall) -> Result<()> {
        self.ensure_open()?;
        if self.broker.state().refused.contains(&operation) {
            return Err(AmqpError::channel(format!(
                "PRECONDITION_FAILED - {:?} refused",
                operation
            )));
        }
        self.record(call)
    }
}

#[async_trait]
impl Channel for MockChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
        arguments: Arguments,
    ) -> Result<()> {
        self.attempt(
            Operation::DeclareExchange,
            BrokerCall::DeclareExchange {
                name: name.to_owned(),
                kind,
                options,
                arguments,
            },
        )
    }

    async fn bind_exchange(
        &self,
        destination: &str,
        _routing_key: &str,
        source: &str,
        _no_wait: bool,
    ) -> Result<()> {
        self.attempt(
            Operation::BindExchange,
            BrokerCall::BindExchange {
                destination: destination.to_owned(),
                source: source.to_owned(),
            },
        )
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        arguments: Arguments,
    ) -> Result<()> {
        self.attempt(
            Operation::DeclareQueue,
            BrokerCall::DeclareQueue {
                name: name.to_owned(),
                options,
                arguments,
            },
        )
    }

    async fn bind_queue(
        &self,
        queue: &str,
        _routing_key: &str,
        exchange: &str,
        _no_wait: bool,
    ) -> Result<()> {
        self.attempt(
            Operation::BindQueue,
            BrokerCall::BindQueue {
                queue: queue.to_owned(),
                exchange: exchange.to_owned(),
            },
        )
    }

    async fn unbind_queue(&self, queue: &str, _routing_key: &str, exchange: &str) -> Result<()> {
        self.attempt(
            Operation::UnbindQueue,
            BrokerCall::UnbindQueue {
                queue: queue.to_owned(),
                exchange: exchange.to_owned(),
            },
        )
    }

    async fn qos(&self, prefetch_count: u16) -> Result<()> {
        self.attempt(
            Operation::Qos,
            BrokerCall::Qos {
                prefetch: prefetch_count,
            },
        )
    }

    async fn confirm_select(&self) -> Result<()> {
        self.ensure_open()?;
        if self.broker.state().confirms_unsupported {
            return Err(AmqpError::channel("confirm mode not supported"));
        }
        self.channel.confirm_mode.store(true, Ordering::SeqCst);
        self.record(BrokerCall::ConfirmSelect {
            session: self.channel.session,
        })
    }

    fn notify_publish(&self) -> mpsc::UnboundedReceiver<Confirmation> {
        let (sender, receiver) = mpsc::unbounded_channel();
        if !self.channel.closed.load(Ordering::SeqCst) {
            if let Ok(mut confirms) = self.channel.confirms.lock() {
                *confirms = Some(sender);
            }
        }
        receiver
    }

    async fn publish(&self, exchange: &str, _routing_key: &str, message: Publishing) -> Result<()> {
        self.ensure_open()?;
        let session = self.channel.session;
        let (attempt, fail, nack) = {
            let mut state = self.broker.state();
            state.publish_attempts += 1;
            let attempt = state.publish_attempts;
            (
                attempt,
                state.fail_attempts.contains(&attempt),
                state.nack_attempts.contains(&attempt),
            )
        };

        if fail {
            self.broker.record(BrokerCall::PublishFailed {
                session,
                body: message.body,
            });
            return Err(AmqpError::publish(format!(
                "connection reset during publish {}",
                attempt
            )));
        }

        self.broker.record(BrokerCall::Publish {
            session,
            exchange: exchange.to_owned(),
            message,
        });

        if self.channel.confirm_mode.load(Ordering::SeqCst) {
            let delivery_tag = self.channel.publish_seq.fetch_add(1, Ordering::SeqCst) + 1;
            if let Ok(confirms) = self.channel.confirms.lock() {
                if let Some(confirms) = confirms.as_ref() {
                    let _ = confirms.send(Confirmation {
                        delivery_tag,
                        ack: !nack,
                    });
                }
            }
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, exclusive: bool) -> Result<mpsc::Receiver<Delivery>> {
        self.attempt(
            Operation::Consume,
            BrokerCall::Consume {
                session: self.channel.session,
                queue: queue.to_owned(),
                exclusive,
            },
        )?;

        let (sender, receiver) = mpsc::channel(FEED_CAPACITY);
        let mut state = self.broker.state();
        if let Some(backlog) = state.backlog.remove(queue) {
            for (headers, body) in backlog {
                let delivery_tag = self.channel.delivery_seq.fetch_add(1, Ordering::SeqCst) + 1;
                let _ = sender.try_send(Delivery {
                    delivery_tag,
                    headers,
                    body,
                });
            }
        }
        state
            .consumers
            .insert(queue.to_owned(), (Arc::clone(&self.channel), sender));
        Ok(receiver)
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.record(BrokerCall::Ack {
            session: self.channel.session,
            delivery_tag,
            multiple,
        })
    }

    fn notify_close(&self) -> mpsc::UnboundedReceiver<String> {
        let (sender, receiver) = mpsc::unbounded_channel();
        if let Ok(mut listeners) = self.channel.close_listeners.lock() {
            listeners.push(sender);
        }
        receiver
    }
}
