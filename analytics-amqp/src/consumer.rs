//! Topology-aware consumer with batched acknowledgement.
//!
//! One loop consumes the consumer's own queue. A sharded consumer runs a second,
//! independent loop over the shard's dead-letter queue. Each loop declares the
//! topology on its first session only, then for every session sets QoS, opens
//! a delivery feed and hands each message to the [`DeliveryHandler`] in
//! delivery order.
//!
//! Acks are cumulative and issued by a per-session [`Acker`]. A delivery is
//! acked when it is the n-th delivery of the session for the configured
//! threshold n, or when the one second ack tick has elapsed since the previous
//! ack check. The tick is only looked at when a delivery arrives, so on an idle
//! queue the last partial batch stays unacknowledged until the next message.

use crate::acker::Acker;
use crate::broker::Connector;
use crate::client::{Client, DEFAULT_RECONNECT_DELAY};
use crate::error::{AmqpError, Result};
use crate::session::Session;
use crate::topology::Topology;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::{Id, JoinSet};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Deliveries per session between cumulative acks
pub const DEFAULT_ACK_THRESHOLD: u64 = 100;

/// Period of the opportunistic ack tick
pub const ACK_INTERVAL: Duration = Duration::from_secs(1);

/// Receives consumed payloads.
///
/// Called inline by the consuming loop, so a slow handler stalls acks and, via
/// the prefetch window, broker delivery.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    /// `origin` is the publish time from the message header, `None` if absent or malformed
    async fn handle(&self, payload: Vec<u8>, origin: Option<SystemTime>);
}

/// Payload handed to a channel-backed handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub payload: Vec<u8>,
    pub origin: Option<SystemTime>,
}

#[async_trait]
impl DeliveryHandler for mpsc::Sender<InboundMessage> {
    async fn handle(&self, payload: Vec<u8>, origin: Option<SystemTime>) {
        if self.send(InboundMessage { payload, origin }).await.is_err() {
            warn!("Inbound message receiver dropped, discarding payload");
        }
    }
}

/// One of the queues a consumer reads from
#[derive(Debug, Clone)]
struct QueueLoop {
    queue: String,
    exchange: String,
    exclusive: bool,
    /// Exchange to unbind the queue from on cancellation
    unbind_from: Option<String>,
}

enum SessionEnd {
    Cancelled,
    Reconnect,
}

/// Consumes from a reconnecting session
#[derive(Debug, Clone)]
pub struct Consumer {
    client: Client,
    topology: Topology,
    ack_threshold: u64,
    reconnect_delay: Duration,
    cancel: CancellationToken,
}

impl Consumer {
    /// Consume from queue `name` bound directly to `exchange`
    pub fn new(
        cancel: CancellationToken,
        connector: Arc<dyn Connector>,
        name: impl Into<String>,
        exchange: impl Into<String>,
        broker: impl Into<String>,
        prefetch: u16,
        persistent: bool,
    ) -> Self {
        Self::with_topology(
            cancel,
            connector,
            Topology::plain(name, prefetch, persistent),
            exchange,
            broker,
        )
    }

    /// Consume as one replica of the shard `name` fed from `exchange`
    pub fn new_sharded(
        cancel: CancellationToken,
        connector: Arc<dyn Connector>,
        name: impl Into<String>,
        exchange: impl Into<String>,
        broker: impl Into<String>,
        prefetch: u16,
        persistent: bool,
    ) -> Self {
        Self::with_topology(
            cancel,
            connector,
            Topology::sharded(name, prefetch, persistent),
            exchange,
            broker,
        )
    }

    /// Consume with an explicit topology
    pub fn with_topology(
        cancel: CancellationToken,
        connector: Arc<dyn Connector>,
        topology: Topology,
        exchange: impl Into<String>,
        broker: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::connect(cancel.clone(), connector, broker, exchange),
            topology,
            ack_threshold: DEFAULT_ACK_THRESHOLD,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            cancel,
        }
    }

    /// Change the number of deliveries between cumulative acks
    pub fn set_ack_threshold(&mut self, threshold: u64) -> Result<()> {
        if threshold == 0 {
            return Err(AmqpError::configuration(
                "ack threshold must be greater than 0",
            ));
        }
        self.ack_threshold = threshold;
        Ok(())
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn ack_threshold(&self) -> u64 {
        self.ack_threshold
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Consume until cancelled.
    ///
    /// Returns `Ok(())` after cancellation, or [`AmqpError::ConsumerExited`]
    /// naming the queue whose loop stopped first. The remaining loop is then
    /// stopped and awaited, so every session it held is closed before this
    /// returns. A panicking [`DeliveryHandler`] ends its loop with
    /// [`AmqpError::Panicked`].
    pub async fn consume(&self, handler: impl DeliveryHandler) -> Result<()> {
        let handler: Arc<dyn DeliveryHandler> = Arc::new(handler);
        let stop = self.cancel.child_token();
        let mut loops = JoinSet::new();
        let mut queues = HashMap::new();

        let primary = QueueLoop {
            queue: self.topology.queue.clone(),
            exchange: self.client.exchange().to_owned(),
            exclusive: true,
            unbind_from: self.topology.shard.as_ref().map(|s| s.exchange.clone()),
        };
        self.spawn_loop(&mut loops, &mut queues, primary, &stop, Arc::clone(&handler));

        if let Some(shard) = &self.topology.shard {
            let dead_letters = QueueLoop {
                queue: shard.dead_letter_queue.clone(),
                exchange: shard.dead_letter_exchange.clone(),
                exclusive: false,
                unbind_from: None,
            };
            self.spawn_loop(&mut loops, &mut queues, dead_letters, &stop, Arc::clone(&handler));
        }

        let mut exit = None;
        while let Some(joined) = loops.join_next_with_id().await {
            let (queue, result) = match joined {
                Ok((id, result)) => (queues.remove(&id), result),
                Err(e) => (
                    queues.remove(&e.id()),
                    Err(AmqpError::panicked(format!("consumer task failed: {}", e))),
                ),
            };
            let Err(e) = result else { continue };
            let queue = queue.unwrap_or_else(|| self.topology.queue.clone());

            if exit.is_none() {
                stop.cancel();
                exit = Some(AmqpError::consumer_exited(queue, e));
            } else {
                warn!(queue = %queue, "Consumer loop failed while stopping: {}", e);
            }
        }

        exit.map_or(Ok(()), Err)
    }

    fn spawn_loop(
        &self,
        loops: &mut JoinSet<Result<()>>,
        queues: &mut HashMap<Id, String>,
        queue: QueueLoop,
        stop: &CancellationToken,
        handler: Arc<dyn DeliveryHandler>,
    ) {
        let consumer = self.clone();
        let stop = stop.clone();
        let name = queue.queue.clone();
        let task = loops.spawn(async move {
            consumer
                .consume_queue(&queue, &stop, handler.as_ref())
                .await
        });
        queues.insert(task.id(), name);
    }

    async fn consume_queue(
        &self,
        queue: &QueueLoop,
        stop: &CancellationToken,
        handler: &dyn DeliveryHandler,
    ) -> Result<()> {
        let mut declared = false;

        loop {
            info!(queue = %queue.queue, "Attempting to join a session to consume");
            let next = tokio::select! {
                biased;
                _ = stop.cancelled() => return Ok(()),
                next = self.client.sessions.next_session() => next,
            };
            let Some(session) = next else {
                if stop.is_cancelled() {
                    return Ok(());
                }
                warn!(queue = %queue.queue, "No more sessions left to try");
                return Err(AmqpError::NoSessions);
            };

            let acker = Acker::spawn(session.clone());
            let end = AssertUnwindSafe(self.consume_session(
                &session,
                queue,
                stop,
                &mut declared,
                handler,
                &acker,
            ))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(AmqpError::panicked(panic_message(panic.as_ref()))));
            acker.stop().await;

            if let Err(e) = session.close().await {
                debug!(queue = %queue.queue, "Error closing consumer session: {}", e);
            }

            match end? {
                SessionEnd::Cancelled => return Ok(()),
                SessionEnd::Reconnect => {}
            }

            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
    }

    async fn consume_session(
        &self,
        session: &Session,
        queue: &QueueLoop,
        stop: &CancellationToken,
        declared: &mut bool,
        handler: &dyn DeliveryHandler,
        acker: &Acker,
    ) -> Result<SessionEnd> {
        let mut closed = session.notify_close()?;

        if !*declared {
            self.topology
                .declare(session, self.client.exchange())
                .await?;
            *declared = true;
        }

        session.qos(self.topology.prefetch).await.map_err(|e| {
            AmqpError::qos(format!(
                "failed to set prefetch count on queue {:?}: {}",
                queue.queue, e
            ))
        })?;

        let mut deliveries = session
            .consume(&queue.queue, queue.exclusive)
            .await
            .map_err(|e| AmqpError::subscribe(format!("cannot consume from {:?}: {}", queue.queue, e)))?;

        info!(queue = %queue.queue, exchange = %queue.exchange, "Subscribed to events");

        let mut ack_tick = interval_at(Instant::now() + ACK_INTERVAL, ACK_INTERVAL);
        let mut tick_elapsed = false;
        let mut count: u64 = 0;

        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    if let Some(exchange) = &queue.unbind_from {
                        if let Err(e) = session.unbind_queue(&queue.queue, "", exchange).await {
                            warn!(
                                queue = %queue.queue,
                                exchange = %exchange,
                                "Failure unbinding the queue from exchange: {}",
                                e
                            );
                        }
                    }
                    return Ok(SessionEnd::Cancelled);
                }
                reason = closed.recv() => {
                    warn!(
                        queue = %queue.queue,
                        "Channel closed by broker ({}), reconnecting",
                        reason.as_deref().unwrap_or("no reason")
                    );
                    return Ok(SessionEnd::Reconnect);
                }
                _ = ack_tick.tick() => {
                    tick_elapsed = true;
                }
                delivery = deliveries.recv() => {
                    let Some(delivery) = delivery else {
                        info!(queue = %queue.queue, "Consumer has ended, attempting to reconnect");
                        return Ok(SessionEnd::Reconnect);
                    };

                    let tag = delivery.delivery_tag;
                    let origin = delivery.origin_time();
                    handler.handle(delivery.body, origin).await;
                    count += 1;

                    if std::mem::take(&mut tick_elapsed) || count % self.ack_threshold == 0 {
                        acker.enqueue(tag).await;
                    }
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
