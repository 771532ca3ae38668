//! Consumption topology.
//!
//! A plain consumer owns one queue bound straight to the primary fanout
//! exchange, named after the worker so that the queue behaves like a consumer
//! group:
//!
//! ```text
//!            ) -> |-------------| -> [analytics-elasticsearch] -> (N * elasticsearch)
//! PUBLISHERS > -> | event.trust |
//!            ) -> |-------------| -> [analytics-risk-graph]    -> (N * risk-graph)
//! ```
//!
//! A sharded consumer puts a randomized-routing exchange named after the shard
//! between the fanout exchange and one short-lived queue per replica, so each
//! message reaches exactly one live replica. Queues expire 30 s after their
//! replica disappears, messages expire after 10 s, and both expired and
//! unroutable messages end up on the shard's dead-letter queue:
//!
//! ```text
//! | event.trust | -> | shard (x-random) | -> [host-a] [host-b] ...
//!                           |  alternate / dead-letter
//!                           v
//!                    | shard-dlx (direct) | -> [shard-dlq]
//! ```

use crate::broker::{Arguments, ExchangeKind, ExchangeOptions, FieldValue, QueueOptions};
use crate::error::{AmqpError, Result};
use crate::session::Session;
use tracing::info;
use uuid::Uuid;

/// Time a message may wait on a replica queue before being dead-lettered
pub const MESSAGE_TTL_MS: i64 = 10_000;

/// Time an unused replica queue survives its last consumer
pub const QUEUE_EXPIRY_MS: i64 = 30_000;

/// Sharded exchange plus the dead-letter path derived from its name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub exchange: String,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
}

impl Shard {
    /// Derive `<name>-dlx` and `<name>-dlq` from the shard name
    pub fn new(name: impl Into<String>) -> Self {
        let exchange = name.into();
        Self {
            dead_letter_exchange: format!("{}-dlx", exchange),
            dead_letter_queue: format!("{}-dlq", exchange),
            exchange,
        }
    }
}

/// Queue layout a consumer declares on its first session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub queue: String,
    pub shard: Option<Shard>,
    pub prefetch: u16,
    pub persistent: bool,
}

impl Topology {
    /// Queue bound straight to the primary exchange
    pub fn plain(queue: impl Into<String>, prefetch: u16, persistent: bool) -> Self {
        Self {
            queue: queue.into(),
            shard: None,
            prefetch,
            persistent,
        }
    }

    /// Replica queue behind the shard exchange `name`, named after this host
    pub fn sharded(name: impl Into<String>, prefetch: u16, persistent: bool) -> Self {
        let shard = Shard::new(name);
        Self {
            queue: replica_queue_name(&shard.exchange),
            shard: Some(shard),
            prefetch,
            persistent,
        }
    }

    /// Exchange the consumer queue is bound to
    pub fn queue_exchange<'a>(&'a self, primary: &'a str) -> &'a str {
        match &self.shard {
            Some(shard) => &shard.exchange,
            None => primary,
        }
    }

    /// Declare and bind everything the consumer reads from
    pub async fn declare(&self, session: &Session, primary: &str) -> Result<()> {
        let mut queue_args = Arguments::new();

        if let Some(shard) = &self.shard {
            let mut exchange_args = Arguments::new();
            exchange_args.insert(
                "alternate-exchange".to_owned(),
                FieldValue::Str(shard.dead_letter_exchange.clone()),
            );

            session
                .declare_exchange(
                    &shard.exchange,
                    ExchangeKind::RandomRouting,
                    ExchangeOptions {
                        durable: true,
                        auto_delete: false,
                        internal: true,
                        no_wait: true,
                    },
                    exchange_args,
                )
                .await
                .map_err(|e| {
                    AmqpError::topology(format!(
                        "cannot declare the analytic exchange {:?}: {}",
                        shard.exchange, e
                    ))
                })?;

            session
                .declare_exchange(
                    &shard.dead_letter_exchange,
                    ExchangeKind::Direct,
                    ExchangeOptions {
                        durable: true,
                        auto_delete: false,
                        internal: false,
                        no_wait: true,
                    },
                    Arguments::new(),
                )
                .await
                .map_err(|e| {
                    AmqpError::topology(format!(
                        "cannot declare the analytic dead-letter exchange {:?}: {}",
                        shard.dead_letter_exchange, e
                    ))
                })?;

            session
                .bind_exchange(&shard.exchange, "", primary, true)
                .await
                .map_err(|e| {
                    AmqpError::topology(format!(
                        "cannot bind analytic exchange {:?} to event type {:?}: {}",
                        shard.exchange, primary, e
                    ))
                })?;

            queue_args.insert(
                "x-dead-letter-exchange".to_owned(),
                FieldValue::Str(shard.dead_letter_exchange.clone()),
            );
            queue_args.insert("x-expires".to_owned(), FieldValue::Int(QUEUE_EXPIRY_MS));
            queue_args.insert("x-message-ttl".to_owned(), FieldValue::Int(MESSAGE_TTL_MS));
        }

        let queue_exchange = self.queue_exchange(primary);

        session
            .declare_queue(
                &self.queue,
                QueueOptions {
                    durable: self.persistent,
                    auto_delete: !self.persistent,
                    exclusive: !self.persistent,
                    no_wait: true,
                },
                queue_args,
            )
            .await
            .map_err(|e| {
                AmqpError::topology(format!("cannot declare replica queue {:?}: {}", self.queue, e))
            })?;

        session
            .bind_queue(&self.queue, "", queue_exchange, true)
            .await
            .map_err(|e| {
                AmqpError::topology(format!(
                    "cannot consume without a binding to exchange {:?}: {}",
                    queue_exchange, e
                ))
            })?;

        if let Some(shard) = &self.shard {
            session
                .declare_queue(
                    &shard.dead_letter_queue,
                    QueueOptions {
                        durable: true,
                        auto_delete: false,
                        exclusive: false,
                        no_wait: true,
                    },
                    Arguments::new(),
                )
                .await
                .map_err(|e| {
                    AmqpError::topology(format!(
                        "cannot declare dead letter queue {:?}: {}",
                        shard.dead_letter_queue, e
                    ))
                })?;

            session
                .bind_queue(&shard.dead_letter_queue, "", &shard.dead_letter_exchange, true)
                .await
                .map_err(|e| {
                    AmqpError::topology(format!(
                        "cannot consume without a binding to exchange {:?}: {}",
                        shard.dead_letter_exchange, e
                    ))
                })?;
        }

        info!(
            queue = %self.queue,
            exchange = %queue_exchange,
            event_type = %primary,
            "Queue has been declared and bound"
        );
        Ok(())
    }
}

/// Host name of this replica, or a random name when it cannot be determined
fn replica_queue_name(shard: &str) -> String {
    sysinfo::System::host_name()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("{}-{}", shard, Uuid::new_v4()))
}
