//! Confirm-gated publisher.
//!
//! Drains an application byte source into the primary fanout exchange with a
//! publish window of exactly one message: the source is not read again until
//! the broker has confirmed (or rejected) the outstanding message. A message
//! whose publish call fails is carried over and published first on the next
//! session. A message the broker nacks is handed to the [`NackPolicy`], which
//! drops it by default.

use crate::broker::{
    format_origin_timestamp, Arguments, Confirmation, Connector, FieldValue, Publishing,
    TIMESTAMP_HEADER,
};
use crate::client::{Client, DEFAULT_RECONNECT_DELAY};
use crate::error::{AmqpError, Result};
use crate::session::Session;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What to do with a message the broker refused to confirm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackAction {
    /// Log and abandon the message
    Drop,
    /// Publish the message again on the current session
    Retry,
}

/// Decides the fate of negatively confirmed messages
pub trait NackPolicy: Send + Sync {
    fn on_nack(&self, exchange: &str, confirmation: &Confirmation, body: &[u8]) -> NackAction;
}

/// Default policy: nacked messages are logged and dropped
#[derive(Debug, Clone, Copy, Default)]
pub struct DropOnNack;

impl NackPolicy for DropOnNack {
    fn on_nack(&self, exchange: &str, confirmation: &Confirmation, body: &[u8]) -> NackAction {
        warn!(
            exchange = %exchange,
            delivery_tag = confirmation.delivery_tag,
            "Nack for message ({} bytes), dropping it",
            body.len()
        );
        NackAction::Drop
    }
}

/// Nacked messages are published again until the broker accepts them
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryOnNack;

impl NackPolicy for RetryOnNack {
    fn on_nack(&self, exchange: &str, confirmation: &Confirmation, _body: &[u8]) -> NackAction {
        warn!(
            exchange = %exchange,
            delivery_tag = confirmation.delivery_tag,
            "Nack for message, publishing it again"
        );
        NackAction::Retry
    }
}

/// How a single session cycle ended
enum SessionEnd {
    SourceClosed,
    Reconnect { cooldown: bool },
}

/// Publishes to a reconnecting session on a fanout exchange
pub struct Publisher {
    client: Client,
    nack_policy: Arc<dyn NackPolicy>,
    reconnect_delay: Duration,
}

impl Publisher {
    /// Create a publisher for the fanout `exchange` on `broker`
    pub fn new(
        cancel: CancellationToken,
        connector: Arc<dyn Connector>,
        exchange: impl Into<String>,
        broker: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::connect(cancel, connector, broker, exchange),
            nack_policy: Arc::new(DropOnNack),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    /// Replace the default drop-on-nack behaviour
    pub fn with_nack_policy(mut self, policy: impl NackPolicy + 'static) -> Self {
        self.nack_policy = Arc::new(policy);
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Publish everything received on `messages`.
    ///
    /// Returns `Ok(())` once the source is closed and drained, or
    /// [`AmqpError::NoSessions`] when the session factory has terminated.
    pub async fn publish(&self, mut messages: mpsc::Receiver<Vec<u8>>) -> Result<()> {
        // Message to publish before anything else is read; survives reconnects
        let mut pending: Option<Vec<u8>> = None;

        while let Some(session) = self.client.sessions.next_session().await {
            let end = self
                .publish_session(&session, &mut messages, &mut pending)
                .await;

            if let Err(e) = session.close().await {
                debug!("Error closing publisher session: {}", e);
            }

            match end {
                SessionEnd::SourceClosed => return Ok(()),
                SessionEnd::Reconnect { cooldown } => {
                    info!(exchange = %self.client.exchange(), "Publisher reconnecting");
                    if cooldown {
                        tokio::time::sleep(self.reconnect_delay).await;
                    }
                }
            }
        }

        Err(AmqpError::NoSessions)
    }

    async fn publish_session(
        &self,
        session: &Session,
        messages: &mut mpsc::Receiver<Vec<u8>>,
        pending: &mut Option<Vec<u8>>,
    ) -> SessionEnd {
        let exchange = self.client.exchange();

        let mut confirms = match session.confirm_select().await {
            Ok(()) => session.notify_publish().ok(),
            Err(e) => {
                warn!(exchange = %exchange, "Publisher confirms not supported: {}", e);
                None
            }
        };
        if confirms.is_none() {
            // never deliver without confirmation
            return SessionEnd::Reconnect { cooldown: true };
        }

        info!(exchange = %exchange, "Publishing events");

        // Published and awaiting its confirmation
        let mut outstanding: Option<Vec<u8>> = None;

        loop {
            if let Some(body) = pending.take() {
                match session.publish(exchange, "", stamp(&body)).await {
                    Ok(()) => outstanding = Some(body),
                    Err(e) => {
                        warn!(exchange = %exchange, "Publish failed, retrying on next session: {}", e);
                        *pending = Some(body);
                        return SessionEnd::Reconnect { cooldown: false };
                    }
                }
            }

            let reading = outstanding.is_none();

            tokio::select! {
                confirmation = next_confirmation(&mut confirms) => match confirmation {
                    Some(confirmation) => {
                        let Some(body) = outstanding.take() else {
                            debug!(delivery_tag = confirmation.delivery_tag, "Unexpected confirmation");
                            continue;
                        };
                        if !confirmation.ack
                            && self.nack_policy.on_nack(exchange, &confirmation, &body) == NackAction::Retry
                        {
                            *pending = Some(body);
                        }
                    }
                    None => {
                        if let Some(body) = outstanding.take() {
                            warn!(
                                exchange = %exchange,
                                "Confirmation feed closed, dropping unconfirmed message ({} bytes)",
                                body.len()
                            );
                        }
                        return SessionEnd::Reconnect { cooldown: false };
                    }
                },
                body = messages.recv(), if reading => match body {
                    Some(body) => *pending = Some(body),
                    None => return SessionEnd::SourceClosed,
                },
            }
        }
    }
}

async fn next_confirmation(
    feed: &mut Option<mpsc::UnboundedReceiver<Confirmation>>,
) -> Option<Confirmation> {
    match feed {
        Some(feed) => feed.recv().await,
        None => None,
    }
}

/// Wrap `body` with the origin timestamp header
fn stamp(body: &[u8]) -> Publishing {
    let mut headers = Arguments::new();
    headers.insert(
        TIMESTAMP_HEADER.to_owned(),
        FieldValue::Str(format_origin_timestamp(SystemTime::now())),
    );
    Publishing {
        headers,
        body: body.to_vec(),
    }
}
