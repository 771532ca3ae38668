//! Identity shared by publishers and consumers

use crate::broker::Connector;
use crate::session::{SessionFactory, SessionStream};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Pause between giving up a session and asking for the next one
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Broker address, primary exchange and the session stream serving them
#[derive(Debug, Clone)]
pub struct Client {
    broker: String,
    exchange: String,
    pub(crate) sessions: SessionStream,
}

impl Client {
    /// Start a session factory for `exchange` on `broker`
    pub fn connect(
        cancel: CancellationToken,
        connector: Arc<dyn Connector>,
        broker: impl Into<String>,
        exchange: impl Into<String>,
    ) -> Self {
        let broker = broker.into();
        let exchange = exchange.into();
        let sessions = SessionFactory::start(cancel, connector, broker.clone(), exchange.clone());
        Self {
            broker,
            exchange,
            sessions,
        }
    }

    pub fn broker(&self) -> &str {
        &self.broker
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Stream this client draws its sessions from
    pub fn sessions(&self) -> &SessionStream {
        &self.sessions
    }
}
