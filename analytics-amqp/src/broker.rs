//! Broker protocol seam.
//!
//! The core never frames AMQP itself. Everything it needs from the wire client
//! is expressed by the [`Connector`], [`Connection`] and [`Channel`] traits so
//! that the production `lapin` adapter and the in-memory test broker are
//! interchangeable, selected once when a publisher or consumer is built.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// Header carrying the origin publish time in nanoseconds since the Unix epoch
pub const TIMESTAMP_HEADER: &str = "timestamp_in_ns";

/// Single header or argument value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// UTF-8 string value
    Str(String),
    /// Signed integer value
    Int(i64),
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

/// Declaration arguments and message headers
pub type Arguments = BTreeMap<String, FieldValue>;

/// Routing behaviour of an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Copies every message to all bound queues
    Fanout,
    /// Delivers each message to exactly one randomly chosen bound queue
    RandomRouting,
    /// Routes by exact routing-key match
    Direct,
}

impl ExchangeKind {
    /// Exchange type name understood by the broker
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fanout => "fanout",
            Self::RandomRouting => "x-random",
            Self::Direct => "direct",
        }
    }
}

/// Flags for an exchange declaration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub no_wait: bool,
}

/// Flags for a queue declaration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub no_wait: bool,
}

/// Outbound message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Publishing {
    pub headers: Arguments,
    pub body: Vec<u8>,
}

/// Inbound message handed out on a delivery feed
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Channel-scoped, strictly increasing delivery tag
    pub delivery_tag: u64,
    pub headers: Arguments,
    pub body: Vec<u8>,
}

impl Delivery {
    /// Origin publish time carried in the timestamp header, if any
    pub fn origin_time(&self) -> Option<SystemTime> {
        match self.headers.get(TIMESTAMP_HEADER) {
            Some(FieldValue::Str(raw)) => parse_origin_timestamp(raw),
            _ => None,
        }
    }
}

/// Publisher confirmation reported by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    pub delivery_tag: u64,
    pub ack: bool,
}

/// Render `time` as the decimal nanosecond string used in [`TIMESTAMP_HEADER`]
pub fn format_origin_timestamp(time: SystemTime) -> String {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .to_string()
}

/// Parse a decimal nanosecond timestamp. Malformed input yields `None`.
pub fn parse_origin_timestamp(raw: &str) -> Option<SystemTime> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let nanos: u128 = raw.parse().ok()?;
    let secs = u64::try_from(nanos / 1_000_000_000).ok()?;
    // remainder is always below one billion
    let subsec = (nanos % 1_000_000_000) as u32;
    UNIX_EPOCH.checked_add(Duration::new(secs, subsec))
}

/// Dials the broker
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new connection to `url`
    async fn connect(&self, url: &str) -> Result<Arc<dyn Connection>>;
}

/// One broker connection
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open a logical channel on this connection
    async fn open_channel(&self) -> Result<Arc<dyn Channel>>;

    /// Close the connection and every channel on it
    async fn close(&self) -> Result<()>;
}

/// One logical channel on a connection
#[async_trait]
pub trait Channel: Send + Sync {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
        arguments: Arguments,
    ) -> Result<()>;

    /// Bind exchange `destination` to `source`
    async fn bind_exchange(
        &self,
        destination: &str,
        routing_key: &str,
        source: &str,
        no_wait: bool,
    ) -> Result<()>;

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        arguments: Arguments,
    ) -> Result<()>;

    async fn bind_queue(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
        no_wait: bool,
    ) -> Result<()>;

    async fn unbind_queue(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<()>;

    /// Limit unacknowledged deliveries on this channel
    async fn qos(&self, prefetch_count: u16) -> Result<()>;

    /// Put the channel into publisher-confirm mode
    async fn confirm_select(&self) -> Result<()>;

    /// Feed of publisher confirmations, in publish order
    fn notify_publish(&self) -> mpsc::UnboundedReceiver<Confirmation>;

    async fn publish(&self, exchange: &str, routing_key: &str, message: Publishing) -> Result<()>;

    /// Start consuming `queue`; the feed closes when the broker cancels the consumer
    async fn consume(&self, queue: &str, exclusive: bool) -> Result<mpsc::Receiver<Delivery>>;

    /// Acknowledge `delivery_tag`, and every earlier tag when `multiple` is set
    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<()>;

    /// Feed that yields once when the broker closes the channel
    fn notify_close(&self) -> mpsc::UnboundedReceiver<String>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_exchange_kind_names() {
        assert_eq!(ExchangeKind::Fanout.as_str(), "fanout");
        assert_eq!(ExchangeKind::RandomRouting.as_str(), "x-random");
        assert_eq!(ExchangeKind::Direct.as_str(), "direct");
    }

    #[test]
    fn test_parse_known_timestamp() {
        let parsed = parse_origin_timestamp("1500000000123456789").unwrap();
        let expected = UNIX_EPOCH + Duration::new(1_500_000_000, 123_456_789);
        assert_eq!(parsed, expected);
    }

    #[test]
    fn test_short_timestamp_is_sub_second() {
        // fewer than nine digits is still a valid count of nanoseconds
        let parsed = parse_origin_timestamp("42").unwrap();
        assert_eq!(parsed, UNIX_EPOCH + Duration::from_nanos(42));
    }

    #[test]
    fn test_malformed_timestamps() {
        for raw in ["", "abc", "-5", "12.5", " 12", "1e9"] {
            assert!(parse_origin_timestamp(raw).is_none(), "accepted {raw:?}");
        }
    }

    #[test]
    fn test_delivery_origin_time_requires_string_header() {
        let mut headers = Arguments::new();
        headers.insert(TIMESTAMP_HEADER.to_owned(), FieldValue::Int(10));
        let delivery = Delivery {
            delivery_tag: 1,
            headers,
            body: Vec::new(),
        };
        assert!(delivery.origin_time().is_none());
    }

    proptest! {
        #[test]
        fn test_timestamp_format_parse(nanos in 0u64..u64::MAX) {
            let time = UNIX_EPOCH + Duration::from_nanos(nanos);
            let raw = format_origin_timestamp(time);
            prop_assert_eq!(parse_origin_timestamp(&raw), Some(time));
        }

        #[test]
        fn test_parse_never_panics(raw in "\\PC*") {
            let _ = parse_origin_timestamp(&raw);
        }
    }
}
