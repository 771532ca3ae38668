//! Error types for the analytics AMQP client

use thiserror::Error;

/// Result type alias for AMQP client operations
pub type Result<T> = std::result::Result<T, AmqpError>;

/// Errors that can occur while talking to the broker
#[derive(Error, Debug)]
pub enum AmqpError {
    /// Dialling the broker failed
    #[error("Dial error: {0}")]
    Dial(String),

    /// Opening or using a logical channel failed
    #[error("Channel error: {0}")]
    Channel(String),

    /// Declaring, binding or unbinding topology failed
    #[error("Topology error: {0}")]
    Topology(String),

    /// Setting the prefetch count failed
    #[error("QoS error: {0}")]
    Qos(String),

    /// Opening the delivery feed failed
    #[error("Subscribe error: {0}")]
    Subscribe(String),

    /// A publish call failed on the wire
    #[error("Publish error: {0}")]
    Publish(String),

    /// An acknowledgement could not be delivered
    #[error("Ack error: {0}")]
    Ack(String),

    /// Closing the broker connection failed
    #[error("Close error: {0}")]
    Close(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A consumer loop panicked, usually inside the delivery handler
    #[error("Consumer loop panicked: {0}")]
    Panicked(String),

    /// The session factory is gone and no further sessions will be offered
    #[error("No more sessions left to try")]
    NoSessions,

    /// One of the consumer loops stopped while the consumer was still wanted
    #[error("Consuming from the {queue} queue unexpectedly exited: {source}")]
    ConsumerExited {
        /// Queue the failed loop was consuming from
        queue: String,
        /// Why the loop stopped
        #[source]
        source: Box<AmqpError>,
    },
}

impl AmqpError {
    /// Create a dial error
    pub fn dial(msg: impl Into<String>) -> Self {
        Self::Dial(msg.into())
    }

    /// Create a channel error
    pub fn channel(msg: impl Into<String>) -> Self {
        Self::Channel(msg.into())
    }

    /// Create a topology error
    pub fn topology(msg: impl Into<String>) -> Self {
        Self::Topology(msg.into())
    }

    /// Create a QoS error
    pub fn qos(msg: impl Into<String>) -> Self {
        Self::Qos(msg.into())
    }

    /// Create a subscribe error
    pub fn subscribe(msg: impl Into<String>) -> Self {
        Self::Subscribe(msg.into())
    }

    /// Create a publish error
    pub fn publish(msg: impl Into<String>) -> Self {
        Self::Publish(msg.into())
    }

    /// Create an ack error
    pub fn ack(msg: impl Into<String>) -> Self {
        Self::Ack(msg.into())
    }

    /// Create a close error
    pub fn close(msg: impl Into<String>) -> Self {
        Self::Close(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a panic error
    pub fn panicked(msg: impl Into<String>) -> Self {
        Self::Panicked(msg.into())
    }

    /// Wrap the reason a consumer loop stopped
    pub fn consumer_exited(queue: impl Into<String>, source: AmqpError) -> Self {
        Self::ConsumerExited {
            queue: queue.into(),
            source: Box::new(source),
        }
    }
}

impl From<lapin::Error> for AmqpError {
    fn from(err: lapin::Error) -> Self {
        Self::Channel(err.to_string())
    }
}
