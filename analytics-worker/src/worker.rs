//! Queue worker: one sharded input queue, any number of named outputs.
//!
//! The worker consumes `analytics-<program>` as a replica of the shard of the
//! same name on the input exchange, passes every payload to an
//! [`EventHandler`] and gives the handler the [`OutputSet`] to publish results
//! through. Payloads cross from the consumer to the handler loop over a
//! bounded channel, so a slow handler backs up into the consumer's prefetch
//! window rather than into memory.

use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};
use crate::output::{parse_outputs, Output, OutputSet, OutputSpec};
use crate::stats::WorkerStats;
use analytics_amqp::{Connector, Consumer, DeliveryHandler, LapinConnector, Publisher};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Payloads buffered between the consumer and the handler loop
pub const INPUT_BUFFER: usize = 100;

/// Application logic run for every consumed event
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Errors are logged and the event is skipped; they never stop the worker.
    async fn handle(&self, payload: Vec<u8>, outputs: &OutputSet) -> Result<()>;
}

/// Counts each delivery and forwards its payload to the handler loop
struct Forwarder {
    payloads: mpsc::Sender<Vec<u8>>,
    stats: Arc<WorkerStats>,
}

#[async_trait]
impl DeliveryHandler for Forwarder {
    async fn handle(&self, payload: Vec<u8>, origin: Option<SystemTime>) {
        self.stats.record_received(origin);
        if self.payloads.send(payload).await.is_err() {
            warn!("Worker loop has stopped, discarding payload");
        }
    }
}

/// Consumes the worker queue and drives an [`EventHandler`]
pub struct QueueWorker {
    config: WorkerConfig,
    input: String,
    outputs: Vec<OutputSpec>,
    connector: Arc<dyn Connector>,
    stats: Arc<WorkerStats>,
}

impl QueueWorker {
    /// Validate `config` and the `name:endpoint` output arguments.
    ///
    /// Nothing touches the broker until [`QueueWorker::run`].
    pub fn new<S: AsRef<str>>(
        config: WorkerConfig,
        input_exchange: impl Into<String>,
        outputs: &[S],
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            input: input_exchange.into(),
            outputs: parse_outputs(outputs)?,
            connector: Arc::new(LapinConnector::default()),
            stats: Arc::new(WorkerStats::new()),
        })
    }

    /// Use a different broker client
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn queue(&self) -> String {
        self.config.queue_name()
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    fn start_outputs(&self, cancel: &CancellationToken) -> Result<OutputSet> {
        let mut outputs = OutputSet::new();
        for spec in &self.outputs {
            let publisher = Publisher::new(
                cancel.clone(),
                Arc::clone(&self.connector),
                spec.endpoint.clone(),
                self.config.broker.clone(),
            )
            .with_reconnect_delay(self.config.reconnect_delay());
            outputs.add(Output::start(
                spec.clone(),
                publisher,
                self.config.output_buffer,
                Arc::clone(&self.stats),
            ))?;
        }
        Ok(outputs)
    }

    fn consumer(&self, cancel: &CancellationToken) -> Result<Consumer> {
        let mut consumer = Consumer::new_sharded(
            cancel.clone(),
            Arc::clone(&self.connector),
            self.queue(),
            self.input.clone(),
            self.config.broker.clone(),
            self.config.prefetch,
            self.config.persistent,
        )
        .with_reconnect_delay(self.config.reconnect_delay());
        consumer.set_ack_threshold(self.config.ack_threshold)?;
        Ok(consumer)
    }

    /// Run until `cancel` fires or the queue reader dies.
    ///
    /// Returns `Ok(())` on cancellation after outputs have drained, or
    /// [`WorkerError::ReaderStopped`] when the consumer exits on its own.
    ///
    /// Cancellation is checked between events. Payloads already buffered for
    /// the handler (at most [`INPUT_BUFFER`]) are dropped unhandled, and some of
    /// them may already be acknowledged. The publishers stop on the same token,
    /// so handling them would have nowhere to send results.
    pub async fn run(&self, cancel: CancellationToken, handler: impl EventHandler) -> Result<()> {
        let outputs = self.start_outputs(&cancel)?;
        let consumer = self.consumer(&cancel)?;

        info!(
            queue = %self.queue(),
            exchange = %self.input,
            outputs = outputs.len(),
            "Starting queue worker"
        );

        let (payloads, mut inbound) = mpsc::channel(INPUT_BUFFER);
        let forwarder = Forwarder {
            payloads,
            stats: Arc::clone(&self.stats),
        };
        let mut reader = tokio::spawn(async move { consumer.consume(forwarder).await });

        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                payload = inbound.recv() => match payload {
                    Some(payload) => {
                        if let Err(e) = handler.handle(payload, &outputs).await {
                            warn!("Event handler failed: {}", e);
                        }
                    }
                    None => break Err(reader_exit((&mut reader).await)),
                },
            }
        };

        // unblock a reader waiting on a full channel
        drop(inbound);
        if result.is_ok() {
            match reader.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Queue reader ended with an error during shutdown: {}", e),
                Err(e) => warn!("Queue reader task failed during shutdown: {}", e),
            }
        }

        outputs.close().await;
        info!(queue = %self.queue(), "Queue worker stopped");
        result
    }
}

fn reader_exit(
    joined: std::result::Result<analytics_amqp::Result<()>, tokio::task::JoinError>,
) -> WorkerError {
    let reason = match joined {
        Ok(Ok(())) => "consumer returned".to_owned(),
        Ok(Err(e)) => e.to_string(),
        Err(e) => format!("consumer task failed: {}", e),
    };
    error!("Error in reading from queue: {}", reason);
    WorkerError::reader_stopped(reason)
}
