//! Named outputs, each draining a bounded buffer into its own publisher.
//!
//! Outputs are configured as `name:endpoint` where the endpoint is the fanout
//! exchange to publish to. A handler sends by name; the send waits for buffer
//! space and fails once the publisher behind the output has exited.

use crate::error::{Result, WorkerError};
use crate::stats::WorkerStats;
use analytics_amqp::Publisher;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Parsed `name:endpoint` output argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSpec {
    pub name: String,
    /// Exchange the output publishes to
    pub endpoint: String,
}

impl FromStr for OutputSpec {
    type Err = WorkerError;

    fn from_str(spec: &str) -> Result<Self> {
        let (name, endpoint) = spec
            .split_once(':')
            .ok_or_else(|| WorkerError::invalid_output(spec))?;
        if name.is_empty() || endpoint.is_empty() {
            return Err(WorkerError::invalid_output(spec));
        }
        Ok(Self {
            name: name.to_owned(),
            endpoint: endpoint.to_owned(),
        })
    }
}

/// Parse output arguments, rejecting malformed entries and repeated names.
pub fn parse_outputs<S: AsRef<str>>(specs: &[S]) -> Result<Vec<OutputSpec>> {
    let mut parsed: Vec<OutputSpec> = Vec::with_capacity(specs.len());
    for spec in specs {
        let output: OutputSpec = spec.as_ref().parse()?;
        if parsed.iter().any(|existing| existing.name == output.name) {
            return Err(WorkerError::DuplicateOutput(output.name));
        }
        parsed.push(output);
    }
    Ok(parsed)
}

/// One named output backed by a publisher task
pub struct Output {
    name: String,
    exchange: String,
    sender: mpsc::Sender<Vec<u8>>,
    stopped: CancellationToken,
    task: JoinHandle<()>,
    stats: Arc<WorkerStats>,
}

impl Output {
    /// Spawn `publisher` draining a buffer of `buffer` messages
    pub fn start(
        spec: OutputSpec,
        publisher: Publisher,
        buffer: usize,
        stats: Arc<WorkerStats>,
    ) -> Self {
        let (sender, source) = mpsc::channel(buffer.max(1));
        let stopped = CancellationToken::new();

        let done = stopped.clone();
        let name = spec.name.clone();
        let exchange = spec.endpoint.clone();
        let task = tokio::spawn(async move {
            match publisher.publish(source).await {
                Ok(()) => debug!(output = %name, "Output drained"),
                Err(e) => error!(
                    output = %name,
                    exchange = %exchange,
                    "Failed to write to queue with error: {}",
                    e
                ),
            }
            done.cancel();
        });

        Self {
            name: spec.name,
            exchange: spec.endpoint,
            sender,
            stopped,
            task,
            stats,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Whether the publisher behind this output has exited
    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// Queue `payload` for publishing, waiting for buffer space.
    pub async fn send(&self, payload: Vec<u8>) -> Result<()> {
        if self.is_stopped() {
            return Err(WorkerError::output_stopped(&self.name));
        }
        tokio::select! {
            biased;
            _ = self.stopped.cancelled() => Err(WorkerError::output_stopped(&self.name)),
            sent = self.sender.send(payload) => {
                sent.map_err(|_| WorkerError::output_stopped(&self.name))?;
                self.stats.record_sent();
                Ok(())
            }
        }
    }

    /// Close the buffer and wait for the publisher to drain it.
    pub async fn close(self) {
        let Self {
            name, sender, task, ..
        } = self;
        drop(sender);
        if let Err(e) = task.await {
            error!(output = %name, "Output task failed: {}", e);
        }
    }
}

/// Outputs addressed by name
#[derive(Default)]
pub struct OutputSet {
    outputs: HashMap<String, Output>,
}

impl OutputSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an output, replacing none: names are unique.
    pub fn add(&mut self, output: Output) -> Result<()> {
        if self.outputs.contains_key(output.name()) {
            return Err(WorkerError::DuplicateOutput(output.name().to_owned()));
        }
        info!(output = %output.name(), exchange = %output.exchange(), "Output added");
        self.outputs.insert(output.name().to_owned(), output);
        Ok(())
    }

    /// Send `payload` to the output called `name`.
    pub async fn send(&self, name: &str, payload: Vec<u8>) -> Result<()> {
        let output = self
            .outputs
            .get(name)
            .ok_or_else(|| WorkerError::unknown_output(name))?;
        output.send(payload).await
    }

    pub fn get(&self, name: &str) -> Option<&Output> {
        self.outputs.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.outputs.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Close every output, letting each publisher drain its buffer.
    pub async fn close(self) {
        for (_, output) in self.outputs {
            output.close().await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_output_spec() {
        let spec: OutputSpec = "alerts:ioc.alerts".parse().unwrap();
        assert_eq!(spec.name, "alerts");
        assert_eq!(spec.endpoint, "ioc.alerts");
    }

    #[test]
    fn test_endpoint_may_contain_colons() {
        let spec: OutputSpec = "out:exchange:with:colons".parse().unwrap();
        assert_eq!(spec.name, "out");
        assert_eq!(spec.endpoint, "exchange:with:colons");
    }

    #[test]
    fn test_malformed_specs_rejected() {
        for spec in ["no-separator", ":endpoint", "name:", ""] {
            assert!(
                matches!(spec.parse::<OutputSpec>(), Err(WorkerError::InvalidOutput(_))),
                "{spec:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let result = parse_outputs(&["a:one", "b:two", "a:three"]);
        assert!(matches!(result, Err(WorkerError::DuplicateOutput(name)) if name == "a"));
    }

    #[tokio::test]
    async fn test_unknown_output() {
        let outputs = OutputSet::new();
        let result = outputs.send("missing", b"x".to_vec()).await;
        assert!(matches!(result, Err(WorkerError::UnknownOutput(name)) if name == "missing"));
    }
}
