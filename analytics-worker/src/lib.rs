//! # Analytics Worker
//!
//! Framework for analytic processes that read events from one broker exchange
//! and publish results to named outputs.
//!
//! - [`ConfigLoader`] merges defaults, TOML files and the environment
//! - [`logging::init`] installs the tracing subscriber
//! - [`shutdown_token`] is cancelled on SIGTERM/SIGINT
//! - [`QueueWorker`] consumes `analytics-<program>` and drives an [`EventHandler`]
//! - [`OutputSet`] publishes through one confirm-gated publisher per output
//!
//! ```rust,no_run
//! use analytics_worker::{
//!     logging, shutdown_token, ConfigLoader, EventHandler, OutputSet, QueueWorker, Result,
//! };
//!
//! struct Uppercase;
//!
//! #[async_trait::async_trait]
//! impl EventHandler for Uppercase {
//!     async fn handle(&self, payload: Vec<u8>, outputs: &OutputSet) -> Result<()> {
//!         outputs.send("out", payload.to_ascii_uppercase()).await
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//!     let config = ConfigLoader::new("uppercase").load()?;
//!     logging::init(&config.logging)?;
//!     let worker = QueueWorker::new(config, "event.trust", &["out:event.upper"])?;
//!     worker.run(shutdown_token(), Uppercase).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod output;
pub mod relay;
pub mod shutdown;
pub mod stats;
pub mod worker;

pub use config::{ConfigError, ConfigLoader, LogFormat, LoggingConfig, WorkerConfig};
pub use error::{Result, WorkerError};
pub use output::{Output, OutputSet, OutputSpec};
pub use relay::Relay;
pub use shutdown::shutdown_token;
pub use stats::{StatsSnapshot, WorkerStats};
pub use worker::{EventHandler, QueueWorker};
