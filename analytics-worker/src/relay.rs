//! Pass-through analytic: every event goes to every output unchanged.

use crate::error::Result;
use crate::output::OutputSet;
use crate::worker::EventHandler;
use async_trait::async_trait;

#[derive(Debug, Clone, Copy, Default)]
pub struct Relay;

#[async_trait]
impl EventHandler for Relay {
    async fn handle(&self, payload: Vec<u8>, outputs: &OutputSet) -> Result<()> {
        let mut failed = None;
        for name in outputs.names() {
            if let Err(e) = outputs.send(name, payload.clone()).await {
                failed = Some(e);
            }
        }
        failed.map_or(Ok(()), Err)
    }
}
