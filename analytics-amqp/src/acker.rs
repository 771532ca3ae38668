//! Batched acknowledgement task bound to one session cycle

use crate::session::Session;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the pending-ack tag queue
pub const ACK_QUEUE_CAPACITY: usize = 5000;

/// Issues cumulative acks for tags queued by the delivery loop.
///
/// Tags must be queued in non-decreasing order; acking tag `T` also
/// acknowledges every earlier unacknowledged delivery on the channel.
pub struct Acker {
    tags: mpsc::Sender<u64>,
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl Acker {
    /// Spawn an acker borrowing `session` until [`Acker::stop`] is called
    pub fn spawn(session: Session) -> Self {
        let (tags, queue) = mpsc::channel(ACK_QUEUE_CAPACITY);
        let (stop, stopped) = oneshot::channel();
        let handle = tokio::spawn(Self::run(session, queue, stopped));
        Self {
            tags,
            stop: Some(stop),
            handle,
        }
    }

    /// Queue `delivery_tag` for a cumulative ack
    pub async fn enqueue(&self, delivery_tag: u64) {
        if self.tags.send(delivery_tag).await.is_err() {
            warn!(delivery_tag, "Acker has stopped, ack not queued");
        }
    }

    /// Signal the task to exit and wait for it
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.handle).await {
            warn!("Acker task failed: {}", e);
        }
    }

    async fn run(session: Session, mut queue: mpsc::Receiver<u64>, mut stopped: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                _ = &mut stopped => {
                    // tags queued before the stop still get one cumulative ack
                    let mut last = None;
                    while let Ok(tag) = queue.try_recv() {
                        last = Some(tag);
                    }
                    if let Some(tag) = last {
                        if let Err(e) = session.ack(tag, true).await {
                            warn!(delivery_tag = tag, "Final cumulative ack failed: {}", e);
                        }
                    }
                    info!("Closing down acker");
                    return;
                }
                tag = queue.recv() => match tag {
                    Some(tag) => {
                        if let Err(e) = session.ack(tag, true).await {
                            warn!(delivery_tag = tag, "Cumulative ack failed: {}", e);
                        } else {
                            debug!(delivery_tag = tag, "Acknowledged deliveries");
                        }
                    }
                    None => return,
                },
            }
        }
    }
}

impl Drop for Acker {
    fn drop(&mut self) {
        if self.stop.is_some() {
            self.handle.abort();
        }
    }
}
