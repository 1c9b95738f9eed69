//! Pending-delivery queue for recipients that are not connected yet

use crate::adapter::DeviceId;
use crate::envelope::Envelope;
use crate::error::{MeshError, MeshResult};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

struct QueuedEnvelope {
    envelope: Envelope,
    queued_at: Instant,
}

/// Store-and-forward queue for envelopes addressed to a specific peer
///
/// Envelopes are held per recipient with a size limit and a maximum age,
/// and handed back in FIFO order when that recipient connects.
pub struct StoreForwardQueue {
    queue: HashMap<DeviceId, VecDeque<QueuedEnvelope>>,
    max_queue_size: usize,
    max_age: Duration,
}

impl StoreForwardQueue {
    /// Create a new store-and-forward queue
    ///
    /// # Arguments
    /// * `max_queue_size` - Maximum number of envelopes to hold per recipient
    /// * `max_age` - Maximum time an envelope waits before it is discarded
    pub fn new(max_queue_size: usize, max_age: Duration) -> Self {
        info!(
            "Initializing StoreForwardQueue with max_queue_size={}, max_age={:?}",
            max_queue_size, max_age
        );

        Self {
            queue: HashMap::new(),
            max_queue_size,
            max_age,
        }
    }

    /// Hold an envelope until `recipient` connects
    ///
    /// # Returns
    /// * `Ok(())` if the envelope was stored
    /// * `Err(MeshError::QueueFull)` if the recipient's queue is at capacity
    pub fn store(&mut self, recipient: &DeviceId, envelope: Envelope) -> MeshResult<()> {
        let queue = self.queue.entry(recipient.clone()).or_default();

        if queue.len() >= self.max_queue_size {
            warn!(
                "Queue full for recipient {} (size: {})",
                recipient,
                queue.len()
            );
            return Err(MeshError::QueueFull(recipient.clone()));
        }

        debug!("Queued envelope {} for recipient {}", envelope.id, recipient);
        queue.push_back(QueuedEnvelope {
            envelope,
            queued_at: Instant::now(),
        });

        Ok(())
    }

    /// Take every envelope held for `recipient`, oldest first
    pub fn retrieve(&mut self, recipient: &DeviceId) -> Vec<Envelope> {
        match self.queue.remove(recipient) {
            Some(queue) => {
                info!(
                    "Retrieved {} pending envelopes for recipient {}",
                    queue.len(),
                    recipient
                );
                queue.into_iter().map(|q| q.envelope).collect()
            }
            None => Vec::new(),
        }
    }

    /// Drop envelopes older than the maximum age and forget empty queues
    pub fn cleanup_expired(&mut self) -> usize {
        let now = Instant::now();
        let max_age = self.max_age;
        let mut total_removed = 0;

        self.queue.retain(|recipient, queue| {
            let original_size = queue.len();
            queue.retain(|queued| now.duration_since(queued.queued_at) <= max_age);

            let removed = original_size - queue.len();
            if removed > 0 {
                debug!(
                    "Removed {} expired envelopes for recipient {}",
                    removed, recipient
                );
            }
            total_removed += removed;

            !queue.is_empty()
        });

        if total_removed > 0 {
            info!("Cleanup complete: removed {} expired envelopes", total_removed);
        }
        total_removed
    }

    pub fn get_queue_size(&self, recipient: &DeviceId) -> usize {
        self.queue.get(recipient).map(|q| q.len()).unwrap_or(0)
    }

    pub fn total_envelopes(&self) -> usize {
        self.queue.values().map(|q| q.len()).sum()
    }

    pub fn recipient_count(&self) -> usize {
        self.queue.len()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}
