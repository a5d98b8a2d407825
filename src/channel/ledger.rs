use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use log::{debug, warn};
use tokio::sync::Mutex;

use crate::{
    broker::{BrokerResult, Error},
    message::{Delivery, Message},
    queue::Queue,
};

#[derive(Debug)]
struct Unacked {
    tag: u64,
    message: Message,
    queue: Arc<Queue>,
}

/// Per-channel record of deliveries handed out but not yet acknowledged,
/// kept in delivery tag order.
#[derive(Debug, Default)]
pub struct Ledger {
    unacked: Mutex<Vec<Unacked>>,
    last_tag: AtomicU64,
    closed: AtomicBool,
}

impl Ledger {
    /// Assigns the next delivery tag and records the message as unacked.
    pub(crate) async fn record(
        self: &Arc<Self>,
        message: Message,
        queue: &Arc<Queue>,
        consumer_tag: &str,
    ) -> Delivery {
        let mut unacked = self.unacked.lock().await;
        let tag = self.last_tag.fetch_add(1, Ordering::SeqCst) + 1;

        unacked.push(Unacked {
            tag,
            message: message.clone(),
            queue: Arc::clone(queue),
        });

        Delivery::new(message, tag, consumer_tag, Arc::downgrade(self))
    }

    pub(crate) async fn ack(&self, tag: u64, multiple: bool) -> BrokerResult<()> {
        self.ensure_open()?;
        let acked = self.take(tag, multiple).await;
        debug!("Acked {} deliveries up to tag {tag}", acked.len());
        Ok(())
    }

    pub(crate) async fn nack(
        &self,
        tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> BrokerResult<()> {
        self.ensure_open()?;
        let nacked = self.take(tag, multiple).await;

        if requeue {
            debug!("Requeueing {} deliveries up to tag {tag}", nacked.len());
            for entry in nacked {
                entry.queue.push(entry.message.into_redelivered()).await;
            }
        } else {
            debug!("Dropping {} deliveries up to tag {tag}", nacked.len());
        }

        Ok(())
    }

    /// Pushes every unacked delivery back onto its queue, oldest first.
    pub(crate) async fn requeue_all(&self) -> usize {
        let entries = std::mem::take(&mut *self.unacked.lock().await);
        let count = entries.len();

        for entry in entries {
            entry.queue.push(entry.message.into_redelivered()).await;
        }

        count
    }

    pub(crate) async fn len(&self) -> usize {
        self.unacked.lock().await.len()
    }

    /// Marks the ledger closed. Returns `false` if it already was.
    pub(crate) fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> BrokerResult<()> {
        if self.is_closed() {
            Err(Error::ChannelClosed)
        } else {
            Ok(())
        }
    }

    /// Removes the entry with `tag`, or with `multiple` every entry with a
    /// tag up to and including `tag`, in ascending tag order.
    async fn take(&self, tag: u64, multiple: bool) -> Vec<Unacked> {
        let mut unacked = self.unacked.lock().await;

        if multiple {
            let (mut taken, kept): (Vec<_>, Vec<_>) =
                std::mem::take(&mut *unacked)
                    .into_iter()
                    .partition(|entry| entry.tag <= tag);
            *unacked = kept;
            taken.sort_by_key(|entry| entry.tag);
            taken
        } else {
            match unacked.iter().position(|entry| entry.tag == tag) {
                Some(pos) => vec![unacked.remove(pos)],
                None => Vec::new(),
            }
        }
    }
}

/// A channel dropped without `close()` still gives its unacked deliveries
/// back to their queues.
impl Drop for Ledger {
    fn drop(&mut self) {
        let entries = std::mem::take(self.unacked.get_mut());
        if entries.is_empty() {
            return;
        }

        warn!("Channel dropped unclosed, requeueing {} deliveries", entries.len());
        for entry in entries {
            entry.queue.push_detached(entry.message.into_redelivered());
        }
    }
}
