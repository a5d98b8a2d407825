use std::sync::Arc;

use log::{debug, error};
use tokio::{
    select,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use super::Ledger;
use crate::{message::Delivery, queue::Queue};

/// A running subscription: the cancel signal and the worker feeding the
/// subscriber's delivery stream.
#[derive(Debug)]
pub(crate) struct Consumer {
    tag: String,
    cancel: oneshot::Sender<()>,
    worker: JoinHandle<()>,
}

impl Consumer {
    pub(crate) fn spawn(
        tag: String,
        queue: Arc<Queue>,
        ledger: Arc<Ledger>,
    ) -> (Self, mpsc::Receiver<Delivery>) {
        let (deliveries, stream) = mpsc::channel(1);
        let (cancel, canceled) = oneshot::channel();

        queue.consumer_started();
        let worker = tokio::spawn(dispatch(
            tag.clone(),
            queue,
            ledger,
            deliveries,
            canceled,
        ));

        (Consumer { tag, cancel, worker }, stream)
    }

    pub(crate) fn tag(&self) -> &str {
        &self.tag
    }

    /// Signals the worker and waits until it has stopped.
    pub(crate) async fn cancel(self) {
        let _ = self.cancel.send(());

        if let Err(e) = self.worker.await {
            error!("Consumer {} worker failed: {e}", self.tag);
        }
    }
}

async fn dispatch(
    tag: String,
    queue: Arc<Queue>,
    ledger: Arc<Ledger>,
    deliveries: mpsc::Sender<Delivery>,
    mut canceled: oneshot::Receiver<()>,
) {
    debug!("Consumer {tag} started on {}", queue.name());

    loop {
        let message = select! {
            biased;
            _ = &mut canceled => break,
            message = queue.pop() => message,
        };

        let Some(message) = message else {
            error!("Queue {} closed under consumer {tag}", queue.name());
            break;
        };

        // Recorded before the hand-off so a cancel mid-delivery leaves it
        // in the ledger for requeue.
        let delivery = ledger.record(message, &queue, &tag).await;

        select! {
            biased;
            _ = &mut canceled => break,
            sent = deliveries.send(delivery) => {
                if sent.is_err() {
                    debug!("Consumer {tag} stream dropped by subscriber");
                    break;
                }
            }
        }
    }

    queue.consumer_stopped();
    debug!("Consumer {tag} stopped on {}", queue.name());
}
