use std::{collections::HashMap, sync::Arc};

use log::{debug, info};
use tap::TapFallible;
use tokio::sync::{mpsc, Mutex};

use crate::{
    broker::{BrokerResult, Error},
    message::{Delivery, Message},
    options::{Options, Properties},
    queue::Queue,
    vhost::VHost,
};

mod consumer;
mod ledger;

use consumer::Consumer;
pub(crate) use ledger::Ledger;

/// Process-unique consumer tag for subscriptions that did not name one.
fn unique_consumer_tag() -> String {
    format!("ctag-{}", uuid::Uuid::new_v4())
}

/// A session over a virtual host.
///
/// Owns the consumers started through it and the ledger of deliveries they
/// handed out. Closing the channel stops every consumer and then requeues
/// every delivery that was never acknowledged. A channel dropped without
/// closing requeues them too, once its consumers have stopped.
#[derive(Debug)]
pub struct Channel {
    vhost: Arc<VHost>,
    ledger: Arc<Ledger>,
    consumers: Mutex<HashMap<String, Consumer>>,
}

impl Channel {
    pub fn new(vhost: Arc<VHost>) -> Self {
        Self {
            vhost,
            ledger: Arc::new(Ledger::default()),
            consumers: Mutex::new(HashMap::new()),
        }
    }

    pub fn vhost(&self) -> &Arc<VHost> {
        &self.vhost
    }

    pub fn is_closed(&self) -> bool {
        self.ledger.is_closed()
    }

    fn ensure_open(&self) -> BrokerResult<()> {
        if self.is_closed() {
            Err(Error::ChannelClosed)
        } else {
            Ok(())
        }
    }

    pub async fn exchange_declare(
        &self,
        name: &str,
        kind: &str,
        opts: &Options,
    ) -> BrokerResult<()> {
        self.ensure_open()?;
        self.vhost.exchange_declare(name, kind, opts).await
    }

    pub async fn exchange_delete(
        &self,
        name: &str,
        opts: &Options,
    ) -> BrokerResult<()> {
        self.ensure_open()?;
        self.vhost.exchange_delete(name, opts).await
    }

    pub async fn queue_declare(
        &self,
        name: &str,
        opts: &Options,
    ) -> BrokerResult<Arc<Queue>> {
        self.ensure_open()?;
        self.vhost.queue_declare(name, opts).await
    }

    pub async fn queue_delete(
        &self,
        name: &str,
        opts: &Options,
    ) -> BrokerResult<usize> {
        self.ensure_open()?;
        self.vhost.queue_delete(name, opts).await
    }

    pub async fn queue_bind(
        &self,
        queue: &str,
        key: &str,
        exchange: &str,
        opts: &Options,
    ) -> BrokerResult<()> {
        self.ensure_open()?;
        self.vhost.queue_bind(queue, key, exchange, opts).await
    }

    pub async fn queue_unbind(
        &self,
        queue: &str,
        key: &str,
        exchange: &str,
        opts: &Options,
    ) -> BrokerResult<()> {
        self.ensure_open()?;
        self.vhost.queue_unbind(queue, key, exchange, opts).await
    }

    /// Publishes `body` through `exchange`. Publishing properties such as
    /// `headers` or `correlationId` are read from `opts`.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        opts: &Options,
    ) -> BrokerResult<()> {
        self.ensure_open()?;
        let properties = Properties::from_options(opts)?;
        let message = Message::new(exchange, routing_key, body, properties);

        self.vhost
            .publish(exchange, routing_key, message)
            .await
            .tap_err(|e| debug!("Publish to {exchange} failed: {e}"))
            .map(|_| ())
    }

    /// Starts a consumer on `queue` and returns its delivery stream.
    ///
    /// An empty `consumer_tag` gets a generated one. A consumer already
    /// running under the same tag on this channel is canceled first.
    pub async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        _opts: &Options,
    ) -> BrokerResult<mpsc::Receiver<Delivery>> {
        self.ensure_open()?;
        let queue = self.vhost.queue(queue).await?;

        let tag = if consumer_tag.is_empty() {
            unique_consumer_tag()
        } else {
            consumer_tag.to_owned()
        };

        let mut consumers = self.consumers.lock().await;
        // close() may have drained the map while we waited for it.
        self.ensure_open()?;

        if let Some(previous) = consumers.remove(&tag) {
            debug!("Replacing consumer {tag}");
            previous.cancel().await;
        }

        let (consumer, stream) =
            Consumer::spawn(tag.clone(), queue, Arc::clone(&self.ledger));
        consumers.insert(tag, consumer);

        Ok(stream)
    }

    /// Stops the consumer registered under `consumer_tag`. Its unacked
    /// deliveries stay pending on the channel.
    pub async fn cancel(
        &self,
        consumer_tag: &str,
        _no_wait: bool,
    ) -> BrokerResult<()> {
        self.ensure_open()?;
        let consumer = self.consumers.lock().await.remove(consumer_tag);

        if let Some(consumer) = consumer {
            consumer.cancel().await;
        }

        Ok(())
    }

    pub async fn ack(&self, tag: u64, multiple: bool) -> BrokerResult<()> {
        self.ledger.ack(tag, multiple).await
    }

    pub async fn nack(
        &self,
        tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> BrokerResult<()> {
        self.ledger.nack(tag, multiple, requeue).await
    }

    pub async fn reject(&self, tag: u64, requeue: bool) -> BrokerResult<()> {
        self.ledger.nack(tag, false, requeue).await
    }

    /// Accepted for compatibility; prefetch limits are not enforced.
    pub async fn qos(
        &self,
        _prefetch_count: u16,
        _prefetch_size: u32,
        _global: bool,
    ) -> BrokerResult<()> {
        self.ensure_open()
    }

    pub async fn unacked(&self) -> usize {
        self.ledger.len().await
    }

    /// Cancels every consumer, waits for all of them to stop, then requeues
    /// every unacknowledged delivery. Closing twice is a no-op.
    pub async fn close(&self) -> BrokerResult<()> {
        if !self.ledger.close() {
            return Ok(());
        }

        let consumers: Vec<Consumer> = self
            .consumers
            .lock()
            .await
            .drain()
            .map(|(_, consumer)| consumer)
            .collect();

        for consumer in consumers {
            debug!("Canceling consumer {}", consumer.tag());
            consumer.cancel().await;
        }

        let requeued = self.ledger.requeue_all().await;
        info!("Channel closed, {requeued} unacked deliveries requeued");

        Ok(())
    }
}
