use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    broker::BrokerResult, channel::Channel, message::Delivery, options::Options,
    queue::Queue,
};

/// Read-only view of a declared queue.
pub trait AmqpQueue: Send + Sync {
    fn name(&self) -> &str;
    fn messages(&self) -> usize;
    fn consumers(&self) -> usize;
}

impl AmqpQueue for Queue {
    fn name(&self) -> &str {
        Queue::name(self).as_str()
    }

    fn messages(&self) -> usize {
        Queue::messages(self)
    }

    fn consumers(&self) -> usize {
        Queue::consumers(self)
    }
}

/// The channel operations application code depends on, so the in-memory
/// broker can stand in for a real AMQP driver.
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    async fn exchange_declare(
        &self,
        name: &str,
        kind: &str,
        opts: &Options,
    ) -> BrokerResult<()>;

    async fn queue_declare(
        &self,
        name: &str,
        opts: &Options,
    ) -> BrokerResult<Arc<dyn AmqpQueue>>;

    async fn queue_bind(
        &self,
        queue: &str,
        key: &str,
        exchange: &str,
        opts: &Options,
    ) -> BrokerResult<()>;

    async fn queue_unbind(
        &self,
        queue: &str,
        key: &str,
        exchange: &str,
        opts: &Options,
    ) -> BrokerResult<()>;

    async fn publish(
        &self,
        exchange: &str,
        key: &str,
        body: &[u8],
        opts: &Options,
    ) -> BrokerResult<()>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        opts: &Options,
    ) -> BrokerResult<mpsc::Receiver<Delivery>>;

    async fn ack(&self, tag: u64, multiple: bool) -> BrokerResult<()>;

    async fn nack(&self, tag: u64, multiple: bool, requeue: bool) -> BrokerResult<()>;

    async fn reject(&self, tag: u64, requeue: bool) -> BrokerResult<()>;

    async fn cancel(&self, consumer_tag: &str, no_wait: bool) -> BrokerResult<()>;

    async fn qos(
        &self,
        prefetch_count: u16,
        prefetch_size: u32,
        global: bool,
    ) -> BrokerResult<()>;

    async fn close(&self) -> BrokerResult<()>;
}

#[async_trait]
impl AmqpChannel for Channel {
    async fn exchange_declare(
        &self,
        name: &str,
        kind: &str,
        opts: &Options,
    ) -> BrokerResult<()> {
        Channel::exchange_declare(self, name, kind, opts).await
    }

    async fn queue_declare(
        &self,
        name: &str,
        opts: &Options,
    ) -> BrokerResult<Arc<dyn AmqpQueue>> {
        let queue = Channel::queue_declare(self, name, opts).await?;
        Ok(queue as Arc<dyn AmqpQueue>)
    }

    async fn queue_bind(
        &self,
        queue: &str,
        key: &str,
        exchange: &str,
        opts: &Options,
    ) -> BrokerResult<()> {
        Channel::queue_bind(self, queue, key, exchange, opts).await
    }

    async fn queue_unbind(
        &self,
        queue: &str,
        key: &str,
        exchange: &str,
        opts: &Options,
    ) -> BrokerResult<()> {
        Channel::queue_unbind(self, queue, key, exchange, opts).await
    }

    async fn publish(
        &self,
        exchange: &str,
        key: &str,
        body: &[u8],
        opts: &Options,
    ) -> BrokerResult<()> {
        Channel::publish(self, exchange, key, body, opts).await
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        opts: &Options,
    ) -> BrokerResult<mpsc::Receiver<Delivery>> {
        Channel::consume(self, queue, consumer_tag, opts).await
    }

    async fn ack(&self, tag: u64, multiple: bool) -> BrokerResult<()> {
        Channel::ack(self, tag, multiple).await
    }

    async fn nack(&self, tag: u64, multiple: bool, requeue: bool) -> BrokerResult<()> {
        Channel::nack(self, tag, multiple, requeue).await
    }

    async fn reject(&self, tag: u64, requeue: bool) -> BrokerResult<()> {
        Channel::reject(self, tag, requeue).await
    }

    async fn cancel(&self, consumer_tag: &str, no_wait: bool) -> BrokerResult<()> {
        Channel::cancel(self, consumer_tag, no_wait).await
    }

    async fn qos(
        &self,
        prefetch_count: u16,
        prefetch_size: u32,
        global: bool,
    ) -> BrokerResult<()> {
        Channel::qos(self, prefetch_count, prefetch_size, global).await
    }

    async fn close(&self) -> BrokerResult<()> {
        Channel::close(self).await
    }
}
