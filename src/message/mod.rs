use std::{
    fmt::Display,
    sync::{Arc, Weak},
};

use chrono::{DateTime, Utc};

use crate::{
    broker::{BrokerResult, Error},
    channel::Ledger,
    options::{Properties, Table},
};

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct MessageId(String);

impl MessageId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A published message as it sits in a queue buffer.
///
/// Body and properties are shared, so fanning a message out to several
/// queues does not copy the payload.
#[derive(Debug, Clone)]
pub struct Message {
    id: MessageId,
    body: Arc<[u8]>,
    exchange: String,
    routing_key: String,
    properties: Arc<Properties>,
    timestamp: DateTime<Utc>,
    redelivered: bool,
}

impl Message {
    pub fn new<D: AsRef<[u8]>>(
        exchange: &str,
        routing_key: &str,
        data: D,
        properties: Properties,
    ) -> Self {
        let id = properties
            .message_id
            .as_deref()
            .map(MessageId::from)
            .unwrap_or_default();

        Message {
            id,
            body: Arc::from(data.as_ref()),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties: Arc::new(properties),
            timestamp: Utc::now(),
            redelivered: false,
        }
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn headers(&self) -> &Table {
        &self.properties.headers
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub(crate) fn into_redelivered(mut self) -> Self {
        self.redelivered = true;
        self
    }
}

/// A message handed to a consumer, with its acknowledgment handle.
///
/// The handle points back at the channel that delivered it; acknowledging
/// after that channel is gone fails with [`Error::ChannelClosed`].
#[derive(Debug, Clone)]
pub struct Delivery {
    message: Message,
    tag: u64,
    consumer_tag: String,
    channel: Weak<Ledger>,
}

impl Delivery {
    pub(crate) fn new(
        message: Message,
        tag: u64,
        consumer_tag: &str,
        channel: Weak<Ledger>,
    ) -> Self {
        Self {
            message,
            tag,
            consumer_tag: consumer_tag.to_owned(),
            channel,
        }
    }

    pub async fn ack(&self, multiple: bool) -> BrokerResult<()> {
        self.ledger()?.ack(self.tag, multiple).await
    }

    pub async fn nack(&self, multiple: bool, requeue: bool) -> BrokerResult<()> {
        self.ledger()?.nack(self.tag, multiple, requeue).await
    }

    pub async fn reject(&self, requeue: bool) -> BrokerResult<()> {
        self.ledger()?.nack(self.tag, false, requeue).await
    }

    fn ledger(&self) -> BrokerResult<Arc<Ledger>> {
        self.channel.upgrade().ok_or(Error::ChannelClosed)
    }

    pub fn delivery_tag(&self) -> u64 {
        self.tag
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn body(&self) -> &[u8] {
        self.message.body()
    }

    pub fn headers(&self) -> &Table {
        self.message.headers()
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn redelivered(&self) -> bool {
        self.message.redelivered()
    }
}
