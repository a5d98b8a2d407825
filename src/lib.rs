//! An in-memory AMQP broker for tests.
//!
//! Exchanges, queues, bindings, consumers and acknowledgments behave like a
//! real broker's within one process, with no network involved. Fake servers
//! live in a [`Registry`] keyed by URI; [`Connection`]s dial them and mint
//! [`Channel`]s.

pub mod amqp;
pub mod broker;
pub mod channel;
pub mod config;
pub mod connection;
pub mod exchange;
pub mod message;
pub mod options;
pub mod queue;
pub mod server;
pub mod vhost;

pub use amqp::{AmqpChannel, AmqpQueue};
pub use broker::{BrokerResult, Error};
pub use channel::Channel;
pub use config::BrokerConfig;
pub use connection::{Backoff, Connection, RedialEvent};
pub use exchange::ExchangeKind;
pub use message::{Delivery, Message};
pub use options::{Options, Properties};
pub use queue::Queue;
pub use server::{CloseReason, Registry, Server};
pub use vhost::VHost;
