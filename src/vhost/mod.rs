use std::{collections::HashMap, sync::Arc};

use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::{
    broker::{BrokerResult, Entity, Error},
    exchange::{Binding, Exchange, ExchangeKind, ExchangeName},
    message::Message,
    options::{Options, Table},
    queue::{Queue, QueueName, QUEUE_MAX_LEN},
};

pub const DEFAULT_EXCHANGE: &str = "";

type ExchangeMap = HashMap<ExchangeName, Arc<Exchange>>;
type QueueMap = HashMap<QueueName, Arc<Queue>>;

/// Binding options that are never part of a header-match table.
const BIND_OPTION_KEYS: [&str; 2] = ["noWait", "arguments"];

#[derive(Debug, Default)]
struct Namespace {
    exchanges: ExchangeMap,
    queues: QueueMap,
}

/// A virtual host: the exchange and queue namespaces of one broker.
#[derive(Debug)]
pub struct VHost {
    name: String,
    queue_max_len: usize,
    namespace: Mutex<Namespace>,
}

impl VHost {
    pub fn new(name: &str) -> Self {
        Self::with_queue_max_len(name, QUEUE_MAX_LEN)
    }

    pub fn with_queue_max_len(name: &str, queue_max_len: usize) -> Self {
        let mut namespace = Namespace::default();

        for (exchange, kind) in [
            ("amq.topic", ExchangeKind::Topic),
            ("amq.direct", ExchangeKind::Direct),
            ("amq.headers", ExchangeKind::Headers),
            ("topic", ExchangeKind::Topic),
            ("direct", ExchangeKind::Direct),
            ("headers", ExchangeKind::Headers),
            (DEFAULT_EXCHANGE, ExchangeKind::Direct),
        ] {
            namespace.exchanges.insert(
                exchange.into(),
                Arc::new(Exchange::new(exchange.into(), kind)),
            );
        }

        VHost {
            name: name.to_owned(),
            queue_max_len,
            namespace: Mutex::new(namespace),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declares an exchange. Re-declaring an existing name succeeds without
    /// touching it, whatever `kind` says. With `passive` set, only checks
    /// that the exchange exists.
    pub async fn exchange_declare(
        &self,
        name: &str,
        kind: &str,
        opts: &Options,
    ) -> BrokerResult<()> {
        let passive = opts.flag("passive")?;
        let mut ns = self.namespace.lock().await;

        if let Some(existing) = ns.exchanges.get(name) {
            if kind.parse::<ExchangeKind>().ok() != Some(existing.kind()) {
                warn!(
                    "Exchange {name} already declared as {}, ignoring {kind}",
                    existing.kind()
                );
            }
            return Ok(());
        }

        if passive {
            return Err(Error::not_found(Entity::Exchange, name));
        }

        let kind: ExchangeKind = kind.parse()?;
        ns.exchanges
            .insert(name.into(), Arc::new(Exchange::new(name.into(), kind)));

        info!("Exchange {name} ({kind}) declared on {}", self.name);
        Ok(())
    }

    /// Deletes an exchange. The default exchange cannot be deleted.
    pub async fn exchange_delete(
        &self,
        name: &str,
        _opts: &Options,
    ) -> BrokerResult<()> {
        if name == DEFAULT_EXCHANGE {
            warn!("Refusing to delete the default exchange of {}", self.name);
            return Err(Error::AccessRefused(
                "the default exchange cannot be deleted".to_owned(),
            ));
        }

        match self.namespace.lock().await.exchanges.remove(name) {
            Some(_) => {
                info!("Exchange {name} deleted from {}", self.name);
                Ok(())
            }
            None => Err(Error::not_found(Entity::Exchange, name)),
        }
    }

    /// Declares a queue, or returns the one already registered under
    /// `name`. New queues are bound to the default exchange under their own
    /// name before the namespace lock is released.
    pub async fn queue_declare(
        &self,
        name: &str,
        opts: &Options,
    ) -> BrokerResult<Arc<Queue>> {
        let passive = opts.flag("passive")?;
        let mut ns = self.namespace.lock().await;

        if let Some(queue) = ns.queues.get(name) {
            return Ok(Arc::clone(queue));
        }

        if passive {
            return Err(Error::not_found(Entity::Queue, name));
        }

        let queue =
            Arc::new(Queue::with_capacity(name.into(), self.queue_max_len));

        if let Some(exchange) = ns.exchanges.get(DEFAULT_EXCHANGE) {
            exchange
                .add_binding(name, Binding::new(Arc::clone(&queue), Table::new()))
                .await?;
        }
        ns.queues.insert(name.into(), Arc::clone(&queue));

        info!("Queue {name} declared on {}", self.name);
        Ok(queue)
    }

    /// Deletes a queue and every binding to it. Returns how many buffered
    /// messages were dropped with it.
    pub async fn queue_delete(
        &self,
        name: &str,
        _opts: &Options,
    ) -> BrokerResult<usize> {
        let queue = {
            let mut ns = self.namespace.lock().await;
            let queue = ns
                .queues
                .remove(name)
                .ok_or_else(|| Error::not_found(Entity::Queue, name))?;

            for exchange in ns.exchanges.values() {
                exchange.unbind_queue(&queue).await;
            }
            queue
        };

        let purged = queue.purge().await;
        info!("Queue {name} deleted from {}, {purged} dropped", self.name);
        Ok(purged)
    }

    /// Binds `queue` to `exchange` under `key`. For headers exchanges the
    /// match table comes from the `arguments` option, or else from the
    /// remaining top-level options.
    pub async fn queue_bind(
        &self,
        queue: &str,
        key: &str,
        exchange: &str,
        opts: &Options,
    ) -> BrokerResult<()> {
        let (ex, q) = self.endpoints(queue, exchange).await?;

        let arguments = match opts.table("arguments")? {
            Some(arguments) => arguments.clone(),
            None => opts
                .as_table()
                .iter()
                .filter(|(k, _)| !BIND_OPTION_KEYS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };

        ex.add_binding(key, Binding::new(q, arguments)).await?;
        debug!("Queue {queue} bound to {exchange} with '{key}'");
        Ok(())
    }

    /// Removes the binding under `key` when it targets `queue`. A missing
    /// binding is not an error; undeclared endpoints are.
    pub async fn queue_unbind(
        &self,
        queue: &str,
        key: &str,
        exchange: &str,
        _opts: &Options,
    ) -> BrokerResult<()> {
        let (ex, q) = self.endpoints(queue, exchange).await?;

        if ex.del_binding(key, &q).await {
            debug!("Queue {queue} unbound from {exchange} with '{key}'");
        } else {
            debug!("No binding '{key}' from {exchange} to {queue}");
        }
        Ok(())
    }

    /// Routes `message` through `exchange`. Waits while a target queue is
    /// full. Returns how many queues received the message.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> BrokerResult<usize> {
        let ex = self.exchange(exchange).await?;
        ex.route(routing_key, message).await
    }

    /// Looks up both ends of a binding under one namespace lock.
    async fn endpoints(
        &self,
        queue: &str,
        exchange: &str,
    ) -> BrokerResult<(Arc<Exchange>, Arc<Queue>)> {
        let ns = self.namespace.lock().await;
        let ex = ns
            .exchanges
            .get(exchange)
            .cloned()
            .ok_or_else(|| Error::UnknownExchange(exchange.to_owned()))?;
        let q = ns
            .queues
            .get(queue)
            .cloned()
            .ok_or_else(|| Error::UnknownQueue(queue.to_owned()))?;
        Ok((ex, q))
    }

    pub async fn exchange(&self, name: &str) -> BrokerResult<Arc<Exchange>> {
        self.namespace
            .lock()
            .await
            .exchanges
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownExchange(name.to_owned()))
    }

    pub async fn queue(&self, name: &str) -> BrokerResult<Arc<Queue>> {
        self.namespace
            .lock()
            .await
            .queues
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownQueue(name.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::options::Properties;

    fn message(exchange: &str, key: &str, body: &str) -> Message {
        Message::new(exchange, key, body, Properties::default())
    }

    #[tokio::test]
    async fn default_exchanges_exist() {
        let vh = VHost::new("/");

        for name in ["amq.topic", "amq.direct", "topic", "direct", ""] {
            assert!(vh.exchange(name).await.is_ok(), "missing {name:?}");
        }
        assert_eq!(vh.exchange("").await.unwrap().kind(), ExchangeKind::Direct);
        assert_eq!(
            vh.exchange("amq.topic").await.unwrap().kind(),
            ExchangeKind::Topic
        );
    }

    #[tokio::test]
    async fn exchange_declare() {
        let vh = VHost::new("/");
        let opts = Options::new();

        vh.exchange_declare("logs", "topic", &opts).await.unwrap();
        assert_eq!(vh.exchange("logs").await.unwrap().kind(), ExchangeKind::Topic);

        vh.exchange_declare("logs", "direct", &opts).await.unwrap();
        assert_eq!(vh.exchange("logs").await.unwrap().kind(), ExchangeKind::Topic);

        assert_eq!(
            vh.exchange_declare("other", "fanout", &opts).await,
            Err(Error::InvalidKind("fanout".into()))
        );

        let passive = Options::new().with("passive", true);
        assert!(vh.exchange_declare("logs", "topic", &passive).await.is_ok());
        assert_eq!(
            vh.exchange_declare("missing", "topic", &passive).await,
            Err(Error::not_found(Entity::Exchange, "missing"))
        );
        assert!(vh.exchange("missing").await.is_err());
    }

    #[tokio::test]
    async fn queue_declare_is_idempotent_and_binds_default_exchange() {
        let vh = VHost::new("/");
        let opts = Options::new();

        let q = vh.queue_declare("jobs", &opts).await.unwrap();
        vh.publish("", "jobs", message("", "jobs", "1")).await.unwrap();

        let again = vh.queue_declare("jobs", &opts).await.unwrap();
        assert!(Arc::ptr_eq(&q, &again));
        assert_eq!(again.messages(), 1);

        let passive = Options::new().with("passive", true);
        assert_eq!(
            vh.queue_declare("nope", &passive).await.unwrap_err(),
            Error::not_found(Entity::Queue, "nope")
        );
    }

    #[tokio::test]
    async fn bind_requires_both_endpoints() {
        let vh = VHost::new("/");
        let opts = Options::new();
        vh.queue_declare("q", &opts).await.unwrap();

        assert_eq!(
            vh.queue_bind("q", "k", "nope", &opts).await,
            Err(Error::UnknownExchange("nope".into()))
        );
        assert_eq!(
            vh.queue_bind("nope", "k", "amq.direct", &opts).await,
            Err(Error::UnknownQueue("nope".into()))
        );
    }

    #[tokio::test]
    async fn publish_routes_through_bindings() {
        let vh = VHost::new("/");
        let opts = Options::new();
        vh.exchange_declare("ex", "topic", &opts).await.unwrap();
        let q = vh.queue_declare("q", &opts).await.unwrap();
        vh.queue_bind("q", "a.*", "ex", &opts).await.unwrap();

        assert_eq!(vh.publish("ex", "a.b", message("ex", "a.b", "m")).await, Ok(1));
        assert_eq!(vh.publish("ex", "b.b", message("ex", "b.b", "m")).await, Ok(0));
        assert_eq!(q.messages(), 1);

        vh.queue_unbind("q", "a.*", "ex", &opts).await.unwrap();
        assert_eq!(vh.publish("ex", "a.b", message("ex", "a.b", "m")).await, Ok(0));

        assert_eq!(
            vh.publish("nope", "a", message("nope", "a", "m")).await,
            Err(Error::UnknownExchange("nope".into()))
        );
        assert!(matches!(
            vh.publish("amq.direct", "a", message("amq.direct", "a", "m"))
                .await,
            Err(Error::NoRoute { .. })
        ));
    }

    #[tokio::test]
    async fn unbind_checks_the_queue() {
        let vh = VHost::new("/");
        let opts = Options::new();
        let q2 = vh.queue_declare("q2", &opts).await.unwrap();
        vh.queue_declare("q3", &opts).await.unwrap();
        vh.queue_bind("q2", "k", "amq.direct", &opts).await.unwrap();

        assert_eq!(
            vh.queue_unbind("nope", "k", "amq.direct", &opts).await,
            Err(Error::UnknownQueue("nope".into()))
        );
        assert_eq!(
            vh.queue_unbind("q2", "k", "nope", &opts).await,
            Err(Error::UnknownExchange("nope".into()))
        );

        // Another queue's binding under the same key is left alone.
        vh.queue_unbind("q3", "k", "amq.direct", &opts).await.unwrap();
        let direct = vh.exchange("amq.direct").await.unwrap();
        assert_eq!(direct.binding_keys().await, vec!["k".to_owned()]);

        vh.queue_unbind("q2", "missing", "amq.direct", &opts)
            .await
            .unwrap();
        vh.queue_unbind("q2", "k", "amq.direct", &opts).await.unwrap();
        assert!(direct.binding_keys().await.is_empty());
        assert_eq!(q2.messages(), 0);
    }

    #[tokio::test]
    async fn default_exchange_cannot_be_deleted() {
        let vh = VHost::new("/");
        let opts = Options::new();

        assert!(matches!(
            vh.exchange_delete("", &opts).await,
            Err(Error::AccessRefused(_))
        ));
        vh.exchange_delete("amq.topic", &opts).await.unwrap();
        assert_eq!(
            vh.exchange_delete("amq.topic", &opts).await,
            Err(Error::not_found(Entity::Exchange, "amq.topic"))
        );

        let q = vh.queue_declare("q", &opts).await.unwrap();
        vh.publish("", "q", message("", "q", "m")).await.unwrap();
        assert_eq!(q.messages(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn declare_and_delete_keep_default_bindings_consistent() {
        let vh = Arc::new(VHost::new("/"));

        let mut tasks = Vec::new();
        for i in 0..200 {
            let vh = Arc::clone(&vh);
            tasks.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    vh.queue_declare("q", &Options::new()).await.map(|_| ())
                } else {
                    vh.queue_delete("q", &Options::new()).await.map(|_| ())
                }
            }));
        }
        for task in tasks {
            let _ = task.await.unwrap();
        }

        let bound = vh.exchange("").await.unwrap().binding_keys().await;
        match vh.queue("q").await {
            Ok(q) => {
                assert_eq!(bound, vec!["q".to_owned()]);
                vh.publish("", "q", message("", "q", "m")).await.unwrap();
                assert_eq!(q.messages(), 1);
            }
            Err(_) => {
                assert!(bound.is_empty());
                assert!(matches!(
                    vh.publish("", "q", message("", "q", "m")).await,
                    Err(Error::NoRoute { .. })
                ));
            }
        }
    }

    #[tokio::test]
    async fn headers_bind_reads_match_table_from_options() {
        let vh = VHost::new("/");
        let q = vh.queue_declare("q", &Options::new()).await.unwrap();

        let top_level = Options::new()
            .with("x-match", "all")
            .with("kind", "report")
            .with("noWait", false);
        vh.queue_bind("q", "reports", "amq.headers", &top_level)
            .await
            .unwrap();

        let props = Properties {
            headers: Options::new()
                .with("kind", "report")
                .as_table()
                .clone(),
            ..Properties::default()
        };
        let msg = Message::new("amq.headers", "", "r", props);
        assert_eq!(vh.publish("amq.headers", "", msg).await, Ok(1));
        assert_eq!(q.messages(), 1);

        let nested = Options::new()
            .with("arguments", json!({"x-match": "whatever"}));
        assert_eq!(
            vh.queue_bind("q", "bad", "amq.headers", &nested).await,
            Err(Error::InvalidMatchType("whatever".into()))
        );
    }

    #[tokio::test]
    async fn queue_delete_drops_bindings_and_messages() {
        let vh = VHost::new("/");
        let opts = Options::new();
        vh.queue_declare("q", &opts).await.unwrap();
        vh.queue_bind("q", "k", "amq.direct", &opts).await.unwrap();
        vh.publish("amq.direct", "k", message("amq.direct", "k", "m"))
            .await
            .unwrap();

        assert_eq!(vh.queue_delete("q", &opts).await, Ok(1));
        assert!(vh.queue("q").await.is_err());
        assert!(vh
            .exchange("amq.direct")
            .await
            .unwrap()
            .binding_keys()
            .await
            .is_empty());
        assert!(vh.exchange("").await.unwrap().binding_keys().await.is_empty());
    }
}
