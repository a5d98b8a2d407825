use crate::broker::{BrokerResult, Error};
use crate::message::Message;
use crate::options::Table;
use crate::queue::Queue;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;
use tap::TapFallible;
use tokio::sync::RwLock;

pub mod headers;
pub mod topic;

pub use headers::headers_match;
pub use topic::topic_match;

#[derive(Debug, Hash, PartialEq, Eq, Clone)]
pub struct ExchangeName(String);

impl ExchangeName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ExchangeName {
    fn from(value: &str) -> Self {
        ExchangeName(value.to_owned())
    }
}

impl Display for ExchangeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ExchangeName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Topic,
    Headers,
}

impl FromStr for ExchangeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(ExchangeKind::Direct),
            "topic" => Ok(ExchangeKind::Topic),
            "headers" => Ok(ExchangeKind::Headers),
            other => Err(Error::InvalidKind(other.to_owned())),
        }
    }
}

impl Display for ExchangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        })
    }
}

/// Target queue of a binding plus its arguments (the header-match table
/// for headers exchanges).
#[derive(Debug, Clone)]
pub struct Binding {
    queue: Arc<Queue>,
    arguments: Table,
}

impl Binding {
    pub fn new(queue: Arc<Queue>, arguments: Table) -> Self {
        Self { queue, arguments }
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    pub fn arguments(&self) -> &Table {
        &self.arguments
    }
}

/// Binding key to binding. One binding per key.
type BindingTable = RwLock<HashMap<String, Binding>>;

#[derive(Debug)]
enum Router {
    Direct(BindingTable),
    Topic(BindingTable),
    Headers(BindingTable),
}

impl Router {
    fn bindings(&self) -> &BindingTable {
        match self {
            Router::Direct(b) | Router::Topic(b) | Router::Headers(b) => b,
        }
    }
}

#[derive(Debug)]
pub struct Exchange {
    name: ExchangeName,
    router: Router,
}

impl Exchange {
    pub fn new(name: ExchangeName, kind: ExchangeKind) -> Self {
        let bindings = BindingTable::default();
        let router = match kind {
            ExchangeKind::Direct => Router::Direct(bindings),
            ExchangeKind::Topic => Router::Topic(bindings),
            ExchangeKind::Headers => Router::Headers(bindings),
        };

        Self { name, router }
    }

    pub fn name(&self) -> &ExchangeName {
        &self.name
    }

    pub fn kind(&self) -> ExchangeKind {
        match self.router {
            Router::Direct(_) => ExchangeKind::Direct,
            Router::Topic(_) => ExchangeKind::Topic,
            Router::Headers(_) => ExchangeKind::Headers,
        }
    }

    /// Registers `binding` under `key`, replacing any binding with that key.
    pub async fn add_binding(
        &self,
        key: &str,
        binding: Binding,
    ) -> BrokerResult<()> {
        if let Router::Headers(_) = self.router {
            headers::match_type(binding.arguments())?;
        }

        self.router
            .bindings()
            .write()
            .await
            .insert(key.to_owned(), binding);
        Ok(())
    }

    /// Removes the binding under `key` if it targets `queue`. Returns
    /// whether a binding was removed.
    pub async fn del_binding(&self, key: &str, queue: &Queue) -> bool {
        let mut bindings = self.router.bindings().write().await;

        match bindings.get(key) {
            Some(binding) if binding.queue().name() == queue.name() => {
                bindings.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Drops every binding that targets `queue`.
    pub async fn unbind_queue(&self, queue: &Queue) {
        self.router
            .bindings()
            .write()
            .await
            .retain(|_, binding| binding.queue().name() != queue.name());
    }

    pub async fn binding_keys(&self) -> Vec<String> {
        self.router.bindings().read().await.keys().cloned().collect()
    }

    /// Resolves the queues a message with `routing_key` and `headers` goes
    /// to. Direct exchanges fail with [`Error::NoRoute`] when nothing is
    /// bound to the key; topic and headers exchanges return an empty list.
    pub async fn targets(
        &self,
        routing_key: &str,
        headers: &Table,
    ) -> BrokerResult<Vec<Arc<Queue>>> {
        match &self.router {
            Router::Direct(bindings) => bindings
                .read()
                .await
                .get(routing_key)
                .map(|b| vec![Arc::clone(b.queue())])
                .ok_or_else(|| Error::NoRoute {
                    exchange: self.name.to_string(),
                    routing_key: routing_key.to_owned(),
                }),
            Router::Topic(bindings) => {
                let mut targets = Vec::new();
                for (pattern, binding) in bindings.read().await.iter() {
                    if topic_match(pattern, routing_key) {
                        push_unique(&mut targets, binding.queue());
                    }
                }
                Ok(targets)
            }
            Router::Headers(bindings) => {
                let mut targets = Vec::new();
                for binding in bindings.read().await.values() {
                    if headers_match(binding.arguments(), headers)? {
                        push_unique(&mut targets, binding.queue());
                    }
                }
                Ok(targets)
            }
        }
    }

    /// Enqueues `message` on every target queue and returns how many queues
    /// received it. The binding lock is not held while enqueueing.
    pub async fn route(
        &self,
        routing_key: &str,
        message: Message,
    ) -> BrokerResult<usize> {
        let targets = self
            .targets(routing_key, message.headers())
            .await
            .tap_err(|e| warn!("Routing on {} failed: {e}", self.name))?;

        if targets.is_empty() {
            debug!(
                "Dropping unroutable message {} on {} ({routing_key})",
                message.id(),
                self.name
            );
            return Ok(0);
        }

        for queue in &targets {
            queue.push(message.clone()).await;
        }

        Ok(targets.len())
    }
}

fn push_unique(targets: &mut Vec<Arc<Queue>>, queue: &Arc<Queue>) {
    if !targets.iter().any(|q| Arc::ptr_eq(q, queue)) {
        targets.push(Arc::clone(queue));
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::options::Properties;

    fn queue(name: &str) -> Arc<Queue> {
        Arc::new(Queue::new(name.into()))
    }

    fn message(key: &str, headers: Table) -> Message {
        let props = Properties {
            headers,
            ..Properties::default()
        };
        Message::new("ex", key, "body", props)
    }

    #[tokio::test]
    async fn direct_routes_exact_key_only() {
        let ex = Exchange::new("ex".into(), ExchangeKind::Direct);
        let q = queue("q");
        ex.add_binding("jobs", Binding::new(q.clone(), Table::new()))
            .await
            .unwrap();

        assert_eq!(ex.route("jobs", message("jobs", Table::new())).await, Ok(1));
        assert_eq!(q.messages(), 1);

        assert_eq!(
            ex.route("jobs.x", message("jobs.x", Table::new())).await,
            Err(Error::NoRoute {
                exchange: "ex".into(),
                routing_key: "jobs.x".into()
            })
        );
    }

    #[tokio::test]
    async fn direct_rebinding_a_key_replaces_the_queue() {
        let ex = Exchange::new("ex".into(), ExchangeKind::Direct);
        let (first, second) = (queue("first"), queue("second"));
        ex.add_binding("k", Binding::new(first.clone(), Table::new()))
            .await
            .unwrap();
        ex.add_binding("k", Binding::new(second.clone(), Table::new()))
            .await
            .unwrap();

        ex.route("k", message("k", Table::new())).await.unwrap();

        assert_eq!(first.messages(), 0);
        assert_eq!(second.messages(), 1);
    }

    #[tokio::test]
    async fn topic_fans_out_and_drops_unmatched() {
        let ex = Exchange::new("ex".into(), ExchangeKind::Topic);
        let (all, layers) = (queue("all"), queue("layers"));
        ex.add_binding("#", Binding::new(all.clone(), Table::new()))
            .await
            .unwrap();
        ex.add_binding(
            "maps.layer.#",
            Binding::new(layers.clone(), Table::new()),
        )
        .await
        .unwrap();

        let key = "maps.layer.stored";
        assert_eq!(ex.route(key, message(key, Table::new())).await, Ok(2));
        assert_eq!(ex.route("maps", message("maps", Table::new())).await, Ok(1));

        assert_eq!(all.messages(), 2);
        assert_eq!(layers.messages(), 1);

        assert!(!ex.del_binding("#", &layers).await);
        assert!(ex.del_binding("#", &all).await);
        assert_eq!(ex.route("maps", message("maps", Table::new())).await, Ok(0));
    }

    #[tokio::test]
    async fn topic_delivers_once_per_queue() {
        let ex = Exchange::new("ex".into(), ExchangeKind::Topic);
        let q = queue("q");
        for pattern in ["a.#", "#", "a.b"] {
            ex.add_binding(pattern, Binding::new(q.clone(), Table::new()))
                .await
                .unwrap();
        }

        assert_eq!(ex.route("a.b", message("a.b", Table::new())).await, Ok(1));
        assert_eq!(q.messages(), 1);
    }

    #[tokio::test]
    async fn headers_fan_out_to_every_match() {
        let ex = Exchange::new("ex".into(), ExchangeKind::Headers);
        let (pdf, any, everything) =
            (queue("pdf"), queue("any"), queue("everything"));

        let args = |v: serde_json::Value| match v {
            serde_json::Value::Object(t) => t,
            _ => unreachable!(),
        };

        ex.add_binding(
            "pdf",
            Binding::new(
                pdf.clone(),
                args(json!({"x-match": "all", "format": "pdf", "type": "report"})),
            ),
        )
        .await
        .unwrap();
        ex.add_binding(
            "any",
            Binding::new(
                any.clone(),
                args(json!({"x-match": "any", "format": "zip", "type": "report"})),
            ),
        )
        .await
        .unwrap();
        ex.add_binding("everything", Binding::new(everything.clone(), Table::new()))
            .await
            .unwrap();

        let headers = args(json!({"format": "pdf", "type": "report"}));
        assert_eq!(ex.route("", message("", headers)).await, Ok(3));

        let headers = args(json!({"format": "pdf"}));
        assert_eq!(ex.route("", message("", headers)).await, Ok(1));

        assert_eq!(pdf.messages(), 1);
        assert_eq!(any.messages(), 1);
        assert_eq!(everything.messages(), 2);
    }

    #[tokio::test]
    async fn headers_binding_rejects_invalid_match_type() {
        let ex = Exchange::new("ex".into(), ExchangeKind::Headers);
        let mut args = Table::new();
        args.insert("x-match".into(), json!("most"));

        assert_eq!(
            ex.add_binding("k", Binding::new(queue("q"), args)).await,
            Err(Error::InvalidMatchType("most".into()))
        );
        assert!(ex.binding_keys().await.is_empty());
    }

    #[test]
    fn kinds_parse() {
        assert_eq!("topic".parse::<ExchangeKind>(), Ok(ExchangeKind::Topic));
        assert_eq!(
            "fanout".parse::<ExchangeKind>(),
            Err(Error::InvalidKind("fanout".into()))
        );
    }
}
