use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use log::{debug, info};
use tokio::sync::{broadcast, Mutex};

use crate::{
    broker::{BrokerResult, Error},
    channel::Channel,
    config::BrokerConfig,
    vhost::VHost,
};

/// AMQP reply code sent to connections of a server that goes away.
pub const CHANNEL_ERROR: u16 = 504;

/// Why a connection was closed by the server side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
    pub server: bool,
    pub recover: bool,
}

impl CloseReason {
    pub fn new(code: u16, reason: &str, server: bool, recover: bool) -> Self {
        Self {
            code,
            reason: reason.to_owned(),
            server,
            recover,
        }
    }
}

/// Close notifications; `None` announces a graceful close.
pub type CloseNotifier = broadcast::Sender<Option<CloseReason>>;

/// A fake AMQP server: one virtual host plus the connections attached to
/// it. It only accepts connections while running.
#[derive(Debug)]
pub struct Server {
    uri: String,
    running: AtomicBool,
    vhost: Arc<VHost>,
    connections: Mutex<HashMap<String, CloseNotifier>>,
}

impl Server {
    pub fn new(uri: &str, config: &BrokerConfig) -> Self {
        Self {
            uri: uri.to_owned(),
            running: AtomicBool::new(false),
            vhost: Arc::new(VHost::with_queue_max_len(
                &config.vhost,
                config.queue_max_len,
            )),
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn vhost(&self) -> &Arc<VHost> {
        &self.vhost
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        info!("Server {} started", self.uri);
    }

    /// Stops accepting connections and tells every attached connection
    /// that it is gone. Broker state survives a restart.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);

        let reason = CloseReason::new(
            CHANNEL_ERROR,
            "channel/connection is not open",
            false,
            false,
        );

        let connections = std::mem::take(&mut *self.connections.lock().await);
        for (id, notifier) in connections {
            if notifier.send(Some(reason.clone())).is_err() {
                debug!("Connection {id} had no close listeners");
            }
        }

        info!("Server {} stopped", self.uri);
    }

    pub fn create_channel(&self) -> Channel {
        Channel::new(Arc::clone(&self.vhost))
    }

    pub async fn connections(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn has_connection(&self, connection_id: &str) -> bool {
        self.connections.lock().await.contains_key(connection_id)
    }

    async fn attach(&self, connection_id: &str, notifier: CloseNotifier) {
        self.connections
            .lock()
            .await
            .insert(connection_id.to_owned(), notifier);
    }

    async fn detach(&self, connection_id: &str) {
        self.connections.lock().await.remove(connection_id);
    }
}

/// Fake servers by URI, so several connections can share one broker.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    config: Arc<BrokerConfig>,
    servers: Arc<Mutex<HashMap<String, Arc<Server>>>>,
}

impl Registry {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config: Arc::new(config),
            servers: Default::default(),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Returns the server registered for `uri`, creating a stopped one if
    /// there is none.
    pub async fn create(&self, uri: &str) -> Arc<Server> {
        let mut servers = self.servers.lock().await;
        let server = servers
            .entry(uri.to_owned())
            .or_insert_with(|| Arc::new(Server::new(uri, &self.config)));
        Arc::clone(server)
    }

    pub async fn get(&self, uri: &str) -> Option<Arc<Server>> {
        self.servers.lock().await.get(uri).cloned()
    }

    /// Stops and unregisters the server for `uri`.
    pub async fn remove(&self, uri: &str) -> Option<Arc<Server>> {
        let server = self.servers.lock().await.remove(uri)?;
        server.stop().await;
        Some(server)
    }

    pub(crate) async fn connect(
        &self,
        uri: &str,
        connection_id: &str,
        notifier: CloseNotifier,
    ) -> BrokerResult<Arc<Server>> {
        let server = self
            .get(uri)
            .await
            .filter(|server| server.is_running())
            .ok_or_else(|| Error::NetworkUnreachable(uri.to_owned()))?;

        server.attach(connection_id, notifier).await;
        debug!("Connection {connection_id} attached to {uri}");
        Ok(server)
    }

    pub(crate) async fn disconnect(&self, uri: &str, connection_id: &str) {
        if let Some(server) = self.get(uri).await {
            server.detach(connection_id).await;
            debug!("Connection {connection_id} detached from {uri}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URI: &str = "amqp://localhost:5672/%2f";

    #[tokio::test]
    async fn create_returns_the_same_server() {
        let registry = Registry::default();

        let a = registry.create(URI).await;
        let b = registry.create(URI).await;

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!a.is_running());
        assert_eq!(a.vhost().name(), "/");
    }

    #[tokio::test]
    async fn connect_needs_a_running_server() {
        let registry = Registry::default();
        let (notifier, _) = broadcast::channel(4);

        assert_eq!(
            registry.connect(URI, "c1", notifier.clone()).await.unwrap_err(),
            Error::NetworkUnreachable(URI.into())
        );

        let server = registry.create(URI).await;
        assert!(registry.connect(URI, "c1", notifier.clone()).await.is_err());

        server.start();
        registry.connect(URI, "c1", notifier).await.unwrap();
        assert_eq!(server.connections().await, 1);

        registry.disconnect(URI, "c1").await;
        assert_eq!(server.connections().await, 0);
    }

    #[tokio::test]
    async fn stop_notifies_attached_connections() {
        let registry = Registry::default();
        let server = registry.create(URI).await;
        server.start();

        let (notifier, mut closed) = broadcast::channel(4);
        registry.connect(URI, "c1", notifier).await.unwrap();

        server.stop().await;

        let reason = closed.recv().await.unwrap().unwrap();
        assert_eq!(reason.code, CHANNEL_ERROR);
        assert_eq!(reason.reason, "channel/connection is not open");
        assert_eq!(server.connections().await, 0);
    }

    #[tokio::test]
    async fn remove_stops_and_forgets() {
        let registry = Registry::default();
        registry.create(URI).await.start();

        let removed = registry.remove(URI).await.unwrap();

        assert!(!removed.is_running());
        assert!(registry.get(URI).await.is_none());
        assert!(registry.remove(URI).await.is_none());
    }

    #[tokio::test]
    async fn broker_state_outlives_a_restart() {
        let registry = Registry::default();
        let server = registry.create(URI).await;
        server.start();

        let ch = server.create_channel();
        ch.queue_declare("kept", &Default::default()).await.unwrap();

        server.stop().await;
        server.start();

        assert!(server.vhost().queue("kept").await.is_ok());
    }
}
