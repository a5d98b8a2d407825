use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};

use log::{debug, info, warn};
use tap::TapFallible;
use tokio::sync::{broadcast, broadcast::error::RecvError, mpsc, Mutex};

use crate::{
    broker::{BrokerResult, Error},
    channel::Channel,
    server::{CloseNotifier, CloseReason, Registry, Server},
};

mod redial;

pub use redial::{Backoff, RedialEvent};

const NOTIFY_CAPACITY: usize = 16;

#[derive(Debug)]
struct Inner {
    id: String,
    uri: String,
    registry: Registry,
    server: Mutex<Option<Arc<Server>>>,
    notify: CloseNotifier,
    closed: AtomicBool,
}

/// A fake client connection to a registered server.
///
/// Cloning is cheap; clones share the same connection.
#[derive(Debug, Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Connects to the running server registered for `uri`.
    pub async fn dial(registry: &Registry, uri: &str) -> BrokerResult<Self> {
        let (notify, _) = broadcast::channel(NOTIFY_CAPACITY);
        let id = uuid::Uuid::new_v4().to_string();

        let server = registry
            .connect(uri, &id, notify.clone())
            .await
            .tap_err(|e| warn!("Dial to {uri} failed: {e}"))?;

        info!("Connection {id} opened to {uri}");
        Ok(Self {
            inner: Arc::new(Inner {
                id,
                uri: uri.to_owned(),
                registry: registry.clone(),
                server: Mutex::new(Some(server)),
                notify,
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn uri(&self) -> &str {
        &self.inner.uri
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Attaches this connection again to the server behind its URI.
    pub async fn redial(&self) -> BrokerResult<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let inner = &self.inner;
        let server = inner
            .registry
            .connect(&inner.uri, &inner.id, inner.notify.clone())
            .await?;
        *inner.server.lock().await = Some(server);

        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.server().await.is_some()
    }

    /// Opens a new channel on the server's virtual host.
    pub async fn channel(&self) -> BrokerResult<Channel> {
        self.server()
            .await
            .map(|server| server.create_channel())
            .ok_or(Error::ConnectionClosed)
    }

    /// Subscribes to close notifications. A server-side close yields its
    /// reason; `close()` yields `None`.
    pub fn notify_close(&self) -> broadcast::Receiver<Option<CloseReason>> {
        self.inner.notify.subscribe()
    }

    /// Detaches from the server and announces a graceful close. Closing
    /// twice is a no-op.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        inner.registry.disconnect(&inner.uri, &inner.id).await;
        inner.server.lock().await.take();

        if inner.notify.send(None).is_err() {
            debug!("Connection {} had no close listeners", inner.id);
        }
        info!("Connection {} closed", inner.id);
    }

    /// Watches for server-side closes and dials again until the server is
    /// back, reporting each transition on the returned stream.
    ///
    /// The loop ends on a graceful close, when the connection is dropped,
    /// or when the event stream is dropped.
    pub fn auto_redial(&self, backoff: Backoff) -> mpsc::Receiver<RedialEvent> {
        let (events, stream) = mpsc::channel(NOTIFY_CAPACITY);
        let closed = self.notify_close();

        tokio::spawn(redial_loop(
            Arc::downgrade(&self.inner),
            backoff,
            closed,
            events,
        ));

        stream
    }

    /// The attached server, if it is still running and still knows us.
    async fn server(&self) -> Option<Arc<Server>> {
        if self.is_closed() {
            return None;
        }

        let server = self.inner.server.lock().await.clone()?;
        if server.is_running() && server.has_connection(&self.inner.id).await {
            Some(server)
        } else {
            None
        }
    }
}

async fn redial_loop(
    inner: Weak<Inner>,
    backoff: Backoff,
    mut closed: broadcast::Receiver<Option<CloseReason>>,
    events: mpsc::Sender<RedialEvent>,
) {
    loop {
        let reason = match closed.recv().await {
            Ok(Some(reason)) => reason,
            Ok(None) | Err(RecvError::Closed) => break,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Redial loop skipped {skipped} close notifications");
                continue;
            }
        };

        warn!("Connection lost ({}): {}", reason.code, reason.reason);
        if events.send(RedialEvent::Disconnected(reason)).await.is_err() {
            break;
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            tokio::time::sleep(backoff.delay(attempts)).await;

            let Some(strong) = inner.upgrade() else {
                return;
            };
            let connection = Connection { inner: strong };
            if connection.is_closed() {
                return;
            }

            match connection.redial().await {
                Ok(()) => break,
                Err(e) => debug!("Redial attempt {attempts} failed: {e}"),
            }
        }

        info!("Reconnected after {attempts} attempts");
        if events.send(RedialEvent::Reconnected { attempts }).await.is_err() {
            break;
        }
    }

    debug!("Redial loop stopped");
}
