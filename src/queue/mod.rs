use crate::message::Message;
use log::error;
use std::{
    borrow::Borrow,
    fmt::Display,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::sync::{mpsc, mpsc::error::TrySendError, Mutex};

pub const QUEUE_MAX_LEN: usize = 2 << 8;

#[derive(Clone, Hash, PartialEq, Eq, Debug)]
pub struct QueueName(String);

impl QueueName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for QueueName {
    fn from(value: &str) -> Self {
        QueueName(value.to_owned())
    }
}

impl Borrow<str> for QueueName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A named, bounded FIFO of pending messages.
///
/// The buffer is shared by every consumer of the queue: each message is
/// handed to exactly one of them.
#[derive(Debug)]
pub struct Queue {
    name: QueueName,
    sender: mpsc::Sender<Message>,
    receiver: Mutex<mpsc::Receiver<Message>>,
    consumers: AtomicUsize,
}

impl Queue {
    pub fn new(name: QueueName) -> Self {
        Self::with_capacity(name, QUEUE_MAX_LEN)
    }

    pub fn with_capacity(name: QueueName, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));

        Self {
            name,
            sender,
            receiver: Mutex::new(receiver),
            consumers: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &QueueName {
        &self.name
    }

    pub fn messages(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    /// Best-effort count of running dispatch workers.
    pub fn consumers(&self) -> usize {
        self.consumers.load(Ordering::Relaxed)
    }

    /// Appends to the tail, waiting while the buffer is full.
    pub(crate) async fn push(&self, message: Message) {
        // The receiver lives as long as the queue, so this only fails on a
        // broken invariant.
        if let Err(e) = self.sender.send(message).await {
            error!("Queue {} buffer is closed: {e}", self.name);
        }
    }

    /// Appends without waiting, for callers that cannot await. When the
    /// buffer is full the push moves to a task on the current runtime.
    pub(crate) fn push_detached(self: &Arc<Self>, message: Message) {
        let message = match self.sender.try_send(message) {
            Ok(()) => return,
            Err(TrySendError::Full(message)) => message,
            Err(TrySendError::Closed(_)) => {
                error!("Queue {} buffer is closed", self.name);
                return;
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let queue = Arc::clone(self);
                runtime.spawn(async move { queue.push(message).await });
            }
            Err(_) => error!(
                "Queue {} is full and no runtime is left, dropping {}",
                self.name,
                message.id()
            ),
        }
    }

    /// Waits for the head of the queue. Cancel safe.
    pub(crate) async fn pop(&self) -> Option<Message> {
        self.receiver.lock().await.recv().await
    }

    pub(crate) async fn try_pop(&self) -> Option<Message> {
        self.receiver.lock().await.try_recv().ok()
    }

    /// Drops every buffered message and returns how many were dropped.
    ///
    /// A consumer parked in `pop` holds the receiver lock while the buffer
    /// is empty, so the lock is only waited for while messages remain.
    pub(crate) async fn purge(&self) -> usize {
        let mut purged = 0;

        loop {
            match self.receiver.try_lock() {
                Ok(mut receiver) => {
                    while receiver.try_recv().is_ok() {
                        purged += 1;
                    }
                    return purged;
                }
                Err(_) if self.messages() == 0 => return purged,
                Err(_) => tokio::task::yield_now().await,
            }
        }
    }

    pub(crate) fn consumer_started(&self) {
        self.consumers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn consumer_stopped(&self) {
        self.consumers.fetch_sub(1, Ordering::Relaxed);
    }
}
