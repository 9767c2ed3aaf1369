//! An in-process broker. Every client publishes into one queue, and a
//! dispatcher thread hands each message to every matching subscription in
//! publish order, the publisher's own included.

use super::{topic_matches, MessageHandler, Transport};
use crate::error::LocatorError;

use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

struct Subscription {
    client: String,
    filter: String,
    handler: MessageHandler,
}

struct Delivery {
    topic: String,
    payload: Vec<u8>,
}

type Subscriptions = Arc<Mutex<Vec<Subscription>>>;

fn lock(subs: &Subscriptions) -> MutexGuard<'_, Vec<Subscription>> {
    subs.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A broker living inside this process. Clones share the same broker; the
/// dispatcher thread exits once the broker and all its clients are dropped.
#[derive(Clone)]
pub struct LocalBroker {
    subscriptions: Subscriptions,
    queue: mpsc::Sender<Delivery>,
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBroker {
    /// Starts a broker and its dispatcher thread.
    pub fn new() -> Self {
        let subscriptions: Subscriptions = Arc::new(Mutex::new(Vec::new()));
        let (queue, rx) = mpsc::channel::<Delivery>();

        let th_subscriptions = Arc::clone(&subscriptions);
        thread::spawn(move || {
            while let Ok(delivery) = rx.recv() {
                // Copy the handlers out so one may subscribe from inside a
                // callback without deadlocking.
                let handlers: Vec<MessageHandler> = lock(&th_subscriptions)
                    .iter()
                    .filter(|s| topic_matches(&s.filter, &delivery.topic))
                    .map(|s| Arc::clone(&s.handler))
                    .collect();
                debug!(
                    "local broker : {} bytes on {} to {} subscriber(s)",
                    delivery.payload.len(),
                    delivery.topic,
                    handlers.len()
                );
                for handler in handlers {
                    handler(&delivery.topic, &delivery.payload);
                }
            }
            info!("local broker : terminated.");
        });

        Self {
            subscriptions,
            queue,
        }
    }

    /// A new connected client named `client_id`.
    pub fn client(&self, client_id: &str) -> LocalClient {
        LocalClient {
            broker: self.clone(),
            client_id: client_id.to_owned(),
            connected: AtomicBool::new(true),
        }
    }
}

/// One client's connection to a [`LocalBroker`].
pub struct LocalClient {
    broker: LocalBroker,
    client_id: String,
    connected: AtomicBool,
}

impl LocalClient {
    fn check_connected(&self) -> Result<(), LocatorError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(LocatorError::Transport(format!(
                "client {} is disconnected",
                self.client_id
            )))
        }
    }
}

impl Transport for LocalClient {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), LocatorError> {
        self.check_connected()?;
        self.broker
            .queue
            .send(Delivery {
                topic: topic.to_owned(),
                payload: payload.to_vec(),
            })
            .map_err(|_| LocatorError::Transport("local broker is gone".to_owned()))
    }

    fn subscribe(&self, filter: &str, handler: MessageHandler) -> Result<(), LocatorError> {
        self.check_connected()?;
        lock(&self.broker.subscriptions).push(Subscription {
            client: self.client_id.clone(),
            filter: filter.to_owned(),
            handler,
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn disconnect(&self) -> Result<(), LocatorError> {
        if self.connected.swap(false, Ordering::SeqCst) {
            lock(&self.broker.subscriptions).retain(|s| s.client != self.client_id);
            info!("{} : disconnected from local broker.", self.client_id);
        }
        Ok(())
    }
}
