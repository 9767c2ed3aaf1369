//! A [`Transport`] over a real MQTT broker, using rumqttc's blocking client.
//!
//! rumqttc only makes progress while its connection is polled, so a thread
//! named `mqtt-<client id>` does nothing but poll it. That thread hands
//! incoming publishes to the subscribed handlers, and reports every publish
//! confirmation back to [`MqttTransport::publish()`], which waits for it.
//! Any connection error ends the thread; the link is then gone for good.

use super::{topic_matches, MessageHandler, Transport};
use crate::config::BrokerConfig;
use crate::error::LocatorError;

use log::{debug, error, info, warn};
use rumqttc::{Client, Event, MqttOptions, Outgoing, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

type Handlers = Arc<Mutex<Vec<(String, MessageHandler)>>>;

/// Converts the configured 0, 1 or 2 into a rumqttc quality of service.
pub fn qos_from_level(level: u8) -> Result<QoS, LocatorError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(LocatorError::Config(format!("qos {} is not 0, 1 or 2", other))),
    }
}

/// Does this connection event confirm one of our publishes at `qos`?
fn confirms_publish(event: &Event, qos: QoS) -> bool {
    match (qos, event) {
        // Nothing comes back at QoS 0; handing it to the network is all
        // the confirmation there is.
        (QoS::AtMostOnce, Event::Outgoing(Outgoing::Publish(_))) => true,
        (QoS::AtLeastOnce, Event::Incoming(Packet::PubAck(_))) => true,
        (QoS::ExactlyOnce, Event::Incoming(Packet::PubComp(_))) => true,
        _ => false,
    }
}

/// A connected MQTT client.
pub struct MqttTransport {
    client_id: String,
    client: Client,
    qos: QoS,
    publish_timeout: Duration,
    acks: Mutex<mpsc::Receiver<()>>,
    handlers: Handlers,
    connected: Arc<AtomicBool>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    /// Connects to the broker described by `config` as `client_id` and
    /// waits for the broker to accept the connection.
    pub fn connect(config: &BrokerConfig, client_id: &str) -> Result<Self, LocatorError> {
        let qos = qos_from_level(config.qos)?;
        let publish_timeout = Duration::from_millis(config.publish_timeout_ms);

        let mut options = MqttOptions::new(client_id, config.host.as_str(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keepalive_secs));
        options.set_clean_session(config.clean_session);
        if let Some(username) = &config.username {
            options.set_credentials(username.as_str(), config.password().unwrap_or_default());
        }

        let (client, mut connection) = Client::new(options, 10);
        let handlers: Handlers = Arc::new(Mutex::new(Vec::new()));
        let connected = Arc::new(AtomicBool::new(false));
        let (ack_tx, ack_rx) = mpsc::channel::<()>();
        let (connack_tx, connack_rx) = mpsc::channel::<()>();

        let th_handlers = Arc::clone(&handlers);
        let th_connected = Arc::clone(&connected);
        let name = client_id.to_owned();
        let event_loop = thread::Builder::new()
            .name(format!("mqtt-{}", client_id))
            .spawn(move || {
                for notification in connection.iter() {
                    let event = match notification {
                        Ok(event) => event,
                        Err(e) => {
                            if th_connected.swap(false, Ordering::SeqCst) {
                                error!("{} : connection lost: {}", name, e);
                            } else {
                                error!("{} : could not connect: {}", name, e);
                            }
                            break;
                        }
                    };

                    if confirms_publish(&event, qos) {
                        let _ = ack_tx.send(());
                    }
                    match event {
                        Event::Incoming(Packet::ConnAck(ack)) => {
                            info!("{} : connected ({:?})", name, ack.code);
                            th_connected.store(true, Ordering::SeqCst);
                            let _ = connack_tx.send(());
                        }
                        Event::Incoming(Packet::Publish(publish)) => {
                            let matching: Vec<MessageHandler> = th_handlers
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .iter()
                                .filter(|(filter, _)| topic_matches(filter, &publish.topic))
                                .map(|(_, handler)| Arc::clone(handler))
                                .collect();
                            for handler in matching {
                                handler(&publish.topic, &publish.payload);
                            }
                        }
                        Event::Outgoing(Outgoing::Disconnect) => {
                            th_connected.store(false, Ordering::SeqCst);
                            break;
                        }
                        other => debug!("{} : {:?}", name, other),
                    }
                }
                info!("{} : event loop terminated.", name);
            })?;

        let transport = Self {
            client_id: client_id.to_owned(),
            client,
            qos,
            publish_timeout,
            acks: Mutex::new(ack_rx),
            handlers,
            connected,
            event_loop: Mutex::new(Some(event_loop)),
        };

        match connack_rx.recv_timeout(publish_timeout) {
            Ok(()) => Ok(transport),
            Err(_) => {
                let _ = transport.disconnect();
                Err(LocatorError::Transport(format!(
                    "no answer from {}:{} within {:?}",
                    config.host, config.port, publish_timeout
                )))
            }
        }
    }

    fn check_connected(&self) -> Result<(), LocatorError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(LocatorError::Transport(format!(
                "{} is not connected to the broker",
                self.client_id
            )))
        }
    }
}

impl Transport for MqttTransport {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), LocatorError> {
        self.check_connected()?;
        let acks = self.acks.lock().unwrap_or_else(PoisonError::into_inner);
        // Confirmations of earlier publishes that gave up waiting
        while acks.try_recv().is_ok() {}

        self.client
            .publish(topic, self.qos, false, payload.to_vec())
            .map_err(|e| LocatorError::Transport(e.to_string()))?;

        match acks.recv_timeout(self.publish_timeout) {
            Ok(()) => Ok(()),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(LocatorError::PublishTimeout),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(LocatorError::Transport(
                "connection closed before the publish was confirmed".to_owned(),
            )),
        }
    }

    fn subscribe(&self, filter: &str, handler: MessageHandler) -> Result<(), LocatorError> {
        self.check_connected()?;
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((filter.to_owned(), handler));
        self.client
            .subscribe(filter, self.qos)
            .map_err(|e| LocatorError::Transport(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn disconnect(&self) -> Result<(), LocatorError> {
        if let Err(e) = self.client.disconnect() {
            // The event loop is already gone
            debug!("{} : disconnect: {}", self.client_id, e);
        }
        let handle = self
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("{} : event loop panicked", self.client_id);
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        info!("{} : disconnected.", self.client_id);
        Ok(())
    }
}
