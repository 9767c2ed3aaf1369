//! Publishing a station's estimate and pairing up the estimates it hears.
//!
//! A session is bound to exactly two stations: the configured peers, or
//! else the first two distinct stations heard from. Each station's most
//! recent estimate is kept. As soon as both stations have an estimate
//! waiting, the two are taken out together as a [`PeerPair`], so no
//! estimate is ever used for two triangulations.

use crate::error::LocatorError;
use crate::localizer::{Triangulation, Triangulator};
use crate::message::DirectionEstimate;
use crate::transport::{MessageHandler, Transport};
use crate::StationId;

use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex, PoisonError};

/// Estimates from both session stations, ordered by station id so arrival
/// order never changes the result.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerPair {
    /// Estimate of the station whose id sorts first
    pub first: DirectionEstimate,
    /// Estimate of the other station
    pub second: DirectionEstimate,
}

impl PeerPair {
    fn new(a: DirectionEstimate, b: DirectionEstimate) -> Self {
        if a.station_id <= b.station_id {
            Self { first: a, second: b }
        } else {
            Self { first: b, second: a }
        }
    }

    /// The two station ids, in order
    pub fn stations(&self) -> [StationId; 2] {
        [self.first.station_id.clone(), self.second.station_id.clone()]
    }

    /// Triangulates the two rays.
    pub fn triangulate(&self, triangulator: &Triangulator) -> Result<Triangulation, LocatorError> {
        triangulator.locate(
            &self.first.origin,
            &self.first.direction,
            &self.second.origin,
            &self.second.direction,
        )
    }
}

/// The latest estimate of each session station.
#[derive(Debug, Default)]
pub struct PeerTable {
    session: Vec<StationId>,
    fixed: bool,
    latest: HashMap<StationId, DirectionEstimate>,
}

impl PeerTable {
    /// A table bound to `peers`, or to the first two stations it sees.
    pub fn new(peers: Option<[StationId; 2]>) -> Self {
        match peers {
            Some(peers) => Self {
                session: peers.to_vec(),
                fixed: true,
                latest: HashMap::new(),
            },
            None => Self::default(),
        }
    }

    /// The stations the session is bound to so far
    pub fn session(&self) -> &[StationId] {
        &self.session
    }

    /// Number of estimates waiting for their partner
    pub fn len(&self) -> usize {
        self.latest.len()
    }

    /// True when no estimate is waiting
    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }

    /// Records `estimate`, replacing the station's previous one. Returns the
    /// pair once both session stations have an estimate waiting. A station
    /// outside the session is a [`LocatorError::ProtocolViolation`] and
    /// changes nothing.
    pub fn insert(&mut self, estimate: DirectionEstimate) -> Result<Option<PeerPair>, LocatorError> {
        let id = &estimate.station_id;
        if !self.session.contains(id) {
            if self.fixed || self.session.len() >= 2 {
                return Err(LocatorError::ProtocolViolation {
                    unexpected: id.clone(),
                    known: self.session.clone(),
                });
            }
            debug!("session station {} joined", id);
            self.session.push(id.clone());
        }

        if let Some(previous) = self.latest.get(id) {
            if previous.sequence >= estimate.sequence {
                warn!(
                    "{} : estimate {} replaces estimate {}",
                    id, estimate.sequence, previous.sequence
                );
            }
        }
        self.latest.insert(id.clone(), estimate);

        if self.session.len() < 2 {
            return Ok(None);
        }
        let both_waiting = self.session.iter().all(|s| self.latest.contains_key(s));
        if !both_waiting {
            return Ok(None);
        }
        let a = self.latest.remove(&self.session[0]);
        let b = self.latest.remove(&self.session[1]);
        Ok(a.zip(b).map(|(a, b)| PeerPair::new(a, b)))
    }
}

/// One station's end of the estimate exchange.
pub struct PeerExchange {
    transport: Arc<dyn Transport>,
    topic: String,
    table: Mutex<PeerTable>,
}

impl PeerExchange {
    /// Exchanges estimates over `transport` on `topic`.
    pub fn new(transport: Arc<dyn Transport>, topic: &str, peers: Option<[StationId; 2]>) -> Self {
        Self {
            transport,
            topic: topic.to_owned(),
            table: Mutex::new(PeerTable::new(peers)),
        }
    }

    /// The link estimates travel over
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Publishes `estimate` and waits for the broker to confirm it.
    pub fn publish(&self, estimate: &DirectionEstimate) -> Result<(), LocatorError> {
        let payload = estimate.to_payload()?;
        self.transport.publish(&self.topic, &payload)?;
        debug!(
            "{} : published estimate {} on {}",
            estimate.station_id, estimate.sequence, self.topic
        );
        Ok(())
    }

    /// Takes in one raw message from the topic. Returns the pair it
    /// completes, if it completes one.
    pub fn on_receive(&self, raw: &[u8]) -> Result<Option<PeerPair>, LocatorError> {
        let estimate = DirectionEstimate::from_payload(raw)?;
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(estimate)
    }

    /// Subscribes to the topic. Every completed pair, and every error met
    /// while handling a message, comes out of the returned channel. Messages
    /// are handled on the transport's thread.
    pub fn listen(self: &Arc<Self>) -> Result<mpsc::Receiver<Result<PeerPair, LocatorError>>, LocatorError> {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let exchange = Arc::clone(self);

        let handler: MessageHandler = Arc::new(move |_topic: &str, raw: &[u8]| {
            let event = match exchange.on_receive(raw) {
                Ok(None) => return,
                Ok(Some(pair)) => Ok(pair),
                Err(e) => Err(e),
            };
            // The controller is gone; nobody left to tell.
            let _ = tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .send(event);
        });
        self.transport.subscribe(&self.topic, handler)?;
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalBroker;
    use crate::Position;
    use std::thread;
    use std::time::Duration;

    fn estimate(id: &str, x: f64, sequence: u64) -> DirectionEstimate {
        DirectionEstimate {
            station_id: id.to_owned(),
            origin: Position::new(x, 0.0, 0.0),
            direction: Position::new(-x, -0.5, 1.0).normalize(),
            sequence,
        }
    }

    #[test]
    fn test_pair_independent_of_arrival_order() {
        let mut ab = PeerTable::new(None);
        assert_eq!(ab.insert(estimate("a", -0.5, 1)).unwrap(), None);
        let pair_ab = ab.insert(estimate("b", 0.5, 1)).unwrap().unwrap();

        let mut ba = PeerTable::new(None);
        assert_eq!(ba.insert(estimate("b", 0.5, 1)).unwrap(), None);
        let pair_ba = ba.insert(estimate("a", -0.5, 1)).unwrap().unwrap();

        assert_eq!(pair_ab, pair_ba);
        assert_eq!(pair_ab.stations(), ["a".to_owned(), "b".to_owned()]);
        assert!(ab.is_empty() && ba.is_empty());
    }

    #[test]
    fn test_latest_estimate_wins() {
        let mut table = PeerTable::new(None);
        table.insert(estimate("a", -0.5, 1)).unwrap();
        table.insert(estimate("a", -0.5, 2)).unwrap();
        assert_eq!(table.len(), 1);
        let pair = table.insert(estimate("b", 0.5, 1)).unwrap().unwrap();
        assert_eq!(pair.first.sequence, 2);
    }

    #[test]
    fn test_third_station_is_a_violation() {
        let mut table = PeerTable::new(None);
        table.insert(estimate("a", -0.5, 1)).unwrap();
        let pair = table.insert(estimate("b", 0.5, 1)).unwrap();
        assert!(pair.is_some());
        table.insert(estimate("a", -0.5, 2)).unwrap();

        match table.insert(estimate("c", 1.5, 1)) {
            Err(LocatorError::ProtocolViolation { unexpected, known }) => {
                assert_eq!(unexpected, "c");
                assert_eq!(known, vec!["a".to_owned(), "b".to_owned()]);
            }
            other => panic!("expected a protocol violation, got {:?}", other),
        }
        // Untouched: a is still waiting for b
        assert_eq!(table.len(), 1);
        assert!(table.insert(estimate("b", 0.5, 2)).unwrap().is_some());
    }

    #[test]
    fn test_configured_peers() {
        let mut table = PeerTable::new(Some(["x".to_owned(), "y".to_owned()]));
        assert!(matches!(
            table.insert(estimate("a", -0.5, 1)),
            Err(LocatorError::ProtocolViolation { .. })
        ));
        assert!(table.is_empty());
        table.insert(estimate("y", 0.5, 1)).unwrap();
        let pair = table.insert(estimate("x", -0.5, 1)).unwrap().unwrap();
        assert_eq!(pair.first.station_id, "x");
    }

    #[test]
    fn test_pair_triangulates() {
        let pair = PeerPair::new(estimate("b", 0.5, 1), estimate("a", -0.5, 1));
        let tri = pair.triangulate(&Triangulator::default()).unwrap();
        assert!((tri.point - Position::new(0.0, -0.5, 1.0)).norm() < 1e-9);
        assert!(tri.residual < 1e-9);
    }

    #[test]
    fn test_concurrent_receipt_pairs_once() {
        let broker = LocalBroker::new();
        let exchange = Arc::new(PeerExchange::new(
            Arc::new(broker.client("observer")),
            "t",
            None,
        ));
        let payloads: Vec<Vec<u8>> = ["a", "b"]
            .iter()
            .enumerate()
            .map(|(i, id)| estimate(id, i as f64 - 0.5, 1).to_payload().unwrap())
            .collect();

        let mut pairs = 0;
        for _ in 0..20 {
            let handles: Vec<_> = payloads
                .iter()
                .cloned()
                .map(|raw| {
                    let exchange = Arc::clone(&exchange);
                    thread::spawn(move || exchange.on_receive(&raw).unwrap())
                })
                .collect();
            pairs += handles
                .into_iter()
                .filter_map(|h| h.join().unwrap())
                .count();
        }
        assert_eq!(pairs, 20);
    }

    #[test]
    fn test_listen_over_broker() {
        let broker = LocalBroker::new();
        let a = PeerExchange::new(Arc::new(broker.client("a")), "doa", None);
        let listener = Arc::new(PeerExchange::new(
            Arc::new(broker.client("locator")),
            "doa",
            None,
        ));
        let rx = listener.listen().unwrap();

        a.publish(&estimate("a", -0.5, 1)).unwrap();
        a.transport().publish("doa", b"{\"clientid\": 3}").unwrap();
        a.publish(&estimate("b", 0.5, 1)).unwrap();

        let timeout = Duration::from_secs(1);
        assert!(matches!(
            rx.recv_timeout(timeout).unwrap(),
            Err(LocatorError::MalformedMessage(_))
        ));
        let pair = rx.recv_timeout(timeout).unwrap().unwrap();
        assert_eq!(pair.stations(), ["a".to_owned(), "b".to_owned()]);
    }
}
