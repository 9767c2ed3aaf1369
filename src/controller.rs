//! The station loop: accumulate, estimate, publish, triangulate.
//!
//! ```text
//! Accumulating --interval elapsed--> Estimating --ok--> Published --+--> WaitForPeer --+
//!      ^                                 |                          +--> Idle --------+
//!      +------no samples (warning)-------+                                            |
//!      +------------------------------------------------------------------------------+
//! ```
//!
//! Audio arrives on the source's capture thread and peer messages on the
//! transport's thread. The loop itself only polls: it watches the elapsed
//! time in the accumulator, drains completed peer pairs from a channel, and
//! checks the stop flag. Per-cycle errors are logged and skipped; anything
//! else ends the loop, and the source, recorder and transport are released
//! either way.

use crate::accumulator::{SampleAccumulator, SampleWindow};
use crate::audio::AudioSource;
use crate::component::run_component;
use crate::config::{LocatorConfig, StationConfig};
use crate::error::LocatorError;
use crate::estimator::{Direction, DirectionEstimator};
use crate::exchange::{PeerExchange, PeerPair};
use crate::localizer::{Triangulation, Triangulator};
use crate::message::{DirectionEstimate, LocationReport};
use crate::recorder::WindowRecorder;
use crate::transport::Transport;
use crate::Position;

use log::{debug, error, info, warn};
use nalgebra::Rotation3;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Where the station loop is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationState {
    /// Waiting for a full interval of audio
    Accumulating,
    /// Turning the window into a direction
    Estimating,
    /// The estimate is out
    Published,
    /// The estimate is out, and this station triangulates whatever pairs
    /// up with it
    WaitForPeer,
    /// The estimate is out, and somebody else triangulates
    Idle,
}

/// Triangulates pairs, logs them, and re-publishes them when asked to.
struct Reporter {
    name: String,
    triangulator: Triangulator,
    result_topic: Option<String>,
}

impl Reporter {
    fn report(
        &self,
        pair: &PeerPair,
        transport: &dyn Transport,
    ) -> Result<Triangulation, LocatorError> {
        let location = pair.triangulate(&self.triangulator)?;
        let p = location.point;
        info!(
            "{} : source at ({:.3}, {:.3}, {:.3}), residual {:.4}, from {} and {}",
            self.name,
            p.x,
            p.y,
            p.z,
            location.residual,
            pair.first.station_id,
            pair.second.station_id
        );
        if !location.in_front() {
            warn!(
                "{} : closest approach lies behind a station (t1 = {:.3}, t2 = {:.3})",
                self.name, location.t1, location.t2
            );
        }

        if let Some(topic) = &self.result_topic {
            let report = LocationReport::new(&location, pair.stations());
            transport.publish(topic, &report.to_payload()?)?;
        }
        Ok(location)
    }

    /// Handles one event from the exchange. Per-cycle errors come back as
    /// `Ok(None)` after being logged.
    fn handle(
        &self,
        event: Result<PeerPair, LocatorError>,
        transport: &dyn Transport,
    ) -> Result<Option<(PeerPair, Triangulation)>, LocatorError> {
        let outcome = event.and_then(|pair| {
            let location = self.report(&pair, transport)?;
            Ok((pair, location))
        });
        match outcome {
            Ok(done) => Ok(Some(done)),
            Err(e) if e.is_recoverable() => {
                warn!("{} : {}", self.name, e);
                Ok(None)
            }
            Err(LocatorError::PublishTimeout) => {
                warn!("{} : location was not confirmed by the broker", self.name);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// A [`WindowRecorder`] running on its own thread.
struct Recording {
    input: Option<Sender<SampleWindow>>,
    output: Receiver<Result<PathBuf, LocatorError>>,
    handle: Option<JoinHandle<()>>,
}

impl Recording {
    fn start(dir: &Path, station: &str) -> Result<Self, LocatorError> {
        let recorder = WindowRecorder::new(dir, station)?;
        let (input, recorder_rx) = mpsc::channel();
        let (recorder_tx, output) = mpsc::channel();
        let handle = run_component(Box::new(recorder), recorder_rx, recorder_tx)?;
        Ok(Self {
            input: Some(input),
            output,
            handle: Some(handle),
        })
    }

    /// Queues `window` for writing. Empty windows are not worth a file.
    fn record(&self, window: SampleWindow) {
        if window.frames() == 0 {
            return;
        }
        if let Some(input) = &self.input {
            if input.send(window).is_err() {
                warn!("window recorder is gone, window not recorded");
            }
        }
        self.drain();
    }

    fn drain(&self) {
        while let Ok(written) = self.output.try_recv() {
            match written {
                Ok(path) => debug!("recorded {}", path.display()),
                Err(e) => warn!("could not record window: {}", e),
            }
        }
    }

    fn finish(&mut self) {
        self.input = None;
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("window recorder panicked");
            }
        }
        self.drain();
    }
}

/// Runs one station.
pub struct StationController {
    config: StationConfig,
    accumulator: SampleAccumulator,
    estimator: DirectionEstimator,
    exchange: Arc<PeerExchange>,
    reporter: Reporter,
    rotation: Rotation3<f64>,
    origin: Position,
    poll: Duration,
    state: StationState,
    sequence: u64,
    last_direction: Option<Direction>,
    stop: Arc<AtomicBool>,
}

impl StationController {
    /// Builds the station described by `config`, talking over `transport`.
    pub fn new(config: StationConfig, transport: Arc<dyn Transport>) -> Result<Self, LocatorError> {
        config.validate()?;
        let estimator = config.estimator()?;
        let exchange = Arc::new(PeerExchange::new(
            transport,
            &config.broker.topic,
            config.peers.clone(),
        ));
        let reporter = Reporter {
            name: config.id.clone(),
            triangulator: config.triangulator(),
            result_topic: config.broker.result_topic.clone(),
        };

        Ok(Self {
            accumulator: SampleAccumulator::new(config.channels, config.sample_rate),
            estimator,
            exchange,
            reporter,
            rotation: config.rotation(),
            origin: config.origin(),
            poll: Duration::from_millis(config.poll_ms),
            state: StationState::Accumulating,
            sequence: 0,
            last_direction: None,
            stop: Arc::new(AtomicBool::new(false)),
            config,
        })
    }

    /// Setting this flag ends [`run()`](Self::run) at its next poll.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Where the loop is in its cycle
    pub fn state(&self) -> StationState {
        self.state
    }

    /// The station's sample buffer
    pub fn accumulator(&self) -> &SampleAccumulator {
        &self.accumulator
    }

    /// The most recent direction, local frame, until a triangulation has
    /// used it
    pub fn last_direction(&self) -> Option<&Direction> {
        self.last_direction.as_ref()
    }

    /// Runs the station on `source` until the stop flag is set, a fatal
    /// error occurs, or (for a station that does not triangulate) the input
    /// runs out. The source is stopped and the transport disconnected
    /// whatever the outcome.
    pub fn run(&mut self, source: &mut dyn AudioSource) -> Result<(), LocatorError> {
        let mut recording = None;
        let result = match self.start(source, &mut recording) {
            Ok(peers) => self.run_loop(source, peers.as_ref(), recording.as_ref()),
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            error!("{} : {}", self.config.id, e);
        }

        let stopped = source.stop();
        let discarded = self.accumulator.frame_count();
        self.accumulator.reset();
        if discarded > 0 {
            debug!("{} : discarded {} unprocessed frames", self.config.id, discarded);
        }
        if let Some(recording) = recording.as_mut() {
            recording.finish();
        }
        let disconnected = self.exchange.transport().disconnect();
        info!("{} : shut down.", self.config.id);

        result.and(stopped).and(disconnected)
    }

    /// Subscribes to the peers, starts the recorder and then the source.
    /// Whatever was started before a failure is left in place for
    /// [`run()`](Self::run) to release.
    fn start(
        &mut self,
        source: &mut dyn AudioSource,
        recording: &mut Option<Recording>,
    ) -> Result<Option<Receiver<Result<PeerPair, LocatorError>>>, LocatorError> {
        if source.channels() != self.config.channels {
            return Err(LocatorError::ChannelMismatch {
                expected: self.config.channels,
                actual: source.channels(),
            });
        }
        if source.sample_rate() != self.config.sample_rate {
            return Err(LocatorError::Config(format!(
                "source delivers {} Hz, station expects {} Hz",
                source.sample_rate(),
                self.config.sample_rate
            )));
        }

        let peers = if self.config.triangulate {
            Some(self.exchange.listen()?)
        } else {
            None
        };
        if let Some(dir) = &self.config.record_dir {
            *recording = Some(Recording::start(dir, &self.config.id)?);
        }

        let accumulator = self.accumulator.clone();
        let gain_db = self.config.sample_gain_db;
        source.start(Box::new(move |mut block| {
            block.apply_gain_db(gain_db);
            accumulator.push(&block)
        }))?;
        info!(
            "{} : running at ({}, {}, {}), {:.2} s windows",
            self.config.id,
            self.origin.x,
            self.origin.y,
            self.origin.z,
            self.config.interval
        );
        Ok(peers)
    }

    fn run_loop(
        &mut self,
        source: &mut dyn AudioSource,
        peers: Option<&Receiver<Result<PeerPair, LocatorError>>>,
        recording: Option<&Recording>,
    ) -> Result<(), LocatorError> {
        let mut input_ended = false;

        while !self.stop.load(Ordering::SeqCst) {
            if let Some(peers) = peers {
                while let Ok(event) = peers.try_recv() {
                    self.on_peer_event(event)?;
                }
            }
            if !self.exchange.transport().is_connected() {
                return Err(LocatorError::Transport("connection to the broker lost".to_owned()));
            }

            match self.state {
                StationState::Accumulating => {
                    // Read before the elapsed time, so a source that has
                    // just delivered its last block is not taken for done
                    let finished = source.is_finished();
                    if finished && !input_ended {
                        input_ended = true;
                        // A capture thread that died on an error is fatal
                        source.stop()?;
                        info!("{} : input ended.", self.config.id);
                    }
                    if self.accumulator.elapsed_seconds() >= self.config.interval {
                        self.state = StationState::Estimating;
                        continue;
                    }
                    if input_ended && !self.config.triangulate {
                        return Ok(());
                    }
                }
                StationState::Estimating => {
                    let window = self.accumulator.take();
                    if let Some(recording) = recording {
                        recording.record(window.clone());
                    }
                    self.state = match self.estimator.estimate(&window) {
                        Ok(direction) => self.publish(direction)?,
                        Err(LocatorError::InsufficientData) => {
                            warn!("{} : window was empty, skipping", self.config.id);
                            StationState::Accumulating
                        }
                        Err(e) => return Err(e),
                    };
                    continue;
                }
                StationState::Published => {
                    self.state = if self.config.triangulate {
                        StationState::WaitForPeer
                    } else {
                        StationState::Idle
                    };
                    continue;
                }
                StationState::WaitForPeer | StationState::Idle => {
                    self.state = StationState::Accumulating;
                    continue;
                }
            }

            spin_sleep::sleep(self.poll);
        }

        info!("{} : stop requested.", self.config.id);
        Ok(())
    }

    /// Publishes `direction`, returning the state to move to.
    fn publish(&mut self, direction: Direction) -> Result<StationState, LocatorError> {
        self.sequence += 1;
        let estimate = DirectionEstimate {
            station_id: self.config.id.clone(),
            origin: self.origin,
            direction: self.rotation * direction.vector,
            sequence: self.sequence,
        };
        info!(
            "{} : estimate {}: azimuth {:.1} deg, elevation {:.1} deg",
            self.config.id,
            self.sequence,
            direction.azimuth.to_degrees(),
            direction.elevation.to_degrees()
        );
        self.last_direction = Some(direction);

        match self.exchange.publish(&estimate) {
            Ok(()) => Ok(StationState::Published),
            Err(LocatorError::PublishTimeout) => {
                warn!(
                    "{} : estimate {} was not confirmed by the broker",
                    self.config.id, self.sequence
                );
                Ok(StationState::Accumulating)
            }
            Err(e) => Err(e),
        }
    }

    fn on_peer_event(&mut self, event: Result<PeerPair, LocatorError>) -> Result<(), LocatorError> {
        let transport = Arc::clone(self.exchange.transport());
        if let Some((pair, _)) = self.reporter.handle(event, transport.as_ref())? {
            if pair.stations().contains(&self.config.id) {
                self.last_direction = None;
            }
        }
        Ok(())
    }
}

/// Listens on the estimate topic and triangulates every pair it sees, until
/// `stop` is set or a fatal error occurs. Returns the number of locations
/// reported.
pub fn run_locator(
    config: &LocatorConfig,
    transport: Arc<dyn Transport>,
    stop: Arc<AtomicBool>,
) -> Result<usize, LocatorError> {
    let exchange = Arc::new(PeerExchange::new(
        Arc::clone(&transport),
        &config.broker.topic,
        config.peers.clone(),
    ));
    let reporter = Reporter {
        name: config.id.clone(),
        triangulator: config.triangulator(),
        result_topic: config.broker.result_topic.clone(),
    };
    let peers = exchange.listen()?;
    info!("{} : locating from {}", config.id, config.broker.topic);

    let poll = Duration::from_millis(50);
    let mut located = 0;
    let result = loop {
        if stop.load(Ordering::SeqCst) {
            info!("{} : stop requested.", config.id);
            break Ok(located);
        }
        if !transport.is_connected() {
            break Err(LocatorError::Transport("connection to the broker lost".to_owned()));
        }
        match peers.recv_timeout(poll) {
            Ok(event) => match reporter.handle(event, transport.as_ref()) {
                Ok(Some(_)) => located += 1,
                Ok(None) => {}
                Err(e) => {
                    error!("{} : {}", config.id, e);
                    break Err(e);
                }
            },
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break Ok(located),
        }
    };

    let disconnected = transport.disconnect();
    info!("{} : shut down.", config.id);
    result.and_then(|located| disconnected.map(|()| located))
}
