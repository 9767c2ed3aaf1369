//! Station and broker configuration, read from RON files.
//!
//! Every field but `origin` has a default, so the smallest station file is
//!
//! ```text
//! (origin: (-0.5, 0.0, 0.0))
//! ```
//!
//! and a fuller one looks like
//!
//! ```text
//! (
//!     id: "station-a",
//!     origin: (-0.5, 0.0, 0.0),
//!     orientation_deg: (0.0, 0.0, 0.0),
//!     array: File("geometry/uma16.xml"),
//!     grid: (x_min: -1.0, x_max: 1.0, y_min: -1.0, y_max: 1.0, z: 1.0, increment: 0.01),
//!     freq: 4120.0,
//!     interval: 1.0,
//!     peers: Some(("station-a", "station-b")),
//!     broker: (host: "broker.local", topic: "doa/pointing", result_topic: Some("doa/location")),
//! )
//! ```
//!
//! Each station gets its own value; nothing here is shared between stations.

use crate::beamformer::BaseBeamformer;
use crate::error::LocatorError;
use crate::estimator::DirectionEstimator;
use crate::geometry::MicGeometry;
use crate::grid::SteeringGrid;
use crate::localizer::{Triangulator, DEFAULT_PARALLEL_EPSILON};
use crate::{position, Position, StationId};

use nalgebra::Rotation3;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::{env, fs};

/// Environment variable holding the broker password when the configuration
/// does not.
pub const PASSWORD_ENV: &str = "MOSQUITTO_PASSWD";

/// How to reach the broker, and what to say on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker host name
    pub host: String,
    /// Broker port
    pub port: u16,
    /// User name, if the broker wants one
    pub username: Option<String>,
    /// Password; [`PASSWORD_ENV`] is consulted when unset
    pub password: Option<String>,
    /// Keep-alive interval, seconds
    pub keepalive_secs: u64,
    /// Topic direction estimates are published and collected on
    pub topic: String,
    /// Topic triangulated locations are re-published on, if any
    pub result_topic: Option<String>,
    /// MQTT quality of service, 0 to 2
    pub qos: u8,
    /// Start without any session state left on the broker
    pub clean_session: bool,
    /// How long a publish may wait for its acknowledgement, milliseconds
    pub publish_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 1883,
            username: Some("mosquitto".to_owned()),
            password: None,
            keepalive_secs: 60,
            topic: "paho/test/opts".to_owned(),
            result_topic: None,
            qos: 0,
            clean_session: true,
            publish_timeout_ms: 5000,
        }
    }
}

impl BrokerConfig {
    /// The configured password, or the one in [`PASSWORD_ENV`].
    pub fn password(&self) -> Option<String> {
        self.password
            .clone()
            .or_else(|| env::var(PASSWORD_ENV).ok())
    }

    /// Checks the settings that do not depend on a connection.
    pub fn validate(&self) -> Result<(), LocatorError> {
        if self.qos > 2 {
            return Err(LocatorError::Config(format!("qos {} is not 0, 1 or 2", self.qos)));
        }
        if self.topic.is_empty() {
            return Err(LocatorError::Config("broker topic is empty".to_owned()));
        }
        // Reports on the estimate topic would come back as estimates
        if self.result_topic.as_deref() == Some(self.topic.as_str()) {
            return Err(LocatorError::Config(format!(
                "result topic {} is also the estimate topic",
                self.topic
            )));
        }
        if self.publish_timeout_ms == 0 {
            return Err(LocatorError::Config("publish timeout must be positive".to_owned()));
        }
        Ok(())
    }
}

/// Where the microphones sit, in the station's local frame.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum ArrayConfig {
    /// The built-in 4 x 4 UMA-16 layout
    #[default]
    Uma16,
    /// An acoular-style geometry XML file
    File(PathBuf),
    /// Positions listed inline
    Mics(Vec<[f64; 3]>),
}

/// The plane of candidate source positions searched by the beamformer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    #[allow(missing_docs)]
    pub x_min: f64,
    #[allow(missing_docs)]
    pub x_max: f64,
    #[allow(missing_docs)]
    pub y_min: f64,
    #[allow(missing_docs)]
    pub y_max: f64,
    /// Distance of the plane in front of the array
    pub z: f64,
    /// Spacing of the grid points, both axes
    pub increment: f64,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            x_min: -1.0,
            x_max: 1.0,
            y_min: -1.0,
            y_max: 1.0,
            z: 1.0,
            increment: 0.01,
        }
    }
}

fn random_station_id() -> StationId {
    format!("station-{:08x}", rand::random::<u32>())
}

fn default_freq() -> f64 {
    4120.0
}

fn default_n_bands() -> u32 {
    3
}

fn default_block_size() -> usize {
    128
}

fn default_sample_rate() -> f64 {
    48000.0
}

fn default_channels() -> usize {
    16
}

fn default_interval() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_parallel_epsilon() -> f64 {
    DEFAULT_PARALLEL_EPSILON
}

fn default_poll_ms() -> u64 {
    10
}

/// Everything one station needs to know about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationConfig {
    /// Station identifier, also the MQTT client id
    #[serde(default = "random_station_id")]
    pub id: StationId,
    /// Array centre in the world frame, meters
    pub origin: [f64; 3],
    /// `[yaw, pitch, roll]` in degrees, about z, y and x, taking local
    /// directions into the world frame
    #[serde(default)]
    pub orientation_deg: [f64; 3],
    /// Microphone layout
    #[serde(default)]
    pub array: ArrayConfig,
    /// Steering grid
    #[serde(default)]
    pub grid: GridConfig,
    /// Centre frequency of the analysis band, Hz
    #[serde(default = "default_freq")]
    pub freq: f64,
    /// Bands per octave, `0` for a single frequency bin
    #[serde(default = "default_n_bands")]
    pub n_bands: u32,
    /// FFT block length, frames
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// Capture sample rate, Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
    /// Capture channels, one per microphone
    #[serde(default = "default_channels")]
    pub channels: usize,
    /// Seconds of audio per estimate
    #[serde(default = "default_interval")]
    pub interval: f64,
    /// Gain applied to every incoming sample, dB
    #[serde(default)]
    pub sample_gain_db: f64,
    /// Whether this station also triangulates the estimates it sees
    #[serde(default = "default_true")]
    pub triangulate: bool,
    /// The two stations of the session. When unset, the first two seen
    #[serde(default)]
    pub peers: Option<[StationId; 2]>,
    /// Cross product length below which two rays count as parallel
    #[serde(default = "default_parallel_epsilon")]
    pub parallel_epsilon: f64,
    /// Directory every consumed window is written to, if any
    #[serde(default)]
    pub record_dir: Option<PathBuf>,
    /// Controller poll period, milliseconds
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
    /// Broker connection
    #[serde(default)]
    pub broker: BrokerConfig,
}

impl StationConfig {
    /// A station at `origin` with every other setting at its default.
    pub fn at(origin: [f64; 3]) -> Self {
        Self {
            id: random_station_id(),
            origin,
            orientation_deg: [0.0; 3],
            array: ArrayConfig::default(),
            grid: GridConfig::default(),
            freq: default_freq(),
            n_bands: default_n_bands(),
            block_size: default_block_size(),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            interval: default_interval(),
            sample_gain_db: 0.0,
            triangulate: true,
            peers: None,
            parallel_epsilon: DEFAULT_PARALLEL_EPSILON,
            record_dir: None,
            poll_ms: default_poll_ms(),
            broker: BrokerConfig::default(),
        }
    }

    /// Reads and checks a RON station file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, LocatorError> {
        let text = fs::read_to_string(path)?;
        Self::from_ron_str(&text)
    }

    /// Parses and checks RON station text.
    pub fn from_ron_str(text: &str) -> Result<Self, LocatorError> {
        let config: Self = ron::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the settings that can be checked without touching the disk.
    pub fn validate(&self) -> Result<(), LocatorError> {
        let bad = |why: String| Err(LocatorError::Config(why));

        if self.id.trim().is_empty() {
            return bad("station id is empty".to_owned());
        }
        if !self.origin.iter().all(|v| v.is_finite()) {
            return bad(format!("origin {:?} is not finite", self.origin));
        }
        if !(self.interval > 0.0) {
            return bad(format!("interval must be positive, got {}", self.interval));
        }
        if !(self.sample_rate > 0.0) {
            return bad(format!("sample rate must be positive, got {}", self.sample_rate));
        }
        if self.block_size == 0 || self.channels == 0 {
            return bad("block size and channel count must be positive".to_owned());
        }
        if !(self.freq > 0.0 && self.freq <= self.sample_rate / 2.0) {
            return bad(format!(
                "frequency {} Hz is outside (0, {}]",
                self.freq,
                self.sample_rate / 2.0
            ));
        }
        if !(self.parallel_epsilon >= 0.0) {
            return bad("parallel epsilon must not be negative".to_owned());
        }
        if let Some([a, b]) = &self.peers {
            if a == b {
                return bad(format!("peers must be two different stations, got {} twice", a));
            }
        }
        if let ArrayConfig::Mics(mics) = &self.array {
            if mics.len() != self.channels {
                return bad(format!(
                    "{} microphones listed for {} channels",
                    mics.len(),
                    self.channels
                ));
            }
        }
        self.broker.validate()?;
        self.steering_grid().map(|_| ())
    }

    /// Loads the microphone layout, checking it against the channel count.
    pub fn geometry(&self) -> Result<MicGeometry, LocatorError> {
        let geometry = match &self.array {
            ArrayConfig::Uma16 => MicGeometry::uma16(),
            ArrayConfig::File(path) => MicGeometry::from_path(path)?,
            ArrayConfig::Mics(mics) => MicGeometry::from_positions(mics)?,
        };
        if geometry.len() != self.channels {
            return Err(LocatorError::Config(format!(
                "array has {} microphones, station captures {} channels",
                geometry.len(),
                self.channels
            )));
        }
        Ok(geometry)
    }

    /// The steering grid described by `grid`.
    pub fn steering_grid(&self) -> Result<SteeringGrid, LocatorError> {
        let g = &self.grid;
        SteeringGrid::new(g.x_min, g.x_max, g.y_min, g.y_max, g.z, g.increment)
    }

    /// A direction estimator using the conventional beamformer.
    pub fn estimator(&self) -> Result<DirectionEstimator, LocatorError> {
        Ok(DirectionEstimator::new(
            self.geometry()?,
            self.steering_grid()?,
            self.freq,
            self.n_bands,
            Box::new(BaseBeamformer::new(self.block_size)),
        ))
    }

    /// A triangulator using `parallel_epsilon`.
    pub fn triangulator(&self) -> Triangulator {
        Triangulator::new(self.parallel_epsilon)
    }

    /// Array centre, world frame
    pub fn origin(&self) -> Position {
        position(self.origin)
    }

    /// The rotation taking local directions into the world frame.
    pub fn rotation(&self) -> Rotation3<f64> {
        let [yaw, pitch, roll] = self.orientation_deg.map(f64::to_radians);
        Rotation3::from_euler_angles(roll, pitch, yaw)
    }

    /// Where the microphones of `geometry` sit in the world frame.
    pub fn mic_world_positions(&self, geometry: &MicGeometry) -> Vec<Position> {
        let rotation = self.rotation();
        let origin = self.origin();
        geometry
            .positions()
            .iter()
            .map(|m| origin + rotation * *m)
            .collect()
    }
}

/// Settings of a station that only listens and triangulates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocatorConfig {
    /// MQTT client id
    #[serde(default = "random_locator_id")]
    pub id: String,
    /// The two stations of the session. When unset, the first two seen
    #[serde(default)]
    pub peers: Option<[StationId; 2]>,
    /// Cross product length below which two rays count as parallel
    #[serde(default = "default_parallel_epsilon")]
    pub parallel_epsilon: f64,
    /// Broker connection
    #[serde(default)]
    pub broker: BrokerConfig,
}

fn random_locator_id() -> String {
    format!("locator-{:08x}", rand::random::<u32>())
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            id: random_locator_id(),
            peers: None,
            parallel_epsilon: DEFAULT_PARALLEL_EPSILON,
            broker: BrokerConfig::default(),
        }
    }
}

impl LocatorConfig {
    /// Reads a RON file. Station files work too, their station settings are
    /// ignored.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, LocatorError> {
        let config: Self = ron::from_str(&fs::read_to_string(path)?)?;
        config.broker.validate()?;
        Ok(config)
    }

    /// A triangulator using `parallel_epsilon`.
    pub fn triangulator(&self) -> Triangulator {
        Triangulator::new(self.parallel_epsilon)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_minimal_station() {
        let config = StationConfig::from_ron_str("(origin: (-0.5, 0.0, 0.0))").unwrap();
        assert!(config.id.starts_with("station-"));
        assert_eq!(config.id.len(), "station-".len() + 8);
        assert_eq!(config.origin(), Position::new(-0.5, 0.0, 0.0));
        assert_eq!(config.freq, 4120.0);
        assert_eq!(config.n_bands, 3);
        assert_eq!(config.block_size, 128);
        assert_eq!(config.channels, 16);
        assert_eq!(config.interval, 1.0);
        assert!(config.triangulate);
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.broker.topic, "paho/test/opts");
        assert_eq!(config.steering_grid().unwrap().shape(), (201, 201));
        assert_eq!(config.geometry().unwrap().len(), 16);
    }

    #[test]
    fn test_fresh_ids_per_station() {
        let a = StationConfig::at([0.0; 3]);
        let b = StationConfig::at([0.0; 3]);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_full_station_file() {
        let text = r#"(
            id: "station-b",
            origin: (0.5, 0.0, 0.0),
            array: Mics([(0.0, 0.0, 0.0), (0.1, 0.0, 0.0)]),
            channels: 2,
            grid: (z: 2.0, increment: 0.5),
            interval: 0.5,
            peers: Some(("station-a", "station-b")),
            record_dir: Some("/tmp/windows"),
            broker: (host: "broker.local", qos: 1, result_topic: Some("doa/location")),
        )"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();

        let config = StationConfig::from_path(file.path()).unwrap();
        assert_eq!(config.id, "station-b");
        assert_eq!(config.geometry().unwrap().len(), 2);
        assert_eq!(config.steering_grid().unwrap().shape(), (5, 5));
        assert_eq!(config.steering_grid().unwrap().z(), 2.0);
        assert_eq!(
            config.peers,
            Some(["station-a".to_owned(), "station-b".to_owned()])
        );
        assert_eq!(config.record_dir, Some(PathBuf::from("/tmp/windows")));
        assert_eq!(config.broker.host, "broker.local");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.broker.qos, 1);
        assert_eq!(config.broker.result_topic.as_deref(), Some("doa/location"));
    }

    #[test]
    fn test_rejected_configs() {
        let cases = [
            "(origin: (0.0, 0.0, 0.0), interval: 0.0)",
            "(origin: (0.0, 0.0, 0.0), freq: 30000.0)",
            "(origin: (0.0, 0.0, 0.0), peers: Some((\"a\", \"a\")))",
            "(origin: (0.0, 0.0, 0.0), array: Mics([(0.0, 0.0, 0.0)]))",
            "(origin: (0.0, 0.0, 0.0), grid: (increment: 0.0))",
            "(origin: (0.0, 0.0, 0.0), broker: (qos: 3))",
            "(origin: (0.0, 0.0, 0.0), broker: (topic: \"doa\", result_topic: Some(\"doa\")))",
        ];
        for text in cases {
            assert!(
                matches!(StationConfig::from_ron_str(text), Err(LocatorError::Config(_))),
                "{}",
                text
            );
        }
        assert!(matches!(
            StationConfig::from_ron_str("(id: \"x\")"),
            Err(LocatorError::Ron(_))
        ));
    }

    #[test]
    fn test_geometry_must_match_channels() {
        let mut config = StationConfig::at([0.0; 3]);
        config.channels = 8;
        assert!(matches!(config.geometry(), Err(LocatorError::Config(_))));
    }

    #[test]
    fn test_orientation() {
        let mut config = StationConfig::at([1.0, 0.0, 0.0]);
        assert_eq!(
            config.rotation() * Position::new(0.0, 0.0, 1.0),
            Position::new(0.0, 0.0, 1.0)
        );

        config.orientation_deg = [90.0, 0.0, 0.0];
        let turned = config.rotation() * Position::new(1.0, 0.0, 0.0);
        assert!((turned - Position::new(0.0, 1.0, 0.0)).norm() < 1e-12);

        let geometry = MicGeometry::from_positions(&[[0.1, 0.0, 0.0]]).unwrap();
        let world = config.mic_world_positions(&geometry);
        assert!((world[0] - Position::new(1.0, 0.1, 0.0)).norm() < 1e-12);
    }

    #[test]
    fn test_password_falls_back_to_env() {
        let mut broker = BrokerConfig::default();
        broker.password = Some("hunter2".to_owned());
        assert_eq!(broker.password().as_deref(), Some("hunter2"));

        broker.password = None;
        env::set_var(PASSWORD_ENV, "from-env");
        assert_eq!(broker.password().as_deref(), Some("from-env"));
        env::remove_var(PASSWORD_ENV);
    }

    #[test]
    fn test_locator_reads_station_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"(id: \"station-a\", origin: (0.0, 0.0, 0.0), parallel_epsilon: 0.001)")
            .unwrap();
        let config = LocatorConfig::from_path(file.path()).unwrap();
        assert_eq!(config.id, "station-a");
        assert_eq!(config.parallel_epsilon, 0.001);
        assert_eq!(config.peers, None);
    }
}
