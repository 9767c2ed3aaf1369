// Commandline argument parsers using clap for the locator and simulate binaries

use crate::config::{BrokerConfig, LocatorConfig, StationConfig};

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Command line of the `locator` binary.
#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct LocatorArgs {
    #[command(subcommand)]
    /// Which role to run, a station or a dedicated locator
    pub command: LocatorCommand,

    #[command(flatten)]
    #[allow(missing_docs)]
    pub broker: BrokerOverrides,
}

/// The roles the `locator` binary can take.
#[derive(Debug, Subcommand, Clone)]
pub enum LocatorCommand {
    /// Estimate directions from one microphone array and publish them
    #[command(about)]
    Station(StationCommand),

    /// Triangulate the estimates published by two stations
    #[command(about)]
    Locate(LocateCommand),
}

/// Broker settings that take precedence over the configuration file.
#[derive(Debug, Args, Clone, Default)]
pub struct BrokerOverrides {
    /// Broker host name
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Broker port
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Topic estimates are exchanged on
    #[arg(long, global = true)]
    pub topic: Option<String>,
}

impl BrokerOverrides {
    /// Writes the given flags over `broker`.
    pub fn apply(&self, broker: &mut BrokerConfig) {
        if let Some(host) = &self.host {
            broker.host = host.clone();
        }
        if let Some(port) = self.port {
            broker.port = port;
        }
        if let Some(topic) = &self.topic {
            broker.topic = topic.clone();
        }
    }
}

/// Arguments of `locator station`.
#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct StationCommand {
    /// Station configuration file (RON)
    #[arg(short, long)]
    pub config: PathBuf,

    /// Station identifier, overriding the file
    #[arg(long)]
    pub id: Option<String>,

    /// Seconds of audio per estimate, overriding the file
    #[arg(short, long)]
    pub interval: Option<f64>,

    /// Replay this multi-channel WAV recording as the array input
    #[arg(short, long, conflicts_with = "simulate")]
    pub wav: Option<PathBuf>,

    /// Simulate a tone at this world position instead of reading audio
    #[arg(long, num_args = 3, value_names = ["X", "Y", "Z"], allow_negative_numbers = true)]
    pub simulate: Option<Vec<f64>>,

    /// Deliver the input as fast as possible rather than at its sample rate
    #[arg(long)]
    pub fast: bool,
}

impl StationCommand {
    /// Loads the configuration file and applies the command line on top.
    pub fn load(&self, broker: &BrokerOverrides) -> Result<StationConfig, crate::error::LocatorError> {
        let mut config = StationConfig::from_path(&self.config)?;
        if let Some(id) = &self.id {
            config.id = id.clone();
        }
        if let Some(interval) = self.interval {
            config.interval = interval;
        }
        broker.apply(&mut config.broker);
        config.validate()?;
        Ok(config)
    }
}

/// Arguments of `locator locate`.
#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct LocateCommand {
    /// Configuration file (RON); a station file works too
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// The two stations to pair, instead of the first two heard from
    #[arg(long, num_args = 2, value_names = ["A", "B"])]
    pub peers: Option<Vec<String>>,
}

impl LocateCommand {
    /// Loads the configuration file, if any, and applies the command line
    /// on top.
    pub fn load(&self, broker: &BrokerOverrides) -> Result<LocatorConfig, crate::error::LocatorError> {
        let mut config = match &self.config {
            Some(path) => LocatorConfig::from_path(path)?,
            None => LocatorConfig::default(),
        };
        if let Some([a, b]) = self.peers.as_deref() {
            config.peers = Some([a.clone(), b.clone()]);
        }
        broker.apply(&mut config.broker);
        config.broker.validate()?;
        Ok(config)
    }
}

/// Command line of the `simulate` binary.
#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct SimulateArgs {
    /// World position of the simulated sound source
    #[arg(
        short,
        long,
        num_args = 3,
        value_names = ["X", "Y", "Z"],
        default_values_t = [0.0, -0.5, 1.0],
        allow_negative_numbers = true
    )]
    pub source: Vec<f64>,

    /// Distance between the two stations, along x, in meters
    #[arg(long, default_value_t = 1.0)]
    pub baseline: f64,

    /// Frequency of the simulated tone, in Hz
    #[arg(short, long, default_value_t = 3750.0)]
    pub freq: f64,

    /// Uniform noise added to every sample
    #[arg(short, long, default_value_t = 0.0)]
    pub noise: f64,

    /// Seconds of audio per estimate
    #[arg(short, long, default_value_t = 0.1)]
    pub interval: f64,

    /// Steering grid spacing, in meters
    #[arg(long, default_value_t = 0.05)]
    pub increment: f64,

    /// Stop after this many locations
    #[arg(short, long, default_value_t = 3)]
    pub rounds: usize,
}
