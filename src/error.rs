//! The one error type shared by every stage of a station.
//!
//! Errors are split in two families. Per-cycle errors ([`InsufficientData`],
//! [`MalformedMessage`], [`ParallelRays`]) only spoil the current window,
//! message or triangulation attempt, so the station logs them and moves on.
//! Everything else means the station is misconfigured or its session is no
//! longer trustworthy, and the loop that hit it terminates.
//!
//! [`InsufficientData`]: LocatorError::InsufficientData
//! [`MalformedMessage`]: LocatorError::MalformedMessage
//! [`ParallelRays`]: LocatorError::ParallelRays

use std::{borrow::Cow, fmt};

/// Everything that can go wrong while locating a sound source.
#[derive(Debug)]
pub enum LocatorError {
    /// The accumulated window held no frames when the estimator ran.
    InsufficientData,

    /// The peak of the level map sits at a zero-length position, so there is
    /// no direction to normalize.
    DegenerateGeometry,

    /// A peer payload was not valid JSON or lacked one of the required
    /// fields.
    MalformedMessage(String),

    /// More than two distinct stations showed up in one session.
    ProtocolViolation {
        /// The identifier that did not fit
        unexpected: String,
        /// The two identifiers the session is bound to
        known: Vec<String>,
    },

    /// The two rays handed to the triangulator are (nearly) parallel.
    ParallelRays,

    /// An audio block arrived with the wrong number of channels.
    ChannelMismatch {
        /// Channels the accumulator was configured with
        expected: usize,
        /// Channels the block carried
        actual: usize,
    },

    /// The audio source failed outside of the sink.
    Capture(String),

    /// The spectral analysis failed.
    Dsp(String),

    /// The station configuration is unusable.
    Config(String),

    /// A microphone geometry file could not be parsed.
    Geometry(String),

    /// The publish/subscribe link failed. Connection loss is not retried.
    Transport(String),

    /// The broker did not acknowledge a publish in time.
    PublishTimeout,

    /// Returned when io fails when reading or writing files.
    Io(std::io::Error),

    /// Returned when a RON configuration file fails to deserialize.
    Ron(ron::error::SpannedError),

    /// Returned when a JSON payload fails to (de)serialize.
    Json(serde_json::Error),

    /// Returned when reading or writing a WAV file fails.
    Hound(hound::Error),
}

impl LocatorError {
    /// Whether the station should log this error and carry on with the next
    /// cycle rather than stop.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LocatorError::InsufficientData
                | LocatorError::MalformedMessage(_)
                | LocatorError::ParallelRays
        )
    }
}

impl fmt::Display for LocatorError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use LocatorError as LE;
        let msg = match self {
            LE::InsufficientData => Cow::from("no samples accumulated"),
            LE::DegenerateGeometry => {
                Cow::from("steering grid peak has zero length, check the grid depth")
            }
            LE::MalformedMessage(why) => Cow::from(format!("malformed peer message: {}", why)),
            LE::ProtocolViolation { unexpected, known } => Cow::from(format!(
                "station {} is not one of the two session stations {:?}",
                unexpected, known
            )),
            LE::ParallelRays => Cow::from("rays are parallel, nothing to triangulate"),
            LE::ChannelMismatch { expected, actual } => Cow::from(format!(
                "audio block has {} channels, expected {}",
                actual, expected
            )),
            LE::Capture(why) => Cow::from(format!("audio capture failed: {}", why)),
            LE::Dsp(why) => Cow::from(format!("signal processing failed: {}", why)),
            LE::Config(why) => Cow::from(format!("configuration error: {}", why)),
            LE::Geometry(why) => Cow::from(format!("geometry error: {}", why)),
            LE::Transport(why) => Cow::from(format!("transport error: {}", why)),
            LE::PublishTimeout => Cow::from("timed out waiting for publish acknowledgement"),
            LE::Io(error) => Cow::from(format!("io error: {}", error)),
            LE::Ron(error) => Cow::from(format!("ron error: {}", error)),
            LE::Json(error) => Cow::from(format!("json error: {}", error)),
            LE::Hound(error) => Cow::from(format!("hound error: {}", error)),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for LocatorError {}

impl From<std::io::Error> for LocatorError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<ron::error::SpannedError> for LocatorError {
    fn from(value: ron::error::SpannedError) -> Self {
        Self::Ron(value)
    }
}

impl From<serde_json::Error> for LocatorError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<hound::Error> for LocatorError {
    fn from(value: hound::Error) -> Self {
        Self::Hound(value)
    }
}
