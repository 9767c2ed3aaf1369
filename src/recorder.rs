//! Writes every consumed window to its own WAV file, so a session can be
//! replayed later through a [`WavSource`](crate::audio::WavSource).

use crate::accumulator::SampleWindow;
use crate::component::Component;
use crate::error::LocatorError;
use crate::StationId;

use hound::{SampleFormat, WavSpec, WavWriter};
use log::debug;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Writes windows as 32-bit float WAV files named
/// `<station>-<unix time>-<sequence>.wav`.
pub struct WindowRecorder {
    dir: PathBuf,
    station: StationId,
    sequence: u64,
}

impl WindowRecorder {
    /// Instantiates a recorder writing into `dir`, creating it if needed.
    pub fn new<P: AsRef<Path>>(dir: P, station: &str) -> Result<Self, LocatorError> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
            station: station.to_owned(),
            sequence: 0,
        })
    }

    fn write(&mut self, window: &SampleWindow) -> Result<PathBuf, LocatorError> {
        let unix_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        let path = self
            .dir
            .join(format!("{}-{}-{}.wav", self.station, unix_time, self.sequence));
        self.sequence += 1;

        let channels = u16::try_from(window.channels()).map_err(|_| {
            LocatorError::Config(format!("cannot record {} channels", window.channels()))
        })?;
        let spec = WavSpec {
            channels,
            sample_rate: window.sample_rate().round() as u32,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };

        let mut writer = WavWriter::create(&path, spec)?;
        // rows are frames, so this is already interleaved
        for &sample in window.samples().iter() {
            writer.write_sample(sample as f32)?;
        }
        writer.finalize()?;

        debug!("{} : recorded {} frames to {}", self.station, window.frames(), path.display());
        Ok(path)
    }
}

impl Component for WindowRecorder {
    type InData = SampleWindow;
    type OutData = Result<PathBuf, LocatorError>;

    /// Writes one window to a new file, returning its path
    fn convert(&mut self, input: SampleWindow) -> Result<PathBuf, LocatorError> {
        self.write(&input)
    }

    /// Every file is complete once written, so there is nothing to flush
    fn finalize(&mut self) -> Result<(), LocatorError> {
        Ok(())
    }
}

impl ToString for WindowRecorder {
    fn to_string(&self) -> String {
        format!("recorder-{}", self.station)
    }
}
