//! Replays a WAV recording, block by block, as if a sound card produced it.

use super::{AudioBlock, AudioSource, BlockSink, CaptureHandle};
use crate::error::LocatorError;

use hound::{SampleFormat, WavReader};
use log::info;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// An [`AudioSource`] reading a whole WAV file up front.
pub struct WavSource {
    name: String,
    samples: Arc<Vec<f64>>,
    channels: usize,
    sample_rate: f64,
    block_size: usize,
    realtime: bool,
    capture: Option<CaptureHandle>,
}

impl WavSource {
    /// Opens `path`, to be played back in blocks of `block_size` frames.
    /// With `realtime` set, blocks come out at the pace the recording was
    /// made, otherwise as fast as the sink takes them.
    ///
    /// Integer samples are scaled into `[-1, 1]`, float samples are used as
    /// they are.
    pub fn open<P: AsRef<Path>>(
        path: P,
        block_size: usize,
        realtime: bool,
    ) -> Result<Self, LocatorError> {
        if block_size == 0 {
            return Err(LocatorError::Config("block_size must be positive".to_owned()));
        }
        let path = path.as_ref();
        let mut reader = WavReader::open(path)?;
        let spec = reader.spec();

        let samples = match spec.sample_format {
            SampleFormat::Float => reader
                .samples::<f32>()
                .map(|s| s.map(f64::from))
                .collect::<Result<Vec<f64>, hound::Error>>()?,
            SampleFormat::Int => {
                let full_scale = (1u64 << (spec.bits_per_sample - 1)) as f64;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| f64::from(v) / full_scale))
                    .collect::<Result<Vec<f64>, hound::Error>>()?
            }
        };

        let name = path
            .file_name()
            .map_or_else(|| "wav".to_owned(), |n| n.to_string_lossy().into_owned());
        info!(
            "{} : {} channels at {} Hz, {} frames",
            name,
            spec.channels,
            spec.sample_rate,
            samples.len() / usize::from(spec.channels.max(1))
        );

        Ok(Self {
            name,
            samples: Arc::new(samples),
            channels: usize::from(spec.channels),
            sample_rate: f64::from(spec.sample_rate),
            block_size,
            realtime,
            capture: None,
        })
    }
}

impl AudioSource for WavSource {
    fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn start(&mut self, sink: BlockSink) -> Result<(), LocatorError> {
        if self.capture.is_some() {
            return Err(LocatorError::Capture(format!("{} is already playing", self.name)));
        }

        let samples = Arc::clone(&self.samples);
        let channels = self.channels;
        let step = self.block_size * channels;
        let mut cursor = 0;
        let next_block = move || {
            if cursor >= samples.len() {
                return Ok(None);
            }
            let end = (cursor + step).min(samples.len());
            let block = AudioBlock::from_interleaved(samples[cursor..end].to_vec(), channels)?;
            cursor = end;
            Ok(Some(block))
        };

        let pace = self
            .realtime
            .then(|| Duration::from_secs_f64(self.block_size as f64 / self.sample_rate));
        self.capture = Some(CaptureHandle::spawn(&self.name, next_block, sink, pace)?);
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.capture.as_ref().is_some_and(CaptureHandle::is_finished)
    }

    fn stop(&mut self) -> Result<(), LocatorError> {
        match self.capture.take() {
            Some(mut capture) => capture.stop(),
            None => Ok(()),
        }
    }
}
