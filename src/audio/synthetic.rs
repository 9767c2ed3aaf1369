//! A simulated sound source, heard by a simulated array.
//!
//! Microphone `m` at distance `r_m` from the source hears
//!
//! ```text
//! s_m(t) = A / r_m * sin(2 pi f (t - r_m / c)) + noise
//! ```
//!
//! with `noise` uniform in `[-n, n]`, independent per sample.

use super::{AudioBlock, AudioSource, BlockSink, CaptureHandle};
use crate::beamformer::SPEED_OF_SOUND;
use crate::error::LocatorError;
use crate::{Position, TransposableIter};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::TAU;
use std::time::Duration;

/// An [`AudioSource`] synthesizing a tone at a fixed point in space.
pub struct SyntheticSource {
    name: String,
    distances: Vec<f64>,
    freq: f64,
    amplitude: f64,
    noise: f64,
    sample_rate: f64,
    block_size: usize,
    realtime: bool,
    max_blocks: Option<usize>,
    seed: Option<u64>,
    capture: Option<CaptureHandle>,
}

impl SyntheticSource {
    /// Simulates a `freq` Hz tone at `source`, heard by microphones at
    /// `mics`, both in the same (world) frame. Unit amplitude, no noise,
    /// blocks as fast as the sink takes them, forever.
    pub fn new(
        name: &str,
        mics: &[Position],
        source: Position,
        freq: f64,
        sample_rate: f64,
        block_size: usize,
    ) -> Result<Self, LocatorError> {
        if mics.is_empty() || block_size == 0 || sample_rate <= 0.0 {
            return Err(LocatorError::Config(format!(
                "{} : synthetic source needs microphones, a block size and a sample rate",
                name
            )));
        }
        let distances: Vec<f64> = mics.iter().map(|m| (m - source).norm()).collect();
        if distances.iter().any(|&r| r == 0.0) {
            return Err(LocatorError::Config(format!(
                "{} : source sits on a microphone",
                name
            )));
        }

        Ok(Self {
            name: name.to_owned(),
            distances,
            freq,
            amplitude: 1.0,
            noise: 0.0,
            sample_rate,
            block_size,
            realtime: false,
            max_blocks: None,
            seed: None,
            capture: None,
        })
    }

    /// Sets the tone amplitude at one meter.
    pub fn amplitude(mut self, amplitude: f64) -> Self {
        self.amplitude = amplitude;
        self
    }

    /// Adds uniform noise in `[-noise, noise]` to every sample. `seed` makes
    /// the noise reproducible.
    pub fn noise(mut self, noise: f64, seed: Option<u64>) -> Self {
        self.noise = noise;
        self.seed = seed;
        self
    }

    /// Emits one block per block duration, like a sound card.
    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    /// Ends the input after `blocks` blocks.
    pub fn limit_blocks(mut self, blocks: usize) -> Self {
        self.max_blocks = Some(blocks);
        self
    }
}

impl AudioSource for SyntheticSource {
    fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    fn channels(&self) -> usize {
        self.distances.len()
    }

    fn start(&mut self, sink: BlockSink) -> Result<(), LocatorError> {
        if self.capture.is_some() {
            return Err(LocatorError::Capture(format!("{} is already running", self.name)));
        }

        let distances = self.distances.clone();
        let (freq, amplitude, noise) = (self.freq, self.amplitude, self.noise);
        let (fs, block_size, max_blocks) = (self.sample_rate, self.block_size, self.max_blocks);
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut produced = 0usize;

        let next_block = move || {
            if max_blocks.is_some_and(|max| produced >= max) {
                return Ok(None);
            }
            let start = produced * block_size;
            let channels: Vec<Vec<f64>> = distances
                .iter()
                .map(|&r| {
                    (start..start + block_size)
                        .map(|n| {
                            let t = n as f64 / fs;
                            let tone = amplitude / r * (TAU * freq * (t - r / SPEED_OF_SOUND)).sin();
                            if noise > 0.0 {
                                tone + rng.gen_range(-noise..=noise)
                            } else {
                                tone
                            }
                        })
                        .collect()
                })
                .collect();
            produced += 1;

            let frames: Vec<Vec<f64>> = channels.transpose().collect();
            AudioBlock::from_frames(&frames).map(Some)
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::thread;

    fn collect(source: &mut SyntheticSource) -> Vec<AudioBlock> {
        let blocks = Arc::new(Mutex::new(Vec::new()));
        let sink_blocks = Arc::clone(&blocks);
        source
            .start(Box::new(move |block| {
                sink_blocks.lock().unwrap().push(block);
                Ok(())
            }))
            .unwrap();
        while !source.is_finished() {
            thread::sleep(Duration::from_millis(1));
        }
        source.stop().unwrap();
        let out = blocks.lock().unwrap().clone();
        out
    }

    #[test]
    fn test_tone_follows_distance() {
        let mics = [Position::new(0.0, 0.0, 0.0), Position::new(0.0, 0.0, 2.0)];
        let source = Position::new(0.0, 0.0, 1.0);
        let mut synth = SyntheticSource::new("synth", &mics, source, 1000.0, 48000.0, 16)
            .unwrap()
            .amplitude(2.0)
            .limit_blocks(3);
        assert_eq!(synth.channels(), 2);

        let blocks = collect(&mut synth);
        assert_eq!(blocks.len(), 3);
        assert!(blocks.iter().all(|b| b.frames() == 16 && b.channels() == 2));

        // Both mics are one meter away, so they hear the same thing
        let n = 16 + 5;
        let t = n as f64 / 48000.0;
        let expected = 2.0 * (TAU * 1000.0 * (t - 1.0 / SPEED_OF_SOUND)).sin();
        let frame = blocks[1].samples().row(5).to_vec();
        assert!((frame[0] - expected).abs() < 1e-12);
        assert!((frame[1] - expected).abs() < 1e-12);
    }

    #[test]
    fn test_noise_is_bounded_and_seeded() {
        let mics = [Position::new(0.0, 0.0, 0.0)];
        let source = Position::new(0.0, 0.0, 1.0);
        let make = || {
            SyntheticSource::new("noisy", &mics, source, 500.0, 8000.0, 64)
                .unwrap()
                .amplitude(0.0)
                .noise(0.1, Some(3))
                .limit_blocks(2)
        };

        let a = collect(&mut make());
        let b = collect(&mut make());
        assert_eq!(a, b);
        assert!(a.iter().all(|blk| blk.samples().iter().all(|s| s.abs() <= 0.1)));
        assert!(a[0].samples().iter().any(|&s| s != 0.0));
    }

    #[test]
    fn test_source_on_a_mic() {
        let mics = [Position::new(0.1, 0.0, 0.0)];
        assert!(matches!(
            SyntheticSource::new("bad", &mics, Position::new(0.1, 0.0, 0.0), 500.0, 8000.0, 64),
            Err(LocatorError::Config(_))
        ));
    }
}
