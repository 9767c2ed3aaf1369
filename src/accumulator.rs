//! Collects audio blocks into the window the estimator consumes once per
//! accumulation interval.
//!
//! The capture thread pushes while the controller polls, takes and resets,
//! so every operation goes through the same lock: the controller can never
//! see a window that is halfway through being extended.

use crate::audio::AudioBlock;
use crate::error::LocatorError;

use log::warn;
use ndarray::{Array2, ArrayView1, Axis};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// An accumulated run of frames, `frames x channels`.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleWindow {
    samples: Array2<f64>,
    sample_rate: f64,
}

impl SampleWindow {
    /// Wraps `frames x channels` samples taken at `sample_rate` Hz.
    pub fn new(samples: Array2<f64>, sample_rate: f64) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Number of frames in the window
    pub fn frames(&self) -> usize {
        self.samples.nrows()
    }

    /// Number of channels in every frame
    pub fn channels(&self) -> usize {
        self.samples.ncols()
    }

    /// Sample rate in Hz
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// True if the window holds no frames at all
    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }

    /// All samples recorded by one microphone, in time order.
    pub fn channel(&self, channel: usize) -> ArrayView1<f64> {
        self.samples.column(channel)
    }

    /// The raw `frames x channels` samples
    pub fn samples(&self) -> &Array2<f64> {
        &self.samples
    }

    /// Window length in seconds
    pub fn duration(&self) -> f64 {
        self.frames() as f64 / self.sample_rate
    }
}

#[derive(Debug)]
struct WindowState {
    samples: Array2<f64>,
    frames: usize,
}

/// A thread-safe, unbounded buffer of audio frames. Clones share the same
/// buffer, so one clone can live in the capture callback while another sits
/// in the controller.
#[derive(Debug, Clone)]
pub struct SampleAccumulator {
    state: Arc<Mutex<WindowState>>,
    channels: usize,
    sample_rate: f64,
}

impl SampleAccumulator {
    /// Instantiates an empty accumulator for blocks of `channels` channels
    /// sampled at `sample_rate` Hz.
    pub fn new(channels: usize, sample_rate: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(WindowState {
                samples: Array2::zeros((0, channels)),
                frames: 0,
            })),
            channels,
            sample_rate,
        }
    }

    fn lock(&self) -> MutexGuard<'_, WindowState> {
        // A panic elsewhere cannot leave the window half-written: the append
        // and the counter update happen under the same guard.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of channels every pushed block must have
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Sample rate of the accumulated audio, in Hz
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Appends the frames of `block` in arrival order. A block with the wrong
    /// number of channels is a configuration error and is refused whole.
    pub fn push(&self, block: &AudioBlock) -> Result<(), LocatorError> {
        if block.channels() != self.channels {
            return Err(LocatorError::ChannelMismatch {
                expected: self.channels,
                actual: block.channels(),
            });
        }
        if block.overflow {
            warn!("input overflow reported with a block of {} frames", block.frames());
        }

        let mut state = self.lock();
        state
            .samples
            .append(Axis(0), block.samples())
            .map_err(|e| LocatorError::Capture(e.to_string()))?;
        state.frames += block.frames();
        Ok(())
    }

    /// Frames accumulated since the last reset
    pub fn frame_count(&self) -> usize {
        self.lock().frames
    }

    /// Seconds of audio accumulated since the last reset
    pub fn elapsed_seconds(&self) -> f64 {
        self.frame_count() as f64 / self.sample_rate
    }

    /// A copy of the current window, leaving the accumulator as it is.
    pub fn snapshot(&self) -> SampleWindow {
        SampleWindow::new(self.lock().samples.clone(), self.sample_rate)
    }

    /// Empties the accumulator.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.samples = Array2::zeros((0, self.channels));
        state.frames = 0;
    }

    /// Hands out the accumulated window and resets, as one step. Frames
    /// pushed afterwards belong to the next window.
    pub fn take(&self) -> SampleWindow {
        let mut state = self.lock();
        let samples = std::mem::replace(&mut state.samples, Array2::zeros((0, self.channels)));
        state.frames = 0;
        SampleWindow::new(samples, self.sample_rate)
    }
}
