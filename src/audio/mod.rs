//! Audio blocks and the sources that produce them.
//!
//! A source runs its own capture thread and hands every block it produces to
//! a [`BlockSink`]. The station's sink pushes into the
//! [`SampleAccumulator`](crate::accumulator::SampleAccumulator); if the sink
//! fails, the capture thread stops and the error comes back out of
//! [`AudioSource::stop()`].

pub mod synthetic;
pub mod wav;

use crate::error::LocatorError;

use log::{info, warn};
use ndarray::{Array2, ArrayView2};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub use synthetic::SyntheticSource;
pub use wav::WavSource;

/// A block of multi-channel audio, `frames x channels`, sample values as
/// floats in roughly `[-1, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBlock {
    samples: Array2<f64>,
    /// Set when the producer fell behind and samples may be missing before
    /// this block. This is a warning, not an error.
    pub overflow: bool,
}

impl AudioBlock {
    /// Builds a block from interleaved samples (`frame0ch0, frame0ch1, ...`).
    pub fn from_interleaved(data: Vec<f64>, channels: usize) -> Result<Self, LocatorError> {
        if channels == 0 || data.len() % channels != 0 {
            return Err(LocatorError::Capture(format!(
                "{} samples do not split into frames of {} channels",
                data.len(),
                channels
            )));
        }
        let frames = data.len() / channels;
        let samples = Array2::from_shape_vec((frames, channels), data)
            .map_err(|e| LocatorError::Capture(e.to_string()))?;
        Ok(Self {
            samples,
            overflow: false,
        })
    }

    /// Builds a block from a list of frames. Every frame must have the same
    /// number of channels.
    pub fn from_frames(frames: &[Vec<f64>]) -> Result<Self, LocatorError> {
        let channels = frames.first().map_or(0, Vec::len);
        if let Some(bad) = frames.iter().find(|f| f.len() != channels) {
            return Err(LocatorError::ChannelMismatch {
                expected: channels,
                actual: bad.len(),
            });
        }
        let data = frames.iter().flatten().copied().collect();
        Self::from_interleaved(data, channels.max(1))
    }

    /// Number of frames in the block
    pub fn frames(&self) -> usize {
        self.samples.nrows()
    }

    /// Number of channels in every frame
    pub fn channels(&self) -> usize {
        self.samples.ncols()
    }

    /// The samples, one row per frame.
    pub fn samples(&self) -> ArrayView2<f64> {
        self.samples.view()
    }

    /// Applies a gain in dB, `10^(gain / 10)` on every sample.
    pub fn apply_gain_db(&mut self, gain_db: f64) {
        if gain_db != 0.0 {
            let factor = 10f64.powf(gain_db / 10.0);
            self.samples.mapv_inplace(|s| s * factor);
        }
    }
}

/// Where a capture thread delivers its blocks.
pub type BlockSink = Box<dyn FnMut(AudioBlock) -> Result<(), LocatorError> + Send>;

/// Something that can deliver [`AudioBlock`]s from its own thread.
pub trait AudioSource: Send {
    /// Sample rate of the produced blocks, in Hz
    fn sample_rate(&self) -> f64;

    /// Channels per frame
    fn channels(&self) -> usize;

    /// Starts the capture thread, delivering every block to `sink`.
    fn start(&mut self, sink: BlockSink) -> Result<(), LocatorError>;

    /// True once the capture thread has exited on its own, either because
    /// the input ran out or because the sink failed.
    fn is_finished(&self) -> bool;

    /// Stops the capture thread and waits for it. Returns the error that
    /// ended capture, if any.
    fn stop(&mut self) -> Result<(), LocatorError>;
}

enum Signal {
    Stop,
}

/// The running capture thread of a source.
pub(crate) struct CaptureHandle {
    handle: Option<JoinHandle<Result<(), LocatorError>>>,
    tx: mpsc::Sender<Signal>,
}

impl CaptureHandle {
    /// Spawns a capture thread that calls `next_block` until it returns
    /// `None`, a stop is requested, or the sink fails. With `pace` set, one
    /// block is emitted per `pace` like a sound card would; a block that
    /// could not be delivered on time carries the overflow flag.
    pub(crate) fn spawn<F>(
        name: &str,
        mut next_block: F,
        mut sink: BlockSink,
        pace: Option<Duration>,
    ) -> Result<Self, LocatorError>
    where
        F: FnMut() -> Result<Option<AudioBlock>, LocatorError> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Signal>();
        let thread_name = name.to_owned();

        let handle = thread::Builder::new()
            .name(format!("capture-{}", name))
            .spawn(move || {
                let mut deadline = Instant::now();
                let mut late = false;
                loop {
                    if let Ok(Signal::Stop) = rx.try_recv() {
                        break;
                    }

                    let Some(mut block) = next_block()? else {
                        info!("{} : end of input.", thread_name);
                        break;
                    };
                    block.overflow |= late;
                    if block.overflow {
                        warn!("{} : input overflow, samples may be missing", thread_name);
                    }
                    sink(block)?;

                    if let Some(period) = pace {
                        deadline += period;
                        let now = Instant::now();
                        late = now > deadline;
                        if late {
                            deadline = now;
                        } else {
                            spin_sleep::sleep(deadline - now);
                        }
                    }
                }
                Ok(())
            })?;

        Ok(Self {
            handle: Some(handle),
            tx,
        })
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    pub(crate) fn stop(&mut self) -> Result<(), LocatorError> {
        // The thread may already be gone, in which case there is nobody to
        // tell.
        let _ = self.tx.send(Signal::Stop);
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| LocatorError::Capture("capture thread panicked".to_owned()))?,
            None => Ok(()),
        }
    }
}
