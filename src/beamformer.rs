//! Sound level maps over a steering grid.
//!
//! The estimator only needs something that implements [`LevelMapper`]. The
//! one shipped here, [`BaseBeamformer`], is a conventional frequency-domain
//! delay-and-sum beamformer:
//!
//! 1. The window is cut into non-overlapping Hann-windowed blocks of
//!    `block_size` frames and each channel is Fourier transformed.
//! 2. For every FFT bin in the analysis band, the cross-spectral matrix
//!    `C = mean(X X^H)` over all blocks is formed.
//! 3. Each grid point gets the steering vector
//!    `h_m = exp(-j 2 pi f (r_m - r_0) / c) / M`, where `r_m` is its distance
//!    to microphone `m` and `r_0` its distance to the array centre, and the
//!    beamformer output `h^H C h` is summed over the band.
//! 4. The summed power is reported as a sound pressure level,
//!    `10 log10(p / 4e-10)`.

use crate::accumulator::SampleWindow;
use crate::error::LocatorError;
use crate::geometry::MicGeometry;
use crate::grid::SteeringGrid;

use log::debug;
use ndarray::{Array1, Array2};
use num_complex::Complex;
use realfft::RealFftPlanner;

use std::f64::consts::PI;

/// Speed of sound in air at room temperature, m/s
pub const SPEED_OF_SOUND: f64 = 343.0;

/// Squared reference pressure (20 uPa)^2 for sound pressure levels
const REFERENCE_POWER: f64 = 4e-10;

/// Level reported where the beamformer power is zero or negative
const FLOOR_DB: f64 = -350.0;

/// Maps a window of samples onto sound levels over a steering grid.
pub trait LevelMapper: Send {
    /// Returns an `nx x ny` array of levels in dB, indexed like
    /// [`SteeringGrid::point()`].
    ///
    /// `freq` is the centre of the analysis band in Hz. `n_bands` selects
    /// the band width: `0` for the single nearest FFT bin, otherwise a
    /// `1/n_bands` octave band (3 for third-octave bands).
    fn compute_level_map(
        &self,
        window: &SampleWindow,
        geometry: &MicGeometry,
        grid: &SteeringGrid,
        freq: f64,
        n_bands: u32,
    ) -> Result<Array2<f64>, LocatorError>;
}

/// Converts a beamformer power into a sound pressure level.
pub fn sound_pressure_level(power: f64) -> f64 {
    if power > 0.0 {
        10.0 * (power / REFERENCE_POWER).log10()
    } else {
        FLOOR_DB
    }
}

/// Symmetric Hann window of length `n`
fn hann(n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![1.0];
    }
    (0..n)
        .map(|k| 0.5 - 0.5 * (2.0 * PI * k as f64 / (n - 1) as f64).cos())
        .collect()
}

/// FFT bins that fall inside the analysis band around `freq`.
fn band_bins(freq: f64, n_bands: u32, block_size: usize, sample_rate: f64) -> Vec<usize> {
    let df = sample_rate / block_size as f64;
    let last = block_size / 2;
    let nearest = ((freq / df).round() as usize).min(last);
    if n_bands == 0 {
        return vec![nearest];
    }

    let half_width = 2f64.powf(1.0 / (2.0 * n_bands as f64));
    let (f_lo, f_hi) = (freq / half_width, freq * half_width);
    let bins: Vec<usize> = (0..=last)
        .filter(|&k| {
            let f = k as f64 * df;
            f >= f_lo && f < f_hi
        })
        .collect();

    if bins.is_empty() {
        vec![nearest]
    } else {
        bins
    }
}

/// The classic delay-and-sum beamformer.
#[derive(Debug, Clone)]
pub struct BaseBeamformer {
    block_size: usize,
    speed_of_sound: f64,
}

impl BaseBeamformer {
    /// A beamformer that transforms blocks of `block_size` frames.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            speed_of_sound: SPEED_OF_SOUND,
        }
    }

    /// Overrides the speed of sound, for instance for other temperatures.
    pub fn with_speed_of_sound(self, speed_of_sound: f64) -> Self {
        Self {
            speed_of_sound,
            ..self
        }
    }

    /// Averaged cross-spectral matrices, one per requested bin.
    fn cross_spectra(
        &self,
        window: &SampleWindow,
        bins: &[usize],
    ) -> Result<Vec<Array2<Complex<f64>>>, LocatorError> {
        let n = self.block_size;
        let channels = window.channels();
        let taper = hann(n);
        let n_blocks = (window.frames() / n).max(1);

        let mut planner = RealFftPlanner::<f64>::new();
        let fft = planner.plan_fft_forward(n);
        let mut input = fft.make_input_vec();
        let mut spectrum = fft.make_output_vec();

        let mut csm = vec![Array2::<Complex<f64>>::zeros((channels, channels)); bins.len()];
        let mut snapshot = Array2::<Complex<f64>>::zeros((bins.len(), channels));

        for block in 0..n_blocks {
            let start = block * n;
            for ch in 0..channels {
                let samples = window.channel(ch);
                for (k, slot) in input.iter_mut().enumerate() {
                    // Windows shorter than one block are zero padded.
                    let s = samples.get(start + k).copied().unwrap_or(0.0);
                    *slot = s * taper[k];
                }
                fft.process(&mut input, &mut spectrum)
                    .map_err(|e| LocatorError::Dsp(e.to_string()))?;
                for (b, &bin) in bins.iter().enumerate() {
                    snapshot[[b, ch]] = spectrum[bin] / n as f64;
                }
            }

            for (b, c) in csm.iter_mut().enumerate() {
                let x = snapshot.row(b);
                for m1 in 0..channels {
                    for m2 in 0..channels {
                        c[[m1, m2]] += x[m1] * x[m2].conj();
                    }
                }
            }
        }

        for c in csm.iter_mut() {
            c.mapv_inplace(|v| v / n_blocks as f64);
        }
        Ok(csm)
    }
}

impl LevelMapper for BaseBeamformer {
    fn compute_level_map(
        &self,
        window: &SampleWindow,
        geometry: &MicGeometry,
        grid: &SteeringGrid,
        freq: f64,
        n_bands: u32,
    ) -> Result<Array2<f64>, LocatorError> {
        if window.is_empty() {
            return Err(LocatorError::InsufficientData);
        }
        if window.channels() != geometry.len() {
            return Err(LocatorError::ChannelMismatch {
                expected: geometry.len(),
                actual: window.channels(),
            });
        }
        let nyquist = window.sample_rate() / 2.0;
        if !(freq > 0.0 && freq <= nyquist) {
            return Err(LocatorError::Config(format!(
                "analysis frequency {} Hz is outside (0, {}] Hz",
                freq, nyquist
            )));
        }

        let bins = band_bins(freq, n_bands, self.block_size, window.sample_rate());
        let df = window.sample_rate() / self.block_size as f64;
        debug!(
            "beamforming {} frames over {} cells, bins {:?} ({:.1} Hz wide)",
            window.frames(),
            grid.len(),
            bins,
            df
        );
        let csm = self.cross_spectra(window, &bins)?;

        let mics = geometry.positions();
        let center = geometry.center();
        let n_mics = mics.len() as f64;
        let (nx, ny) = grid.shape();

        let levels = Array2::from_shape_fn((nx, ny), |(i, j)| {
            let focus = grid.point(i, j);
            let r0 = (center - focus).norm();
            let delays: Vec<f64> = mics
                .iter()
                .map(|m| ((m - focus).norm() - r0) / self.speed_of_sound)
                .collect();

            let power: f64 = bins
                .iter()
                .zip(csm.iter())
                .map(|(&bin, c)| {
                    let omega = 2.0 * PI * bin as f64 * df;
                    let h: Array1<Complex<f64>> = delays
                        .iter()
                        .map(|&tau| Complex::from_polar(1.0 / n_mics, -omega * tau))
                        .collect();
                    let ch = c.dot(&h);
                    h.iter()
                        .zip(ch.iter())
                        .map(|(hm, chm)| hm.conj() * chm)
                        .sum::<Complex<f64>>()
                        .re
                })
                .sum();

            sound_pressure_level(power)
        });

        Ok(levels)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::Position;

    /// Samples of a tone of `freq` Hz emitted at `source` as heard by each
    /// microphone, `frames x channels`.
    pub(crate) fn tone_from(
        source: Position,
        geometry: &MicGeometry,
        freq: f64,
        sample_rate: f64,
        frames: usize,
    ) -> SampleWindow {
        let samples = Array2::from_shape_fn((frames, geometry.len()), |(t, m)| {
            let r = (geometry.positions()[m] - source).norm();
            let t = t as f64 / sample_rate - r / SPEED_OF_SOUND;
            (2.0 * PI * freq * t).sin() / r
        });
        SampleWindow::new(samples, sample_rate)
    }

    fn argmax(levels: &Array2<f64>) -> (usize, usize) {
        let mut best = ((0, 0), f64::NEG_INFINITY);
        for ((i, j), &v) in levels.indexed_iter() {
            if v > best.1 {
                best = ((i, j), v);
            }
        }
        best.0
    }

    #[test]
    fn test_hann() {
        let w = hann(5);
        assert_eq!(w[0], 0.0);
        assert!((w[2] - 1.0).abs() < 1e-12);
        assert!(w[4].abs() < 1e-12);
    }

    #[test]
    fn test_band_bins() {
        // 375 Hz bins; a third-octave band around 4 kHz spans ~3.56-4.49 kHz
        assert_eq!(band_bins(4000.0, 3, 128, 48000.0), vec![10, 11]);
        assert_eq!(band_bins(4000.0, 0, 128, 48000.0), vec![11]);
        // Narrow band between two bins falls back to the nearest
        assert_eq!(band_bins(3800.0, 100, 128, 48000.0), vec![10]);
    }

    #[test]
    fn test_spl() {
        assert!((sound_pressure_level(4e-10)).abs() < 1e-9);
        assert!((sound_pressure_level(4e-8) - 20.0).abs() < 1e-9);
        assert_eq!(sound_pressure_level(0.0), FLOOR_DB);
    }

    #[test]
    fn test_peak_at_source() {
        let geometry = MicGeometry::uma16();
        let grid = SteeringGrid::square(1.0, 1.0, 0.25).unwrap();
        let source = grid.point(6, 3);
        let window = tone_from(source, &geometry, 3750.0, 48000.0, 128 * 8);

        let levels = BaseBeamformer::new(128)
            .compute_level_map(&window, &geometry, &grid, 3750.0, 0)
            .unwrap();

        assert_eq!(levels.dim(), (9, 9));
        assert_eq!(argmax(&levels), (6, 3));
    }

    #[test]
    fn test_short_window_is_padded() {
        let geometry = MicGeometry::uma16();
        let grid = SteeringGrid::square(0.5, 1.0, 0.5).unwrap();
        let window = tone_from(grid.point(0, 0), &geometry, 3000.0, 48000.0, 40);

        let levels = BaseBeamformer::new(128)
            .compute_level_map(&window, &geometry, &grid, 3000.0, 3)
            .unwrap();
        assert!(levels.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_rejects_wrong_channels() {
        let geometry = MicGeometry::uma16();
        let grid = SteeringGrid::square(0.5, 1.0, 0.5).unwrap();
        let window = SampleWindow::new(Array2::zeros((256, 4)), 48000.0);
        let res = BaseBeamformer::new(128).compute_level_map(&window, &geometry, &grid, 1000.0, 3);
        assert!(matches!(res, Err(LocatorError::ChannelMismatch { .. })));
    }

    #[test]
    fn test_rejects_frequency_above_nyquist() {
        let geometry = MicGeometry::uma16();
        let grid = SteeringGrid::square(0.5, 1.0, 0.5).unwrap();
        let window = SampleWindow::new(Array2::zeros((256, 16)), 8000.0);
        let res = BaseBeamformer::new(128).compute_level_map(&window, &geometry, &grid, 4120.0, 3);
        assert!(matches!(res, Err(LocatorError::Config(_))));
    }
}
