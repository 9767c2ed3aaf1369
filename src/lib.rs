//! AcousticLocator turns two microphone arrays into a sound source locator.
//! Each array, or station, sits at a known position. It accumulates audio
//! for a fixed interval, beamforms the accumulated window into a direction
//! toward the loudest source, and publishes that direction over MQTT. Once
//! directions from two stations are available, the two rays are
//! triangulated to the point where they pass closest to each other.
//!
//! The pieces, from the bottom up:
//!
//! - [`accumulator`] collects audio blocks into per-interval windows.
//! - [`estimator`] turns a window into a direction using a [`beamformer`]
//!   over a steering [`grid`].
//! - [`exchange`] publishes estimates and pairs up the ones it receives.
//! - [`localizer`] triangulates a pair of rays.
//! - [`controller`] runs the station loop that ties it all together.

#![warn(missing_docs)]
pub mod accumulator;
pub mod args;
pub mod audio;
pub mod beamformer;
pub mod component;
pub mod config;
pub mod controller;
pub mod error;
pub mod estimator;
pub mod exchange;
pub mod geometry;
pub mod grid;
pub mod localizer;
pub mod message;
pub mod recorder;
pub mod transport;

use nalgebra::Vector3;

/// Angles are carried around in radians.
pub type Radian = f64;

/// A point or vector in 3-D space, in meters where it is a position.
pub type Position = Vector3<f64>;

/// Stations identify themselves with a free-form string, the MQTT client id.
pub type StationId = String;

/// Converts a `[x, y, z]` triple, the way positions appear in configuration
/// files and on the wire, into a [`Position`].
pub fn position(xyz: [f64; 3]) -> Position {
    Position::new(xyz[0], xyz[1], xyz[2])
}

/// An iterator function that transposes the order of iteration based on
/// [this StackOverflow answer](https://stackoverflow.com/a/75477884/17443903).
/// Stops as soon as the shortest inner iterator runs out, and yields nothing
/// at all when there are no inner iterators.
pub struct TransposeIter<I, T>
where
    I: IntoIterator<Item = T>,
{
    iterators: Vec<I::IntoIter>,
}

#[allow(missing_docs)]
pub trait TransposableIter<I, T>
where
    Self: Sized,
    Self: IntoIterator<Item = I>,
    I: IntoIterator<Item = T>,
{
    fn transpose(self) -> TransposeIter<I, T> {
        let iterators: Vec<_> = self.into_iter().map(|i| i.into_iter()).collect();
        TransposeIter { iterators }
    }
}

impl<I, T> Iterator for TransposeIter<I, T>
where
    I: IntoIterator<Item = T>,
{
    type Item = Vec<T>;
    fn next(&mut self) -> Option<Self::Item> {
        if self.iterators.is_empty() {
            return None;
        }
        let output: Option<Vec<T>> = self.iterators.iter_mut().map(|iter| iter.next()).collect();
        output
    }
}

impl<I, T, Any> TransposableIter<I, T> for Any
where
    Any: IntoIterator<Item = I>,
    I: IntoIterator<Item = T>,
{
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transpose_channels_into_frames() {
        let channels = vec![vec![1, 2, 3], vec![4, 5, 6]];
        let frames: Vec<Vec<i32>> = channels.transpose().collect();
        assert_eq!(frames, vec![vec![1, 4], vec![2, 5], vec![3, 6]]);
    }

    #[test]
    fn transpose_nothing() {
        let channels: Vec<Vec<i32>> = vec![];
        assert_eq!(channels.transpose().count(), 0);
    }
}
