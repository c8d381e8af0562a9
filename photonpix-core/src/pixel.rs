//! Numeric traits for frame pixels and pedestal accumulators.
#![allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]

use num_traits::{AsPrimitive, Float};
use std::fmt::Debug;

/// A raw pixel value as read from the detector.
///
/// Any primitive numeric type that converts into both floating accumulator
/// types qualifies (`u16` is the common detector format).
pub trait Pixel:
    Copy + Send + Sync + Debug + 'static + AsPrimitive<f32> + AsPrimitive<f64>
{
}

impl<T> Pixel for T where
    T: Copy + Send + Sync + Debug + 'static + AsPrimitive<f32> + AsPrimitive<f64>
{
}

/// Floating point type used to accumulate pedestal sums.
pub trait Accumulator: Float + Default + Send + Sync + Debug + 'static {
    /// Converts a raw pixel into the accumulation type.
    fn from_pixel<T: Pixel>(value: T) -> Self;

    /// Converts a sample count into the accumulation type.
    fn from_count(count: u32) -> Self;

    /// Converts a configuration value into the accumulation type.
    fn from_f64(value: f64) -> Self;

    /// Widens the value to `f64`.
    fn as_f64(self) -> f64;
}

impl Accumulator for f64 {
    #[inline]
    fn from_pixel<T: Pixel>(value: T) -> Self {
        AsPrimitive::<f64>::as_(value)
    }

    #[inline]
    fn from_count(count: u32) -> Self {
        f64::from(count)
    }

    #[inline]
    fn from_f64(value: f64) -> Self {
        value
    }

    #[inline]
    fn as_f64(self) -> f64 {
        self
    }
}

impl Accumulator for f32 {
    #[inline]
    fn from_pixel<T: Pixel>(value: T) -> Self {
        AsPrimitive::<f32>::as_(value)
    }

    #[inline]
    fn from_count(count: u32) -> Self {
        count as f32
    }

    #[inline]
    fn from_f64(value: f64) -> Self {
        value as f32
    }

    #[inline]
    fn as_f64(self) -> f64 {
        f64::from(self)
    }
}
