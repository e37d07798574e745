//! Scalar trait hierarchy for tile computations
//!
//! This module provides the type foundation shared by the kernels and the
//! pipeline: real and complex element types that can be moved over the
//! transport as plain bytes.
//!
//! # Design Philosophy
//!
//! - **Pure type constraints**: Defines relationships between numeric types
//! - **Wire-safe**: Every scalar is `Pod`, so tiles cast to bytes without copies
//! - **Complex-aware**: Conjugation and the LAPACK-style `|re| + |im|` magnitude
//!   are part of the trait, so transposed views and pivot search stay generic

use bytemuck::Pod;
use num_complex::Complex;
use num_traits::{Float, NumAssign, ToPrimitive};
use std::fmt::Debug;
use std::ops::Neg;

/// Element type of a tiled matrix
pub trait Scalar:
    Pod + NumAssign + Neg<Output = Self> + Copy + PartialEq + Debug + Send + Sync + 'static
{
    /// Underlying real type (magnitudes, tolerances)
    type Real: Float + Pod + Debug + Send + Sync + 'static;

    /// Whether conjugation is a no-op
    const IS_COMPLEX: bool;

    /// Complex conjugate (identity for real types)
    fn conj(self) -> Self;

    /// Cheap magnitude `|re| + |im|` used for pivot selection
    fn abs1(self) -> Self::Real;

    /// Euclidean magnitude
    fn modulus(self) -> Self::Real;

    /// Embed a real value
    fn from_real(value: Self::Real) -> Self;

    /// Convert from f64 (for creating constants)
    fn from_f64(value: f64) -> Self;

    /// Machine epsilon of the underlying real type
    fn epsilon() -> Self::Real {
        <Self::Real as Float>::epsilon()
    }

    /// Magnitude as f64, for norms and diagnostics
    fn magnitude_f64(self) -> f64 {
        self.modulus().to_f64().unwrap_or(f64::NAN)
    }
}

impl Scalar for f64 {
    type Real = f64;
    const IS_COMPLEX: bool = false;

    fn conj(self) -> Self {
        self
    }

    fn abs1(self) -> f64 {
        self.abs()
    }

    fn modulus(self) -> f64 {
        self.abs()
    }

    fn from_real(value: f64) -> Self {
        value
    }

    fn from_f64(value: f64) -> Self {
        value
    }
}

impl Scalar for f32 {
    type Real = f32;
    const IS_COMPLEX: bool = false;

    fn conj(self) -> Self {
        self
    }

    fn abs1(self) -> f32 {
        self.abs()
    }

    fn modulus(self) -> f32 {
        self.abs()
    }

    fn from_real(value: f32) -> Self {
        value
    }

    fn from_f64(value: f64) -> Self {
        value as f32
    }
}

impl Scalar for Complex<f64> {
    type Real = f64;
    const IS_COMPLEX: bool = true;

    fn conj(self) -> Self {
        Complex::conj(&self)
    }

    fn abs1(self) -> f64 {
        self.re.abs() + self.im.abs()
    }

    fn modulus(self) -> f64 {
        self.norm()
    }

    fn from_real(value: f64) -> Self {
        Complex::new(value, 0.0)
    }

    fn from_f64(value: f64) -> Self {
        Complex::new(value, 0.0)
    }
}

impl Scalar for Complex<f32> {
    type Real = f32;
    const IS_COMPLEX: bool = true;

    fn conj(self) -> Self {
        Complex::conj(&self)
    }

    fn abs1(self) -> f32 {
        self.re.abs() + self.im.abs()
    }

    fn modulus(self) -> f32 {
        self.norm()
    }

    fn from_real(value: f32) -> Self {
        Complex::new(value, 0.0)
    }

    fn from_f64(value: f64) -> Self {
        Complex::new(value as f32, 0.0)
    }
}
