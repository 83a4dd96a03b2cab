//! Numeric roles used by the kernels.
//!
//! Three precisions meet in one attention call: the storage type `S` of the
//! query and the cache, the accumulation type `A` used for scores, softmax
//! and sums, and the output type `O`. Kernels require `A: From<S>`, which only
//! holds for lossless widenings (`f16`/`bf16` -> `f32`/`f64`, `f32` -> `f64`),
//! so intermediate precision can never drop below storage precision.

use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Sub};

use half::{bf16, f16};

use crate::types::DType;

/// A value that can live in a query, cache, partial or output buffer.
pub trait Element: Copy + Default + PartialEq + Send + Sync + fmt::Debug + 'static {
    const DTYPE: DType;

    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;
}

/// Floating-point type used for accumulation and softmax statistics.
pub trait Accumulator:
    Element
    + PartialOrd
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + AddAssign
{
    const ZERO: Self;
    const ONE: Self;
    const NEG_INFINITY: Self;

    fn exp(self) -> Self;
    fn ln(self) -> Self;
    fn max(self, other: Self) -> Self;

    /// Round to an output precision.
    #[inline]
    fn narrow<E: Element>(self) -> E {
        E::from_f64(self.to_f64())
    }
}

macro_rules! impl_float {
    ($t:ty, $dtype:expr) => {
        impl Element for $t {
            const DTYPE: DType = $dtype;

            #[inline]
            fn from_f64(v: f64) -> Self {
                v as $t
            }

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }
        }

        impl Accumulator for $t {
            const ZERO: Self = 0.0;
            const ONE: Self = 1.0;
            const NEG_INFINITY: Self = <$t>::NEG_INFINITY;

            #[inline]
            fn exp(self) -> Self {
                <$t>::exp(self)
            }

            #[inline]
            fn ln(self) -> Self {
                <$t>::ln(self)
            }

            #[inline]
            fn max(self, other: Self) -> Self {
                <$t>::max(self, other)
            }
        }
    };
}

impl_float!(f32, DType::F32);
impl_float!(f64, DType::F64);

impl Element for f16 {
    const DTYPE: DType = DType::F16;

    #[inline]
    fn from_f64(v: f64) -> Self {
        f16::from_f64(v)
    }

    #[inline]
    fn to_f64(self) -> f64 {
        f16::to_f64(self)
    }
}

impl Element for bf16 {
    const DTYPE: DType = DType::BF16;

    #[inline]
    fn from_f64(v: f64) -> Self {
        bf16::from_f64(v)
    }

    #[inline]
    fn to_f64(self) -> f64 {
        bf16::to_f64(self)
    }
}
