//! Cubic spline smoothing kernel with compact support.

use std::f64::consts::PI;

use crate::types::point::Real;

/// The M4 cubic spline, parameterized by its full support radius: the
/// kernel is zero at and beyond `support`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SplineKernel;

impl SplineKernel {
    /// Kernel value at separation `r`.
    pub fn evaluate(&self, r: Real, support: Real) -> Real {
        let q = r / support;
        let sigma = 8.0 / (PI * support * support * support);
        if q < 0.5 {
            sigma * (1.0 - 6.0 * q * q + 6.0 * q * q * q)
        } else if q < 1.0 {
            let w = 1.0 - q;
            sigma * 2.0 * w * w * w
        } else {
            0.0
        }
    }

    /// Radial derivative dW/dr at separation `r`; non-positive on the
    /// whole support.
    pub fn gradient(&self, r: Real, support: Real) -> Real {
        let q = r / support;
        let sigma = 8.0 / (PI * support * support * support);
        if q < 0.5 {
            sigma * (-12.0 * q + 18.0 * q * q) / support
        } else if q < 1.0 {
            let w = 1.0 - q;
            sigma * (-6.0 * w * w) / support
        } else {
            0.0
        }
    }
}
