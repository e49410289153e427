//! Point-spread-function models.

use crate::geom::{Point2, Quadrupole};

/// A position-dependent PSF model.
///
/// The measurement core only needs the local second-moment shape; richer
/// PSF machinery (realizations, kernels) lives with the host pipeline.
pub trait Psf: Send + Sync {
    /// Second-moment shape of the PSF evaluated at a position.
    fn compute_shape(&self, point: Point2) -> Quadrupole;
}

/// A circular Gaussian PSF with constant width across the field.
#[derive(Debug, Clone, Copy)]
pub struct GaussianPsf {
    sigma: f64,
}

impl GaussianPsf {
    /// Create a Gaussian PSF with the given standard deviation in pixels.
    pub fn new(sigma: f64) -> Self {
        Self { sigma }
    }

    /// The PSF width in pixels.
    pub fn sigma(&self) -> f64 {
        self.sigma
    }
}

impl Psf for GaussianPsf {
    fn compute_shape(&self, _point: Point2) -> Quadrupole {
        Quadrupole::new(self.sigma * self.sigma, self.sigma * self.sigma, 0.0)
    }
}
