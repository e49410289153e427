//! Source-measurement core for astronomical images.
//!
//! Given a 2-D image and an approximate position of a detected object,
//! this crate estimates the object's brightness and morphological shape:
//!
//! - **Aperture photometry** ([`aperture`]): flux within an elliptical
//!   region, summed naïvely for large apertures or with sinc-interpolated
//!   coefficient images ([`sinc`]) for sub-pixel accuracy on small ones.
//! - **Adaptive moments** ([`moments`]): an iterative elliptical-Gaussian
//!   fit yielding centroid, second moments, amplitude, and a propagated
//!   Fisher-matrix covariance.
//! - **PSF-scaled apertures** ([`scaled`]): sinc photometry in an aperture
//!   that tracks the local PSF width.
//!
//! Results are written through a small record/schema surface ([`table`]),
//! with upstream centroids and shapes resolved defensively ([`inputs`])
//! and instrumental fluxes converted to magnitudes by a final transform
//! pass ([`transform`]). All entry points are pure functions of their
//! inputs plus one process-wide cache of sinc coefficients; they may be
//! called concurrently for distinct sources.

pub mod algo;
pub mod aperture;
pub mod errors;
pub mod geom;
pub mod image;
pub mod inputs;
pub mod moments;
pub mod psf;
pub mod scaled;
pub mod sinc;
pub mod table;
pub mod transform;

pub use aperture::{
    compute_flux, compute_flux_masked, ApertureFluxAlgorithm, ApertureFluxConfig, ApertureResult,
};
pub use errors::MeasureError;
pub use geom::{Axes, Ellipse, PixelBox, Point2, Quadrupole};
pub use image::{Exposure, Image, ImageView, MaskedImage, Pixel};
pub use moments::{
    fit_adaptive_moments, fit_adaptive_moments_masked, fixed_moments_flux,
    fixed_moments_flux_masked, AdaptiveMomentsConfig, SdssShapeAlgorithm, ShapeResult,
};
pub use psf::{GaussianPsf, Psf};
pub use scaled::{compute_scaled_aperture_flux, ScaledApertureConfig, ScaledApertureFluxAlgorithm};
pub use table::{Footprint, Metadata, Peak, Record, Schema};
pub use transform::{ApertureFluxTransform, Calib, SimpleCalib};
