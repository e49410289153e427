//! PSF-scaled aperture photometry.
//!
//! Instead of a fixed radius, the aperture scales with the local PSF: the
//! determinant radius of the PSF shape at the source position sets the
//! FWHM, and the aperture is a circle of `scale · fwhm`. The flux itself
//! comes from the sinc estimator.

use serde::{Deserialize, Serialize};

use crate::aperture::{
    compute_sinc_flux_masked, ApertureFluxConfig, ApertureResult, APERTURE_FLUX_FLAG_DEFS,
    APERTURE_TRUNCATED, FAILURE, SINC_COEFFS_TRUNCATED,
};
use crate::errors::MeasureError;
use crate::geom::{Axes, Ellipse, Point2};
use crate::image::{Exposure, Pixel};
use crate::inputs::SafeCentroidExtractor;
use crate::table::{FlagHandler, Record, Schema};

/// Configuration of the PSF-scaled aperture flux.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaledApertureConfig {
    /// Aperture radius in units of the PSF FWHM.
    pub scale: f64,
    /// Interpolation kernel used to shift sinc coefficients sub-pixel.
    pub shift_kernel: String,
}

impl Default for ScaledApertureConfig {
    fn default() -> Self {
        Self {
            scale: 3.14,
            shift_kernel: "lanczos5".to_string(),
        }
    }
}

/// Sinc aperture flux within `scale · fwhm` of the PSF at `center`.
pub fn compute_scaled_aperture_flux<T: Pixel>(
    exposure: &Exposure<T>,
    cfg: &ScaledApertureConfig,
    center: Point2,
) -> Result<ApertureResult, MeasureError> {
    let psf = exposure.psf()?;
    let radius = psf.compute_shape(center).determinant_radius();
    let fwhm = 2.0 * (2.0 * 2.0f64.ln()).sqrt() * radius;
    let size = cfg.scale * fwhm;
    let axes = Axes::new(size, size, 0.0);

    // the sinc estimator only consults this config for its shift kernel
    let ap_cfg = ApertureFluxConfig {
        shift_kernel: cfg.shift_kernel.clone(),
        ..Default::default()
    };
    compute_sinc_flux_masked(
        exposure.masked_image(),
        &Ellipse::new(center, axes.to_quadrupole()),
        &ap_cfg,
    )
}

/// Schema-registered PSF-scaled aperture measurement.
pub struct ScaledApertureFluxAlgorithm {
    ctrl: ScaledApertureConfig,
    name: String,
    flags: FlagHandler,
    centroid_extractor: SafeCentroidExtractor,
}

impl ScaledApertureFluxAlgorithm {
    /// Register the flux fields and wire up inputs.
    pub fn new(
        ctrl: ScaledApertureConfig,
        name: &str,
        schema: &mut Schema,
    ) -> Result<Self, MeasureError> {
        schema.add_double(
            &Schema::join(&[name, "instFlux"]),
            "instFlux derived from PSF-scaled aperture",
        )?;
        schema.add_double(
            &Schema::join(&[name, "instFluxErr"]),
            "1-sigma uncertainty on the PSF-scaled aperture instFlux",
        )?;
        let flags = FlagHandler::add_fields(schema, name, APERTURE_FLUX_FLAG_DEFS)?;
        let centroid_extractor = SafeCentroidExtractor::new(schema, name, false)?;
        Ok(Self {
            ctrl,
            name: name.to_string(),
            flags,
            centroid_extractor,
        })
    }

    /// Measure one source and write the result.
    pub fn measure<T: Pixel>(
        &self,
        record: &mut Record,
        exposure: &Exposure<T>,
    ) -> Result<(), MeasureError> {
        let center = self.centroid_extractor.extract(record, &self.flags)?;
        let result = compute_scaled_aperture_flux(exposure, &self.ctrl, center)?;
        record.set_double(&Schema::join(&[&self.name, "instFlux"]), result.inst_flux);
        record.set_double(
            &Schema::join(&[&self.name, "instFluxErr"]),
            result.inst_flux_err,
        );
        if result.flags.failure {
            self.flags.set_value(record, FAILURE, true);
        }
        if result.flags.aperture_truncated {
            self.flags.set_value(record, APERTURE_TRUNCATED, true);
        }
        if result.flags.sinc_coeffs_truncated {
            self.flags.set_value(record, SINC_COEFFS_TRUNCATED, true);
        }
        Ok(())
    }

    /// Record a failure through the flag handler.
    pub fn fail(&self, record: &mut Record, error: Option<&MeasureError>) {
        self.flags.handle_failure(record, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Image, MaskedImage};
    use crate::psf::GaussianPsf;
    use ndarray::Array2;
    use std::f64::consts::PI;
    use std::sync::Arc;

    fn constant_exposure(size: usize, value: f64, sigma: f64) -> Exposure<f64> {
        let image = Image::from_array(Array2::from_elem((size, size), value), 0, 0);
        let mimage = MaskedImage::with_constant_variance(image, 1.0);
        Exposure::with_psf(mimage, Arc::new(GaussianPsf::new(sigma)))
    }

    #[test]
    fn test_scaled_aperture_tracks_psf_fwhm() {
        // sigma = 2 → fwhm ≈ 4.71; with scale 1 the aperture radius is the
        // fwhm and a constant unit image yields the aperture area.
        let exposure = constant_exposure(41, 1.0, 2.0);
        let cfg = ScaledApertureConfig {
            scale: 1.0,
            ..Default::default()
        };
        let result =
            compute_scaled_aperture_flux(&exposure, &cfg, Point2::new(20.0, 20.0)).unwrap();
        let fwhm = 2.0 * (2.0 * 2.0f64.ln()).sqrt() * 2.0;
        assert!(
            (result.inst_flux - PI * fwhm * fwhm).abs() < 0.2,
            "flux {} should match the π·fwhm² aperture area",
            result.inst_flux
        );
        assert!(!result.flags.failure);
    }

    #[test]
    fn test_missing_psf_is_runtime_error() {
        let image = Image::<f64>::zeros(21, 21, 0, 0);
        let exposure = Exposure::new(MaskedImage::with_constant_variance(image, 1.0));
        let cfg = ScaledApertureConfig::default();
        let err = compute_scaled_aperture_flux(&exposure, &cfg, Point2::new(10.0, 10.0))
            .unwrap_err();
        assert!(matches!(err, MeasureError::Runtime(_)));
    }

    #[test]
    fn test_scaled_algorithm_writes_record() {
        let mut schema = Schema::new();
        schema.add_double("ref_Centroid_x", "x").unwrap();
        schema.add_double("ref_Centroid_y", "y").unwrap();
        schema.add_flag("ref_Centroid_flag", "bad").unwrap();
        schema.define_centroid_slot("ref_Centroid");
        let ctrl = ScaledApertureConfig {
            scale: 1.0,
            ..Default::default()
        };
        let algorithm = ScaledApertureFluxAlgorithm::new(ctrl, "scaled", &mut schema).unwrap();
        let schema = Arc::new(schema);

        let mut record = Record::new(Arc::clone(&schema));
        record.set_double("ref_Centroid_x", 20.0);
        record.set_double("ref_Centroid_y", 20.0);

        let exposure = constant_exposure(41, 1.0, 2.0);
        algorithm.measure(&mut record, &exposure).unwrap();
        assert!(record.get_double("scaled_instFlux") > 0.0);
        assert!(record.get_double("scaled_instFluxErr") > 0.0);
        assert!(!record.get_flag("scaled_flag"));
    }
}
