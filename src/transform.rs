//! Conversion of instrumental fluxes to calibrated magnitudes.

use crate::aperture::{make_field_prefix, ApertureFluxConfig};
use crate::errors::MeasureError;
use crate::table::{Record, Schema};

/// Photometric calibration consumed by the transform pass.
pub trait Calib {
    /// Convert an instrumental flux and its error to `(mag, mag_err)`.
    ///
    /// Non-positive fluxes convert to NaN rather than raising.
    fn magnitude(&self, inst_flux: f64, inst_flux_err: f64) -> (f64, f64);
}

/// A single-zero-point calibration.
#[derive(Debug, Clone, Copy)]
pub struct SimpleCalib {
    flux_mag0: f64,
}

impl SimpleCalib {
    /// Calibration with the instrumental flux of a zeroth-magnitude source.
    pub fn new(flux_mag0: f64) -> Self {
        Self { flux_mag0 }
    }
}

impl Calib for SimpleCalib {
    fn magnitude(&self, inst_flux: f64, inst_flux_err: f64) -> (f64, f64) {
        if !(inst_flux > 0.0) {
            return (f64::NAN, f64::NAN);
        }
        let mag = -2.5 * (inst_flux / self.flux_mag0).log10();
        let mag_err = 2.5 / std::f64::consts::LN_10 * (inst_flux_err / inst_flux);
        (mag, mag_err)
    }
}

/// Transform pass mapping every per-radius aperture flux to a magnitude.
///
/// Registers `"{prefix}_mag"` and `"{prefix}_magErr"` beside the flux
/// fields of an [`crate::aperture::ApertureFluxAlgorithm`] with the same
/// name and configuration.
pub struct ApertureFluxTransform {
    prefixes: Vec<String>,
}

impl ApertureFluxTransform {
    /// Register magnitude fields for every configured radius.
    pub fn new(
        ctrl: &ApertureFluxConfig,
        name: &str,
        schema: &mut Schema,
    ) -> Result<Self, MeasureError> {
        ctrl.validate()?;
        let mut prefixes = Vec::with_capacity(ctrl.radii.len());
        for &radius in &ctrl.radii {
            let prefix = make_field_prefix(name, radius);
            schema.add_double(
                &Schema::join(&[&prefix, "mag"]),
                &format!("magnitude within {radius}-pixel aperture"),
            )?;
            schema.add_double(
                &Schema::join(&[&prefix, "magErr"]),
                &format!("1-sigma uncertainty on the {radius}-pixel aperture magnitude"),
            )?;
            prefixes.push(prefix);
        }
        Ok(Self { prefixes })
    }

    /// Convert the fluxes of one record.
    pub fn apply(&self, record: &mut Record, calib: &dyn Calib) {
        for prefix in &self.prefixes {
            let inst_flux = record.get_double(&Schema::join(&[prefix, "instFlux"]));
            let inst_flux_err = record.get_double(&Schema::join(&[prefix, "instFluxErr"]));
            let (mag, mag_err) = calib.magnitude(inst_flux, inst_flux_err);
            record.set_double(&Schema::join(&[prefix, "mag"]), mag);
            record.set_double(&Schema::join(&[prefix, "magErr"]), mag_err);
        }
    }
}
