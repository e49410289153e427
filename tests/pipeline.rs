//! End-to-end measurement over the record plumbing: schema registration,
//! upstream centroid resolution, aperture and shape measurement, and the
//! magnitude transform pass.

use std::sync::Arc;

use approx::{assert_abs_diff_eq, assert_relative_eq};
use ndarray::Array2;

use starphot::aperture::ApertureFluxAlgorithm;
use starphot::moments::SdssShapeAlgorithm;
use starphot::{
    AdaptiveMomentsConfig, ApertureFluxConfig, ApertureFluxTransform, Footprint, Image,
    MaskedImage, Metadata, Peak, Quadrupole, Record, Schema, SimpleCalib,
};

// Render an elliptical Gaussian on a flat background.
fn gaussian_scene(
    size: usize,
    cx: f64,
    cy: f64,
    shape: Quadrupole,
    amplitude: f64,
) -> MaskedImage<f64> {
    let (w11, w12, w22) = shape.inverse().expect("scene shape must be invertible");
    let mut data = Array2::<f64>::zeros((size, size));
    for ((r, c), v) in data.indexed_iter_mut() {
        let dx = c as f64 - cx;
        let dy = r as f64 - cy;
        let q = w11 * dx * dx + 2.0 * w12 * dx * dy + w22 * dy * dy;
        *v = amplitude * (-0.5 * q).exp();
    }
    MaskedImage::with_constant_variance(Image::from_array(data, 0, 0), 1.0)
}

fn build_schema() -> (Schema, Metadata, ApertureFluxAlgorithm, SdssShapeAlgorithm, ApertureFluxTransform)
{
    let mut schema = Schema::new();
    schema
        .add_double("base_Centroid_x", "upstream centroid column")
        .unwrap();
    schema
        .add_double("base_Centroid_y", "upstream centroid row")
        .unwrap();
    schema
        .add_flag("base_Centroid_flag", "upstream centroid failed")
        .unwrap();
    schema.define_centroid_slot("base_Centroid");

    let mut metadata = Metadata::new();
    let ap_ctrl = ApertureFluxConfig {
        radii: vec![3.0, 6.0],
        ..Default::default()
    };
    let apertures =
        ApertureFluxAlgorithm::new(ap_ctrl.clone(), "ap", &mut schema, &mut metadata).unwrap();
    let shapes =
        SdssShapeAlgorithm::new(AdaptiveMomentsConfig::default(), "shape", &mut schema).unwrap();
    let transform = ApertureFluxTransform::new(&ap_ctrl, "ap", &mut schema).unwrap();
    (schema, metadata, apertures, shapes, transform)
}

#[test]
fn test_full_measurement_pass() {
    let (schema, metadata, apertures, shapes, transform) = build_schema();
    assert_eq!(metadata.get("ap_radii"), Some(&[3.0, 6.0][..]));
    let schema = Arc::new(schema);

    let scene = gaussian_scene(61, 30.0, 30.0, Quadrupole::new(3.0, 2.0, 0.5), 1000.0);
    let mut record = Record::new(Arc::clone(&schema));
    record.set_double("base_Centroid_x", 30.0);
    record.set_double("base_Centroid_y", 30.0);

    apertures.measure(&mut record, &scene).unwrap();
    shapes.measure(&mut record, &scene).unwrap();
    transform.apply(&mut record, &SimpleCalib::new(1e10));

    // aperture fluxes grow with radius toward the total Gaussian flux
    let flux3 = record.get_double("ap_3_0_instFlux");
    let flux6 = record.get_double("ap_6_0_instFlux");
    assert!(flux3 > 0.0 && flux6 > flux3);
    assert!(record.get_double("ap_3_0_instFluxErr") > 0.0);
    assert!(!record.get_flag("ap_3_0_flag"));
    assert!(!record.get_flag("ap_6_0_flag"));

    // shape recovered in parent coordinates with a usable covariance
    assert_abs_diff_eq!(record.get_double("shape_x"), 30.0, epsilon = 1e-4);
    assert_abs_diff_eq!(record.get_double("shape_xx"), 3.0, epsilon = 1e-3);
    assert_abs_diff_eq!(record.get_double("shape_yy"), 2.0, epsilon = 1e-3);
    assert_abs_diff_eq!(record.get_double("shape_xy"), 0.5, epsilon = 1e-3);
    assert!(record.get_double("shape_xxSigma") > 0.0);
    assert!(!record.get_flag("shape_flag"));

    // the transform pass emitted magnitudes consistent with the fluxes
    let mag3 = record.get_double("ap_3_0_mag");
    assert_relative_eq!(mag3, -2.5 * (flux3 / 1e10).log10(), epsilon = 1e-10);
    assert!(record.get_double("ap_3_0_magErr") > 0.0);
}

#[test]
fn test_nan_centroid_uses_peak_and_flags_failure() {
    let (schema, _, apertures, _, _) = build_schema();
    let schema = Arc::new(schema);

    let scene = gaussian_scene(61, 32.0, 28.0, Quadrupole::new(2.0, 2.0, 0.0), 500.0);
    let mut record = Record::new(Arc::clone(&schema));
    record.set_double("base_Centroid_x", f64::NAN);
    record.set_double("base_Centroid_y", f64::NAN);
    record.set_flag("base_Centroid_flag", true);
    record.set_footprint(Footprint::new(vec![Peak { fx: 32.0, fy: 28.0 }]));

    apertures.measure(&mut record, &scene).unwrap();

    // the peak fallback measured something, but the general flag is raised
    assert!(record.get_double("ap_3_0_instFlux") > 0.0);
    assert!(record.get_flag("ap_3_0_flag"));
}

#[test]
fn test_edge_source_truncation_flags_per_radius() {
    let (schema, _, apertures, _, _) = build_schema();
    let schema = Arc::new(schema);

    // close enough to the edge that the r=6 coefficient image clips
    let scene = gaussian_scene(61, 9.0, 30.0, Quadrupole::new(2.0, 2.0, 0.0), 500.0);
    let mut record = Record::new(Arc::clone(&schema));
    record.set_double("base_Centroid_x", 9.0);
    record.set_double("base_Centroid_y", 30.0);

    apertures.measure(&mut record, &scene).unwrap();

    // the skirt clip is survivable for both radii, fatal for neither
    assert!(record.get_flag("ap_6_0_flag_sincCoeffsTruncated"));
    assert!(!record.get_flag("ap_6_0_flag_apertureTruncated"));
    assert!(!record.get_flag("ap_6_0_flag"));
    assert!(record.get_double("ap_6_0_instFlux").is_finite());
}

#[test]
fn test_unexpected_failure_routes_through_fail() {
    let (schema, _, apertures, shapes, _) = build_schema();
    let schema = Arc::new(schema);
    let mut record = Record::new(Arc::clone(&schema));

    apertures.fail(&mut record, None);
    shapes.fail(&mut record, None);

    assert!(record.get_flag("ap_3_0_flag"));
    assert!(record.get_flag("ap_6_0_flag"));
    assert!(record.get_flag("shape_flag"));
}
