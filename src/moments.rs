//! Adaptive elliptical-Gaussian moment fitting.
//!
//! The solver finds a Gaussian weight `W(x,y) = exp(−q/2)` whose second
//! moments match those of the weighted image: starting from a round weight,
//! each iteration measures the weighted object moments, compares them to
//! the weight, and updates the weight through the Gaussian-product rule
//! (inverse covariances add). The fixed point delivers the centroid, the
//! three second moments, the Gaussian amplitude, and — when a background
//! variance is available — a Fisher-matrix covariance for all four.
//!
//! Degeneracies are survived, not raised: a weight matrix collapsing to a
//! line is inflated by the single-pixel moment, a diverging iteration
//! falls back to unweighted moments (`unweighted` flag), and an object
//! too small even for that is assigned the single-pixel shape
//! (`unweighted_bad`). Only numerical precondition violations in the
//! Fisher computation raise, and the measurement entry points downgrade
//! those to the general failure flag.

use std::f64::consts::PI;

use nalgebra::Matrix4;
use num_traits::AsPrimitive;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::algo::LookupTable;
use crate::errors::MeasureError;
use crate::geom::{PixelBox, Quadrupole};
use crate::image::{Image, MaskedImage, Pixel};
use crate::inputs::SafeCentroidExtractor;
use crate::table::{FlagDefinition, FlagHandler, Record, Schema};

/// Hard cap on the moments search radius, pixels.
pub const MAX_MOMENTS_RADIUS: f64 = 1000.0;

/// Index of the general failure flag.
pub const SHAPE_FAILURE: usize = 0;
/// Index of the unweighted-bad flag.
pub const UNWEIGHTED_BAD: usize = 1;
/// Index of the unweighted-fallback flag.
pub const UNWEIGHTED: usize = 2;
/// Index of the centroid-shift flag.
pub const SHIFT: usize = 3;
/// Index of the iteration-limit flag.
pub const MAXITER: usize = 4;

/// Flag definitions for the adaptive-moments measurement.
pub const SDSS_SHAPE_FLAG_DEFS: &[FlagDefinition] = &[
    FlagDefinition {
        name: "flag",
        doc: "general failure flag, set if anything went wrong",
    },
    FlagDefinition {
        name: "flag_unweightedBad",
        doc: "both weighted and unweighted moments were invalid",
    },
    FlagDefinition {
        name: "flag_unweighted",
        doc: "weighted moments converged to an invalid value; using unweighted moments",
    },
    FlagDefinition {
        name: "flag_shift",
        doc: "centroid shifted by more than the maximum allowed amount",
    },
    FlagDefinition {
        name: "flag_maxIter",
        doc: "too many iterations in adaptive moments",
    },
];

/// Configuration of the adaptive-moments solver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveMomentsConfig {
    /// Baseline subtracted from every pixel.
    pub background: f64,
    /// Iteration cap.
    pub max_iter: usize,
    /// Convergence tolerance on the ellipticity components.
    pub tol1: f64,
    /// Convergence tolerance on the fractional second-moment change.
    pub tol2: f64,
    /// Maximum allowed centroid drift in pixels; clamped to [2, 10] at use.
    pub max_shift: f64,
}

impl Default for AdaptiveMomentsConfig {
    fn default() -> Self {
        Self {
            background: 0.0,
            max_iter: 100,
            tol1: 1e-5,
            tol2: 1e-4,
            max_shift: 10.0,
        }
    }
}

impl AdaptiveMomentsConfig {
    /// Reject configurations the solver cannot honor.
    pub fn validate(&self) -> Result<(), MeasureError> {
        if self.max_iter == 0 {
            return Err(MeasureError::Logic("max_iter must be positive".into()));
        }
        if !(self.tol1 > 0.0) || !(self.tol2 > 0.0) {
            return Err(MeasureError::Logic(
                "convergence tolerances must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Partial-failure flags of one shape measurement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeFlags {
    /// Set when no usable shape was measured or an inner error occurred.
    pub failure: bool,
    /// Both weighted and unweighted moments were invalid.
    pub unweighted_bad: bool,
    /// The weighted fit diverged; unweighted moments were used instead.
    pub unweighted: bool,
    /// The centroid drifted further than allowed from its input position.
    pub shift: bool,
    /// The iteration cap was reached without convergence.
    pub maxiter: bool,
}

/// Result of an adaptive-moments fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShapeResult {
    /// Centroid column, parent coordinates.
    pub x: f64,
    /// Centroid row, parent coordinates.
    pub y: f64,
    /// Second moment in x.
    pub ixx: f64,
    /// Second moment in y.
    pub iyy: f64,
    /// Cross moment.
    pub ixy: f64,
    /// Amplitude of the fitted Gaussian.
    pub i0: f64,
    /// Fourth-order weighted moment used by shear estimators.
    pub ixy4: f64,
    /// Covariance of `(i0, ixx, iyy, ixy)`; NaN entries when unavailable.
    pub covariance: [[f64; 4]; 4],
    /// Partial-failure flags.
    pub flags: ShapeFlags,
}

impl Default for ShapeResult {
    fn default() -> Self {
        Self {
            x: f64::NAN,
            y: f64::NAN,
            ixx: f64::NAN,
            iyy: f64::NAN,
            ixy: f64::NAN,
            i0: f64::NAN,
            ixy4: f64::NAN,
            covariance: [[f64::NAN; 4]; 4],
            flags: ShapeFlags::default(),
        }
    }
}

impl ShapeResult {
    /// The fitted second moments as an ellipse core.
    pub fn quadrupole(&self) -> Quadrupole {
        Quadrupole::new(self.ixx, self.iyy, self.ixy)
    }
}

/// Evaluator of `e^x` over the weight-exponent domain.
///
/// The default implementation is a lookup table; precision-sensitive
/// callers can substitute [`LibmExp`]. The solver tolerances assume a
/// relative accuracy of at least 1e-3.
pub trait Exponential: Send + Sync {
    /// `e^x` for `x` in the weight domain `[-7.5, 0.5]`.
    fn eval(&self, x: f64) -> f64;
}

/// Table-backed exponential (quadratic interpolation, ~1e-9 relative).
#[derive(Debug, Clone)]
pub struct TabulatedExp {
    table: LookupTable,
}

impl TabulatedExp {
    /// Build the table over the weight-exponent domain.
    pub fn new() -> Self {
        Self {
            table: LookupTable::new(-7.5, 0.5, 4096, |x| x.exp()),
        }
    }
}

impl Default for TabulatedExp {
    fn default() -> Self {
        Self::new()
    }
}

impl Exponential for TabulatedExp {
    fn eval(&self, x: f64) -> f64 {
        self.table.eval_clamped(x)
    }
}

/// Library exponential, for precision-sensitive callers.
#[derive(Debug, Clone, Copy, Default)]
pub struct LibmExp;

impl Exponential for LibmExp {
    fn eval(&self, x: f64) -> f64 {
        x.exp()
    }
}

static DEFAULT_EXP: Lazy<TabulatedExp> = Lazy::new(TabulatedExp::new);

/// Inverse of a moments matrix, with validity and determinant attached.
///
/// `ok` is primary: every numeric field is unspecified when it is false.
#[derive(Debug, Clone, Copy)]
pub struct Weights {
    /// True when the inversion produced usable weights.
    pub ok: bool,
    /// Determinant of the (possibly inflated) moments matrix.
    pub det: f64,
    /// Inverse matrix element (1,1).
    pub w11: f64,
    /// Inverse matrix element (1,2).
    pub w12: f64,
    /// Inverse matrix element (2,2).
    pub w22: f64,
}

impl Weights {
    fn invalid(det: f64) -> Self {
        Self {
            ok: false,
            det,
            w11: f64::NAN,
            w12: f64::NAN,
            w22: f64::NAN,
        }
    }
}

/// Invert a moments matrix `(s11, s12, s22)`.
///
/// NaN inputs and (without `careful`) near-singular matrices return an
/// invalid result rather than propagating. With `careful`, a
/// near-singular matrix — e.g. an object that is zero except on a line —
/// is inflated by adding the single-pixel moment 1/12 in quadrature to
/// its principal axes before inverting, keeping second-moment consumers
/// robust.
pub fn get_weights(s11: f64, s12: f64, s22: f64, careful: bool) -> Weights {
    if s11.is_nan() || s12.is_nan() || s22.is_nan() {
        return Weights::invalid(f64::NAN);
    }
    let det = s11 * s22 - s12 * s12;
    if det.is_nan() || det < f32::EPSILON as f64 {
        if !careful {
            return Weights::invalid(det);
        }
        let i_min = 1.0 / 12.0; // 2nd moment of a single pixel
        let mut axes = Quadrupole::new(s11, s22, s12).to_axes();
        axes.a = (axes.a * axes.a + i_min).sqrt();
        axes.b = (axes.b * axes.b + i_min).sqrt();
        let inflated = axes.to_quadrupole();
        return match inflated.inverse() {
            Some((w11, w12, w22)) => Weights {
                ok: true,
                det: inflated.determinant(),
                w11,
                w12,
                w22,
            },
            None => Weights::invalid(det),
        };
    }
    Weights {
        ok: true,
        det,
        w11: s22 / det,
        w12: -s12 / det,
        w22: s11 / det,
    }
}

/// True when the weight is narrow enough to need sub-pixel interpolation.
fn should_interp(s11: f64, s22: f64, det: f64) -> bool {
    const XINTERP: f64 = 0.25; // (0.5)²
    s11 < XINTERP || s22 < XINTERP || det < XINTERP * XINTERP
}

// Search box for the moment sums: centered on the object, half-width four
// times the largest weight sigma, clamped to the image and to MAX_MOMENTS_RADIUS.
fn moments_bbox(
    width: usize,
    height: usize,
    xcen: f64,
    ycen: f64,
    s11: f64,
    s22: f64,
    max_rad: f64,
) -> PixelBox {
    let rad = (4.0 * s11.max(s22).sqrt()).min(max_rad);
    // casts truncate toward zero before clamping
    let mut ix0 = (xcen - rad - 0.5) as i32;
    if ix0 < 0 {
        ix0 = 0;
    }
    let mut iy0 = (ycen - rad - 0.5) as i32;
    if iy0 < 0 {
        iy0 = 0;
    }
    let mut ix1 = (xcen + rad + 0.5) as i32;
    if ix1 >= width as i32 {
        ix1 = width as i32 - 1;
    }
    let mut iy1 = (ycen + rad + 0.5) as i32;
    if iy1 >= height as i32 {
        iy1 = height as i32 - 1;
    }
    PixelBox::new(ix0, iy0, ix1, iy1)
}

#[derive(Debug, Clone, Copy, Default)]
struct MomentSums {
    i0: f64,
    sum: f64,
    sumx: f64,
    sumy: f64,
    sumxx: f64,
    sumxy: f64,
    sumyy: f64,
    sums4: f64,
}

impl MomentSums {
    fn usable(&self, flux_only: bool) -> bool {
        flux_only || (self.sum > 0.0 && self.sumxx > 0.0 && self.sumyy > 0.0)
    }
}

// Weighted moments of an object up to 2nd order over `bbox` (image-local,
// inclusive). Returns None when the weights are unusably large or the box
// leaves the image. With `interp`, every pixel is subdivided into a 4×4
// grid at offsets ±0.375, ±0.125 and the sums accumulate unnormalized
// over the finer grid.
#[allow(clippy::too_many_arguments)]
fn calc_moments<T: Pixel>(
    image: &Image<T>,
    xcen: f64,
    ycen: f64,
    bbox: &PixelBox,
    bkgd: f64,
    interp: bool,
    w11: f64,
    w12: f64,
    w22: f64,
    flux_only: bool,
    exp: &dyn Exponential,
) -> Option<MomentSums> {
    if w11.abs() > 1e6 || w12.abs() > 1e6 || w22.abs() > 1e6 {
        return None;
    }
    let width = image.width() as i32;
    let height = image.height() as i32;
    if bbox.min_x < 0 || bbox.max_x >= width || bbox.min_y < 0 || bbox.max_y >= height {
        return None;
    }
    let data = image.array();
    let mut s = MomentSums::default();
    for i in bbox.min_y..=bbox.max_y {
        let y = i as f64 - ycen;
        let y2 = y * y;
        let yl = y - 0.375;
        let yh = y + 0.375;
        for j in bbox.min_x..=bbox.max_x {
            let x = j as f64 - xcen;
            let pix: f64 = data[[i as usize, j as usize]].as_();
            if interp {
                let xl = x - 0.375;
                let xh = x + 0.375;
                // the worst corner of the sub-pixel grid decides the cutoff
                let mut expon = xl * xl * w11 + yl * yl * w22 + 2.0 * xl * yl * w12;
                expon = expon.max(xh * xh * w11 + yh * yh * w22 + 2.0 * xh * yh * w12);
                expon = expon.max(xl * xl * w11 + yh * yh * w22 + 2.0 * xl * yh * w12);
                expon = expon.max(xh * xh * w11 + yl * yl * w22 + 2.0 * xh * yl * w12);
                if expon <= 9.0 {
                    let tmod = pix - bkgd;
                    for ky in 0..4 {
                        let sub_y = yl + 0.25 * ky as f64;
                        let sub_y2 = sub_y * sub_y;
                        for kx in 0..4 {
                            let sub_x = xl + 0.25 * kx as f64;
                            let sub_x2 = sub_x * sub_x;
                            let sub_xy = sub_x * sub_y;
                            let q = sub_x2 * w11 + 2.0 * sub_xy * w12 + sub_y2 * w22;
                            let weight = exp.eval(-0.5 * q);
                            let ymod = tmod * weight;
                            s.sum += ymod;
                            if !flux_only {
                                s.sumx += ymod * (sub_x + xcen);
                                s.sumy += ymod * (sub_y + ycen);
                                s.sumxx += sub_x2 * ymod;
                                s.sumxy += sub_xy * ymod;
                                s.sumyy += sub_y2 * ymod;
                                s.sums4 += q * q * ymod;
                            }
                        }
                    }
                }
            } else {
                let x2 = x * x;
                let xy = x * y;
                let q = x2 * w11 + 2.0 * xy * w12 + y2 * w22;
                if q <= 14.0 {
                    let weight = exp.eval(-0.5 * q);
                    let ymod = (pix - bkgd) * weight;
                    s.sum += ymod;
                    if !flux_only {
                        s.sumx += ymod * j as f64;
                        s.sumy += ymod * i as f64;
                        s.sumxx += x2 * ymod;
                        s.sumxy += xy * ymod;
                        s.sumyy += y2 * ymod;
                        s.sums4 += q * q * ymod;
                    }
                }
            }
        }
    }
    // amplitude of the fit, normalized by the weight's own determinant
    let weights = get_weights(w11, w12, w22, true);
    let det_w = weights.w11 * weights.w22 - weights.w12 * weights.w12;
    s.i0 = s.sum / (PI * det_w.sqrt());
    Some(s)
}

// Fisher information for the least-squares Gaussian fit, computed
// analytically from the best-fit parameters (the second-derivative terms
// are ignored). Parameter order is (A, s11, s22, s12).
fn calc_fisher(
    a: f64,
    s11: f64,
    s22: f64,
    s12: f64,
    bkgd_var: f64,
) -> Result<Matrix4<f64>, MeasureError> {
    let d = s11 * s22 - s12 * s12;
    if d <= f64::EPSILON {
        return Err(MeasureError::Domain(
            "determinant is too small calculating Fisher matrix".into(),
        ));
    }
    if bkgd_var <= 0.0 {
        return Err(MeasureError::Domain(format!(
            "background variance must be positive (saw {bkgd_var})"
        )));
    }
    let f = PI * d.sqrt() / bkgd_var;
    let mut m = Matrix4::zeros();
    m[(0, 0)] = f;

    let fac = f * a / (4.0 * d);
    m[(0, 1)] = fac * s22;
    m[(0, 2)] = fac * s11;
    m[(0, 3)] = -fac * 2.0 * s12;

    let fac = 3.0 * f * a * a / (16.0 * d * d);
    m[(1, 1)] = fac * s22 * s22;
    m[(2, 2)] = fac * s11 * s11;
    m[(3, 3)] = fac * 4.0 * (s12 * s12 + d / 3.0);
    m[(1, 2)] = m[(3, 3)] / 4.0;
    m[(1, 3)] = fac * (-2.0 * s22 * s12);
    m[(2, 3)] = fac * (-2.0 * s11 * s12);

    for r in 0..4 {
        for c in 0..r {
            m[(r, c)] = m[(c, r)];
        }
    }
    Ok(m)
}

// The iterative solver, in image-local coordinates. Fills `result` as far
// as it gets; Fisher domain errors propagate for the caller to downgrade.
#[allow(clippy::too_many_arguments)]
fn get_adaptive_moments<T: Pixel>(
    image: &Image<T>,
    variance_at: &dyn Fn(i32, i32) -> f64,
    bkgd: f64,
    xcen: f64,
    ycen: f64,
    shiftmax: f64,
    max_iter: usize,
    tol1: f64,
    tol2: f64,
    exp: &dyn Exponential,
    result: &mut ShapeResult,
) -> Result<(), MeasureError> {
    if xcen.is_nan() || ycen.is_nan() {
        result.flags.unweighted_bad = true;
        return Ok(());
    }
    let width = image.width();
    let height = image.height();

    // weighting function moments and their inverse
    let mut sigma11_w = 1.5f64;
    let mut sigma12_w = 0.0f64;
    let mut sigma22_w = 1.5f64;
    let (mut w11, mut w12, mut w22) = (-1.0f64, -1.0f64, -1.0f64);

    let mut e1_old = 1e6f64;
    let mut e2_old = 1e6f64;
    let mut sigma11_ow_old = 1e6f64;
    let mut interpflag = false;
    let mut bbox = PixelBox::empty();
    let mut sums = MomentSums::default();

    let max_iter = max_iter as i64;
    let mut iter: i64 = 0;
    while iter < max_iter {
        bbox = moments_bbox(
            width,
            height,
            xcen,
            ycen,
            sigma11_w,
            sigma22_w,
            MAX_MOMENTS_RADIUS,
        );
        let weights = get_weights(sigma11_w, sigma12_w, sigma22_w, true);
        if !weights.ok {
            result.flags.unweighted = true;
            break;
        }
        let det_w = weights.det;

        let (ow11, ow12, ow22) = (w11, w12, w22);
        w11 = weights.w11;
        w12 = weights.w12;
        w22 = weights.w22;
        if should_interp(sigma11_w, sigma22_w, det_w) && !interpflag {
            interpflag = true; // stays set for this object
            if iter > 0 {
                // the weights were not updated; force at least one more pass
                sigma11_ow_old = 1e6;
                w11 = ow11;
                w12 = ow12;
                w22 = ow22;
                iter -= 1;
            }
        }

        let Some(s) = calc_moments(
            image, xcen, ycen, &bbox, bkgd, interpflag, w11, w12, w22, false, exp,
        ) else {
            result.flags.unweighted = true;
            break;
        };
        sums = s;
        if sums.sum != 0.0 {
            result.x = sums.sumx / sums.sum;
            result.y = sums.sumy / sums.sum;
        }
        if !sums.usable(false) {
            result.flags.unweighted = true;
            break;
        }
        if (result.x - xcen).abs() > shiftmax || (result.y - ycen).abs() > shiftmax {
            result.flags.shift = true;
        }

        // second moments of weight·object
        let sigma11_ow = sums.sumxx / sums.sum;
        let sigma22_ow = sums.sumyy / sums.sum;
        let sigma12_ow = sums.sumxy / sums.sum;
        if sigma11_ow <= 0.0 || sigma22_ow <= 0.0 {
            result.flags.unweighted = true;
            break;
        }

        let d = sigma11_ow + sigma22_ow;
        let e1 = (sigma11_ow - sigma22_ow) / d;
        let e2 = 2.0 * sigma12_ow / d;
        if iter > 0
            && (e1 - e1_old).abs() < tol1
            && (e2 - e2_old).abs() < tol1
            && (sigma11_ow / sigma11_ow_old - 1.0).abs() < tol2
        {
            break; // converged
        }
        e1_old = e1;
        e2_old = e2;
        sigma11_ow_old = sigma11_ow;

        // The product of two Gaussians is a Gaussian and the inverses of
        // their covariance matrices add, so the object's covariance is
        // estimated as sigma_ow⁻¹ − sigma_w⁻¹, and the next weight takes
        // that covariance. This assumes the object is roughly Gaussian;
        // when the assumption fails (e.g. a pair of deltas) the second
        // inversion fails and the unweighted fallback takes over.
        let ow = get_weights(sigma11_ow, sigma12_ow, sigma22_ow, true);
        if !ow.ok {
            result.flags.unweighted = true;
            break;
        }
        let n11 = ow.w11 - w11;
        let n12 = ow.w12 - w12;
        let n22 = ow.w22 - w22;
        let next = get_weights(n11, n12, n22, false);
        if !next.ok {
            result.flags.unweighted = true;
            break;
        }
        sigma11_w = next.w11;
        sigma12_w = next.w12;
        sigma22_w = next.w22;
        if sigma11_w <= 0.0 || sigma22_w <= 0.0 {
            result.flags.unweighted = true;
            break;
        }
        iter += 1;
    }

    if iter >= max_iter {
        result.flags.unweighted = true;
        result.flags.maxiter = true;
    }
    if sums.sumxx + sums.sumyy == 0.0 {
        result.flags.unweighted = true;
    }

    if result.flags.unweighted {
        // weighted moments were unusable; retry without weighting
        let fallback = calc_moments(
            image, xcen, ycen, &bbox, bkgd, interpflag, 0.0, 0.0, 0.0, false, exp,
        );
        let fallback_ok = matches!(&fallback, Some(s) if s.usable(false));
        if let Some(s) = fallback {
            sums = s;
        }
        if !fallback_ok || sums.sum <= 0.0 {
            result.flags.unweighted = false;
            result.flags.unweighted_bad = true;
            if sums.sum > 0.0 {
                // a single pixel
                result.ixx = 1.0 / 12.0;
                result.ixy = 0.0;
                result.iyy = 1.0 / 12.0;
            }
            return Ok(());
        }
        sigma11_w = sums.sumxx / sums.sum;
        sigma12_w = sums.sumxy / sums.sum;
        sigma22_w = sums.sumyy / sums.sum;
    }

    result.i0 = sums.i0;
    result.ixx = sigma11_w;
    result.ixy = sigma12_w;
    result.iyy = sigma22_w;
    result.ixy4 = sums.sums4 / sums.sum;

    if result.ixx + result.iyy != 0.0 {
        let ix = (xcen + 0.5).floor() as i32;
        let iy = (ycen + 0.5).floor() as i32;
        if ix >= 0 && ix < width as i32 && iy >= 0 && iy < height as i32 {
            let bkgd_var = variance_at(ix, iy); // overestimate: includes the object
            if bkgd_var > 0.0 && !result.flags.unweighted {
                let fisher = calc_fisher(result.i0, result.ixx, result.iyy, result.ixy, bkgd_var)?;
                if let Some(cov) = fisher.try_inverse() {
                    for r in 0..4 {
                        for c in 0..4 {
                            result.covariance[r][c] = cov[(r, c)];
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

fn fit_impl<T: Pixel>(
    image: &Image<T>,
    variance_at: &dyn Fn(i32, i32) -> f64,
    cfg: &AdaptiveMomentsConfig,
    x0: f64,
    y0: f64,
    exp: &dyn Exponential,
) -> ShapeResult {
    let shiftmax = cfg.max_shift.clamp(2.0, 10.0);
    let xl = x0 - image.x0() as f64;
    let yl = y0 - image.y0() as f64;
    let mut result = ShapeResult::default();
    if let Err(err) = get_adaptive_moments(
        image,
        variance_at,
        cfg.background,
        xl,
        yl,
        shiftmax,
        cfg.max_iter,
        cfg.tol1,
        cfg.tol2,
        exp,
        &mut result,
    ) {
        log::warn!("adaptive moments failed at ({x0:.1}, {y0:.1}): {err}");
        result.flags.failure = true;
    }
    result.x += image.x0() as f64;
    result.y += image.y0() as f64;
    result
}

/// Fit adaptive moments on a plain image.
///
/// `(x0, y0)` are in the image's parent (sky-pixel) frame; so is the
/// returned centroid. Without a variance plane the covariance stays NaN.
pub fn fit_adaptive_moments<T: Pixel>(
    image: &Image<T>,
    cfg: &AdaptiveMomentsConfig,
    x0: f64,
    y0: f64,
) -> ShapeResult {
    fit_impl(image, &|_, _| f64::NAN, cfg, x0, y0, &*DEFAULT_EXP)
}

/// Fit adaptive moments with covariance from the variance plane.
pub fn fit_adaptive_moments_masked<T: Pixel>(
    mimage: &MaskedImage<T>,
    cfg: &AdaptiveMomentsConfig,
    x0: f64,
    y0: f64,
) -> ShapeResult {
    let variance = mimage.variance();
    fit_impl(
        mimage.image(),
        &|ix, iy| variance.array()[[iy as usize, ix as usize]],
        cfg,
        x0,
        y0,
        &*DEFAULT_EXP,
    )
}

/// [`fit_adaptive_moments`] with a caller-chosen exponential.
pub fn fit_adaptive_moments_with<T: Pixel>(
    image: &Image<T>,
    cfg: &AdaptiveMomentsConfig,
    x0: f64,
    y0: f64,
    exp: &dyn Exponential,
) -> ShapeResult {
    fit_impl(image, &|_, _| f64::NAN, cfg, x0, y0, exp)
}

fn fixed_flux_impl<T: Pixel>(
    image: &Image<T>,
    variance_at: &dyn Fn(i32, i32) -> f64,
    bkgd: f64,
    xcen: f64,
    ycen: f64,
    shape: &Quadrupole,
) -> Result<(f64, f64), MeasureError> {
    let xl = xcen - image.x0() as f64;
    let yl = ycen - image.y0() as f64;
    let bbox = moments_bbox(
        image.width(),
        image.height(),
        xl,
        yl,
        shape.ixx,
        shape.iyy,
        MAX_MOMENTS_RADIUS,
    );
    let weights = get_weights(shape.ixx, shape.ixy, shape.iyy, true);
    if !weights.ok {
        return Ok((f64::NAN, f64::NAN));
    }
    let interp = should_interp(shape.ixx, shape.iyy, weights.det);
    let Some(sums) = calc_moments(
        image, xl, yl, &bbox, bkgd, interp, weights.w11, weights.w12, weights.w22, true,
        &*DEFAULT_EXP,
    ) else {
        return Ok((f64::NAN, f64::NAN));
    };

    let ix = xl as i32;
    let iy = yl as i32;
    let bkgd_var = if ix >= 0 && (ix as usize) < image.width() && iy >= 0 && (iy as usize) < image.height()
    {
        variance_at(ix, iy)
    } else {
        f64::NAN
    };
    let fisher = calc_fisher(sums.i0, shape.ixx, shape.iyy, shape.ixy, bkgd_var)?;
    let i0_err = fisher.try_inverse().map_or(f64::NAN, |cov| cov[(0, 0)]).sqrt();

    // area under a unit-amplitude elliptical Gaussian
    let scale = 2.0 * PI * shape.determinant().sqrt();
    Ok((sums.i0 * scale, i0_err * scale))
}

/// Flux within an elliptical-Gaussian aperture of fixed shape.
///
/// A single non-iterative moments pass yields the amplitude; the returned
/// flux is `amplitude · 2π√det(shape)`. Returns `(NaN, NaN)` when the
/// shape cannot be inverted; a non-positive background variance is a
/// domain error.
pub fn fixed_moments_flux<T: Pixel>(
    image: &Image<T>,
    bkgd: f64,
    xcen: f64,
    ycen: f64,
    shape: &Quadrupole,
) -> Result<(f64, f64), MeasureError> {
    fixed_flux_impl(image, &|_, _| f64::NAN, bkgd, xcen, ycen, shape)
}

/// [`fixed_moments_flux`] with the flux error from the variance plane.
pub fn fixed_moments_flux_masked<T: Pixel>(
    mimage: &MaskedImage<T>,
    bkgd: f64,
    xcen: f64,
    ycen: f64,
    shape: &Quadrupole,
) -> Result<(f64, f64), MeasureError> {
    let variance = mimage.variance();
    fixed_flux_impl(
        mimage.image(),
        &|ix, iy| variance.array()[[iy as usize, ix as usize]],
        bkgd,
        xcen,
        ycen,
        shape,
    )
}

/// Schema-registered adaptive-moments measurement.
pub struct SdssShapeAlgorithm {
    ctrl: AdaptiveMomentsConfig,
    name: String,
    flags: FlagHandler,
    centroid_extractor: SafeCentroidExtractor,
}

impl SdssShapeAlgorithm {
    /// Register the shape fields and wire up inputs.
    pub fn new(
        ctrl: AdaptiveMomentsConfig,
        name: &str,
        schema: &mut Schema,
    ) -> Result<Self, MeasureError> {
        ctrl.validate()?;
        let doc = "elliptical Gaussian adaptive moments";
        for field in ["x", "y", "xSigma", "ySigma"] {
            schema.add_double(&Schema::join(&[name, field]), doc)?;
        }
        for field in ["xx", "yy", "xy", "xxSigma", "yySigma", "xySigma"] {
            schema.add_double(&Schema::join(&[name, field]), doc)?;
        }
        schema.add_double(&Schema::join(&[name, "instFlux"]), doc)?;
        schema.add_double(&Schema::join(&[name, "instFluxErr"]), doc)?;
        schema.add_double(
            &Schema::join(&[name, "xy4"]),
            "4th moment used in certain shear-estimation algorithms",
        )?;
        schema.add_double(
            &Schema::join(&[name, "xy4Sigma"]),
            "uncertainty on the 4th moment",
        )?;
        for field in ["flux_xx_Cov", "flux_yy_Cov", "flux_xy_Cov"] {
            schema.add_double(
                &Schema::join(&[name, field]),
                "uncertainty covariance between instFlux and the moments",
            )?;
        }
        let flags = FlagHandler::add_fields(schema, name, SDSS_SHAPE_FLAG_DEFS)?;
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
        mimage: &MaskedImage<T>,
    ) -> Result<(), MeasureError> {
        let center = self.centroid_extractor.extract(record, &self.flags)?;
        let result = fit_adaptive_moments_masked(mimage, &self.ctrl, center.x, center.y);
        self.copy_result_to_record(&result, record);
        Ok(())
    }

    fn copy_result_to_record(&self, result: &ShapeResult, record: &mut Record) {
        let name = self.name.as_str();
        let cov = &result.covariance;
        let set = |record: &mut Record, field: &str, value: f64| {
            record.set_double(&Schema::join(&[name, field]), value);
        };
        set(record, "x", result.x);
        set(record, "y", result.y);
        set(record, "xSigma", f64::NAN);
        set(record, "ySigma", f64::NAN);
        set(record, "xx", result.ixx);
        set(record, "yy", result.iyy);
        set(record, "xy", result.ixy);
        set(record, "xxSigma", cov[1][1].sqrt());
        set(record, "yySigma", cov[2][2].sqrt());
        set(record, "xySigma", cov[3][3].sqrt());
        set(record, "instFlux", result.i0);
        set(record, "instFluxErr", cov[0][0].sqrt());
        set(record, "xy4", result.ixy4);
        set(record, "xy4Sigma", f64::NAN);
        set(record, "flux_xx_Cov", cov[0][1]);
        set(record, "flux_yy_Cov", cov[0][2]);
        set(record, "flux_xy_Cov", cov[0][3]);

        let inner = [
            result.flags.unweighted_bad,
            result.flags.unweighted,
            result.flags.shift,
            result.flags.maxiter,
        ];
        if result.flags.failure || inner.iter().any(|&f| f) {
            self.flags.set_value(record, SHAPE_FAILURE, true);
        }
        for (offset, &value) in inner.iter().enumerate() {
            if value {
                self.flags.set_value(record, UNWEIGHTED_BAD + offset, true);
            }
        }
    }

    /// Record a failure through the flag handler.
    pub fn fail(&self, record: &mut Record, error: Option<&MeasureError>) {
        self.flags.handle_failure(record, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use ndarray::Array2;
    use std::sync::Arc;

    // Render A·exp(-q/2) for the quadratic form of `shape` at (cx, cy).
    fn gaussian_image(size: usize, cx: f64, cy: f64, shape: Quadrupole, amplitude: f64) -> Image<f64> {
        let (w11, w12, w22) = shape.inverse().expect("test shape must be invertible");
        let mut data = Array2::<f64>::zeros((size, size));
        for ((r, c), v) in data.indexed_iter_mut() {
            let dx = c as f64 - cx;
            let dy = r as f64 - cy;
            let q = w11 * dx * dx + 2.0 * w12 * dx * dy + w22 * dy * dy;
            *v = amplitude * (-0.5 * q).exp();
        }
        Image::from_array(data, 0, 0)
    }

    #[test]
    fn test_get_weights_is_self_inverse() {
        let (s11, s12, s22) = (3.0, 0.5, 2.0);
        let w = get_weights(s11, s12, s22, true);
        assert!(w.ok);
        let back = get_weights(w.w11, w.w12, w.w22, true);
        assert!(back.ok);
        assert_relative_eq!(back.w11, s11, epsilon = 1e-10);
        assert_relative_eq!(back.w12, s12, epsilon = 1e-10);
        assert_relative_eq!(back.w22, s22, epsilon = 1e-10);
    }

    #[test]
    fn test_get_weights_nan_inputs_are_invalid() {
        let w = get_weights(f64::NAN, 0.0, 1.0, true);
        assert!(!w.ok);
        assert!(w.det.is_nan());
    }

    #[test]
    fn test_get_weights_singular_matrix() {
        // careful mode inflates a line-degenerate matrix by 1/12
        let careful = get_weights(1.0, 1.0, 1.0, true);
        assert!(careful.ok);
        assert!(careful.det > 0.0);
        // careless mode reports the bad determinant instead
        let careless = get_weights(1.0, 1.0, 1.0, false);
        assert!(!careless.ok);
        assert!(careless.w11.is_nan());
    }

    #[test]
    fn test_should_interp_thresholds() {
        assert!(should_interp(0.2, 1.0, 1.0));
        assert!(should_interp(1.0, 0.2, 1.0));
        assert!(should_interp(1.0, 1.0, 0.05));
        assert!(!should_interp(0.3, 0.3, 0.09));
    }

    #[test]
    fn test_moments_bbox_clamps_to_image() {
        let bbox = moments_bbox(51, 51, 2.0, 25.0, 9.0, 9.0, MAX_MOMENTS_RADIUS);
        assert_eq!(bbox.min_x, 0);
        assert!(bbox.max_x <= 50);
        assert!(bbox.min_y >= 0 && bbox.max_y <= 50);

        let capped = moments_bbox(51, 51, 25.0, 25.0, 1e8, 1e8, MAX_MOMENTS_RADIUS);
        assert_eq!(capped, PixelBox::new(0, 0, 50, 50));
    }

    #[test]
    fn test_gaussian_moments_recovered() {
        // 51×51 rendered Gaussian with (ixx, iyy, ixy) = (3, 2, 0.5):
        // the fit recovers the moments to well within 1e-3.
        let shape = Quadrupole::new(3.0, 2.0, 0.5);
        let image = gaussian_image(51, 25.0, 25.0, shape, 1000.0);
        let cfg = AdaptiveMomentsConfig::default();
        let result = fit_adaptive_moments(&image, &cfg, 25.0, 25.0);

        assert_eq!(result.flags, ShapeFlags::default());
        assert_abs_diff_eq!(result.x, 25.0, epsilon = 1e-6);
        assert_abs_diff_eq!(result.y, 25.0, epsilon = 1e-6);
        assert_abs_diff_eq!(result.ixx, 3.0, epsilon = 1e-3);
        assert_abs_diff_eq!(result.iyy, 2.0, epsilon = 1e-3);
        assert_abs_diff_eq!(result.ixy, 0.5, epsilon = 1e-3);
        assert_relative_eq!(result.i0, 1000.0, max_relative = 1e-2);
        assert!(result.ixy4.is_finite());
        // plain image: no variance, no covariance
        assert!(result.covariance[0][0].is_nan());
    }

    #[test]
    fn test_moments_respect_image_origin() {
        let shape = Quadrupole::new(3.0, 2.0, 0.5);
        let mut image = gaussian_image(51, 25.0, 25.0, shape, 500.0);
        image.set_origin(100, -40);
        let cfg = AdaptiveMomentsConfig::default();
        let result = fit_adaptive_moments(&image, &cfg, 125.0, -15.0);
        assert_abs_diff_eq!(result.x, 125.0, epsilon = 1e-6);
        assert_abs_diff_eq!(result.y, -15.0, epsilon = 1e-6);
        assert_abs_diff_eq!(result.ixx, 3.0, epsilon = 1e-3);
    }

    #[test]
    fn test_single_pixel_falls_back_to_pixel_moments() {
        let mut image = Image::<f64>::zeros(31, 31, 0, 0);
        image.set(15, 15, 100.0);
        let cfg = AdaptiveMomentsConfig::default();
        let result = fit_adaptive_moments(&image, &cfg, 15.0, 15.0);

        assert!(result.flags.unweighted_bad);
        assert!(!result.flags.unweighted);
        assert_abs_diff_eq!(result.x, 15.0, epsilon = 1e-9);
        assert_abs_diff_eq!(result.y, 15.0, epsilon = 1e-9);
        assert_abs_diff_eq!(result.ixx, 1.0 / 12.0, epsilon = 1e-12);
        assert_abs_diff_eq!(result.iyy, 1.0 / 12.0, epsilon = 1e-12);
        assert_abs_diff_eq!(result.ixy, 0.0, epsilon = 1e-12);
        // the degenerate fallback still honors the moment-matrix invariant
        assert!(result.ixx * result.iyy >= result.ixy * result.ixy - f32::EPSILON as f64);
    }

    #[test]
    fn test_nan_start_is_unweighted_bad() {
        let image = Image::<f64>::zeros(31, 31, 0, 0);
        let cfg = AdaptiveMomentsConfig::default();
        let result = fit_adaptive_moments(&image, &cfg, f64::NAN, 15.0);
        assert!(result.flags.unweighted_bad);
    }

    #[test]
    fn test_large_centroid_shift_is_flagged_not_fatal() {
        let shape = Quadrupole::new(1.0, 1.0, 0.0);
        let image = gaussian_image(51, 25.0, 25.0, shape, 1000.0);
        let cfg = AdaptiveMomentsConfig {
            max_shift: 2.0,
            ..Default::default()
        };
        // start 4 pixels off: the measured centroid pulls toward the object
        // by more than max_shift
        let result = fit_adaptive_moments(&image, &cfg, 21.0, 25.0);
        assert!(result.flags.shift);
        assert!(!result.flags.unweighted_bad);
        assert!(result.x.is_finite());
        assert!(result.x > 21.0);
    }

    #[test]
    fn test_iteration_cap_sets_maxiter_and_unweighted() {
        let shape = Quadrupole::new(3.0, 2.0, 0.5);
        let image = gaussian_image(51, 25.0, 25.0, shape, 1000.0);
        let cfg = AdaptiveMomentsConfig {
            max_iter: 1,
            ..Default::default()
        };
        let result = fit_adaptive_moments(&image, &cfg, 25.0, 25.0);
        assert!(result.flags.maxiter);
        // the unweighted fallback succeeded, and clears nothing
        assert!(result.flags.unweighted);
        assert!(!result.flags.unweighted_bad);
        // the moment-matrix invariant holds even on the fallback path
        assert!(result.ixx * result.iyy >= result.ixy * result.ixy - f32::EPSILON as f64);
    }

    #[test]
    fn test_covariance_from_variance_plane() {
        let shape = Quadrupole::new(3.0, 2.0, 0.5);
        let image = gaussian_image(51, 25.0, 25.0, shape, 1000.0);
        let mimage = MaskedImage::with_constant_variance(image, 25.0);
        let cfg = AdaptiveMomentsConfig::default();
        let result = fit_adaptive_moments_masked(&mimage, &cfg, 25.0, 25.0);

        assert_eq!(result.flags, ShapeFlags::default());
        assert!(result.covariance[0][0] > 0.0);
        assert!(result.covariance[1][1] > 0.0);
        // symmetric
        assert_relative_eq!(
            result.covariance[0][1],
            result.covariance[1][0],
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_fixed_moments_flux_of_unit_gaussian() {
        // A Gaussian normalized to unit total flux measures flux 1.
        let shape = Quadrupole::new(4.0, 3.0, 1.0);
        let amplitude = 1.0 / (2.0 * PI * shape.determinant().sqrt());
        let image = gaussian_image(61, 30.0, 30.0, shape, amplitude);
        let (flux, flux_err) = fixed_moments_flux(&image, 0.0, 30.0, 30.0, &shape).unwrap();
        assert_relative_eq!(flux, 1.0, max_relative = 1e-3);
        // plain image: no variance, so no flux error
        assert!(flux_err.is_nan());
    }

    #[test]
    fn test_fixed_moments_flux_error_from_variance() {
        let shape = Quadrupole::new(4.0, 3.0, 1.0);
        let image = gaussian_image(61, 30.0, 30.0, shape, 500.0);
        let mimage = MaskedImage::with_constant_variance(image, 4.0);
        let (flux, flux_err) =
            fixed_moments_flux_masked(&mimage, 0.0, 30.0, 30.0, &shape).unwrap();
        assert!(flux > 0.0);
        assert!(flux_err > 0.0 && flux_err.is_finite());
    }

    #[test]
    fn test_negative_background_variance_is_domain_error() {
        let shape = Quadrupole::new(4.0, 3.0, 1.0);
        let image = gaussian_image(61, 30.0, 30.0, shape, 500.0);
        let mimage = MaskedImage::with_constant_variance(image, -1.0);
        let err = fixed_moments_flux_masked(&mimage, 0.0, 30.0, 30.0, &shape).unwrap_err();
        assert!(matches!(err, MeasureError::Domain(_)));
    }

    #[test]
    fn test_fixed_moments_flux_bad_shape_is_nan() {
        let image = Image::<f64>::zeros(31, 31, 0, 0);
        let shape = Quadrupole::new(f64::NAN, 1.0, 0.0);
        let (flux, flux_err) = fixed_moments_flux(&image, 0.0, 15.0, 15.0, &shape).unwrap();
        assert!(flux.is_nan());
        assert!(flux_err.is_nan());
    }

    #[test]
    fn test_tabulated_exp_matches_libm() {
        let fast = TabulatedExp::new();
        for x in [-7.0, -3.5, -1.0, -0.1, 0.0] {
            assert_relative_eq!(fast.eval(x), LibmExp.eval(x), max_relative = 1e-7);
        }
    }

    #[test]
    fn test_swappable_exponential_agrees() {
        let shape = Quadrupole::new(3.0, 2.0, 0.5);
        let image = gaussian_image(51, 25.0, 25.0, shape, 1000.0);
        let cfg = AdaptiveMomentsConfig::default();
        let fast = fit_adaptive_moments(&image, &cfg, 25.0, 25.0);
        let exact = fit_adaptive_moments_with(&image, &cfg, 25.0, 25.0, &LibmExp);
        assert_relative_eq!(fast.ixx, exact.ixx, max_relative = 1e-5);
        assert_relative_eq!(fast.i0, exact.i0, max_relative = 1e-5);
    }

    #[test]
    fn test_shape_algorithm_writes_record() {
        let mut schema = Schema::new();
        schema.add_double("ref_Centroid_x", "x").unwrap();
        schema.add_double("ref_Centroid_y", "y").unwrap();
        schema.add_flag("ref_Centroid_flag", "bad").unwrap();
        schema.define_centroid_slot("ref_Centroid");
        let algorithm =
            SdssShapeAlgorithm::new(AdaptiveMomentsConfig::default(), "shape", &mut schema)
                .unwrap();
        let schema = Arc::new(schema);

        let mut record = Record::new(Arc::clone(&schema));
        record.set_double("ref_Centroid_x", 25.0);
        record.set_double("ref_Centroid_y", 25.0);

        let image = gaussian_image(51, 25.0, 25.0, Quadrupole::new(3.0, 2.0, 0.5), 1000.0);
        let mimage = MaskedImage::with_constant_variance(image, 25.0);
        algorithm.measure(&mut record, &mimage).unwrap();

        assert_abs_diff_eq!(record.get_double("shape_xx"), 3.0, epsilon = 1e-3);
        assert_abs_diff_eq!(record.get_double("shape_yy"), 2.0, epsilon = 1e-3);
        assert_abs_diff_eq!(record.get_double("shape_xy"), 0.5, epsilon = 1e-3);
        assert!(record.get_double("shape_xxSigma") > 0.0);
        assert!(record.get_double("shape_instFlux") > 0.0);
        assert!(!record.get_flag("shape_flag"));
        assert!(!record.get_flag("shape_flag_maxIter"));
    }

    #[test]
    fn test_shape_algorithm_maps_inner_flags() {
        let mut schema = Schema::new();
        schema.add_double("ref_Centroid_x", "x").unwrap();
        schema.add_double("ref_Centroid_y", "y").unwrap();
        schema.add_flag("ref_Centroid_flag", "bad").unwrap();
        schema.define_centroid_slot("ref_Centroid");
        let ctrl = AdaptiveMomentsConfig {
            max_iter: 1,
            ..Default::default()
        };
        let algorithm = SdssShapeAlgorithm::new(ctrl, "shape", &mut schema).unwrap();
        let schema = Arc::new(schema);

        let mut record = Record::new(Arc::clone(&schema));
        record.set_double("ref_Centroid_x", 25.0);
        record.set_double("ref_Centroid_y", 25.0);

        let image = gaussian_image(51, 25.0, 25.0, Quadrupole::new(3.0, 2.0, 0.5), 1000.0);
        let mimage = MaskedImage::with_constant_variance(image, 25.0);
        algorithm.measure(&mut record, &mimage).unwrap();

        assert!(record.get_flag("shape_flag_maxIter"));
        assert!(record.get_flag("shape_flag_unweighted"));
        // any inner flag raises the general failure flag on the record
        assert!(record.get_flag("shape_flag"));
    }
}
