//! Elliptical shapes for apertures and Gaussian weights.
//!
//! An ellipse core can be expressed either as second ("quadrupole") moments
//! `(ixx, iyy, ixy)` or as principal axes `(a, b, theta)`; the two forms
//! convert losslessly through the eigendecomposition of the moment matrix.
//! [`PixelRegion`] rasterizes an ellipse into horizontal pixel spans for
//! aperture summation.

use serde::{Deserialize, Serialize};

use super::{PixelBox, Point2};

/// Second-moment representation of an ellipse core.
///
/// The moment matrix `[[ixx, ixy], [ixy, iyy]]` must be (weakly) positive
/// semidefinite for the core to describe a real ellipse; consumers that
/// need an invertible matrix are expected to check [`Quadrupole::determinant`]
/// themselves.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quadrupole {
    /// Second moment in x.
    pub ixx: f64,
    /// Second moment in y.
    pub iyy: f64,
    /// Cross moment.
    pub ixy: f64,
}

impl Quadrupole {
    /// Create a core from its three second moments.
    pub fn new(ixx: f64, iyy: f64, ixy: f64) -> Self {
        Self { ixx, iyy, ixy }
    }

    /// Core of a circle with the given radius.
    pub fn circle(radius: f64) -> Self {
        Self {
            ixx: radius * radius,
            iyy: radius * radius,
            ixy: 0.0,
        }
    }

    /// Determinant of the moment matrix.
    pub fn determinant(&self) -> f64 {
        self.ixx * self.iyy - self.ixy * self.ixy
    }

    /// Radius of the circle with the same area, `det^(1/4)`.
    pub fn determinant_radius(&self) -> f64 {
        self.determinant().sqrt().sqrt()
    }

    /// Convert to the principal-axes form.
    ///
    /// Degenerate cores produce a zero-length axis rather than NaN.
    pub fn to_axes(&self) -> Axes {
        let t = 0.5 * (self.ixx + self.iyy);
        let d = 0.5 * (self.ixx - self.iyy);
        let r = (d * d + self.ixy * self.ixy).sqrt();
        Axes {
            a: (t + r).max(0.0).sqrt(),
            b: (t - r).max(0.0).sqrt(),
            theta: 0.5 * (2.0 * self.ixy).atan2(self.ixx - self.iyy),
        }
    }

    /// Inverse of the moment matrix as `(w11, w12, w22)`.
    ///
    /// Returns `None` when the determinant is not strictly positive.
    pub fn inverse(&self) -> Option<(f64, f64, f64)> {
        let det = self.determinant();
        if !(det > 0.0) {
            return None;
        }
        Some((self.iyy / det, -self.ixy / det, self.ixx / det))
    }

    /// Half-extents of the axis-aligned envelope, `(√ixx, √iyy)`.
    pub fn envelope(&self) -> (f64, f64) {
        (self.ixx.max(0.0).sqrt(), self.iyy.max(0.0).sqrt())
    }
}

/// Principal-axes representation `(a, b, theta)` of an ellipse core.
///
/// `a` is the semi-major axis, `b` the semi-minor axis, and `theta` the
/// position angle of the major axis in radians.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Axes {
    /// Semi-major axis.
    pub a: f64,
    /// Semi-minor axis.
    pub b: f64,
    /// Position angle of the major axis, radians.
    pub theta: f64,
}

impl Axes {
    /// Create an axes core.
    pub fn new(a: f64, b: f64, theta: f64) -> Self {
        Self { a, b, theta }
    }

    /// Convert back to the second-moment form.
    pub fn to_quadrupole(&self) -> Quadrupole {
        let c = self.theta.cos();
        let s = self.theta.sin();
        let a2 = self.a * self.a;
        let b2 = self.b * self.b;
        Quadrupole {
            ixx: a2 * c * c + b2 * s * s,
            iyy: a2 * s * s + b2 * c * c,
            ixy: (a2 - b2) * c * s,
        }
    }
}

/// An ellipse: a core placed at a center position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ellipse {
    /// Center in continuous pixel coordinates.
    pub center: Point2,
    /// Shape of the ellipse.
    pub core: Quadrupole,
}

impl Ellipse {
    /// Create an ellipse from a center and core.
    pub fn new(center: Point2, core: Quadrupole) -> Self {
        Self { center, core }
    }

    /// Integer bounding box of the ellipse envelope.
    pub fn compute_bbox(&self) -> PixelBox {
        let (ex, ey) = self.core.envelope();
        PixelBox::new(
            (self.center.x - ex).floor() as i32,
            (self.center.y - ey).floor() as i32,
            (self.center.x + ex).ceil() as i32,
            (self.center.y + ey).ceil() as i32,
        )
    }

    /// Rasterize into pixel spans.
    pub fn pixel_region(&self) -> PixelRegion {
        PixelRegion::new(self)
    }
}

/// A horizontal run of pixels at row `y`, starting at column `x_begin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// Row coordinate.
    pub y: i32,
    /// First column of the run.
    pub x_begin: i32,
    /// Last column of the run, inclusive.
    pub x_end: i32,
}

impl Span {
    /// Number of pixels in the run.
    pub fn width(&self) -> usize {
        (self.x_end - self.x_begin + 1) as usize
    }
}

/// The set of pixels whose centers fall inside an ellipse, as row spans.
///
/// A degenerate core (non-positive determinant) yields an empty region.
#[derive(Debug, Clone)]
pub struct PixelRegion {
    cx: f64,
    cy: f64,
    // inverse moment matrix, or None for a degenerate core
    weights: Option<(f64, f64, f64)>,
    y_min: i32,
    y_max: i32,
}

impl PixelRegion {
    /// Build the region for an ellipse.
    pub fn new(ellipse: &Ellipse) -> Self {
        let (_, ey) = ellipse.core.envelope();
        let weights = ellipse.core.inverse();
        let (y_min, y_max) = if weights.is_some() {
            (
                (ellipse.center.y - ey).ceil() as i32,
                (ellipse.center.y + ey).floor() as i32,
            )
        } else {
            (0, -1)
        };
        Self {
            cx: ellipse.center.x,
            cy: ellipse.center.y,
            weights,
            y_min,
            y_max,
        }
    }

    /// The span at row `y`, if the ellipse covers any pixel centers there.
    pub fn span_at(&self, y: i32) -> Option<Span> {
        let (w11, w12, w22) = self.weights?;
        let dy = y as f64 - self.cy;
        // solve w11·dx² + 2·w12·dx·dy + w22·dy² = 1 for dx
        let b = 2.0 * w12 * dy;
        let c = w22 * dy * dy - 1.0;
        let disc = b * b - 4.0 * w11 * c;
        if disc < 0.0 {
            return None;
        }
        let sq = disc.sqrt();
        let x_lo = self.cx + (-b - sq) / (2.0 * w11);
        let x_hi = self.cx + (-b + sq) / (2.0 * w11);
        let x_begin = x_lo.ceil() as i32;
        let x_end = x_hi.floor() as i32;
        if x_begin > x_end {
            return None;
        }
        Some(Span { y, x_begin, x_end })
    }

    /// Bounding box of all spans; empty for an empty region.
    pub fn bbox(&self) -> PixelBox {
        let mut bbox = PixelBox::empty();
        for span in self.iter() {
            bbox.expand_to_include(span.x_begin, span.y);
            bbox.expand_to_include(span.x_end, span.y);
        }
        bbox
    }

    /// Iterate over the spans, bottom row first.
    pub fn iter(&self) -> impl Iterator<Item = Span> + '_ {
        (self.y_min..=self.y_max).filter_map(move |y| self.span_at(y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    #[test]
    fn test_quadrupole_axes_roundtrip() {
        let q = Quadrupole::new(3.0, 2.0, 0.5);
        let axes = q.to_axes();
        assert!(axes.a >= axes.b);
        let back = axes.to_quadrupole();
        assert_relative_eq!(back.ixx, q.ixx, epsilon = 1e-12);
        assert_relative_eq!(back.iyy, q.iyy, epsilon = 1e-12);
        assert_relative_eq!(back.ixy, q.ixy, epsilon = 1e-12);
    }

    #[test]
    fn test_circle_core() {
        let q = Quadrupole::circle(5.0);
        let axes = q.to_axes();
        assert_relative_eq!(axes.a, 5.0, epsilon = 1e-12);
        assert_relative_eq!(axes.b, 5.0, epsilon = 1e-12);
        assert_relative_eq!(q.determinant_radius(), 5.0, epsilon = 1e-12);
    }

    #[test]
    fn test_determinant_radius_ellipse() {
        // a=4, b=1 circle-equivalent radius is 2
        let q = Axes::new(4.0, 1.0, 0.3).to_quadrupole();
        assert_relative_eq!(q.determinant_radius(), 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_pixel_region_circle_count() {
        // Pixel-center rasterization of a circle quantizes the area; the
        // count should track π·r² to within a few boundary pixels.
        let ellipse = Ellipse::new(Point2::new(15.0, 15.0), Quadrupole::circle(3.0));
        let count: usize = ellipse.pixel_region().iter().map(|s| s.width()).sum();
        let expected = PI * 9.0;
        assert!(
            (count as f64 - expected).abs() < 5.0,
            "pixel count {count} should be near {expected}"
        );
    }

    #[test]
    fn test_pixel_region_bbox_inside_envelope() {
        let ellipse = Ellipse::new(
            Point2::new(10.0, 12.0),
            Axes::new(6.0, 2.0, 0.7).to_quadrupole(),
        );
        let region_bbox = ellipse.pixel_region().bbox();
        let envelope = ellipse.compute_bbox();
        assert!(envelope.contains(&region_bbox));
        assert!(!region_bbox.is_empty());
    }

    #[test]
    fn test_degenerate_core_empty_region() {
        let ellipse = Ellipse::new(Point2::new(0.0, 0.0), Quadrupole::new(1.0, 0.0, 0.0));
        assert_eq!(ellipse.pixel_region().iter().count(), 0);
        assert!(ellipse.pixel_region().bbox().is_empty());
    }

    #[test]
    fn test_span_symmetry() {
        let ellipse = Ellipse::new(Point2::new(0.0, 0.0), Quadrupole::circle(4.0));
        let region = ellipse.pixel_region();
        let span = region.span_at(0).unwrap();
        assert_eq!(span.x_begin, -4);
        assert_eq!(span.x_end, 4);
    }
}
