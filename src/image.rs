//! Image containers with sky-coordinate origins.
//!
//! Pixels live in an ndarray [`Array2`] indexed `[row, col]`; the container
//! adds an integer origin `(x0, y0)` so that array index `(i, j)` maps to
//! sky pixel `(j + x0, i + y0)`. Sub-images are ndarray views — no pixel
//! copies happen in the measurement inner loops.

use ndarray::{s, Array2, ArrayBase, ArrayView2, Data, Ix2, OwnedRepr, RawData, ViewRepr};
use num_traits::AsPrimitive;
use std::sync::Arc;

use crate::errors::MeasureError;
use crate::geom::PixelBox;
use crate::psf::Psf;

/// Pixel sample types accepted by the measurement kernels.
///
/// Flux entry points are instantiated for `f32` and `f64`; the moments
/// kernel additionally accepts `i32`.
pub trait Pixel: Copy + AsPrimitive<f64> + 'static {}

impl Pixel for f32 {}
impl Pixel for f64 {}
impl Pixel for i32 {}

/// A 2-D image over any ndarray storage, with an integer origin.
pub struct ImageBase<S: RawData> {
    data: ArrayBase<S, Ix2>,
    x0: i32,
    y0: i32,
}

impl<S: ndarray::RawDataClone> Clone for ImageBase<S> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            x0: self.x0,
            y0: self.y0,
        }
    }
}

impl<S, T> std::fmt::Debug for ImageBase<S>
where
    S: Data<Elem = T>,
    T: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageBase")
            .field("x0", &self.x0)
            .field("y0", &self.y0)
            .field("shape", &self.data.dim())
            .finish()
    }
}

/// An image owning its pixels.
pub type Image<T> = ImageBase<OwnedRepr<T>>;

/// A borrowed view into another image's pixels.
pub type ImageView<'a, T> = ImageBase<ViewRepr<&'a T>>;

impl<S, T> ImageBase<S>
where
    S: Data<Elem = T>,
    T: Pixel,
{
    /// Column coordinate of the first pixel.
    pub fn x0(&self) -> i32 {
        self.x0
    }

    /// Row coordinate of the first pixel.
    pub fn y0(&self) -> i32 {
        self.y0
    }

    /// Number of columns.
    pub fn width(&self) -> usize {
        self.data.ncols()
    }

    /// Number of rows.
    pub fn height(&self) -> usize {
        self.data.nrows()
    }

    /// Bounding box in sky-pixel coordinates.
    pub fn bbox(&self) -> PixelBox {
        PixelBox::from_corner_size(self.x0, self.y0, self.width(), self.height())
    }

    /// Pixel value at sky coordinates `(x, y)`.
    ///
    /// The position must lie inside [`ImageBase::bbox`].
    pub fn get(&self, x: i32, y: i32) -> T {
        self.data[[(y - self.y0) as usize, (x - self.x0) as usize]]
    }

    /// The raw pixel array (local indexing, `[row, col]`).
    pub fn array(&self) -> ArrayView2<'_, T> {
        self.data.view()
    }

    /// Borrow a sub-image covering `bbox`, which must lie inside this image.
    pub fn view(&self, bbox: &PixelBox) -> ImageView<'_, T> {
        assert!(
            self.bbox().contains(bbox) && !bbox.is_empty(),
            "sub-image bbox {bbox:?} must lie inside image bbox {:?}",
            self.bbox()
        );
        let r0 = (bbox.min_y - self.y0) as usize;
        let r1 = (bbox.max_y - self.y0) as usize;
        let c0 = (bbox.min_x - self.x0) as usize;
        let c1 = (bbox.max_x - self.x0) as usize;
        ImageBase {
            data: self.data.slice(s![r0..=r1, c0..=c1]),
            x0: bbox.min_x,
            y0: bbox.min_y,
        }
    }

    /// Copy this image (or view) into an owning image.
    pub fn to_owned_image(&self) -> Image<T> {
        Image {
            data: self.data.to_owned(),
            x0: self.x0,
            y0: self.y0,
        }
    }
}

impl<T: Pixel> Image<T> {
    /// Wrap an existing pixel array with an origin.
    pub fn from_array(data: Array2<T>, x0: i32, y0: i32) -> Self {
        Self { data, x0, y0 }
    }

    /// Set the pixel at sky coordinates `(x, y)`.
    pub fn set(&mut self, x: i32, y: i32, value: T) {
        self.data[[(y - self.y0) as usize, (x - self.x0) as usize]] = value;
    }

    /// Move the image origin without touching the pixels.
    pub fn set_origin(&mut self, x0: i32, y0: i32) {
        self.x0 = x0;
        self.y0 = y0;
    }
}

impl<T: Pixel + num_traits::Zero> Image<T> {
    /// Create a zero-filled image.
    pub fn zeros(width: usize, height: usize, x0: i32, y0: i32) -> Self {
        Self {
            data: Array2::zeros((height, width)),
            x0,
            y0,
        }
    }
}

/// An image paired with a per-pixel variance plane of the same shape.
#[derive(Debug, Clone)]
pub struct MaskedImage<T: Pixel> {
    image: Image<T>,
    variance: Image<f64>,
}

impl<T: Pixel> MaskedImage<T> {
    /// Pair an image with its variance plane.
    ///
    /// Both planes must share shape and origin.
    pub fn new(image: Image<T>, variance: Image<f64>) -> Self {
        assert!(
            image.bbox() == variance.bbox(),
            "image and variance planes must share shape and origin"
        );
        Self { image, variance }
    }

    /// Build a masked image with a constant variance everywhere.
    pub fn with_constant_variance(image: Image<T>, variance: f64) -> Self {
        let plane = Image::from_array(
            Array2::from_elem((image.height(), image.width()), variance),
            image.x0(),
            image.y0(),
        );
        Self::new(image, plane)
    }

    /// The pixel plane.
    pub fn image(&self) -> &Image<T> {
        &self.image
    }

    /// The variance plane.
    pub fn variance(&self) -> &Image<f64> {
        &self.variance
    }

    /// Bounding box shared by both planes.
    pub fn bbox(&self) -> PixelBox {
        self.image.bbox()
    }
}

/// A masked image together with the PSF model of its exposure.
#[derive(Clone)]
pub struct Exposure<T: Pixel> {
    mimage: MaskedImage<T>,
    psf: Option<Arc<dyn Psf>>,
}

impl<T: Pixel> Exposure<T> {
    /// Create an exposure without a PSF.
    pub fn new(mimage: MaskedImage<T>) -> Self {
        Self { mimage, psf: None }
    }

    /// Attach a PSF model.
    pub fn with_psf(mimage: MaskedImage<T>, psf: Arc<dyn Psf>) -> Self {
        Self {
            mimage,
            psf: Some(psf),
        }
    }

    /// The masked image.
    pub fn masked_image(&self) -> &MaskedImage<T> {
        &self.mimage
    }

    /// The attached PSF, or a runtime error when none is present.
    pub fn psf(&self) -> Result<&dyn Psf, MeasureError> {
        self.psf
            .as_deref()
            .ok_or_else(|| MeasureError::Runtime("no PSF attached to exposure".into()))
    }
}
