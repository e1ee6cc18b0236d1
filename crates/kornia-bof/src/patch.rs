use kornia_image::{allocator::ImageAllocator, Image, ImageSize};
use num_traits::AsPrimitive;
use rand::Rng;
use rayon::prelude::*;

use crate::augment::Augment;
use crate::error::{BofError, BofResult};

/// Pixel types patches can be read from.
///
/// Every primitive number qualifies; values are converted to `f32` with `as`.
pub trait Pixel: AsPrimitive<f32> + Default + Send + Sync {}

impl<T: AsPrimitive<f32> + Default + Send + Sync> Pixel for T {}

/// A dense row-major matrix of patch vectors.
///
/// Each row is one flattened square patch of dimension `patch_edge²`.
#[derive(Clone, Debug, PartialEq)]
pub struct Patches {
    data: Vec<f32>,
    dim: usize,
}

impl Patches {
    /// Create an empty matrix with rows of dimension `dim`.
    pub fn new(dim: usize) -> Self {
        Self {
            data: Vec::new(),
            dim,
        }
    }

    /// Create an empty matrix with room for `rows` rows.
    pub fn with_capacity(dim: usize, rows: usize) -> Self {
        Self {
            data: Vec::with_capacity(dim * rows),
            dim,
        }
    }

    /// Wrap a flat buffer holding `data.len() / dim` rows.
    ///
    /// # Errors
    ///
    /// Returns an error if `dim` is zero or does not divide the buffer length.
    pub fn from_vec(data: Vec<f32>, dim: usize) -> BofResult<Self> {
        if dim == 0 || data.len() % dim != 0 {
            return Err(BofError::DimensionMismatch {
                expected: dim,
                found: data.len(),
            });
        }
        Ok(Self { data, dim })
    }

    /// Dimension of every row.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of rows.
    pub fn rows(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.data.len() / self.dim
        }
    }

    /// Whether the matrix holds no rows.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrow row `i`.
    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }

    /// Iterate over rows.
    pub fn iter(&self) -> std::slice::ChunksExact<'_, f32> {
        self.data.chunks_exact(self.dim.max(1))
    }

    /// Iterate over rows in parallel.
    pub fn par_iter(&self) -> rayon::slice::ChunksExact<'_, f32> {
        self.data.par_chunks_exact(self.dim.max(1))
    }

    /// Append a row.
    ///
    /// # Errors
    ///
    /// Returns an error if the row length differs from the matrix dimension.
    pub fn push(&mut self, row: &[f32]) -> BofResult<()> {
        if row.len() != self.dim {
            return Err(BofError::DimensionMismatch {
                expected: self.dim,
                found: row.len(),
            });
        }
        self.data.extend_from_slice(row);
        Ok(())
    }

    /// Append every row of `other`.
    pub fn append(&mut self, other: &Patches) -> BofResult<()> {
        if other.dim != self.dim {
            return Err(BofError::DimensionMismatch {
                expected: self.dim,
                found: other.dim,
            });
        }
        self.data.extend_from_slice(&other.data);
        Ok(())
    }

    /// The flat row-major buffer.
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// The flat row-major buffer, mutably.
    pub fn as_slice_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }
}

/// Scale `patch` in place to unit L2 norm.
///
/// Patches with zero norm are left untouched, so the result norm is either
/// one or zero.
///
/// # Example
///
/// ```
/// use kornia_bof::patch::normalize;
///
/// let mut patch = [3.0f32, 4.0];
/// normalize(&mut patch);
/// assert_eq!(patch, [0.6, 0.8]);
///
/// let mut zeros = [0.0f32; 4];
/// normalize(&mut zeros);
/// assert_eq!(zeros, [0.0; 4]);
/// ```
pub fn normalize(patch: &mut [f32]) {
    let norm = patch.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        patch.iter_mut().for_each(|v| *v /= norm);
    }
}

/// Size of the grid of valid patch positions, `(W-e+1, H-e+1)`.
///
/// # Errors
///
/// Returns an error if the edge is zero or larger than the image.
pub fn output_size(size: ImageSize, patch_edge: usize) -> BofResult<ImageSize> {
    if patch_edge == 0 {
        return Err(BofError::InvalidConfig(
            "patch edge must be greater than zero".to_string(),
        ));
    }
    if size.width < patch_edge || size.height < patch_edge {
        return Err(BofError::ImageTooSmall { size, patch_edge });
    }
    Ok(ImageSize {
        width: size.width - patch_edge + 1,
        height: size.height - patch_edge + 1,
    })
}

// NaN or infinite pixels are rejected before they reach a patch
fn ensure_finite<T: Pixel>(pixels: &[T]) -> BofResult<()> {
    if pixels.par_iter().any(|v| !v.as_().is_finite()) {
        return Err(BofError::NonFinite("image pixels"));
    }
    Ok(())
}

// copy the window with top-left corner (x, y) into `dst` and normalize it
fn read_patch<T: Pixel>(
    src: &[T],
    cols: usize,
    patch_edge: usize,
    x: usize,
    y: usize,
    dst: &mut [f32],
) {
    for (r, dst_row) in dst.chunks_exact_mut(patch_edge).enumerate() {
        let offset = (y + r) * cols + x;
        for (d, &s) in dst_row.iter_mut().zip(&src[offset..offset + patch_edge]) {
            *d = s.as_();
        }
    }
    normalize(dst);
}

/// Extract every valid patch of `image`, in row-major order of the top-left
/// corner.
///
/// The result has `(H-e+1)·(W-e+1)` rows so that row `y * (W-e+1) + x` is the
/// patch whose top-left corner is pixel `(x, y)`.
///
/// # Errors
///
/// Returns an error if the image is smaller than the patch or holds NaN or
/// infinite pixels.
///
/// # Example
///
/// ```
/// use kornia_image::{allocator::CpuAllocator, Image, ImageSize};
/// use kornia_bof::patch::extract_patches;
///
/// let size = ImageSize { width: 50, height: 50 };
/// let image = Image::<u8, 1, _>::from_size_val(size, 1, CpuAllocator).unwrap();
/// let patches = extract_patches(&image, 7).unwrap();
///
/// assert_eq!(patches.rows(), 44 * 44);
/// assert_eq!(patches.dim(), 49);
/// ```
pub fn extract_patches<T, A>(image: &Image<T, 1, A>, patch_edge: usize) -> BofResult<Patches>
where
    T: Pixel,
    A: ImageAllocator,
{
    let out = output_size(image.size(), patch_edge)?;
    let src = image.as_slice();
    ensure_finite(src)?;

    let cols = image.cols();
    let dim = patch_edge * patch_edge;
    let mut data = vec![0.0f32; out.width * out.height * dim];

    data.par_chunks_exact_mut(out.width * dim)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, dst) in row.chunks_exact_mut(dim).enumerate() {
                read_patch(src, cols, patch_edge, x, y, dst);
            }
        });

    Ok(Patches { data, dim })
}

/// Draw `num_patches` windows at uniformly random positions (with
/// replacement) from `image`.
pub fn sample_patches<T, A, R>(
    image: &Image<T, 1, A>,
    patch_edge: usize,
    num_patches: usize,
    rng: &mut R,
) -> BofResult<Patches>
where
    T: Pixel,
    A: ImageAllocator,
    R: Rng + ?Sized,
{
    let out = output_size(image.size(), patch_edge)?;
    let src = image.as_slice();
    ensure_finite(src)?;

    let cols = image.cols();
    let dim = patch_edge * patch_edge;
    let mut data = vec![0.0f32; num_patches * dim];

    for dst in data.chunks_exact_mut(dim) {
        let x = rng.random_range(0..out.width);
        let y = rng.random_range(0..out.height);
        read_patch(src, cols, patch_edge, x, y, dst);
    }

    Ok(Patches { data, dim })
}

/// Sample `patches_per_image` normalized patches from every variant of each
/// of the first `image_count` images of `images`.
///
/// Each image is first expanded through `augment`, so the result holds
/// `image_count × augment.num_variants() × patches_per_image` rows. The count
/// is explicit because lazily produced corpora may not know their own length.
/// Extra images beyond `image_count` are not consumed.
///
/// # Errors
///
/// Returns an error if the count is zero, if the corpus yields fewer images
/// than announced, or if any image is smaller than the patch.
pub fn collect_normalized_patches<I, T, A, R>(
    images: I,
    image_count: usize,
    patch_edge: usize,
    patches_per_image: usize,
    augment: Augment,
    rng: &mut R,
) -> BofResult<Patches>
where
    I: IntoIterator<Item = Image<T, 1, A>>,
    T: Pixel,
    A: ImageAllocator,
    R: Rng + ?Sized,
{
    if image_count == 0 {
        return Err(BofError::EmptyCorpus);
    }

    let dim = patch_edge * patch_edge;
    let rows = image_count * augment.num_variants() * patches_per_image;
    let mut patches = Patches::with_capacity(dim, rows);
    let mut found = 0;

    for image in images.into_iter().take(image_count) {
        for variant in augment.augment(&image)? {
            let sampled = sample_patches(&variant, patch_edge, patches_per_image, rng)?;
            patches.append(&sampled)?;
        }
        found += 1;
    }

    if found != image_count {
        return Err(BofError::CorpusCountMismatch {
            expected: image_count,
            found,
        });
    }

    log::debug!(
        "collected {} patches of dimension {} from {} images",
        patches.rows(),
        dim,
        found
    );

    Ok(patches)
}
