use bincode::{Decode, Encode};
use kornia_image::{
    allocator::{CpuAllocator, ImageAllocator},
    Image, ImageSize,
};
use rand::{rngs::StdRng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::augment::Augment;
use crate::codebook::{self, HierarchicalCodebook};
use crate::error::{BofError, BofResult};
use crate::kmeans::KMeansParams;
use crate::patch::{collect_normalized_patches, extract_patches, output_size, Patches, Pixel};
use crate::whiten::Whitener;

/// Configuration of a [`BagOfFeaturesEncoder`].
///
/// The training sample budget (`patches_per_image`) and the codebook size
/// (`n_clusters`) are independent.
///
/// # Example
///
/// ```
/// use kornia_bof::{Augment, BofConfig};
///
/// let config = BofConfig::default()
///     .with_n_clusters(10)
///     .with_levels(2)
///     .with_augment(Augment::Rotate);
///
/// assert!(config.validate().is_ok());
/// assert_eq!(config.leaf_count().unwrap(), 100);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BofConfig {
    /// Edge length of the square patches.
    pub patch_edge: usize,
    /// Number of centroids at every level of the codebook.
    pub n_clusters: usize,
    /// Depth of the codebook tree, 1 for a flat codebook.
    pub levels: usize,
    /// Patches sampled from each training image variant.
    pub patches_per_image: usize,
    /// Augmentation policy applied at fit and predict time.
    pub augment: Augment,
    /// Iteration cap of the clustering loop.
    pub max_iterations: usize,
    /// Centroid shift below which clustering is considered converged.
    pub tolerance: f32,
    /// Regularizer of the whitening eigenvalues.
    pub whiten_epsilon: f32,
    /// Seed for patch sampling and centroid seeding, random when `None`.
    pub seed: Option<u64>,
}

impl Default for BofConfig {
    fn default() -> Self {
        Self {
            patch_edge: 7,
            n_clusters: 10,
            levels: 1,
            patches_per_image: 100,
            augment: Augment::None,
            max_iterations: 100,
            tolerance: 1e-4,
            whiten_epsilon: 1e-3,
            seed: None,
        }
    }
}

impl BofConfig {
    /// Set the patch edge length.
    pub fn with_patch_edge(mut self, patch_edge: usize) -> Self {
        self.patch_edge = patch_edge;
        self
    }

    /// Set the number of centroids per level.
    pub fn with_n_clusters(mut self, n_clusters: usize) -> Self {
        self.n_clusters = n_clusters;
        self
    }

    /// Set the codebook depth.
    pub fn with_levels(mut self, levels: usize) -> Self {
        self.levels = levels;
        self
    }

    /// Set the number of patches sampled per training image variant.
    pub fn with_patches_per_image(mut self, patches_per_image: usize) -> Self {
        self.patches_per_image = patches_per_image;
        self
    }

    /// Set the augmentation policy.
    pub fn with_augment(mut self, augment: Augment) -> Self {
        self.augment = augment;
        self
    }

    /// Set the clustering iteration cap.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the clustering convergence tolerance.
    pub fn with_tolerance(mut self, tolerance: f32) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Set the whitening regularizer.
    pub fn with_whiten_epsilon(mut self, whiten_epsilon: f32) -> Self {
        self.whiten_epsilon = whiten_epsilon;
        self
    }

    /// Make fitting reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Total number of codewords, `n_clusters^levels`.
    pub fn leaf_count(&self) -> BofResult<usize> {
        codebook::leaf_count(self.n_clusters, self.levels)
    }

    /// Clustering stopping criteria.
    pub fn kmeans_params(&self) -> KMeansParams {
        KMeansParams {
            max_iterations: self.max_iterations,
            tolerance: self.tolerance,
        }
    }

    /// Check every option, failing on the first invalid one.
    pub fn validate(&self) -> BofResult<()> {
        if self.patch_edge == 0 {
            return Err(BofError::InvalidConfig(
                "patch_edge must be greater than zero".to_string(),
            ));
        }
        self.leaf_count()?;
        if self.patches_per_image == 0 {
            return Err(BofError::InvalidConfig(
                "patches_per_image must be greater than zero".to_string(),
            ));
        }
        if self.max_iterations == 0 {
            return Err(BofError::InvalidConfig(
                "max_iterations must be greater than zero".to_string(),
            ));
        }
        if !(self.tolerance >= 0.0 && self.tolerance.is_finite()) {
            return Err(BofError::InvalidConfig(format!(
                "tolerance must be finite and non-negative, got {}",
                self.tolerance
            )));
        }
        if !(self.whiten_epsilon > 0.0 && self.whiten_epsilon.is_finite()) {
            return Err(BofError::InvalidConfig(format!(
                "whiten_epsilon must be finite and positive, got {}",
                self.whiten_epsilon
            )));
        }
        Ok(())
    }
}

/// Leaf indices of every valid patch position of an image.
#[derive(Clone)]
pub enum LeafAssignment {
    /// Spatial map of size `(W-e+1, H-e+1)`.
    Map(Image<u32, 1, CpuAllocator>),
    /// Row-major sequence of length `(H-e+1)·(W-e+1)`.
    Flat(Vec<u32>),
}

impl LeafAssignment {
    /// The leaf indices in row-major order.
    pub fn as_slice(&self) -> &[u32] {
        match self {
            LeafAssignment::Map(map) => map.as_slice(),
            LeafAssignment::Flat(flat) => flat,
        }
    }

    /// Number of assigned positions.
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Whether no position was assigned.
    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }

    /// Consume into the flat index buffer.
    pub fn into_vec(self) -> Vec<u32> {
        match self {
            LeafAssignment::Map(map) => map.as_slice().to_vec(),
            LeafAssignment::Flat(flat) => flat,
        }
    }
}

/// Dense one-hot assignment tensor of shape `(H-e+1, W-e+1, num_bins)`.
#[derive(Clone, Debug, PartialEq)]
pub struct OneHotMap {
    size: ImageSize,
    num_bins: usize,
    data: Vec<bool>,
}

impl OneHotMap {
    fn from_leaves(size: ImageSize, num_bins: usize, leaves: &[u32]) -> Self {
        let mut data = vec![false; leaves.len() * num_bins];
        data.par_chunks_exact_mut(num_bins)
            .zip(leaves.par_iter())
            .for_each(|(pixel, &leaf)| pixel[leaf as usize] = true);
        Self {
            size,
            num_bins,
            data,
        }
    }

    /// Spatial size of the map.
    pub fn size(&self) -> ImageSize {
        self.size
    }

    /// Length of the last axis.
    pub fn num_bins(&self) -> usize {
        self.num_bins
    }

    /// `[height, width, num_bins]`.
    pub fn shape(&self) -> [usize; 3] {
        [self.size.height, self.size.width, self.num_bins]
    }

    /// The one-hot vector of the pixel at column `x`, row `y`.
    pub fn pixel(&self, x: usize, y: usize) -> Option<&[bool]> {
        if x >= self.size.width || y >= self.size.height {
            return None;
        }
        let start = (y * self.size.width + x) * self.num_bins;
        Some(&self.data[start..start + self.num_bins])
    }

    /// The flat `(H, W, bins)` buffer.
    pub fn as_slice(&self) -> &[bool] {
        &self.data
    }
}

/// A fitted whitening transform and codebook, ready for inference.
///
/// The model is immutable; it can be shared across threads and reused for
/// any number of `transform` and `predict` calls.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct BofModel {
    patch_edge: usize,
    augment: Augment,
    whitener: Whitener,
    codebook: HierarchicalCodebook,
}

impl BofModel {
    /// Assemble a model from fitted parts.
    ///
    /// # Errors
    ///
    /// Returns an error if the parts disagree on the patch dimension.
    pub fn new(
        patch_edge: usize,
        augment: Augment,
        whitener: Whitener,
        codebook: HierarchicalCodebook,
    ) -> BofResult<Self> {
        let dim = patch_edge * patch_edge;
        for found in [whitener.dim(), codebook.dim()] {
            if found != dim {
                return Err(BofError::DimensionMismatch {
                    expected: dim,
                    found,
                });
            }
        }
        Ok(Self {
            patch_edge,
            augment,
            whitener,
            codebook,
        })
    }

    /// Patch edge length.
    pub fn patch_edge(&self) -> usize {
        self.patch_edge
    }

    /// Augmentation policy used when predicting.
    pub fn augment(&self) -> Augment {
        self.augment
    }

    /// The fitted whitening transform.
    pub fn whitener(&self) -> &Whitener {
        &self.whitener
    }

    /// The fitted codebook tree.
    pub fn codebook(&self) -> &HierarchicalCodebook {
        &self.codebook
    }

    /// Length of every histogram, `k^levels`.
    pub fn leaf_count(&self) -> usize {
        self.codebook.leaf_count()
    }

    /// Whiten raw normalized patches and assign each to a leaf.
    pub fn encode_patches(&self, patches: &Patches) -> BofResult<Vec<u32>> {
        let whitened = self.whitener.apply(patches)?;
        self.codebook.assign(&whitened)
    }

    fn leaves<T, A>(&self, image: &Image<T, 1, A>) -> BofResult<(ImageSize, Vec<u32>)>
    where
        T: Pixel,
        A: ImageAllocator,
    {
        let out = output_size(image.size(), self.patch_edge)?;
        let patches = extract_patches(image, self.patch_edge)?;
        Ok((out, self.encode_patches(&patches)?))
    }

    /// Assign every valid patch position of `image` to a leaf.
    ///
    /// With `reshape` the result is a spatial map of size `(W-e+1, H-e+1)`,
    /// otherwise a flat sequence in row-major order.
    pub fn transform<T, A>(&self, image: &Image<T, 1, A>, reshape: bool) -> BofResult<LeafAssignment>
    where
        T: Pixel,
        A: ImageAllocator,
    {
        let (out, leaves) = self.leaves(image)?;
        Ok(if reshape {
            LeafAssignment::Map(Image::new(out, leaves, CpuAllocator)?)
        } else {
            LeafAssignment::Flat(leaves)
        })
    }

    /// Count leaf assignments of a single image, without augmentation.
    pub fn histogram<T, A>(&self, image: &Image<T, 1, A>) -> BofResult<Vec<u32>>
    where
        T: Pixel,
        A: ImageAllocator,
    {
        let (_, leaves) = self.leaves(image)?;
        let mut histogram = vec![0u32; self.leaf_count()];
        for leaf in leaves {
            histogram[leaf as usize] += 1;
        }
        Ok(histogram)
    }

    /// Compute one histogram per image and augmentation variant.
    ///
    /// Without `pool` the result holds `images.len() × variants` histograms,
    /// source image major and variant minor. With `pool` the variants of each
    /// image are summed into a single histogram.
    pub fn predict<T, A>(&self, images: &[Image<T, 1, A>], pool: bool) -> BofResult<Vec<Vec<u32>>>
    where
        T: Pixel,
        A: ImageAllocator,
    {
        // patch extraction and leaf assignment are parallel within each variant
        let per_image = images
            .iter()
            .map(|image| {
                self.augment
                    .augment(image)?
                    .iter()
                    .map(|variant| self.histogram(variant))
                    .collect::<BofResult<Vec<_>>>()
            })
            .collect::<BofResult<Vec<_>>>()?;

        if !pool {
            return Ok(per_image.into_iter().flatten().collect());
        }

        Ok(per_image
            .into_iter()
            .map(|variants| {
                let mut pooled = vec![0u32; self.leaf_count()];
                for histogram in variants {
                    pooled
                        .iter_mut()
                        .zip(histogram)
                        .for_each(|(p, h)| *p += h);
                }
                pooled
            })
            .collect())
    }

    /// Dense one-hot leaf assignment of every valid patch position.
    pub fn predict_pixels<T, A>(&self, image: &Image<T, 1, A>) -> BofResult<OneHotMap>
    where
        T: Pixel,
        A: ImageAllocator,
    {
        let (out, leaves) = self.leaves(image)?;
        Ok(OneHotMap::from_leaves(out, self.leaf_count(), &leaves))
    }

    pub(crate) fn check(&self) -> BofResult<()> {
        self.codebook.check()?;
        let dim = self.patch_edge * self.patch_edge;
        if self.whitener.dim() != dim
            || self.codebook.dim() != dim
            || self.whitener.matrix().len() != dim * dim
            || self.whitener.mean().len() != dim
        {
            return Err(BofError::CorruptedModel(format!(
                "parts disagree with patch edge {}",
                self.patch_edge
            )));
        }
        if self.whitener.matrix().iter().any(|v| !v.is_finite()) {
            return Err(BofError::NonFinite("whitening matrix"));
        }
        Ok(())
    }
}

/// Learns a patch codebook from a corpus and encodes images as histograms of
/// codeword occurrences.
///
/// # Example
///
/// ```
/// use kornia_bof::{BagOfFeaturesEncoder, BofConfig};
/// use kornia_image::{allocator::CpuAllocator, Image, ImageSize};
///
/// let size = ImageSize { width: 20, height: 20 };
/// let images: Vec<Image<u8, 1, CpuAllocator>> = (0..4u8)
///     .map(|i| {
///         let data = (0..400).map(|p| ((p * 7 + i as usize * 13) % 251) as u8).collect();
///         Image::new(size, data, CpuAllocator)
///     })
///     .collect::<Result<_, _>>()
///     .unwrap();
///
/// let mut encoder = BagOfFeaturesEncoder::new(BofConfig::default().with_n_clusters(4).with_seed(0)).unwrap();
/// encoder.fit(images.clone(), images.len()).unwrap();
///
/// let histograms = encoder.predict(&images, false).unwrap();
/// assert_eq!(histograms.len(), 4);
/// assert!(histograms.iter().all(|h| h.iter().sum::<u32>() == 14 * 14));
/// ```
#[derive(Clone, Debug)]
pub struct BagOfFeaturesEncoder {
    config: BofConfig,
    model: Option<BofModel>,
}

impl BagOfFeaturesEncoder {
    /// Create an unfitted encoder.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: BofConfig) -> BofResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            model: None,
        })
    }

    /// Wrap an already fitted model, e.g. one loaded from disk.
    pub fn from_model(model: BofModel) -> Self {
        let config = BofConfig {
            patch_edge: model.patch_edge(),
            n_clusters: model.codebook().k(),
            levels: model.codebook().levels(),
            augment: model.augment(),
            ..BofConfig::default()
        };
        Self {
            config,
            model: Some(model),
        }
    }

    /// The encoder configuration.
    pub fn config(&self) -> &BofConfig {
        &self.config
    }

    /// The fitted model, if any.
    pub fn model(&self) -> Option<&BofModel> {
        self.model.as_ref()
    }

    /// Take ownership of the fitted model, if any.
    pub fn into_model(self) -> Option<BofModel> {
        self.model
    }

    /// Whether `fit` has completed successfully.
    pub fn is_fitted(&self) -> bool {
        self.model.is_some()
    }

    fn fitted(&self) -> BofResult<&BofModel> {
        self.model.as_ref().ok_or(BofError::NotFitted)
    }

    /// Learn the whitening transform and the codebook from a corpus.
    ///
    /// Consumes the first `image_count` images of `images`. Every image is
    /// expanded through the augmentation policy, `patches_per_image` patches
    /// are sampled from each variant, the whitening transform is fitted on the
    /// sample and the codebook is fitted on the whitened sample. Any previously
    /// fitted model is replaced.
    ///
    /// # Errors
    ///
    /// Returns an error if the corpus is empty or shorter than `image_count`,
    /// if an image is smaller than the patch or holds non-finite pixels, if a
    /// codebook branch receives no patches, or if fitting produces non-finite
    /// parameters.
    pub fn fit<I, T, A>(&mut self, images: I, image_count: usize) -> BofResult<&BofModel>
    where
        I: IntoIterator<Item = Image<T, 1, A>>,
        T: Pixel,
        A: ImageAllocator,
    {
        let config = &self.config;
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        log::info!(
            "fitting bag of features: {} images, patch edge {}, k={}, levels={}, augment={}",
            image_count,
            config.patch_edge,
            config.n_clusters,
            config.levels,
            config.augment
        );

        let patches = collect_normalized_patches(
            images,
            image_count,
            config.patch_edge,
            config.patches_per_image,
            config.augment,
            &mut rng,
        )?;

        let whitener = Whitener::fit(&patches, config.whiten_epsilon)?;
        let whitened = whitener.apply(&patches)?;

        let codebook = HierarchicalCodebook::fit(
            &whitened,
            config.n_clusters,
            config.levels,
            &config.kmeans_params(),
            &mut rng,
        )?;

        let model = BofModel::new(config.patch_edge, config.augment, whitener, codebook)?;

        log::info!(
            "fitted {} codewords on {} patches",
            model.leaf_count(),
            patches.rows()
        );

        Ok(self.model.insert(model))
    }

    /// Assign every valid patch position of `image` to a codeword.
    ///
    /// See [`BofModel::transform`].
    pub fn transform<T, A>(&self, image: &Image<T, 1, A>, reshape: bool) -> BofResult<LeafAssignment>
    where
        T: Pixel,
        A: ImageAllocator,
    {
        self.fitted()?.transform(image, reshape)
    }

    /// Histograms of codeword occurrences, optionally pooled over augmented
    /// variants.
    ///
    /// See [`BofModel::predict`].
    pub fn predict<T, A>(&self, images: &[Image<T, 1, A>], pool: bool) -> BofResult<Vec<Vec<u32>>>
    where
        T: Pixel,
        A: ImageAllocator,
    {
        self.fitted()?.predict(images, pool)
    }

    /// Dense one-hot codeword assignment per pixel position.
    pub fn predict_pixels<T, A>(&self, image: &Image<T, 1, A>) -> BofResult<OneHotMap>
    where
        T: Pixel,
        A: ImageAllocator,
    {
        self.fitted()?.predict_pixels(image)
    }
}
