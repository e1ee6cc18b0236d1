use kornia_image::{ImageError, ImageSize};

/// Errors related to Bag of Features operations.
#[derive(Debug, thiserror::Error)]
pub enum BofError {
    /// The image cannot hold a single patch.
    #[error("Image of size {size} is smaller than the patch edge {patch_edge}")]
    ImageTooSmall {
        /// Size of the offending image.
        size: ImageSize,
        /// Requested patch edge length.
        patch_edge: usize,
    },

    /// Error from the underlying image container.
    #[error(transparent)]
    Image(#[from] ImageError),

    /// No image or patch was provided.
    #[error("No images provided")]
    EmptyCorpus,

    /// The corpus ended before yielding the declared number of images.
    #[error("Expected {expected} images, but the corpus yielded {found}")]
    CorpusCountMismatch {
        /// Declared image count.
        expected: usize,
        /// Images actually observed.
        found: usize,
    },

    /// A configuration value is out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The augmentation policy name is not recognized.
    #[error("Unknown augmentation policy '{0}', expected one of none, rotate, reflect, both")]
    UnknownAugment(String),

    /// Vector dimensions do not agree.
    #[error("Dimension mismatch: expected {expected}, but found {found}")]
    DimensionMismatch {
        /// Expected dimension.
        expected: usize,
        /// Dimension found.
        found: usize,
    },

    /// A codebook branch received no patches to cluster.
    #[error(
        "Codebook branch {cluster} at level {level} received no patches, \
         the sample is too small for the requested levels"
    )]
    EmptyPartition {
        /// Depth of the parent node, the root is level 1.
        level: usize,
        /// Cluster of the parent node the branch descends from.
        cluster: usize,
    },

    /// A NaN or infinite value appeared in pixels or fitted parameters.
    #[error("Non-finite values in {0}")]
    NonFinite(&'static str),

    /// Inference was requested before fitting.
    #[error("Encoder has not been fitted")]
    NotFitted,

    /// Io error.
    #[error("Io error")]
    Io(#[from] std::io::Error),

    /// Bincode error.
    #[error("Bincode error: {0}")]
    Bincode(String),

    /// The stored model header does not match the model body.
    #[error("Model mismatch: {0}")]
    ModelMismatch(String),

    /// The stored model is structurally invalid.
    #[error("Corrupted model: {0}")]
    CorruptedModel(String),
}

/// Result alias used across the crate.
pub type BofResult<T> = Result<T, BofError>;
