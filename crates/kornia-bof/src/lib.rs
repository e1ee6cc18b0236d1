#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

/// geometric augmentation of images.
pub mod augment;

/// hierarchical codebook of whitened patches.
pub mod codebook;

/// the encoder, its configuration and the fitted model.
pub mod encoder;

/// Error types for the bag of features module.
pub mod error;

/// model persistence.
pub mod io;

/// k-means clustering.
pub mod kmeans;

/// patch extraction and normalization.
pub mod patch;

/// ZCA whitening.
pub mod whiten;

pub use crate::augment::{Augment, Flip, Transform};
pub use crate::codebook::{CombinedEntry, HierarchicalCodebook};
pub use crate::encoder::{BagOfFeaturesEncoder, BofConfig, BofModel, LeafAssignment, OneHotMap};
pub use crate::error::{BofError, BofResult};
pub use crate::kmeans::{KMeans, KMeansParams};
pub use crate::patch::{Patches, Pixel};
pub use crate::whiten::Whitener;

pub use kornia_image::{allocator::CpuAllocator, Image, ImageSize};
