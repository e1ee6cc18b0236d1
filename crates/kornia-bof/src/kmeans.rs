use bincode::{Decode, Encode};
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{BofError, BofResult};
use crate::patch::Patches;

/// Stopping criteria for the relocation loop.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct KMeansParams {
    /// Upper bound on assign / update rounds.
    pub max_iterations: usize,
    /// Stop once no centroid moves farther than this (Euclidean).
    pub tolerance: f32,
}

impl Default for KMeansParams {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-4,
        }
    }
}

/// Squared Euclidean distance.
#[inline(always)]
pub fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

// index and squared distance of the closest centroid, lowest index on ties
#[inline(always)]
fn nearest_in(centroids: &[f32], dim: usize, point: &[f32]) -> (usize, f32) {
    let mut best_idx = 0;
    let mut best_dist = f32::INFINITY;
    for (i, centroid) in centroids.chunks_exact(dim).enumerate() {
        let dist = squared_distance(point, centroid);
        if dist < best_dist {
            best_dist = dist;
            best_idx = i;
        }
    }
    (best_idx, best_dist)
}

/// Seeds `k_clusters` centroids using the KMeans++ algorithm.
fn kmeans_plusplus<R: Rng + ?Sized>(data: &Patches, k_clusters: usize, rng: &mut R) -> Vec<f32> {
    let n = data.rows();
    let dim = data.dim();
    let mut centroids = Vec::with_capacity(k_clusters * dim);

    let first = rng.random_range(0..n);
    centroids.extend_from_slice(data.row(first));

    let mut distances = vec![f32::INFINITY; n];

    for c in 1..k_clusters {
        let last_centroid = &centroids[(c - 1) * dim..c * dim];

        distances
            .par_iter_mut()
            .zip(data.par_iter())
            .for_each(|(min_dist, point)| {
                let dist = squared_distance(point, last_centroid);
                if dist < *min_dist {
                    *min_dist = dist;
                }
            });

        let total_dist: f32 = distances.iter().sum();

        let chosen_idx = if total_dist > 0.0 && total_dist.is_finite() {
            let mut rand_val = rng.random_range(0.0..1.0) * total_dist;
            let mut chosen_idx = n - 1;
            for (i, &dist) in distances.iter().enumerate() {
                rand_val -= dist;
                if rand_val <= 0.0 && dist > 0.0 {
                    chosen_idx = i;
                    break;
                }
            }
            chosen_idx
        } else {
            // every point coincides with a centroid already
            rng.random_range(0..n)
        };

        centroids.extend_from_slice(data.row(chosen_idx));
    }

    centroids
}

/// A flat codebook fitted with iterative relocation (Lloyd's algorithm).
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct KMeans {
    // row-major k x dim
    centroids: Vec<f32>,
    k: usize,
    dim: usize,
}

impl KMeans {
    /// Fit `k` centroids on `data`.
    ///
    /// Seeding uses KMeans++; the relocation loop stops when assignments are
    /// stable, when no centroid moves more than `params.tolerance`, or after
    /// `params.max_iterations` rounds. Clusters that lose all their points keep
    /// their previous centroid. Fewer distinct points than `k` produce duplicate
    /// centroids.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` is empty, `k` is zero, or the fitted
    /// centroids are not finite.
    pub fn fit<R: Rng + ?Sized>(
        data: &Patches,
        k: usize,
        params: &KMeansParams,
        rng: &mut R,
    ) -> BofResult<Self> {
        if data.is_empty() {
            return Err(BofError::EmptyCorpus);
        }
        if k == 0 {
            return Err(BofError::InvalidConfig(
                "number of clusters must be greater than zero".to_string(),
            ));
        }

        let n = data.rows();
        let dim = data.dim();
        let mut centroids = kmeans_plusplus(data, k, rng);
        let mut assignments = vec![usize::MAX; n];
        let tolerance_sq = params.tolerance * params.tolerance;

        let mut converged = false;
        let mut iterations = 0;

        while iterations < params.max_iterations {
            iterations += 1;

            let new_assignments: Vec<usize> = data
                .par_iter()
                .map(|point| nearest_in(&centroids, dim, point).0)
                .collect();

            let changed = assignments
                .iter()
                .zip(&new_assignments)
                .filter(|(a, b)| a != b)
                .count();
            assignments = new_assignments;

            let mut sums = vec![0.0f64; k * dim];
            let mut counts = vec![0usize; k];
            for (point, &a) in data.iter().zip(&assignments) {
                counts[a] += 1;
                for (s, &v) in sums[a * dim..(a + 1) * dim].iter_mut().zip(point) {
                    *s += v as f64;
                }
            }

            let mut max_shift = 0.0f32;
            for c in 0..k {
                if counts[c] == 0 {
                    continue;
                }
                let inv = 1.0 / counts[c] as f64;
                let updated: Vec<f32> = sums[c * dim..(c + 1) * dim]
                    .iter()
                    .map(|s| (s * inv) as f32)
                    .collect();
                let old = &mut centroids[c * dim..(c + 1) * dim];
                max_shift = max_shift.max(squared_distance(old, &updated));
                old.copy_from_slice(&updated);
            }

            if changed == 0 || max_shift <= tolerance_sq {
                converged = true;
                break;
            }
        }

        if centroids.iter().any(|v| !v.is_finite()) {
            return Err(BofError::NonFinite("cluster centroids"));
        }

        if converged {
            log::debug!("k-means (k={k}, n={n}) converged after {iterations} iterations");
        } else {
            log::debug!("k-means (k={k}, n={n}) stopped at the iteration cap ({iterations})");
        }

        Ok(Self { centroids, k, dim })
    }

    /// Build a codebook from explicit centroids, one per row.
    pub fn from_centroids(centroids: Patches) -> BofResult<Self> {
        if centroids.is_empty() {
            return Err(BofError::EmptyCorpus);
        }
        if centroids.as_slice().iter().any(|v| !v.is_finite()) {
            return Err(BofError::NonFinite("cluster centroids"));
        }
        Ok(Self {
            k: centroids.rows(),
            dim: centroids.dim(),
            centroids: centroids.as_slice().to_vec(),
        })
    }

    /// Number of centroids.
    pub fn k(&self) -> usize {
        self.k
    }

    /// Dimension of each centroid.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// The row-major `k × dim` centroid buffer.
    pub fn centroids(&self) -> &[f32] {
        &self.centroids
    }

    /// Borrow centroid `i`.
    pub fn centroid(&self, i: usize) -> &[f32] {
        &self.centroids[i * self.dim..(i + 1) * self.dim]
    }

    /// Index of the centroid closest to `point`, lowest index on ties.
    pub fn nearest(&self, point: &[f32]) -> usize {
        nearest_in(&self.centroids, self.dim, point).0
    }

    /// Nearest centroid index for every row of `data`.
    pub fn assign(&self, data: &Patches) -> BofResult<Vec<usize>> {
        if data.dim() != self.dim {
            return Err(BofError::DimensionMismatch {
                expected: self.dim,
                found: data.dim(),
            });
        }
        Ok(data.par_iter().map(|point| self.nearest(point)).collect())
    }

    pub(crate) fn check(&self) -> BofResult<()> {
        if self.k == 0 || self.dim == 0 || self.centroids.len() != self.k * self.dim {
            return Err(BofError::CorruptedModel(format!(
                "codebook with k={} dim={} holds {} values",
                self.k,
                self.dim,
                self.centroids.len()
            )));
        }
        if self.centroids.iter().any(|v| !v.is_finite()) {
            return Err(BofError::NonFinite("cluster centroids"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    // three well separated 2-d blobs
    fn blobs(per_blob: usize) -> Patches {
        let mut rng = StdRng::seed_from_u64(42);
        let centers = [[0.0f32, 0.0], [10.0, 10.0], [-10.0, 10.0]];
        let mut data = Vec::new();
        for center in centers {
            for _ in 0..per_blob {
                data.push(center[0] + rng.random_range(-0.5..0.5));
                data.push(center[1] + rng.random_range(-0.5..0.5));
            }
        }
        Patches::from_vec(data, 2).unwrap()
    }

    #[test]
    fn test_fit_separates_blobs() -> Result<(), BofError> {
        let data = blobs(50);
        let mut rng = StdRng::seed_from_u64(0);
        let kmeans = KMeans::fit(&data, 3, &KMeansParams::default(), &mut rng)?;
        assert_eq!(kmeans.k(), 3);
        assert_eq!(kmeans.dim(), 2);

        let labels = kmeans.assign(&data)?;
        for blob in labels.chunks(50) {
            assert!(blob.iter().all(|&l| l == blob[0]));
        }
        assert_ne!(labels[0], labels[50]);
        assert_ne!(labels[50], labels[100]);
        assert_ne!(labels[0], labels[100]);
        Ok(())
    }

    #[test]
    fn test_fit_fewer_points_than_clusters() -> Result<(), BofError> {
        let data = Patches::from_vec(vec![1.0, 1.0, 2.0, 2.0], 2)?;
        let mut rng = StdRng::seed_from_u64(0);
        let kmeans = KMeans::fit(&data, 5, &KMeansParams::default(), &mut rng)?;
        assert_eq!(kmeans.k(), 5);
        assert!(kmeans.centroids().iter().all(|v| v.is_finite()));
        Ok(())
    }

    #[test]
    fn test_check_rejects_non_finite_centroids() {
        let kmeans = KMeans {
            centroids: vec![f32::NAN, 0.0],
            k: 1,
            dim: 2,
        };
        assert!(matches!(kmeans.check(), Err(BofError::NonFinite(_))));

        let kmeans = KMeans {
            centroids: vec![f32::INFINITY, 0.0, 1.0, 1.0],
            k: 2,
            dim: 2,
        };
        assert!(matches!(kmeans.check(), Err(BofError::NonFinite(_))));
    }

    #[test]
    fn test_identical_points() -> Result<(), BofError> {
        let data = Patches::from_vec([0.3f32, -0.2].repeat(40), 2)?;
        let mut rng = StdRng::seed_from_u64(1);
        let kmeans = KMeans::fit(&data, 4, &KMeansParams::default(), &mut rng)?;
        // all centroids coincide, ties resolve to the first one
        assert!(kmeans.assign(&data)?.iter().all(|&l| l == 0));
        Ok(())
    }

    #[test]
    fn test_tie_break_lowest_index() -> Result<(), BofError> {
        let centroids = Patches::from_vec(vec![1.0, 0.0, -1.0, 0.0, 1.0, 0.0], 2)?;
        let kmeans = KMeans::from_centroids(centroids)?;
        // equidistant from all three
        assert_eq!(kmeans.nearest(&[0.0, 0.0]), 0);
        assert_eq!(kmeans.nearest(&[0.9, 0.0]), 0);
        assert_eq!(kmeans.nearest(&[-0.9, 0.0]), 1);
        Ok(())
    }

    #[test]
    fn test_iteration_cap_is_not_an_error() -> Result<(), BofError> {
        let data = blobs(20);
        let mut rng = StdRng::seed_from_u64(3);
        let params = KMeansParams {
            max_iterations: 1,
            tolerance: 0.0,
        };
        let kmeans = KMeans::fit(&data, 3, &params, &mut rng)?;
        assert_eq!(kmeans.centroids().len(), 6);
        Ok(())
    }

    #[test]
    fn test_fit_errors() {
        let mut rng = StdRng::seed_from_u64(0);
        let params = KMeansParams::default();
        assert!(matches!(
            KMeans::fit(&Patches::new(2), 3, &params, &mut rng),
            Err(BofError::EmptyCorpus)
        ));
        assert!(matches!(
            KMeans::fit(&blobs(2), 0, &params, &mut rng),
            Err(BofError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_assign_dimension_mismatch() -> Result<(), BofError> {
        let kmeans = KMeans::from_centroids(Patches::from_vec(vec![0.0; 6], 3)?)?;
        let data = Patches::from_vec(vec![0.0; 4], 2)?;
        assert!(matches!(
            kmeans.assign(&data),
            Err(BofError::DimensionMismatch { .. })
        ));
        Ok(())
    }
}
