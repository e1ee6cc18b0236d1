use bincode::{Decode, Encode};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use crate::error::{BofError, BofResult};
use crate::patch::Patches;

/// A linear ZCA whitening transform over patch space.
///
/// The transform is `W = U · diag(1 / sqrt(λ + ε)) · Uᵀ` where `U Λ Uᵀ` is the
/// eigen-decomposition of the sample covariance. `ε` keeps near-zero variance
/// directions from being amplified without bound.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct Whitener {
    // row-major dim x dim
    matrix: Vec<f32>,
    mean: Vec<f32>,
    dim: usize,
}

impl Whitener {
    /// A transform that leaves vectors unchanged.
    pub fn identity(dim: usize) -> Self {
        let mut matrix = vec![0.0; dim * dim];
        for i in 0..dim {
            matrix[i * dim + i] = 1.0;
        }
        Self {
            matrix,
            mean: vec![0.0; dim],
            dim,
        }
    }

    /// Fit the whitening transform on a sample of patches.
    ///
    /// # Arguments
    ///
    /// * `patches` - The training sample, one patch per row.
    /// * `epsilon` - Regularizer added to every eigenvalue, must be positive.
    ///
    /// # Errors
    ///
    /// Returns an error if the sample is empty, `epsilon` is not positive, or the
    /// resulting transform is not finite.
    pub fn fit(patches: &Patches, epsilon: f32) -> BofResult<Self> {
        if patches.is_empty() {
            return Err(BofError::EmptyCorpus);
        }
        if !(epsilon > 0.0 && epsilon.is_finite()) {
            return Err(BofError::InvalidConfig(format!(
                "whitening epsilon must be positive, got {epsilon}"
            )));
        }

        let dim = patches.dim();
        let n = patches.rows() as f64;

        let mut mean = vec![0.0f64; dim];
        for row in patches.iter() {
            for (m, &v) in mean.iter_mut().zip(row) {
                *m += v as f64;
            }
        }
        mean.iter_mut().for_each(|m| *m /= n);

        // upper triangle of the scatter matrix, accumulated per rayon chunk
        let scatter = patches
            .par_iter()
            .fold(
                || vec![0.0f64; dim * dim],
                |mut acc, row| {
                    for i in 0..dim {
                        let di = row[i] as f64 - mean[i];
                        for j in i..dim {
                            acc[i * dim + j] += di * (row[j] as f64 - mean[j]);
                        }
                    }
                    acc
                },
            )
            .reduce(
                || vec![0.0f64; dim * dim],
                |mut a, b| {
                    a.iter_mut().zip(b).for_each(|(x, y)| *x += y);
                    a
                },
            );

        let covariance = DMatrix::<f64>::from_fn(dim, dim, |i, j| {
            let (lo, hi) = if i <= j { (i, j) } else { (j, i) };
            scatter[lo * dim + hi] / n
        });

        let eig = covariance.symmetric_eigen();
        let eps = epsilon as f64;
        let scale = DVector::<f64>::from_iterator(
            dim,
            eig.eigenvalues
                .iter()
                .map(|&lambda| 1.0 / (lambda.max(0.0) + eps).sqrt()),
        );

        let u = &eig.eigenvectors;
        let w = u * DMatrix::from_diagonal(&scale) * u.transpose();

        let mut matrix = Vec::with_capacity(dim * dim);
        for i in 0..dim {
            for j in 0..dim {
                matrix.push(w[(i, j)] as f32);
            }
        }

        if matrix.iter().any(|v| !v.is_finite()) {
            return Err(BofError::NonFinite("whitening matrix"));
        }

        log::debug!(
            "fitted whitening over {} patches, eigenvalues in [{:.3e}, {:.3e}]",
            patches.rows(),
            eig.eigenvalues.min(),
            eig.eigenvalues.max()
        );

        Ok(Self {
            matrix,
            mean: mean.into_iter().map(|m| m as f32).collect(),
            dim,
        })
    }

    /// Dimension of the vectors the transform acts on.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// The row-major `dim × dim` whitening matrix.
    pub fn matrix(&self) -> &[f32] {
        &self.matrix
    }

    /// Mean of the sample the transform was fitted on.
    pub fn mean(&self) -> &[f32] {
        &self.mean
    }

    /// Project a single vector, `W · v`.
    pub fn apply_vector(&self, v: &[f32]) -> BofResult<Vec<f32>> {
        if v.len() != self.dim {
            return Err(BofError::DimensionMismatch {
                expected: self.dim,
                found: v.len(),
            });
        }
        let mut out = vec![0.0; self.dim];
        self.project(v, &mut out);
        Ok(out)
    }

    /// Project every row of `patches` into whitened space.
    pub fn apply(&self, patches: &Patches) -> BofResult<Patches> {
        if patches.dim() != self.dim {
            return Err(BofError::DimensionMismatch {
                expected: self.dim,
                found: patches.dim(),
            });
        }

        let mut out = vec![0.0f32; patches.as_slice().len()];
        out.par_chunks_exact_mut(self.dim.max(1))
            .zip(patches.par_iter())
            .for_each(|(dst, src)| self.project(src, dst));

        Patches::from_vec(out, self.dim)
    }

    fn project(&self, src: &[f32], dst: &mut [f32]) {
        for (d, w_row) in dst.iter_mut().zip(self.matrix.chunks_exact(self.dim)) {
            *d = w_row.iter().zip(src).map(|(w, s)| w * s).sum();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    // correlated 3-d samples: the third coordinate is a mix of the first two
    fn correlated_patches(count: usize) -> Patches {
        let mut rng = StdRng::seed_from_u64(42);
        let mut data = Vec::with_capacity(count * 3);
        for _ in 0..count {
            let a: f32 = rng.random_range(-1.0..1.0);
            let b: f32 = rng.random_range(-1.0..1.0);
            let noise: f32 = rng.random_range(-0.1..0.1);
            data.extend_from_slice(&[a, 2.0 * b, a + b + noise]);
        }
        Patches::from_vec(data, 3).unwrap()
    }

    fn covariance(patches: &Patches) -> Vec<f64> {
        let dim = patches.dim();
        let n = patches.rows() as f64;
        let mut mean = vec![0.0f64; dim];
        for row in patches.iter() {
            for i in 0..dim {
                mean[i] += row[i] as f64 / n;
            }
        }
        let mut cov = vec![0.0f64; dim * dim];
        for row in patches.iter() {
            for i in 0..dim {
                for j in 0..dim {
                    cov[i * dim + j] += (row[i] as f64 - mean[i]) * (row[j] as f64 - mean[j]) / n;
                }
            }
        }
        cov
    }

    #[test]
    fn test_whitened_covariance_is_identity() -> Result<(), BofError> {
        let patches = correlated_patches(5000);
        let whitener = Whitener::fit(&patches, 1e-6)?;
        let whitened = whitener.apply(&patches)?;
        let cov = covariance(&whitened);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(cov[i * 3 + j], expected, epsilon = 1e-2);
            }
        }
        Ok(())
    }

    #[test]
    fn test_matrix_is_symmetric() -> Result<(), BofError> {
        let whitener = Whitener::fit(&correlated_patches(500), 1e-3)?;
        let m = whitener.matrix();
        for i in 0..3 {
            for j in 0..3 {
                assert_abs_diff_eq!(m[i * 3 + j], m[j * 3 + i], epsilon = 1e-4);
            }
        }
        Ok(())
    }

    #[test]
    fn test_degenerate_sample_stays_finite() -> Result<(), BofError> {
        // every row identical: zero covariance
        let patches = Patches::from_vec([0.5f32, 0.5, 0.5, 0.5].repeat(20), 4)?;
        let whitener = Whitener::fit(&patches, 1e-2)?;
        assert!(whitener.matrix().iter().all(|v| v.is_finite()));
        let out = whitener.apply(&patches)?;
        assert!(out.as_slice().iter().all(|v| v.is_finite()));
        // W = I / sqrt(eps)
        assert_abs_diff_eq!(whitener.matrix()[0], 10.0, epsilon = 1e-3);
        Ok(())
    }

    #[test]
    fn test_apply_vector_matches_apply() -> Result<(), BofError> {
        let patches = correlated_patches(200);
        let whitener = Whitener::fit(&patches, 1e-3)?;
        let all = whitener.apply(&patches)?;
        let single = whitener.apply_vector(patches.row(17))?;
        for (a, b) in all.row(17).iter().zip(single) {
            assert_abs_diff_eq!(*a, b, epsilon = 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_fit_errors() {
        assert!(matches!(
            Whitener::fit(&Patches::new(4), 1e-3),
            Err(BofError::EmptyCorpus)
        ));
        assert!(matches!(
            Whitener::fit(&correlated_patches(10), 0.0),
            Err(BofError::InvalidConfig(_))
        ));
        let whitener = Whitener::identity(3);
        assert!(matches!(
            whitener.apply_vector(&[1.0, 2.0]),
            Err(BofError::DimensionMismatch {
                expected: 3,
                found: 2
            })
        ));
    }
}
