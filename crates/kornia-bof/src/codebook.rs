use bincode::{Decode, Encode};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rayon::prelude::*;

use crate::error::{BofError, BofResult};
use crate::kmeans::{KMeans, KMeansParams};
use crate::patch::Patches;
use crate::whiten::Whitener;

/// A node of the codebook tree: one flat codebook plus, below the last
/// level, one child per centroid.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct CodebookNode {
    kmeans: KMeans,
    children: Vec<CodebookNode>,
}

impl CodebookNode {
    /// The codebook at this node.
    pub fn kmeans(&self) -> &KMeans {
        &self.kmeans
    }

    /// The refining codebooks, empty at the last level.
    pub fn children(&self) -> &[CodebookNode] {
        &self.children
    }

    /// Whether the node belongs to the last level.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// An entry of the structure produced by [`HierarchicalCodebook::combine_projected`].
#[derive(Clone, Debug, PartialEq)]
pub enum CombinedEntry {
    /// A centroid projected through the whitening matrix.
    Centroid(Vec<f32>),
    /// The combined structure of every child codebook, in centroid order.
    Nested(Vec<Vec<CombinedEntry>>),
}

/// A tree of codebooks with branching factor `k` and depth `levels`.
///
/// Leaves are addressed by one digit per level and exposed as the flat index
/// `d_1·k^(levels-1) + … + d_levels`, so leaves are ordered lexicographically
/// by their path.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct HierarchicalCodebook {
    root: CodebookNode,
    k: usize,
    levels: usize,
}

/// Number of leaves of a `k`-ary tree of depth `levels`, if indexable with `u32`.
pub fn leaf_count(k: usize, levels: usize) -> BofResult<usize> {
    if k == 0 || levels == 0 {
        return Err(BofError::InvalidConfig(format!(
            "codebook needs at least one cluster and one level, got k={k} levels={levels}"
        )));
    }
    u32::try_from(levels)
        .ok()
        .and_then(|levels| k.checked_pow(levels))
        .filter(|&count| count <= u32::MAX as usize)
        .ok_or_else(|| {
            BofError::InvalidConfig(format!(
                "k^levels overflows the leaf index space (k={k}, levels={levels})"
            ))
        })
}

fn fit_node<R: Rng + ?Sized>(
    data: &Patches,
    k: usize,
    levels: usize,
    depth: usize,
    params: &KMeansParams,
    rng: &mut R,
) -> BofResult<CodebookNode> {
    let kmeans = KMeans::fit(data, k, params, rng)?;
    if levels == 1 {
        return Ok(CodebookNode {
            kmeans,
            children: Vec::new(),
        });
    }

    let assignments = kmeans.assign(data)?;
    let mut partitions: Vec<Patches> = (0..k).map(|_| Patches::new(data.dim())).collect();
    for (point, &a) in data.iter().zip(&assignments) {
        partitions[a].push(point)?;
    }

    if let Some(cluster) = partitions.iter().position(Patches::is_empty) {
        return Err(BofError::EmptyPartition {
            level: depth,
            cluster,
        });
    }

    log::debug!(
        "level {depth}: partition sizes {:?}",
        partitions.iter().map(Patches::rows).collect::<Vec<_>>()
    );

    // one seed per branch keeps the parallel fit reproducible
    let seeds: Vec<u64> = (0..k).map(|_| rng.random()).collect();

    let children = partitions
        .par_iter()
        .zip(seeds)
        .map(|(partition, seed)| {
            let mut child_rng = StdRng::seed_from_u64(seed);
            fit_node(partition, k, levels - 1, depth + 1, params, &mut child_rng)
        })
        .collect::<BofResult<Vec<_>>>()?;

    Ok(CodebookNode { kmeans, children })
}

fn combine_node(node: &CodebookNode, whitener: &Whitener) -> BofResult<Vec<CombinedEntry>> {
    let mut combined = (0..node.kmeans.k())
        .map(|i| {
            whitener
                .apply_vector(node.kmeans.centroid(i))
                .map(CombinedEntry::Centroid)
        })
        .collect::<BofResult<Vec<_>>>()?;

    if !node.children.is_empty() {
        let nested = node
            .children
            .iter()
            .map(|child| combine_node(child, whitener))
            .collect::<BofResult<Vec<_>>>()?;
        combined.push(CombinedEntry::Nested(nested));
    }

    Ok(combined)
}

fn check_node(node: &CodebookNode, k: usize, dim: usize, remaining: usize) -> BofResult<()> {
    node.kmeans.check()?;
    if node.kmeans.k() != k || node.kmeans.dim() != dim {
        return Err(BofError::CorruptedModel(format!(
            "node with k={} dim={} in a codebook with k={k} dim={dim}",
            node.kmeans.k(),
            node.kmeans.dim()
        )));
    }
    let expected_children = if remaining == 1 { 0 } else { k };
    if node.children.len() != expected_children {
        return Err(BofError::CorruptedModel(format!(
            "node has {} children, expected {expected_children}",
            node.children.len()
        )));
    }
    node.children
        .iter()
        .try_for_each(|child| check_node(child, k, dim, remaining - 1))
}

impl HierarchicalCodebook {
    /// Fit a codebook tree on whitened patches.
    ///
    /// The first level clusters every patch into `k` groups; each deeper level
    /// refines one group of the level above with its own `k` centroids, fitted
    /// only on the patches assigned to that group, so the leaf space is always
    /// exactly `k^levels`.
    ///
    /// # Errors
    ///
    /// Returns an error if `patches` is empty, `k` or `levels` is zero,
    /// `k^levels` does not fit the leaf index type, or a group above the last
    /// level receives no patches.
    pub fn fit<R: Rng + ?Sized>(
        patches: &Patches,
        k: usize,
        levels: usize,
        params: &KMeansParams,
        rng: &mut R,
    ) -> BofResult<Self> {
        let leaves = leaf_count(k, levels)?;
        if patches.is_empty() {
            return Err(BofError::EmptyCorpus);
        }

        log::debug!(
            "fitting {levels}-level codebook with k={k} ({leaves} leaves) on {} patches",
            patches.rows()
        );

        let root = fit_node(patches, k, levels, 1, params, rng)?;
        Ok(Self { root, k, levels })
    }

    /// Wrap a single flat codebook as a one-level tree.
    pub fn from_kmeans(kmeans: KMeans) -> Self {
        Self {
            k: kmeans.k(),
            levels: 1,
            root: CodebookNode {
                kmeans,
                children: Vec::new(),
            },
        }
    }

    /// Branching factor.
    pub fn k(&self) -> usize {
        self.k
    }

    /// Depth of the tree.
    pub fn levels(&self) -> usize {
        self.levels
    }

    /// Dimension of the centroids.
    pub fn dim(&self) -> usize {
        self.root.kmeans.dim()
    }

    /// The first level codebook.
    pub fn root(&self) -> &CodebookNode {
        &self.root
    }

    /// Total number of leaves, `k^levels`.
    pub fn leaf_count(&self) -> usize {
        self.k.pow(self.levels as u32)
    }

    /// Flat leaf index of a single whitened vector.
    pub fn assign_one(&self, point: &[f32]) -> u32 {
        let mut node = &self.root;
        let mut index = 0usize;
        loop {
            let c = node.kmeans.nearest(point);
            index = index * self.k + c;
            match node.children.get(c) {
                Some(child) => node = child,
                None => return index as u32,
            }
        }
    }

    /// Flat leaf index of every row of `patches`.
    pub fn assign(&self, patches: &Patches) -> BofResult<Vec<u32>> {
        if patches.dim() != self.dim() {
            return Err(BofError::DimensionMismatch {
                expected: self.dim(),
                found: patches.dim(),
            });
        }
        Ok(patches
            .par_iter()
            .map(|point| self.assign_one(point))
            .collect())
    }

    /// Per-level digits of a flat leaf index, most significant first.
    pub fn leaf_path(&self, index: usize) -> Option<Vec<usize>> {
        if index >= self.leaf_count() {
            return None;
        }
        let mut path = vec![0; self.levels];
        let mut rest = index;
        for digit in path.iter_mut().rev() {
            *digit = rest % self.k;
            rest /= self.k;
        }
        Some(path)
    }

    /// The last level centroid addressed by a flat leaf index.
    pub fn leaf_centroid(&self, index: usize) -> Option<&[f32]> {
        let path = self.leaf_path(index)?;
        let mut node = &self.root;
        for &digit in &path[..path.len() - 1] {
            node = node.children.get(digit)?;
        }
        Some(node.kmeans.centroid(path[path.len() - 1]))
    }

    /// Project every centroid of the tree through `whitener` for inspection.
    ///
    /// For each node the result lists its `k` projected centroids and, if the
    /// node has children, one trailing [`CombinedEntry::Nested`] entry holding
    /// the combined structure of each child in order. A two level tree with
    /// `k = 10` therefore yields 11 entries.
    pub fn combine_projected(&self, whitener: &Whitener) -> BofResult<Vec<CombinedEntry>> {
        combine_node(&self.root, whitener)
    }

    pub(crate) fn check(&self) -> BofResult<()> {
        leaf_count(self.k, self.levels)?;
        check_node(&self.root, self.k, self.root.kmeans.dim(), self.levels)
    }
}
