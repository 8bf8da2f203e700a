//! Randomized tree construction over the frozen vector store.
//!
//! Each tree recursively partitions the full ordinal set with random split
//! planes until partitions fit in a leaf record. Trees are independent:
//! every one gets its own seed and runs on a rayon worker, reading the
//! shared frozen store and writing only its private node vector.

use rand::prelude::*;
use rand_distr::StandardNormal;
use rayon::prelude::*;

use crate::format;
use crate::math;
use crate::Metric;

/// Fresh random planes tried before falling back to a forced median split.
const SPLIT_RETRIES: usize = 3;
/// Upper bound on the sample used to centre a projection split.
const PROJECTION_SAMPLE: usize = 256;

/// Read-only view of the frozen store used during build.
pub(crate) struct FrozenItems<'a> {
    pub dim: usize,
    pub count: usize,
    pub vectors: &'a [f32],
}

impl FrozenItems<'_> {
    fn vector(&self, ordinal: u32) -> &[f32] {
        &self.vectors[ordinal as usize * self.dim..][..self.dim]
    }
}

/// In-construction node; children are local indices within one tree.
enum TreeNode {
    Leaf {
        items: Vec<u32>,
    },
    Split {
        count: u32,
        left: u32,
        right: u32,
        normal: Vec<f32>,
        bias: f32,
    },
}

struct Plane {
    normal: Vec<f32>,
    bias: f32,
}

/// Build `n_trees` trees in parallel and encode them into the flat node
/// array of the image. Returns the encoded node bytes, one root index per
/// tree (global), and the total node count.
pub(crate) fn build_forest(
    items: &FrozenItems<'_>,
    metric: Metric,
    n_trees: usize,
    seed: u64,
) -> (Vec<u8>, Vec<u32>, usize) {
    let trees: Vec<Vec<TreeNode>> = (0..n_trees)
        .into_par_iter()
        .map(|tree| {
            let mut rng =
                StdRng::seed_from_u64(seed ^ (tree as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15));
            build_tree(items, metric, &mut rng)
        })
        .collect();
    encode_forest(items.dim, &trees)
}

fn build_tree(items: &FrozenItems<'_>, metric: Metric, rng: &mut StdRng) -> Vec<TreeNode> {
    let ordinals: Vec<u32> = (0..items.count as u32).collect();
    let mut nodes = Vec::new();
    build_subtree(items, metric, rng, ordinals, &mut nodes);
    nodes
}

/// Recursively partition `set`, appending children before their parent.
/// Returns the local index of the subtree root (the last node appended).
fn build_subtree(
    items: &FrozenItems<'_>,
    metric: Metric,
    rng: &mut StdRng,
    set: Vec<u32>,
    nodes: &mut Vec<TreeNode>,
) -> u32 {
    if set.len() <= format::leaf_cap(items.dim) {
        nodes.push(TreeNode::Leaf { items: set });
        return (nodes.len() - 1) as u32;
    }
    let count = set.len() as u32;
    let (plane, left_set, right_set) = split_set(items, metric, rng, &set);
    let left = build_subtree(items, metric, rng, left_set, nodes);
    let right = build_subtree(items, metric, rng, right_set, nodes);
    nodes.push(TreeNode::Split {
        count,
        left,
        right,
        normal: plane.normal,
        bias: plane.bias,
    });
    (nodes.len() - 1) as u32
}

/// Split a set with a random plane, retrying on degenerate partitions and
/// finally forcing a balanced median split so recursion always terminates.
fn split_set(
    items: &FrozenItems<'_>,
    metric: Metric,
    rng: &mut StdRng,
    set: &[u32],
) -> (Plane, Vec<u32>, Vec<u32>) {
    for _ in 0..SPLIT_RETRIES {
        let plane = create_plane(items, metric, rng, set);
        let (left, right) = partition(items, metric, rng, set, &plane);
        if !left.is_empty() && !right.is_empty() {
            return (plane, left, right);
        }
    }

    // Forced split: order by projection onto one more random plane (ordinal
    // order breaks ties, so identical vectors still divide) and cut at the
    // midpoint.
    let plane = create_plane(items, metric, rng, set);
    let mut ranked = set.to_vec();
    ranked.sort_by(|&a, &b| {
        let ma = metric.margin(&plane.normal, plane.bias, items.vector(a));
        let mb = metric.margin(&plane.normal, plane.bias, items.vector(b));
        ma.total_cmp(&mb).then_with(|| a.cmp(&b))
    });
    let right = ranked.split_off(ranked.len() / 2);
    (plane, ranked, right)
}

fn partition(
    items: &FrozenItems<'_>,
    metric: Metric,
    rng: &mut StdRng,
    set: &[u32],
    plane: &Plane,
) -> (Vec<u32>, Vec<u32>) {
    let mut left = Vec::new();
    let mut right = Vec::new();
    for &ordinal in set {
        let margin = metric.margin(&plane.normal, plane.bias, items.vector(ordinal));
        if margin > 0.0 {
            right.push(ordinal);
        } else if margin < 0.0 {
            left.push(ordinal);
        } else if rng.gen::<bool>() {
            right.push(ordinal);
        } else {
            left.push(ordinal);
        }
    }
    (left, right)
}

fn create_plane(
    items: &FrozenItems<'_>,
    metric: Metric,
    rng: &mut StdRng,
    set: &[u32],
) -> Plane {
    let dim = items.dim;
    match metric {
        Metric::Euclidean | Metric::Manhattan => {
            let (u, v) = sample_pair(items, rng, set);
            let mut normal: Vec<f32> = u.iter().zip(v.iter()).map(|(x, y)| x - y).collect();
            math::normalize(&mut normal);
            let bias = -normal
                .iter()
                .zip(u.iter().zip(v.iter()))
                .map(|(n, (x, y))| n * (x + y) * 0.5)
                .sum::<f32>();
            Plane { normal, bias }
        }
        Metric::Angular => {
            let (u, v) = sample_pair(items, rng, set);
            let mut du = u.to_vec();
            let mut dv = v.to_vec();
            math::normalize(&mut du);
            math::normalize(&mut dv);
            let mut normal: Vec<f32> = du.iter().zip(dv.iter()).map(|(x, y)| x - y).collect();
            math::normalize(&mut normal);
            Plane { normal, bias: 0.0 }
        }
        Metric::Dot => {
            // Gaussian projection vector, centred on the median projection
            // of a bounded sample of the set.
            let normal: Vec<f32> = (0..dim).map(|_| rng.sample(StandardNormal)).collect();
            let step = (set.len() / PROJECTION_SAMPLE).max(1);
            let mut projections: Vec<f32> = set
                .iter()
                .step_by(step)
                .map(|&ordinal| math::dot(&normal, items.vector(ordinal)))
                .collect();
            projections.sort_by(f32::total_cmp);
            let bias = -projections[projections.len() / 2];
            Plane { normal, bias }
        }
        Metric::Hamming => {
            // Coordinate test; the coordinate index rides in payload slot 0.
            let mut normal = vec![0.0f32; dim];
            normal[0] = rng.gen_range(0..dim) as f32;
            Plane { normal, bias: 0.0 }
        }
    }
}

/// Pick two distinct items from the set as split-plane anchors.
fn sample_pair<'a>(
    items: &'a FrozenItems<'_>,
    rng: &mut StdRng,
    set: &[u32],
) -> (&'a [f32], &'a [f32]) {
    let first = rng.gen_range(0..set.len());
    let mut second = rng.gen_range(0..set.len());
    while second == first {
        second = rng.gen_range(0..set.len());
    }
    (items.vector(set[first]), items.vector(set[second]))
}

/// Concatenate per-tree node vectors into one flat encoded array,
/// rebasing child indices. Roots come out last per tree because
/// construction appends post-order.
fn encode_forest(dim: usize, trees: &[Vec<TreeNode>]) -> (Vec<u8>, Vec<u32>, usize) {
    let node_count: usize = trees.iter().map(Vec::len).sum();
    let mut bytes = Vec::with_capacity(node_count * format::node_size(dim));
    let mut roots = Vec::with_capacity(trees.len());
    let mut base = 0u32;
    for tree in trees {
        for node in tree {
            match node {
                TreeNode::Leaf { items } => format::encode_leaf(&mut bytes, dim, items),
                TreeNode::Split {
                    count,
                    left,
                    right,
                    normal,
                    bias,
                } => format::encode_split(
                    &mut bytes,
                    dim,
                    *count,
                    base + *left,
                    base + *right,
                    normal,
                    *bias,
                ),
            }
        }
        base += tree.len() as u32;
        roots.push(base - 1);
    }
    (bytes, roots, node_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frozen(dim: usize, vectors: &[f32]) -> FrozenItems<'_> {
        FrozenItems {
            dim,
            count: vectors.len() / dim,
            vectors,
        }
    }

    /// Collect every item ordinal reachable from the tree root.
    fn collect_items(nodes: &[TreeNode], root: u32, out: &mut Vec<u32>) {
        match &nodes[root as usize] {
            TreeNode::Leaf { items } => out.extend_from_slice(items),
            TreeNode::Split { left, right, .. } => {
                collect_items(nodes, *left, out);
                collect_items(nodes, *right, out);
            }
        }
    }

    #[test]
    fn every_item_lands_in_exactly_one_leaf() {
        let mut rng = StdRng::seed_from_u64(99);
        let dim = 4;
        let vectors: Vec<f32> = (0..dim * 60).map(|_| rng.gen::<f32>() * 2.0 - 1.0).collect();
        let items = frozen(dim, &vectors);

        for metric in [
            Metric::Angular,
            Metric::Euclidean,
            Metric::Manhattan,
            Metric::Hamming,
            Metric::Dot,
        ] {
            let nodes = build_tree(&items, metric, &mut rng);
            let root = (nodes.len() - 1) as u32;
            let mut seen = Vec::new();
            collect_items(&nodes, root, &mut seen);
            seen.sort_unstable();
            let expected: Vec<u32> = (0..items.count as u32).collect();
            assert_eq!(seen, expected, "metric {metric} lost or duplicated items");
        }
    }

    #[test]
    fn identical_vectors_still_terminate() {
        let dim = 2;
        let vectors = vec![0.5f32; dim * 40];
        let items = frozen(dim, &vectors);
        let mut rng = StdRng::seed_from_u64(7);
        let nodes = build_tree(&items, Metric::Euclidean, &mut rng);
        let root = (nodes.len() - 1) as u32;
        let mut seen = Vec::new();
        collect_items(&nodes, root, &mut seen);
        assert_eq!(seen.len(), 40);
    }

    #[test]
    fn split_counts_cover_their_subtrees() {
        let mut rng = StdRng::seed_from_u64(3);
        let dim = 3;
        let vectors: Vec<f32> = (0..dim * 50).map(|_| rng.gen::<f32>()).collect();
        let items = frozen(dim, &vectors);
        let nodes = build_tree(&items, Metric::Euclidean, &mut rng);
        for (index, node) in nodes.iter().enumerate() {
            if let TreeNode::Split { count, .. } = node {
                let mut seen = Vec::new();
                collect_items(&nodes, index as u32, &mut seen);
                assert_eq!(seen.len(), *count as usize);
            }
        }
    }

    #[test]
    fn forest_encoding_rebases_roots() {
        let mut rng = StdRng::seed_from_u64(11);
        let dim = 2;
        let vectors: Vec<f32> = (0..dim * 30).map(|_| rng.gen::<f32>()).collect();
        let items = frozen(dim, &vectors);
        let (bytes, roots, node_count) = build_forest(&items, Metric::Euclidean, 4, 21);
        assert_eq!(roots.len(), 4);
        assert_eq!(bytes.len(), node_count * format::node_size(dim));
        assert!(roots.iter().all(|&r| (r as usize) < node_count));
        // Roots are strictly increasing since each tree's nodes precede its root.
        assert!(roots.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn identical_seeds_build_identical_forests() {
        let mut rng = StdRng::seed_from_u64(17);
        let dim = 3;
        let vectors: Vec<f32> = (0..dim * 40).map(|_| rng.gen::<f32>()).collect();
        let items = frozen(dim, &vectors);
        let (a, roots_a, _) = build_forest(&items, Metric::Angular, 3, 5);
        let (b, roots_b, _) = build_forest(&items, Metric::Angular, 3, 5);
        assert_eq!(a, b);
        assert_eq!(roots_a, roots_b);
    }
}
