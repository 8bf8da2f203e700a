//! Forest traversal and exact re-ranking.
//!
//! A query walks all trees at once through a single priority queue ordered
//! by plane margins: the most promising frontier node is expanded first,
//! leaves feed the candidate pool, and traversal stops once `search_k`
//! candidate slots have been consumed or the frontier is exhausted.
//! Candidates are then deduplicated across trees, re-ranked by exact
//! distance, and cut to the requested k.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::format::{ImageView, NodeRef};

/// A single query hit: item id plus distance on the metric's reported scale.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub id: u64,
    pub distance: f32,
}

/// Frontier entry: a node and the smallest margin along the path to it.
struct FrontierEntry {
    bound: f32,
    node: u32,
}

impl PartialEq for FrontierEntry {
    fn eq(&self, other: &Self) -> bool {
        self.bound.to_bits() == other.bound.to_bits() && self.node == other.node
    }
}

impl Eq for FrontierEntry {}

impl PartialOrd for FrontierEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FrontierEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bound.total_cmp(&other.bound)
    }
}

/// Run a query against a built or mapped image. `search_k` bounds the
/// number of candidate slots examined; the caller resolves defaults.
pub(crate) fn query(view: &ImageView<'_>, vector: &[f32], k: usize, search_k: usize) -> Vec<Neighbor> {
    let metric = view.metric();

    let mut frontier = BinaryHeap::with_capacity(view.tree_count() * 2);
    for tree in 0..view.tree_count() {
        frontier.push(FrontierEntry {
            bound: f32::INFINITY,
            node: view.root(tree),
        });
    }

    let mut candidates: Vec<u32> = Vec::with_capacity(search_k.min(view.item_count() * 2));
    while candidates.len() < search_k {
        let Some(FrontierEntry { bound, node }) = frontier.pop() else {
            break;
        };
        if node as usize >= view.node_count() {
            continue;
        }
        match view.node(node) {
            NodeRef::Leaf { items } => candidates.extend_from_slice(items),
            NodeRef::Split {
                normal,
                bias,
                left,
                right,
            } => {
                let margin = metric.margin(normal, bias, vector);
                frontier.push(FrontierEntry {
                    bound: bound.min(margin),
                    node: right,
                });
                frontier.push(FrontierEntry {
                    bound: bound.min(-margin),
                    node: left,
                });
            }
        }
    }

    // The same item can surface from several trees' leaves.
    candidates.sort_unstable();
    candidates.dedup();

    let mut ranked: Vec<(u32, f32)> = candidates
        .iter()
        .map(|&ordinal| (ordinal, metric.raw_distance(vector, view.vector(ordinal))))
        .collect();
    // Ordinal order is id order, so the tie-break lands on the smaller id.
    ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(k);

    ranked
        .into_iter()
        .map(|(ordinal, raw)| Neighbor {
            id: view.id_at(ordinal),
            distance: metric.normalized_distance(raw),
        })
        .collect()
}
