//! Index facade and lifecycle state machine.
//!
//! An index starts out loading items, freezes into a built forest, and can
//! alternatively be constructed directly from a persisted file as a mapped
//! read-only view. There is no path back from built or mapped to loading:
//! the index is append-then-freeze.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

use rand::prelude::*;
use tracing::{debug, info};

use crate::builder::{self, FrozenItems};
use crate::format::Image;
use crate::search::{self, Neighbor};
use crate::store::PendingStore;
use crate::{Metric, RpForestError};

enum State {
    Loading(PendingStore),
    Ready { image: Image },
}

/// An approximate-nearest-neighbor index over a forest of
/// random-projection trees.
///
/// Built and mapped indexes are immutable and safe to share across threads
/// (`&self` queries only); item ingestion is single-writer by `&mut self`.
pub struct RpForestIndex {
    dim: usize,
    metric: Metric,
    state: State,
}

impl RpForestIndex {
    /// Create an empty index of fixed dimensionality and metric.
    pub fn new(dimension: usize, metric: Metric) -> Self {
        Self {
            dim: dimension,
            metric,
            state: State::Loading(PendingStore::new(dimension)),
        }
    }

    /// Add an item, or replace it if the id was already added. Only valid
    /// before `build`.
    pub fn add_item(&mut self, id: u64, vector: &[f32]) -> Result<(), RpForestError> {
        match &mut self.state {
            State::Loading(store) => store.add(id, vector),
            State::Ready { .. } => Err(RpForestError::AlreadyBuilt),
        }
    }

    /// Build the forest with entropy from the OS. Use [`build_with_seed`]
    /// for reproducible forests.
    ///
    /// [`build_with_seed`]: RpForestIndex::build_with_seed
    pub fn build(&mut self, n_trees: usize) -> Result<(), RpForestError> {
        self.build_with_seed(n_trees, rand::thread_rng().gen())
    }

    /// Build the forest deterministically from a seed, freezing the item
    /// set. `n_trees` below 1 is treated as 1.
    pub fn build_with_seed(&mut self, n_trees: usize, seed: u64) -> Result<(), RpForestError> {
        let store = match &self.state {
            State::Loading(store) => store,
            State::Ready { .. } => return Err(RpForestError::AlreadyBuilt),
        };
        if store.len() == 0 {
            return Err(RpForestError::EmptyStore);
        }
        let n_trees = n_trees.max(1);
        let started = Instant::now();

        let (ids, vectors) = store.freeze();
        let items = FrozenItems {
            dim: self.dim,
            count: ids.len(),
            vectors: &vectors,
        };
        let (node_bytes, roots, node_count) =
            builder::build_forest(&items, self.metric, n_trees, seed);
        let image = Image::assemble(
            self.dim,
            self.metric,
            &ids,
            &vectors,
            &node_bytes,
            node_count,
            &roots,
        );
        info!(
            items = ids.len(),
            trees = n_trees,
            nodes = node_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "forest built"
        );
        self.state = State::Ready { image };
        Ok(())
    }

    /// Serialize the index to a single file. Requires a built or mapped
    /// forest.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), RpForestError> {
        let image = self.image().ok_or(RpForestError::NotBuilt)?;
        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        writer.write_all(image.bytes())?;
        writer.flush()?;
        debug!(bytes = image.bytes().len(), "index saved");
        Ok(())
    }

    /// Serialize the index into the supplied writer.
    pub fn save_to_writer<W: Write>(&self, mut writer: W) -> Result<(), RpForestError> {
        let image = self.image().ok_or(RpForestError::NotBuilt)?;
        writer.write_all(image.bytes())?;
        writer.flush()?;
        Ok(())
    }

    /// Map a saved index read-only. The returned index serves queries
    /// straight from mapped memory without copying vectors or nodes; the
    /// declared dimension and metric are checked against the file header.
    pub fn load<P: AsRef<Path>>(
        path: P,
        dimension: usize,
        metric: Metric,
    ) -> Result<Self, RpForestError> {
        let image = Image::open(path, dimension, metric)?;
        let view = image.view();
        info!(
            items = view.item_count(),
            trees = view.tree_count(),
            "index mapped"
        );
        Ok(Self {
            dim: dimension,
            metric,
            state: State::Ready { image },
        })
    }

    /// Load a saved index by reading the whole file into memory. Same
    /// validation and behaviour as [`load`], for callers avoiding mmap.
    ///
    /// [`load`]: RpForestIndex::load
    pub fn load_buffered<P: AsRef<Path>>(
        path: P,
        dimension: usize,
        metric: Metric,
    ) -> Result<Self, RpForestError> {
        let image = Image::open_buffered(path, dimension, metric)?;
        let view = image.view();
        info!(
            items = view.item_count(),
            trees = view.tree_count(),
            "index loaded into memory"
        );
        Ok(Self {
            dim: dimension,
            metric,
            state: State::Ready { image },
        })
    }

    /// Fetch the stored vector for an item.
    pub fn get_item_vector(&self, id: u64) -> Result<Vec<f32>, RpForestError> {
        match &self.state {
            State::Loading(store) => store
                .get(id)
                .map(<[f32]>::to_vec)
                .ok_or(RpForestError::NotFound(id)),
            State::Ready { image } => {
                let view = image.view();
                let ordinal = view.ordinal_of(id).ok_or(RpForestError::NotFound(id))?;
                Ok(view.vector(ordinal).to_vec())
            }
        }
    }

    /// Distance between two stored items on the metric's reported scale.
    pub fn get_distance(&self, a: u64, b: u64) -> Result<f32, RpForestError> {
        let raw = match &self.state {
            State::Loading(store) => {
                let va = store.get(a).ok_or(RpForestError::NotFound(a))?;
                let vb = store.get(b).ok_or(RpForestError::NotFound(b))?;
                self.metric.raw_distance(va, vb)
            }
            State::Ready { image } => {
                let view = image.view();
                let oa = view.ordinal_of(a).ok_or(RpForestError::NotFound(a))?;
                let ob = view.ordinal_of(b).ok_or(RpForestError::NotFound(b))?;
                self.metric.raw_distance(view.vector(oa), view.vector(ob))
            }
        };
        Ok(self.metric.normalized_distance(raw))
    }

    /// Return up to `k` nearest neighbors of a query vector, nearest first.
    ///
    /// `search_k` bounds the number of candidates examined, trading recall
    /// for latency; `None` means `k * tree_count`.
    pub fn get_nns_by_vector(
        &self,
        vector: &[f32],
        k: usize,
        search_k: Option<usize>,
    ) -> Result<Vec<Neighbor>, RpForestError> {
        if vector.len() != self.dim {
            return Err(RpForestError::DimensionMismatch {
                expected: self.dim,
                got: vector.len(),
            });
        }
        let image = self.image().ok_or(RpForestError::NotBuilt)?;
        let view = image.view();
        let budget = search_k.unwrap_or_else(|| k.saturating_mul(view.tree_count()));
        Ok(search::query(&view, vector, k, budget))
    }

    /// Return up to `k` nearest neighbors of a stored item, itself
    /// included, nearest first.
    pub fn get_nns_by_item(
        &self,
        id: u64,
        k: usize,
        search_k: Option<usize>,
    ) -> Result<Vec<Neighbor>, RpForestError> {
        let vector = self.get_item_vector(id)?;
        self.get_nns_by_vector(&vector, k, search_k)
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    /// Number of stored items.
    pub fn len(&self) -> usize {
        match &self.state {
            State::Loading(store) => store.len(),
            State::Ready { image } => image.view().item_count(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the forest exists (built in this process or mapped from disk).
    pub fn is_built(&self) -> bool {
        matches!(self.state, State::Ready { .. })
    }

    /// Whether the index is backed by a memory-mapped file.
    pub fn is_mapped(&self) -> bool {
        match &self.state {
            State::Loading(_) => false,
            State::Ready { image } => image.is_mapped(),
        }
    }

    /// Number of trees in the forest; 0 before build.
    pub fn tree_count(&self) -> usize {
        match &self.state {
            State::Loading(_) => 0,
            State::Ready { image } => image.view().tree_count(),
        }
    }

    fn image(&self) -> Option<&Image> {
        match &self.state {
            State::Loading(_) => None,
            State::Ready { image } => Some(image),
        }
    }
}
