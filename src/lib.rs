mod builder;
mod distance;
mod format;
mod index;
mod math;
mod search;
mod store;

pub use index::RpForestIndex;
pub use search::Neighbor;


/// Distance metric used for both split-plane selection during build and
/// candidate ranking during search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    /// Angular (cosine) distance between vector directions; magnitude is ignored.
    Angular,
    /// Euclidean distance (L2).
    Euclidean,
    /// Manhattan distance (L1).
    Manhattan,
    /// Hamming distance over bit-packed components (a component is set iff > 0.5).
    Hamming,
    /// Dot-product similarity (maximum inner product). Not a true metric.
    Dot,
}

/// Errors that can occur while building, persisting, or querying an index.
#[derive(thiserror::Error, Debug)]
pub enum RpForestError {
    /// Returned when the length of an input vector does not match the index dimension.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    /// Returned when an item is added, or a build is requested, after the forest is built.
    #[error("index is already built and frozen")]
    AlreadyBuilt,
    /// Returned when an operation requires a built forest.
    #[error("index has not been built yet")]
    NotBuilt,
    /// Returned when `build` is invoked on an index with no items.
    #[error("cannot build an index with no items")]
    EmptyStore,
    /// Returned when an item id is not present in the index.
    #[error("item {0} not found")]
    NotFound(u64),
    /// Returned when a persisted index file fails header-level validation.
    #[error("invalid index file: {0}")]
    CorruptFile(&'static str),
    /// Returned when persistence encounters an I/O failure.
    #[error("i/o error while reading or writing an index: {0}")]
    Io(#[from] std::io::Error),
}
