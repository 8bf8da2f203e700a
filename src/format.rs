//! On-disk image layout and zero-copy views.
//!
//! A persisted index is a single little-endian file with four fixed-record
//! sections behind a 64-byte header:
//!
//! ```text
//! [header 64B][roots u32 x trees, pad to 8][ids u64 x items]
//! [vectors f32 x items x dim][nodes (12 + 4*(dim+1))B x node_count]
//! ```
//!
//! Every section is 4- or 8-byte aligned relative to the file start, so a
//! page-aligned mmap (or the 8-aligned owned buffer of the no-mmap path)
//! can expose ids, vectors, and node payloads as typed slices without
//! copying. Any vector or node is reachable by offset arithmetic alone.
//!
//! A node record is `[n_descendants u32][left u32][right u32][payload]`
//! with a `(dim + 1) * 4` byte payload. The record is a leaf iff
//! `n_descendants <= dim + 1`; leaf payloads hold item ordinals, split
//! payloads hold the hyperplane normal followed by the bias (for Hamming,
//! `payload[0]` is the split coordinate).
//!
//! Corruption detection is deliberately header-level only: magic, version,
//! a CRC32 over the header fields, tag validity, and an exact file-size
//! check. There is no full-data checksum; load cost stays at one mmap.

use std::fs::File;
use std::path::Path;

use crc32fast::Hasher;
use memmap2::Mmap;

use crate::{Metric, RpForestError};

pub(crate) const MAGIC: [u8; 4] = *b"RPF1";
pub(crate) const FORMAT_VERSION: u32 = 1;
pub(crate) const HEADER_LEN: usize = 64;
/// Header bytes covered by the checksum field that follows them.
const HEADER_CRC_END: usize = 40;
/// Fixed per-node overhead: descendant count plus two child indices.
const NODE_FIXED: usize = 12;

/// Size in bytes of one node record at the given dimensionality.
pub(crate) fn node_size(dim: usize) -> usize {
    NODE_FIXED + 4 * (dim + 1)
}

/// Maximum number of item ordinals a leaf payload can hold. Also the
/// recursion cut-off during build, so it doubles as the leaf-size
/// threshold and scales with dimensionality.
pub(crate) fn leaf_cap(dim: usize) -> usize {
    dim + 1
}

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(
        bytes[offset..offset + 4]
            .try_into()
            .expect("slice of length 4"),
    )
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(
        bytes[offset..offset + 8]
            .try_into()
            .expect("slice of length 8"),
    )
}

/// Section offsets derived from the header fields.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Layout {
    pub dim: usize,
    pub metric: Metric,
    pub item_count: usize,
    pub node_count: usize,
    pub tree_count: usize,
    pub node_size: usize,
    pub roots_off: usize,
    pub ids_off: usize,
    pub vectors_off: usize,
    pub nodes_off: usize,
    pub total_len: usize,
}

impl Layout {
    pub fn new(
        dim: usize,
        metric: Metric,
        item_count: usize,
        node_count: usize,
        tree_count: usize,
    ) -> Layout {
        let node_size = node_size(dim);
        let roots_off = HEADER_LEN;
        let ids_off = align8(roots_off + 4 * tree_count);
        let vectors_off = ids_off + 8 * item_count;
        let nodes_off = vectors_off + 4 * dim * item_count;
        let total_len = nodes_off + node_size * node_count;
        Layout {
            dim,
            metric,
            item_count,
            node_count,
            tree_count,
            node_size,
            roots_off,
            ids_off,
            vectors_off,
            nodes_off,
            total_len,
        }
    }
}

fn encode_header(layout: &Layout) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(&MAGIC);
    header[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    header[8..12].copy_from_slice(&(layout.dim as u32).to_le_bytes());
    header[12..16].copy_from_slice(&layout.metric.to_tag().to_le_bytes());
    header[16..24].copy_from_slice(&(layout.item_count as u64).to_le_bytes());
    header[24..32].copy_from_slice(&(layout.node_count as u64).to_le_bytes());
    header[32..36].copy_from_slice(&(layout.tree_count as u32).to_le_bytes());
    // bytes 36..40 reserved, zero
    let mut hasher = Hasher::new();
    hasher.update(&header[..HEADER_CRC_END]);
    header[40..44].copy_from_slice(&hasher.finalize().to_le_bytes());
    header
}

/// Validate the header and section sizes against the caller-declared
/// dimension and metric, returning the layout on success.
fn parse_header(
    bytes: &[u8],
    declared_dim: usize,
    declared_metric: Metric,
) -> Result<Layout, RpForestError> {
    if bytes.len() < HEADER_LEN {
        return Err(RpForestError::CorruptFile("file too short for header"));
    }
    if bytes[0..4] != MAGIC {
        return Err(RpForestError::CorruptFile("unrecognized magic"));
    }
    if read_u32(bytes, 4) != FORMAT_VERSION {
        return Err(RpForestError::CorruptFile("unsupported format version"));
    }
    let mut hasher = Hasher::new();
    hasher.update(&bytes[..HEADER_CRC_END]);
    if hasher.finalize() != read_u32(bytes, 40) {
        return Err(RpForestError::CorruptFile("header checksum mismatch"));
    }

    let dim = read_u32(bytes, 8) as usize;
    if dim == 0 {
        return Err(RpForestError::CorruptFile("dimension must be positive"));
    }
    if dim != declared_dim {
        return Err(RpForestError::CorruptFile(
            "declared dimension does not match file",
        ));
    }
    let metric = Metric::from_tag(read_u32(bytes, 12))
        .ok_or(RpForestError::CorruptFile("unknown metric tag"))?;
    if metric != declared_metric {
        return Err(RpForestError::CorruptFile(
            "declared metric does not match file",
        ));
    }

    let item_count = read_u64(bytes, 16) as usize;
    if item_count == 0 {
        return Err(RpForestError::CorruptFile("empty item table"));
    }
    let node_count = read_u64(bytes, 24) as usize;
    let tree_count = read_u32(bytes, 32) as usize;
    if tree_count == 0 {
        return Err(RpForestError::CorruptFile("no trees recorded"));
    }
    if node_count < tree_count {
        return Err(RpForestError::CorruptFile(
            "fewer nodes than trees recorded",
        ));
    }

    let layout = Layout::new(dim, metric, item_count, node_count, tree_count);
    if layout.total_len != bytes.len() {
        return Err(RpForestError::CorruptFile(
            "file size does not match header",
        ));
    }
    for tree in 0..tree_count {
        let root = read_u32(bytes, layout.roots_off + 4 * tree) as usize;
        if root >= node_count {
            return Err(RpForestError::CorruptFile("tree root out of range"));
        }
    }
    Ok(layout)
}

/// Byte buffer with 8-byte alignment, so the owned (no-mmap) path can hand
/// out the same typed slices as a page-aligned mapping.
pub(crate) struct AlignedBytes {
    words: Vec<u64>,
    len: usize,
}

impl AlignedBytes {
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        let mut words = vec![0u64; (len + 7) / 8];
        bytemuck::cast_slice_mut::<u64, u8>(&mut words)[..len].copy_from_slice(&bytes);
        Self { words, len }
    }

    pub fn as_slice(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.len]
    }
}

/// Backing storage for an image: built/read into memory, or mapped.
pub(crate) enum ImageData {
    Owned(AlignedBytes),
    Mapped(Mmap),
}

impl ImageData {
    fn bytes(&self) -> &[u8] {
        match self {
            ImageData::Owned(buffer) => buffer.as_slice(),
            ImageData::Mapped(mmap) => &mmap[..],
        }
    }
}

/// A complete index image: the serialized file bytes plus the parsed
/// layout. Building an index produces an owned image; loading one maps the
/// file and reuses the identical logical layout.
pub(crate) struct Image {
    data: ImageData,
    layout: Layout,
}

impl Image {
    /// Assemble an owned image from the frozen store and the encoded forest.
    pub fn assemble(
        dim: usize,
        metric: Metric,
        ids: &[u64],
        vectors: &[f32],
        node_bytes: &[u8],
        node_count: usize,
        roots: &[u32],
    ) -> Image {
        let layout = Layout::new(dim, metric, ids.len(), node_count, roots.len());
        debug_assert_eq!(vectors.len(), ids.len() * dim);
        debug_assert_eq!(node_bytes.len(), node_count * layout.node_size);

        let mut bytes = vec![0u8; layout.total_len];
        bytes[..HEADER_LEN].copy_from_slice(&encode_header(&layout));
        for (tree, root) in roots.iter().enumerate() {
            let off = layout.roots_off + 4 * tree;
            bytes[off..off + 4].copy_from_slice(&root.to_le_bytes());
        }
        bytes[layout.ids_off..layout.vectors_off].copy_from_slice(bytemuck::cast_slice(ids));
        bytes[layout.vectors_off..layout.nodes_off].copy_from_slice(bytemuck::cast_slice(vectors));
        bytes[layout.nodes_off..].copy_from_slice(node_bytes);

        Image {
            data: ImageData::Owned(AlignedBytes::from_vec(bytes)),
            layout,
        }
    }

    /// Map an image file read-only and validate its header.
    pub fn open<P: AsRef<Path>>(
        path: P,
        declared_dim: usize,
        declared_metric: Metric,
    ) -> Result<Image, RpForestError> {
        let file = File::open(path)?;
        // Mapped files must not be truncated or rewritten while the index
        // is alive; the format itself is immutable post-save.
        let mmap = unsafe { Mmap::map(&file)? };
        let layout = parse_header(&mmap, declared_dim, declared_metric)?;
        Ok(Image {
            data: ImageData::Mapped(mmap),
            layout,
        })
    }

    /// Read an image file fully into an owned buffer with the same logical
    /// layout. Fallback for platforms or callers that avoid mmap.
    pub fn open_buffered<P: AsRef<Path>>(
        path: P,
        declared_dim: usize,
        declared_metric: Metric,
    ) -> Result<Image, RpForestError> {
        let bytes = std::fs::read(path)?;
        let buffer = AlignedBytes::from_vec(bytes);
        let layout = parse_header(buffer.as_slice(), declared_dim, declared_metric)?;
        Ok(Image {
            data: ImageData::Owned(buffer),
            layout,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        self.data.bytes()
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.data, ImageData::Mapped(_))
    }

    pub fn view(&self) -> ImageView<'_> {
        ImageView {
            bytes: self.data.bytes(),
            layout: &self.layout,
        }
    }
}

/// Borrowed, typed accessors over an image's sections. Slice casts rely on
/// the section alignment guaranteed by both backends.
#[derive(Clone, Copy)]
pub(crate) struct ImageView<'a> {
    bytes: &'a [u8],
    layout: &'a Layout,
}

/// One node as seen by the search path.
pub(crate) enum NodeRef<'a> {
    Leaf { items: &'a [u32] },
    Split { normal: &'a [f32], bias: f32, left: u32, right: u32 },
}

impl<'a> ImageView<'a> {
    pub fn metric(&self) -> Metric {
        self.layout.metric
    }

    pub fn item_count(&self) -> usize {
        self.layout.item_count
    }

    pub fn node_count(&self) -> usize {
        self.layout.node_count
    }

    pub fn tree_count(&self) -> usize {
        self.layout.tree_count
    }

    pub fn root(&self, tree: usize) -> u32 {
        read_u32(self.bytes, self.layout.roots_off + 4 * tree)
    }

    /// The ascending id column.
    pub fn ids(&self) -> &'a [u64] {
        bytemuck::cast_slice(&self.bytes[self.layout.ids_off..self.layout.vectors_off])
    }

    pub fn id_at(&self, ordinal: u32) -> u64 {
        self.ids()[ordinal as usize]
    }

    /// Resolve an item id to its ordinal by binary search over the id column.
    pub fn ordinal_of(&self, id: u64) -> Option<u32> {
        self.ids().binary_search(&id).ok().map(|rank| rank as u32)
    }

    pub fn vector(&self, ordinal: u32) -> &'a [f32] {
        let start = self.layout.vectors_off + ordinal as usize * self.layout.dim * 4;
        bytemuck::cast_slice(&self.bytes[start..start + self.layout.dim * 4])
    }

    pub fn node(&self, index: u32) -> NodeRef<'a> {
        let off = self.layout.nodes_off + index as usize * self.layout.node_size;
        let n_descendants = read_u32(self.bytes, off) as usize;
        let payload = off + NODE_FIXED;
        if n_descendants <= leaf_cap(self.layout.dim) {
            NodeRef::Leaf {
                items: bytemuck::cast_slice(&self.bytes[payload..payload + 4 * n_descendants]),
            }
        } else {
            NodeRef::Split {
                normal: bytemuck::cast_slice(&self.bytes[payload..payload + 4 * self.layout.dim]),
                bias: f32::from_le_bytes(
                    self.bytes[payload + 4 * self.layout.dim..payload + 4 * (self.layout.dim + 1)]
                        .try_into()
                        .expect("slice of length 4"),
                ),
                left: read_u32(self.bytes, off + 4),
                right: read_u32(self.bytes, off + 8),
            }
        }
    }
}

/// Append a leaf record holding `items` ordinals.
pub(crate) fn encode_leaf(buf: &mut Vec<u8>, dim: usize, items: &[u32]) {
    debug_assert!(items.len() <= leaf_cap(dim));
    let start = buf.len();
    buf.extend_from_slice(&(items.len() as u32).to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());
    for item in items {
        buf.extend_from_slice(&item.to_le_bytes());
    }
    buf.resize(start + node_size(dim), 0);
}

/// Append a split record: descendant count, child indices, hyperplane.
pub(crate) fn encode_split(
    buf: &mut Vec<u8>,
    dim: usize,
    count: u32,
    left: u32,
    right: u32,
    normal: &[f32],
    bias: f32,
) {
    debug_assert!(count as usize > leaf_cap(dim));
    debug_assert_eq!(normal.len(), dim);
    buf.extend_from_slice(&count.to_le_bytes());
    buf.extend_from_slice(&left.to_le_bytes());
    buf.extend_from_slice(&right.to_le_bytes());
    for component in normal {
        buf.extend_from_slice(&component.to_le_bytes());
    }
    buf.extend_from_slice(&bias.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_sections_are_aligned() {
        for trees in [1usize, 3, 8, 11] {
            let layout = Layout::new(5, Metric::Euclidean, 100, 250, trees);
            assert_eq!(layout.ids_off % 8, 0);
            assert_eq!(layout.vectors_off % 4, 0);
            assert_eq!(layout.nodes_off % 4, 0);
            assert!(layout.ids_off >= layout.roots_off + 4 * trees);
        }
    }

    #[test]
    fn node_records_have_fixed_size() {
        let dim = 5;
        let mut buf = Vec::new();
        encode_leaf(&mut buf, dim, &[1, 2, 3]);
        assert_eq!(buf.len(), node_size(dim));
        encode_split(&mut buf, dim, 42, 0, 1, &[0.1, 0.2, 0.3, 0.4, 0.5], -0.25);
        assert_eq!(buf.len(), 2 * node_size(dim));
    }

    #[test]
    fn assembled_image_round_trips_through_its_view() {
        let dim = 2;
        let ids = [3u64, 9, 20];
        let vectors = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut nodes = Vec::new();
        encode_leaf(&mut nodes, dim, &[0, 1, 2]);
        let image = Image::assemble(dim, Metric::Euclidean, &ids, &vectors, &nodes, 1, &[0]);

        let view = image.view();
        assert_eq!(view.item_count(), 3);
        assert_eq!(view.tree_count(), 1);
        assert_eq!(view.ids(), &ids);
        assert_eq!(view.ordinal_of(9), Some(1));
        assert_eq!(view.ordinal_of(10), None);
        assert_eq!(view.vector(1), &[3.0, 4.0]);
        assert_eq!(view.id_at(2), 20);
        match view.node(view.root(0)) {
            NodeRef::Leaf { items } => assert_eq!(items, &[0, 1, 2]),
            NodeRef::Split { .. } => panic!("expected a leaf root"),
        }
    }

    #[test]
    fn parse_rejects_tampered_headers() {
        let dim = 2;
        let ids = [0u64];
        let vectors = [1.0f32, 2.0];
        let mut nodes = Vec::new();
        encode_leaf(&mut nodes, dim, &[0]);
        let image = Image::assemble(dim, Metric::Euclidean, &ids, &vectors, &nodes, 1, &[0]);
        let good = image.bytes().to_vec();

        assert!(parse_header(&good, dim, Metric::Euclidean).is_ok());

        let mut bad_magic = good.clone();
        bad_magic[0] = b'X';
        assert!(matches!(
            parse_header(&bad_magic, dim, Metric::Euclidean),
            Err(RpForestError::CorruptFile("unrecognized magic"))
        ));

        let mut bad_field = good.clone();
        bad_field[16] ^= 0xff; // item count, covered by the checksum
        assert!(matches!(
            parse_header(&bad_field, dim, Metric::Euclidean),
            Err(RpForestError::CorruptFile("header checksum mismatch"))
        ));

        let truncated = &good[..good.len() - 1];
        assert!(matches!(
            parse_header(truncated, dim, Metric::Euclidean),
            Err(RpForestError::CorruptFile("file size does not match header"))
        ));

        assert!(matches!(
            parse_header(&good, dim + 1, Metric::Euclidean),
            Err(RpForestError::CorruptFile(
                "declared dimension does not match file"
            ))
        ));
        assert!(matches!(
            parse_header(&good, dim, Metric::Angular),
            Err(RpForestError::CorruptFile(
                "declared metric does not match file"
            ))
        ));
    }
}
