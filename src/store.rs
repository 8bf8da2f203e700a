//! Pre-build item accumulation.
//!
//! Items live in an id-ordered map until `build` freezes them into the flat
//! arrays of the on-disk image. Post-build reads go through the image view
//! instead; this store only exists while the index is loading items.

use std::collections::BTreeMap;

use crate::RpForestError;

pub(crate) struct PendingStore {
    dim: usize,
    items: BTreeMap<u64, Vec<f32>>,
}

impl PendingStore {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            items: BTreeMap::new(),
        }
    }

    /// Insert or replace the vector for `id`.
    pub fn add(&mut self, id: u64, vector: &[f32]) -> Result<(), RpForestError> {
        if vector.len() != self.dim {
            return Err(RpForestError::DimensionMismatch {
                expected: self.dim,
                got: vector.len(),
            });
        }
        self.items.insert(id, vector.to_vec());
        Ok(())
    }

    pub fn get(&self, id: u64) -> Option<&[f32]> {
        self.items.get(&id).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Freeze into ascending-id order: the id column plus a row-major flat
    /// vector array, item ordinal = rank of id.
    pub fn freeze(&self) -> (Vec<u64>, Vec<f32>) {
        let mut ids = Vec::with_capacity(self.items.len());
        let mut vectors = Vec::with_capacity(self.items.len() * self.dim);
        for (id, vector) in &self.items {
            ids.push(*id);
            vectors.extend_from_slice(vector);
        }
        (ids, vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RpForestError;

    #[test]
    fn add_rejects_wrong_dimension() {
        let mut store = PendingStore::new(3);
        let err = store.add(0, &[1.0, 2.0]).unwrap_err();
        assert!(matches!(
            err,
            RpForestError::DimensionMismatch { expected: 3, got: 2 }
        ));
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn re_adding_an_id_replaces_the_vector() {
        let mut store = PendingStore::new(2);
        store.add(7, &[1.0, 1.0]).unwrap();
        store.add(7, &[2.0, 2.0]).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(7), Some(&[2.0, 2.0][..]));
    }

    #[test]
    fn freeze_orders_by_ascending_id() {
        let mut store = PendingStore::new(1);
        store.add(42, &[3.0]).unwrap();
        store.add(5, &[1.0]).unwrap();
        store.add(17, &[2.0]).unwrap();
        let (ids, vectors) = store.freeze();
        assert_eq!(ids, vec![5, 17, 42]);
        assert_eq!(vectors, vec![1.0, 2.0, 3.0]);
    }
}
