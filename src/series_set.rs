//! Mergeable set of series ids, backed by a compressed Roaring bitmap over u64.

use crate::error::IndexError;
use crate::types::SeriesId;

use roaring::RoaringTreemap;
use std::fmt;

/// Owned, mutable set of series ids with ascending iteration.
///
/// Plain value type: sharing one set between threads needs external synchronization.
#[derive(Clone, Default, PartialEq)]
pub struct SeriesIdSet {
    bitmap: RoaringTreemap,
}

impl SeriesIdSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the id was not already present.
    pub fn insert(&mut self, id: SeriesId) -> bool {
        self.bitmap.insert(id)
    }

    /// Returns true if the id was present.
    pub fn remove(&mut self, id: SeriesId) -> bool {
        self.bitmap.remove(id)
    }

    pub fn contains(&self, id: SeriesId) -> bool {
        self.bitmap.contains(id)
    }

    pub fn len(&self) -> u64 {
        self.bitmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bitmap.is_empty()
    }

    pub fn max(&self) -> Option<SeriesId> {
        self.bitmap.max()
    }

    /// Adds every id of `other` into `self`.
    pub fn union_with(&mut self, other: &SeriesIdSet) {
        self.bitmap |= &other.bitmap;
    }

    /// Removes every id of `other` from `self`.
    pub fn difference_with(&mut self, other: &SeriesIdSet) {
        self.bitmap -= &other.bitmap;
    }

    /// Keeps only ids also present in `other`.
    pub fn intersect_with(&mut self, other: &SeriesIdSet) {
        self.bitmap &= &other.bitmap;
    }

    pub fn union(&self, other: &SeriesIdSet) -> SeriesIdSet {
        SeriesIdSet {
            bitmap: &self.bitmap | &other.bitmap,
        }
    }

    pub fn difference(&self, other: &SeriesIdSet) -> SeriesIdSet {
        SeriesIdSet {
            bitmap: &self.bitmap - &other.bitmap,
        }
    }

    /// Ascending iteration.
    pub fn iter(&self) -> impl Iterator<Item = SeriesId> + '_ {
        self.bitmap.iter()
    }

    pub fn to_vec(&self) -> Vec<SeriesId> {
        self.bitmap.iter().collect()
    }

    /// Serializes into the portable Roaring format.
    pub fn to_bytes(&self) -> Result<Vec<u8>, IndexError> {
        let mut out = Vec::with_capacity(self.bitmap.serialized_size());
        self.bitmap
            .serialize_into(&mut out)
            .map_err(|e| IndexError::Serialization(e.to_string()))?;
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IndexError> {
        let bitmap = RoaringTreemap::deserialize_from(bytes)
            .map_err(|e| IndexError::format(format!("Invalid series id set: {}", e), None))?;
        Ok(Self { bitmap })
    }
}

impl fmt::Debug for SeriesIdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.bitmap.iter().take(32)).finish()?;
        if self.bitmap.len() > 32 {
            write!(f, " (+{} more)", self.bitmap.len() - 32)?;
        }
        Ok(())
    }
}

impl FromIterator<SeriesId> for SeriesIdSet {
    fn from_iter<I: IntoIterator<Item = SeriesId>>(iter: I) -> Self {
        Self {
            bitmap: iter.into_iter().collect(),
        }
    }
}

impl Extend<SeriesId> for SeriesIdSet {
    fn extend<I: IntoIterator<Item = SeriesId>>(&mut self, iter: I) {
        self.bitmap.extend(iter)
    }
}
