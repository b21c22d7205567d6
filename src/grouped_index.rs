//! Grouped index containers (spec §4.1).
//!
//! Two interchangeable representations of a ragged `group -> elements`
//! relation, grounded in the original's `grouped_index_vector.hpp`
//! (`SparseIdxVector`/`DenseIdxVector`/`zip_sequence`). Offset form stores
//! one offset per group (CSR-like); tag form stores one group tag per
//! element. Both give O(1) group -> element-range and O(log n)
//! element -> group lookup.

use crate::types::Idx;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// A half-open element range `[begin, end)` into the flat element array.
pub type ElementRange = Range<usize>;

/// Offset-form grouped index: `offsets[g]..offsets[g+1]` are the elements of
/// group `g`. `offsets.len() == n_groups + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparseIdxVector {
    offsets: Vec<usize>,
}

impl SparseIdxVector {
    /// Builds directly from offsets; `offsets` must be non-decreasing and
    /// start at 0.
    pub fn from_offsets(offsets: Vec<usize>) -> Self {
        debug_assert!(!offsets.is_empty(), "offsets must contain at least one entry");
        debug_assert!(offsets[0] == 0, "offsets must start at 0");
        debug_assert!(
            offsets.windows(2).all(|w| w[0] <= w[1]),
            "offsets must be non-decreasing"
        );
        Self { offsets }
    }

    pub fn size(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn element_size(&self) -> usize {
        *self.offsets.last().unwrap_or(&0)
    }

    pub fn range(&self, group: usize) -> ElementRange {
        self.offsets[group]..self.offsets[group + 1]
    }

    /// Binary search over offsets for the owning group of `element`.
    pub fn group_of(&self, element: usize) -> Idx {
        debug_assert!(element < self.element_size());
        // upper_bound(offsets, element) - 1
        let idx = self
            .offsets
            .partition_point(|&o| o <= element)
            .saturating_sub(1);
        idx as Idx
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, ElementRange)> + '_ {
        (0..self.size()).map(move |g| (g, self.range(g)))
    }
}

/// Tag-form grouped index: `tags[e]` is the group of element `e`, and `tags`
/// is non-decreasing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenseIdxVector {
    tags: Vec<usize>,
    n_groups: usize,
}

impl DenseIdxVector {
    /// Builds directly from a non-decreasing tag vector plus the group
    /// count.
    pub fn from_tags(tags: Vec<usize>, n_groups: usize) -> Self {
        debug_assert!(
            tags.windows(2).all(|w| w[0] <= w[1]),
            "tags must be non-decreasing"
        );
        debug_assert!(tags.iter().all(|&t| t < n_groups || n_groups == 0));
        Self { tags, n_groups }
    }

    pub fn size(&self) -> usize {
        self.n_groups
    }

    pub fn element_size(&self) -> usize {
        self.tags.len()
    }

    pub fn range(&self, group: usize) -> ElementRange {
        let begin = self.tags.partition_point(|&t| t < group);
        let end = self.tags.partition_point(|&t| t <= group);
        begin..end
    }

    pub fn group_of(&self, element: usize) -> Idx {
        self.tags[element] as Idx
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, ElementRange)> + '_ {
        (0..self.size()).map(move |g| (g, self.range(g)))
    }
}

/// Either representation, picked per construction site for whichever is
/// more natural for that caller (spec §4.1 "Construction").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupedIndex {
    Sparse(SparseIdxVector),
    Dense(DenseIdxVector),
}

impl GroupedIndex {
    pub fn from_offsets(offsets: Vec<usize>) -> Self {
        GroupedIndex::Sparse(SparseIdxVector::from_offsets(offsets))
    }

    pub fn from_tags(tags: Vec<usize>, n_groups: usize) -> Self {
        GroupedIndex::Dense(DenseIdxVector::from_tags(tags, n_groups))
    }

    /// Builds from a dense "element -> group" vector (same shape as
    /// [`Self::from_tags`]; kept as a separate named constructor per spec
    /// §4.1's "or accept a dense element->group vector" bullet).
    pub fn from_element_to_group(element_to_group: Vec<usize>, n_groups: usize) -> Self {
        Self::from_tags(element_to_group, n_groups)
    }

    pub fn size(&self) -> usize {
        match self {
            GroupedIndex::Sparse(s) => s.size(),
            GroupedIndex::Dense(d) => d.size(),
        }
    }

    pub fn element_size(&self) -> usize {
        match self {
            GroupedIndex::Sparse(s) => s.element_size(),
            GroupedIndex::Dense(d) => d.element_size(),
        }
    }

    pub fn range(&self, group: usize) -> ElementRange {
        match self {
            GroupedIndex::Sparse(s) => s.range(group),
            GroupedIndex::Dense(d) => d.range(group),
        }
    }

    pub fn group_of(&self, element: usize) -> Idx {
        match self {
            GroupedIndex::Sparse(s) => s.group_of(element),
            GroupedIndex::Dense(d) => d.group_of(element),
        }
    }

    pub fn iter(&self) -> Box<dyn Iterator<Item = (usize, ElementRange)> + '_> {
        match self {
            GroupedIndex::Sparse(s) => Box::new(s.iter()),
            GroupedIndex::Dense(d) => Box::new(d.iter()),
        }
    }
}

/// Zips up to several grouped indices of identical `size()`, yielding
/// `(group, range_1, ..., range_n)` tuples in group order (spec §4.1
/// "A zipped iteration ..."; original's `zip_sequence`).
pub fn zip_grouped(indices: &[&GroupedIndex]) -> Vec<(usize, Vec<ElementRange>)> {
    assert!(!indices.is_empty());
    let n_groups = indices[0].size();
    debug_assert!(
        indices.iter().all(|g| g.size() == n_groups),
        "all grouped indices must have identical size()"
    );
    (0..n_groups)
        .map(|g| (g, indices.iter().map(|idx| idx.range(g)).collect()))
        .collect()
}
