//! Y-bus sparsity pattern (spec §4.3 step 2: "derive the CSR sparsity
//! pattern of the nodal admittance matrix from `branch_bus_idx`") plus the
//! LU sparsity pattern the block factorization fills in on top of it (spec
//! §3 `YBusStructure`, §4.4 "the symbolic fill-in is known up front from the
//! topology reducer's elimination ordering").

use std::collections::BTreeSet;

use crate::topology::MathTopology;
use crate::types::Idx;

/// CSR sparsity pattern of a nodal admittance matrix: every bus's diagonal
/// entry is always present, plus one entry per bus pair joined by a closed
/// branch (spec §4.3 step 2), together with the wider LU pattern obtained by
/// adding the topology reducer's precomputed fill-in (spec §4.2 step 5,
/// §4.4).
#[derive(Debug, Clone)]
pub struct YBusStructure {
    pub n_bus: usize,
    /// `row_offsets.len() == n_bus + 1`.
    pub row_offsets: Vec<usize>,
    /// Column index per nonzero, sorted within each row; the diagonal
    /// column is always present.
    pub col_indices: Vec<usize>,
    /// `row_offsets_lu.len() == n_bus + 1`; indexes `col_indices_lu`.
    pub row_offsets_lu: Vec<usize>,
    /// Column index per LU nonzero, sorted within each row: a superset of
    /// `col_indices` row-by-row, widened by elimination fill-in.
    pub col_indices_lu: Vec<usize>,
    /// Position of each row's diagonal entry within `col_indices_lu`.
    pub diag_lu: Vec<usize>,
    /// Per-`col_indices_lu`-entry back-reference into `col_indices`
    /// (equivalently, into `YBus::values`); `-1` where that LU position is
    /// pure fill-in with no corresponding original Y-bus entry.
    pub map_lu_y_bus: Vec<Idx>,
    /// Per-`col_indices_lu`-entry position of its `(col, row)` transpose,
    /// also within `col_indices_lu`: an involution, `lu_transpose_entry[lu_transpose_entry[k]] == k`.
    pub lu_transpose_entry: Vec<usize>,
}

impl YBusStructure {
    pub fn from_topology(topo: &MathTopology) -> Self {
        let mut rows: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); topo.n_bus];
        for bus in 0..topo.n_bus {
            rows[bus].insert(bus);
        }
        for &(from, to) in &topo.branch_bus_idx {
            if from < 0 || to < 0 {
                continue;
            }
            let (f, t) = (from as usize, to as usize);
            if f != t {
                rows[f].insert(t);
                rows[t].insert(f);
            }
        }

        let mut row_offsets = Vec::with_capacity(topo.n_bus + 1);
        let mut col_indices = Vec::new();
        row_offsets.push(0);
        for row in &rows {
            col_indices.extend(row.iter().copied());
            row_offsets.push(col_indices.len());
        }

        let mut rows_lu = rows;
        for &(a, b) in &topo.fill_in {
            rows_lu[a].insert(b);
            rows_lu[b].insert(a);
        }

        let mut row_offsets_lu = Vec::with_capacity(topo.n_bus + 1);
        let mut col_indices_lu = Vec::new();
        row_offsets_lu.push(0);
        for row in &rows_lu {
            col_indices_lu.extend(row.iter().copied());
            row_offsets_lu.push(col_indices_lu.len());
        }

        let row_lu = |bus: usize| -> &[usize] {
            &col_indices_lu[row_offsets_lu[bus]..row_offsets_lu[bus + 1]]
        };

        let diag_lu: Vec<usize> = (0..topo.n_bus)
            .map(|bus| {
                let pos = row_lu(bus)
                    .binary_search(&bus)
                    .expect("diagonal entry always present in the LU pattern");
                row_offsets_lu[bus] + pos
            })
            .collect();

        let map_lu_y_bus: Vec<Idx> = (0..topo.n_bus)
            .flat_map(|bus| {
                let y_row = &col_indices[row_offsets[bus]..row_offsets[bus + 1]];
                let y_base = row_offsets[bus];
                row_lu(bus).iter().map(move |&col| {
                    y_row
                        .binary_search(&col)
                        .ok()
                        .map(|pos| (y_base + pos) as Idx)
                        .unwrap_or(-1)
                })
            })
            .collect();

        let lu_transpose_entry: Vec<usize> = (0..topo.n_bus)
            .flat_map(|bus| {
                row_lu(bus).iter().map(move |&col| {
                    let pos = row_lu(col)
                        .binary_search(&bus)
                        .expect("LU sparsity pattern is symmetric");
                    row_offsets_lu[col] + pos
                })
            })
            .collect();

        Self {
            n_bus: topo.n_bus,
            row_offsets,
            col_indices,
            row_offsets_lu,
            col_indices_lu,
            diag_lu,
            map_lu_y_bus,
            lu_transpose_entry,
        }
    }

    pub fn nnz(&self) -> usize {
        self.col_indices.len()
    }

    pub fn nnz_lu(&self) -> usize {
        self.col_indices_lu.len()
    }

    pub fn row(&self, bus: usize) -> &[usize] {
        &self.col_indices[self.row_offsets[bus]..self.row_offsets[bus + 1]]
    }

    pub fn row_lu(&self, bus: usize) -> &[usize] {
        &self.col_indices_lu[self.row_offsets_lu[bus]..self.row_offsets_lu[bus + 1]]
    }

    /// Position of `(row, col)` within `col_indices`, if present.
    pub fn index_of(&self, row: usize, col: usize) -> Option<usize> {
        let row_slice = self.row(row);
        row_slice
            .binary_search(&col)
            .ok()
            .map(|pos| self.row_offsets[row] + pos)
    }

    /// Position of `(row, col)` within `col_indices_lu`, if present.
    pub fn index_of_lu(&self, row: usize, col: usize) -> Option<usize> {
        let row_slice = self.row_lu(row);
        row_slice
            .binary_search(&col)
            .ok()
            .map(|pos| self.row_offsets_lu[row] + pos)
    }

    pub fn diag_index(&self, bus: usize) -> usize {
        self.index_of(bus, bus)
            .expect("diagonal entry always present in a YBusStructure")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{ComponentConnection, ComponentTopology, build_topology};

    #[test]
    fn structure_has_symmetric_off_diagonal_pattern() {
        let mut topo = ComponentTopology {
            n_node: 3,
            source_node: vec![0],
            ..Default::default()
        };
        topo.branch.push([0, 1]);
        topo.branch.push([1, 2]);
        let mut conn = ComponentConnection {
            source_active: vec![true],
            ..Default::default()
        };
        conn.branch_status.push([true, true]);
        conn.branch_phase_shift.push(0.0);
        conn.branch_status.push([true, true]);
        conn.branch_phase_shift.push(0.0);
        let (models, _) = build_topology(&topo, &conn);
        let structure = YBusStructure::from_topology(&models[0]);
        for bus in 0..structure.n_bus {
            assert!(structure.row(bus).contains(&bus));
        }
        for row in 0..structure.n_bus {
            for &col in structure.row(row) {
                assert!(
                    structure.index_of(col, row).is_some(),
                    "pattern not symmetric at ({row},{col})"
                );
            }
        }
    }

    /// Testable Property #3: `col_indices_lu` is a superset of
    /// `col_indices` row-by-row, `map_lu_y_bus[k] == -1` iff `k` has no
    /// original Y-bus entry, and `lu_transpose_entry` is an involution.
    #[test]
    fn lu_pattern_is_a_superset_with_a_consistent_map_and_involutive_transpose() {
        let mut topo = ComponentTopology {
            n_node: 4,
            source_node: vec![0],
            ..Default::default()
        };
        topo.branch.push([0, 1]);
        topo.branch.push([1, 2]);
        topo.branch.push([2, 3]);
        topo.branch.push([3, 0]);
        let mut conn = ComponentConnection {
            source_active: vec![true],
            ..Default::default()
        };
        for _ in 0..4 {
            conn.branch_status.push([true, true]);
            conn.branch_phase_shift.push(0.0);
        }
        let (models, _) = build_topology(&topo, &conn);
        let structure = YBusStructure::from_topology(&models[0]);

        for row in 0..structure.n_bus {
            for &col in structure.row(row) {
                assert!(
                    structure.row_lu(row).contains(&col),
                    "LU pattern dropped original entry ({row},{col})"
                );
            }
        }

        for row in 0..structure.n_bus {
            for (offset, &col) in structure.row_lu(row).iter().enumerate() {
                let k = structure.row_offsets_lu[row] + offset;
                let in_y = structure.index_of(row, col).is_some();
                assert_eq!(structure.map_lu_y_bus[k] != -1, in_y);
            }
        }

        for k in 0..structure.nnz_lu() {
            assert_eq!(
                structure.lu_transpose_entry[structure.lu_transpose_entry[k]],
                k
            );
        }
    }
}
