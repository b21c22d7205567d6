//! Y-bus numeric assembly and incremental update (spec §4.3).

use std::ops::{Add, Neg};

use crate::component_model::{ApplianceOutput, BranchOutput};
use crate::topology::MathTopology;
use crate::types::Symmetry;
use crate::ybus::param::MathParam;
use crate::ybus::structure::YBusStructure;

/// Which parameter stamps into a given `values` position, captured once at
/// `assemble` time so `update_values` can recompute just the touched entries
/// instead of re-stamping the whole matrix (spec §4.3 "Incremental update").
#[derive(Debug, Clone, Copy)]
enum Contributor {
    BranchFf(usize),
    BranchFt(usize),
    BranchTf(usize),
    BranchTt(usize),
    Shunt(usize),
    Source(usize),
}

/// Where a single branch's four admittance terms land in `values`; `None`
/// for the terms a one-sided (virtual-node) branch doesn't have.
#[derive(Debug, Clone, Copy, Default)]
struct BranchPositions {
    diag_f: Option<usize>,
    diag_t: Option<usize>,
    ft: Option<usize>,
    tf: Option<usize>,
}

/// The assembled nodal admittance matrix plus everything needed to recompute
/// it incrementally (spec §4.3 `YBus`).
#[derive(Debug, Clone)]
pub struct YBus<S: Symmetry> {
    pub structure: YBusStructure,
    /// One admittance value per `structure.col_indices` entry.
    pub values: Vec<S::Admittance>,
    branch_positions: Vec<BranchPositions>,
    shunt_position: Vec<usize>,
    source_position: Vec<usize>,
    /// Per-`values`-position list of every parameter that stamps into it;
    /// the inverse of `branch_positions`/`shunt_position`/`source_position`.
    contributors: Vec<Vec<Contributor>>,
    /// Bumped on every `update_values` call so a solver holding a cached
    /// prefactorization can tell the Y-bus moved on (spec §4.7.7 "reset
    /// only the affected solver's cache on a parameter-change
    /// notification").
    generation: u64,
}

impl<S> YBus<S>
where
    S: Symmetry,
    S::Admittance: Copy + Add<Output = S::Admittance> + Neg<Output = S::Admittance>,
{
    /// Builds the Y-bus from scratch (spec §4.3 step 3: "stamp `y_ff` into
    /// the from-from diagonal, `-y_ft` into the from-to off-diagonal, etc.,
    /// summing into any existing value at that position; add shunt and
    /// source admittances directly into their bus's diagonal"), and
    /// captures the parameter-to-position inverse maps `update_values`
    /// needs to stay incremental.
    pub fn assemble(topo: &MathTopology, param: &MathParam<S>) -> Self {
        let structure = YBusStructure::from_topology(topo);
        let nnz = structure.nnz();
        let mut contributors: Vec<Vec<Contributor>> = vec![Vec::new(); nnz];

        let mut branch_positions = Vec::with_capacity(topo.branch_bus_idx.len());
        for (pos, &(from, to)) in topo.branch_bus_idx.iter().enumerate() {
            let mut bp = BranchPositions::default();
            if from >= 0 {
                let idx = structure.diag_index(from as usize);
                bp.diag_f = Some(idx);
                contributors[idx].push(Contributor::BranchFf(pos));
            }
            if to >= 0 {
                let idx = structure.diag_index(to as usize);
                bp.diag_t = Some(idx);
                contributors[idx].push(Contributor::BranchTt(pos));
            }
            if from >= 0 && to >= 0 {
                let (f, t) = (from as usize, to as usize);
                let ft = structure
                    .index_of(f, t)
                    .expect("branch endpoints are stamped into the structure's pattern");
                let tf = structure
                    .index_of(t, f)
                    .expect("branch endpoints are stamped into the structure's pattern");
                bp.ft = Some(ft);
                bp.tf = Some(tf);
                contributors[ft].push(Contributor::BranchFt(pos));
                contributors[tf].push(Contributor::BranchTf(pos));
            }
            branch_positions.push(bp);
        }

        let mut shunt_position = vec![0usize; param.shunt.len()];
        for (bus_group, range) in topo.shunts_per_bus.iter() {
            let idx = structure.diag_index(bus_group);
            for pos in range {
                shunt_position[pos] = idx;
                contributors[idx].push(Contributor::Shunt(pos));
            }
        }

        let mut source_position = vec![0usize; param.source_admittance.len()];
        for (bus_group, range) in topo.sources_per_bus.iter() {
            let idx = structure.diag_index(bus_group);
            for pos in range {
                source_position[pos] = idx;
                contributors[idx].push(Contributor::Source(pos));
            }
        }

        let values = (0..nnz)
            .map(|pos| Self::sum_contributors(&contributors[pos], param))
            .collect();

        Self {
            structure,
            values,
            branch_positions,
            shunt_position,
            source_position,
            contributors,
            generation: 0,
        }
    }

    /// Recomputes exactly the `values` entries touched by the given changed
    /// parameter positions, via the inverse maps captured at `assemble`
    /// time, and bumps `generation` (spec §4.3 "Incremental update":
    /// "topology changes require `assemble`; parameter-only changes may
    /// reuse `update_values`"). A position shared by more than one
    /// parameter (e.g. two parallel branches stamping the same diagonal)
    /// is recomputed from every one of its contributors, not just the
    /// changed one, so it stays correct regardless of overlap.
    pub fn update_values(
        &mut self,
        param: &MathParam<S>,
        changed_branch: &[usize],
        changed_shunt: &[usize],
        changed_source: &[usize],
    ) {
        let mut touched = std::collections::BTreeSet::new();
        for &b in changed_branch {
            let bp = &self.branch_positions[b];
            touched.extend(bp.diag_f);
            touched.extend(bp.diag_t);
            touched.extend(bp.ft);
            touched.extend(bp.tf);
        }
        for &s in changed_shunt {
            touched.insert(self.shunt_position[s]);
        }
        for &s in changed_source {
            touched.insert(self.source_position[s]);
        }

        for pos in touched {
            self.values[pos] = Self::sum_contributors(&self.contributors[pos], param);
        }
        self.generation += 1;
    }

    /// Recomputes every `values` entry against the same structure, for
    /// callers that changed parameters broadly enough that enumerating
    /// individual positions isn't worth it (e.g. restoring a saved
    /// scenario wholesale).
    pub fn update_values_full(&mut self, param: &MathParam<S>) {
        for pos in 0..self.values.len() {
            self.values[pos] = Self::sum_contributors(&self.contributors[pos], param);
        }
        self.generation += 1;
    }

    /// Monotonically increasing counter bumped by `update_values`/
    /// `update_values_full`; a solver caches this alongside its
    /// prefactorization and re-factorizes once it changes (spec §4.7.7).
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn sum_contributors(contribs: &[Contributor], param: &MathParam<S>) -> S::Admittance {
        let mut acc = S::zero_admittance();
        for c in contribs {
            acc = acc
                + match *c {
                    Contributor::BranchFf(p) => param.branch[p].y_ff,
                    Contributor::BranchFt(p) => param.branch[p].y_ft,
                    Contributor::BranchTf(p) => param.branch[p].y_tf,
                    Contributor::BranchTt(p) => param.branch[p].y_tt,
                    Contributor::Shunt(p) => param.shunt[p],
                    Contributor::Source(p) => param.source_admittance[p],
                };
        }
        acc
    }

    /// `I = Y . U` at every bus, the current-injection side of the nodal
    /// equation (spec §4.3 "Derived quantities").
    pub fn calculate_injection(&self, voltage: &[S::Value]) -> Vec<S::Value>
    where
        S::Admittance: std::ops::Mul<S::Value, Output = S::Value>,
    {
        let n = self.structure.n_bus;
        let mut injection = vec![S::zero_value(); n];
        for bus in 0..n {
            let mut acc = S::zero_value();
            for (offset, &col) in self.structure.row(bus).iter().enumerate() {
                let idx = self.structure.row_offsets[bus] + offset;
                acc = acc + self.values[idx] * voltage[col];
            }
            injection[bus] = acc;
        }
        injection
    }

    /// Per-branch terminal currents and powers given the solved bus voltage
    /// vector (spec §4.3 "Derived quantities"; `s = u * conj(i)` at each
    /// end).
    pub fn branch_flow(
        &self,
        topo: &MathTopology,
        param: &MathParam<S>,
        voltage: &[S::Value],
    ) -> Vec<BranchOutput<S>>
    where
        S::Admittance: std::ops::Mul<S::Value, Output = S::Value>,
        S::Value: Copy + crate::types::ConjMul,
    {
        topo.branch_bus_idx
            .iter()
            .zip(&param.branch)
            .map(|(&(from, to), y)| {
                let u_f = if from >= 0 {
                    voltage[from as usize]
                } else {
                    S::zero_value()
                };
                let u_t = if to >= 0 {
                    voltage[to as usize]
                } else {
                    S::zero_value()
                };
                let i_f = y.y_ff * u_f + y.y_ft * u_t;
                let i_t = y.y_tf * u_f + y.y_tt * u_t;
                BranchOutput {
                    i_f,
                    i_t,
                    s_f: u_f.conj_mul(i_f),
                    s_t: u_t.conj_mul(i_t),
                }
            })
            .collect()
    }

    /// Per-shunt absorbed current and power given the solved bus voltage
    /// (spec §4.3 "Derived quantities": `calculate_shunt_flow`);
    /// `i = y_shunt . u`, `s = u * conj(i)` at the shunt's own bus. Feeds
    /// `SolverOutput::shunt` and the line/shunt energy balance of Testable
    /// Property #4.
    pub fn calculate_shunt_flow(
        &self,
        topo: &MathTopology,
        param: &MathParam<S>,
        voltage: &[S::Value],
    ) -> Vec<ApplianceOutput<S>>
    where
        S::Admittance: std::ops::Mul<S::Value, Output = S::Value>,
        S::Value: Copy + crate::types::ConjMul,
    {
        let mut out = vec![
            ApplianceOutput {
                i: S::zero_value(),
                s: S::zero_value(),
            };
            param.shunt.len()
        ];
        for (bus, range) in topo.shunts_per_bus.iter() {
            let u = voltage[bus];
            for pos in range {
                let i = param.shunt[pos] * u;
                out[pos] = ApplianceOutput {
                    i,
                    s: u.conj_mul(i),
                };
            }
        }
        out
    }

    /// Per-source delivered current and power given the solved bus voltage
    /// (spec §4.3 "Derived quantities"). A Thevenin source is stamped as a
    /// Norton equivalent (its admittance folded into the bus diagonal, its
    /// current `y_src . u_ref` folded into the rhs), so the current it
    /// actually delivers once the network has settled is the Thevenin form
    /// `i = y_src . (u_ref - u)`.
    pub fn calculate_source_flow(
        &self,
        topo: &MathTopology,
        param: &MathParam<S>,
        voltage: &[S::Value],
    ) -> Vec<ApplianceOutput<S>>
    where
        S::Admittance: std::ops::Mul<S::Value, Output = S::Value>,
        S::Value: Copy + crate::types::ConjMul + std::ops::Sub<Output = S::Value>,
    {
        let mut out = vec![
            ApplianceOutput {
                i: S::zero_value(),
                s: S::zero_value(),
            };
            param.source_admittance.len()
        ];
        for (bus, range) in topo.sources_per_bus.iter() {
            let u = voltage[bus];
            for pos in range {
                let i = param.source_admittance[pos] * (param.source_u_ref[pos] - u);
                out[pos] = ApplianceOutput {
                    i,
                    s: u.conj_mul(i),
                };
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{ComponentConnection, ComponentTopology, build_topology};
    use crate::types::Sym;
    use num_complex::Complex64;

    #[test]
    fn single_branch_stamps_both_diagonals_and_off_diagonals() {
        let mut topo = ComponentTopology {
            n_node: 2,
            source_node: vec![0],
            ..Default::default()
        };
        topo.branch.push([0, 1]);
        let mut conn = ComponentConnection {
            source_active: vec![true],
            ..Default::default()
        };
        conn.branch_status.push([true, true]);
        conn.branch_phase_shift.push(0.0);
        let (models, _) = build_topology(&topo, &conn);
        let model = &models[0];

        let y = Complex64::new(0.0, -10.0);
        let param = MathParam::<Sym> {
            branch: vec![crate::ybus::param::BranchAdmittance {
                y_ff: y,
                y_ft: -y,
                y_tf: -y,
                y_tt: y,
            }],
            shunt: vec![],
            source_admittance: vec![],
            source_u_ref: vec![],
        };
        let ybus = YBus::<Sym>::assemble(model, &param);
        assert_eq!(ybus.structure.nnz(), 4);
        let d0 = ybus.structure.diag_index(0);
        assert_eq!(ybus.values[d0], y);
    }

    #[test]
    fn update_values_only_touches_positions_the_changed_branch_stamps() {
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
        for _ in 0..2 {
            conn.branch_status.push([true, true]);
            conn.branch_phase_shift.push(0.0);
        }
        let (models, _) = build_topology(&topo, &conn);
        let model = &models[0];

        let y = Complex64::new(0.0, -10.0);
        let mut param = MathParam::<Sym> {
            branch: vec![
                crate::ybus::param::BranchAdmittance {
                    y_ff: y,
                    y_ft: -y,
                    y_tf: -y,
                    y_tt: y,
                },
                crate::ybus::param::BranchAdmittance {
                    y_ff: y,
                    y_ft: -y,
                    y_tf: -y,
                    y_tt: y,
                },
            ],
            shunt: vec![],
            source_admittance: vec![],
            source_u_ref: vec![],
        };
        let mut ybus = YBus::<Sym>::assemble(model, &param);
        assert_eq!(ybus.generation(), 0);

        let bus2_diag = ybus.structure.diag_index(2);
        let before_bus2 = ybus.values[bus2_diag];

        let y2 = Complex64::new(0.0, -20.0);
        param.branch[0] = crate::ybus::param::BranchAdmittance {
            y_ff: y2,
            y_ft: -y2,
            y_tf: -y2,
            y_tt: y2,
        };
        ybus.update_values(&param, &[0], &[], &[]);

        assert_eq!(ybus.generation(), 1);
        let d0 = ybus.structure.diag_index(0);
        assert_eq!(ybus.values[d0], y2);
        // Branch 1 (bus 2's only stamp) never changed, so bus 2's diagonal
        // must be untouched by an update that only named branch 0.
        assert_eq!(ybus.values[bus2_diag], before_bus2);
    }
}
