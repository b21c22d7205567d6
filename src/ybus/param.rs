//! Per-branch admittance parameter shape (spec §4.3 step 1: "pull `y_ff`,
//! `y_ft`, `y_tf`, `y_tt` from each branch's `calc_param()`").

use crate::types::Symmetry;

/// A branch's pi-equivalent admittance block, in whichever shape `S`
/// dictates (scalar for [`crate::types::Sym`], 3x3 phase tensor for
/// [`crate::types::Asym`]).
#[derive(Debug, Clone, Copy)]
pub struct BranchAdmittance<S: Symmetry> {
    pub y_ff: S::Admittance,
    pub y_ft: S::Admittance,
    pub y_tf: S::Admittance,
    pub y_tt: S::Admittance,
}

impl<S: Symmetry> BranchAdmittance<S> {
    pub fn zero() -> Self {
        Self {
            y_ff: S::zero_admittance(),
            y_ft: S::zero_admittance(),
            y_tf: S::zero_admittance(),
            y_tt: S::zero_admittance(),
        }
    }
}

/// Aggregated per-math-model electrical parameters, already expanded from
/// each component's `calc_param()` into the math model's local bus
/// numbering (spec §4.3 "Assembly"). This is the Y-bus assembler's input,
/// kept distinct from [`crate::ybus::YBus`] (which is the assembled result)
/// so a caller can incrementally recompute only the parameters that changed
/// (spec §4.3 "Incremental update").
#[derive(Debug, Clone)]
pub struct MathParam<S: Symmetry> {
    /// Per math-model-branch-position admittance block.
    pub branch: Vec<BranchAdmittance<S>>,
    /// Per math-model-shunt-position admittance to ground.
    pub shunt: Vec<S::Admittance>,
    /// Per math-model-source-position Thevenin admittance and reference
    /// voltage.
    pub source_admittance: Vec<S::Admittance>,
    pub source_u_ref: Vec<S::Value>,
}
