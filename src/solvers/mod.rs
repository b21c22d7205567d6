//! Math solvers (spec §4.7): five steady-state solvers (linear and
//! iterative-current-injection power flow, Newton-Raphson power flow,
//! iterative-linear and Newton-Raphson state estimation) plus the
//! IEC-60909 short-circuit solver, unified behind one dispatcher.

pub mod dispatcher;
pub mod iterative_current_pf;
pub mod iterative_linear_se;
pub mod linear_pf;
pub mod newton_pf;
pub mod newton_se;
pub mod short_circuit;

use crate::component_model::{ApplianceOutput, BranchOutput};
use crate::types::Symmetry;

/// Which math solver to run (spec §4.7 "Dispatcher").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalculationMethod {
    LinearPowerFlow,
    IterativeCurrentPowerFlow,
    NewtonRaphsonPowerFlow,
    IterativeLinearStateEstimation,
    NewtonRaphsonStateEstimation,
    ShortCircuit,
}

/// Converged (or diverged-but-returned, for callers that inspect
/// `iterations` themselves) solver result for one math model (spec §4.7
/// "Output").
#[derive(Debug, Clone)]
pub struct SolverOutput<S: Symmetry> {
    pub bus_voltage: Vec<S::Value>,
    pub iterations: usize,
    pub max_deviation: f64,
    pub branch: Vec<BranchOutput<S>>,
    pub source: Vec<ApplianceOutput<S>>,
    pub shunt: Vec<ApplianceOutput<S>>,
    pub load_gen: Vec<ApplianceOutput<S>>,
}
