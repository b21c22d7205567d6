//! Error sum type raised to callers (spec §6 "Errors raised to callers",
//! §7 "Error handling design").
//!
//! Every variant is fatal for the scenario that raised it and is never
//! retried inside the core (§7 "Propagation policy"); nothing is caught
//! locally inside a solver. The batch boundary (out of scope for this
//! crate) wraps each with a scenario index, which [`BatchCalculationError`]
//! models as a plain collector.

use derive_more::{Display, Error};

use crate::types::Idx;

/// One error raised by topology construction, Y-bus assembly, a math
/// solver, or the observability checker.
#[derive(Debug, Display, Error, Clone, PartialEq)]
pub enum GridError {
    #[display("conflicting id: {id}")]
    ConflictId { id: Idx },

    #[display("conflicting voltage at node {node}: {message}")]
    ConflictVoltage { node: Idx, message: String },

    #[display("invalid branch {branch}: {message}")]
    InvalidBranch { branch: Idx, message: String },

    #[display("invalid branch3 {branch3}: {message}")]
    InvalidBranch3 { branch3: Idx, message: String },

    #[display("invalid transformer clock on branch {branch}: {clock}")]
    InvalidTransformerClock { branch: Idx, clock: i32 },

    #[display(
        "sparse matrix error at row {row}: {message} (possibly singular; in state estimation, \
         often means insufficient observability)"
    )]
    SparseMatrix { row: Idx, message: String },

    #[display(
        "iteration did not converge after {iterations} iterations: last deviation {last_deviation:e}, tolerance {tolerance:e}"
    )]
    IterationDiverge {
        iterations: usize,
        last_deviation: f64,
        tolerance: f64,
    },

    #[display("id not found: {id}")]
    IdNotFound { id: Idx },

    #[display("invalid measured object {id}: {message}")]
    InvalidMeasuredObject { id: Idx, message: String },

    #[display("id {id} has the wrong component type: expected {expected}")]
    IdWrongType { id: Idx, expected: &'static str },

    #[display("invalid calculation method: {message}")]
    InvalidCalculationMethod { message: String },

    #[display("unknown attribute name: {name}")]
    UnknownAttributeName { name: String },

    #[display("invalid short-circuit type: {message}")]
    InvalidShortCircuitType { message: String },

    #[display("invalid short-circuit phases: {message}")]
    InvalidShortCircuitPhases { message: String },

    #[display("faults in one calculation must share fault type and phase selection")]
    InvalidShortCircuitPhaseOrType,

    #[display("not observable: {reason}")]
    NotObservable { reason: ObservabilityFailure },

    #[display(
        "conflicting angle measurement type at terminal {terminal}: both local-angle and global-angle current sensors present"
    )]
    ConflictingAngleMeasurementType { terminal: Idx },
}

/// Which condition the observability checker failed on (spec §4.6/§7
/// "pin-point which condition").
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ObservabilityFailure {
    #[display("no voltage sensor present in the math model")]
    NoVoltageSensor,
    #[display("measurement count is insufficient (n_flow + n_inj + max(n_phasor,1) - 1 < n_bus - 1)")]
    InsufficientCount,
    #[display("a global-angle current sensor is present without any voltage-phasor sensor")]
    MissingAngleReference,
    #[display("radial sensor redistribution left at least one branch unmeasured")]
    RadialUnmeasuredBranch,
    #[display("no spanning tree of measured edges could be discovered in the meshed grid")]
    MeshedSpanningTreeNotFound,
}

/// Convenience alias used throughout the crate.
pub type GridResult<T> = Result<T, GridError>;

/// Collects per-scenario errors the way a batch driver (out of scope for
/// this crate) would, so solvers that run many scenarios have somewhere to
/// put partial failures without aborting the whole batch (spec §6, §7).
#[derive(Debug, Default, Clone)]
pub struct BatchCalculationError {
    pub failures: Vec<(usize, GridError)>,
}

impl BatchCalculationError {
    pub fn push(&mut self, scenario: usize, error: GridError) {
        self.failures.push((scenario, error));
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl std::fmt::Display for BatchCalculationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} scenario(s) failed: ", self.failures.len())?;
        for (i, (scenario, err)) in self.failures.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "[{scenario}] {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for BatchCalculationError {}
