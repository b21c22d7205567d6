//! Steady-state three-phase power network solver core.
//!
//! Given a grid topology (buses, branches, three-winding transformers,
//! shunts, sources, loads/generators, sensors, faults) this crate computes
//! bus voltages and derived branch/appliance flows under either the
//! symmetric (positive-sequence) or asymmetric (full three-phase ABC)
//! assumption, via power flow, state estimation, or IEC-60909 short-circuit
//! analysis.
//!
//! The pipeline, leaves first: [`grouped_index`] underlies every
//! "elements per group" relation; [`topology`] fuses a component graph into
//! one [`topology::MathTopology`] per energized sub-network; [`ybus`]
//! assembles the sparse nodal admittance matrix and its LU sparsity;
//! [`sparse_lu`] factorizes and solves block-structured sparse systems;
//! [`measured_values`] and [`observability`] support state estimation;
//! [`solvers`] hosts the five steady-state solvers plus the short-circuit
//! solver and their dispatcher.

pub mod component_model;
pub mod error;
pub mod grouped_index;
pub mod logger;
pub mod measured_values;
pub mod observability;
pub mod solvers;
pub mod sparse_lu;
pub mod topology;
pub mod types;
pub mod ybus;

pub mod prelude {
    pub use crate::error::{GridError, GridResult};
    pub use crate::grouped_index::GroupedIndex;
    pub use crate::logger::{EventCode, Logger};
    pub use crate::solvers::{SolverOutput, dispatcher::MathSolverDispatcher};
    pub use crate::sparse_lu::block::Block;
    pub use crate::topology::{ComponentConnection, ComponentTopology, MathTopology, TopoCoupling};
    pub use crate::types::{Asym, Idx, Sym, Symmetry};
    pub use crate::ybus::{MathParam, YBus, YBusStructure};
}
