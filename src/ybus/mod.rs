//! Y-bus assembly (spec §4.3): turns a [`crate::topology::MathTopology`]
//! plus per-component admittance parameters into the sparse nodal
//! admittance matrix, with incremental re-stamping for parameter-only
//! changes.

pub mod param;
pub mod structure;
pub mod ybus;

pub use param::{BranchAdmittance, MathParam};
pub use structure::YBusStructure;
pub use ybus::YBus;
