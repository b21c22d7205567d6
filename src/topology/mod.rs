//! Topology reduction (spec §4.2): fuses the raw user component graph into
//! one [`MathTopology`] per energized, connected sub-network, with a
//! fill-in-minimizing bus numbering and a bidirectional [`TopoCoupling`]
//! back to the original component indices.

pub mod fillin;
pub mod input;
pub mod reducer;

pub use fillin::{EliminationOrdering, EliminationResult, MinimumDegreeOrdering};
pub use input::{Branch3Ends, BranchEnds, ComponentConnection, ComponentTopology};
pub use reducer::{
    BranchRef, Branch3Coupling, Coupling, MathTopology, TopoCoupling, build_topology,
};
