//! Raw user-facing component graph (spec §3 `ComponentTopology` /
//! `ComponentConnection`).

use crate::component_model::SensorTerminal;
use crate::types::Idx;
use serde::{Deserialize, Serialize};

/// Per-branch terminal pair, indexing into `[0, n_node)`.
pub type BranchEnds = [Idx; 2];
/// Per-branch3 terminal triplet.
pub type Branch3Ends = [Idx; 3];

/// The raw user graph: connectivity only, no physical parameters (spec §1
/// "the core consumes them only through the interfaces in §6" — this struct
/// is the connectivity half of that input, independent of any concrete
/// component kind).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComponentTopology {
    pub n_node: usize,
    pub branch: Vec<BranchEnds>,
    pub branch3: Vec<Branch3Ends>,
    /// Zero-impedance rigid identifications (spec §4.2 step 2: "link-style
    /// branches (treated as rigid identifications)").
    pub link: Vec<BranchEnds>,
    pub source_node: Vec<Idx>,
    pub shunt_node: Vec<Idx>,
    pub load_gen_node: Vec<Idx>,
    /// Index into the per-terminal-kind array (node/branch/source/shunt/
    /// load_gen) the sensor at the same position is attached to.
    pub sensor_object: Vec<Idx>,
    pub sensor_terminal: Vec<SensorTerminal>,
}

impl ComponentTopology {
    pub fn n_branch(&self) -> usize {
        self.branch.len()
    }
    pub fn n_branch3(&self) -> usize {
        self.branch3.len()
    }
    pub fn n_link(&self) -> usize {
        self.link.len()
    }
    pub fn n_source(&self) -> usize {
        self.source_node.len()
    }
    pub fn n_shunt(&self) -> usize {
        self.shunt_node.len()
    }
    pub fn n_load_gen(&self) -> usize {
        self.load_gen_node.len()
    }
    pub fn n_sensor(&self) -> usize {
        self.sensor_object.len()
    }
}

/// Status flags: switch states plus transformer phase shift (spec §3
/// `ComponentConnection`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComponentConnection {
    /// Per-branch `(connected_from, connected_to)`.
    pub branch_status: Vec<[bool; 2]>,
    /// Per-branch signed phase shift.
    pub branch_phase_shift: Vec<f64>,
    /// Per-branch3, per-arm connection status.
    pub branch3_status: Vec<[bool; 3]>,
    /// Per-branch3, per-arm signed phase shift.
    pub branch3_phase_shift: Vec<[f64; 3]>,
    /// Per-link `(connected_from, connected_to)`; a link only identifies its
    /// two ends when both are connected.
    pub link_status: Vec<[bool; 2]>,
    /// Per-source, whether it actively energizes its node.
    pub source_active: Vec<bool>,
}
