//! Component-model trait (spec §6.1): the interface the topology reducer and
//! Y-bus assembler use to read per-element physical parameters. The core
//! treats every implementor as opaque — it never inspects the concrete
//! component kind (`Line`, `Transformer`, `GenericBranch`, `Link`, `Shunt`,
//! `Source`, `LoadGen`, sensors, `Fault`), it only calls through these
//! operations. The concrete physical formulas for each component kind are
//! explicitly out of scope (spec §1 "per-component data model").

use crate::types::{Idx, Symmetry};
use crate::ybus::param::BranchAdmittance;
use serde::{Deserialize, Serialize};

/// Common identity/status surface shared by every branch-like, shunt-like,
/// and appliance-like component kind.
pub trait ComponentId {
    fn id(&self) -> Idx;
}

/// A two-terminal branch component (`Line`, `Transformer`, `GenericBranch`,
/// `Link`).
pub trait BranchModel<S: Symmetry>: ComponentId {
    fn node_from(&self) -> Idx;
    fn node_to(&self) -> Idx;
    fn status_from(&self) -> bool;
    fn status_to(&self) -> bool;
    /// Signed phase shift introduced by this branch (0 for non-transformer
    /// branches).
    fn phase_shift(&self) -> f64;
    /// The branch's `{y_ff, y_ft, y_tf, y_tt}` admittance block.
    fn calc_param(&self) -> BranchAdmittance<S>;
}

/// A one-terminal admittance-to-ground component (`Shunt`).
pub trait ShuntModel<S: Symmetry>: ComponentId {
    fn node(&self) -> Idx;
    fn status(&self) -> bool;
    fn calc_param(&self) -> S::Admittance;
}

/// A Thevenin-equivalent source behind an admittance (`Source`).
pub trait SourceModel<S: Symmetry>: ComponentId {
    fn node(&self) -> Idx;
    fn status(&self) -> bool;
    /// Whether this source actively energizes its node (spec §3
    /// `ComponentConnection`: "source active bit").
    fn is_active(&self) -> bool {
        self.status()
    }
    fn u_ref(&self) -> S::Value;
    fn calc_param(&self) -> S::Admittance;
}

/// Load/generator type tag (spec glossary "Load/gen").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadGenType {
    ConstPower,
    ConstCurrent,
    ConstImpedance,
}

/// A bus-injecting appliance (`LoadGen`).
pub trait LoadGenModel<S: Symmetry>: ComponentId {
    fn node(&self) -> Idx;
    fn status(&self) -> bool;
    fn load_gen_type(&self) -> LoadGenType;
    /// Rated complex power at rated voltage (sign convention: load is
    /// positive, generation is negative, matching an injection of `-S`).
    fn s_rated(&self) -> S::Value;
}

/// A single sensor measurement with its variance, decomposed the way spec
/// §9 calls for ("Represent every measurement as an explicit (value,
/// variance) pair").
#[derive(Debug, Clone, Copy)]
pub struct MeasuredValue<S: Symmetry> {
    pub value: S::Value,
    pub variance: f64,
}

/// What kind of terminal a sensor is attached to (spec §3
/// `ComponentTopology`: "per-sensor (object, terminal-type)").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorTerminal {
    Node,
    BranchFrom,
    BranchTo,
    Source,
    Shunt,
    LoadGen,
}

/// Whether a current sensor's angle is defined in its own bus's rotating
/// frame or against the system reference (spec glossary).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurrentAngleKind {
    Local,
    Global,
}

/// A voltage, power, or current sensor attached to a node/branch-end/
/// appliance.
pub trait SensorModel<S: Symmetry>: ComponentId {
    fn measured_object(&self) -> Idx;
    fn terminal(&self) -> SensorTerminal;
}

/// A voltage sensor; `value` may carry `NaN` imaginary part to denote
/// magnitude-only measurement (spec §4.5 step 1).
pub trait VoltageSensorModel<S: Symmetry>: SensorModel<S> {
    fn measured_value(&self) -> MeasuredValue<S>;
}

/// A power sensor on a node/branch-end/appliance terminal.
pub trait PowerSensorModel<S: Symmetry>: SensorModel<S> {
    fn measured_power(&self) -> MeasuredValue<S>;
}

/// A current sensor on a branch terminal, tagged local or global angle.
pub trait CurrentSensorModel<S: Symmetry>: SensorModel<S> {
    fn measured_current(&self) -> MeasuredValue<S>;
    fn angle_kind(&self) -> CurrentAngleKind;
}

/// Fault type (spec §4.7.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultType {
    ThreePhase,
    SinglePhaseToGround,
    TwoPhase,
    TwoPhaseToGround,
}

/// Which of the three phases participate in the fault (spec §4.7.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPhase {
    A,
    B,
    C,
    Ab,
    Bc,
    Ca,
    Abc,
}

/// A single fault specification (`Fault`).
pub trait FaultModel: ComponentId {
    fn node(&self) -> Idx;
    fn fault_type(&self) -> FaultType;
    fn fault_phase(&self) -> FaultPhase;
    /// `None` denotes an infinite (bolted) fault admittance.
    fn admittance(&self) -> Option<num_complex::Complex64>;
}

/// Per-element output used for result emission (spec §6 "get_output").
#[derive(Debug, Clone, Copy)]
pub struct ApplianceOutput<S: Symmetry> {
    pub i: S::Value,
    pub s: S::Value,
}

#[derive(Debug, Clone, Copy)]
pub struct BranchOutput<S: Symmetry> {
    pub i_f: S::Value,
    pub i_t: S::Value,
    pub s_f: S::Value,
    pub s_t: S::Value,
}
