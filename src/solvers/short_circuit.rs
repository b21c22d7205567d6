//! IEC-60909 short-circuit solver (spec §4.7.6): modifies the already
//! source-stamped Y-bus with one diagonal/row edit per fault and solves the
//! resulting linear system once, no iteration.
//!
//! Phase selection: a fault's affected phases come from its [`FaultPhase`]
//! alone (`A`/`B`/`C`/`Ab`/`Bc`/`Ca`/`Abc`), mapped onto the symmetry's own
//! block indices the same way [`crate::types::BlockEmbeddable`] already maps
//! asymmetric values onto `Block<3>` (index `p` = phase `p`). For the
//! symmetric case (`N = 1`, a balanced three-phase equivalent) any nonempty
//! phase selection collapses onto that single scalar; only a three-phase
//! (`Abc`) fault is physically meaningful there, but nothing here rejects a
//! narrower selection against `Sym` since the crate has no separate
//! ground/neutral representation to validate it against.

use num_complex::Complex64;

use crate::component_model::{BranchOutput, FaultPhase, FaultType};
use crate::error::{GridError, GridResult};
use crate::logger::{EventCode, Logger};
use crate::sparse_lu::{Block, BlockCsr, BlockLu, BlockVector};
use crate::topology::MathTopology;
use crate::types::{BlockEmbeddable, Symmetry};
use crate::ybus::YBus;
use crate::ybus::param::MathParam;

/// One fault specification resolved by the caller from its
/// [`crate::component_model::FaultModel`] (spec §4.7.6).
#[derive(Debug, Clone, Copy)]
pub struct FaultInput {
    pub bus: usize,
    pub fault_type: FaultType,
    pub fault_phase: FaultPhase,
    /// `None` means an infinite (bolted) fault admittance.
    pub admittance: Option<Complex64>,
}

#[derive(Debug, Clone)]
pub struct ShortCircuitOutput<S: Symmetry> {
    pub bus_voltage: Vec<S::Value>,
    /// One entry per input fault, in the same order.
    pub fault_current: Vec<S::Value>,
    pub branch: Vec<BranchOutput<S>>,
}

pub fn solve<S, const N: usize>(
    topo: &MathTopology,
    ybus: &YBus<S>,
    param: &MathParam<S>,
    faults: &[FaultInput],
    logger: &Logger,
) -> GridResult<ShortCircuitOutput<S>>
where
    S: BlockEmbeddable<N>,
    S::Value: std::ops::Sub<Output = S::Value>,
    S::Admittance: std::ops::Mul<S::Value, Output = S::Value>,
{
    let _scope = logger.scope(EventCode::MathCalculation);
    let n_bus = topo.n_bus;

    if let Some(first) = faults.first() {
        let consistent = faults
            .iter()
            .all(|f| f.fault_type == first.fault_type && f.fault_phase == first.fault_phase);
        if !consistent {
            return Err(GridError::InvalidShortCircuitPhaseOrType);
        }
    }

    let edges: Vec<(usize, usize)> = (0..n_bus)
        .flat_map(|row| {
            ybus.structure
                .row(row)
                .iter()
                .copied()
                .filter(move |&col| col != row)
                .map(move |col| (row, col))
        })
        .collect();
    let mut system = BlockCsr::<N>::with_pattern(n_bus, &edges, &topo.fill_in);
    for bus in 0..n_bus {
        for &col in ybus.structure.row(bus) {
            let idx = ybus.structure.index_of(bus, col).expect("symmetric pattern");
            system.add_at(bus, col, S::admittance_to_block(ybus.values[idx]))?;
        }
    }

    // Source Thevenin injection; the diagonal contribution is already part
    // of `ybus` from assembly (spec §4.3 stamp step).
    let mut source_rhs = vec![S::zero_value(); n_bus];
    for (bus, range) in topo.sources_per_bus.iter() {
        for pos in range {
            let y_src = param.source_admittance[pos];
            let u_ref = param.source_u_ref[pos];
            source_rhs[bus] = source_rhs[bus] + y_src * u_ref;
        }
    }
    let mut rhs: Vec<BlockVector<N>> = source_rhs.iter().map(|&s| S::value_to_block(s)).collect();

    for fault in faults {
        let mask = phase_mask(fault.fault_phase);
        match fault.admittance {
            Some(y_f) => {
                let block = system.diag_mut(fault.bus);
                for p in 0..N.min(3) {
                    if mask[p] {
                        block[(p, p)] += y_f;
                    }
                }
            }
            None => {
                for &col in ybus.structure.row(fault.bus) {
                    zero_masked_rows(system.block_mut(fault.bus, col), mask);
                }
                let diag = system.diag_mut(fault.bus);
                for p in 0..N.min(3) {
                    if mask[p] {
                        diag[(p, p)] = Complex64::new(-1.0, 0.0);
                    }
                }
                let rhs_block = &mut rhs[fault.bus];
                for p in 0..N.min(3) {
                    if mask[p] {
                        rhs_block[p] = Complex64::new(0.0, 0.0);
                    }
                }
            }
        }
    }

    let lu = BlockLu::factorize(system, false)?;
    let solved = lu.solve(&rhs);
    let bus_voltage: Vec<S::Value> = solved.into_iter().map(S::block_to_value).collect();

    // Fault current from node power balance: what the pre-fault source
    // injection specified, minus what the unmodified Y-bus now draws at
    // that bus, is the current the fault itself absorbed.
    let injection = ybus.calculate_injection(&bus_voltage);
    let fault_current: Vec<S::Value> = faults
        .iter()
        .map(|f| source_rhs[f.bus] - injection[f.bus])
        .collect();

    let branch = ybus.branch_flow(topo, param, &bus_voltage);
    Ok(ShortCircuitOutput {
        bus_voltage,
        fault_current,
        branch,
    })
}

fn zero_masked_rows<const N: usize>(block: &mut Block<N>, mask: [bool; 3]) {
    for p in 0..N.min(3) {
        if mask[p] {
            for q in 0..N {
                block[(p, q)] = Complex64::new(0.0, 0.0);
            }
        }
    }
}

fn phase_mask(phase: FaultPhase) -> [bool; 3] {
    match phase {
        FaultPhase::A => [true, false, false],
        FaultPhase::B => [false, true, false],
        FaultPhase::C => [false, false, true],
        FaultPhase::Ab => [true, true, false],
        FaultPhase::Bc => [false, true, true],
        FaultPhase::Ca => [true, false, true],
        FaultPhase::Abc => [true, true, true],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{ComponentConnection, ComponentTopology, build_topology};
    use crate::types::Sym;

    #[test]
    fn bolted_fault_collapses_bus_voltage_to_zero() {
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
        let (models, coupling) = build_topology(&topo, &conn);
        let model = &models[0];
        let fault_bus = coupling.node[1].pos as usize;

        let y_line = Complex64::new(2.0, -20.0);
        let param = MathParam::<Sym> {
            branch: vec![crate::ybus::param::BranchAdmittance {
                y_ff: y_line,
                y_ft: -y_line,
                y_tf: -y_line,
                y_tt: y_line,
            }],
            shunt: vec![],
            source_admittance: vec![Complex64::new(1000.0, 0.0)],
            source_u_ref: vec![Complex64::new(1.0, 0.0)],
        };
        let ybus = YBus::<Sym>::assemble(model, &param);
        let logger = Logger::new();
        let faults = vec![FaultInput {
            bus: fault_bus,
            fault_type: FaultType::ThreePhase,
            fault_phase: FaultPhase::Abc,
            admittance: None,
        }];
        let out = solve::<Sym, 1>(model, &ybus, &param, &faults, &logger).unwrap();
        assert!(out.bus_voltage[fault_bus].norm() < 1e-9);
        assert!(out.fault_current[0].norm() > 0.0);
    }

    #[test]
    fn mismatched_fault_selection_is_rejected() {
        let topo = ComponentTopology {
            n_node: 1,
            source_node: vec![0],
            ..Default::default()
        };
        let conn = ComponentConnection {
            source_active: vec![true],
            ..Default::default()
        };
        let (models, _) = build_topology(&topo, &conn);
        let model = &models[0];
        let param = MathParam::<Sym> {
            branch: vec![],
            shunt: vec![],
            source_admittance: vec![Complex64::new(100.0, 0.0)],
            source_u_ref: vec![Complex64::new(1.0, 0.0)],
        };
        let ybus = YBus::<Sym>::assemble(model, &param);
        let logger = Logger::new();
        let faults = vec![
            FaultInput {
                bus: 0,
                fault_type: FaultType::ThreePhase,
                fault_phase: FaultPhase::Abc,
                admittance: None,
            },
            FaultInput {
                bus: 0,
                fault_type: FaultType::SinglePhaseToGround,
                fault_phase: FaultPhase::A,
                admittance: None,
            },
        ];
        let err = solve::<Sym, 1>(model, &ybus, &param, &faults, &logger).unwrap_err();
        assert!(matches!(err, GridError::InvalidShortCircuitPhaseOrType));
    }
}
