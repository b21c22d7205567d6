//! Linear power flow solver (spec §4.7.1): one direct sparse solve, no
//! iteration, assuming loads behave as constant impedance at the solver's
//! flat-start voltage estimate.
//!
//! Written once, generic over the symmetry tag `S` and its
//! [`BlockEmbeddable`] block size `N` (spec §9 "Avoid duplicating solver
//! bodies across symmetric and asymmetric modes"); `N = 1` for
//! [`crate::types::Sym`], `N = 3` for [`crate::types::Asym`], matching the
//! Y-bus admittance shape directly since this solver's system matrix *is*
//! the Y-bus.

use crate::error::GridResult;
use crate::logger::{EventCode, Logger};
use crate::sparse_lu::{BlockCsr, BlockLu};
use crate::topology::MathTopology;
use crate::types::{BlockEmbeddable, Symmetry};
use crate::ybus::YBus;
use crate::ybus::param::MathParam;

use super::SolverOutput;

/// Builds the Dirichlet-slack system matrix this solver factorizes: the
/// Y-bus values directly, with the slack bus's row replaced by an identity
/// row (spec §4.7.1: "the slack bus is held at its reference voltage
/// exactly"). Exposed separately from [`solve`] so a caller that keeps
/// calling this solver on the same math model (e.g. [`super::dispatcher`])
/// can reuse the factorization across calls as long as `ybus` hasn't
/// changed (spec §4.4 "Prefactorization reuse", §4.7.7).
pub fn build_system<S, const N: usize>(topo: &MathTopology, ybus: &YBus<S>) -> GridResult<BlockCsr<N>>
where
    S: BlockEmbeddable<N>,
{
    let edges: Vec<(usize, usize)> = (0..topo.n_bus)
        .flat_map(|row| {
            ybus.structure
                .row(row)
                .iter()
                .copied()
                .filter(move |&col| col != row)
                .map(move |col| (row, col))
        })
        .collect();
    let mut system = BlockCsr::<N>::with_pattern(topo.n_bus, &edges, &topo.fill_in);

    for bus in 0..topo.n_bus {
        for &col in ybus.structure.row(bus) {
            let idx = ybus.structure.index_of(bus, col).expect("symmetric pattern");
            let block = S::admittance_to_block(ybus.values[idx]);
            system.add_at(bus, col, block)?;
        }
    }

    let slack = topo.slack_bus;
    for &col in ybus.structure.row(slack) {
        if col != slack {
            *system.block_mut(slack, col) = crate::sparse_lu::block::zero_block::<N>();
        }
    }
    *system.diag_mut(slack) = crate::sparse_lu::Block::<N>::identity();

    Ok(system)
}

/// Solves `Y . U = I` once, with the slack bus's row replaced by the
/// Dirichlet condition `U[slack] = slack_voltage` (spec §4.7.1: "the slack
/// bus is held at its reference voltage exactly").
pub fn solve<S, const N: usize>(
    topo: &MathTopology,
    ybus: &YBus<S>,
    param: &MathParam<S>,
    slack_voltage: S::Value,
    logger: &Logger,
) -> GridResult<SolverOutput<S>>
where
    S: BlockEmbeddable<N>,
    S::Admittance: std::ops::Mul<S::Value, Output = S::Value>,
    S::Value: std::ops::Sub<Output = S::Value>,
{
    let _scope = logger.scope(EventCode::MathCalculation);
    let system = build_system(topo, ybus)?;
    let lu = BlockLu::factorize(system, false)?;
    solve_with_lu(topo, ybus, param, &lu, slack_voltage)
}

/// Same as [`solve`], but against an already-factorized system (spec §4.4
/// "Prefactorization reuse"); the caller is responsible for having built it
/// from this same `ybus` via [`build_system`].
pub fn solve_with_lu<S, const N: usize>(
    topo: &MathTopology,
    ybus: &YBus<S>,
    param: &MathParam<S>,
    lu: &BlockLu<N>,
    slack_voltage: S::Value,
) -> GridResult<SolverOutput<S>>
where
    S: BlockEmbeddable<N>,
    S::Admittance: std::ops::Mul<S::Value, Output = S::Value>,
    S::Value: std::ops::Sub<Output = S::Value>,
{
    let mut rhs = vec![S::value_to_block(S::zero_value()); topo.n_bus];
    for (bus, range) in topo.sources_per_bus.iter() {
        for pos in range {
            let y = S::admittance_to_block(param.source_admittance[pos]);
            let u_ref = S::value_to_block(param.source_u_ref[pos]);
            rhs[bus] += y * u_ref;
        }
    }
    let slack = topo.slack_bus;
    rhs[slack] = S::value_to_block(slack_voltage);

    let solved = lu.solve(&rhs);
    let bus_voltage: Vec<S::Value> = solved.into_iter().map(S::block_to_value).collect();

    let branch = ybus.branch_flow(topo, param, &bus_voltage);
    let shunt = ybus.calculate_shunt_flow(topo, param, &bus_voltage);
    let source = ybus.calculate_source_flow(topo, param, &bus_voltage);
    Ok(SolverOutput {
        bus_voltage,
        iterations: 1,
        max_deviation: 0.0,
        branch,
        source,
        shunt,
        load_gen: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{ComponentConnection, ComponentTopology, build_topology};
    use crate::types::Sym;
    use crate::ybus::param::BranchAdmittance;
    use num_complex::Complex64;

    #[test]
    fn single_bus_with_source_solves_to_its_reference_voltage() {
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
        let out = solve::<Sym, 1>(model, &ybus, &param, Complex64::new(1.0, 0.0), &logger).unwrap();
        assert!((out.bus_voltage[0] - Complex64::new(1.0, 0.0)).norm() < 1e-9);
    }

    #[test]
    fn radial_branch_voltage_drops_toward_the_load_end() {
        let mut topo = ComponentTopology {
            n_node: 2,
            source_node: vec![0],
            shunt_node: vec![1],
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
        let shunt_bus = coupling.node[1].pos as usize;

        let y_line = Complex64::new(1.0, -10.0);
        let param = MathParam::<Sym> {
            branch: vec![BranchAdmittance {
                y_ff: y_line,
                y_ft: -y_line,
                y_tf: -y_line,
                y_tt: y_line,
            }],
            shunt: vec![Complex64::new(0.1, -1.0)],
            source_admittance: vec![Complex64::new(1000.0, 0.0)],
            source_u_ref: vec![Complex64::new(1.0, 0.0)],
        };
        let ybus = YBus::<Sym>::assemble(model, &param);
        let logger = Logger::new();
        let out = solve::<Sym, 1>(model, &ybus, &param, Complex64::new(1.0, 0.0), &logger).unwrap();
        assert!(out.bus_voltage[shunt_bus].norm() < out.bus_voltage[model.slack_bus].norm());
    }
}
