//! Iterative current-injection power flow solver (spec §4.7.2): factorizes
//! the Y-bus once, then repeatedly updates the constant-power load/gen
//! current injections from the latest voltage estimate and re-solves the
//! same factorization until the voltage update falls under tolerance (spec
//! §4.4 "Prefactorization reuse").

use crate::component_model::LoadGenType;
use crate::error::{GridError, GridResult};
use crate::logger::{EventCode, Logger};
use crate::sparse_lu::{BlockCsr, BlockLu};
use crate::topology::MathTopology;
use crate::types::{BlockEmbeddable, ConjMul, Symmetry};
use crate::ybus::YBus;
use crate::ybus::param::MathParam;

use super::SolverOutput;

/// One load/gen appliance's rated behavior, resolved by the caller from its
/// concrete [`crate::component_model::LoadGenModel`] (spec §6.1).
///
/// `s_rated` is a rated complex power for [`LoadGenType::ConstPower`], but a
/// rated complex current directly for [`LoadGenType::ConstCurrent`] — one
/// field, interpreted per `load_gen_type`, mirroring how
/// [`crate::component_model::LoadGenModel`] itself exposes a single
/// `s_rated` accessor regardless of type.
#[derive(Debug, Clone, Copy)]
pub struct LoadGenInput<S: Symmetry> {
    pub load_gen_type: LoadGenType,
    pub s_rated: S::Value,
}

pub struct Config {
    pub err_tol: f64,
    pub max_iter: usize,
}

/// Builds the Dirichlet-slack system matrix this solver factorizes once and
/// reuses across its fixed-point iterations (spec §4.4 "Prefactorization
/// reuse"). Exposed separately from [`solve`] so a caller that keeps
/// calling this solver on the same math model (e.g. [`super::dispatcher`])
/// can also reuse the factorization *across* calls as long as `ybus`
/// hasn't changed (spec §4.7.7).
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
            system.add_at(bus, col, S::admittance_to_block(ybus.values[idx]))?;
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

/// Runs the fixed-point current-injection iteration to convergence or
/// `max_iter` (spec §4.7.2).
pub fn solve<S, const N: usize>(
    topo: &MathTopology,
    ybus: &YBus<S>,
    param: &MathParam<S>,
    load_gen: &[LoadGenInput<S>],
    slack_voltage: S::Value,
    config: &Config,
    logger: &Logger,
) -> GridResult<SolverOutput<S>>
where
    S: BlockEmbeddable<N>,
    S::Value: std::ops::Sub<Output = S::Value> + LoadCurrent,
    S::Admittance: std::ops::Mul<S::Value, Output = S::Value>,
{
    let _scope = logger.scope(EventCode::MathCalculation);
    let system = build_system(topo, ybus)?;
    let lu = BlockLu::factorize(system, true)?;
    solve_with_lu(topo, ybus, param, load_gen, slack_voltage, &lu, config, logger)
}

/// Same as [`solve`], but against an already-factorized system (spec §4.4
/// "Prefactorization reuse"); the caller is responsible for having built it
/// from this same `ybus` via [`build_system`].
#[allow(clippy::too_many_arguments)]
pub fn solve_with_lu<S, const N: usize>(
    topo: &MathTopology,
    ybus: &YBus<S>,
    param: &MathParam<S>,
    load_gen: &[LoadGenInput<S>],
    slack_voltage: S::Value,
    lu: &BlockLu<N>,
    config: &Config,
    logger: &Logger,
) -> GridResult<SolverOutput<S>>
where
    S: BlockEmbeddable<N>,
    S::Value: std::ops::Sub<Output = S::Value> + LoadCurrent,
    S::Admittance: std::ops::Mul<S::Value, Output = S::Value>,
{
    let slack = topo.slack_bus;
    let mut voltage = vec![slack_voltage; topo.n_bus];
    for v in voltage.iter_mut() {
        *v = slack_voltage;
    }
    voltage[slack] = slack_voltage;

    let mut max_deviation = f64::INFINITY;
    let mut iterations = 0usize;
    while iterations < config.max_iter && max_deviation > config.err_tol {
        let mut rhs = vec![S::value_to_block(S::zero_value()); topo.n_bus];
        for (bus, range) in topo.sources_per_bus.iter() {
            for pos in range {
                let y = S::admittance_to_block(param.source_admittance[pos]);
                let u_ref = S::value_to_block(param.source_u_ref[pos]);
                rhs[bus] += y * u_ref;
            }
        }
        for (bus, range) in topo.load_gens_per_bus.iter() {
            for pos in range {
                let lg = &load_gen[pos];
                // Constant-impedance appliances are folded into the Y-bus
                // shunt by the caller before this solver ever runs.
                let i = match lg.load_gen_type {
                    LoadGenType::ConstImpedance => continue,
                    // Power held constant: re-derive the current from the
                    // latest voltage estimate each iteration.
                    LoadGenType::ConstPower => lg.s_rated.current_for_power(voltage[bus]),
                    // Current held constant: `s_rated` already holds the
                    // rated current directly, independent of bus voltage.
                    LoadGenType::ConstCurrent => lg.s_rated,
                };
                rhs[bus] = rhs[bus] - S::value_to_block(i);
            }
        }
        rhs[slack] = S::value_to_block(slack_voltage);

        let solved = lu.solve(&rhs);
        let new_voltage: Vec<S::Value> = solved.into_iter().map(S::block_to_value).collect();

        max_deviation = voltage
            .iter()
            .zip(&new_voltage)
            .map(|(&old, &new)| (old - new).magnitude())
            .fold(0.0, f64::max);
        voltage = new_voltage;
        iterations += 1;
        logger.log_f64(EventCode::IterateUnknown, max_deviation);
    }

    if max_deviation > config.err_tol {
        return Err(GridError::IterationDiverge {
            iterations,
            last_deviation: max_deviation,
            tolerance: config.err_tol,
        });
    }

    let branch = ybus.branch_flow(topo, param, &voltage);
    let shunt = ybus.calculate_shunt_flow(topo, param, &voltage);
    let source = ybus.calculate_source_flow(topo, param, &voltage);

    let mut load_gen_out = vec![
        crate::component_model::ApplianceOutput {
            i: S::zero_value(),
            s: S::zero_value(),
        };
        load_gen.len()
    ];
    for (bus, range) in topo.load_gens_per_bus.iter() {
        let u = voltage[bus];
        for pos in range {
            let lg = &load_gen[pos];
            // Constant-impedance appliances are folded into the Y-bus
            // shunt, so they have no separate current/power here.
            let i = match lg.load_gen_type {
                LoadGenType::ConstImpedance => continue,
                LoadGenType::ConstPower => lg.s_rated.current_for_power(u),
                LoadGenType::ConstCurrent => lg.s_rated,
            };
            load_gen_out[pos] = crate::component_model::ApplianceOutput {
                i,
                s: u.conj_mul(i),
            };
        }
    }

    Ok(SolverOutput {
        bus_voltage: voltage,
        iterations,
        max_deviation,
        branch,
        source,
        shunt,
        load_gen: load_gen_out,
    })
}

/// Per-symmetry helpers that don't fit on [`ConjMul`] itself: a scalar
/// magnitude for convergence checks (spec §4.7.2 "the largest per-bus
/// voltage update"), and constant-power-to-current conversion, both of
/// which need genuine per-component division rather than [`ConjMul`]'s
/// component-wise multiply.
pub(crate) trait LoadCurrent: ConjMul {
    fn magnitude(self) -> f64;
    fn current_for_power(self, u: Self) -> Self;
}

impl LoadCurrent for num_complex::Complex64 {
    fn magnitude(self) -> f64 {
        num_complex::Complex64::norm(self)
    }
    fn current_for_power(self, u: Self) -> Self {
        (self / u).conj()
    }
}

impl LoadCurrent for crate::types::Phase3 {
    fn magnitude(self) -> f64 {
        (self[0].norm_sqr() + self[1].norm_sqr() + self[2].norm_sqr()).sqrt()
    }
    fn current_for_power(self, u: Self) -> Self {
        crate::types::Phase3::new(
            (self[0] / u[0]).conj(),
            (self[1] / u[1]).conj(),
            (self[2] / u[2]).conj(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{ComponentConnection, ComponentTopology, build_topology};
    use crate::types::Sym;
    use crate::ybus::param::BranchAdmittance;
    use num_complex::Complex64;

    #[test]
    fn single_bus_with_source_converges_in_one_iteration() {
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
        let config = Config {
            err_tol: 1e-9,
            max_iter: 20,
        };
        let out = solve::<Sym, 1>(
            model,
            &ybus,
            &param,
            &[],
            Complex64::new(1.0, 0.0),
            &config,
            &logger,
        )
        .unwrap();
        assert!((out.bus_voltage[0] - Complex64::new(1.0, 0.0)).norm() < 1e-9);
        assert_eq!(out.iterations, 1);
    }

    #[test]
    fn radial_constant_power_load_converges_within_tolerance() {
        let mut topo = ComponentTopology {
            n_node: 2,
            source_node: vec![0],
            ..Default::default()
        };
        topo.branch.push([0, 1]);
        topo.load_gen_node.push(1);
        let mut conn = ComponentConnection {
            source_active: vec![true],
            ..Default::default()
        };
        conn.branch_status.push([true, true]);
        conn.branch_phase_shift.push(0.0);
        let (models, coupling) = build_topology(&topo, &conn);
        let model = &models[0];
        let load_bus = coupling.node[1].pos as usize;

        let y_line = Complex64::new(2.0, -20.0);
        let param = MathParam::<Sym> {
            branch: vec![BranchAdmittance {
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
        let load_gen = vec![LoadGenInput::<Sym> {
            load_gen_type: LoadGenType::ConstPower,
            s_rated: Complex64::new(0.05, 0.02),
        }];
        let logger = Logger::new();
        let config = Config {
            err_tol: 1e-9,
            max_iter: 30,
        };
        let out = solve::<Sym, 1>(
            model,
            &ybus,
            &param,
            &load_gen,
            Complex64::new(1.0, 0.0),
            &config,
            &logger,
        )
        .unwrap();
        assert!(out.max_deviation <= config.err_tol);
        assert!(out.bus_voltage[load_bus].norm() < out.bus_voltage[model.slack_bus].norm());
    }
}
