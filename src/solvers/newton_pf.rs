//! Newton-Raphson power flow solver (spec §4.7.3): the slack bus is held
//! fixed at its reference voltage and excluded from the unknown vector (the
//! textbook convention the spec's "two-bus internal subsystem" phrasing
//! describes); every other active source contributes its Thevenin current
//! `Y_src . U_ref` to its bus's specified injection instead, since the
//! Y-bus diagonal already carries `Y_src` from assembly (spec §4.3 stamp
//! step) — this crate's resolution of the spec's source-modeling detail,
//! recorded in DESIGN.md.

use crate::error::GridResult;
use crate::logger::{EventCode, Logger};
use crate::sparse_lu::{Block, BlockCsr, BlockLu, BlockVector};
use crate::topology::MathTopology;
use crate::types::{ConjMul, NewtonEmbeddable, Symmetry};
use crate::ybus::YBus;
use crate::ybus::param::MathParam;

use super::SolverOutput;

pub struct Config {
    pub err_tol: f64,
    pub max_iter: usize,
}

/// One bus's net specified power injection (load/gen setpoints already
/// combined into one `S::Value`, sign convention "injection", i.e. a load's
/// contribution is already negated).
pub fn solve<S, const N: usize>(
    topo: &MathTopology,
    ybus: &YBus<S>,
    param: &MathParam<S>,
    load_gen_injection: &[S::Value],
    slack_voltage: S::Value,
    config: &Config,
    logger: &Logger,
) -> GridResult<SolverOutput<S>>
where
    S: NewtonEmbeddable<N>,
    S::Value: ConjMul + std::ops::Add<Output = S::Value> + std::ops::Sub<Output = S::Value>,
    S::Admittance: std::ops::Mul<S::Value, Output = S::Value>,
{
    let _scope = logger.scope(EventCode::MathCalculation);
    let n_bus = topo.n_bus;
    let slack = topo.slack_bus;

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

    let mut load_gen_spec = vec![S::zero_value(); n_bus];
    for (bus, &s) in load_gen_injection.iter().enumerate().take(n_bus) {
        load_gen_spec[bus] = load_gen_spec[bus] + s;
    }

    let mut voltage = vec![slack_voltage; n_bus];
    for v in voltage.iter_mut() {
        *v = slack_voltage;
    }
    voltage[slack] = slack_voltage;

    let mut max_deviation = f64::INFINITY;
    let mut iterations = 0usize;

    while iterations < config.max_iter && max_deviation > config.err_tol {
        let injection = ybus.calculate_injection(&voltage);
        let s_calc: Vec<S::Value> = voltage
            .iter()
            .zip(&injection)
            .map(|(&u, &i)| u.conj_mul(i))
            .collect();

        let mut s_spec = load_gen_spec.clone();
        for (bus, range) in topo.sources_per_bus.iter() {
            for pos in range {
                let y_src = param.source_admittance[pos];
                let u_ref = param.source_u_ref[pos];
                let i_src = y_src * u_ref;
                s_spec[bus] = s_spec[bus] + voltage[bus].conj_mul(i_src);
            }
        }

        let mismatch: Vec<[(f64, f64); 3]> = (0..n_bus)
            .map(|bus| {
                let spec = S::power_to_pq(s_spec[bus]);
                let calc = S::power_to_pq(s_calc[bus]);
                let mut out = [(0.0, 0.0); 3];
                for p in 0..3 {
                    out[p] = (spec[p].0 - calc[p].0, spec[p].1 - calc[p].1);
                }
                out
            })
            .collect();

        let mut jac = BlockCsr::<N>::with_pattern(n_bus, &edges, &topo.fill_in);
        let polar: Vec<[(f64, f64); 3]> =
            voltage.iter().map(|&u| S::voltage_to_polar(u)).collect();

        for bus in 0..n_bus {
            for &col in ybus.structure.row(bus) {
                if col == bus {
                    continue;
                }
                let idx = ybus.structure.index_of(bus, col).expect("symmetric pattern");
                let gb = S::admittance_gb(ybus.values[idx]);
                let mut terms = [(0.0, 0.0, 0.0, 0.0); 3];
                for p in 0..3 {
                    let (g, b) = gb[p];
                    let (theta_i, v_i) = polar[bus][p];
                    let (theta_j, v_j) = polar[col][p];
                    let theta_ij = theta_i - theta_j;
                    let (s_ij, c_ij) = theta_ij.sin_cos();
                    let h = g * s_ij * v_i * v_j - b * c_ij * v_i * v_j;
                    let n = g * c_ij * v_i * v_j + b * s_ij * v_i * v_j;
                    terms[p] = (h, n, -n, h);
                }
                jac.add_at(bus, col, S::jacobian_block(terms))?;
            }

            let gb_ii = S::admittance_gb(ybus.values[ybus.structure.diag_index(bus)]);
            let pq = S::power_to_pq(s_calc[bus]);
            let mut terms = [(0.0, 0.0, 0.0, 0.0); 3];
            for p in 0..3 {
                let (g, b) = gb_ii[p];
                let (_, v_i) = polar[bus][p];
                let (p_cal, q_cal) = pq[p];
                let h = -q_cal - b * v_i * v_i;
                let n = p_cal + g * v_i * v_i;
                let m = p_cal - g * v_i * v_i;
                let l = q_cal - b * v_i * v_i;
                terms[p] = (h, n, m, l);
            }
            jac.add_at(bus, bus, S::jacobian_block(terms))?;
        }

        // Slack bus: fixed, not part of the unknown vector.
        for &col in ybus.structure.row(slack) {
            if col != slack {
                *jac.block_mut(slack, col) = Block::<N>::zeros();
            }
        }
        *jac.diag_mut(slack) = Block::<N>::identity();

        let mut rhs: Vec<BlockVector<N>> = mismatch.iter().map(|&pq| S::mismatch_block(pq)).collect();
        rhs[slack] = BlockVector::<N>::zeros();

        let lu = BlockLu::factorize(jac, true)?;
        let delta = lu.solve(&rhs);

        let mut new_voltage = voltage.clone();
        for bus in 0..n_bus {
            if bus == slack {
                continue;
            }
            let steps = S::unpack_delta(delta[bus]);
            let mut new_polar = polar[bus];
            for p in 0..3 {
                let (dtheta, dv_over_v) = steps[p];
                let (theta, v) = new_polar[p];
                new_polar[p] = (theta + dtheta, v + v * dv_over_v);
            }
            new_voltage[bus] = S::polar_to_voltage(new_polar);
        }

        max_deviation = voltage
            .iter()
            .zip(&new_voltage)
            .map(|(&old, &new)| voltage_deviation::<S>(old, new))
            .fold(0.0, f64::max);
        voltage = new_voltage;
        iterations += 1;
        logger.log_f64(EventCode::IterateUnknown, max_deviation);
    }

    if max_deviation > config.err_tol {
        return Err(crate::error::GridError::IterationDiverge {
            iterations,
            last_deviation: max_deviation,
            tolerance: config.err_tol,
        });
    }

    let branch = ybus.branch_flow(topo, param, &voltage);
    let shunt = ybus.calculate_shunt_flow(topo, param, &voltage);
    let source = ybus.calculate_source_flow(topo, param, &voltage);
    Ok(SolverOutput {
        bus_voltage: voltage,
        iterations,
        max_deviation,
        branch,
        source,
        shunt,
        // Per-appliance load/gen data never reaches this solver — only the
        // per-bus aggregate `load_gen_injection` does — so it has nothing
        // to disaggregate into individual appliance outputs.
        load_gen: Vec::new(),
    })
}

/// `|old - new|` as a single real number, regardless of symmetry (spec
/// §4.7.3 "record `max |ΔU|`"): reuses [`NewtonEmbeddable::power_to_pq`]
/// purely as a real/imaginary-pair splitter, not as an actual power
/// conversion.
fn voltage_deviation<S, const N: usize>(old: S::Value, new: S::Value) -> f64
where
    S: NewtonEmbeddable<N>,
{
    let old_parts = S::power_to_pq(old);
    let new_parts = S::power_to_pq(new);
    old_parts
        .iter()
        .zip(new_parts.iter())
        .map(|(&(ar, ai), &(br, bi))| ((ar - br).powi(2) + (ai - bi).powi(2)).sqrt())
        .fold(0.0, f64::max)
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
        let config = Config {
            err_tol: 1e-9,
            max_iter: 20,
        };
        let out = solve::<Sym, 2>(
            model,
            &ybus,
            &param,
            &[Complex64::new(0.0, 0.0)],
            Complex64::new(1.0, 0.0),
            &config,
            &logger,
        )
        .unwrap();
        assert!((out.bus_voltage[0] - Complex64::new(1.0, 0.0)).norm() < 1e-6);
    }

    #[test]
    fn radial_constant_power_load_converges_and_drops_voltage() {
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
        let mut load_gen_injection = vec![Complex64::new(0.0, 0.0); model.n_bus];
        // Consuming load: injection is the negative of its rated power.
        load_gen_injection[load_bus] = -Complex64::new(0.05, 0.02);
        let logger = Logger::new();
        let config = Config {
            err_tol: 1e-9,
            max_iter: 30,
        };
        let out = solve::<Sym, 2>(
            model,
            &ybus,
            &param,
            &load_gen_injection,
            Complex64::new(1.0, 0.0),
            &config,
            &logger,
        )
        .unwrap();
        assert!(out.max_deviation <= config.err_tol);
        assert!(out.bus_voltage[load_bus].norm() < out.bus_voltage[model.slack_bus].norm());
    }
}
