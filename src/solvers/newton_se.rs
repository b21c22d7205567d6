//! Newton-Raphson state estimation solver (spec §4.7.5): Gauss-Newton WLS
//! on the polar `(θ, V)` state, reusing the exact same per-edge H/N/M/L
//! Jacobian terms as [`super::newton_pf`], but weighted by each
//! measurement's variance instead of treating every bus injection as an
//! exact equality constraint.
//!
//! Lagrange multipliers (spec §4.7.5: "unknowns are `(θ, V, φ_P, φ_Q)`"):
//! this crate does not carry the multipliers as separate unknowns. The
//! spec's own description of the degenerate case — "hard zero-injection
//! constraints ... letting the gain's `R` block pick up a `-1` identity" —
//! is exactly the standard WLS realization of an equality constraint as a
//! zero-variance (i.e. effectively infinite weight) pseudo-measurement; this
//! solver applies that same realization uniformly, assigning an unmeasured
//! bus's injection residual a fixed large weight instead of eliminating a
//! separate multiplier block. Eliminating the multipliers this way keeps the
//! gain matrix on the same `N = 2`/`N = 6` state-only block size
//! [`super::newton_pf`] already uses, instead of widening every block row to
//! carry the multipliers as additional unknowns; recorded in DESIGN.md.
//!
//! Gain-matrix sparsity: identical own-row-only restriction as
//! [`super::iterative_linear_se`] (skips neighbor-to-neighbor cross terms
//! to stay within the Y-bus's sparsity pattern).
//!
//! Angle reference: the slack bus's angle is pinned with the same
//! high-weight pseudo-measurement device as
//! [`super::iterative_linear_se`]'s slack-angle gauge fix, applied only when
//! no voltage-phasor measurement already supplies one. Its magnitude is
//! never pinned — unlike the power-flow slack, a state estimator's slack
//! bus is still a quantity to be estimated from whatever measurements cover
//! it.

use crate::error::GridResult;
use crate::logger::{EventCode, Logger};
use crate::sparse_lu::{Block, BlockCsr, BlockLu, BlockVector};
use crate::topology::MathTopology;
use crate::types::{ConjMul, NewtonEmbeddable, RectangularEmbeddable, Symmetry};
use crate::ybus::YBus;
use crate::ybus::param::MathParam;

use super::iterative_linear_se::SeMeasurements;
use super::SolverOutput;

pub struct Config {
    pub err_tol: f64,
    pub max_iter: usize,
}

/// Weight applied to a bus's injection residual when no injection
/// measurement covers it (spec §4.7.5 "hard zero-injection constraints").
const UNMEASURED_INJECTION_WEIGHT: f64 = 1.0e8;

/// Weight pinning the slack bus's angle when no voltage-phasor measurement
/// supplies an absolute angle reference, mirroring
/// [`super::iterative_linear_se`]'s `SLACK_ANGLE_WEIGHT` gauge fix.
const SLACK_ANGLE_WEIGHT: f64 = 1.0e8;

pub fn solve<S, const N: usize>(
    topo: &MathTopology,
    ybus: &YBus<S>,
    param: &MathParam<S>,
    measurements: &SeMeasurements<S>,
    initial_voltage: S::Value,
    config: &Config,
    logger: &Logger,
) -> GridResult<SolverOutput<S>>
where
    S: NewtonEmbeddable<N> + RectangularEmbeddable<N>,
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

    let mut voltage = vec![initial_voltage; n_bus];
    let mut max_deviation = f64::INFINITY;
    let mut iterations = 0usize;

    while iterations < config.max_iter && max_deviation > config.err_tol {
        let injection = ybus.calculate_injection(&voltage);
        let s_calc: Vec<S::Value> = voltage
            .iter()
            .zip(&injection)
            .map(|(&u, &i)| u.conj_mul(i))
            .collect();
        let polar: Vec<[(f64, f64); 3]> = voltage.iter().map(|&u| S::voltage_to_polar(u)).collect();

        let mut gain = BlockCsr::<N>::with_pattern(n_bus, &edges, &topo.fill_in);
        let mut rhs = vec![BlockVector::<N>::zeros(); n_bus];

        for bus in 0..n_bus {
            let (weight, s_meas) = match &measurements.injection[bus] {
                Some(mv) => (1.0 / mv.variance, mv.value),
                None => (UNMEASURED_INJECTION_WEIGHT, S::zero_value()),
            };

            let calc_pq = S::power_to_pq(s_calc[bus]);
            let meas_pq = S::power_to_pq(s_meas);
            let mut residual = [(0.0, 0.0); 3];
            for p in 0..3 {
                residual[p] = ((meas_pq[p].0 - calc_pq[p].0) * weight, (meas_pq[p].1 - calc_pq[p].1) * weight);
            }
            let residual_block = S::mismatch_block(residual);

            let h_ii = injection_jacobian_block::<S, N>(ybus, &polar, s_calc[bus], bus, bus);
            let h_ii_t = h_ii.transpose();
            let w = num_complex::Complex64::new(weight, 0.0);
            *gain.diag_mut(bus) += (h_ii_t * h_ii) * w;
            rhs[bus] += h_ii_t * residual_block;

            for &j in ybus.structure.row(bus) {
                if j == bus {
                    continue;
                }
                let h_ij = injection_jacobian_block::<S, N>(ybus, &polar, s_calc[bus], bus, j);
                *gain.block_mut(bus, j) += (h_ii_t * h_ij) * w;
                let h_ij_t = h_ij.transpose();
                *gain.block_mut(j, bus) += (h_ij_t * h_ii) * w;
                rhs[j] += h_ij_t * residual_block;
            }
        }

        for (k, (from_end, to_end)) in measurements.branch_power.iter().enumerate() {
            let (from, to) = topo.branch_bus_idx[k];
            if from < 0 || to < 0 {
                continue;
            }
            let f = from as usize;
            let t = to as usize;
            let y = &param.branch[k];
            let i_f = y.y_ff * voltage[f] + y.y_ft * voltage[t];
            let i_t = y.y_tf * voltage[f] + y.y_tt * voltage[t];
            let s_f = voltage[f].conj_mul(i_f);
            let s_t = voltage[t].conj_mul(i_t);

            if let Some(mv) = from_end {
                let weight = 1.0 / mv.variance;
                let w = num_complex::Complex64::new(weight, 0.0);
                let calc_pq = S::power_to_pq(s_f);
                let meas_pq = S::power_to_pq(mv.value);
                let mut residual = [(0.0, 0.0); 3];
                for p in 0..3 {
                    residual[p] = ((meas_pq[p].0 - calc_pq[p].0) * weight, (meas_pq[p].1 - calc_pq[p].1) * weight);
                }
                let residual_block = S::mismatch_block(residual);
                // This branch's own `y_ff`/`y_ft`, not the Y-bus row at `f`
                // (which sums every branch/shunt/source touching `f`).
                let h_f = diag_term_block::<S, N>(S::admittance_gb(y.y_ff), S::power_to_pq(s_f), polar[f]);
                let h_t = offdiag_term_block::<S, N>(S::admittance_gb(y.y_ft), polar[f], polar[t]);
                let h_f_t = h_f.transpose();
                let h_t_t = h_t.transpose();
                *gain.diag_mut(f) += (h_f_t * h_f) * w;
                *gain.block_mut(f, t) += (h_f_t * h_t) * w;
                *gain.block_mut(t, f) += (h_t_t * h_f) * w;
                *gain.diag_mut(t) += (h_t_t * h_t) * w;
                rhs[f] += h_f_t * residual_block;
                rhs[t] += h_t_t * residual_block;
            }
            if let Some(mv) = to_end {
                let weight = 1.0 / mv.variance;
                let w = num_complex::Complex64::new(weight, 0.0);
                let calc_pq = S::power_to_pq(s_t);
                let meas_pq = S::power_to_pq(mv.value);
                let mut residual = [(0.0, 0.0); 3];
                for p in 0..3 {
                    residual[p] = ((meas_pq[p].0 - calc_pq[p].0) * weight, (meas_pq[p].1 - calc_pq[p].1) * weight);
                }
                let residual_block = S::mismatch_block(residual);
                let h_t = diag_term_block::<S, N>(S::admittance_gb(y.y_tt), S::power_to_pq(s_t), polar[t]);
                let h_f = offdiag_term_block::<S, N>(S::admittance_gb(y.y_tf), polar[t], polar[f]);
                let h_t_t = h_t.transpose();
                let h_f_t = h_f.transpose();
                *gain.diag_mut(t) += (h_t_t * h_t) * w;
                *gain.block_mut(t, f) += (h_t_t * h_f) * w;
                *gain.block_mut(f, t) += (h_f_t * h_t) * w;
                *gain.diag_mut(f) += (h_f_t * h_f) * w;
                rhs[t] += h_t_t * residual_block;
                rhs[f] += h_f_t * residual_block;
            }
        }

        for (bus, slot) in measurements.voltage.iter().enumerate() {
            if let Some(mv) = slot {
                let weight = 1.0 / mv.variance;
                // A magnitude-only sensor (`NaN` phase component, spec §4.5
                // step 1) constrains only `V`, leaving the angle residual
                // and its gain contribution at zero for that phase — unlike
                // `iterative_linear_se`'s rectangular form, this solver's
                // own polar state already separates magnitude from phase, so
                // there's no NaN to launder through a linearized target.
                let rect = S::voltage_to_rect(mv.value);
                let mut identity_terms = [(0.0, 0.0, 0.0, 0.0); 3];
                let mut delta = [(0.0, 0.0); 3];
                for p in 0..3 {
                    let (a, b) = rect[p];
                    let (theta_c, v_c) = polar[bus][p];
                    if b.is_nan() {
                        identity_terms[p] = (0.0, 0.0, 0.0, weight);
                        delta[p] = (0.0, (a - v_c) / v_c.max(1e-9) * weight);
                    } else {
                        let v_m = (a * a + b * b).sqrt();
                        let theta_m = b.atan2(a);
                        identity_terms[p] = (weight, 0.0, 0.0, weight);
                        delta[p] = ((theta_m - theta_c) * weight, (v_m - v_c) / v_c.max(1e-9) * weight);
                    }
                }
                *gain.diag_mut(bus) += S::jacobian_block(identity_terms);
                rhs[bus] += S::mismatch_block(delta);
            }
        }

        // Angle reference (spec §4.7.5 gauge fix): like
        // `iterative_linear_se`, only pin the slack bus's angle when no
        // voltage-phasor measurement already supplies one; its magnitude
        // stays a free unknown, estimated from measurements like any other
        // bus's state.
        if !measurements.has_phasor {
            let pin = S::jacobian_block([(SLACK_ANGLE_WEIGHT, 0.0, 0.0, 0.0); 3]);
            *gain.diag_mut(slack) += pin;
        }

        let lu = BlockLu::factorize(gain, true)?;
        let delta = lu.solve(&rhs);

        let mut new_voltage = voltage.clone();
        for bus in 0..n_bus {
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
            .map(|(&old, &new)| voltage_deviation::<S, N>(old, new))
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
        // The estimator only ever sees aggregate bus measurements, never
        // individual appliance setpoints, so there is nothing to disaggregate.
        load_gen: Vec::new(),
    })
}

/// The `[H N; M L]` block for bus `i`'s injection equation with respect to
/// column `j`, identical to [`super::newton_pf`]'s per-edge/diagonal
/// formulas.
fn injection_jacobian_block<S, const N: usize>(
    ybus: &YBus<S>,
    polar: &[[(f64, f64); 3]],
    s_calc_i: S::Value,
    i: usize,
    j: usize,
) -> Block<N>
where
    S: NewtonEmbeddable<N>,
{
    if i == j {
        let gb_ii = S::admittance_gb(ybus.values[ybus.structure.diag_index(i)]);
        diag_term_block::<S, N>(gb_ii, S::power_to_pq(s_calc_i), polar[i])
    } else {
        let idx = ybus
            .structure
            .index_of(i, j)
            .expect("row/col must be adjacent in the Y-bus pattern");
        let gb = S::admittance_gb(ybus.values[idx]);
        offdiag_term_block::<S, N>(gb, polar[i], polar[j])
    }
}

/// The diagonal `[H N; M L]` term for one bus's own injection with respect
/// to its own state, parametrized directly by admittance so it can be reused
/// for both a bus's full Y-bus row and a single branch's own self-admittance.
fn diag_term_block<S, const N: usize>(gb: [(f64, f64); 3], pq: [(f64, f64); 3], v: [(f64, f64); 3]) -> Block<N>
where
    S: NewtonEmbeddable<N>,
{
    let mut terms = [(0.0, 0.0, 0.0, 0.0); 3];
    for p in 0..3 {
        let (g, b) = gb[p];
        let (_, v_i) = v[p];
        let (p_cal, q_cal) = pq[p];
        let h = -q_cal - b * v_i * v_i;
        let n = p_cal + g * v_i * v_i;
        let m = p_cal - g * v_i * v_i;
        let l = q_cal - b * v_i * v_i;
        terms[p] = (h, n, m, l);
    }
    S::jacobian_block(terms)
}

/// The cross `[H N; -N H]` term for one quantity's dependence on a
/// different bus's state, parametrized directly by admittance.
fn offdiag_term_block<S, const N: usize>(gb: [(f64, f64); 3], polar_i: [(f64, f64); 3], polar_j: [(f64, f64); 3]) -> Block<N>
where
    S: NewtonEmbeddable<N>,
{
    let mut terms = [(0.0, 0.0, 0.0, 0.0); 3];
    for p in 0..3 {
        let (g, b) = gb[p];
        let (theta_i, v_i) = polar_i[p];
        let (theta_j, v_j) = polar_j[p];
        let theta_ij = theta_i - theta_j;
        let (s_ij, c_ij) = theta_ij.sin_cos();
        let h = g * s_ij * v_i * v_j - b * c_ij * v_i * v_j;
        let n = g * c_ij * v_i * v_j + b * s_ij * v_i * v_j;
        terms[p] = (h, n, -n, h);
    }
    S::jacobian_block(terms)
}

/// `|old - new|` as a single real number (spec §4.7.3's convergence check,
/// reused verbatim for Newton-SE).
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
    use crate::component_model::MeasuredValue;
    use num_complex::Complex64;

    #[test]
    fn single_bus_with_phasor_measurement_recovers_its_voltage() {
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
        let measurements = SeMeasurements::<Sym> {
            voltage: vec![Some(MeasuredValue {
                value: Complex64::new(1.0, 0.0),
                variance: 1e-6,
            })],
            injection: vec![None],
            branch_power: vec![],
            has_phasor: true,
        };
        let logger = Logger::new();
        let config = Config {
            err_tol: 1e-9,
            max_iter: 20,
        };
        let out = solve::<Sym, 2>(
            model,
            &ybus,
            &param,
            &measurements,
            Complex64::new(1.0, 0.0),
            &config,
            &logger,
        )
        .unwrap();
        assert!((out.bus_voltage[0] - Complex64::new(1.0, 0.0)).norm() < 1e-6);
    }

    #[test]
    fn radial_injection_measurement_drops_voltage_toward_the_load() {
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
        let slack_bus = model.slack_bus;

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

        let mut voltage = vec![None; model.n_bus];
        voltage[slack_bus] = Some(MeasuredValue {
            value: Complex64::new(1.0, 0.0),
            variance: 1e-6,
        });
        let mut injection = vec![None; model.n_bus];
        injection[load_bus] = Some(MeasuredValue {
            value: -Complex64::new(0.05, 0.02),
            variance: 1e-4,
        });
        let measurements = SeMeasurements::<Sym> {
            voltage,
            injection,
            branch_power: vec![],
            has_phasor: true,
        };
        let logger = Logger::new();
        let config = Config {
            err_tol: 1e-6,
            max_iter: 30,
        };
        let out = solve::<Sym, 2>(
            model,
            &ybus,
            &param,
            &measurements,
            Complex64::new(1.0, 0.0),
            &config,
            &logger,
        )
        .unwrap();
        assert!(out.bus_voltage[load_bus].norm() < out.bus_voltage[slack_bus].norm());
    }

    #[test]
    fn branch_terminal_power_measurement_estimates_load_bus_voltage() {
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
        let slack_bus = model.slack_bus;

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

        let mut voltage = vec![None; model.n_bus];
        voltage[slack_bus] = Some(MeasuredValue {
            value: Complex64::new(1.0, 0.0),
            variance: 1e-6,
        });
        let mut branch_power = vec![(None, None); 1];
        // Tighter than `UNMEASURED_INJECTION_WEIGHT`'s implicit hard
        // zero-injection pull at the load bus, so the branch flow
        // measurement's own pull toward nonzero current dominates.
        branch_power[0].0 = Some(MeasuredValue {
            value: Complex64::new(0.05, 0.02),
            variance: 1e-10,
        });
        let measurements = SeMeasurements::<Sym> {
            voltage,
            injection: vec![None; model.n_bus],
            branch_power,
            has_phasor: true,
        };
        let logger = Logger::new();
        let config = Config {
            err_tol: 1e-6,
            max_iter: 30,
        };
        let out = solve::<Sym, 2>(
            model,
            &ybus,
            &param,
            &measurements,
            Complex64::new(1.0, 0.0),
            &config,
            &logger,
        )
        .unwrap();
        assert!(out.bus_voltage[load_bus].norm() < out.bus_voltage[slack_bus].norm());
    }

    #[test]
    fn magnitude_only_voltage_sensor_pins_v_and_leaves_angle_free() {
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
        let measurements = SeMeasurements::<Sym> {
            voltage: vec![Some(MeasuredValue {
                value: Complex64::new(0.95, f64::NAN),
                variance: 1e-6,
            })],
            injection: vec![None],
            branch_power: vec![],
            has_phasor: false,
        };
        let logger = Logger::new();
        let config = Config {
            err_tol: 1e-9,
            max_iter: 20,
        };
        let out = solve::<Sym, 2>(
            model,
            &ybus,
            &param,
            &measurements,
            Complex64::new(1.0, 0.0),
            &config,
            &logger,
        )
        .unwrap();
        assert!((out.bus_voltage[0].norm() - 0.95).abs() < 1e-6);
    }
}
