//! Measured-value aggregator (spec §4.5 / §5): combines every sensor
//! attached to the same terminal into one `(value, variance)` pair via
//! inverse-variance weighting, the way a real meter network's redundant
//! sensors are fused before they reach a state estimator.

use crate::component_model::{CurrentAngleKind, MeasuredValue};
use crate::error::{GridError, GridResult};
use crate::topology::{MathTopology, TopoCoupling};
use crate::types::{NewtonEmbeddable, RectangularEmbeddable, Symmetry};

/// Inverse-variance weighted combination of every measurement of the same
/// quantity at the same terminal (spec §4.5 step 2: "combine with weight
/// `1/variance`"). `None` if `values` is empty — the caller (the
/// observability checker, or a solver that tolerates an unmeasured
/// terminal) decides what that means.
pub fn aggregate_group<S, I>(values: I) -> Option<MeasuredValue<S>>
where
    S: Symmetry,
    S::Value: std::ops::Mul<f64, Output = S::Value>,
    I: IntoIterator<Item = MeasuredValue<S>>,
{
    let mut weighted_sum = S::zero_value();
    let mut weight_sum = 0.0f64;
    let mut any = false;
    for m in values {
        any = true;
        let weight = 1.0 / m.variance;
        weighted_sum = weighted_sum + m.value * weight;
        weight_sum += weight;
    }
    if !any || weight_sum <= 0.0 {
        return None;
    }
    Some(MeasuredValue {
        value: weighted_sum * (1.0 / weight_sum),
        variance: 1.0 / weight_sum,
    })
}

/// Sums a group of per-object measurements instead of blending them (spec
/// §4.5 step 2: "bus-level appliance injection = sum of all measurements for
/// appliances attached to the bus"). Unlike [`aggregate_group`], this is for
/// quantities that are genuinely additive across independent appliances, not
/// repeated samples of the same one — so variances add rather than combine
/// by inverse weight. `None` if `values` is empty.
pub fn sum_group<S, I>(values: I) -> Option<MeasuredValue<S>>
where
    S: Symmetry,
    I: IntoIterator<Item = MeasuredValue<S>>,
{
    let mut value_sum = S::zero_value();
    let mut variance_sum = 0.0f64;
    let mut any = false;
    for m in values {
        any = true;
        value_sum = value_sum + m.value;
        variance_sum += m.variance;
    }
    if !any {
        return None;
    }
    Some(MeasuredValue {
        value: value_sum,
        variance: variance_sum,
    })
}

/// Fused voltage measurement plus whether at least one contributing sensor
/// carried a phase reading (spec §4.5 step 1).
pub struct VoltageFusion<S: Symmetry> {
    pub value: MeasuredValue<S>,
    pub has_phasor: bool,
}

/// Fuses every voltage sensor attached to one bus (spec §4.5 step 1): if
/// every sensor carries a phase (no `NaN` imaginary part, the sentinel
/// documented on [`crate::component_model::VoltageSensorModel`]), this is
/// plain inverse-variance blending. If any sensor is magnitude-only, the
/// fused value is magnitude-only too — every contributing sensor's magnitude
/// (phasor sensors included) is inverse-variance blended and the phase is
/// dropped. `None` if `values` is empty.
pub fn fuse_voltage<S, const N: usize>(
    values: impl IntoIterator<Item = MeasuredValue<S>>,
) -> Option<VoltageFusion<S>>
where
    S: RectangularEmbeddable<N>,
    S::Value: std::ops::Mul<f64, Output = S::Value>,
{
    let collected: Vec<MeasuredValue<S>> = values.into_iter().collect();
    if collected.is_empty() {
        return None;
    }
    let any_magnitude_only = collected
        .iter()
        .any(|mv| S::voltage_to_rect(mv.value).iter().any(|&(_, im)| im.is_nan()));

    if !any_magnitude_only {
        let value = aggregate_group(collected.iter().copied())?;
        return Some(VoltageFusion { value, has_phasor: true });
    }

    let mut weighted_mag = [0.0f64; 3];
    let mut weight_sum = 0.0f64;
    for mv in &collected {
        let weight = 1.0 / mv.variance;
        weight_sum += weight;
        let rect = S::voltage_to_rect(mv.value);
        for (p, &(re, im)) in rect.iter().enumerate() {
            let mag = if im.is_nan() { re } else { (re * re + im * im).sqrt() };
            weighted_mag[p] += mag * weight;
        }
    }
    if weight_sum <= 0.0 {
        return None;
    }
    let mut rect = [(0.0f64, f64::NAN); 3];
    for p in 0..3 {
        rect[p] = (weighted_mag[p] / weight_sum, f64::NAN);
    }
    Some(VoltageFusion {
        value: MeasuredValue {
            value: S::rect_to_voltage(rect),
            variance: 1.0 / weight_sum,
        },
        has_phasor: false,
    })
}

/// Replaces a magnitude-only voltage measurement's missing phase with the
/// current SE iteration's own angle at that bus, scaling its magnitude to
/// the measurement (spec §4.5 "Voltage linearization for SE iterations").
/// A phasor measurement (no `NaN` component) passes through unchanged.
pub fn linearize_voltage_measurement<S, const N: usize>(measured: S::Value, current_iterate: S::Value) -> S::Value
where
    S: RectangularEmbeddable<N> + NewtonEmbeddable<N>,
{
    let rect = S::voltage_to_rect(measured);
    let iter_polar = S::voltage_to_polar(current_iterate);
    let mut out = [(0.0f64, 0.0f64); 3];
    for (p, &(a, b)) in rect.iter().enumerate() {
        out[p] = if b.is_nan() {
            let theta = iter_polar[p].0;
            (a * theta.cos(), a * theta.sin())
        } else {
            (a, b)
        };
    }
    S::rect_to_voltage(out)
}

/// A bus's appliance-fusion summary feeding [`fuse_bus_injection`] (spec
/// §4.5 step 2/3).
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplianceSummary<S: Symmetry> {
    /// `Some` unless zero appliances were measured.
    pub aggregate: Option<MeasuredValue<S>>,
    pub total_count: usize,
    pub unmeasured_count: usize,
}

/// Combines a bus's direct injection sensor (if any) with its
/// appliance-injection aggregate per spec §4.5 step 3's three cases, plus
/// the all-disconnected hard-constraint edge case.
pub fn fuse_bus_injection<S>(
    appliances: ApplianceSummary<S>,
    direct_sensor: Option<MeasuredValue<S>>,
) -> Option<MeasuredValue<S>>
where
    S: Symmetry,
    S::Value: std::ops::Mul<f64, Output = S::Value>,
{
    if appliances.total_count == 0 {
        return Some(MeasuredValue {
            value: S::zero_value(),
            variance: 0.0,
        });
    }

    let all_measured = appliances.unmeasured_count == 0;
    match (direct_sensor, all_measured, appliances.aggregate) {
        (None, true, agg) => agg,
        (Some(direct), false, _) => Some(direct),
        (Some(direct), true, Some(agg)) => aggregate_group([direct, agg]),
        (Some(direct), true, None) => Some(direct),
        (None, false, _) => None,
    }
}

/// Redistributes a bus's solved injection among its appliances (spec §4.5
/// "Post-solve appliance disaggregation"). `measured[i]` is `Some` for a
/// measured appliance (its reported power), `None` for an unmeasured one.
/// If any appliance is unmeasured, the residual between the solved
/// injection and the sum of measured appliances is split equally among the
/// unmeasured slots; if every appliance is measured, each is corrected by
/// `S_i <- S_i - var_i * mu`, `mu` the variance-scaled residual.
pub fn disaggregate_bus_injection<S>(measured: &[Option<MeasuredValue<S>>], solved_injection: S::Value) -> Vec<S::Value>
where
    S: Symmetry,
    S::Value: std::ops::Sub<Output = S::Value> + std::ops::Mul<f64, Output = S::Value>,
{
    if measured.is_empty() {
        return Vec::new();
    }
    let measured_sum = measured
        .iter()
        .flatten()
        .fold(S::zero_value(), |acc, mv| acc + mv.value);
    let residual = solved_injection - measured_sum;

    let unmeasured_count = measured.iter().filter(|m| m.is_none()).count();
    if unmeasured_count > 0 {
        let share = residual * (1.0 / unmeasured_count as f64);
        return measured
            .iter()
            .map(|slot| match slot {
                Some(mv) => mv.value,
                None => share,
            })
            .collect();
    }

    let variance_sum: f64 = measured.iter().flatten().map(|mv| mv.variance).sum();
    // `mu` is scaled by `measured_sum - solved_injection` (not `residual`
    // itself) so that `sum(S_i - var_i * mu) == solved_injection`: summing
    // the correction across every appliance must reproduce exactly the
    // solved bus injection, the whole point of this redistribution.
    let discrepancy = measured_sum - solved_injection;
    measured
        .iter()
        .map(|slot| {
            let mv = slot.expect("checked all-measured above");
            if variance_sum <= 0.0 {
                mv.value
            } else {
                let mu = discrepancy * (1.0 / variance_sum);
                mv.value - mu * mv.variance
            }
        })
        .collect()
}

/// Rescales every variance across the given measurement slices so the
/// smallest strictly-positive one becomes exactly `1` (spec §4.5 "Variance
/// normalization"; Testable Property #9). Zero (hard-constraint) variances
/// are left untouched. No-op if no slice carries a strictly positive
/// variance.
pub fn normalize_variances<S: Symmetry>(groups: &mut [&mut [Option<MeasuredValue<S>>]]) {
    let min_positive = groups
        .iter()
        .flat_map(|group| group.iter())
        .flatten()
        .map(|mv| mv.variance)
        .filter(|&v| v > 0.0)
        .fold(f64::INFINITY, f64::min);

    if !min_positive.is_finite() {
        return;
    }

    for group in groups.iter_mut() {
        for slot in group.iter_mut().flatten() {
            if slot.variance > 0.0 {
                slot.variance /= min_positive;
            }
        }
    }
}

/// One global sensor's contribution, as resolved by the caller from its
/// concrete sensor model (spec §6.1 `VoltageSensorModel`/`PowerSensorModel`/
/// `CurrentSensorModel`).
pub enum Contribution<S: Symmetry> {
    /// Not this aggregation's kind of sensor (e.g. a power sensor seen while
    /// aggregating voltage); skipped.
    Skip,
    Value(MeasuredValue<S>),
    /// A current sensor's value plus its local/global angle tag, so callers
    /// aggregating current can catch a mix of the two (spec §4.5 step 3:
    /// "reject a mix of local- and global-angle current sensors on one
    /// terminal").
    CurrentValue(MeasuredValue<S>, CurrentAngleKind),
}

/// Aggregates one [`crate::grouped_index::GroupedIndex`]'s worth of
/// per-terminal sensor groups (bus, branch-end, source, shunt, or load/gen)
/// into one combined measurement per terminal.
///
/// `sensor_ref` is the math model's back-reference array for that grouped
/// index (e.g. `MathTopology::sensor_ref_bus`); `resolve` maps an original
/// sensor index to its [`Contribution`].
pub fn aggregate_terminals<S: Symmetry>(
    topo: &MathTopology,
    per_terminal: &crate::grouped_index::GroupedIndex,
    sensor_ref: &[crate::types::Idx],
    resolve: impl Fn(crate::types::Idx) -> Contribution<S>,
) -> GridResult<Vec<Option<MeasuredValue<S>>>>
where
    S::Value: std::ops::Mul<f64, Output = S::Value>,
{
    let _ = topo; // kept for symmetry with the other aggregation entry points
    let mut out = Vec::with_capacity(per_terminal.size());
    for (terminal, range) in per_terminal.iter() {
        let mut values = Vec::new();
        let mut angle_kind: Option<CurrentAngleKind> = None;
        for pos in range {
            match resolve(sensor_ref[pos]) {
                Contribution::Skip => {}
                Contribution::Value(v) => values.push(v),
                Contribution::CurrentValue(v, kind) => {
                    match angle_kind {
                        None => angle_kind = Some(kind),
                        Some(existing) if existing == kind => {}
                        Some(_) => {
                            return Err(GridError::ConflictingAngleMeasurementType {
                                terminal: terminal as crate::types::Idx,
                            });
                        }
                    }
                    values.push(v);
                }
            }
        }
        out.push(aggregate_group(values));
    }
    Ok(out)
}

/// Round-trips a `TopoCoupling` sensor position back to which math model it
/// landed in, for callers assembling per-model aggregation inputs from a
/// flat list of sensors (spec §3 `TopoCoupling`: "sensor" field).
pub fn sensor_model_of(coupling: &TopoCoupling, sensor: crate::types::Idx) -> Option<(usize, usize)> {
    coupling
        .sensor
        .get(sensor as usize)
        .filter(|c| c.group != crate::types::NONE_IDX)
        .map(|c| (c.group as usize, c.pos as usize))
}
