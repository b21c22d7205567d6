//! End-to-end scenario tests driving the public API the way a caller
//! outside the crate would: build a topology, assemble a Y-bus, run a
//! solver, inspect the output.

use gridmath::component_model::{FaultPhase, FaultType};
use gridmath::error::GridError;
use gridmath::measured_values::{ApplianceSummary, aggregate_group, fuse_bus_injection, sum_group};
use gridmath::observability::{ObservabilityInput, check_observability};
use gridmath::solvers::iterative_linear_se::SeMeasurements;
use gridmath::solvers::short_circuit::{self, FaultInput};
use gridmath::solvers::{iterative_linear_se, linear_pf};
use gridmath::sparse_lu::{Block, BlockCsr, BlockLu, BlockVector};
use gridmath::topology::{ComponentConnection, ComponentTopology, build_topology};
use gridmath::types::{Asym, Sym, balanced_phase3};
use gridmath::ybus::YBus;
use gridmath::ybus::param::{BranchAdmittance, MathParam};
use gridmath::{component_model::MeasuredValue, logger::Logger};
use nalgebra::Vector3;
use num_complex::Complex64;

/// A source feeding a shunt load over one line settles with the load bus's
/// voltage magnitude below the source's reference.
#[test]
fn source_and_load_settle_with_a_voltage_drop() {
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
    let load_bus = coupling.node[1].pos as usize;

    let y_line = Complex64::new(1.0, -10.0);
    let param = MathParam::<Sym> {
        branch: vec![BranchAdmittance {
            y_ff: y_line,
            y_ft: -y_line,
            y_tf: -y_line,
            y_tt: y_line,
        }],
        shunt: vec![Complex64::new(0.2, -2.0)],
        source_admittance: vec![Complex64::new(1000.0, 0.0)],
        source_u_ref: vec![Complex64::new(1.0, 0.0)],
    };
    let ybus = YBus::<Sym>::assemble(model, &param);
    let logger = Logger::new();
    let out = linear_pf::solve(model, &ybus, &param, Complex64::new(1.0, 0.0), &logger).unwrap();

    assert!(out.bus_voltage[load_bus].norm() < out.bus_voltage[model.slack_bus].norm());
    assert!((out.bus_voltage[model.slack_bus] - Complex64::new(1.0, 0.0)).norm() < 1e-9);
}

/// One node with a single voltage-phasor sensor: the estimator's solved
/// voltage reproduces the sensor reading exactly, in both symmetric and
/// asymmetric mode (the asymmetric reading fans the same phasor out by
/// +/-120 degrees).
#[test]
fn state_estimation_with_a_single_voltage_sensor_recovers_it() {
    let sensor = Complex64::from_polar(12345.0, 0.1);

    {
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
                value: sensor,
                variance: 100.0,
            })],
            injection: vec![None],
            branch_power: vec![],
            has_phasor: true,
        };
        let logger = Logger::new();
        let config = iterative_linear_se::Config {
            err_tol: 1e-6,
            max_iter: 20,
        };
        let out = iterative_linear_se::solve::<Sym, 2>(
            model,
            &ybus,
            &param,
            &measurements,
            Complex64::new(1.0, 0.0),
            &config,
            &logger,
        )
        .unwrap();
        assert!((out.bus_voltage[0] - sensor).norm() < 1e-3);
    }

    {
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
        let u_ref = balanced_phase3(Complex64::new(1.0, 0.0));
        let y_src = Vector3::new(
            Complex64::new(100.0, 0.0),
            Complex64::new(100.0, 0.0),
            Complex64::new(100.0, 0.0),
        );
        let param = MathParam::<Asym> {
            branch: vec![],
            shunt: vec![],
            source_admittance: vec![nalgebra::SMatrix::from_diagonal(&y_src)],
            source_u_ref: vec![u_ref],
        };
        let ybus = YBus::<Asym>::assemble(model, &param);
        let sensor_phase3 = balanced_phase3(sensor);
        let measurements = SeMeasurements::<Asym> {
            voltage: vec![Some(MeasuredValue {
                value: sensor_phase3,
                variance: 100.0,
            })],
            injection: vec![None],
            branch_power: vec![],
            has_phasor: true,
        };
        let logger = Logger::new();
        let config = iterative_linear_se::Config {
            err_tol: 1e-6,
            max_iter: 20,
        };
        let out = iterative_linear_se::solve::<Asym, 6>(
            model,
            &ybus,
            &param,
            &measurements,
            u_ref,
            &config,
            &logger,
        )
        .unwrap();
        for p in 0..3 {
            assert!((out.bus_voltage[0][p] - sensor_phase3[p]).norm() < 1e-3);
        }
    }
}

/// A bolted single-phase-to-ground fault on phase A collapses only that
/// phase's voltage; phases B and C keep the voltage they had pre-fault.
#[test]
fn bolted_single_phase_fault_collapses_only_its_own_phase() {
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

    let y_line = Vector3::new(
        Complex64::new(2.0, -20.0),
        Complex64::new(2.0, -20.0),
        Complex64::new(2.0, -20.0),
    );
    let y_line_block: nalgebra::SMatrix<Complex64, 3, 3> = nalgebra::SMatrix::from_diagonal(&y_line);
    let y_src = Vector3::new(
        Complex64::new(1000.0, 0.0),
        Complex64::new(1000.0, 0.0),
        Complex64::new(1000.0, 0.0),
    );
    let param = MathParam::<Asym> {
        branch: vec![BranchAdmittance {
            y_ff: y_line_block,
            y_ft: -y_line_block,
            y_tf: -y_line_block,
            y_tt: y_line_block,
        }],
        shunt: vec![],
        source_admittance: vec![nalgebra::SMatrix::from_diagonal(&y_src)],
        source_u_ref: vec![balanced_phase3(Complex64::new(1.0, 0.0))],
    };
    let ybus = YBus::<Asym>::assemble(model, &param);
    let logger = Logger::new();

    let baseline = short_circuit::solve::<Asym, 3>(model, &ybus, &param, &[], &logger).unwrap();

    let faults = vec![FaultInput {
        bus: fault_bus,
        fault_type: FaultType::SinglePhaseToGround,
        fault_phase: FaultPhase::A,
        admittance: None,
    }];
    let faulted = short_circuit::solve::<Asym, 3>(model, &ybus, &param, &faults, &logger).unwrap();

    assert!(faulted.bus_voltage[fault_bus][0].norm() < 1e-9);
    for p in 1..3 {
        assert!(
            (faulted.bus_voltage[fault_bus][p] - baseline.bus_voltage[fault_bus][p]).norm() < 1e-9
        );
    }
    assert!(faulted.fault_current[0].norm() > 0.0);
}

/// A three-bus radial grid with only a voltage sensor at the root and an
/// injection sensor at the far end is not observable (the middle branch's
/// flow can't be recovered); adding a branch-power sensor there fixes it.
#[test]
fn radial_grid_becomes_observable_once_the_middle_branch_is_measured() {
    let mut topo = ComponentTopology {
        n_node: 3,
        source_node: vec![0],
        ..Default::default()
    };
    topo.branch.push([0, 1]);
    topo.branch.push([1, 2]);
    let mut conn = ComponentConnection {
        source_active: vec![true],
        ..Default::default()
    };
    for _ in 0..2 {
        conn.branch_status.push([true, true]);
        conn.branch_phase_shift.push(0.0);
    }
    let (models, _) = build_topology(&topo, &conn);
    let model = &models[0];

    // Only a root voltage sensor and a leaf injection sensor: two
    // measurements can't cover three buses (spec §4.6's measurement-count
    // check trips before the radial walk even runs).
    let not_observable = ObservabilityInput {
        has_voltage_phasor: vec![true, false, false],
        has_voltage_magnitude_only: vec![false, false, false],
        has_injection: vec![false, false, true],
        has_branch_flow: vec![false, false],
        has_global_angle_current: vec![false, false],
    };
    let err = check_observability(model, &not_observable).unwrap_err();
    assert!(matches!(err, GridError::NotObservable { .. }));

    let observable = ObservabilityInput {
        has_branch_flow: vec![false, true],
        ..not_observable
    };
    assert!(check_observability(model, &observable).is_ok());
}

/// A hand-solvable 3x3 scalar sparse system via the block-LU machinery at
/// `N = 1`, plus the singular-pivot failure path.
#[test]
fn sparse_lu_solves_a_known_three_bus_scalar_system() {
    let edges = [(0usize, 1usize), (0, 2)];
    let fill_in = [(1usize, 2usize)];

    let mut system = BlockCsr::<1>::with_pattern(3, &edges, &fill_in);
    let entries: [(usize, usize, f64); 6] = [
        (0, 0, 4.0),
        (0, 1, 1.0),
        (0, 2, 5.0),
        (1, 0, 3.0),
        (1, 1, 7.0),
        (2, 0, 2.0),
    ];
    for &(r, c, v) in &entries {
        system.add_at(r, c, Block::<1>::new(Complex64::new(v, 0.0))).unwrap();
    }
    system.add_at(2, 2, Block::<1>::new(Complex64::new(6.0, 0.0))).unwrap();

    let rhs = vec![
        BlockVector::<1>::new(Complex64::new(21.0, 0.0)),
        BlockVector::<1>::new(Complex64::new(2.0, 0.0)),
        BlockVector::<1>::new(Complex64::new(18.0, 0.0)),
    ];
    let lu = BlockLu::factorize(system).unwrap();
    let solved = lu.solve(&rhs);
    let expected = [3.0, -1.0, 2.0];
    for (x, &e) in solved.iter().zip(expected.iter()) {
        assert!((x[0].re - e).abs() < 1e-9);
        assert!(x[0].im.abs() < 1e-9);
    }

    let mut singular = BlockCsr::<1>::with_pattern(3, &edges, &fill_in);
    for &(r, c, v) in &entries {
        if (r, c) == (0, 0) {
            continue;
        }
        singular.add_at(r, c, Block::<1>::new(Complex64::new(v, 0.0))).unwrap();
    }
    singular.add_at(2, 2, Block::<1>::new(Complex64::new(6.0, 0.0))).unwrap();
    let err = BlockLu::factorize(singular).unwrap_err();
    assert!(matches!(err, GridError::SparseMatrix { row: 0, .. }));
}

/// A generator and a load on the same bus each carry their own power
/// sensor: the bus's net appliance injection is their *sum* (spec §4.5 step
/// 2), not a blend of the two as if they were repeated readings of one
/// quantity. Adding a third, independent, tighter direct bus-injection
/// sensor on the same terminal then correctly blends with that sum (spec
/// §4.5 step 3's "both present, all measured" case), shifting the fused
/// result toward the tighter reading the way inverse-variance weighting
/// always favors the more confident one.
#[test]
fn appliance_readings_sum_then_blend_with_a_tighter_direct_sensor() {
    let generator = MeasuredValue::<Sym> {
        value: -Complex64::new(900.0, 90.0),
        variance: 100.0,
    };
    let load = MeasuredValue::<Sym> {
        value: Complex64::new(1800.0, 180.0),
        variance: 100.0,
    };
    let appliance_sum = sum_group([generator, load]).unwrap();
    assert!((appliance_sum.value.re - 900.0).abs() < 1e-6);
    assert!((appliance_sum.value.im - 90.0).abs() < 1e-6);
    assert!((appliance_sum.variance - 200.0).abs() < 1e-6);

    let summary = ApplianceSummary {
        aggregate: Some(appliance_sum),
        total_count: 2,
        unmeasured_count: 0,
    };

    let direct = MeasuredValue::<Sym> {
        value: Complex64::new(920.0, 90.0),
        variance: 1.0,
    };
    let fused = fuse_bus_injection(summary, Some(direct)).unwrap();
    assert!((fused.value.re - direct.value.re).abs() < (appliance_sum.value.re - direct.value.re).abs());
    assert!(fused.variance < appliance_sum.variance);

    // Sanity check against the old (wrong) blend-not-sum behavior: had the
    // two appliance readings been blended instead of summed, their average
    // would sit near 450, far from either the sum or the direct sensor.
    let blended_wrongly = aggregate_group([generator, load]).unwrap();
    assert!((blended_wrongly.value.re - 450.0).abs() < 1e-6);
    assert!((appliance_sum.value.re - blended_wrongly.value.re).abs() > 400.0);
}
