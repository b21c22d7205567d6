//! Math-solver dispatcher (spec §4.7.7): groups the one genuinely dynamic
//! piece of solver selection — "if all loads/gens are const-Y, forces the
//! linear PF path" — together with one thin entry point per solver.
//!
//! A single runtime `match` dispatching all six [`super::CalculationMethod`]
//! variants under one generic block size can't be written honestly: the
//! three power-flow-shaped solvers ([`super::linear_pf`],
//! [`super::iterative_current_pf`]) share block size `N = 1`/`3`
//! ([`BlockEmbeddable`]) because their system matrix *is* the admittance
//! matrix, while the Newton-state solvers ([`super::newton_pf`],
//! [`super::iterative_linear_se`], [`super::newton_se`]) share `N = 2`/`6`
//! ([`NewtonEmbeddable`]) because their state is polar/rectangular voltage,
//! not admittance. Those two block sizes never agree for the same
//! symmetry, so `CalculationMethod` selects which function to call, not a
//! single generic instantiation a match arm could share. This crate's
//! scoping of the dispatcher's "one entry point" framing, recorded in
//! DESIGN.md.
//!
//! Per-solver prefactorization caching across separate dispatcher calls
//! (spec: "lazily instantiates ... reuses, keeping prefactorizations warm")
//! is implemented by [`CachedMathSolverDispatcher`] for the two solvers
//! whose system matrix *is* the Y-bus with a Dirichlet slack row and
//! doesn't depend on solver state ([`linear_pf`], [`iterative_current_pf`]):
//! it holds one [`crate::sparse_lu::BlockLu`] per math model, tagged with
//! the [`YBus::generation`] it was built against, and only re-factorizes
//! when that generation has moved on (spec §4.7.7 "reset only the affected
//! solver's cache on a parameter-change notification"). The three
//! Newton-state solvers ([`newton_pf`], [`iterative_linear_se`],
//! [`newton_se`]) rebuild a fresh Jacobian/gain matrix from the *current*
//! voltage estimate every iteration — there is no call-spanning
//! factorization of theirs to keep warm, so [`MathSolverDispatcher`]
//! dispatches them (and [`short_circuit`], a single-shot solve) straight
//! through without a cache.

use crate::component_model::LoadGenType;
use crate::error::GridResult;
use crate::logger::Logger;
use crate::sparse_lu::BlockLu;
use crate::topology::MathTopology;
use crate::types::{BlockEmbeddable, ConjMul, NewtonEmbeddable, RectangularEmbeddable, Symmetry};
use crate::ybus::YBus;
use crate::ybus::param::MathParam;

use super::SolverOutput;
use super::iterative_current_pf::{self, LoadGenInput};
use super::iterative_linear_se::{self, SeMeasurements};
use super::linear_pf;
use super::newton_pf;
use super::newton_se;
use super::short_circuit::{self, FaultInput, ShortCircuitOutput};

/// Groups solver selection; holds no state of its own. Use
/// [`CachedMathSolverDispatcher`] instead when repeated calls against the
/// same math model should reuse a warm prefactorization.
pub struct MathSolverDispatcher;

impl MathSolverDispatcher {
    /// Spec §4.7.7: "If all loads/gens are const-Y, forces the linear PF
    /// path." An empty model has nothing to force away from iteration, so
    /// it does not trigger this rule.
    pub fn forces_linear_power_flow(load_gen_types: &[LoadGenType]) -> bool {
        !load_gen_types.is_empty()
            && load_gen_types.iter().all(|t| *t == LoadGenType::ConstImpedance)
    }

    pub fn linear_power_flow<S, const N: usize>(
        topo: &MathTopology,
        ybus: &YBus<S>,
        param: &MathParam<S>,
        slack_voltage: S::Value,
        logger: &Logger,
    ) -> GridResult<SolverOutput<S>>
    where
        S: BlockEmbeddable<N>,
    {
        linear_pf::solve(topo, ybus, param, slack_voltage, logger)
    }

    pub fn iterative_current_power_flow<S, const N: usize>(
        topo: &MathTopology,
        ybus: &YBus<S>,
        param: &MathParam<S>,
        load_gen: &[LoadGenInput<S>],
        slack_voltage: S::Value,
        config: &iterative_current_pf::Config,
        logger: &Logger,
    ) -> GridResult<SolverOutput<S>>
    where
        S: BlockEmbeddable<N>,
        S::Value: std::ops::Sub<Output = S::Value> + iterative_current_pf::LoadCurrent,
    {
        iterative_current_pf::solve(topo, ybus, param, load_gen, slack_voltage, config, logger)
    }

    pub fn newton_raphson_power_flow<S, const N: usize>(
        topo: &MathTopology,
        ybus: &YBus<S>,
        param: &MathParam<S>,
        load_gen_injection: &[S::Value],
        slack_voltage: S::Value,
        config: &newton_pf::Config,
        logger: &Logger,
    ) -> GridResult<SolverOutput<S>>
    where
        S: NewtonEmbeddable<N>,
        S::Value: ConjMul + std::ops::Add<Output = S::Value> + std::ops::Sub<Output = S::Value>,
        S::Admittance: std::ops::Mul<S::Value, Output = S::Value>,
    {
        newton_pf::solve(topo, ybus, param, load_gen_injection, slack_voltage, config, logger)
    }

    pub fn iterative_linear_state_estimation<S, const N: usize>(
        topo: &MathTopology,
        ybus: &YBus<S>,
        param: &MathParam<S>,
        measurements: &SeMeasurements<S>,
        initial_voltage: S::Value,
        config: &iterative_linear_se::Config,
        logger: &Logger,
    ) -> GridResult<SolverOutput<S>>
    where
        S: RectangularEmbeddable<N> + NewtonEmbeddable<N>,
        S::Value: ConjMul + std::ops::Add<Output = S::Value> + std::ops::Sub<Output = S::Value>,
        S::Admittance: std::ops::Mul<S::Value, Output = S::Value>,
    {
        iterative_linear_se::solve(topo, ybus, param, measurements, initial_voltage, config, logger)
    }

    pub fn newton_raphson_state_estimation<S, const N: usize>(
        topo: &MathTopology,
        ybus: &YBus<S>,
        param: &MathParam<S>,
        measurements: &SeMeasurements<S>,
        initial_voltage: S::Value,
        config: &newton_se::Config,
        logger: &Logger,
    ) -> GridResult<SolverOutput<S>>
    where
        S: NewtonEmbeddable<N> + RectangularEmbeddable<N>,
        S::Value: ConjMul + std::ops::Add<Output = S::Value> + std::ops::Sub<Output = S::Value>,
        S::Admittance: std::ops::Mul<S::Value, Output = S::Value>,
    {
        newton_se::solve(topo, ybus, param, measurements, initial_voltage, config, logger)
    }

    pub fn short_circuit<S, const N: usize>(
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
        short_circuit::solve(topo, ybus, param, faults, logger)
    }
}

/// A warm factorization for one of the two Y-bus-shaped solvers, tagged
/// with the `YBus::generation` it was built against.
struct FactorizationCache<const N: usize> {
    generation: u64,
    lu: BlockLu<N>,
}

/// Lazily instantiates and reuses one factorization per math model for
/// [`linear_pf`] and [`iterative_current_pf`] (spec §4.7.7: "lazily
/// instantiate and reuse one solver per math model, keeping
/// prefactorizations warm, and reset only the affected solver's cache on a
/// parameter-change notification"). One instance is meant to outlive a
/// single math model's repeated calls (e.g. successive solves of the same
/// topology after a parameter update); a new `YBus::assemble` (topology
/// changed) calls for a new dispatcher, since the cached factorization's
/// sparsity pattern is tied to the structure it was built from.
pub struct CachedMathSolverDispatcher<S: Symmetry, const N: usize> {
    linear_pf_cache: Option<FactorizationCache<N>>,
    current_pf_cache: Option<FactorizationCache<N>>,
    _symmetry: std::marker::PhantomData<S>,
}

impl<S: Symmetry, const N: usize> Default for CachedMathSolverDispatcher<S, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Symmetry, const N: usize> CachedMathSolverDispatcher<S, N> {
    pub fn new() -> Self {
        Self {
            linear_pf_cache: None,
            current_pf_cache: None,
            _symmetry: std::marker::PhantomData,
        }
    }

    /// Drops every cached factorization, forcing the next call for each
    /// solver to rebuild from scratch. Callers don't normally need this —
    /// a generation mismatch already triggers the same rebuild — but it's
    /// useful when the math model itself is about to be discarded.
    pub fn invalidate(&mut self) {
        self.linear_pf_cache = None;
        self.current_pf_cache = None;
    }

    pub fn linear_power_flow(
        &mut self,
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
        let _scope = logger.scope(crate::logger::EventCode::MathCalculation);
        let generation = ybus.generation();
        let stale = !matches!(&self.linear_pf_cache, Some(c) if c.generation == generation);
        if stale {
            let system = linear_pf::build_system(topo, ybus)?;
            let lu = BlockLu::factorize(system, false)?;
            self.linear_pf_cache = Some(FactorizationCache { generation, lu });
        }
        let lu = &self.linear_pf_cache.as_ref().expect("just populated above").lu;
        linear_pf::solve_with_lu(topo, ybus, param, lu, slack_voltage)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn iterative_current_power_flow(
        &mut self,
        topo: &MathTopology,
        ybus: &YBus<S>,
        param: &MathParam<S>,
        load_gen: &[LoadGenInput<S>],
        slack_voltage: S::Value,
        config: &iterative_current_pf::Config,
        logger: &Logger,
    ) -> GridResult<SolverOutput<S>>
    where
        S: BlockEmbeddable<N>,
        S::Value: std::ops::Sub<Output = S::Value> + iterative_current_pf::LoadCurrent,
        S::Admittance: std::ops::Mul<S::Value, Output = S::Value>,
    {
        let _scope = logger.scope(crate::logger::EventCode::MathCalculation);
        let generation = ybus.generation();
        let stale = !matches!(&self.current_pf_cache, Some(c) if c.generation == generation);
        if stale {
            let system = iterative_current_pf::build_system(topo, ybus)?;
            let lu = BlockLu::factorize(system, true)?;
            self.current_pf_cache = Some(FactorizationCache { generation, lu });
        }
        let lu = &self.current_pf_cache.as_ref().expect("just populated above").lu;
        iterative_current_pf::solve_with_lu(
            topo,
            ybus,
            param,
            load_gen,
            slack_voltage,
            lu,
            config,
            logger,
        )
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn const_impedance_only_forces_linear_power_flow() {
        assert!(MathSolverDispatcher::forces_linear_power_flow(&[
            LoadGenType::ConstImpedance,
            LoadGenType::ConstImpedance,
        ]));
        assert!(!MathSolverDispatcher::forces_linear_power_flow(&[
            LoadGenType::ConstImpedance,
            LoadGenType::ConstPower,
        ]));
        assert!(!MathSolverDispatcher::forces_linear_power_flow(&[]));
    }

    #[test]
    fn cached_dispatcher_reuses_the_factorization_until_the_generation_moves() {
        use crate::topology::{ComponentConnection, ComponentTopology, build_topology};
        use crate::types::Sym;
        use crate::ybus::YBus;
        use crate::ybus::param::MathParam;
        use num_complex::Complex64;

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

        let mut param = MathParam::<Sym> {
            branch: vec![],
            shunt: vec![],
            source_admittance: vec![Complex64::new(100.0, 0.0)],
            source_u_ref: vec![Complex64::new(1.0, 0.0)],
        };
        let mut ybus = YBus::<Sym>::assemble(model, &param);
        let logger = Logger::new();
        let mut dispatcher = CachedMathSolverDispatcher::<Sym, 1>::new();

        let first = dispatcher
            .linear_power_flow(model, &ybus, &param, Complex64::new(1.0, 0.0), &logger)
            .unwrap();
        assert!((first.bus_voltage[0] - Complex64::new(1.0, 0.0)).norm() < 1e-9);
        assert!(dispatcher.linear_pf_cache.is_some());
        let cached_generation = dispatcher.linear_pf_cache.as_ref().unwrap().generation;
        assert_eq!(cached_generation, ybus.generation());

        // A parameter-only change bumps the generation; the stale cache
        // must be rebuilt rather than silently reused against it.
        param.source_u_ref[0] = Complex64::new(2.0, 0.0);
        ybus.update_values(&param, &[], &[], &[0]);
        let second = dispatcher
            .linear_power_flow(model, &ybus, &param, Complex64::new(2.0, 0.0), &logger)
            .unwrap();
        assert!((second.bus_voltage[0] - Complex64::new(2.0, 0.0)).norm() < 1e-9);
        assert_eq!(
            dispatcher.linear_pf_cache.as_ref().unwrap().generation,
            ybus.generation()
        );
        assert_ne!(cached_generation, ybus.generation());
    }
}
