//! Shared scalar and symmetry-tag types.
//!
//! The asymmetric/symmetric split (spec §9 "Asymmetric vs. symmetric") is
//! modeled as a trait over a "symmetry tag" rather than duplicating solver
//! bodies: [`Sym`] carries one complex scalar per quantity, [`Asym`] carries
//! a length-3 complex vector / 3×3 complex tensor per quantity.

use nalgebra::{Complex, SMatrix, SVector};
use num_complex::Complex64;

use crate::sparse_lu::{Block, BlockVector};

/// Index type used throughout the crate; `-1` is the "not present" sentinel
/// wherever the spec calls for it (e.g. an open branch end, an unenergized
/// coupling).
pub type Idx = i64;

/// Sentinel for "no group" / "no position" / "open end" index values.
pub const NONE_IDX: Idx = -1;

/// A per-arm or per-node admittance value in symmetric mode: one complex
/// scalar.
pub type ScalarAdmittance = Complex64;

/// A per-arm or per-node admittance value in asymmetric mode: a 3x3 complex
/// tensor over the ABC phases.
pub type TensorAdmittance = SMatrix<Complex<f64>, 3, 3>;

/// A per-bus voltage/current/power value in asymmetric mode.
pub type Phase3 = SVector<Complex<f64>, 3>;

/// Symmetry tag trait. `Sym` and `Asym` are zero-sized marker types that
/// select, at compile time, whether a quantity is a scalar or a 3-phase
/// vector/tensor, and what LU block size a solver built on that quantity
/// needs per bus.
pub trait Symmetry: Copy + Clone + std::fmt::Debug + Send + Sync + 'static {
    /// Complex scalar (symmetric) or length-3 complex vector (asymmetric)
    /// representing one voltage/current/power quantity.
    type Value: Copy + Clone + std::fmt::Debug + std::ops::Add<Output = Self::Value> + ConjMul;
    /// Complex scalar (symmetric) or 3x3 complex tensor (asymmetric)
    /// representing one admittance.
    type Admittance: Copy + Clone + std::fmt::Debug;
    /// Number of electrical phases folded into one `Value`/`Admittance`.
    const N_PHASE: usize;
    /// Human-readable tag, used in log messages and panics.
    const NAME: &'static str;

    fn zero_value() -> Self::Value;
    fn zero_admittance() -> Self::Admittance;
}

/// Positive-sequence (single-phase) symmetry tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sym;

impl Symmetry for Sym {
    type Value = Complex64;
    type Admittance = Complex64;
    const N_PHASE: usize = 1;
    const NAME: &'static str = "symmetric";

    fn zero_value() -> Self::Value {
        Complex64::new(0.0, 0.0)
    }
    fn zero_admittance() -> Self::Admittance {
        Complex64::new(0.0, 0.0)
    }
}

/// Full three-phase (ABC) symmetry tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Asym;

impl Symmetry for Asym {
    type Value = Phase3;
    type Admittance = TensorAdmittance;
    const N_PHASE: usize = 3;
    const NAME: &'static str = "asymmetric";

    fn zero_value() -> Self::Value {
        Phase3::zeros()
    }
    fn zero_admittance() -> Self::Admittance {
        TensorAdmittance::zeros()
    }
}

/// Power-from-voltage-and-current: `s = u * conj(i)`, lifted over scalars
/// and per-phase vectors alike.
pub trait ConjMul: Copy {
    fn conj_mul(self, other: Self) -> Self;
}

impl ConjMul for Complex64 {
    fn conj_mul(self, other: Self) -> Self {
        self * other.conj()
    }
}

impl ConjMul for Phase3 {
    fn conj_mul(self, other: Self) -> Self {
        Phase3::new(
            self[0] * other[0].conj(),
            self[1] * other[1].conj(),
            self[2] * other[2].conj(),
        )
    }
}

/// Embeds a symmetry tag's `Value`/`Admittance` into the fixed-size
/// [`Block`]/[`BlockVector`] shape the sparse LU solver works in (spec §9
/// "Block size abstraction"). Implemented only for [`Sym`] (`N = 1`) and
/// [`Asym`] (`N = 3`, where the embedding is the identity: [`Phase3`] and
/// [`TensorAdmittance`] already *are* `BlockVector<3>`/`Block<3>`), so a
/// solver that needs the complex Y-bus admittances directly (the linear and
/// iterative-current-injection formulations) can be written once, generic
/// over `S`, and instantiated at each of the two block sizes rather than
/// duplicated per symmetry.
pub trait BlockEmbeddable<const N: usize>: Symmetry {
    fn value_to_block(v: Self::Value) -> BlockVector<N>;
    fn block_to_value(b: BlockVector<N>) -> Self::Value;
    fn admittance_to_block(a: Self::Admittance) -> Block<N>;
}

impl BlockEmbeddable<1> for Sym {
    fn value_to_block(v: Self::Value) -> BlockVector<1> {
        BlockVector::<1>::new(v)
    }
    fn block_to_value(b: BlockVector<1>) -> Self::Value {
        b[0]
    }
    fn admittance_to_block(a: Self::Admittance) -> Block<1> {
        Block::<1>::new(a)
    }
}

impl BlockEmbeddable<3> for Asym {
    fn value_to_block(v: Self::Value) -> BlockVector<3> {
        v
    }
    fn block_to_value(b: BlockVector<3>) -> Self::Value {
        b
    }
    fn admittance_to_block(a: Self::Admittance) -> Block<3> {
        a
    }
}

/// Bridges a symmetry tag into the fixed-size polar Newton-Raphson block
/// shape (spec §4.7.3): `N = 2` (one phase's `[Delta-theta, Delta-V/V]`) for
/// [`Sym`], `N = 6` (three phases stacked the same way) for [`Asym`].
///
/// The asymmetric Jacobian is phase-decoupled: each phase's `H/N/M/L` terms
/// use only that phase's own admittance (the tensor's diagonal), dropping
/// mutual coupling from the *Jacobian* only. The power mismatch itself is
/// still computed from the full three-phase admittance tensor via the
/// Y-bus, so Newton's iterates still converge to the fully-coupled
/// solution, just without a fully-coupled Jacobian's sharper convergence
/// rate. This crate's resolution of the spec's asymmetric-Newton Jacobian
/// shape question, recorded in DESIGN.md.
pub trait NewtonEmbeddable<const N: usize>: Symmetry {
    fn voltage_to_polar(v: Self::Value) -> [(f64, f64); 3];
    fn polar_to_voltage(polar: [(f64, f64); 3]) -> Self::Value;
    /// Per-phase `(G, B)` taken from the admittance's own-phase (diagonal)
    /// entry.
    fn admittance_gb(a: Self::Admittance) -> [(f64, f64); 3];
    fn power_to_pq(s: Self::Value) -> [(f64, f64); 3];
    fn mismatch_block(pq: [(f64, f64); 3]) -> BlockVector<N>;
    fn unpack_delta(b: BlockVector<N>) -> [(f64, f64); 3];
    /// Builds the (block-diagonal-per-phase, in the asymmetric case) `[H N;
    /// M L]` Jacobian block from per-phase `(H, N, M, L)` terms.
    fn jacobian_block(terms: [(f64, f64, f64, f64); 3]) -> Block<N>;
}

impl NewtonEmbeddable<2> for Sym {
    fn voltage_to_polar(v: Self::Value) -> [(f64, f64); 3] {
        [(v.arg(), v.norm()), (0.0, 0.0), (0.0, 0.0)]
    }
    fn polar_to_voltage(polar: [(f64, f64); 3]) -> Self::Value {
        Complex64::from_polar(polar[0].1, polar[0].0)
    }
    fn admittance_gb(a: Self::Admittance) -> [(f64, f64); 3] {
        [(a.re, a.im), (0.0, 0.0), (0.0, 0.0)]
    }
    fn power_to_pq(s: Self::Value) -> [(f64, f64); 3] {
        [(s.re, s.im), (0.0, 0.0), (0.0, 0.0)]
    }
    fn mismatch_block(pq: [(f64, f64); 3]) -> BlockVector<2> {
        BlockVector::<2>::new(Complex64::new(pq[0].0, 0.0), Complex64::new(pq[0].1, 0.0))
    }
    fn unpack_delta(b: BlockVector<2>) -> [(f64, f64); 3] {
        [(b[0].re, b[1].re), (0.0, 0.0), (0.0, 0.0)]
    }
    fn jacobian_block(terms: [(f64, f64, f64, f64); 3]) -> Block<2> {
        let (h, n, m, l) = terms[0];
        Block::<2>::new(
            Complex64::new(h, 0.0),
            Complex64::new(n, 0.0),
            Complex64::new(m, 0.0),
            Complex64::new(l, 0.0),
        )
    }
}

impl NewtonEmbeddable<6> for Asym {
    fn voltage_to_polar(v: Self::Value) -> [(f64, f64); 3] {
        [
            (v[0].arg(), v[0].norm()),
            (v[1].arg(), v[1].norm()),
            (v[2].arg(), v[2].norm()),
        ]
    }
    fn polar_to_voltage(polar: [(f64, f64); 3]) -> Self::Value {
        Phase3::new(
            Complex64::from_polar(polar[0].1, polar[0].0),
            Complex64::from_polar(polar[1].1, polar[1].0),
            Complex64::from_polar(polar[2].1, polar[2].0),
        )
    }
    fn admittance_gb(a: Self::Admittance) -> [(f64, f64); 3] {
        [
            (a[(0, 0)].re, a[(0, 0)].im),
            (a[(1, 1)].re, a[(1, 1)].im),
            (a[(2, 2)].re, a[(2, 2)].im),
        ]
    }
    fn power_to_pq(s: Self::Value) -> [(f64, f64); 3] {
        [(s[0].re, s[0].im), (s[1].re, s[1].im), (s[2].re, s[2].im)]
    }
    fn mismatch_block(pq: [(f64, f64); 3]) -> BlockVector<6> {
        BlockVector::<6>::new(
            Complex64::new(pq[0].0, 0.0),
            Complex64::new(pq[0].1, 0.0),
            Complex64::new(pq[1].0, 0.0),
            Complex64::new(pq[1].1, 0.0),
            Complex64::new(pq[2].0, 0.0),
            Complex64::new(pq[2].1, 0.0),
        )
    }
    fn unpack_delta(b: BlockVector<6>) -> [(f64, f64); 3] {
        [
            (b[0].re, b[1].re),
            (b[2].re, b[3].re),
            (b[4].re, b[5].re),
        ]
    }
    fn jacobian_block(terms: [(f64, f64, f64, f64); 3]) -> Block<6> {
        let mut block = Block::<6>::zeros();
        for (p, &(h, n, m, l)) in terms.iter().enumerate() {
            let base = 2 * p;
            block[(base, base)] = Complex64::new(h, 0.0);
            block[(base, base + 1)] = Complex64::new(n, 0.0);
            block[(base + 1, base)] = Complex64::new(m, 0.0);
            block[(base + 1, base + 1)] = Complex64::new(l, 0.0);
        }
        block
    }
}

/// Bridges a symmetry tag into the fixed-size rectangular state-estimation
/// block shape (spec §4.7.4/§4.7.5: "block size 2 for sym, 6 for asym"):
/// `[Re(U), Im(U)]` stacked per phase.
pub trait RectangularEmbeddable<const N: usize>: Symmetry {
    fn voltage_to_rect(v: Self::Value) -> [(f64, f64); 3];
    fn rect_to_voltage(rect: [(f64, f64); 3]) -> Self::Value;
    fn rect_block(rect: [(f64, f64); 3]) -> BlockVector<N>;
    fn unpack_rect(b: BlockVector<N>) -> [(f64, f64); 3];
}

impl RectangularEmbeddable<2> for Sym {
    fn voltage_to_rect(v: Self::Value) -> [(f64, f64); 3] {
        [(v.re, v.im), (0.0, 0.0), (0.0, 0.0)]
    }
    fn rect_to_voltage(rect: [(f64, f64); 3]) -> Self::Value {
        Complex64::new(rect[0].0, rect[0].1)
    }
    fn rect_block(rect: [(f64, f64); 3]) -> BlockVector<2> {
        BlockVector::<2>::new(Complex64::new(rect[0].0, 0.0), Complex64::new(rect[0].1, 0.0))
    }
    fn unpack_rect(b: BlockVector<2>) -> [(f64, f64); 3] {
        [(b[0].re, b[1].re), (0.0, 0.0), (0.0, 0.0)]
    }
}

impl RectangularEmbeddable<6> for Asym {
    fn voltage_to_rect(v: Self::Value) -> [(f64, f64); 3] {
        [(v[0].re, v[0].im), (v[1].re, v[1].im), (v[2].re, v[2].im)]
    }
    fn rect_to_voltage(rect: [(f64, f64); 3]) -> Self::Value {
        Phase3::new(
            Complex64::new(rect[0].0, rect[0].1),
            Complex64::new(rect[1].0, rect[1].1),
            Complex64::new(rect[2].0, rect[2].1),
        )
    }
    fn rect_block(rect: [(f64, f64); 3]) -> BlockVector<6> {
        BlockVector::<6>::new(
            Complex64::new(rect[0].0, 0.0),
            Complex64::new(rect[0].1, 0.0),
            Complex64::new(rect[1].0, 0.0),
            Complex64::new(rect[1].1, 0.0),
            Complex64::new(rect[2].0, 0.0),
            Complex64::new(rect[2].1, 0.0),
        )
    }
    fn unpack_rect(b: BlockVector<6>) -> [(f64, f64); 3] {
        [
            (b[0].re, b[1].re),
            (b[2].re, b[3].re),
            (b[4].re, b[5].re),
        ]
    }
}

/// `120` degree phase rotation operator `exp(-j 2*pi/3)`, used to fan a
/// symmetric phasor out into a balanced three-phase `Phase3` (spec E2: "fills
/// the three phases by +/-120 degrees").
pub fn balanced_phase3(u: Complex64) -> Phase3 {
    let a = Complex64::from_polar(1.0, -2.0 * std::f64::consts::PI / 3.0);
    Phase3::new(u, u * a * a, u * a)
}
