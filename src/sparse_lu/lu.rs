//! Sparse block LU factorization and solve (spec §4.4).
//!
//! Elimination proceeds in plain increasing bus-index order: the topology
//! reducer already numbered buses by the chosen [`crate::topology::EliminationOrdering`]
//! with the slack bus forced last (spec §4.2 step 5), so bus index *is*
//! elimination order here and no separate permutation bookkeeping is
//! needed. Each diagonal block is inverted with
//! [`nalgebra::linalg::FullPivLU`] (spec §4.4: "full pivoting inside each
//! diagonal block"), and the result is cached for the solve phase
//! (spec §4.4 "Prefactorization reuse": "the same factors the unknown
//! iteration loop as well").

use nalgebra::linalg::FullPivLU;
use num_complex::Complex64;

use crate::error::{GridError, GridResult};
use crate::sparse_lu::block::{Block, BlockVector, zero_vector};
use crate::sparse_lu::matrix::BlockCsr;

/// Initial diagonal perturbation added to a singular block when
/// `allow_perturbation` is set (spec §4.4 `prefactorize(data, perms,
/// allow_perturbation)`), doubled on each retry up to
/// [`MAX_PERTURBATION_ATTEMPTS`] times before giving up.
const PERTURBATION_EPSILON: f64 = 1e-8;
const MAX_PERTURBATION_ATTEMPTS: u32 = 10;

/// A factorized block-sparse matrix: `self.factored` holds the strict-lower
/// `L` blocks (unit diagonal implied) below the diagonal and the `U` blocks
/// (including the pivoted diagonal) on and above it, both packed into the
/// original sparsity pattern.
#[derive(Debug, Clone)]
pub struct BlockLu<const N: usize> {
    factored: BlockCsr<N>,
    diag_inv: Vec<Block<N>>,
}

impl<const N: usize> BlockLu<N> {
    /// Factorizes `a` in place (spec §4.4 step 2). `allow_perturbation`
    /// controls whether a diagonal block that full pivoting finds singular
    /// is nudged and retried (spec §4.4 `prefactorize(data, perms,
    /// allow_perturbation)`) or treated as a hard failure.
    pub fn factorize(mut a: BlockCsr<N>, allow_perturbation: bool) -> GridResult<Self> {
        let n = a.n;
        let mut diag_inv = Vec::with_capacity(n);

        for k in 0..n {
            let ukk = *a.diag(k);
            let ukk_inv = invert_block(ukk, k, allow_perturbation)?;
            diag_inv.push(ukk_inv);

            let rows_below: Vec<usize> =
                (k + 1..n).filter(|&i| a.position(i, k).is_some()).collect();
            let cols_right: Vec<usize> =
                a.row(k).iter().copied().filter(|&j| j > k).collect();

            for &i in &rows_below {
                let a_ik = *a.get(i, k);
                let l_ik = a_ik * ukk_inv;
                *a.block_mut(i, k) = l_ik;

                for &j in &cols_right {
                    let a_kj = *a.get(k, j);
                    let pos = a
                        .position(i, j)
                        .expect("elimination fill-in guarantees this entry exists");
                    a.blocks[pos] -= l_ik * a_kj;
                }
            }
        }

        Ok(Self {
            factored: a,
            diag_inv,
        })
    }

    /// Solves `A x = b` given the cached factorization, overwriting `b` in
    /// place with the solution (spec §4.4 step 3).
    pub fn solve_in_place(&self, b: &mut [BlockVector<N>]) {
        let n = self.factored.n;
        debug_assert_eq!(b.len(), n);

        // Forward substitution: L y = b, unit diagonal.
        for k in 0..n {
            let mut acc = b[k];
            for &col in self.factored.row(k) {
                if col < k {
                    acc -= *self.factored.get(k, col) * b[col];
                }
            }
            b[k] = acc;
        }

        // Backward substitution: U x = y.
        for k in (0..n).rev() {
            let mut acc = b[k];
            for &col in self.factored.row(k) {
                if col > k {
                    acc -= *self.factored.get(k, col) * b[col];
                }
            }
            b[k] = self.diag_inv[k] * acc;
        }
    }

    /// Convenience wrapper returning a fresh solution vector.
    pub fn solve(&self, b: &[BlockVector<N>]) -> Vec<BlockVector<N>> {
        let mut x = b.to_vec();
        self.solve_in_place(&mut x);
        x
    }

    pub fn n(&self) -> usize {
        self.factored.n
    }
}

fn invert_block<const N: usize>(
    block: Block<N>,
    row: usize,
    allow_perturbation: bool,
) -> GridResult<Block<N>> {
    let identity = Block::<N>::identity();
    if let Some(inv) = FullPivLU::new(block).solve(&identity) {
        return Ok(inv);
    }

    if allow_perturbation {
        let mut eps = PERTURBATION_EPSILON;
        for _ in 0..MAX_PERTURBATION_ATTEMPTS {
            let mut perturbed = block;
            for i in 0..N {
                perturbed[(i, i)] += Complex64::new(eps, 0.0);
            }
            if let Some(inv) = FullPivLU::new(perturbed).solve(&identity) {
                return Ok(inv);
            }
            eps *= 10.0;
        }
    }

    Err(GridError::SparseMatrix {
        row: row as crate::types::Idx,
        message: format!(
            "diagonal block at bus {row} is singular under full pivoting{}",
            if allow_perturbation {
                " even after diagonal perturbation"
            } else {
                ""
            }
        ),
    })
}

#[allow(dead_code)]
fn zero_rhs<const N: usize>(n: usize) -> Vec<BlockVector<N>> {
    vec![zero_vector::<N>(); n]
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Complex;
    use num_complex::Complex64;

    #[test]
    fn diagonal_only_system_solves_exactly() {
        let mut a = BlockCsr::<1>::with_pattern(2, &[], &[]);
        *a.diag_mut(0) = Block::<1>::new(Complex64::new(2.0, 0.0));
        *a.diag_mut(1) = Block::<1>::new(Complex64::new(4.0, 0.0));
        let lu = BlockLu::factorize(a, false).unwrap();
        let mut rhs = vec![
            BlockVector::<1>::new(Complex64::new(4.0, 0.0)),
            BlockVector::<1>::new(Complex64::new(8.0, 0.0)),
        ];
        lu.solve_in_place(&mut rhs);
        assert!((rhs[0][0] - Complex::new(2.0, 0.0)).norm() < 1e-9);
        assert!((rhs[1][0] - Complex::new(2.0, 0.0)).norm() < 1e-9);
    }

    #[test]
    fn radial_chain_round_trips_through_factorization() {
        // 0 - 1 - 2, pure resistive-like pi-connections, check Ax recovers b.
        let mut a = BlockCsr::<1>::with_pattern(3, &[(0, 1), (1, 2)], &[]);
        let y = Complex64::new(1.0, -5.0);
        for i in 0..3 {
            *a.diag_mut(i) = Block::<1>::new(Complex64::new(2.0, 0.0) * y);
        }
        *a.block_mut(0, 1) = Block::<1>::new(-y);
        *a.block_mut(1, 0) = Block::<1>::new(-y);
        *a.block_mut(1, 2) = Block::<1>::new(-y);
        *a.block_mut(2, 1) = Block::<1>::new(-y);

        let x_expected = vec![
            BlockVector::<1>::new(Complex64::new(1.0, 0.2)),
            BlockVector::<1>::new(Complex64::new(0.9, -0.1)),
            BlockVector::<1>::new(Complex64::new(1.05, 0.0)),
        ];
        // b = A x
        let mut b = vec![BlockVector::<1>::new(Complex64::new(0.0, 0.0)); 3];
        for row in 0..3 {
            let mut acc = Complex64::new(0.0, 0.0);
            for &col in a.row(row) {
                acc += a.get(row, col)[(0, 0)] * x_expected[col][0];
            }
            b[row] = BlockVector::<1>::new(acc);
        }

        let lu = BlockLu::factorize(a, false).unwrap();
        let x = lu.solve(&b);
        for i in 0..3 {
            assert!((x[i][0] - x_expected[i][0]).norm() < 1e-9);
        }
    }

    #[test]
    fn singular_diagonal_rejected_without_perturbation() {
        let mut a = BlockCsr::<1>::with_pattern(1, &[], &[]);
        *a.diag_mut(0) = Block::<1>::new(Complex64::new(0.0, 0.0));
        let err = BlockLu::factorize(a, false).unwrap_err();
        matches!(err, GridError::SparseMatrix { row: 0, .. });
    }

    #[test]
    fn singular_diagonal_recovers_under_perturbation() {
        // A bus with no shunt, no source and no surviving branch collapses
        // its diagonal block to exactly zero; with perturbation allowed the
        // factorization should nudge it off the singularity and solve.
        let mut a = BlockCsr::<1>::with_pattern(2, &[(0, 1)], &[]);
        *a.diag_mut(0) = Block::<1>::new(Complex64::new(0.0, 0.0));
        *a.diag_mut(1) = Block::<1>::new(Complex64::new(1.0, 0.0));
        *a.block_mut(0, 1) = Block::<1>::new(Complex64::new(0.0, 0.0));
        *a.block_mut(1, 0) = Block::<1>::new(Complex64::new(0.0, 0.0));

        assert!(BlockLu::factorize(a.clone(), false).is_err());

        let lu = BlockLu::factorize(a, true).expect("perturbation should recover a zero pivot");
        let mut rhs = vec![
            BlockVector::<1>::new(Complex64::new(0.0, 0.0)),
            BlockVector::<1>::new(Complex64::new(3.0, 0.0)),
        ];
        lu.solve_in_place(&mut rhs);
        assert!((rhs[1][0] - Complex::new(3.0, 0.0)).norm() < 1e-6);
    }
}
