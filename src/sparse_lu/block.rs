//! The dense block type the sparse solver is built from (spec §4.4: "fixed
//! small dense blocks, one of {1, 2, 3, 4, 6} per use site").

use nalgebra::SMatrix;
use num_complex::Complex64;

/// A dense `N x N` complex block. `N` ranges over {1, 2, 3, 4, 6} depending
/// on the solver formulation that builds the matrix (spec §4.4, §9 "Block
/// size abstraction"): 1 for a symmetric linear solve, 3 for an asymmetric
/// linear solve, 2 for the symmetric Newton formulations, 6 for the
/// asymmetric Newton formulations, 4 reserved for state-estimation
/// formulations that stack one extra residual block per bus.
pub type Block<const N: usize> = SMatrix<Complex64, N, N>;

/// A length-`N` complex block vector, the right-hand-side/unknown
/// counterpart to [`Block`].
pub type BlockVector<const N: usize> = nalgebra::SVector<Complex64, N>;

pub fn zero_block<const N: usize>() -> Block<N> {
    Block::<N>::zeros()
}

pub fn zero_vector<const N: usize>() -> BlockVector<N> {
    BlockVector::<N>::zeros()
}
