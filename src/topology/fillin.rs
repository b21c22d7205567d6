//! Fill-in minimization (spec §4.2 step 5, §9 "Fill-in minimization" design
//! note).
//!
//! Minimum-degree ordering is isolated behind the [`EliminationOrdering`]
//! trait so it can later be swapped for nested dissection or AMD without
//! touching the reducer (spec §9). Its output — the elimination order plus
//! the fill-in edge list — is kept as plain data (`EliminationResult`).

use std::collections::BTreeSet;

/// Result of running an elimination ordering over one connected component's
/// adjacency graph.
#[derive(Debug, Clone)]
pub struct EliminationResult {
    /// Node ids (original local indices) in elimination order; symbolic
    /// Gaussian elimination processes them in this sequence.
    pub order: Vec<usize>,
    /// Edges created as fill-in during symbolic elimination, in creation
    /// order, as unordered pairs of original local indices.
    pub fill_in: Vec<(usize, usize)>,
}

/// An elimination-ordering strategy over an undirected adjacency graph.
pub trait EliminationOrdering {
    /// `adjacency[i]` lists the neighbors of node `i`. `forced_last` are
    /// node ids that must not be eliminated until they are the only ones
    /// left (the slack bus, spec: "Orders buses so the slack bus comes last
    /// after elimination").
    fn order(&self, adjacency: &[BTreeSet<usize>], forced_last: &[usize]) -> EliminationResult;
}

/// Greedy minimum-degree ordering: repeatedly eliminates the not-yet-forced
/// node with fewest remaining neighbors, connecting all pairs of its
/// neighbors (fill-in) before removing it.
#[derive(Debug, Default, Clone, Copy)]
pub struct MinimumDegreeOrdering;

impl EliminationOrdering for MinimumDegreeOrdering {
    fn order(&self, adjacency: &[BTreeSet<usize>], forced_last: &[usize]) -> EliminationResult {
        let n = adjacency.len();
        let mut adj: Vec<BTreeSet<usize>> = adjacency.to_vec();
        let forced: BTreeSet<usize> = forced_last.iter().copied().collect();
        let mut eliminated = vec![false; n];
        let mut order = Vec::with_capacity(n);
        let mut fill_in = Vec::new();

        for _ in 0..n {
            let remaining: Vec<usize> = (0..n).filter(|&i| !eliminated[i]).collect();
            let n_remaining = remaining.len();
            // Only consider forced-last nodes once they are all that's left.
            let candidates: Vec<usize> = if remaining.iter().all(|i| forced.contains(i)) {
                remaining.clone()
            } else {
                remaining
                    .iter()
                    .copied()
                    .filter(|i| !forced.contains(i))
                    .collect()
            };
            debug_assert!(!candidates.is_empty() || n_remaining == 0);

            let pivot = *candidates
                .iter()
                .min_by_key(|&&i| adj[i].len())
                .expect("candidates is non-empty while nodes remain");

            let neighbors: Vec<usize> = adj[pivot].iter().copied().collect();
            for (a_pos, &a) in neighbors.iter().enumerate() {
                for &b in &neighbors[a_pos + 1..] {
                    if adj[a].insert(b) {
                        adj[b].insert(a);
                        fill_in.push((a.min(b), a.max(b)));
                    }
                }
            }
            for &nb in &neighbors {
                adj[nb].remove(&pivot);
            }
            adj[pivot].clear();
            eliminated[pivot] = true;
            order.push(pivot);
        }

        EliminationResult { order, fill_in }
    }
}
