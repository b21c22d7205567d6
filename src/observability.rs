//! Observability checker (spec §4.6): decides whether a math model carries
//! enough measurements for state estimation to have a unique solution,
//! before the SE solvers are ever invoked.
//!
//! The radial and meshed cases use different strategies (spec §9
//! "Observability search"):
//! - Radial: redistribute each unmeasured branch's flow from its
//!   downstream injections (always possible on a tree if every bus is
//!   otherwise covered); report the first branch that cannot be so
//!   covered.
//! - Meshed: greedily discover one spanning tree of measured edges, in
//!   priority order native-branch-sensor -> downwind-injection-implied ->
//!   any-connected-side-measurement, backtracking at most two branches deep
//!   before giving up (this crate's resolution of the spec's open
//!   question on meshed search strategy, recorded in DESIGN.md).

use std::collections::{BTreeSet, VecDeque};

use crate::error::{GridError, GridResult, ObservabilityFailure};
use crate::topology::MathTopology;

/// Per-bus/branch measurement presence, already reduced from aggregated
/// sensors (spec §4.6 step 1): a terminal counts as "measured" once at
/// least one sensor survived aggregation there.
#[derive(Debug, Clone)]
pub struct ObservabilityInput {
    pub has_voltage_phasor: Vec<bool>,
    pub has_voltage_magnitude_only: Vec<bool>,
    pub has_injection: Vec<bool>,
    /// Per math-model-branch-position, whether either end carries a power
    /// or current flow measurement.
    pub has_branch_flow: Vec<bool>,
    pub has_global_angle_current: Vec<bool>,
}

impl ObservabilityInput {
    pub fn n_voltage_phasor(&self) -> usize {
        self.has_voltage_phasor.iter().filter(|&&b| b).count()
    }
    pub fn n_injection(&self) -> usize {
        self.has_injection.iter().filter(|&&b| b).count()
    }
    pub fn n_flow(&self) -> usize {
        self.has_branch_flow.iter().filter(|&&b| b).count()
    }
}

/// Checks one math model's observability (spec §4.6).
pub fn check_observability(topo: &MathTopology, input: &ObservabilityInput) -> GridResult<()> {
    if input.n_voltage_phasor() == 0 && !input.has_voltage_magnitude_only.iter().any(|&b| b) {
        return Err(GridError::NotObservable {
            reason: ObservabilityFailure::NoVoltageSensor,
        });
    }

    if input.has_global_angle_current.iter().any(|&b| b) && input.n_voltage_phasor() == 0 {
        return Err(GridError::NotObservable {
            reason: ObservabilityFailure::MissingAngleReference,
        });
    }

    let n_phasor = input.n_voltage_phasor().max(1);
    let count = input.n_flow() + input.n_injection() + n_phasor;
    if topo.n_bus > 0 && count < topo.n_bus {
        return Err(GridError::NotObservable {
            reason: ObservabilityFailure::InsufficientCount,
        });
    }

    if topo.is_radial {
        check_radial(topo, input)
    } else {
        check_meshed(topo, input)
    }
}

/// Radial case: a branch with no direct flow sensor is still observable if
/// its flow can be recovered from the injections downstream of it (spec
/// §4.6 step 2, radial branch): walk from the slack outward and require
/// every branch to be either directly measured or have at least one
/// measured injection (or a further-measured branch) on its downstream
/// side.
fn check_radial(topo: &MathTopology, input: &ObservabilityInput) -> GridResult<()> {
    let n = topo.n_bus;
    let mut adjacency = vec![Vec::new(); n];
    for (pos, &(from, to)) in topo.branch_bus_idx.iter().enumerate() {
        if from >= 0 && to >= 0 {
            adjacency[from as usize].push((to as usize, pos));
            adjacency[to as usize].push((from as usize, pos));
        }
    }

    // BFS tree rooted at the slack; process branches from the leaves
    // inward so each branch's "downstream" subtree is fully resolved
    // before it is checked.
    let mut parent_branch = vec![None; n];
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut order = Vec::with_capacity(n);
    let mut visited = vec![false; n];
    let mut queue = VecDeque::new();
    visited[topo.slack_bus] = true;
    queue.push_back(topo.slack_bus);
    order.push(topo.slack_bus);
    while let Some(u) = queue.pop_front() {
        for &(v, branch_pos) in &adjacency[u] {
            if !visited[v] {
                visited[v] = true;
                parent_branch[v] = Some(branch_pos);
                children[u].push(v);
                order.push(v);
                queue.push_back(v);
            }
        }
    }

    let mut downstream_observed = vec![false; n];
    for &bus in order.iter().rev() {
        let mut observed = input.has_injection.get(bus).copied().unwrap_or(false);
        for &child in &children[bus] {
            observed |= downstream_observed[child];
        }
        downstream_observed[bus] = observed;
        if let Some(branch_pos) = parent_branch[bus] {
            let directly_measured = input
                .has_branch_flow
                .get(branch_pos)
                .copied()
                .unwrap_or(false);
            if !directly_measured && !observed {
                return Err(GridError::NotObservable {
                    reason: ObservabilityFailure::RadialUnmeasuredBranch,
                });
            }
        }
    }
    Ok(())
}

/// Meshed case: greedily grow a spanning tree of measured edges in
/// priority order, backtracking at most two branches deep (this crate's
/// resolution of the open meshed-search-strategy question).
fn check_meshed(topo: &MathTopology, input: &ObservabilityInput) -> GridResult<()> {
    let n = topo.n_bus;
    if n == 0 {
        return Ok(());
    }

    #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    enum Priority {
        Native = 0,
        DownwindInjection = 1,
        AnyTerminal = 2,
    }

    let mut edges: Vec<(usize, usize, Priority)> = Vec::new();
    for (pos, &(from, to)) in topo.branch_bus_idx.iter().enumerate() {
        if from < 0 || to < 0 {
            continue;
        }
        let (f, t) = (from as usize, to as usize);
        let priority = if input.has_branch_flow.get(pos).copied().unwrap_or(false) {
            Priority::Native
        } else if input.has_injection.get(f).copied().unwrap_or(false)
            || input.has_injection.get(t).copied().unwrap_or(false)
        {
            Priority::DownwindInjection
        } else {
            Priority::AnyTerminal
        };
        edges.push((f, t, priority));
    }
    edges.sort_by_key(|&(_, _, p)| p);

    if try_spanning_tree(n, &edges, 2) {
        Ok(())
    } else {
        Err(GridError::NotObservable {
            reason: ObservabilityFailure::MeshedSpanningTreeNotFound,
        })
    }
}

fn try_spanning_tree(n: usize, edges: &[(usize, usize, impl Copy)], backtrack_budget: u32) -> bool {
    fn attempt(
        n: usize,
        edges: &[(usize, usize, impl Copy)],
        index: usize,
        reached: &mut BTreeSet<usize>,
        budget: u32,
    ) -> bool {
        if reached.len() == n {
            return true;
        }
        if index == edges.len() {
            return false;
        }
        let (a, b, _) = edges[index];
        let connects_new = reached.contains(&a) ^ reached.contains(&b);
        let connects_within = reached.contains(&a) && reached.contains(&b);
        let no_nodes_yet = reached.is_empty();

        if no_nodes_yet || connects_new {
            let added = if reached.is_empty() {
                reached.insert(a);
                reached.insert(b);
                vec![a, b]
            } else if !reached.contains(&a) {
                reached.insert(a);
                vec![a]
            } else {
                reached.insert(b);
                vec![b]
            };
            if attempt(n, edges, index + 1, reached, budget) {
                return true;
            }
            for v in added {
                reached.remove(&v);
            }
        }

        if connects_within || !no_nodes_yet {
            if attempt(n, edges, index + 1, reached, budget) {
                return true;
            }
        } else if budget > 0 {
            // Skip this edge even though it would be our first; spend one
            // unit of backtracking budget to try starting elsewhere.
            if attempt(n, edges, index + 1, reached, budget - 1) {
                return true;
            }
        }
        false
    }

    let mut reached = BTreeSet::new();
    attempt(n, edges, 0, &mut reached, backtrack_budget)
}
