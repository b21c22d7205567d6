//! Topology reducer (spec §4.2): fuses the raw component graph into one
//! [`MathTopology`] per connected, energized sub-network, together with the
//! bidirectional [`TopoCoupling`] that lets callers map every component back
//! to its position in that sub-network (or `(-1, -1)` if it was discarded).

use std::collections::{BTreeSet, HashMap};

use crate::component_model::SensorTerminal;
use crate::grouped_index::GroupedIndex;
use crate::topology::fillin::{EliminationOrdering, MinimumDegreeOrdering};
use crate::topology::input::{ComponentConnection, ComponentTopology};
use crate::types::{Idx, NONE_IDX};

/// Where a math-model branch position originated from: a user branch, or
/// one arm of an expanded three-winding transformer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchRef {
    Branch(usize),
    Branch3Arm(usize, u8),
}

/// One connected, energized sub-network, ready for Y-bus assembly and the
/// math solvers (spec §3 `MathTopology`).
#[derive(Debug, Clone)]
pub struct MathTopology {
    pub n_bus: usize,
    pub slack_bus: usize,
    /// `(from, to)` bus indices per math-model branch position, `-1` where
    /// that end's switch is open.
    pub branch_bus_idx: Vec<(Idx, Idx)>,
    /// Per-bus accumulated signed phase shift relative to the slack.
    pub phase_shift: Vec<f64>,

    pub sources_per_bus: GroupedIndex,
    pub load_gens_per_bus: GroupedIndex,
    pub shunts_per_bus: GroupedIndex,
    /// Node-terminal sensors (voltage and bus-injection sensors alike; the
    /// measured-value aggregator distinguishes them by the caller-supplied
    /// sensor's concrete kind, not by anything stored here).
    pub sensors_per_bus: GroupedIndex,
    /// Branch-terminal sensors, `2*k` = from-end of branch `k`, `2*k+1` =
    /// to-end.
    pub sensors_per_branch: GroupedIndex,
    pub sensors_per_source: GroupedIndex,
    pub sensors_per_shunt: GroupedIndex,
    pub sensors_per_load_gen: GroupedIndex,

    /// Fill-in edges added during elimination, as `(bus_a, bus_b)` pairs.
    pub fill_in: Vec<(usize, usize)>,
    pub is_radial: bool,

    pub source_ref: Vec<Idx>,
    pub shunt_ref: Vec<Idx>,
    pub load_gen_ref: Vec<Idx>,
    pub branch_ref: Vec<BranchRef>,
    pub sensor_ref_bus: Vec<Idx>,
    pub sensor_ref_branch: Vec<Idx>,
    pub sensor_ref_source: Vec<Idx>,
    pub sensor_ref_shunt: Vec<Idx>,
    pub sensor_ref_load_gen: Vec<Idx>,
}

/// `(group, pos)` coupling for every component; `(-1, -1)` if discarded as
/// unenergized (spec §3 `TopoCoupling`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Coupling {
    pub group: Idx,
    pub pos: Idx,
}

impl Coupling {
    const NONE: Coupling = Coupling {
        group: NONE_IDX,
        pos: NONE_IDX,
    };
}

/// Branch3 couples to a virtual node plus three arm "branches" (spec §3
/// `TopoCoupling`).
#[derive(Debug, Clone, Copy, Default)]
pub struct Branch3Coupling {
    pub virtual_node: Coupling,
    pub arms: [Coupling; 3],
}

/// Component -> math-model coupling (spec §3 `TopoCoupling`).
#[derive(Debug, Clone, Default)]
pub struct TopoCoupling {
    pub node: Vec<Coupling>,
    pub branch: Vec<Coupling>,
    pub branch3: Vec<Branch3Coupling>,
    pub source: Vec<Coupling>,
    pub shunt: Vec<Coupling>,
    pub load_gen: Vec<Coupling>,
    pub sensor: Vec<Coupling>,
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }
    fn find(&mut self, x: usize) -> usize {
        if self.parent[x] != x {
            self.parent[x] = self.find(self.parent[x]);
        }
        self.parent[x]
    }
    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[ra] = rb;
        }
    }
}

struct ExpandedBranch {
    from: Idx,
    to: Idx,
    status_from: bool,
    status_to: bool,
    phase_shift: f64,
    origin: BranchRef,
}

/// Builds one [`MathTopology`] per energized connected sub-network, plus the
/// [`TopoCoupling`] mapping every component back into its model.
pub fn build_topology(
    topo: &ComponentTopology,
    conn: &ComponentConnection,
) -> (Vec<MathTopology>, TopoCoupling) {
    // Step 1: expand branch3 into a virtual node plus three arm branches.
    let n_virtual = topo.n_branch3();
    let total_nodes = topo.n_node + n_virtual;
    let virtual_of = |k: usize| (topo.n_node + k) as Idx;

    let mut expanded: Vec<ExpandedBranch> = Vec::with_capacity(topo.n_branch() + 3 * n_virtual);
    for (i, ends) in topo.branch.iter().enumerate() {
        let st = conn.branch_status[i];
        expanded.push(ExpandedBranch {
            from: ends[0],
            to: ends[1],
            status_from: st[0],
            status_to: st[1],
            phase_shift: conn.branch_phase_shift[i],
            origin: BranchRef::Branch(i),
        });
    }
    for (k, ends) in topo.branch3.iter().enumerate() {
        let vnode = virtual_of(k);
        let st = conn.branch3_status[k];
        let ps = conn.branch3_phase_shift[k];
        for arm in 0..3usize {
            expanded.push(ExpandedBranch {
                from: ends[arm],
                to: vnode,
                status_from: st[arm],
                status_to: true,
                phase_shift: ps[arm],
                origin: BranchRef::Branch3Arm(k, arm as u8),
            });
        }
    }

    // Step 2: union-find rigid identification via closed links.
    let mut uf = UnionFind::new(total_nodes);
    for (j, ends) in topo.link.iter().enumerate() {
        let st = conn.link_status[j];
        if st[0] && st[1] {
            uf.union(ends[0] as usize, ends[1] as usize);
        }
    }

    // Closed-branch adjacency over union-find representatives.
    let mut adjacency: HashMap<usize, BTreeSet<usize>> = HashMap::new();
    // (repr_a, repr_b) -> chosen signed phase shift a->b, first one wins.
    let mut edge_phase_shift: HashMap<(usize, usize), f64> = HashMap::new();
    for eb in &expanded {
        if eb.status_from && eb.status_to {
            let a = uf.find(eb.from as usize);
            let b = uf.find(eb.to as usize);
            if a != b {
                adjacency.entry(a).or_default().insert(b);
                adjacency.entry(b).or_default().insert(a);
                edge_phase_shift.entry((a, b)).or_insert(eb.phase_shift);
                edge_phase_shift.entry((b, a)).or_insert(-eb.phase_shift);
            }
        }
    }

    // Step 2 continued: connected components via a second union-find over
    // representatives.
    let mut comp_uf = UnionFind::new(total_nodes);
    for (&a, neighbors) in &adjacency {
        for &b in neighbors {
            comp_uf.union(a, b);
        }
    }

    // Step 3: which components are energized (host >= 1 active source).
    let mut component_has_source: HashMap<usize, Vec<usize>> = HashMap::new();
    for (s, &node) in topo.source_node.iter().enumerate() {
        if conn.source_active[s] {
            let root = comp_uf.find(uf.find(node as usize));
            component_has_source.entry(root).or_default().push(s);
        }
    }

    // Deterministic group ordering: by the smallest active-source index in
    // each component.
    let mut components: Vec<(usize, Vec<usize>)> = component_has_source.into_iter().collect();
    components.sort_by_key(|(_, sources)| *sources.iter().min().unwrap());

    let mut root_to_group: HashMap<usize, usize> = HashMap::new();
    for (g, (root, _)) in components.iter().enumerate() {
        root_to_group.insert(*root, g);
    }

    // Step 4: per-model bus numbering via fill-in-minimizing elimination,
    // slack forced last.
    let mut models = Vec::with_capacity(components.len());
    // repr node id -> (group, local bus index)
    let mut repr_to_bus: HashMap<usize, (usize, usize)> = HashMap::new();

    for (group, (root, sources)) in components.iter().enumerate() {
        // All representative node ids belonging to this component.
        let mut repr_nodes: Vec<usize> = (0..total_nodes)
            .map(|n| comp_uf.find(uf.find(n)))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter(|&r| r == *root)
            .collect();
        repr_nodes.sort_unstable();
        let n_local = repr_nodes.len();
        let local_of: HashMap<usize, usize> = repr_nodes
            .iter()
            .enumerate()
            .map(|(i, &r)| (r, i))
            .collect();

        let mut local_adj = vec![BTreeSet::new(); n_local];
        let mut n_edges = 0usize;
        let mut seen_edges: BTreeSet<(usize, usize)> = BTreeSet::new();
        for (&a, neighbors) in &adjacency {
            if local_of.contains_key(&a) {
                for &b in neighbors {
                    if let Some(&lb) = local_of.get(&b) {
                        let la = local_of[&a];
                        local_adj[la].insert(lb);
                        local_adj[lb].insert(la);
                        let key = (la.min(lb), la.max(lb));
                        if seen_edges.insert(key) {
                            n_edges += 1;
                        }
                    }
                }
            }
        }

        // Slack: the node hosting the smallest-indexed active source.
        let slack_source = *sources.iter().min().unwrap();
        let slack_repr = comp_uf.find(uf.find(topo.source_node[slack_source] as usize));
        let slack_local = local_of[&slack_repr];

        let ordering = MinimumDegreeOrdering.order(&local_adj, &[slack_local]);
        // Final bus id = position in elimination order.
        let mut bus_of_local = vec![0usize; n_local];
        for (bus_id, &local) in ordering.order.iter().enumerate() {
            bus_of_local[local] = bus_id;
        }
        let slack_bus = bus_of_local[slack_local];
        debug_assert_eq!(slack_bus, n_local - 1);

        for (&r, &l) in &local_of {
            repr_to_bus.insert(r, (group, bus_of_local[l]));
        }

        let is_radial = n_edges == n_local.saturating_sub(1);

        // Phase-shift accumulation via BFS spanning tree from the slack.
        let mut phase_shift = vec![0.0f64; n_local];
        let mut visited = vec![false; n_local];
        let mut queue = std::collections::VecDeque::new();
        visited[slack_local] = true;
        queue.push_back(slack_local);
        while let Some(u) = queue.pop_front() {
            for &v in &local_adj[u] {
                if !visited[v] {
                    visited[v] = true;
                    let w = edge_phase_shift
                        .get(&(repr_nodes[u], repr_nodes[v]))
                        .copied()
                        .unwrap_or(0.0);
                    phase_shift[v] = phase_shift[u] + w;
                    queue.push_back(v);
                }
            }
        }
        // Reindex phase_shift by final bus id.
        let mut phase_shift_by_bus = vec![0.0f64; n_local];
        for (local, &bus_id) in bus_of_local.iter().enumerate() {
            phase_shift_by_bus[bus_id] = phase_shift[local];
        }

        let fill_in = ordering
            .fill_in
            .iter()
            .map(|&(a, b)| (bus_of_local[a], bus_of_local[b]))
            .collect();

        models.push(MathTopologyBuilder {
            n_bus: n_local,
            slack_bus,
            phase_shift: phase_shift_by_bus,
            fill_in,
            is_radial,
            branch_bus_idx: Vec::new(),
            branch_ref: Vec::new(),
            source_ref: Vec::new(),
            shunt_ref: Vec::new(),
            load_gen_ref: Vec::new(),
            source_tags: Vec::new(),
            shunt_tags: Vec::new(),
            load_gen_tags: Vec::new(),
            sensor_bus_tags: Vec::new(),
            sensor_ref_bus: Vec::new(),
            sensor_branch_tags: Vec::new(),
            sensor_ref_branch: Vec::new(),
            sensor_source_tags: Vec::new(),
            sensor_ref_source: Vec::new(),
            sensor_shunt_tags: Vec::new(),
            sensor_ref_shunt: Vec::new(),
            sensor_load_gen_tags: Vec::new(),
            sensor_ref_load_gen: Vec::new(),
        });
    }

    // Helper: map a raw node id to its (group, bus) if energized.
    let node_bus = |node: Idx| -> Option<(usize, usize)> {
        let repr = comp_uf.find(uf.find(node as usize));
        repr_to_bus.get(&repr).copied()
    };

    // Step 7 (emit): node coupling.
    let mut node_coupling = vec![Coupling::NONE; topo.n_node];
    for (n, slot) in node_coupling.iter_mut().enumerate() {
        if let Some((g, b)) = node_bus(n as Idx) {
            *slot = Coupling {
                group: g as Idx,
                pos: b as Idx,
            };
        }
    }

    // Branch couplings (original branches only; branch3 arms handled below).
    let mut branch_coupling = vec![Coupling::NONE; topo.n_branch()];
    let mut branch3_coupling = vec![Branch3Coupling::default(); topo.n_branch3()];

    for eb in &expanded {
        let from_bus = if eb.status_from { node_bus(eb.from) } else { None };
        let to_bus = if eb.status_to { node_bus(eb.to) } else { None };
        let group = from_bus.or(to_bus).map(|(g, _)| g);
        let Some(group) = group else {
            continue; // both ends open or unenergized
        };
        let from_idx = from_bus.map(|(_, b)| b as Idx).unwrap_or(NONE_IDX);
        let to_idx = to_bus.map(|(_, b)| b as Idx).unwrap_or(NONE_IDX);
        let pos = models[group].branch_bus_idx.len();
        models[group].branch_bus_idx.push((from_idx, to_idx));
        models[group].branch_ref.push(eb.origin);
        let coupling = Coupling {
            group: group as Idx,
            pos: pos as Idx,
        };
        match eb.origin {
            BranchRef::Branch(i) => branch_coupling[i] = coupling,
            BranchRef::Branch3Arm(k, arm) => branch3_coupling[k].arms[arm as usize] = coupling,
        }
    }
    for (k, ends) in topo.branch3.iter().enumerate() {
        // Virtual node coupling follows its own node's energization.
        let vnode = virtual_of(k);
        let _ = ends; // terminals already consumed via arms
        if let Some((g, b)) = node_bus(vnode) {
            branch3_coupling[k].virtual_node = Coupling {
                group: g as Idx,
                pos: b as Idx,
            };
        }
    }

    // Appliances (source/shunt/load_gen) grouped per bus.
    let mut source_coupling = vec![Coupling::NONE; topo.n_source()];
    for (i, &node) in topo.source_node.iter().enumerate() {
        if let Some((g, b)) = node_bus(node) {
            let pos = models[g].source_ref.len();
            models[g].source_ref.push(i as Idx);
            models[g].source_tags.push(b);
            source_coupling[i] = Coupling {
                group: g as Idx,
                pos: pos as Idx,
            };
        }
    }
    let mut shunt_coupling = vec![Coupling::NONE; topo.n_shunt()];
    for (i, &node) in topo.shunt_node.iter().enumerate() {
        if let Some((g, b)) = node_bus(node) {
            let pos = models[g].shunt_ref.len();
            models[g].shunt_ref.push(i as Idx);
            models[g].shunt_tags.push(b);
            shunt_coupling[i] = Coupling {
                group: g as Idx,
                pos: pos as Idx,
            };
        }
    }
    let mut load_gen_coupling = vec![Coupling::NONE; topo.n_load_gen()];
    for (i, &node) in topo.load_gen_node.iter().enumerate() {
        if let Some((g, b)) = node_bus(node) {
            let pos = models[g].load_gen_ref.len();
            models[g].load_gen_ref.push(i as Idx);
            models[g].load_gen_tags.push(b);
            load_gen_coupling[i] = Coupling {
                group: g as Idx,
                pos: pos as Idx,
            };
        }
    }

    // Sensors: attach to whichever per-kind grouped index matches the
    // sensor's terminal.
    let mut sensor_coupling = vec![Coupling::NONE; topo.n_sensor()];
    for (i, (&object, &terminal)) in topo
        .sensor_object
        .iter()
        .zip(topo.sensor_terminal.iter())
        .enumerate()
    {
        let object = object as usize;
        let assigned = match terminal {
            SensorTerminal::Node => node_bus(object as Idx).map(|(g, b)| (g, b, "node")),
            SensorTerminal::BranchFrom | SensorTerminal::BranchTo => {
                branch_coupling.get(object).and_then(|c| {
                    if c.group == NONE_IDX {
                        None
                    } else {
                        let end = if terminal == SensorTerminal::BranchFrom { 0 } else { 1 };
                        let tag = (c.pos as usize) * 2 + end;
                        Some((c.group as usize, tag, "branch"))
                    }
                })
            }
            SensorTerminal::Source => source_coupling.get(object).and_then(|c| {
                (c.group != NONE_IDX).then_some((c.group as usize, c.pos as usize, "source"))
            }),
            SensorTerminal::Shunt => shunt_coupling.get(object).and_then(|c| {
                (c.group != NONE_IDX).then_some((c.group as usize, c.pos as usize, "shunt"))
            }),
            SensorTerminal::LoadGen => load_gen_coupling.get(object).and_then(|c| {
                (c.group != NONE_IDX).then_some((c.group as usize, c.pos as usize, "load_gen"))
            }),
        };
        let Some((g, tag, kind)) = assigned else {
            continue;
        };
        let pos = match kind {
            "node" => {
                let pos = models[g].sensor_ref_bus.len();
                models[g].sensor_ref_bus.push(i as Idx);
                models[g].sensor_bus_tags.push(tag);
                pos
            }
            "branch" => {
                let pos = models[g].sensor_ref_branch.len();
                models[g].sensor_ref_branch.push(i as Idx);
                models[g].sensor_branch_tags.push(tag);
                pos
            }
            "source" => {
                let pos = models[g].sensor_ref_source.len();
                models[g].sensor_ref_source.push(i as Idx);
                models[g].sensor_source_tags.push(tag);
                pos
            }
            "shunt" => {
                let pos = models[g].sensor_ref_shunt.len();
                models[g].sensor_ref_shunt.push(i as Idx);
                models[g].sensor_shunt_tags.push(tag);
                pos
            }
            "load_gen" => {
                let pos = models[g].sensor_ref_load_gen.len();
                models[g].sensor_ref_load_gen.push(i as Idx);
                models[g].sensor_load_gen_tags.push(tag);
                pos
            }
            _ => unreachable!(),
        };
        sensor_coupling[i] = Coupling {
            group: g as Idx,
            pos: pos as Idx,
        };
    }

    let math_topologies = models.into_iter().map(|b| b.finish()).collect();

    let coupling = TopoCoupling {
        node: node_coupling,
        branch: branch_coupling,
        branch3: branch3_coupling,
        source: source_coupling,
        shunt: shunt_coupling,
        load_gen: load_gen_coupling,
        sensor: sensor_coupling,
    };

    (math_topologies, coupling)
}

/// Sortable-append scratch state for one math model while the reducer walks
/// the component lists; consumed by [`MathTopologyBuilder::finish`] into the
/// sorted grouped indices the spec's `MathTopology` table calls for.
struct MathTopologyBuilder {
    n_bus: usize,
    slack_bus: usize,
    phase_shift: Vec<f64>,
    fill_in: Vec<(usize, usize)>,
    is_radial: bool,
    branch_bus_idx: Vec<(Idx, Idx)>,
    branch_ref: Vec<BranchRef>,
    source_ref: Vec<Idx>,
    shunt_ref: Vec<Idx>,
    load_gen_ref: Vec<Idx>,
    source_tags: Vec<usize>,
    shunt_tags: Vec<usize>,
    load_gen_tags: Vec<usize>,
    sensor_bus_tags: Vec<usize>,
    sensor_ref_bus: Vec<Idx>,
    sensor_branch_tags: Vec<usize>,
    sensor_ref_branch: Vec<Idx>,
    sensor_source_tags: Vec<usize>,
    sensor_ref_source: Vec<Idx>,
    sensor_shunt_tags: Vec<usize>,
    sensor_ref_shunt: Vec<Idx>,
    sensor_load_gen_tags: Vec<usize>,
    sensor_ref_load_gen: Vec<Idx>,
}

/// Sorts `(tag, ref)` pairs by tag (stable) and returns the sorted tags plus
/// the permuted ref array, ready for `GroupedIndex::from_tags`.
fn sort_by_tag(tags: Vec<usize>, refs: Vec<Idx>) -> (Vec<usize>, Vec<Idx>) {
    let mut paired: Vec<(usize, Idx)> = tags.into_iter().zip(refs).collect();
    paired.sort_by_key(|(t, _)| *t);
    paired.into_iter().unzip()
}

impl MathTopologyBuilder {
    fn finish(self) -> MathTopology {
        let n_bus = self.n_bus;
        let n_branch = self.branch_bus_idx.len();

        let (source_tags, source_ref) = sort_by_tag(self.source_tags, self.source_ref);
        let (shunt_tags, shunt_ref) = sort_by_tag(self.shunt_tags, self.shunt_ref);
        let (load_gen_tags, load_gen_ref) = sort_by_tag(self.load_gen_tags, self.load_gen_ref);
        let (sensor_bus_tags, sensor_ref_bus) =
            sort_by_tag(self.sensor_bus_tags, self.sensor_ref_bus);
        let (sensor_branch_tags, sensor_ref_branch) =
            sort_by_tag(self.sensor_branch_tags, self.sensor_ref_branch);
        let (sensor_source_tags, sensor_ref_source) =
            sort_by_tag(self.sensor_source_tags, self.sensor_ref_source);
        let (sensor_shunt_tags, sensor_ref_shunt) =
            sort_by_tag(self.sensor_shunt_tags, self.sensor_ref_shunt);
        let (sensor_load_gen_tags, sensor_ref_load_gen) =
            sort_by_tag(self.sensor_load_gen_tags, self.sensor_ref_load_gen);

        MathTopology {
            n_bus,
            slack_bus: self.slack_bus,
            branch_bus_idx: self.branch_bus_idx,
            phase_shift: self.phase_shift,
            sources_per_bus: GroupedIndex::from_tags(source_tags, n_bus),
            load_gens_per_bus: GroupedIndex::from_tags(load_gen_tags, n_bus),
            shunts_per_bus: GroupedIndex::from_tags(shunt_tags, n_bus),
            sensors_per_bus: GroupedIndex::from_tags(sensor_bus_tags, n_bus),
            sensors_per_branch: GroupedIndex::from_tags(sensor_branch_tags, 2 * n_branch.max(1)),
            sensors_per_source: GroupedIndex::from_tags(sensor_source_tags, source_ref.len().max(1)),
            sensors_per_shunt: GroupedIndex::from_tags(sensor_shunt_tags, shunt_ref.len().max(1)),
            sensors_per_load_gen: GroupedIndex::from_tags(
                sensor_load_gen_tags,
                load_gen_ref.len().max(1),
            ),
            fill_in: self.fill_in,
            is_radial: self.is_radial,
            source_ref,
            shunt_ref,
            load_gen_ref,
            branch_ref: self.branch_ref,
            sensor_ref_bus,
            sensor_ref_branch,
            sensor_ref_source,
            sensor_ref_shunt,
            sensor_ref_load_gen,
        }
    }
}
