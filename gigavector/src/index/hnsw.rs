//! Hierarchical navigable small-world graph index.
//!
//! The graph is an arena of nodes addressed by row index; neighbor lists are
//! `Vec<u32>` per layer, so cycles are just integers pointing at each other.
//! Insertion samples a level from a geometric distribution, descends
//! greedily to that level, then links with a bounded-width beam and the
//! diversity-preferring neighbor selection rule. Deletion tombstones the
//! node: it keeps routing traffic for connectivity but is suppressed from
//! every result. A rebuild from live rows reclaims tombstones.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::io::{Read, Write};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_derive::{Deserialize, Serialize};

use crate::distance::Distance;
use crate::error::{CResult, Error};
use crate::index::{Neighbor, ResultHeap, RowFilter, VectorIndex};
use crate::storage::store::VectorStore;

/// Graph construction and query parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HnswConfig {
    /// Out-degree cap on upper layers; layer 0 allows twice this.
    pub m: usize,

    /// Beam width while building.
    pub ef_construction: usize,

    /// Beam width while querying. Raised to `k` when `k` is larger.
    pub ef_search: usize,

    /// Tombstone fraction beyond which a delete triggers a graph rebuild
    /// from live rows.
    pub rebuild_threshold: f64,

    /// Seed for level sampling, fixed so rebuilds are reproducible.
    pub seed: u64,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self { m: 16, ef_construction: 200, ef_search: 50, rebuild_threshold: 0.5, seed: 0x9e3779b9 }
    }
}

const MAX_LEVEL: usize = 64;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Node {
    /// One adjacency list per layer, index 0 being the bottom layer.
    neighbors: Vec<Vec<u32>>,
}

impl Node {
    fn level(&self) -> usize {
        self.neighbors.len() - 1
    }
}

pub struct HnswIndex {
    dim: usize,
    metric: Distance,
    config: HnswConfig,

    /// Inverse of ln(M); scales the geometric level distribution.
    level_mult: f64,

    nodes: Vec<Option<Node>>,
    deleted: HashSet<u32>,
    entry: Option<u32>,
    top_layer: usize,
    live: usize,
    rng: StdRng,
}

/// Serialized image of the graph; the RNG is reseeded on load.
#[derive(Serialize, Deserialize)]
struct HnswState {
    dim: u32,
    metric: Distance,
    config: HnswConfig,
    nodes: Vec<Option<Node>>,
    deleted: Vec<u32>,
    entry: Option<u32>,
    top_layer: usize,
    live: usize,
}

#[derive(PartialEq)]
struct Candidate {
    distance: f32,
    id: u32,
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.distance.total_cmp(&other.distance).then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl HnswIndex {
    pub fn new(dim: usize, metric: Distance, config: HnswConfig) -> CResult<Self> {
        if dim == 0 {
            return Err(Error::InvalidInput("dimension must be at least 1".into()));
        }
        if config.m < 2 {
            return Err(Error::InvalidInput("hnsw M must be at least 2".into()));
        }
        if config.ef_construction == 0 || config.ef_search == 0 {
            return Err(Error::InvalidInput("hnsw beam widths must be at least 1".into()));
        }
        let level_mult = 1.0 / (config.m as f64).ln();
        let rng = StdRng::seed_from_u64(config.seed);
        Ok(Self {
            dim,
            metric,
            config,
            level_mult,
            nodes: Vec::new(),
            deleted: HashSet::new(),
            entry: None,
            top_layer: 0,
            live: 0,
            rng,
        })
    }

    pub fn metric(&self) -> Distance {
        self.metric
    }

    /// Fraction of graph nodes that are tombstoned; the database consults
    /// this to schedule a rebuild.
    pub fn tombstone_fraction(&self) -> f64 {
        let present = self.nodes.iter().filter(|n| n.is_some()).count();
        if present == 0 {
            return 0.0;
        }
        self.deleted.len() as f64 / present as f64
    }

    fn check_query(&self, query: &[f32]) -> CResult<()> {
        if query.len() != self.dim {
            return Err(Error::InvalidInput(format!(
                "query dimension {} does not match index dimension {}",
                query.len(),
                self.dim
            )));
        }
        Ok(())
    }

    fn sample_level(&mut self) -> usize {
        let uniform: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        ((-uniform.ln() * self.level_mult) as usize).min(MAX_LEVEL)
    }

    /// Degree cap per layer: 2M on the bottom layer, M above.
    fn max_conn(&self, layer: usize) -> usize {
        if layer == 0 {
            self.config.m * 2
        } else {
            self.config.m
        }
    }

    fn distance(&self, metric: Distance, store: &VectorStore, query: &[f32], id: u32) -> f32 {
        metric.compute(query, store.raw(id as u64))
    }

    fn node(&self, id: u32) -> &Node {
        self.nodes[id as usize].as_ref().expect("dangling graph edge")
    }

    /// One greedy step chain on a single layer: walks to the neighbor
    /// closest to the query until no neighbor improves.
    fn greedy_closest(
        &self,
        metric: Distance,
        store: &VectorStore,
        query: &[f32],
        mut ep: u32,
        layer: usize,
    ) -> u32 {
        let mut best = self.distance(metric, store, query, ep);
        loop {
            let mut improved = false;
            for &n in &self.node(ep).neighbors[layer] {
                let d = self.distance(metric, store, query, n);
                if d < best {
                    best = d;
                    ep = n;
                    improved = true;
                }
            }
            if !improved {
                return ep;
            }
        }
    }

    /// Bounded beam search on one layer. Tombstoned nodes are traversed for
    /// connectivity; `admit` gates entry to the result heap only.
    fn search_layer(
        &self,
        metric: Distance,
        store: &VectorStore,
        query: &[f32],
        entry: u32,
        ef: usize,
        layer: usize,
        admit: Option<&dyn Fn(u32) -> bool>,
    ) -> Vec<Candidate> {
        let admits = |id: u32| admit.map_or(true, |f| f(id));

        let mut visited: HashSet<u32> = HashSet::new();
        visited.insert(entry);

        let d0 = self.distance(metric, store, query, entry);
        // Min-heap of nodes to expand, max-heap of admitted results.
        let mut frontier: BinaryHeap<Reverse<Candidate>> = BinaryHeap::new();
        frontier.push(Reverse(Candidate { distance: d0, id: entry }));
        let mut results: BinaryHeap<Candidate> = BinaryHeap::new();
        if admits(entry) {
            results.push(Candidate { distance: d0, id: entry });
        }

        while let Some(Reverse(current)) = frontier.pop() {
            if results.len() >= ef {
                if let Some(worst) = results.peek() {
                    if current.distance > worst.distance {
                        break;
                    }
                }
            }
            for &n in &self.node(current.id).neighbors[layer] {
                if !visited.insert(n) {
                    continue;
                }
                let d = self.distance(metric, store, query, n);
                let within = results.len() < ef
                    || results.peek().map_or(true, |worst| d < worst.distance);
                if within {
                    frontier.push(Reverse(Candidate { distance: d, id: n }));
                    if admits(n) {
                        results.push(Candidate { distance: d, id: n });
                        if results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }
        }

        let mut out = results.into_vec();
        out.sort();
        out
    }

    /// The standard diversity heuristic: a candidate is kept only if it is
    /// closer to the query than to every already-selected neighbor.
    /// Remaining slots are filled with the closest rejected candidates.
    fn select_neighbors(
        &self,
        metric: Distance,
        store: &VectorStore,
        candidates: &[Candidate],
        m: usize,
    ) -> Vec<u32> {
        let mut selected: Vec<u32> = Vec::with_capacity(m);
        let mut rejected: Vec<u32> = Vec::new();
        for c in candidates {
            if selected.len() >= m {
                break;
            }
            let c_vec = store.raw(c.id as u64);
            let diverse = selected.iter().all(|&s| {
                metric.compute(c_vec, store.raw(s as u64)) >= c.distance
            });
            if diverse {
                selected.push(c.id);
            } else {
                rejected.push(c.id);
            }
        }
        for id in rejected {
            if selected.len() >= m {
                break;
            }
            selected.push(id);
        }
        selected
    }

    /// Links a node into every layer up to its level, pruning any neighbor
    /// that overflows its degree cap.
    fn link_node(&mut self, store: &VectorStore, id: u32, level: usize) -> CResult<()> {
        let query = store.raw(id as u64).to_vec();
        let entry = match self.entry {
            Some(e) if e != id => e,
            _ => {
                // The node being (re)linked is the entry itself, or the
                // graph is empty. Hand the entry role to another node so the
                // link search has somewhere to start; a singleton just takes
                // the role.
                let other = self
                    .nodes
                    .iter()
                    .enumerate()
                    .find(|(i, node)| *i != id as usize && node.is_some())
                    .map(|(i, _)| i as u32);
                match other {
                    Some(e) => {
                        self.entry = Some(e);
                        self.top_layer = self.node(e).level();
                        e
                    }
                    None => {
                        self.entry = Some(id);
                        self.top_layer = level;
                        return Ok(());
                    }
                }
            }
        };

        let mut ep = entry;
        let mut layer = self.top_layer;
        // Greedy descent through layers above the node's level.
        while layer > level {
            ep = self.greedy_closest(self.metric, store, &query, ep, layer);
            layer -= 1;
        }

        // Beam-link on each shared layer from the top down.
        let mut layer = level.min(self.top_layer) as isize;
        while layer >= 0 {
            let l = layer as usize;
            let mut candidates = self.search_layer(
                self.metric,
                store,
                &query,
                ep,
                self.config.ef_construction,
                l,
                None,
            );
            // A relinked node can reach itself through stale reverse edges.
            candidates.retain(|c| c.id != id);
            let m = self.max_conn(l);
            let selected = self.select_neighbors(self.metric, store, &candidates, m);

            for &n in &selected {
                self.nodes[id as usize].as_mut().expect("node exists").neighbors[l].push(n);
                let peer = self.nodes[n as usize].as_mut().expect("dangling graph edge");
                peer.neighbors[l].push(id);
            }
            // Enforce the degree cap on every touched peer.
            for &n in &selected {
                if self.node(n).neighbors[l].len() > m {
                    self.prune_neighbors(store, n, l, m);
                }
            }

            if let Some(best) = candidates.first() {
                ep = best.id;
            }
            layer -= 1;
        }

        if level > self.top_layer {
            self.entry = Some(id);
            self.top_layer = level;
        }
        Ok(())
    }

    /// Re-selects a node's neighbor list down to the cap.
    fn prune_neighbors(&mut self, store: &VectorStore, id: u32, layer: usize, m: usize) {
        let own = store.raw(id as u64);
        let mut candidates: Vec<Candidate> = self.node(id).neighbors[layer]
            .iter()
            .map(|&n| Candidate { distance: self.metric.compute(own, store.raw(n as u64)), id: n })
            .collect();
        candidates.sort();
        candidates.dedup_by_key(|c| c.id);
        let selected = self.select_neighbors(self.metric, store, &candidates, m);
        self.nodes[id as usize].as_mut().expect("node exists").neighbors[layer] = selected;
    }

    /// Search with an explicit beam width, letting the query planner widen
    /// or narrow the default.
    pub fn search_with_ef(
        &self,
        store: &VectorStore,
        query: &[f32],
        k: usize,
        metric: Distance,
        ef: usize,
        filter: Option<&RowFilter>,
    ) -> CResult<Vec<Neighbor>> {
        self.check_query(query)?;
        let entry = match self.entry {
            Some(e) => e,
            None => return Ok(Vec::new()),
        };

        let mut ep = entry;
        for layer in (1..=self.top_layer).rev() {
            ep = self.greedy_closest(metric, store, query, ep, layer);
        }

        let ef = ef.max(k).max(1);
        let admit = |id: u32| {
            !self.deleted.contains(&id)
                && !store.is_deleted(id as u64)
                && filter.map_or(true, |f| f(id as u64))
        };
        let candidates = self.search_layer(metric, store, query, ep, ef, 0, Some(&admit));

        let mut heap = ResultHeap::new(k);
        for c in candidates {
            heap.push(c.id as u64, c.distance);
        }
        Ok(heap.into_sorted())
    }

    pub fn load(r: &mut dyn Read, dim: usize) -> CResult<Self> {
        let state: HnswState = bincode::deserialize_from(r)?;
        if state.dim as usize != dim {
            return Err(Error::Corrupted(format!(
                "hnsw index dimension {} does not match database dimension {}",
                state.dim, dim
            )));
        }
        let mut index = Self::new(dim, state.metric, state.config)?;
        index.nodes = state.nodes;
        index.deleted = state.deleted.into_iter().collect();
        index.entry = state.entry;
        index.top_layer = state.top_layer;
        index.live = state.live;
        Ok(index)
    }
}

impl VectorIndex for HnswIndex {
    fn insert(&mut self, store: &VectorStore, row: u64) -> CResult<()> {
        if store.dim() != self.dim {
            return Err(Error::InvalidInput("store dimension mismatch".into()));
        }
        let idx = row as usize;
        if idx >= self.nodes.len() {
            self.nodes.resize_with(idx + 1, || None);
        }
        if self.nodes[idx].is_some() {
            return Err(Error::InvalidInput(format!("row {} already indexed", row)));
        }
        let level = self.sample_level();
        self.nodes[idx] = Some(Node { neighbors: vec![Vec::new(); level + 1] });
        self.live += 1;
        self.link_node(store, row as u32, level)
    }

    fn remove(&mut self, row: u64) -> CResult<()> {
        let id = row as u32;
        match self.nodes.get(row as usize) {
            Some(Some(_)) => {}
            _ => return Err(Error::NotFound(format!("row {} not in index", row))),
        }
        if !self.deleted.insert(id) {
            return Err(Error::NotFound(format!("row {} already removed", row)));
        }
        self.live -= 1;
        Ok(())
    }

    fn update(&mut self, store: &VectorStore, row: u64) -> CResult<()> {
        let idx = row as usize;
        let level = match self.nodes.get(idx) {
            Some(Some(node)) => node.level(),
            _ => return Err(Error::NotFound(format!("row {} not in index", row))),
        };
        // Drop the node's own adjacency and re-link against the new vector.
        // Stale reverse edges from peers remain valid graph edges.
        self.nodes[idx] = Some(Node { neighbors: vec![Vec::new(); level + 1] });
        self.link_node(store, row as u32, level)
    }

    fn search(
        &self,
        store: &VectorStore,
        query: &[f32],
        k: usize,
        metric: Distance,
        filter: Option<&RowFilter>,
    ) -> CResult<Vec<Neighbor>> {
        self.search_with_ef(store, query, k, metric, self.config.ef_search, filter)
    }

    fn range_search(
        &self,
        store: &VectorStore,
        query: &[f32],
        radius: f32,
        metric: Distance,
        filter: Option<&RowFilter>,
    ) -> CResult<Vec<Neighbor>> {
        self.check_query(query)?;
        let entry = match self.entry {
            Some(e) => e,
            None => return Ok(Vec::new()),
        };

        let mut ep = entry;
        for layer in (1..=self.top_layer).rev() {
            ep = self.greedy_closest(metric, store, query, ep, layer);
        }

        let ef = self.config.ef_search.max(64);
        let admit = |id: u32| {
            !self.deleted.contains(&id)
                && !store.is_deleted(id as u64)
                && filter.map_or(true, |f| f(id as u64))
        };
        let candidates = self.search_layer(metric, store, query, ep, ef, 0, Some(&admit));

        let mut out: Vec<Neighbor> = candidates
            .into_iter()
            .filter(|c| c.distance <= radius)
            .map(|c| Neighbor { row: c.id as u64, distance: c.distance })
            .collect();
        out.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.row.cmp(&b.row)));
        Ok(out)
    }

    fn len(&self) -> usize {
        self.live
    }

    fn rebuild(&mut self, store: &VectorStore) -> CResult<()> {
        log::info!(
            "rebuilding hnsw graph, dropping {} tombstoned of {} nodes",
            self.deleted.len(),
            self.nodes.iter().filter(|n| n.is_some()).count()
        );
        self.nodes.clear();
        self.deleted.clear();
        self.entry = None;
        self.top_layer = 0;
        self.live = 0;
        for row in store.live_indices() {
            self.insert(store, row)?;
        }
        Ok(())
    }

    fn save(&self, w: &mut dyn Write) -> CResult<()> {
        let state = HnswState {
            dim: self.dim as u32,
            metric: self.metric,
            config: self.config.clone(),
            nodes: self.nodes.clone(),
            deleted: self.deleted.iter().copied().collect(),
            entry: self.entry,
            top_layer: self.top_layer,
            live: self.live,
        };
        bincode::serialize_into(w, &state)?;
        Ok(())
    }
}
