//! Semantic index: HNSW graph over frame summary vectors.
//!
//! Writers never touch the published graph. New vectors land in a pending
//! buffer that searches scan linearly, so a write is visible immediately.
//! `converge()` folds the buffer into a copy of the graph and publishes the
//! copy with an `Arc` swap; readers holding the old graph keep using it.
//!
//! Vectors are stored L2-normalized, so similarity is a dot product.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::config::IndexConfig;
use crate::frame::{l2_normalize, FrameId, SLOT_DIM};
use crate::storage::bloom::mix64;

const MAX_LEVEL: usize = 16;
const LEVEL_SALT: u64 = 0xA076_1D64_78BD_642F;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HnswParams {
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
}

impl From<&IndexConfig> for HnswParams {
    fn from(c: &IndexConfig) -> Self {
        Self {
            m: c.m.max(2),
            ef_construction: c.ef_construction.max(1),
            ef_search: c.ef_search.max(1),
        }
    }
}

fn dot(a: &[f32; SLOT_DIM], b: &[f32; SLOT_DIM]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Scored {
    sim: f32,
    node: u32,
}

impl Eq for Scored {}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sim
            .total_cmp(&other.sim)
            .then_with(|| other.node.cmp(&self.node))
    }
}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
struct Node {
    id: FrameId,
    vector: Arc<[f32; SLOT_DIM]>,
    /// Neighbour lists, one per layer the node lives on.
    links: Vec<Vec<u32>>,
}

// ── Graph ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HnswGraph {
    params: HnswParams,
    nodes: Vec<Node>,
    by_id: HashMap<FrameId, u32>,
    /// Superseded or removed nodes: still traversed, never returned.
    deleted: HashSet<u32>,
    entry: Option<u32>,
    max_level: usize,
}

impl HnswGraph {
    pub fn new(params: HnswParams) -> Self {
        Self {
            params,
            nodes: Vec::new(),
            by_id: HashMap::new(),
            deleted: HashSet::new(),
            entry: None,
            max_level: 0,
        }
    }

    /// Live vectors.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn deleted_count(&self) -> usize {
        self.deleted.len()
    }

    pub fn contains(&self, id: FrameId) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Deterministic level from the id hash: `floor(-ln(u) / ln(m))`.
    fn level_for(&self, id: FrameId) -> usize {
        let h = mix64(id ^ LEVEL_SALT);
        let u = ((h >> 11) as f64 + 1.0) / (1u64 << 53) as f64;
        let ml = 1.0 / (self.params.m as f64).ln();
        ((-u.ln() * ml) as usize).min(MAX_LEVEL)
    }

    fn cap(&self, layer: usize) -> usize {
        if layer == 0 {
            self.params.m * 2
        } else {
            self.params.m
        }
    }

    fn sim(&self, q: &[f32; SLOT_DIM], node: u32) -> f32 {
        dot(q, &self.nodes[node as usize].vector)
    }

    fn links(&self, node: u32, layer: usize) -> &[u32] {
        self.nodes[node as usize]
            .links
            .get(layer)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn insert(&mut self, id: FrameId, vector: &[f32; SLOT_DIM]) {
        let mut v = *vector;
        if !l2_normalize(&mut v) {
            self.remove(id);
            return;
        }
        if let Some(old) = self.by_id.remove(&id) {
            self.deleted.insert(old);
        }
        let node = self.nodes.len() as u32;
        let level = self.level_for(id);
        self.nodes.push(Node {
            id,
            vector: Arc::new(v),
            links: vec![Vec::new(); level + 1],
        });
        self.by_id.insert(id, node);

        let Some(mut ep) = self.entry else {
            self.entry = Some(node);
            self.max_level = level;
            return;
        };

        for layer in (level + 1..=self.max_level).rev() {
            ep = self.greedy(&v, ep, layer);
        }
        for layer in (0..=level.min(self.max_level)).rev() {
            let found = self.search_layer(&v, ep, self.params.ef_construction, layer);
            let neighbors: Vec<u32> = found
                .iter()
                .filter(|s| s.node != node)
                .take(self.cap(layer))
                .map(|s| s.node)
                .collect();
            for &nb in &neighbors {
                self.link(nb, node, layer);
            }
            self.nodes[node as usize].links[layer] = neighbors;
            if let Some(best) = found.first() {
                ep = best.node;
            }
        }
        if level > self.max_level {
            self.max_level = level;
            self.entry = Some(node);
        }
    }

    pub fn remove(&mut self, id: FrameId) -> bool {
        match self.by_id.remove(&id) {
            Some(node) => {
                self.deleted.insert(node);
                true
            }
            None => false,
        }
    }

    /// Add `to` to `from`'s list on `layer`, pruning to the closest `cap`.
    fn link(&mut self, from: u32, to: u32, layer: usize) {
        let cap = self.cap(layer);
        let Some(list) = self.nodes[from as usize].links.get_mut(layer) else {
            return;
        };
        if list.contains(&to) {
            return;
        }
        list.push(to);
        if list.len() <= cap {
            return;
        }
        let base = Arc::clone(&self.nodes[from as usize].vector);
        let mut scored: Vec<Scored> = self.nodes[from as usize].links[layer]
            .iter()
            .map(|&n| Scored {
                sim: self.sim(&base, n),
                node: n,
            })
            .collect();
        scored.sort_by(|a, b| b.cmp(a));
        scored.truncate(cap);
        self.nodes[from as usize].links[layer] = scored.into_iter().map(|s| s.node).collect();
    }

    fn greedy(&self, q: &[f32; SLOT_DIM], ep: u32, layer: usize) -> u32 {
        let mut cur = ep;
        let mut best = self.sim(q, cur);
        loop {
            let mut changed = false;
            for &nb in self.links(cur, layer) {
                let s = self.sim(q, nb);
                if s > best {
                    best = s;
                    cur = nb;
                    changed = true;
                }
            }
            if !changed {
                return cur;
            }
        }
    }

    /// Best-first search of one layer. Returns up to `ef` nodes, best first.
    fn search_layer(&self, q: &[f32; SLOT_DIM], ep: u32, ef: usize, layer: usize) -> Vec<Scored> {
        let mut visited: HashSet<u32> = HashSet::new();
        let mut candidates: BinaryHeap<Scored> = BinaryHeap::new();
        let mut results: BinaryHeap<Reverse<Scored>> = BinaryHeap::new();

        visited.insert(ep);
        let start = Scored {
            sim: self.sim(q, ep),
            node: ep,
        };
        candidates.push(start);
        results.push(Reverse(start));

        while let Some(c) = candidates.pop() {
            if let Some(Reverse(worst)) = results.peek() {
                if results.len() >= ef && c.sim < worst.sim {
                    break;
                }
            }
            for &nb in self.links(c.node, layer) {
                if !visited.insert(nb) {
                    continue;
                }
                let s = Scored {
                    sim: self.sim(q, nb),
                    node: nb,
                };
                let admit = results.len() < ef || results.peek().is_some_and(|Reverse(w)| s.sim > w.sim);
                if admit {
                    candidates.push(s);
                    results.push(Reverse(s));
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut out: Vec<Scored> = results.into_iter().map(|Reverse(s)| s).collect();
        out.sort_by(|a, b| b.cmp(a));
        out
    }

    /// Top `k` live vectors by cosine similarity to `query`.
    pub fn search(&self, query: &[f32; SLOT_DIM], k: usize, ef: usize) -> Vec<(FrameId, f32)> {
        let Some(entry) = self.entry else {
            return Vec::new();
        };
        let mut q = *query;
        if k == 0 || !l2_normalize(&mut q) {
            return Vec::new();
        }
        let mut ep = entry;
        for layer in (1..=self.max_level).rev() {
            ep = self.greedy(&q, ep, layer);
        }
        let width = ef.max(k);
        let width = width + self.deleted.len().min(width);
        self.search_layer(&q, ep, width, 0)
            .into_iter()
            .filter(|s| !self.deleted.contains(&s.node))
            .take(k)
            .map(|s| (self.nodes[s.node as usize].id, s.sim))
            .collect()
    }

    /// More dead nodes than live ones.
    pub fn needs_rebuild(&self) -> bool {
        self.deleted.len() > self.by_id.len()
    }

    /// Fresh graph over the live vectors only.
    pub fn rebuilt(&self) -> Self {
        let mut live: Vec<(u32, FrameId)> = self.by_id.iter().map(|(id, n)| (*n, *id)).collect();
        live.sort_unstable();
        let mut graph = Self::new(self.params);
        for (node, id) in live {
            let vector = Arc::clone(&self.nodes[node as usize].vector);
            graph.insert(id, &vector);
        }
        graph
    }
}

// ── Published index ────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct PendingOp {
    seq: u64,
    /// `None` removes the frame.
    vector: Option<Arc<[f32; SLOT_DIM]>>,
}

#[derive(Debug, Default)]
struct Pending {
    seq: u64,
    ops: HashMap<FrameId, PendingOp>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SemanticStats {
    pub indexed: usize,
    pub pending: usize,
    pub deleted: usize,
    pub generation: u64,
}

pub struct SemanticIndex {
    params: HnswParams,
    published: RwLock<Arc<HnswGraph>>,
    pending: RwLock<Pending>,
    converge_lock: Mutex<()>,
    generation: AtomicU64,
}

impl SemanticIndex {
    pub fn new(params: HnswParams) -> Self {
        Self {
            params,
            published: RwLock::new(Arc::new(HnswGraph::new(params))),
            pending: RwLock::new(Pending::default()),
            converge_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    fn push(&self, id: FrameId, vector: Option<Arc<[f32; SLOT_DIM]>>) {
        let mut pending = self.pending.write();
        pending.seq += 1;
        let seq = pending.seq;
        pending.ops.insert(id, PendingOp { seq, vector });
    }

    pub fn insert(&self, id: FrameId, vector: &[f32; SLOT_DIM]) {
        let mut v = *vector;
        if l2_normalize(&mut v) {
            self.push(id, Some(Arc::new(v)));
        } else {
            self.push(id, None);
        }
    }

    pub fn remove(&self, id: FrameId) {
        self.push(id, None);
    }

    /// Published graph plus the pending buffer, best first.
    pub fn search(&self, query: &[f32; SLOT_DIM], k: usize) -> Vec<(FrameId, f32)> {
        let mut q = *query;
        if k == 0 || !l2_normalize(&mut q) {
            return Vec::new();
        }
        let graph = Arc::clone(&self.published.read());
        let pending = self.pending.read();

        let mut hits: Vec<(FrameId, f32)> = graph
            .search(&q, k.saturating_add(pending.ops.len()), self.params.ef_search)
            .into_iter()
            .filter(|(id, _)| !pending.ops.contains_key(id))
            .collect();
        hits.extend(
            pending
                .ops
                .iter()
                .filter_map(|(id, op)| op.vector.as_ref().map(|v| (*id, dot(&q, v)))),
        );
        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        hits.truncate(k);
        hits
    }

    pub fn pending_len(&self) -> usize {
        self.pending.read().ops.len()
    }

    /// Fold pending vectors into a new graph and publish it. Returns how
    /// many pending operations were folded.
    pub fn converge(&self) -> usize {
        let _guard = self.converge_lock.lock();
        let (mut ops, upto) = {
            let pending = self.pending.read();
            let ops: Vec<(FrameId, PendingOp)> = pending.ops.iter().map(|(id, op)| (*id, op.clone())).collect();
            (ops, pending.seq)
        };
        if ops.is_empty() {
            return 0;
        }
        ops.sort_by_key(|(_, op)| op.seq);

        let mut graph = HnswGraph::clone(&self.published.read());
        for (id, op) in &ops {
            match &op.vector {
                Some(v) => graph.insert(*id, v),
                None => {
                    graph.remove(*id);
                }
            }
        }
        if graph.needs_rebuild() {
            graph = graph.rebuilt();
        }

        {
            let mut published = self.published.write();
            let mut pending = self.pending.write();
            *published = Arc::new(graph);
            pending.ops.retain(|_, op| op.seq > upto);
        }
        self.generation.fetch_add(1, AtomicOrdering::Relaxed);
        ops.len()
    }

    pub fn stats(&self) -> SemanticStats {
        let graph = Arc::clone(&self.published.read());
        SemanticStats {
            indexed: graph.len(),
            pending: self.pending_len(),
            deleted: graph.deleted_count(),
            generation: self.generation.load(AtomicOrdering::Relaxed),
        }
    }
}
