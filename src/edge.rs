//! Edge identities and the refined-edges slot table.
//!
//! Two edge representations coexist during refinement:
//! - [`Edge`]: an unordered element edge named by local vertex ids, used when
//!   classifying an element's split pattern.
//! - [`DirectedEdge`]: an edge named by global ids with the lesser id first,
//!   which makes the identity of a shared edge deterministic across
//!   partitions. It carries the local id of the vertex inserted on it once
//!   that id has been assigned.
//!
//! [`RefinedEdges`] is the per-vertex slot table driving the whole pass. For
//! the `t`-th neighbour of vertex `v`, slots `2t` and `2t+1` carry
//! `(new_vertex, producer)`. A slot moves through four states:
//! unset ([`UNSET`]) → pending ([`PENDING`], marked but not yet staged) →
//! staged (producer-local offset plus producer tag) → final (absolute local
//! id once producer bases are known). Only the endpoint with the lesser
//! global id owns the authoritative slot for an edge.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};

use crate::{Gid, Lid};

/// Slot value for an edge that was never selected.
pub const UNSET: i64 = -1;
/// Slot value for an edge marked by conforming propagation, vertex not yet
/// created.
pub const PENDING: i64 = i64::MAX;

/// Unordered element edge; endpoints are stored lesser local id first.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Edge {
    first: i64,
    second: i64,
}

impl Edge {
    pub fn new(a: i64, b: i64) -> Self {
        if a < b {
            Self { first: a, second: b }
        } else {
            Self { first: b, second: a }
        }
    }

    #[inline]
    pub fn first(&self) -> i64 {
        self.first
    }

    #[inline]
    pub fn second(&self) -> i64 {
        self.second
    }

    #[inline]
    pub fn contains(&self, v: i64) -> bool {
        self.first == v || self.second == v
    }

    /// The endpoint that is not `v`. `v` must be an endpoint.
    #[inline]
    pub fn other(&self, v: i64) -> i64 {
        if self.first == v {
            self.second
        } else {
            self.first
        }
    }

    /// The endpoint shared with `other`, if the two edges are connected.
    pub fn connected(&self, other: &Edge) -> Option<i64> {
        if other.contains(self.first) {
            Some(self.first)
        } else if other.contains(self.second) {
            Some(self.second)
        } else {
            None
        }
    }
}

/// Edge named by global ids, lesser id first; `id` is the local id of the
/// vertex inserted on it, `-1` until assigned.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct DirectedEdge {
    pub lo: Gid,
    pub hi: Gid,
    pub id: i64,
}

impl DirectedEdge {
    pub fn new(g0: Gid, g1: Gid) -> Self {
        let (lo, hi) = if g0 < g1 { (g0, g1) } else { (g1, g0) };
        Self { lo, hi, id: -1 }
    }
}

/// Per-vertex refined-edge slots. Writes go through atomics so that
/// concurrent marking of the same edge from two workers is well-defined:
/// both store the same sentinel, which is the only write that can race.
pub struct RefinedEdges {
    slots: Vec<Box<[AtomicI64]>>,
}

impl RefinedEdges {
    /// Allocate slots for every vertex of `adjacency`, all unset. Space is
    /// allocated unconditionally for every vertex because marking may target
    /// any slot from any worker.
    pub fn for_adjacency(adjacency: &[Vec<Lid>]) -> Self {
        let slots = adjacency
            .par_iter()
            .map(|nbrs| {
                (0..2 * nbrs.len())
                    .map(|_| AtomicI64::new(UNSET))
                    .collect::<Vec<_>>()
                    .into_boxed_slice()
            })
            .collect();
        Self { slots }
    }

    /// Number of vertices covered by the table.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Neighbour count of vertex `v`.
    #[inline]
    pub fn degree(&self, v: Lid) -> usize {
        self.slots[v].len() / 2
    }

    /// New-vertex slot for the `pos`-th neighbour of `v`.
    #[inline]
    pub fn value(&self, v: Lid, pos: usize) -> i64 {
        self.slots[v][2 * pos].load(Ordering::Relaxed)
    }

    /// Producer tag for the `pos`-th neighbour of `v`.
    #[inline]
    pub fn producer(&self, v: Lid, pos: usize) -> i64 {
        self.slots[v][2 * pos + 1].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_pending(&self, v: Lid, pos: usize) -> bool {
        self.value(v, pos) == PENDING
    }

    /// Mark the edge at `(v, pos)` for refinement. Racing markers all store
    /// the same sentinel, so the store is relaxed.
    #[inline]
    pub fn mark(&self, v: Lid, pos: usize) {
        self.slots[v][2 * pos].store(PENDING, Ordering::Relaxed);
    }

    /// Record a producer-local offset and the producer tag for the edge at
    /// `(v, pos)`.
    #[inline]
    pub fn stage(&self, v: Lid, pos: usize, offset: i64, producer: i64) {
        self.slots[v][2 * pos].store(offset, Ordering::Relaxed);
        self.slots[v][2 * pos + 1].store(producer, Ordering::Relaxed);
    }

    /// Convert staged producer-local offsets into absolute local ids, where
    /// `base[p]` is the first id assigned to producer `p`. No slot may still
    /// be pending.
    pub fn finalise(&self, base: &[usize]) {
        self.slots.par_iter().for_each(|row| {
            for pair in row.chunks_exact(2) {
                let v = pair[0].load(Ordering::Relaxed);
                debug_assert_ne!(v, PENDING, "pending slot survived propagation");
                if v >= 0 && v != PENDING {
                    let p = pair[1].load(Ordering::Relaxed) as usize;
                    pair[0].store(v + base[p] as i64, Ordering::Relaxed);
                }
            }
        });
    }
}
