//! The refinement driver.
//!
//! Performs one level of metric-driven edge refinement: every edge whose
//! Riemannian length exceeds the supplied bound is bisected at a
//! metric-weighted position, extra edges are marked until every 3D element
//! matches a legal subdivision template, elements are replaced by their
//! canonical sub-elements, and the partition halo is re-established for the
//! vertices created on shared edges.
//!
//! The pass is organised as a fixed team of producers: vertices and elements
//! are chunked into one contiguous range per producer, and each producer
//! stages new vertices and elements in private buffers. Exclusive prefix
//! sums over the buffer lengths yield the append offsets into the mesh
//! arrays. Between partitions, a rank prefix sum establishes global vertex
//! numbering and an all-reduce detects propagation termination.

use hashbrown::HashMap;
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::ops::Range;
use tracing::debug;

use crate::comm::Communicator;
use crate::edge::{DirectedEdge, Edge, RefinedEdges};
use crate::error::RefineError;
use crate::geometry::{metric_length, ElementGeometry};
use crate::mesh::Mesh;
use crate::surface::Surface;
use crate::{Gid, Lid, Rank};

const NO_OWNER: Rank = usize::MAX;

/// Producer-private staging for new vertices.
#[derive(Default)]
struct VertexBuf {
    vertices: Vec<DirectedEdge>,
    coords: Vec<f64>,
    metric: Vec<f64>,
}

/// Producer-private staging for new elements.
#[derive(Default)]
struct ElementBuf {
    elements: Vec<i64>,
    erased: Vec<usize>,
}

/// Divide `0..n` into `chunks` contiguous ranges of near-equal length.
fn chunk_ranges(n: usize, chunks: usize) -> Vec<Range<usize>> {
    let chunks = chunks.max(1);
    let base = n / chunks;
    let rem = n % chunks;
    let mut out = Vec::with_capacity(chunks);
    let mut start = 0;
    for c in 0..chunks {
        let len = base + usize::from(c < rem);
        out.push(start..start + len);
        start += len;
    }
    out
}

/// Split the tail of a flat array into one slice per producer, `counts[p]`
/// records times `stride` entries each.
fn split_by<'s, T>(mut tail: &'s mut [T], counts: &[usize], stride: usize) -> Vec<&'s mut [T]> {
    let mut out = Vec::with_capacity(counts.len());
    for &c in counts {
        let (head, rest) = tail.split_at_mut(c * stride);
        out.push(head);
        tail = rest;
    }
    out
}

/// Mesh refinement driver. Holds non-owning handles to the mesh and its
/// boundary surface; lifetime is scoped by the caller.
pub struct Refine<'a, C: Communicator> {
    mesh: &'a mut Mesh<C>,
    surface: &'a mut Surface,
    geometry: Option<ElementGeometry>,
    ndims: usize,
    nloc: usize,
    rank: Rank,
    nprocs: usize,
    lnn2gnn: Vec<Gid>,
    gnn2lnn: HashMap<Gid, Lid>,
    node_owner: Vec<Rank>,
}

impl<'a, C: Communicator> Refine<'a, C> {
    /// Construct a driver for `mesh` and its boundary `surface`. The
    /// orientation probe is taken from the first intact element; it assumes
    /// all input elements are equivalently handed and is only used for sign
    /// tests.
    pub fn new(mesh: &'a mut Mesh<C>, surface: &'a mut Surface) -> Result<Self, RefineError> {
        let ndims = mesh.dims();
        if surface.dims() != ndims {
            return Err(RefineError::MalformedMesh(format!(
                "surface dimension {} does not match mesh dimension {ndims}",
                surface.dims()
            )));
        }
        let geometry = match mesh.live_elements().next() {
            Some((_, elem)) => {
                let corners: Vec<&[f64]> =
                    elem.iter().map(|&c| mesh.coords_of(c as Lid)).collect();
                Some(ElementGeometry::new(ndims, &corners)?)
            }
            None => None,
        };
        let rank = mesh.comm().rank();
        let nprocs = mesh.comm().size();
        Ok(Self {
            mesh,
            surface,
            geometry,
            ndims,
            nloc: ndims + 1,
            rank,
            nprocs,
            lnn2gnn: Vec::new(),
            gnn2lnn: HashMap::new(),
            node_owner: Vec::new(),
        })
    }

    /// Perform one level of refinement so that no selected edge is longer
    /// than `l_max` in metric space without being split. Mutates the mesh
    /// and surface in place; on error, nothing past the last completed
    /// phase has been appended.
    pub fn refine(&mut self, l_max: f64) -> Result<(), RefineError> {
        if !l_max.is_finite() || l_max <= 0.0 {
            return Err(RefineError::InvalidBound(l_max));
        }
        let orig_nnodes = self.mesh.vertex_count();
        let orig_nelements = self.mesh.element_count();
        let nworkers = rayon::current_num_threads().max(1);

        self.build_global_numbering()?;
        self.assign_ownership();

        let refined = RefinedEdges::for_adjacency(&self.mesh.nnlist);
        let node_ranges = chunk_ranges(orig_nnodes, nworkers);
        let mut vertex_bufs: Vec<VertexBuf> =
            (0..nworkers).map(|_| VertexBuf::default()).collect();

        let selected = self.select_edges(l_max, &node_ranges, &mut vertex_bufs, &refined)?;
        debug!(selected, "edge selection complete");

        if self.ndims == 3 {
            self.propagate(orig_nelements, &node_ranges, &mut vertex_bufs, &refined)?;
        }

        self.insert_new_vertices(orig_nnodes, &mut vertex_bufs, &refined);

        let elem_ranges = chunk_ranges(orig_nelements, nworkers);
        let elem_bufs = self.subdivide(&elem_ranges, &refined)?;
        self.append_elements(orig_nelements, elem_bufs);

        if self.nprocs > 1 {
            self.amend_halo(orig_nnodes, orig_nelements, &vertex_bufs)?;
        }

        if let Some(geometry) = self.geometry {
            self.mesh.reorient_elements_from(orig_nelements, &geometry);
        }

        self.surface.refine(self.mesh, &refined, &self.lnn2gnn)?;
        self.mesh.create_adjacency();
        Ok(())
    }

    /// Establish a partition-independent global id per vertex: a rank prefix
    /// sum yields this partition's offset, then a halo exchange overwrites
    /// ghost ids with the owners' values.
    fn build_global_numbering(&mut self) -> Result<(), RefineError> {
        let nnodes = self.mesh.vertex_count();
        let scan = self.mesh.comm().scan_sum(nnodes as u64)?;
        let offset = (scan - nnodes as u64) as Gid;
        let mut lnn2gnn: Vec<Gid> = (0..nnodes)
            .into_par_iter()
            .map(|i| offset + i as Gid)
            .collect();
        self.mesh.halo_update(&mut lnn2gnn, 1)?;
        self.gnn2lnn = lnn2gnn.iter().enumerate().map(|(l, &g)| (g, l)).collect();
        self.lnn2gnn = lnn2gnn;
        Ok(())
    }

    /// A vertex is owned by this rank unless it appears in a receive list.
    fn assign_ownership(&mut self) {
        let mut owner = vec![self.rank; self.mesh.vertex_count()];
        for p in 0..self.nprocs {
            for &lid in self.mesh.recv_list(p) {
                owner[lid] = p;
            }
        }
        self.node_owner = owner;
    }

    /// Select every over-long edge, staging its new vertex with the producer
    /// that owns the lower-gid endpoint's range.
    fn select_edges(
        &self,
        l_max: f64,
        ranges: &[Range<usize>],
        bufs: &mut [VertexBuf],
        refined: &RefinedEdges,
    ) -> Result<usize, RefineError> {
        bufs.par_iter_mut()
            .zip(ranges.par_iter())
            .enumerate()
            .map(|(w, (buf, range))| -> Result<usize, RefineError> {
                let mut cnt = 0usize;
                for i in range.clone() {
                    for (pos, &u) in self.mesh.neighbours(i).iter().enumerate() {
                        // Visit each edge once, from its lower-gid endpoint;
                        // every rank then computes the identical length for
                        // a shared edge and takes the same decision.
                        if self.lnn2gnn[i] >= self.lnn2gnn[u] {
                            continue;
                        }
                        let length = self.mesh.calc_edge_length(i, u);
                        if length > l_max {
                            refined.stage(i, pos, buf.vertices.len() as i64, w as i64);
                            self.refine_edge(i, u, buf)?;
                            cnt += 1;
                        }
                    }
                }
                Ok(cnt)
            })
            .try_reduce(|| 0, |a, b| Ok(a + b))
    }

    /// Stage the vertex bisecting edge `(n0, n1)`: its position equalises
    /// the metric sub-lengths of the two children, its metric is the
    /// component-wise interpolation of the endpoint metrics.
    fn refine_edge(&self, n0: Lid, n1: Lid, buf: &mut VertexBuf) -> Result<(), RefineError> {
        let (n0, n1) = if self.lnn2gnn[n0] > self.lnn2gnn[n1] {
            (n1, n0)
        } else {
            (n0, n1)
        };
        buf.vertices
            .push(DirectedEdge::new(self.lnn2gnn[n0], self.lnn2gnn[n1]));

        let x0 = self.mesh.coords_of(n0);
        let m0 = self.mesh.metric_of(n0);
        let x1 = self.mesh.coords_of(n1);
        let m1 = self.mesh.metric_of(n1);

        let weight = 1.0
            / (1.0
                + (metric_length(self.ndims, x0, x1, m0)
                    / metric_length(self.ndims, x0, x1, m1))
                .sqrt());

        for i in 0..self.ndims {
            buf.coords.push(x0[i] + weight * (x1[i] - x0[i]));
        }
        for i in 0..self.ndims * self.ndims {
            let m = m0[i] + weight * (m1[i] - m0[i]);
            if !m.is_finite() {
                return Err(RefineError::MetricCorruption {
                    m0: m0[i],
                    m1: m1[i],
                    weight,
                });
            }
            buf.metric.push(m);
        }
        Ok(())
    }

    /// Mark the edge `(n0, n1)` for refinement via the lower-gid endpoint's
    /// slot. Racing markers all store the same sentinel.
    fn mark_edge(&self, n0: Lid, n1: Lid, refined: &RefinedEdges) -> Result<(), RefineError> {
        let (lo, hi) = if self.lnn2gnn[n0] > self.lnn2gnn[n1] {
            (n1, n0)
        } else {
            (n0, n1)
        };
        let pos = self
            .mesh
            .neighbours(lo)
            .iter()
            .position(|&u| u == hi)
            .ok_or(RefineError::NotAdjacent(lo, hi))?;
        refined.mark(lo, pos);
        Ok(())
    }

    /// Mark every edge of element `n` that is not in `split`.
    fn mark_unsplit(
        &self,
        n: &[i64],
        split: &[Edge],
        refined: &RefinedEdges,
    ) -> Result<usize, RefineError> {
        let mut cnt = 0;
        for j in 0..self.nloc {
            for k in j + 1..self.nloc {
                let edge = Edge::new(n[j], n[k]);
                if !split.contains(&edge) {
                    self.mark_edge(n[j] as Lid, n[k] as Lid, refined)?;
                    cnt += 1;
                }
            }
        }
        Ok(cnt)
    }

    /// Inspect one element's split pattern and mark whatever extra edges a
    /// legal template requires. Returns the number of marks issued.
    fn classify_and_mark(
        &self,
        e: usize,
        refined: &RefinedEdges,
    ) -> Result<usize, RefineError> {
        let n = self.mesh.element(e);
        if n[0] < 0 {
            return Ok(0);
        }
        let mut split: Vec<Edge> = Vec::with_capacity(6);
        for j in 0..self.nloc {
            for k in j + 1..self.nloc {
                if self
                    .mesh
                    .get_new_vertex(n[j] as Lid, n[k] as Lid, refined, &self.lnn2gnn)
                    >= 0
                {
                    split.push(Edge::new(n[j], n[k]));
                }
            }
        }

        let mut marked = 0;
        match split.len() {
            // 1:2, 1:4 (opposite pair), and 1:8 are directly legal.
            0 | 1 | 6 => {}
            2 => {
                // A pair sharing a vertex would give a 1:3 subdivision and a
                // surface mismatch; close the triangle the pair spans. An
                // opposite pair subdivides 1:4 and is left alone.
                if let Some(shared) = split[0].connected(&split[1]) {
                    let n1 = split[0].other(shared);
                    let n2 = split[1].other(shared);
                    self.mark_edge(n1 as Lid, n2 as Lid, refined)?;
                    marked += 1;
                }
            }
            3 => {
                // Three edges pairwise sharing three distinct vertices form
                // a face, which has a 1:4 template. Anything else escalates.
                let mut shared = BTreeSet::new();
                for j in 0..3 {
                    for k in j + 1..3 {
                        if let Some(s) = split[j].connected(&split[k]) {
                            shared.insert(s);
                        }
                    }
                }
                if shared.len() != 3 {
                    marked += self.mark_unsplit(n, &split, refined)?;
                }
            }
            4 | 5 => {
                marked += self.mark_unsplit(n, &split, refined)?;
            }
            c => {
                return Err(RefineError::IllegalSplitPattern {
                    element: e,
                    count: c,
                })
            }
        }
        Ok(marked)
    }

    /// Fixed-point loop enforcing conforming 3D subdivisions: scan elements,
    /// mark extra edges, realise the marks, repeat until a global round
    /// issues no mark. The all-reduce keeps every partition in the loop
    /// until all of them are conforming.
    fn propagate(
        &self,
        orig_nelements: usize,
        node_ranges: &[Range<usize>],
        bufs: &mut [VertexBuf],
        refined: &RefinedEdges,
    ) -> Result<(), RefineError> {
        let mut rounds = 0usize;
        loop {
            let marked = (0..orig_nelements)
                .into_par_iter()
                .map(|e| self.classify_and_mark(e, refined))
                .try_reduce(|| 0, |a, b| Ok(a + b))?;

            let global = self.mesh.comm().allreduce_sum(marked as i64)?;
            if global == 0 {
                break;
            }
            rounds += 1;

            bufs.par_iter_mut()
                .zip(node_ranges.par_iter())
                .enumerate()
                .try_for_each(|(w, (buf, range))| -> Result<(), RefineError> {
                    for i in range.clone() {
                        for pos in 0..refined.degree(i) {
                            if refined.is_pending(i, pos) {
                                let u = self.mesh.neighbours(i)[pos];
                                refined.stage(i, pos, buf.vertices.len() as i64, w as i64);
                                self.refine_edge(i, u, buf)?;
                            }
                        }
                    }
                    Ok(())
                })?;
        }
        debug!(rounds, "conforming propagation converged");
        Ok(())
    }

    /// Append the staged vertices to the mesh and rewrite refined-edge slots
    /// from producer-local offsets to absolute local ids.
    fn insert_new_vertices(
        &mut self,
        orig_nnodes: usize,
        bufs: &mut [VertexBuf],
        refined: &RefinedEdges,
    ) {
        let counts: Vec<usize> = bufs.iter().map(|b| b.vertices.len()).collect();
        let total: usize = counts.iter().sum();
        let mut bases = Vec::with_capacity(counts.len());
        let mut acc = orig_nnodes;
        for &c in &counts {
            bases.push(acc);
            acc += c;
        }

        self.mesh.grow_vertices(total);
        self.node_owner.resize(orig_nnodes + total, NO_OWNER);

        let ndims = self.ndims;
        let s = ndims * ndims;
        let coord_slices = split_by(&mut self.mesh.coords[orig_nnodes * ndims..], &counts, ndims);
        let metric_slices = split_by(&mut self.mesh.metric[orig_nnodes * s..], &counts, s);

        bufs.par_iter_mut()
            .zip(coord_slices)
            .zip(metric_slices)
            .zip(bases.par_iter())
            .for_each(|(((buf, cdst), mdst), &base)| {
                cdst.copy_from_slice(&buf.coords);
                mdst.copy_from_slice(&buf.metric);
                for (k, vert) in buf.vertices.iter_mut().enumerate() {
                    vert.id = (base + k) as i64;
                }
            });

        refined.finalise(&bases);
        debug!(new_vertices = total, "materialised staged vertices");
    }

    /// Replace every split element with the canonical sub-elements for its
    /// split pattern.
    fn subdivide(
        &self,
        ranges: &[Range<usize>],
        refined: &RefinedEdges,
    ) -> Result<Vec<ElementBuf>, RefineError> {
        ranges
            .par_iter()
            .map(|range| -> Result<ElementBuf, RefineError> {
                let mut buf = ElementBuf::default();
                for e in range.clone() {
                    if self.mesh.is_erased(e) {
                        continue;
                    }
                    if self.ndims == 2 {
                        self.subdivide_triangle(e, refined, &mut buf)?;
                    } else {
                        self.subdivide_tetrahedron(e, refined, &mut buf)?;
                    }
                }
                Ok(buf)
            })
            .collect()
    }

    fn subdivide_triangle(
        &self,
        e: usize,
        refined: &RefinedEdges,
        buf: &mut ElementBuf,
    ) -> Result<(), RefineError> {
        let elem = self.mesh.element(e);
        let n = [elem[0], elem[1], elem[2]];
        // The k-th entry is the new vertex on the edge opposite corner k.
        let mut new_vertex = [-1i64; 3];
        for k in 0..3 {
            new_vertex[k] = self.mesh.get_new_vertex(
                n[(k + 1) % 3] as Lid,
                n[(k + 2) % 3] as Lid,
                refined,
                &self.lnn2gnn,
            );
        }
        let refine_cnt = new_vertex.iter().filter(|&&v| v >= 0).count();
        match refine_cnt {
            0 => return Ok(()),
            1 => {
                let j = (0..3).position(|k| new_vertex[k] >= 0).unwrap_or(0);
                let v = new_vertex[j];
                let rot = [n[j], n[(j + 1) % 3], n[(j + 2) % 3]];
                buf.elements.extend_from_slice(&[rot[0], rot[1], v]);
                buf.elements.extend_from_slice(&[rot[0], v, rot[2]]);
            }
            2 => {
                // Rotate so the unsplit edge is opposite the first corner,
                // then cut the remaining quadrilateral along its shorter
                // diagonal.
                let j = (0..3).position(|k| new_vertex[k] < 0).unwrap_or(0);
                let v = [new_vertex[(j + 1) % 3], new_vertex[(j + 2) % 3]];
                let rot = [n[j], n[(j + 1) % 3], n[(j + 2) % 3]];
                let ldiag0 = self.mesh.calc_edge_length(v[0] as Lid, rot[1] as Lid);
                let ldiag1 = self.mesh.calc_edge_length(v[1] as Lid, rot[2] as Lid);
                let offset = if ldiag0 < ldiag1 { 0 } else { 1 };

                buf.elements.extend_from_slice(&[rot[0], v[1], v[0]]);
                buf.elements.extend_from_slice(&[v[offset], rot[1], rot[2]]);
                buf.elements.extend_from_slice(&[v[0], v[1], rot[offset + 1]]);
            }
            _ => {
                buf.elements
                    .extend_from_slice(&[n[0], new_vertex[2], new_vertex[1]]);
                buf.elements
                    .extend_from_slice(&[n[1], new_vertex[0], new_vertex[2]]);
                buf.elements
                    .extend_from_slice(&[n[2], new_vertex[1], new_vertex[0]]);
                buf.elements
                    .extend_from_slice(&[new_vertex[0], new_vertex[1], new_vertex[2]]);
            }
        }
        buf.erased.push(e);
        Ok(())
    }

    fn subdivide_tetrahedron(
        &self,
        e: usize,
        refined: &RefinedEdges,
        buf: &mut ElementBuf,
    ) -> Result<(), RefineError> {
        let elem = self.mesh.element(e);
        let n = [elem[0], elem[1], elem[2], elem[3]];
        let mut new_vertex: Vec<i64> = Vec::with_capacity(6);
        let mut split_edges: Vec<Edge> = Vec::with_capacity(6);
        for j in 0..4 {
            for k in j + 1..4 {
                let v = self
                    .mesh
                    .get_new_vertex(n[j] as Lid, n[k] as Lid, refined, &self.lnn2gnn);
                if v >= 0 {
                    new_vertex.push(v);
                    split_edges.push(Edge::new(n[j], n[k]));
                }
            }
        }

        match split_edges.len() {
            0 => return Ok(()),
            1 => {
                let oe: Vec<i64> = n
                    .iter()
                    .copied()
                    .filter(|&c| !split_edges[0].contains(c))
                    .collect();
                let v = new_vertex[0];
                buf.elements
                    .extend_from_slice(&[split_edges[0].first(), v, oe[0], oe[1]]);
                buf.elements
                    .extend_from_slice(&[split_edges[0].second(), v, oe[0], oe[1]]);
            }
            2 => {
                // Propagation escalates adjacent pairs, so the two split
                // edges are opposite and the element subdivides 1:4.
                if split_edges[0].connected(&split_edges[1]).is_some() {
                    return Err(RefineError::IllegalSplitPattern {
                        element: e,
                        count: 2,
                    });
                }
                let (e0, e1) = (split_edges[0], split_edges[1]);
                let (v0, v1) = (new_vertex[0], new_vertex[1]);
                buf.elements
                    .extend_from_slice(&[e0.first(), v0, e1.first(), v1]);
                buf.elements
                    .extend_from_slice(&[e0.first(), v0, e1.second(), v1]);
                buf.elements
                    .extend_from_slice(&[e0.second(), v0, e1.first(), v1]);
                buf.elements
                    .extend_from_slice(&[e0.second(), v0, e1.second(), v1]);
            }
            3 => {
                // The three split edges must ring a face; walk the ring
                // corner, midpoint, corner, midpoint, corner, midpoint and
                // cone each piece from the remaining vertex.
                let mut shared = BTreeSet::new();
                for j in 0..3 {
                    for k in j + 1..3 {
                        if let Some(s) = split_edges[j].connected(&split_edges[k]) {
                            shared.insert(s);
                        }
                    }
                }
                if shared.len() != 3 {
                    return Err(RefineError::IllegalSplitPattern {
                        element: e,
                        count: 3,
                    });
                }

                let m0 = split_edges[0].first();
                let m1 = new_vertex[0];
                let m2 = split_edges[0].second();
                let (m3, m4, m5) = if split_edges[1].contains(m2) {
                    (new_vertex[1], split_edges[1].other(m2), new_vertex[2])
                } else {
                    (new_vertex[2], split_edges[2].other(m2), new_vertex[1])
                };
                let m6 = n
                    .iter()
                    .copied()
                    .find(|&c| c != m0 && c != m2 && c != m4)
                    .ok_or(RefineError::IllegalSplitPattern {
                        element: e,
                        count: 3,
                    })?;

                buf.elements.extend_from_slice(&[m0, m1, m5, m6]);
                buf.elements.extend_from_slice(&[m1, m2, m3, m6]);
                buf.elements.extend_from_slice(&[m5, m3, m4, m6]);
                buf.elements.extend_from_slice(&[m1, m3, m5, m6]);
            }
            6 => {
                // Corner tets plus the fixed tiling of the interior
                // octahedron. new_vertex is ordered (01)(02)(03)(12)(13)(23).
                let nv = &new_vertex;
                buf.elements.extend_from_slice(&[n[0], nv[0], nv[1], nv[2]]);
                buf.elements.extend_from_slice(&[n[1], nv[3], nv[0], nv[4]]);
                buf.elements.extend_from_slice(&[n[2], nv[1], nv[3], nv[5]]);
                buf.elements
                    .extend_from_slice(&[nv[0], nv[3], nv[1], nv[4]]);
                buf.elements
                    .extend_from_slice(&[nv[0], nv[4], nv[1], nv[2]]);
                buf.elements
                    .extend_from_slice(&[nv[1], nv[3], nv[5], nv[4]]);
                buf.elements
                    .extend_from_slice(&[nv[1], nv[4], nv[5], nv[2]]);
                buf.elements.extend_from_slice(&[nv[2], nv[4], nv[5], n[3]]);
            }
            c => {
                return Err(RefineError::IllegalSplitPattern {
                    element: e,
                    count: c,
                })
            }
        }
        buf.erased.push(e);
        Ok(())
    }

    /// Append producer element buffers to the mesh and erase the parents.
    fn append_elements(&mut self, orig_nelements: usize, bufs: Vec<ElementBuf>) {
        let nloc = self.nloc;
        let counts: Vec<usize> = bufs.iter().map(|b| b.elements.len() / nloc).collect();
        let total: usize = counts.iter().sum();
        self.mesh
            .enlist
            .resize((orig_nelements + total) * nloc, 0);

        let slices = split_by(&mut self.mesh.enlist[orig_nelements * nloc..], &counts, nloc);
        slices
            .into_par_iter()
            .zip(bufs.par_iter())
            .for_each(|(dst, buf)| dst.copy_from_slice(&buf.elements));

        for buf in &bufs {
            for &parent in &buf.erased {
                self.mesh.erase_element(parent);
            }
        }
        debug!(new_elements = total, "appended sub-elements");
    }

    /// Re-establish halo membership for the vertices created on shared
    /// edges: a new vertex is owned by the lesser of its endpoints' owners,
    /// and every new element that straddles the halo contributes its foreign
    /// new vertices to the send/receive sets. Elements with no local vertex
    /// are erased.
    fn amend_halo(
        &mut self,
        orig_nnodes: usize,
        orig_nelements: usize,
        bufs: &[VertexBuf],
    ) -> Result<(), RefineError> {
        let mut lut: HashMap<Lid, DirectedEdge> = HashMap::new();
        for buf in bufs {
            for vert in &buf.vertices {
                let l0 = *self
                    .gnn2lnn
                    .get(&vert.lo)
                    .ok_or(RefineError::UnknownGlobalId(vert.lo))?;
                let l1 = *self
                    .gnn2lnn
                    .get(&vert.hi)
                    .ok_or(RefineError::UnknownGlobalId(vert.hi))?;
                self.node_owner[vert.id as usize] =
                    self.node_owner[l0].min(self.node_owner[l1]);
                lut.insert(vert.id as Lid, *vert);
            }
        }

        let mut send_additional: Vec<BTreeSet<DirectedEdge>> =
            vec![BTreeSet::new(); self.nprocs];
        let mut recv_additional: Vec<BTreeSet<DirectedEdge>> =
            vec![BTreeSet::new(); self.nprocs];

        for e in orig_nelements..self.mesh.element_count() {
            if self.mesh.is_erased(e) {
                continue;
            }
            let elem: Vec<i64> = self.mesh.element(e).to_vec();
            let processes: BTreeSet<Rank> = elem
                .iter()
                .map(|&c| self.node_owner[c as usize])
                .collect();

            if !processes.contains(&self.rank) {
                self.mesh.erase_element(e);
                continue;
            }
            if processes.len() == 1 {
                continue;
            }

            for &c in &elem {
                let c = c as Lid;
                if c < orig_nnodes {
                    continue;
                }
                let vert = *lut.get(&c).ok_or_else(|| {
                    RefineError::MalformedMesh(format!(
                        "new vertex {c} has no producer record"
                    ))
                })?;
                let owner = self.node_owner[c];
                if owner == self.rank {
                    for &p in &processes {
                        if p != self.rank {
                            send_additional[p].insert(vert);
                        }
                    }
                } else {
                    recv_additional[owner].insert(vert);
                }
            }
        }

        // Set iteration of gid-ordered edges appends in the same order on
        // both sides of every exchange.
        for p in 0..self.nprocs {
            for vert in &send_additional[p] {
                self.mesh.send[p].push(vert.id as Lid);
                self.mesh.send_halo.insert(vert.id as Lid);
            }
        }
        for p in 0..self.nprocs {
            for vert in &recv_additional[p] {
                self.mesh.recv[p].push(vert.id as Lid);
                self.mesh.recv_halo.insert(vert.id as Lid);
            }
        }
        Ok(())
    }
}
