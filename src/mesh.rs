//! Distributed simplicial mesh container.
//!
//! Stores vertices (coordinates plus a symmetric positive-definite metric
//! tensor each), elements as a flat node list, vertex adjacency, and the
//! per-rank halo (send/receive lists of shared vertices). The refinement
//! driver mutates all of it in place.
//!
//! # Storage layout
//! - `coords`: row-major, stride `ndims`.
//! - `metric`: row-major `d*d` tensor per vertex, stride `ndims * ndims`.
//! - `enlist`: element-node list, stride `nloc = ndims + 1`; an element whose
//!   first entry is negative is erased and skipped by all iteration.
//! - `nnlist[v]`: neighbour vertices of `v`; positions are stable and index
//!   the refined-edges slot table.
//! - `nelist[v]`: elements incident on `v`.

use rayon::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::comm::{tags, Communicator, Wait};
use crate::edge::RefinedEdges;
use crate::error::RefineError;
use crate::geometry::{metric_length, ElementGeometry};
use crate::{Gid, Lid, Rank};

pub struct Mesh<C: Communicator> {
    ndims: usize,
    nloc: usize,
    pub(crate) coords: Vec<f64>,
    pub(crate) metric: Vec<f64>,
    pub(crate) enlist: Vec<i64>,
    pub(crate) nnlist: Vec<Vec<Lid>>,
    pub(crate) nelist: Vec<BTreeSet<usize>>,
    pub(crate) send: Vec<Vec<Lid>>,
    pub(crate) recv: Vec<Vec<Lid>>,
    pub(crate) send_halo: BTreeSet<Lid>,
    pub(crate) recv_halo: BTreeSet<Lid>,
    comm: Arc<C>,
}

impl<C: Communicator> Clone for Mesh<C> {
    fn clone(&self) -> Self {
        Self {
            ndims: self.ndims,
            nloc: self.nloc,
            coords: self.coords.clone(),
            metric: self.metric.clone(),
            enlist: self.enlist.clone(),
            nnlist: self.nnlist.clone(),
            nelist: self.nelist.clone(),
            send: self.send.clone(),
            recv: self.recv.clone(),
            send_halo: self.send_halo.clone(),
            recv_halo: self.recv_halo.clone(),
            comm: Arc::clone(&self.comm),
        }
    }
}

impl<C: Communicator> Mesh<C> {
    /// Build a serial-partition mesh: no ghost vertices, empty halo.
    pub fn new(
        ndims: usize,
        coords: Vec<f64>,
        metric: Vec<f64>,
        enlist: Vec<i64>,
        comm: Arc<C>,
    ) -> Result<Self, RefineError> {
        let nranks = comm.size();
        Self::with_halo(
            ndims,
            coords,
            metric,
            enlist,
            vec![Vec::new(); nranks],
            vec![Vec::new(); nranks],
            comm,
        )
    }

    /// Build a mesh that is one partition of a distributed whole. `send[p]`
    /// lists the local vertices shadowed on rank `p`; `recv[p]` lists the
    /// ghost vertices owned by rank `p`.
    pub fn with_halo(
        ndims: usize,
        coords: Vec<f64>,
        metric: Vec<f64>,
        enlist: Vec<i64>,
        send: Vec<Vec<Lid>>,
        recv: Vec<Vec<Lid>>,
        comm: Arc<C>,
    ) -> Result<Self, RefineError> {
        if ndims != 2 && ndims != 3 {
            return Err(RefineError::UnsupportedDimension(ndims));
        }
        let nloc = ndims + 1;
        if coords.len() % ndims != 0 {
            return Err(RefineError::MalformedMesh(format!(
                "coordinate array length {} is not a multiple of {ndims}",
                coords.len()
            )));
        }
        let nnodes = coords.len() / ndims;
        if metric.len() != nnodes * ndims * ndims {
            return Err(RefineError::MalformedMesh(format!(
                "metric array length {} does not match {nnodes} vertices",
                metric.len()
            )));
        }
        if enlist.len() % nloc != 0 {
            return Err(RefineError::MalformedMesh(format!(
                "element array length {} is not a multiple of {nloc}",
                enlist.len()
            )));
        }
        for (e, elem) in enlist.chunks_exact(nloc).enumerate() {
            if elem[0] < 0 {
                continue;
            }
            for &n in elem {
                if n < 0 || n as usize >= nnodes {
                    return Err(RefineError::MalformedMesh(format!(
                        "element {e} references vertex {n} outside 0..{nnodes}"
                    )));
                }
            }
        }
        let nranks = comm.size();
        if send.len() != nranks || recv.len() != nranks {
            return Err(RefineError::MalformedMesh(format!(
                "halo lists sized {}/{} for {nranks} ranks",
                send.len(),
                recv.len()
            )));
        }
        for lid in send.iter().chain(recv.iter()).flatten() {
            if *lid >= nnodes {
                return Err(RefineError::MalformedMesh(format!(
                    "halo vertex {lid} outside 0..{nnodes}"
                )));
            }
        }

        let send_halo = send.iter().flatten().copied().collect();
        let recv_halo = recv.iter().flatten().copied().collect();
        let mut mesh = Self {
            ndims,
            nloc,
            coords,
            metric,
            enlist,
            nnlist: Vec::new(),
            nelist: Vec::new(),
            send,
            recv,
            send_halo,
            recv_halo,
            comm,
        };
        mesh.create_adjacency();
        Ok(mesh)
    }

    #[inline]
    pub fn dims(&self) -> usize {
        self.ndims
    }

    /// Corners per element (`ndims + 1`).
    #[inline]
    pub fn nloc(&self) -> usize {
        self.nloc
    }

    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.coords.len() / self.ndims
    }

    #[inline]
    pub fn element_count(&self) -> usize {
        self.enlist.len() / self.nloc
    }

    #[inline]
    pub fn comm(&self) -> &C {
        &self.comm
    }

    /// The element-node tuple of element `i`; a negative first entry means
    /// the element is erased.
    #[inline]
    pub fn element(&self, i: usize) -> &[i64] {
        &self.enlist[i * self.nloc..(i + 1) * self.nloc]
    }

    #[inline]
    pub fn is_erased(&self, i: usize) -> bool {
        self.enlist[i * self.nloc] < 0
    }

    /// Elements that have not been erased, with their indices.
    pub fn live_elements(&self) -> impl Iterator<Item = (usize, &[i64])> {
        self.enlist
            .chunks_exact(self.nloc)
            .enumerate()
            .filter(|(_, elem)| elem[0] >= 0)
    }

    #[inline]
    pub fn coords_of(&self, v: Lid) -> &[f64] {
        &self.coords[v * self.ndims..(v + 1) * self.ndims]
    }

    #[inline]
    pub fn metric_of(&self, v: Lid) -> &[f64] {
        let s = self.ndims * self.ndims;
        &self.metric[v * s..(v + 1) * s]
    }

    /// Neighbour vertices of `v`. Positions are stable; the refined-edges
    /// table is indexed by them.
    #[inline]
    pub fn neighbours(&self, v: Lid) -> &[Lid] {
        &self.nnlist[v]
    }

    pub fn send_list(&self, p: Rank) -> &[Lid] {
        &self.send[p]
    }

    pub fn recv_list(&self, p: Rank) -> &[Lid] {
        &self.recv[p]
    }

    pub fn send_halo(&self) -> &BTreeSet<Lid> {
        &self.send_halo
    }

    pub fn recv_halo(&self) -> &BTreeSet<Lid> {
        &self.recv_halo
    }

    /// Metric length of the edge `(a, b)` under the mean of the endpoint
    /// metrics. Pure arithmetic on the endpoint values, so every partition
    /// holding both vertices computes the identical value.
    pub fn calc_edge_length(&self, a: Lid, b: Lid) -> f64 {
        let s = self.ndims * self.ndims;
        let ma = self.metric_of(a);
        let mb = self.metric_of(b);
        let mut m = [0.0f64; 9];
        for i in 0..s {
            m[i] = 0.5 * (ma[i] + mb[i]);
        }
        metric_length(self.ndims, self.coords_of(a), self.coords_of(b), &m[..s])
    }

    /// Slot value for the edge `(a, b)`: the local id of the vertex inserted
    /// on it once staging is finalised, a sentinel while marking is in
    /// flight, or `-1` if the edge is not selected. The authoritative slot
    /// lives at the endpoint with the lesser global id.
    pub fn get_new_vertex(
        &self,
        a: Lid,
        b: Lid,
        refined: &RefinedEdges,
        lnn2gnn: &[Gid],
    ) -> i64 {
        let (lo, hi) = if lnn2gnn[a] < lnn2gnn[b] { (a, b) } else { (b, a) };
        match self.nnlist[lo].iter().position(|&u| u == hi) {
            Some(pos) => refined.value(lo, pos),
            None => -1,
        }
    }

    /// Erase element `i` by poisoning its first corner.
    pub fn erase_element(&mut self, i: usize) {
        self.enlist[i * self.nloc] = -1;
    }

    /// Extend the vertex arrays by `additional` zero-initialised vertices.
    pub(crate) fn grow_vertices(&mut self, additional: usize) {
        let nnodes = self.vertex_count() + additional;
        self.coords.resize(nnodes * self.ndims, 0.0);
        self.metric.resize(nnodes * self.ndims * self.ndims, 0.0);
        self.nnlist.resize(nnodes, Vec::new());
        self.nelist.resize(nnodes, BTreeSet::new());
    }

    /// Flip every negatively-oriented element at index `from` onwards by
    /// swapping its first two corners.
    pub(crate) fn reorient_elements_from(&mut self, from: usize, geometry: &ElementGeometry) {
        let ndims = self.ndims;
        let nloc = self.nloc;
        let coords = &self.coords;
        let coord_of = |v: i64| &coords[v as usize * ndims..(v as usize + 1) * ndims];
        self.enlist[from * nloc..]
            .par_chunks_exact_mut(nloc)
            .for_each(|elem| {
                if elem[0] < 0 {
                    return;
                }
                let measure = if ndims == 2 {
                    geometry.area(coord_of(elem[0]), coord_of(elem[1]), coord_of(elem[2]))
                } else {
                    geometry.volume(
                        coord_of(elem[0]),
                        coord_of(elem[1]),
                        coord_of(elem[2]),
                        coord_of(elem[3]),
                    )
                };
                if measure < 0.0 {
                    elem.swap(0, 1);
                }
            });
    }

    /// Exchange `stride` values per halo vertex: owned values are sent to
    /// every rank shadowing them, ghost values are overwritten with the
    /// owner's.
    pub fn halo_update<T: bytemuck::Pod>(
        &self,
        buf: &mut [T],
        stride: usize,
    ) -> Result<(), RefineError> {
        let rank = self.comm.rank();
        let nranks = self.comm.size();
        if nranks == 1 {
            return Ok(());
        }

        let mut recvs = Vec::new();
        for p in 0..nranks {
            if p == rank || self.recv[p].is_empty() {
                continue;
            }
            let len = self.recv[p].len() * stride * std::mem::size_of::<T>();
            recvs.push((p, self.comm.irecv(p, tags::HALO, len)));
        }

        let mut sends = Vec::new();
        for p in 0..nranks {
            if p == rank || self.send[p].is_empty() {
                continue;
            }
            let mut packed = Vec::with_capacity(self.send[p].len() * stride);
            for &lid in &self.send[p] {
                packed.extend_from_slice(&buf[lid * stride..(lid + 1) * stride]);
            }
            sends.push(self.comm.isend(p, tags::HALO, bytemuck::cast_slice(&packed)));
        }

        for (p, handle) in recvs {
            let bytes = handle.wait().ok_or_else(|| {
                RefineError::Communicator(format!("halo update from rank {p} returned no data"))
            })?;
            let values: Vec<T> = bytemuck::pod_collect_to_vec(&bytes);
            if values.len() != self.recv[p].len() * stride {
                return Err(RefineError::Communicator(format!(
                    "halo update from rank {p}: expected {} values, got {}",
                    self.recv[p].len() * stride,
                    values.len()
                )));
            }
            for (k, &lid) in self.recv[p].iter().enumerate() {
                buf[lid * stride..(lid + 1) * stride]
                    .copy_from_slice(&values[k * stride..(k + 1) * stride]);
            }
        }
        for handle in sends {
            handle.wait();
        }
        Ok(())
    }

    /// Rebuild vertex-to-element and vertex-to-vertex adjacency from the
    /// element-node list.
    pub fn create_adjacency(&mut self) {
        let nnodes = self.vertex_count();
        let mut nelist = vec![BTreeSet::new(); nnodes];
        for (e, elem) in self.enlist.chunks_exact(self.nloc).enumerate() {
            if elem[0] < 0 {
                continue;
            }
            for &n in elem {
                nelist[n as usize].insert(e);
            }
        }

        let enlist = &self.enlist;
        let nloc = self.nloc;
        let nnlist: Vec<Vec<Lid>> = (0..nnodes)
            .into_par_iter()
            .map(|v| {
                let mut nbrs: Vec<Lid> = Vec::new();
                for &e in &nelist[v] {
                    for &n in &enlist[e * nloc..(e + 1) * nloc] {
                        let n = n as Lid;
                        if n != v && !nbrs.contains(&n) {
                            nbrs.push(n);
                        }
                    }
                }
                nbrs
            })
            .collect();

        self.nnlist = nnlist;
        self.nelist = nelist;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::NoComm;

    fn identity_metric_2d(n: usize) -> Vec<f64> {
        let mut m = Vec::with_capacity(4 * n);
        for _ in 0..n {
            m.extend_from_slice(&[1.0, 0.0, 0.0, 1.0]);
        }
        m
    }

    fn unit_triangle() -> Mesh<NoComm> {
        Mesh::new(
            2,
            vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0],
            identity_metric_2d(3),
            vec![0, 1, 2],
            Arc::new(NoComm),
        )
        .unwrap()
    }

    #[test]
    fn construction_validates_shapes() {
        let err = Mesh::new(
            2,
            vec![0.0, 0.0, 1.0],
            identity_metric_2d(1),
            vec![],
            Arc::new(NoComm),
        );
        assert!(matches!(err, Err(RefineError::MalformedMesh(_))));

        let err = Mesh::new(
            4,
            vec![],
            vec![],
            vec![],
            Arc::new(NoComm),
        );
        assert!(matches!(err, Err(RefineError::UnsupportedDimension(4))));

        let err = Mesh::new(
            2,
            vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0],
            identity_metric_2d(3),
            vec![0, 1, 7],
            Arc::new(NoComm),
        );
        assert!(matches!(err, Err(RefineError::MalformedMesh(_))));
    }

    #[test]
    fn adjacency_from_elements() {
        let mesh = unit_triangle();
        assert_eq!(mesh.vertex_count(), 3);
        assert_eq!(mesh.element_count(), 1);
        for v in 0..3 {
            let mut nbrs = mesh.neighbours(v).to_vec();
            nbrs.sort_unstable();
            let expected: Vec<Lid> = (0..3).filter(|&u| u != v).collect();
            assert_eq!(nbrs, expected);
            assert_eq!(mesh.nelist[v].len(), 1);
        }
    }

    #[test]
    fn edge_length_under_metric() {
        let mesh = unit_triangle();
        assert!((mesh.calc_edge_length(0, 1) - 1.0).abs() < 1e-12);
        assert!((mesh.calc_edge_length(1, 2) - 2.0f64.sqrt()).abs() < 1e-12);
        // Symmetric in its arguments.
        assert_eq!(mesh.calc_edge_length(1, 2), mesh.calc_edge_length(2, 1));
    }

    #[test]
    fn erase_element_hides_it() {
        let mut mesh = unit_triangle();
        assert_eq!(mesh.live_elements().count(), 1);
        mesh.erase_element(0);
        assert!(mesh.is_erased(0));
        assert_eq!(mesh.live_elements().count(), 0);
    }

    #[test]
    fn get_new_vertex_reads_lower_gid_slot() {
        let mesh = unit_triangle();
        let refined = RefinedEdges::for_adjacency(&mesh.nnlist);
        let lnn2gnn: Vec<Gid> = vec![10, 11, 12];
        assert_eq!(mesh.get_new_vertex(1, 2, &refined, &lnn2gnn), -1);

        // Stage the edge (1, 2) at vertex 1, the lower-gid endpoint.
        let pos = mesh.neighbours(1).iter().position(|&u| u == 2).unwrap();
        refined.stage(1, pos, 0, 0);
        refined.finalise(&[3]);
        assert_eq!(mesh.get_new_vertex(1, 2, &refined, &lnn2gnn), 3);
        assert_eq!(mesh.get_new_vertex(2, 1, &refined, &lnn2gnn), 3);
    }

    #[test]
    fn halo_update_two_ranks() {
        use crate::comm::RayonComm;
        const SHIFT: u16 = 300;

        // Rank 0 owns vertices {0, 1}; rank 1 owns {2}. Each rank holds a
        // ghost copy of the other's boundary vertex.
        let spawn = |rank: usize| {
            std::thread::spawn(move || {
                let comm = Arc::new(RayonComm::with_tag_shift(rank, 2, SHIFT));
                let (coords, send, recv) = if rank == 0 {
                    (
                        vec![0.0, 0.0, 1.0, 0.0, 2.0, 0.0],
                        vec![vec![], vec![1]],
                        vec![vec![], vec![2]],
                    )
                } else {
                    (
                        vec![1.0, 0.0, 2.0, 0.0, 3.0, 0.0],
                        vec![vec![1], vec![]],
                        vec![vec![0], vec![]],
                    )
                };
                let n = coords.len() / 2;
                let mesh = Mesh::with_halo(
                    2,
                    coords,
                    identity_metric_2d(n),
                    vec![0, 1, 2],
                    send,
                    recv,
                    comm,
                )
                .unwrap();
                let mut vals: Vec<i64> = if rank == 0 {
                    vec![100, 101, -1]
                } else {
                    vec![-1, 200, 201]
                };
                mesh.halo_update(&mut vals, 1).unwrap();
                vals
            })
        };
        let r0 = spawn(0);
        let r1 = spawn(1);
        assert_eq!(r0.join().unwrap(), vec![100, 101, 200]);
        assert_eq!(r1.join().unwrap(), vec![101, 200, 201]);
    }
}
