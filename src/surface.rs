//! Boundary surface descriptor.
//!
//! The surface tracks the boundary facets of the volume mesh: segments in
//! 2D, triangles in 3D, each tagged with a boundary id. After the volume
//! pass has materialised new vertices, [`Surface::refine`] subdivides every
//! facet whose edges received a new vertex, using the same vertex identities
//! as the volume subdivision so the boundary stays conforming. Children
//! inherit the parent's boundary id.

use crate::comm::Communicator;
use crate::edge::RefinedEdges;
use crate::error::RefineError;
use crate::mesh::Mesh;
use crate::{Gid, Lid};

pub struct Surface {
    ndims: usize,
    snloc: usize,
    senlist: Vec<i64>,
    boundary_ids: Vec<i32>,
}

impl Surface {
    /// A surface with no facets; the refinement pass is then a no-op.
    pub fn empty(ndims: usize) -> Result<Self, RefineError> {
        Self::from_facets(ndims, Vec::new(), Vec::new())
    }

    /// Build a surface from a flat facet-node list (stride `ndims`) and one
    /// boundary id per facet.
    pub fn from_facets(
        ndims: usize,
        senlist: Vec<i64>,
        boundary_ids: Vec<i32>,
    ) -> Result<Self, RefineError> {
        if ndims != 2 && ndims != 3 {
            return Err(RefineError::UnsupportedDimension(ndims));
        }
        let snloc = ndims;
        if senlist.len() % snloc != 0 {
            return Err(RefineError::MalformedMesh(format!(
                "facet array length {} is not a multiple of {snloc}",
                senlist.len()
            )));
        }
        if senlist.len() / snloc != boundary_ids.len() {
            return Err(RefineError::MalformedMesh(format!(
                "{} facets but {} boundary ids",
                senlist.len() / snloc,
                boundary_ids.len()
            )));
        }
        Ok(Self {
            ndims,
            snloc,
            senlist,
            boundary_ids,
        })
    }

    #[inline]
    pub fn dims(&self) -> usize {
        self.ndims
    }

    #[inline]
    pub fn facet_count(&self) -> usize {
        self.boundary_ids.len()
    }

    #[inline]
    pub fn facet(&self, i: usize) -> &[i64] {
        &self.senlist[i * self.snloc..(i + 1) * self.snloc]
    }

    #[inline]
    pub fn boundary_id(&self, i: usize) -> i32 {
        self.boundary_ids[i]
    }

    #[inline]
    pub fn is_erased(&self, i: usize) -> bool {
        self.senlist[i * self.snloc] < 0
    }

    /// Facets that have not been erased, with their boundary ids.
    pub fn live_facets(&self) -> impl Iterator<Item = (&[i64], i32)> {
        self.senlist
            .chunks_exact(self.snloc)
            .zip(self.boundary_ids.iter())
            .filter(|(f, _)| f[0] >= 0)
            .map(|(f, &id)| (f, id))
    }

    fn append(&mut self, facet: &[i64], id: i32) {
        self.senlist.extend_from_slice(facet);
        self.boundary_ids.push(id);
    }

    /// Subdivide every facet split by the volume pass. `refined` must
    /// already be finalised so slots hold absolute local ids.
    pub fn refine<C: Communicator>(
        &mut self,
        mesh: &Mesh<C>,
        refined: &RefinedEdges,
        lnn2gnn: &[Gid],
    ) -> Result<(), RefineError> {
        let orig_facets = self.facet_count();
        for i in 0..orig_facets {
            if self.is_erased(i) {
                continue;
            }
            if self.ndims == 2 {
                self.refine_segment(i, mesh, refined, lnn2gnn);
            } else {
                self.refine_triangle(i, mesh, refined, lnn2gnn)?;
            }
        }
        Ok(())
    }

    fn refine_segment<C: Communicator>(
        &mut self,
        i: usize,
        mesh: &Mesh<C>,
        refined: &RefinedEdges,
        lnn2gnn: &[Gid],
    ) {
        let (n0, n1) = (self.senlist[2 * i], self.senlist[2 * i + 1]);
        let v = mesh.get_new_vertex(n0 as Lid, n1 as Lid, refined, lnn2gnn);
        if v < 0 {
            return;
        }
        let id = self.boundary_ids[i];
        self.senlist[2 * i] = -1;
        self.append(&[n0, v], id);
        self.append(&[v, n1], id);
    }

    fn refine_triangle<C: Communicator>(
        &mut self,
        i: usize,
        mesh: &Mesh<C>,
        refined: &RefinedEdges,
        lnn2gnn: &[Gid],
    ) -> Result<(), RefineError> {
        let n: [i64; 3] = [
            self.senlist[3 * i],
            self.senlist[3 * i + 1],
            self.senlist[3 * i + 2],
        ];
        // The k-th entry is the new vertex on the edge opposite corner k.
        let mut new_vertex = [-1i64; 3];
        for k in 0..3 {
            new_vertex[k] = mesh.get_new_vertex(
                n[(k + 1) % 3] as Lid,
                n[(k + 2) % 3] as Lid,
                refined,
                lnn2gnn,
            );
        }
        let refine_cnt = new_vertex.iter().filter(|&&v| v >= 0).count();
        if refine_cnt == 0 {
            return Ok(());
        }

        let id = self.boundary_ids[i];
        self.senlist[3 * i] = -1;
        match refine_cnt {
            1 => {
                let j = (0..3).position(|k| new_vertex[k] >= 0).unwrap_or(0);
                let v = new_vertex[j];
                let rot = [n[j], n[(j + 1) % 3], n[(j + 2) % 3]];
                self.append(&[rot[0], rot[1], v], id);
                self.append(&[rot[0], v, rot[2]], id);
            }
            2 => {
                let j = (0..3).position(|k| new_vertex[k] < 0).unwrap_or(0);
                let v = [new_vertex[(j + 1) % 3], new_vertex[(j + 2) % 3]];
                let rot = [n[j], n[(j + 1) % 3], n[(j + 2) % 3]];
                let ldiag0 = mesh.calc_edge_length(v[0] as Lid, rot[1] as Lid);
                let ldiag1 = mesh.calc_edge_length(v[1] as Lid, rot[2] as Lid);
                let offset = if ldiag0 < ldiag1 { 0 } else { 1 };
                self.append(&[rot[0], v[1], v[0]], id);
                self.append(&[v[offset], rot[1], rot[2]], id);
                self.append(&[v[0], v[1], rot[offset + 1]], id);
            }
            3 => {
                self.append(&[n[0], new_vertex[2], new_vertex[1]], id);
                self.append(&[n[1], new_vertex[0], new_vertex[2]], id);
                self.append(&[n[2], new_vertex[1], new_vertex[0]], id);
                self.append(&[new_vertex[0], new_vertex[1], new_vertex[2]], id);
            }
            c => {
                return Err(RefineError::IllegalSplitPattern {
                    element: i,
                    count: c,
                })
            }
        }
        Ok(())
    }
}
