//! # mesh-refine
//!
//! mesh-refine is an anisotropic refinement engine for distributed simplicial
//! meshes (triangles in 2D, tetrahedra in 3D). Every vertex carries a
//! symmetric positive-definite metric tensor; the engine subdivides elements
//! until no edge is longer than a caller-supplied bound in the interpolated
//! Riemannian metric.
//!
//! ## How a pass works
//! 1. Global vertex numbering: a rank prefix sum plus a halo exchange gives
//!    every vertex a partition-independent id for the duration of the pass.
//! 2. Edge selection: each over-long edge gets a new vertex at a
//!    metric-weighted position, staged in producer-private buffers.
//! 3. Conforming propagation (3D): extra edges are marked until every
//!    element's split pattern has a legal subdivision template.
//! 4. Element subdivision: split elements are replaced by the canonical
//!    sub-elements for their pattern.
//! 5. Finalisation: ownership and send/receive lists are re-established for
//!    new vertices, inverted sub-elements are flipped, the boundary surface
//!    is subdivided with the same vertex identities, and adjacency is
//!    rebuilt.
//!
//! ## Usage
//! ```
//! use std::sync::Arc;
//! use mesh_refine::prelude::*;
//!
//! // A single right triangle with the identity metric.
//! let metric = vec![
//!     1.0, 0.0, 0.0, 1.0,
//!     1.0, 0.0, 0.0, 1.0,
//!     1.0, 0.0, 0.0, 1.0,
//! ];
//! let mut mesh = Mesh::new(
//!     2,
//!     vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0],
//!     metric,
//!     vec![0, 1, 2],
//!     Arc::new(NoComm),
//! )?;
//! let mut surface = Surface::empty(2)?;
//! Refine::new(&mut mesh, &mut surface)?.refine(0.9)?;
//! assert_eq!(mesh.vertex_count(), 6);
//! # Ok::<(), mesh_refine::error::RefineError>(())
//! ```
//!
//! ## Parallelism
//! Work inside one partition is divided across a fixed team of producers
//! (rayon); between partitions the communicator supplies the prefix-sum,
//! all-reduce, and halo-exchange primitives. Enable the `mpi-support`
//! feature for the MPI backend.

pub mod comm;
pub mod edge;
pub mod error;
pub mod geometry;
pub mod mesh;
pub mod refine;
pub mod surface;

/// Partition-local vertex id: a dense index into the vertex arrays.
pub type Lid = usize;
/// Global vertex id, unique across the partition group. Transient: only
/// meaningful during a refinement pass.
pub type Gid = i64;
/// Rank within the partition group.
pub type Rank = usize;

/// The most-used traits and types.
pub mod prelude {
    #[cfg(feature = "mpi-support")]
    pub use crate::comm::MpiComm;
    pub use crate::comm::{Communicator, NoComm, RayonComm};
    pub use crate::edge::{DirectedEdge, Edge, RefinedEdges};
    pub use crate::error::RefineError;
    pub use crate::geometry::ElementGeometry;
    pub use crate::mesh::Mesh;
    pub use crate::refine::Refine;
    pub use crate::surface::Surface;
    pub use crate::{Gid, Lid, Rank};
}
