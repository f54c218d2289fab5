//! Unified error type for mesh-refine public APIs.
//!
//! Every fallible operation in this crate reports through [`RefineError`];
//! malformed input never panics. Errors surface to the caller of
//! [`Refine::refine`](crate::refine::Refine::refine) and nothing is retried.

use thiserror::Error;

/// Unified error type for refinement operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RefineError {
    /// The requested edge-length bound is not a strictly positive finite scalar.
    #[error("edge-length bound must be positive and finite, got {0}")]
    InvalidBound(f64),

    /// The mesh dimensionality is neither 2 nor 3.
    #[error("unsupported mesh dimension {0} (expected 2 or 3)")]
    UnsupportedDimension(usize),

    /// An interpolated metric component came out non-finite. Reports the
    /// contributing endpoint components and the interpolation weight.
    #[error("interpolated metric component is not finite (m0 = {m0}, m1 = {m1}, weight = {weight})")]
    MetricCorruption { m0: f64, m1: f64, weight: f64 },

    /// A collective or point-to-point communication primitive failed.
    #[error("communicator failure: {0}")]
    Communicator(String),

    /// A 3D element carried a split pattern outside the legal template set
    /// after conforming propagation. Can only arise from a bug.
    #[error("element {element} has an illegal split pattern of {count} edges")]
    IllegalSplitPattern { element: usize, count: usize },

    /// Two element corners were not adjacent in the vertex adjacency lists.
    #[error("vertices {0} and {1} are not mesh neighbours")]
    NotAdjacent(usize, usize),

    /// A global id had no local counterpart in the inverse numbering table.
    #[error("global id {0} is unknown on this rank")]
    UnknownGlobalId(i64),

    /// Mesh or surface arrays were inconsistent with the declared shape.
    #[error("malformed mesh: {0}")]
    MalformedMesh(String),
}
