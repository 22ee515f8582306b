//! Vector-shape and divergence bookkeeping for the lanevec region vectorizer.
//!
//! This crate owns the analysis-facing data model the transforms consume:
//!
//! * [VectorShape] — the per-value shape lattice, with its human-readable codec
//! * [Region] — the subset of a function the vectorizer is allowed to touch
//! * [VectorizationContext] — per-region shapes, predicates and divergence flags
//! * [MaskTable] — the edge/loop-exit mask interface filled in by mask analysis
//! * [PlatformInfo] — naming and declaration of the lane-reduction intrinsics
//!
//! The actual shape *propagation* (from argument shapes through the dataflow) and the
//! mask *computation* live upstream; everything here is the contract those analyses
//! populate and the linearizer and loop normalizer read.

mod context;
mod masks;
mod platform;
mod region;
mod shape;

pub use self::{
    context::{VectorMapping, VectorizationContext},
    masks::MaskTable,
    platform::PlatformInfo,
    region::Region,
    shape::{parse_shapes, ShapeParseError, VectorShape},
};
