//! Divergence-driven control-flow transformation for the lanevec region vectorizer.
//!
//! This crate rewrites a scalar control-flow region so that its *dynamic* control flow
//! is identical across all W lanes, while per-lane behavior is preserved as data flow:
//!
//! * [linearize] — walks the region in a loop-aware topological order, folds branches
//!   on non-uniform conditions into straight-line relay chains, rewrites the affected
//!   φ nodes into mask-driven select chains, and keeps the dominator tree in repair.
//! * Divergent loop normalization (run by the linearizer at each divergent loop
//!   header) — turns loops that different lanes leave on different iterations into
//!   single-exit, latch-exiting loops that iterate until no lane is live, tracking
//!   live-out values per lane along the way.
//!
//! The approach follows the whole-function vectorization model of Karrenberg and Hack
//! ("Whole-Function Vectorization", CGO 2011): control flow to data flow conversion
//! driven by per-value vector shapes and per-edge masks. Shape and mask *analysis* are
//! inputs here (see `lanevec-analysis`); instruction widening is a downstream pass.
//!
//! All preconditions are enforced with assertions: the transform either completes or
//! aborts, and a failed region leaves the IR in an unspecified state (the caller is
//! expected to discard it).

mod divloop;
mod index;
mod linearize;
mod promote;
mod relay;

pub use self::{index::BlockIndex, linearize::Linearizer};

use lanevec_analysis::{MaskTable, PlatformInfo, VectorizationContext};
use lanevec_ir::{ControlFlowGraph, DominatorTree, Function, LoopForest};

/// Linearize the region described by `ctx`, normalizing divergent loops on the way.
///
/// This is the whole-pipeline convenience wrapper: it computes the CFG, dominator tree
/// and loop forest itself, derives the control classification, and hands everything to
/// [Linearizer]. Returns the dominator tree of the transformed function.
pub fn vectorize_region(
    func: &mut Function,
    ctx: &mut VectorizationContext,
    masks: &mut MaskTable,
    platform: &PlatformInfo,
) -> DominatorTree {
    let cfg = ControlFlowGraph::with_function(func);
    let domtree = DominatorTree::with_function(func, &cfg);
    let forest = LoopForest::compute(func, &cfg, &domtree);
    ctx.classify_control(func, &cfg, &forest);
    Linearizer::new(func, ctx, masks, platform, cfg, domtree, forest).run()
}

#[cfg(test)]
mod tests;
