use lanevec_ir::{Block, FxHashMap, LoopId, Value};

/// The edge- and loop-mask interface the vectorizer core consumes.
///
/// Mask *computation* is upstream: the mask analysis decides, per CFG edge, the SSA
/// value carrying the per-lane predicate under which that edge is taken, and per loop
/// the combined predicate of lanes leaving it on the current iteration. This table is
/// how those results are handed to the loop normalizer and the linearizer.
///
/// Edges are keyed `(block, successor_index)` against the block's *original*
/// terminator: the linearizer reads masks for edges it is about to fold away, so the
/// keys outlive the edges themselves.
#[derive(Default)]
pub struct MaskTable {
    exit_masks: FxHashMap<(Block, usize), Value>,
    combined_loop_exit: FxHashMap<LoopId, Value>,
}

impl MaskTable {
    /// The mask of the edge leaving `block` through successor `succ_idx`
    pub fn exit_mask(&self, block: Block, succ_idx: usize) -> Option<Value> {
        self.exit_masks.get(&(block, succ_idx)).copied()
    }

    /// As [Self::exit_mask], but a missing mask is fatal (an analysis gap).
    pub fn expect_exit_mask(&self, block: Block, succ_idx: usize) -> Value {
        self.exit_mask(block, succ_idx).unwrap_or_else(|| {
            panic!("no exit mask recorded for {block} successor {succ_idx}")
        })
    }

    pub fn set_exit_mask(&mut self, block: Block, succ_idx: usize, mask: Value) {
        self.exit_masks.insert((block, succ_idx), mask);
    }

    /// Replace all successor masks of `block` at once, in successor-index order
    pub fn update_exit_masks(&mut self, block: Block, masks: &[Value]) {
        self.exit_masks.retain(|(b, _), _| *b != block);
        for (succ_idx, mask) in masks.iter().enumerate() {
            self.exit_masks.insert((block, succ_idx), *mask);
        }
    }

    /// The per-lane predicate of lanes leaving `l` through any exit on the current
    /// iteration
    pub fn combined_loop_exit_mask(&self, l: LoopId) -> Option<Value> {
        self.combined_loop_exit.get(&l).copied()
    }

    pub fn expect_combined_loop_exit_mask(&self, l: LoopId) -> Value {
        self.combined_loop_exit_mask(l)
            .unwrap_or_else(|| panic!("no combined exit mask recorded for {l}"))
    }

    pub fn set_combined_loop_exit_mask(&mut self, l: LoopId, mask: Value) {
        self.combined_loop_exit.insert(l, mask);
    }
}
