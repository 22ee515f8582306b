use cranelift_entity::SecondaryMap;
use lanevec_analysis::Region;
use lanevec_ir::{Block, ControlFlowGraph, Function, FxHashMap, LoopForest, LoopId, SmallVec};

/// A total topological order of the in-region blocks that keeps every loop contiguous.
///
/// For every loop L wholly inside the region, the indices of L's blocks form the
/// contiguous range `[index(header), index(latch)]`: the header opens the range, the
/// latch closes it, and every index in between belongs to L. The linearizer's relay
/// chain is ordered by these indices, so contiguity is what guarantees that targets
/// scheduled inside a loop are reached before the loop's exits.
///
/// The order is computed with a worklist: a block becomes eligible once every
/// in-region, non-back-edge predecessor has been indexed, and while a loop is "open"
/// (its header indexed, its latch not yet) only blocks of that loop may be indexed;
/// anything else is deferred until the loop closes. Non-canonical input — in
/// particular anything that leaves a block unindexable — is a precondition violation
/// and panics.
pub struct BlockIndex {
    order: Vec<Block>,
    /// 1-based index; 0 means the block is not part of the order
    position: SecondaryMap<Block, u32>,
}

impl BlockIndex {
    pub fn compute(
        func: &Function,
        region: &Region,
        cfg: &ControlFlowGraph,
        forest: &LoopForest,
    ) -> Self {
        // Latches are needed to close loop ranges; a loop without a single latch is
        // outside the canonical form this transform accepts.
        let mut latches: FxHashMap<LoopId, Block> = FxHashMap::default();
        for l in forest.loops_in_preorder() {
            if region.contains(forest.header(l)) {
                let latch = forest
                    .loop_latch(cfg, l)
                    .unwrap_or_else(|| panic!("{l} has no unique latch"));
                latches.insert(l, latch);
            }
        }

        // Outstanding non-back-edge in-region predecessors per block.
        let mut remaining: SecondaryMap<Block, u32> = SecondaryMap::new();
        for block in func.blocks().filter(|b| region.contains(*b)) {
            let count = cfg
                .pred(block)
                .iter()
                .filter(|p| region.contains(**p) && !is_backedge(forest, **p, block))
                .count();
            remaining[block] = count as u32;
        }

        let mut this = Self {
            order: Vec::with_capacity(region.len()),
            position: SecondaryMap::new(),
        };

        let mut stack: Vec<Block> = vec![region.entry()];
        let mut deferred: Vec<Block> = Vec::new();
        let mut open_loops: Vec<LoopId> = Vec::new();

        while let Some(block) = stack.pop() {
            if this.position[block] != 0 || remaining[block] > 0 {
                // Not ready; the last predecessor to be indexed re-pushes it.
                continue;
            }
            if let Some(&innermost) = open_loops.last() {
                if !forest.contains_block(innermost, block) {
                    // Outside the open loop; wait for its range to close.
                    deferred.push(block);
                    continue;
                }
            }

            // Opening a loop: its header is indexed first, and from here to the latch
            // only members of the loop are eligible.
            if let Some(l) = forest.loop_for(block) {
                if forest.header(l) == block {
                    open_loops.push(l);
                }
            }

            this.order.push(block);
            this.position[block] = this.order.len() as u32;

            let mut closed = false;
            while let Some(&innermost) = open_loops.last() {
                if latches.get(&innermost) == Some(&block) {
                    debug_assert!(
                        forest.blocks(innermost).iter().all(|b| this.position[*b] != 0),
                        "{innermost} closed with unindexed blocks"
                    );
                    open_loops.pop();
                    closed = true;
                } else {
                    break;
                }
            }
            if closed {
                stack.append(&mut deferred);
            }

            let mut succs: SmallVec<[Block; 2]> = SmallVec::new();
            for succ in func.successors(block) {
                if region.contains(succ)
                    && !is_backedge(forest, block, succ)
                    && !succs.contains(&succ)
                {
                    succs.push(succ);
                }
            }
            for succ in succs {
                remaining[succ] -= 1;
                stack.push(succ);
            }
        }

        if this.order.len() != region.len() {
            let stuck = func
                .blocks()
                .find(|b| region.contains(*b) && this.position[*b] == 0)
                .expect("index shorter than the region, yet every block is indexed");
            panic!("{stuck} could not be scheduled; the region is not reducible-canonical");
        }

        // Every in-region loop must occupy the contiguous range [header, latch].
        for (l, latch) in latches.iter() {
            let start = this.expect(forest.header(*l));
            let end = this.expect(*latch);
            assert_eq!(
                end - start + 1,
                forest.blocks(*l).len(),
                "{l} does not span a contiguous index range"
            );
            for block in forest.blocks(*l) {
                let at = this.expect(*block);
                assert!(
                    (start..=end).contains(&at),
                    "{block} of {l} was indexed outside the loop's range"
                );
            }
        }

        this
    }

    /// The number of indexed blocks
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// The position of `block` in the order, if it is part of the region
    pub fn get(&self, block: Block) -> Option<usize> {
        match self.position[block] {
            0 => None,
            n => Some((n - 1) as usize),
        }
    }

    /// As [Self::get], but an unindexed block is fatal.
    pub fn expect(&self, block: Block) -> usize {
        self.get(block)
            .unwrap_or_else(|| panic!("{block} is not part of the region index"))
    }

    /// The block at position `index`
    pub fn block_at(&self, index: usize) -> Block {
        self.order[index]
    }
}

/// Returns true if the edge `from -> to` is a loop back edge, i.e. `to` is the header
/// of a loop containing `from`.
pub(crate) fn is_backedge(forest: &LoopForest, from: Block, to: Block) -> bool {
    forest
        .loop_for(to)
        .is_some_and(|l| forest.header(l) == to && forest.contains_block(l, from))
}
