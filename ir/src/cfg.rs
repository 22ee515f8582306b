//! Control-flow graph utilities: predecessor tables and depth-first traversal.

use cranelift_entity::SecondaryMap;
use smallvec::SmallVec;

use crate::{Block, Function};

/// The predecessor table of a function's CFG.
///
/// Successors are read straight off block terminators; predecessors are the inverse
/// relation and must be recomputed after the CFG is mutated. Predecessor lists are
/// deduplicated, so a conditional branch with both arms targeting the same block
/// contributes a single entry.
#[derive(Default)]
pub struct ControlFlowGraph {
    preds: SecondaryMap<Block, SmallVec<[Block; 4]>>,
}

impl ControlFlowGraph {
    pub fn with_function(func: &Function) -> Self {
        let mut cfg = Self::default();
        cfg.compute(func);
        cfg
    }

    /// Recompute the entire predecessor table from `func`
    pub fn compute(&mut self, func: &Function) {
        self.preds = SecondaryMap::new();
        for block in func.blocks() {
            for succ in func.successors(block) {
                if !self.preds[succ].contains(&block) {
                    self.preds[succ].push(block);
                }
            }
        }
    }

    /// The unique predecessors of `block`
    pub fn pred(&self, block: Block) -> &[Block] {
        &self.preds[block]
    }

    pub fn num_preds(&self, block: Block) -> usize {
        self.preds[block].len()
    }
}

/// Compute a post-order of the blocks reachable from `entry`.
///
/// Successors are visited in successor-index order, so the traversal is deterministic.
pub fn postorder(func: &Function, entry: Block) -> Vec<Block> {
    let mut visited: SecondaryMap<Block, bool> = SecondaryMap::new();
    let mut order = Vec::new();
    let mut stack: Vec<(Block, usize)> = vec![(entry, 0)];
    visited[entry] = true;
    while let Some(&(block, i)) = stack.last() {
        let succs = func.successors(block);
        if let Some(&succ) = succs.get(i) {
            stack.last_mut().unwrap().1 = i + 1;
            if func.is_block_alive(succ) && !visited[succ] {
                visited[succ] = true;
                stack.push((succ, 0));
            }
        } else {
            order.push(block);
            stack.pop();
        }
    }
    order
}

/// Compute a reverse post-order of the blocks reachable from `entry`
pub fn reverse_postorder(func: &Function, entry: Block) -> Vec<Block> {
    let mut order = postorder(func, entry);
    order.reverse();
    order
}
