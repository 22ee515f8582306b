//! Natural-loop discovery and queries.
//!
//! [LoopForest] identifies natural loops and the loop nesting structure of a function.
//! A natural loop has exactly one entry point, its header; note that several loops may
//! share a header, in which case they are discovered as one. The analysis finds loops,
//! not cycles: irreducible SCCs are not represented, and downstream passes reject them
//! through their own preconditions.
//!
//! Discovery walks the dominator tree in post-order and, for each block with a
//! dominated back edge, performs a backward CFG traversal to map the loop's blocks,
//! skipping already-discovered inner loops. A single forward CFG traversal then
//! populates the per-loop block and child lists. For the terminology used throughout
//! (header, latch, preheader, exiting/exit blocks), see
//! [Loop Terminology](https://llvm.org/docs/LoopTerminology.html).

use cranelift_entity::{entity_impl, packed_option::PackedOption, PrimaryMap, SecondaryMap};
use miette::Report;
use rustc_hash::FxHashSet;
use smallvec::SmallVec;

use crate::{cfg, Block, ControlFlowGraph, DominatorTree, Function};

/// A handle to a loop in a [LoopForest].
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoopId(u32);
entity_impl!(LoopId, "loop");

/// A loop edge: `(inside_block, outside_block)`.
pub type LoopEdge = (Block, Block);

struct LoopData {
    parent: PackedOption<LoopId>,
    nested: SmallVec<[LoopId; 2]>,
    /// The blocks of the loop; the header is always at index 0
    blocks: SmallVec<[Block; 8]>,
    block_set: FxHashSet<Block>,
}

impl LoopData {
    fn new(header: Block) -> Self {
        let mut block_set = FxHashSet::default();
        block_set.insert(header);
        Self {
            parent: PackedOption::default(),
            nested: SmallVec::new(),
            blocks: SmallVec::from_slice(&[header]),
            block_set,
        }
    }
}

/// All of the natural loops of a function, with their nesting structure.
#[derive(Default)]
pub struct LoopForest {
    loops: PrimaryMap<LoopId, LoopData>,
    top_level: SmallVec<[LoopId; 4]>,
    /// Maps each block to the innermost loop containing it
    block_map: SecondaryMap<Block, PackedOption<LoopId>>,
}

impl LoopForest {
    /// Compute the loop forest for `func` from its dominator tree
    pub fn compute(func: &Function, cfg: &ControlFlowGraph, domtree: &DominatorTree) -> Self {
        let mut forest = Self::default();
        forest.analyze(func, cfg, domtree);
        forest
    }

    /// Returns true if there are no loops in the forest
    pub fn is_empty(&self) -> bool {
        self.top_level.is_empty()
    }

    /// The number of loops in the forest, including nested ones
    pub fn len(&self) -> usize {
        self.loops.len()
    }

    /// The set of outermost loops
    pub fn top_level_loops(&self) -> &[LoopId] {
        &self.top_level
    }

    /// The innermost loop containing `block`, if any
    pub fn loop_for(&self, block: Block) -> Option<LoopId> {
        self.block_map[block].expand()
    }

    /// The loop nesting depth of `block`; 0 for blocks outside any loop
    pub fn loop_depth(&self, block: Block) -> usize {
        self.loop_for(block).map(|l| self.depth(l)).unwrap_or(0)
    }

    /// Returns true if `block` is the header of the innermost loop containing it
    pub fn is_loop_header(&self, block: Block) -> bool {
        self.loop_for(block).is_some_and(|l| self.header(l) == block)
    }

    /// The header block of `l`
    pub fn header(&self, l: LoopId) -> Block {
        self.loops[l].blocks[0]
    }

    /// The parent loop of `l`, or `None` if it is outermost
    pub fn parent_loop(&self, l: LoopId) -> Option<LoopId> {
        self.loops[l].parent.expand()
    }

    /// The loops contained entirely within `l`
    pub fn nested(&self, l: LoopId) -> &[LoopId] {
        &self.loops[l].nested
    }

    /// The nesting level of `l`; an outermost loop has depth 1
    pub fn depth(&self, l: LoopId) -> usize {
        let mut depth = 1;
        let mut current = self.parent_loop(l);
        while let Some(parent) = current {
            depth += 1;
            current = self.parent_loop(parent);
        }
        depth
    }

    /// The blocks of `l`, header first
    pub fn blocks(&self, l: LoopId) -> &[Block] {
        &self.loops[l].blocks
    }

    /// Returns true if `block` belongs to `l` (or one of its nested loops)
    pub fn contains_block(&self, l: LoopId, block: Block) -> bool {
        self.loops[l].block_set.contains(&block)
    }

    /// Returns true if `l` contains `other` (reflexively)
    pub fn contains_loop(&self, l: LoopId, other: LoopId) -> bool {
        let mut current = Some(other);
        while let Some(cursor) = current {
            if cursor == l {
                return true;
            }
            current = self.parent_loop(cursor);
        }
        false
    }

    /// All loops in the forest in preorder across the loop nests, outer loops before
    /// their nested loops
    pub fn loops_in_preorder(&self) -> SmallVec<[LoopId; 4]> {
        let mut preorder = SmallVec::new();
        let mut worklist: SmallVec<[LoopId; 4]> =
            self.top_level.iter().rev().copied().collect();
        while let Some(l) = worklist.pop() {
            worklist.extend(self.loops[l].nested.iter().rev().copied());
            preorder.push(l);
        }
        preorder
    }

    /// Returns true if the terminator of `block` can branch out of `l`.
    ///
    /// # Panics
    ///
    /// Panics if `block` is not inside `l`.
    pub fn is_loop_exiting(&self, func: &Function, l: LoopId, block: Block) -> bool {
        assert!(
            self.contains_block(l, block),
            "exiting {block} must be part of the loop"
        );
        func.successors(block).iter().any(|succ| !self.contains_block(l, *succ))
    }

    /// The blocks of `l` with at least one successor outside of it
    pub fn exiting_blocks(&self, func: &Function, l: LoopId) -> SmallVec<[Block; 2]> {
        let mut exiting = SmallVec::new();
        for &block in self.blocks(l) {
            if func.successors(block).iter().any(|succ| !self.contains_block(l, *succ)) {
                exiting.push(block);
            }
        }
        exiting
    }

    /// The unique blocks outside of `l` that are branched to from inside it
    pub fn exit_blocks(&self, func: &Function, l: LoopId) -> SmallVec<[Block; 2]> {
        let mut seen = FxHashSet::default();
        let mut exits = SmallVec::new();
        for &block in self.blocks(l) {
            for succ in func.successors(block) {
                if !self.contains_block(l, succ) && seen.insert(succ) {
                    exits.push(succ);
                }
            }
        }
        exits
    }

    /// All `(inside_block, outside_block)` exit edges of `l`
    pub fn exit_edges(&self, func: &Function, l: LoopId) -> SmallVec<[LoopEdge; 2]> {
        let mut edges = SmallVec::new();
        for &block in self.blocks(l) {
            for succ in func.successors(block) {
                if !self.contains_block(l, succ) {
                    edges.push((block, succ));
                }
            }
        }
        edges
    }

    /// The unique predecessor of the header outside the loop, if there is exactly one.
    ///
    /// This is weaker than [Self::preheader], which additionally requires the
    /// predecessor to have a single successor.
    pub fn loop_predecessor(&self, cfg: &ControlFlowGraph, l: LoopId) -> Option<Block> {
        let mut out = None;
        for &pred in cfg.pred(self.header(l)) {
            if !self.contains_block(l, pred) {
                if out.is_some_and(|out| out != pred) {
                    return None;
                }
                out = Some(pred);
            }
        }
        out
    }

    /// The preheader of `l`: the single out-of-loop predecessor of the header, provided
    /// it branches only to the header.
    pub fn preheader(
        &self,
        func: &Function,
        cfg: &ControlFlowGraph,
        l: LoopId,
    ) -> Option<Block> {
        let out = self.loop_predecessor(cfg, l)?;
        if func.successors(out).len() != 1 {
            return None;
        }
        Some(out)
    }

    /// The single latch block of `l`, if there is exactly one.
    ///
    /// A latch is a block with a branch back to the header.
    pub fn loop_latch(&self, cfg: &ControlFlowGraph, l: LoopId) -> Option<Block> {
        let mut latch = None;
        for &pred in cfg.pred(self.header(l)) {
            if self.contains_block(l, pred) {
                if latch.is_some() {
                    return None;
                }
                latch = Some(pred);
            }
        }
        latch
    }

    fn outermost(&self, l: LoopId) -> LoopId {
        let mut l = l;
        while let Some(parent) = self.parent_loop(l) {
            l = parent;
        }
        l
    }

    /// Discover the loops of `func`, replacing any previous contents of the forest.
    fn analyze(&mut self, func: &Function, cfg: &ControlFlowGraph, domtree: &DominatorTree) {
        self.loops = PrimaryMap::new();
        self.top_level = SmallVec::new();
        self.block_map = SecondaryMap::new();

        let entry = func.entry_block();

        // Post-order walk of the dominator tree: visit each potential header after all
        // blocks it dominates.
        for header in domtree_postorder(func, domtree, entry) {
            let mut backedges = SmallVec::<[Block; 4]>::new();
            for &pred in cfg.pred(header) {
                if domtree.is_reachable(pred) && domtree.dominates(header, pred) {
                    backedges.push(pred);
                }
            }
            if !backedges.is_empty() {
                let l = self.loops.push(LoopData::new(header));
                self.discover_and_map_sub_loop(l, backedges, cfg, domtree);
            }
        }

        // A single forward CFG traversal populates blocks and child loops for all loops.
        for block in cfg::postorder(func, entry) {
            self.insert_into_loop(block);
        }
    }

    /// Backward CFG traversal from the backedges of `l`, mapping undiscovered blocks to
    /// `l` and re-parenting already-discovered inner loops.
    fn discover_and_map_sub_loop(
        &mut self,
        l: LoopId,
        backedges: SmallVec<[Block; 4]>,
        cfg: &ControlFlowGraph,
        domtree: &DominatorTree,
    ) {
        let header = self.header(l);
        let mut worklist = backedges;
        while let Some(pred) = worklist.pop() {
            match self.block_map[pred].expand() {
                None if !domtree.is_reachable(pred) => continue,
                None => {
                    // An undiscovered block; map it to the current loop.
                    self.block_map[pred] = l.into();
                    if pred == header {
                        continue;
                    }
                    worklist.extend(cfg.pred(pred).iter().copied());
                }
                Some(subloop) => {
                    let subloop = self.outermost(subloop);
                    if subloop == l {
                        continue;
                    }

                    // A discovered inner loop; adopt it and continue the traversal from
                    // the predecessors of its header that are not part of it.
                    self.loops[subloop].parent = l.into();
                    for &pred in cfg.pred(self.header(subloop)) {
                        if self.block_map[pred].expand() != Some(subloop) {
                            worklist.push(pred);
                        }
                    }
                }
            }
        }
    }

    /// Add `block` to its ancestor loops; when `block` is a subloop header, the now
    /// complete subloop is attached to its parent and its lists are reversed into
    /// reverse post-order (the traversal visits blocks in post-order).
    fn insert_into_loop(&mut self, block: Block) {
        let mut subloop = self.loop_for(block);
        if let Some(sl) = subloop.filter(|sl| self.header(*sl) == block) {
            let parent = self.parent_loop(sl);
            match parent {
                None => self.top_level.push(sl),
                Some(parent) => self.loops[parent].nested.push(sl),
            }
            // Keep the header at index 0; everything else was collected in post-order.
            self.loops[sl].blocks[1..].reverse();
            self.loops[sl].nested.reverse();
            subloop = parent;
        }

        let mut current = subloop;
        while let Some(l) = current {
            self.loops[l].blocks.push(block);
            self.loops[l].block_set.insert(block);
            current = self.parent_loop(l);
        }
    }

    /// Verify the forest against a freshly computed one.
    pub fn verify(
        &self,
        func: &Function,
        cfg: &ControlFlowGraph,
        domtree: &DominatorTree,
    ) -> Result<(), Report> {
        let fresh = Self::compute(func, cfg, domtree);
        if fresh.len() != self.len() {
            return Err(Report::msg(format!(
                "loop forest is stale: have {} loops, expected {}",
                self.len(),
                fresh.len()
            )));
        }
        for l in self.loops_in_preorder() {
            let header = self.header(l);
            let Some(other) = fresh.loops_in_preorder().iter().copied().find(|ol| {
                fresh.header(*ol) == header
            }) else {
                return Err(Report::msg(format!(
                    "loop with header {header} is missing from the recomputed forest"
                )));
            };
            if self.loops[l].block_set != fresh.loops[other].block_set {
                return Err(Report::msg(format!(
                    "loop with header {header} reports mismatched blocks"
                )));
            }
            let parent_header = self.parent_loop(l).map(|p| self.header(p));
            let other_parent_header = fresh.parent_loop(other).map(|p| fresh.header(p));
            if parent_header != other_parent_header {
                return Err(Report::msg(format!(
                    "loop with header {header} reports a mismatched parent"
                )));
            }
        }
        Ok(())
    }
}

/// Post-order traversal of the dominator tree rooted at `entry`.
fn domtree_postorder(func: &Function, domtree: &DominatorTree, entry: Block) -> Vec<Block> {
    let mut children: SecondaryMap<Block, SmallVec<[Block; 4]>> = SecondaryMap::new();
    for block in func.blocks() {
        if let Some(idom) = domtree.idom(block) {
            children[idom].push(block);
        }
    }
    let mut order = Vec::new();
    let mut stack: Vec<(Block, usize)> = vec![(entry, 0)];
    while let Some(&(block, i)) = stack.last() {
        if let Some(&child) = children[block].get(i) {
            stack.last_mut().unwrap().1 = i + 1;
            stack.push((child, 0));
        } else {
            order.push(block);
            stack.pop();
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{FunctionBuilder, Signature, Type};

    /// Two-level nest:
    ///
    /// ```text
    /// entry -> outer_header -> inner_header <-> inner_latch
    ///          ^                    |
    ///          |                    v
    ///          +---- outer_latch <--+         outer_header -> exit
    /// ```
    fn nested_loops() -> (Function, [Block; 6]) {
        let sig = Signature::new([Type::I1, Type::I1], None);
        let mut func = Function::new("nest", sig);
        let outer_cond = func.param(0);
        let inner_cond = func.param(1);
        let mut b = FunctionBuilder::new(&mut func);
        let entry = b.create_entry_block();
        let outer_header = b.create_block();
        let inner_header = b.create_block();
        let inner_latch = b.create_block();
        let outer_latch = b.create_block();
        let exit = b.create_block();

        b.br(outer_header);
        b.switch_to_block(outer_header);
        b.cond_br(outer_cond, inner_header, exit);
        b.switch_to_block(inner_header);
        b.cond_br(inner_cond, inner_latch, outer_latch);
        b.switch_to_block(inner_latch);
        b.br(inner_header);
        b.switch_to_block(outer_latch);
        b.br(outer_header);
        b.switch_to_block(exit);
        b.ret(None);

        (
            func,
            [entry, outer_header, inner_header, inner_latch, outer_latch, exit],
        )
    }

    #[test]
    fn discovers_nested_loops() {
        let (func, [entry, outer_header, inner_header, inner_latch, outer_latch, exit]) =
            nested_loops();
        let cfg = ControlFlowGraph::with_function(&func);
        let domtree = DominatorTree::with_function(&func, &cfg);
        let forest = LoopForest::compute(&func, &cfg, &domtree);

        assert_eq!(forest.len(), 2);
        assert_eq!(forest.top_level_loops().len(), 1);

        let outer = forest.top_level_loops()[0];
        assert_eq!(forest.header(outer), outer_header);
        let inner = forest.nested(outer)[0];
        assert_eq!(forest.header(inner), inner_header);
        assert_eq!(forest.parent_loop(inner), Some(outer));
        assert_eq!(forest.depth(inner), 2);

        // Inner membership propagates into the outer loop.
        assert!(forest.contains_block(outer, inner_latch));
        assert!(forest.contains_block(inner, inner_latch));
        assert!(!forest.contains_block(inner, outer_latch));
        assert!(!forest.contains_block(outer, entry));
        assert_eq!(forest.loop_for(inner_header), Some(inner));
        assert_eq!(forest.loop_for(outer_latch), Some(outer));
        assert_eq!(forest.loop_depth(inner_latch), 2);
        assert!(forest.is_loop_header(outer_header));
        assert!(!forest.is_loop_header(outer_latch));

        assert_eq!(forest.loop_latch(&cfg, outer), Some(outer_latch));
        assert_eq!(forest.loop_latch(&cfg, inner), Some(inner_latch));
        assert_eq!(forest.preheader(&func, &cfg, outer), Some(entry));

        assert_eq!(forest.exiting_blocks(&func, outer).as_slice(), &[outer_header]);
        assert_eq!(forest.exit_blocks(&func, outer).as_slice(), &[exit]);
        assert_eq!(
            forest.exit_edges(&func, inner).as_slice(),
            &[(inner_header, outer_latch)]
        );

        let preorder = forest.loops_in_preorder();
        assert_eq!(preorder.as_slice(), &[outer, inner]);

        forest.verify(&func, &cfg, &domtree).unwrap();
    }

    #[test]
    fn loop_with_multiple_exits() {
        // while-loop whose header and body both exit
        let sig = Signature::new([Type::I1, Type::I1], None);
        let mut func = Function::new("multi_exit", sig);
        let c0 = func.param(0);
        let c1 = func.param(1);
        let mut b = FunctionBuilder::new(&mut func);
        let entry = b.create_entry_block();
        let header = b.create_block();
        let body = b.create_block();
        let latch = b.create_block();
        let exit0 = b.create_block();
        let exit1 = b.create_block();

        b.br(header);
        b.switch_to_block(header);
        b.cond_br(c0, body, exit0);
        b.switch_to_block(body);
        b.cond_br(c1, latch, exit1);
        b.switch_to_block(latch);
        b.br(header);
        b.switch_to_block(exit0);
        b.ret(None);
        b.switch_to_block(exit1);
        b.ret(None);

        let cfg = ControlFlowGraph::with_function(&func);
        let domtree = DominatorTree::with_function(&func, &cfg);
        let forest = LoopForest::compute(&func, &cfg, &domtree);

        assert_eq!(forest.len(), 1);
        let l = forest.top_level_loops()[0];
        let mut exiting = forest.exiting_blocks(&func, l);
        exiting.sort();
        assert_eq!(exiting.as_slice(), &[header, body]);
        let mut exits = forest.exit_blocks(&func, l);
        exits.sort();
        assert_eq!(exits.as_slice(), &[exit0, exit1]);
        assert_eq!(forest.loop_predecessor(&cfg, l), Some(entry));
        assert!(forest.is_loop_exiting(&func, l, header));
        assert!(!forest.is_loop_exiting(&func, l, latch));
    }
}
