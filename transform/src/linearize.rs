use lanevec_analysis::{MaskTable, PlatformInfo, VectorizationContext};
use lanevec_ir::{
    Block, ControlFlowGraph, DominatorTree, Function, FxHashMap, FxHashSet, Inst, InstKind,
    LoopForest, SmallVec, Terminator, Value,
};

use crate::{
    index::{is_backedge, BlockIndex},
    promote::promote_definition,
    relay::{RelayChain, RelayId},
};

/// The control linearizer.
///
/// Walks the region's blocks in their topological index order (see [BlockIndex]) and
/// removes all divergent control flow:
///
/// * Every forward edge is routed through the relay chain, so branches that must
///   converge on a future target meet in that target's relay block before it is
///   emitted.
/// * Conditional branches on uniform conditions survive structurally; both targets are
///   scheduled and the branch is pointed at their relay blocks, which dissolve again
///   at emission — on an all-uniform region the transform is a structural no-op.
/// * Conditional branches on varying conditions are folded: both targets are scheduled
///   on one chain in ascending index order, the branch collapses to an unconditional
///   edge, and the per-lane choice is deferred to φ folding at the merge points.
/// * Divergent loops are normalized into latch-exiting form when their header is
///   reached (see the loop normalization half of this crate).
///
/// φ nodes whose predecessor sets were changed by the rewiring are folded into chains
/// of mask-driven selects over the recorded edge masks. The dominator tree is repaired
/// incrementally at every emission so that mid-run dominance queries stay exact, and
/// recomputed from the final CFG before it is handed back.
pub struct Linearizer<'a> {
    pub(crate) func: &'a mut Function,
    pub(crate) ctx: &'a mut VectorizationContext,
    pub(crate) masks: &'a mut MaskTable,
    pub(crate) platform: &'a PlatformInfo,
    /// Predecessor table of the *original* CFG; loop-structure queries (latches,
    /// preheaders) are answered against this, since back edges are never rerouted
    pub(crate) cfg: ControlFlowGraph,
    pub(crate) domtree: DominatorTree,
    pub(crate) forest: LoopForest,
    pub(crate) index: BlockIndex,
    pub(crate) chain: RelayChain,
    /// The per-lane mask of every processed edge `(pred, succ)`, folded or surviving
    pub(crate) edge_masks: FxHashMap<(Block, Block), Value>,
}

impl<'a> Linearizer<'a> {
    pub fn new(
        func: &'a mut Function,
        ctx: &'a mut VectorizationContext,
        masks: &'a mut MaskTable,
        platform: &'a PlatformInfo,
        cfg: ControlFlowGraph,
        domtree: DominatorTree,
        forest: LoopForest,
    ) -> Self {
        for block in func.blocks() {
            if ctx.in_region(block) {
                assert!(
                    func.terminator(block).is_set(),
                    "{block} entered linearization without a terminator"
                );
            }
        }
        let index = BlockIndex::compute(func, ctx.region(), &cfg, &forest);
        Self {
            func,
            ctx,
            masks,
            platform,
            cfg,
            domtree,
            forest,
            index,
            chain: RelayChain::default(),
            edge_masks: FxHashMap::default(),
        }
    }

    /// Run the linearizer to completion, returning the dominator tree of the
    /// transformed function.
    pub fn run(mut self) -> DominatorTree {
        log::debug!(
            target: "linearize",
            "linearizing region of @{} ({} blocks)",
            self.func.name,
            self.index.len()
        );

        for idx in 0..self.index.len() {
            let block = self.index.block_at(idx);
            let advanced = self.chain.advance_head(idx);
            let mut exit_relay = advanced.and_then(|(_, next)| next);
            if let Some((relay_block, _)) = advanced {
                self.emit_block(block, relay_block);
            }
            if let Some(l) = self.forest.loop_for(block) {
                if self.forest.header(l) == block && self.ctx.is_divergent_loop(l) {
                    exit_relay = Some(self.normalize_divergent_loop(l, exit_relay));
                }
            }
            self.process_branch(block, exit_relay);
        }

        debug_assert!(self.chain.is_drained(), "relay chain has unemitted targets");
        self.cleanup();

        // Hand back a tree recomputed from the final CFG; the incremental repairs were
        // for mid-run queries.
        let cfg = ControlFlowGraph::with_function(self.func);
        self.domtree.compute(self.func, &cfg);
        self.domtree
    }

    /// Stand the real `block` in for its relay: rewire the parked branches, adopt any
    /// parked instructions, delete the relay block, and repair `block`'s idom as the
    /// nearest common dominator of its surviving predecessors. φs whose predecessor
    /// set changed are folded.
    fn emit_block(&mut self, block: Block, relay_block: Block) {
        log::trace!(target: "linearize", "emitting {block}, dissolving its relay {relay_block}");

        let sources: Vec<Block> = self
            .func
            .blocks()
            .filter(|b| self.func.successors(*b).contains(&relay_block))
            .collect();
        for src in sources {
            self.func.terminator_mut(src).retarget(relay_block, block);
        }
        self.func.move_all_insts_to_front(relay_block, block);
        self.ctx.region_mut().remove(relay_block);
        self.chain.release_block(relay_block);
        self.func.remove_block(relay_block);

        let preds = current_preds(self.func, block);
        let mut idom: Option<Block> = None;
        for &pred in preds.iter() {
            idom = Some(match idom {
                None => pred,
                Some(i) => self.domtree.nearest_common_dominator(i, pred),
            });
        }
        if idom.is_some() {
            self.domtree.set_idom(block, idom);
        }

        self.fold_phis(block, &preds);
    }

    /// Reconcile the φs of `block` with its post-rewiring predecessor set.
    ///
    /// A φ that only gained predecessors is completed with `undef` incomings; a φ that
    /// lost an incoming edge is folded into a select chain over the recorded edge
    /// masks and deleted.
    fn fold_phis(&mut self, block: Block, preds: &[Block]) {
        let phis: Vec<Inst> = self
            .func
            .block_insts(block)
            .iter()
            .copied()
            .filter(|inst| self.func.is_phi(*inst))
            .collect();
        if phis.is_empty() {
            return;
        }
        let pred_set: FxHashSet<Block> = preds.iter().copied().collect();

        for phi in phis {
            let args: Vec<(Block, Value)> = self.func.phi_args(phi).to_vec();
            let incoming_set: FxHashSet<Block> = args.iter().map(|(b, _)| *b).collect();
            if incoming_set == pred_set {
                continue;
            }

            if incoming_set.iter().all(|b| pred_set.contains(b)) {
                // Only gained predecessors; complete the φ with undef on the new edges.
                let result = self.func.inst_result(phi).unwrap();
                let ty = self.func.value_type(result);
                let undef = self.func.undef(ty);
                for &pred in preds {
                    if !incoming_set.contains(&pred) {
                        self.func.phi_args_mut(phi).push((pred, undef));
                    }
                }
                continue;
            }

            self.fold_phi(block, phi, &args);
        }
    }

    /// Fold one φ into `d = v_0; d = select(mask(pred_i, block), v_i, d)` and delete it.
    fn fold_phi(&mut self, block: Block, phi: Inst, args: &[(Block, Value)]) {
        let result = self.func.inst_result(phi).unwrap();
        let ty = self.func.value_type(result);
        let shape = self.ctx.shape(result);

        let mut folded = self.dominating(args[0].1, block);
        let mut insert_at = self.func.first_non_phi_index(block);
        for &(pred, value) in &args[1..] {
            let mask = *self.edge_masks.get(&(pred, block)).unwrap_or_else(|| {
                panic!("no edge mask recorded for the folded edge {pred} -> {block}")
            });
            let mask = self.dominating(mask, block);
            let incoming = self.dominating(value, block);
            let (_, select) = self.func.insert_inst(
                block,
                insert_at,
                InstKind::Select {
                    cond: mask,
                    on_true: incoming,
                    on_false: folded,
                },
                Some(ty),
            );
            insert_at += 1;
            let select = select.unwrap();
            self.ctx.set_shape(select, shape);
            folded = select;
        }

        log::trace!(target: "linearize", "folded {phi} in {block} into {folded}");
        self.func.replace_all_uses(result, folded);
        self.func.remove_inst(phi);
    }

    /// A definition of `value` that dominates `block`, promoting it if necessary.
    fn dominating(&mut self, value: Value, block: Block) -> Value {
        match self.func.value_def_block(value) {
            Some(def_block) if !self.domtree.dominates(def_block, block) => {
                promote_definition(self.func, self.ctx, &self.index, value, block)
            }
            _ => value,
        }
    }

    /// Rewrite the terminator of `block` onto the relay chain.
    fn process_branch(&mut self, block: Block, exit_relay: Option<RelayId>) {
        match self.func.terminator(block).clone() {
            Terminator::None => panic!("{block} has no terminator"),
            Terminator::Return(_) | Terminator::Unreachable => {
                assert!(
                    exit_relay.is_none(),
                    "{block} leaves the region with scheduled targets outstanding"
                );
            }
            Terminator::Br { dest } => {
                if self.chain.is_relay_block(dest) || is_backedge(&self.forest, block, dest) {
                    return;
                }
                if !self.ctx.in_region(dest) {
                    assert!(
                        exit_relay.is_none(),
                        "{block} leaves the region with scheduled targets outstanding"
                    );
                    return;
                }
                self.record_edge_mask(block, dest, 0);
                let dest_idx = self.index.expect(dest);
                let head =
                    self.chain
                        .add_target(self.func, self.ctx.region_mut(), exit_relay, dest_idx);
                let head_block = self.chain.node(head).block;
                self.func.set_terminator(block, Terminator::Br { dest: head_block });
            }
            Terminator::CondBr {
                cond,
                then_dest,
                else_dest,
            } => {
                if !self.ctx.shape(cond).is_uniform() {
                    self.fold_branch(block, cond, then_dest, else_dest, exit_relay);
                } else {
                    let new_then = self.schedule_uniform_successor(block, then_dest, 0, exit_relay);
                    let new_else = self.schedule_uniform_successor(block, else_dest, 1, exit_relay);
                    self.func.set_terminator(
                        block,
                        Terminator::CondBr {
                            cond,
                            then_dest: new_then,
                            else_dest: new_else,
                        },
                    );
                }
            }
        }
    }

    /// Schedule one target of a structurally surviving branch, returning the block the
    /// branch operand should point at.
    fn schedule_uniform_successor(
        &mut self,
        block: Block,
        dest: Block,
        succ_idx: usize,
        exit_relay: Option<RelayId>,
    ) -> Block {
        if self.chain.is_relay_block(dest) || !self.ctx.in_region(dest) {
            return dest;
        }
        self.record_edge_mask(block, dest, succ_idx);
        if is_backedge(&self.forest, block, dest) {
            return dest;
        }
        let head = self.chain.add_target(
            self.func,
            self.ctx.region_mut(),
            exit_relay,
            self.index.expect(dest),
        );
        self.chain.node(head).block
    }

    /// Fold a branch on a varying condition.
    ///
    /// The successors are normalized into `(first, second)` by ascending scheduled
    /// index; `first` is scheduled on the chain, `second` is nested after it as a
    /// mandatory target, and the branch collapses into an unconditional edge to the
    /// chain head. The per-lane selection is deferred to φ folding at the merge
    /// points, driven by the edge masks recorded here.
    fn fold_branch(
        &mut self,
        block: Block,
        cond: Value,
        then_dest: Block,
        else_dest: Block,
        exit_relay: Option<RelayId>,
    ) {
        for dest in [then_dest, else_dest] {
            assert!(
                !self.chain.is_relay_block(dest),
                "folding a branch in {block} that was already rerouted"
            );
            assert!(
                self.ctx.in_region(dest),
                "divergent branch in {block} leaves the region via {dest}"
            );
            assert!(
                !is_backedge(&self.forest, block, dest),
                "divergent back edge from {block} to {dest}; the loop was not normalized"
            );
        }
        log::trace!(target: "linearize", "folding divergent branch of {block} on {cond}");

        self.record_edge_mask(block, then_dest, 0);
        self.record_edge_mask(block, else_dest, 1);

        if then_dest == else_dest {
            // Degenerate conditional; nothing to fold, just schedule the one target.
            let head = self.chain.add_target(
                self.func,
                self.ctx.region_mut(),
                exit_relay,
                self.index.expect(then_dest),
            );
            let head_block = self.chain.node(head).block;
            self.func.set_terminator(block, Terminator::Br { dest: head_block });
            return;
        }

        let then_idx = self.index.expect(then_dest);
        let else_idx = self.index.expect(else_dest);
        let (first_idx, second_idx, first_block, second_block) = if then_idx < else_idx {
            (then_idx, else_idx, then_dest, else_dest)
        } else {
            (else_idx, then_idx, else_dest, then_dest)
        };

        // §Dominator repair: folding makes `second` execute on the straight-line path
        // after `first`; if this block used to dominate `second` and no other branch
        // has scheduled it yet, `first` becomes its sole source of control.
        let repair_second = self.chain.get(second_idx).is_none()
            && self.domtree.dominates(block, second_block)
            && block != second_block;

        let head =
            self.chain
                .add_target(self.func, self.ctx.region_mut(), exit_relay, first_idx);
        let first_relay = self.chain.get(first_idx).expect("first target was just scheduled");
        let _ = self.chain.add_target(
            self.func,
            self.ctx.region_mut(),
            Some(first_relay),
            second_idx,
        );
        if repair_second {
            self.domtree.set_idom(second_block, Some(first_block));
        }

        let head_block = self.chain.node(head).block;
        self.func.set_terminator(
            block,
            Terminator::CondBr {
                cond,
                then_dest: head_block,
                else_dest: head_block,
            },
        );
    }

    /// Record the mask of the (possibly about-to-be-folded) edge `block -> dest`.
    pub(crate) fn record_edge_mask(&mut self, block: Block, dest: Block, succ_idx: usize) {
        if let Some(mask) = self.masks.exit_mask(block, succ_idx) {
            self.edge_masks.insert((block, dest), mask);
        }
    }

    /// Replace conditional terminators whose successors all collapsed onto the same
    /// block by unconditional branches.
    fn cleanup(&mut self) {
        let blocks: Vec<Block> = self
            .func
            .blocks()
            .filter(|b| self.ctx.in_region(*b))
            .collect();
        for block in blocks {
            if let Terminator::CondBr {
                then_dest,
                else_dest,
                ..
            } = self.func.terminator(block)
            {
                if then_dest == else_dest {
                    let dest = *then_dest;
                    self.func.set_terminator(block, Terminator::Br { dest });
                }
            }
        }
    }
}

/// The current (post-rewiring) unique predecessors of `block`.
pub(crate) fn current_preds(func: &Function, block: Block) -> SmallVec<[Block; 4]> {
    let mut preds = SmallVec::new();
    for b in func.blocks() {
        if func.successors(b).contains(&block) && !preds.contains(&b) {
            preds.push(b);
        }
    }
    preds
}
