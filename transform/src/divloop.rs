//! Divergent loop normalization.
//!
//! A loop is divergent when its lanes leave it on different iterations. Normalization
//! rewrites such a loop so that it keeps iterating until *no* lane is live, with a
//! single exit edge from the latch, while per-lane live-out values are captured in
//! tracker φs the moment their lane leaves:
//!
//! 1. Every original exit block is scheduled on the relay chain, so control visits all
//!    of them (in index order) once the loop finishes.
//! 2. Each live-out referenced by a closed-SSA φ of a divergent exit gets a tracker φ
//!    at the header, updated at the latch by a select under the loop's combined exit
//!    mask; the closed-SSA φ is rewired to the tracker's latch state and migrated to
//!    the loop's fresh single exit target. Exits taken uniformly by all lanes ("kill
//!    exits") are not tracked.
//! 3. All in-loop exit edges are dropped, and the latch gets the loop's only exit: a
//!    uniform branch on `rv_any(live_mask)` back to the header or out to the first
//!    pending target after the loop.
//!
//! Afterwards the loop is no longer divergent and the linearizer treats its body like
//! any other uniform control flow.

use lanevec_analysis::VectorShape;
use lanevec_ir::{
    smallvec, Block, FxHashMap, FxHashSet, Inst, InstKind, LoopId, Terminator, Value,
};

use crate::{
    linearize::Linearizer,
    promote::promote_definition,
    relay::RelayId,
};

impl Linearizer<'_> {
    /// Normalize the divergent loop `l`, scheduling its exits after `exit_relay`.
    ///
    /// Returns the head of the loop's exit chain; the caller uses it as the outgoing
    /// obligation when processing the header's own branch.
    ///
    /// Preconditions (from loop canonicalization): `l` has a preheader, a unique
    /// latch, and is in loop-closed SSA form. Violations panic.
    pub(crate) fn normalize_divergent_loop(
        &mut self,
        l: LoopId,
        exit_relay: Option<RelayId>,
    ) -> RelayId {
        let header = self.forest.header(l);
        let preheader = self
            .forest
            .preheader(self.func, &self.cfg, l)
            .unwrap_or_else(|| panic!("divergent loop with header {header} has no preheader"));
        let latch = self
            .forest
            .loop_latch(&self.cfg, l)
            .unwrap_or_else(|| panic!("divergent loop with header {header} has no unique latch"));
        log::debug!(
            target: "div-loop",
            "normalizing divergent {l}: header {header}, latch {latch}"
        );

        // The live mask is the mask of the latch -> header edge: lanes still iterating.
        // Read it off the original terminator before any exit edges are dropped.
        let header_succ_idx = self
            .func
            .successors(latch)
            .iter()
            .position(|s| *s == header)
            .unwrap_or_else(|| panic!("{latch} does not branch back to {header}"));
        let live_mask = self.masks.expect_exit_mask(latch, header_succ_idx);
        let combined_mask = self.masks.expect_combined_loop_exit_mask(l);

        // 1. Schedule every exit after the inherited obligations; the chain keeps the
        // targets in ascending index order.
        let exit_edges = self.forest.exit_edges(self.func, l);
        assert!(
            !exit_edges.is_empty(),
            "divergent loop with header {header} has no exits"
        );
        let mut head = exit_relay;
        for &(_, exit) in exit_edges.iter() {
            assert!(
                self.ctx.in_region(exit),
                "exit {exit} of the loop with header {header} is outside the region"
            );
            let exit_idx = self.index.expect(exit);
            head = Some(self.chain.add_target(self.func, self.ctx.region_mut(), head, exit_idx));
        }
        let head = head.unwrap();
        // The relay standing for the first pending target after the loop doubles as
        // the loop's single exit block; tracked live-outs are parked there.
        let loop_exit = self.chain.node(head).block;

        // 2. Track live-outs of divergent exits.
        let mut trackers: FxHashMap<Value, Value> = FxHashMap::default();
        let mut visited_exits: FxHashSet<Block> = FxHashSet::default();
        for &(exiting, exit) in exit_edges.iter() {
            if !self.ctx.is_divergent_branch(self.func, exiting) {
                // A kill exit: when it is taken, it is taken by every live lane at
                // once, so the values flowing through its φs need no tracking.
                log::trace!(target: "div-loop", "kill exit {exiting} -> {exit} is not tracked");
                continue;
            }
            if !visited_exits.insert(exit) {
                continue;
            }
            let phis: Vec<Inst> = self
                .func
                .block_insts(exit)
                .iter()
                .copied()
                .filter(|inst| self.func.is_phi(*inst))
                .collect();
            for phi in phis {
                let args = self.func.phi_args(phi).to_vec();
                assert_eq!(
                    args.len(),
                    1,
                    "{phi} in loop exit {exit} is not in loop-closed SSA form"
                );
                let (_, live_out) = args[0];
                let def_inside = self
                    .func
                    .value_def_block(live_out)
                    .is_some_and(|def| self.forest.contains_block(l, def));
                if !def_inside {
                    // Constants and loop-invariant values need no tracking; if the φ
                    // carries a block-less value, drop it outright.
                    if self.func.value_def_block(live_out).is_none() {
                        let result = self.func.inst_result(phi).unwrap();
                        self.func.replace_all_uses(result, live_out);
                        self.func.remove_inst(phi);
                    }
                    continue;
                }

                let last = match trackers.get(&live_out) {
                    Some(last) => *last,
                    None => {
                        let last =
                            self.request_tracker(l, header, preheader, latch, combined_mask, live_out);
                        trackers.insert(live_out, last);
                        last
                    }
                };
                // Rewire the closed-SSA φ to the tracker's final state and park it in
                // the loop's single exit; emission folds it into place.
                self.func.phi_args_mut(phi)[0].1 = last;
                self.func.transfer_inst(phi, loop_exit);
                log::trace!(
                    target: "div-loop",
                    "tracking live-out {live_out} of {exit} as {last}"
                );
            }
        }

        // 3. Drop every in-loop exit edge; each exiting block falls through to its
        // unique in-loop successor. The branch becomes unconditional, hence uniform.
        let mut dropped: FxHashSet<Block> = FxHashSet::default();
        for &(exiting, _) in exit_edges.iter() {
            if !dropped.insert(exiting) {
                continue;
            }
            let succs = self.func.successors(exiting);
            let mut inner = None;
            for (succ_idx, succ) in succs.iter().enumerate() {
                if self.forest.contains_block(l, *succ) {
                    assert!(
                        inner.is_none(),
                        "{exiting} has no unique in-loop successor"
                    );
                    inner = Some(*succ);
                }
                // The masks of dropped edges drive φ folding at the exits later.
                self.record_edge_mask(exiting, *succ, succ_idx);
            }
            let inner = inner
                .unwrap_or_else(|| panic!("{exiting} exits the loop on every successor"));
            self.func.set_terminator(exiting, Terminator::Br { dest: inner });
        }

        // 4. Create the latch exit: the loop now iterates while any lane is live.
        let any_fn = self.platform.declare_any_reduction(self.func);
        let any_ty = self.func.ext_func(any_fn).signature.result;
        let (_, any) = self.func.append_inst(
            latch,
            InstKind::Call {
                callee: any_fn,
                args: smallvec![live_mask],
            },
            any_ty,
        );
        let any = any.unwrap();
        self.ctx.pin_with_shape(any, VectorShape::uniform());
        self.func.set_terminator(
            latch,
            Terminator::CondBr {
                cond: any,
                then_dest: header,
                else_dest: loop_exit,
            },
        );
        self.masks.update_exit_masks(latch, &[live_mask, combined_mask]);
        self.edge_masks.insert((latch, header), live_mask);

        self.ctx.remove_divergent_loop(l);
        log::debug!(target: "div-loop", "{l} is now uniform with single exit {loop_exit}");
        head
    }

    /// Create the tracker φ for `live_out` and its latch update, returning the latch
    /// state (the value of `live_out` as of each lane's final iteration).
    fn request_tracker(
        &mut self,
        l: LoopId,
        header: Block,
        preheader: Block,
        latch: Block,
        combined_mask: Value,
        live_out: Value,
    ) -> Value {
        let ty = self.func.value_type(live_out);
        let undef = self.func.undef(ty);
        let (tracker, state) =
            self.func
                .prepend_phi(header, smallvec![(preheader, undef), (latch, undef)], ty);

        // The update may read the live-out on the iteration the lane leaves, so the
        // definition must reach the latch.
        let def_block = self.func.value_def_block(live_out).unwrap();
        let carried = if self.domtree.dominates(def_block, latch) {
            live_out
        } else {
            promote_definition(self.func, self.ctx, &self.index, live_out, latch)
        };

        let (_, last) = self.func.append_inst(
            latch,
            InstKind::Select {
                cond: combined_mask,
                on_true: carried,
                on_false: state,
            },
            Some(ty),
        );
        let last = last.unwrap();
        for arg in self.func.phi_args_mut(tracker).iter_mut() {
            if arg.0 == latch {
                arg.1 = last;
            }
        }
        self.ctx.pin_with_shape(state, VectorShape::varying());
        self.ctx.pin_with_shape(last, VectorShape::varying());
        debug_assert!(self.forest.contains_block(l, latch));
        log::trace!(
            target: "div-loop",
            "tracker {state} installed at {header} for {live_out}"
        );
        last
    }
}
