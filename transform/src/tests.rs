use lanevec_analysis::{
    MaskTable, PlatformInfo, Region, VectorMapping, VectorShape, VectorizationContext,
};
use lanevec_eval::{splat, Evaluator, Lanes};
use lanevec_ir::{
    BinaryOp, Block, ControlFlowGraph, DominatorTree, Function, FunctionBuilder, Immediate,
    LoopForest, Terminator, Type, UnaryOp, Value,
};
use pretty_assertions::assert_eq;

use crate::{index::BlockIndex, promote::promote_definition, vectorize_region};

fn init_logging() {
    let _ = env_logger::Builder::from_env("LANEVEC_TRACE")
        .format_timestamp(None)
        .is_test(true)
        .try_init();
}

fn context_for(func: &Function, width: u32) -> VectorizationContext {
    VectorizationContext::new(
        VectorMapping::new(func.name.clone(), width),
        Region::whole_function(func),
    )
}

fn lanes(values: &[i32]) -> Lanes {
    values.iter().map(|v| Immediate::I32(*v)).collect()
}

/// Every conditional terminator left in the region must be on a uniform condition.
fn assert_uniform_terminators(func: &Function, ctx: &VectorizationContext) {
    for block in func.blocks() {
        if let Terminator::CondBr { cond, .. } = func.terminator(block) {
            assert!(
                ctx.shape(*cond).is_uniform(),
                "{block} still ends in a divergent branch"
            );
        }
    }
}

/// Run the W-lane interpretation of `vectorized` against W scalar runs of `scalar`.
fn assert_lanewise_equivalent(
    scalar: &Function,
    vectorized: &Function,
    width: usize,
    args: &[Lanes],
) {
    let wide = Evaluator::new(vectorized, width)
        .run(args)
        .expect("vectorized function returned no value");
    for lane in 0..width {
        let scalar_args: Vec<Lanes> =
            args.iter().map(|a| splat(a[lane], 1)).collect();
        let expected = Evaluator::new(scalar, 1)
            .run(&scalar_args)
            .expect("scalar function returned no value");
        assert_eq!(
            wide[lane], expected[0],
            "lane {lane} disagrees with the scalar run"
        );
    }
}

// --------------------------------------------------------------------------------------
// Block indexing

#[test]
fn block_index_keeps_loops_contiguous() {
    // entry -> outer(h) -> inner(h) <-> inner latch; inner -> outer latch -> outer;
    // outer -> exit. Blocks are created in a scrambled order on purpose.
    let mut func = Function::new(
        "nest",
        lanevec_ir::Signature::new([Type::I1, Type::I1], None),
    );
    let c0 = func.param(0);
    let c1 = func.param(1);
    let mut b = FunctionBuilder::new(&mut func);
    let entry = b.create_entry_block();
    let exit = b.create_block();
    let outer_latch = b.create_block();
    let outer_header = b.create_block();
    let inner_latch = b.create_block();
    let inner_header = b.create_block();

    b.br(outer_header);
    b.switch_to_block(outer_header);
    b.cond_br(c0, inner_header, exit);
    b.switch_to_block(inner_header);
    b.cond_br(c1, inner_latch, outer_latch);
    b.switch_to_block(inner_latch);
    b.br(inner_header);
    b.switch_to_block(outer_latch);
    b.br(outer_header);
    b.switch_to_block(exit);
    b.ret(None);

    let cfg = ControlFlowGraph::with_function(&func);
    let domtree = DominatorTree::with_function(&func, &cfg);
    let forest = LoopForest::compute(&func, &cfg, &domtree);
    let region = Region::whole_function(&func);
    let index = BlockIndex::compute(&func, &region, &cfg, &forest);

    assert_eq!(index.len(), 6);
    assert_eq!(index.block_at(0), entry);
    // The outer loop spans [1, 4] with its latch last; the inner loop is nested
    // inside as [2, 3].
    assert_eq!(index.expect(outer_header), 1);
    assert_eq!(index.expect(inner_header), 2);
    assert_eq!(index.expect(inner_latch), 3);
    assert_eq!(index.expect(outer_latch), 4);
    assert_eq!(index.expect(exit), 5);
}

// --------------------------------------------------------------------------------------
// Value promotion

#[test]
fn promotion_inserts_undef_phis_across_the_span() {
    // entry branches around A; the definition in A does not dominate the join.
    let mut func = Function::new(
        "promote",
        lanevec_ir::Signature::new([Type::I1, Type::I32], Some(Type::I32)),
    );
    let cond = func.param(0);
    let x = func.param(1);
    let one = func.i32_const(1);
    let mut b = FunctionBuilder::new(&mut func);
    let _entry = b.create_entry_block();
    let a = b.create_block();
    let bypass = b.create_block();
    let join = b.create_block();
    b.cond_br(cond, a, bypass);
    b.switch_to_block(a);
    let v = b.binary(BinaryOp::Add, x, one);
    b.br(join);
    b.switch_to_block(bypass);
    b.br(join);
    b.switch_to_block(join);
    b.ret(Some(x));

    let cfg = ControlFlowGraph::with_function(&func);
    let domtree = DominatorTree::with_function(&func, &cfg);
    let forest = LoopForest::compute(&func, &cfg, &domtree);
    let region = Region::whole_function(&func);
    let index = BlockIndex::compute(&func, &region, &cfg, &forest);
    let mut ctx = context_for(&func, 4);
    ctx.set_shape(v, VectorShape::varying());

    let promoted = promote_definition(&mut func, &mut ctx, &index, v, join);
    assert_ne!(promoted, v);
    let phi = func.value_def_inst(promoted).expect("expected a phi");
    assert!(func.is_phi(phi));
    assert_eq!(func.inst_block(phi), Some(join));

    let undef = func.undef(Type::I32);
    let mut args = func.phi_args(phi).to_vec();
    args.sort();
    let mut expected = vec![(a, v), (bypass, undef)];
    expected.sort();
    assert_eq!(args, expected, "out-of-span predecessors must contribute undef");
    // The promoted definition inherits the value's shape.
    assert_eq!(ctx.shape(promoted), VectorShape::varying());
    assert_eq!(ctx.shape(v), VectorShape::varying());
}

// --------------------------------------------------------------------------------------
// Linearization

/// A region whose only conditional branch is uniform must come out of linearization
/// structurally unchanged.
#[test]
fn uniform_region_is_structurally_unchanged() {
    init_logging();
    let mut func = Function::new(
        "uniform",
        lanevec_ir::Signature::new([Type::I1], Some(Type::I32)),
    );
    let cond = func.param(0);
    let one = func.i32_const(1);
    let two = func.i32_const(2);
    let mut b = FunctionBuilder::new(&mut func);
    let _entry = b.create_entry_block();
    let then_bb = b.create_block();
    let else_bb = b.create_block();
    let join = b.create_block();
    b.cond_br(cond, then_bb, else_bb);
    b.switch_to_block(then_bb);
    b.br(join);
    b.switch_to_block(else_bb);
    b.br(join);
    b.switch_to_block(join);
    let merged = b.phi(&[(then_bb, one), (else_bb, two)], Type::I32);
    b.ret(Some(merged));

    let mut ctx = context_for(&func, 4);
    ctx.set_shape(cond, VectorShape::uniform());
    let mut masks = MaskTable::default();
    let platform = PlatformInfo::default();

    let before = func.to_string();
    let domtree = vectorize_region(&mut func, &mut ctx, &mut masks, &platform);
    assert_eq!(func.to_string(), before, "uniform control flow must survive untouched");

    func.verify().unwrap();
    let cfg = ControlFlowGraph::with_function(&func);
    domtree.verify(&func, &cfg).unwrap();
}

/// An if/then/else on a varying condition folds into a straight line, with the merge
/// φ rewritten into a mask select.
#[test]
fn varying_branch_folds_to_selects() {
    init_logging();
    let mut func = Function::new(
        "blend",
        lanevec_ir::Signature::new([Type::I32], Some(Type::I32)),
    );
    let x = func.param(0);
    let zero = func.i32_const(0);
    let one = func.i32_const(1);
    let two = func.i32_const(2);
    let mut b = FunctionBuilder::new(&mut func);
    let entry = b.create_entry_block();
    let then_bb = b.create_block();
    let else_bb = b.create_block();
    let join = b.create_block();
    let c = b.binary(BinaryOp::Slt, x, zero);
    let nc = b.unary(UnaryOp::Not, c);
    b.cond_br(c, then_bb, else_bb);
    b.switch_to_block(then_bb);
    let v1 = b.binary(BinaryOp::Add, x, one);
    b.br(join);
    b.switch_to_block(else_bb);
    let v2 = b.binary(BinaryOp::Mul, x, two);
    b.br(join);
    b.switch_to_block(join);
    let merged = b.phi(&[(then_bb, v1), (else_bb, v2)], Type::I32);
    b.ret(Some(merged));

    let scalar = func.clone();

    let mut ctx = context_for(&func, 4);
    ctx.set_shape(x, VectorShape::varying());
    ctx.set_shape(c, VectorShape::varying());
    ctx.set_shape(nc, VectorShape::varying());
    ctx.set_shape(merged, VectorShape::varying());

    let mut masks = MaskTable::default();
    masks.update_exit_masks(entry, &[c, nc]);
    masks.set_exit_mask(then_bb, 0, c);
    masks.set_exit_mask(else_bb, 0, nc);
    let platform = PlatformInfo::default();

    let domtree = vectorize_region(&mut func, &mut ctx, &mut masks, &platform);

    // The branch is gone and the region is a straight line through both arms.
    assert_eq!(func.successors(entry).as_slice(), &[then_bb]);
    assert_eq!(func.successors(then_bb).as_slice(), &[else_bb]);
    assert_eq!(func.successors(else_bb).as_slice(), &[join]);
    assert!(
        func.block_insts(join).iter().all(|inst| !func.is_phi(*inst)),
        "the merge phi must have been folded away"
    );
    assert_uniform_terminators(&func, &ctx);
    func.verify().unwrap();
    let cfg = ControlFlowGraph::with_function(&func);
    domtree.verify(&func, &cfg).unwrap();

    assert_lanewise_equivalent(&scalar, &func, 4, &[lanes(&[-1, 2, -3, 4])]);
}

/// Build `while (i < n) i += 1; return i` with explicit mask bookkeeping, the way the
/// upstream mask analysis would emit it: `live` is the loop-carried live mask,
/// `exit_now` the lanes leaving on this iteration.
struct WhileLoop {
    func: Function,
    header: Block,
    latch: Block,
    exit: Block,
    n: Value,
    c: Value,
    exit_now: Value,
    live_next: Value,
}

fn build_while_loop() -> WhileLoop {
    let mut func = Function::new(
        "count",
        lanevec_ir::Signature::new([Type::I32], Some(Type::I32)),
    );
    let n = func.param(0);
    let zero = func.i32_const(0);
    let one = func.i32_const(1);
    let t = func.bool_const(true);
    let mut b = FunctionBuilder::new(&mut func);
    let entry = b.create_entry_block();
    let header = b.create_block();
    let latch = b.create_block();
    let exit = b.create_block();

    b.br(header);
    b.switch_to_block(header);
    let i = b.phi(&[(entry, zero)], Type::I32);
    let live = b.phi(&[(entry, t)], Type::I1);
    let c = b.binary(BinaryOp::Slt, i, n);
    let nc = b.unary(UnaryOp::Not, c);
    let exit_now = b.binary(BinaryOp::And, live, nc);
    let live_next = b.binary(BinaryOp::And, live, c);
    b.cond_br(c, latch, exit);

    b.switch_to_block(latch);
    let i2 = b.binary(BinaryOp::Add, i, one);
    b.br(header);

    b.switch_to_block(exit);
    let i_out = b.phi(&[(header, i)], Type::I32);
    b.ret(Some(i_out));

    // Close the loop-carried φs.
    let header_phis: Vec<_> = func.block_insts(header).to_vec();
    func.phi_args_mut(header_phis[0]).push((latch, i2));
    func.phi_args_mut(header_phis[1]).push((latch, live_next));

    WhileLoop {
        func,
        header,
        latch,
        exit,
        n,
        c,
        exit_now,
        live_next,
    }
}

/// A loop whose lanes leave on different iterations is rewritten to iterate until no
/// lane is live, with a single uniform exit from the latch and the per-lane result
/// captured by a tracker.
#[test]
fn divergent_while_loop_normalizes() {
    init_logging();
    let WhileLoop {
        mut func,
        header,
        latch,
        exit,
        n,
        c,
        exit_now,
        live_next,
    } = build_while_loop();
    let scalar = func.clone();

    let cfg = ControlFlowGraph::with_function(&func);
    let domtree = DominatorTree::with_function(&func, &cfg);
    let forest = LoopForest::compute(&func, &cfg, &domtree);
    let l = forest.loop_for(header).unwrap();

    let mut ctx = context_for(&func, 4);
    ctx.set_shape(n, VectorShape::varying());
    ctx.set_shape(c, VectorShape::varying());
    ctx.set_shape(exit_now, VectorShape::varying());
    ctx.set_shape(live_next, VectorShape::varying());
    ctx.add_divergent_loop(l);

    let mut masks = MaskTable::default();
    masks.update_exit_masks(header, &[live_next, exit_now]);
    masks.set_exit_mask(latch, 0, live_next);
    masks.set_combined_loop_exit_mask(l, exit_now);
    let platform = PlatformInfo::default();

    let phis_before = func.block_insts(header).iter().filter(|i| func.is_phi(**i)).count();
    let dt = vectorize_region(&mut func, &mut ctx, &mut masks, &platform);

    // The loop now has exactly one exit edge, and it leaves from the latch.
    let cfg = ControlFlowGraph::with_function(&func);
    let new_domtree = DominatorTree::with_function(&func, &cfg);
    let forest = LoopForest::compute(&func, &cfg, &new_domtree);
    let l = forest.loop_for(header).unwrap();
    let exit_edges = forest.exit_edges(&func, l);
    assert_eq!(exit_edges.len(), 1, "normalized loops have a single exit edge");
    assert_eq!(exit_edges[0], (latch, exit));
    assert!(!ctx.is_divergent_loop(l), "normalization clears the divergence flag");

    // One tracker φ was added for the single live-out.
    let phis_after = func.block_insts(header).iter().filter(|i| func.is_phi(**i)).count();
    assert_eq!(phis_after, phis_before + 1);

    // The latch decides iteration with a uniform lane reduction.
    let Terminator::CondBr { cond, then_dest, .. } = func.terminator(latch) else {
        panic!("latch must end in a conditional branch");
    };
    assert!(ctx.shape(*cond).is_uniform());
    assert_eq!(*then_dest, header);

    assert_uniform_terminators(&func, &ctx);
    func.verify().unwrap();
    dt.verify(&func, &cfg).unwrap();

    // Per-lane trip counts 0, 2, 2, 0.
    assert_lanewise_equivalent(&scalar, &func, 4, &[lanes(&[0, 2, 2, 0])]);
}

/// Re-running the transform on an already-normalized region must change nothing: the
/// loop is no longer divergent and every branch is uniform.
#[test]
fn relinearizing_is_a_no_op() {
    init_logging();
    let WhileLoop {
        mut func,
        header,
        latch,
        n,
        c,
        exit_now,
        live_next,
        ..
    } = build_while_loop();

    let cfg = ControlFlowGraph::with_function(&func);
    let domtree = DominatorTree::with_function(&func, &cfg);
    let forest = LoopForest::compute(&func, &cfg, &domtree);
    let l = forest.loop_for(header).unwrap();

    let mut ctx = context_for(&func, 4);
    ctx.set_shape(n, VectorShape::varying());
    ctx.set_shape(c, VectorShape::varying());
    ctx.set_shape(exit_now, VectorShape::varying());
    ctx.set_shape(live_next, VectorShape::varying());
    ctx.add_divergent_loop(l);

    let mut masks = MaskTable::default();
    masks.update_exit_masks(header, &[live_next, exit_now]);
    masks.set_exit_mask(latch, 0, live_next);
    masks.set_combined_loop_exit_mask(l, exit_now);
    let platform = PlatformInfo::default();

    let _ = vectorize_region(&mut func, &mut ctx, &mut masks, &platform);
    let after_first = func.to_string();
    let dt = vectorize_region(&mut func, &mut ctx, &mut masks, &platform);
    assert_eq!(func.to_string(), after_first, "the second run must be a no-op");
    let cfg = ControlFlowGraph::with_function(&func);
    dt.verify(&func, &cfg).unwrap();
}

/// Outer uniform loop around an inner divergent loop: the accumulator leaving the
/// inner loop is tracked per lane, and the outer loop's φs pick up the tracked value.
#[test]
fn nested_divergent_loop_tracks_live_outs() {
    init_logging();
    let mut func = Function::new(
        "nest",
        lanevec_ir::Signature::new([Type::I32], Some(Type::I32)),
    );
    let m = func.param(0);
    let zero = func.i32_const(0);
    let one = func.i32_const(1);
    let three = func.i32_const(3);
    let t = func.bool_const(true);
    let mut b = FunctionBuilder::new(&mut func);
    let entry = b.create_entry_block();
    let outer_header = b.create_block();
    let inner_pre = b.create_block();
    let inner_header = b.create_block();
    let inner_latch = b.create_block();
    let inner_exit = b.create_block();
    let outer_exit = b.create_block();

    b.br(outer_header);
    b.switch_to_block(outer_header);
    let j = b.phi(&[(entry, zero)], Type::I32);
    let s = b.phi(&[(entry, zero)], Type::I32);
    let cj = b.binary(BinaryOp::Slt, j, three);
    b.cond_br(cj, inner_pre, outer_exit);

    b.switch_to_block(inner_pre);
    b.br(inner_header);

    b.switch_to_block(inner_header);
    let k = b.phi(&[(inner_pre, zero)], Type::I32);
    let s_i = b.phi(&[(inner_pre, s)], Type::I32);
    let live = b.phi(&[(inner_pre, t)], Type::I1);
    let ck = b.binary(BinaryOp::Slt, k, m);
    let nck = b.unary(UnaryOp::Not, ck);
    let exit_now = b.binary(BinaryOp::And, live, nck);
    let live_next = b.binary(BinaryOp::And, live, ck);
    b.cond_br(ck, inner_latch, inner_exit);

    b.switch_to_block(inner_latch);
    let s2 = b.binary(BinaryOp::Add, s_i, one);
    let k2 = b.binary(BinaryOp::Add, k, one);
    b.br(inner_header);

    b.switch_to_block(inner_exit);
    let s_x = b.phi(&[(inner_header, s_i)], Type::I32);
    let j2 = b.binary(BinaryOp::Add, j, one);
    b.br(outer_header);

    b.switch_to_block(outer_exit);
    let s_out = b.phi(&[(outer_header, s)], Type::I32);
    b.ret(Some(s_out));

    // Close the loop-carried φs.
    let outer_phis: Vec<_> = func.block_insts(outer_header).to_vec();
    func.phi_args_mut(outer_phis[0]).push((inner_exit, j2));
    func.phi_args_mut(outer_phis[1]).push((inner_exit, s_x));
    let inner_phis: Vec<_> = func.block_insts(inner_header).to_vec();
    func.phi_args_mut(inner_phis[0]).push((inner_latch, k2));
    func.phi_args_mut(inner_phis[1]).push((inner_latch, s2));
    func.phi_args_mut(inner_phis[2]).push((inner_latch, live_next));

    let scalar = func.clone();

    let cfg = ControlFlowGraph::with_function(&func);
    let domtree = DominatorTree::with_function(&func, &cfg);
    let forest = LoopForest::compute(&func, &cfg, &domtree);
    let inner = forest.loop_for(inner_header).unwrap();

    let mut ctx = context_for(&func, 4);
    ctx.set_shape(m, VectorShape::varying());
    ctx.set_shape(cj, VectorShape::uniform());
    ctx.set_shape(ck, VectorShape::varying());
    ctx.set_shape(exit_now, VectorShape::varying());
    ctx.set_shape(live_next, VectorShape::varying());
    ctx.add_divergent_loop(inner);

    let mut masks = MaskTable::default();
    masks.update_exit_masks(inner_header, &[live_next, exit_now]);
    masks.set_exit_mask(inner_latch, 0, live_next);
    masks.set_combined_loop_exit_mask(inner, exit_now);
    let platform = PlatformInfo::default();

    let dt = vectorize_region(&mut func, &mut ctx, &mut masks, &platform);

    assert_uniform_terminators(&func, &ctx);
    func.verify().unwrap();
    let cfg = ControlFlowGraph::with_function(&func);
    dt.verify(&func, &cfg).unwrap();

    // The inner loop's accumulator now reaches the outer φ through the tracker.
    let forest = LoopForest::compute(&func, &cfg, &DominatorTree::with_function(&func, &cfg));
    let inner = forest.loop_for(inner_header).unwrap();
    assert_eq!(forest.exit_edges(&func, inner).len(), 1);
    assert!(!ctx.is_divergent_loop(inner));

    // Three outer iterations of per-lane inner bounds 1, 2, 3, 4.
    assert_lanewise_equivalent(&scalar, &func, 4, &[lanes(&[1, 2, 3, 4])]);
}

/// A uniform break out of a divergent loop is a "kill exit": every live lane takes it
/// together, so its live-outs must not get trackers.
#[test]
fn uniform_break_is_not_tracked() {
    init_logging();
    let mut func = Function::new(
        "brk",
        lanevec_ir::Signature::new([Type::I32, Type::I1], Some(Type::I32)),
    );
    let m = func.param(0);
    let u = func.param(1);
    let zero = func.i32_const(0);
    let one = func.i32_const(1);
    let t = func.bool_const(true);
    let mut b = FunctionBuilder::new(&mut func);
    let entry = b.create_entry_block();
    let header = b.create_block();
    let body = b.create_block();
    let latch = b.create_block();
    let dexit1 = b.create_block();
    let dexit2 = b.create_block();
    let merge = b.create_block();

    b.br(header);
    b.switch_to_block(header);
    let i = b.phi(&[(entry, zero)], Type::I32);
    let live = b.phi(&[(entry, t)], Type::I1);
    let ce = b.binary(BinaryOp::Sle, m, i);
    let nce = b.unary(UnaryOp::Not, ce);
    let exit_now = b.binary(BinaryOp::And, live, ce);
    let live_after = b.binary(BinaryOp::And, live, nce);
    b.cond_br(ce, dexit1, body);

    b.switch_to_block(body);
    let nu = b.unary(UnaryOp::Not, u);
    let live_next = b.binary(BinaryOp::And, live_after, nu);
    b.cond_br(u, dexit2, latch);

    b.switch_to_block(latch);
    let i2 = b.binary(BinaryOp::Add, i, one);
    b.br(header);

    b.switch_to_block(dexit1);
    let p1 = b.phi(&[(header, i)], Type::I32);
    b.br(merge);
    b.switch_to_block(dexit2);
    let p2 = b.phi(&[(body, i)], Type::I32);
    b.br(merge);
    b.switch_to_block(merge);
    let out = b.phi(&[(dexit1, p1), (dexit2, p2)], Type::I32);
    b.ret(Some(out));

    let header_phis: Vec<_> = func.block_insts(header).to_vec();
    func.phi_args_mut(header_phis[0]).push((latch, i2));
    func.phi_args_mut(header_phis[1]).push((latch, live_next));

    let scalar = func.clone();

    let cfg = ControlFlowGraph::with_function(&func);
    let domtree = DominatorTree::with_function(&func, &cfg);
    let forest = LoopForest::compute(&func, &cfg, &domtree);
    let l = forest.loop_for(header).unwrap();

    let mut ctx = context_for(&func, 4);
    ctx.set_shape(m, VectorShape::varying());
    ctx.set_shape(u, VectorShape::uniform());
    ctx.set_shape(nu, VectorShape::uniform());
    ctx.set_shape(ce, VectorShape::varying());
    ctx.set_shape(exit_now, VectorShape::varying());
    ctx.set_shape(live_after, VectorShape::varying());
    ctx.set_shape(live_next, VectorShape::varying());
    ctx.set_shape(out, VectorShape::varying());
    ctx.add_divergent_loop(l);

    let mut masks = MaskTable::default();
    masks.update_exit_masks(header, &[exit_now, live_after]);
    masks.set_exit_mask(body, 0, u);
    masks.set_exit_mask(body, 1, live_next);
    masks.set_exit_mask(latch, 0, live_next);
    masks.set_exit_mask(dexit1, 0, exit_now);
    masks.set_exit_mask(dexit2, 0, u);
    masks.set_combined_loop_exit_mask(l, exit_now);
    let platform = PlatformInfo::default();

    let phis_before = func.block_insts(header).iter().filter(|x| func.is_phi(**x)).count();
    let dt = vectorize_region(&mut func, &mut ctx, &mut masks, &platform);

    // Exactly one tracker: the divergent exit's live-out. The kill exit's φ gets no
    // tracker, so the header gained exactly one φ.
    let phis_after = func.block_insts(header).iter().filter(|x| func.is_phi(**x)).count();
    assert_eq!(phis_after, phis_before + 1, "the kill exit must not be tracked");

    assert_uniform_terminators(&func, &ctx);
    func.verify().unwrap();
    let cfg = ControlFlowGraph::with_function(&func);
    dt.verify(&func, &cfg).unwrap();

    // No break taken: each lane runs to its own bound.
    assert_lanewise_equivalent(
        &scalar,
        &func,
        4,
        &[lanes(&[1, 2, 3, 4]), splat(Immediate::I1(false), 4)],
    );
    // Uniform break on the first iteration.
    assert_lanewise_equivalent(
        &scalar,
        &func,
        4,
        &[lanes(&[1, 2, 3, 4]), splat(Immediate::I1(true), 4)],
    );
}

/// A lane-local reduction: the accumulator's pinned `Varying` shape survives the
/// transform, and each lane ends up with its own partial sum.
#[test]
fn pinned_reduction_shape_survives() {
    init_logging();
    let mut func = Function::new(
        "reduce",
        lanevec_ir::Signature::new([Type::I32], Some(Type::I32)),
    );
    let x = func.param(0);
    let zero = func.i32_const(0);
    let one = func.i32_const(1);
    let four = func.i32_const(4);
    let mut b = FunctionBuilder::new(&mut func);
    let entry = b.create_entry_block();
    let header = b.create_block();
    let latch = b.create_block();
    let exit = b.create_block();

    b.br(header);
    b.switch_to_block(header);
    let j = b.phi(&[(entry, zero)], Type::I32);
    let sum = b.phi(&[(entry, zero)], Type::I32);
    let cj = b.binary(BinaryOp::Slt, j, four);
    b.cond_br(cj, latch, exit);
    b.switch_to_block(latch);
    let sum2 = b.binary(BinaryOp::Add, sum, x);
    let j2 = b.binary(BinaryOp::Add, j, one);
    b.br(header);
    b.switch_to_block(exit);
    let s_out = b.phi(&[(header, sum)], Type::I32);
    b.ret(Some(s_out));

    let header_phis: Vec<_> = func.block_insts(header).to_vec();
    func.phi_args_mut(header_phis[0]).push((latch, j2));
    func.phi_args_mut(header_phis[1]).push((latch, sum2));

    let scalar = func.clone();

    let mut ctx = context_for(&func, 4);
    ctx.set_shape(x, VectorShape::varying());
    ctx.set_shape(cj, VectorShape::uniform());
    ctx.pin_with_shape(sum, VectorShape::varying());

    let mut masks = MaskTable::default();
    let platform = PlatformInfo::default();
    let dt = vectorize_region(&mut func, &mut ctx, &mut masks, &platform);

    // The loop is uniform; nothing to normalize, nothing to fold.
    assert_eq!(ctx.shape(sum), VectorShape::varying());
    ctx.set_shape(sum, VectorShape::uniform());
    assert_eq!(ctx.shape(sum), VectorShape::varying(), "pinned shapes never change");

    func.verify().unwrap();
    let cfg = ControlFlowGraph::with_function(&func);
    dt.verify(&func, &cfg).unwrap();

    // Lane-local partial sums: four additions of each lane's x.
    assert_lanewise_equivalent(&scalar, &func, 4, &[lanes(&[1, 2, 3, 4])]);
}
