use lanevec_analysis::VectorizationContext;
use lanevec_ir::{Block, Function, SmallVec, Value};

use crate::{index::BlockIndex, linearize::current_preds};

/// Produce a definition of `value` that dominates `dest`.
///
/// Rewrites routinely move a use of a value from the block range its definition
/// dominates into a later block; this walks the topological index from the definition
/// to `dest`, maintaining a running definition per index position. At each block the
/// running definitions of the in-span predecessors are reconciled: predecessors from
/// before the definition contribute `undef`, and if the incomings disagree a φ is
/// inserted at the block's first insertion point. Back-edge predecessors feed the φ its
/// own result, since the running definition does not change around a loop.
///
/// Returns the dominating definition at `dest`; values without a defining block
/// (parameters, constants, undefs) are returned unchanged.
pub(crate) fn promote_definition(
    func: &mut Function,
    ctx: &mut VectorizationContext,
    index: &BlockIndex,
    value: Value,
    dest: Block,
) -> Value {
    let Some(def_block) = func.value_def_block(value) else {
        return value;
    };
    let def_idx = index.expect(def_block);
    let dest_idx = index.expect(dest);
    assert!(
        def_idx <= dest_idx,
        "cannot promote {value}: its definition in {def_block} is scheduled after {dest}"
    );
    if def_idx == dest_idx {
        return value;
    }

    let ty = func.value_type(value);
    let shape = ctx.shape(value);
    let span = dest_idx - def_idx;
    let mut defs: Vec<Option<Value>> = vec![None; span + 1];
    defs[0] = Some(value);

    for i in 1..=span {
        let block = index.block_at(def_idx + i);
        let mut incomings: SmallVec<[(Block, Value); 2]> = SmallVec::new();
        let mut backedge_preds: SmallVec<[Block; 2]> = SmallVec::new();
        for pred in current_preds(func, block) {
            let Some(pred_idx) = index.get(pred) else {
                continue;
            };
            if pred_idx >= def_idx + i {
                backedge_preds.push(pred);
                continue;
            }
            let incoming = if pred_idx < def_idx {
                func.undef(ty)
            } else {
                defs[pred_idx - def_idx].unwrap_or_else(|| func.undef(ty))
            };
            incomings.push((pred, incoming));
        }

        debug_assert!(!incomings.is_empty(), "{block} has no forward predecessors");
        let agreed = incomings[1..].iter().all(|(_, v)| *v == incomings[0].1);
        defs[i] = Some(if agreed && backedge_preds.is_empty() {
            incomings[0].1
        } else {
            let (phi, result) = func.prepend_phi(block, incomings, ty);
            for pred in backedge_preds {
                func.phi_args_mut(phi).push((pred, result));
            }
            ctx.set_shape(result, shape);
            log::trace!(target: "linearize", "promoted {value} with {result} in {block}");
            result
        });
    }

    defs[span].expect("promotion span ended without a definition")
}
