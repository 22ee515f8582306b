//! Dominator tree construction and queries.
//!
//! The tree is built with the iterative algorithm of Cooper, Harvey and Kennedy,
//! ["A Simple, Fast Dominance Algorithm"](https://www.cs.rice.edu/~keith/EMBED/dom.pdf),
//! which converges in a handful of passes over the reverse post-order for reducible
//! CFGs. The linearizer repairs the tree incrementally as it restructures control flow
//! (see [DominatorTree::set_idom]), and [DominatorTree::verify] checks a tree against a
//! freshly computed one, so incremental maintenance bugs surface as verification
//! failures rather than silent miscompiles.

use cranelift_entity::{packed_option::PackedOption, SecondaryMap};
use miette::Report;
use rustc_hash::FxHashSet;

use crate::{cfg, Block, ControlFlowGraph, Function};

pub struct DominatorTree {
    /// The immediate dominator of each block; `None` for the entry block and for
    /// blocks not reachable from it
    idom: SecondaryMap<Block, PackedOption<Block>>,
    /// 1-based reverse post-order numbers; 0 marks blocks unreachable at the time the
    /// tree was last computed
    rpo_number: SecondaryMap<Block, u32>,
    entry: Block,
}

impl DominatorTree {
    /// Compute the dominator tree of `func`
    pub fn with_function(func: &Function, cfg: &ControlFlowGraph) -> Self {
        let entry = func.entry_block();
        let mut tree = Self {
            idom: SecondaryMap::new(),
            rpo_number: SecondaryMap::new(),
            entry,
        };
        tree.compute(func, cfg);
        tree
    }

    /// Recompute the tree from scratch for the current state of `func`
    pub fn compute(&mut self, func: &Function, cfg: &ControlFlowGraph) {
        self.entry = func.entry_block();
        self.idom = SecondaryMap::new();
        self.rpo_number = SecondaryMap::new();

        let rpo = cfg::reverse_postorder(func, self.entry);
        for (i, block) in rpo.iter().enumerate() {
            self.rpo_number[*block] = (i + 1) as u32;
        }

        // Temporarily let the entry dominate itself so `intersect` has a fixed point.
        self.idom[self.entry] = self.entry.into();
        let mut changed = true;
        while changed {
            changed = false;
            for &block in rpo.iter().skip(1) {
                let mut new_idom: Option<Block> = None;
                for &pred in cfg.pred(block) {
                    if self.rpo_number[pred] == 0 || self.idom[pred].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(current) => self.intersect(pred, current),
                    });
                }
                let new_idom =
                    new_idom.unwrap_or_else(|| panic!("{block} has no processed predecessor"));
                if self.idom[block].expand() != Some(new_idom) {
                    self.idom[block] = new_idom.into();
                    changed = true;
                }
            }
        }
        self.idom[self.entry] = PackedOption::default();
    }

    fn intersect(&self, a: Block, b: Block) -> Block {
        let mut a = a;
        let mut b = b;
        while a != b {
            while self.rpo_number[a] > self.rpo_number[b] {
                a = self.idom[a].expand().expect("dominator chain ended before the entry");
            }
            while self.rpo_number[b] > self.rpo_number[a] {
                b = self.idom[b].expand().expect("dominator chain ended before the entry");
            }
        }
        a
    }

    pub fn entry(&self) -> Block {
        self.entry
    }

    /// The immediate dominator of `block`, or `None` for the entry and for
    /// unreachable blocks
    pub fn idom(&self, block: Block) -> Option<Block> {
        self.idom[block].expand()
    }

    /// Reassign the immediate dominator of `block`.
    ///
    /// Callers are responsible for keeping the idom relation acyclic; this is the
    /// incremental-repair entry point used while restructuring the CFG.
    pub fn set_idom(&mut self, block: Block, idom: Option<Block>) {
        self.idom[block] = idom.into();
    }

    /// Returns true if `block` was reachable from the entry when the tree was last
    /// computed from scratch
    pub fn is_reachable(&self, block: Block) -> bool {
        block == self.entry || self.rpo_number[block] != 0
    }

    /// Returns true if `a` dominates `b` (reflexively)
    pub fn dominates(&self, a: Block, b: Block) -> bool {
        let mut b = b;
        loop {
            if a == b {
                return true;
            }
            match self.idom[b].expand() {
                Some(parent) => b = parent,
                None => return false,
            }
        }
    }

    /// The nearest common dominator of `a` and `b`.
    ///
    /// # Panics
    ///
    /// Panics if the blocks have no common dominator, i.e. one of them is not in the
    /// tree.
    pub fn nearest_common_dominator(&self, a: Block, b: Block) -> Block {
        let mut ancestors = FxHashSet::default();
        let mut x = Some(a);
        while let Some(block) = x {
            ancestors.insert(block);
            x = self.idom(block);
        }
        let mut y = b;
        loop {
            if ancestors.contains(&y) {
                return y;
            }
            y = self
                .idom(y)
                .unwrap_or_else(|| panic!("{a} and {b} have no common dominator"));
        }
    }

    /// Check this tree against a freshly computed one for the current CFG.
    pub fn verify(&self, func: &Function, cfg: &ControlFlowGraph) -> Result<(), Report> {
        let fresh = Self::with_function(func, cfg);
        for block in func.blocks() {
            if !fresh.is_reachable(block) {
                continue;
            }
            if self.idom(block) != fresh.idom(block) {
                return Err(Report::msg(format!(
                    "stale immediate dominator for {block}: have {:?}, expected {:?}",
                    self.idom(block),
                    fresh.idom(block)
                )));
            }
        }
        Ok(())
    }
}
