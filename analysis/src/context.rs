use lanevec_ir::{
    Block, ControlFlowGraph, Function, FxHashMap, FxHashSet, LoopForest, LoopId, SmallVec, Value,
};

use crate::{parse_shapes, Region, ShapeParseError, VectorShape};

/// The scalar-to-vector mapping being materialized for one region: which function is
/// being vectorized, to what width, and with which argument/result shapes.
#[derive(Debug, Clone)]
pub struct VectorMapping {
    /// The name of the scalar function being vectorized
    pub scalar_name: String,
    /// The name the vectorized function will be emitted under
    pub vector_name: String,
    /// The vector width W
    pub vector_width: u32,
    /// The argument position a caller-provided entry mask occupies, if any
    pub mask_pos: Option<usize>,
    /// Per-argument shapes, in argument order
    pub arg_shapes: SmallVec<[VectorShape; 4]>,
    /// The shape of the returned value, if the function returns one
    pub result_shape: Option<VectorShape>,
}

impl VectorMapping {
    /// Create a mapping with no argument shapes attached yet.
    ///
    /// # Panics
    ///
    /// Panics if `vector_width` is not a power of two.
    pub fn new(scalar_name: impl Into<String>, vector_width: u32) -> Self {
        assert!(
            vector_width.is_power_of_two(),
            "vector width {vector_width} is not a power of two"
        );
        let scalar_name = scalar_name.into();
        let vector_name = format!("{scalar_name}_v{vector_width}");
        Self {
            scalar_name,
            vector_name,
            vector_width,
            mask_pos: None,
            arg_shapes: SmallVec::new(),
            result_shape: None,
        }
    }

    /// Create a mapping whose argument and result shapes are decoded from a shape
    /// string (see [parse_shapes]).
    pub fn from_shape_string(
        scalar_name: impl Into<String>,
        vector_width: u32,
        shapes: &str,
    ) -> Result<Self, ShapeParseError> {
        let (arg_shapes, result_shape) = parse_shapes(shapes)?;
        let mut mapping = Self::new(scalar_name, vector_width);
        mapping.arg_shapes = arg_shapes;
        mapping.result_shape = result_shape;
        Ok(mapping)
    }
}

/// Per-region vectorization state: the shape map, block predicates, and the
/// divergence classification produced by the surrounding analyses.
///
/// The context is the single mutable rendez-vous between shape analysis, mask
/// analysis, the loop normalizer and the linearizer. Shapes may be `pin`ned, after
/// which further updates are silently ignored; this is how reduction results and
/// tracker φs keep their shapes through later re-analysis.
pub struct VectorizationContext {
    pub mapping: VectorMapping,
    region: Region,
    shapes: FxHashMap<Value, VectorShape>,
    pinned: FxHashSet<Value>,
    predicates: FxHashMap<Block, Value>,
    divergent_loops: FxHashSet<LoopId>,
    /// Blocks outside a divergent loop that one of its exit edges targets
    divergent_loop_exits: FxHashSet<Block>,
    /// Blocks where divergent control flow joins back together
    join_divergent_blocks: FxHashSet<Block>,
    /// Blocks with at least one in-region predecessor whose terminator shape is
    /// non-uniform
    varying_predicate_blocks: FxHashSet<Block>,
}

impl VectorizationContext {
    pub fn new(mapping: VectorMapping, region: Region) -> Self {
        Self {
            mapping,
            region,
            shapes: FxHashMap::default(),
            pinned: FxHashSet::default(),
            predicates: FxHashMap::default(),
            divergent_loops: FxHashSet::default(),
            divergent_loop_exits: FxHashSet::default(),
            join_divergent_blocks: FxHashSet::default(),
            varying_predicate_blocks: FxHashSet::default(),
        }
    }

    /// The vector width W of this invocation
    pub fn width(&self) -> u32 {
        self.mapping.vector_width
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn region_mut(&mut self) -> &mut Region {
        &mut self.region
    }

    /// Returns true if `block` belongs to the region under transformation
    #[inline]
    pub fn in_region(&self, block: Block) -> bool {
        self.region.contains(block)
    }

    /// Returns true if `value` is defined inside the region.
    ///
    /// Parameters, constants and undefs are defined nowhere and are considered
    /// in-region: they are visible everywhere the region is.
    pub fn in_region_value(&self, func: &Function, value: Value) -> bool {
        match func.value_def_block(value) {
            Some(block) => self.region.contains(block),
            None => true,
        }
    }

    // ------------------------------------------------------------------------------------
    // Shapes

    /// The shape recorded for `value`; `Undef` when nothing is known
    pub fn shape(&self, value: Value) -> VectorShape {
        self.shapes.get(&value).copied().unwrap_or_default()
    }

    /// Record `shape` for `value`.
    ///
    /// Fails silently if the value's shape is pinned.
    pub fn set_shape(&mut self, value: Value, shape: VectorShape) {
        if self.pinned.contains(&value) {
            log::trace!(target: "vecctx", "ignoring shape update for pinned {value}");
            return;
        }
        self.shapes.insert(value, shape);
    }

    /// Returns true if the shape of `value` is immutable
    pub fn is_pinned(&self, value: Value) -> bool {
        self.pinned.contains(&value)
    }

    /// Make the current shape of `value` immutable
    pub fn pin(&mut self, value: Value) {
        self.pinned.insert(value);
    }

    /// Record `shape` for `value` and make it immutable
    pub fn pin_with_shape(&mut self, value: Value, shape: VectorShape) {
        self.set_shape(value, shape);
        self.pin(value);
    }

    /// The shape of `value` as observed from `observer`.
    ///
    /// A value defined inside a divergent loop was produced on different iterations by
    /// different lanes; observed from outside that loop it is `Varying` regardless of
    /// its shape at the definition ("temporal divergence"). Inside the loop, and for
    /// definitions not enclosed by any divergent loop, the stored shape is returned.
    pub fn observed_shape(
        &self,
        func: &Function,
        forest: &LoopForest,
        value: Value,
        observer: Block,
    ) -> VectorShape {
        let shape = self.shape(value);
        let Some(def_block) = func.value_def_block(value) else {
            return shape;
        };
        let mut current = forest.loop_for(def_block);
        while let Some(l) = current {
            if self.is_divergent_loop(l) && !forest.contains_block(l, observer) {
                return VectorShape::varying();
            }
            current = forest.parent_loop(l);
        }
        shape
    }

    // ------------------------------------------------------------------------------------
    // Predicates

    /// The SSA value carrying the execution mask of `block`, if one was recorded
    pub fn predicate(&self, block: Block) -> Option<Value> {
        self.predicates.get(&block).copied()
    }

    pub fn set_predicate(&mut self, block: Block, mask: Value) {
        debug_assert!(self.in_region(block), "{block} is outside the region");
        self.predicates.insert(block, mask);
    }

    pub fn drop_predicate(&mut self, block: Block) {
        self.predicates.remove(&block);
    }

    // ------------------------------------------------------------------------------------
    // Divergence classification

    pub fn add_divergent_loop(&mut self, l: LoopId) {
        self.divergent_loops.insert(l);
    }

    pub fn remove_divergent_loop(&mut self, l: LoopId) {
        self.divergent_loops.remove(&l);
    }

    /// Returns true if the iteration count of `l` differs across lanes
    pub fn is_divergent_loop(&self, l: LoopId) -> bool {
        self.divergent_loops.contains(&l)
    }

    pub fn is_divergent_loop_exit(&self, block: Block) -> bool {
        self.divergent_loop_exits.contains(&block)
    }

    pub fn is_join_divergent(&self, block: Block) -> bool {
        self.join_divergent_blocks.contains(&block)
    }

    /// Returns true if some in-region predecessor of `block` ends in a branch whose
    /// condition shape is not uniform
    pub fn has_varying_predicate(&self, block: Block) -> bool {
        self.varying_predicate_blocks.contains(&block)
    }

    /// Returns true if the terminator of `block` is a conditional branch on a
    /// non-uniform condition
    pub fn is_divergent_branch(&self, func: &Function, block: Block) -> bool {
        func.terminator(block)
            .condition()
            .is_some_and(|cond| !self.shape(cond).is_uniform())
    }

    /// Derive the control-divergence block sets from the current terminator shapes.
    ///
    /// In the full pipeline the upstream divergence analysis owns these sets; deriving
    /// them here keeps their defining invariants checkable in isolation:
    ///
    /// * a block is in `varying_predicate_blocks` iff some in-region predecessor has a
    ///   non-uniform terminator shape
    /// * a block is in `join_divergent_blocks` iff it additionally has more than one
    ///   in-region predecessor
    /// * every out-of-loop target of a divergent loop's exit edge is in
    ///   `divergent_loop_exits`
    pub fn classify_control(
        &mut self,
        func: &Function,
        cfg: &ControlFlowGraph,
        forest: &LoopForest,
    ) {
        self.varying_predicate_blocks.clear();
        self.join_divergent_blocks.clear();
        self.divergent_loop_exits.clear();

        let members: Vec<Block> = func.blocks().filter(|b| self.in_region(*b)).collect();
        for block in members {
            let mut in_region_preds = 0usize;
            let mut varying = false;
            for &pred in cfg.pred(block) {
                if !self.in_region(pred) {
                    continue;
                }
                in_region_preds += 1;
                varying |= self.is_divergent_branch(func, pred);
            }
            if varying {
                self.varying_predicate_blocks.insert(block);
                if in_region_preds > 1 {
                    self.join_divergent_blocks.insert(block);
                }
            }
        }

        for l in forest.loops_in_preorder() {
            if !self.is_divergent_loop(l) {
                continue;
            }
            for (_, exit) in forest.exit_edges(func, l) {
                self.divergent_loop_exits.insert(exit);
            }
        }
    }
}
