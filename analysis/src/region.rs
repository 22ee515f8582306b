use lanevec_ir::{Block, Function, FxHashSet};

/// A single-entry subset of a function's blocks, closed under in-region control flow.
///
/// All of the vectorizer's transformations operate on in-region blocks only; anything
/// outside the region is never touched, and values defined outside it are
/// soft-tolerated (they simply have no shape).
#[derive(Debug, Clone)]
pub struct Region {
    entry: Block,
    blocks: FxHashSet<Block>,
}

impl Region {
    pub fn new(entry: Block, blocks: impl IntoIterator<Item = Block>) -> Self {
        let blocks: FxHashSet<Block> = blocks.into_iter().collect();
        assert!(blocks.contains(&entry), "region does not contain its entry {entry}");
        Self { entry, blocks }
    }

    /// The region spanning every live block of `func`
    pub fn whole_function(func: &Function) -> Self {
        Self::new(func.entry_block(), func.blocks())
    }

    pub fn entry(&self) -> Block {
        self.entry
    }

    #[inline]
    pub fn contains(&self, block: Block) -> bool {
        self.blocks.contains(&block)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Extend the region with a block created mid-transform (e.g. a relay block)
    pub fn insert(&mut self, block: Block) {
        self.blocks.insert(block);
    }

    /// Remove a deleted block from the region
    pub fn remove(&mut self, block: Block) {
        self.blocks.remove(&block);
    }
}
