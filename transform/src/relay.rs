use cranelift_entity::{entity_impl, PrimaryMap};
use lanevec_analysis::Region;
use lanevec_ir::{Block, Function, FxHashMap, FxHashSet};

/// A handle to a node in the [RelayChain].
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct RelayId(u32);
entity_impl!(RelayId, "relay");

/// A scheduled future target: the index of the block that will eventually be emitted,
/// the fresh empty block standing in for it until then, and the next pending target on
/// this chain.
pub(crate) struct RelayNode {
    pub id: usize,
    pub block: Block,
    pub next: Option<RelayId>,
}

/// The relay chain: the linearizer's encoding of "control must visit these targets, in
/// this order, at some point in the future".
///
/// There is at most one relay node per pending target index, and `next` links always
/// ascend by target index. Branches that owe a visit to a set of targets are redirected
/// to the relay *block* of the earliest one; when that target is emitted the relay
/// dissolves, and the emitted block's own branches carry the remainder of the chain
/// (its `next`) onward. Chains with a common suffix share nodes, so converging
/// obligations merge structurally.
#[derive(Default)]
pub(crate) struct RelayChain {
    nodes: PrimaryMap<RelayId, RelayNode>,
    by_target: FxHashMap<usize, RelayId>,
    relay_blocks: FxHashSet<Block>,
}

impl RelayChain {
    /// The pending relay for target `id`, if one exists
    pub fn get(&self, id: usize) -> Option<RelayId> {
        self.by_target.get(&id).copied()
    }

    pub fn node(&self, relay: RelayId) -> &RelayNode {
        &self.nodes[relay]
    }

    /// Returns true if `block` is a live relay block
    pub fn is_relay_block(&self, block: Block) -> bool {
        self.relay_blocks.contains(&block)
    }

    /// Get or create the relay node for target `id`.
    ///
    /// Creating one materializes a fresh empty block that joins the region; branches
    /// redirected to it converge there until the target is emitted.
    pub fn request(&mut self, func: &mut Function, region: &mut Region, id: usize) -> RelayId {
        if let Some(existing) = self.get(id) {
            return existing;
        }
        let block = func.create_block();
        region.insert(block);
        self.relay_blocks.insert(block);
        let relay = self.nodes.push(RelayNode {
            id,
            block,
            next: None,
        });
        self.by_target.insert(id, relay);
        log::trace!(target: "linearize", "created {block} as relay for target index {id}");
        relay
    }

    /// Schedule target `id` on the chain reachable from `anchor`.
    ///
    /// Returns the head of the resulting chain, i.e. the relay whose block branches
    /// owing this whole set of targets must be redirected to. If `id` already exists
    /// downstream of `anchor` the chain is unchanged.
    pub fn add_target(
        &mut self,
        func: &mut Function,
        region: &mut Region,
        anchor: Option<RelayId>,
        id: usize,
    ) -> RelayId {
        let node = self.request(func, region, id);
        match anchor {
            None => node,
            Some(anchor) => self.merge(anchor, node),
        }
    }

    /// Merge two ascending chains that may share a suffix, returning the head.
    fn merge(&mut self, a: RelayId, b: RelayId) -> RelayId {
        if a == b {
            return a;
        }
        let (head, tail) = if self.nodes[a].id < self.nodes[b].id {
            (a, b)
        } else {
            debug_assert_ne!(
                self.nodes[a].id, self.nodes[b].id,
                "distinct relays for one target"
            );
            (b, a)
        };
        let merged = match self.nodes[head].next {
            None => tail,
            Some(next) => self.merge(next, tail),
        };
        self.nodes[head].next = Some(merged);
        head
    }

    /// Retire the relay for target `id`, if one is pending.
    ///
    /// Returns the relay block that was standing in for the target (so the caller can
    /// rewire its uses onto the just-emitted real block) and the next pending target of
    /// the chain, which becomes the emitted block's outgoing obligation.
    pub fn advance_head(&mut self, id: usize) -> Option<(Block, Option<RelayId>)> {
        let relay = self.by_target.remove(&id)?;
        let node = &self.nodes[relay];
        Some((node.block, node.next))
    }

    /// Forget a dissolved relay block
    pub fn release_block(&mut self, block: Block) {
        self.relay_blocks.remove(&block);
    }

    /// Returns true if no targets are pending
    pub fn is_drained(&self) -> bool {
        self.by_target.is_empty()
    }
}
