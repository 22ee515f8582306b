use cranelift_entity::entity_impl;

/// A handle to a basic block in a [Function](crate::Function).
///
/// Blocks are never reused; deleting a block leaves a tombstone in the arena.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "block");

/// A handle to an instruction in a [Function](crate::Function).
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Inst(u32);
entity_impl!(Inst, "inst");

/// A handle to an SSA value: a function parameter, an instruction result, a constant,
/// or an undef of some type.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(u32);
entity_impl!(Value, "v");

/// A handle to an external function declared in a [Function](crate::Function).
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncRef(u32);
entity_impl!(FuncRef, "fn");
