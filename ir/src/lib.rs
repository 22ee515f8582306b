//! Arena-based SSA intermediate representation for the lanevec region vectorizer.
//!
//! The IR is deliberately small: enough to express the scalar control-flow regions the
//! vectorizer consumes, and nothing more. Blocks, instructions and values live in
//! [`cranelift_entity::PrimaryMap`] arenas and refer to each other by stable integer ids,
//! which keeps the (cyclic) control-flow graph free of ownership cycles.
//!
//! Alongside the data model proper, this crate provides the CFG utilities the transforms
//! are built on: predecessor tables and post-order traversal ([`cfg`]), a dominator tree
//! with incremental idom repair ([`DominatorTree`]), and a natural-loop forest
//! ([`LoopForest`]).

mod builder;
pub mod cfg;
mod dominance;
mod entities;
mod function;
mod loops;
mod types;

pub use cranelift_entity::{packed_option::PackedOption, PrimaryMap, SecondaryMap};
pub use miette::Report;
pub use rustc_hash::{FxHashMap, FxHashSet};
pub use smallvec::{smallvec, SmallVec};

pub use self::{
    builder::FunctionBuilder,
    cfg::ControlFlowGraph,
    dominance::DominatorTree,
    entities::{Block, FuncRef, Inst, Value},
    function::{
        BlockData, ExtFuncData, Function, FunctionAttributes, InstData, InstKind, Signature,
        Terminator, ValueData,
    },
    loops::{LoopForest, LoopId},
    types::{BinaryOp, Immediate, Type, UnaryOp},
};
