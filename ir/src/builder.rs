use smallvec::SmallVec;

use crate::{
    BinaryOp, Block, FuncRef, Function, InstKind, Terminator, Type, UnaryOp, Value,
};

/// A convenience layer for constructing [Function] bodies.
///
/// The builder tracks a current block; instruction constructors append to it and
/// terminator constructors seal it. Blocks may be created ahead of time and switched
/// between freely, so arbitrary CFGs can be built in any order.
pub struct FunctionBuilder<'f> {
    pub func: &'f mut Function,
    current: Option<Block>,
}

impl<'f> FunctionBuilder<'f> {
    pub fn new(func: &'f mut Function) -> Self {
        Self {
            func,
            current: None,
        }
    }

    /// Create a new block, without switching to it
    pub fn create_block(&mut self) -> Block {
        self.func.create_block()
    }

    /// Create a new block and make it the entry block of the function
    pub fn create_entry_block(&mut self) -> Block {
        let block = self.func.create_block();
        self.func.set_entry(block);
        self.current = Some(block);
        block
    }

    pub fn switch_to_block(&mut self, block: Block) {
        self.current = Some(block);
    }

    pub fn current_block(&self) -> Block {
        self.current.expect("no current block")
    }

    fn append(&mut self, kind: InstKind, ty: Option<Type>) -> Option<Value> {
        let block = self.current_block();
        debug_assert!(
            !self.func.terminator(block).is_set(),
            "appending to terminated {block}"
        );
        self.func.append_inst(block, kind, ty).1
    }

    pub fn binary(&mut self, op: BinaryOp, lhs: Value, rhs: Value) -> Value {
        let ty = if op.is_comparison() {
            Type::I1
        } else {
            self.func.value_type(lhs)
        };
        self.append(InstKind::Binary { op, lhs, rhs }, Some(ty)).unwrap()
    }

    pub fn unary(&mut self, op: UnaryOp, arg: Value) -> Value {
        let ty = self.func.value_type(arg);
        self.append(InstKind::Unary { op, arg }, Some(ty)).unwrap()
    }

    pub fn select(&mut self, cond: Value, on_true: Value, on_false: Value) -> Value {
        let ty = self.func.value_type(on_true);
        self.append(
            InstKind::Select {
                cond,
                on_true,
                on_false,
            },
            Some(ty),
        )
        .unwrap()
    }

    /// Append a φ node to the current block.
    ///
    /// φs must be created before any non-φ instruction in the block.
    pub fn phi(&mut self, args: &[(Block, Value)], ty: Type) -> Value {
        debug_assert_eq!(
            self.func.first_non_phi_index(self.current_block()),
            self.func.block_insts(self.current_block()).len(),
            "phi created after non-phi instructions in {}",
            self.current_block()
        );
        self.append(
            InstKind::Phi {
                args: SmallVec::from_slice(args),
            },
            Some(ty),
        )
        .unwrap()
    }

    pub fn call(&mut self, callee: FuncRef, args: &[Value]) -> Option<Value> {
        let ty = self.func.ext_func(callee).signature.result;
        self.append(
            InstKind::Call {
                callee,
                args: SmallVec::from_slice(args),
            },
            ty,
        )
    }

    pub fn br(&mut self, dest: Block) {
        let block = self.current_block();
        self.func.set_terminator(block, Terminator::Br { dest });
    }

    pub fn cond_br(&mut self, cond: Value, then_dest: Block, else_dest: Block) {
        let block = self.current_block();
        self.func.set_terminator(
            block,
            Terminator::CondBr {
                cond,
                then_dest,
                else_dest,
            },
        );
    }

    pub fn ret(&mut self, value: Option<Value>) {
        let block = self.current_block();
        self.func.set_terminator(block, Terminator::Return(value));
    }

    pub fn unreachable(&mut self) {
        let block = self.current_block();
        self.func.set_terminator(block, Terminator::Unreachable);
    }
}
