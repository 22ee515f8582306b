use core::fmt;

use cranelift_entity::{packed_option::PackedOption, PrimaryMap, SecondaryMap};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::{BinaryOp, Block, FuncRef, Immediate, Inst, Report, Type, UnaryOp, Value};

bitflags::bitflags! {
    /// Attributes attached to external function declarations.
    ///
    /// These correspond to the usual callee-side guarantees a caller may rely on, and are
    /// what the reduction-intrinsic contract requires of `rv_any`-style callees.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct FunctionAttributes: u8 {
        /// The callee neither reads nor writes memory
        const NO_MEMORY = 1;
        /// The callee never unwinds
        const NO_THROW = 1 << 1;
        /// The callee is control-flow convergent: it must not be sunk into or hoisted out
        /// of divergent control flow
        const CONVERGENT = 1 << 2;
        /// The callee does not call itself, directly or indirectly
        const NO_RECURSE = 1 << 3;
    }
}

/// The type signature of a function.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Signature {
    pub params: SmallVec<[Type; 4]>,
    /// `None` means the function returns no value
    pub result: Option<Type>,
}

impl Signature {
    pub fn new(params: impl IntoIterator<Item = Type>, result: Option<Type>) -> Self {
        Self {
            params: SmallVec::from_iter(params),
            result,
        }
    }
}

/// An external function declaration referenced by [InstKind::Call].
#[derive(Debug, Clone)]
pub struct ExtFuncData {
    pub name: String,
    pub signature: Signature,
    pub attrs: FunctionAttributes,
}

/// How an SSA [Value] is defined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueData {
    /// The `index`th parameter of the containing function
    Param { index: usize, ty: Type },
    /// The result of an instruction
    Result { inst: Inst, ty: Type },
    /// A constant immediate
    Const { imm: Immediate },
    /// An undefined value of the given type
    Undef { ty: Type },
}

impl ValueData {
    pub fn ty(&self) -> Type {
        match self {
            Self::Param { ty, .. } | Self::Result { ty, .. } | Self::Undef { ty } => *ty,
            Self::Const { imm } => imm.ty(),
        }
    }
}

/// The operation performed by an instruction.
///
/// φ nodes are instructions here (LLVM-style), not block arguments: the linearizer and
/// the loop normalizer rewrite, migrate, and fold φs as data, which is much more direct
/// when they are ordinary instructions at the head of a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstKind {
    /// A φ node; `args` pairs an incoming predecessor block with the value observed
    /// when control arrives from that block
    Phi {
        args: SmallVec<[(Block, Value); 2]>,
    },
    /// Lane-wise select: `cond ? on_true : on_false`
    Select {
        cond: Value,
        on_true: Value,
        on_false: Value,
    },
    Unary {
        op: UnaryOp,
        arg: Value,
    },
    Binary {
        op: BinaryOp,
        lhs: Value,
        rhs: Value,
    },
    /// Call to an external function
    Call {
        callee: FuncRef,
        args: SmallVec<[Value; 2]>,
    },
}

impl InstKind {
    /// Returns true if this is a φ node
    #[inline]
    pub fn is_phi(&self) -> bool {
        matches!(self, Self::Phi { .. })
    }

    /// The value operands of this instruction, in order.
    pub fn operands(&self) -> SmallVec<[Value; 4]> {
        match self {
            Self::Phi { args } => args.iter().map(|(_, v)| *v).collect(),
            Self::Select {
                cond,
                on_true,
                on_false,
            } => SmallVec::from_slice(&[*cond, *on_true, *on_false]),
            Self::Unary { arg, .. } => SmallVec::from_slice(&[*arg]),
            Self::Binary { lhs, rhs, .. } => SmallVec::from_slice(&[*lhs, *rhs]),
            Self::Call { args, .. } => args.iter().copied().collect(),
        }
    }

    /// Apply `f` to every value operand of this instruction.
    pub fn for_each_operand_mut(&mut self, mut f: impl FnMut(&mut Value)) {
        match self {
            Self::Phi { args } => {
                for (_, v) in args.iter_mut() {
                    f(v);
                }
            }
            Self::Select {
                cond,
                on_true,
                on_false,
            } => {
                f(cond);
                f(on_true);
                f(on_false);
            }
            Self::Unary { arg, .. } => f(arg),
            Self::Binary { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            Self::Call { args, .. } => {
                for v in args.iter_mut() {
                    f(v);
                }
            }
        }
    }
}

/// An instruction: an [InstKind] plus its result type, if any.
#[derive(Debug, Clone)]
pub struct InstData {
    pub kind: InstKind,
    /// `None` for instructions that produce no value
    pub ty: Option<Type>,
}

/// A block terminator.
///
/// The vectorizer only understands this closed set of terminators; in particular there
/// is no switch, and region entry rejects anything else by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminator {
    /// The block is still under construction (or is a transient relay block)
    None,
    Return(Option<Value>),
    Unreachable,
    Br {
        dest: Block,
    },
    CondBr {
        cond: Value,
        then_dest: Block,
        else_dest: Block,
    },
}

impl Terminator {
    /// Returns true if a terminator has been attached
    pub fn is_set(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// The branch condition, if this is a conditional branch
    pub fn condition(&self) -> Option<Value> {
        match self {
            Self::CondBr { cond, .. } => Some(*cond),
            _ => None,
        }
    }

    /// The successor blocks of this terminator, in successor-index order.
    pub fn successors(&self) -> SmallVec<[Block; 2]> {
        match self {
            Self::Br { dest } => SmallVec::from_slice(&[*dest]),
            Self::CondBr {
                then_dest,
                else_dest,
                ..
            } => SmallVec::from_slice(&[*then_dest, *else_dest]),
            _ => SmallVec::new(),
        }
    }

    /// Retarget every successor equal to `from` so that it branches to `to` instead.
    pub fn retarget(&mut self, from: Block, to: Block) {
        match self {
            Self::Br { dest } => {
                if *dest == from {
                    *dest = to;
                }
            }
            Self::CondBr {
                then_dest,
                else_dest,
                ..
            } => {
                if *then_dest == from {
                    *then_dest = to;
                }
                if *else_dest == from {
                    *else_dest = to;
                }
            }
            _ => {}
        }
    }
}

/// A basic block: an ordered list of instructions (φs first) plus a terminator.
#[derive(Debug, Clone, Default)]
pub struct BlockData {
    pub insts: Vec<Inst>,
    pub terminator: Terminator,
    dead: bool,
}

impl Default for Terminator {
    fn default() -> Self {
        Self::None
    }
}

/// A function: parameter list, entity arenas, and the entry block.
#[derive(Clone)]
pub struct Function {
    pub name: String,
    pub signature: Signature,
    blocks: PrimaryMap<Block, BlockData>,
    insts: PrimaryMap<Inst, InstData>,
    values: PrimaryMap<Value, ValueData>,
    ext_funcs: PrimaryMap<FuncRef, ExtFuncData>,
    /// The block currently containing each instruction
    inst_block: SecondaryMap<Inst, PackedOption<Block>>,
    /// The result value of each instruction, if it has one
    results: SecondaryMap<Inst, PackedOption<Value>>,
    params: SmallVec<[Value; 4]>,
    undefs: FxHashMap<Type, Value>,
    consts: FxHashMap<Immediate, Value>,
    entry: PackedOption<Block>,
}

impl Function {
    pub fn new(name: impl Into<String>, signature: Signature) -> Self {
        let mut values = PrimaryMap::new();
        let mut params = SmallVec::new();
        for (index, ty) in signature.params.iter().copied().enumerate() {
            params.push(values.push(ValueData::Param { index, ty }));
        }
        Self {
            name: name.into(),
            signature,
            blocks: PrimaryMap::new(),
            insts: PrimaryMap::new(),
            values,
            ext_funcs: PrimaryMap::new(),
            inst_block: SecondaryMap::new(),
            results: SecondaryMap::new(),
            params,
            undefs: FxHashMap::default(),
            consts: FxHashMap::default(),
            entry: PackedOption::default(),
        }
    }

    /// The value bound to the `index`th function parameter
    pub fn param(&self, index: usize) -> Value {
        self.params[index]
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// The upper bound (exclusive) of block ids ever created, including dead blocks.
    ///
    /// Useful for sizing secondary tables.
    pub fn block_capacity(&self) -> usize {
        self.blocks.len()
    }

    // ------------------------------------------------------------------------------------
    // Blocks

    pub fn create_block(&mut self) -> Block {
        self.blocks.push(BlockData::default())
    }

    pub fn set_entry(&mut self, block: Block) {
        self.entry = block.into();
    }

    /// The entry block of the function.
    ///
    /// # Panics
    ///
    /// Panics if no entry block has been set.
    pub fn entry_block(&self) -> Block {
        self.entry.expand().expect("function has no entry block")
    }

    /// Iterate over all live blocks in creation order
    pub fn blocks(&self) -> impl Iterator<Item = Block> + '_ {
        self.blocks.iter().filter_map(|(b, data)| (!data.dead).then_some(b))
    }

    #[inline]
    pub fn is_block_alive(&self, block: Block) -> bool {
        !self.blocks[block].dead
    }

    /// Delete `block`, leaving a tombstone in the arena.
    ///
    /// The block must already be empty of instructions; callers are responsible for
    /// retargeting any branches that still refer to it.
    pub fn remove_block(&mut self, block: Block) {
        debug_assert!(
            self.blocks[block].insts.is_empty(),
            "cannot remove non-empty {block}"
        );
        let data = &mut self.blocks[block];
        data.dead = true;
        data.terminator = Terminator::None;
    }

    pub fn block_insts(&self, block: Block) -> &[Inst] {
        &self.blocks[block].insts
    }

    pub fn terminator(&self, block: Block) -> &Terminator {
        &self.blocks[block].terminator
    }

    pub fn terminator_mut(&mut self, block: Block) -> &mut Terminator {
        &mut self.blocks[block].terminator
    }

    pub fn set_terminator(&mut self, block: Block, terminator: Terminator) {
        self.blocks[block].terminator = terminator;
    }

    /// The successors of `block`, in successor-index order
    pub fn successors(&self, block: Block) -> SmallVec<[Block; 2]> {
        self.blocks[block].terminator.successors()
    }

    // ------------------------------------------------------------------------------------
    // Instructions

    /// Append an instruction to `block`, creating its result value if `ty` is given.
    pub fn append_inst(
        &mut self,
        block: Block,
        kind: InstKind,
        ty: Option<Type>,
    ) -> (Inst, Option<Value>) {
        let inst = self.make_inst(kind, ty);
        self.blocks[block].insts.push(inst);
        self.inst_block[inst] = block.into();
        (inst, self.results[inst].expand())
    }

    /// Insert an instruction into `block` at position `index`.
    pub fn insert_inst(
        &mut self,
        block: Block,
        index: usize,
        kind: InstKind,
        ty: Option<Type>,
    ) -> (Inst, Option<Value>) {
        let inst = self.make_inst(kind, ty);
        self.blocks[block].insts.insert(index, inst);
        self.inst_block[inst] = block.into();
        (inst, self.results[inst].expand())
    }

    /// Insert a φ node at the head of `block`.
    pub fn prepend_phi(
        &mut self,
        block: Block,
        args: SmallVec<[(Block, Value); 2]>,
        ty: Type,
    ) -> (Inst, Value) {
        let (inst, value) = self.insert_inst(block, 0, InstKind::Phi { args }, Some(ty));
        (inst, value.unwrap())
    }

    fn make_inst(&mut self, kind: InstKind, ty: Option<Type>) -> Inst {
        let inst = self.insts.push(InstData { kind, ty });
        if let Some(ty) = ty {
            let value = self.values.push(ValueData::Result { inst, ty });
            self.results[inst] = value.into();
        }
        inst
    }

    /// The index of the first non-φ instruction in `block`.
    ///
    /// This is the block's insertion point for non-φ instructions.
    pub fn first_non_phi_index(&self, block: Block) -> usize {
        self.blocks[block]
            .insts
            .iter()
            .position(|inst| !self.insts[*inst].kind.is_phi())
            .unwrap_or(self.blocks[block].insts.len())
    }

    /// Detach `inst` from its containing block.
    ///
    /// Any remaining uses of the instruction's result become dangling; callers must have
    /// rewritten them first.
    pub fn remove_inst(&mut self, inst: Inst) {
        let block = self.inst_block[inst].expand().expect("instruction is not in a block");
        self.blocks[block].insts.retain(|i| *i != inst);
        self.inst_block[inst] = PackedOption::default();
    }

    /// Move `inst` from its current block to the end of `to`'s instruction list.
    pub fn transfer_inst(&mut self, inst: Inst, to: Block) {
        let from = self.inst_block[inst].expand().expect("instruction is not in a block");
        self.blocks[from].insts.retain(|i| *i != inst);
        self.blocks[to].insts.push(inst);
        self.inst_block[inst] = to.into();
    }

    /// Move every instruction of `from` to the front of `to`, preserving their order.
    pub fn move_all_insts_to_front(&mut self, from: Block, to: Block) {
        let moved = core::mem::take(&mut self.blocks[from].insts);
        for inst in moved.iter() {
            self.inst_block[*inst] = to.into();
        }
        let tail = core::mem::replace(&mut self.blocks[to].insts, moved);
        self.blocks[to].insts.extend(tail);
    }

    pub fn inst(&self, inst: Inst) -> &InstData {
        &self.insts[inst]
    }

    pub fn inst_mut(&mut self, inst: Inst) -> &mut InstData {
        &mut self.insts[inst]
    }

    /// The result value of `inst`, if it produces one
    pub fn inst_result(&self, inst: Inst) -> Option<Value> {
        self.results[inst].expand()
    }

    /// The block currently containing `inst`, if it is attached
    pub fn inst_block(&self, inst: Inst) -> Option<Block> {
        self.inst_block[inst].expand()
    }

    /// Returns true if `inst` is a φ node
    pub fn is_phi(&self, inst: Inst) -> bool {
        self.insts[inst].kind.is_phi()
    }

    /// The incoming `(block, value)` pairs of a φ node.
    ///
    /// # Panics
    ///
    /// Panics if `inst` is not a φ.
    pub fn phi_args(&self, inst: Inst) -> &[(Block, Value)] {
        match &self.insts[inst].kind {
            InstKind::Phi { args } => args,
            _ => panic!("{inst} is not a phi"),
        }
    }

    pub fn phi_args_mut(&mut self, inst: Inst) -> &mut SmallVec<[(Block, Value); 2]> {
        match &mut self.insts[inst].kind {
            InstKind::Phi { args } => args,
            _ => panic!("{inst} is not a phi"),
        }
    }

    // ------------------------------------------------------------------------------------
    // Values

    pub fn value(&self, value: Value) -> &ValueData {
        &self.values[value]
    }

    pub fn value_type(&self, value: Value) -> Type {
        self.values[value].ty()
    }

    /// The instruction defining `value`, or `None` for parameters, constants and undefs
    pub fn value_def_inst(&self, value: Value) -> Option<Inst> {
        match &self.values[value] {
            ValueData::Result { inst, .. } => Some(*inst),
            _ => None,
        }
    }

    /// The block in which `value` is defined, or `None` for values that dominate
    /// everything (parameters, constants, undefs)
    pub fn value_def_block(&self, value: Value) -> Option<Block> {
        self.value_def_inst(value).and_then(|inst| self.inst_block(inst))
    }

    /// The interned undef value of type `ty`
    pub fn undef(&mut self, ty: Type) -> Value {
        let values = &mut self.values;
        *self
            .undefs
            .entry(ty)
            .or_insert_with(|| values.push(ValueData::Undef { ty }))
    }

    /// The interned constant for `imm`
    pub fn constant(&mut self, imm: Immediate) -> Value {
        let values = &mut self.values;
        *self
            .consts
            .entry(imm)
            .or_insert_with(|| values.push(ValueData::Const { imm }))
    }

    pub fn bool_const(&mut self, value: bool) -> Value {
        self.constant(Immediate::I1(value))
    }

    pub fn i32_const(&mut self, value: i32) -> Value {
        self.constant(Immediate::I32(value))
    }

    /// Rewrite every use of `old` (instruction operands, φ incomings, terminator
    /// conditions and return operands) to `new`.
    pub fn replace_all_uses(&mut self, old: Value, new: Value) {
        debug_assert_ne!(old, new, "cannot replace {old} with itself");
        for data in self.insts.values_mut() {
            data.kind.for_each_operand_mut(|v| {
                if *v == old {
                    *v = new;
                }
            });
        }
        for data in self.blocks.values_mut() {
            match &mut data.terminator {
                Terminator::Return(Some(v)) | Terminator::CondBr { cond: v, .. } if *v == old => {
                    *v = new;
                }
                _ => {}
            }
        }
    }

    // ------------------------------------------------------------------------------------
    // External functions

    /// Declare an external function, or return the existing declaration with this name.
    pub fn import_function(
        &mut self,
        name: impl Into<String>,
        signature: Signature,
        attrs: FunctionAttributes,
    ) -> FuncRef {
        let name = name.into();
        if let Some(existing) = self.find_function(&name) {
            return existing;
        }
        self.ext_funcs.push(ExtFuncData {
            name,
            signature,
            attrs,
        })
    }

    pub fn find_function(&self, name: &str) -> Option<FuncRef> {
        self.ext_funcs.iter().find_map(|(f, data)| (data.name == name).then_some(f))
    }

    pub fn ext_func(&self, func: FuncRef) -> &ExtFuncData {
        &self.ext_funcs[func]
    }

    // ------------------------------------------------------------------------------------
    // Verification

    /// Check the structural invariants of the function:
    ///
    /// * Every live block has a terminator, and all successors are live blocks
    /// * φ nodes form a prefix of their block's instruction list
    /// * The incoming blocks of every φ are exactly the predecessors of its block
    /// * Every branch condition is a boolean value
    pub fn verify(&self) -> Result<(), Report> {
        let mut preds: SecondaryMap<Block, SmallVec<[Block; 4]>> = SecondaryMap::new();
        for block in self.blocks() {
            if !self.blocks[block].terminator.is_set() {
                return Err(Report::msg(format!("{block} has no terminator")));
            }
            if let Some(cond) = self.blocks[block].terminator.condition() {
                if !self.value_type(cond).is_bool() {
                    return Err(Report::msg(format!(
                        "{block} has a non-boolean branch condition {cond}"
                    )));
                }
            }
            for succ in self.successors(block) {
                if !self.is_block_alive(succ) {
                    return Err(Report::msg(format!("{block} branches to dead {succ}")));
                }
                if !preds[succ].contains(&block) {
                    preds[succ].push(block);
                }
            }
        }

        for block in self.blocks() {
            let mut seen_non_phi = false;
            for inst in self.block_insts(block) {
                if self.is_phi(*inst) {
                    if seen_non_phi {
                        return Err(Report::msg(format!(
                            "{inst} is a phi below non-phi instructions in {block}"
                        )));
                    }
                    let incoming: FxHashSet<Block> =
                        self.phi_args(*inst).iter().map(|(b, _)| *b).collect();
                    let expected: FxHashSet<Block> = preds[block].iter().copied().collect();
                    if incoming != expected {
                        return Err(Report::msg(format!(
                            "{inst} in {block} disagrees with the block's predecessors"
                        )));
                    }
                } else {
                    seen_non_phi = true;
                }
            }
        }

        Ok(())
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn @{}(", self.name)?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{param}: {}", self.value_type(*param))?;
        }
        f.write_str(")")?;
        if let Some(ty) = self.signature.result {
            write!(f, " -> {ty}")?;
        }
        f.write_str(" {\n")?;
        for block in self.blocks() {
            writeln!(f, "{block}:")?;
            for inst in self.block_insts(block) {
                f.write_str("  ")?;
                if let Some(result) = self.inst_result(*inst) {
                    write!(f, "{result} = ")?;
                }
                match &self.insts[*inst].kind {
                    InstKind::Phi { args } => {
                        f.write_str("phi ")?;
                        for (i, (block, value)) in args.iter().enumerate() {
                            if i > 0 {
                                f.write_str(", ")?;
                            }
                            write!(f, "[{block}: {value}]")?;
                        }
                    }
                    InstKind::Select {
                        cond,
                        on_true,
                        on_false,
                    } => write!(f, "select {cond}, {on_true}, {on_false}")?,
                    InstKind::Unary { op, arg } => write!(f, "{op} {arg}")?,
                    InstKind::Binary { op, lhs, rhs } => write!(f, "{op} {lhs}, {rhs}")?,
                    InstKind::Call { callee, args } => {
                        write!(f, "call @{}(", self.ext_funcs[*callee].name)?;
                        for (i, arg) in args.iter().enumerate() {
                            if i > 0 {
                                f.write_str(", ")?;
                            }
                            write!(f, "{arg}")?;
                        }
                        f.write_str(")")?;
                    }
                }
                f.write_str("\n")?;
            }
            match &self.blocks[block].terminator {
                Terminator::None => writeln!(f, "  <no terminator>")?,
                Terminator::Return(None) => writeln!(f, "  ret")?,
                Terminator::Return(Some(v)) => writeln!(f, "  ret {v}")?,
                Terminator::Unreachable => writeln!(f, "  unreachable")?,
                Terminator::Br { dest } => writeln!(f, "  br {dest}")?,
                Terminator::CondBr {
                    cond,
                    then_dest,
                    else_dest,
                } => writeln!(f, "  br {cond}, {then_dest}, {else_dest}")?,
            }
        }
        f.write_str("}")
    }
}
