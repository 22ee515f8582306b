//! A W-lane interpreter for the lanevec IR.
//!
//! The interpreter executes a *scalar* function as if it had been widened to W lanes:
//! every SSA value evaluates to a vector of W immediates, all instructions apply
//! elementwise, and calls to declared lane-reduction intrinsics reduce horizontally.
//! Branch conditions are required to be dynamically uniform — every lane must agree —
//! which is exactly the property linearization establishes, so running a linearized
//! region with W distinct lanes both exercises the transform and checks its central
//! invariant at the same time.
//!
//! With `W = 1` the interpreter is a plain scalar evaluator; the functional
//! equivalence tests compare one W-lane run of the transformed function against W
//! scalar runs of the original.

use lanevec_ir::{
    BinaryOp, Block, Function, FunctionAttributes, FxHashMap, Immediate, InstKind, SmallVec,
    Terminator, Type, UnaryOp, Value, ValueData,
};

/// The W per-lane values of one SSA value.
pub type Lanes = SmallVec<[Immediate; 8]>;

/// Splat a single immediate across `width` lanes.
pub fn splat(imm: Immediate, width: usize) -> Lanes {
    SmallVec::from_elem(imm, width)
}

/// Interprets a [Function] with a fixed lane count.
pub struct Evaluator<'a> {
    func: &'a Function,
    width: usize,
    /// Blocks executed before the evaluator declares the function non-terminating
    step_budget: usize,
}

impl<'a> Evaluator<'a> {
    pub fn new(func: &'a Function, width: usize) -> Self {
        assert!(width > 0, "lane count must be non-zero");
        Self {
            func,
            width,
            step_budget: 100_000,
        }
    }

    pub fn with_step_budget(mut self, step_budget: usize) -> Self {
        self.step_budget = step_budget;
        self
    }

    /// Execute the function on per-lane arguments, returning the per-lane results.
    ///
    /// `args` supplies one lane vector per function parameter. Returns `None` when
    /// the function returns no value.
    ///
    /// # Panics
    ///
    /// Panics on malformed IR, on a branch whose condition is not lane-uniform, on
    /// `unreachable`, and when the step budget runs out.
    pub fn run(&self, args: &[Lanes]) -> Option<Lanes> {
        assert_eq!(
            args.len(),
            self.func.params().len(),
            "wrong number of arguments for @{}",
            self.func.name
        );
        for lanes in args {
            assert_eq!(lanes.len(), self.width, "argument lane count mismatch");
        }

        let mut values: FxHashMap<Value, Lanes> = FxHashMap::default();
        for (param, lanes) in self.func.params().iter().zip(args) {
            values.insert(*param, lanes.clone());
        }

        let mut block = self.func.entry_block();
        let mut prev: Option<Block> = None;
        let mut budget = self.step_budget;

        loop {
            assert!(budget > 0, "step budget exhausted in @{}", self.func.name);
            budget -= 1;
            log::trace!(target: "eval", "executing {block}");

            // φs read their incoming values simultaneously, before the block body.
            let mut phi_results: SmallVec<[(Value, Lanes); 4]> = SmallVec::new();
            for inst in self.func.block_insts(block) {
                let InstKind::Phi { args } = &self.func.inst(*inst).kind else {
                    break;
                };
                let from = prev.expect("phi node in the entry block");
                let (_, incoming) = args
                    .iter()
                    .find(|(pred, _)| *pred == from)
                    .unwrap_or_else(|| panic!("{inst} in {block} has no incoming for {from}"));
                let result = self.func.inst_result(*inst).unwrap();
                phi_results.push((result, self.read(&values, *incoming)));
            }
            for (value, lanes) in phi_results {
                values.insert(value, lanes);
            }

            for inst in self.func.block_insts(block) {
                let data = self.func.inst(*inst);
                let lanes = match &data.kind {
                    InstKind::Phi { .. } => continue,
                    InstKind::Select {
                        cond,
                        on_true,
                        on_false,
                    } => {
                        let cond = self.read(&values, *cond);
                        let on_true = self.read(&values, *on_true);
                        let on_false = self.read(&values, *on_false);
                        cond.iter()
                            .zip(on_true.iter().zip(on_false.iter()))
                            .map(|(c, (t, f))| if c.as_bool() { *t } else { *f })
                            .collect()
                    }
                    InstKind::Unary { op, arg } => {
                        let arg = self.read(&values, *arg);
                        arg.iter().map(|a| eval_unary(*op, *a)).collect()
                    }
                    InstKind::Binary { op, lhs, rhs } => {
                        let lhs = self.read(&values, *lhs);
                        let rhs = self.read(&values, *rhs);
                        lhs.iter().zip(rhs.iter()).map(|(l, r)| eval_binary(*op, *l, *r)).collect()
                    }
                    InstKind::Call { callee, args } => {
                        let data = self.func.ext_func(*callee);
                        assert!(
                            data.attrs.contains(FunctionAttributes::CONVERGENT)
                                && args.len() == 1,
                            "cannot evaluate call to @{}: only lane reductions are supported",
                            data.name
                        );
                        let arg = self.read(&values, args[0]);
                        let any = arg.iter().any(Immediate::as_bool);
                        splat(Immediate::I1(any), self.width)
                    }
                };
                if let Some(result) = self.func.inst_result(*inst) {
                    values.insert(result, lanes);
                }
            }

            match self.func.terminator(block) {
                Terminator::None => panic!("{block} has no terminator"),
                Terminator::Unreachable => panic!("executed unreachable in {block}"),
                Terminator::Return(value) => {
                    return value.map(|v| self.read(&values, v));
                }
                Terminator::Br { dest } => {
                    prev = Some(block);
                    block = *dest;
                }
                Terminator::CondBr {
                    cond,
                    then_dest,
                    else_dest,
                } => {
                    let cond = self.read(&values, *cond);
                    let taken = cond[0].as_bool();
                    assert!(
                        cond.iter().all(|c| c.as_bool() == taken),
                        "divergent branch condition at runtime in {block}"
                    );
                    prev = Some(block);
                    block = if taken { *then_dest } else { *else_dest };
                }
            }
        }
    }

    fn read(&self, values: &FxHashMap<Value, Lanes>, value: Value) -> Lanes {
        match self.func.value(value) {
            ValueData::Const { imm } => splat(*imm, self.width),
            ValueData::Undef { ty } => splat(zero_of(*ty), self.width),
            _ => values
                .get(&value)
                .unwrap_or_else(|| panic!("{value} read before definition"))
                .clone(),
        }
    }
}

/// The deterministic stand-in for an undefined value of type `ty`.
fn zero_of(ty: Type) -> Immediate {
    match ty {
        Type::I1 => Immediate::I1(false),
        Type::I32 => Immediate::I32(0),
        Type::I64 => Immediate::I64(0),
    }
}

fn eval_unary(op: UnaryOp, arg: Immediate) -> Immediate {
    match (op, arg) {
        (UnaryOp::Not, Immediate::I1(b)) => Immediate::I1(!b),
        (UnaryOp::Not, Immediate::I32(i)) => Immediate::I32(!i),
        (UnaryOp::Not, Immediate::I64(i)) => Immediate::I64(!i),
    }
}

fn eval_binary(op: BinaryOp, lhs: Immediate, rhs: Immediate) -> Immediate {
    use Immediate::*;
    match (lhs, rhs) {
        (I32(l), I32(r)) => match op {
            BinaryOp::Add => I32(l.wrapping_add(r)),
            BinaryOp::Sub => I32(l.wrapping_sub(r)),
            BinaryOp::Mul => I32(l.wrapping_mul(r)),
            BinaryOp::And => I32(l & r),
            BinaryOp::Or => I32(l | r),
            BinaryOp::Xor => I32(l ^ r),
            BinaryOp::Eq => I1(l == r),
            BinaryOp::Ne => I1(l != r),
            BinaryOp::Slt => I1(l < r),
            BinaryOp::Sle => I1(l <= r),
        },
        (I64(l), I64(r)) => match op {
            BinaryOp::Add => I64(l.wrapping_add(r)),
            BinaryOp::Sub => I64(l.wrapping_sub(r)),
            BinaryOp::Mul => I64(l.wrapping_mul(r)),
            BinaryOp::And => I64(l & r),
            BinaryOp::Or => I64(l | r),
            BinaryOp::Xor => I64(l ^ r),
            BinaryOp::Eq => I1(l == r),
            BinaryOp::Ne => I1(l != r),
            BinaryOp::Slt => I1(l < r),
            BinaryOp::Sle => I1(l <= r),
        },
        (I1(l), I1(r)) => match op {
            BinaryOp::And => I1(l & r),
            BinaryOp::Or => I1(l | r),
            BinaryOp::Xor => I1(l ^ r),
            BinaryOp::Eq => I1(l == r),
            BinaryOp::Ne => I1(l != r),
            _ => panic!("unsupported boolean operator {op}"),
        },
        (l, r) => panic!("type-mismatched operands {l} and {r}"),
    }
}
