use lanevec_ir::{FuncRef, Function, FunctionAttributes, Signature, Type};

/// Target-facing configuration: how lane-reduction intrinsics are named on the
/// platform the region is being vectorized for.
///
/// The linearizer materializes a call to the `any` reduction at every normalized loop
/// latch; the instruction vectorizer lowers it to a real horizontal reduction later.
#[derive(Debug, Clone)]
pub struct PlatformInfo {
    /// The name of the boolean any-lane-true reduction
    pub any_reduction: String,
}

impl Default for PlatformInfo {
    fn default() -> Self {
        Self {
            any_reduction: "rv_any".to_string(),
        }
    }
}

impl PlatformInfo {
    /// Declare (or look up) the any-reduction in `func`.
    ///
    /// The declaration is external, `i1 -> i1`, and carries the full reduction
    /// contract: it does not access memory, does not unwind, is convergent, and does
    /// not recurse.
    pub fn declare_any_reduction(&self, func: &mut Function) -> FuncRef {
        func.import_function(
            self.any_reduction.clone(),
            Signature::new([Type::I1], Some(Type::I1)),
            FunctionAttributes::NO_MEMORY
                | FunctionAttributes::NO_THROW
                | FunctionAttributes::CONVERGENT
                | FunctionAttributes::NO_RECURSE,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_reduction_is_memoized() {
        let mut func = Function::new("kernel", Signature::default());
        let platform = PlatformInfo::default();
        let f0 = platform.declare_any_reduction(&mut func);
        let f1 = platform.declare_any_reduction(&mut func);
        assert_eq!(f0, f1);
        let data = func.ext_func(f0);
        assert_eq!(data.name, "rv_any");
        assert!(data.attrs.contains(FunctionAttributes::CONVERGENT));
        assert_eq!(data.signature.result, Some(Type::I1));
    }
}
