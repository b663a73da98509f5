//! Math functions imported into JIT-compiled rate constants.
//!
//! Cranelift has native instructions for `sqrt`, `fabs` and the arithmetic
//! operators, but `exp`, `ln` and `pow` have to be called out to Rust. The
//! symbols are registered on the `JITBuilder` by `register_symbols` and
//! declared per function by `call_libm`.

use cranelift::prelude::FunctionBuilder;
use cranelift_codegen::ir::types::F64;
use cranelift_codegen::ir::{AbiParam, InstBuilder, Value};
use cranelift_jit::JITBuilder;
use cranelift_module::{Linkage, Module};

use crate::errors::BuilderError;

/// An imported f64 math routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibmFn {
    Exp,
    Ln,
    Pow,
}

impl LibmFn {
    fn symbol(self) -> &'static str {
        match self {
            LibmFn::Exp => "cupsoda_exp",
            LibmFn::Ln => "cupsoda_ln",
            LibmFn::Pow => "cupsoda_pow",
        }
    }

    fn arity(self) -> usize {
        match self {
            LibmFn::Pow => 2,
            _ => 1,
        }
    }
}

extern "C" fn jit_exp(x: f64) -> f64 {
    x.exp()
}

extern "C" fn jit_ln(x: f64) -> f64 {
    x.ln()
}

extern "C" fn jit_pow(base: f64, exponent: f64) -> f64 {
    base.powf(exponent)
}

/// Makes the math routines resolvable by the JIT linker.
pub fn register_symbols(builder: &mut JITBuilder) {
    builder.symbol(LibmFn::Exp.symbol(), jit_exp as *const u8);
    builder.symbol(LibmFn::Ln.symbol(), jit_ln as *const u8);
    builder.symbol(LibmFn::Pow.symbol(), jit_pow as *const u8);
}

/// Declares `fun` in the module (idempotent for a given signature) and emits a call to it.
pub fn call_libm(
    builder: &mut FunctionBuilder,
    module: &mut dyn Module,
    fun: LibmFn,
    args: &[Value],
) -> Result<Value, BuilderError> {
    let mut sig = module.make_signature();
    for _ in 0..fun.arity() {
        sig.params.push(AbiParam::new(F64));
    }
    sig.returns.push(AbiParam::new(F64));

    let func_id = module
        .declare_function(fun.symbol(), Linkage::Import, &sig)
        .map_err(|e| BuilderError::DeclarationError(e.to_string()))?;
    let func_ref = module.declare_func_in_func(func_id, builder.func);
    let call = builder.ins().call(func_ref, args);
    Ok(builder.inst_results(call)[0])
}
