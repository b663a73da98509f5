//! JIT compilation of rate constants with Cranelift.
//!
//! All rate constants of a network are compiled into a single native function
//! `fn(params: *const f64, out: *mut f64)` that fills one row of the rate
//! matrix per call. The main entry points are:
//! - `create_isa()` - Detects whether the host can be targeted at all
//! - `check_jit_support()` - Detects whether a JIT module can be built on the host
//! - `build_combined_function()` - Compiles the rate constants of every reaction

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::{errors::BuilderError, expr::Expr, operators, types::CombinedJITFunction};
use cranelift::prelude::*;
use cranelift_codegen::ir::immediates::Offset32;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module};
use isa::TargetIsa;

struct ThreadSafeFunction(*const u8);
unsafe impl Send for ThreadSafeFunction {}
unsafe impl Sync for ThreadSafeFunction {}

/// Creates an Instruction Set Architecture (ISA) target for code generation.
///
/// # Errors
/// Returns a BuilderError if:
/// - The host machine architecture is not supported
/// - Code generation configuration fails
pub fn create_isa() -> Result<Arc<dyn TargetIsa>, BuilderError> {
    let mut flag_builder = settings::builder();

    // cranelift-jit links code in place and rejects position-independent code.
    for (flag, value) in [
        ("use_colocated_libcalls", "false"),
        ("is_pic", "false"),
        ("opt_level", "speed"),
    ] {
        flag_builder
            .set(flag, value)
            .map_err(|e| BuilderError::HostMachineNotSupported(e.to_string()))?;
    }

    let isa_builder = cranelift_native::builder().map_err(|msg| {
        BuilderError::HostMachineNotSupported(format!("{}: {msg}", target_lexicon::Triple::host()))
    })?;

    isa_builder
        .finish(settings::Flags::new(flag_builder))
        .map_err(BuilderError::CodegenError)
}

/// Creates a JIT module with the math imports registered.
///
/// `JITModule::new` asserts on ISA flags it cannot honor; such a panic is
/// reported as `HostMachineNotSupported` so callers can fall back.
fn create_module(isa: Arc<dyn TargetIsa>) -> Result<JITModule, BuilderError> {
    let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
    operators::register_symbols(&mut builder);
    panic::catch_unwind(AssertUnwindSafe(|| JITModule::new(builder))).map_err(|payload| {
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "JIT module construction panicked".to_string());
        BuilderError::HostMachineNotSupported(msg)
    })
}

/// Checks that the host can both target and host JIT code.
///
/// This is the capability check behind `EvaluatorBackend::Auto`: it creates the
/// ISA and a full JIT module, the same steps a real compilation takes.
pub fn check_jit_support() -> Result<(), BuilderError> {
    create_module(create_isa()?).map(drop)
}

/// Builds a JIT-compiled function that evaluates every rate constant of a network.
///
/// # Arguments
/// * `exprs` - One rate-constant expression per reaction, in reaction order
/// * `n_params` - Width of the rate-parameter row the function reads from
///
/// # Returns
/// A thread-safe function that reads a parameter row and writes one value per
/// expression into the output slice.
///
/// # Panics
/// The returned function panics if the parameter row is narrower than
/// `n_params` or the output slice length differs from `exprs.len()`.
pub fn build_combined_function(
    exprs: &[Expr],
    n_params: usize,
) -> Result<CombinedJITFunction, BuilderError> {
    let isa = create_isa()?;
    let mut module = create_module(isa)?;
    let mut ctx = module.make_context();
    let mut builder_context = FunctionBuilderContext::new();

    let ptr_ty = module.target_config().pointer_type();
    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(ptr_ty)); // params_ptr
    sig.params.push(AbiParam::new(ptr_ty)); // out_ptr

    let func_id = module
        .declare_function("rate_constants", Linkage::Local, &sig)
        .map_err(|e| BuilderError::DeclarationError(e.to_string()))?;

    ctx.func.signature = sig;
    {
        let mut builder = FunctionBuilder::new(&mut ctx.func, &mut builder_context);
        let entry_block = builder.create_block();
        builder.append_block_params_for_function_params(entry_block);
        builder.switch_to_block(entry_block);
        builder.seal_block(entry_block);

        let params_ptr = builder.block_params(entry_block)[0];
        let out_ptr = builder.block_params(entry_block)[1];

        for (i, expr) in exprs.iter().enumerate() {
            let value = expr.codegen(&mut builder, &mut module, params_ptr)?;
            builder.ins().store(
                MemFlags::trusted(),
                value,
                out_ptr,
                Offset32::new(i as i32 * 8),
            );
        }

        builder.ins().return_(&[]);
        builder.finalize();
    }

    module
        .define_function(func_id, &mut ctx)
        .map_err(|e| BuilderError::FunctionError(e.to_string()))?;
    module.clear_context(&mut ctx);
    module
        .finalize_definitions()
        .map_err(BuilderError::ModuleError)?;

    // The module is intentionally not freed: finalized code stays mapped for the
    // lifetime of the process, which keeps the pointer below valid.
    let code = Arc::new(ThreadSafeFunction(module.get_finalized_function(func_id)));
    let n_outputs = exprs.len();
    let wrapper = move |params: &[f64], out: &mut [f64]| {
        assert!(params.len() >= n_params, "parameter row too short");
        assert_eq!(out.len(), n_outputs, "rate row has incorrect length");
        // SAFETY: the function was compiled with signature
        // extern "C" fn(*const f64, *mut f64) and only touches `n_params`
        // inputs and `n_outputs` outputs, both checked above.
        unsafe {
            let f: extern "C" fn(*const f64, *mut f64) = std::mem::transmute(code.0);
            f(params.as_ptr(), out.as_mut_ptr());
        }
    };

    Ok(Arc::new(wrapper))
}
