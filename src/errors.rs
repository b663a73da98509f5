//! Error types for the cupsoda-sim crate.
//!
//! Errors are layered the same way the pipeline is:
//!
//! - `ConvertError`: Errors while turning an evalexpr parse tree into a rate-constant AST
//! - `BuilderError`: Errors while JIT compiling a rate constant with Cranelift
//! - `SimulatorError`: Errors surfaced to callers of `CupSodaSimulator::run`
//!
//! Lower-level errors convert into `SimulatorError`, so `?` works throughout the pipeline.

use cranelift_codegen::CodegenError;
use cranelift_module::ModuleError;
use evalexpr::{DefaultNumericTypes, EvalexprError};
use thiserror::Error;

/// Errors that can occur during conversion from the evalexpr AST to our rate-constant AST.
#[derive(Error, Debug)]
pub enum ConvertError {
    /// Error when an exponent is neither an integer nor a float constant
    #[error("Could not convert exponent in Exp operator: {0}")]
    ExpOperator(String),
    /// Error when encountering an operator that is not supported by our implementation
    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),
    /// Error when encountering a function that is not supported by our implementation
    #[error("Unsupported function: {0}")]
    UnsupportedFunction(String),
    /// Error when the root node does not have exactly one child
    #[error("Expected single child for root node: {0}")]
    RootNode(String),
    /// Error when a constant value is not numeric
    #[error("Expected numeric constant: {0}")]
    ConstOperator(String),
    /// Error when an identifier is neither a parameter nor a species placeholder
    #[error("Unresolvable token in rate expression: {0}")]
    UnresolvedToken(String),
    /// Error when a species placeholder appears outside a mass-action product
    #[error("Rate expression is not mass-action: {0}")]
    NotMassAction(String),
}

/// Errors that can occur during JIT compilation of rate constants.
#[derive(Error, Debug)]
pub enum BuilderError {
    /// Error when the target machine architecture is not supported
    #[error("host machine is not supported: {0}")]
    HostMachineNotSupported(String),
    /// Error during Cranelift code generation
    #[error("codegen error: {0}")]
    CodegenError(CodegenError),
    /// Error in the Cranelift JIT module
    #[error("module error: {0}")]
    ModuleError(ModuleError),
    /// Error when defining the JIT function
    #[error("function error: {0}")]
    FunctionError(String),
    /// Error when declaring the JIT function or one of its imports
    #[error("declaration error: {0}")]
    DeclarationError(String),
}

/// Errors returned to callers of the simulator.
///
/// Every variant is terminal for the run that produced it; nothing in the
/// pipeline retries.
#[derive(Debug, Error)]
pub enum SimulatorError {
    /// Missing tspan, unknown integrator, bad matrix shapes or an unusable rate expression
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The cupSODA binary is missing, not a file or not executable
    #[error("cupSODA binary not found: {0}")]
    SolverNotFound(String),
    /// The cupSODA process exited unsuccessfully
    #[error("cupSODA failed ({status}):\n{output}")]
    SolverExecution { status: String, output: String },
    /// Output files are missing or truncated
    #[error("missing cupSODA output: {0}")]
    MissingOutput(String),
    /// Filesystem or process I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ConvertError> for SimulatorError {
    fn from(err: ConvertError) -> Self {
        SimulatorError::Configuration(err.to_string())
    }
}

impl From<EvalexprError<DefaultNumericTypes>> for SimulatorError {
    fn from(err: EvalexprError<DefaultNumericTypes>) -> Self {
        SimulatorError::Configuration(format!("Failed to parse rate expression: {err}"))
    }
}

impl From<BuilderError> for SimulatorError {
    fn from(err: BuilderError) -> Self {
        SimulatorError::Configuration(format!("Failed to build JIT rate function: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_keeps_message() {
        let err: SimulatorError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "no such dir").into();
        assert_eq!(err.to_string(), "I/O error: no such dir");
    }
}
