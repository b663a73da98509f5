use std::sync::Arc;

/// Type alias for a JIT-compiled function that evaluates every rate constant at once.
///
/// This represents a function that:
/// - Takes a slice holding one rate-parameter row
/// - Takes a mutable slice with one slot per reaction
/// - Writes each reaction's rate constant into its slot
/// - Is both Send and Sync so rows can be evaluated in parallel
pub type CombinedJITFunction = Arc<dyn Fn(&[f64], &mut [f64]) + Send + Sync>;
