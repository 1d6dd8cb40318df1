//! Traversal thresholds and their defaults.

/// Depth past which reference identities are recorded for cycle detection.
///
/// Below this depth no bookkeeping happens at all. Circular graphs push the
/// depth up quickly, so only a small amount of tracking is paid once the
/// threshold is crossed.
pub const N_DEPTH_START_DETECTING_CYCLES: usize = 1000;

/// Hard ceiling on recursion depth, guarding the call stack against very long
/// reference chains and cycles that were not caught by identity tracking.
pub const N_DEPTH_MAX_REFERENCE_CHAIN: usize = 1500;

/// Upper bound for the default batch worker count.
pub const N_WORKERS_DEFAULT_MAX: usize = 8;

/// Remaining stack below which traversal moves onto a new stack segment.
pub const N_BYTES_STACK_RED_ZONE: usize = 128 * 1024;

/// Size of each stack segment allocated during deep traversal.
pub const N_BYTES_STACK_PER_GROW: usize = 2 * 1024 * 1024;
