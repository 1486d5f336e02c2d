// ── Driftlab Atoms Layer ───────────────────────────────────────────────────
// Pure data, configuration, and error types: zero side effects, no I/O.
// Dependency rule: atoms may only depend on std and external pure crates.

pub mod config;
pub mod error;
pub mod types;
