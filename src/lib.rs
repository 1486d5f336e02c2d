// Driftlab — a closed-loop experiment engine for studying reward-induced
// policy drift in LLM-backed service agents, and how an in-line safety
// reviewer arrests that drift.
//
// Layering:
//   atoms/   pure data, config, and error types (no I/O)
//   engine/  gateway, memory, strategy, reward, reviewer, runner, export
//
// The control surface is the `Supervisor`: start/pause/resume/stop/reset
// experiments, query status and metrics, and subscribe to the per-run
// event stream. Transport (HTTP, CLI, UI) is a thin wrapper around it.

pub mod atoms;
pub mod engine;

pub use atoms::config::{
    CacheConfig, DefenseConfig, EmbeddingEndpoint, ExperimentConfig, GatewayConfig, GatewayRole,
    MemoryConfig, RewardWeights, RoleConfig,
};
pub use atoms::error::{EngineError, EngineResult};
pub use atoms::types::*;
pub use engine::gateway::{ChatModel, CompletionOutcome, OpenAiGateway};
pub use engine::runner::{StartReceipt, StatusSnapshot, Supervisor};
