//! Host orchestrator: owns the op graph and decides, cycle by cycle, which
//! nodes become scheduler tasks.
//!
//! Responsibilities, in the order `advance` applies them: streaming batch
//! instantiation against low/high watermarks, back-pressure throttling,
//! per-cycle issue ceilings per target class, admission control against
//! per-class outstanding-byte budgets, and task construction (chiplet
//! placement, transfer routing, latency estimation). Completions come back
//! through [`HostOrchestrator::notify_task_completion`], which unlocks
//! successors and drives the dynamic MoE expansion.

mod loader;
mod moe;
mod orchestrator;

pub use loader::{bootstrap_graph, build_graph_from_commands, load_commands};
pub use moe::MoeSession;
pub use orchestrator::{
    HostOrchestrator, OutstandingBytes, StreamCounters, TransferEstimator, TransferLatencyFn,
};
