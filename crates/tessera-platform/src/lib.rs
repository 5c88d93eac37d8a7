//! Chiplet platform: the top-level cycle driver.
//!
//! [`ChipletPlatform`] owns the digital and RRAM chiplet models, the host
//! orchestrator, the task stager and scheduler, the DMA controller, the KV
//! cache and the statistics, and advances them in a fixed, deterministic
//! order each [`ChipletPlatform::cycle`]: orchestrator advance, stager drain,
//! scheduler tick, digital ticks, RRAM ticks, interconnect throttle decay,
//! static energy, logging.

mod clock;
mod dispatch;
mod kv;
mod platform;
mod stager;
mod stats;
mod transfer;

pub use clock::{DomainTicks, MultiDomainClock};
pub use kv::{KvCache, KvCounters, KvKey, KvOp};
pub use platform::{ChipletPlatform, GatingSnapshot, PlatformError};
pub use stager::{FifoScheduler, TaskStager};
pub use stats::{
    write_chiplet_log, write_results_csv, write_stats_json, CycleCounters, PlatformSnapshot,
    PlatformTotals, ResultRow, CYCLE_LOG_HEADER,
};
