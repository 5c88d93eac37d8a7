//! External timing estimators and the host DMA controller.
//!
//! Ramulator (DRAM) and BookSim (NoC) run as optional child processes speaking
//! newline-delimited JSON over stdin/stdout. The discipline is strict: any
//! protocol error, timeout, or nonsensical reply disables the client for the
//! rest of the run and the bandwidth model takes over. The simulator never
//! fails because an estimator died.

mod client;
mod dma;

pub use client::{BookSimClient, EstimatorError, RamulatorClient};
pub use dma::{DmaCycleEstimator, DmaDirection, DmaTotals, HostDmaController};

use tessera_types::MetaMap;

/// Memory-access direction for DRAM estimates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DramAccess {
    Read,
    Write,
}

impl DramAccess {
    pub(crate) fn wire_name(self) -> &'static str {
        match self {
            DramAccess::Read => "read",
            DramAccess::Write => "write",
        }
    }
}

/// Capability surface of a NoC estimator: per-flow latency plus shutdown.
pub trait NocCycleEstimator {
    fn estimate(&mut self, src_node: u64, dst_node: u64, bytes: u64, metadata: &MetaMap)
        -> Option<u64>;
    fn close(&mut self);
}
