//! Host-side DMA controller: latency estimates plus per-direction accounting.

use tessera_types::MetaMap;

/// Pluggable DRAM-timing seam. The production implementation wraps
/// [`crate::RamulatorClient`]; tests substitute fixed models.
pub trait DmaCycleEstimator {
    /// `Some(cycles)` to override the bandwidth model, `None` to fall back.
    fn estimate(&mut self, bytes: u64, hops: u64, metadata: &MetaMap) -> Option<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    HostToDigital,
    DigitalToHost,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DmaTotals {
    pub ops: u64,
    pub bytes: u64,
    pub hops: u64,
}

pub struct HostDmaController {
    bytes_per_cycle: u64,
    estimator: Option<Box<dyn DmaCycleEstimator>>,
    load: DmaTotals,
    store: DmaTotals,
}

impl HostDmaController {
    pub const DEFAULT_BYTES_PER_CYCLE: u64 = 8192;

    pub fn new(bytes_per_cycle: u64) -> Self {
        Self {
            bytes_per_cycle: if bytes_per_cycle == 0 {
                Self::DEFAULT_BYTES_PER_CYCLE
            } else {
                bytes_per_cycle
            },
            estimator: None,
            load: DmaTotals::default(),
            store: DmaTotals::default(),
        }
    }

    pub fn with_estimator(mut self, estimator: Box<dyn DmaCycleEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    /// Cycles for one DMA of `bytes` over `hops` mesh hops. An attached
    /// estimator that returns a positive cycle count wins; everything else is
    /// the bandwidth model. Never less than one cycle.
    pub fn estimate_cycles(&mut self, bytes: u64, hops: u64, metadata: &MetaMap) -> u64 {
        if let Some(estimator) = self.estimator.as_mut() {
            if let Some(cycles) = estimator.estimate(bytes, hops, metadata) {
                if cycles > 0 {
                    return (cycles + hops).max(1);
                }
            }
        }
        (bytes.div_ceil(self.bytes_per_cycle) + hops).max(1)
    }

    pub fn record(&mut self, direction: DmaDirection, bytes: u64, hops: u64) {
        let totals = match direction {
            DmaDirection::HostToDigital => &mut self.load,
            DmaDirection::DigitalToHost => &mut self.store,
        };
        totals.ops += 1;
        totals.bytes += bytes;
        totals.hops += hops;
    }

    pub fn load_totals(&self) -> DmaTotals {
        self.load
    }

    pub fn store_totals(&self) -> DmaTotals {
        self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bandwidth_fallback_matches_ceiling_plus_hops() {
        let mut dma = HostDmaController::new(0);
        let cycles = dma.estimate_cycles(4096, 2, &MetaMap::new());
        assert_eq!(cycles, 3);
        dma.record(DmaDirection::HostToDigital, 4096, 2);
        assert_eq!(
            dma.load_totals(),
            DmaTotals {
                ops: 1,
                bytes: 4096,
                hops: 2
            }
        );
        assert_eq!(dma.store_totals(), DmaTotals::default());
    }

    struct Fixed(Option<u64>);
    impl DmaCycleEstimator for Fixed {
        fn estimate(&mut self, _: u64, _: u64, _: &MetaMap) -> Option<u64> {
            self.0
        }
    }

    #[test]
    fn positive_external_estimate_wins() {
        let mut dma = HostDmaController::new(8192).with_estimator(Box::new(Fixed(Some(10))));
        assert_eq!(dma.estimate_cycles(4096, 2, &MetaMap::new()), 12);
    }

    #[test]
    fn zero_external_estimate_falls_back() {
        let mut dma = HostDmaController::new(8192).with_estimator(Box::new(Fixed(Some(0))));
        assert_eq!(dma.estimate_cycles(4096, 2, &MetaMap::new()), 3);
    }

    #[test]
    fn zero_byte_transfer_costs_at_least_one_cycle() {
        let mut dma = HostDmaController::new(8192);
        assert_eq!(dma.estimate_cycles(0, 0, &MetaMap::new()), 1);
    }
}
