//! Per-unit throughput and latency hints for the digital pipeline.

/// Systolic PE array. The matmul estimate assumes one pass per
/// `rows x cols` output tile of the problem tile, `tile_k` cycles per pass,
/// plus array fill/drain.
#[derive(Debug, Clone, Copy)]
pub struct PeArray {
    pub rows: u64,
    pub cols: u64,
}

impl PeArray {
    pub fn new(rows: u64, cols: u64) -> Self {
        Self {
            rows: rows.max(1),
            cols: cols.max(1),
        }
    }

    pub fn estimate_matmul_cycles(&self, tile_m: u64, tile_n: u64, tile_k: u64) -> u64 {
        let m = tile_m.max(1);
        let n = tile_n.max(1);
        let k = tile_k.max(1);
        let passes = m.div_ceil(self.rows) * n.div_ceil(self.cols);
        passes * k + self.rows + self.cols
    }
}

/// Scalar/vector general-purpose cluster.
#[derive(Debug, Clone, Copy)]
pub struct SpuCluster {
    pub scalar_throughput: u64,
    pub vector_throughput: u64,
    pub special_latency: u64,
}

impl SpuCluster {
    pub fn new(scalar_throughput: u64, vector_throughput: u64, special_latency: u64) -> Self {
        Self {
            scalar_throughput: scalar_throughput.max(1),
            vector_throughput: vector_throughput.max(1),
            special_latency: special_latency.max(1),
        }
    }
}

/// Dedicated vector pipeline.
#[derive(Debug, Clone, Copy)]
pub struct VpuUnit {
    pub vector_throughput: u64,
}

impl VpuUnit {
    pub fn new(vector_throughput: u64) -> Self {
        Self {
            vector_throughput: vector_throughput.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matmul_estimate_scales_with_tile_volume() {
        let pe = PeArray::new(128, 128);
        let small = pe.estimate_matmul_cycles(128, 128, 64);
        let large = pe.estimate_matmul_cycles(256, 256, 64);
        assert_eq!(small, 64 + 256);
        assert_eq!(large, 4 * 64 + 256);
    }
}
