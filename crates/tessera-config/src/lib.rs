//! Simulator configuration.
//!
//! A [`SimConfig`] is deserialized once (JSON, unknown keys ignored),
//! validated, and then treated as an immutable snapshot for the whole run.
//! Derived scheduling limits live in [`OrchestratorLimits`] so they are
//! computed in exactly one place.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must not be negative (got {value})")]
    Negative { field: &'static str, value: i64 },
    #[error("{field} must be positive (got {value})")]
    NonPositive { field: &'static str, value: i64 },
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Immutable run configuration. Field defaults describe a small two-class
/// system that exercises every subsystem; real runs override via JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    // Chiplet population and geometry.
    pub num_digital: u32,
    pub num_rram: u32,
    pub pe_rows: u32,
    pub pe_cols: u32,
    pub sa_rows: u32,
    pub sa_cols: u32,
    pub pe_arrays_per_chiplet: u32,
    pub spu_clusters_per_chiplet: u32,
    pub vpu_units_per_cluster: u32,
    pub tiles_per_dim: u32,
    pub sas_per_tile_dim: u32,

    // SRAM buffer capacities (bytes).
    pub digital_activation_bytes: u64,
    pub digital_weight_bytes: u64,
    pub digital_scratch_bytes: u64,
    pub rram_input_buffer_bytes: u64,
    pub rram_output_buffer_bytes: u64,

    // Bandwidths (bytes per cycle of the owning clock domain).
    pub load_bandwidth_bytes: u64,
    pub store_bandwidth_bytes: u64,
    pub d2r_bandwidth_bytes: u64,
    pub r2d_bandwidth_bytes: u64,
    pub host_dma_bandwidth_bytes: u64,
    pub weight_load_bytes_per_cycle: u64,

    // Clock domains (MHz).
    pub digital_clock_mhz: u64,
    pub rram_clock_mhz: u64,
    pub interconnect_clock_mhz: u64,

    // Host orchestrator knobs.
    pub min_wait_cycles: u64,
    pub host_limit_resources: bool,
    pub host_stream_total_batches: i64,
    pub host_stream_low_watermark: i64,
    pub host_stream_high_watermark: i64,
    pub pending_capacity: u64,
    pub kv_cache_bytes: u64,

    // Unit timing hints.
    pub spu_scalar_throughput: u64,
    pub spu_vector_throughput: u64,
    pub spu_special_latency: u64,
    pub vpu_vector_throughput: u64,

    // Energy model (picojoules).
    pub pe_mac_energy_pj: f64,
    pub spu_op_energy_pj: f64,
    pub vpu_op_energy_pj: f64,
    pub digital_static_power_pj_per_cycle: f64,
    pub sram_access_energy_pj_per_byte: f64,
    pub pulse_energy_pj: f64,
    pub adc_energy_pj_per_sample: f64,
    pub weight_read_energy_pj_per_byte: f64,
    pub pe_hop_energy_pj_per_byte: f64,
    pub rram_hop_energy_pj_per_byte: f64,

    // Inputs and outputs.
    pub bin_dirpath: PathBuf,
    pub command_file: Option<PathBuf>,
    pub model_file: Option<PathBuf>,

    // External estimators.
    pub ramulator_path: Option<PathBuf>,
    pub booksim_path: Option<PathBuf>,
    pub estimator_timeout_ms: u64,

    // Reporting cadence.
    pub progress_interval_cycles: u64,
    pub stats_flush_interval_cycles: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            num_digital: 4,
            num_rram: 2,
            pe_rows: 128,
            pe_cols: 128,
            sa_rows: 128,
            sa_cols: 128,
            pe_arrays_per_chiplet: 8,
            spu_clusters_per_chiplet: 4,
            vpu_units_per_cluster: 2,
            tiles_per_dim: 2,
            sas_per_tile_dim: 2,
            digital_activation_bytes: 2 * 1024 * 1024,
            digital_weight_bytes: 4 * 1024 * 1024,
            digital_scratch_bytes: 1024 * 1024,
            rram_input_buffer_bytes: 512 * 1024,
            rram_output_buffer_bytes: 512 * 1024,
            load_bandwidth_bytes: 256,
            store_bandwidth_bytes: 128,
            d2r_bandwidth_bytes: 64,
            r2d_bandwidth_bytes: 64,
            host_dma_bandwidth_bytes: 8192,
            weight_load_bytes_per_cycle: 32,
            digital_clock_mhz: 1000,
            rram_clock_mhz: 500,
            interconnect_clock_mhz: 800,
            min_wait_cycles: 4,
            host_limit_resources: true,
            host_stream_total_batches: 1,
            host_stream_low_watermark: 1,
            host_stream_high_watermark: 2,
            pending_capacity: 64,
            kv_cache_bytes: 64 * 1024 * 1024,
            spu_scalar_throughput: 32,
            spu_vector_throughput: 128,
            spu_special_latency: 4,
            vpu_vector_throughput: 256,
            pe_mac_energy_pj: 0.8,
            spu_op_energy_pj: 1.2,
            vpu_op_energy_pj: 0.9,
            digital_static_power_pj_per_cycle: 50.0,
            sram_access_energy_pj_per_byte: 0.1,
            pulse_energy_pj: 0.4,
            adc_energy_pj_per_sample: 1.6,
            weight_read_energy_pj_per_byte: 2.0,
            pe_hop_energy_pj_per_byte: 0.05,
            rram_hop_energy_pj_per_byte: 0.07,
            bin_dirpath: PathBuf::from("bin"),
            command_file: None,
            model_file: None,
            ramulator_path: None,
            booksim_path: None,
            estimator_timeout_ms: 2000,
            progress_interval_cycles: 10_000,
            stats_flush_interval_cycles: 50_000,
        }
    }
}

impl SimConfig {
    /// Load from a JSON file. A missing file is a soft failure: defaults are
    /// returned and a warning is logged. A present-but-corrupt file is a hard
    /// failure so a typo'd run does not silently simulate the wrong machine.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            warn!(path = %path.display(), "config file missing, using defaults");
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        let cfg: SimConfig = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Hard validation, run once before the simulation starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(field: &'static str, value: i64) -> Result<(), ConfigError> {
            if value <= 0 {
                return Err(ConfigError::NonPositive { field, value });
            }
            Ok(())
        }
        positive("num_digital", i64::from(self.num_digital))?;
        positive("num_rram", i64::from(self.num_rram))?;
        positive("pe_rows", i64::from(self.pe_rows))?;
        positive("pe_cols", i64::from(self.pe_cols))?;
        positive("sa_rows", i64::from(self.sa_rows))?;
        positive("sa_cols", i64::from(self.sa_cols))?;
        positive("pe_arrays_per_chiplet", i64::from(self.pe_arrays_per_chiplet))?;
        positive("spu_clusters_per_chiplet", i64::from(self.spu_clusters_per_chiplet))?;
        positive("tiles_per_dim", i64::from(self.tiles_per_dim))?;
        positive("sas_per_tile_dim", i64::from(self.sas_per_tile_dim))?;
        Ok(())
    }

    /// Effective wait floor; the configured value is clamped to at least one.
    pub fn effective_min_wait(&self) -> u64 {
        self.min_wait_cycles.max(1)
    }

    /// Rough per-transfer byte estimate used when a command omits sizes.
    pub fn transfer_bytes_estimate(&self) -> u64 {
        let digital = u64::from(self.pe_rows) * u64::from(self.pe_cols) * 2;
        let rram = u64::from(self.sa_rows) * u64::from(self.sa_cols) * 2;
        digital.max(rram)
    }

    /// Widest link servicing transfers; the admission model charges against it.
    pub fn transfer_bandwidth_bytes(&self) -> u64 {
        self.d2r_bandwidth_bytes
            .max(self.r2d_bandwidth_bytes)
            .max(self.host_dma_bandwidth_bytes)
            .max(1)
    }

    pub fn limits(&self) -> OrchestratorLimits {
        OrchestratorLimits::derive(self)
    }

    /// Compute clusters per digital chiplet: up to four, fewer when there are
    /// not enough PE arrays to populate them.
    pub fn clusters_per_chiplet(&self) -> u32 {
        self.pe_arrays_per_chiplet.min(4).max(1)
    }
}

/// Issue ceilings and outstanding-byte budgets derived from a [`SimConfig`].
/// Non-positive budgets are treated as unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorLimits {
    pub min_wait_cycles: u64,
    pub transfer_bytes_estimate: u64,
    pub transfer_bandwidth_bytes: u64,
    pub max_issue_per_cycle: u64,
    pub max_digital_per_cycle: u64,
    pub max_rram_per_cycle: u64,
    pub max_transfer_bytes_per_cycle: u64,
    pub outstanding_digital_bytes: i64,
    pub outstanding_rram_bytes: i64,
    pub outstanding_transfer_bytes: i64,
    pub outstanding_dma_bytes: i64,
}

impl OrchestratorLimits {
    fn derive(cfg: &SimConfig) -> Self {
        fn budget(raw: u64) -> i64 {
            if raw == 0 {
                i64::MAX
            } else {
                i64::try_from(raw).unwrap_or(i64::MAX)
            }
        }
        let min_wait = cfg.effective_min_wait();
        let bandwidth = cfg.transfer_bandwidth_bytes();
        let total = u64::from(cfg.num_digital) + u64::from(cfg.num_rram);
        Self {
            min_wait_cycles: min_wait,
            transfer_bytes_estimate: cfg.transfer_bytes_estimate(),
            transfer_bandwidth_bytes: bandwidth,
            max_issue_per_cycle: total.clamp(1, 32),
            max_digital_per_cycle: u64::from(cfg.num_digital).max(1),
            max_rram_per_cycle: u64::from(cfg.num_rram).max(1),
            max_transfer_bytes_per_cycle: bandwidth,
            outstanding_digital_bytes: budget(
                cfg.digital_activation_bytes + cfg.digital_scratch_bytes,
            ),
            outstanding_rram_bytes: budget(
                cfg.rram_input_buffer_bytes + cfg.rram_output_buffer_bytes,
            ),
            outstanding_transfer_bytes: budget(bandwidth * (min_wait + 1)),
            outstanding_dma_bytes: budget(cfg.host_dma_bandwidth_bytes * (min_wait + 1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits() {
        let cfg = SimConfig::default();
        let limits = cfg.limits();
        assert_eq!(limits.max_issue_per_cycle, 6);
        assert_eq!(limits.max_digital_per_cycle, 4);
        assert_eq!(limits.max_rram_per_cycle, 2);
        assert_eq!(limits.transfer_bandwidth_bytes, 8192);
        assert_eq!(limits.outstanding_dma_bytes, 8192 * 5);
    }

    #[test]
    fn issue_ceiling_clamps_to_32() {
        let cfg = SimConfig {
            num_digital: 40,
            num_rram: 8,
            ..Default::default()
        };
        assert_eq!(cfg.limits().max_issue_per_cycle, 32);
    }

    #[test]
    fn zero_budget_is_unbounded() {
        let cfg = SimConfig {
            digital_activation_bytes: 0,
            digital_scratch_bytes: 0,
            ..Default::default()
        };
        assert_eq!(cfg.limits().outstanding_digital_bytes, i64::MAX);
    }

    #[test]
    fn validate_rejects_zero_population() {
        let cfg = SimConfig {
            num_digital: 0,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::NonPositive { field: "num_digital", .. })
        ));
    }
}
