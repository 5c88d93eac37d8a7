//! Platform statistics: per-cycle counters, lifetime totals, the serializable
//! snapshot, and the text/CSV writers under `bin_dirpath`.

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::kv::KvCounters;
use tessera_digital::DigitalTotals;
use tessera_estimators::DmaTotals;
use tessera_rram::RramTotals;

/// Counters reset at the top of every simulation cycle.
#[derive(Debug, Default, Clone, Copy)]
pub struct CycleCounters {
    pub digital_exec: u64,
    pub digital_completed: u64,
    pub rram_exec: u64,
    pub transfer_exec: u64,
    pub transfer_bytes: u64,
    pub transfer_hops: u64,
    pub host_dma_load_bytes: u64,
    pub host_dma_store_bytes: u64,
    pub kv_hits: u64,
    pub kv_misses: u64,
    pub kv_load_bytes: u64,
    pub kv_store_bytes: u64,
    pub digital_load_bytes: u64,
    pub digital_store_bytes: u64,
    pub digital_pe_active: u64,
    pub digital_spu_active: u64,
    pub digital_vpu_active: u64,
    pub throttle_events: u64,
    pub deferrals: u64,
    pub host_tasks: u64,
}

/// Lifetime totals owned by the platform itself (the chiplets keep their own).
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct PlatformTotals {
    pub digital_tasks_executed: u64,
    pub rram_tasks_executed: u64,
    pub transfer_tasks_executed: u64,
    pub host_tasks_executed: u64,
    pub total_transfer_bytes: u64,
    pub total_transfer_hops: u64,
    pub transfer_to_rram_bytes: u64,
    pub transfer_to_digital_bytes: u64,
    pub transfer_host_load_bytes: u64,
    pub transfer_host_store_bytes: u64,
    pub transfer_throttle_events_total: u64,
    pub transfer_throttle_cycles_total: u64,
    pub deferrals_total: u64,
    pub dropped_tasks: u64,
    pub wait_cycles_sum: u64,
    pub wait_samples: u64,
    pub digital_ticks_total: u64,
    pub rram_ticks_total: u64,
    pub interconnect_ticks_total: u64,
    pub pe_interconnect_energy_pj: f64,
    pub rram_interconnect_energy_pj: f64,
    pub moe_events_total: u64,
    pub moe_snapshot_hits: u64,
    pub moe_snapshot_misses: u64,
    pub moe_fallback_events: u64,
    pub moe_latency_total: u64,
    pub moe_latency_max: u64,
    pub moe_latency_samples: u64,
    pub moe_sessions_completed: u64,
}

impl PlatformTotals {
    pub fn avg_wait_cycles(&self) -> Option<f64> {
        if self.wait_samples == 0 {
            None
        } else {
            Some(self.wait_cycles_sum as f64 / self.wait_samples as f64)
        }
    }

    pub fn moe_avg_latency(&self) -> f64 {
        if self.moe_latency_samples == 0 {
            0.0
        } else {
            self.moe_latency_total as f64 / self.moe_latency_samples as f64
        }
    }

    pub fn moe_snapshot_hit_rate(&self) -> f64 {
        let total = self.moe_snapshot_hits + self.moe_snapshot_misses;
        if total == 0 {
            0.0
        } else {
            self.moe_snapshot_hits as f64 / total as f64
        }
    }

    pub fn moe_fallback_rate(&self) -> f64 {
        if self.moe_events_total == 0 {
            0.0
        } else {
            self.moe_fallback_events as f64 / self.moe_events_total as f64
        }
    }
}

/// Everything the stats outputs need, frozen at one cycle boundary.
#[derive(Debug, Clone, Serialize)]
pub struct PlatformSnapshot {
    pub cycle: u64,
    pub totals: PlatformTotals,
    pub kv: KvSnapshot,
    pub dma_load: DmaSnapshot,
    pub dma_store: DmaSnapshot,
    pub digital: Vec<DigitalSnapshot>,
    pub rram: Vec<RramSnapshot>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct KvSnapshot {
    pub loads: u64,
    pub stores: u64,
    pub hits: u64,
    pub misses: u64,
    pub load_bytes: u64,
    pub store_bytes: u64,
    pub hit_bytes: u64,
    pub miss_bytes: u64,
    pub evicted_bytes: u64,
    pub peak_bytes: u64,
}

impl From<KvCounters> for KvSnapshot {
    fn from(c: KvCounters) -> Self {
        Self {
            loads: c.loads,
            stores: c.stores,
            hits: c.hits,
            misses: c.misses,
            load_bytes: c.load_bytes,
            store_bytes: c.store_bytes,
            hit_bytes: c.hit_bytes,
            miss_bytes: c.miss_bytes,
            evicted_bytes: c.evicted_bytes,
            peak_bytes: c.peak_bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DmaSnapshot {
    pub ops: u64,
    pub bytes: u64,
    pub hops: u64,
}

impl From<DmaTotals> for DmaSnapshot {
    fn from(t: DmaTotals) -> Self {
        Self {
            ops: t.ops,
            bytes: t.bytes,
            hops: t.hops,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DigitalSnapshot {
    pub id: u32,
    pub submitted_tasks: u64,
    pub executed_tasks: u64,
    pub pending_tasks: u64,
    pub mac_count: u64,
    pub scalar_ops: u64,
    pub vector_ops: u64,
    pub special_ops: u64,
    pub vpu_ops: u64,
    pub pe_energy_pj: f64,
    pub spu_energy_pj: f64,
    pub vpu_energy_pj: f64,
    pub sram_energy_pj: f64,
    pub static_energy_pj: f64,
}

impl DigitalSnapshot {
    pub fn new(id: u32, totals: DigitalTotals, pending: u64) -> Self {
        Self {
            id,
            submitted_tasks: totals.submitted_tasks,
            executed_tasks: totals.executed_tasks,
            pending_tasks: pending,
            mac_count: totals.mac_count,
            scalar_ops: totals.scalar_ops,
            vector_ops: totals.vector_ops,
            special_ops: totals.special_ops,
            vpu_ops: totals.vpu_ops,
            pe_energy_pj: totals.pe_energy_pj,
            spu_energy_pj: totals.spu_energy_pj,
            vpu_energy_pj: totals.vpu_energy_pj,
            sram_energy_pj: totals.sram_energy_pj,
            static_energy_pj: totals.static_energy_pj,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RramSnapshot {
    pub id: u32,
    pub submitted_tasks: u64,
    pub executed_tasks: u64,
    pub pending_tasks: u64,
    pub pulse_count: u64,
    pub adc_samples: u64,
    pub pre_cycles: u64,
    pub post_cycles: u64,
    pub latency_cycles: u64,
    pub weight_loads: u64,
    pub weight_load_hits: u64,
    pub weight_directory_bytes: u64,
    pub weight_directory_peak_bytes: u64,
    pub weight_load_energy_pj: f64,
    pub pulse_energy_pj: f64,
    pub adc_energy_pj: f64,
    pub error_samples: u64,
    pub error_sum: f64,
}

impl RramSnapshot {
    pub fn new(id: u32, totals: RramTotals, pending: u64, dir_bytes: u64, dir_peak: u64) -> Self {
        Self {
            id,
            submitted_tasks: totals.submitted_tasks,
            executed_tasks: totals.executed_tasks,
            pending_tasks: pending,
            pulse_count: totals.pulse_count,
            adc_samples: totals.adc_samples,
            pre_cycles: totals.pre_cycles,
            post_cycles: totals.post_cycles,
            latency_cycles: totals.latency_cycles,
            weight_loads: totals.weight_loads,
            weight_load_hits: totals.weight_load_hits,
            weight_directory_bytes: dir_bytes,
            weight_directory_peak_bytes: dir_peak,
            weight_load_energy_pj: totals.weight_load_energy_pj,
            pulse_energy_pj: totals.pulse_energy_pj,
            adc_energy_pj: totals.adc_energy_pj,
            error_samples: totals.error_samples,
            error_sum: totals.error_sum,
        }
    }
}

/// One dequantized RRAM result, queued for `chiplet_results.csv`.
#[derive(Debug, Clone, Copy)]
pub struct ResultRow {
    pub cycle: u64,
    pub chiplet_id: i64,
    pub raw_om: i64,
    pub final_value: f64,
    pub reference: Option<f64>,
    pub scale: f64,
    pub zero_point: f64,
}

pub const CYCLE_LOG_HEADER: &str = "cycle, digital_exec, digital_completed, rram_exec, transfer_exec, transfer_bytes, transfer_hops, host_dma_load_bytes, host_dma_store_bytes, kv_hits, kv_misses, kv_load_bytes, kv_store_bytes, digital_load_bytes, digital_store_bytes, digital_pe_active, digital_spu_active, digital_vpu_active, throttle_until, throttle_events, deferrals, avg_wait, digital_util, rram_util, digital_ticks, rram_ticks, interconnect_ticks, host_tasks, outstanding_digital, outstanding_rram, outstanding_transfer, outstanding_dma, transfer_to_rram_bytes, transfer_to_digital_bytes, transfer_host_load_bytes, transfer_host_store_bytes, transfer_throttle_events_total, transfer_throttle_cycles_total";

/// Append-only writer for `chiplet_cycle_log.csv`.
pub struct CycleLogWriter {
    out: BufWriter<fs::File>,
}

#[derive(Debug, Clone, Copy)]
pub struct CycleRow {
    pub cycle: u64,
    pub counters: CycleCounters,
    pub throttle_until: u64,
    pub avg_wait: f64,
    pub digital_util: f64,
    pub rram_util: f64,
    pub digital_ticks: u64,
    pub rram_ticks: u64,
    pub interconnect_ticks: u64,
    pub outstanding_digital: i64,
    pub outstanding_rram: i64,
    pub outstanding_transfer: i64,
    pub outstanding_dma: i64,
    pub transfer_to_rram_bytes: u64,
    pub transfer_to_digital_bytes: u64,
    pub transfer_host_load_bytes: u64,
    pub transfer_host_store_bytes: u64,
    pub transfer_throttle_events_total: u64,
    pub transfer_throttle_cycles_total: u64,
}

impl CycleLogWriter {
    pub fn create(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let file = fs::File::create(dir.join("chiplet_cycle_log.csv"))?;
        let mut out = BufWriter::new(file);
        writeln!(out, "{CYCLE_LOG_HEADER}")?;
        Ok(Self { out })
    }

    pub fn append(&mut self, row: &CycleRow) -> io::Result<()> {
        let c = row.counters;
        writeln!(
            self.out,
            "{}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {:.3}, {:.3}, {:.3}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}",
            row.cycle,
            c.digital_exec,
            c.digital_completed,
            c.rram_exec,
            c.transfer_exec,
            c.transfer_bytes,
            c.transfer_hops,
            c.host_dma_load_bytes,
            c.host_dma_store_bytes,
            c.kv_hits,
            c.kv_misses,
            c.kv_load_bytes,
            c.kv_store_bytes,
            c.digital_load_bytes,
            c.digital_store_bytes,
            c.digital_pe_active,
            c.digital_spu_active,
            c.digital_vpu_active,
            row.throttle_until,
            c.throttle_events,
            c.deferrals,
            row.avg_wait,
            row.digital_util,
            row.rram_util,
            row.digital_ticks,
            row.rram_ticks,
            row.interconnect_ticks,
            c.host_tasks,
            row.outstanding_digital,
            row.outstanding_rram,
            row.outstanding_transfer,
            row.outstanding_dma,
            row.transfer_to_rram_bytes,
            row.transfer_to_digital_bytes,
            row.transfer_host_load_bytes,
            row.transfer_host_store_bytes,
            row.transfer_throttle_events_total,
            row.transfer_throttle_cycles_total,
        )
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// Write `chiplet_log.txt`: one `key: value` line per counter.
pub fn write_chiplet_log(dir: &Path, snapshot: &PlatformSnapshot) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join("chiplet_log.txt");
    let file = fs::File::create(&path)?;
    let mut out = BufWriter::new(file);
    let t = &snapshot.totals;

    let mut line = |key: &str, value: String| writeln!(out, "{key}: {value}");
    line("ChipletPlatform_Cycle", snapshot.cycle.to_string())?;
    line(
        "ChipletPlatform_DigitalTasksExecuted",
        t.digital_tasks_executed.to_string(),
    )?;
    line(
        "ChipletPlatform_RramTasksExecuted",
        t.rram_tasks_executed.to_string(),
    )?;
    line(
        "ChipletPlatform_TransferTasksExecuted",
        t.transfer_tasks_executed.to_string(),
    )?;
    line(
        "ChipletPlatform_HostTasksExecuted",
        t.host_tasks_executed.to_string(),
    )?;
    line(
        "ChipletPlatform_TotalTransferBytes",
        t.total_transfer_bytes.to_string(),
    )?;
    line(
        "ChipletPlatform_TotalTransferHops",
        t.total_transfer_hops.to_string(),
    )?;
    line(
        "ChipletPlatform_TransferToRramBytes",
        t.transfer_to_rram_bytes.to_string(),
    )?;
    line(
        "ChipletPlatform_TransferToDigitalBytes",
        t.transfer_to_digital_bytes.to_string(),
    )?;
    line(
        "ChipletPlatform_TransferHostLoadBytes",
        t.transfer_host_load_bytes.to_string(),
    )?;
    line(
        "ChipletPlatform_TransferHostStoreBytes",
        t.transfer_host_store_bytes.to_string(),
    )?;
    line(
        "ChipletPlatform_TransferThrottleEventsTotal",
        t.transfer_throttle_events_total.to_string(),
    )?;
    line(
        "ChipletPlatform_TransferThrottleCyclesTotal",
        t.transfer_throttle_cycles_total.to_string(),
    )?;
    line(
        "ChipletPlatform_DeferralsTotal",
        t.deferrals_total.to_string(),
    )?;
    line("ChipletPlatform_DroppedTasks", t.dropped_tasks.to_string())?;
    line(
        "ChipletPlatform_DigitalTicksTotal",
        t.digital_ticks_total.to_string(),
    )?;
    line(
        "ChipletPlatform_RramTicksTotal",
        t.rram_ticks_total.to_string(),
    )?;
    line(
        "ChipletPlatform_InterconnectTicksTotal",
        t.interconnect_ticks_total.to_string(),
    )?;
    line(
        "ChipletPlatform_PeInterconnectEnergyPj",
        format!("{:.3}", t.pe_interconnect_energy_pj),
    )?;
    line(
        "ChipletPlatform_RramInterconnectEnergyPj",
        format!("{:.3}", t.rram_interconnect_energy_pj),
    )?;
    if let Some(avg) = t.avg_wait_cycles() {
        line("ChipletPlatform_AvgWaitCycles", format!("{avg:.3}"))?;
    }
    line(
        "ChipletPlatform_MoeEventsTotal",
        t.moe_events_total.to_string(),
    )?;
    line(
        "ChipletPlatform_MoeSnapshotHits",
        t.moe_snapshot_hits.to_string(),
    )?;
    line(
        "ChipletPlatform_MoeSnapshotMisses",
        t.moe_snapshot_misses.to_string(),
    )?;
    line(
        "ChipletPlatform_MoeFallbackEvents",
        t.moe_fallback_events.to_string(),
    )?;
    line(
        "ChipletPlatform_MoeSessionsCompleted",
        t.moe_sessions_completed.to_string(),
    )?;
    line(
        "ChipletPlatform_MoeLatencyMax",
        t.moe_latency_max.to_string(),
    )?;
    line(
        "ChipletPlatform_MoeAvgLatency",
        format!("{:.3}", t.moe_avg_latency()),
    )?;
    line("ChipletPlatform_KvLoads", snapshot.kv.loads.to_string())?;
    line("ChipletPlatform_KvStores", snapshot.kv.stores.to_string())?;
    line("ChipletPlatform_KvHits", snapshot.kv.hits.to_string())?;
    line("ChipletPlatform_KvMisses", snapshot.kv.misses.to_string())?;
    line(
        "ChipletPlatform_KvLoadBytes",
        snapshot.kv.load_bytes.to_string(),
    )?;
    line(
        "ChipletPlatform_KvStoreBytes",
        snapshot.kv.store_bytes.to_string(),
    )?;
    line(
        "ChipletPlatform_KvEvictedBytes",
        snapshot.kv.evicted_bytes.to_string(),
    )?;
    line(
        "ChipletPlatform_KvPeakBytes",
        snapshot.kv.peak_bytes.to_string(),
    )?;
    line(
        "ChipletPlatform_HostDmaLoadOps",
        snapshot.dma_load.ops.to_string(),
    )?;
    line(
        "ChipletPlatform_HostDmaLoadBytes",
        snapshot.dma_load.bytes.to_string(),
    )?;
    line(
        "ChipletPlatform_HostDmaStoreOps",
        snapshot.dma_store.ops.to_string(),
    )?;
    line(
        "ChipletPlatform_HostDmaStoreBytes",
        snapshot.dma_store.bytes.to_string(),
    )?;

    for d in &snapshot.digital {
        let p = format!("DigitalChiplet[{}]_", d.id);
        line(&format!("{p}SubmittedTasks"), d.submitted_tasks.to_string())?;
        line(&format!("{p}ExecutedTasks"), d.executed_tasks.to_string())?;
        line(&format!("{p}PendingTasks"), d.pending_tasks.to_string())?;
        line(&format!("{p}MacCount"), d.mac_count.to_string())?;
        line(&format!("{p}ScalarOps"), d.scalar_ops.to_string())?;
        line(&format!("{p}VectorOps"), d.vector_ops.to_string())?;
        line(&format!("{p}SpecialOps"), d.special_ops.to_string())?;
        line(&format!("{p}VpuOps"), d.vpu_ops.to_string())?;
        line(&format!("{p}PeEnergyPj"), format!("{:.3}", d.pe_energy_pj))?;
        line(&format!("{p}SpuEnergyPj"), format!("{:.3}", d.spu_energy_pj))?;
        line(&format!("{p}VpuEnergyPj"), format!("{:.3}", d.vpu_energy_pj))?;
        line(&format!("{p}SramEnergyPj"), format!("{:.3}", d.sram_energy_pj))?;
        line(
            &format!("{p}StaticEnergyPj"),
            format!("{:.3}", d.static_energy_pj),
        )?;
    }
    for r in &snapshot.rram {
        let p = format!("RramChiplet[{}]_", r.id);
        line(&format!("{p}SubmittedTasks"), r.submitted_tasks.to_string())?;
        line(&format!("{p}ExecutedTasks"), r.executed_tasks.to_string())?;
        line(&format!("{p}PendingTasks"), r.pending_tasks.to_string())?;
        line(&format!("{p}PulseCount"), r.pulse_count.to_string())?;
        line(&format!("{p}AdcSamples"), r.adc_samples.to_string())?;
        line(&format!("{p}PreCycles"), r.pre_cycles.to_string())?;
        line(&format!("{p}PostCycles"), r.post_cycles.to_string())?;
        line(&format!("{p}LatencyCycles"), r.latency_cycles.to_string())?;
        line(&format!("{p}WeightLoads"), r.weight_loads.to_string())?;
        line(&format!("{p}WeightLoadHits"), r.weight_load_hits.to_string())?;
        line(
            &format!("{p}WeightDirectoryBytes"),
            r.weight_directory_bytes.to_string(),
        )?;
        line(
            &format!("{p}WeightDirectoryPeakBytes"),
            r.weight_directory_peak_bytes.to_string(),
        )?;
        line(
            &format!("{p}WeightLoadEnergyPj"),
            format!("{:.3}", r.weight_load_energy_pj),
        )?;
        line(&format!("{p}PulseEnergyPj"), format!("{:.3}", r.pulse_energy_pj))?;
        line(&format!("{p}AdcEnergyPj"), format!("{:.3}", r.adc_energy_pj))?;
        line(&format!("{p}ErrorSamples"), r.error_samples.to_string())?;
        line(&format!("{p}ErrorSum"), format!("{:.6}", r.error_sum))?;
    }
    out.flush()?;
    Ok(path)
}

/// Write `chiplet_results.csv`: one row per RRAM result, plus a final summary
/// row (`chiplet_id = -1`) when any MoE events occurred.
pub fn write_results_csv(
    dir: &Path,
    rows: &[ResultRow],
    totals: &PlatformTotals,
) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join("chiplet_results.csv");
    let file = fs::File::create(&path)?;
    let mut out = BufWriter::new(file);
    writeln!(
        out,
        "cycle, chiplet_id, raw_om, final, reference, scale, zero_point, moe_events_total, moe_avg_latency, moe_latency_max, moe_snapshot_hit_rate, moe_fallback_rate"
    )?;
    let mut write_row = |row: &ResultRow| {
        let reference = row
            .reference
            .map_or_else(|| "nan".to_owned(), |r| format!("{r:.6}"));
        writeln!(
            out,
            "{}, {}, {}, {:.6}, {}, {:.6}, {:.6}, {}, {:.3}, {}, {:.3}, {:.3}",
            row.cycle,
            row.chiplet_id,
            row.raw_om,
            row.final_value,
            reference,
            row.scale,
            row.zero_point,
            totals.moe_events_total,
            totals.moe_avg_latency(),
            totals.moe_latency_max,
            totals.moe_snapshot_hit_rate(),
            totals.moe_fallback_rate(),
        )
    };
    for row in rows {
        write_row(row)?;
    }
    if totals.moe_events_total > 0 {
        let summary = ResultRow {
            cycle: 0,
            chiplet_id: -1,
            raw_om: 0,
            final_value: 0.0,
            reference: None,
            scale: 0.0,
            zero_point: 0.0,
        };
        write_row(&summary)?;
    }
    out.flush()?;
    Ok(path)
}

/// Serialize the snapshot next to the text log (`chiplet_stats.json`).
pub fn write_stats_json(dir: &Path, snapshot: &PlatformSnapshot) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join("chiplet_stats.json");
    let text = serde_json::to_string_pretty(snapshot).map_err(io::Error::other)?;
    fs::write(&path, text)?;
    Ok(path)
}
