//! Top-level per-cycle driver.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use tessera_config::{ConfigError, SimConfig};
use tessera_digital::DigitalChiplet;
use tessera_estimators::{
    BookSimClient, DmaCycleEstimator, DramAccess, HostDmaController, RamulatorClient,
};
use tessera_host::HostOrchestrator;
use tessera_model::{expand_model, load_model};
use tessera_rram::RramChiplet;
use tessera_topology::Topology;
use tessera_types::{MetaMap, Task};

use crate::clock::{DomainTicks, MultiDomainClock};
use crate::kv::KvCache;
use crate::stager::{FifoScheduler, TaskStager};
use crate::stats::{
    write_chiplet_log, write_results_csv, write_stats_json, CycleCounters, CycleLogWriter,
    CycleRow, DigitalSnapshot, PlatformSnapshot, PlatformTotals, ResultRow, RramSnapshot,
};

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to create output files under {dir}: {source}")]
    Output {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// State captured when a `topk_select` command is dispatched, consumed when
/// the matching `host_gating_fetch` completes.
#[derive(Debug, Clone)]
pub struct GatingSnapshot {
    pub command_id: i64,
    pub issued_cycle: u64,
    pub tokens: u64,
    pub features: u64,
    pub top_k: usize,
    pub candidates: Vec<i64>,
    pub selected: Vec<i64>,
    pub bytes: u64,
    pub metadata: MetaMap,
}

/// Per-session metrics keyed by the gating-fetch node until its barrier lands.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MoeNodeMeta {
    pub start_cycle: u64,
    pub tokens: u64,
    pub experts: u64,
    pub fallback: bool,
}

struct RamulatorDma {
    client: RamulatorClient,
}

impl DmaCycleEstimator for RamulatorDma {
    fn estimate(&mut self, bytes: u64, _hops: u64, metadata: &MetaMap) -> Option<u64> {
        self.client.estimate(bytes, DramAccess::Read, 64, 0, metadata)
    }
}

pub struct ChipletPlatform {
    pub(crate) cfg: SimConfig,
    pub(crate) topology: Topology,
    pub(crate) digital: Vec<DigitalChiplet>,
    pub(crate) rram: Vec<RramChiplet>,
    pub(crate) orchestrator: HostOrchestrator,
    pub(crate) stager: TaskStager,
    pub(crate) scheduler: FifoScheduler,
    pub(crate) dma: HostDmaController,
    pub(crate) noc: Option<BookSimClient>,
    pub(crate) kv: KvCache,
    clock: MultiDomainClock,
    pub(crate) cycle: u64,
    pub(crate) transfer_throttle_until: u64,

    // RRAM staging-buffer coupling, per RRAM chiplet.
    pub(crate) rram_input_buffered: Vec<u64>,
    pub(crate) rram_processing_bytes: Vec<u64>,
    pub(crate) rram_output_buffered: Vec<u64>,

    // MoE bookkeeping.
    pub(crate) gating_snapshots: HashMap<(i64, i64), GatingSnapshot>,
    pub(crate) moe_parents: HashMap<u64, MoeNodeMeta>,

    pub(crate) totals: PlatformTotals,
    pub(crate) cycle_counters: CycleCounters,
    pub(crate) results: Vec<ResultRow>,
    cycle_log: Option<CycleLogWriter>,
    last_ticks: DomainTicks,
}

impl ChipletPlatform {
    pub fn new(cfg: SimConfig) -> Result<Self, PlatformError> {
        cfg.validate()?;
        let topology = Topology::new(cfg.num_digital, cfg.num_rram);

        let digital = (0..cfg.num_digital)
            .map(|id| DigitalChiplet::new(id, &cfg))
            .collect();
        let rram: Vec<RramChiplet> = (0..cfg.num_rram)
            .map(|id| RramChiplet::new(id, &cfg))
            .collect();

        // A model file, when present, takes precedence over a raw command
        // file; both fall back to the bootstrap graph. An unconfigured
        // command file means "use ./chiplet_commands.json if it exists".
        let default_commands = PathBuf::from("chiplet_commands.json");
        let command_file = cfg
            .command_file
            .as_deref()
            .or_else(|| default_commands.exists().then_some(default_commands.as_path()));
        let orchestrator = match cfg.model_file.as_deref() {
            Some(path) => {
                let model = load_model(path);
                match expand_model(&model, 0) {
                    Ok(commands) if !commands.is_empty() => {
                        let graph = tessera_host::build_graph_from_commands(
                            &commands,
                            cfg.effective_min_wait(),
                        );
                        HostOrchestrator::with_graph(&cfg, topology.clone(), graph)
                    }
                    Ok(_) => HostOrchestrator::new(&cfg, topology.clone(), command_file),
                    Err(err) => {
                        warn!(%err, "model expansion failed, falling back to command file");
                        HostOrchestrator::new(&cfg, topology.clone(), command_file)
                    }
                }
            }
            None => HostOrchestrator::new(&cfg, topology.clone(), command_file),
        };

        let timeout = Duration::from_millis(cfg.estimator_timeout_ms.max(1));
        let mut dma = HostDmaController::new(cfg.host_dma_bandwidth_bytes);
        if let Some(path) = cfg.ramulator_path.as_deref() {
            match RamulatorClient::spawn(path, timeout) {
                Ok(client) => {
                    info!(path = %path.display(), "ramulator estimator attached");
                    dma = dma.with_estimator(Box::new(RamulatorDma { client }));
                }
                Err(err) => warn!(%err, "ramulator unavailable, using bandwidth model"),
            }
        }
        let noc = cfg.booksim_path.as_deref().and_then(|path| {
            match BookSimClient::spawn(path, timeout) {
                Ok(client) => {
                    info!(path = %path.display(), "booksim estimator attached");
                    Some(client)
                }
                Err(err) => {
                    warn!(%err, "booksim unavailable, using bandwidth model");
                    None
                }
            }
        });

        let clock = MultiDomainClock::new(
            cfg.digital_clock_mhz,
            cfg.rram_clock_mhz,
            cfg.interconnect_clock_mhz,
        );
        let num_rram = rram.len();

        Ok(Self {
            kv: KvCache::new(cfg.kv_cache_bytes),
            topology,
            digital,
            rram,
            orchestrator,
            stager: TaskStager::new(),
            scheduler: FifoScheduler::new(),
            dma,
            noc,
            clock,
            cycle: 0,
            transfer_throttle_until: 0,
            rram_input_buffered: vec![0; num_rram],
            rram_processing_bytes: vec![0; num_rram],
            rram_output_buffered: vec![0; num_rram],
            gating_snapshots: HashMap::new(),
            moe_parents: HashMap::new(),
            totals: PlatformTotals::default(),
            cycle_counters: CycleCounters::default(),
            results: Vec::new(),
            cycle_log: None,
            cfg,
            last_ticks: DomainTicks::default(),
        })
    }

    /// Enable the per-cycle CSV log under the configured output directory.
    pub fn enable_cycle_log(&mut self) -> Result<(), PlatformError> {
        let dir = self.cfg.bin_dirpath.clone();
        let writer = CycleLogWriter::create(&dir).map_err(|source| PlatformError::Output {
            dir: dir.clone(),
            source,
        })?;
        self.cycle_log = Some(writer);
        Ok(())
    }

    pub fn current_cycle(&self) -> u64 {
        self.cycle
    }

    pub fn totals(&self) -> &PlatformTotals {
        &self.totals
    }

    pub fn orchestrator(&self) -> &HostOrchestrator {
        &self.orchestrator
    }

    pub fn kv_cache(&self) -> &KvCache {
        &self.kv
    }

    pub fn digital_chiplet(&self, id: usize) -> Option<&DigitalChiplet> {
        self.digital.get(id)
    }

    pub fn rram_chiplet(&self, id: usize) -> Option<&RramChiplet> {
        self.rram.get(id)
    }

    /// Mutable device access for host-driven buffer adjustments; everything
    /// else should flow through commands.
    pub fn digital_chiplet_mut(&mut self, id: usize) -> Option<&mut DigitalChiplet> {
        self.digital.get_mut(id)
    }

    pub fn rram_chiplet_mut(&mut self, id: usize) -> Option<&mut RramChiplet> {
        self.rram.get_mut(id)
    }

    pub fn transfer_throttle_until(&self) -> u64 {
        self.transfer_throttle_until
    }

    pub fn results(&self) -> &[ResultRow] {
        &self.results
    }

    /// One simulation cycle: multi-domain phasing, task flow, device ticks,
    /// throttle decay, static energy, logging. Deterministic order
    /// throughout.
    pub fn cycle(&mut self) {
        let ticks = self.clock.step();
        self.last_ticks = ticks;
        self.cycle += 1;
        self.cycle_counters = CycleCounters::default();
        self.totals.digital_ticks_total += ticks.digital;
        self.totals.rram_ticks_total += ticks.rram;
        self.totals.interconnect_ticks_total += ticks.interconnect;

        for _ in 0..ticks.digital {
            self.digital_tick();
        }
        for _ in 0..ticks.rram {
            self.rram_tick();
        }
        for _ in 0..ticks.interconnect {
            if self.transfer_throttle_until > 0 {
                self.transfer_throttle_until -= 1;
                self.totals.transfer_throttle_cycles_total += 1;
            }
        }
        for chiplet in &mut self.digital {
            chiplet.add_static_energy(ticks.digital);
        }

        self.log_cycle();
    }

    fn digital_tick(&mut self) {
        // Pull released work from the orchestrator into the stager.
        for task in self.orchestrator.advance(self.cycle) {
            self.stager.push(task);
        }

        // Drain the stager into the scheduler, deferring throttled transfers
        // and tasks aimed at saturated chiplets.
        let mut deferred: Vec<Task> = Vec::new();
        while let Some(task) = self.stager.pop() {
            if task.target == tessera_types::Target::Transfer && self.transfer_throttle_until > 0 {
                self.cycle_counters.deferrals += 1;
                self.totals.deferrals_total += 1;
                deferred.push(task);
                continue;
            }
            if self.target_is_saturated(&task) {
                self.cycle_counters.deferrals += 1;
                self.totals.deferrals_total += 1;
                deferred.push(task);
                continue;
            }
            self.scheduler.enqueue(task);
        }
        for task in deferred.into_iter().rev() {
            self.stager.push_front(task);
        }

        // One scheduler tick releases the accepted tasks in order.
        for task in self.scheduler.tick() {
            self.execute_task(task);
        }

        // Device ticks and per-cycle aggregation.
        for chiplet in &mut self.digital {
            chiplet.tick();
            let c = chiplet.cycle;
            self.cycle_counters.digital_load_bytes += c.load_bytes;
            self.cycle_counters.digital_store_bytes += c.store_bytes;
            self.cycle_counters.digital_pe_active += c.pe_active;
            self.cycle_counters.digital_spu_active += c.spu_active;
            self.cycle_counters.digital_vpu_active += c.vpu_active;
            self.cycle_counters.digital_completed += c.tasks_completed;
        }
    }

    fn rram_tick(&mut self) {
        for i in 0..self.rram.len() {
            self.rram[i].tick();
            if let Some(summary) = self.rram[i].consume_last_result() {
                self.results.push(ResultRow {
                    cycle: self.cycle,
                    chiplet_id: i as i64,
                    raw_om: summary.raw_om,
                    final_value: summary.final_value,
                    reference: summary.reference,
                    scale: summary.scale,
                    zero_point: summary.zero_point,
                });
            }
        }
    }

    fn target_is_saturated(&self, task: &Task) -> bool {
        let capacity = self.cfg.pending_capacity;
        match task.target {
            tessera_types::Target::Digital => self
                .resolve_digital_index(task)
                .map(|i| self.digital[i].pending_tasks() >= capacity)
                .unwrap_or(false),
            tessera_types::Target::Rram => self
                .resolve_rram_index(task)
                .map(|i| self.rram[i].pending_tasks() >= capacity)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Run `cycles` simulation cycles.
    pub fn run(&mut self, cycles: u64) {
        for _ in 0..cycles {
            self.cycle();
        }
    }

    /// Run until nothing is queued, staged, or pending anywhere, or until
    /// `max_cycles` elapse. Returns the cycles spent.
    pub fn run_until_idle(&mut self, max_cycles: u64) -> u64 {
        let start = self.cycle;
        while self.cycle - start < max_cycles {
            self.cycle();
            if self.is_idle() {
                break;
            }
        }
        self.cycle - start
    }

    pub fn is_idle(&self) -> bool {
        self.orchestrator.is_idle()
            && self.stager.is_empty()
            && self.scheduler.backlog() == 0
            && self.digital.iter().all(|c| c.pending_tasks() == 0)
            && self.rram.iter().all(|c| c.pending_tasks() == 0)
    }

    fn log_cycle(&mut self) {
        if self.cfg.progress_interval_cycles > 0
            && self.cycle % self.cfg.progress_interval_cycles == 0
        {
            info!(
                cycle = self.cycle,
                digital = self.totals.digital_tasks_executed,
                rram = self.totals.rram_tasks_executed,
                transfers = self.totals.transfer_tasks_executed,
                "progress"
            );
        }

        if self.cycle_log.is_some() {
            let row = self.cycle_row();
            if let Some(writer) = self.cycle_log.as_mut() {
                if let Err(err) = writer.append(&row) {
                    warn!(%err, "cycle log write failed, disabling");
                    self.cycle_log = None;
                }
            }
            if self.cfg.stats_flush_interval_cycles > 0
                && self.cycle % self.cfg.stats_flush_interval_cycles == 0
            {
                if let Some(writer) = self.cycle_log.as_mut() {
                    let _ = writer.flush();
                }
            }
        }
    }

    fn cycle_row(&self) -> CycleRow {
        let outstanding = self.orchestrator.outstanding();
        let pe_total: u64 = self
            .digital
            .iter()
            .map(|c| (0..c.num_clusters()).map(|i| c.cluster(i).map_or(0, |cl| cl.pe_count())).sum::<u64>())
            .sum();
        let digital_util = if pe_total == 0 {
            0.0
        } else {
            self.cycle_counters.digital_pe_active as f64 / pe_total as f64
        };
        let rram_busy = self
            .rram
            .iter()
            .filter(|c| c.pending_tasks() > 0)
            .count() as f64;
        let rram_util = if self.rram.is_empty() {
            0.0
        } else {
            rram_busy / self.rram.len() as f64
        };
        CycleRow {
            cycle: self.cycle,
            counters: self.cycle_counters,
            throttle_until: self.transfer_throttle_until,
            avg_wait: self.totals.avg_wait_cycles().unwrap_or(0.0),
            digital_util,
            rram_util,
            digital_ticks: self.last_ticks.digital,
            rram_ticks: self.last_ticks.rram,
            interconnect_ticks: self.last_ticks.interconnect,
            outstanding_digital: outstanding.digital,
            outstanding_rram: outstanding.rram,
            outstanding_transfer: outstanding.transfer,
            outstanding_dma: outstanding.dma,
            transfer_to_rram_bytes: self.totals.transfer_to_rram_bytes,
            transfer_to_digital_bytes: self.totals.transfer_to_digital_bytes,
            transfer_host_load_bytes: self.totals.transfer_host_load_bytes,
            transfer_host_store_bytes: self.totals.transfer_host_store_bytes,
            transfer_throttle_events_total: self.totals.transfer_throttle_events_total,
            transfer_throttle_cycles_total: self.totals.transfer_throttle_cycles_total,
        }
    }

    pub fn snapshot(&self) -> PlatformSnapshot {
        PlatformSnapshot {
            cycle: self.cycle,
            totals: self.totals,
            kv: self.kv.counters().into(),
            dma_load: self.dma.load_totals().into(),
            dma_store: self.dma.store_totals().into(),
            digital: self
                .digital
                .iter()
                .map(|c| DigitalSnapshot::new(c.id(), c.totals(), c.pending_tasks()))
                .collect(),
            rram: self
                .rram
                .iter()
                .map(|c| {
                    RramSnapshot::new(
                        c.id(),
                        c.totals(),
                        c.pending_tasks(),
                        c.directory.total_bytes(),
                        c.directory.peak_bytes(),
                    )
                })
                .collect(),
        }
    }

    /// Flush every §stats output under the configured directory.
    pub fn write_outputs(&mut self) -> Result<(), PlatformError> {
        let dir = self.cfg.bin_dirpath.clone();
        let snapshot = self.snapshot();
        let wrap = |source: std::io::Error| PlatformError::Output {
            dir: dir.clone(),
            source,
        };
        write_chiplet_log(&dir, &snapshot).map_err(wrap)?;
        write_results_csv(&dir, &self.results, &self.totals).map_err(wrap)?;
        write_stats_json(&dir, &snapshot).map_err(wrap)?;
        if let Some(writer) = self.cycle_log.as_mut() {
            writer.flush().map_err(wrap)?;
        }
        Ok(())
    }
}
