//! RRAM chiplet: tiles of sense arrays, the weight directory, the weight-load
//! DMA queue, and the input/output SRAM staging buffers.

use std::collections::VecDeque;

use tessera_config::SimConfig;
use tessera_sram::Buffer;
use tessera_types::{RramTaskSpec, WeightKey};
use tracing::{debug, trace};

use crate::directory::WeightDirectory;
use crate::quant::ResultSummary;
use crate::tile::RramTile;

/// The two externally adjustable staging buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RramBufferKind {
    Input,
    Output,
}

#[derive(Debug)]
struct WeightLoadTask {
    key: WeightKey,
    bytes: u64,
    remaining: u64,
    start_tick: u64,
}

/// Lifetime counters, read by the stats writers.
#[derive(Debug, Default, Clone, Copy)]
pub struct RramTotals {
    pub submitted_tasks: u64,
    pub executed_tasks: u64,
    pub pulse_count: u64,
    pub adc_samples: u64,
    pub pre_cycles: u64,
    pub post_cycles: u64,
    pub latency_cycles: u64,
    pub weight_loads: u64,
    pub weight_load_hits: u64,
    pub weight_load_energy_pj: f64,
    pub pulse_energy_pj: f64,
    pub adc_energy_pj: f64,
    pub error_sum: f64,
    pub error_samples: u64,
}

pub struct RramChiplet {
    id: u32,
    tiles: Vec<RramTile>,
    rr_tile: usize,
    pub directory: WeightDirectory,
    input_buffer: Buffer,
    output_buffer: Buffer,
    load_queue: VecDeque<WeightLoadTask>,
    active_load: Option<WeightLoadTask>,
    weight_load_bytes_per_cycle: u64,
    weight_read_energy_pj_per_byte: f64,
    pulse_energy_pj: f64,
    adc_energy_pj_per_sample: f64,
    pending_tasks: u64,
    tick_count: u64,
    totals: RramTotals,
    last_result: Option<ResultSummary>,
    /// CIM tasks finalized this tick, reset at the top of every tick.
    pub cycle_tasks_completed: u64,
}

impl RramChiplet {
    pub fn new(id: u32, cfg: &SimConfig) -> Self {
        let tile_count = (cfg.tiles_per_dim * cfg.tiles_per_dim).max(1);
        let arrays_per_tile = (cfg.sas_per_tile_dim * cfg.sas_per_tile_dim).max(1) as usize;
        let tiles = (0..tile_count)
            .map(|i| RramTile::new(i as usize, arrays_per_tile, u64::from(cfg.sa_rows)))
            .collect();
        Self {
            id,
            tiles,
            rr_tile: 0,
            directory: WeightDirectory::new(),
            input_buffer: Buffer::new("input", cfg.rram_input_buffer_bytes, cfg.d2r_bandwidth_bytes),
            output_buffer: Buffer::new(
                "output",
                cfg.rram_output_buffer_bytes,
                cfg.r2d_bandwidth_bytes,
            ),
            load_queue: VecDeque::new(),
            active_load: None,
            weight_load_bytes_per_cycle: cfg.weight_load_bytes_per_cycle.max(1),
            weight_read_energy_pj_per_byte: cfg.weight_read_energy_pj_per_byte,
            pulse_energy_pj: cfg.pulse_energy_pj,
            adc_energy_pj_per_sample: cfg.adc_energy_pj_per_sample,
            pending_tasks: 0,
            tick_count: 0,
            totals: RramTotals::default(),
            last_result: None,
            cycle_tasks_completed: 0,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn pending_tasks(&self) -> u64 {
        self.pending_tasks
    }

    pub fn totals(&self) -> RramTotals {
        self.totals
    }

    pub fn num_tiles(&self) -> usize {
        self.tiles.len()
    }

    /// Queue a CIM op. The weight identity routes it to a tile; spec-less ops
    /// round-robin.
    pub fn schedule_task(&mut self, latency: u64, spec: Option<RramTaskSpec>) {
        let tile_index = match &spec {
            Some(s) => s.weight.tile_id as usize % self.tiles.len(),
            None => {
                let i = self.rr_tile;
                self.rr_tile = (self.rr_tile + 1) % self.tiles.len();
                i
            }
        };
        trace!(chiplet = self.id, tile = tile_index, "schedule cim op");
        self.tiles[tile_index].schedule(latency, spec);
        self.pending_tasks += 1;
        self.totals.submitted_tasks += 1;
    }

    /// Queue a weight-load DMA. Latency defaults to the bandwidth-derived
    /// cycle count, minimum one.
    pub fn schedule_weight_load(
        &mut self,
        tile_id: u32,
        array_id: u32,
        tag: &str,
        bytes: u64,
        latency: Option<u64>,
        start_tick: u64,
    ) {
        let cycles = latency
            .filter(|&l| l > 0)
            .unwrap_or_else(|| bytes.div_ceil(self.weight_load_bytes_per_cycle).max(1));
        self.load_queue.push_back(WeightLoadTask {
            key: WeightKey::new(tile_id, array_id, tag),
            bytes,
            remaining: cycles.max(1),
            start_tick,
        });
        self.pending_tasks += 1;
        self.totals.weight_loads += 1;
    }

    /// Short-circuit for a weight-load whose key is already resident.
    /// Counts a load and a hit; charges no energy and queues no DMA.
    pub fn weight_hit(&mut self, key: &WeightKey) -> bool {
        if self.directory.touch(key, self.tick_count) {
            self.totals.weight_loads += 1;
            self.totals.weight_load_hits += 1;
            true
        } else {
            false
        }
    }

    /// One RRAM-domain cycle across every tile plus the weight-load engine.
    pub fn tick(&mut self) {
        self.cycle_tasks_completed = 0;
        self.tick_count += 1;

        for tile in &mut self.tiles {
            if let Some(delta) = tile.tick() {
                self.totals.executed_tasks += 1;
                self.totals.pulse_count += delta.pulses;
                self.totals.adc_samples += delta.adc_samples;
                self.totals.pre_cycles += delta.pre_cycles;
                self.totals.post_cycles += delta.post_cycles;
                self.totals.latency_cycles += delta.latency_cycles;
                self.totals.pulse_energy_pj += delta.pulses as f64 * self.pulse_energy_pj;
                self.totals.adc_energy_pj +=
                    delta.adc_samples as f64 * self.adc_energy_pj_per_sample;
                if let Some(err) = delta.error {
                    self.totals.error_sum += err;
                    self.totals.error_samples += 1;
                }
                if let Some(summary) = delta.summary {
                    self.last_result = Some(summary);
                }
                self.cycle_tasks_completed += 1;
                self.pending_tasks = self.pending_tasks.saturating_sub(1);
            }
        }

        self.tick_weight_load();
    }

    fn tick_weight_load(&mut self) {
        if self.active_load.is_none() {
            self.active_load = self.load_queue.pop_front();
        }
        let Some(load) = self.active_load.as_mut() else {
            return;
        };
        load.remaining -= 1;
        if load.remaining > 0 {
            return;
        }
        let load = self.active_load.take().expect("active load");
        // Energy lands at completion, not at issue.
        self.totals.weight_load_energy_pj +=
            load.bytes as f64 * self.weight_read_energy_pj_per_byte;
        self.directory.register(load.key.clone(), load.bytes, self.tick_count);
        self.pending_tasks = self.pending_tasks.saturating_sub(1);
        debug!(
            chiplet = self.id,
            tag = %load.key.tag,
            bytes = load.bytes,
            queued_at = load.start_tick,
            "weight load complete"
        );
    }

    /// Result of the most recently finalized postprocess, drained per tick by
    /// the platform's results log.
    pub fn consume_last_result(&mut self) -> Option<ResultSummary> {
        self.last_result.take()
    }

    fn buffer(&self, kind: RramBufferKind) -> &Buffer {
        match kind {
            RramBufferKind::Input => &self.input_buffer,
            RramBufferKind::Output => &self.output_buffer,
        }
    }

    fn buffer_mut(&mut self, kind: RramBufferKind) -> &mut Buffer {
        match kind {
            RramBufferKind::Input => &mut self.input_buffer,
            RramBufferKind::Output => &mut self.output_buffer,
        }
    }

    /// External staging-buffer adjustment from the platform's transfer path.
    pub fn adjust_buffer(&mut self, kind: RramBufferKind, delta: i64) -> bool {
        self.buffer_mut(kind).apply_delta(delta)
    }

    pub fn buffer_occupancy(&self, kind: RramBufferKind) -> u64 {
        self.buffer(kind).occupancy()
    }

    pub fn buffer_capacity(&self, kind: RramBufferKind) -> u64 {
        self.buffer(kind).capacity()
    }
}
