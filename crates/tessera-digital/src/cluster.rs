//! Compute cluster: one share of a digital chiplet's PE arrays, SPU clusters,
//! VPU units and SRAM buffers, plus the task pipeline that moves work through
//! load -> compute -> store -> vector -> scalar phases.

use std::collections::{HashMap, VecDeque};

use tessera_config::SimConfig;
use tessera_types::{BufferKind, DigitalTaskDesc, DigitalUnit};
use tracing::debug;

use tessera_sram::Buffer;

use crate::units::{PeArray, SpuCluster, VpuUnit};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskPhase {
    Load,
    Compute,
    Store,
    Vpu,
    Spu,
    BufferAlloc,
    BufferRelease,
    Barrier,
}

#[derive(Debug)]
struct ClusterTask {
    desc: DigitalTaskDesc,
    /// Phases still to run, front first. The head is the live phase once the
    /// task is active.
    phases: VecDeque<TaskPhase>,
    load_total: u64,
    load_progress: u64,
    store_total: u64,
    store_progress: u64,
    compute_remaining: u64,
    pe_arrays_requested: u64,
    pe_cycles_per_tile: u64,
    pe_wave_cycle: u64,
    spu_remaining: u64,
    spu_clusters_needed: u64,
    vpu_remaining: u64,
    vpu_units_needed: u64,
    mac_count: u64,
    reserved_activation: u64,
    reserved_weights: u64,
    reserved_target: u64,
}

impl ClusterTask {
    fn current_phase(&self) -> Option<TaskPhase> {
        self.phases.front().copied()
    }
}

/// Dynamic-energy coefficients, snapshotted from config at construction.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EnergyParams {
    pub pe_mac_pj: f64,
    pub spu_op_pj: f64,
    pub vpu_op_pj: f64,
    pub sram_byte_pj: f64,
}

/// Op-count and energy totals a cluster accumulates over its lifetime.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClusterTotals {
    pub executed_tasks: u64,
    pub mac_count: u64,
    pub scalar_ops: u64,
    pub vector_ops: u64,
    pub special_ops: u64,
    pub vpu_ops: u64,
    pub pe_energy_pj: f64,
    pub spu_energy_pj: f64,
    pub vpu_energy_pj: f64,
    pub sram_energy_pj: f64,
}

/// Per-cycle activity, reset by the owning chiplet at the top of each tick.
#[derive(Debug, Default, Clone, Copy)]
pub struct CycleActivity {
    pub load_bytes: u64,
    pub store_bytes: u64,
    pub pe_active: u64,
    pub spu_active: u64,
    pub vpu_active: u64,
    pub tasks_completed: u64,
}

pub struct ComputeCluster {
    index: usize,
    pes: Vec<PeArray>,
    spus: Vec<SpuCluster>,
    vpus: Vec<VpuUnit>,
    pub activation: Buffer,
    pub weights: Buffer,
    pub scratch: Buffer,
    load_bandwidth: u64,
    store_bandwidth: u64,
    energy: EnergyParams,
    tasks: HashMap<u64, ClusterTask>,
    next_task_id: u64,
    waiting: HashMap<DigitalUnit, VecDeque<u64>>,
    load_active: Vec<u64>,
    compute_active: Vec<u64>,
    store_active: Vec<u64>,
    spu_active: Vec<u64>,
    vpu_active: Vec<u64>,
    pub totals: ClusterTotals,
    pub cycle: CycleActivity,
    pending_tasks: u64,
}

impl ComputeCluster {
    pub fn new(index: usize, cfg: &SimConfig, pe_arrays: u32, spu_clusters: u32) -> Self {
        let pes = (0..pe_arrays.max(1))
            .map(|_| PeArray::new(u64::from(cfg.pe_rows), u64::from(cfg.pe_cols)))
            .collect();
        let spus = (0..spu_clusters.max(1))
            .map(|_| {
                SpuCluster::new(
                    cfg.spu_scalar_throughput,
                    cfg.spu_vector_throughput,
                    cfg.spu_special_latency,
                )
            })
            .collect();
        let vpus = (0..cfg.vpu_units_per_cluster.max(1))
            .map(|_| VpuUnit::new(cfg.vpu_vector_throughput))
            .collect();
        let mut waiting = HashMap::new();
        for unit in [
            DigitalUnit::Pe,
            DigitalUnit::Spu,
            DigitalUnit::Vpu,
            DigitalUnit::Buffer,
            DigitalUnit::Barrier,
            DigitalUnit::Misc,
        ] {
            waiting.insert(unit, VecDeque::new());
        }
        Self {
            index,
            pes,
            spus,
            vpus,
            activation: Buffer::new("activation", cfg.digital_activation_bytes, cfg.load_bandwidth_bytes),
            weights: Buffer::new("weights", cfg.digital_weight_bytes, cfg.load_bandwidth_bytes),
            scratch: Buffer::new("scratch", cfg.digital_scratch_bytes, cfg.store_bandwidth_bytes),
            load_bandwidth: cfg.load_bandwidth_bytes.max(1),
            store_bandwidth: cfg.store_bandwidth_bytes.max(1),
            energy: EnergyParams {
                pe_mac_pj: cfg.pe_mac_energy_pj,
                spu_op_pj: cfg.spu_op_energy_pj,
                vpu_op_pj: cfg.vpu_op_energy_pj,
                sram_byte_pj: cfg.sram_access_energy_pj_per_byte,
            },
            tasks: HashMap::new(),
            next_task_id: 0,
            waiting,
            load_active: Vec::new(),
            compute_active: Vec::new(),
            store_active: Vec::new(),
            spu_active: Vec::new(),
            vpu_active: Vec::new(),
            totals: ClusterTotals::default(),
            cycle: CycleActivity::default(),
            pending_tasks: 0,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn pe_count(&self) -> u64 {
        self.pes.len() as u64
    }

    /// Waiting + in-flight tasks; submission picks the shallowest cluster.
    pub fn queue_depth(&self) -> usize {
        self.tasks.len()
    }

    pub fn pending_tasks(&self) -> u64 {
        self.pending_tasks
    }

    pub fn fits(&self, desc: &DigitalTaskDesc) -> bool {
        desc.input_bytes <= self.activation.capacity()
            && desc.weight_bytes <= self.weights.capacity()
            && desc.output_bytes <= self.target_buffer(desc.target_buffer).capacity()
    }

    fn target_buffer(&self, kind: BufferKind) -> &Buffer {
        match kind {
            BufferKind::Activation => &self.activation,
            BufferKind::Weights => &self.weights,
            BufferKind::Scratch => &self.scratch,
        }
    }

    fn target_buffer_mut(&mut self, kind: BufferKind) -> &mut Buffer {
        match kind {
            BufferKind::Activation => &mut self.activation,
            BufferKind::Weights => &mut self.weights,
            BufferKind::Scratch => &mut self.scratch,
        }
    }

    pub fn buffer(&self, kind: BufferKind) -> &Buffer {
        self.target_buffer(kind)
    }

    pub fn buffer_mut(&mut self, kind: BufferKind) -> &mut Buffer {
        self.target_buffer_mut(kind)
    }

    /// Build the internal task for a descriptor and queue it on the unit the
    /// descriptor calls for. Queuing never fails; reservation happens at
    /// promotion time.
    pub fn enqueue(&mut self, desc: DigitalTaskDesc) {
        let task = self.build_task(desc);
        let unit = Self::queue_for(&task);
        let id = self.next_task_id;
        self.next_task_id += 1;
        self.tasks.insert(id, task);
        self.waiting.get_mut(&unit).expect("queue exists").push_back(id);
        self.pending_tasks += 1;
    }

    /// Legacy path: a compute-only task that spins for `latency` cycles.
    pub fn enqueue_legacy(&mut self, latency: u64) {
        let desc = DigitalTaskDesc {
            requires_pe: true,
            ..DigitalTaskDesc::default()
        };
        let mut task = self.build_task(desc);
        task.phases = VecDeque::from([TaskPhase::Compute]);
        task.compute_remaining = latency.max(1);
        task.pe_arrays_requested = 1;
        task.pe_cycles_per_tile = latency.max(1);
        task.mac_count = 0;
        let id = self.next_task_id;
        self.next_task_id += 1;
        self.tasks.insert(id, task);
        self.waiting
            .get_mut(&DigitalUnit::Pe)
            .expect("queue exists")
            .push_back(id);
        self.pending_tasks += 1;
    }

    fn queue_for(task: &ClusterTask) -> DigitalUnit {
        match task.desc.unit_hint {
            DigitalUnit::Buffer => DigitalUnit::Buffer,
            DigitalUnit::Barrier => DigitalUnit::Barrier,
            _ if task.desc.requires_pe => DigitalUnit::Pe,
            _ if task.desc.requires_spu => DigitalUnit::Spu,
            _ if task.desc.requires_vpu => DigitalUnit::Vpu,
            _ => DigitalUnit::Misc,
        }
    }

    fn build_task(&self, desc: DigitalTaskDesc) -> ClusterTask {
        let mut phases = VecDeque::new();
        match desc.unit_hint {
            DigitalUnit::Buffer => {
                if desc.output_bytes > 0 || desc.input_bytes > 0 {
                    // Release descriptors carry bytes in input; allocs in output.
                    if desc.input_bytes > 0 {
                        phases.push_back(TaskPhase::BufferRelease);
                    } else {
                        phases.push_back(TaskPhase::BufferAlloc);
                    }
                } else {
                    phases.push_back(TaskPhase::BufferAlloc);
                }
            }
            DigitalUnit::Barrier => phases.push_back(TaskPhase::Barrier),
            _ => {
                if desc.input_bytes + desc.weight_bytes > 0 {
                    phases.push_back(TaskPhase::Load);
                }
                if desc.requires_pe {
                    phases.push_back(TaskPhase::Compute);
                }
                if desc.output_bytes > 0 {
                    phases.push_back(TaskPhase::Store);
                }
                // Vector pipeline drains before the scalar cluster picks up.
                if desc.requires_vpu {
                    phases.push_back(TaskPhase::Vpu);
                }
                if desc.requires_spu {
                    phases.push_back(TaskPhase::Spu);
                }
                if phases.is_empty() {
                    phases.push_back(TaskPhase::Barrier);
                }
            }
        }

        let load_total = desc.input_bytes + desc.weight_bytes;
        let store_total = desc.output_bytes;

        let (compute_remaining, pe_arrays_requested, pe_cycles_per_tile, mac_count) =
            if desc.requires_pe {
                self.estimate_pe(&desc)
            } else {
                (0, 0, 0, 0)
            };
        let (spu_remaining, spu_clusters_needed) = if desc.requires_spu {
            self.estimate_spu(&desc)
        } else {
            (0, 0)
        };
        let (vpu_remaining, vpu_units_needed, vpu_ops) = if desc.requires_vpu {
            self.estimate_vpu(&desc)
        } else {
            (0, 0, desc.vpu_ops)
        };

        let mut desc = desc;
        desc.vpu_ops = vpu_ops;

        ClusterTask {
            desc,
            phases,
            load_total,
            load_progress: 0,
            store_total,
            store_progress: 0,
            compute_remaining,
            pe_arrays_requested,
            pe_cycles_per_tile,
            pe_wave_cycle: 0,
            spu_remaining,
            spu_clusters_needed,
            vpu_remaining,
            vpu_units_needed,
            mac_count,
            reserved_activation: 0,
            reserved_weights: 0,
            reserved_target: 0,
        }
    }

    /// Tile the problem across PE arrays in waves.
    fn estimate_pe(&self, desc: &DigitalTaskDesc) -> (u64, u64, u64, u64) {
        let m = desc.m.max(1);
        let n = desc.n.max(1);
        let k = desc.k.max(1);
        let tile_m = desc.tile_m.max(1).min(m);
        let tile_n = desc.tile_n.max(1).min(n);
        let tile_k = desc.tile_k.max(1).min(k);
        let tiles = m.div_ceil(tile_m) * n.div_ceil(tile_n);
        let cycles_per_tile = self.pes[0].estimate_matmul_cycles(tile_m, tile_n, tile_k);
        let concurrency = desc.pe_concurrency.unwrap_or(u64::MAX).max(1);
        let arrays = self.pe_count().min(concurrency).min(tiles).max(1);
        let waves = tiles.div_ceil(arrays);
        (waves * cycles_per_tile, arrays, cycles_per_tile, m * n * k)
    }

    fn estimate_spu(&self, desc: &DigitalTaskDesc) -> (u64, u64) {
        let count = self.spus.len() as u64;
        let spu = &self.spus[0];
        let scalar_cycles = desc.scalar_ops.div_ceil(count * spu.scalar_throughput);
        let vector_cycles = desc.vector_ops.div_ceil(count * spu.vector_throughput);
        let special_waves = desc.special_ops.div_ceil(count);
        let special_cycles = special_waves * spu.special_latency;
        let mut cycles = scalar_cycles.max(vector_cycles).max(special_cycles).max(1);

        // Register-pressure penalty past the soft file limit.
        let reg_accesses = desc.scalar_ops + desc.vector_ops;
        let threshold = count * 32;
        if reg_accesses > threshold {
            cycles += (reg_accesses - threshold).div_ceil(16);
        }

        let needed_scalar = desc.scalar_ops.div_ceil(spu.scalar_throughput * cycles);
        let needed_vector = desc.vector_ops.div_ceil(spu.vector_throughput * cycles);
        let needed = needed_scalar.max(needed_vector).clamp(1, count);
        (cycles, needed)
    }

    fn estimate_vpu(&self, desc: &DigitalTaskDesc) -> (u64, u64, u64) {
        let count = self.vpus.len() as u64;
        let tp = self.vpus[0].vector_throughput;
        let ops = if desc.vpu_ops > 0 {
            desc.vpu_ops
        } else {
            desc.output_bytes / 2
        };
        let cycles = ops.div_ceil(count * tp).max(1);
        let needed = ops.div_ceil(tp * cycles).clamp(1, count);
        (cycles, needed, ops)
    }

    /// One cluster cycle: promote waiting tasks whose buffers fit, then run
    /// the phase processors in pipeline order. The order is observable through
    /// the per-cycle activity counters and must stay load -> compute -> store ->
    /// SPU -> VPU.
    pub fn tick(&mut self) {
        self.promote_waiting();
        self.process_load();
        self.process_compute();
        self.process_store();
        self.process_spu();
        self.process_vpu();
    }

    fn promote_waiting(&mut self) {
        let order = [
            DigitalUnit::Pe,
            DigitalUnit::Spu,
            DigitalUnit::Vpu,
            DigitalUnit::Buffer,
            DigitalUnit::Barrier,
            DigitalUnit::Misc,
        ];
        for unit in order {
            loop {
                let Some(&id) = self.waiting.get(&unit).and_then(VecDeque::front) else {
                    break;
                };
                if !self.try_activate(id) {
                    break;
                }
                self.waiting.get_mut(&unit).expect("queue exists").pop_front();
            }
        }
    }

    /// Reserve buffers for a waiting task and move it onto the active list of
    /// its first phase. A partial reservation is rolled back and the task
    /// stays queued for the next tick.
    fn try_activate(&mut self, id: u64) -> bool {
        let Some(task) = self.tasks.get(&id) else {
            return false;
        };
        let input = task.desc.input_bytes;
        let weight = task.desc.weight_bytes;
        let output = task.desc.output_bytes;
        let target = task.desc.target_buffer;
        let phase = task.current_phase();

        match phase {
            Some(TaskPhase::BufferAlloc) => {
                let bytes = output.max(input);
                if !self.target_buffer_mut(target).reserve(bytes) {
                    return false;
                }
                self.finish_task(id);
                return true;
            }
            Some(TaskPhase::BufferRelease) => {
                let bytes = input.max(output);
                self.target_buffer_mut(target).release(bytes);
                self.finish_task(id);
                return true;
            }
            Some(TaskPhase::Barrier) => {
                self.finish_task(id);
                return true;
            }
            _ => {}
        }

        if !self.activation.reserve(input) {
            return false;
        }
        if !self.weights.reserve(weight) {
            self.activation.release(input);
            return false;
        }
        if !self.target_buffer_mut(target).reserve(output) {
            self.activation.release(input);
            self.weights.release(weight);
            return false;
        }

        let task = self.tasks.get_mut(&id).expect("task exists");
        task.reserved_activation = input;
        task.reserved_weights = weight;
        task.reserved_target = output;
        let phase = task.current_phase().expect("active task has a phase");
        self.activate_phase(id, phase);
        true
    }

    fn activate_phase(&mut self, id: u64, phase: TaskPhase) {
        match phase {
            TaskPhase::Load => self.load_active.push(id),
            TaskPhase::Compute => self.compute_active.push(id),
            TaskPhase::Store => self.store_active.push(id),
            TaskPhase::Spu => self.spu_active.push(id),
            TaskPhase::Vpu => self.vpu_active.push(id),
            TaskPhase::BufferAlloc | TaskPhase::BufferRelease | TaskPhase::Barrier => {
                self.finish_task(id)
            }
        }
    }

    /// Pop the finished phase and enter the next one, or finalize.
    fn schedule_next_phase(&mut self, id: u64) {
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        task.phases.pop_front();
        match task.phases.front().copied() {
            Some(next) => self.activate_phase(id, next),
            None => self.finish_task(id),
        }
    }

    fn finish_task(&mut self, id: u64) {
        let Some(task) = self.tasks.remove(&id) else {
            return;
        };
        self.activation.release(task.reserved_activation);
        self.weights.release(task.reserved_weights);
        self.target_buffer_mut(task.desc.target_buffer)
            .release(task.reserved_target);

        self.totals.executed_tasks += 1;
        self.totals.mac_count += task.mac_count;
        self.totals.scalar_ops += task.desc.scalar_ops;
        self.totals.vector_ops += task.desc.vector_ops;
        self.totals.special_ops += task.desc.special_ops;
        self.totals.vpu_ops += task.desc.vpu_ops;
        self.totals.pe_energy_pj += task.mac_count as f64 * self.energy.pe_mac_pj;
        self.totals.spu_energy_pj += (task.desc.scalar_ops
            + task.desc.vector_ops
            + task.desc.special_ops) as f64
            * self.energy.spu_op_pj;
        self.totals.vpu_energy_pj += task.desc.vpu_ops as f64 * self.energy.vpu_op_pj;

        self.cycle.tasks_completed += 1;
        self.pending_tasks = self.pending_tasks.saturating_sub(1);
        debug!(cluster = self.index, task = id, "digital task retired");
    }

    fn process_load(&mut self) {
        let mut budget = self.load_bandwidth;
        let ids: Vec<u64> = self.load_active.clone();
        let mut done = Vec::new();
        for id in ids {
            if budget == 0 {
                break;
            }
            let Some(task) = self.tasks.get_mut(&id) else {
                done.push(id);
                continue;
            };
            let remaining = task.load_total - task.load_progress;
            let grant = remaining.min(budget);
            task.load_progress += grant;
            budget -= grant;
            self.cycle.load_bytes += grant;
            if task.load_progress >= task.load_total {
                let total = task.load_total;
                self.totals.sram_energy_pj += total as f64 * self.energy.sram_byte_pj;
                done.push(id);
            }
        }
        for id in done {
            self.load_active.retain(|&t| t != id);
            self.schedule_next_phase(id);
        }
    }

    fn process_compute(&mut self) {
        let capacity = self.pe_count();
        let ids: Vec<u64> = self.compute_active.clone();
        let mut used = 0u64;
        let mut done = Vec::new();
        for id in ids {
            let Some(task) = self.tasks.get_mut(&id) else {
                done.push(id);
                continue;
            };
            if used + task.pe_arrays_requested > capacity {
                continue;
            }
            used += task.pe_arrays_requested;
            self.cycle.pe_active += task.pe_arrays_requested;
            task.compute_remaining = task.compute_remaining.saturating_sub(1);
            task.pe_wave_cycle += 1;
            if task.pe_wave_cycle >= task.pe_cycles_per_tile {
                task.pe_wave_cycle = 0;
            }
            if task.compute_remaining == 0 {
                done.push(id);
            }
        }
        for id in done {
            self.compute_active.retain(|&t| t != id);
            self.schedule_next_phase(id);
        }
    }

    fn process_store(&mut self) {
        let mut budget = self.store_bandwidth;
        let ids: Vec<u64> = self.store_active.clone();
        let mut done = Vec::new();
        let mut releases: Vec<(BufferKind, u64)> = Vec::new();
        for id in ids {
            if budget == 0 {
                break;
            }
            let Some(task) = self.tasks.get_mut(&id) else {
                done.push(id);
                continue;
            };
            let remaining = task.store_total - task.store_progress;
            let grant = remaining.min(budget);
            task.store_progress += grant;
            budget -= grant;
            self.cycle.store_bytes += grant;
            // Written-back bytes leave the target buffer as they drain.
            let release = grant.min(task.reserved_target);
            task.reserved_target -= release;
            releases.push((task.desc.target_buffer, release));
            if task.store_progress >= task.store_total {
                let total = task.store_total;
                self.totals.sram_energy_pj += total as f64 * self.energy.sram_byte_pj;
                done.push(id);
            }
        }
        for (kind, bytes) in releases {
            self.target_buffer_mut(kind).release(bytes);
        }
        for id in done {
            self.store_active.retain(|&t| t != id);
            self.schedule_next_phase(id);
        }
    }

    fn process_spu(&mut self) {
        let capacity = self.spus.len() as u64;
        let ids: Vec<u64> = self.spu_active.clone();
        let mut used = 0u64;
        let mut done = Vec::new();
        for id in ids {
            let Some(task) = self.tasks.get_mut(&id) else {
                done.push(id);
                continue;
            };
            if used + task.spu_clusters_needed > capacity {
                continue;
            }
            used += task.spu_clusters_needed;
            self.cycle.spu_active += task.spu_clusters_needed;
            task.spu_remaining = task.spu_remaining.saturating_sub(1);
            if task.spu_remaining == 0 {
                done.push(id);
            }
        }
        for id in done {
            self.spu_active.retain(|&t| t != id);
            self.schedule_next_phase(id);
        }
    }

    fn process_vpu(&mut self) {
        let capacity = self.vpus.len() as u64;
        let ids: Vec<u64> = self.vpu_active.clone();
        let mut used = 0u64;
        let mut done = Vec::new();
        for id in ids {
            let Some(task) = self.tasks.get_mut(&id) else {
                done.push(id);
                continue;
            };
            if used + task.vpu_units_needed > capacity {
                continue;
            }
            used += task.vpu_units_needed;
            self.cycle.vpu_active += task.vpu_units_needed;
            task.vpu_remaining = task.vpu_remaining.saturating_sub(1);
            if task.vpu_remaining == 0 {
                done.push(id);
            }
        }
        for id in done {
            self.vpu_active.retain(|&t| t != id);
            self.schedule_next_phase(id);
        }
    }
}
