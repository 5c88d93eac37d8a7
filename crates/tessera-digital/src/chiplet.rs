//! Digital chiplet: a cluster-partitioned container of PE arrays, SPU/VPU
//! units and SRAM buffers.

use tessera_config::SimConfig;
use tessera_types::{BufferKind, DigitalTaskDesc};
use tracing::trace;

use crate::cluster::{ComputeCluster, CycleActivity};

/// Lifetime counters aggregated across clusters, read by the stats writers.
#[derive(Debug, Default, Clone, Copy)]
pub struct DigitalTotals {
    pub submitted_tasks: u64,
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
    pub static_energy_pj: f64,
}

pub struct DigitalChiplet {
    id: u32,
    clusters: Vec<ComputeCluster>,
    rr_next: usize,
    static_power_pj_per_cycle: f64,
    static_energy_pj: f64,
    submitted_tasks: u64,
    /// Per-cycle aggregate, reset at the top of every [`DigitalChiplet::tick`].
    pub cycle: CycleActivity,
}

impl DigitalChiplet {
    pub fn new(id: u32, cfg: &SimConfig) -> Self {
        let cluster_count = cfg.clusters_per_chiplet();
        let pes_per_cluster = (cfg.pe_arrays_per_chiplet / cluster_count).max(1);
        let spus_per_cluster = (cfg.spu_clusters_per_chiplet / cluster_count).max(1);
        let clusters = (0..cluster_count)
            .map(|i| ComputeCluster::new(i as usize, cfg, pes_per_cluster, spus_per_cluster))
            .collect();
        Self {
            id,
            clusters,
            rr_next: 0,
            static_power_pj_per_cycle: cfg.digital_static_power_pj_per_cycle,
            static_energy_pj: 0.0,
            submitted_tasks: 0,
            cycle: CycleActivity::default(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn num_clusters(&self) -> usize {
        self.clusters.len()
    }

    pub fn cluster(&self, index: usize) -> Option<&ComputeCluster> {
        self.clusters.get(index)
    }

    pub fn pending_tasks(&self) -> u64 {
        self.clusters.iter().map(ComputeCluster::pending_tasks).sum()
    }

    /// Route a descriptor to a cluster and queue it. The explicit preference
    /// wins when valid; otherwise the shallowest queue among clusters whose
    /// buffers could ever hold the task; otherwise cluster 0, where the task
    /// waits until something drains.
    pub fn submit_descriptor(&mut self, desc: DigitalTaskDesc) -> bool {
        let index = match desc.preferred_cluster {
            Some(i) if i < self.clusters.len() => i,
            _ => self
                .clusters
                .iter()
                .filter(|c| c.fits(&desc))
                .min_by_key(|c| c.queue_depth())
                .map(|c| c.index())
                .unwrap_or(0),
        };
        trace!(chiplet = self.id, cluster = index, "submit digital descriptor");
        self.clusters[index].enqueue(desc);
        self.submitted_tasks += 1;
        true
    }

    /// Legacy latency-only path; round-robins across clusters, never fails.
    pub fn schedule_task(&mut self, latency: u64) {
        let index = self.rr_next % self.clusters.len();
        self.rr_next = self.rr_next.wrapping_add(1);
        self.clusters[index].enqueue_legacy(latency);
        self.submitted_tasks += 1;
    }

    /// One digital-domain cycle across every cluster.
    pub fn tick(&mut self) {
        self.cycle = CycleActivity::default();
        for cluster in &mut self.clusters {
            cluster.cycle = CycleActivity::default();
            cluster.tick();
            let c = cluster.cycle;
            self.cycle.load_bytes += c.load_bytes;
            self.cycle.store_bytes += c.store_bytes;
            self.cycle.pe_active += c.pe_active;
            self.cycle.spu_active += c.spu_active;
            self.cycle.vpu_active += c.vpu_active;
            self.cycle.tasks_completed += c.tasks_completed;
        }
    }

    /// Static leakage, charged by the platform per digital tick.
    pub fn add_static_energy(&mut self, ticks: u64) {
        self.static_energy_pj += ticks as f64 * self.static_power_pj_per_cycle;
    }

    /// External buffer adjustment (transfer handling). Negative deltas drain
    /// the fullest cluster; positive deltas fill the emptiest. Returns false
    /// without changes when no cluster can absorb the delta.
    pub fn adjust_buffer(&mut self, kind: BufferKind, delta: i64) -> bool {
        if self.clusters.is_empty() {
            return false;
        }
        let index = if delta < 0 {
            (0..self.clusters.len())
                .max_by_key(|&i| self.clusters[i].buffer(kind).occupancy())
                .unwrap_or(0)
        } else {
            (0..self.clusters.len())
                .max_by_key(|&i| self.clusters[i].buffer(kind).free())
                .unwrap_or(0)
        };
        self.clusters[index].buffer_mut(kind).apply_delta(delta)
    }

    /// Occupancy across clusters, used by transfer handling to clamp releases.
    pub fn buffer_usage(&self, kind: BufferKind) -> u64 {
        self.clusters.iter().map(|c| c.buffer(kind).occupancy()).sum()
    }

    pub fn totals(&self) -> DigitalTotals {
        let mut t = DigitalTotals {
            submitted_tasks: self.submitted_tasks,
            static_energy_pj: self.static_energy_pj,
            ..DigitalTotals::default()
        };
        for c in &self.clusters {
            let ct = c.totals;
            t.executed_tasks += ct.executed_tasks;
            t.mac_count += ct.mac_count;
            t.scalar_ops += ct.scalar_ops;
            t.vector_ops += ct.vector_ops;
            t.special_ops += ct.special_ops;
            t.vpu_ops += ct.vpu_ops;
            t.pe_energy_pj += ct.pe_energy_pj;
            t.spu_energy_pj += ct.spu_energy_pj;
            t.vpu_energy_pj += ct.vpu_energy_pj;
            t.sram_energy_pj += ct.sram_energy_pj;
        }
        t
    }
}
