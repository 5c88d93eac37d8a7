//! Transfer handling: buffer choreography between chiplets (and the host),
//! with all-or-nothing rollback, KV cache consultation, latency estimation
//! and interconnect back-pressure.

use tracing::{debug, warn};

use tessera_estimators::{DmaDirection, NocCycleEstimator};
use tessera_rram::RramBufferKind;
use tessera_types::{BufferKind, CommandKind, MetaMapExt, Target, Task};

use crate::kv::{KvKey, KvOp};
use crate::platform::ChipletPlatform;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    ToRram,
    ToDigital,
    HostToDigital,
    DigitalToHost,
}

/// Inverse operations, applied in reverse order when a later step fails.
enum Undo {
    Digital {
        index: usize,
        kind: BufferKind,
        delta: i64,
    },
    Rram {
        index: usize,
        kind: RramBufferKind,
        delta: i64,
    },
    InputBuffered {
        index: usize,
        previous: u64,
    },
    OutputBuffered {
        index: usize,
        previous: u64,
    },
}

impl ChipletPlatform {
    fn transfer_direction(task: &Task) -> Direction {
        match task.opcode {
            CommandKind::XferHost2d => Direction::HostToDigital,
            CommandKind::XferD2host => Direction::DigitalToHost,
            CommandKind::XferC2d => Direction::ToDigital,
            CommandKind::XferD2c => Direction::ToRram,
            _ => {
                if let Some(stage) = task.payload.stage() {
                    if stage == "transfer_to_digital" {
                        return Direction::ToDigital;
                    }
                    return Direction::ToRram;
                }
                if task.command().is_some_and(|c| c.rram_to_digital()) {
                    Direction::ToDigital
                } else {
                    Direction::ToRram
                }
            }
        }
    }

    fn rollback(&mut self, journal: Vec<Undo>) {
        for undo in journal.into_iter().rev() {
            match undo {
                Undo::Digital { index, kind, delta } => {
                    self.digital[index].adjust_buffer(kind, delta);
                }
                Undo::Rram { index, kind, delta } => {
                    self.rram[index].adjust_buffer(kind, delta);
                }
                Undo::InputBuffered { index, previous } => {
                    self.rram_input_buffered[index] = previous;
                }
                Undo::OutputBuffered { index, previous } => {
                    self.rram_output_buffered[index] = previous;
                }
            }
        }
    }

    fn transfer_failed(&mut self, journal: Vec<Undo>, what: &str) {
        self.rollback(journal);
        // Two extra interconnect cycles of throttle per failed reservation.
        self.transfer_throttle_until += 2;
        self.totals.transfer_throttle_events_total += 1;
        self.cycle_counters.throttle_events += 1;
        warn!(what, "transfer reservation failed, rolled back and throttled");
    }

    pub(crate) fn dispatch_transfer(&mut self, task: &Task) {
        let direction = Self::transfer_direction(task);
        let bytes = if task.request_bytes > 0 {
            task.request_bytes
        } else {
            1024
        };

        let src_digital = task.metadata.int_or("src_digital", -1);
        let dst_digital = task.metadata.int_or("dst_digital", -1);
        let src_rram = task.metadata.int_or("src_rram", -1);
        let dst_rram = task.metadata.int_or("dst_rram", -1);

        let digital_index = |id: i64, len: usize| -> usize {
            if id >= 0 && (id as usize) < len {
                id as usize
            } else {
                0
            }
        };

        let mut journal: Vec<Undo> = Vec::new();

        match direction {
            Direction::ToRram => {
                let src = digital_index(src_digital, self.digital.len());
                let dst = digital_index(dst_rram, self.rram.len());

                let scratch_usage = self.digital[src].buffer_usage(BufferKind::Scratch);
                let released = bytes.min(scratch_usage);
                if released > 0 {
                    if !self.digital[src].adjust_buffer(BufferKind::Scratch, -(released as i64)) {
                        self.transfer_failed(journal, "digital scratch release");
                        return;
                    }
                    journal.push(Undo::Digital {
                        index: src,
                        kind: BufferKind::Scratch,
                        delta: released as i64,
                    });
                }

                if !self.rram[dst].adjust_buffer(RramBufferKind::Input, bytes as i64) {
                    self.cycle_counters.deferrals += 1;
                    self.totals.deferrals_total += 1;
                    self.transfer_failed(journal, "rram input reserve");
                    return;
                }
                journal.push(Undo::Rram {
                    index: dst,
                    kind: RramBufferKind::Input,
                    delta: -(bytes as i64),
                });
                journal.push(Undo::InputBuffered {
                    index: dst,
                    previous: self.rram_input_buffered[dst],
                });
                self.rram_input_buffered[dst] += bytes;

                self.totals.transfer_to_rram_bytes += bytes;
                self.finish_transfer(task, direction, bytes, src as i64, dst as i64);
            }
            Direction::ToDigital => {
                let src = digital_index(src_rram, self.rram.len());
                let dst = digital_index(dst_digital, self.digital.len());

                let output_usage = self.rram[src].buffer_occupancy(RramBufferKind::Output);
                let released = bytes.min(output_usage);
                if released > 0 {
                    if !self.rram[src].adjust_buffer(RramBufferKind::Output, -(released as i64)) {
                        self.transfer_failed(journal, "rram output release");
                        return;
                    }
                    journal.push(Undo::Rram {
                        index: src,
                        kind: RramBufferKind::Output,
                        delta: released as i64,
                    });
                    journal.push(Undo::OutputBuffered {
                        index: src,
                        previous: self.rram_output_buffered[src],
                    });
                    self.rram_output_buffered[src] =
                        self.rram_output_buffered[src].saturating_sub(released);
                }

                if !self.digital[dst].adjust_buffer(BufferKind::Scratch, bytes as i64) {
                    self.cycle_counters.deferrals += 1;
                    self.totals.deferrals_total += 1;
                    self.transfer_failed(journal, "digital scratch reserve");
                    return;
                }

                self.totals.transfer_to_digital_bytes += bytes;
                self.finish_transfer(task, direction, bytes, src as i64, dst as i64);
            }
            Direction::HostToDigital => {
                let dst = digital_index(dst_digital, self.digital.len());
                if !self.digital[dst].adjust_buffer(BufferKind::Activation, bytes as i64) {
                    self.cycle_counters.deferrals += 1;
                    self.totals.deferrals_total += 1;
                    self.transfer_failed(journal, "digital activation reserve");
                    return;
                }
                self.totals.transfer_host_load_bytes += bytes;
                self.cycle_counters.host_dma_load_bytes += bytes;
                self.finish_transfer(task, direction, bytes, -1, dst as i64);
            }
            Direction::DigitalToHost => {
                let src = digital_index(src_digital, self.digital.len());
                let usage = self.digital[src].buffer_usage(BufferKind::Activation);
                let released = bytes.min(usage);
                if released > 0
                    && !self.digital[src].adjust_buffer(BufferKind::Activation, -(released as i64))
                {
                    self.transfer_failed(journal, "digital activation release");
                    return;
                }
                self.totals.transfer_host_store_bytes += bytes;
                self.cycle_counters.host_dma_store_bytes += bytes;
                self.finish_transfer(task, direction, bytes, src as i64, -1);
            }
        }
    }

    /// Success path: KV cache, hop/energy accounting, latency estimation and
    /// throttle extension.
    fn finish_transfer(
        &mut self,
        task: &Task,
        direction: Direction,
        bytes: u64,
        src: i64,
        dst: i64,
    ) {
        let is_host = matches!(
            direction,
            Direction::HostToDigital | Direction::DigitalToHost
        );
        if is_host {
            self.consult_kv(task, direction, bytes);
        }

        let hops = {
            let meta_hops = task.metadata.int_or("transfer_hops", 0);
            if meta_hops > 0 {
                meta_hops as u64
            } else {
                match direction {
                    Direction::ToRram => self
                        .topology
                        .cross_hop_distance(src.max(0) as u32, dst.max(0) as u32),
                    Direction::ToDigital => self
                        .topology
                        .cross_hop_distance(dst.max(0) as u32, src.max(0) as u32),
                    _ => 1,
                }
                .max(1)
            }
        };

        let (energy, hop_weight) = match direction {
            Direction::ToDigital => (
                &mut self.totals.rram_interconnect_energy_pj,
                self.cfg.rram_hop_energy_pj_per_byte,
            ),
            _ => (
                &mut self.totals.pe_interconnect_energy_pj,
                self.cfg.pe_hop_energy_pj_per_byte,
            ),
        };
        *energy += bytes as f64 * hops as f64 * hop_weight;

        let estimated = if is_host {
            let cycles = self.dma.estimate_cycles(bytes, hops, &task.metadata);
            let dma_dir = if direction == Direction::HostToDigital {
                DmaDirection::HostToDigital
            } else {
                DmaDirection::DigitalToHost
            };
            self.dma.record(dma_dir, bytes, hops);
            cycles
        } else {
            let num_digital = self.digital.len() as u64;
            let (src_node, dst_node) = match direction {
                Direction::ToRram => (src.max(0) as u64, num_digital + dst.max(0) as u64),
                _ => (num_digital + src.max(0) as u64, dst.max(0) as u64),
            };
            let external = self
                .noc
                .as_mut()
                .and_then(|noc| noc.estimate(src_node, dst_node, bytes, &task.metadata));
            match external {
                Some(cycles) => cycles.max(1),
                None => {
                    let bandwidth = match direction {
                        Direction::ToRram => self.cfg.d2r_bandwidth_bytes.max(1),
                        _ => self.cfg.r2d_bandwidth_bytes.max(1),
                    };
                    bytes.div_ceil(bandwidth) + hops
                }
            }
        };

        // Back-pressure: the link is considered busy for the estimate.
        self.transfer_throttle_until += estimated;

        self.cycle_counters.transfer_exec += 1;
        self.cycle_counters.transfer_bytes += bytes;
        self.cycle_counters.transfer_hops += hops;
        self.totals.transfer_tasks_executed += 1;
        self.totals.total_transfer_bytes += bytes;
        self.totals.total_transfer_hops += hops;
        debug!(
            node = task.node_id,
            ?direction,
            bytes,
            hops,
            estimated,
            "transfer executed"
        );
    }

    fn consult_kv(&mut self, task: &Task, direction: Direction, bytes: u64) {
        let meta = &task.metadata;
        let op = match meta.str_of("kv_op") {
            Some("load") => KvOp::Load,
            Some("store") => KvOp::Store,
            _ => {
                if direction == Direction::HostToDigital {
                    KvOp::Load
                } else {
                    KvOp::Store
                }
            }
        };
        let key = match meta.str_of("kv_key") {
            Some(name) => KvKey::Named(name.to_owned()),
            None => KvKey::Coords {
                layer: meta.int_or("layer", 0),
                head: meta.int_or("head", 0),
                sequence: meta.int_or("sequence", 0),
                token: meta.int_or("token", 0),
                batch: meta.int_or("batch", 0),
            },
        };
        let before = self.kv.counters();
        self.kv.access(key, op, bytes);
        let after = self.kv.counters();
        self.cycle_counters.kv_hits += after.hits - before.hits;
        self.cycle_counters.kv_misses += after.misses - before.misses;
        self.cycle_counters.kv_load_bytes += after.load_bytes - before.load_bytes;
        self.cycle_counters.kv_store_bytes += after.store_bytes - before.store_bytes;
    }
}
