//! Task routing: every task the scheduler releases lands here, is handed to a
//! device model (or the transfer/host handlers), and is then reported back to
//! the orchestrator as complete.

use tracing::{debug, warn};

use tessera_types::{
    BufferKind, Command, CommandKind, DigitalTaskDesc, DigitalUnit, MetaMapExt, RramPhase,
    RramTaskSpec, Target, Task, WeightKey,
};

use crate::platform::{ChipletPlatform, GatingSnapshot};

fn first_positive(values: [i64; 3]) -> Option<u64> {
    values.into_iter().find(|&v| v > 0).map(|v| v as u64)
}

impl ChipletPlatform {
    pub(crate) fn resolve_digital_index(&self, task: &Task) -> Option<usize> {
        let id = task
            .metadata
            .int_or("chiplet_id", task.command().map_or(-1, |c| c.chiplet_id));
        let id = if id < 0 { 0 } else { id as usize };
        (id < self.digital.len()).then_some(id)
    }

    pub(crate) fn resolve_rram_index(&self, task: &Task) -> Option<usize> {
        let id = task
            .metadata
            .int_or("chiplet_id", task.command().map_or(-1, |c| c.chiplet_id));
        let id = if id < 0 { 0 } else { id as usize };
        (id < self.rram.len()).then_some(id)
    }

    /// Dispatch one task. Queue delay feeds back to the orchestrator as
    /// back-pressure before anything else happens.
    pub(crate) fn execute_task(&mut self, task: Task) {
        let wait = self.cycle.saturating_sub(task.enqueue_cycle);
        self.totals.wait_cycles_sum += wait;
        self.totals.wait_samples += 1;
        self.orchestrator.notify_backpressure(wait);

        match task.target {
            Target::Digital => self.dispatch_digital(&task),
            Target::Rram => self.dispatch_rram(&task),
            Target::Transfer => self.dispatch_transfer(&task),
            Target::Host => self.dispatch_host(&task),
        }

        self.orchestrator.notify_task_completion(task.node_id);
    }

    fn dispatch_digital(&mut self, task: &Task) {
        let Some(index) = self.resolve_digital_index(task) else {
            warn!(node = task.node_id, "digital task without a valid chiplet, dropping");
            self.totals.dropped_tasks += 1;
            return;
        };

        if let Some(cmd) = task.command() {
            match cmd.metadata.str_of("op") {
                Some("topk_select") => self.record_gating_snapshot(index as i64, cmd),
                Some("moe_barrier") => self.finish_moe_session(cmd),
                _ => {}
            }
        }

        let desc = self.build_digital_desc(task);
        let submitted = self.digital[index].submit_descriptor(desc);
        if !submitted {
            self.digital[index].schedule_task(task.latency);
        }
        self.cycle_counters.digital_exec += 1;
        self.totals.digital_tasks_executed += 1;
    }

    /// §Digital descriptor construction: problem shape from the aux words,
    /// tile shape from metadata with layered fallbacks, op-kind overrides for
    /// the scalar/vector/buffer special cases.
    fn build_digital_desc(&self, task: &Task) -> DigitalTaskDesc {
        let pe_rows = u64::from(self.cfg.pe_rows);
        let pe_cols = u64::from(self.cfg.pe_cols);

        let Some(cmd) = task.command() else {
            return self.stage_desc(task);
        };
        let meta = &cmd.metadata;

        let m = if cmd.aux0 > 0 { u64::from(cmd.aux0) } else { 128 };
        let n = if cmd.aux1 > 0 { u64::from(cmd.aux1) } else { 128 };
        let k = if cmd.aux2 > 0 { u64::from(cmd.aux2) } else { 128 };

        let tile_m = first_positive([meta.int_or("tile_m", 0), cmd.queue, 0])
            .unwrap_or_else(|| m.min(pe_rows));
        let tile_n = first_positive([meta.int_or("tile_n", 0), cmd.payload_addr, 0])
            .unwrap_or_else(|| n.min(pe_cols));
        let tile_k = first_positive([meta.int_or("tile_k", 0), cmd.payload_bytes, 0]).unwrap_or(k);

        let mut desc = DigitalTaskDesc {
            m,
            n,
            k,
            tile_m,
            tile_n,
            tile_k,
            input_bytes: m * k * 2,
            weight_bytes: k * n * 2,
            output_bytes: m * n * 2,
            requires_pe: true,
            target_buffer: BufferKind::Scratch,
            unit_hint: DigitalUnit::Pe,
            ..Default::default()
        };
        if let Some(pc) = first_positive([meta.int_or("pe_concurrency", 0), 0, 0]) {
            desc.pe_concurrency = Some(pc);
        }

        // Metadata-op specializations observed before the kind overrides.
        match meta.str_of("op") {
            Some("moe_gating_scores") => {
                let top_k = meta.int_or("top_k", 2).max(1) as u64;
                desc.requires_pe = false;
                desc.requires_spu = true;
                desc.unit_hint = DigitalUnit::Spu;
                desc.input_bytes = meta.int_or("activation_bytes", (m * n * 2) as i64) as u64;
                desc.weight_bytes = 0;
                desc.output_bytes = m * top_k * 2;
                desc.scalar_ops = meta.int_or("scalar_ops", (m * n) as i64) as u64;
                desc.vector_ops = meta.int_or("vector_ops", (m * n) as i64) as u64;
            }
            Some("topk_select") => {
                let top_k = meta.int_or("top_k", 2).max(1) as u64;
                desc.requires_pe = false;
                desc.requires_spu = true;
                desc.unit_hint = DigitalUnit::Spu;
                desc.input_bytes = m * n * 2;
                desc.weight_bytes = 0;
                desc.output_bytes = m * top_k * 2;
                desc.scalar_ops = m * top_k;
                desc.vector_ops = 0;
                desc.special_ops = 0;
            }
            _ => {}
        }

        match cmd.kind {
            CommandKind::PeAttentionHead => {
                // QK^T and AV occupy the arrays; the softmax between them
                // burns the scalar cluster.
                desc.requires_spu = true;
                desc.scalar_ops = m * n;
                desc.special_ops = m;
            }
            CommandKind::PeElementwise => {
                desc.requires_pe = false;
                desc.requires_spu = true;
                desc.unit_hint = DigitalUnit::Spu;
                desc.weight_bytes = 0;
                desc.vector_ops = m * n;
                desc.special_ops = (m * n) / 32;
            }
            CommandKind::PeVpuOp => {
                desc.requires_pe = false;
                desc.requires_vpu = true;
                desc.unit_hint = DigitalUnit::Vpu;
                desc.weight_bytes = 0;
                desc.vpu_ops = m * n;
            }
            CommandKind::PeReduce => {
                desc.requires_pe = false;
                desc.requires_spu = true;
                desc.unit_hint = DigitalUnit::Spu;
                desc.weight_bytes = 0;
                desc.scalar_ops = desc.scalar_ops.max(m * n);
            }
            CommandKind::PeSpuOp => {
                desc.requires_pe = false;
                desc.requires_spu = true;
                desc.unit_hint = DigitalUnit::Spu;
                desc.weight_bytes = 0;
                desc.scalar_ops = meta.int_or("scalar_ops", desc.scalar_ops.max(m * n) as i64) as u64;
                desc.vector_ops = meta.int_or("vector_ops", desc.vector_ops as i64) as u64;
            }
            CommandKind::PeTokenPrep => {
                desc.requires_pe = false;
                desc.requires_spu = true;
                desc.unit_hint = DigitalUnit::Spu;
                desc.weight_bytes = 0;
                desc.scalar_ops = m * n;
                desc.vector_ops = m;
            }
            CommandKind::PeBufferAlloc | CommandKind::PeBufferRelease => {
                let bytes = meta.int_or("bytes", cmd.payload_bytes).max(0) as u64;
                let buffer = meta
                    .str_of("buffer")
                    .and_then(BufferKind::parse)
                    .unwrap_or(BufferKind::Scratch);
                desc = DigitalTaskDesc {
                    target_buffer: buffer,
                    unit_hint: DigitalUnit::Buffer,
                    ..Default::default()
                };
                if cmd.kind == CommandKind::PeBufferAlloc {
                    desc.output_bytes = bytes;
                } else {
                    desc.input_bytes = bytes;
                }
            }
            CommandKind::PeBarrier | CommandKind::Sync => {
                desc = DigitalTaskDesc {
                    unit_hint: DigitalUnit::Barrier,
                    ..Default::default()
                };
            }
            _ => {}
        }
        desc
    }

    /// Bootstrap-graph stage labels become generic descriptors.
    fn stage_desc(&self, task: &Task) -> DigitalTaskDesc {
        let rows = u64::from(self.cfg.pe_rows);
        let cols = u64::from(self.cfg.pe_cols);
        match task.payload.stage() {
            Some("tokenize") | Some("postprocess") => DigitalTaskDesc {
                m: rows,
                n: cols,
                scalar_ops: rows * cols,
                requires_spu: true,
                input_bytes: rows * cols * 2,
                output_bytes: rows * cols * 2,
                unit_hint: DigitalUnit::Spu,
                ..Default::default()
            },
            _ => DigitalTaskDesc {
                m: rows,
                n: cols,
                k: cols,
                tile_m: rows,
                tile_n: cols,
                tile_k: cols,
                input_bytes: rows * cols * 2,
                weight_bytes: cols * cols * 2,
                output_bytes: rows * cols * 2,
                requires_pe: true,
                unit_hint: DigitalUnit::Pe,
                ..Default::default()
            },
        }
    }

    fn record_gating_snapshot(&mut self, digital_id: i64, cmd: &Command) {
        let meta = &cmd.metadata;
        let tokens = if cmd.aux0 > 0 { u64::from(cmd.aux0) } else { 128 };
        let features = if cmd.aux1 > 0 { u64::from(cmd.aux1) } else { 128 };
        let top_k = meta.int_or("top_k", 2).max(1) as usize;
        let candidates = meta.int_list("experts");
        let scores = meta
            .get("gating_scores")
            .map(|v| v.as_float_list())
            .unwrap_or_default();
        let selected = select_topk(&scores, &candidates, top_k);
        let snapshot = GatingSnapshot {
            command_id: cmd.id,
            issued_cycle: self.cycle,
            tokens,
            features,
            top_k,
            candidates,
            selected,
            bytes: cmd.payload_bytes.max(0) as u64,
            metadata: cmd.metadata.clone(),
        };
        debug!(digital_id, buffer = cmd.buffer_id, "gating snapshot recorded");
        self.gating_snapshots
            .insert((digital_id, cmd.buffer_id), snapshot);
    }

    /// `pe_barrier` with `op == "moe_barrier"`: close out the session metrics
    /// started at the gating fetch.
    fn finish_moe_session(&mut self, cmd: &Command) {
        let parent = cmd.metadata.int_or("parent_node", -1);
        if parent < 0 {
            return;
        }
        if let Some(meta) = self.moe_parents.remove(&(parent as u64)) {
            let latency = self.cycle.saturating_sub(meta.start_cycle);
            self.totals.moe_latency_total += latency;
            self.totals.moe_latency_max = self.totals.moe_latency_max.max(latency);
            self.totals.moe_latency_samples += 1;
            self.totals.moe_sessions_completed += 1;
            debug!(
                parent,
                latency,
                tokens = meta.tokens,
                experts = meta.experts,
                fallback = meta.fallback,
                "moe session complete"
            );
        }
    }

    fn dispatch_rram(&mut self, task: &Task) {
        let Some(index) = self.resolve_rram_index(task) else {
            warn!(node = task.node_id, "rram task without a valid chiplet, dropping");
            self.totals.dropped_tasks += 1;
            return;
        };

        let Some(cmd) = task.command().cloned() else {
            // Bootstrap "cim" stage: composite op with the task latency.
            self.rram[index].schedule_task(task.latency, None);
            self.cycle_counters.rram_exec += 1;
            self.totals.rram_tasks_executed += 1;
            return;
        };

        if cmd.kind == CommandKind::RramWeightLoad {
            self.dispatch_weight_load(index, &cmd);
            self.cycle_counters.rram_exec += 1;
            self.totals.rram_tasks_executed += 1;
            return;
        }

        let spec = self.build_rram_spec(&cmd);
        match cmd.kind {
            CommandKind::RramStageAct => self.couple_stage_buffers(index, &spec),
            CommandKind::RramPost => self.couple_post_buffers(index, &spec),
            _ => {}
        }
        self.rram[index].schedule_task(task.latency, Some(spec));
        self.cycle_counters.rram_exec += 1;
        self.totals.rram_tasks_executed += 1;
    }

    /// §RRAM spec construction from the command's aux words and metadata.
    fn build_rram_spec(&self, cmd: &Command) -> RramTaskSpec {
        let meta = &cmd.metadata;
        let rows = if cmd.aux0 > 0 { u64::from(cmd.aux0) } else { 128 };
        let cols = if cmd.aux1 > 0 { u64::from(cmd.aux1) } else { 128 };
        let depth = if cmd.aux2 > 0 { u64::from(cmd.aux2) } else { 128 };

        let activation_size = first_positive([cmd.payload_bytes, 0, 0]).unwrap_or(rows * depth * 2);
        let weight_size =
            first_positive([cmd.payload_addr, 0, 0]).unwrap_or((depth * cols * 4).div_ceil(8));
        let output_size = if cmd.aux3 > 0 {
            u64::from(cmd.aux3)
        } else {
            rows * cols * 2
        };

        let phase = match cmd.kind {
            CommandKind::RramStageAct => RramPhase::Stage,
            CommandKind::RramExecute => RramPhase::Execute,
            CommandKind::RramPost => RramPhase::Post,
            _ => RramPhase::Unknown,
        };

        let tile_id = meta.int_or("tile_id", cmd.queue.max(0)).max(0) as u32;
        let array_id = meta.int_or("array_id", 0).max(0) as u32;
        let tag = meta
            .str_of("weight_tag")
            .map(str::to_owned)
            .unwrap_or_else(|| format!("cmd_{}", cmd.id));

        let expected = meta.get("expected").and_then(|v| v.as_float());

        // Raw activation values, when supplied, are decomposed through fp16
        // and aligned; explicit metadata sums still win.
        let (p_sum, a_sum, max_exponent) = match meta.get("activations") {
            Some(v) => {
                let values: Vec<f32> = v.as_float_list().iter().map(|f| *f as f32).collect();
                if values.is_empty() {
                    (0, 0.0, 0)
                } else {
                    let aligned = tessera_rram::align_fp16_values(&values);
                    (aligned.p_sum, aligned.a_sum, aligned.max_exponent)
                }
            }
            None => (0, 0.0, 0),
        };

        RramTaskSpec {
            pulse_count: depth,
            adc_samples: cols * depth,
            pre_cycles: rows,
            post_cycles: (cols / 8).max(1),
            i_sum: meta.int_or("i_sum", 0),
            p_sum: meta.int_or("p_sum", p_sum),
            a_sum: meta.float_or("a_sum", a_sum),
            max_exponent: meta.int_or("max_exponent", i64::from(max_exponent)) as i32,
            scale: meta.float_or("scale", 1.0),
            zero_point: meta.float_or("zero_point", 0.0),
            rows,
            cols,
            depth,
            activation_size,
            weight_size,
            output_size,
            weight: WeightKey::new(tile_id, array_id, &tag),
            phase,
            expected,
            ..Default::default()
        }
    }

    /// Stage consumes staged input bytes and opens a processing window.
    fn couple_stage_buffers(&mut self, index: usize, spec: &RramTaskSpec) {
        let expected = if spec.activation_size > 0 {
            spec.activation_size
        } else {
            self.rram_input_buffered[index]
        };
        let occupancy = self.rram[index].buffer_occupancy(tessera_rram::RramBufferKind::Input);
        let consumed = expected.min(occupancy);
        if consumed > 0 {
            self.rram[index].adjust_buffer(tessera_rram::RramBufferKind::Input, -(consumed as i64));
        }
        self.rram_input_buffered[index] = self.rram_input_buffered[index].saturating_sub(consumed);
        let processing = if spec.output_size > 0 {
            spec.output_size
        } else {
            expected
        };
        self.rram_processing_bytes[index] += processing;

        // Stage against a missing weight implies an implicit residency.
        if !self.rram[index].directory.contains(&spec.weight) {
            let tick = self.cycle;
            self.rram[index]
                .directory
                .register(spec.weight.clone(), spec.weight_size, tick);
        }
    }

    /// Post drains the processing window into the output staging buffer.
    fn couple_post_buffers(&mut self, index: usize, spec: &RramTaskSpec) {
        let produced = if spec.output_size > 0 {
            spec.output_size
        } else {
            self.rram_processing_bytes[index]
        };
        let free = self.rram[index].buffer_capacity(tessera_rram::RramBufferKind::Output)
            - self.rram[index].buffer_occupancy(tessera_rram::RramBufferKind::Output);
        let added = produced.min(free);
        if added > 0 {
            self.rram[index].adjust_buffer(tessera_rram::RramBufferKind::Output, added as i64);
        }
        self.rram_processing_bytes[index] =
            self.rram_processing_bytes[index].saturating_sub(added);
        let occupancy = self.rram[index].buffer_occupancy(tessera_rram::RramBufferKind::Output);
        self.rram_output_buffered[index] =
            (self.rram_output_buffered[index] + added).min(occupancy);
    }

    /// Weight loads short-circuit on a directory hit; misses queue a DMA.
    fn dispatch_weight_load(&mut self, index: usize, cmd: &Command) {
        let meta = &cmd.metadata;
        let tile_id = meta.int_or("tile_id", cmd.queue.max(0)).max(0) as u32;
        let array_id = meta.int_or("array_id", 0).max(0) as u32;
        let tag = meta
            .str_of("weight_tag")
            .map(str::to_owned)
            .unwrap_or_else(|| format!("cmd_{}", cmd.id));
        let key = WeightKey::new(tile_id, array_id, &tag);
        if self.rram[index].weight_hit(&key) {
            return;
        }
        let bytes = cmd.payload_bytes.max(0) as u64;
        let latency = (cmd.latency > 0).then_some(cmd.latency as u64);
        let tick = self.cycle;
        self.rram[index].schedule_weight_load(tile_id, array_id, &tag, bytes, latency, tick);
    }

    fn dispatch_host(&mut self, task: &Task) {
        use tessera_estimators::DmaDirection;
        match task.opcode {
            CommandKind::HostGatingFetch => self.handle_gating_fetch(task),
            // Embedding rows stream in over the host DMA link.
            CommandKind::HostEmbedLookup => {
                let bytes = self.host_op_bytes(task);
                self.dma.record(DmaDirection::HostToDigital, bytes, 1);
                self.cycle_counters.host_dma_load_bytes += bytes;
            }
            // Logits stream back out.
            CommandKind::HostLmHead => {
                let bytes = self.host_op_bytes(task);
                self.dma.record(DmaDirection::DigitalToHost, bytes, 1);
                self.cycle_counters.host_dma_store_bytes += bytes;
            }
            _ => {}
        }
        self.cycle_counters.host_tasks += 1;
        self.totals.host_tasks_executed += 1;
    }

    fn host_op_bytes(&self, task: &Task) -> u64 {
        if task.request_bytes > 0 {
            return task.request_bytes;
        }
        let cmd = task.command();
        let rows = cmd.map_or(0, |c| u64::from(c.aux0));
        let cols = cmd.map_or(0, |c| u64::from(c.aux1));
        if rows > 0 && cols > 0 {
            rows * cols * 2
        } else {
            4096
        }
    }

    /// Locate the snapshot captured at `topk_select` dispatch and turn it
    /// into the host event the orchestrator expands on.
    fn handle_gating_fetch(&mut self, task: &Task) {
        let cmd = task.command();
        let buffer_id = task.buffer_id;
        let digital_hint = cmd.map_or(-1, |c| c.chiplet_id);

        let key = (digital_hint.max(0), buffer_id);
        let snapshot = self.gating_snapshots.remove(&key).or_else(|| {
            // The fetch may not know which chiplet ran the gating; fall back
            // to any snapshot that shares the buffer id.
            let found = self
                .gating_snapshots
                .keys()
                .find(|(_, b)| *b == buffer_id)
                .copied();
            found.and_then(|k| self.gating_snapshots.remove(&k))
        });

        self.totals.moe_events_total += 1;
        let mut event = tessera_types::HostEvent::gating_fetch();
        event.buffer_id = buffer_id;
        event.digital_id = digital_hint.max(0);

        let fallback = match snapshot {
            Some(snap) => {
                self.totals.moe_snapshot_hits += 1;
                event.tokens = snap.tokens;
                event.features = snap.features;
                event.top_k = snap.top_k;
                event.candidates = snap.candidates.clone();
                event.selected = snap.selected.clone();
                event.activation_bytes = snap.bytes;
                event.metadata = snap.metadata;
                false
            }
            None => {
                self.totals.moe_snapshot_misses += 1;
                self.totals.moe_fallback_events += 1;
                if let Some(cmd) = cmd {
                    event.tokens = if cmd.aux0 > 0 { u64::from(cmd.aux0) } else { 128 };
                    event.features = if cmd.aux1 > 0 { u64::from(cmd.aux1) } else { 128 };
                    event.top_k = cmd.metadata.int_or("top_k", 2).max(1) as usize;
                    event.candidates = cmd.metadata.int_list("experts");
                    event.metadata = cmd.metadata.clone();
                }
                true
            }
        };
        event.fallback = fallback;

        self.moe_parents.insert(
            task.node_id,
            crate::platform::MoeNodeMeta {
                start_cycle: self.cycle,
                tokens: event.tokens,
                experts: event.selected.len().max(event.top_k) as u64,
                fallback,
            },
        );
        self.orchestrator.notify_host_event(task.node_id, event);
    }
}

/// Top-k selection over gating scores: indices of the highest scores, ties
/// broken toward the smaller candidate id, mapped through the candidate list.
/// Falls back to round-robin over the candidates when no scores exist.
fn select_topk(scores: &[f64], candidates: &[i64], top_k: usize) -> Vec<i64> {
    let id_of = |i: usize| candidates.get(i).copied().unwrap_or(i as i64);
    if scores.is_empty() {
        if candidates.is_empty() {
            return Vec::new();
        }
        return (0..top_k).map(|i| candidates[i % candidates.len()]).collect();
    }
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| id_of(a).cmp(&id_of(b)))
    });
    order.into_iter().take(top_k).map(id_of).collect()
}
