use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use tracing::{debug, info};

use tessera_config::{OrchestratorLimits, SimConfig};
use tessera_graph::OpGraph;
use tessera_topology::Topology;
use tessera_types::{
    Command, CommandKind, HostEvent, MetaValue, NodePayload, OpType, Target, Task,
};

use crate::loader;
use crate::moe::MoeSession;

/// Optional replacement for the bandwidth-derived transfer latency used on
/// MoE-synthesized transfer commands.
pub type TransferEstimator = Box<dyn TransferLatencyFn>;

pub trait TransferLatencyFn {
    #[allow(clippy::too_many_arguments)]
    fn estimate(
        &mut self,
        stage: &str,
        bytes: u64,
        src_digital: i64,
        src_rram: i64,
        dst_digital: i64,
        dst_rram: i64,
        metadata: &tessera_types::MetaMap,
    ) -> Option<u64>;
}

impl<F> TransferLatencyFn for F
where
    F: FnMut(&str, u64, i64, i64, i64, i64, &tessera_types::MetaMap) -> Option<u64>,
{
    fn estimate(
        &mut self,
        stage: &str,
        bytes: u64,
        src_digital: i64,
        src_rram: i64,
        dst_digital: i64,
        dst_rram: i64,
        metadata: &tessera_types::MetaMap,
    ) -> Option<u64> {
        self(stage, bytes, src_digital, src_rram, dst_digital, dst_rram, metadata)
    }
}

/// Per-class outstanding byte counters (admission control state).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OutstandingBytes {
    pub digital: i64,
    pub rram: i64,
    pub transfer: i64,
    pub dma: i64,
}

/// Resource usage recorded per issued node so completion can release it.
#[derive(Debug, Default, Clone, Copy)]
struct NodeUsage {
    digital: i64,
    rram: i64,
    transfer: i64,
    dma: i64,
}

/// Streaming-instantiation counters, exposed for stats and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamCounters {
    pub enabled: bool,
    pub batches_issued: u64,
    pub batches_completed: u64,
    pub active_batches: u64,
}

pub struct HostOrchestrator {
    limits: OrchestratorLimits,
    topology: Topology,
    limit_resources: bool,

    pub(crate) graph: OpGraph,
    pub(crate) next_node_id: u64,
    pub(crate) remaining_deps: HashMap<u64, usize>,
    ready: VecDeque<u64>,
    in_flight: HashSet<u64>,
    seq_counter: u64,

    outstanding: OutstandingBytes,
    node_usage: HashMap<u64, NodeUsage>,

    // Per-advance issue counters.
    digital_issued: u64,
    rram_issued: u64,
    transfer_issued_bytes: u64,

    throttle_cycles: u64,

    // Streaming.
    stream_enabled: bool,
    template: Option<OpGraph>,
    stream_total_batches: i64,
    low_watermark: i64,
    high_watermark: i64,
    batches_issued: u64,
    batches_completed: u64,
    active_batches: u64,
    pub(crate) batch_outstanding: HashMap<u64, u64>,
    next_batch_id: u64,

    // Chiplet placement.
    num_digital: u32,
    num_rram: u32,
    rr_digital: u32,
    rr_rram: u32,
    last_digital_id: i64,
    last_rram_id: i64,

    // Host events and MoE sessions.
    host_events: HashMap<u64, HostEvent>,
    pub(crate) moe_sessions: HashMap<u64, MoeSession>,
    pub(crate) moe_merge_owners: HashMap<u64, u64>,
    pub(crate) expert_map: HashMap<i64, u32>,
    pub(crate) transfer_estimator: Option<TransferEstimator>,
}

impl HostOrchestrator {
    /// Construct from an optional command file; a missing or corrupt file
    /// falls back to the bootstrap graph.
    pub fn new(cfg: &SimConfig, topology: Topology, command_path: Option<&Path>) -> Self {
        let graph = command_path
            .and_then(loader::load_commands)
            .map(|cmds| loader::build_graph_from_commands(&cmds, cfg.effective_min_wait()))
            .unwrap_or_else(|| loader::bootstrap_graph(cfg));
        Self::with_graph(cfg, topology, graph)
    }

    /// Construct around a pre-built graph (tests, model expansion).
    pub fn with_graph(cfg: &SimConfig, topology: Topology, graph: OpGraph) -> Self {
        let mut orch = Self {
            limits: cfg.limits(),
            topology,
            limit_resources: cfg.host_limit_resources,
            graph: OpGraph::new(),
            next_node_id: 0,
            remaining_deps: HashMap::new(),
            ready: VecDeque::new(),
            in_flight: HashSet::new(),
            seq_counter: 0,
            outstanding: OutstandingBytes::default(),
            node_usage: HashMap::new(),
            digital_issued: 0,
            rram_issued: 0,
            transfer_issued_bytes: 0,
            throttle_cycles: 0,
            stream_enabled: false,
            template: None,
            stream_total_batches: cfg.host_stream_total_batches,
            low_watermark: cfg.host_stream_low_watermark,
            high_watermark: cfg.host_stream_high_watermark,
            batches_issued: 0,
            batches_completed: 0,
            active_batches: 0,
            batch_outstanding: HashMap::new(),
            next_batch_id: 0,
            num_digital: cfg.num_digital,
            num_rram: cfg.num_rram,
            rr_digital: 0,
            rr_rram: 0,
            last_digital_id: 0,
            last_rram_id: 0,
            host_events: HashMap::new(),
            moe_sessions: HashMap::new(),
            moe_merge_owners: HashMap::new(),
            expert_map: HashMap::new(),
            transfer_estimator: None,
        };
        orch.submit_graph(graph);
        orch
    }

    pub fn limits(&self) -> &OrchestratorLimits {
        &self.limits
    }

    pub fn set_transfer_estimator(&mut self, estimator: TransferEstimator) {
        self.transfer_estimator = Some(estimator);
    }

    /// Install a graph. With streaming configured (`total_batches > 1` or
    /// unlimited `<= 0`) the graph becomes a template and the live graph
    /// starts empty; otherwise it runs as a single batch.
    pub fn submit_graph(&mut self, graph: OpGraph) {
        self.stream_enabled = self.stream_total_batches > 1 || self.stream_total_batches <= 0;
        if self.stream_enabled {
            info!(
                total = self.stream_total_batches,
                nodes = graph.len(),
                "streaming template installed"
            );
            self.template = Some(graph);
            return;
        }
        self.install_batch_direct(graph);
    }

    fn install_batch_direct(&mut self, graph: OpGraph) {
        let node_count = graph.len() as u64;
        let degrees = graph.in_degrees();
        let batch = self.next_batch_id;
        self.next_batch_id += 1;
        let max_id = graph.node_ids().max().map_or(0, |id| id + 1);
        self.next_node_id = self.next_node_id.max(max_id);
        for node in graph.nodes() {
            let mut node = node.clone();
            node.batch_id = batch;
            let degree = degrees.get(&node.id).copied().unwrap_or(0);
            self.remaining_deps.insert(node.id, degree);
            if degree == 0 {
                self.ready.push_back(node.id);
            }
            self.graph.add_node(node);
        }
        // Adjacency travels with the nodes.
        for id in degrees.keys() {
            for &succ in graph.successors(*id) {
                self.graph.add_edge(*id, succ);
            }
        }
        self.batches_issued += 1;
        self.active_batches += 1;
        self.batch_outstanding.insert(batch, node_count);
    }

    /// Spawn template batches until a watermark, issue-window, or byte budget
    /// says stop.
    fn ensure_streaming_capacity(&mut self) {
        if !self.stream_enabled {
            return;
        }
        loop {
            let Some(template) = self.template.as_ref() else {
                return;
            };
            if self.high_watermark > 0 && self.active_batches >= self.high_watermark as u64 {
                return;
            }
            if self.stream_total_batches > 0
                && self.batches_issued >= self.stream_total_batches as u64
            {
                return;
            }
            if self.active_batches > self.low_watermark.max(0) as u64 {
                return;
            }
            if (self.ready.len() + self.in_flight.len()) as u64 > self.limits.max_issue_per_cycle {
                return;
            }
            if self.outstanding.digital >= self.limits.outstanding_digital_bytes
                || self.outstanding.rram >= self.limits.outstanding_rram_bytes
                || self.outstanding.transfer >= self.limits.outstanding_transfer_bytes
                || self.outstanding.dma >= self.limits.outstanding_dma_bytes
            {
                return;
            }

            let template = template.deep_clone();
            self.instantiate_batch(template);
        }
    }

    fn instantiate_batch(&mut self, template: OpGraph) {
        let batch = self.next_batch_id;
        self.next_batch_id += 1;

        let mut remap: HashMap<u64, u64> = HashMap::new();
        let template_ids: Vec<u64> = template.node_ids().collect();
        for &old_id in &template_ids {
            remap.insert(old_id, self.next_node_id);
            self.next_node_id += 1;
        }

        let mut node_count = 0u64;
        for &old_id in &template_ids {
            let template_node = template.node(old_id).expect("template node");
            let mut node = template_node.clone();
            node.id = remap[&old_id];
            node.batch_id = batch;
            node.deps = node.deps.iter().map(|d| remap[d]).collect();
            if let Some(cmd) = node.payload.command_mut() {
                cmd.deps = cmd.deps.iter().map(|&d| remap[&(d as u64)] as i64).collect();
                cmd.metadata
                    .insert("stream_batch_id".to_owned(), MetaValue::from(batch as i64));
                cmd.metadata.insert(
                    "stream_template_id".to_owned(),
                    MetaValue::from(old_id as i64),
                );
            }
            let degree = node.deps.len();
            self.remaining_deps.insert(node.id, degree);
            if degree == 0 {
                self.ready.push_back(node.id);
            }
            node_count += 1;
            self.graph.add_node(node);
        }
        for &old_id in &template_ids {
            for &succ in template.successors(old_id) {
                self.graph.add_edge(remap[&old_id], remap[&succ]);
            }
        }

        self.batches_issued += 1;
        self.active_batches += 1;
        self.batch_outstanding.insert(batch, node_count);
        debug!(batch, nodes = node_count, "streaming batch instantiated");
    }

    /// One scheduling step. Returns the tasks released this cycle, in issue
    /// order.
    pub fn advance(&mut self, cycle: u64) -> Vec<Task> {
        self.ensure_streaming_capacity();

        if self.throttle_cycles > 0 {
            self.throttle_cycles -= 1;
            return Vec::new();
        }

        self.digital_issued = 0;
        self.rram_issued = 0;
        self.transfer_issued_bytes = 0;

        let mut released = Vec::new();
        let mut deferred = Vec::new();
        while released.len() < self.limits.max_issue_per_cycle as usize {
            let Some(node_id) = self.ready.pop_front() else {
                break;
            };
            if self.in_flight.contains(&node_id) {
                continue;
            }
            if !self.can_issue_node(node_id) {
                deferred.push(node_id);
                continue;
            }
            self.in_flight.insert(node_id);
            let task = self.build_task(node_id, cycle);
            released.push(task);
        }
        // Deferred nodes retry first next cycle, ahead of fresh arrivals.
        for node_id in deferred.into_iter().rev() {
            self.ready.push_front(node_id);
        }
        released
    }

    /// Admission: estimate the node's resource footprint and refuse it when a
    /// per-class byte budget or per-cycle ceiling would be exceeded. Only
    /// command payloads are metered.
    fn can_issue_node(&mut self, node_id: u64) -> bool {
        let Some(node) = self.graph.node(node_id) else {
            return false;
        };
        let Some(cmd) = node.payload.command() else {
            return true;
        };
        let target = node.target;

        let mut usage = NodeUsage::default();
        if self.limit_resources {
            match target {
                Target::Digital => {
                    let rows = if cmd.aux0 > 0 { cmd.aux0 as i64 } else { 128 };
                    let cols = if cmd.aux1 > 0 { cmd.aux1 as i64 } else { 128 };
                    let k = if cmd.aux2 > 0 { cmd.aux2 as i64 } else { 128 };
                    usage.digital = rows * k * 2 + k * cols * 2 + rows * cols * 2;
                }
                Target::Rram => {
                    usage.rram = cmd.payload_bytes + cmd.payload_addr.max(cmd.payload_bytes);
                }
                Target::Transfer => {
                    usage.transfer = cmd.payload_bytes;
                    usage.dma = cmd.payload_bytes;
                }
                Target::Host => {}
            }
            if self.outstanding.digital + usage.digital > self.limits.outstanding_digital_bytes
                || self.outstanding.rram + usage.rram > self.limits.outstanding_rram_bytes
                || self.outstanding.transfer + usage.transfer
                    > self.limits.outstanding_transfer_bytes
                || self.outstanding.dma + usage.dma > self.limits.outstanding_dma_bytes
            {
                return false;
            }
        }

        match target {
            Target::Digital => {
                if self.digital_issued >= self.limits.max_digital_per_cycle {
                    return false;
                }
                self.digital_issued += 1;
            }
            Target::Rram => {
                if self.rram_issued >= self.limits.max_rram_per_cycle {
                    return false;
                }
                self.rram_issued += 1;
            }
            Target::Transfer => {
                let bytes = if cmd.payload_bytes > 0 {
                    cmd.payload_bytes as u64
                } else {
                    self.limits.transfer_bytes_estimate
                };
                let charge = bytes.min(self.limits.max_transfer_bytes_per_cycle);
                if self.transfer_issued_bytes + charge > self.limits.max_transfer_bytes_per_cycle {
                    return false;
                }
                self.transfer_issued_bytes += charge;
            }
            Target::Host => {}
        }

        if self.limit_resources {
            self.outstanding.digital += usage.digital;
            self.outstanding.rram += usage.rram;
            self.outstanding.transfer += usage.transfer;
            self.outstanding.dma += usage.dma;
            self.node_usage.insert(node_id, usage);
        }
        true
    }

    fn next_digital_id(&mut self) -> i64 {
        let id = i64::from(self.rr_digital % self.num_digital.max(1));
        self.rr_digital = self.rr_digital.wrapping_add(1);
        id
    }

    fn next_rram_id(&mut self) -> i64 {
        let id = i64::from(self.rr_rram % self.num_rram.max(1));
        self.rr_rram = self.rr_rram.wrapping_add(1);
        id
    }

    fn build_task(&mut self, node_id: u64, cycle: u64) -> Task {
        let node = self.graph.node(node_id).expect("issued node exists").clone();
        let seq_id = self.seq_counter;
        self.seq_counter += 1;

        let mut task = Task {
            node_id,
            seq_id,
            target: node.target,
            op_type: node.op_type,
            opcode: CommandKind::Sync,
            exec_domain: None,
            latency: node.latency.max(1),
            enqueue_cycle: cycle,
            src: (-1, -1),
            dst: (-1, -1),
            host_addr: 0,
            buffer_id: -1,
            sub_op: 0,
            request_bytes: 0,
            response_bytes: 0,
            payload: node.payload.clone(),
            metadata: Default::default(),
        };

        match &node.payload {
            NodePayload::Command(cmd) => {
                let mut cmd = (**cmd).clone();
                task.opcode = cmd.kind;
                task.exec_domain = cmd.exec_domain;
                if cmd.latency > 0 {
                    task.latency = cmd.latency as u64;
                }
                task.host_addr = cmd.payload_addr;
                task.buffer_id = cmd.buffer_id;
                task.sub_op = cmd.sub_op;
                task.request_bytes = cmd.payload_bytes.max(0) as u64;
                task.src = (cmd.src_x, cmd.src_y);
                task.dst = (cmd.dst_x, cmd.dst_y);
                task.metadata = cmd.metadata.clone();

                match node.target {
                    Target::Digital => {
                        if cmd.chiplet_id < 0 {
                            cmd.chiplet_id = self.next_digital_id();
                        }
                        self.last_digital_id = cmd.chiplet_id;
                        task.metadata
                            .insert("chiplet_id".into(), MetaValue::from(cmd.chiplet_id));
                    }
                    Target::Rram => {
                        if cmd.chiplet_id < 0 {
                            cmd.chiplet_id = self.next_rram_id();
                        }
                        self.last_rram_id = cmd.chiplet_id;
                        task.metadata
                            .insert("chiplet_id".into(), MetaValue::from(cmd.chiplet_id));
                    }
                    Target::Transfer => {
                        self.route_transfer(&cmd, &mut task);
                    }
                    Target::Host => {}
                }
                task.payload = NodePayload::Command(Box::new(cmd));
            }
            NodePayload::Stage(label) => {
                task.opcode = match label.as_str() {
                    "transfer_to_rram" => CommandKind::XferD2c,
                    "transfer_to_digital" => CommandKind::XferC2d,
                    "cim" => CommandKind::RramExecute,
                    "tokenize" => CommandKind::PeTokenPrep,
                    "attention" => CommandKind::PeAttentionHead,
                    _ => CommandKind::PeElementwise,
                };
                task.metadata
                    .insert("stage".into(), MetaValue::from(label.clone()));
            }
            NodePayload::Empty => {}
        }
        task
    }

    /// Resolve transfer endpoints from the direction flag, the command's
    /// queue/chiplet fields, and the most recent placements, then fold hop
    /// count into the latency.
    fn route_transfer(&mut self, cmd: &Command, task: &mut Task) {
        fn pick(candidates: [i64; 3]) -> i64 {
            candidates.into_iter().find(|&v| v >= 0).unwrap_or(0)
        }
        use tessera_types::MetaMapExt;
        let meta = &cmd.metadata;
        let meta_src_digital = meta.int_or("src_digital", -1);
        let meta_dst_digital = meta.int_or("dst_digital", -1);
        let meta_src_rram = meta.int_or("src_rram", -1);
        let meta_dst_rram = meta.int_or("dst_rram", -1);

        let bytes = cmd.payload_bytes.max(0) as u64;
        let bandwidth = self.limits.transfer_bandwidth_bytes;
        let (hops, src_digital, dst_digital, src_rram, dst_rram) = match cmd.kind {
            CommandKind::XferHost2d => {
                let dst = pick([meta_dst_digital, cmd.chiplet_id, self.last_digital_id]);
                (1, -1, dst, -1, -1)
            }
            CommandKind::XferD2host => {
                let src = pick([meta_src_digital, cmd.chiplet_id, self.last_digital_id]);
                (1, src, -1, -1, -1)
            }
            _ if cmd.rram_to_digital() => {
                let src = pick([meta_src_rram, cmd.queue, self.last_rram_id]);
                let dst = pick([meta_dst_digital, cmd.chiplet_id, self.last_digital_id]);
                let hops = self
                    .topology
                    .cross_hop_distance(dst.max(0) as u32, src.max(0) as u32)
                    .max(1);
                (hops, -1, dst, src, -1)
            }
            _ => {
                let src = pick([meta_src_digital, cmd.queue, self.last_digital_id]);
                let dst = pick([meta_dst_rram, cmd.chiplet_id, self.last_rram_id]);
                let hops = self
                    .topology
                    .cross_hop_distance(src.max(0) as u32, dst.max(0) as u32)
                    .max(1);
                (hops, src, -1, -1, dst)
            }
        };

        task.latency = bytes.div_ceil(bandwidth).max(1) + hops;
        for (key, value) in [
            ("src_digital", src_digital),
            ("dst_digital", dst_digital),
            ("src_rram", src_rram),
            ("dst_rram", dst_rram),
            ("transfer_hops", hops as i64),
        ] {
            task.metadata.insert(key.to_owned(), MetaValue::from(value));
        }
    }

    /// Completion callback from the platform. Releases admission usage,
    /// retires batch accounting, dispatches host events, runs the MoE state
    /// machine, and unlocks successors.
    pub fn notify_task_completion(&mut self, node_id: u64) {
        self.in_flight.remove(&node_id);
        if let Some(usage) = self.node_usage.remove(&node_id) {
            self.outstanding.digital = (self.outstanding.digital - usage.digital).max(0);
            self.outstanding.rram = (self.outstanding.rram - usage.rram).max(0);
            self.outstanding.transfer = (self.outstanding.transfer - usage.transfer).max(0);
            self.outstanding.dma = (self.outstanding.dma - usage.dma).max(0);
        }

        if let Some(node) = self.graph.node(node_id) {
            let batch = node.batch_id;
            if let Some(count) = self.batch_outstanding.get_mut(&batch) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.batch_outstanding.remove(&batch);
                    self.active_batches = self.active_batches.saturating_sub(1);
                    self.batches_completed += 1;
                    debug!(batch, "streaming batch complete");
                }
            }
        }

        if self.moe_merge_owners.contains_key(&node_id) {
            self.handle_moe_merge_completion(node_id);
        }

        if let Some(event) = self.consume_host_event(node_id) {
            self.handle_host_event(node_id, event);
        }

        for succ in self.graph.successors(node_id).to_vec() {
            if let Some(remaining) = self.remaining_deps.get_mut(&succ) {
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 {
                    self.ready.push_back(succ);
                }
            }
        }
    }

    /// Queue-delay feedback from the platform; long waits convert into forced
    /// idle cycles at the issue stage.
    pub fn notify_backpressure(&mut self, wait_cycles: u64) {
        let min_wait = self.limits.min_wait_cycles;
        if wait_cycles > min_wait {
            self.throttle_cycles = self.throttle_cycles.max(wait_cycles / min_wait);
        }
    }

    pub fn notify_host_event(&mut self, node_id: u64, event: HostEvent) {
        self.host_events.insert(node_id, event);
    }

    pub fn consume_host_event(&mut self, node_id: u64) -> Option<HostEvent> {
        self.host_events.remove(&node_id)
    }

    fn handle_host_event(&mut self, node_id: u64, event: HostEvent) {
        match event.kind {
            tessera_types::HostEventKind::GatingFetch => {
                self.expand_gating_fetch(node_id, event);
            }
        }
    }

    // Accessors for the platform's stats and for tests.

    pub fn outstanding(&self) -> OutstandingBytes {
        self.outstanding
    }

    pub fn stream_counters(&self) -> StreamCounters {
        StreamCounters {
            enabled: self.stream_enabled,
            batches_issued: self.batches_issued,
            batches_completed: self.batches_completed,
            active_batches: self.active_batches,
        }
    }

    pub fn throttle_cycles(&self) -> u64 {
        self.throttle_cycles
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// True when nothing is queued, running, or left to instantiate.
    pub fn is_idle(&self) -> bool {
        let stream_pending = self.stream_enabled
            && self.stream_total_batches > 0
            && self.batches_issued < self.stream_total_batches as u64;
        self.ready.is_empty() && self.in_flight.is_empty() && !stream_pending
    }

    pub fn graph(&self) -> &OpGraph {
        &self.graph
    }

    pub(crate) fn alloc_node_id(&mut self) -> u64 {
        let id = self.next_node_id;
        self.next_node_id += 1;
        id
    }

    pub(crate) fn seed_ready(&mut self, node_id: u64) {
        self.ready.push_back(node_id);
    }

    pub(crate) fn limits_ref(&self) -> &OrchestratorLimits {
        &self.limits
    }

    pub(crate) fn num_rram_chiplets(&self) -> u32 {
        self.num_rram
    }

    /// Grow a batch's outstanding count for synthesized nodes. A batch that
    /// had already drained is resurrected so the active-batch invariant
    /// (`active == |{b : outstanding[b] > 0}|`) keeps holding.
    pub(crate) fn bump_batch(&mut self, batch: u64, delta: u64) {
        let entry = self.batch_outstanding.entry(batch).or_insert(0);
        if *entry == 0 {
            self.active_batches += 1;
            self.batches_completed = self.batches_completed.saturating_sub(1);
        }
        *entry += delta;
    }

    pub(crate) fn op_type_hint(kind: CommandKind) -> OpType {
        match kind.default_target() {
            Target::Transfer => OpType::DataMove,
            Target::Rram => OpType::Cim,
            Target::Host => OpType::Sync,
            Target::Digital => match kind {
                CommandKind::PeBarrier | CommandKind::Sync => OpType::Sync,
                _ => OpType::Compute,
            },
        }
    }
}
