//! Dynamic MoE expansion: a completed `host_gating_fetch` node grows the live
//! graph with one RRAM command chain per selected expert, joined by a barrier
//! that inherits the fetch node's downstream edges.

use std::collections::HashSet;

use tracing::{debug, info};

use tessera_graph::OpNode;
use tessera_types::{Command, CommandKind, HostEvent, MetaMapExt, MetaValue, NodePayload};

use crate::orchestrator::HostOrchestrator;

/// Book-keeping for one in-flight gating expansion.
#[derive(Debug)]
pub struct MoeSession {
    pub parent: u64,
    pub digital_id: i64,
    pub buffer_id: i64,
    pub top_k: usize,
    pub tokens: u64,
    pub features: u64,
    pub selected: Vec<i64>,
    pub merges: HashSet<u64>,
    pub barrier: u64,
    pub saved_successors: Vec<u64>,
    /// Merge nodes plus the barrier still outstanding.
    pub outstanding: u64,
}

impl HostOrchestrator {
    /// Experts with no prior placement go to `expert % num_rram`; the mapping
    /// is sticky for the rest of the run.
    fn rram_for_expert(&mut self, expert: i64) -> i64 {
        let num_rram = self.num_rram_chiplets().max(1);
        i64::from(
            *self
                .expert_map
                .entry(expert)
                .or_insert_with(|| (expert.unsigned_abs() % u64::from(num_rram)) as u32),
        )
    }

    /// Selected experts, falling back to the first `top_k` candidates
    /// (cyclically when there are fewer), then to expert 0.
    fn select_experts(event: &HostEvent) -> Vec<i64> {
        if !event.selected.is_empty() {
            return event.selected.clone();
        }
        if event.candidates.is_empty() {
            return vec![0];
        }
        let top_k = event.top_k.max(1);
        (0..top_k)
            .map(|i| event.candidates[i % event.candidates.len()])
            .collect()
    }

    pub(crate) fn expand_gating_fetch(&mut self, parent: u64, event: HostEvent) {
        let Some(parent_node) = self.graph.node(parent) else {
            return;
        };
        let batch = parent_node.batch_id;
        let saved_successors: Vec<u64> = self.graph.successors(parent).to_vec();

        let selected = Self::select_experts(&event);
        let tokens = event.tokens.max(1);
        let features = event.features.max(1);
        let inner = if event.inner_dim > 0 {
            event.inner_dim
        } else {
            features
        };
        let act_bytes = if event.activation_bytes > 0 {
            event.activation_bytes
        } else {
            tokens * inner * 2
        };
        let weight_bytes = if event.weight_bytes > 0 {
            event.weight_bytes
        } else {
            features * inner * 2
        };
        let out_bytes = if event.output_bytes > 0 {
            event.output_bytes
        } else {
            tokens * features * 2
        };

        let stage_latency = event.metadata.int_or("stage_latency", 28).max(1) as u64;
        let execute_latency = event.metadata.int_or("execute_latency", 56).max(1) as u64;
        let post_latency = event.metadata.int_or("post_latency", 12).max(1) as u64;
        let merge_latency = event.metadata.int_or("merge_latency", 24).max(1) as u64;

        info!(
            parent,
            experts = ?selected,
            tokens,
            features,
            "expanding gating fetch"
        );

        let mut merge_ids = Vec::new();
        for &expert in &selected {
            let rram_id = self.rram_for_expert(expert);
            let chain = self.build_expert_chain(
                &event,
                parent,
                expert,
                rram_id,
                (act_bytes, weight_bytes, out_bytes),
                (tokens, features, inner),
                (stage_latency, execute_latency, post_latency, merge_latency),
            );
            let node_ids = self.append_command_group(chain, &[parent], true, batch);
            let merge = *node_ids.last().expect("chain is nonempty");
            self.moe_merge_owners.insert(merge, parent);
            merge_ids.push(merge);
        }

        // One barrier joins every expert's merge.
        let mut barrier_cmd = Command::new(CommandKind::PeBarrier);
        barrier_cmd.chiplet_id = event.digital_id;
        barrier_cmd.latency = 1;
        barrier_cmd
            .metadata
            .insert("op".into(), MetaValue::from("moe_barrier"));
        barrier_cmd
            .metadata
            .insert("parent_node".into(), MetaValue::from(parent as i64));
        let barrier_deps: Vec<u64> = merge_ids.clone();
        let barrier = self.append_command_group(vec![barrier_cmd], &barrier_deps, false, batch)[0];
        self.moe_merge_owners.insert(barrier, parent);

        // Rewire the saved successors to hang off the barrier instead of the
        // fetch node; their dependency counts net out to the same value.
        for &succ in &saved_successors {
            self.graph.remove_edge(parent, succ);
            if let Some(node) = self.graph.node_mut(succ) {
                node.deps.retain(|&d| d != parent);
                node.deps.push(barrier);
            }
            self.graph.add_edge(barrier, succ);
        }

        let session = MoeSession {
            parent,
            digital_id: event.digital_id,
            buffer_id: event.buffer_id,
            top_k: event.top_k,
            tokens,
            features,
            selected,
            merges: merge_ids.iter().copied().collect(),
            barrier,
            saved_successors,
            outstanding: merge_ids.len() as u64 + 1,
        };
        self.moe_sessions.insert(parent, session);
    }

    #[allow(clippy::too_many_arguments)]
    fn build_expert_chain(
        &mut self,
        event: &HostEvent,
        parent: u64,
        expert: i64,
        rram_id: i64,
        (act_bytes, weight_bytes, out_bytes): (u64, u64, u64),
        (tokens, features, inner): (u64, u64, u64),
        (stage_latency, execute_latency, post_latency, merge_latency): (u64, u64, u64, u64),
    ) -> Vec<Command> {
        let digital_id = event.digital_id;
        let bandwidth = self.limits_ref().transfer_bandwidth_bytes;
        let transfer_latency = |this: &mut Self, stage: &str, bytes: u64| -> u64 {
            if let Some(estimator) = this.transfer_estimator.as_mut() {
                if let Some(cycles) = estimator.estimate(
                    stage,
                    bytes,
                    digital_id,
                    rram_id,
                    digital_id,
                    rram_id,
                    &event.metadata,
                ) {
                    return cycles.max(1);
                }
            }
            bytes.div_ceil(bandwidth).max(1)
        };

        let tag = format!("expert{expert}");
        let stamp = |cmd: &mut Command, op: &str| {
            cmd.metadata.insert("op".into(), MetaValue::from(op));
            cmd.metadata.insert("expert".into(), MetaValue::from(expert));
            cmd.metadata
                .insert("parent_node".into(), MetaValue::from(parent as i64));
        };

        let mut into_rram = Command::new(CommandKind::XferD2c);
        into_rram.queue = digital_id;
        into_rram.chiplet_id = rram_id;
        into_rram.payload_bytes = act_bytes as i64;
        into_rram.latency = transfer_latency(self, "transfer_to_rram", act_bytes) as i64;
        stamp(&mut into_rram, "moe_transfer_in");

        let mut stage = Command::new(CommandKind::RramStageAct);
        stage.chiplet_id = rram_id;
        stage.payload_bytes = act_bytes as i64;
        stage.payload_addr = weight_bytes as i64;
        stage.aux0 = tokens as u32;
        stage.aux1 = features as u32;
        stage.aux2 = inner as u32;
        stage.aux3 = out_bytes as u32;
        stage.latency = stage_latency as i64;
        stamp(&mut stage, "moe_stage");
        stage
            .metadata
            .insert("weight_tag".into(), MetaValue::from(tag.clone()));

        let mut execute = Command::new(CommandKind::RramExecute);
        execute.chiplet_id = rram_id;
        execute.payload_bytes = act_bytes as i64;
        execute.payload_addr = weight_bytes as i64;
        execute.aux0 = tokens as u32;
        execute.aux1 = features as u32;
        execute.aux2 = inner as u32;
        execute.aux3 = out_bytes as u32;
        execute.latency = execute_latency as i64;
        stamp(&mut execute, "moe_execute");
        execute
            .metadata
            .insert("weight_tag".into(), MetaValue::from(tag.clone()));

        let mut post = Command::new(CommandKind::RramPost);
        post.chiplet_id = rram_id;
        post.aux0 = tokens as u32;
        post.aux1 = features as u32;
        post.aux2 = inner as u32;
        post.aux3 = out_bytes as u32;
        post.latency = post_latency as i64;
        stamp(&mut post, "moe_post");
        post.metadata
            .insert("weight_tag".into(), MetaValue::from(tag));

        let mut into_digital = Command::new(CommandKind::XferC2d);
        into_digital.flags = 1;
        into_digital.queue = rram_id;
        into_digital.chiplet_id = digital_id;
        into_digital.payload_bytes = out_bytes as i64;
        into_digital.latency = transfer_latency(self, "transfer_to_digital", out_bytes) as i64;
        stamp(&mut into_digital, "moe_transfer_out");

        let mut merge = Command::new(CommandKind::PeElementwise);
        merge.chiplet_id = digital_id;
        merge.buffer_id = event.buffer_id;
        merge.aux0 = tokens as u32;
        merge.aux1 = features as u32;
        merge.payload_bytes = out_bytes as i64;
        merge.latency = merge_latency as i64;
        stamp(&mut merge, "moe_merge");

        vec![into_rram, stage, execute, post, into_digital, merge]
    }

    /// Insert a synthesized command group into the live graph. The first
    /// command depends on `base_deps`; with `chain` set the rest form a
    /// linear chain. Returns the allocated node ids in order.
    pub(crate) fn append_command_group(
        &mut self,
        commands: Vec<Command>,
        base_deps: &[u64],
        chain: bool,
        batch: u64,
    ) -> Vec<u64> {
        let mut node_ids = Vec::with_capacity(commands.len());
        let mut prev: Option<u64> = None;
        for mut cmd in commands {
            let node_id = self.alloc_node_id();
            cmd.id = node_id as i64;
            let deps: Vec<u64> = match prev {
                Some(p) if chain => vec![p],
                _ => base_deps.to_vec(),
            };
            cmd.deps = deps.iter().map(|&d| d as i64).collect();

            let mut node = OpNode::new(node_id, Self::op_type_hint(cmd.kind), cmd.target);
            node.latency = cmd.latency.max(1) as u64;
            node.deps = deps.clone();
            node.batch_id = batch;
            node.payload = NodePayload::Command(Box::new(cmd));
            self.graph.add_node(node);
            for &dep in &deps {
                self.graph.add_edge(dep, node_id);
            }
            self.remaining_deps.insert(node_id, deps.len());
            if deps.is_empty() {
                self.seed_ready(node_id);
            }
            self.bump_batch(batch, 1);
            prev = Some(node_id);
            node_ids.push(node_id);
        }
        node_ids
    }

    /// A merge or barrier belonging to a session finished; the session
    /// dissolves once every one of them has.
    pub(crate) fn handle_moe_merge_completion(&mut self, node_id: u64) {
        let Some(&parent) = self.moe_merge_owners.get(&node_id) else {
            return;
        };
        let done = {
            let Some(session) = self.moe_sessions.get_mut(&parent) else {
                return;
            };
            session.outstanding = session.outstanding.saturating_sub(1);
            session.outstanding == 0
        };
        if done {
            let session = self.moe_sessions.remove(&parent).expect("session exists");
            for merge in &session.merges {
                self.moe_merge_owners.remove(merge);
            }
            self.moe_merge_owners.remove(&session.barrier);
            debug!(parent, "moe session finalized");
        }
    }
}
