//! Dynamic graph expansion on a gating-fetch completion: one six-command
//! chain per expert, one barrier, and rewired successors.

use tessera_config::SimConfig;
use tessera_graph::{OpGraph, OpNode};
use tessera_host::HostOrchestrator;
use tessera_topology::Topology;
use tessera_types::{
    Command, CommandKind, HostEvent, MetaMapExt, NodePayload, OpType, Target,
};

fn two_node_graph() -> OpGraph {
    let mut graph = OpGraph::new();

    let mut fetch = Command::new(CommandKind::HostGatingFetch);
    fetch.id = 0;
    fetch.buffer_id = 3;
    let mut g = OpNode::new(0, OpType::Sync, Target::Host);
    g.payload = NodePayload::Command(Box::new(fetch));
    graph.add_node(g);

    let mut post = Command::new(CommandKind::PeElementwise);
    post.id = 1;
    post.deps = vec![0];
    let mut r = OpNode::new(1, OpType::Compute, Target::Digital);
    r.deps = vec![0];
    r.payload = NodePayload::Command(Box::new(post));
    graph.add_node(r);
    graph.add_edge(0, 1);
    graph
}

fn gating_event() -> HostEvent {
    let mut event = HostEvent::gating_fetch();
    event.digital_id = 0;
    event.buffer_id = 3;
    event.top_k = 2;
    event.tokens = 8;
    event.features = 16;
    event.inner_dim = 16;
    event.selected = vec![0, 1];
    event
}

#[test]
fn gating_fetch_grows_chains_barrier_and_rewires() {
    let cfg = SimConfig::default();
    let topology = Topology::new(cfg.num_digital, cfg.num_rram);
    let mut orch = HostOrchestrator::with_graph(&cfg, topology, two_node_graph());

    let tasks = orch.advance(0);
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].opcode, CommandKind::HostGatingFetch);

    orch.notify_host_event(0, gating_event());
    orch.notify_task_completion(0);

    // Two experts x six commands plus one barrier on top of the two
    // original nodes.
    assert_eq!(orch.graph().len(), 2 + 2 * 6 + 1);

    let barrier = orch
        .graph()
        .nodes()
        .find(|n| {
            n.payload
                .command()
                .is_some_and(|c| c.kind == CommandKind::PeBarrier)
        })
        .expect("barrier exists")
        .id;

    // Each chain: transfer in, stage, execute, post, transfer out, merge.
    let mut merge_count = 0;
    for node in orch.graph().nodes() {
        let Some(cmd) = node.payload.command() else {
            continue;
        };
        if cmd.metadata.str_of("op") == Some("moe_merge") {
            merge_count += 1;
            // Merges feed the barrier.
            assert!(orch.graph().successors(node.id).contains(&barrier));
        }
    }
    assert_eq!(merge_count, 2);

    // The downstream elementwise no longer depends on the fetch node.
    let post = orch.graph().node(1).unwrap();
    assert!(!post.deps.contains(&0));
    assert!(post.deps.contains(&barrier));
    assert!(orch.graph().successors(barrier).contains(&1));
    assert!(orch.graph().successors(0).iter().all(|&s| s != 1));
}

#[test]
fn expansion_drains_end_to_end() {
    let cfg = SimConfig::default();
    let topology = Topology::new(cfg.num_digital, cfg.num_rram);
    let mut orch = HostOrchestrator::with_graph(&cfg, topology, two_node_graph());

    let mut completed_kinds = Vec::new();
    for cycle in 0..200 {
        let tasks = orch.advance(cycle);
        for task in tasks {
            if task.opcode == CommandKind::HostGatingFetch {
                orch.notify_host_event(task.node_id, gating_event());
            }
            completed_kinds.push(task.opcode);
            orch.notify_task_completion(task.node_id);
        }
        if orch.is_idle() {
            break;
        }
    }
    assert!(orch.is_idle());
    // 2 original + 13 synthesized.
    assert_eq!(completed_kinds.len(), 15);
    let barriers = completed_kinds
        .iter()
        .filter(|k| **k == CommandKind::PeBarrier)
        .count();
    assert_eq!(barriers, 1);
    // The downstream node retires last, after the barrier.
    assert_eq!(*completed_kinds.last().unwrap(), CommandKind::PeElementwise);
}

#[test]
fn empty_selection_falls_back_to_top_k_candidates() {
    let cfg = SimConfig::default();
    let topology = Topology::new(cfg.num_digital, cfg.num_rram);
    let mut orch = HostOrchestrator::with_graph(&cfg, topology, two_node_graph());

    orch.advance(0);
    let mut event = gating_event();
    event.selected = Vec::new();
    event.candidates = vec![7];
    event.top_k = 2;
    orch.notify_host_event(0, event);
    orch.notify_task_completion(0);

    // Candidate 7 is duplicated cyclically to fill top_k = 2.
    let experts: Vec<i64> = orch
        .graph()
        .nodes()
        .filter_map(|n| n.payload.command())
        .filter(|c| c.metadata.str_of("op") == Some("moe_stage"))
        .map(|c| c.metadata.int_or("expert", -1))
        .collect();
    assert_eq!(experts, vec![7, 7]);
}
