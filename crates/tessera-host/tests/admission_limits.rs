//! Outstanding-byte budgets defer work instead of oversubscribing buffers.

use tessera_config::SimConfig;
use tessera_graph::{OpGraph, OpNode};
use tessera_host::HostOrchestrator;
use tessera_topology::Topology;
use tessera_types::{Command, CommandKind, NodePayload, OpType, Target};

fn gemm_node(id: u64, m: u32, n: u32, k: u32) -> OpNode {
    let mut cmd = Command::new(CommandKind::PeGemm);
    cmd.id = id as i64;
    cmd.aux0 = m;
    cmd.aux1 = n;
    cmd.aux2 = k;
    let mut node = OpNode::new(id, OpType::Compute, Target::Digital);
    node.payload = NodePayload::Command(Box::new(cmd));
    node
}

#[test]
fn second_gemm_waits_for_the_first_to_release_its_bytes() {
    let cfg = SimConfig {
        digital_activation_bytes: 200 * 1024,
        digital_scratch_bytes: 100 * 1024,
        host_limit_resources: true,
        ..Default::default()
    };

    // Two parallel 256x256x128 GEMMs and a merge transfer behind both.
    let mut graph = OpGraph::new();
    graph.add_node(gemm_node(0, 256, 256, 128));
    graph.add_node(gemm_node(1, 256, 256, 128));
    let mut xfer = Command::new(CommandKind::XferD2c);
    xfer.id = 2;
    xfer.payload_bytes = 16 * 1024;
    xfer.deps = vec![0, 1];
    let mut merge = OpNode::new(2, OpType::DataMove, Target::Transfer);
    merge.deps = vec![0, 1];
    merge.payload = NodePayload::Command(Box::new(xfer));
    graph.add_node(merge);
    graph.add_edge(0, 2);
    graph.add_edge(1, 2);

    let topology = Topology::new(cfg.num_digital, cfg.num_rram);
    let mut orch = HostOrchestrator::with_graph(&cfg, topology, graph);

    // Each GEMM wants 256*128*2 + 128*256*2 + 256*256*2 = 256 KiB of the
    // 300 KiB digital budget, so only one fits at a time.
    let tasks = orch.advance(0);
    assert_eq!(tasks.len(), 1);
    let first = tasks[0].node_id;

    // Still deferred while the first is outstanding.
    assert!(orch.advance(1).is_empty());

    orch.notify_task_completion(first);
    let tasks = orch.advance(2);
    assert_eq!(tasks.len(), 1);
    let second = tasks[0].node_id;
    assert_ne!(first, second);

    // The merge transfer releases only after both dependencies completed.
    assert!(orch.advance(3).is_empty());
    orch.notify_task_completion(second);
    let tasks = orch.advance(4);
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].opcode, CommandKind::XferD2c);
    orch.notify_task_completion(tasks[0].node_id);
    assert!(orch.is_idle());
    assert_eq!(orch.outstanding(), Default::default());
}

#[test]
fn backpressure_converts_long_waits_into_idle_cycles() {
    let cfg = SimConfig {
        min_wait_cycles: 4,
        ..Default::default()
    };
    let mut graph = OpGraph::new();
    graph.add_node(gemm_node(0, 16, 16, 16));
    let topology = Topology::new(cfg.num_digital, cfg.num_rram);
    let mut orch = HostOrchestrator::with_graph(&cfg, topology, graph);

    orch.notify_backpressure(20);
    assert_eq!(orch.throttle_cycles(), 5);
    for cycle in 0..5 {
        assert!(orch.advance(cycle).is_empty());
    }
    // Throttle exhausted, the node issues.
    assert_eq!(orch.advance(5).len(), 1);
}

#[test]
fn waits_at_or_below_the_floor_do_not_throttle() {
    let cfg = SimConfig {
        min_wait_cycles: 4,
        ..Default::default()
    };
    let mut graph = OpGraph::new();
    graph.add_node(gemm_node(0, 16, 16, 16));
    let topology = Topology::new(cfg.num_digital, cfg.num_rram);
    let mut orch = HostOrchestrator::with_graph(&cfg, topology, graph);
    orch.notify_backpressure(4);
    assert_eq!(orch.throttle_cycles(), 0);
}
