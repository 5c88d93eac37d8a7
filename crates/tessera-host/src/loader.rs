//! Command-file loading and graph construction.

use std::fs;
use std::path::Path;

use tracing::warn;

use tessera_config::SimConfig;
use tessera_graph::{OpGraph, OpNode};
use tessera_types::{Command, CommandKind, NodePayload, OpType, Target};

/// Read a `chiplet_commands.json` array. Both a missing file and a parse
/// error are soft: the caller falls back to the bootstrap graph.
pub fn load_commands(path: &Path) -> Option<Vec<Command>> {
    if !path.exists() {
        warn!(path = %path.display(), "command file missing, using bootstrap graph");
        return None;
    }
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            warn!(path = %path.display(), %err, "command file unreadable, using bootstrap graph");
            return None;
        }
    };
    match serde_json::from_str::<Vec<Command>>(&text) {
        Ok(commands) => Some(commands),
        Err(err) => {
            warn!(path = %path.display(), %err, "command file unparsable, using bootstrap graph");
            None
        }
    }
}

fn op_type_for(kind: CommandKind, target: Target) -> OpType {
    match target {
        Target::Transfer => OpType::DataMove,
        Target::Rram => OpType::Cim,
        Target::Host => OpType::Sync,
        Target::Digital => match kind {
            CommandKind::Sync | CommandKind::PeBarrier => OpType::Sync,
            _ => OpType::Compute,
        },
    }
}

/// Build an op graph from a command list.
///
/// Commands without an id get sequential ones; a command with an empty
/// dependency list depends on its predecessor, so a serial program needs no
/// explicit edges; a missing latency defaults to the configured wait floor.
pub fn build_graph_from_commands(commands: &[Command], min_wait_cycles: u64) -> OpGraph {
    let mut graph = OpGraph::new();
    let mut prev_id: Option<i64> = None;
    let mut next_auto_id = commands
        .iter()
        .map(|c| c.id)
        .max()
        .unwrap_or(-1)
        .max(-1)
        + 1;

    let mut assigned: Vec<(i64, Command)> = Vec::with_capacity(commands.len());
    for cmd in commands {
        let mut cmd = cmd.clone();
        let id = if cmd.id < 0 {
            let id = next_auto_id;
            next_auto_id += 1;
            id
        } else {
            cmd.id
        };
        cmd.id = id;
        if cmd.deps.is_empty() {
            if let Some(prev) = prev_id {
                cmd.deps = vec![prev];
            }
        }
        if cmd.latency <= 0 {
            cmd.latency = min_wait_cycles as i64;
        }
        prev_id = Some(id);
        assigned.push((id, cmd));
    }

    // Dependencies must name commands that exist; dangling references are
    // dropped with a warning rather than deadlocking the node forever.
    let known: std::collections::BTreeSet<i64> = assigned.iter().map(|(id, _)| *id).collect();
    for (id, cmd) in &mut assigned {
        let before = cmd.deps.len();
        cmd.deps.retain(|d| known.contains(d));
        if cmd.deps.len() != before {
            warn!(command = *id, "dropped dangling dependency references");
        }
    }

    for (id, cmd) in &assigned {
        let node_id = *id as u64;
        let mut node = OpNode::new(node_id, op_type_for(cmd.kind, cmd.target), cmd.target);
        node.latency = cmd.latency.max(0) as u64;
        node.deps = cmd.deps.iter().map(|&d| d as u64).collect();
        node.payload = NodePayload::Command(Box::new(cmd.clone()));
        graph.add_node(node);
    }
    for (id, cmd) in &assigned {
        for dep in &cmd.deps {
            graph.add_edge(*dep as u64, *id as u64);
        }
    }
    graph
}

/// Six-node synthetic pipeline used when no command file is available:
/// tokenize -> attention -> transfer->RRAM -> cim -> transfer->digital ->
/// postprocess, with latencies sized from the configured array geometry.
pub fn bootstrap_graph(cfg: &SimConfig) -> OpGraph {
    let transfer_cycles = cfg
        .transfer_bytes_estimate()
        .div_ceil(cfg.transfer_bandwidth_bytes())
        .max(1);
    let stages: [(&str, Target, OpType, u64); 6] = [
        ("tokenize", Target::Digital, OpType::Compute, 64),
        (
            "attention",
            Target::Digital,
            OpType::Compute,
            u64::from(cfg.pe_rows),
        ),
        (
            "transfer_to_rram",
            Target::Transfer,
            OpType::DataMove,
            transfer_cycles,
        ),
        ("cim", Target::Rram, OpType::Cim, u64::from(cfg.sa_rows)),
        (
            "transfer_to_digital",
            Target::Transfer,
            OpType::DataMove,
            transfer_cycles,
        ),
        ("postprocess", Target::Digital, OpType::Compute, 32),
    ];

    let mut graph = OpGraph::new();
    for (i, (label, target, op_type, latency)) in stages.iter().enumerate() {
        let id = i as u64;
        let mut node = OpNode::new(id, *op_type, *target);
        node.latency = *latency;
        node.payload = NodePayload::Stage((*label).to_owned());
        if i > 0 {
            node.deps = vec![id - 1];
        }
        graph.add_node(node);
        if i > 0 {
            graph.add_edge(id - 1, id);
        }
    }
    graph
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_types::Command;

    #[test]
    fn serial_program_needs_no_edges() {
        let commands = vec![
            Command::new(CommandKind::PeGemm),
            Command::new(CommandKind::PeElementwise),
            Command::new(CommandKind::XferD2c),
        ];
        let graph = build_graph_from_commands(&commands, 4);
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.roots(), vec![0]);
        assert_eq!(graph.successors(0), &[1]);
        assert_eq!(graph.successors(1), &[2]);
    }

    #[test]
    fn missing_latency_defaults_to_wait_floor() {
        let commands = vec![Command::new(CommandKind::PeGemm)];
        let graph = build_graph_from_commands(&commands, 7);
        let node = graph.node(0).unwrap();
        assert_eq!(node.payload.command().unwrap().latency, 7);
    }

    #[test]
    fn explicit_ids_are_preserved_and_gaps_autofilled() {
        let mut a = Command::new(CommandKind::PeGemm);
        a.id = 10;
        let b = Command::new(CommandKind::PeElementwise); // auto id
        let commands = vec![a, b];
        let graph = build_graph_from_commands(&commands, 1);
        assert!(graph.node(10).is_some());
        assert!(graph.node(11).is_some());
        assert_eq!(graph.successors(10), &[11]);
    }

    #[test]
    fn dangling_dependencies_are_dropped() {
        let mut cmd = Command::new(CommandKind::PeGemm);
        cmd.deps = vec![99];
        let graph = build_graph_from_commands(&[cmd], 1);
        assert!(graph.node(0).unwrap().deps.is_empty());
        assert_eq!(graph.roots(), vec![0]);
    }

    #[test]
    fn bootstrap_graph_is_a_six_stage_chain() {
        let graph = bootstrap_graph(&SimConfig::default());
        assert_eq!(graph.len(), 6);
        assert_eq!(graph.roots(), vec![0]);
        assert_eq!(graph.node(2).unwrap().payload.stage(), Some("transfer_to_rram"));
        assert_eq!(graph.node(3).unwrap().target, Target::Rram);
    }
}
