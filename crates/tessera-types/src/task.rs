use serde::{Deserialize, Serialize};

use crate::command::{Command, CommandKind, ExecDomain, Target};
use crate::meta::MetaMap;

/// Coarse op-node classification used by the graph and the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    Compute,
    Cim,
    DataMove,
    Sync,
}

/// Payload attached to an op node.
///
/// Pre-built graphs carry full command descriptors; the synthetic bootstrap
/// graph carries bare stage labels (`"tokenize"`, `"attention"`, ...) that the
/// platform interprets positionally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodePayload {
    Command(Box<Command>),
    Stage(String),
    Empty,
}

impl NodePayload {
    pub fn command(&self) -> Option<&Command> {
        match self {
            NodePayload::Command(cmd) => Some(cmd),
            _ => None,
        }
    }

    pub fn command_mut(&mut self) -> Option<&mut Command> {
        match self {
            NodePayload::Command(cmd) => Some(cmd),
            _ => None,
        }
    }

    pub fn stage(&self) -> Option<&str> {
        match self {
            NodePayload::Stage(s) => Some(s),
            _ => None,
        }
    }
}

/// One schedulable unit of work, produced when the orchestrator releases a
/// graph node and retired when the platform reports completion.
#[derive(Debug, Clone)]
pub struct Task {
    pub node_id: u64,
    pub seq_id: u64,
    pub target: Target,
    pub op_type: OpType,
    pub opcode: CommandKind,
    pub exec_domain: Option<ExecDomain>,
    /// Latency in cycles of the target's clock domain.
    pub latency: u64,
    pub enqueue_cycle: u64,
    pub src: (i32, i32),
    pub dst: (i32, i32),
    pub host_addr: i64,
    pub buffer_id: i64,
    pub sub_op: i64,
    pub request_bytes: u64,
    pub response_bytes: u64,
    pub payload: NodePayload,
    pub metadata: MetaMap,
}

impl Task {
    pub fn command(&self) -> Option<&Command> {
        self.payload.command()
    }
}
