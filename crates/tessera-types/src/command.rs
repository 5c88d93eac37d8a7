use serde::{Deserialize, Serialize};

use crate::meta::MetaMap;

/// Low bit of [`Command::flags`]: when set, an inter-chiplet transfer runs
/// RRAM -> digital instead of digital -> RRAM.
pub const TRANSFER_DIR_RRAM_TO_DIGITAL: u32 = 1;

/// Which class of hardware a command is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Digital,
    Rram,
    Transfer,
    Host,
}

/// Execution domain inside a target class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecDomain {
    PeArray,
    Spu,
    Vpu,
    Reduce,
    Cim,
    Dma,
    Host,
}

/// The closed set of command kinds accepted from a command file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    PeGemm,
    PeAttentionHead,
    PeElementwise,
    PeTokenPrep,
    PeSpuOp,
    PeVpuOp,
    PeReduce,
    PeBufferAlloc,
    PeBufferRelease,
    PeBarrier,
    RramStageAct,
    RramExecute,
    RramPost,
    RramWeightLoad,
    XferSchedule,
    XferC2d,
    XferD2c,
    XferHost2d,
    XferD2host,
    Sync,
    HostEmbedLookup,
    HostRouterPrep,
    HostLmHead,
    HostSync,
    HostGatingFetch,
}

impl CommandKind {
    /// Default dispatch target for the kind; a command file may override.
    pub fn default_target(self) -> Target {
        use CommandKind::*;
        match self {
            PeGemm | PeAttentionHead | PeElementwise | PeTokenPrep | PeSpuOp | PeVpuOp
            | PeReduce | PeBufferAlloc | PeBufferRelease | PeBarrier => Target::Digital,
            RramStageAct | RramExecute | RramPost | RramWeightLoad => Target::Rram,
            XferSchedule | XferC2d | XferD2c | XferHost2d | XferD2host => Target::Transfer,
            Sync => Target::Digital,
            HostEmbedLookup | HostRouterPrep | HostLmHead | HostSync | HostGatingFetch => {
                Target::Host
            }
        }
    }

    pub fn is_transfer(self) -> bool {
        self.default_target() == Target::Transfer
    }
}

/// Wire-level command descriptor, one element of `chiplet_commands.json`.
///
/// All fields other than `kind` default so hand-written command files stay
/// short. `chiplet_id < 0` means "let the orchestrator place it".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Command {
    pub id: i64,
    pub kind: CommandKind,
    pub target: Target,
    pub exec_domain: Option<ExecDomain>,
    pub chiplet_id: i64,
    pub queue: i64,
    pub payload_addr: i64,
    pub payload_bytes: i64,
    pub aux0: u32,
    pub aux1: u32,
    pub aux2: u32,
    pub aux3: u32,
    pub flags: u32,
    pub latency: i64,
    pub src_x: i32,
    pub src_y: i32,
    pub dst_x: i32,
    pub dst_y: i32,
    pub cache_line: i64,
    pub buffer_id: i64,
    pub sub_op: i64,
    pub metadata: MetaMap,
    pub deps: Vec<i64>,
}

impl Default for Command {
    fn default() -> Self {
        Self {
            id: -1,
            kind: CommandKind::Sync,
            target: Target::Digital,
            exec_domain: None,
            chiplet_id: -1,
            queue: -1,
            payload_addr: 0,
            payload_bytes: 0,
            aux0: 0,
            aux1: 0,
            aux2: 0,
            aux3: 0,
            flags: 0,
            latency: 0,
            src_x: -1,
            src_y: -1,
            dst_x: -1,
            dst_y: -1,
            cache_line: -1,
            buffer_id: -1,
            sub_op: 0,
            metadata: MetaMap::new(),
            deps: Vec::new(),
        }
    }
}

impl Command {
    pub fn new(kind: CommandKind) -> Self {
        Self {
            kind,
            target: kind.default_target(),
            ..Self::default()
        }
    }

    /// Transfer direction from the flag word (only meaningful for transfers).
    pub fn rram_to_digital(&self) -> bool {
        self.flags & TRANSFER_DIR_RRAM_TO_DIGITAL != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_are_snake_case_on_the_wire() {
        let json = serde_json::to_string(&CommandKind::RramStageAct).unwrap();
        assert_eq!(json, "\"rram_stage_act\"");
        let kind: CommandKind = serde_json::from_str("\"host_gating_fetch\"").unwrap();
        assert_eq!(kind, CommandKind::HostGatingFetch);
    }

    #[test]
    fn sparse_command_json_fills_defaults() {
        let cmd: Command =
            serde_json::from_str(r#"{"kind": "pe_gemm", "target": "digital", "aux0": 256}"#)
                .unwrap();
        assert_eq!(cmd.kind, CommandKind::PeGemm);
        assert_eq!(cmd.aux0, 256);
        assert_eq!(cmd.chiplet_id, -1);
        assert!(cmd.deps.is_empty());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(serde_json::from_str::<CommandKind>("\"pe_fused_moe\"").is_err());
    }

    #[test]
    fn flag_low_bit_selects_direction() {
        let mut cmd = Command::new(CommandKind::XferSchedule);
        assert!(!cmd.rram_to_digital());
        cmd.flags = 1;
        assert!(cmd.rram_to_digital());
    }
}
