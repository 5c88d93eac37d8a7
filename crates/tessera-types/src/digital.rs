use serde::{Deserialize, Serialize};

/// Named SRAM regions inside a digital compute cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferKind {
    Activation,
    Weights,
    Scratch,
}

impl BufferKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "activation" => Some(BufferKind::Activation),
            "weights" => Some(BufferKind::Weights),
            "scratch" => Some(BufferKind::Scratch),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BufferKind::Activation => "activation",
            BufferKind::Weights => "weights",
            BufferKind::Scratch => "scratch",
        }
    }
}

/// Problem description handed from the platform driver to a digital chiplet.
#[derive(Debug, Clone, PartialEq)]
pub struct DigitalTaskDesc {
    pub m: u64,
    pub n: u64,
    pub k: u64,
    pub tile_m: u64,
    pub tile_n: u64,
    pub tile_k: u64,
    pub input_bytes: u64,
    pub weight_bytes: u64,
    pub output_bytes: u64,
    pub scalar_ops: u64,
    pub vector_ops: u64,
    pub special_ops: u64,
    pub vpu_ops: u64,
    pub requires_pe: bool,
    pub requires_spu: bool,
    pub requires_vpu: bool,
    pub target_buffer: BufferKind,
    /// Ceiling on how many PE arrays one task may occupy per wave.
    pub pe_concurrency: Option<u64>,
    pub preferred_cluster: Option<usize>,
    /// Buffer-alloc/release and barrier commands route through here.
    pub unit_hint: DigitalUnit,
}

/// Which waiting queue a digital task lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigitalUnit {
    Pe,
    Spu,
    Vpu,
    Buffer,
    Barrier,
    Misc,
}

impl Default for DigitalTaskDesc {
    fn default() -> Self {
        Self {
            m: 0,
            n: 0,
            k: 0,
            tile_m: 0,
            tile_n: 0,
            tile_k: 0,
            input_bytes: 0,
            weight_bytes: 0,
            output_bytes: 0,
            scalar_ops: 0,
            vector_ops: 0,
            special_ops: 0,
            vpu_ops: 0,
            requires_pe: false,
            requires_spu: false,
            requires_vpu: false,
            target_buffer: BufferKind::Scratch,
            pe_concurrency: None,
            preferred_cluster: None,
            unit_hint: DigitalUnit::Misc,
        }
    }
}
