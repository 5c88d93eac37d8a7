use crate::meta::MetaMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEventKind {
    GatingFetch,
}

/// Event payload registered against a host node before its completion is
/// reported back to the orchestrator. Today the only producer is the MoE
/// gating-fetch path; the platform builds one of these from the `topk_select`
/// snapshot (or from command defaults when no snapshot exists).
#[derive(Debug, Clone)]
pub struct HostEvent {
    pub kind: HostEventKind,
    /// Digital chiplet that ran the gating computation.
    pub digital_id: i64,
    pub buffer_id: i64,
    pub top_k: usize,
    pub tokens: u64,
    pub features: u64,
    /// Hidden/inner dimension used for byte-size fallbacks.
    pub inner_dim: u64,
    pub candidates: Vec<i64>,
    pub selected: Vec<i64>,
    /// Byte overrides; zero means "derive from tokens/features/inner_dim".
    pub activation_bytes: u64,
    pub weight_bytes: u64,
    pub output_bytes: u64,
    /// True when the platform had to synthesize the event without a snapshot.
    pub fallback: bool,
    pub metadata: MetaMap,
}

impl HostEvent {
    pub fn gating_fetch() -> Self {
        Self {
            kind: HostEventKind::GatingFetch,
            digital_id: 0,
            buffer_id: -1,
            top_k: 1,
            tokens: 0,
            features: 0,
            inner_dim: 0,
            candidates: Vec::new(),
            selected: Vec::new(),
            activation_bytes: 0,
            weight_bytes: 0,
            output_bytes: 0,
            fallback: false,
            metadata: MetaMap::new(),
        }
    }
}
