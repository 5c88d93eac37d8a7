//! Stage -> command-group expansion.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use tessera_types::{Command, CommandKind, MetaMap, MetaValue};

use crate::manifest::kernel_entry;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to read model file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse model file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown stage kind `{0}`")]
    UnknownStage(String),
    #[error("unknown transfer direction `{0}`")]
    UnknownDirection(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StageSpec {
    pub stage: String,
    pub parallel: bool,
    pub rows: u64,
    pub cols: u64,
    pub inner: u64,
    pub bytes: u64,
    pub latency: u64,
    pub top_k: u64,
    pub experts: Option<Vec<i64>>,
    pub direction: Option<String>,
    pub host_load_kind: Option<String>,
    pub host_store_kind: Option<String>,
    pub buffer_id: Option<i64>,
    pub sub_op: Option<i64>,
    pub cache_line: Option<i64>,
    pub src_x: Option<i32>,
    pub src_y: Option<i32>,
    pub dst_x: Option<i32>,
    pub dst_y: Option<i32>,
    pub metadata: MetaMap,
}

impl Default for StageSpec {
    fn default() -> Self {
        Self {
            stage: String::new(),
            parallel: false,
            rows: 0,
            cols: 0,
            inner: 0,
            bytes: 0,
            latency: 0,
            top_k: 0,
            experts: None,
            direction: None,
            host_load_kind: None,
            host_store_kind: None,
            buffer_id: None,
            sub_op: None,
            cache_line: None,
            src_x: None,
            src_y: None,
            dst_x: None,
            dst_y: None,
            metadata: MetaMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ModelSpec {
    #[serde(default)]
    pub stages: Vec<StageSpec>,
}

/// Load a model file. Missing file is soft (empty model, warning); a corrupt
/// file is soft too, matching the command-file discipline.
pub fn load_model(path: &Path) -> ModelSpec {
    if !path.exists() {
        warn!(path = %path.display(), "model file missing, expanding nothing");
        return ModelSpec::default();
    }
    match fs::read_to_string(path) {
        Ok(text) => match serde_json::from_str(&text) {
            Ok(spec) => spec,
            Err(err) => {
                warn!(path = %path.display(), %err, "model file unparsable, expanding nothing");
                ModelSpec::default()
            }
        },
        Err(err) => {
            warn!(path = %path.display(), %err, "model file unreadable, expanding nothing");
            ModelSpec::default()
        }
    }
}

struct Expander {
    commands: Vec<Command>,
    next_id: i64,
    /// Tail ids of the previous serial group; heads of the next group depend
    /// on them.
    prev_tail: Vec<i64>,
}

impl Expander {
    fn alloc(&mut self, kind: CommandKind, stage: &StageSpec) -> Command {
        let mut cmd = Command::new(kind);
        cmd.id = self.next_id;
        self.next_id += 1;
        cmd.latency = stage.latency as i64;
        cmd.aux0 = stage.rows as u32;
        cmd.aux1 = stage.cols as u32;
        cmd.aux2 = stage.inner as u32;
        cmd.payload_bytes = stage.bytes as i64;
        // Stage overrides apply to every descriptor it generates.
        if let Some(v) = stage.buffer_id {
            cmd.buffer_id = v;
        }
        if let Some(v) = stage.sub_op {
            cmd.sub_op = v;
        }
        if let Some(v) = stage.cache_line {
            cmd.cache_line = v;
        }
        if let Some(v) = stage.src_x {
            cmd.src_x = v;
        }
        if let Some(v) = stage.src_y {
            cmd.src_y = v;
        }
        if let Some(v) = stage.dst_x {
            cmd.dst_x = v;
        }
        if let Some(v) = stage.dst_y {
            cmd.dst_y = v;
        }
        for (k, v) in &stage.metadata {
            cmd.metadata.insert(k.clone(), v.clone());
        }
        cmd
    }

    /// A group's head hangs off the previous serial tail. A parallel group
    /// leaves the tail untouched, so it forks off alongside whatever group
    /// comes next instead of serializing with it.
    fn push_group(&mut self, mut group: Vec<Command>, parallel: bool) {
        if group.is_empty() {
            return;
        }
        if let Some(head) = group.first_mut() {
            if head.deps.is_empty() {
                head.deps = self.prev_tail.clone();
            }
        }
        if !parallel {
            self.prev_tail = vec![group.last().expect("nonempty group").id];
        }
        self.commands.extend(group);
    }
}

fn transfer_kind(direction: &str) -> Result<(CommandKind, u32), ModelError> {
    match direction {
        "host_to_digital" => Ok((CommandKind::XferHost2d, 0)),
        "digital_to_host" => Ok((CommandKind::XferD2host, 0)),
        "digital_to_rram" => Ok((CommandKind::XferD2c, 0)),
        "rram_to_digital" => Ok((CommandKind::XferC2d, 1)),
        other => Err(ModelError::UnknownDirection(other.to_owned())),
    }
}

/// Expand every stage into its command group. Ids are assigned sequentially
/// starting at `base_id`; groups chain serially unless a stage opts out with
/// `parallel`.
pub fn expand_model(spec: &ModelSpec, base_id: i64) -> Result<Vec<Command>, ModelError> {
    let mut ex = Expander {
        commands: Vec::new(),
        next_id: base_id,
        prev_tail: Vec::new(),
    };

    for stage in &spec.stages {
        // Manifest defaults backfill unset sizes.
        let mut stage = stage.clone();
        if let Some(entry) = kernel_entry(&stage.stage) {
            if stage.rows == 0 {
                stage.rows = entry.default.rows;
            }
            if stage.cols == 0 {
                stage.cols = entry.default.cols;
            }
            if stage.latency == 0 {
                stage.latency = entry.default.latency;
            }
            if stage.bytes == 0 {
                stage.bytes = entry.default.bytes;
            }
            for (k, v) in &entry.metadata {
                stage.metadata.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }

        let mut group = Vec::new();

        if let Some(kind) = &stage.host_load_kind {
            let (k, flags) = transfer_kind(kind)?;
            let mut cmd = ex.alloc(k, &stage);
            cmd.flags = flags;
            group.push(cmd);
        }

        match stage.stage.as_str() {
            "token_prep" => group.push(ex.alloc(CommandKind::PeTokenPrep, &stage)),
            "attention" => group.push(ex.alloc(CommandKind::PeAttentionHead, &stage)),
            "gemm" => group.push(ex.alloc(CommandKind::PeGemm, &stage)),
            "softmax" | "layernorm" => {
                let mut cmd = ex.alloc(CommandKind::PeSpuOp, &stage);
                cmd.metadata
                    .entry("op".to_owned())
                    .or_insert_with(|| MetaValue::from(stage.stage.clone()));
                group.push(cmd);
            }
            "residual" | "elementwise" => {
                let mut cmd = ex.alloc(CommandKind::PeElementwise, &stage);
                cmd.metadata
                    .entry("op".to_owned())
                    .or_insert_with(|| MetaValue::from(stage.stage.clone()));
                group.push(cmd);
            }
            "sync" => group.push(ex.alloc(CommandKind::Sync, &stage)),
            "transfer" => {
                let direction = stage.direction.as_deref().unwrap_or("host_to_digital");
                let (k, flags) = transfer_kind(direction)?;
                let mut cmd = ex.alloc(k, &stage);
                cmd.flags = flags;
                group.push(cmd);
            }
            "moe_gating" => {
                let buffer_id = stage.buffer_id.unwrap_or(0);
                let top_k = if stage.top_k == 0 { 2 } else { stage.top_k };

                let mut scores = ex.alloc(CommandKind::PeSpuOp, &stage);
                scores.buffer_id = buffer_id;
                scores
                    .metadata
                    .insert("op".to_owned(), MetaValue::from("moe_gating_scores"));
                scores
                    .metadata
                    .insert("top_k".to_owned(), MetaValue::from(top_k as i64));

                let mut select = ex.alloc(CommandKind::PeReduce, &stage);
                select.buffer_id = buffer_id;
                select
                    .metadata
                    .insert("op".to_owned(), MetaValue::from("topk_select"));
                select
                    .metadata
                    .insert("top_k".to_owned(), MetaValue::from(top_k as i64));
                select.deps = vec![scores.id];

                let mut fetch = ex.alloc(CommandKind::HostGatingFetch, &stage);
                fetch.buffer_id = buffer_id;
                fetch
                    .metadata
                    .insert("top_k".to_owned(), MetaValue::from(top_k as i64));
                if let Some(experts) = &stage.experts {
                    fetch
                        .metadata
                        .insert("experts".to_owned(), MetaValue::IntList(experts.clone()));
                }
                fetch.deps = vec![select.id];

                group.extend([scores, select, fetch]);
            }
            "rram_linear" | "moe_linear" => {
                let experts: Vec<Option<i64>> = match (&stage.stage[..], &stage.experts) {
                    ("moe_linear", Some(list)) if !list.is_empty() => {
                        list.iter().copied().map(Some).collect()
                    }
                    _ => vec![None],
                };
                // Expert chains fan out from the group head; each triplet is
                // serial within itself.
                let mut fanout_dep = group.last().map(|c: &Command| c.id);
                if experts.len() > 1 && fanout_dep.is_none() {
                    let sync = ex.alloc(CommandKind::Sync, &stage);
                    fanout_dep = Some(sync.id);
                    group.push(sync);
                }
                let mut chain_tails = Vec::new();
                for expert in experts {
                    let mut prev: Option<i64> = fanout_dep;
                    for kind in [
                        CommandKind::RramStageAct,
                        CommandKind::RramExecute,
                        CommandKind::RramPost,
                    ] {
                        let mut cmd = ex.alloc(kind, &stage);
                        if let Some(e) = expert {
                            cmd.metadata.insert("expert".to_owned(), MetaValue::from(e));
                            cmd.metadata.insert(
                                "weight_tag".to_owned(),
                                MetaValue::from(format!("expert{e}")),
                            );
                        }
                        if let Some(p) = prev {
                            cmd.deps = vec![p];
                        }
                        prev = Some(cmd.id);
                        group.push(cmd);
                    }
                    chain_tails.extend(prev);
                }
                if chain_tails.len() > 1 {
                    let mut join = ex.alloc(CommandKind::Sync, &stage);
                    join.deps = chain_tails;
                    group.push(join);
                }
            }
            other => return Err(ModelError::UnknownStage(other.to_owned())),
        }

        if let Some(kind) = &stage.host_store_kind {
            let (k, flags) = transfer_kind(kind)?;
            let mut cmd = ex.alloc(k, &stage);
            cmd.flags = flags;
            if let Some(prev) = group.last() {
                cmd.deps = vec![prev.id];
            }
            group.push(cmd);
        }

        // Inside a group, undeclared dependencies default to a serial chain;
        // the RRAM expert fan-out above declared its own.
        for i in 1..group.len() {
            if group[i].deps.is_empty() {
                group[i].deps = vec![group[i - 1].id];
            }
        }

        ex.push_group(group, stage.parallel);
    }
    Ok(ex.commands)
}
