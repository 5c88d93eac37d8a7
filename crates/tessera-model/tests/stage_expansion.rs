use tessera_model::{expand_model, ModelSpec, StageSpec};
use tessera_types::{CommandKind, MetaMapExt};

fn stage(kind: &str) -> StageSpec {
    StageSpec {
        stage: kind.to_owned(),
        ..Default::default()
    }
}

#[test]
fn groups_chain_serially_by_default() {
    let spec = ModelSpec {
        stages: vec![stage("token_prep"), stage("attention"), stage("gemm")],
    };
    let cmds = expand_model(&spec, 0).unwrap();
    assert_eq!(cmds.len(), 3);
    assert_eq!(cmds[0].kind, CommandKind::PeTokenPrep);
    assert!(cmds[0].deps.is_empty());
    assert_eq!(cmds[1].deps, vec![cmds[0].id]);
    assert_eq!(cmds[2].deps, vec![cmds[1].id]);
}

#[test]
fn parallel_stage_forks_alongside_the_next_group() {
    let mut side = stage("elementwise");
    side.parallel = true;
    let spec = ModelSpec {
        stages: vec![stage("token_prep"), side, stage("gemm")],
    };
    let cmds = expand_model(&spec, 0).unwrap();
    // Both the parallel elementwise and the gemm hang off the token prep,
    // so they can run concurrently.
    assert_eq!(cmds[1].deps, vec![cmds[0].id]);
    assert_eq!(cmds[2].deps, vec![cmds[0].id]);
}

#[test]
fn moe_gating_emits_scores_select_fetch_with_shared_buffer() {
    let mut gating = stage("moe_gating");
    gating.buffer_id = Some(3);
    gating.top_k = 2;
    gating.experts = Some(vec![0, 1, 2, 3]);
    let spec = ModelSpec {
        stages: vec![gating],
    };
    let cmds = expand_model(&spec, 10).unwrap();
    assert_eq!(cmds.len(), 3);
    assert_eq!(cmds[0].kind, CommandKind::PeSpuOp);
    assert_eq!(cmds[1].kind, CommandKind::PeReduce);
    assert_eq!(cmds[2].kind, CommandKind::HostGatingFetch);
    assert!(cmds.iter().all(|c| c.buffer_id == 3));
    assert_eq!(cmds[0].metadata.str_of("op"), Some("moe_gating_scores"));
    assert_eq!(cmds[1].metadata.str_of("op"), Some("topk_select"));
    assert_eq!(cmds[2].metadata.int_list("experts"), vec![0, 1, 2, 3]);
    assert_eq!(cmds[1].deps, vec![cmds[0].id]);
    assert_eq!(cmds[2].deps, vec![cmds[1].id]);
}

#[test]
fn rram_linear_emits_a_phase_triplet() {
    let spec = ModelSpec {
        stages: vec![stage("rram_linear")],
    };
    let cmds = expand_model(&spec, 0).unwrap();
    let kinds: Vec<CommandKind> = cmds.iter().map(|c| c.kind).collect();
    assert_eq!(
        kinds,
        vec![
            CommandKind::RramStageAct,
            CommandKind::RramExecute,
            CommandKind::RramPost
        ]
    );
    assert_eq!(cmds[1].deps, vec![cmds[0].id]);
    assert_eq!(cmds[2].deps, vec![cmds[1].id]);
}

#[test]
fn moe_linear_fans_out_per_expert() {
    let mut linear = stage("moe_linear");
    linear.experts = Some(vec![4, 7]);
    let spec = ModelSpec {
        stages: vec![linear],
    };
    let cmds = expand_model(&spec, 0).unwrap();
    // Fan-out sync, two triplets, join sync.
    assert_eq!(cmds.len(), 8);
    assert_eq!(cmds[0].kind, CommandKind::Sync);
    let tags: Vec<_> = cmds
        .iter()
        .filter_map(|c| c.metadata.str_of("weight_tag"))
        .collect();
    assert!(tags.contains(&"expert4"));
    assert!(tags.contains(&"expert7"));
    // Both chains hang off the fan-out sync.
    assert_eq!(cmds[1].deps, vec![cmds[0].id]);
    assert_eq!(cmds[4].deps, vec![cmds[0].id]);
    // The join waits on both posts.
    assert_eq!(cmds[7].deps, vec![cmds[3].id, cmds[6].id]);
}

#[test]
fn transfer_direction_selects_the_kind_and_flag() {
    let mut xfer = stage("transfer");
    xfer.direction = Some("rram_to_digital".to_owned());
    let spec = ModelSpec {
        stages: vec![xfer],
    };
    let cmds = expand_model(&spec, 0).unwrap();
    assert_eq!(cmds[0].kind, CommandKind::XferC2d);
    assert!(cmds[0].rram_to_digital());
}

#[test]
fn unknown_stage_is_rejected() {
    let spec = ModelSpec {
        stages: vec![stage("warp_drive")],
    };
    assert!(expand_model(&spec, 0).is_err());
}

#[test]
fn host_load_and_store_bracket_the_stage() {
    let mut gemm = stage("gemm");
    gemm.host_load_kind = Some("host_to_digital".to_owned());
    gemm.host_store_kind = Some("digital_to_host".to_owned());
    let spec = ModelSpec {
        stages: vec![gemm],
    };
    let cmds = expand_model(&spec, 0).unwrap();
    assert_eq!(cmds.len(), 3);
    assert_eq!(cmds[0].kind, CommandKind::XferHost2d);
    assert_eq!(cmds[1].kind, CommandKind::PeGemm);
    assert_eq!(cmds[2].kind, CommandKind::XferD2host);
    assert_eq!(cmds[2].deps, vec![cmds[1].id]);
}
