//! Full MoE flow through the platform: gating scores -> topk_select snapshot ->
//! host gating fetch -> per-expert RRAM chains -> barrier -> downstream merge.

use std::fs;

use tessera_config::SimConfig;
use tessera_platform::ChipletPlatform;

#[test]
fn gating_session_completes_with_snapshot_hit() {
    let dir = tempfile::tempdir().unwrap();
    let commands = r#"[
        {
            "id": 0,
            "kind": "pe_reduce",
            "target": "digital",
            "chiplet_id": 0,
            "buffer_id": 3,
            "aux0": 16,
            "aux1": 8,
            "metadata": {
                "op": "topk_select",
                "top_k": 2,
                "experts": [0, 1, 2, 3],
                "gating_scores": [0.1, 0.8, 0.3, 0.9]
            }
        },
        {
            "id": 1,
            "kind": "host_gating_fetch",
            "target": "host",
            "chiplet_id": 0,
            "buffer_id": 3,
            "deps": [0]
        },
        {
            "id": 2,
            "kind": "pe_elementwise",
            "target": "digital",
            "aux0": 16,
            "aux1": 8,
            "deps": [1]
        }
    ]"#;
    let path = dir.path().join("chiplet_commands.json");
    fs::write(&path, commands).unwrap();

    let cfg = SimConfig {
        command_file: Some(path),
        ..Default::default()
    };
    let mut platform = ChipletPlatform::new(cfg).unwrap();
    let spent = platform.run_until_idle(500_000);
    assert!(platform.is_idle(), "moe run stalled after {spent} cycles");

    let totals = platform.totals();
    assert_eq!(totals.moe_events_total, 1);
    assert_eq!(totals.moe_snapshot_hits, 1);
    assert_eq!(totals.moe_snapshot_misses, 0);
    assert_eq!(totals.moe_fallback_events, 0);
    assert_eq!(totals.moe_sessions_completed, 1);
    assert_eq!(totals.moe_latency_samples, 1);
    assert!(totals.moe_latency_max > 0);

    // Experts 3 and 1 carry the two best scores; each ran a
    // stage/execute/post triplet on some RRAM chiplet.
    assert_eq!(totals.rram_tasks_executed, 6);
    // Two transfers per expert plus nothing else.
    assert_eq!(totals.transfer_tasks_executed, 4);
    // topk_select, two merges, the barrier, and the downstream elementwise.
    assert_eq!(totals.digital_tasks_executed, 5);

    // The per-expert weight tags were registered on their chiplets.
    let resident: usize = (0..2)
        .map(|i| platform.rram_chiplet(i).unwrap().directory.len())
        .sum();
    assert_eq!(resident, 2);
}

#[test]
fn gating_fetch_without_snapshot_counts_a_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let commands = r#"[
        {
            "id": 0,
            "kind": "host_gating_fetch",
            "target": "host",
            "chiplet_id": 0,
            "buffer_id": 9,
            "metadata": {"top_k": 1, "experts": [5]}
        }
    ]"#;
    let path = dir.path().join("chiplet_commands.json");
    fs::write(&path, commands).unwrap();

    let cfg = SimConfig {
        command_file: Some(path),
        ..Default::default()
    };
    let mut platform = ChipletPlatform::new(cfg).unwrap();
    platform.run_until_idle(500_000);

    let totals = platform.totals();
    assert_eq!(totals.moe_events_total, 1);
    assert_eq!(totals.moe_snapshot_misses, 1);
    assert_eq!(totals.moe_fallback_events, 1);
    assert_eq!(totals.moe_sessions_completed, 1);
    // One expert chain: three RRAM phases, two transfers, merge + barrier.
    assert_eq!(totals.rram_tasks_executed, 3);
    assert_eq!(totals.transfer_tasks_executed, 2);
}
