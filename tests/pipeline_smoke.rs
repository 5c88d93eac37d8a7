//! Facade-level smoke test: a model spec flows through expansion, the
//! orchestrator, and the platform to completion.

use std::fs;

use tessera::config::SimConfig;
use tessera::platform::ChipletPlatform;

#[test]
fn model_file_drives_a_full_run() {
    let dir = tempfile::tempdir().unwrap();
    let model = r#"{
        "stages": [
            {"stage": "token_prep", "rows": 32, "cols": 64},
            {"stage": "gemm", "rows": 32, "cols": 64, "inner": 64},
            {"stage": "transfer", "direction": "digital_to_rram", "bytes": 4096},
            {"stage": "rram_linear", "rows": 32, "cols": 64, "inner": 64},
            {"stage": "transfer", "direction": "rram_to_digital", "bytes": 4096},
            {"stage": "elementwise", "rows": 32, "cols": 64}
        ]
    }"#;
    let path = dir.path().join("model.json");
    fs::write(&path, model).unwrap();

    let cfg = SimConfig {
        model_file: Some(path),
        bin_dirpath: dir.path().join("out"),
        ..Default::default()
    };
    let mut platform = ChipletPlatform::new(cfg).unwrap();
    let spent = platform.run_until_idle(500_000);
    assert!(platform.is_idle(), "model run stalled after {spent} cycles");

    let totals = platform.totals();
    // token_prep, gemm, elementwise on digital; stage/execute/post on RRAM.
    assert_eq!(totals.digital_tasks_executed, 3);
    assert_eq!(totals.rram_tasks_executed, 3);
    assert_eq!(totals.transfer_tasks_executed, 2);

    platform.write_outputs().unwrap();
    assert!(dir.path().join("out/chiplet_log.txt").exists());
}
