//! Activation values supplied to a postprocess command flow through the fp16
//! alignment path and show up as a dequantized result row.

use std::fs;

use tessera_config::SimConfig;
use tessera_platform::ChipletPlatform;

#[test]
fn post_command_with_activations_produces_a_result_row() {
    let dir = tempfile::tempdir().unwrap();
    let commands = r#"[{
        "kind": "rram_post",
        "target": "rram",
        "chiplet_id": 0,
        "aux0": 8,
        "aux1": 8,
        "aux2": 8,
        "metadata": {
            "activations": [1.0, 0.25],
            "i_sum": 10240,
            "scale": 0.001,
            "zero_point": 0.0,
            "expected": 0.0
        }
    }]"#;
    let path = dir.path().join("chiplet_commands.json");
    fs::write(&path, commands).unwrap();

    let cfg = SimConfig {
        command_file: Some(path),
        ..Default::default()
    };
    let mut platform = ChipletPlatform::new(cfg).unwrap();
    platform.run_until_idle(100_000);
    assert!(platform.is_idle());

    let rows = platform.results();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    // Aligned activations: 0x400 + 0x100 = 0x500 = 1280, so
    // o_m = 10240 - 1280 * 8 = 0.
    assert_eq!(row.raw_om, 0);
    assert_eq!(row.reference, Some(0.0));
    assert!((row.final_value - 0.0).abs() < 1e-9);
    assert_eq!(row.chiplet_id, 0);

    // The comparison against the expected value landed in the error stats.
    let totals = platform.rram_chiplet(0).unwrap().totals();
    assert_eq!(totals.error_samples, 1);
}
