use std::fs;
use std::process::Command;

#[test]
fn default_run_completes_and_writes_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");

    let output = Command::new(env!("CARGO_BIN_EXE_tessera-sim"))
        .args(["--out", out.to_str().unwrap(), "--cycles", "200000"])
        .output()
        .expect("failed to run tessera-sim");

    assert!(
        output.status.success(),
        "tessera-sim exited with {}\nstderr:\n{}",
        output.status,
        String::from_utf8_lossy(&output.stderr)
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("simulated"), "stdout:\n{stdout}");

    // The bootstrap pipeline produced the standard output set.
    assert!(out.join("chiplet_log.txt").exists());
    assert!(out.join("chiplet_results.csv").exists());
    assert!(out.join("chiplet_stats.json").exists());
    let log = fs::read_to_string(out.join("chiplet_log.txt")).unwrap();
    assert!(log.contains("ChipletPlatform_DigitalTasksExecuted"));
}

#[test]
fn corrupt_config_is_a_hard_error() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = dir.path().join("config.json");
    fs::write(&cfg, "{not json").unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_tessera-sim"))
        .args(["--config", cfg.to_str().unwrap()])
        .output()
        .expect("failed to run tessera-sim");
    assert!(!output.status.success());
}
