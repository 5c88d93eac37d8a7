//! Regression for the transfer rollback contract: when any reservation inside
//! a transfer fails, every buffer adjustment made so far is undone, including
//! the RRAM-side staging counters, and the transfer is not counted.

use std::fs;

use tessera_config::SimConfig;
use tessera_platform::ChipletPlatform;
use tessera_rram::RramBufferKind;
use tessera_types::BufferKind;

fn write_commands(dir: &tempfile::TempDir, json: &str) -> std::path::PathBuf {
    let path = dir.path().join("chiplet_commands.json");
    fs::write(&path, json).unwrap();
    path
}

#[test]
fn failed_scratch_reserve_rolls_back_the_rram_output_release() {
    let dir = tempfile::tempdir().unwrap();
    // One RRAM->digital transfer moving more bytes than the destination
    // scratch can ever hold.
    let commands = write_commands(
        &dir,
        r#"[{
            "kind": "xfer_c2d",
            "target": "transfer",
            "flags": 1,
            "payload_bytes": 99999999,
            "metadata": {"src_rram": 0, "dst_digital": 0}
        }]"#,
    );
    let cfg = SimConfig {
        command_file: Some(commands),
        digital_scratch_bytes: 64 * 1024,
        host_limit_resources: false,
        ..Default::default()
    };
    let mut platform = ChipletPlatform::new(cfg).unwrap();

    // Park some produced bytes in the RRAM output staging buffer.
    platform
        .rram_chiplet_mut(0)
        .unwrap()
        .adjust_buffer(RramBufferKind::Output, 4096);
    let before = platform
        .rram_chiplet(0)
        .unwrap()
        .buffer_occupancy(RramBufferKind::Output);
    assert_eq!(before, 4096);

    platform.run(20);

    // The destination reserve failed, so the source release must have been
    // undone in full.
    let after = platform
        .rram_chiplet(0)
        .unwrap()
        .buffer_occupancy(RramBufferKind::Output);
    assert_eq!(after, before);
    assert_eq!(
        platform
            .digital_chiplet(0)
            .unwrap()
            .buffer_usage(BufferKind::Scratch),
        0
    );
    let totals = platform.totals();
    assert_eq!(totals.transfer_tasks_executed, 0);
    assert!(totals.transfer_throttle_events_total >= 1);
    assert!(platform.transfer_throttle_until() > 0 || totals.transfer_throttle_cycles_total > 0);
}

#[test]
fn successful_transfer_counts_bytes_and_hops() {
    let dir = tempfile::tempdir().unwrap();
    let commands = write_commands(
        &dir,
        r#"[{
            "kind": "xfer_d2c",
            "target": "transfer",
            "payload_bytes": 2048,
            "metadata": {"src_digital": 0, "dst_rram": 1}
        }]"#,
    );
    let cfg = SimConfig {
        command_file: Some(commands),
        ..Default::default()
    };
    let mut platform = ChipletPlatform::new(cfg).unwrap();
    platform.run_until_idle(10_000);

    let totals = platform.totals();
    assert_eq!(totals.transfer_tasks_executed, 1);
    assert_eq!(totals.total_transfer_bytes, 2048);
    assert_eq!(totals.transfer_to_rram_bytes, 2048);
    assert!(totals.total_transfer_hops >= 1);
    assert!(totals.pe_interconnect_energy_pj > 0.0);
    // The staged bytes landed in RRAM chiplet 1's input buffer.
    assert_eq!(
        platform
            .rram_chiplet(1)
            .unwrap()
            .buffer_occupancy(RramBufferKind::Input),
        2048
    );
}
