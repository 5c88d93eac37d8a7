//! With no command file at all, the platform runs the synthetic six-stage
//! bootstrap pipeline to completion.

use tessera_config::SimConfig;
use tessera_platform::ChipletPlatform;

#[test]
fn bootstrap_pipeline_drains_to_idle() {
    let cfg = SimConfig {
        command_file: None,
        model_file: None,
        ..Default::default()
    };
    let mut platform = ChipletPlatform::new(cfg).unwrap();
    let spent = platform.run_until_idle(200_000);
    assert!(platform.is_idle(), "bootstrap run stalled after {spent} cycles");

    let totals = platform.totals();
    // tokenize, attention, postprocess on digital; one cim op; two transfers.
    assert_eq!(totals.digital_tasks_executed, 3);
    assert_eq!(totals.rram_tasks_executed, 1);
    assert_eq!(totals.transfer_tasks_executed, 2);
    assert_eq!(totals.transfer_to_rram_bytes + totals.transfer_to_digital_bytes, totals.total_transfer_bytes);
    assert!(totals.digital_ticks_total > 0);
    assert!(totals.rram_ticks_total > 0);
}

#[test]
fn executed_plus_pending_invariant_holds_every_cycle() {
    let cfg = SimConfig::default();
    let mut platform = ChipletPlatform::new(cfg).unwrap();
    for _ in 0..2000 {
        platform.cycle();
        for id in 0..4 {
            let chiplet = platform.digital_chiplet(id).unwrap();
            let totals = chiplet.totals();
            assert_eq!(
                totals.executed_tasks + chiplet.pending_tasks(),
                totals.submitted_tasks
            );
        }
        if platform.is_idle() {
            break;
        }
    }
}

#[test]
fn domain_tick_totals_respect_the_frequency_ratios() {
    let cfg = SimConfig {
        digital_clock_mhz: 1000,
        rram_clock_mhz: 250,
        interconnect_clock_mhz: 500,
        ..Default::default()
    };
    let mut platform = ChipletPlatform::new(cfg).unwrap();
    platform.run(1000);
    let totals = platform.totals();
    assert_eq!(totals.digital_ticks_total, 1000);
    assert_eq!(totals.rram_ticks_total, 250);
    assert_eq!(totals.interconnect_ticks_total, 500);
}
