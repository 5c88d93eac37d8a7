use tessera_config::SimConfig;
use tessera_digital::DigitalChiplet;
use tessera_types::{BufferKind, DigitalTaskDesc, DigitalUnit};

fn small_cfg() -> SimConfig {
    SimConfig {
        pe_arrays_per_chiplet: 4,
        spu_clusters_per_chiplet: 4,
        pe_rows: 16,
        pe_cols: 16,
        load_bandwidth_bytes: 1024,
        store_bandwidth_bytes: 1024,
        ..Default::default()
    }
}

fn gemm_desc(m: u64, n: u64, k: u64) -> DigitalTaskDesc {
    DigitalTaskDesc {
        m,
        n,
        k,
        tile_m: 16,
        tile_n: 16,
        tile_k: k,
        input_bytes: m * k * 2,
        weight_bytes: k * n * 2,
        output_bytes: m * n * 2,
        requires_pe: true,
        target_buffer: BufferKind::Scratch,
        unit_hint: DigitalUnit::Pe,
        ..Default::default()
    }
}

#[test]
fn gemm_task_drains_and_counts_macs() {
    let mut chiplet = DigitalChiplet::new(0, &small_cfg());
    assert!(chiplet.submit_descriptor(gemm_desc(32, 32, 16)));
    assert_eq!(chiplet.pending_tasks(), 1);

    let mut ticks = 0;
    while chiplet.pending_tasks() > 0 {
        chiplet.tick();
        ticks += 1;
        assert!(ticks < 100_000, "task never drained");
    }

    let totals = chiplet.totals();
    assert_eq!(totals.executed_tasks, 1);
    assert_eq!(totals.mac_count, 32 * 32 * 16);
    assert!(totals.pe_energy_pj > 0.0);
    // Loading 2 KiB over a 1 KiB/cycle port takes at least two cycles before
    // compute even starts.
    assert!(ticks >= 3);
}

#[test]
fn executed_plus_pending_matches_submitted() {
    let mut chiplet = DigitalChiplet::new(0, &small_cfg());
    for _ in 0..5 {
        chiplet.submit_descriptor(gemm_desc(16, 16, 16));
    }
    for _ in 0..3 {
        chiplet.tick();
    }
    let totals = chiplet.totals();
    assert_eq!(totals.submitted_tasks, 5);
    assert_eq!(totals.executed_tasks + chiplet.pending_tasks(), 5);
}

#[test]
fn legacy_schedule_task_never_fails_and_drains() {
    let mut chiplet = DigitalChiplet::new(0, &small_cfg());
    chiplet.schedule_task(7);
    let mut ticks = 0;
    while chiplet.pending_tasks() > 0 {
        chiplet.tick();
        ticks += 1;
        assert!(ticks < 1000);
    }
    assert_eq!(chiplet.totals().executed_tasks, 1);
}

#[test]
fn barrier_descriptor_completes_without_resources() {
    let mut chiplet = DigitalChiplet::new(0, &small_cfg());
    let desc = DigitalTaskDesc {
        unit_hint: DigitalUnit::Barrier,
        ..Default::default()
    };
    chiplet.submit_descriptor(desc);
    chiplet.tick();
    assert_eq!(chiplet.totals().executed_tasks, 1);
    assert_eq!(chiplet.pending_tasks(), 0);
}
