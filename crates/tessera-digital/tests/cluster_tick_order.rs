//! The phase chain runs the vector pipeline before the scalar cluster, while
//! the per-cycle processors run SPU before VPU. Both orders are observable
//! through the per-cycle activity counters and both are pinned here.

use tessera_config::SimConfig;
use tessera_digital::DigitalChiplet;
use tessera_types::{DigitalTaskDesc, DigitalUnit};

fn cfg() -> SimConfig {
    SimConfig {
        spu_scalar_throughput: 1,
        spu_vector_throughput: 1,
        vpu_vector_throughput: 1,
        ..Default::default()
    }
}

#[test]
fn vpu_phase_runs_before_spu_phase() {
    let mut chiplet = DigitalChiplet::new(0, &cfg());
    // Elementwise-style op: both vector pipeline and scalar cluster work, no PE.
    let desc = DigitalTaskDesc {
        scalar_ops: 4,
        vpu_ops: 4,
        requires_spu: true,
        requires_vpu: true,
        unit_hint: DigitalUnit::Spu,
        ..Default::default()
    };
    chiplet.submit_descriptor(desc);

    // First cycle: task is promoted into its VPU phase, so only the VPU is hot.
    chiplet.tick();
    assert!(chiplet.cycle.vpu_active > 0);
    assert_eq!(chiplet.cycle.spu_active, 0);

    // Run until the task retires; the SPU must have become active at some point.
    let mut spu_seen = false;
    let mut ticks = 0;
    while chiplet.pending_tasks() > 0 {
        chiplet.tick();
        spu_seen |= chiplet.cycle.spu_active > 0;
        ticks += 1;
        assert!(ticks < 1000);
    }
    assert!(spu_seen);
}

#[test]
fn spu_and_vpu_do_not_overlap_within_one_task() {
    let mut chiplet = DigitalChiplet::new(0, &cfg());
    let desc = DigitalTaskDesc {
        scalar_ops: 8,
        vpu_ops: 8,
        requires_spu: true,
        requires_vpu: true,
        unit_hint: DigitalUnit::Spu,
        ..Default::default()
    };
    chiplet.submit_descriptor(desc);
    let mut ticks = 0;
    while chiplet.pending_tasks() > 0 {
        chiplet.tick();
        assert!(
            chiplet.cycle.spu_active == 0 || chiplet.cycle.vpu_active == 0,
            "one task must occupy one unit class at a time"
        );
        ticks += 1;
        assert!(ticks < 1000);
    }
}
