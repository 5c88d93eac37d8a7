//! A task whose buffers do not all fit must not leave partial reservations
//! behind while it waits.

use tessera_config::SimConfig;
use tessera_digital::DigitalChiplet;
use tessera_types::{BufferKind, DigitalTaskDesc, DigitalUnit};

#[test]
fn partial_reservation_is_rolled_back_while_task_waits() {
    let cfg = SimConfig {
        digital_activation_bytes: 1024 * 1024,
        digital_weight_bytes: 1024 * 1024,
        digital_scratch_bytes: 256,
        ..Default::default()
    };
    let mut chiplet = DigitalChiplet::new(0, &cfg);

    let desc = DigitalTaskDesc {
        input_bytes: 4096,
        weight_bytes: 4096,
        // Deliberately larger than any cluster's scratch.
        output_bytes: 100_000,
        requires_pe: true,
        m: 16,
        n: 16,
        k: 16,
        tile_m: 16,
        tile_n: 16,
        tile_k: 16,
        target_buffer: BufferKind::Scratch,
        unit_hint: DigitalUnit::Pe,
        ..Default::default()
    };
    chiplet.submit_descriptor(desc);

    for _ in 0..10 {
        chiplet.tick();
        // The scratch reservation fails every tick; activation and weights
        // must be restored each time.
        assert_eq!(chiplet.buffer_usage(BufferKind::Activation), 0);
        assert_eq!(chiplet.buffer_usage(BufferKind::Weights), 0);
    }
    assert_eq!(chiplet.pending_tasks(), 1);
}

#[test]
fn adjust_buffer_rejects_overdraw() {
    let cfg = SimConfig::default();
    let mut chiplet = DigitalChiplet::new(0, &cfg);
    assert!(chiplet.adjust_buffer(BufferKind::Scratch, 1024));
    assert!(!chiplet.adjust_buffer(
        BufferKind::Scratch,
        -(2 * cfg.digital_scratch_bytes as i64),
    ));
    assert_eq!(chiplet.buffer_usage(BufferKind::Scratch), 1024);
}
