use proptest::prelude::*;
use tessera_rram::WeightDirectory;
use tessera_types::WeightKey;

#[derive(Debug, Clone)]
enum Op {
    Register(u8, u64),
    Evict(u8),
    Touch(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..16, 1u64..10_000).prop_map(|(k, b)| Op::Register(k, b)),
        (0u8..16).prop_map(Op::Evict),
        (0u8..16).prop_map(Op::Touch),
    ]
}

proptest! {
    #[test]
    fn totals_match_entry_sum_and_peak_dominates(ops in prop::collection::vec(op_strategy(), 1..100)) {
        let mut dir = WeightDirectory::new();
        let mut tick = 0;
        for op in ops {
            tick += 1;
            match op {
                Op::Register(k, bytes) => {
                    dir.register(WeightKey::new(u32::from(k), 0, "w"), bytes, tick);
                }
                Op::Evict(k) => {
                    dir.evict(&WeightKey::new(u32::from(k), 0, "w"));
                }
                Op::Touch(k) => {
                    dir.touch(&WeightKey::new(u32::from(k), 0, "w"), tick);
                }
            }
            prop_assert!(dir.peak_bytes() >= dir.total_bytes());
        }
    }
}
