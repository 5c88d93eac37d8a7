use proptest::prelude::*;
use tessera_digital::Buffer;

#[derive(Debug, Clone)]
enum Op {
    Reserve(u64),
    Release(u64),
    Delta(i64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u64..20_000).prop_map(Op::Reserve),
        (0u64..20_000).prop_map(Op::Release),
        (-20_000i64..20_000).prop_map(Op::Delta),
    ]
}

proptest! {
    #[test]
    fn occupancy_stays_in_bounds(ops in prop::collection::vec(op_strategy(), 1..200)) {
        let capacity = 10_000;
        let mut buf = Buffer::new("scratch", capacity, 64);
        for op in ops {
            let before = buf.occupancy();
            match op {
                Op::Reserve(n) => {
                    let ok = buf.reserve(n);
                    if !ok {
                        // A refused reservation must be a no-op.
                        prop_assert_eq!(buf.occupancy(), before);
                    }
                }
                Op::Release(n) => buf.release(n),
                Op::Delta(d) => {
                    let ok = buf.apply_delta(d);
                    if !ok {
                        prop_assert_eq!(buf.occupancy(), before);
                    }
                }
            }
            prop_assert!(buf.occupancy() <= capacity);
        }
    }
}
