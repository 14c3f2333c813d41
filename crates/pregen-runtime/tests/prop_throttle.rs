use pregen_runtime::Throttle;
use proptest::prelude::*;

#[derive(Clone, Debug)]
enum Op {
    Acquire,
    Release,
    Resize(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Acquire),
        2 => Just(Op::Release),
        1 => (0usize..6).prop_map(Op::Resize),
    ]
}

proptest! {
    // whatever happened before, an idle throttle hands out exactly `capacity` permits
    #[test]
    fn permits_match_capacity(start in 0usize..6, ops in prop::collection::vec(op(), 0..64)) {
        let t = Throttle::new(start);
        let mut held = 0usize;
        for op in ops {
            match op {
                Op::Acquire => {
                    if t.try_acquire() {
                        held += 1;
                        prop_assert!(t.held() <= t.capacity());
                    }
                }
                Op::Release => {
                    if held > 0 {
                        t.release();
                        held -= 1;
                    }
                }
                Op::Resize(n) => t.set_capacity(n),
            }
            prop_assert_eq!(t.held(), held);
            prop_assert!(t.available() + t.held() >= t.capacity());
        }

        for _ in 0..held {
            t.release();
        }
        let mut granted = 0;
        while t.try_acquire() {
            granted += 1;
            prop_assert!(granted <= t.capacity());
        }
        prop_assert_eq!(granted, t.capacity());
    }
}
