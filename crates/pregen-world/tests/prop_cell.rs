use pregen_world::{BATCH_SPAN, BatchKey, CellCoord, CellKey, KeySet};
use proptest::prelude::*;

fn coord() -> impl Strategy<Value = i32> {
    prop_oneof![
        -64i32..=64,
        -30_000_000i32..=30_000_000,
        Just(i32::MIN),
        Just(i32::MAX),
    ]
}

proptest! {
    // Packing is bijective with (x, z)
    #[test]
    fn key_is_bijective(x in coord(), z in coord(), x2 in coord(), z2 in coord()) {
        let a = CellKey::new(x, z);
        prop_assert_eq!(a.coord(), CellCoord::new(x, z));
        prop_assert_eq!(CellKey::from_raw(a.raw()), a);
        let b = CellKey::new(x2, z2);
        prop_assert_eq!(a == b, (x, z) == (x2, z2));
    }

    // Every cell lands in the bucket whose origin is the floor of coord / span
    #[test]
    fn batch_bucket_contains_cell(x in -1_000_000i32..=1_000_000, z in -1_000_000i32..=1_000_000) {
        let cell = CellCoord::new(x, z);
        let bucket = cell.batch();
        let origin = bucket.origin();
        prop_assert!(origin.x <= x && x < origin.x + BATCH_SPAN);
        prop_assert!(origin.z <= z && z < origin.z + BATCH_SPAN);
        prop_assert!(BatchKey::slot(cell) < 64);
    }

    // Distances are symmetric and the chessboard metric never exceeds the euclidean one squared
    #[test]
    fn distances_are_symmetric(ax in -1000i32..1000, az in -1000i32..1000, bx in -1000i32..1000, bz in -1000i32..1000) {
        let a = CellCoord::new(ax, az);
        let b = CellCoord::new(bx, bz);
        prop_assert_eq!(a.distance_sq(b), b.distance_sq(a));
        prop_assert_eq!(a.chebyshev(b), b.chebyshev(a));
        let c = a.chebyshev(b);
        prop_assert!(c * c <= a.distance_sq(b));
        prop_assert!(a.distance_sq(b) <= 2 * c * c);
    }
}

#[test]
fn key_set_insert_remove_report_membership_changes() {
    let set = KeySet::new();
    let k = CellKey::new(3, -4);
    assert!(set.insert(k));
    assert!(!set.insert(k));
    assert!(set.contains(k));
    assert!(set.remove(k));
    assert!(!set.remove(k));
    set.replace([CellKey::new(1, 1), CellKey::new(2, 2)]);
    assert_eq!(set.len(), 2);
    let mut drained = set.drain();
    drained.sort();
    assert_eq!(drained, vec![CellKey::new(1, 1), CellKey::new(2, 2)]);
    assert!(set.is_empty());
}
