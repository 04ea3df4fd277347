use super::*;

#[test]
fn test_checkpoint_set() {
    let mut set = CheckpointSet::new();
    assert!(set.is_empty());
    assert_eq!(set.last_signature(), None);
    assert_eq!(set.prev_signature(100), None);

    set.add(Vclock::new());
    for signature in [10, 20, 30].iter() {
        set.add_signature(*signature);
    }
    assert!(!set.is_empty());
    assert_eq!(set.last_signature(), Some(30));

    assert_eq!(set.prev_signature(30), Some(20));
    assert_eq!(set.prev_signature(25), Some(20));
    assert_eq!(set.prev_signature(10), Some(0));
    assert_eq!(set.prev_signature(0), None);

    // re-registering a signature is a no-op.
    set.add_signature(20);
    assert_eq!(set.last_signature(), Some(30));

    assert_eq!(set.remove_below(20), vec![0, 10]);
    assert_eq!(set.last_signature(), Some(30));
    assert_eq!(set.prev_signature(30), Some(20));
    assert_eq!(set.remove_below(0), Vec::<i64>::new());
}
