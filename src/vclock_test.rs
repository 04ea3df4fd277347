use super::*;

#[test]
fn test_vclock() {
    let mut clock = Vclock::new();
    assert_eq!(clock.to_signature(), 0);

    clock.follow(1, 100).follow(2, 200);
    assert_eq!(clock.to_signature(), 300);
    assert_eq!(clock.to_string(), "{1: 100, 2: 200}");

    // components never regress.
    clock.follow(1, 50);
    assert_eq!(clock.to_signature(), 300);
    clock.follow(1, 150);
    assert_eq!(clock.to_signature(), 350);

    let copy = clock.clone();
    assert_eq!(copy, clock);
    assert_eq!(Vclock::default().to_signature(), 0);
}
