//! Tests for utility functions

use std::time::Duration;

use session_governor::util::{now_ms, Clock, ManualClock, Priority, ResourceEstimate, SystemClock};

#[test]
fn test_now_ms_advances() {
    let t1 = now_ms();
    std::thread::sleep(Duration::from_millis(5));
    let t2 = now_ms();
    assert!(t2 > t1);
    assert!(SystemClock.now_ms() >= t2);
}

#[test]
fn test_manual_clock_is_shared_between_clones() {
    let clock = ManualClock::new(1_000);
    let other = clock.clone();
    clock.advance(Duration::from_secs(2));
    assert_eq!(other.now_ms(), 3_000);
    other.set(10);
    assert_eq!(clock.now_ms(), 10);
}

#[test]
fn test_priority_ordering() {
    assert!(Priority::Critical > Priority::High);
    assert!(Priority::High > Priority::Normal);
    assert!(Priority::Normal > Priority::Low);
    assert!(Priority::Critical.may_use_emergency());
    assert!(Priority::High.may_use_emergency());
    assert!(!Priority::Normal.may_use_emergency());
}

#[test]
fn test_estimate_totals() {
    let e = ResourceEstimate::tokens(1_200, 300);
    assert_eq!(e.total_tokens(), 1_500);
    let parsed: ResourceEstimate =
        serde_json::from_str(r#"{"input_tokens":10,"output_tokens":5,"duration":"90s"}"#).unwrap();
    assert_eq!(parsed.duration, Duration::from_secs(90));
    assert_eq!(parsed.total_tokens(), 15);
}
