mod support;

use probe_core::config::ProbeConfig;
use probe_core::target::{ControllerState, TargetState};

use support::{Event, Harness, HostEvent};

fn lines(dtr: bool, rts: bool) -> HostEvent {
    HostEvent::Lines { dtr, rts }
}

/// Every target-line write comes in (boot, reset) pairs, boot first.
fn assert_boot_before_reset(writes: &[Event]) {
    assert_eq!(writes.len() % 2, 0, "unpaired write in {writes:?}");
    for pair in writes.chunks_exact(2) {
        assert!(
            matches!(pair, [Event::Boot(_), Event::Reset(_)]),
            "out of order: {pair:?}"
        );
    }
}

#[test]
fn opening_the_port_does_not_touch_the_target() {
    let mut harness = Harness::new(ProbeConfig::DEFAULT);
    harness.host(lines(true, true));
    harness.run_ticks(50);

    assert!(harness.target_writes().is_empty());
    assert_eq!(
        harness.supervisor.context().target().state(),
        ControllerState::Idle
    );
}

#[test]
fn reset_request_pulses_then_settles_after_debounce() {
    let mut harness = Harness::new(ProbeConfig::DEFAULT);
    harness.host(lines(true, true));
    harness.run_ticks(1);
    harness.host(lines(true, false));
    harness.run_ticks(1);

    // The request is taken at tick 2 and applied once 25 ticks have elapsed.
    assert_eq!(harness.lines(), TargetState::PULSE);
    harness.run_ticks(24);
    assert_eq!(harness.lines(), TargetState::PULSE);
    harness.run_ticks(1);
    assert_eq!(harness.lines(), TargetState::new(true, false));
    assert_eq!(harness.supervisor.context().target().pending(), None);

    let writes = harness.target_writes();
    assert_eq!(
        writes,
        [
            Event::Boot(true),
            Event::Reset(true),
            Event::Boot(false),
            Event::Reset(true),
        ]
    );
    assert_boot_before_reset(&writes);
}

#[test]
fn bootloader_request_settles_to_boot_line_only() {
    let mut harness = Harness::new(ProbeConfig::DEFAULT);
    harness.host(lines(false, true));
    harness.run_ticks(26);

    assert_eq!(harness.lines(), TargetState::new(false, true));
    assert_boot_before_reset(&harness.target_writes());
}

#[test]
fn release_before_debounce_cancels_the_request() {
    let mut harness = Harness::new(ProbeConfig::DEFAULT);
    harness.host(lines(true, false));
    harness.run_ticks(10);
    assert_eq!(harness.lines(), TargetState::PULSE);

    harness.host(lines(false, false));
    harness.run_ticks(1);
    assert_eq!(harness.lines(), TargetState::RELEASED);

    harness.run_ticks(100);
    assert_eq!(harness.lines(), TargetState::RELEASED);

    let writes = harness.target_writes();
    assert_boot_before_reset(&writes);
    let reached_requested = writes
        .chunks_exact(2)
        .any(|pair| pair == [Event::Boot(false), Event::Reset(true)]);
    assert!(!reached_requested, "requested state leaked: {writes:?}");
}

#[test]
fn both_lines_high_leaves_pending_request_alone() {
    let mut harness = Harness::new(ProbeConfig::DEFAULT);
    harness.host(lines(true, false));
    harness.run_ticks(5);
    let pending = harness.supervisor.context().target().pending();
    let writes = harness.target_writes().len();

    harness.host(lines(true, true));
    harness.run_ticks(1);
    assert_eq!(harness.supervisor.context().target().pending(), pending);
    assert_eq!(harness.target_writes().len(), writes);

    harness.run_ticks(25);
    assert_eq!(harness.lines(), TargetState::new(true, false));
}

#[test]
fn rapid_toggling_keeps_only_the_latest_request() {
    let mut harness = Harness::new(ProbeConfig::DEFAULT);
    for (dtr, rts) in [(true, false), (false, true), (true, false), (false, true)] {
        harness.host(lines(dtr, rts));
        harness.run_ticks(5);
    }
    assert_eq!(harness.lines(), TargetState::PULSE);

    harness.run_ticks(21);
    assert_eq!(harness.lines(), TargetState::new(false, true));
    assert_boot_before_reset(&harness.target_writes());
}

#[test]
fn debounce_is_configurable() {
    let mut harness = Harness::new(ProbeConfig::DEFAULT.with_target_debounce(100));
    harness.host(lines(true, false));
    harness.run_ticks(50);
    assert_eq!(harness.lines(), TargetState::PULSE);
    harness.run_ticks(51);
    assert_eq!(harness.lines(), TargetState::new(true, false));
}
