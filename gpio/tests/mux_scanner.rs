//! Scan behaviour of the multiplexed keypad against a simulated CD74HC4067.

use std::time::{Duration, Instant};
use muxscan_gpio::keypad::{KeyScanner, MuxError, MuxScanner, MuxScannerConfig};
use muxscan_gpio::sim::{SimGpioDriver, SimMuxId};
use muxscan_gpio::{GpioBias, GpioError};

const SELECT: [usize; 4] = [10, 11, 12, 13];
const SIGNAL: usize = 28;
const ENABLE: usize = 14;

fn board() -> (SimGpioDriver, SimMuxId) {
    let sim = SimGpioDriver::new(32);
    let mux = sim.attach_multiplexer(&SELECT, SIGNAL, ENABLE, 16).unwrap();
    (sim, mux)
}

fn config() -> MuxScannerConfig {
    MuxScannerConfig::new(SELECT.to_vec(), SIGNAL, ENABLE).with_settle_time(Duration::ZERO)
}

fn drain(scanner: &mut MuxScanner) -> Vec<(usize, bool)> {
    let mut events = Vec::new();
    while let Some(event) = scanner.scan_for_changes().unwrap() {
        events.push((event.channel(), event.pressed()));
    }
    events
}

// ── Construction ─────────────────────────────────────────────────────────────

#[test]
fn key_count_matches_config() {
    let (sim, _) = board();
    let scanner = MuxScanner::new(&sim, &config()).unwrap();
    assert_eq!(scanner.key_count(), 16);
    assert_eq!(scanner.select_width(), 4);
}

#[test]
fn partial_bank_uses_fewer_keys() {
    let (sim, mux) = board();
    let mut scanner = MuxScanner::new(&sim, &config().with_key_count(10)).unwrap();
    assert_eq!(scanner.key_count(), 10);

    // Channels past key_count are never addressed
    sim.press(mux, 12);
    assert_eq!(scanner.scan_for_changes().unwrap(), None);
}

#[test]
fn idle_board_reports_nothing() {
    let (sim, _) = board();
    let mut scanner = MuxScanner::new(&sim, &config()).unwrap();
    assert_eq!(scanner.scan_for_changes().unwrap(), None);
}

// ── Edge detection ───────────────────────────────────────────────────────────

#[test]
fn single_press_reported_once() {
    let (sim, mux) = board();
    let mut scanner = MuxScanner::new(&sim, &config()).unwrap();

    sim.press(mux, 5);
    let event = scanner.scan_for_changes().unwrap().expect("press on channel 5");
    assert_eq!(event.channel(), 5);
    assert!(event.pressed());
    assert!(!event.released());

    assert_eq!(scanner.scan_for_changes().unwrap(), None);
}

#[test]
fn simultaneous_changes_come_out_lowest_first() {
    let (sim, mux) = board();
    let mut scanner = MuxScanner::new(&sim, &config()).unwrap();

    sim.press(mux, 9);
    sim.press(mux, 3);

    let first = scanner.scan_for_changes().unwrap().unwrap();
    assert_eq!((first.channel(), first.pressed()), (3, true));
    let second = scanner.scan_for_changes().unwrap().unwrap();
    assert_eq!((second.channel(), second.pressed()), (9, true));
    assert_eq!(scanner.scan_for_changes().unwrap(), None);
}

#[test]
fn pending_change_dropped_if_it_reverts_before_next_pass() {
    let (sim, mux) = board();
    let mut scanner = MuxScanner::new(&sim, &config()).unwrap();

    sim.press(mux, 2);
    sim.press(mux, 7);
    assert_eq!(scanner.scan_for_changes().unwrap().unwrap().channel(), 2);

    // Channel 7 was let go before the next pass sampled it again
    sim.release(mux, 7);
    assert_eq!(scanner.scan_for_changes().unwrap(), None);
}

#[test]
fn stable_input_never_reports() {
    let (sim, mux) = board();
    let mut scanner = MuxScanner::new(&sim, &config()).unwrap();

    sim.press(mux, 0);
    sim.press(mux, 15);
    assert_eq!(drain(&mut scanner), [(0, true), (15, true)]);

    for _ in 0..20 {
        assert_eq!(scanner.scan_for_changes().unwrap(), None);
    }
}

#[test]
fn press_then_release_round_trip() {
    let (sim, mux) = board();
    let mut scanner = MuxScanner::new(&sim, &config()).unwrap();

    sim.press(mux, 11);
    let pressed = scanner.scan_for_changes().unwrap().unwrap();
    sim.release(mux, 11);
    let released = scanner.scan_for_changes().unwrap().unwrap();

    assert_eq!((pressed.channel(), pressed.pressed()), (11, true));
    assert_eq!((released.channel(), released.released()), (11, true));
    assert!(released.timestamp() >= pressed.timestamp());
    assert_eq!(scanner.scan_for_changes().unwrap(), None);
}

#[test]
fn held_key_does_not_hide_others() {
    let (sim, mux) = board();
    let mut scanner = MuxScanner::new(&sim, &config()).unwrap();

    sim.press(mux, 1);
    assert_eq!(drain(&mut scanner), [(1, true)]);

    sim.press(mux, 4);
    assert_eq!(drain(&mut scanner), [(4, true)]);

    sim.release(mux, 1);
    sim.release(mux, 4);
    assert_eq!(drain(&mut scanner), [(1, false), (4, false)]);
}

#[test]
fn event_timestamp_taken_at_detection() {
    let (sim, mux) = board();
    let mut scanner = MuxScanner::new(&sim, &config()).unwrap();

    let before = Instant::now();
    sim.press(mux, 6);
    let event = scanner.scan_for_changes().unwrap().unwrap();
    assert!(event.timestamp() >= before);
    assert!(event.timestamp() <= Instant::now());
}

// ── Timing ───────────────────────────────────────────────────────────────────

#[test]
fn pass_waits_settle_time_per_channel() {
    let (sim, _) = board();
    let settle = Duration::from_millis(1);
    let mut scanner = MuxScanner::new(&sim, &config().with_key_count(12).with_settle_time(settle)).unwrap();
    assert_eq!(scanner.settle_time(), settle);

    let start = Instant::now();
    scanner.scan_for_changes().unwrap();
    assert!(start.elapsed() >= settle * 12);
}

#[test]
fn pass_ends_with_last_channel_addressed() {
    let (sim, _) = board();
    let mut scanner = MuxScanner::new(&sim, &config()).unwrap();

    scanner.scan_for_changes().unwrap();
    assert!(SELECT.iter().all(|&pin| sim.level(pin)));
}

// ── Line faults ──────────────────────────────────────────────────────────────

#[test]
fn signal_fault_propagates_and_keeps_state() {
    let (sim, mux) = board();
    let mut scanner = MuxScanner::new(&sim, &config()).unwrap();

    sim.press(mux, 8);
    let fault = GpioError::Io(std::io::ErrorKind::BrokenPipe);
    sim.set_fault(SIGNAL, Some(fault.clone()));
    assert_eq!(scanner.scan_for_changes().unwrap_err(), MuxError::Gpio(fault));

    sim.set_fault(SIGNAL, None);
    let event = scanner.scan_for_changes().unwrap().unwrap();
    assert_eq!((event.channel(), event.pressed()), (8, true));
}

#[test]
fn select_fault_propagates() {
    let (sim, _) = board();
    let mut scanner = MuxScanner::new(&sim, &config()).unwrap();

    sim.set_fault(SELECT[2], Some(GpioError::Other("stuck".into())));
    assert_eq!(
        scanner.scan_for_changes().unwrap_err(),
        MuxError::Gpio(GpioError::Other("stuck".into()))
    );
}

#[test]
fn enable_fault_fails_construction() {
    let (sim, _) = board();
    sim.set_fault(ENABLE, Some(GpioError::NotSupported));
    assert_eq!(
        MuxScanner::new(&sim, &config()).unwrap_err(),
        MuxError::Gpio(GpioError::NotSupported)
    );
    assert!(!sim.is_claimed(ENABLE));
    assert!(!sim.is_claimed(SIGNAL));
}

// ── Signal bias ──────────────────────────────────────────────────────────────

#[test]
fn internal_pull_up_keeps_idle_keys_released() {
    let (sim, _) = board();
    let config = config().with_signal_bias(GpioBias::PullUp);
    let mut scanner = MuxScanner::new(&sim, &config).unwrap();
    assert_eq!(scanner.scan_for_changes().unwrap(), None);
}

// ── Teardown ─────────────────────────────────────────────────────────────────

#[test]
fn deinit_releases_select_and_signal_lines() {
    let (sim, mux) = board();
    let mut scanner = MuxScanner::new(&sim, &config()).unwrap();
    sim.press(mux, 3);
    scanner.scan_for_changes().unwrap();

    let enable = scanner.deinit();
    for pin in SELECT.into_iter().chain([SIGNAL]) {
        assert!(!sim.is_claimed(pin), "pin {pin} still claimed");
    }
    assert!(sim.is_claimed(ENABLE));
    assert!(!sim.level(ENABLE));
    assert_eq!(sim.write_count(ENABLE), 1);

    drop(enable);
    assert!(!sim.is_claimed(ENABLE));

    // The pins can be claimed again
    let scanner = MuxScanner::new(&sim, &config()).unwrap();
    assert_eq!(scanner.key_count(), 16);
}

// ── Bus width ────────────────────────────────────────────────────────────────

#[test]
fn bus_wider_than_key_count_needs_is_rejected() {
    let (sim, _) = board();
    assert_eq!(
        MuxScanner::new(&sim, &config().with_key_count(4)).unwrap_err(),
        MuxError::SelectWidthMismatch {
            channels: 4,
            required: 2,
            supplied: 4,
        }
    );
    for pin in SELECT.into_iter().chain([SIGNAL, ENABLE]) {
        assert!(!sim.is_claimed(pin));
    }
}

#[test]
fn narrower_bus_scans_its_own_channels() {
    let sim = SimGpioDriver::new(32);
    let mux = sim.attach_multiplexer(&SELECT[..3], SIGNAL, ENABLE, 8).unwrap();
    let config = MuxScannerConfig::new(SELECT[..3].to_vec(), SIGNAL, ENABLE)
        .with_key_count(6)
        .with_settle_time(Duration::ZERO);
    let mut scanner = MuxScanner::new(&sim, &config).unwrap();
    assert_eq!(scanner.select_width(), 3);

    sim.press(mux, 5);
    sim.press(mux, 7);
    assert_eq!(drain(&mut scanner), [(5, true)]);
}
