use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use gpios::backend::MockGpioBackend;
use gpios::gpio::{Direction, GpioBackend, Level, Pull};
use gpios::watcher::{InputWatcher, OffCallback, OnCallback};

const PIN: u32 = 12;
const POLL: Duration = Duration::from_millis(20);

#[derive(Default)]
struct Calls {
    on: AtomicU32,
    off: AtomicU32,
    last_duration: AtomicU64,
}

impl Calls {
    fn counts(&self) -> (u32, u32) {
        (self.on.load(Ordering::SeqCst), self.off.load(Ordering::SeqCst))
    }
}

fn input_backend() -> Arc<MockGpioBackend> {
    let backend = Arc::new(MockGpioBackend::default());
    backend
        .setup(PIN, Direction::Input, Some(Pull::Up))
        .unwrap();
    backend
}

fn watcher(backend: &Arc<MockGpioBackend>, calls: &Arc<Calls>) -> InputWatcher {
    let on_calls = calls.clone();
    let on: OnCallback = Arc::new(move |uuid: &str| {
        assert_eq!(uuid, "123-456");
        on_calls.on.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let off_calls = calls.clone();
    let off: OffCallback = Arc::new(move |uuid: &str, duration: u64| {
        assert_eq!(uuid, "123-456");
        off_calls.off.fetch_add(1, Ordering::SeqCst);
        off_calls.last_duration.store(duration, Ordering::SeqCst);
        Ok(())
    });

    let backend: Arc<dyn GpioBackend> = backend.clone();
    InputWatcher::new(PIN, "123-456", backend, on, off).poll_interval(POLL)
}

fn settle() {
    thread::sleep(POLL * 6);
}

#[test]
fn stop_and_join_return_quickly() {
    let backend = input_backend();
    let calls = Arc::new(Calls::default());
    let mut watcher = watcher(&backend, &calls).poll_interval(Duration::from_secs(5));

    watcher.start().unwrap();
    assert!(watcher.is_running());

    let started = Instant::now();
    watcher.stop();
    assert!(watcher.join());
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!watcher.is_running());
}

#[test]
fn stop_without_start_is_harmless() {
    let backend = input_backend();
    let calls = Arc::new(Calls::default());
    let mut watcher = watcher(&backend, &calls);

    watcher.stop();
    assert!(watcher.join());
    assert_eq!(calls.counts(), (0, 0));
}

#[test]
fn start_twice_fails() {
    let backend = input_backend();
    let calls = Arc::new(Calls::default());
    let mut watcher = watcher(&backend, &calls);

    watcher.start().unwrap();
    assert!(watcher.start().is_err());
}

#[test]
fn initial_state_on_fires_on_callback() {
    let backend = input_backend();
    backend.set_level(PIN, Level::Low).unwrap();
    let calls = Arc::new(Calls::default());
    let mut watcher = watcher(&backend, &calls).initial_state(Some(true));

    watcher.start().unwrap();
    settle();

    assert_eq!(calls.counts(), (1, 0));
}

#[test]
fn initial_state_off_fires_off_callback() {
    let backend = input_backend();
    let calls = Arc::new(Calls::default());
    let mut watcher = watcher(&backend, &calls).initial_state(Some(false));

    watcher.start().unwrap();
    settle();

    assert_eq!(calls.counts(), (0, 1));
    assert_eq!(calls.last_duration.load(Ordering::SeqCst), 0);
}

#[test]
fn initial_state_follows_active_level() {
    let backend = input_backend();
    let calls = Arc::new(Calls::default());
    let mut watcher = watcher(&backend, &calls)
        .active_level(Level::High)
        .initial_state(Some(true));

    watcher.start().unwrap();
    settle();

    // pin idles high, which is on for this watcher
    assert_eq!(calls.counts(), (1, 0));
}

#[test]
fn baseline_level_fires_nothing() {
    let backend = input_backend();
    let calls = Arc::new(Calls::default());
    let mut watcher = watcher(&backend, &calls).baseline(Level::High);

    watcher.start().unwrap();
    settle();

    assert_eq!(calls.counts(), (0, 0));
}

#[test]
fn level_changes_alternate_callbacks() {
    let backend = input_backend();
    let calls = Arc::new(Calls::default());
    let mut watcher = watcher(&backend, &calls).baseline(Level::High);
    watcher.start().unwrap();

    backend.set_level(PIN, Level::Low).unwrap();
    settle();
    assert_eq!(calls.counts(), (1, 0));

    backend.set_level(PIN, Level::High).unwrap();
    settle();
    assert_eq!(calls.counts(), (1, 1));
    assert!(calls.last_duration.load(Ordering::SeqCst) > 0);

    backend.set_level(PIN, Level::Low).unwrap();
    settle();
    assert_eq!(calls.counts(), (2, 1));

    backend.set_level(PIN, Level::High).unwrap();
    settle();
    assert_eq!(calls.counts(), (2, 2));
}

#[test]
fn inverted_active_level() {
    let backend = input_backend();
    backend.set_level(PIN, Level::Low).unwrap();
    let calls = Arc::new(Calls::default());
    let mut watcher = watcher(&backend, &calls)
        .baseline(Level::Low)
        .active_level(Level::High);
    watcher.start().unwrap();

    backend.set_level(PIN, Level::High).unwrap();
    settle();
    assert_eq!(calls.counts(), (1, 0));
}

#[test]
fn short_glitch_is_debounced() {
    let backend = input_backend();
    let calls = Arc::new(Calls::default());
    let mut watcher = watcher(&backend, &calls)
        .baseline(Level::High)
        .poll_interval(Duration::from_millis(50))
        .debounce_ticks(4);
    watcher.start().unwrap();

    // shorter than four polls
    backend.set_level(PIN, Level::Low).unwrap();
    thread::sleep(Duration::from_millis(60));
    backend.set_level(PIN, Level::High).unwrap();
    thread::sleep(Duration::from_millis(400));
    assert_eq!(calls.counts(), (0, 0));

    backend.set_level(PIN, Level::Low).unwrap();
    thread::sleep(Duration::from_millis(400));
    assert_eq!(calls.counts(), (1, 0));
}

#[test]
fn failing_callback_keeps_watching() {
    let backend = input_backend();
    let counter = Arc::new(AtomicU32::new(0));
    let on_counter = counter.clone();
    let on: OnCallback = Arc::new(move |_: &str| {
        on_counter.fetch_add(1, Ordering::SeqCst);
        Err(gpios::AppError::CommandError("boom".into()))
    });
    let off: OffCallback = Arc::new(|_: &str, _: u64| Ok(()));
    let dyn_backend: Arc<dyn GpioBackend> = backend.clone();
    let mut watcher = InputWatcher::new(PIN, "123-456", dyn_backend, on, off)
        .baseline(Level::High)
        .poll_interval(POLL);
    watcher.start().unwrap();

    backend.set_level(PIN, Level::Low).unwrap();
    settle();
    backend.set_level(PIN, Level::High).unwrap();
    settle();
    backend.set_level(PIN, Level::Low).unwrap();
    settle();

    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert!(watcher.is_running());
}

#[test]
fn dropping_watcher_stops_thread() {
    let backend = input_backend();
    let calls = Arc::new(Calls::default());
    let mut watcher = watcher(&backend, &calls).baseline(Level::High);
    watcher.start().unwrap();
    drop(watcher);

    backend.set_level(PIN, Level::Low).unwrap();
    settle();
    assert_eq!(calls.counts(), (0, 0));
}
