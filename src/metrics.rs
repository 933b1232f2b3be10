//! Process-wide counters for the world loop.
//!
//! Plain atomics; the server logs a [`snapshot`] periodically and the CLI
//! prints one on shutdown.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use serde::Serialize;

static TICKS: AtomicU64 = AtomicU64::new(0);
static TICK_OVERRUNS: AtomicU64 = AtomicU64::new(0);
static TICK_NANOS_SUM: AtomicU64 = AtomicU64::new(0);
static TIMERS_FIRED: AtomicU64 = AtomicU64::new(0);
static TIMERS_DROPPED: AtomicU64 = AtomicU64::new(0);
static OBSERVER_DISCONNECTS: AtomicU64 = AtomicU64::new(0);
static OUTBOUND_DROPPED: AtomicU64 = AtomicU64::new(0);
static INTENTS_APPLIED: AtomicU64 = AtomicU64::new(0);
static INTENTS_REJECTED: AtomicU64 = AtomicU64::new(0);
static SAVES_COMPLETED: AtomicU64 = AtomicU64::new(0);
static SAVES_FAILED: AtomicU64 = AtomicU64::new(0);
static LOAD_ISSUES: AtomicU64 = AtomicU64::new(0);

static EVENT_COUNTS: OnceLock<Mutex<HashMap<String, u64>>> = OnceLock::new();

pub fn tick_completed(elapsed: Duration, budget: Duration) {
    TICKS.fetch_add(1, Ordering::Relaxed);
    TICK_NANOS_SUM.fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    if elapsed > budget {
        TICK_OVERRUNS.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn timer_fired() {
    TIMERS_FIRED.fetch_add(1, Ordering::Relaxed);
}

pub fn timer_dropped() {
    TIMERS_DROPPED.fetch_add(1, Ordering::Relaxed);
}

pub fn observer_disconnected() {
    OBSERVER_DISCONNECTS.fetch_add(1, Ordering::Relaxed);
}

pub fn outbound_dropped() {
    OUTBOUND_DROPPED.fetch_add(1, Ordering::Relaxed);
}

pub fn intent_applied() {
    INTENTS_APPLIED.fetch_add(1, Ordering::Relaxed);
}

pub fn intent_rejected() {
    INTENTS_REJECTED.fetch_add(1, Ordering::Relaxed);
}

pub fn save_completed() {
    SAVES_COMPLETED.fetch_add(1, Ordering::Relaxed);
}

pub fn save_failed() {
    SAVES_FAILED.fetch_add(1, Ordering::Relaxed);
}

pub fn load_issues(count: u64) {
    LOAD_ISSUES.fetch_add(count, Ordering::Relaxed);
}

fn event_counts() -> &'static Mutex<HashMap<String, u64>> {
    EVENT_COUNTS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Count one execution of the named event handler. Returns the new total.
pub fn record_event(name: &str) -> u64 {
    let mut guard = event_counts().lock().unwrap_or_else(|e| e.into_inner());
    let count = guard.entry(name.to_string()).or_default();
    *count = count.saturating_add(1);
    *count
}

pub fn event_counts_snapshot() -> HashMap<String, u64> {
    event_counts()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub ticks: u64,
    pub tick_overruns: u64,
    pub tick_avg_us: Option<u64>,
    pub timers_fired: u64,
    pub timers_dropped: u64,
    pub observer_disconnects: u64,
    pub outbound_dropped: u64,
    pub intents_applied: u64,
    pub intents_rejected: u64,
    pub saves_completed: u64,
    pub saves_failed: u64,
    pub load_issues: u64,
}

pub fn snapshot() -> Snapshot {
    let ticks = TICKS.load(Ordering::Relaxed);
    let nanos = TICK_NANOS_SUM.load(Ordering::Relaxed);
    Snapshot {
        ticks,
        tick_overruns: TICK_OVERRUNS.load(Ordering::Relaxed),
        tick_avg_us: if ticks > 0 {
            Some(nanos / ticks / 1_000)
        } else {
            None
        },
        timers_fired: TIMERS_FIRED.load(Ordering::Relaxed),
        timers_dropped: TIMERS_DROPPED.load(Ordering::Relaxed),
        observer_disconnects: OBSERVER_DISCONNECTS.load(Ordering::Relaxed),
        outbound_dropped: OUTBOUND_DROPPED.load(Ordering::Relaxed),
        intents_applied: INTENTS_APPLIED.load(Ordering::Relaxed),
        intents_rejected: INTENTS_REJECTED.load(Ordering::Relaxed),
        saves_completed: SAVES_COMPLETED.load(Ordering::Relaxed),
        saves_failed: SAVES_FAILED.load(Ordering::Relaxed),
        load_issues: LOAD_ISSUES.load(Ordering::Relaxed),
    }
}
