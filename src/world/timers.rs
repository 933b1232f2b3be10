//! Bucketed deferred-event scheduler.
//!
//! Timers live in one of three places chosen by their delay: a high bucket
//! scanned every tick (under one second), a medium ring with one bucket per
//! tick of a second (under one minute) and a low ring with one bucket per tick
//! of a minute. A ring bucket is picked as `trigger % ring_len`, so it comes up
//! for scanning on the trigger tick itself and per-tick work stays bounded by
//! one bucket from each ring plus the high bucket.

use std::collections::HashMap;
use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::serial::Serial;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimerId(pub u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timer {
    pub id: TimerId,
    /// Tick on which the timer fires.
    pub trigger: u64,
    pub event: String,
    pub receiver: Serial,
    pub source: Serial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ring {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    ring: Ring,
    bucket: usize,
    key: u32,
}

type Bucket = HashMap<u32, Timer>;

pub struct TimerWheel {
    now: u64,
    ticks_per_second: u32,
    next_id: u64,
    high: Bucket,
    medium: Vec<Bucket>,
    low: Vec<Bucket>,
    slots: HashMap<TimerId, Slot>,
    rng: StdRng,
}

impl fmt::Debug for TimerWheel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerWheel")
            .field("now", &self.now)
            .field("pending", &self.slots.len())
            .finish()
    }
}

impl TimerWheel {
    pub fn new(ticks_per_second: u32) -> Self {
        let tps = ticks_per_second.max(1) as usize;
        Self {
            now: 0,
            ticks_per_second: tps as u32,
            next_id: 1,
            high: Bucket::new(),
            medium: vec![Bucket::new(); tps],
            low: vec![Bucket::new(); tps * 60],
            slots: HashMap::new(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Current tick.
    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn ticks_per_second(&self) -> u32 {
        self.ticks_per_second
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Restore the clock and id counter from a save, before any timer is restored.
    pub fn restore_clock(&mut self, now: u64, next_id: u64) {
        self.now = now;
        self.next_id = next_id.max(1);
    }

    /// Schedule `event` to fire `delay` ticks from now (at least one).
    pub fn schedule(
        &mut self,
        delay: u64,
        event: impl Into<String>,
        receiver: Serial,
        source: Serial,
    ) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        let timer = Timer {
            id,
            trigger: self.now + delay.max(1),
            event: event.into(),
            receiver,
            source,
        };
        self.insert(timer);
        id
    }

    /// Re-insert a persisted timer. A trigger at or before the current tick
    /// fires on the next tick.
    pub fn restore(&mut self, mut timer: Timer) {
        if timer.trigger <= self.now {
            timer.trigger = self.now + 1;
        }
        if timer.id.0 >= self.next_id {
            self.next_id = timer.id.0 + 1;
        }
        if let Some(old) = self.slots.get(&timer.id).copied() {
            self.bucket_mut(old.ring, old.bucket).remove(&old.key);
        }
        self.insert(timer);
    }

    fn ring_for(&self, delay: u64) -> Ring {
        let tps = self.ticks_per_second as u64;
        if delay < tps {
            Ring::High
        } else if delay < tps * 60 {
            Ring::Medium
        } else {
            Ring::Low
        }
    }

    fn bucket_mut(&mut self, ring: Ring, bucket: usize) -> &mut Bucket {
        match ring {
            Ring::High => &mut self.high,
            Ring::Medium => &mut self.medium[bucket],
            Ring::Low => &mut self.low[bucket],
        }
    }

    fn insert(&mut self, timer: Timer) {
        let delay = timer.trigger.saturating_sub(self.now);
        let ring = self.ring_for(delay);
        let bucket = match ring {
            Ring::High => 0,
            Ring::Medium => (timer.trigger % self.medium.len() as u64) as usize,
            Ring::Low => (timer.trigger % self.low.len() as u64) as usize,
        };
        let id = timer.id;
        let mut key = self.rng.gen_range(0..0x8000_0000u32);
        while self.bucket_mut(ring, bucket).contains_key(&key) {
            key = self.rng.gen_range(0..0x8000_0000u32);
        }
        self.bucket_mut(ring, bucket).insert(key, timer);
        self.slots.insert(id, Slot { ring, bucket, key });
    }

    /// Remove a pending timer. Unknown or already-fired ids return `false`.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        let Some(slot) = self.slots.remove(&id) else {
            return false;
        };
        self.bucket_mut(slot.ring, slot.bucket)
            .remove(&slot.key)
            .is_some()
    }

    pub fn get(&self, id: TimerId) -> Option<&Timer> {
        let slot = self.slots.get(&id)?;
        match slot.ring {
            Ring::High => self.high.get(&slot.key),
            Ring::Medium => self.medium[slot.bucket].get(&slot.key),
            Ring::Low => self.low[slot.bucket].get(&slot.key),
        }
    }

    /// Advance one tick and take every timer due on it, in (trigger, id) order.
    pub fn tick(&mut self) -> Vec<Timer> {
        self.now += 1;
        let now = self.now;
        let medium = (now % self.medium.len() as u64) as usize;
        let low = (now % self.low.len() as u64) as usize;

        let mut due = Vec::new();
        for (ring, bucket) in [(Ring::High, 0), (Ring::Medium, medium), (Ring::Low, low)] {
            let bucket = self.bucket_mut(ring, bucket);
            let keys: Vec<u32> = bucket
                .iter()
                .filter(|(_, timer)| timer.trigger <= now)
                .map(|(key, _)| *key)
                .collect();
            for key in keys {
                if let Some(timer) = bucket.remove(&key) {
                    due.push(timer);
                }
            }
        }
        for timer in &due {
            self.slots.remove(&timer.id);
        }
        due.sort_by_key(|timer| (timer.trigger, timer.id));
        due
    }

    /// Every pending timer, sorted by id.
    pub fn pending(&self) -> Vec<&Timer> {
        let mut all: Vec<&Timer> = self
            .high
            .values()
            .chain(self.medium.iter().flat_map(|b| b.values()))
            .chain(self.low.iter().flat_map(|b| b.values()))
            .collect();
        all.sort_by_key(|timer| timer.id);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_until(wheel: &mut TimerWheel, tick: u64) -> Vec<(u64, TimerId)> {
        let mut fired = Vec::new();
        while wheel.now() < tick {
            for timer in wheel.tick() {
                fired.push((wheel.now(), timer.id));
            }
        }
        fired
    }

    #[test]
    fn timers_fire_exactly_on_trigger_in_every_ring() {
        let mut wheel = TimerWheel::new(10);
        let short = wheel.schedule(3, "short", Serial::NONE, Serial::NONE);
        let medium = wheel.schedule(47, "medium", Serial::NONE, Serial::NONE);
        let long = wheel.schedule(1234, "long", Serial::NONE, Serial::NONE);
        let fired = run_until(&mut wheel, 1300);
        assert_eq!(fired, vec![(3, short), (47, medium), (1234, long)]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn cancel_before_trigger_prevents_firing() {
        let mut wheel = TimerWheel::new(10);
        let id = wheel.schedule(20, "x", Serial::NONE, Serial::NONE);
        run_until(&mut wheel, 19);
        assert!(wheel.cancel(id));
        assert!(run_until(&mut wheel, 40).is_empty());
    }

    #[test]
    fn cancel_after_fire_is_noop() {
        let mut wheel = TimerWheel::new(10);
        let id = wheel.schedule(1, "x", Serial::NONE, Serial::NONE);
        assert_eq!(wheel.tick().len(), 1);
        assert!(!wheel.cancel(id));
        assert!(!wheel.cancel(TimerId(999)));
    }

    #[test]
    fn same_tick_fires_in_id_order() {
        let mut wheel = TimerWheel::new(4);
        let a = wheel.schedule(9, "a", Serial::NONE, Serial::NONE);
        let b = wheel.schedule(9, "b", Serial::NONE, Serial::NONE);
        let c = wheel.schedule(9, "c", Serial::NONE, Serial::NONE);
        let fired = run_until(&mut wheel, 9);
        assert_eq!(fired, vec![(9, a), (9, b), (9, c)]);
    }

    #[test]
    fn restore_keeps_ids_and_moves_stale_triggers_forward() {
        let mut wheel = TimerWheel::new(10);
        wheel.restore_clock(100, 5);
        wheel.restore(Timer {
            id: TimerId(7),
            trigger: 90,
            event: "late".into(),
            receiver: Serial::NONE,
            source: Serial::NONE,
        });
        assert_eq!(wheel.next_id(), 8);
        let fired = wheel.tick();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].id, TimerId(7));
    }

    #[test]
    fn zero_delay_fires_next_tick() {
        let mut wheel = TimerWheel::new(10);
        wheel.schedule(0, "now", Serial::NONE, Serial::NONE);
        assert_eq!(wheel.tick().len(), 1);
    }
}
