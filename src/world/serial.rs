//! Serial handles and the class-partitioned allocator.
//!
//! Every entity carries a permanent 31-bit serial. The space is split into
//! disjoint ranges per [`SerialClass`]; `0` means "no entity" and the top two
//! values are reserved for the world and void sentinel parents.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Permanent identity of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Serial(u32);

impl Serial {
    /// "No entity".
    pub const NONE: Serial = Serial(0);
    /// The world itself, parent of every top-level entity.
    pub const WORLD: Serial = Serial(0x7FFF_FFFF);
    /// The void sentinel that absorbs orphans during error recovery.
    pub const VOID: Serial = Serial(0x7FFF_FFFE);

    pub const fn new(raw: u32) -> Self {
        Serial(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// True for sentinels (none, world, void); they never name a live entity.
    pub fn is_sentinel(self) -> bool {
        self == Serial::NONE || self == Serial::WORLD || self == Serial::VOID
    }

    /// The class whose range contains this serial, if any.
    pub fn class(self) -> Option<SerialClass> {
        SerialClass::ALL
            .into_iter()
            .find(|class| class.range().contains(&self.0))
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// Entity class that owns a serial range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerialClass {
    Mobile,
    Item,
}

impl SerialClass {
    pub const ALL: [SerialClass; 2] = [SerialClass::Mobile, SerialClass::Item];

    /// Default reserved range of the class.
    pub fn range(self) -> std::ops::RangeInclusive<u32> {
        match self {
            SerialClass::Mobile => 0x0000_0001..=0x3FFF_FFFF,
            SerialClass::Item => 0x4000_0000..=0x7FFF_FFFD,
        }
    }

    fn index(self) -> usize {
        match self {
            SerialClass::Mobile => 0,
            SerialClass::Item => 1,
        }
    }
}

#[derive(Debug, Clone)]
struct ClassPool {
    first: u32,
    last: u32,
    cursor: u32,
    used: HashSet<u32>,
}

impl ClassPool {
    fn new(first: u32, last: u32) -> Self {
        Self {
            first,
            last,
            cursor: first,
            used: HashSet::new(),
        }
    }

    fn span(&self) -> u64 {
        (self.last - self.first) as u64 + 1
    }

    fn contains(&self, raw: u32) -> bool {
        raw >= self.first && raw <= self.last
    }

    fn after(&self, raw: u32) -> u32 {
        if raw >= self.last {
            self.first
        } else {
            raw + 1
        }
    }
}

/// Issues unique serials per class, scanning forward from a rolling cursor so a
/// released serial is only handed out again after a full sweep of the range.
#[derive(Debug, Clone)]
pub struct SerialAllocator {
    pools: [ClassPool; 2],
}

impl Default for SerialAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialAllocator {
    pub fn new() -> Self {
        let mobile = SerialClass::Mobile.range();
        let item = SerialClass::Item.range();
        Self {
            pools: [
                ClassPool::new(*mobile.start(), *mobile.end()),
                ClassPool::new(*item.start(), *item.end()),
            ],
        }
    }

    /// Allocator with narrowed ranges. Each range must lie inside the class's
    /// default range; used by tests to exercise wrap-around and exhaustion.
    pub fn with_ranges(
        mobiles: std::ops::RangeInclusive<u32>,
        items: std::ops::RangeInclusive<u32>,
    ) -> Self {
        let clamp = |class: SerialClass, wanted: std::ops::RangeInclusive<u32>| {
            let full = class.range();
            let first = (*wanted.start()).max(*full.start());
            let last = (*wanted.end()).min(*full.end()).max(first);
            ClassPool::new(first, last)
        };
        Self {
            pools: [
                clamp(SerialClass::Mobile, mobiles),
                clamp(SerialClass::Item, items),
            ],
        }
    }

    fn pool_for(&mut self, serial: Serial) -> Option<&mut ClassPool> {
        let class = serial.class()?;
        let pool = &mut self.pools[class.index()];
        pool.contains(serial.raw()).then_some(pool)
    }

    /// Hand out an unused serial of `class`, or `None` when the range is full.
    pub fn allocate(&mut self, class: SerialClass) -> Option<Serial> {
        let pool = &mut self.pools[class.index()];
        if pool.used.len() as u64 >= pool.span() {
            return None;
        }
        let mut candidate = pool.cursor;
        for _ in 0..pool.span() {
            if !pool.used.contains(&candidate) {
                pool.used.insert(candidate);
                pool.cursor = pool.after(candidate);
                return Some(Serial(candidate));
            }
            candidate = pool.after(candidate);
        }
        None
    }

    /// Force `serial` into the used-set. Returns `false` when it is already in
    /// use or lies outside every class range.
    ///
    /// The cursor only moves forward past the reserved value, so a bulk load of
    /// existing serials leaves fresh allocations starting after the highest one.
    pub fn reserve(&mut self, serial: Serial) -> bool {
        let Some(pool) = self.pool_for(serial) else {
            return false;
        };
        if !pool.used.insert(serial.raw()) {
            return false;
        }
        if serial.raw() >= pool.cursor {
            pool.cursor = pool.after(serial.raw());
        }
        true
    }

    /// Return `serial` to the pool. Unknown serials are ignored.
    pub fn release(&mut self, serial: Serial) -> bool {
        match self.pool_for(serial) {
            Some(pool) => pool.used.remove(&serial.raw()),
            None => false,
        }
    }

    pub fn is_used(&self, serial: Serial) -> bool {
        serial
            .class()
            .map(|class| self.pools[class.index()].used.contains(&serial.raw()))
            .unwrap_or(false)
    }

    pub fn in_use(&self, class: SerialClass) -> usize {
        self.pools[class.index()].used.len()
    }

    /// Next value the scan for `class` starts from.
    pub fn cursor(&self, class: SerialClass) -> u32 {
        self.pools[class.index()].cursor
    }

    /// Restore a persisted cursor. Values outside the class range are ignored.
    pub fn restore_cursor(&mut self, class: SerialClass, cursor: u32) {
        let pool = &mut self.pools[class.index()];
        if pool.contains(cursor) {
            pool.cursor = cursor;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_are_outside_class_ranges() {
        assert_eq!(Serial::NONE.class(), None);
        assert_eq!(Serial::WORLD.class(), None);
        assert_eq!(Serial::VOID.class(), None);
        assert_eq!(Serial::new(1).class(), Some(SerialClass::Mobile));
        assert_eq!(Serial::new(0x4000_0000).class(), Some(SerialClass::Item));
    }

    #[test]
    fn allocations_stay_in_range_and_never_repeat() {
        let mut alloc = SerialAllocator::new();
        let mut seen = HashSet::new();
        for _ in 0..500 {
            let m = alloc.allocate(SerialClass::Mobile).expect("mobile");
            let i = alloc.allocate(SerialClass::Item).expect("item");
            assert!(SerialClass::Mobile.range().contains(&m.raw()));
            assert!(SerialClass::Item.range().contains(&i.raw()));
            assert!(seen.insert(m));
            assert!(seen.insert(i));
        }
    }

    #[test]
    fn released_serial_is_reused_only_after_full_sweep() {
        let mut alloc = SerialAllocator::with_ranges(1..=4, 0x4000_0000..=0x4000_0003);
        let a = alloc.allocate(SerialClass::Mobile).unwrap();
        let b = alloc.allocate(SerialClass::Mobile).unwrap();
        assert!(alloc.release(a));
        // cursor sits after b, so the next two come from the untouched tail
        let c = alloc.allocate(SerialClass::Mobile).unwrap();
        let d = alloc.allocate(SerialClass::Mobile).unwrap();
        assert_ne!(c, a);
        assert_ne!(d, a);
        // the sweep wraps and finds the freed slot last
        let e = alloc.allocate(SerialClass::Mobile).unwrap();
        assert_eq!(e, a);
        assert_ne!(b, e);
        assert_eq!(alloc.allocate(SerialClass::Mobile), None);
    }

    #[test]
    fn reserve_rejects_duplicates_and_moves_cursor() {
        let mut alloc = SerialAllocator::new();
        assert!(alloc.reserve(Serial::new(0x100)));
        assert!(!alloc.reserve(Serial::new(0x100)));
        assert!(!alloc.reserve(Serial::WORLD));
        assert_eq!(alloc.cursor(SerialClass::Mobile), 0x101);
        let fresh = alloc.allocate(SerialClass::Mobile).unwrap();
        assert_eq!(fresh, Serial::new(0x101));
    }

    #[test]
    fn reserve_below_cursor_keeps_cursor() {
        let mut alloc = SerialAllocator::new();
        alloc.reserve(Serial::new(50));
        alloc.reserve(Serial::new(10));
        assert_eq!(alloc.cursor(SerialClass::Mobile), 51);
        assert!(alloc.is_used(Serial::new(10)));
        assert_eq!(alloc.in_use(SerialClass::Mobile), 2);
    }

    #[test]
    fn reserve_at_range_end_wraps_cursor() {
        let mut alloc = SerialAllocator::with_ranges(1..=3, 0x4000_0000..=0x4000_0003);
        assert!(alloc.reserve(Serial::new(3)));
        assert_eq!(alloc.cursor(SerialClass::Mobile), 1);
        assert_eq!(alloc.allocate(SerialClass::Mobile), Some(Serial::new(1)));
    }

    #[test]
    fn restore_cursor_ignores_out_of_range() {
        let mut alloc = SerialAllocator::new();
        alloc.restore_cursor(SerialClass::Item, 5);
        assert_eq!(alloc.cursor(SerialClass::Item), 0x4000_0000);
        alloc.restore_cursor(SerialClass::Item, 0x4000_0200);
        assert_eq!(alloc.cursor(SerialClass::Item), 0x4000_0200);
    }
}
