//! Observer bindings and enter/exit/update deltas.
//!
//! An observer is a mobile bound to a connection. Its visible set always
//! equals the placed entities (other than itself) within its view radius;
//! every map mutation is followed by a call here that restores that law and
//! reports the difference through an [`ObserverSink`].

use std::collections::{HashMap, HashSet};

use log::{debug, warn};
use serde::Serialize;

use crate::metrics;

use super::entity::{Direction, Location};
use super::map::SpatialMap;
use super::serial::Serial;

pub type ConnectionId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VisibilityEvent {
    Enter {
        subject: Serial,
        location: Location,
        direction: Direction,
    },
    Update {
        subject: Serial,
        location: Location,
        direction: Direction,
    },
    Exit {
        subject: Serial,
    },
}

impl VisibilityEvent {
    pub fn subject(&self) -> Serial {
        match self {
            VisibilityEvent::Enter { subject, .. }
            | VisibilityEvent::Update { subject, .. }
            | VisibilityEvent::Exit { subject } => *subject,
        }
    }
}

/// Outcome of handing one event to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The connection cannot keep up (or is gone); drop it after this tick.
    Disconnect,
}

/// Where visibility events go. Implementations must not block.
pub trait ObserverSink: Send {
    fn deliver(&mut self, connection: ConnectionId, event: &VisibilityEvent) -> Delivery;
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl ObserverSink for NullSink {
    fn deliver(&mut self, _connection: ConnectionId, _event: &VisibilityEvent) -> Delivery {
        Delivery::Delivered
    }
}

/// Keeps every event in memory, in delivery order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub events: Vec<(ConnectionId, VisibilityEvent)>,
}

impl ObserverSink for RecordingSink {
    fn deliver(&mut self, connection: ConnectionId, event: &VisibilityEvent) -> Delivery {
        self.events.push((connection, event.clone()));
        Delivery::Delivered
    }
}

#[derive(Debug, Clone)]
pub struct Observer {
    pub mobile: Serial,
    pub connection: ConnectionId,
    pub radius: u32,
    visible: HashSet<Serial>,
}

impl Observer {
    pub fn visible(&self) -> &HashSet<Serial> {
        &self.visible
    }
}

/// Where and how a subject currently stands, as seen by observers.
#[derive(Debug, Clone, Copy)]
pub struct Sighting {
    pub subject: Serial,
    pub location: Location,
    pub direction: Direction,
}

#[derive(Debug)]
pub struct Visibility {
    observers: HashMap<Serial, Observer>,
    radius_min: u32,
    radius_max: u32,
    pending_disconnects: Vec<ConnectionId>,
}

impl Visibility {
    pub fn new(radius_min: u32, radius_max: u32) -> Self {
        Self {
            observers: HashMap::new(),
            radius_min: radius_min.min(radius_max),
            radius_max,
            pending_disconnects: Vec::new(),
        }
    }

    pub fn clamp_radius(&self, radius: u32) -> u32 {
        radius.clamp(self.radius_min, self.radius_max)
    }

    pub fn get(&self, mobile: Serial) -> Option<&Observer> {
        self.observers.get(&mobile)
    }

    pub fn observers(&self) -> impl Iterator<Item = &Observer> {
        self.observers.values()
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn observer_for_connection(&self, connection: ConnectionId) -> Option<Serial> {
        self.observers
            .values()
            .find(|o| o.connection == connection)
            .map(|o| o.mobile)
    }

    /// Bind `mobile` to `connection`, replacing any previous binding, and
    /// announce everything currently in range. Returns the clamped radius.
    pub fn attach(
        &mut self,
        map: &SpatialMap,
        mobile: Serial,
        connection: ConnectionId,
        radius: u32,
        sighting: impl Fn(Serial) -> Option<Sighting>,
        sink: &mut dyn ObserverSink,
    ) -> u32 {
        let radius = self.clamp_radius(radius);
        self.observers.insert(
            mobile,
            Observer {
                mobile,
                connection,
                radius,
                visible: HashSet::new(),
            },
        );
        self.refresh_observer(map, mobile, &sighting, sink);
        debug!(
            "observer {} bound to connection {} (radius {})",
            mobile, connection, radius
        );
        radius
    }

    pub fn detach(&mut self, mobile: Serial) -> Option<Observer> {
        self.observers.remove(&mobile)
    }

    pub fn set_radius(
        &mut self,
        map: &SpatialMap,
        mobile: Serial,
        radius: u32,
        sighting: impl Fn(Serial) -> Option<Sighting>,
        sink: &mut dyn ObserverSink,
    ) -> Option<u32> {
        let radius = self.clamp_radius(radius);
        self.observers.get_mut(&mobile)?.radius = radius;
        self.refresh_observer(map, mobile, &sighting, sink);
        Some(radius)
    }

    /// Re-evaluate every observer that might see `subject` after it changed.
    ///
    /// `old` is where the subject was before the change (`None` if it was not
    /// on the map); its current placement is read from `map`. When the subject
    /// is itself an observer, its own visible set is rebuilt too.
    pub fn subject_changed(
        &mut self,
        map: &SpatialMap,
        subject: Serial,
        old: Option<Location>,
        now: Option<Sighting>,
        sighting: impl Fn(Serial) -> Option<Sighting>,
        sink: &mut dyn ObserverSink,
    ) {
        if self.observers.is_empty() {
            return;
        }
        let new_location = now.map(|s| s.location);
        let candidates: HashSet<Serial> = match (old, new_location) {
            (Some(a), Some(b)) => map.members_near(a, b, self.radius_max),
            (Some(a), None) | (None, Some(a)) => map.members_near(a, a, self.radius_max),
            (None, None) => HashSet::new(),
        };

        let mut outgoing = Vec::new();
        for candidate in candidates {
            if candidate == subject {
                continue;
            }
            let Some(observer) = self.observers.get_mut(&candidate) else {
                continue;
            };
            let Some(here) = map.location_of(candidate) else {
                continue;
            };
            let was = observer.visible.contains(&subject);
            let is = now
                .map(|s| map.geometry().in_range(here, s.location, observer.radius))
                .unwrap_or(false);
            let event = match (was, is, now) {
                (false, true, Some(s)) => {
                    observer.visible.insert(subject);
                    VisibilityEvent::Enter {
                        subject,
                        location: s.location,
                        direction: s.direction,
                    }
                }
                (true, true, Some(s)) => VisibilityEvent::Update {
                    subject,
                    location: s.location,
                    direction: s.direction,
                },
                (true, false, _) => {
                    observer.visible.remove(&subject);
                    VisibilityEvent::Exit { subject }
                }
                _ => continue,
            };
            outgoing.push((observer.connection, event));
        }
        // observers that lost track of the subject without being near either point
        if now.is_none() {
            for observer in self.observers.values_mut() {
                if observer.mobile != subject && observer.visible.remove(&subject) {
                    outgoing.push((observer.connection, VisibilityEvent::Exit { subject }));
                }
            }
        }
        outgoing.sort_by_key(|(connection, _)| *connection);
        for (connection, event) in outgoing {
            self.send(sink, connection, &event);
        }

        if self.observers.contains_key(&subject) {
            self.refresh_observer(map, subject, &sighting, sink);
        }
    }

    /// Rebuild one observer's visible set from the map, emitting the difference.
    fn refresh_observer(
        &mut self,
        map: &SpatialMap,
        mobile: Serial,
        sighting: &dyn Fn(Serial) -> Option<Sighting>,
        sink: &mut dyn ObserverSink,
    ) {
        let Some(observer) = self.observers.get(&mobile) else {
            return;
        };
        let connection = observer.connection;
        let now: HashSet<Serial> = match map.location_of(mobile) {
            Some(here) => map
                .query_range(here, observer.radius)
                .into_iter()
                .filter(|serial| *serial != mobile)
                .collect(),
            None => HashSet::new(),
        };

        let mut entered: Vec<Serial> = now.difference(&observer.visible).copied().collect();
        let mut exited: Vec<Serial> = observer.visible.difference(&now).copied().collect();
        entered.sort_unstable();
        exited.sort_unstable();

        let mut outgoing = Vec::with_capacity(entered.len() + exited.len());
        for subject in exited {
            outgoing.push(VisibilityEvent::Exit { subject });
        }
        for subject in entered {
            match sighting(subject) {
                Some(s) => outgoing.push(VisibilityEvent::Enter {
                    subject,
                    location: s.location,
                    direction: s.direction,
                }),
                None => warn!("placed entity {} has no sighting", subject),
            }
        }
        if let Some(observer) = self.observers.get_mut(&mobile) {
            observer.visible = now;
        }
        for event in outgoing {
            self.send(sink, connection, &event);
        }
    }

    fn send(&mut self, sink: &mut dyn ObserverSink, connection: ConnectionId, event: &VisibilityEvent) {
        if sink.deliver(connection, event) == Delivery::Disconnect {
            self.queue_disconnect(connection);
        }
    }

    pub(crate) fn queue_disconnect(&mut self, connection: ConnectionId) {
        if !self.pending_disconnects.contains(&connection) {
            metrics::observer_disconnected();
            self.pending_disconnects.push(connection);
        }
    }

    /// Connections whose sink asked to be dropped since the last call.
    pub fn take_disconnects(&mut self) -> Vec<ConnectionId> {
        std::mem::take(&mut self.pending_disconnects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::geometry::MapGeometry;

    fn setup() -> (SpatialMap, Visibility) {
        let mut map = SpatialMap::new(MapGeometry::new(96, 64, 64));
        map.insert(Serial::new(1), true, Location::new(10, 10, 0));
        map.insert(Serial::new(0x4000_0001), false, Location::new(12, 10, 0));
        map.insert(Serial::new(0x4000_0002), false, Location::new(40, 40, 0));
        (map, Visibility::new(2, 18))
    }

    fn sighting_from(map: &SpatialMap) -> impl Fn(Serial) -> Option<Sighting> + '_ {
        move |serial| {
            map.location_of(serial).map(|location| Sighting {
                subject: serial,
                location,
                direction: Direction::North,
            })
        }
    }

    #[test]
    fn attach_announces_everything_in_range() {
        let (map, mut vis) = setup();
        let mut sink = RecordingSink::default();
        vis.attach(&map, Serial::new(1), 7, 5, sighting_from(&map), &mut sink);
        assert_eq!(sink.events.len(), 1);
        assert_eq!(sink.events[0].1.subject(), Serial::new(0x4000_0001));
        assert!(matches!(sink.events[0].1, VisibilityEvent::Enter { .. }));
    }

    #[test]
    fn radius_is_clamped() {
        let (map, mut vis) = setup();
        let mut sink = NullSink;
        assert_eq!(vis.attach(&map, Serial::new(1), 7, 100, sighting_from(&map), &mut sink), 18);
        assert_eq!(vis.set_radius(&map, Serial::new(1), 0, sighting_from(&map), &mut sink), Some(2));
    }

    #[test]
    fn moving_subject_out_of_range_emits_exit() {
        let (mut map, mut vis) = setup();
        let mut sink = RecordingSink::default();
        vis.attach(&map, Serial::new(1), 7, 5, sighting_from(&map), &mut sink);
        sink.events.clear();

        let item = Serial::new(0x4000_0001);
        let old = map.relocate(item, Location::new(30, 10, 0));
        let now = map.location_of(item).map(|location| Sighting {
            subject: item,
            location,
            direction: Direction::North,
        });
        vis.subject_changed(&map, item, old, now, sighting_from(&map), &mut sink);
        assert_eq!(sink.events, vec![(7, VisibilityEvent::Exit { subject: item })]);
        assert!(vis.get(Serial::new(1)).unwrap().visible().is_empty());
    }

    #[test]
    fn refusing_sink_queues_disconnect() {
        struct Refuse;
        impl ObserverSink for Refuse {
            fn deliver(&mut self, _: ConnectionId, _: &VisibilityEvent) -> Delivery {
                Delivery::Disconnect
            }
        }
        let (map, mut vis) = setup();
        vis.attach(&map, Serial::new(1), 9, 5, sighting_from(&map), &mut Refuse);
        assert_eq!(vis.take_disconnects(), vec![9]);
        assert!(vis.take_disconnects().is_empty());
    }
}
