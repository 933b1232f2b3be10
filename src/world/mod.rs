//! The live world: entity arena, spatial map, observers and timers.
//!
//! [`World`] is the single owner of all mutable state. Ownership changes live
//! in [`ownership`], invariant checks in [`diagnostics`]; everything here is
//! the collaborator-facing surface.

pub mod diagnostics;
pub mod entity;
pub mod equipment;
pub mod events;
pub mod geometry;
pub mod map;
pub mod ownership;
pub mod serial;
pub mod templates;
pub mod timers;
pub mod visibility;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::errors::{PersistError, WorldError, WorldResult};
use crate::logutil::escape_log;
use crate::metrics;
use crate::persist::accounts::AccountBook;
use crate::persist::{self, LoadReport, SaveReport};

use self::entity::{Direction, Entity, EntityKind, Location, Parent};
use self::events::EventRegistry;
use self::geometry::MapGeometry;
use self::map::{SpatialMap, StaticTile};
use self::serial::{Serial, SerialAllocator};
use self::templates::{TemplateRegistry, TemplateRegistryBuilder};
use self::timers::{TimerId, TimerWheel};
use self::visibility::{ConnectionId, NullSink, ObserverSink, Sighting, Visibility};

/// Static parameters a world is built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldSettings {
    pub geometry: MapGeometry,
    pub view_radius_min: u32,
    pub view_radius_max: u32,
    pub view_radius_default: u32,
    /// Length of one tick.
    pub tick_ms: u64,
}

impl Default for WorldSettings {
    fn default() -> Self {
        Self {
            geometry: MapGeometry::default(),
            view_radius_min: 5,
            view_radius_max: 24,
            view_radius_default: 18,
            tick_ms: 100,
        }
    }
}

impl WorldSettings {
    pub fn ticks_per_second(&self) -> u32 {
        (1000 / self.tick_ms.max(1)).max(1) as u32
    }

    /// Whole ticks covering `delay`, rounded up.
    pub fn ticks_for(&self, delay: Duration) -> u64 {
        let ms = delay.as_millis() as u64;
        let tick = self.tick_ms.max(1);
        ms.div_ceil(tick)
    }
}

/// What one call to [`World::tick`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u64,
    pub fired: usize,
    pub handled: usize,
    pub dropped: usize,
    /// Connections to close before the next tick.
    pub disconnects: Vec<ConnectionId>,
}

pub struct World {
    pub(crate) settings: WorldSettings,
    pub(crate) entities: HashMap<Serial, Entity>,
    pub(crate) serials: SerialAllocator,
    pub(crate) map: SpatialMap,
    pub(crate) visibility: Visibility,
    pub(crate) timers: TimerWheel,
    pub(crate) accounts: AccountBook,
    pub(crate) events: Arc<EventRegistry>,
    pub(crate) templates: Arc<TemplateRegistry>,
    pub(crate) sink: Box<dyn ObserverSink>,
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("entities", &self.entities.len())
            .field("placed", &self.map.len())
            .field("observers", &self.visibility.len())
            .field("timers", &self.timers)
            .finish()
    }
}

fn sightings(entities: &HashMap<Serial, Entity>) -> impl Fn(Serial) -> Option<Sighting> + '_ {
    move |serial| {
        entities.get(&serial).map(|entity| Sighting {
            subject: serial,
            location: entity.location,
            direction: entity.direction,
        })
    }
}

impl World {
    /// Empty world with the built-in templates and no event handlers.
    pub fn new(settings: WorldSettings) -> Self {
        Self {
            settings,
            entities: HashMap::new(),
            serials: SerialAllocator::new(),
            map: SpatialMap::new(settings.geometry),
            visibility: Visibility::new(settings.view_radius_min, settings.view_radius_max),
            timers: TimerWheel::new(settings.ticks_per_second()),
            accounts: AccountBook::default(),
            events: EventRegistry::empty(),
            templates: TemplateRegistryBuilder::new().with_builtins().build(),
            sink: Box::new(NullSink),
        }
    }

    pub fn with_events(mut self, events: Arc<EventRegistry>) -> Self {
        self.events = events;
        self
    }

    pub fn with_templates(mut self, templates: Arc<TemplateRegistry>) -> Self {
        self.templates = templates;
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn ObserverSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replace the observer sink, returning the previous one.
    pub fn replace_sink(&mut self, sink: Box<dyn ObserverSink>) -> Box<dyn ObserverSink> {
        std::mem::replace(&mut self.sink, sink)
    }

    pub fn settings(&self) -> &WorldSettings {
        &self.settings
    }

    pub fn map(&self) -> &SpatialMap {
        &self.map
    }

    pub fn visibility(&self) -> &Visibility {
        &self.visibility
    }

    pub fn timers(&self) -> &TimerWheel {
        &self.timers
    }

    pub fn serials(&self) -> &SerialAllocator {
        &self.serials
    }

    pub fn accounts(&self) -> &AccountBook {
        &self.accounts
    }

    pub fn accounts_mut(&mut self) -> &mut AccountBook {
        &mut self.accounts
    }

    pub fn events(&self) -> &Arc<EventRegistry> {
        &self.events
    }

    pub fn templates(&self) -> &Arc<TemplateRegistry> {
        &self.templates
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// All live entities, in no particular order.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn find(&self, serial: Serial) -> Option<&Entity> {
        self.entities.get(&serial)
    }

    /// Instantiate `template` on the ground at the map origin.
    pub fn create_entity(&mut self, template: &str) -> WorldResult<Serial> {
        self.create_entity_at(template, Location::default())
    }

    /// Instantiate `template` on the ground at `location`.
    pub fn create_entity_at(&mut self, template: &str, location: Location) -> WorldResult<Serial> {
        let serial = self.spawn(template, location)?;
        if !self.force_add_child(Parent::World, serial) {
            warn!("new entity {} could not be placed in the world", serial);
        }
        Ok(serial)
    }

    /// Instantiate `template` directly under `parent`. On refusal the new
    /// entity is destroyed again and the refusal returned.
    pub fn create_entity_in(&mut self, template: &str, parent: Serial) -> WorldResult<Serial> {
        let serial = self.spawn(template, Location::default())?;
        if let Err(reason) = self.set_parent(serial, Parent::Entity(parent)) {
            self.destroy(serial);
            return Err(reason.into());
        }
        Ok(serial)
    }

    /// Allocate and register an entity parked in the void, ready to attach.
    fn spawn(&mut self, template: &str, location: Location) -> WorldResult<Serial> {
        let found = self
            .templates
            .get(template)
            .ok_or_else(|| WorldError::UnknownTemplate(template.to_string()))?;
        let serial = self
            .serials
            .allocate(found.kind.serial_class())
            .ok_or(WorldError::SerialsExhausted(found.kind.name()))?;
        let mut entity = found.instantiate(serial);
        entity.location = self.settings.geometry.bound(location);
        entity.parent = Parent::Void;
        debug!("created {} from template '{}'", serial, escape_log(template));
        self.entities.insert(serial, entity);
        Ok(serial)
    }

    /// Destroy `serial` and everything it holds. A ridden steed is dismounted
    /// rather than destroyed with its rider.
    pub fn destroy(&mut self, serial: Serial) -> bool {
        let Some(entity) = self.entities.get(&serial) else {
            return false;
        };
        let mut held: Vec<Serial> = entity
            .container()
            .map(|c| c.children.clone())
            .unwrap_or_default();
        let mut steed = None;
        if let Some(mobile) = entity.mobile() {
            for (layer, worn) in mobile.equipment.iter() {
                if layer == equipment::Layer::Mount {
                    steed = Some(worn);
                } else {
                    held.push(worn);
                }
            }
        }
        if steed.is_some() {
            if let Err(reason) = self.dismount(serial) {
                warn!("could not dismount {} before destroying it: {}", serial, reason);
            }
        }
        for child in held {
            self.destroy(child);
        }

        self.detach(serial);
        if let Some(observer) = self.visibility.detach(serial) {
            self.visibility.queue_disconnect(observer.connection);
        }
        self.accounts.forget_character(serial);
        self.entities.remove(&serial);
        self.serials.release(serial);
        debug!("destroyed {}", serial);
        true
    }

    /// Turn toward `direction`, or step one tile if already facing it.
    /// Only entities on the map can move.
    pub fn move_entity(&mut self, serial: Serial, direction: Direction) -> bool {
        let Some(entity) = self.entities.get_mut(&serial) else {
            return false;
        };
        if entity.parent != Parent::World {
            return false;
        }
        let old = entity.location;
        if entity.direction != direction {
            entity.direction = direction;
            self.announce(serial, Some(old));
            return true;
        }
        let (dx, dy) = direction.delta();
        let to = self.settings.geometry.step(old, dx, dy);
        entity.location = to;
        self.map.relocate(serial, to);
        self.derive_floor(serial);
        self.announce(serial, Some(old));
        true
    }

    /// Put `serial` at `location`. On the map this is an instant move; for a
    /// held entity it only records where it will appear when dropped.
    pub fn teleport(&mut self, serial: Serial, location: Location) -> bool {
        let location = self.settings.geometry.bound(location);
        let Some(entity) = self.entities.get_mut(&serial) else {
            return false;
        };
        let old = entity.location;
        entity.location = location;
        if entity.parent == Parent::World {
            self.map.relocate(serial, location);
            self.derive_floor(serial);
            self.announce(serial, Some(old));
        }
        true
    }

    pub fn set_name(&mut self, serial: Serial, name: impl Into<String>) -> bool {
        match self.entities.get_mut(&serial) {
            Some(entity) => {
                entity.name = name.into();
                true
            }
            None => false,
        }
    }

    pub fn set_hue(&mut self, serial: Serial, hue: u16) -> bool {
        match self.entities.get_mut(&serial) {
            Some(entity) => {
                entity.hue = hue;
                self.announce_if_placed(serial);
                true
            }
            None => false,
        }
    }

    /// Change an entity's own weight, keeping every cached total above it in step.
    pub fn set_weight(&mut self, serial: Serial, weight: u16) -> bool {
        let Some(entity) = self.entities.get_mut(&serial) else {
            return false;
        };
        let before = entity.total_weight() as i64;
        entity.weight = weight;
        let after = entity.total_weight() as i64;
        self.propagate(serial, after - before, 0);
        true
    }

    /// Change a stack's amount. Mobiles have no amount.
    pub fn set_amount(&mut self, serial: Serial, amount: u16) -> bool {
        let Some(entity) = self.entities.get_mut(&serial) else {
            return false;
        };
        let before = entity.total_weight() as i64;
        let Some(item) = entity.item_mut() else {
            return false;
        };
        item.amount = amount.max(1);
        let after = entity.total_weight() as i64;
        self.propagate(serial, after - before, 0);
        true
    }

    /// Everything on the map within `radius` of `center`.
    pub fn query_range(&self, center: Location, radius: u32) -> Vec<Serial> {
        self.map.query_range(center, radius)
    }

    /// Bake a static tile into the map. Mobiles standing on it pick up the new floor.
    pub fn add_static(&mut self, tile: StaticTile) {
        self.map.add_static(tile);
        let standing: Vec<Serial> = self
            .map
            .mobiles_in_range(Location::new(tile.x, tile.y, tile.z), 0);
        for serial in standing {
            self.derive_floor(serial);
        }
    }

    /// Bind an on-map mobile to a connection. Returns the clamped radius.
    /// A mobile observed by another connection is refused; the same connection
    /// may re-attach to change its radius.
    pub fn attach_observer(
        &mut self,
        mobile: Serial,
        connection: ConnectionId,
        radius: Option<u32>,
    ) -> WorldResult<u32> {
        match self.entities.get(&mobile) {
            Some(entity) if entity.kind() == EntityKind::Mobile => {}
            Some(_) => return Err(crate::errors::Rejection::Incompatible.into()),
            None => return Err(WorldError::NotFound(mobile)),
        }
        if let Some(observer) = self.visibility.get(mobile) {
            if observer.connection != connection {
                return Err(WorldError::AlreadyObserved {
                    mobile,
                    connection: observer.connection,
                });
            }
        }
        let radius = radius.unwrap_or(self.settings.view_radius_default);
        let entities = &self.entities;
        Ok(self.visibility.attach(
            &self.map,
            mobile,
            connection,
            radius,
            sightings(entities),
            self.sink.as_mut(),
        ))
    }

    pub fn detach_observer(&mut self, mobile: Serial) -> bool {
        self.visibility.detach(mobile).is_some()
    }

    pub fn set_view_radius(&mut self, mobile: Serial, radius: u32) -> Option<u32> {
        let entities = &self.entities;
        self.visibility.set_radius(
            &self.map,
            mobile,
            radius,
            sightings(entities),
            self.sink.as_mut(),
        )
    }

    /// What `mobile` currently sees, sorted.
    pub fn visible_to(&self, mobile: Serial) -> Option<Vec<Serial>> {
        let observer = self.visibility.get(mobile)?;
        let mut visible: Vec<Serial> = observer.visible().iter().copied().collect();
        visible.sort_unstable();
        Some(visible)
    }

    /// Schedule `event` after `delay`, rounded up to whole ticks.
    pub fn schedule_event(
        &mut self,
        delay: Duration,
        event: &str,
        receiver: Serial,
        source: Serial,
    ) -> TimerId {
        let ticks = self.settings.ticks_for(delay);
        self.schedule_in_ticks(ticks, event, receiver, source)
    }

    pub fn schedule_in_ticks(
        &mut self,
        ticks: u64,
        event: &str,
        receiver: Serial,
        source: Serial,
    ) -> TimerId {
        self.timers.schedule(ticks, event, receiver, source)
    }

    pub fn cancel_event(&mut self, id: TimerId) -> bool {
        self.timers.cancel(id)
    }

    /// Run the handler `event` for `target` if the entity subscribes to it.
    pub fn fire_entity_event(
        &mut self,
        target: Serial,
        event: &str,
        source: Serial,
        payload: &str,
    ) -> bool {
        let subscribed = self
            .entities
            .get(&target)
            .map(|entity| entity.events.iter().any(|name| name == event))
            .unwrap_or(false);
        if !subscribed {
            return false;
        }
        let registry = Arc::clone(&self.events);
        registry.execute(event, self, target, source, payload)
    }

    /// Advance the clock one tick and run every timer due on it.
    pub fn tick(&mut self) -> TickReport {
        let due = self.timers.tick();
        let mut report = TickReport {
            tick: self.timers.now(),
            fired: due.len(),
            ..Default::default()
        };
        let registry = Arc::clone(&self.events);
        for timer in due {
            let missing = [timer.receiver, timer.source]
                .into_iter()
                .any(|serial| !serial.is_none() && !self.entities.contains_key(&serial));
            if missing {
                debug!("{} dropped: an operand no longer exists", timer.id);
                metrics::timer_dropped();
                report.dropped += 1;
                continue;
            }
            metrics::timer_fired();
            if registry.execute(&timer.event, self, timer.receiver, timer.source, "") {
                report.handled += 1;
            }
        }
        report.disconnects = self.visibility.take_disconnects();
        report
    }

    /// Connections flagged for disconnect outside a tick.
    pub fn take_disconnects(&mut self) -> Vec<ConnectionId> {
        self.visibility.take_disconnects()
    }

    /// Encode and atomically write the whole world to `path`.
    pub fn save(&self, path: &Path) -> Result<SaveReport, PersistError> {
        persist::save::save(self, path)
    }

    /// Rebuild a world from `path`. Recoverable problems are listed in the
    /// report; only I/O and header damage are errors.
    pub fn load(path: &Path, settings: WorldSettings) -> Result<(World, LoadReport), PersistError> {
        persist::load::load(path, settings)
    }

    /// Tell observers about `serial` after a change. `old` is where it was on
    /// the map beforehand, if anywhere.
    pub(crate) fn announce(&mut self, serial: Serial, old: Option<Location>) {
        let now = if self.map.contains(serial) {
            self.entities.get(&serial).map(|entity| Sighting {
                subject: serial,
                location: entity.location,
                direction: entity.direction,
            })
        } else {
            None
        };
        let entities = &self.entities;
        self.visibility.subject_changed(
            &self.map,
            serial,
            old,
            now,
            sightings(entities),
            self.sink.as_mut(),
        );
    }

    fn announce_if_placed(&mut self, serial: Serial) {
        if let Some(here) = self.map.location_of(serial) {
            self.announce(serial, Some(here));
        }
    }

    /// Recompute a placed mobile's floor height from statics and ground items.
    pub(crate) fn derive_floor(&mut self, serial: Serial) {
        let Some(entity) = self.entities.get(&serial) else {
            return;
        };
        if !entity.is_mobile() || entity.parent != Parent::World {
            return;
        }
        let at = entity.location;
        let floor = self.map.floor_at(at.x, at.y, at.z);
        if let Some(mobile) = self.entities.get_mut(&serial).and_then(|e| e.mobile_mut()) {
            mobile.floor_z = floor;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::visibility::RecordingSink;

    fn small_world() -> World {
        World::new(WorldSettings {
            geometry: MapGeometry::new(96, 64, 64),
            ..Default::default()
        })
    }

    #[test]
    fn create_find_destroy() {
        let mut world = small_world();
        let dagger = world.create_entity("dagger").expect("create");
        assert!(dagger.raw() >= 0x4000_0000);
        assert_eq!(world.find(dagger).map(|e| e.name.as_str()), Some("a dagger"));
        assert!(world.map().contains(dagger));
        assert!(world.destroy(dagger));
        assert!(world.find(dagger).is_none());
        assert!(!world.destroy(dagger));
        assert!(!world.map().contains(dagger));
    }

    #[test]
    fn unknown_template_is_an_error() {
        let mut world = small_world();
        assert!(matches!(
            world.create_entity("dragon"),
            Err(WorldError::UnknownTemplate(_))
        ));
    }

    #[test]
    fn move_turns_before_stepping() {
        let mut world = small_world();
        let m = world.create_entity_at("human", Location::new(10, 10, 0)).expect("human");
        assert!(world.move_entity(m, Direction::East));
        assert_eq!(world.find(m).map(|e| e.location()), Some(Location::new(10, 10, 0)));
        assert!(world.move_entity(m, Direction::East));
        assert_eq!(world.find(m).map(|e| e.location()), Some(Location::new(11, 10, 0)));
        assert_eq!(world.map().location_of(m), Some(Location::new(11, 10, 0)));
    }

    #[test]
    fn held_items_cannot_walk() {
        let mut world = small_world();
        let m = world.create_entity("human").expect("human");
        let pack = world.create_entity_in("backpack", m).expect("pack");
        assert!(!world.move_entity(pack, Direction::North));
    }

    #[test]
    fn observer_sees_walker_enter_and_leave() {
        let mut world = small_world().with_sink(Box::new(RecordingSink::default()));
        let watcher = world.create_entity_at("human", Location::new(20, 20, 0)).expect("w");
        let walker = world.create_entity_at("human", Location::new(26, 20, 0)).expect("k");
        world.attach_observer(watcher, 1, Some(5)).expect("attach");
        assert_eq!(world.visible_to(watcher), Some(vec![]));
        world.move_entity(walker, Direction::West);
        world.move_entity(walker, Direction::West);
        assert_eq!(world.visible_to(watcher), Some(vec![walker]));
        world.teleport(walker, Location::new(40, 40, 0));
        assert_eq!(world.visible_to(watcher), Some(vec![]));
    }

    #[test]
    fn a_mobile_has_at_most_one_observing_connection() {
        let mut world = small_world();
        let m = world.create_entity_at("human", Location::new(20, 20, 0)).expect("human");
        assert_eq!(world.attach_observer(m, 1, Some(5)).expect("attach"), 5);
        assert!(matches!(
            world.attach_observer(m, 2, None),
            Err(WorldError::AlreadyObserved { connection: 1, .. })
        ));
        assert_eq!(world.visibility().get(m).map(|o| o.connection), Some(1));
        // the owner may re-attach with a new radius
        assert_eq!(world.attach_observer(m, 1, Some(7)).expect("re-attach"), 7);
    }

    #[test]
    fn ticks_round_delay_up() {
        let settings = WorldSettings::default();
        assert_eq!(settings.ticks_per_second(), 10);
        assert_eq!(settings.ticks_for(Duration::from_millis(250)), 3);
        assert_eq!(settings.ticks_for(Duration::from_secs(2)), 20);
    }
}
