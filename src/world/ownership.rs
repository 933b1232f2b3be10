//! Parent/child graph maintenance.
//!
//! Every entity has exactly one parent: the world (on the map), the void
//! (orphaned), a container, or a mobile wearing it. Checked operations
//! validate everything before touching state and return a [`Rejection`];
//! the `force_*` variants never fail and log what they had to absorb.
//!
//! Cached totals are kept incrementally: a container's weight and item count
//! cover everything beneath it, and a mobile's equipment weight covers every
//! worn entity except its mount and bank box.

use log::warn;

use crate::errors::Rejection;

use super::entity::{EntityData, Parent};
use super::equipment::Layer;
use super::serial::Serial;
use super::World;

fn adjust(value: u32, delta: i64) -> u32 {
    (value as i64 + delta).clamp(0, u32::MAX as i64) as u32
}

impl World {
    /// Move `serial` under `parent`.
    ///
    /// Leaving the world takes the entity off the map; entering it places the
    /// entity at its current location. If attaching fails after the entity
    /// was already detached, it goes back to its old parent, or to the void
    /// when even that is impossible.
    pub fn set_parent(&mut self, serial: Serial, parent: Parent) -> Result<(), Rejection> {
        self.check_parent(serial, parent)?;
        let old = self.detach(serial);
        if let Err(reason) = self.attach(parent, serial) {
            warn!(
                "{} could not be attached to {} after validation ({}); restoring",
                serial,
                parent.to_serial(),
                reason
            );
            if let Err(again) = self.attach(old, serial) {
                warn!(
                    "{} could not return to {} ({}); parked in the void",
                    serial,
                    old.to_serial(),
                    again
                );
            }
            return Err(reason);
        }
        Ok(())
    }

    /// Put `child` into the container or onto the mobile `parent`.
    pub fn add_child(&mut self, parent: Serial, child: Serial) -> Result<(), Rejection> {
        self.set_parent(child, Parent::Entity(parent))
    }

    /// Take `child` out of `parent` and drop it on the ground where the
    /// outermost holder of `parent` stands.
    pub fn remove_child(&mut self, parent: Serial, child: Serial) -> Result<(), Rejection> {
        let entity = self.entities.get(&child).ok_or(Rejection::NotFound(child))?;
        if entity.parent != Parent::Entity(parent) {
            return Err(Rejection::NotAChild);
        }
        let ground = self.ground_location(parent);
        if let Some(entity) = self.entities.get_mut(&child) {
            entity.location = ground;
        }
        self.set_parent(child, Parent::World)
    }

    /// Wear `item` on `layer`. The item must be designed for that layer.
    pub fn equip(&mut self, mobile: Serial, item: Serial, layer: Layer) -> Result<(), Rejection> {
        let entity = self.entities.get(&item).ok_or(Rejection::NotFound(item))?;
        if entity.is_mobile() || entity.wear_layer() != Some(layer) {
            return Err(Rejection::WrongLayer);
        }
        self.set_parent(item, Parent::Entity(mobile))
    }

    /// Seat `rider` on `steed`. The steed leaves the map and occupies the
    /// rider's mount layer.
    pub fn mount(&mut self, rider: Serial, steed: Serial) -> Result<(), Rejection> {
        let entity = self.entities.get(&steed).ok_or(Rejection::NotFound(steed))?;
        if !entity.is_mobile() {
            return Err(Rejection::Incompatible);
        }
        self.set_parent(steed, Parent::Entity(rider))
    }

    /// Put the rider's steed back on the map under the rider. Returns the steed.
    pub fn dismount(&mut self, rider: Serial) -> Result<Serial, Rejection> {
        let entity = self.entities.get(&rider).ok_or(Rejection::NotFound(rider))?;
        let mobile = entity.mobile().ok_or(Rejection::Incompatible)?;
        let steed = mobile.equipment.get(Layer::Mount).ok_or(Rejection::NotAChild)?;
        let at = entity.location;
        let facing = entity.direction;
        if let Some(steed_entity) = self.entities.get_mut(&steed) {
            steed_entity.location = at;
            steed_entity.direction = facing;
        }
        self.set_parent(steed, Parent::World)?;
        Ok(steed)
    }

    /// The steed `rider` is sitting on, if any.
    pub fn steed_of(&self, rider: Serial) -> Option<Serial> {
        self.entities
            .get(&rider)?
            .mobile()?
            .equipment
            .get(Layer::Mount)
    }

    /// Attach without checking caps. Structural impossibilities (unknown
    /// parent, occupied layer) park the child in the void instead. Returns
    /// whether the child ended up under `parent`.
    pub fn force_add_child(&mut self, parent: Parent, child: Serial) -> bool {
        let Some(entity) = self.entities.get(&child) else {
            warn!("force_add_child: {} does not exist", child);
            return false;
        };
        if entity.parent == parent && parent != Parent::Void {
            return true;
        }
        if let Parent::Entity(holder) = parent {
            if holder == child || self.is_ancestor(child, holder) {
                warn!("force_add_child: {} under {} would be a cycle", child, holder);
                return false;
            }
        }
        self.detach(child);
        match self.attach(parent, child) {
            Ok(()) => true,
            Err(reason) => {
                warn!(
                    "force_add_child: {} refused by {} ({}); parked in the void",
                    child,
                    parent.to_serial(),
                    reason
                );
                false
            }
        }
    }

    /// Detach `child` from `parent` into the void. Returns `false` (and
    /// changes nothing) when `child` is not actually under `parent`.
    pub fn force_remove_child(&mut self, parent: Parent, child: Serial) -> bool {
        match self.entities.get(&child) {
            Some(entity) if entity.parent == parent => {
                self.detach(child);
                true
            }
            Some(entity) => {
                warn!(
                    "force_remove_child: {} is under {}, not {}",
                    child,
                    entity.parent.to_serial(),
                    parent.to_serial()
                );
                false
            }
            None => {
                warn!("force_remove_child: {} does not exist", child);
                false
            }
        }
    }

    /// True when `ancestor` appears on the parent chain above `serial`.
    pub fn is_ancestor(&self, ancestor: Serial, serial: Serial) -> bool {
        let mut current = serial;
        for _ in 0..=self.entities.len() {
            match self.entities.get(&current).and_then(|e| e.parent.entity()) {
                Some(parent) if parent == ancestor => return true,
                Some(parent) => current = parent,
                None => return false,
            }
        }
        false
    }

    /// The top-level entity holding `serial` (itself when on the map or orphaned).
    pub fn outermost(&self, serial: Serial) -> Serial {
        let mut current = serial;
        for _ in 0..=self.entities.len() {
            match self.entities.get(&current).and_then(|e| e.parent.entity()) {
                Some(parent) if self.entities.contains_key(&parent) => current = parent,
                _ => break,
            }
        }
        current
    }

    fn ground_location(&self, holder: Serial) -> super::entity::Location {
        let top = self.outermost(holder);
        self.entities
            .get(&top)
            .map(|e| e.location)
            .unwrap_or_default()
    }

    /// Full validation of a prospective move, without side effects.
    pub fn check_parent(&self, serial: Serial, parent: Parent) -> Result<(), Rejection> {
        let child = self.entities.get(&serial).ok_or(Rejection::NotFound(serial))?;
        if child.parent == parent {
            return Err(Rejection::AlreadyContained);
        }
        let target_serial = match parent {
            Parent::World | Parent::Void => return Ok(()),
            Parent::Entity(target) => target,
        };
        let target = self
            .entities
            .get(&target_serial)
            .ok_or(Rejection::NotFound(target_serial))?;
        if target_serial == serial || self.is_ancestor(serial, target_serial) {
            return Err(Rejection::Cycle);
        }
        match &target.data {
            EntityData::Item(_) => Err(Rejection::Incompatible),
            EntityData::Container(..) => {
                if child.is_mobile() {
                    return Err(Rejection::Incompatible);
                }
                self.check_caps(serial, target_serial)
            }
            EntityData::Mobile(mobile) => {
                let layer = child.wear_layer().ok_or(Rejection::Incompatible)?;
                match child.mobile() {
                    Some(steed) => {
                        // riders stand on the map and steeds carry nobody
                        if target.parent != Parent::World
                            || !steed.equipment.is_free(Layer::Mount)
                        {
                            return Err(Rejection::Incompatible);
                        }
                    }
                    None if layer == Layer::Mount => return Err(Rejection::Incompatible),
                    None => {}
                }
                if !mobile.equipment.is_free(layer) {
                    return Err(Rejection::LayerOccupied);
                }
                Ok(())
            }
        }
    }

    /// Caps of `container` and every container above it, ignoring containers
    /// that already hold `child` (a move within them changes nothing).
    fn check_caps(&self, child: Serial, container: Serial) -> Result<(), Rejection> {
        let Some(entity) = self.entities.get(&child) else {
            return Err(Rejection::NotFound(child));
        };
        let weight = entity.total_weight() as u64;
        let items = entity.total_items() as u64;
        let mut current = Some(container);
        for _ in 0..=self.entities.len() {
            let Some(serial) = current else {
                break;
            };
            let Some(holder) = self.entities.get(&serial) else {
                break;
            };
            if let Some(c) = holder.container() {
                if !self.is_ancestor(serial, child) {
                    if let Some(max) = c.max_weight {
                        if c.weight as u64 + weight > max as u64 {
                            return Err(Rejection::TooHeavy);
                        }
                    }
                    if let Some(max) = c.max_items {
                        if c.item_count as u64 + items > max as u64 {
                            return Err(Rejection::TooManyItems);
                        }
                    }
                }
            }
            current = holder.parent.entity();
        }
        Ok(())
    }

    /// Unlink `serial` from whatever holds it and park it in the void.
    /// Returns the parent it had.
    pub(crate) fn detach(&mut self, serial: Serial) -> Parent {
        let Some(entity) = self.entities.get(&serial) else {
            return Parent::Void;
        };
        let parent = entity.parent;
        let weight = entity.total_weight();
        let items = entity.total_items();
        match parent {
            Parent::World => {
                let old = self.map.remove(serial);
                if let Some(entity) = self.entities.get_mut(&serial) {
                    entity.parent = Parent::Void;
                }
                if old.is_some() {
                    self.announce(serial, old);
                } else {
                    warn!("{} was parented to the world but not on the map", serial);
                }
            }
            Parent::Void => {}
            Parent::Entity(holder) => {
                // totals first, while the child is still linked
                self.propagate(serial, -(weight as i64), -(items as i64));
                match self.entities.get_mut(&holder).map(|e| &mut e.data) {
                    Some(EntityData::Container(_, container)) => {
                        container.children.retain(|c| *c != serial);
                    }
                    Some(EntityData::Mobile(mobile)) => {
                        if mobile.equipment.take(serial, weight).is_none() {
                            warn!("{} was parented to {} but not worn", serial, holder);
                        }
                    }
                    Some(EntityData::Item(_)) => {
                        warn!("{} was parented to plain item {}", serial, holder)
                    }
                    None => warn!("{} was parented to missing {}", serial, holder),
                }
                if let Some(entity) = self.entities.get_mut(&serial) {
                    entity.parent = Parent::Void;
                }
            }
        }
        parent
    }

    /// Link a detached `serial` under `parent`. Caps are not checked here.
    pub(crate) fn attach(&mut self, parent: Parent, serial: Serial) -> Result<(), Rejection> {
        let entity = self
            .entities
            .get(&serial)
            .ok_or(Rejection::NotFound(serial))?;
        let weight = entity.total_weight();
        let items = entity.total_items();
        let mobile_child = entity.is_mobile();
        let layer = entity.wear_layer();
        match parent {
            Parent::Void => {}
            Parent::World => {
                let location = self.settings.geometry.bound(entity.location);
                if let Some(entity) = self.entities.get_mut(&serial) {
                    entity.location = location;
                    entity.parent = Parent::World;
                }
                self.map.insert(serial, mobile_child, location);
                self.derive_floor(serial);
                self.announce(serial, None);
                return Ok(());
            }
            Parent::Entity(holder) => {
                let contained = match self.entities.get_mut(&holder).map(|e| &mut e.data) {
                    Some(EntityData::Container(_, container)) => {
                        if mobile_child {
                            return Err(Rejection::Incompatible);
                        }
                        if !container.children.contains(&serial) {
                            container.children.push(serial);
                        }
                        true
                    }
                    Some(EntityData::Mobile(mobile)) => {
                        let layer = layer.ok_or(Rejection::Incompatible)?;
                        // worn totals enter through the slot rather than propagate()
                        if !mobile.equipment.put(layer, serial, weight) {
                            return Err(Rejection::LayerOccupied);
                        }
                        false
                    }
                    Some(EntityData::Item(_)) => return Err(Rejection::Incompatible),
                    None => return Err(Rejection::NotFound(holder)),
                };
                if let Some(entity) = self.entities.get_mut(&serial) {
                    entity.parent = parent;
                }
                if contained {
                    self.propagate(serial, weight as i64, items as i64);
                }
                return Ok(());
            }
        }
        if let Some(entity) = self.entities.get_mut(&serial) {
            entity.parent = Parent::Void;
        }
        Ok(())
    }

    /// Apply a change of `dw` weight and `dn` items below `serial` to every
    /// cached total above it. The walk stops at the first mobile, whose
    /// equipment weight absorbs the change when the worn layer counts.
    pub(crate) fn propagate(&mut self, serial: Serial, dw: i64, dn: i64) {
        if dw == 0 && dn == 0 {
            return;
        }
        let mut child = serial;
        for _ in 0..=self.entities.len() {
            let Some(holder) = self.entities.get(&child).and_then(|e| e.parent.entity()) else {
                return;
            };
            match self.entities.get_mut(&holder).map(|e| &mut e.data) {
                Some(EntityData::Container(_, container)) => {
                    container.weight = adjust(container.weight, dw);
                    container.item_count = adjust(container.item_count, dn);
                }
                Some(EntityData::Mobile(mobile)) => {
                    let counts = mobile
                        .equipment
                        .layer_of(child)
                        .is_some_and(Layer::counts_toward_weight);
                    if counts {
                        mobile.equipment.adjust_weight(dw);
                    }
                    return;
                }
                _ => return,
            }
            child = holder;
        }
        warn!("weight propagation from {} did not reach the top; cycle?", serial);
    }

    /// Rebuild every container's cached totals and every mobile's equipment
    /// weight from scratch.
    pub(crate) fn recompute_totals(&mut self) {
        let containers: Vec<Serial> = self
            .entities
            .values()
            .filter(|e| e.container().is_some() && e.parent.entity().is_none())
            .map(|e| e.serial)
            .collect();
        let mobiles: Vec<Serial> = self
            .entities
            .values()
            .filter(|e| e.is_mobile())
            .map(|e| e.serial)
            .collect();
        for serial in containers {
            self.recompute_container(serial, 0);
        }
        for serial in mobiles {
            let worn: Vec<(Layer, Serial)> = self
                .entities
                .get(&serial)
                .and_then(|e| e.mobile())
                .map(|m| m.equipment.iter().collect())
                .unwrap_or_default();
            let mut total = 0u32;
            for (layer, child) in worn {
                if self.entities.get(&child).is_some_and(|e| e.container().is_some()) {
                    self.recompute_container(child, 0);
                }
                if layer.counts_toward_weight() {
                    total = total.saturating_add(
                        self.entities.get(&child).map(|e| e.total_weight()).unwrap_or(0),
                    );
                }
            }
            if let Some(mobile) = self.entities.get_mut(&serial).and_then(|e| e.mobile_mut()) {
                mobile.equipment.set_weight(total);
            }
        }
    }

    /// Recompute one container bottom-up. Returns its new total weight and item count.
    fn recompute_container(&mut self, serial: Serial, depth: usize) -> (u32, u32) {
        let children = match self.entities.get(&serial).and_then(|e| e.container()) {
            Some(container) => container.children.clone(),
            None => {
                let total = self.entities.get(&serial);
                return (
                    total.map(|e| e.total_weight()).unwrap_or(0),
                    total.map(|e| e.total_items()).unwrap_or(0),
                );
            }
        };
        if depth > self.entities.len() {
            warn!("containment too deep under {}; cycle?", serial);
            return (0, 0);
        }
        let mut weight = 0u32;
        let mut items = 0u32;
        for child in children {
            let (w, n) = self.recompute_container(child, depth + 1);
            weight = weight.saturating_add(w);
            items = items.saturating_add(n);
        }
        match self.entities.get_mut(&serial) {
            Some(entity) => {
                if let Some(container) = entity.container_mut() {
                    container.weight = weight;
                    container.item_count = items;
                }
                (entity.total_weight(), entity.total_items())
            }
            None => (0, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::errors::Rejection;
    use crate::world::entity::{Location, Parent};
    use crate::world::equipment::Layer;
    use crate::world::geometry::MapGeometry;
    use crate::world::{World, WorldSettings};

    fn world() -> World {
        World::new(WorldSettings {
            geometry: MapGeometry::new(96, 64, 64),
            ..Default::default()
        })
    }

    #[test]
    fn container_weight_follows_moves() {
        let mut w = world();
        let bag = w.create_entity("bag").expect("bag");
        let pouch = w.create_entity("pouch").expect("pouch");
        let gold = w.create_entity("gold").expect("gold");
        w.set_weight(gold, 1);
        w.set_amount(gold, 30);

        w.add_child(pouch, gold).expect("gold into pouch");
        w.add_child(bag, pouch).expect("pouch into bag");
        assert_eq!(w.find(pouch).unwrap().container().unwrap().weight(), 30);
        assert_eq!(w.find(bag).unwrap().container().unwrap().weight(), 31);
        assert_eq!(w.find(bag).unwrap().container().unwrap().item_count(), 2);

        w.set_amount(gold, 10);
        assert_eq!(w.find(bag).unwrap().container().unwrap().weight(), 11);

        w.remove_child(pouch, gold).expect("out");
        assert_eq!(w.find(bag).unwrap().container().unwrap().weight(), 1);
        assert_eq!(w.find(gold).unwrap().parent(), Parent::World);
        assert!(w.check_invariants().is_empty());
    }

    #[test]
    fn cycles_are_rejected() {
        let mut w = world();
        let outer = w.create_entity("bag").expect("outer");
        let inner = w.create_entity("bag").expect("inner");
        w.add_child(outer, inner).expect("nest");
        assert_eq!(w.add_child(inner, outer), Err(Rejection::Cycle));
        assert_eq!(w.add_child(outer, outer), Err(Rejection::Cycle));
        assert_eq!(w.add_child(outer, inner), Err(Rejection::AlreadyContained));
    }

    #[test]
    fn caps_apply_to_every_ancestor() {
        let mut w = world();
        let pouch = w.create_entity("pouch").expect("pouch"); // 100 stones max
        let bag = w.create_entity("bag").expect("bag");
        w.add_child(pouch, bag).expect("bag into pouch");
        let anvil = w.create_entity("gold").expect("anvil");
        w.set_weight(anvil, 150);
        assert_eq!(w.add_child(bag, anvil), Err(Rejection::TooHeavy));
        assert_eq!(w.find(anvil).unwrap().parent(), Parent::World);
        assert_eq!(w.find(bag).unwrap().container().unwrap().weight(), 0);
    }

    #[test]
    fn item_cap_counts_nested_contents() {
        let mut w = world();
        let pouch = w.create_entity("pouch").expect("pouch"); // 20 items max
        let bag = w.create_entity("bag").expect("bag");
        for _ in 0..20 {
            let coin = w.create_entity("gold").expect("coin");
            w.add_child(bag, coin).expect("coin into bag");
        }
        assert_eq!(w.add_child(pouch, bag), Err(Rejection::TooManyItems));
    }

    #[test]
    fn equipping_respects_layers() {
        let mut w = world();
        let m = w.create_entity("human").expect("human");
        let helm = w.create_entity("helm").expect("helm");
        let other = w.create_entity("helm").expect("helm");
        let gold = w.create_entity("gold").expect("gold");
        assert_eq!(w.equip(m, helm, Layer::Shirt), Err(Rejection::WrongLayer));
        w.equip(m, helm, Layer::Helm).expect("wear");
        assert_eq!(w.add_child(m, other), Err(Rejection::LayerOccupied));
        assert_eq!(w.add_child(m, gold), Err(Rejection::Incompatible));
        let equipped = w.find(m).unwrap().mobile().unwrap().equipment().weight();
        assert_eq!(equipped, 5);
        assert!(!w.map().contains(helm));
    }

    #[test]
    fn mount_and_dismount() {
        let mut w = world();
        let rider = w.create_entity_at("human", Location::new(10, 10, 0)).expect("rider");
        let horse = w.create_entity_at("horse", Location::new(11, 10, 0)).expect("horse");
        w.mount(rider, horse).expect("mount");
        assert_eq!(w.steed_of(rider), Some(horse));
        assert!(!w.map().contains(horse));
        assert_eq!(w.find(rider).unwrap().mobile().unwrap().equipment().weight(), 0);

        let pony = w.create_entity("horse").expect("pony");
        assert_eq!(w.mount(horse, pony), Err(Rejection::Incompatible));

        assert_eq!(w.dismount(rider), Ok(horse));
        assert_eq!(w.find(horse).unwrap().location(), Location::new(10, 10, 0));
        assert!(w.map().contains(horse));
        assert!(w.check_invariants().is_empty());
    }

    #[test]
    fn mobiles_do_not_fit_in_containers() {
        let mut w = world();
        let bag = w.create_entity("bag").expect("bag");
        let m = w.create_entity("human").expect("human");
        assert_eq!(w.add_child(bag, m), Err(Rejection::Incompatible));
    }

    #[test]
    fn force_add_ignores_caps_and_void_is_a_leak() {
        let mut w = world();
        let pouch = w.create_entity("pouch").expect("pouch");
        let anvil = w.create_entity("gold").expect("anvil");
        w.set_weight(anvil, 500);
        assert!(w.force_add_child(Parent::Entity(pouch), anvil));
        assert_eq!(w.find(pouch).unwrap().container().unwrap().weight(), 500);

        assert!(w.force_remove_child(Parent::Entity(pouch), anvil));
        assert_eq!(w.leaked(), vec![anvil]);
        assert!(!w.force_remove_child(Parent::Entity(pouch), anvil));
    }

    #[test]
    fn destroy_takes_contents_but_spares_the_steed() {
        let mut w = world();
        let rider = w.create_entity_at("human", Location::new(5, 5, 0)).expect("rider");
        let horse = w.create_entity_at("horse", Location::new(5, 6, 0)).expect("horse");
        let pack = w.create_entity_in("backpack", rider).expect("pack");
        let gold = w.create_entity_in("gold", pack).expect("gold");
        w.mount(rider, horse).expect("mount");
        assert!(w.destroy(rider));
        assert!(w.find(pack).is_none());
        assert!(w.find(gold).is_none());
        assert_eq!(w.find(horse).map(|e| e.parent()), Some(Parent::World));
        assert!(w.check_invariants().is_empty());
    }
}
