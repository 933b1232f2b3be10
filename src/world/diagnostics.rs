//! Consistency checks over the whole world.
//!
//! Used by tests after every mutation, by the loader after phase three, and by
//! the `check` command. Nothing here mutates.

use std::collections::HashSet;

use serde::Serialize;
use thiserror::Error;

use super::entity::{EntityData, Parent};
use super::serial::Serial;
use super::World;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum InvariantViolation {
    #[error("{serial} names missing parent {parent}")]
    MissingParent { serial: Serial, parent: Serial },

    #[error("{serial} is not listed by its parent {parent}")]
    NotListedByParent { serial: Serial, parent: Serial },

    #[error("{parent} lists {child}, whose parent is elsewhere")]
    StrayChild { parent: Serial, child: Serial },

    #[error("{serial} sits in a parent cycle")]
    Cycle { serial: Serial },

    #[error("container {serial} caches weight {cached}, contents weigh {actual}")]
    ContainerWeight { serial: Serial, cached: u32, actual: u32 },

    #[error("container {serial} caches {cached} items, holds {actual}")]
    ContainerCount { serial: Serial, cached: u32, actual: u32 },

    #[error("mobile {serial} caches equipment weight {cached}, worn items weigh {actual}")]
    EquipmentWeight { serial: Serial, cached: u32, actual: u32 },

    #[error("{child} is worn by {mobile} on the wrong layer")]
    WrongLayer { mobile: Serial, child: Serial },

    #[error("{serial} is parented to the world but not on the map")]
    NotPlaced { serial: Serial },

    #[error("{serial} is on the map but not parented to the world")]
    PlacedWhileHeld { serial: Serial },

    #[error("{serial} is on the map at a different location")]
    MisplacedOnMap { serial: Serial },

    #[error("{serial} appears in {chunks} chunks")]
    ChunkMembership { serial: Serial, chunks: usize },

    #[error("{serial} is not marked used by the allocator")]
    SerialNotReserved { serial: Serial },

    #[error("{serial} lies outside the range for its kind")]
    SerialClassMismatch { serial: Serial },

    #[error("observer {observer} has a stale visible set")]
    StaleVisibility { observer: Serial },
}

impl World {
    /// Entities parked under the void parent, sorted.
    pub fn leaked(&self) -> Vec<Serial> {
        let mut leaked: Vec<Serial> = self
            .entities
            .values()
            .filter(|entity| entity.parent == Parent::Void)
            .map(|entity| entity.serial)
            .collect();
        leaked.sort_unstable();
        leaked
    }

    /// Every broken invariant, in serial order. Empty means consistent.
    pub fn check_invariants(&self) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();
        let mut serials: Vec<Serial> = self.entities.keys().copied().collect();
        serials.sort_unstable();

        for serial in &serials {
            let serial = *serial;
            let Some(entity) = self.entities.get(&serial) else {
                continue;
            };

            if !self.serials.is_used(serial) {
                violations.push(InvariantViolation::SerialNotReserved { serial });
            }
            if serial.class() != Some(entity.kind().serial_class()) {
                violations.push(InvariantViolation::SerialClassMismatch { serial });
            }

            match entity.parent {
                Parent::World => match self.map.location_of(serial) {
                    None => violations.push(InvariantViolation::NotPlaced { serial }),
                    Some(at) if at != entity.location => {
                        violations.push(InvariantViolation::MisplacedOnMap { serial })
                    }
                    Some(_) => {
                        let chunks = self.map.chunk_holding(serial).len();
                        let expected = self.settings.geometry.chunk_index(
                            entity.location.x,
                            entity.location.y,
                        );
                        if chunks != 1 || !self.map.chunk_holding(serial).contains(&expected) {
                            violations.push(InvariantViolation::ChunkMembership { serial, chunks });
                        }
                    }
                },
                Parent::Void => {}
                Parent::Entity(parent) => match self.entities.get(&parent).map(|p| &p.data) {
                    None => violations.push(InvariantViolation::MissingParent { serial, parent }),
                    Some(EntityData::Container(_, container)) => {
                        if !container.children.contains(&serial) {
                            violations
                                .push(InvariantViolation::NotListedByParent { serial, parent });
                        }
                    }
                    Some(EntityData::Mobile(mobile)) => {
                        if mobile.equipment.layer_of(serial).is_none() {
                            violations
                                .push(InvariantViolation::NotListedByParent { serial, parent });
                        }
                    }
                    Some(EntityData::Item(_)) => {
                        violations.push(InvariantViolation::NotListedByParent { serial, parent })
                    }
                },
            }
            if entity.parent != Parent::World && self.map.contains(serial) {
                violations.push(InvariantViolation::PlacedWhileHeld { serial });
            }

            if self.walks_into_cycle(serial) {
                violations.push(InvariantViolation::Cycle { serial });
            }

            match &entity.data {
                EntityData::Container(_, container) => {
                    let mut weight = 0u32;
                    let mut count = 0u32;
                    let mut seen = HashSet::new();
                    for child in &container.children {
                        match self.entities.get(child) {
                            Some(c) if c.parent == Parent::Entity(serial) && seen.insert(*child) => {
                                weight = weight.saturating_add(c.total_weight());
                                count = count.saturating_add(c.total_items());
                            }
                            _ => violations.push(InvariantViolation::StrayChild {
                                parent: serial,
                                child: *child,
                            }),
                        }
                    }
                    if container.weight != weight {
                        violations.push(InvariantViolation::ContainerWeight {
                            serial,
                            cached: container.weight,
                            actual: weight,
                        });
                    }
                    if container.item_count != count {
                        violations.push(InvariantViolation::ContainerCount {
                            serial,
                            cached: container.item_count,
                            actual: count,
                        });
                    }
                }
                EntityData::Mobile(mobile) => {
                    let mut weight = 0u32;
                    for (layer, child) in mobile.equipment.iter() {
                        match self.entities.get(&child) {
                            Some(c) if c.parent == Parent::Entity(serial) => {
                                if c.wear_layer() != Some(layer) {
                                    violations.push(InvariantViolation::WrongLayer {
                                        mobile: serial,
                                        child,
                                    });
                                }
                                if layer.counts_toward_weight() {
                                    weight = weight.saturating_add(c.total_weight());
                                }
                            }
                            _ => violations.push(InvariantViolation::StrayChild {
                                parent: serial,
                                child,
                            }),
                        }
                    }
                    if mobile.equipment.weight() != weight {
                        violations.push(InvariantViolation::EquipmentWeight {
                            serial,
                            cached: mobile.equipment.weight(),
                            actual: weight,
                        });
                    }
                }
                EntityData::Item(_) => {}
            }
        }

        for placed in self.map.placed_serials() {
            if !self.entities.contains_key(&placed) {
                violations.push(InvariantViolation::PlacedWhileHeld { serial: placed });
            }
        }

        let mut observers: Vec<Serial> = self.visibility.observers().map(|o| o.mobile).collect();
        observers.sort_unstable();
        for mobile in observers {
            let Some(observer) = self.visibility.get(mobile) else {
                continue;
            };
            let expected: HashSet<Serial> = match self.map.location_of(mobile) {
                Some(here) => self
                    .map
                    .query_range(here, observer.radius)
                    .into_iter()
                    .filter(|s| *s != mobile)
                    .collect(),
                None => HashSet::new(),
            };
            if &expected != observer.visible() {
                violations.push(InvariantViolation::StaleVisibility { observer: mobile });
            }
        }

        violations
    }

    fn walks_into_cycle(&self, serial: Serial) -> bool {
        let mut current = serial;
        for _ in 0..=self.entities.len() {
            match self.entities.get(&current).and_then(|e| e.parent.entity()) {
                Some(parent) if parent == serial => return true,
                Some(parent) => current = parent,
                None => return false,
            }
        }
        true
    }
}
