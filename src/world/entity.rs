//! The entity supertype and its item, container and mobile payloads.

use serde::{Deserialize, Serialize};

use super::equipment::{EquipmentSet, Layer};
use super::serial::{Serial, SerialClass};

/// Tile coordinates plus altitude.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Location {
    pub x: u16,
    pub y: u16,
    pub z: i8,
}

impl Location {
    pub const fn new(x: u16, y: u16, z: i8) -> Self {
        Self { x, y, z }
    }
}

/// Axis-aligned box anchored at a location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Bounds {
    pub x: u16,
    pub y: u16,
    pub z: i8,
    pub width: u16,
    pub height: u16,
    pub depth: u16,
}

/// Facing, in the clockwise order the client uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Direction {
    #[default]
    North = 0,
    NorthEast = 1,
    East = 2,
    SouthEast = 3,
    South = 4,
    SouthWest = 5,
    West = 6,
    NorthWest = 7,
}

impl Direction {
    pub const ALL: [Direction; 8] = [
        Direction::North,
        Direction::NorthEast,
        Direction::East,
        Direction::SouthEast,
        Direction::South,
        Direction::SouthWest,
        Direction::West,
        Direction::NorthWest,
    ];

    /// Decode the low three bits; the running flag (0x80) is ignored.
    pub fn from_code(code: u8) -> Direction {
        Direction::ALL[(code & 0x07) as usize]
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Tile step for one move in this direction (y grows southward).
    pub fn delta(self) -> (i32, i32) {
        match self {
            Direction::North => (0, -1),
            Direction::NorthEast => (1, -1),
            Direction::East => (1, 0),
            Direction::SouthEast => (1, 1),
            Direction::South => (0, 1),
            Direction::SouthWest => (-1, 1),
            Direction::West => (-1, 0),
            Direction::NorthWest => (-1, -1),
        }
    }
}

/// Concrete entity type. The discriminant is the on-disk type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum EntityKind {
    Item = 1,
    Container = 2,
    Mobile = 3,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Item, EntityKind::Container, EntityKind::Mobile];

    pub fn from_code(code: u8) -> Option<EntityKind> {
        EntityKind::ALL.into_iter().find(|kind| *kind as u8 == code)
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn serial_class(self) -> SerialClass {
        match self {
            EntityKind::Mobile => SerialClass::Mobile,
            EntityKind::Item | EntityKind::Container => SerialClass::Item,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EntityKind::Item => "item",
            EntityKind::Container => "container",
            EntityKind::Mobile => "mobile",
        }
    }
}

/// Where an entity hangs in the ownership graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Parent {
    /// Top level, placed on the map.
    #[default]
    World,
    /// Orphaned during error recovery. Always a leak.
    Void,
    /// Inside a container or worn by a mobile.
    Entity(Serial),
}

impl Parent {
    pub fn to_serial(self) -> Serial {
        match self {
            Parent::World => Serial::WORLD,
            Parent::Void => Serial::VOID,
            Parent::Entity(serial) => serial,
        }
    }

    pub fn entity(self) -> Option<Serial> {
        match self {
            Parent::Entity(serial) => Some(serial),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemData {
    /// Layer this item may be worn on, if wearable.
    pub layer: Option<Layer>,
    pub amount: u16,
    pub movable: bool,
    pub footprint: Option<Bounds>,
}

impl Default for ItemData {
    fn default() -> Self {
        Self {
            layer: None,
            amount: 1,
            movable: true,
            footprint: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerData {
    pub(crate) children: Vec<Serial>,
    pub(crate) weight: u32,
    pub(crate) item_count: u32,
    pub max_weight: Option<u32>,
    pub max_items: Option<u16>,
}

impl ContainerData {
    /// Children in insertion order.
    pub fn children(&self) -> &[Serial] {
        &self.children
    }

    /// Cached total weight of everything inside, recursively.
    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Cached count of items inside, recursively.
    pub fn item_count(&self) -> u32 {
        self.item_count
    }

    pub fn contains(&self, serial: Serial) -> bool {
        self.children.contains(&serial)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MobileData {
    pub body: u16,
    /// Where the mobile belongs when it wanders off.
    pub home: Option<Location>,
    pub(crate) equipment: EquipmentSet,
    /// Height of the surface the mobile stands on; derived, never persisted.
    pub(crate) floor_z: Option<i8>,
}

impl MobileData {
    pub fn equipment(&self) -> &EquipmentSet {
        &self.equipment
    }

    pub fn floor_z(&self) -> Option<i8> {
        self.floor_z
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityData {
    Item(ItemData),
    Container(ItemData, ContainerData),
    Mobile(MobileData),
}

/// Anything that occupies the world.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub(crate) serial: Serial,
    pub template: String,
    /// Display name including its article ("a dagger").
    pub name: String,
    pub hue: u16,
    pub(crate) location: Location,
    pub(crate) direction: Direction,
    pub(crate) parent: Parent,
    /// Own weight per unit; containers add their contents on top.
    pub(crate) weight: u16,
    /// Names of event handlers this entity responds to.
    pub events: Vec<String>,
    pub hidden: bool,
    /// Gameplay-owned flag bits, persisted untouched.
    pub flags: u64,
    pub(crate) data: EntityData,
}

impl Entity {
    /// Empty instance of `kind`, as built in the first load phase.
    pub fn blank(kind: EntityKind, serial: Serial) -> Self {
        let data = match kind {
            EntityKind::Item => EntityData::Item(ItemData::default()),
            EntityKind::Container => {
                EntityData::Container(ItemData::default(), ContainerData::default())
            }
            EntityKind::Mobile => EntityData::Mobile(MobileData::default()),
        };
        Self {
            serial,
            template: String::new(),
            name: String::new(),
            hue: 0,
            location: Location::default(),
            direction: Direction::North,
            parent: Parent::World,
            weight: 0,
            events: Vec::new(),
            hidden: false,
            flags: 0,
            data,
        }
    }

    pub fn serial(&self) -> Serial {
        self.serial
    }

    pub fn kind(&self) -> EntityKind {
        match self.data {
            EntityData::Item(_) => EntityKind::Item,
            EntityData::Container(..) => EntityKind::Container,
            EntityData::Mobile(_) => EntityKind::Mobile,
        }
    }

    pub fn weight(&self) -> u16 {
        self.weight
    }

    pub fn location(&self) -> Location {
        self.location
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn parent(&self) -> Parent {
        self.parent
    }

    pub fn data(&self) -> &EntityData {
        &self.data
    }

    pub fn is_mobile(&self) -> bool {
        matches!(self.data, EntityData::Mobile(_))
    }

    pub fn item(&self) -> Option<&ItemData> {
        match &self.data {
            EntityData::Item(item) | EntityData::Container(item, _) => Some(item),
            EntityData::Mobile(_) => None,
        }
    }

    pub(crate) fn item_mut(&mut self) -> Option<&mut ItemData> {
        match &mut self.data {
            EntityData::Item(item) | EntityData::Container(item, _) => Some(item),
            EntityData::Mobile(_) => None,
        }
    }

    pub fn container(&self) -> Option<&ContainerData> {
        match &self.data {
            EntityData::Container(_, container) => Some(container),
            _ => None,
        }
    }

    pub(crate) fn container_mut(&mut self) -> Option<&mut ContainerData> {
        match &mut self.data {
            EntityData::Container(_, container) => Some(container),
            _ => None,
        }
    }

    pub fn mobile(&self) -> Option<&MobileData> {
        match &self.data {
            EntityData::Mobile(mobile) => Some(mobile),
            _ => None,
        }
    }

    pub(crate) fn mobile_mut(&mut self) -> Option<&mut MobileData> {
        match &mut self.data {
            EntityData::Mobile(mobile) => Some(mobile),
            _ => None,
        }
    }

    /// Layer this entity occupies when worn. A mobile can only be "worn" as a mount.
    pub fn wear_layer(&self) -> Option<Layer> {
        match &self.data {
            EntityData::Item(item) | EntityData::Container(item, _) => item.layer,
            EntityData::Mobile(_) => Some(Layer::Mount),
        }
    }

    /// Weight this entity adds to whatever holds it.
    pub fn total_weight(&self) -> u32 {
        match &self.data {
            EntityData::Item(item) => self.weight as u32 * item.amount.max(1) as u32,
            EntityData::Container(item, container) => {
                self.weight as u32 * item.amount.max(1) as u32 + container.weight
            }
            EntityData::Mobile(_) => self.weight as u32,
        }
    }

    /// Item count this entity adds to a container: itself plus its contents.
    pub fn total_items(&self) -> u32 {
        1 + self.container().map(|c| c.item_count).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_codes_round_trip() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(EntityKind::from_code(0), None);
        assert_eq!(EntityKind::from_code(9), None);
    }

    #[test]
    fn direction_ignores_running_flag() {
        assert_eq!(Direction::from_code(0x82), Direction::East);
        assert_eq!(Direction::South.delta(), (0, 1));
    }

    #[test]
    fn container_weight_includes_contents() {
        let mut bag = Entity::blank(EntityKind::Container, Serial::new(0x4000_0001));
        bag.weight = 2;
        bag.container_mut().unwrap().weight = 10;
        bag.container_mut().unwrap().item_count = 3;
        assert_eq!(bag.total_weight(), 12);
        assert_eq!(bag.total_items(), 4);
    }

    #[test]
    fn stacked_items_weigh_per_unit() {
        let mut coins = Entity::blank(EntityKind::Item, Serial::new(0x4000_0002));
        coins.weight = 1;
        coins.item_mut().unwrap().amount = 40;
        assert_eq!(coins.total_weight(), 40);
    }
}
