//! Test utilities & fixtures shared by the integration tests.
#![allow(dead_code)]

use std::path::{Path, PathBuf};

use shardcore::world::entity::{Entity, Location, Parent};
use shardcore::world::geometry::MapGeometry;
use shardcore::world::serial::Serial;
use shardcore::world::{World, WorldSettings};

/// A small map (two regions, 256×128) so random walks actually meet.
pub fn small_settings() -> WorldSettings {
    WorldSettings {
        geometry: MapGeometry::new(256, 128, 192),
        view_radius_min: 2,
        view_radius_max: 12,
        view_radius_default: 6,
        tick_ms: 100,
    }
}

pub fn small_world() -> World {
    World::new(small_settings())
}

pub fn save_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("world.sav")
}

pub fn save_and_reload(world: &World, path: &Path) -> World {
    world.save(path).expect("save");
    let (loaded, report) = World::load(path, *world.settings()).expect("load");
    assert!(report.is_clean(), "unexpected load issues: {:?}", report.issues);
    loaded
}

/// Everything persisted about one entity, in a comparable form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityShape {
    pub serial: Serial,
    pub template: String,
    pub name: String,
    pub hue: u16,
    pub location: Location,
    pub direction: u8,
    pub parent: Parent,
    pub weight: u16,
    pub events: Vec<String>,
    pub hidden: bool,
    pub flags: u64,
    pub children: Vec<Serial>,
    pub container_totals: Option<(u32, u32)>,
    pub equipment: Vec<(u8, Serial)>,
    pub equipment_weight: Option<u32>,
    pub on_map: bool,
}

pub fn shape(world: &World, entity: &Entity) -> EntityShape {
    EntityShape {
        serial: entity.serial(),
        template: entity.template.clone(),
        name: entity.name.clone(),
        hue: entity.hue,
        location: entity.location(),
        direction: entity.direction().code(),
        parent: entity.parent(),
        weight: entity.weight(),
        events: entity.events.clone(),
        hidden: entity.hidden,
        flags: entity.flags,
        children: entity
            .container()
            .map(|c| c.children().to_vec())
            .unwrap_or_default(),
        container_totals: entity.container().map(|c| (c.weight(), c.item_count())),
        equipment: entity
            .mobile()
            .map(|m| m.equipment().iter().map(|(l, s)| (l.code(), s)).collect())
            .unwrap_or_default(),
        equipment_weight: entity.mobile().map(|m| m.equipment().weight()),
        on_map: world.map().contains(entity.serial()),
    }
}

/// Shapes of every entity, sorted by serial.
pub fn world_shape(world: &World) -> Vec<EntityShape> {
    let mut shapes: Vec<EntityShape> = world.entities().map(|e| shape(world, e)).collect();
    shapes.sort_by_key(|s| s.serial);
    shapes
}

pub fn assert_consistent(world: &World) {
    let violations = world.check_invariants();
    assert!(violations.is_empty(), "invariant violations: {:#?}", violations);
}
