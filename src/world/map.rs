//! Chunked spatial index.
//!
//! The map keeps its own placement table (serial → location) next to the
//! per-chunk membership sets, so range queries never have to reach back into
//! the entity arena.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::entity::Location;
use super::geometry::MapGeometry;
use super::serial::Serial;

/// Immovable decoration baked into a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StaticTile {
    pub x: u16,
    pub y: u16,
    pub z: i8,
    pub graphic: u16,
    pub hue: u16,
}

#[derive(Debug, Clone, Default)]
pub struct Chunk {
    mobiles: HashSet<Serial>,
    items: HashSet<Serial>,
    statics: Vec<StaticTile>,
}

impl Chunk {
    pub fn mobiles(&self) -> &HashSet<Serial> {
        &self.mobiles
    }

    pub fn items(&self) -> &HashSet<Serial> {
        &self.items
    }

    pub fn statics(&self) -> &[StaticTile] {
        &self.statics
    }

    fn members(&self) -> impl Iterator<Item = Serial> + '_ {
        self.mobiles.iter().chain(self.items.iter()).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Placement {
    location: Location,
    mobile: bool,
}

#[derive(Debug, Clone)]
pub struct SpatialMap {
    geometry: MapGeometry,
    chunks: Vec<Chunk>,
    placed: HashMap<Serial, Placement>,
}

impl SpatialMap {
    pub fn new(geometry: MapGeometry) -> Self {
        Self {
            geometry,
            chunks: vec![Chunk::default(); geometry.chunk_count()],
            placed: HashMap::new(),
        }
    }

    pub fn geometry(&self) -> &MapGeometry {
        &self.geometry
    }

    pub fn chunk_at(&self, x: u16, y: u16) -> &Chunk {
        &self.chunks[self.geometry.chunk_index(x, y)]
    }

    pub fn chunks(&self) -> impl Iterator<Item = (usize, &Chunk)> {
        self.chunks.iter().enumerate()
    }

    /// Where `serial` is placed, if it is on the map.
    pub fn location_of(&self, serial: Serial) -> Option<Location> {
        self.placed.get(&serial).map(|p| p.location)
    }

    pub fn contains(&self, serial: Serial) -> bool {
        self.placed.contains_key(&serial)
    }

    pub fn len(&self) -> usize {
        self.placed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.placed.is_empty()
    }

    /// Place `serial`. Returns `false` (and changes nothing) if already placed.
    pub fn insert(&mut self, serial: Serial, mobile: bool, location: Location) -> bool {
        if self.placed.contains_key(&serial) {
            return false;
        }
        let location = self.geometry.bound(location);
        let chunk = &mut self.chunks[self.geometry.chunk_index(location.x, location.y)];
        if mobile {
            chunk.mobiles.insert(serial);
        } else {
            chunk.items.insert(serial);
        }
        self.placed.insert(serial, Placement { location, mobile });
        true
    }

    /// Take `serial` off the map, returning where it was.
    pub fn remove(&mut self, serial: Serial) -> Option<Location> {
        let placement = self.placed.remove(&serial)?;
        let chunk = &mut self.chunks[self
            .geometry
            .chunk_index(placement.location.x, placement.location.y)];
        if placement.mobile {
            chunk.mobiles.remove(&serial);
        } else {
            chunk.items.remove(&serial);
        }
        Some(placement.location)
    }

    /// Move a placed entity. Chunk membership only changes when the chunk does.
    /// Returns the previous location.
    pub fn relocate(&mut self, serial: Serial, to: Location) -> Option<Location> {
        let to = self.geometry.bound(to);
        let placement = self.placed.get_mut(&serial)?;
        let from = placement.location;
        let mobile = placement.mobile;
        placement.location = to;

        let old_chunk = self.geometry.chunk_index(from.x, from.y);
        let new_chunk = self.geometry.chunk_index(to.x, to.y);
        if old_chunk != new_chunk {
            if mobile {
                self.chunks[old_chunk].mobiles.remove(&serial);
                self.chunks[new_chunk].mobiles.insert(serial);
            } else {
                self.chunks[old_chunk].items.remove(&serial);
                self.chunks[new_chunk].items.insert(serial);
            }
        }
        Some(from)
    }

    /// Everything placed within `radius` of `center`.
    pub fn query_range(&self, center: Location, radius: u32) -> Vec<Serial> {
        let mut out = Vec::new();
        for index in self.geometry.chunks_around(center, radius) {
            for serial in self.chunks[index].members() {
                if let Some(placement) = self.placed.get(&serial) {
                    if self.geometry.in_range(center, placement.location, radius) {
                        out.push(serial);
                    }
                }
            }
        }
        out.sort_unstable();
        out
    }

    /// Mobiles placed within `radius` of `center`.
    pub fn mobiles_in_range(&self, center: Location, radius: u32) -> Vec<Serial> {
        let mut out = Vec::new();
        for index in self.geometry.chunks_around(center, radius) {
            for serial in &self.chunks[index].mobiles {
                if let Some(placement) = self.placed.get(serial) {
                    if self.geometry.in_range(center, placement.location, radius) {
                        out.push(*serial);
                    }
                }
            }
        }
        out
    }

    /// Candidates near either of two points, each serial once.
    pub(crate) fn members_near(&self, a: Location, b: Location, radius: u32) -> HashSet<Serial> {
        let mut chunks = self.geometry.chunks_around(a, radius);
        for index in self.geometry.chunks_around(b, radius) {
            if !chunks.contains(&index) {
                chunks.push(index);
            }
        }
        chunks
            .into_iter()
            .flat_map(|index| self.chunks[index].members())
            .collect()
    }

    pub fn add_static(&mut self, tile: StaticTile) {
        let bounded = self.geometry.bound(Location::new(tile.x, tile.y, tile.z));
        let tile = StaticTile {
            x: bounded.x,
            y: bounded.y,
            ..tile
        };
        let index = self.geometry.chunk_index(tile.x, tile.y);
        self.chunks[index].statics.push(tile);
    }

    pub fn statics_at(&self, x: u16, y: u16) -> impl Iterator<Item = &StaticTile> {
        self.chunk_at(x, y)
            .statics
            .iter()
            .filter(move |tile| tile.x == x && tile.y == y)
    }

    /// Every static, in a stable order.
    pub fn statics_sorted(&self) -> Vec<StaticTile> {
        let mut all: Vec<StaticTile> = self
            .chunks
            .iter()
            .flat_map(|chunk| chunk.statics.iter().copied())
            .collect();
        all.sort();
        all
    }

    pub fn static_count(&self) -> usize {
        self.chunks.iter().map(|chunk| chunk.statics.len()).sum()
    }

    /// Highest surface at `(x, y)` not above `z`: statics plus items lying on
    /// the ground there.
    pub fn floor_at(&self, x: u16, y: u16, z: i8) -> Option<i8> {
        let from_statics = self
            .statics_at(x, y)
            .filter(|tile| tile.z <= z)
            .map(|tile| tile.z)
            .max();
        let from_items = self
            .chunk_at(x, y)
            .items
            .iter()
            .filter_map(|serial| self.placed.get(serial))
            .filter(|p| p.location.x == x && p.location.y == y && p.location.z <= z)
            .map(|p| p.location.z)
            .max();
        from_statics.max(from_items)
    }

    /// Chunk index currently holding `serial`, by scanning membership.
    /// Diagnostics only; normal lookups go through the placement table.
    pub(crate) fn chunk_holding(&self, serial: Serial) -> Vec<usize> {
        self.chunks
            .iter()
            .enumerate()
            .filter(|(_, chunk)| chunk.mobiles.contains(&serial) || chunk.items.contains(&serial))
            .map(|(index, _)| index)
            .collect()
    }

    pub(crate) fn placed_serials(&self) -> impl Iterator<Item = Serial> + '_ {
        self.placed.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> SpatialMap {
        SpatialMap::new(MapGeometry::new(96, 64, 64))
    }

    #[test]
    fn insert_places_in_exactly_one_chunk() {
        let mut m = map();
        let s = Serial::new(1);
        assert!(m.insert(s, true, Location::new(9, 17, 0)));
        assert!(!m.insert(s, true, Location::new(9, 17, 0)));
        assert!(m.chunk_at(9, 17).mobiles().contains(&s));
        assert_eq!(m.chunk_holding(s).len(), 1);
    }

    #[test]
    fn relocate_switches_chunk_only_on_boundary() {
        let mut m = map();
        let s = Serial::new(0x4000_0001);
        m.insert(s, false, Location::new(1, 1, 0));
        m.relocate(s, Location::new(2, 2, 0));
        assert!(m.chunk_at(0, 0).items().contains(&s));
        m.relocate(s, Location::new(8, 2, 0));
        assert!(!m.chunk_at(0, 0).items().contains(&s));
        assert!(m.chunk_at(8, 2).items().contains(&s));
        assert_eq!(m.location_of(s), Some(Location::new(8, 2, 0)));
    }

    #[test]
    fn query_range_filters_by_distance() {
        let mut m = map();
        m.insert(Serial::new(1), true, Location::new(10, 10, 0));
        m.insert(Serial::new(2), true, Location::new(14, 10, 0));
        m.insert(Serial::new(3), true, Location::new(15, 10, 0));
        m.insert(Serial::new(4), true, Location::new(70, 10, 0));
        let found = m.query_range(Location::new(10, 10, 0), 4);
        assert_eq!(found, vec![Serial::new(1), Serial::new(2)]);
    }

    #[test]
    fn query_range_sees_across_wrap() {
        let mut m = map();
        m.insert(Serial::new(1), true, Location::new(62, 0, 0));
        let found = m.query_range(Location::new(1, 63, 0), 3);
        assert_eq!(found, vec![Serial::new(1)]);
    }

    #[test]
    fn floor_prefers_highest_surface_below() {
        let mut m = map();
        m.add_static(StaticTile { x: 5, y: 5, z: 0, graphic: 0x3, hue: 0 });
        m.add_static(StaticTile { x: 5, y: 5, z: 20, graphic: 0x4, hue: 0 });
        m.insert(Serial::new(0x4000_0001), false, Location::new(5, 5, 7));
        assert_eq!(m.floor_at(5, 5, 10), Some(7));
        assert_eq!(m.floor_at(5, 5, 25), Some(20));
        assert_eq!(m.floor_at(6, 5, 25), None);
    }
}
