//! Map dimensions, region-aware coordinate wrapping and distance.
//!
//! The surface is split into an overworld (`x < overworld_width`) and a
//! dungeon strip (`overworld_width <= x < width`). Each wraps onto itself, and
//! the wrap rule is picked from the region of the reference point, so a step
//! off the east edge of the overworld lands on its west edge rather than in
//! the dungeons.

use serde::{Deserialize, Serialize};

use super::entity::Location;

/// Edge length of a chunk, in tiles.
pub const CHUNK_SIZE: u16 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    Overworld,
    Dungeon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapGeometry {
    pub width: u16,
    pub height: u16,
    pub overworld_width: u16,
}

impl Default for MapGeometry {
    fn default() -> Self {
        Self {
            width: 6144,
            height: 4096,
            overworld_width: 5120,
        }
    }
}

impl MapGeometry {
    /// Dimensions are rounded down to whole chunks (at least one chunk each
    /// way) so chunk addressing and wrapping agree.
    pub fn new(width: u16, height: u16, overworld_width: u16) -> Self {
        let whole = |v: u16| v - v % CHUNK_SIZE;
        let width = whole(width).max(CHUNK_SIZE);
        Self {
            width,
            height: whole(height).max(CHUNK_SIZE),
            overworld_width: whole(overworld_width).min(width),
        }
    }

    pub fn chunks_x(&self) -> u16 {
        self.width.div_ceil(CHUNK_SIZE)
    }

    pub fn chunks_y(&self) -> u16 {
        self.height.div_ceil(CHUNK_SIZE)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks_x() as usize * self.chunks_y() as usize
    }

    pub fn region_of(&self, x: u16) -> Region {
        if x < self.overworld_width || self.overworld_width == self.width {
            Region::Overworld
        } else {
            Region::Dungeon
        }
    }

    /// Horizontal span `[start, end)` of a region.
    fn span(&self, region: Region) -> (i32, i32) {
        match region {
            Region::Overworld => (0, self.overworld_width as i32),
            Region::Dungeon => (self.overworld_width as i32, self.width as i32),
        }
    }

    /// Wrap `(x, y)` using the rules of the region `reference` lies in.
    pub fn wrap(&self, reference: Location, x: i32, y: i32) -> (u16, u16) {
        let (start, end) = self.span(self.region_of(reference.x));
        let span = (end - start).max(1);
        let wx = start + (x - start).rem_euclid(span);
        let wy = y.rem_euclid(self.height.max(1) as i32);
        (wx as u16, wy as u16)
    }

    /// Clamp a location into the map without wrapping. Used for positions that
    /// arrive from outside (load, teleport) before any region rule applies.
    pub fn bound(&self, location: Location) -> Location {
        Location {
            x: location.x.min(self.width.saturating_sub(1)),
            y: location.y.min(self.height.saturating_sub(1)),
            z: location.z,
        }
    }

    /// Location one step from `from` in direction `(dx, dy)`, wrapped.
    pub fn step(&self, from: Location, dx: i32, dy: i32) -> Location {
        let (x, y) = self.wrap(from, from.x as i32 + dx, from.y as i32 + dy);
        Location { x, y, z: from.z }
    }

    /// Chebyshev distance over the shorter way around each wrapped axis.
    /// Points in different regions are unreachable (`u32::MAX`).
    pub fn distance(&self, a: Location, b: Location) -> u32 {
        let region = self.region_of(a.x);
        if region != self.region_of(b.x) {
            return u32::MAX;
        }
        let (start, end) = self.span(region);
        let dx = wrapped_delta(a.x as i32, b.x as i32, end - start);
        let dy = wrapped_delta(a.y as i32, b.y as i32, self.height as i32);
        dx.max(dy)
    }

    pub fn in_range(&self, a: Location, b: Location, radius: u32) -> bool {
        self.distance(a, b) <= radius
    }

    /// Flat chunk index for a tile. Callers pass bounded coordinates.
    pub fn chunk_index(&self, x: u16, y: u16) -> usize {
        let cx = (x.min(self.width.saturating_sub(1)) / CHUNK_SIZE) as usize;
        let cy = (y.min(self.height.saturating_sub(1)) / CHUNK_SIZE) as usize;
        cx * self.chunks_y() as usize + cy
    }

    /// Chunk indices covering every tile within `radius` of `center`,
    /// wrapping inside the center's region. Each index appears once.
    pub fn chunks_around(&self, center: Location, radius: u32) -> Vec<usize> {
        let (start, end) = self.span(self.region_of(center.x));
        let region_width = (end - start) as u32;
        let r = radius.min(u16::MAX as u32) as i32;
        let span_x = (2 * r + 1).min(region_width as i32);
        let span_y = (2 * r + 1).min(self.height as i32);
        let first_x = if span_x as u32 >= region_width {
            start
        } else {
            center.x as i32 - r
        };
        let first_y = if span_y >= self.height as i32 {
            0
        } else {
            center.y as i32 - r
        };

        let mut columns: Vec<u16> = Vec::new();
        let mut x = first_x;
        let last_x = first_x + span_x - 1;
        while x <= last_x {
            let (wx, _) = self.wrap(center, x, 0);
            let column = wx / CHUNK_SIZE;
            if !columns.contains(&column) {
                columns.push(column);
            }
            // jump to the start of the next chunk column
            x += (CHUNK_SIZE - wx % CHUNK_SIZE) as i32;
        }
        // the last tile may sit in a column the jumps skipped over
        let (wx_last, _) = self.wrap(center, last_x, 0);
        if !columns.contains(&(wx_last / CHUNK_SIZE)) {
            columns.push(wx_last / CHUNK_SIZE);
        }

        let mut rows: Vec<u16> = Vec::new();
        let mut y = first_y;
        let last_y = first_y + span_y - 1;
        while y <= last_y {
            let (_, wy) = self.wrap(center, center.x as i32, y);
            let row = wy / CHUNK_SIZE;
            if !rows.contains(&row) {
                rows.push(row);
            }
            y += (CHUNK_SIZE - wy % CHUNK_SIZE) as i32;
        }
        let (_, wy_last) = self.wrap(center, center.x as i32, last_y);
        if !rows.contains(&(wy_last / CHUNK_SIZE)) {
            rows.push(wy_last / CHUNK_SIZE);
        }

        let chunks_y = self.chunks_y() as usize;
        let mut out = Vec::with_capacity(columns.len() * rows.len());
        for column in &columns {
            for row in &rows {
                out.push(*column as usize * chunks_y + *row as usize);
            }
        }
        out
    }
}

fn wrapped_delta(a: i32, b: i32, span: i32) -> u32 {
    let d = (a - b).abs();
    if span <= 0 {
        return d as u32;
    }
    d.min(span - d).max(0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> MapGeometry {
        // 64 wide overworld, 32 wide dungeon strip, 64 tall
        MapGeometry::new(96, 64, 64)
    }

    #[test]
    fn dimensions_snap_to_whole_chunks() {
        assert_eq!(MapGeometry::new(100, 70, 67), MapGeometry::new(96, 64, 64));
        let tiny = MapGeometry::new(3, 0, 5);
        assert_eq!((tiny.width, tiny.height, tiny.overworld_width), (8, 8, 0));
        let capped = MapGeometry::new(64, 64, 200);
        assert_eq!(capped.overworld_width, 64);
        assert_eq!(capped.chunks_x(), 8);
    }

    #[test]
    fn overworld_wraps_onto_itself() {
        let g = small();
        let from = Location::new(63, 10, 0);
        assert_eq!(g.step(from, 1, 0), Location::new(0, 10, 0));
        assert_eq!(g.step(Location::new(0, 0, 0), -1, -1), Location::new(63, 63, 0));
    }

    #[test]
    fn dungeon_wraps_within_strip() {
        let g = small();
        assert_eq!(g.step(Location::new(95, 5, 0), 1, 0), Location::new(64, 5, 0));
        assert_eq!(g.step(Location::new(64, 5, 0), -1, 0), Location::new(95, 5, 0));
    }

    #[test]
    fn distance_uses_short_way_around() {
        let g = small();
        assert_eq!(g.distance(Location::new(1, 1, 0), Location::new(62, 1, 0)), 3);
        assert_eq!(g.distance(Location::new(10, 0, 0), Location::new(10, 63, 0)), 1);
        assert_eq!(g.distance(Location::new(5, 5, 0), Location::new(8, 9, 0)), 4);
    }

    #[test]
    fn regions_are_mutually_unreachable() {
        let g = small();
        assert_eq!(
            g.distance(Location::new(63, 5, 0), Location::new(64, 5, 0)),
            u32::MAX
        );
    }

    #[test]
    fn chunk_index_is_integer_division() {
        let g = small();
        assert_eq!(g.chunk_index(0, 0), 0);
        assert_eq!(g.chunk_index(7, 7), 0);
        assert_eq!(g.chunk_index(8, 0), g.chunks_y() as usize);
        assert_eq!(g.chunk_index(0, 8), 1);
    }

    #[test]
    fn chunks_around_wraps_and_dedups() {
        let g = small();
        let chunks = g.chunks_around(Location::new(1, 1, 0), 3);
        // columns 7 and 0, rows 7 and 0
        assert_eq!(chunks.len(), 4);
        assert!(chunks.contains(&g.chunk_index(62, 62)));
        assert!(chunks.contains(&g.chunk_index(4, 4)));

        let all = g.chunks_around(Location::new(70, 30, 0), 500);
        assert_eq!(all.len(), 4 * 8);
    }

    #[test]
    fn chunks_around_covers_every_tile_in_radius() {
        let g = small();
        let center = Location::new(20, 33, 0);
        let chunks = g.chunks_around(center, 9);
        for x in 0..64u16 {
            for y in 0..64u16 {
                let tile = Location::new(x, y, 0);
                if g.in_range(center, tile, 9) {
                    assert!(chunks.contains(&g.chunk_index(x, y)), "{x},{y}");
                }
            }
        }
    }
}
