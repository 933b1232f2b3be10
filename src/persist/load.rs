//! Three-phase decoding of a save file.
//!
//! 1. Allocate a blank entity per record and reserve its serial, so every
//!    serial in the file resolves before any field is read.
//! 2. Unmarshal fields. References are checked against the table built in
//!    phase one; dangling ones are reported and dropped.
//! 3. Link containers and equipment, recompute cached totals, place
//!    world-parented entities on the map and resolve account characters.
//!
//! Corruption below the file header never aborts the load. Each problem is
//! logged, recorded as a [`LoadIssue`] and the affected object or reference
//! is skipped.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use log::{debug, error, info, warn};

use crate::errors::{LoadIssue, PersistError};
use crate::metrics;
use crate::world::entity::{Bounds, Direction, Entity, EntityKind, Location, Parent};
use crate::world::equipment::Layer;
use crate::world::map::StaticTile;
use crate::world::serial::{Serial, SerialClass};
use crate::world::timers::{Timer, TimerId};
use crate::world::{World, WorldSettings};

use super::accounts::AccountBook;
use super::codec::{DecodeResult, Reader, Truncated};
use super::format::{parse_header, SegmentHeader, SegmentId, FORMAT_VERSION};
use super::save::CRC32;
use super::tags::{Tag, TagType};
use super::LoadReport;

#[derive(Debug, Clone, PartialEq)]
enum TagValue {
    Flag,
    Byte(u8),
    Short(u16),
    Int(u32),
    Long(u64),
    Str(String),
    Location(Location),
    Bounds(Bounds),
    Refs(Vec<Serial>),
}

#[derive(Debug, Clone)]
struct RawRecord {
    kind_code: u8,
    serial: Serial,
    template: String,
    parent: Serial,
    name: String,
    hue: u16,
    location: Location,
    tags: Vec<(Tag, TagValue)>,
}

enum RecordError {
    Truncated(usize),
    UnknownTag(u8),
}

impl From<Truncated> for RecordError {
    fn from(t: Truncated) -> Self {
        RecordError::Truncated(t.0)
    }
}

fn read_value(r: &mut Reader<'_>, ty: TagType) -> DecodeResult<TagValue> {
    Ok(match ty {
        TagType::Bool => TagValue::Flag,
        TagType::Byte => TagValue::Byte(r.u8()?),
        TagType::Short => TagValue::Short(r.u16()?),
        TagType::Int => TagValue::Int(r.u32()?),
        TagType::Long => TagValue::Long(r.u64()?),
        TagType::Str => TagValue::Str(r.cstr()?),
        TagType::Location => TagValue::Location(r.location()?),
        TagType::Bounds => TagValue::Bounds(r.bounds()?),
        TagType::RefList => {
            let count = r.u8()?;
            let mut refs = Vec::with_capacity(count as usize);
            for _ in 0..count {
                refs.push(r.serial()?);
            }
            TagValue::Refs(refs)
        }
    })
}

fn read_record(r: &mut Reader<'_>) -> Result<RawRecord, RecordError> {
    let kind_code = r.u8()?;
    let serial = r.serial()?;
    let template = r.cstr()?;
    let parent = r.serial()?;
    let name = r.cstr()?;
    let hue = r.u16()?;
    let location = r.location()?;
    let count = r.u16()?;
    let mut tags = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let code = r.u8()?;
        let tag = Tag::from_code(code).ok_or(RecordError::UnknownTag(code))?;
        tags.push((tag, read_value(r, tag.payload())?));
    }
    Ok(RawRecord {
        kind_code,
        serial,
        template,
        parent,
        name,
        hue,
        location,
        tags,
    })
}

struct Meta {
    now: u64,
    next_timer: u64,
    cursors: [u32; 2],
    checksums: HashMap<u8, u32>,
}

fn read_meta_body(r: &mut Reader<'_>) -> DecodeResult<Meta> {
    let now = r.u64()?;
    let next_timer = r.u64()?;
    let cursors = [r.u32()?, r.u32()?];
    let count = r.u8()?;
    let mut checksums = HashMap::new();
    for _ in 0..count {
        let id = r.u8()?;
        checksums.insert(id, r.u32()?);
    }
    Ok(Meta {
        now,
        next_timer,
        cursors,
        checksums,
    })
}

/// Version mismatches are fatal; truncation is reported to the caller.
fn read_meta(bytes: &[u8]) -> Result<DecodeResult<Meta>, PersistError> {
    let mut r = Reader::new(bytes);
    let version = match r.u16() {
        Ok(v) => v,
        Err(t) => return Ok(Err(t)),
    };
    if version > FORMAT_VERSION {
        return Err(PersistError::UnsupportedVersion {
            found: version,
            known: FORMAT_VERSION,
        });
    }
    Ok(read_meta_body(&mut r))
}

fn read_static(r: &mut Reader<'_>) -> DecodeResult<StaticTile> {
    Ok(StaticTile {
        x: r.u16()?,
        y: r.u16()?,
        z: r.i8()?,
        graphic: r.u16()?,
        hue: r.u16()?,
    })
}

fn read_timer(r: &mut Reader<'_>) -> DecodeResult<Timer> {
    Ok(Timer {
        id: TimerId(r.u64()?),
        trigger: r.u64()?,
        event: r.cstr()?,
        receiver: r.serial()?,
        source: r.serial()?,
    })
}

/// Everything phase two learns about one entity's links.
#[derive(Debug, Default)]
struct Pending {
    parent: Option<Parent>,
    contents: Vec<Serial>,
    worn: Vec<Serial>,
}

struct Loader {
    world: World,
    issues: Vec<LoadIssue>,
}

impl Loader {
    fn issue(&mut self, issue: LoadIssue) {
        error!("load: {}", issue);
        self.issues.push(issue);
    }

    fn read_objects(&mut self, header: &SegmentHeader, bytes: &[u8]) -> Vec<RawRecord> {
        let mut r = Reader::new(bytes);
        let mut out = Vec::new();
        for _ in 0..header.records {
            match read_record(&mut r) {
                Ok(record) => out.push(record),
                Err(RecordError::UnknownTag(tag)) => {
                    let abandoned = header.records - out.len() as u32;
                    self.issue(LoadIssue::UnknownTag {
                        segment: header.id,
                        tag,
                        abandoned,
                    });
                    return out;
                }
                Err(RecordError::Truncated(at)) => {
                    self.issue(LoadIssue::Truncated {
                        segment: header.id,
                        at,
                    });
                    return out;
                }
            }
        }
        if !r.is_empty() {
            warn!(
                "segment {:#04x} has {} trailing bytes",
                header.id,
                r.remaining()
            );
        }
        out
    }

    fn read_statics(&mut self, header: &SegmentHeader, bytes: &[u8]) {
        let mut r = Reader::new(bytes);
        for _ in 0..header.records {
            let tile = read_static(&mut r);
            match tile {
                Ok(tile) => self.world.map.add_static(tile),
                Err(Truncated(at)) => {
                    self.issue(LoadIssue::Truncated {
                        segment: header.id,
                        at,
                    });
                    return;
                }
            }
        }
    }

    fn read_timers(&mut self, header: &SegmentHeader, bytes: &[u8]) -> Vec<Timer> {
        let mut r = Reader::new(bytes);
        let mut out = Vec::new();
        for _ in 0..header.records {
            let timer = read_timer(&mut r);
            match timer {
                Ok(timer) => out.push(timer),
                Err(Truncated(at)) => {
                    self.issue(LoadIssue::Truncated {
                        segment: header.id,
                        at,
                    });
                    break;
                }
            }
        }
        out
    }

    /// Phase one: blank entities and reserved serials.
    fn allocate(&mut self, segments: Vec<(SegmentId, Vec<RawRecord>)>) -> Vec<RawRecord> {
        let mut accepted = Vec::new();
        for (segment, records) in segments {
            for record in records {
                let serial = record.serial;
                let Some(kind) = EntityKind::from_code(record.kind_code) else {
                    self.issue(LoadIssue::UnknownTypeCode {
                        serial,
                        code: record.kind_code,
                    });
                    continue;
                };
                let expected = SegmentId::for_kind(kind);
                if expected != segment {
                    let filed_as = match segment {
                        SegmentId::Containers => EntityKind::Container,
                        SegmentId::Mobiles => EntityKind::Mobile,
                        _ => EntityKind::Item,
                    };
                    self.issue(LoadIssue::MisfiledRecord {
                        serial,
                        expected: filed_as,
                        found: kind,
                    });
                }
                if serial.class() != Some(kind.serial_class()) {
                    self.issue(LoadIssue::SerialOutOfRange { serial });
                    continue;
                }
                if !self.world.serials.reserve(serial) {
                    self.issue(LoadIssue::DuplicateSerial { serial });
                    continue;
                }
                let mut entity = Entity::blank(kind, serial);
                entity.parent = Parent::Void;
                self.world.entities.insert(serial, entity);
                accepted.push(record);
            }
        }
        accepted
    }

    /// Phase two: fields and reference checks.
    fn unmarshal(&mut self, records: Vec<RawRecord>) -> BTreeMap<Serial, Pending> {
        let mut pending = BTreeMap::new();
        for record in records {
            let serial = record.serial;
            let parent = if record.parent == Serial::WORLD {
                Parent::World
            } else if record.parent == Serial::VOID {
                Parent::Void
            } else if self.world.entities.contains_key(&record.parent) {
                Parent::Entity(record.parent)
            } else {
                self.issue(LoadIssue::MissingParent {
                    serial,
                    parent: record.parent,
                });
                Parent::Void
            };

            let location = self.world.settings.geometry.bound(record.location);
            let mut listed_contents = Vec::new();
            let mut listed_worn = Vec::new();
            if let Some(entity) = self.world.entities.get_mut(&serial) {
                entity.template = record.template;
                entity.name = record.name;
                entity.hue = record.hue;
                entity.location = location;
                for (tag, value) in record.tags {
                    match apply_tag(entity, tag, value) {
                        Applied::Contents(refs) => listed_contents.extend(refs),
                        Applied::Equipment(refs) => listed_worn.extend(refs),
                        Applied::Done => {}
                        Applied::Skipped => {
                            debug!("{} skips tag {:?} it does not use", serial, tag)
                        }
                    }
                }
            }

            let contents = self.resolve_refs(serial, listed_contents, "contents");
            let worn = self.resolve_refs(serial, listed_worn, "equipment");
            pending.insert(
                serial,
                Pending {
                    parent: Some(parent),
                    contents,
                    worn,
                },
            );
        }
        pending
    }

    fn resolve_refs(&mut self, serial: Serial, refs: Vec<Serial>, field: &'static str) -> Vec<Serial> {
        let mut out = Vec::with_capacity(refs.len());
        for reference in refs {
            if self.world.entities.contains_key(&reference) {
                out.push(reference);
            } else {
                self.issue(LoadIssue::MissingReference {
                    serial,
                    missing: reference,
                    field,
                });
            }
        }
        out
    }

    /// Phase three: links, totals, placement.
    fn link(&mut self, mut pending: BTreeMap<Serial, Pending>) {
        self.break_cycles(&mut pending);

        let mut children_of: BTreeMap<Serial, Vec<Serial>> = BTreeMap::new();
        let mut top_level = Vec::new();
        for (serial, p) in &pending {
            match p.parent {
                Some(Parent::Entity(parent)) => children_of.entry(parent).or_default().push(*serial),
                Some(Parent::World) => top_level.push(*serial),
                _ => {}
            }
        }

        let mut linked: HashSet<Serial> = HashSet::new();
        for (holder, wanting) in &children_of {
            let holder_is_mobile = self
                .world
                .entities
                .get(holder)
                .is_some_and(|e| e.is_mobile());
            let listed: Vec<Serial> = pending
                .get(holder)
                .map(|p| {
                    if holder_is_mobile {
                        p.worn.clone()
                    } else {
                        p.contents.clone()
                    }
                })
                .unwrap_or_default();
            let wanting_set: HashSet<Serial> = wanting.iter().copied().collect();
            let mut order = Vec::with_capacity(wanting.len());
            for child in listed {
                if wanting_set.contains(&child) && !order.contains(&child) {
                    order.push(child);
                } else {
                    warn!("{} lists {} whose parent field points elsewhere", holder, child);
                }
            }
            for child in wanting {
                if !order.contains(child) {
                    warn!("{} claims parent {} but is not listed there; appending", child, holder);
                    order.push(*child);
                }
            }
            for child in order {
                match self.link_child(*holder, child) {
                    Ok(()) => {
                        linked.insert(child);
                    }
                    Err(reason) => self.issue(LoadIssue::LinkFailed {
                        serial: child,
                        parent: *holder,
                        reason,
                    }),
                }
            }
        }

        self.world.recompute_totals();

        for serial in top_level {
            let Some(entity) = self.world.entities.get_mut(&serial) else {
                continue;
            };
            entity.parent = Parent::World;
            let mobile = entity.is_mobile();
            let location = entity.location;
            self.world.map.insert(serial, mobile, location);
        }
        let placed_mobiles: Vec<Serial> = self
            .world
            .entities
            .values()
            .filter(|e| e.is_mobile() && e.parent == Parent::World)
            .map(|e| e.serial())
            .collect();
        for serial in placed_mobiles {
            self.world.derive_floor(serial);
        }
    }

    /// Parent chains that loop back on themselves are cut at their lowest serial.
    fn break_cycles(&mut self, pending: &mut BTreeMap<Serial, Pending>) {
        let serials: Vec<Serial> = pending.keys().copied().collect();
        let limit = serials.len();
        for serial in serials {
            let mut current = serial;
            let mut steps = 0;
            let looped = loop {
                match pending.get(&current).and_then(|p| p.parent).and_then(Parent::entity) {
                    Some(parent) if parent == serial => break true,
                    Some(parent) if steps < limit => {
                        current = parent;
                        steps += 1;
                    }
                    _ => break false,
                }
            };
            if looped {
                let parent = pending
                    .get(&serial)
                    .and_then(|p| p.parent)
                    .map(Parent::to_serial)
                    .unwrap_or(Serial::VOID);
                self.issue(LoadIssue::LinkFailed {
                    serial,
                    parent,
                    reason: "parent cycle".to_string(),
                });
                if let Some(p) = pending.get_mut(&serial) {
                    p.parent = Some(Parent::Void);
                }
            }
        }
    }

    /// Structural link of one child; totals are rebuilt afterwards.
    fn link_child(&mut self, holder: Serial, child: Serial) -> Result<(), String> {
        let (layer, mobile_child) = match self.world.entities.get(&child) {
            Some(entity) => (entity.wear_layer(), entity.is_mobile()),
            None => return Err("child vanished".to_string()),
        };
        let Some(parent) = self.world.entities.get_mut(&holder) else {
            return Err("holder vanished".to_string());
        };
        if let Some(container) = parent.container_mut() {
            if mobile_child {
                return Err("a mobile cannot be contained".to_string());
            }
            container.children.push(child);
        } else if let Some(mobile) = parent.mobile_mut() {
            let Some(layer) = layer else {
                return Err("not wearable".to_string());
            };
            if !mobile.equipment.put(layer, child, 0) {
                return Err(format!("layer {:?} already occupied", layer));
            }
        } else {
            return Err("plain items hold nothing".to_string());
        }
        if let Some(entity) = self.world.entities.get_mut(&child) {
            entity.parent = Parent::Entity(holder);
        }
        Ok(())
    }

    fn resolve_accounts(&mut self) {
        let mut missing = Vec::new();
        for account in self.world.accounts.iter() {
            for serial in &account.characters {
                let ok = self
                    .world
                    .entities
                    .get(serial)
                    .is_some_and(|e| e.is_mobile());
                if !ok {
                    missing.push((account.name.clone(), *serial));
                }
            }
        }
        for (account, serial) in missing {
            if let Some(entry) = self.world.accounts.get_mut(&account) {
                entry.characters.retain(|c| *c != serial);
            }
            self.issue(LoadIssue::MissingCharacter { account, serial });
        }
    }
}

enum Applied {
    Done,
    Skipped,
    Contents(Vec<Serial>),
    Equipment(Vec<Serial>),
}

fn apply_tag(entity: &mut Entity, tag: Tag, value: TagValue) -> Applied {
    match (tag, value) {
        (Tag::Direction, TagValue::Byte(code)) => entity.direction = Direction::from_code(code),
        (Tag::Weight, TagValue::Short(weight)) => entity.weight = weight,
        (Tag::Hidden, TagValue::Flag) => entity.hidden = true,
        (Tag::Event, TagValue::Str(name)) => entity.events.push(name),
        (Tag::Flags, TagValue::Long(flags)) => entity.flags = flags,
        (Tag::Amount, TagValue::Short(amount)) => match entity.item_mut() {
            Some(item) => item.amount = amount.max(1),
            None => return Applied::Skipped,
        },
        (Tag::Layer, TagValue::Byte(code)) => match entity.item_mut() {
            Some(item) => {
                item.layer = Layer::from_code(code);
                if item.layer.is_none() {
                    warn!("{} has unknown layer {}; not wearable", entity.serial(), code);
                }
            }
            None => return Applied::Skipped,
        },
        (Tag::Immovable, TagValue::Flag) => match entity.item_mut() {
            Some(item) => item.movable = false,
            None => return Applied::Skipped,
        },
        (Tag::Footprint, TagValue::Bounds(bounds)) => match entity.item_mut() {
            Some(item) => item.footprint = Some(bounds),
            None => return Applied::Skipped,
        },
        (Tag::MaxWeight, TagValue::Int(max)) => match entity.container_mut() {
            Some(container) => container.max_weight = Some(max),
            None => return Applied::Skipped,
        },
        (Tag::MaxItems, TagValue::Short(max)) => match entity.container_mut() {
            Some(container) => container.max_items = Some(max),
            None => return Applied::Skipped,
        },
        (Tag::Contents, TagValue::Refs(refs)) => {
            if entity.container().is_none() {
                return Applied::Skipped;
            }
            return Applied::Contents(refs);
        }
        (Tag::Body, TagValue::Short(body)) => match entity.mobile_mut() {
            Some(mobile) => mobile.body = body,
            None => return Applied::Skipped,
        },
        (Tag::Home, TagValue::Location(home)) => match entity.mobile_mut() {
            Some(mobile) => mobile.home = Some(home),
            None => return Applied::Skipped,
        },
        (Tag::Equipment, TagValue::Refs(refs)) => {
            if !entity.is_mobile() {
                return Applied::Skipped;
            }
            return Applied::Equipment(refs);
        }
        _ => return Applied::Skipped,
    }
    Applied::Done
}

/// Read and rebuild a world from `path`.
pub fn load(path: &Path, settings: WorldSettings) -> Result<(World, LoadReport), PersistError> {
    let bytes = std::fs::read(path)?;
    let (world, report) = decode(&bytes, settings)?;
    info!(
        "loaded {} entities from {} ({} issues)",
        report.entities,
        path.display(),
        report.issues.len()
    );
    Ok((world, report))
}

/// Rebuild a world from the bytes of a save file.
pub fn decode(file: &[u8], settings: WorldSettings) -> Result<(World, LoadReport), PersistError> {
    let (headers, outside): (Vec<SegmentHeader>, Vec<SegmentHeader>) = parse_header(file)?
        .into_iter()
        .partition(|header| header.within(file.len()));
    let mut loader = Loader {
        world: World::new(settings),
        issues: Vec::new(),
    };
    for header in outside {
        loader.issue(LoadIssue::SegmentOutOfBounds {
            segment: header.id,
            offset: header.offset,
            length: header.length,
            file_len: file.len() as u64,
        });
    }

    let meta = match headers.iter().find(|h| h.id == SegmentId::WorldMeta.code()) {
        Some(header) => match read_meta(&file[header.range()])? {
            Ok(meta) => Some(meta),
            Err(Truncated(at)) => {
                loader.issue(LoadIssue::Truncated {
                    segment: header.id,
                    at,
                });
                None
            }
        },
        None => {
            loader.issue(LoadIssue::Truncated {
                segment: SegmentId::WorldMeta.code(),
                at: 0,
            });
            None
        }
    };

    let mut objects = Vec::new();
    let mut timers = Vec::new();
    for header in &headers {
        let bytes = &file[header.range()];
        match header.segment() {
            Some(SegmentId::WorldMeta) => {}
            Some(SegmentId::Accounts) => match AccountBook::decode(bytes) {
                Ok(book) => loader.world.accounts = book,
                Err(e) => loader.issue(LoadIssue::BadAccounts {
                    reason: e.to_string(),
                }),
            },
            Some(SegmentId::Map) => loader.read_statics(header, bytes),
            Some(SegmentId::Timers) => timers = loader.read_timers(header, bytes),
            Some(segment) => {
                if let Some(expected) = meta.as_ref().and_then(|m| m.checksums.get(&header.id)) {
                    if CRC32.checksum(bytes) != *expected {
                        loader.issue(LoadIssue::ChecksumMismatch { segment: header.id });
                    }
                }
                let records = loader.read_objects(header, bytes);
                objects.push((segment, records));
            }
            None => loader.issue(LoadIssue::UnknownSegment { id: header.id }),
        }
    }

    let accepted = loader.allocate(objects);
    let pending = loader.unmarshal(accepted);
    loader.link(pending);
    loader.resolve_accounts();

    if let Some(meta) = &meta {
        loader.world.timers.restore_clock(meta.now, meta.next_timer);
        loader
            .world
            .serials
            .restore_cursor(SerialClass::Mobile, meta.cursors[0]);
        loader
            .world
            .serials
            .restore_cursor(SerialClass::Item, meta.cursors[1]);
    }
    for timer in timers {
        loader.world.timers.restore(timer);
    }

    let Loader { world, issues } = loader;
    metrics::load_issues(issues.len() as u64);
    let report = LoadReport {
        entities: world.len(),
        statics: world.map().static_count(),
        timers: world.timers().len(),
        accounts: world.accounts().len(),
        issues,
    };
    Ok((world, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::save::encode;
    use crate::world::geometry::MapGeometry;

    fn settings() -> WorldSettings {
        WorldSettings {
            geometry: MapGeometry::new(96, 64, 64),
            ..Default::default()
        }
    }

    #[test]
    fn empty_world_round_trips_cleanly() {
        let world = World::new(settings());
        let bytes = encode(&world).expect("encode").bytes;
        let (loaded, report) = decode(&bytes, settings()).expect("decode");
        assert!(report.is_clean(), "{:?}", report.issues);
        assert!(loaded.is_empty());
    }

    #[test]
    fn tag_unused_by_the_kind_is_skipped() {
        let mut item = Entity::blank(EntityKind::Item, Serial::new(0x4000_0001));
        assert!(matches!(
            apply_tag(&mut item, Tag::Body, TagValue::Short(7)),
            Applied::Skipped
        ));
        assert!(matches!(
            apply_tag(&mut item, Tag::Amount, TagValue::Short(7)),
            Applied::Done
        ));
        assert_eq!(item.item().map(|i| i.amount), Some(7));
    }

    #[test]
    fn newer_format_version_is_refused() {
        let mut meta = Vec::new();
        meta.extend_from_slice(&(FORMAT_VERSION + 1).to_le_bytes());
        assert!(matches!(
            read_meta(&meta),
            Err(PersistError::UnsupportedVersion { .. })
        ));
    }
}
