//! Encoding a world into the segmented save format.
//!
//! Output is a pure function of world state: records are sorted by serial,
//! statics and timers by key, and nothing time-dependent is written. Two
//! saves without an intervening mutation are byte-identical.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_32_ISO_HDLC};
use fs2::FileExt;
use log::{debug, info};

use crate::errors::PersistError;
use crate::metrics;
use crate::world::entity::{Entity, EntityData, EntityKind};
use crate::world::serial::{Serial, SerialClass};
use crate::world::World;

use super::codec::Writer;
use super::format::{assemble, SegmentBody, SegmentId, FORMAT_VERSION};
use super::tags::Tag;
use super::SaveReport;

pub(crate) const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Longest reference list a single tag can carry.
const REFS_PER_TAG: usize = u8::MAX as usize;

/// Collects `(tag, payload)` pairs for one record and counts them.
struct TagSink {
    w: Writer,
    count: u16,
}

impl TagSink {
    fn new() -> Self {
        Self {
            w: Writer::new(),
            count: 0,
        }
    }

    fn open(&mut self, tag: Tag) -> &mut Writer {
        self.count += 1;
        self.w.u8(tag.code());
        &mut self.w
    }

    fn flag(&mut self, tag: Tag, set: bool) {
        if set {
            self.open(tag);
        }
    }

    fn refs(&mut self, tag: Tag, serials: &[Serial]) {
        for chunk in serials.chunks(REFS_PER_TAG) {
            let w = self.open(tag);
            w.u8(chunk.len() as u8);
            for serial in chunk {
                w.serial(*serial);
            }
        }
    }
}

fn encode_record(out: &mut Writer, entity: &Entity) {
    out.u8(entity.kind().code());
    out.serial(entity.serial());
    out.cstr(&entity.template);
    out.serial(entity.parent().to_serial());
    out.cstr(&entity.name);
    out.u16(entity.hue);
    out.location(entity.location());

    let mut tags = TagSink::new();
    if entity.direction().code() != 0 {
        tags.open(Tag::Direction).u8(entity.direction().code());
    }
    if entity.weight() != 0 {
        tags.open(Tag::Weight).u16(entity.weight());
    }
    tags.flag(Tag::Hidden, entity.hidden);
    for event in &entity.events {
        tags.open(Tag::Event).cstr(event);
    }
    if entity.flags != 0 {
        tags.open(Tag::Flags).u64(entity.flags);
    }
    match entity.data() {
        EntityData::Item(item) | EntityData::Container(item, _) => {
            if item.amount != 1 {
                tags.open(Tag::Amount).u16(item.amount);
            }
            if let Some(layer) = item.layer {
                tags.open(Tag::Layer).u8(layer.code());
            }
            tags.flag(Tag::Immovable, !item.movable);
            if let Some(footprint) = item.footprint {
                tags.open(Tag::Footprint).bounds(footprint);
            }
        }
        EntityData::Mobile(mobile) => {
            tags.open(Tag::Body).u16(mobile.body);
            if let Some(home) = mobile.home {
                tags.open(Tag::Home).location(home);
            }
            let worn: Vec<Serial> = mobile.equipment().iter().map(|(_, s)| s).collect();
            tags.refs(Tag::Equipment, &worn);
        }
    }
    if let Some(container) = entity.container() {
        if let Some(max) = container.max_weight {
            tags.open(Tag::MaxWeight).u32(max);
        }
        if let Some(max) = container.max_items {
            tags.open(Tag::MaxItems).u16(max);
        }
        tags.refs(Tag::Contents, container.children());
    }

    out.u16(tags.count);
    out.bytes(tags.w.as_slice());
}

fn objects_segment(world: &World, kind: EntityKind) -> SegmentBody {
    let mut entities: Vec<&Entity> = world.entities().filter(|e| e.kind() == kind).collect();
    entities.sort_by_key(|e| e.serial());
    let mut w = Writer::new();
    for entity in &entities {
        encode_record(&mut w, entity);
    }
    SegmentBody {
        id: SegmentId::for_kind(kind),
        records: entities.len() as u32,
        bytes: w.into_vec(),
    }
}

fn map_segment(world: &World) -> SegmentBody {
    let statics = world.map().statics_sorted();
    let mut w = Writer::new();
    for tile in &statics {
        w.u16(tile.x);
        w.u16(tile.y);
        w.i8(tile.z);
        w.u16(tile.graphic);
        w.u16(tile.hue);
    }
    SegmentBody {
        id: SegmentId::Map,
        records: statics.len() as u32,
        bytes: w.into_vec(),
    }
}

fn timers_segment(world: &World) -> SegmentBody {
    let pending = world.timers().pending();
    let mut w = Writer::new();
    for timer in &pending {
        w.u64(timer.id.0);
        w.u64(timer.trigger);
        w.cstr(&timer.event);
        w.serial(timer.receiver);
        w.serial(timer.source);
    }
    SegmentBody {
        id: SegmentId::Timers,
        records: pending.len() as u32,
        bytes: w.into_vec(),
    }
}

fn accounts_segment(world: &World) -> Result<SegmentBody, PersistError> {
    Ok(SegmentBody {
        id: SegmentId::Accounts,
        records: world.accounts().len() as u32,
        bytes: world.accounts().encode()?,
    })
}

fn meta_segment(world: &World, objects: &[SegmentBody]) -> SegmentBody {
    let mut w = Writer::new();
    w.u16(FORMAT_VERSION);
    w.u64(world.timers().now());
    w.u64(world.timers().next_id());
    w.u32(world.serials().cursor(SerialClass::Mobile));
    w.u32(world.serials().cursor(SerialClass::Item));
    w.u8(objects.len() as u8);
    for body in objects {
        w.u8(body.id.code());
        w.u32(CRC32.checksum(&body.bytes));
    }
    SegmentBody {
        id: SegmentId::WorldMeta,
        records: 1,
        bytes: w.into_vec(),
    }
}

/// Encoded save, ready to write.
pub struct Encoded {
    pub bytes: Vec<u8>,
    pub report: SaveReport,
}

/// Serialize the whole world.
pub fn encode(world: &World) -> Result<Encoded, PersistError> {
    let objects: Vec<SegmentBody> = [EntityKind::Item, EntityKind::Container, EntityKind::Mobile]
        .into_iter()
        .map(|kind| objects_segment(world, kind))
        .collect();
    let meta = meta_segment(world, &objects);

    let mut segments = vec![
        meta,
        accounts_segment(world)?,
        map_segment(world),
        timers_segment(world),
    ];
    segments.extend(objects);

    let (bytes, headers) = assemble(&segments);
    let report = SaveReport {
        path: None,
        bytes: bytes.len() as u64,
        entities: world.len(),
        statics: world.map().static_count(),
        timers: world.timers().len(),
        accounts: world.accounts().len(),
        segments: headers,
    };
    Ok(Encoded { bytes, report })
}

/// Encode `world` and write it atomically to `path`.
pub fn save(world: &World, path: &Path) -> Result<SaveReport, PersistError> {
    let Encoded { bytes, mut report } = encode(world)?;
    write_atomic(path, &bytes)?;
    report.path = Some(path.to_path_buf());
    metrics::save_completed();
    info!(
        "saved {} entities to {} ({} bytes)",
        report.entities,
        path.display(),
        report.bytes
    );
    Ok(report)
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

/// Replace `path` with `content` via a temp file and rename, holding an
/// exclusive lock on a sidecar `.lock` file for the duration.
pub fn write_atomic(path: &Path, content: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;

    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(lock_path(path))?;
    lock_file.lock_exclusive()?;

    let base = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("world.sav");
    let mut counter = 0u32;
    let tmp_path = loop {
        let candidate = dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), counter));
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(mut tmp) => {
                tmp.write_all(content)?;
                tmp.flush()?;
                tmp.sync_all()?;
                break candidate;
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                counter = counter.saturating_add(1);
            }
            Err(e) => return Err(e),
        }
    };

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }
    if let Ok(dir_file) = File::open(&dir) {
        let _ = dir_file.sync_all();
    }
    debug!("wrote {} bytes to {}", content.len(), path.display());
    drop(lock_file);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::WorldSettings;

    #[test]
    fn long_reference_lists_split_across_tags() {
        let serials: Vec<Serial> = (0..600).map(|i| Serial::new(0x4000_0000 + i)).collect();
        let mut sink = TagSink::new();
        sink.refs(Tag::Contents, &serials);
        assert_eq!(sink.count, 3);
        // three headers of tag + count, then 600 serials
        assert_eq!(sink.w.len(), 3 * 2 + 600 * 4);
    }

    #[test]
    fn empty_world_encodes_every_segment() {
        let world = World::new(WorldSettings::default());
        let encoded = encode(&world).expect("encode");
        let ids: Vec<u8> = encoded.report.segments.iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![0x04, 0x01, 0x02, 0x03, 0x11, 0x12, 0x13]);
    }

    #[test]
    fn write_atomic_replaces_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("world.sav");
        write_atomic(&path, b"first").expect("write");
        write_atomic(&path, b"second").expect("write");
        assert_eq!(fs::read(&path).expect("read"), b"second");
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .expect("dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
