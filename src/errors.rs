use thiserror::Error;

use crate::world::entity::EntityKind;
use crate::world::serial::Serial;
use crate::world::visibility::ConnectionId;

/// Why an ownership change was refused. Refusals are routine and never logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("{0} does not exist")]
    NotFound(Serial),

    /// The target container (or one of its containers) would exceed its weight cap.
    #[error("too heavy")]
    TooHeavy,

    /// The target container (or one of its containers) would exceed its item cap.
    #[error("too many items")]
    TooManyItems,

    #[error("already contained by that parent")]
    AlreadyContained,

    /// The child cannot live under that kind of parent.
    #[error("incompatible parent")]
    Incompatible,

    #[error("not a child of that parent")]
    NotAChild,

    /// The move would make an entity its own ancestor.
    #[error("would create a containment cycle")]
    Cycle,

    #[error("item is not worn on that layer")]
    WrongLayer,

    #[error("layer already occupied")]
    LayerOccupied,
}

/// Errors surfaced by [`crate::world::World`] entry points.
#[derive(Debug, Error)]
pub enum WorldError {
    #[error("unknown template: {0}")]
    UnknownTemplate(String),

    #[error("no free serials for {0}")]
    SerialsExhausted(&'static str),

    #[error("{0} does not exist")]
    NotFound(Serial),

    #[error("{mobile} is already observed by connection {connection}")]
    AlreadyObserved { mobile: Serial, connection: ConnectionId },

    #[error(transparent)]
    Rejected(#[from] Rejection),

    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// Fatal save/load failures. Anything recoverable becomes a [`LoadIssue`] instead.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad magic: {0:#018x}")]
    BadMagic(u64),

    #[error("truncated file header")]
    TruncatedHeader,

    /// Wrapper around bincode errors from the accounts payload.
    #[error("serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("unsupported format version {found} (newest known {known})")]
    UnsupportedVersion { found: u16, known: u16 },

    #[error("background write failed: {0}")]
    Join(String),
}

/// A recoverable problem found while loading. The load carries on past each one.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum LoadIssue {
    #[error("unknown segment id {id:#04x}")]
    UnknownSegment { id: u8 },

    #[error("segment {segment:#04x} lies outside the file ({offset}+{length} > {file_len})")]
    SegmentOutOfBounds {
        segment: u8,
        offset: u64,
        length: u64,
        file_len: u64,
    },

    #[error("segment {segment:#04x} truncated at byte {at}")]
    Truncated { segment: u8, at: usize },

    #[error("unknown tag {tag:#04x} in segment {segment:#04x}; {abandoned} records abandoned")]
    UnknownTag {
        segment: u8,
        tag: u8,
        abandoned: u32,
    },

    #[error("unknown type code {code} for {serial}")]
    UnknownTypeCode { serial: Serial, code: u8 },

    #[error("record for {serial} is a {found:?} in the {expected:?} segment")]
    MisfiledRecord {
        serial: Serial,
        expected: EntityKind,
        found: EntityKind,
    },

    #[error("duplicate serial {serial}")]
    DuplicateSerial { serial: Serial },

    #[error("serial {serial} is outside the range for its kind")]
    SerialOutOfRange { serial: Serial },

    #[error("{serial} references missing {missing} ({field})")]
    MissingReference {
        serial: Serial,
        missing: Serial,
        field: &'static str,
    },

    #[error("{serial} has missing parent {parent}; parked in the void")]
    MissingParent { serial: Serial, parent: Serial },

    #[error("{serial} could not be linked under {parent}: {reason}")]
    LinkFailed {
        serial: Serial,
        parent: Serial,
        reason: String,
    },

    #[error("checksum mismatch in segment {segment:#04x}")]
    ChecksumMismatch { segment: u8 },

    #[error("account {account} lists missing character {serial}")]
    MissingCharacter { account: String, serial: Serial },

    #[error("bad account record: {reason}")]
    BadAccounts { reason: String },
}

pub type WorldResult<T> = Result<T, WorldError>;
