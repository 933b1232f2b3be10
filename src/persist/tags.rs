//! The global tag table.
//!
//! Each tag code has exactly one payload type, so a reader can step over any
//! known tag it does not care about. Widths must never change once written.

use serde::Serialize;

/// Payload shape of a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TagType {
    /// Presence alone means `true`; no payload bytes.
    Bool,
    Byte,
    Short,
    Int,
    Long,
    /// NUL-terminated UTF-8.
    Str,
    /// x u16, y u16, z i8.
    Location,
    /// x u16, y u16, z i8, width u16, height u16, depth u16.
    Bounds,
    /// u8 count followed by that many u32 serials.
    RefList,
}

impl TagType {
    /// Payload width when it does not depend on the bytes themselves.
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            TagType::Bool => Some(0),
            TagType::Byte => Some(1),
            TagType::Short => Some(2),
            TagType::Int => Some(4),
            TagType::Long => Some(8),
            TagType::Location => Some(5),
            TagType::Bounds => Some(11),
            TagType::Str | TagType::RefList => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Tag {
    Direction = 0x01,
    Weight = 0x02,
    Amount = 0x03,
    Layer = 0x04,
    Immovable = 0x05,
    Hidden = 0x06,
    Event = 0x07,
    Footprint = 0x08,
    Flags = 0x09,
    MaxWeight = 0x10,
    MaxItems = 0x11,
    Contents = 0x12,
    Body = 0x20,
    Equipment = 0x21,
    Home = 0x22,
}

impl Tag {
    pub const ALL: [Tag; 15] = [
        Tag::Direction,
        Tag::Weight,
        Tag::Amount,
        Tag::Layer,
        Tag::Immovable,
        Tag::Hidden,
        Tag::Event,
        Tag::Footprint,
        Tag::Flags,
        Tag::MaxWeight,
        Tag::MaxItems,
        Tag::Contents,
        Tag::Body,
        Tag::Equipment,
        Tag::Home,
    ];

    pub fn from_code(code: u8) -> Option<Tag> {
        Tag::ALL.into_iter().find(|tag| *tag as u8 == code)
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn payload(self) -> TagType {
        match self {
            Tag::Direction | Tag::Layer => TagType::Byte,
            Tag::Weight | Tag::Amount | Tag::MaxItems | Tag::Body => TagType::Short,
            Tag::MaxWeight => TagType::Int,
            Tag::Flags => TagType::Long,
            Tag::Immovable | Tag::Hidden => TagType::Bool,
            Tag::Event => TagType::Str,
            Tag::Footprint => TagType::Bounds,
            Tag::Contents | Tag::Equipment => TagType::RefList,
            Tag::Home => TagType::Location,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_unique_and_round_trip() {
        for tag in Tag::ALL {
            assert_eq!(Tag::from_code(tag.code()), Some(tag));
        }
        let mut codes: Vec<u8> = Tag::ALL.iter().map(|t| t.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), Tag::ALL.len());
        assert_eq!(Tag::from_code(0xEE), None);
    }

    #[test]
    fn widths_match_the_table() {
        assert_eq!(Tag::Hidden.payload().fixed_width(), Some(0));
        assert_eq!(Tag::Footprint.payload().fixed_width(), Some(11));
        assert_eq!(Tag::Home.payload().fixed_width(), Some(5));
        assert_eq!(Tag::Contents.payload().fixed_width(), None);
    }
}
