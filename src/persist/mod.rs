//! Binary save format.
//!
//! A save file is a table of typed segments (world metadata, accounts, map
//! statics, timers and one segment per entity kind). Entity records carry a
//! fixed prefix followed by self-describing tags, see [`tags`].

pub mod accounts;
pub mod codec;
pub mod format;
pub mod load;
pub mod save;
pub mod tags;

use std::path::PathBuf;

use serde::Serialize;

use crate::errors::LoadIssue;

use self::format::SegmentHeader;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SaveReport {
    pub path: Option<PathBuf>,
    pub bytes: u64,
    pub entities: usize,
    pub statics: usize,
    pub timers: usize,
    pub accounts: usize,
    pub segments: Vec<SegmentHeader>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub entities: usize,
    pub statics: usize,
    pub timers: usize,
    pub accounts: usize,
    pub issues: Vec<LoadIssue>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}
