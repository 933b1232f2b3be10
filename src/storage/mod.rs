//! Files kept alongside the save: compressed, checksummed backups.

pub mod backup;
