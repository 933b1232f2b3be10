//! Compressed copies of the save file.
//!
//! Before a save overwrites the previous file, that file is gzip-compressed
//! into the backup directory. Each backup's SHA-256 is recorded in
//! `backups.json` next to it, so a copy can be verified before it is
//! restored. Retention keeps the newest N non-manual backups.

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::persist::format::parse_header;
use crate::persist::save::write_atomic;

const METADATA_FILE: &str = "backups.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
    /// Timestamp-based identifier, also the file stem.
    pub id: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Size of the compressed file.
    pub size_bytes: u64,
    /// Size of the save file it was taken from.
    pub source_bytes: u64,
    pub kind: BackupKind,
    /// SHA-256 of the compressed file, hex.
    pub checksum: String,
    pub verified: bool,
    /// Relative to the backup directory.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Manual,
    Autosave,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Newest automatic (autosave and shutdown) backups kept.
    pub keep: usize,
    /// Manual backups are never pruned or deleted when set.
    pub keep_manual: bool,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep: 10,
            keep_manual: true,
        }
    }
}

pub struct BackupManager {
    save_path: PathBuf,
    backup_path: PathBuf,
    retention: RetentionPolicy,
    backups: BTreeMap<String, BackupMetadata>,
}

impl BackupManager {
    /// Manage backups of `save_path` inside `backup_path`, creating the
    /// directory and reading any existing `backups.json`.
    pub fn new(save_path: PathBuf, backup_path: PathBuf, retention: RetentionPolicy) -> io::Result<Self> {
        fs::create_dir_all(&backup_path)?;
        let mut manager = Self {
            save_path,
            backup_path,
            retention,
            backups: BTreeMap::new(),
        };
        manager.load_metadata()?;
        Ok(manager)
    }

    pub fn save_path(&self) -> &Path {
        &self.save_path
    }

    fn load_metadata(&mut self) -> io::Result<()> {
        let metadata_path = self.backup_path.join(METADATA_FILE);
        if metadata_path.exists() {
            let contents = fs::read_to_string(&metadata_path)?;
            self.backups = serde_json::from_str(&contents)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        }
        Ok(())
    }

    fn save_metadata(&self) -> io::Result<()> {
        let contents = serde_json::to_string_pretty(&self.backups)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_atomic(&self.backup_path.join(METADATA_FILE), contents.as_bytes())
    }

    fn unique_id(&self, at: DateTime<Utc>) -> String {
        let base = format!("world_{}", at.format("%Y%m%d_%H%M%S_%3f"));
        if !self.backups.contains_key(&base) {
            return base;
        }
        let mut n = 1u32;
        loop {
            let id = format!("{}_{}", base, n);
            if !self.backups.contains_key(&id) {
                return id;
            }
            n += 1;
        }
    }

    /// Compress the current save file into a new backup.
    /// Fails with `NotFound` when there is no save file yet.
    pub fn create_backup(&mut self, name: Option<String>, kind: BackupKind) -> io::Result<BackupMetadata> {
        let timestamp = Utc::now();
        let id = self.unique_id(timestamp);
        let filename = format!("{}.sav.gz", id);
        let backup_file = self.backup_path.join(&filename);

        let mut source = File::open(&self.save_path)?;
        let source_bytes = source.metadata()?.len();
        let mut encoder = GzEncoder::new(File::create(&backup_file)?, Compression::default());
        io::copy(&mut source, &mut encoder)?;
        encoder.finish()?.sync_all()?;

        let checksum = calculate_checksum(&backup_file)?;
        let size_bytes = fs::metadata(&backup_file)?.len();
        let metadata = BackupMetadata {
            id: id.clone(),
            name,
            created_at: timestamp,
            size_bytes,
            source_bytes,
            kind,
            checksum,
            verified: false,
            path: PathBuf::from(&filename),
        };
        self.backups.insert(id.clone(), metadata.clone());
        self.save_metadata()?;
        log::info!(
            "backup {} created ({:?}, {} -> {} bytes)",
            id,
            kind,
            source_bytes,
            size_bytes
        );
        Ok(metadata)
    }

    fn read_backup(&self, backup_id: &str) -> io::Result<(PathBuf, &BackupMetadata)> {
        let metadata = self
            .backups
            .get(backup_id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Backup not found"))?;
        let backup_file = self.backup_path.join(&metadata.path);
        if !backup_file.exists() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "Backup file missing"));
        }
        Ok((backup_file, metadata))
    }

    fn decompress(path: &Path) -> io::Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(File::open(path)?);
        let mut bytes = Vec::new();
        decoder.read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    /// Check the checksum and that the decompressed file has a readable
    /// segment table. Marks the backup verified on success.
    pub fn verify_backup(&mut self, backup_id: &str) -> io::Result<bool> {
        let (backup_file, metadata) = self.read_backup(backup_id)?;
        if calculate_checksum(&backup_file)? != metadata.checksum {
            log::error!("backup {} failed verification: checksum mismatch", backup_id);
            return Ok(false);
        }
        let bytes = Self::decompress(&backup_file)?;
        match parse_header(&bytes) {
            Ok(headers) => {
                if let Some(header) = headers.iter().find(|h| !h.within(bytes.len())) {
                    log::error!(
                        "backup {} failed verification: segment {:#04x} lies outside the file",
                        backup_id,
                        header.id
                    );
                    return Ok(false);
                }
            }
            Err(e) => {
                log::error!("backup {} failed verification: {}", backup_id, e);
                return Ok(false);
            }
        }
        if let Some(meta) = self.backups.get_mut(backup_id) {
            meta.verified = true;
        }
        self.save_metadata()?;
        log::info!("backup {} verified", backup_id);
        Ok(true)
    }

    /// Decompress a backup over `restore_path`. The checksum is checked first.
    pub fn restore_backup(&self, backup_id: &str, restore_path: &Path) -> io::Result<()> {
        let (backup_file, metadata) = self.read_backup(backup_id)?;
        if calculate_checksum(&backup_file)? != metadata.checksum {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "Backup checksum mismatch"));
        }
        let bytes = Self::decompress(&backup_file)?;
        write_atomic(restore_path, &bytes)?;
        log::info!("backup {} restored to {}", backup_id, restore_path.display());
        Ok(())
    }

    /// Prune automatic backups beyond the newest `keep`, plus manual ones
    /// when `keep_manual` is off. Returns the ids removed.
    pub fn apply_retention_policy(&mut self) -> io::Result<Vec<String>> {
        let mut automatic: Vec<&BackupMetadata> = self
            .backups
            .values()
            .filter(|b| b.kind != BackupKind::Manual || !self.retention.keep_manual)
            .collect();
        automatic.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        let deleted: Vec<String> = automatic
            .iter()
            .skip(self.retention.keep)
            .map(|b| b.id.clone())
            .collect();

        for backup_id in &deleted {
            if let Some(metadata) = self.backups.remove(backup_id) {
                let backup_file = self.backup_path.join(&metadata.path);
                if backup_file.exists() {
                    fs::remove_file(&backup_file)?;
                }
                log::info!("pruned backup {}", backup_id);
            }
        }
        if !deleted.is_empty() {
            self.save_metadata()?;
        }
        Ok(deleted)
    }

    /// Newest first.
    pub fn list_backups(&self) -> Vec<BackupMetadata> {
        let mut backups: Vec<_> = self.backups.values().cloned().collect();
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        backups
    }

    pub fn get_backup(&self, backup_id: &str) -> Option<&BackupMetadata> {
        self.backups.get(backup_id)
    }

    pub fn delete_backup(&mut self, backup_id: &str) -> io::Result<()> {
        let metadata = self
            .backups
            .get(backup_id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Backup not found"))?;
        if metadata.kind == BackupKind::Manual && self.retention.keep_manual {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "Cannot delete manual backups (retention policy)",
            ));
        }
        let backup_file = self.backup_path.join(&metadata.path);
        if backup_file.exists() {
            fs::remove_file(&backup_file)?;
        }
        self.backups.remove(backup_id);
        self.save_metadata()?;
        log::info!("deleted backup {}", backup_id);
        Ok(())
    }

    pub fn get_stats(&self) -> BackupStats {
        let mut stats = BackupStats {
            total_backups: self.backups.len(),
            ..Default::default()
        };
        for backup in self.backups.values() {
            stats.total_size_bytes += backup.size_bytes;
            match backup.kind {
                BackupKind::Manual => stats.manual_count += 1,
                BackupKind::Autosave => stats.autosave_count += 1,
                BackupKind::Shutdown => stats.shutdown_count += 1,
            }
            if backup.verified {
                stats.verified_count += 1;
            }
        }
        stats.latest_backup = self.backups.values().map(|b| b.created_at).max();
        stats
    }
}

fn calculate_checksum(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0; 8192];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BackupStats {
    pub total_backups: usize,
    pub total_size_bytes: u64,
    pub manual_count: usize,
    pub autosave_count: usize,
    pub shutdown_count: usize,
    pub verified_count: usize,
    pub latest_backup: Option<DateTime<Utc>>,
}
