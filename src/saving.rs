use bincode::{deserialize_from, serialize_into};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::auth::Profile;
use crate::reading::Reading;
use crate::stats::StatsRecord;

/// Format version written into every backup
pub const BACKUP_VERSION: u32 = 1;

/// Everything needed to restore one account's data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserBackup {
    pub version: u32,
    pub username: String,
    pub profile: Profile,
    pub readings: Vec<Reading>,
    pub stats: StatsRecord,
}

impl UserBackup {
    pub fn new(username: &str, profile: Profile, readings: Vec<Reading>, stats: StatsRecord) -> Self {
        Self {
            version: BACKUP_VERSION,
            username: username.to_string(),
            profile,
            readings,
            stats,
        }
    }
}

/// Writes a gzip-compressed bincode backup
pub fn save_backup<W: Write>(backup: &UserBackup, writer: W) -> std::io::Result<()> {
    let encoder = GzEncoder::new(writer, Compression::default());
    let mut writer = BufWriter::new(encoder);

    serialize_into(&mut writer, backup).map_err(std::io::Error::other)?;

    let encoder = writer.into_inner().map_err(|e| e.into_error())?;
    encoder.finish()?;
    Ok(())
}

pub fn load_backup<R: Read>(reader: R) -> std::io::Result<UserBackup> {
    let decoder = GzDecoder::new(reader);
    let mut reader = BufReader::new(decoder);

    let backup: UserBackup = deserialize_from(&mut reader)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    if backup.version != BACKUP_VERSION {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Unsupported backup version {}", backup.version),
        ));
    }
    Ok(backup)
}

pub fn to_bytes(backup: &UserBackup) -> std::io::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    save_backup(backup, &mut buffer)?;
    Ok(buffer)
}

pub fn from_bytes(bytes: &[u8]) -> std::io::Result<UserBackup> {
    load_backup(bytes)
}

pub fn save_backup_file(backup: &UserBackup, path: impl AsRef<Path>) -> std::io::Result<()> {
    save_backup(backup, File::create(path)?)
}

pub fn load_backup_file(path: impl AsRef<Path>) -> std::io::Result<UserBackup> {
    load_backup(File::open(path)?)
}
