//! Append-only record storage for a replica.
//!
//! The file is a sequence of length-prefixed records. Recovery scans the
//! file sequentially; a partially written trailing record is truncated and
//! recovery proceeds with the fully parsed prefix.

use std::path::{Path, PathBuf};

use log::warn;
use prost::Message;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::error::{LogError, LogResult};
use crate::record::Record;

pub struct Storage {
    path: PathBuf,
    file: File,
}

impl Storage {
    /// Open the record file, returning the storage handle and every fully
    /// persisted record. The file is created if absent and truncated to the
    /// last fully parsed record if the tail is corrupt.
    pub async fn open(path: impl AsRef<Path>) -> LogResult<(Self, Vec<Record>)> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .await?;
        let buffer = tokio::fs::read(&path).await?;
        let (records, valid_length) = decode_records(&buffer);
        if valid_length < buffer.len() {
            warn!(
                "failed to completely recover the log at '{}': truncating {} trailing bytes",
                path.display(),
                buffer.len() - valid_length
            );
            file.set_len(valid_length as u64).await?;
            file.sync_data().await?;
        }
        Ok((Self { path, file }, records))
    }

    /// Append one record durably.
    pub async fn persist(&mut self, record: &Record) -> LogResult<()> {
        let framed = record.frame()?;
        self.file.write_all(&framed).await?;
        self.file.sync_data().await?;
        Ok(())
    }

    /// Re-read every record from the start of the file.
    pub async fn records(&self) -> LogResult<Vec<Record>> {
        let buffer = tokio::fs::read(&self.path).await?;
        let (records, valid_length) = decode_records(&buffer);
        if valid_length < buffer.len() {
            // Inconsistencies in the file are taken care of during recovery,
            // so a short read here means the storage is failing underneath us.
            return Err(LogError::Persistence(format!(
                "undecodable record in '{}' past recovery",
                self.path.display()
            )));
        }
        Ok(records)
    }
}

/// Decode consecutive framed records, returning the records and the byte
/// length of the valid prefix.
fn decode_records(buffer: &[u8]) -> (Vec<Record>, usize) {
    let mut records = vec![];
    let mut offset = 0;
    loop {
        let Some(header) = buffer.get(offset..offset + 4) else {
            break;
        };
        let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let Some(body) = buffer.get(offset + 4..offset + 4 + length) else {
            break;
        };
        let Ok(record) = Record::decode(body) else {
            break;
        };
        records.push(record);
        offset += 4 + length;
    }
    (records, offset)
}
