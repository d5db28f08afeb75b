use std::path::Path;

use tracing::warn;

use crate::config::RecoveryMode;
use crate::error::{KvError, Result};
use crate::wal::event::Event;
use crate::wal::writer::check_header;
use crate::wal::{FRAME_HEADER_SIZE, MAX_WAL_FRAME_LEN, WAL_HEADER_SIZE};

/// Everything readable from a WAL.
#[derive(Debug, Default)]
pub struct WalContents {
    pub events: Vec<Event>,
    /// Byte length of the header plus every accepted frame. New frames must
    /// be appended here, not after any garbage that follows.
    pub valid_len: u64,
    /// Bytes after `valid_len` that were ignored.
    pub discarded: u64,
}

enum Frame<'a> {
    Valid { payload: &'a [u8], end: usize },
    /// Length header is readable and in bounds but the checksum fails.
    Damaged { end: usize },
    /// Not even a plausible frame: short header, zero or oversized length,
    /// or a payload running past the end of the log.
    Truncated,
}

/// WAL reader: decode frames from a log image for recovery or inspection.
pub struct WalReader {
    data: Vec<u8>,
    mode: RecoveryMode,
}

impl WalReader {
    /// A missing file reads as an empty log.
    pub fn open(path: &Path, mode: RecoveryMode) -> Result<Self> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self::from_bytes(data, mode))
    }

    pub fn from_bytes(data: Vec<u8>, mode: RecoveryMode) -> Self {
        WalReader { data, mode }
    }

    fn frame_at(&self, pos: usize) -> Frame<'_> {
        let remaining = self.data.len() - pos;
        if remaining < FRAME_HEADER_SIZE {
            return Frame::Truncated;
        }
        let header = &self.data[pos..pos + FRAME_HEADER_SIZE];
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if len == 0 || len > MAX_WAL_FRAME_LEN || len > remaining - FRAME_HEADER_SIZE {
            return Frame::Truncated;
        }
        let start = pos + FRAME_HEADER_SIZE;
        let end = start + len;
        let payload = &self.data[start..end];
        if crc32fast::hash(payload) != crc {
            return Frame::Damaged { end };
        }
        Frame::Valid { payload, end }
    }

    /// Scan forward frame by frame from `pos` looking for any frame whose
    /// checksum holds. Stops at the first structurally impossible frame.
    fn has_valid_frame_ahead(&self, mut pos: usize) -> bool {
        loop {
            match self.frame_at(pos) {
                Frame::Valid { .. } => return true,
                Frame::Damaged { end } => pos = end,
                Frame::Truncated => return false,
            }
        }
    }

    /// Decode every frame.
    ///
    /// Damage with no valid frame after it is a torn tail left by a crash
    /// mid-append; it is dropped in either mode. Damage followed by a valid
    /// frame means committed records would be lost: `Strict` refuses,
    /// `Permissive` keeps the prefix before the damage.
    pub fn read_all(&self) -> Result<WalContents> {
        if self.data.is_empty() {
            return Ok(WalContents {
                valid_len: WAL_HEADER_SIZE as u64,
                ..Default::default()
            });
        }
        check_header(&self.data)?;

        let mut events = Vec::new();
        let mut pos = WAL_HEADER_SIZE;
        while pos < self.data.len() {
            match self.frame_at(pos) {
                Frame::Valid { payload, end } => {
                    let text = std::str::from_utf8(payload).map_err(|_| {
                        KvError::WalParse(format!("frame at offset {} is not UTF-8", pos))
                    })?;
                    events.push(Event::decode(text)?);
                    pos = end;
                }
                Frame::Damaged { end } if self.has_valid_frame_ahead(end) => {
                    if self.mode == RecoveryMode::Strict {
                        return Err(KvError::Wal(format!(
                            "CRC mismatch at offset {} (mid-log corruption)",
                            pos
                        )));
                    }
                    warn!(
                        offset = pos,
                        dropped = self.data.len() - pos,
                        "mid-log WAL corruption, ignoring the rest of the log"
                    );
                    break;
                }
                Frame::Damaged { .. } | Frame::Truncated => {
                    warn!(
                        offset = pos,
                        dropped = self.data.len() - pos,
                        "torn WAL tail ignored"
                    );
                    break;
                }
            }
        }

        Ok(WalContents {
            events,
            valid_len: pos as u64,
            discarded: (self.data.len() - pos) as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::writer::WalWriter;
    use std::io::Write;
    use tempfile::TempDir;

    fn sample_log() -> (Vec<u8>, Vec<Event>) {
        let events = vec![
            Event::StartTransaction { txid: 1 },
            Event::CreateTable { name: "t".into() },
            Event::InsertEntry {
                table: "t".into(),
                key: b"k".to_vec(),
                value: b"v".to_vec(),
            },
            Event::FreePages { pages: vec![4] },
            Event::CommitTransaction { txid: 1 },
        ];
        let mut writer = WalWriter::in_memory();
        writer.append_all(&events).unwrap();
        (writer.contents().unwrap(), events)
    }

    /// Byte offset where the frame with the given index starts.
    fn frame_offset(data: &[u8], index: usize) -> usize {
        let mut pos = WAL_HEADER_SIZE;
        for _ in 0..index {
            let len = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
            pos += FRAME_HEADER_SIZE + len;
        }
        pos
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.wal");
        let (_, events) = sample_log();
        {
            let mut writer = WalWriter::open(&path, true).unwrap();
            writer.append_all(&events).unwrap();
        }

        let contents = WalReader::open(&path, RecoveryMode::Strict)
            .unwrap()
            .read_all()
            .unwrap();
        assert_eq!(contents.events, events);
        assert_eq!(contents.valid_len, std::fs::metadata(&path).unwrap().len());
        assert_eq!(contents.discarded, 0);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let contents = WalReader::open(&dir.path().join("none.wal"), RecoveryMode::Strict)
            .unwrap()
            .read_all()
            .unwrap();
        assert!(contents.events.is_empty());
        assert_eq!(contents.valid_len, WAL_HEADER_SIZE as u64);
    }

    #[test]
    fn test_truncated_tail_tolerated() {
        let (data, events) = sample_log();
        let cut = frame_offset(&data, 4) + 5;
        let contents = WalReader::from_bytes(data[..cut].to_vec(), RecoveryMode::Strict)
            .read_all()
            .unwrap();
        assert_eq!(contents.events, events[..4]);
        assert_eq!(contents.valid_len, frame_offset(&data, 4) as u64);
        assert_eq!(contents.discarded, 5);
    }

    #[test]
    fn test_corrupt_last_frame_tolerated() {
        let (mut data, events) = sample_log();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        let contents = WalReader::from_bytes(data, RecoveryMode::Strict)
            .read_all()
            .unwrap();
        assert_eq!(contents.events, events[..4]);
    }

    #[test]
    fn test_trailing_garbage_tolerated() {
        let (mut data, events) = sample_log();
        data.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef, 0, 0, 0]);
        let contents = WalReader::from_bytes(data, RecoveryMode::Strict)
            .read_all()
            .unwrap();
        assert_eq!(contents.events, events);
        assert_eq!(contents.discarded, 7);
    }

    #[test]
    fn test_mid_log_corruption() {
        let (mut data, events) = sample_log();
        // Flip a payload byte of the second frame; three valid frames follow.
        let at = frame_offset(&data, 1) + FRAME_HEADER_SIZE;
        data[at] ^= 0x01;

        let err = WalReader::from_bytes(data.clone(), RecoveryMode::Strict)
            .read_all()
            .unwrap_err();
        assert!(matches!(err, KvError::Wal(_)));

        let contents = WalReader::from_bytes(data, RecoveryMode::Permissive)
            .read_all()
            .unwrap();
        assert_eq!(contents.events, events[..1]);
        assert_eq!(contents.valid_len, at as u64 - FRAME_HEADER_SIZE as u64);
    }

    #[test]
    fn test_checksummed_garbage_is_parse_error() {
        let mut writer = WalWriter::in_memory();
        writer.append(&Event::StartTransaction { txid: 1 }).unwrap();
        let mut data = writer.contents().unwrap();
        let payload = b"NOT_AN_EVENT";
        data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        data.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
        data.extend_from_slice(payload);

        let err = WalReader::from_bytes(data, RecoveryMode::Permissive)
            .read_all()
            .unwrap_err();
        assert!(matches!(err, KvError::WalParse(_)));
    }

    #[test]
    fn test_bad_header_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.wal");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"XXXXXXXXXXXXXXXX").unwrap();
        drop(file);
        let err = WalReader::open(&path, RecoveryMode::Permissive)
            .unwrap()
            .read_all()
            .unwrap_err();
        assert!(matches!(err, KvError::Wal(_)));
    }
}
