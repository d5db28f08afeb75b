use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{KvError, Result};
use crate::wal::event::Event;
use crate::wal::{MAX_WAL_FRAME_LEN, WAL_HEADER_SIZE, WAL_MAGIC, WAL_VERSION};

enum Target {
    File(File),
    Memory(Vec<u8>),
}

/// WAL writer: append-only event log.
///
/// Layout on disk:
///   [magic: 8] [version: u32]
///   then per event: [payload_len: u32] [crc32(payload): u32] [payload]
///
/// The payload is the event's text encoding.
pub struct WalWriter {
    target: Target,
    len: u64,
    sync: bool,
}

fn header() -> [u8; WAL_HEADER_SIZE] {
    let mut buf = [0u8; WAL_HEADER_SIZE];
    buf[0..8].copy_from_slice(WAL_MAGIC);
    buf[8..12].copy_from_slice(&WAL_VERSION.to_le_bytes());
    buf
}

pub(crate) fn encode_frame(event: &Event, out: &mut Vec<u8>) -> Result<()> {
    let payload = event.encode();
    if payload.len() > MAX_WAL_FRAME_LEN {
        return Err(KvError::Wal(format!(
            "{} event of {} bytes exceeds the frame limit {}",
            event.name(),
            payload.len(),
            MAX_WAL_FRAME_LEN
        )));
    }
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc32fast::hash(payload.as_bytes()).to_le_bytes());
    out.extend_from_slice(payload.as_bytes());
    Ok(())
}

impl WalWriter {
    /// Open (or create) the log at `path` and position at its end.
    /// `sync` controls whether every append is fsynced.
    pub fn open(path: &Path, sync: bool) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let mut len = file.metadata()?.len();
        if len < WAL_HEADER_SIZE as u64 {
            // A crash while creating the log can leave part of the header.
            let mut partial = Vec::with_capacity(len as usize);
            file.read_to_end(&mut partial)?;
            if !header().starts_with(&partial) {
                return Err(KvError::Wal(format!(
                    "{}: truncated WAL header",
                    path.display()
                )));
            }
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&header())?;
            file.sync_all()?;
            len = WAL_HEADER_SIZE as u64;
        } else {
            let mut buf = [0u8; WAL_HEADER_SIZE];
            file.read_exact(&mut buf)?;
            check_header(&buf)?;
        }
        file.seek(SeekFrom::End(0))?;
        Ok(WalWriter {
            target: Target::File(file),
            len,
            sync,
        })
    }

    /// A log kept in memory, for in-memory databases.
    pub fn in_memory() -> Self {
        WalWriter {
            target: Target::Memory(header().to_vec()),
            len: WAL_HEADER_SIZE as u64,
            sync: false,
        }
    }

    /// Append events as consecutive frames with a single write, then sync.
    pub fn append_all(&mut self, events: &[Event]) -> Result<()> {
        let mut buf = Vec::new();
        for event in events {
            encode_frame(event, &mut buf)?;
        }
        match &mut self.target {
            Target::File(file) => {
                file.write_all(&buf)?;
                if self.sync {
                    file.sync_data()?;
                }
            }
            Target::Memory(data) => data.extend_from_slice(&buf),
        }
        self.len += buf.len() as u64;
        Ok(())
    }

    pub fn append(&mut self, event: &Event) -> Result<()> {
        self.append_all(std::slice::from_ref(event))
    }

    /// Current log length in bytes; pass to `rewind` to undo later appends.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True when the log holds no frames.
    pub fn is_empty(&self) -> bool {
        self.len == WAL_HEADER_SIZE as u64
    }

    /// Cut the log back to `mark` bytes.
    pub fn rewind(&mut self, mark: u64) -> Result<()> {
        assert!(
            mark >= WAL_HEADER_SIZE as u64 && mark <= self.len,
            "BUG: WAL rewind to {} outside {}..={}",
            mark,
            WAL_HEADER_SIZE,
            self.len
        );
        match &mut self.target {
            Target::File(file) => {
                file.set_len(mark)?;
                file.seek(SeekFrom::Start(mark))?;
                file.sync_all()?;
            }
            Target::Memory(data) => data.truncate(mark as usize),
        }
        self.len = mark;
        Ok(())
    }

    /// Drop every frame, keeping the header. Used by checkpoints.
    pub fn truncate(&mut self) -> Result<()> {
        self.rewind(WAL_HEADER_SIZE as u64)
    }

    /// Raw bytes of the whole log.
    pub fn contents(&mut self) -> Result<Vec<u8>> {
        match &mut self.target {
            Target::File(file) => {
                let mut buf = Vec::with_capacity(self.len as usize);
                file.seek(SeekFrom::Start(0))?;
                file.read_to_end(&mut buf)?;
                file.seek(SeekFrom::End(0))?;
                Ok(buf)
            }
            Target::Memory(data) => Ok(data.clone()),
        }
    }
}

pub(crate) fn check_header(buf: &[u8]) -> Result<()> {
    if buf.len() < WAL_HEADER_SIZE || &buf[0..8] != WAL_MAGIC {
        return Err(KvError::Wal("not a cowkv WAL (bad magic)".into()));
    }
    let version = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
    if version > WAL_VERSION {
        return Err(KvError::Wal(format!(
            "unsupported WAL format version {}",
            version
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_wal_write_and_rewind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.wal");

        let mut writer = WalWriter::open(&path, true).unwrap();
        assert!(writer.is_empty());
        writer.append(&Event::StartTransaction { txid: 1 }).unwrap();
        let mark = writer.len();
        writer
            .append_all(&[
                Event::CreateTable { name: "t".into() },
                Event::CommitTransaction { txid: 1 },
            ])
            .unwrap();
        assert!(writer.len() > mark);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), writer.len());

        writer.rewind(mark).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), mark);
        drop(writer);

        // Reopen appends after the existing frames.
        let mut writer = WalWriter::open(&path, false).unwrap();
        assert_eq!(writer.len(), mark);
        writer.append(&Event::CommitTransaction { txid: 1 }).unwrap();
        assert_eq!(writer.contents().unwrap().len() as u64, writer.len());
    }

    #[test]
    fn test_open_rejects_foreign_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("other.wal");
        std::fs::write(&path, b"definitely not a wal").unwrap();
        assert!(matches!(
            WalWriter::open(&path, false),
            Err(KvError::Wal(_))
        ));
    }

    #[test]
    fn test_partial_header_starts_new_log() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.wal");
        std::fs::write(&path, &header()[..5]).unwrap();

        let mut writer = WalWriter::open(&path, true).unwrap();
        assert!(writer.is_empty());
        writer.append(&Event::StartTransaction { txid: 3 }).unwrap();
        let data = std::fs::read(&path).unwrap();
        assert_eq!(&data[..WAL_HEADER_SIZE], &header());
        assert_eq!(data.len() as u64, writer.len());
    }

    #[test]
    fn test_short_foreign_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.wal");
        std::fs::write(&path, b"XYZ").unwrap();
        assert!(matches!(
            WalWriter::open(&path, false),
            Err(KvError::Wal(_))
        ));
        assert_eq!(std::fs::read(&path).unwrap(), b"XYZ");
    }

    #[test]
    fn test_memory_writer_truncate() {
        let mut writer = WalWriter::in_memory();
        writer.append(&Event::StartTransaction { txid: 7 }).unwrap();
        assert!(!writer.is_empty());
        writer.truncate().unwrap();
        assert!(writer.is_empty());
        assert_eq!(writer.contents().unwrap(), header().to_vec());
    }
}
