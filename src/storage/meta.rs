/// Master page (page 0) layout.
///
/// ```text
/// [signature: 8] [page_count: u64] [freelist_head: u64]
/// [root: u64] [version: u64] [next_txid: u64] [applied_txid: u64]
/// [freelist_total: u64] [page_size: u32] [crc32: u32]
/// ```
///
/// The CRC covers every byte before it, so a torn master page write is
/// reported as corruption instead of being read as a bogus root.
///
/// `root` is the catalog tree root, `version` counts commits, and
/// `applied_txid` is the last transaction whose effects are in `root`;
/// recovery replays WAL transactions that follow it.
use crate::error::{KvError, Result};
use crate::storage::PageId;

pub const SIGNATURE: &[u8; 8] = b"COWKV001";
pub const META_SIZE: usize = 8 + 8 * 7 + 4 + 4;
const CRC_OFFSET: usize = META_SIZE - 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaPage {
    pub page_count: u64,
    pub freelist_head: PageId,
    pub root: PageId,
    pub version: u64,
    pub next_txid: u64,
    pub applied_txid: u64,
    pub freelist_total: u64,
    pub page_size: u32,
}

impl MetaPage {
    /// State of a freshly created store: only page 0 exists.
    pub fn new(page_size: usize) -> Self {
        MetaPage {
            page_count: 1,
            freelist_head: 0,
            root: 0,
            version: 0,
            next_txid: 1,
            applied_txid: 0,
            freelist_total: 0,
            page_size: page_size as u32,
        }
    }

    pub fn serialize(&self) -> [u8; META_SIZE] {
        let mut buf = [0u8; META_SIZE];
        buf[0..8].copy_from_slice(SIGNATURE);
        let fields = [
            self.page_count,
            self.freelist_head,
            self.root,
            self.version,
            self.next_txid,
            self.applied_txid,
            self.freelist_total,
        ];
        for (i, v) in fields.iter().enumerate() {
            let at = 8 + i * 8;
            buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
        }
        buf[64..68].copy_from_slice(&self.page_size.to_le_bytes());
        let crc = crc32fast::hash(&buf[..CRC_OFFSET]);
        buf[CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < META_SIZE {
            return Err(KvError::Corruption("master page truncated".into()));
        }
        if &data[0..8] != SIGNATURE {
            return Err(KvError::Corruption("bad master page signature".into()));
        }
        let stored = u32::from_le_bytes(data[CRC_OFFSET..META_SIZE].try_into().unwrap());
        if stored != crc32fast::hash(&data[..CRC_OFFSET]) {
            return Err(KvError::Corruption("master page checksum mismatch".into()));
        }
        let field = |i: usize| -> u64 {
            let at = 8 + i * 8;
            u64::from_le_bytes(data[at..at + 8].try_into().unwrap())
        };
        Ok(MetaPage {
            page_count: field(0),
            freelist_head: field(1),
            root: field(2),
            version: field(3),
            next_txid: field(4),
            applied_txid: field(5),
            freelist_total: field(6),
            page_size: u32::from_le_bytes(data[64..68].try_into().unwrap()),
        })
    }
}
