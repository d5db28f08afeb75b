pub mod event;
pub mod reader;
pub mod recovery;
pub mod writer;

pub const WAL_MAGIC: &[u8; 8] = b"COWKVWAL";
pub const WAL_VERSION: u32 = 1;
pub const WAL_HEADER_SIZE: usize = 12;

/// `[payload_len: u32][crc32: u32]` before every payload.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Upper bound for one frame payload. Entry events carry at most one key and
/// two values, base64 encoded, so this is far above anything a valid
/// configuration emits; larger lengths are treated as garbage.
pub const MAX_WAL_FRAME_LEN: usize = 64 * 1024 * 1024;
