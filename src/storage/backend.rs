/// Flat, growable byte space under the page manager.
///
/// Two implementations share the same semantics:
///   - `MemoryStorage`: a `Vec<u8>`, nothing is durable.
///   - `FileStorage`: the file is grown with `set_len` and mapped into
///     memory chunk by chunk, so growing never remaps existing chunks.
use std::fs::{File, OpenOptions};
use std::path::Path;

use fs4::fs_std::FileExt;
use memmap2::{MmapMut, MmapOptions};

use crate::error::{KvError, Result};

/// Chunk sizes are rounded to this so every mapping offset is aligned on
/// all platforms (64 KiB is the Windows allocation granularity).
const CHUNK_ALIGN: u64 = 64 * 1024;

pub trait Storage: Send + Sync {
    /// Current size of the byte space.
    fn size(&self) -> u64;

    /// Grow to at least `new_size` bytes. No-op when already that large.
    fn increase_size(&mut self, new_size: u64) -> Result<()>;

    /// Borrow `size` bytes at `offset`. Out-of-bounds access is a bug and panics.
    fn memory_block(&self, size: usize, offset: u64) -> &[u8];

    /// Overwrite bytes in place; visible to later reads, not yet durable.
    fn update_memory_block(&mut self, data: &[u8], offset: u64);

    /// Overwrite bytes and make them durable.
    fn flush_memory_block(&mut self, data: &[u8], offset: u64) -> Result<()>;

    /// Make every prior update durable.
    fn sync(&mut self) -> Result<()>;
}

/// In-memory storage for tests and ephemeral databases.
#[derive(Default)]
pub struct MemoryStorage {
    data: Vec<u8>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn increase_size(&mut self, new_size: u64) -> Result<()> {
        if new_size > self.data.len() as u64 {
            self.data.resize(new_size as usize, 0);
        }
        Ok(())
    }

    fn memory_block(&self, size: usize, offset: u64) -> &[u8] {
        let start = offset as usize;
        assert!(
            start + size <= self.data.len(),
            "BUG: memory block {}+{} beyond storage size {}",
            start,
            size,
            self.data.len()
        );
        &self.data[start..start + size]
    }

    fn update_memory_block(&mut self, data: &[u8], offset: u64) {
        let start = offset as usize;
        assert!(
            start + data.len() <= self.data.len(),
            "BUG: memory block {}+{} beyond storage size {}",
            start,
            data.len(),
            self.data.len()
        );
        self.data[start..start + data.len()].copy_from_slice(data);
    }

    fn flush_memory_block(&mut self, data: &[u8], offset: u64) -> Result<()> {
        self.update_memory_block(data, offset);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

struct Chunk {
    offset: u64,
    map: MmapMut,
}

/// File-backed storage mapped into memory in chunks.
pub struct FileStorage {
    file: File,
    size: u64,
    chunks: Vec<Chunk>,
}

impl FileStorage {
    /// Open (or create) the file and take an exclusive process lock on it.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        FileExt::lock_exclusive(&file).map_err(|e| {
            KvError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to lock {}: {}", path.display(), e),
            ))
        })?;

        let size = file.metadata()?.len();
        let mut storage = FileStorage {
            file,
            size: 0,
            chunks: Vec::new(),
        };
        if size > 0 {
            if size % CHUNK_ALIGN != 0 {
                return Err(KvError::Corruption(format!(
                    "{}: file size {} is not a multiple of {}",
                    path.display(),
                    size,
                    CHUNK_ALIGN
                )));
            }
            storage.map_chunk(0, size)?;
            storage.size = size;
        }
        Ok(storage)
    }

    fn map_chunk(&mut self, offset: u64, len: u64) -> Result<()> {
        // SAFETY: the file is exclusively locked by this process and only
        // accessed through this struct; chunks are never remapped or shrunk
        // while borrowed because every mutation takes `&mut self`.
        let map = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(len as usize)
                .map_mut(&self.file)?
        };
        self.chunks.push(Chunk { offset, map });
        Ok(())
    }

    fn locate(&self, offset: u64, len: usize) -> (usize, usize) {
        let idx = self
            .chunks
            .partition_point(|c| c.offset <= offset)
            .checked_sub(1)
            .expect("BUG: offset before first chunk");
        let chunk = &self.chunks[idx];
        let start = (offset - chunk.offset) as usize;
        assert!(
            start + len <= chunk.map.len(),
            "BUG: memory block {}+{} crosses a chunk boundary or storage end ({})",
            offset,
            len,
            self.size
        );
        (idx, start)
    }
}

impl Storage for FileStorage {
    fn size(&self) -> u64 {
        self.size
    }

    fn increase_size(&mut self, new_size: u64) -> Result<()> {
        if new_size <= self.size {
            return Ok(());
        }
        let new_size = new_size.div_ceil(CHUNK_ALIGN) * CHUNK_ALIGN;
        self.file.set_len(new_size)?;
        let old = self.size;
        self.map_chunk(old, new_size - old)?;
        self.size = new_size;
        Ok(())
    }

    fn memory_block(&self, size: usize, offset: u64) -> &[u8] {
        let (idx, start) = self.locate(offset, size);
        &self.chunks[idx].map[start..start + size]
    }

    fn update_memory_block(&mut self, data: &[u8], offset: u64) {
        let (idx, start) = self.locate(offset, data.len());
        self.chunks[idx].map[start..start + data.len()].copy_from_slice(data);
    }

    fn flush_memory_block(&mut self, data: &[u8], offset: u64) -> Result<()> {
        let (idx, start) = self.locate(offset, data.len());
        let chunk = &mut self.chunks[idx];
        chunk.map[start..start + data.len()].copy_from_slice(data);
        chunk.map.flush_range(start, data.len())?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        for chunk in &self.chunks {
            chunk.map.flush()?;
        }
        self.file.sync_all()?;
        Ok(())
    }
}
