//! Block file for index block I/O.

use crate::index::IndexBlock;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use whdb_common::page::{BLOCK_SIZE, BlockId};
use whdb_common::{Result, StorageConfig, WhdbError};

/// Options for opening a block file.
#[derive(Debug, Clone)]
pub struct BlockFileOptions {
    /// Sync the file after every block write.
    pub fsync_enabled: bool,
}

impl Default for BlockFileOptions {
    fn default() -> Self {
        Self {
            fsync_enabled: true,
        }
    }
}

/// A file made of whole index blocks.
///
/// Block `n` lives at byte offset `n * BLOCK_SIZE`. The handle is shared
/// behind a mutex so reads and writes from several threads serialize.
pub struct BlockFile {
    path: PathBuf,
    options: BlockFileOptions,
    inner: Mutex<FileHandle>,
}

struct FileHandle {
    file: File,
    num_blocks: u32,
}

impl BlockFile {
    /// Opens or creates the block file at `path`.
    ///
    /// A file whose length is not a whole number of blocks is rejected.
    pub fn open(path: impl AsRef<Path>, options: BlockFileOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let file_size = file.metadata()?.len();
        if file_size % BLOCK_SIZE as u64 != 0 {
            return Err(WhdbError::IoError(format!(
                "{} has size {} which is not a multiple of {}",
                path.display(),
                file_size,
                BLOCK_SIZE
            )));
        }
        let num_blocks = (file_size / BLOCK_SIZE as u64) as u32;
        debug!(path = %path.display(), num_blocks, "opened block file");

        Ok(Self {
            path,
            options,
            inner: Mutex::new(FileHandle { file, num_blocks }),
        })
    }

    /// Opens the index file named by the storage configuration.
    pub fn open_with_config(config: &StorageConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;
        Self::open(
            config.index_path(),
            BlockFileOptions {
                fsync_enabled: config.fsync_enabled,
            },
        )
    }

    /// Returns the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends an empty index block whose end-of-block entry points at
    /// `default_child_id`.
    pub fn allocate_block(&self, default_child_id: u32) -> Result<BlockId> {
        let mut handle = self.inner.lock();
        let block_id = BlockId(handle.num_blocks);

        let mut buffer = [0u8; BLOCK_SIZE];
        IndexBlock::new(&mut buffer[..])?.construct_empty_block(default_child_id);

        handle.file.seek(SeekFrom::Start(block_id.file_offset()))?;
        handle.file.write_all(&buffer)?;
        if self.options.fsync_enabled {
            handle.file.sync_all()?;
        }

        handle.num_blocks += 1;
        debug!(block = %block_id, "allocated index block");
        Ok(block_id)
    }

    /// Reads a block.
    pub fn read_block(&self, block_id: BlockId) -> Result<[u8; BLOCK_SIZE]> {
        let mut handle = self.inner.lock();
        if block_id.0 >= handle.num_blocks {
            return Err(WhdbError::BlockNotFound {
                block_id: block_id.0,
            });
        }

        handle.file.seek(SeekFrom::Start(block_id.file_offset()))?;
        let mut buffer = [0u8; BLOCK_SIZE];
        handle.file.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    /// Reads a block and checks its index layout.
    pub fn read_index_block(&self, block_id: BlockId) -> Result<IndexBlock<Vec<u8>>> {
        let block = IndexBlock::new(self.read_block(block_id)?.to_vec())?;
        block.validate()?;
        Ok(block)
    }

    /// Writes a block. Writing one past the last block extends the file.
    pub fn write_block(&self, block_id: BlockId, data: &[u8]) -> Result<()> {
        if data.len() != BLOCK_SIZE {
            return Err(WhdbError::PageSizeMismatch {
                expected: BLOCK_SIZE,
                actual: data.len(),
            });
        }

        let mut handle = self.inner.lock();
        if block_id.0 > handle.num_blocks {
            return Err(WhdbError::BlockNotFound {
                block_id: block_id.0,
            });
        }

        handle.file.seek(SeekFrom::Start(block_id.file_offset()))?;
        handle.file.write_all(data)?;
        if self.options.fsync_enabled {
            handle.file.sync_all()?;
        }

        if block_id.0 == handle.num_blocks {
            handle.num_blocks += 1;
        }
        debug!(block = %block_id, "wrote index block");
        Ok(())
    }

    /// Returns the number of blocks in the file.
    pub fn num_blocks(&self) -> u32 {
        self.inner.lock().num_blocks
    }

    /// Flushes pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }
}

impl Drop for BlockFile {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
