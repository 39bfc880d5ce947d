use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use log::debug;
use parking_lot::Mutex;
use serde::{Serialize, Deserialize};

use crate::common::types::{BlockNo, UnitId, DEFAULT_BLOCK_SIZE, INVALID_BLOCK};
use crate::storage::disk::Storage;
use crate::storage::disk::error::{Result, StorageError};
use crate::storage::page::layout::MIN_BLOCK_SIZE;

const DATA_FILE: &str = "container.db";
const META_FILE: &str = "container.meta";

/// Configuration for the file-backed block space
#[derive(Debug, Clone)]
pub struct DiskManagerConfig {
    /// Directory holding the data and metadata files
    pub data_dir: PathBuf,

    /// Size of one block in bytes
    pub block_size: usize,
}

impl Default for DiskManagerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

/// Allocation state persisted on `sync()`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SpaceMeta {
    block_size: usize,
    next_unit: UnitId,
    high_water: BlockNo,
    blocks: BTreeMap<BlockNo, UnitId>,
    units: BTreeSet<UnitId>,
}

impl SpaceMeta {
    fn lowest_free_block(&self) -> BlockNo {
        (1..=self.high_water)
            .find(|b| !self.blocks.contains_key(b))
            .unwrap_or(self.high_water + 1)
    }
}

struct OpenState {
    db_file: File,
    meta: SpaceMeta,
}

/// DiskManager is a single-file block space: block `n` lives at offset
/// `(n - 1) * block_size` of the data file.
pub struct DiskManager {
    config: DiskManagerConfig,
    state: Mutex<Option<OpenState>>,
}

impl DiskManager {
    /// Create a DiskManager over `config.data_dir`; the files are opened by `open()`
    pub fn new(config: DiskManagerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(None),
        }
    }

    /// Create and open a DiskManager in one step
    pub fn open_at(data_dir: impl AsRef<Path>, block_size: usize) -> Result<Self> {
        let manager = Self::new(DiskManagerConfig {
            data_dir: data_dir.as_ref().to_path_buf(),
            block_size,
        });
        manager.open()?;
        Ok(manager)
    }

    fn meta_path(&self) -> PathBuf {
        self.config.data_dir.join(META_FILE)
    }

    fn load_meta(&self) -> Result<SpaceMeta> {
        let path = self.meta_path();
        if !path.exists() {
            return Ok(SpaceMeta {
                block_size: self.config.block_size,
                next_unit: 1,
                ..SpaceMeta::default()
            });
        }
        let bytes = std::fs::read(&path)?;
        let meta: SpaceMeta = bincode::deserialize(&bytes)
            .map_err(|e| StorageError::Metadata(e.to_string()))?;
        if meta.block_size != self.config.block_size {
            return Err(StorageError::Metadata(format!(
                "block size mismatch: stored {}, configured {}",
                meta.block_size, self.config.block_size
            )));
        }
        Ok(meta)
    }

    fn store_meta(&self, meta: &SpaceMeta) -> Result<()> {
        let bytes = bincode::serialize(meta)
            .map_err(|e| StorageError::Metadata(e.to_string()))?;
        let tmp = self.config.data_dir.join(format!("{}.tmp", META_FILE));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, self.meta_path())?;
        Ok(())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut OpenState) -> Result<T>) -> Result<T> {
        let mut guard = self.state.lock();
        match guard.as_mut() {
            Some(state) => f(state),
            None => Err(StorageError::Closed),
        }
    }

    fn check_buffer(&self, len: usize, count: usize) -> Result<()> {
        if len < count * self.config.block_size {
            return Err(StorageError::BufferSize {
                actual: len,
                count,
                block_size: self.config.block_size,
            });
        }
        Ok(())
    }

    /// Calculate the offset of a block in the file
    fn block_offset(&self, block: BlockNo) -> u64 {
        (block as u64 - 1) * self.config.block_size as u64
    }
}

impl Storage for DiskManager {
    fn open(&self) -> Result<()> {
        let mut guard = self.state.lock();
        if guard.is_some() {
            return Err(StorageError::AlreadyOpen);
        }
        if self.config.block_size < MIN_BLOCK_SIZE {
            return Err(StorageError::Metadata(format!(
                "block size {} is below the minimum of {}",
                self.config.block_size, MIN_BLOCK_SIZE
            )));
        }
        std::fs::create_dir_all(&self.config.data_dir)?;
        let db_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.config.data_dir.join(DATA_FILE))?;
        let meta = self.load_meta()?;
        debug!(
            "Opened block space at {:?}: {} blocks in {} units",
            self.config.data_dir,
            meta.blocks.len(),
            meta.units.len()
        );
        *guard = Some(OpenState { db_file, meta });
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let Some(state) = guard.take() else {
            return Err(StorageError::Closed);
        };
        state.db_file.sync_all()?;
        self.store_meta(&state.meta)?;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.state.lock().is_none()
    }

    fn block_size(&self) -> usize {
        self.config.block_size
    }

    fn read(&self, block: BlockNo, buf: &mut [u8], count: usize) -> Result<()> {
        self.check_buffer(buf.len(), count)?;
        self.with_state(|state| {
            for b in block..block + count as BlockNo {
                if !state.meta.blocks.contains_key(&b) {
                    return Err(StorageError::BlockNotAllocated(b));
                }
            }

            let len = count * self.config.block_size;
            let offset = self.block_offset(block);
            let file_size = state.db_file.metadata()?.len();
            buf[..len].fill(0);

            // Blocks past the end of the file were allocated but never written
            if offset < file_size {
                let available = ((file_size - offset) as usize).min(len);
                state.db_file.seek(SeekFrom::Start(offset))?;
                state.db_file.read_exact(&mut buf[..available])?;
            }
            Ok(())
        })
    }

    fn write(&self, block: BlockNo, buf: &[u8], count: usize, sync: bool) -> Result<()> {
        self.check_buffer(buf.len(), count)?;
        self.with_state(|state| {
            for b in block..block + count as BlockNo {
                if !state.meta.blocks.contains_key(&b) {
                    return Err(StorageError::BlockNotAllocated(b));
                }
            }

            let len = count * self.config.block_size;
            state.db_file.seek(SeekFrom::Start(self.block_offset(block)))?;
            state.db_file.write_all(&buf[..len])?;
            if sync {
                state.db_file.sync_data()?;
            }
            Ok(())
        })
    }

    fn allocate(&self, block: Option<BlockNo>, unit: UnitId, force: bool) -> Result<BlockNo> {
        self.with_state(|state| {
            let meta = &mut state.meta;
            if !meta.units.contains(&unit) {
                if !force {
                    return Err(StorageError::UnitNotFound(unit));
                }
                meta.units.insert(unit);
                meta.next_unit = meta.next_unit.max(unit + 1);
            }

            let block = match block {
                Some(INVALID_BLOCK) => return Err(StorageError::BlockNotAllocated(INVALID_BLOCK)),
                Some(b) => b,
                None => meta.lowest_free_block(),
            };

            if let Some(&owner) = meta.blocks.get(&block) {
                if !force {
                    return Err(StorageError::BlockAlreadyAllocated(block, owner));
                }
                // Replayed allocations win over a release that never reached the metadata
                meta.blocks.insert(block, unit);
                return Ok(block);
            }

            meta.blocks.insert(block, unit);
            meta.high_water = meta.high_water.max(block);
            Ok(block)
        })
    }

    fn release(&self, block: BlockNo, unit: UnitId, force: bool) -> Result<()> {
        self.with_state(|state| {
            match state.meta.blocks.get(&block) {
                Some(&owner) if owner == unit => {
                    state.meta.blocks.remove(&block);
                    Ok(())
                }
                Some(&owner) if !force => Err(StorageError::BlockAlreadyAllocated(block, owner)),
                None if !force => Err(StorageError::BlockNotAllocated(block)),
                // Already released, or reused by another unit since
                _ => Ok(()),
            }
        })
    }

    fn create_unit(&self, unit: Option<UnitId>, force: bool) -> Result<UnitId> {
        self.with_state(|state| {
            let meta = &mut state.meta;
            let unit = unit.unwrap_or(meta.next_unit);
            if !meta.units.insert(unit) && !force {
                return Err(StorageError::UnitExists(unit));
            }
            meta.next_unit = meta.next_unit.max(unit + 1);
            Ok(unit)
        })
    }

    fn drop_unit(&self, unit: UnitId, force: bool) -> Result<()> {
        self.with_state(|state| {
            let meta = &mut state.meta;
            if !meta.units.remove(&unit) && !force {
                return Err(StorageError::UnitNotFound(unit));
            }
            meta.blocks.retain(|_, owner| *owner != unit);
            Ok(())
        })
    }

    fn unit_of(&self, block: BlockNo) -> Option<UnitId> {
        let guard = self.state.lock();
        guard.as_ref().and_then(|state| state.meta.blocks.get(&block).copied())
    }

    fn sync(&self) -> Result<()> {
        let guard = self.state.lock();
        let Some(state) = guard.as_ref() else {
            return Err(StorageError::Closed);
        };
        state.db_file.sync_all()?;
        self.store_meta(&state.meta)
    }

    fn sync_data(&self) -> Result<()> {
        self.with_state(|state| {
            state.db_file.sync_data()?;
            Ok(())
        })
    }
}
