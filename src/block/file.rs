use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use super::codec::{decode_frames, encode_frame, Codec};
use super::{ensure_state, total_size, Block, PartitionSizes, StoreKind};
use crate::types::{BlockId, BlockState, FrameCrc, PartitionKey, Result, SpillwayError};

const BLOCK_FILE_EXT: &str = "block";

/// Path of the file backing `id` under `dir`.
pub(crate) fn block_path(dir: &Path, id: &BlockId) -> PathBuf {
    dir.join(format!("{}.{BLOCK_FILE_EXT}", id.as_str()))
}

/// Block appending framed records to a local file.
///
/// Records land in the file in write order; a partition read scans the
/// whole file and keeps the frames carrying its key.
pub struct FileBlock<T> {
    id: BlockId,
    store: StoreKind,
    state: BlockState,
    path: PathBuf,
    out: Option<BufWriter<File>>,
    codec: Arc<dyn Codec<T>>,
    sizes: PartitionSizes,
    crc: FrameCrc,
    frame: Vec<u8>,
    scratch: Vec<u8>,
}

impl<T> FileBlock<T> {
    /// Creates the block file under `dir`, truncating any previous one.
    pub fn create(
        dir: &Path,
        id: BlockId,
        store: StoreKind,
        codec: Arc<dyn Codec<T>>,
    ) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = block_path(dir, &id);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        debug!(block = %id, path = %path.display(), "block file created");
        Ok(Self {
            id,
            store,
            state: BlockState::Open,
            path,
            out: Some(BufWriter::new(file)),
            codec,
            sizes: PartitionSizes::new(),
            crc: FrameCrc::default(),
            frame: Vec::new(),
            scratch: Vec::new(),
        })
    }

    /// Running checksum over every record written so far.
    pub fn checksum(&self) -> u32 {
        self.crc.finalize()
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>> {
        self.out
            .as_mut()
            .ok_or(SpillwayError::Corruption("block file already closed"))
    }
}

impl<T: Send> Block<T> for FileBlock<T> {
    fn id(&self) -> &BlockId {
        &self.id
    }

    fn store(&self) -> StoreKind {
        self.store
    }

    fn state(&self) -> BlockState {
        self.state
    }

    fn write(&mut self, key: PartitionKey, element: T) -> Result<()> {
        ensure_state(&self.id, self.state, BlockState::Open, "write")?;
        self.scratch.clear();
        self.codec.encode(&element, &mut self.scratch)?;
        self.frame.clear();
        let written = encode_frame(key, &self.scratch, &mut self.frame)?;
        self.crc.update(key.0, &self.scratch);
        self.out
            .as_mut()
            .ok_or(SpillwayError::Corruption("block file already closed"))?
            .write_all(&self.frame)?;
        *self.sizes.entry(key).or_insert(0) += written as u64;
        Ok(())
    }

    fn commit_partitions(&mut self) -> Result<()> {
        ensure_state(&self.id, self.state, BlockState::Open, "commit partitions of")?;
        self.writer()?.flush()?;
        Ok(())
    }

    fn commit(&mut self) -> Result<Option<PartitionSizes>> {
        ensure_state(&self.id, self.state, BlockState::Open, "commit")?;
        if let Some(mut out) = self.out.take() {
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        self.state = BlockState::Committed;
        debug!(
            block = %self.id,
            bytes = total_size(&self.sizes),
            checksum = self.crc.finalize(),
            "block file committed"
        );
        Ok(Some(self.sizes.clone()))
    }

    fn mark_spilled(&mut self) -> Result<()> {
        ensure_state(&self.id, self.state, BlockState::Open, "spill")?;
        self.out = None;
        self.sizes.clear();
        self.crc.reset();
        self.state = BlockState::Spilled;
        fs::remove_file(&self.path)?;
        Ok(())
    }

    fn read_partition(&self, key: PartitionKey) -> Result<Vec<T>> {
        ensure_state(&self.id, self.state, BlockState::Committed, "read")?;
        let bytes = fs::read(&self.path)?;
        decode_frames(&bytes)?
            .into_iter()
            .filter(|(k, _)| *k == key)
            .map(|(_, payload)| self.codec.decode(payload))
            .collect()
    }

    fn location(&self) -> Option<&Path> {
        Some(&self.path)
    }
}
