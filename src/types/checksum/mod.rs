#![forbid(unsafe_code)]

//! CRC helpers for framed block records.

/// Incremental CRC over the records of one block.
pub struct FrameCrc {
    inner: crc32fast::Hasher,
}

impl Default for FrameCrc {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl FrameCrc {
    /// Clears all state fed so far.
    pub fn reset(&mut self) {
        self.inner.reset();
    }

    /// Feeds one record into the running checksum.
    pub fn update(&mut self, partition: u32, payload: &[u8]) {
        self.inner.update(&partition.to_be_bytes());
        self.inner.update(payload);
    }

    /// Returns the checksum of everything fed since the last reset.
    pub fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// Checksum stored in the header of one framed record.
pub fn frame_crc32(partition: u32, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&partition.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}
