use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::types::{frame_crc32, PartitionKey, Result, SpillwayError};

/// Bytes preceding every framed record: partition, length, crc.
pub const FRAME_HEADER_LEN: usize = 12;

/// Converts elements to and from bytes for serialized and file stores.
pub trait Codec<T>: Send + Sync {
    /// Appends the encoding of `value` to `out`.
    fn encode(&self, value: &T, out: &mut Vec<u8>) -> Result<()>;

    /// Decodes one value from exactly `bytes`.
    fn decode(&self, bytes: &[u8]) -> Result<T>;
}

/// JSON encoding through serde.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    /// Creates the codec.
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Serialize + DeserializeOwned> Codec<T> for JsonCodec<T> {
    fn encode(&self, value: &T, out: &mut Vec<u8>) -> Result<()> {
        serde_json::to_writer(out, value).map_err(|err| SpillwayError::Codec(err.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|err| SpillwayError::Codec(err.to_string()))
    }
}

/// Appends one framed record and returns the number of bytes written.
pub fn encode_frame(key: PartitionKey, payload: &[u8], out: &mut Vec<u8>) -> Result<usize> {
    let len = u32::try_from(payload.len())
        .map_err(|_| SpillwayError::Invalid("record larger than 4 GiB"))?;
    out.reserve(FRAME_HEADER_LEN + payload.len());
    out.extend_from_slice(&key.0.to_be_bytes());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&frame_crc32(key.0, payload).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(FRAME_HEADER_LEN + payload.len())
}

/// Splits a run of framed records, verifying each checksum.
pub fn decode_frames(mut bytes: &[u8]) -> Result<Vec<(PartitionKey, &[u8])>> {
    let mut frames = Vec::new();
    while !bytes.is_empty() {
        if bytes.len() < FRAME_HEADER_LEN {
            return Err(SpillwayError::Corruption("truncated frame header"));
        }
        let (header, rest) = bytes.split_at(FRAME_HEADER_LEN);
        let key = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let crc = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
        if rest.len() < len {
            return Err(SpillwayError::Corruption("truncated frame payload"));
        }
        let (payload, tail) = rest.split_at(len);
        if frame_crc32(key, payload) != crc {
            return Err(SpillwayError::Corruption("frame checksum mismatch"));
        }
        frames.push((PartitionKey(key), payload));
        bytes = tail;
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_split_back_into_records() -> Result<()> {
        let mut buf = Vec::new();
        let written = encode_frame(PartitionKey(2), b"alpha", &mut buf)?;
        assert_eq!(written, FRAME_HEADER_LEN + 5);
        encode_frame(PartitionKey(7), b"", &mut buf)?;
        let frames = decode_frames(&buf)?;
        assert_eq!(frames, vec![(PartitionKey(2), &b"alpha"[..]), (PartitionKey(7), &b""[..])]);
        Ok(())
    }

    #[test]
    fn corrupted_payload_is_detected() -> Result<()> {
        let mut buf = Vec::new();
        encode_frame(PartitionKey(1), b"payload", &mut buf)?;
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        assert!(matches!(
            decode_frames(&buf),
            Err(SpillwayError::Corruption("frame checksum mismatch"))
        ));
        assert!(decode_frames(&buf[..5]).is_err());
        Ok(())
    }

    #[test]
    fn json_codec_roundtrips_values() -> Result<()> {
        let codec = JsonCodec::<(u32, String)>::new();
        let mut out = Vec::new();
        codec.encode(&(9, "nine".to_owned()), &mut out)?;
        assert_eq!(codec.decode(&out)?, (9, "nine".to_owned()));
        assert!(codec.decode(b"not json").is_err());
        Ok(())
    }
}
