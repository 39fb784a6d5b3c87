use rvs_types::Compression;

use crate::error::{StoreError, StoreResult};

/// Byte transform applied to payloads at rest.
///
/// Stores never look inside a payload; they only route it through the
/// codec named by the entry's [`Compression`] tag.
pub trait Codec: Send + Sync {
    fn compress(&self, data: &[u8]) -> StoreResult<Vec<u8>>;

    /// Decompress `data`. `expected_len` is a size hint and is checked when given.
    fn decompress(&self, data: &[u8], expected_len: Option<usize>) -> StoreResult<Vec<u8>>;
}

/// Pass-through codec.
pub struct Identity;

impl Codec for Identity {
    fn compress(&self, data: &[u8]) -> StoreResult<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8], expected_len: Option<usize>) -> StoreResult<Vec<u8>> {
        check_len(data.to_vec(), expected_len)
    }
}

/// zstd codec at a fixed level.
pub struct Zstd {
    level: i32,
}

impl Zstd {
    pub const DEFAULT_LEVEL: i32 = 3;
}

impl Codec for Zstd {
    fn compress(&self, data: &[u8]) -> StoreResult<Vec<u8>> {
        zstd::encode_all(data, self.level).map_err(|e| StoreError::Compression(e.to_string()))
    }

    fn decompress(&self, data: &[u8], expected_len: Option<usize>) -> StoreResult<Vec<u8>> {
        let out = zstd::decode_all(data).map_err(|e| StoreError::Compression(e.to_string()))?;
        check_len(out, expected_len)
    }
}

static IDENTITY: Identity = Identity;
static ZSTD: Zstd = Zstd {
    level: Zstd::DEFAULT_LEVEL,
};

/// The codec registered for a compression tag.
pub fn codec_for(compression: Compression) -> &'static dyn Codec {
    match compression {
        Compression::None => &IDENTITY,
        Compression::Zstd => &ZSTD,
    }
}

fn check_len(data: Vec<u8>, expected_len: Option<usize>) -> StoreResult<Vec<u8>> {
    match expected_len {
        Some(expected) if expected != data.len() => Err(StoreError::Compression(format!(
            "size mismatch: expected {expected}, got {}",
            data.len()
        ))),
        _ => Ok(data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_roundtrip() {
        let codec = codec_for(Compression::None);
        let packed = codec.compress(b"plain").unwrap();
        assert_eq!(packed, b"plain");
        assert_eq!(codec.decompress(&packed, Some(5)).unwrap(), b"plain");
    }

    #[test]
    fn zstd_shrinks_repetitive_data() {
        let data = vec![0xABu8; 100_000];
        let codec = codec_for(Compression::Zstd);
        let packed = codec.compress(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(codec.decompress(&packed, Some(data.len())).unwrap(), data);
    }

    #[test]
    fn size_mismatch_is_an_error() {
        let codec = codec_for(Compression::None);
        let err = codec.decompress(b"abc", Some(4)).unwrap_err();
        assert!(err.is_corrupt());
    }

    #[test]
    fn zstd_rejects_garbage() {
        let err = codec_for(Compression::Zstd)
            .decompress(b"not a zstd frame", None)
            .unwrap_err();
        assert!(matches!(err, StoreError::Compression(_)));
    }
}
