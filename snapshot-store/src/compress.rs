//! Compression and binary encoding for checkpoint snapshot payloads.
//!
//! Encoding uses `serde_json` rather than `bincode`: the payloads passing
//! through here (`Session`, with its `#[serde(untagged)]` `Content` and
//! internally-tagged `ContentPart`/`ImageRef`) need a self-describing
//! format, and `bincode` 1.x has no `deserialize_any` support, which those
//! representations require. `serde_json` is already a dependency of this
//! crate and of every caller; the zstd/lz4 pass still does the actual size
//! work, so the switch from a binary to a textual pre-compression
//! representation costs little once compressed.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Codec {
    #[error("json encode/decode failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("zstd compression failed: {0}")]
    Zstd(#[source] std::io::Error),

    #[error("lz4 compression failed: {0}")]
    Lz4(#[source] std::io::Error),
}

/// Which compressor to apply to an encoded payload.
///
/// `Zstd` favors ratio over speed and is used for the full flattened
/// checkpoint snapshot, written off the critical path by the checkpoint
/// worker. `Lz4` favors speed and is used for the session store's optional
/// binary form of large message payloads (spec §2 "optional binary
/// compressed form for large payloads"), which may be written on a path the
/// caller is awaiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Zstd { level: i32 },
    Lz4,
}

impl Default for Compression {
    fn default() -> Self {
        Compression::Zstd { level: 3 }
    }
}

/// Serialize `value` with `serde_json` and compress the result.
pub fn encode<T: Serialize>(value: &T, compression: Compression) -> Result<Vec<u8>, Codec> {
    let raw = serde_json::to_vec(value)?;
    match compression {
        Compression::Zstd { level } => zstd::encode_all(raw.as_slice(), level).map_err(Codec::Zstd),
        Compression::Lz4 => {
            let mut out = Vec::new();
            let mut encoder = lz4::EncoderBuilder::new()
                .build(&mut out)
                .map_err(Codec::Lz4)?;
            std::io::copy(&mut raw.as_slice(), &mut encoder).map_err(Codec::Lz4)?;
            let (_, result) = encoder.finish();
            result.map_err(Codec::Lz4)?;
            Ok(out)
        }
    }
}

/// Reverse of [`encode`]: decompress then deserialize with `serde_json`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8], compression: Compression) -> Result<T, Codec> {
    let raw = match compression {
        Compression::Zstd { .. } => zstd::decode_all(bytes).map_err(Codec::Zstd)?,
        Compression::Lz4 => {
            let mut decoder = lz4::Decoder::new(bytes).map_err(Codec::Lz4)?;
            let mut out = Vec::new();
            std::io::copy(&mut decoder, &mut out).map_err(Codec::Lz4)?;
            out
        }
    };
    Ok(serde_json::from_slice(&raw)?)
}
