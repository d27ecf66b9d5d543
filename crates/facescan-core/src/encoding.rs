//! Versioned binary encoding for feature vectors.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! | magic "FSFV" (4) | version (1) | count n: u32 (4) | n × f32 (4n) | sha256 of the preceding bytes (32) |
//! ```
//!
//! Components are stored as raw IEEE-754 bits, so decoding reproduces the
//! encoded vector exactly. Decoding never deserializes anything but floats.

use crate::types::FeatureVector;
use sha2::{Digest, Sha256};
use thiserror::Error;

const MAGIC: &[u8; 4] = b"FSFV";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 4 + 1 + 4;
const DIGEST_LEN: usize = 32;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EncodingError {
    #[error("encoded vector truncated: {0} bytes")]
    Truncated(usize),
    #[error("bad magic bytes: not a feature vector blob")]
    BadMagic,
    #[error("unsupported encoding version {0}")]
    UnsupportedVersion(u8),
    #[error("length mismatch: header declares {declared} components, payload holds {actual} bytes")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("checksum mismatch: blob is corrupted")]
    ChecksumMismatch,
    #[error("component {0} is not a finite number")]
    NonFinite(usize),
}

/// Serialize a vector into the versioned blob format.
pub fn encode(vector: &FeatureVector) -> Vec<u8> {
    let values = vector.as_slice();
    let mut buf = Vec::with_capacity(HEADER_LEN + values.len() * 4 + DIGEST_LEN);
    buf.extend_from_slice(MAGIC);
    buf.push(FORMAT_VERSION);
    buf.extend_from_slice(&(values.len() as u32).to_le_bytes());
    for v in values {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    let digest = Sha256::digest(&buf);
    buf.extend_from_slice(&digest);
    buf
}

/// Parse a blob produced by [`encode`].
pub fn decode(bytes: &[u8]) -> Result<FeatureVector, EncodingError> {
    if bytes.len() < HEADER_LEN + DIGEST_LEN {
        return Err(EncodingError::Truncated(bytes.len()));
    }
    if &bytes[..4] != MAGIC {
        return Err(EncodingError::BadMagic);
    }
    if bytes[4] != FORMAT_VERSION {
        return Err(EncodingError::UnsupportedVersion(bytes[4]));
    }

    let declared = u32::from_le_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) as usize;
    let payload_len = bytes.len() - HEADER_LEN - DIGEST_LEN;
    if declared.checked_mul(4) != Some(payload_len) {
        return Err(EncodingError::LengthMismatch {
            declared,
            actual: payload_len,
        });
    }

    let (body, digest) = bytes.split_at(bytes.len() - DIGEST_LEN);
    if Sha256::digest(body).as_slice() != digest {
        return Err(EncodingError::ChecksumMismatch);
    }

    let mut values = Vec::with_capacity(declared);
    for (i, chunk) in body[HEADER_LEN..].chunks_exact(4).enumerate() {
        let v = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        if !v.is_finite() {
            return Err(EncodingError::NonFinite(i));
        }
        values.push(v);
    }

    Ok(FeatureVector::new(values))
}
