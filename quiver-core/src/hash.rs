//! Content addresses and chunks.
//!
//! A [`Ref`] is the first 20 bytes of the SHA-512 digest of a chunk's bytes.
//! A [`Chunk`] pairs those bytes with their ref so the hash is computed once.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

use crate::error::{Error, Result};

/// Content hash addressing a chunk.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ref([u8; Ref::LEN]);

impl Ref {
    pub const LEN: usize = 20;

    /// Hash `data` into a ref.
    pub fn of(data: &[u8]) -> Ref {
        let digest = Sha512::digest(data);
        let mut bytes = [0u8; Ref::LEN];
        bytes.copy_from_slice(&digest[..Ref::LEN]);
        Ref(bytes)
    }

    pub fn from_bytes(bytes: [u8; Ref::LEN]) -> Ref {
        Ref(bytes)
    }

    /// Parse a ref stored as raw bytes (e.g. a child pointer in a meta node).
    pub fn from_slice(bytes: &[u8]) -> Result<Ref> {
        let array: [u8; Ref::LEN] = bytes.try_into().map_err(|_| {
            Error::CorruptEncoding(format!(
                "ref must be {} bytes, got {}",
                Ref::LEN,
                bytes.len()
            ))
        })?;
        Ok(Ref(array))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short form used in log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ref({})", self.short())
    }
}

impl FromStr for Ref {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)?;
        Ref::from_slice(&bytes)
    }
}

/// An immutable blob together with its content address.
#[derive(Clone, PartialEq, Eq)]
pub struct Chunk {
    hash: Ref,
    data: Arc<[u8]>,
}

impl Chunk {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Chunk {
        let data = data.into();
        Chunk {
            hash: Ref::of(&data),
            data,
        }
    }

    /// Rebuild a chunk read back from a backend, verifying its address.
    pub fn from_stored(hash: Ref, data: impl Into<Arc<[u8]>>) -> Result<Chunk> {
        let chunk = Chunk::new(data);
        if chunk.hash != hash {
            return Err(Error::CorruptEncoding(format!(
                "chunk stored under {} hashes to {}",
                hash, chunk.hash
            )));
        }
        Ok(chunk)
    }

    pub fn hash(&self) -> Ref {
        self.hash
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("hash", &self.hash)
            .field("len", &self.data.len())
            .finish()
    }
}
