//! Stable fingerprints for compilation caching.

use serde::Serialize;

use crate::status::StatusResult;

const FNV1A_OFFSET: u64 = 0xcbf29ce484222325;
const FNV1A_PRIME: u64 = 0x100000001b3;

pub fn fnv1a_init() -> u64 {
    FNV1A_OFFSET
}

pub fn fnv1a_bytes(mut hash: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV1A_PRIME);
    }
    hash
}

pub fn fnv1a_hash(bytes: &[u8]) -> u64 {
    fnv1a_bytes(fnv1a_init(), bytes)
}

/// Incremental FNV-1a over the bincode encoding of each value written.
pub struct Fingerprint {
    hash: u64,
}

impl Fingerprint {
    pub fn new() -> Self {
        Fingerprint { hash: fnv1a_init() }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.hash = fnv1a_bytes(self.hash, bytes);
    }

    pub fn write_str(&mut self, value: &str) {
        self.write_bytes(&(value.len() as u64).to_le_bytes());
        self.write_bytes(value.as_bytes());
    }

    pub fn write_serializable<T: Serialize + ?Sized>(&mut self, value: &T) -> StatusResult<()> {
        let bytes = bincode::serialize(value)?;
        self.write_bytes(&bytes);
        Ok(())
    }

    pub fn finish(&self) -> u64 {
        self.hash
    }
}

impl Default for Fingerprint {
    fn default() -> Self {
        Self::new()
    }
}

pub fn hash_serializable<T: Serialize + ?Sized>(value: &T) -> StatusResult<u64> {
    let mut fingerprint = Fingerprint::new();
    fingerprint.write_serializable(value)?;
    Ok(fingerprint.finish())
}
