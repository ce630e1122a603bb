//! Checksum parsing and verification for downloaded files
//!
//! Hashes are written `sha256:<hex>`, `blake3:<hex>`, or as bare SHA-256 hex.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Blake3,
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashAlgorithm::Sha256 => write!(f, "sha256"),
            HashAlgorithm::Blake3 => write!(f, "blake3"),
        }
    }
}

/// A hash declared for a file reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedHash {
    pub algorithm: HashAlgorithm,
    pub hex: String,
}

impl ExpectedHash {
    pub fn parse(declared: &str) -> Result<Self> {
        let declared = declared.trim();
        let (algorithm, digest) = match declared.split_once(':') {
            Some(("sha256", digest)) => (HashAlgorithm::Sha256, digest),
            Some(("blake3", digest)) => (HashAlgorithm::Blake3, digest),
            Some(_) => return Err(Error::UnsupportedHash(declared.to_string())),
            None => (HashAlgorithm::Sha256, declared),
        };

        if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::UnsupportedHash(declared.to_string()));
        }

        Ok(Self {
            algorithm,
            hex: digest.to_ascii_lowercase(),
        })
    }

    pub fn hasher(&self) -> StreamingHasher {
        StreamingHasher::new(self.algorithm)
    }

    pub fn matches(&self, actual_hex: &str) -> bool {
        self.hex.eq_ignore_ascii_case(actual_hex)
    }
}

impl fmt::Display for ExpectedHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

/// Incremental hasher fed while a download streams
pub enum StreamingHasher {
    Sha256(Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl StreamingHasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha256 => StreamingHasher::Sha256(Sha256::new()),
            HashAlgorithm::Blake3 => StreamingHasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            StreamingHasher::Sha256(h) => h.update(bytes),
            StreamingHasher::Blake3(h) => {
                h.update(bytes);
            }
        }
    }

    pub fn finalize_hex(self) -> String {
        match self {
            StreamingHasher::Sha256(h) => hex::encode(h.finalize()),
            StreamingHasher::Blake3(h) => h.finalize().to_hex().to_string(),
        }
    }
}

/// Hash a file on disk
pub fn hash_file(path: &Path, algorithm: HashAlgorithm) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = StreamingHasher::new(algorithm);
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher.finalize_hex())
}
