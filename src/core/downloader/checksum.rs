use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::core::error::{EngineError, EngineResult};

/// Hash algorithms accepted in recipe and component checksums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    fn hex_len(self) -> usize {
        match self {
            HashAlgorithm::Md5 => 32,
            HashAlgorithm::Sha1 => 40,
            HashAlgorithm::Sha256 => 64,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashAlgorithm::Md5 => write!(f, "md5"),
            HashAlgorithm::Sha1 => write!(f, "sha1"),
            HashAlgorithm::Sha256 => write!(f, "sha256"),
        }
    }
}

/// A declared content hash, written as `algorithm:hex` (e.g. `sha256:9f86…`).
///
/// A bare hex string is accepted too; the algorithm is inferred from its
/// length. Hex digits are normalized to lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checksum {
    pub algorithm: HashAlgorithm,
    pub hex: String,
}

impl Checksum {
    pub fn new(algorithm: HashAlgorithm, hex: impl Into<String>) -> Self {
        Self {
            algorithm,
            hex: hex.into().to_ascii_lowercase(),
        }
    }

    pub fn parse(raw: &str) -> EngineResult<Self> {
        let raw = raw.trim();
        let (algorithm, hex) = match raw.split_once(':') {
            Some((algo, hex)) => {
                let algorithm = match algo.to_ascii_lowercase().as_str() {
                    "md5" => HashAlgorithm::Md5,
                    "sha1" => HashAlgorithm::Sha1,
                    "sha256" => HashAlgorithm::Sha256,
                    other => {
                        return Err(EngineError::InvalidChecksum(format!(
                            "unsupported algorithm '{}' in {}",
                            other, raw
                        )))
                    }
                };
                (algorithm, hex)
            }
            None => {
                let algorithm = match raw.len() {
                    32 => HashAlgorithm::Md5,
                    40 => HashAlgorithm::Sha1,
                    64 => HashAlgorithm::Sha256,
                    _ => {
                        return Err(EngineError::InvalidChecksum(format!(
                            "cannot infer algorithm for {}",
                            raw
                        )))
                    }
                };
                (algorithm, raw)
            }
        };

        if hex.len() != algorithm.hex_len() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(EngineError::InvalidChecksum(raw.to_string()));
        }

        Ok(Self::new(algorithm, hex))
    }

    /// Hash `path` with this checksum's algorithm.
    pub fn compute(algorithm: HashAlgorithm, path: &Path) -> EngineResult<String> {
        let file = File::open(path).map_err(|e| EngineError::io(path, e))?;
        let hex = match algorithm {
            HashAlgorithm::Md5 => hash_reader::<Md5>(file),
            HashAlgorithm::Sha1 => hash_reader::<Sha1>(file),
            HashAlgorithm::Sha256 => hash_reader::<Sha256>(file),
        };
        hex.map_err(|e| EngineError::io(path, e))
    }

    /// Compute the sha256 of a file as a `Checksum`.
    pub fn sha256_of(path: &Path) -> EngineResult<Self> {
        Ok(Self::new(
            HashAlgorithm::Sha256,
            Self::compute(HashAlgorithm::Sha256, path)?,
        ))
    }

    /// Fails with `ChecksumMismatch` when the file does not hash to `self`.
    pub fn verify_file(&self, path: &Path) -> EngineResult<()> {
        let actual = Self::compute(self.algorithm, path)?;
        if actual.eq_ignore_ascii_case(&self.hex) {
            Ok(())
        } else {
            Err(EngineError::ChecksumMismatch {
                path: path.to_path_buf(),
                algorithm: self.algorithm.to_string(),
                expected: self.hex.clone(),
                actual,
            })
        }
    }
}

fn hash_reader<D: Digest>(mut reader: impl Read) -> std::io::Result<String> {
    let mut hasher = D::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Checksum {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Checksum {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Checksum> for String {
    fn from(value: Checksum) -> Self {
        value.to_string()
    }
}
