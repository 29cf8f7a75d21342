use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::errors::{EngineError, Result};
use crate::utils::hash::sanitize_hash;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HashFunction {
    Sha1,
    Sha256,
}

/// Immutable descriptor of the expected size and hashes of one file.
/// Builders return new copies; an empty descriptor is "redundant", meaning
/// no validation was requested (which is not the same as validation having
/// passed; callers that care must check `is_redundant` separately).
#[derive(Clone, Debug, Default)]
pub struct FileValidation {
    expected_size: Option<u64>,
    hashes: Vec<(HashFunction, String)>,
}

impl FileValidation {
    pub fn of() -> Self {
        Self::default()
    }

    pub fn with_expected_size(&self, size: u64) -> FileValidation {
        let mut next = self.clone();
        next.expected_size = Some(size);
        next
    }

    pub fn with_hash(&self, function: HashFunction, hash: impl Into<String>) -> Result<FileValidation> {
        if self.hashes.iter().any(|(existing, _)| *existing == function) {
            return Err(EngineError::illegal_state(format!(
                "hash function {function:?} already configured"
            )));
        }
        let hash = hash.into();
        let normalized = sanitize_hash(&hash).ok_or_else(|| {
            EngineError::illegal_state(format!("'{hash}' is not a usable hex digest"))
        })?;
        let mut next = self.clone();
        next.hashes.push((function, normalized));
        Ok(next)
    }

    pub fn is_redundant(&self) -> bool {
        self.expected_size.is_none() && self.hashes.is_empty()
    }

    pub fn expected_size(&self) -> Option<u64> {
        self.expected_size
    }

    pub fn expected_hash(&self, function: HashFunction) -> Option<&str> {
        self.hashes
            .iter()
            .find(|(existing, _)| *existing == function)
            .map(|(_, hash)| hash.as_str())
    }

    /// Validates the file at `path`. Computes every requested hash function
    /// in a single pass over the file; a missing file fails (unless the
    /// validation is redundant, which trivially passes).
    pub fn validate(&self, path: &Path) -> Result<bool> {
        if self.is_redundant() {
            return Ok(true);
        }
        if !path.is_file() {
            return Ok(false);
        }

        if let Some(expected) = self.expected_size {
            let actual = std::fs::metadata(path)?.len();
            if actual != expected {
                return Ok(false);
            }
        }

        if self.hashes.is_empty() {
            return Ok(true);
        }

        let computed = compute_hashes(path, &self.hashes)?;
        for ((_, expected), actual) in self.hashes.iter().zip(computed.iter()) {
            if expected != actual {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn compute_hashes(path: &Path, requested: &[(HashFunction, String)]) -> Result<Vec<String>> {
    let mut sha1 = requested
        .iter()
        .any(|(function, _)| *function == HashFunction::Sha1)
        .then(Sha1::new);
    let mut sha256 = requested
        .iter()
        .any(|(function, _)| *function == HashFunction::Sha256)
        .then(Sha256::new);

    let mut file = File::open(path)?;
    let mut buffer = vec![0_u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        if let Some(hasher) = sha1.as_mut() {
            hasher.update(&buffer[..read]);
        }
        if let Some(hasher) = sha256.as_mut() {
            hasher.update(&buffer[..read]);
        }
    }

    let sha1_hex = sha1.map(|hasher| hex::encode(hasher.finalize()));
    let sha256_hex = sha256.map(|hasher| hex::encode(hasher.finalize()));

    Ok(requested
        .iter()
        .map(|(function, _)| match function {
            HashFunction::Sha1 => sha1_hex.clone().unwrap_or_default(),
            HashFunction::Sha256 => sha256_hex.clone().unwrap_or_default(),
        })
        .collect())
}

/// File validation plus the HTTP conditional-request hints a download task
/// may use to short-circuit a transfer.
#[derive(Clone, Debug, Default)]
pub struct DownloadValidation {
    pub validation: FileValidation,
    pub use_etag: bool,
    pub use_last_modified: bool,
}

impl DownloadValidation {
    pub fn of(validation: FileValidation) -> Self {
        Self {
            validation,
            use_etag: false,
            use_last_modified: false,
        }
    }

    pub fn with_etag(&self, use_etag: bool) -> DownloadValidation {
        let mut next = self.clone();
        next.use_etag = use_etag;
        next
    }

    pub fn with_last_modified(&self, use_last_modified: bool) -> DownloadValidation {
        let mut next = self.clone();
        next.use_last_modified = use_last_modified;
        next
    }

    pub fn is_redundant(&self) -> bool {
        self.validation.is_redundant()
    }
}
