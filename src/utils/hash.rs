use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::errors::Result;

const BUFFER_SIZE: usize = 1024 * 1024;

pub fn compute_sha1_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buffer = vec![0_u8; BUFFER_SIZE];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn compute_sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0_u8; BUFFER_SIZE];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Lowercases and checks a hex hash string, rejecting anything too short to
/// be a real digest.
pub fn sanitize_hash(hash: &str) -> Option<String> {
    let normalized = hash.trim().to_ascii_lowercase();
    if normalized.len() < 8 {
        return None;
    }
    if !normalized.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return None;
    }
    Some(normalized)
}

/// A SHA-1 digest is exactly 160 bits, 40 hex characters.
pub fn is_sha1_hex(hash: &str) -> bool {
    hash.len() == 40 && hash.chars().all(|ch| ch.is_ascii_hexdigit())
}
