//! MD5 digests over the bytes placed on the wire.

use std::io::Read;
use std::path::Path;

use md5::{Digest, Md5};

use crate::TransferError;

/// Computes MD5 of `data` and returns the lowercase hex digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Computes MD5 of an entire file and returns the lowercase hex digest.
pub fn calculate_file_checksum(path: &Path) -> Result<String, TransferError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
