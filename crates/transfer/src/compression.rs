//! zlib compression of whole files.
//!
//! A compressed file is the original size as 8 little-endian bytes,
//! followed by the zlib stream.

use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::TransferError;

/// Compresses `src` into `dst`. Returns the size of `dst`.
pub fn compress_file(src: &Path, dst: &Path, level: u32) -> Result<u64, TransferError> {
    let mut input = BufReader::new(std::fs::File::open(src)?);
    let original = input.get_ref().metadata()?.len();

    let mut out = BufWriter::new(std::fs::File::create(dst)?);
    out.write_all(&original.to_le_bytes())?;

    let mut encoder = ZlibEncoder::new(out, Compression::new(level.min(9)));
    std::io::copy(&mut input, &mut encoder)?;
    let mut out = encoder.finish()?;
    out.flush()?;

    Ok(std::fs::metadata(dst)?.len())
}

/// Expands `src` into `dst`. Returns the number of bytes written.
///
/// Fails if the stream is corrupt or does not expand to the size recorded
/// in its prefix.
pub fn decompress_file(src: &Path, dst: &Path) -> Result<u64, TransferError> {
    let mut input = BufReader::new(std::fs::File::open(src)?);
    let mut prefix = [0u8; 8];
    input
        .read_exact(&mut prefix)
        .map_err(|e| TransferError::Compression(format!("missing size prefix: {e}")))?;
    let declared = u64::from_le_bytes(prefix);

    let mut decoder = ZlibDecoder::new(input);
    let mut out = BufWriter::new(std::fs::File::create(dst)?);
    let written = std::io::copy(&mut decoder, &mut out)
        .map_err(|e| TransferError::Compression(e.to_string()))?;
    out.flush()?;

    if written != declared {
        return Err(TransferError::Compression(format!(
            "expanded to {written} bytes, prefix says {declared}"
        )));
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn compress_then_expand_restores_file() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("foto.jpg");
        let data = b"camlink ".repeat(500);
        std::fs::write(&src, &data).unwrap();

        let packed = dir.path().join("foto.z");
        let size = compress_file(&src, &packed, 6).unwrap();
        assert!(size < data.len() as u64);

        let prefix = std::fs::read(&packed).unwrap();
        assert_eq!(u64::from_le_bytes(prefix[..8].try_into().unwrap()), 4000);

        let restored = dir.path().join("restored.jpg");
        assert_eq!(decompress_file(&packed, &restored).unwrap(), 4000);
        assert_eq!(std::fs::read(&restored).unwrap(), data);
    }

    #[test]
    fn corrupt_stream_is_rejected() {
        let dir = TempDir::new().unwrap();
        let packed = dir.path().join("bad.z");
        let mut bytes = 10u64.to_le_bytes().to_vec();
        bytes.extend_from_slice(b"definitely not zlib");
        std::fs::write(&packed, bytes).unwrap();

        let err = decompress_file(&packed, &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, TransferError::Compression(_)));
    }

    #[test]
    fn short_prefix_is_rejected() {
        let dir = TempDir::new().unwrap();
        let packed = dir.path().join("short.z");
        std::fs::write(&packed, [1, 2, 3]).unwrap();

        let err = decompress_file(&packed, &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, TransferError::Compression(_)));
    }
}
