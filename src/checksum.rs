//! Content checksums for upload integrity.
//!
//! blake3 over the raw file bytes, lowercase hex. Files are read in
//! [`BLOCK_SIZE`] pieces so memory stays constant regardless of file size.

use std::io::{self, Read};
use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Block size for checksum reads and upload chunks.
pub const BLOCK_SIZE: usize = 1024;

/// Digest of an in-memory buffer.
pub fn digest(data: &[u8]) -> String {
    hex::encode(blake3::hash(data).as_bytes())
}

/// Digest of a reader consumed in `block_size` pieces.
pub fn digest_blocks<R: Read>(mut reader: R, block_size: usize) -> io::Result<String> {
    if block_size == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "block size must be positive"));
    }
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; block_size];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize().as_bytes()))
}

/// Digest of the file at `path`, read in [`BLOCK_SIZE`] blocks.
pub async fn checksum_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; BLOCK_SIZE];
    loop {
        let n = read_block(&mut file, &mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize().as_bytes()))
}

/// Fill `buf` as far as the reader allows. Returns less than `buf.len()`
/// only at end of input.
pub async fn read_block<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
