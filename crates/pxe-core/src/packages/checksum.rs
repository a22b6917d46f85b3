//! Bundle checksums: MD5 rendered as uppercase hex.

use std::io::Read;
use std::path::Path;

/// Read size used when hashing files.
const HASH_CHUNK_SIZE: usize = 8192;

/// Incremental checksum over a byte stream.
pub struct ChecksumAccumulator {
    context: md5::Context,
    bytes: u64,
}

impl ChecksumAccumulator {
    /// Creates an empty accumulator.
    pub fn new() -> Self {
        Self { context: md5::Context::new(), bytes: 0 }
    }

    /// Feeds a chunk of data.
    pub fn update(&mut self, chunk: &[u8]) {
        self.context.consume(chunk);
        self.bytes += chunk.len() as u64;
    }

    /// Number of bytes fed so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Finishes and returns the uppercase hex digest.
    pub fn finish(self) -> String {
        hex::encode_upper(self.context.compute().0)
    }
}

impl Default for ChecksumAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChecksumAccumulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChecksumAccumulator").field("bytes", &self.bytes).finish_non_exhaustive()
    }
}

/// Computes the checksum of a file without loading it whole.
///
/// # Errors
/// Returns error if the file cannot be read
pub fn file_checksum(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut accumulator = ChecksumAccumulator::new();
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        accumulator.update(&buffer[..read]);
    }
    Ok(accumulator.finish())
}

/// Normalizes a declared checksum for comparison.
pub fn normalize(checksum: &str) -> String {
    checksum.trim().to_ascii_uppercase()
}
