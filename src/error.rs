use thiserror::Error;
use std::path::PathBuf;

#[derive(Debug, Error)]
pub enum ZsyncError {
    #[error("Allocation failed")]
    AllocationFailed,

    #[error("Hash table not allocated")]
    HashTableNotAllocated,

    #[error("Checksum block buffer too short: {0} bytes")]
    InvalidChecksumBlocks(usize),

    #[error("Checksum block buffer truncated at block {block}: {source}")]
    ChecksumBlocksIo {
        block: u32,
        source: std::io::Error,
    },

    #[error("Seed file not found: {0}")]
    SourceFileNotFound(PathBuf),

    #[error("No permission to read seed file: {0}")]
    SourceFilePermissionDenied(PathBuf),

    #[error("Cannot open seed file {path}: {source}")]
    SourceFileOpenFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Checksum mismatch for fetched block {0}")]
    BlockChecksumMismatch(u32),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
