use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Locally installed file used to seed the reconstruction
    #[arg(value_name = "SEED")]
    pub seed: PathBuf,

    /// New release to reconstruct from the seed
    #[arg(value_name = "NEW")]
    pub new: PathBuf,

    /// Where to write the reconstructed file
    #[arg(value_name = "OUTPUT")]
    pub output: PathBuf,

    /// Block size in bytes (power of two)
    #[arg(long, default_value_t = 2048)]
    pub block_size: u32,

    /// Weak checksum bytes kept per block (1-4)
    #[arg(long, default_value_t = 4)]
    pub weak_bytes: u8,

    /// Strong checksum bytes kept per block (1-16)
    #[arg(long, default_value_t = 8)]
    pub strong_bytes: u8,

    /// Consecutive blocks required for an index hit (1-2)
    #[arg(long, default_value_t = 2)]
    pub seq_matches: u8,

    /// Number of parallel matching jobs
    #[arg(short = 'j', long, default_value_t = 4)]
    pub jobs: usize,

    /// Show progress during matching
    #[arg(short = 'P', long, default_value_t = true)]
    pub progress: bool,

    /// Suppress non-error messages
    #[arg(short, long, default_value_t = false)]
    pub quiet: bool,

    /// Increase verbosity
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}
