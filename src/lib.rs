pub mod config;
pub mod engine;
pub mod error;
pub mod signature;
pub mod zsync;

pub use error::ZsyncError;
pub type Result<T> = std::result::Result<T, ZsyncError>;
