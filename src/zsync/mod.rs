pub mod index;
pub mod job;
pub mod output;
pub mod ranges;
pub mod rsum;

use md4::{Digest, Md4};
use std::io::{ErrorKind, Read};

/// Block id local to one job; `block_id_offset + id` is the absolute
/// position in the target file.
pub type BlockId = u32;

/// Width of the bitmap oversampling relative to the bucket array.
pub const BIT_HASH_BITS: u32 = 3;

/// Strong checksum of one block. Only a configured prefix of the digest is
/// ever compared or shipped.
pub fn md4_block(block: &[u8]) -> [u8; 16] {
    let digest = Md4::digest(block);
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest);
    out
}

/// Read until `buf` is full or EOF; returns the number of bytes read.
pub(crate) fn read_full<R: Read>(reader: &mut R, mut buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while !buf.is_empty() {
        match reader.read(buf) {
            Ok(0) => break,
            Ok(n) => {
                total += n;
                buf = &mut buf[n..];
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}
