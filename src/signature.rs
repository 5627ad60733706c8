use crate::zsync::rsum::Rsum;
use crate::zsync::{md4_block, read_full};
use byteorder::{BigEndian, ByteOrder};
use std::io::Read;

/// Compute the per-block checksum records for a target stream.
///
/// Output is the exact wire format the job parser consumes: per block,
/// `weak_bytes` low bytes of the big-endian 4-byte rsum field (`a` in the
/// high half, `b` in the low half) followed by the first `strong_bytes`
/// bytes of the block's MD4. The last block is zero-padded to a full block
/// before both checksums. Returns the buffer and the block count.
pub fn build_checksum_blocks<R: Read>(
    reader: &mut R,
    block_size: u32,
    weak_bytes: u8,
    strong_bytes: u8,
) -> std::io::Result<(Vec<u8>, u32)> {
    let bs = block_size as usize;
    let mut block = vec![0u8; bs];
    let mut out = Vec::new();
    let mut blocks = 0u32;

    loop {
        let n = read_full(reader, &mut block)?;
        if n == 0 {
            break;
        }
        block[n..].fill(0);

        let r = Rsum::of_block(&block);
        let mut rsum_be = [0u8; 4];
        BigEndian::write_u16(&mut rsum_be[0..2], r.a);
        BigEndian::write_u16(&mut rsum_be[2..4], r.b);
        out.extend_from_slice(&rsum_be[4 - weak_bytes as usize..]);
        out.extend_from_slice(&md4_block(&block)[..strong_bytes as usize]);

        blocks += 1;
        if n < bs {
            break;
        }
    }
    Ok((out, blocks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zsync::index::BlockIndex;

    #[test]
    fn test_block_count_and_record_size() {
        let data = vec![7u8; 2500];
        let mut cursor = std::io::Cursor::new(&data);
        let (buf, blocks) = build_checksum_blocks(&mut cursor, 1024, 4, 8).unwrap();

        // 2500 bytes at 1024 per block: two full blocks plus a padded tail
        assert_eq!(blocks, 3);
        assert_eq!(buf.len(), 3 * (4 + 8));
    }

    #[test]
    fn test_roundtrip_through_parser() {
        let mut data = vec![0u8; 2048 + 100];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = (i * 31) as u8;
        }
        let mut cursor = std::io::Cursor::new(&data);
        let (buf, blocks) = build_checksum_blocks(&mut cursor, 1024, 4, 16).unwrap();
        assert_eq!(blocks, 3);

        let mut index = BlockIndex::new(blocks, 1, 4, 16).unwrap();
        index.parse_checksum_blocks(&buf).unwrap();

        // stored records must agree with checksums computed directly
        assert_eq!(index.entry(0).r, Rsum::of_block(&data[0..1024]));
        assert_eq!(index.entry(1).r, Rsum::of_block(&data[1024..2048]));
        assert_eq!(index.checksum_prefix(0), &md4_block(&data[0..1024])[..]);

        let mut tail = data[2048..].to_vec();
        tail.resize(1024, 0);
        assert_eq!(index.entry(2).r, Rsum::of_block(&tail));
        assert_eq!(index.checksum_prefix(2), &md4_block(&tail)[..]);
    }
}
