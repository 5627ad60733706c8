use crate::error::ZsyncError;
use crate::Result;
use super::rsum::Rsum;
use super::{BlockId, BIT_HASH_BITS};
use byteorder::{BigEndian, ByteOrder};
use std::io::{Cursor, Read};

/// Per-block record: the weak checksum pair, the truncated strong checksum
/// and the chain link used by the rsum index. Links are block ids, so a
/// reallocation of the entry array can never leave a dangling chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashEntry {
    pub r: Rsum,
    pub checksum: [u8; 16],
    next: Option<BlockId>,
}

/// Hash-indexed view of the target file's per-block checksums.
///
/// Two tiers: `bit_map` answers most negative lookups with one bit probe,
/// `buckets` heads the chains that survive it. The entry array carries
/// `seq_matches` zeroed slack entries at the end so the pair probe for the
/// last block reads a harmless zero record instead of walking off the end.
pub struct BlockIndex {
    entries: Vec<HashEntry>,
    blocks: BlockId,
    seq_matches: u8,
    weak_bytes: u8,
    strong_bytes: u8,
    weak_mask: u16,
    buckets: Vec<Option<BlockId>>,
    bit_map: Vec<u8>,
    hash_mask: u32,
    bit_hash_mask: u32,
    rover: Option<BlockId>,
}

impl BlockIndex {
    pub fn new(blocks: BlockId, seq_matches: u8, weak_bytes: u8, strong_bytes: u8) -> Result<Self> {
        let total = blocks as usize + seq_matches as usize;
        let mut entries = Vec::new();
        entries
            .try_reserve_exact(total)
            .map_err(|_| ZsyncError::AllocationFailed)?;
        entries.resize(total, HashEntry::default());

        // Only the low `weak_bytes` of the 32-bit rsum are significant on the
        // wire; widths 1 and 2 leave nothing of `a` to compare.
        let weak_mask = match weak_bytes {
            3 => 0x00ff,
            4 => 0xffff,
            _ => 0,
        };

        Ok(Self {
            entries,
            blocks,
            seq_matches,
            weak_bytes,
            strong_bytes,
            weak_mask,
            buckets: Vec::new(),
            bit_map: Vec::new(),
            hash_mask: 0,
            bit_hash_mask: 0,
            rover: None,
        })
    }

    pub fn blocks(&self) -> BlockId {
        self.blocks
    }

    pub fn weak_mask(&self) -> u16 {
        self.weak_mask
    }

    pub fn entry(&self, id: usize) -> &HashEntry {
        &self.entries[id]
    }

    /// The significant prefix of a block's strong checksum.
    pub fn checksum_prefix(&self, id: BlockId) -> &[u8] {
        &self.entries[id as usize].checksum[..self.strong_bytes as usize]
    }

    /// Fill the entry array from the raw checksum-block buffer: `blocks`
    /// records of `weak_bytes + strong_bytes` bytes in block-id order, the
    /// rsum aligned to the low bytes of a 4-byte big-endian field.
    pub fn parse_checksum_blocks(&mut self, buf: &[u8]) -> Result<()> {
        if self.entries.is_empty() {
            return Err(ZsyncError::HashTableNotAllocated);
        }
        let record_len = self.weak_bytes as usize + self.strong_bytes as usize;
        if buf.len() < record_len {
            return Err(ZsyncError::InvalidChecksumBlocks(buf.len()));
        }

        let mut reader = Cursor::new(buf);
        for id in 0..self.blocks {
            let mut raw = [0u8; 4];
            let mut checksum = [0u8; 16];
            reader
                .read_exact(&mut raw[4 - self.weak_bytes as usize..])
                .and_then(|_| reader.read_exact(&mut checksum[..self.strong_bytes as usize]))
                .map_err(|source| ZsyncError::ChecksumBlocksIo { block: id, source })?;

            // wire order is big endian: a in the high half, b in the low half
            let a = BigEndian::read_u16(&raw[0..2]);
            let b = BigEndian::read_u16(&raw[2..4]);

            let entry = &mut self.entries[id as usize];
            entry.r = Rsum {
                a: a & self.weak_mask,
                b,
            };
            entry.checksum = checksum;
            entry.next = None;
        }

        // fresh checksums invalidate any previously built index
        self.buckets = Vec::new();
        self.bit_map = Vec::new();
        self.rover = None;
        Ok(())
    }

    pub fn is_built(&self) -> bool {
        !self.buckets.is_empty()
    }

    /// Build the two-tier index over the parsed entries.
    pub fn build(&mut self) -> Result<()> {
        if self.entries.is_empty() {
            return Err(ZsyncError::HashTableNotAllocated);
        }

        // Smallest k in [4, 16] with 2^k covering the block count; the bucket
        // array holds 2^(k+1) chains.
        let mut k = 4u32;
        while k < 16 && (1u32 << k) < self.blocks {
            k += 1;
        }
        self.hash_mask = (2u32 << k) - 1;
        self.bit_hash_mask = (2u32 << (k + BIT_HASH_BITS)) - 1;

        let bucket_count = self.hash_mask as usize + 1;
        let mut buckets: Vec<Option<BlockId>> = Vec::new();
        buckets
            .try_reserve_exact(bucket_count)
            .map_err(|_| ZsyncError::AllocationFailed)?;
        buckets.resize(bucket_count, None);

        let byte_count = (self.bit_hash_mask >> 3) as usize + 1;
        let mut bit_map: Vec<u8> = Vec::new();
        bit_map
            .try_reserve_exact(byte_count)
            .map_err(|_| ZsyncError::AllocationFailed)?;
        bit_map.resize(byte_count, 0);

        self.buckets = buckets;
        self.bit_map = bit_map;

        // Insert in reverse block order: chains are built by prepending, so
        // this leaves every chain in ascending id order and identical blocks
        // get written out sequentially later.
        for id in (0..self.blocks).rev() {
            let h = self.entry_hash(id as usize);
            let slot = (h & self.hash_mask) as usize;
            self.entries[id as usize].next = self.buckets[slot];
            self.buckets[slot] = Some(id);

            let bit = h & self.bit_hash_mask;
            self.bit_map[(bit >> 3) as usize] |= 1 << (bit & 7);
        }
        Ok(())
    }

    /// Index hash of the entry at `id`. With sequential matching the
    /// following block's `b` sum is folded in, which keeps runs of
    /// adjacent target blocks in distinct chains.
    fn entry_hash(&self, id: usize) -> u32 {
        let e = &self.entries[id];
        let high = if self.seq_matches > 1 {
            self.entries[id + 1].r.b as u32
        } else {
            (e.r.a & self.weak_mask) as u32
        };
        (e.r.b as u32) ^ (high << BIT_HASH_BITS)
    }

    /// Head of the chain for a window hash, or `None` after the fast
    /// bitmap rejection.
    pub fn bucket_head(&self, hash: u32) -> Option<BlockId> {
        if self.buckets.is_empty() {
            return None;
        }
        let bit = hash & self.bit_hash_mask;
        if self.bit_map[(bit >> 3) as usize] & (1 << (hash & 7)) == 0 {
            return None;
        }
        // the bitmap said maybe; the bucket decides
        self.buckets[(hash & self.hash_mask) as usize]
    }

    /// Start a chain walk at `head`. The walk position (rover) lives on the
    /// index so that `remove` can advance it past a deleted entry while the
    /// walk is in progress.
    pub fn begin_walk(&mut self, head: BlockId) {
        self.rover = Some(head);
    }

    /// Next entry of the current walk; with `only_one` the walk ends after
    /// the entry it was started on.
    pub fn walk_next(&mut self, only_one: bool) -> Option<BlockId> {
        let cur = self.rover?;
        self.rover = if only_one {
            None
        } else {
            self.entries[cur as usize].next
        };
        Some(cur)
    }

    /// Unlink a block from its chain so it cannot match again.
    pub fn remove(&mut self, id: BlockId) {
        if self.buckets.is_empty() {
            return;
        }
        let slot = (self.entry_hash(id as usize) & self.hash_mask) as usize;

        let mut prev: Option<BlockId> = None;
        let mut cur = self.buckets[slot];
        while let Some(c) = cur {
            if c == id {
                if self.rover == Some(id) {
                    self.rover = self.entries[id as usize].next;
                }
                let next = self.entries[id as usize].next;
                match prev {
                    None => self.buckets[slot] = next,
                    Some(p) => self.entries[p as usize].next = next,
                }
                return;
            }
            prev = Some(c);
            cur = self.entries[c as usize].next;
        }
    }
}
