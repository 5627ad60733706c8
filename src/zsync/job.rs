use crate::error::ZsyncError;
use crate::Result;
use super::index::BlockIndex;
use super::output::TargetFile;
use super::ranges::KnownRanges;
use super::rsum::Rsum;
use super::{md4_block, read_full, BlockId, BIT_HASH_BITS};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Upper bound on the sequential-match count; the strong-checksum memo in
/// the chain probe has exactly this many slots.
pub const MAX_SEQ_MATCHES: u8 = 2;

/// Per-job parameters, as extracted from the control file by the caller.
/// One job owns the disjoint window of `blocks` target blocks starting at
/// absolute block id `block_id_offset`.
#[derive(Debug, Clone, Copy)]
pub struct JobConfig {
    pub block_size: u32,
    pub block_id_offset: BlockId,
    pub blocks: BlockId,
    pub weak_bytes: u8,
    pub strong_bytes: u8,
    pub seq_matches: u8,
}

impl JobConfig {
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(ZsyncError::Config(format!(
                "block size {} is not a power of two",
                self.block_size
            )));
        }
        if !(1..=4).contains(&self.weak_bytes) {
            return Err(ZsyncError::Config(format!(
                "weak checksum width {} out of range 1..=4",
                self.weak_bytes
            )));
        }
        if !(1..=16).contains(&self.strong_bytes) {
            return Err(ZsyncError::Config(format!(
                "strong checksum width {} out of range 1..=16",
                self.strong_bytes
            )));
        }
        if !(1..=MAX_SEQ_MATCHES).contains(&self.seq_matches) {
            return Err(ZsyncError::Config(format!(
                "sequential match count {} not supported (max {})",
                self.seq_matches, MAX_SEQ_MATCHES
            )));
        }
        Ok(())
    }
}

/// A contiguous span of target blocks that must still be fetched, paired
/// with the strong-checksum prefix of every block in it. Block ids are
/// absolute and the span is inclusive, so a range names exactly
/// `checksums.len()` blocks. This is the payload handed to a ranged
/// downloader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredRange {
    pub first_block: BlockId,
    pub last_block: BlockId,
    pub checksums: Vec<Vec<u8>>,
}

impl RequiredRange {
    pub fn block_count(&self) -> u32 {
        self.last_block - self.first_block + 1
    }

    pub fn byte_offset(&self, block_size: u32) -> u64 {
        (self.first_block as u64) << block_size.trailing_zeros()
    }

    pub fn byte_len(&self, block_size: u32) -> u64 {
        (self.block_count() as u64) << block_size.trailing_zeros()
    }
}

/// Outcome of one job run.
#[derive(Debug)]
pub struct JobReport {
    /// Blocks of the target window reconstructed from the seed.
    pub got_blocks: u32,
    /// Spans still to fetch; `None` when the window is complete.
    pub required_ranges: Option<Vec<RequiredRange>>,
    /// The run was interrupted; the report is neutral, not final.
    pub cancelled: bool,
}

/// One restartable block-matching job over one window of the target file.
///
/// The job slides a rolling-checksum window across the seed file, probes the
/// rsum index for candidate blocks, verifies candidates with the truncated
/// strong checksum, writes verified blocks through the shared target handle
/// and tracks them in the known-range set. Afterwards the reporter turns the
/// gaps of that set into the list of ranges to download.
pub struct ZsyncJob {
    config: JobConfig,
    block_shift: u32,
    /// Window context: `block_size * seq_matches` bytes.
    context: usize,
    weak_mask: u16,
    checksum_blocks: Vec<u8>,
    index: BlockIndex,
    ranges: KnownRanges,
    target: Arc<TargetFile>,
    seed_path: PathBuf,
    /// Buffer-head bytes to ignore on the next matcher call, set when a
    /// match jumps past the end of the current buffer.
    skip: usize,
    /// Rolling checksums of the current window and, with sequential
    /// matching, of the block right after it.
    rs: [Rsum; 2],
    /// Entry to probe first on the next position, set while a run of
    /// sequential matches is open.
    next_match: Option<BlockId>,
    cancel: Option<Arc<AtomicBool>>,
}

impl ZsyncJob {
    pub fn new(
        config: JobConfig,
        checksum_blocks: Vec<u8>,
        target: Arc<TargetFile>,
        seed_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        config.validate()?;
        let index = BlockIndex::new(
            config.blocks,
            config.seq_matches,
            config.weak_bytes,
            config.strong_bytes,
        )?;
        Ok(Self {
            block_shift: config.block_size.trailing_zeros(),
            context: (config.block_size * config.seq_matches as u32) as usize,
            weak_mask: index.weak_mask(),
            checksum_blocks,
            index,
            ranges: KnownRanges::new(),
            target,
            seed_path: seed_path.into(),
            skip: 0,
            rs: [Rsum::default(); 2],
            next_match: None,
            cancel: None,
            config,
        })
    }

    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn known_ranges(&self) -> &KnownRanges {
        &self.ranges
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map_or(false, |flag| flag.load(Ordering::Relaxed))
    }

    /// Parse the checksum records, scan the seed file, report what is left.
    pub fn run(&mut self) -> Result<JobReport> {
        self.index.parse_checksum_blocks(&self.checksum_blocks)?;

        let seed = self.open_seed_file()?;
        debug!(
            seed = %self.seed_path.display(),
            offset = self.config.block_id_offset,
            blocks = self.config.blocks,
            "scanning seed file"
        );
        let got_blocks = self.submit_source_file(seed)?;

        if self.is_cancelled() {
            return Ok(JobReport {
                got_blocks,
                required_ranges: None,
                cancelled: true,
            });
        }
        let required_ranges = self.required_ranges();
        Ok(JobReport {
            got_blocks,
            required_ranges,
            cancelled: self.is_cancelled(),
        })
    }

    fn open_seed_file(&self) -> Result<File> {
        let path = &self.seed_path;
        if !path.exists() {
            return Err(ZsyncError::SourceFileNotFound(path.clone()));
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let meta = std::fs::metadata(path).map_err(|source| {
                ZsyncError::SourceFileOpenFailed {
                    path: path.clone(),
                    source,
                }
            })?;
            if meta.permissions().mode() & 0o444 == 0 {
                return Err(ZsyncError::SourceFilePermissionDenied(path.clone()));
            }
        }
        File::open(path).map_err(|source| ZsyncError::SourceFileOpenFailed {
            path: path.clone(),
            source,
        })
    }

    /// Stream the seed file through the matcher in overlapping buffer fills.
    ///
    /// The scratch buffer holds 16 blocks plus one context; every refill
    /// carries the trailing context bytes over to the front so the sliding
    /// window never observes a seam. At EOF the tail is zero-padded by one
    /// context so the window can reach the last real block.
    pub fn submit_source_file(&mut self, mut file: File) -> Result<u32> {
        if !self.index.is_built() {
            self.index.build()?;
        }

        let ctx = self.context;
        let bufsize = self.config.block_size as usize * 16;
        let mut buf = vec![0u8; bufsize + ctx];

        let mut got_blocks = 0u32;
        let mut pos = 0u64;
        let mut first = true;
        let mut eof = false;

        while !eof {
            if self.is_cancelled() {
                break;
            }
            let start = pos;
            let mut len;

            if first {
                len = read_full(&mut file, &mut buf[..bufsize])?;
                pos += len as u64;
                eof = len < bufsize;
                first = false;
                if len == 0 {
                    break;
                }
            } else {
                buf.copy_within(bufsize - ctx..bufsize, 0);
                pos += (bufsize - ctx) as u64;
                let n = read_full(&mut file, &mut buf[ctx..bufsize])?;
                eof = n < bufsize - ctx;
                len = ctx + n;
            }

            if eof {
                buf[len..len + ctx].fill(0);
                len += ctx;
            }

            got_blocks += self.submit_source_data(&buf[..len], start)?;
            trace!(bytes = pos, got_blocks, "seed buffer scanned");
        }
        Ok(got_blocks)
    }

    /// Match one buffer of seed data against the target blocks.
    ///
    /// `offset == 0` marks the start of a stream and resets the matcher
    /// state; otherwise `skip` positions the window and the rolling
    /// checksums carried over from the previous buffer stay valid.
    fn submit_source_data(&mut self, data: &[u8], offset: u64) -> Result<u32> {
        let bs = self.config.block_size as usize;
        let ctx = self.context;
        let seq = self.config.seq_matches;
        let len = data.len();
        let mut got_blocks = 0u32;

        let mut x = if offset != 0 {
            self.skip
        } else {
            self.next_match = None;
            0
        };

        if x > 0 || offset == 0 {
            self.rs[0] = Rsum::of_block(&data[x..x + bs]);
            if seq > 1 {
                self.rs[1] = Rsum::of_block(&data[x + bs..x + 2 * bs]);
            }
        }
        self.skip = 0;

        // The window position only ever lands exactly on len - ctx: the
        // buffers always hold at least one context past the window (skip is
        // strictly smaller than one context) and the match path catches
        // every jump past the buffer end before re-entering the loop.
        loop {
            if x + ctx == len {
                return Ok(got_blocks);
            }

            let mut this_match = 0u32;
            let mut blocks_matched = 0u32;

            // If the previous block matched, test this window against the
            // target block right after that hit before touching the index.
            if seq > 1 {
                if let Some(hint) = self.next_match {
                    this_match = self.check_chain(hint, &data[x..], true)?;
                    if this_match > 0 {
                        blocks_matched = 1;
                    }
                }
            }

            if this_match == 0 {
                // bitmap first (fast negative), then the chained buckets
                let hash = self.window_hash();
                if let Some(head) = self.index.bucket_head(hash) {
                    this_match = self.check_chain(head, &data[x..], false)?;
                    if this_match > 0 {
                        blocks_matched = seq as u32;
                    }
                }
            }
            got_blocks += this_match;

            if blocks_matched > 0 {
                // A hit at x makes a hit at x+1 all but impossible (target
                // blocks sit a multiple of the block size apart), so jump.
                x += bs * if blocks_matched > 1 { 2 } else { 1 };

                if x + ctx > len {
                    // the rsum for the next window is not in this buffer
                    self.skip = x + ctx - len;
                    return Ok(got_blocks);
                }

                if seq > 1 && blocks_matched == 1 {
                    // moved forward one block: its rsum is already tracked
                    self.rs[0] = self.rs[1];
                } else {
                    self.rs[0] = Rsum::of_block(&data[x..x + bs]);
                }
                if seq > 1 {
                    self.rs[1] = Rsum::of_block(&data[x + bs..x + 2 * bs]);
                }
                continue;
            }

            // no hit: slide the window one byte
            let oc = data[x];
            let nc = data[x + bs];
            self.rs[0].roll(oc, nc, self.block_shift);
            if seq > 1 {
                self.rs[1].roll(nc, data[x + 2 * bs], self.block_shift);
            }
            x += 1;
        }
    }

    fn window_hash(&self) -> u32 {
        let high = if self.config.seq_matches > 1 {
            self.rs[1].b as u32
        } else {
            (self.rs[0].a & self.weak_mask) as u32
        };
        (self.rs[0].b as u32) ^ (high << BIT_HASH_BITS)
    }

    /// Probe a hash chain against the window at the head of `data`.
    ///
    /// With `only_one` the probe tests exactly the given entry (the
    /// sequential hint); otherwise it walks the whole chain, so one window
    /// can yield several duplicate target blocks. Verified blocks are
    /// written immediately; the walk survives the entry removals because
    /// the index rover is advanced past deleted entries.
    fn check_chain(&mut self, head: BlockId, data: &[u8], only_one: bool) -> Result<u32> {
        let bs = self.config.block_size as usize;
        let seq = self.config.seq_matches as usize;
        let strong_len = self.config.strong_bytes as usize;
        let blocks = self.config.blocks;
        let rs = self.rs;

        // strong checksums computed lazily, at most once per window offset
        let mut md4_cache: [Option<[u8; 16]>; MAX_SEQ_MATCHES as usize] = [None; 2];
        let mut got_blocks = 0u32;

        // cleared here, re-set below when a run of sequential matches opens
        self.next_match = None;

        self.index.begin_walk(head);
        while let Some(id) = self.index.walk_next(only_one) {
            let entry = self.index.entry(id as usize);
            if entry.r.a != (rs[0].a & self.weak_mask) || entry.r.b != rs[0].b {
                continue;
            }

            if !only_one && seq > 1 {
                let pair = self.index.entry(id as usize + 1);
                if pair.r.a != (rs[1].a & self.weak_mask) || pair.r.b != rs[1].b {
                    continue;
                }
            }

            // weak hit; now the strong checksums decide
            let check_count = if only_one { 1 } else { seq };
            let mut ok = true;
            for check_md4 in 0..check_count {
                let digest = match md4_cache[check_md4] {
                    Some(digest) => digest,
                    None => {
                        let digest = md4_block(&data[check_md4 * bs..(check_md4 + 1) * bs]);
                        md4_cache[check_md4] = Some(digest);
                        digest
                    }
                };
                let stored = &self.index.entry(id as usize + check_md4).checksum[..strong_len];
                if digest[..strong_len] != *stored {
                    ok = false;
                    break;
                }
            }
            if !ok {
                continue;
            }

            // Where does known data resume? Resolved only now, after the
            // strong check, so a write can never cover a block another hit
            // in this very walk already retired.
            let next_known = self.ranges.next_known(id, blocks);

            let num_write;
            if next_known as usize > id as usize + check_count {
                num_write = check_count as u32;
                // the run may continue at the following target block
                self.next_match = Some(id + check_count as u32);
            } else {
                // reached data we already have (or the window end); only
                // write the blocks that are still unknown
                num_write = next_known - id;
            }

            if num_write > 0 {
                self.write_blocks(data, id, id + num_write - 1)?;
                got_blocks += num_write;
            }
        }
        Ok(got_blocks)
    }

    /// Write the inclusive block range from the window buffer to its
    /// absolute target offset, then retire the blocks: out of the index,
    /// into the known-range set.
    fn write_blocks(&mut self, data: &[u8], from: BlockId, to: BlockId) -> Result<()> {
        let offset = (self.config.block_id_offset as u64 + from as u64) << self.block_shift;
        let len = ((to - from + 1) as usize) << self.block_shift;
        self.target.write_at(offset, &data[..len])?;

        for id in from..=to {
            self.index.remove(id);
            self.ranges.insert(id);
        }
        Ok(())
    }

    /// Turn the gaps of the known-range set into absolute download ranges,
    /// each carrying the strong-checksum prefix of every block in it.
    fn required_ranges(&self) -> Option<Vec<RequiredRange>> {
        let gaps = self.ranges.missing(self.config.blocks);
        if gaps.is_empty() {
            return None;
        }

        let mut out = Vec::with_capacity(gaps.len());
        for (lo, hi) in gaps {
            if self.is_cancelled() {
                return None;
            }
            let checksums = (lo..=hi)
                .map(|id| self.index.checksum_prefix(id).to_vec())
                .collect();
            out.push(RequiredRange {
                first_block: self.config.block_id_offset + lo,
                last_block: self.config.block_id_offset + hi,
                checksums,
            });
        }
        Some(out)
    }
}
