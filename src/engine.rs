use crate::zsync::job::{JobConfig, JobReport, RequiredRange, ZsyncJob};
use crate::zsync::output::TargetFile;
use crate::zsync::{md4_block, read_full, BlockId};
use crate::Result;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{debug, info};

/// Settings for a whole seeding pass over one target file.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub block_size: u32,
    pub weak_bytes: u8,
    pub strong_bytes: u8,
    pub seq_matches: u8,
    /// Number of parallel matching jobs (= target windows).
    pub jobs: usize,
    pub progress: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: 2048,
            weak_bytes: 4,
            strong_bytes: 8,
            seq_matches: 2,
            jobs: 4,
            progress: false,
        }
    }
}

/// Merged result of a seeding pass.
#[derive(Debug)]
pub struct UpdateOutcome {
    pub total_blocks: u32,
    pub got_blocks: u32,
    /// Ranges still to fetch, sorted by first block; empty when the target
    /// is fully reconstructed from the seed.
    pub required_ranges: Vec<RequiredRange>,
    pub cancelled: bool,
}

/// Split the target's block space into at most `jobs` disjoint windows of
/// near-equal size, as `(block_id_offset, blocks)` pairs.
pub fn plan_windows(total_blocks: BlockId, jobs: usize) -> Vec<(BlockId, BlockId)> {
    if total_blocks == 0 {
        return Vec::new();
    }
    let jobs = jobs.clamp(1, total_blocks as usize) as u32;
    let base = total_blocks / jobs;
    let extra = total_blocks % jobs;

    let mut windows = Vec::with_capacity(jobs as usize);
    let mut offset = 0;
    for i in 0..jobs {
        let count = base + if i < extra { 1 } else { 0 };
        windows.push((offset, count));
        offset += count;
    }
    windows
}

/// Run one matching job per window against the seed file, all windows
/// sharing the output handle, and merge the reports.
///
/// `checksum_blocks` is the full per-block checksum buffer for the target;
/// each job receives the slice covering its own window.
pub fn run_seed_pass(
    config: &EngineConfig,
    checksum_blocks: &[u8],
    total_blocks: BlockId,
    seed_path: &Path,
    target: Arc<TargetFile>,
    cancel: Option<Arc<AtomicBool>>,
) -> Result<UpdateOutcome> {
    let windows = plan_windows(total_blocks, config.jobs);
    let record_len = config.weak_bytes as usize + config.strong_bytes as usize;
    debug!(windows = windows.len(), total_blocks, "starting seed pass");

    let pb = if config.progress {
        let pb = ProgressBar::new(windows.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap(),
        );
        Some(pb)
    } else {
        None
    };

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.jobs.max(1))
        .build()
        .map_err(|e| crate::ZsyncError::Config(format!("Failed to build thread pool: {}", e)))?;

    let reports: Vec<JobReport> = pool.install(|| {
        windows
            .par_iter()
            .map(|&(offset, blocks)| {
                let lo = offset as usize * record_len;
                let hi = (offset + blocks) as usize * record_len;
                let slice = checksum_blocks.get(lo..hi).ok_or_else(|| {
                    crate::ZsyncError::InvalidChecksumBlocks(checksum_blocks.len())
                })?;

                let job_config = JobConfig {
                    block_size: config.block_size,
                    block_id_offset: offset,
                    blocks,
                    weak_bytes: config.weak_bytes,
                    strong_bytes: config.strong_bytes,
                    seq_matches: config.seq_matches,
                };
                let mut job =
                    ZsyncJob::new(job_config, slice.to_vec(), Arc::clone(&target), seed_path)?;
                if let Some(flag) = &cancel {
                    job = job.with_cancel_flag(Arc::clone(flag));
                }

                let report = job.run();
                if let Some(pb) = &pb {
                    pb.inc(1);
                }
                report
            })
            .collect::<Result<Vec<_>>>()
    })?;

    if let Some(pb) = &pb {
        pb.finish_with_message("seeded");
    }

    let mut got_blocks = 0;
    let mut required_ranges = Vec::new();
    let mut cancelled = false;
    for report in reports {
        got_blocks += report.got_blocks;
        cancelled |= report.cancelled;
        if let Some(ranges) = report.required_ranges {
            required_ranges.extend(ranges);
        }
    }
    required_ranges.sort_by_key(|range| range.first_block);

    info!(
        got_blocks,
        total_blocks,
        missing_ranges = required_ranges.len(),
        "seed pass complete"
    );
    Ok(UpdateOutcome {
        total_blocks,
        got_blocks,
        required_ranges,
        cancelled,
    })
}

/// Fetch the bytes for each required range from a seekable source, verify
/// every block against the range's strong checksums and write it to the
/// output. Stands in for the ranged download against a release server.
/// Returns the number of bytes fetched.
pub fn fill_ranges_from<R: Read + Seek>(
    source: &mut R,
    target: &TargetFile,
    ranges: &[RequiredRange],
    block_size: u32,
) -> Result<u64> {
    let bs = block_size as usize;
    let mut fetched = 0u64;

    for range in ranges {
        let offset = range.byte_offset(block_size);
        let mut buf = vec![0u8; range.block_count() as usize * bs];

        source.seek(SeekFrom::Start(offset))?;
        // a short read only happens at the padded tail; the rest stays zero
        let n = read_full(source, &mut buf)?;

        for (i, block) in buf.chunks(bs).enumerate() {
            let want = &range.checksums[i];
            let digest = md4_block(block);
            if digest[..want.len()] != want[..] {
                return Err(crate::ZsyncError::BlockChecksumMismatch(
                    range.first_block + i as u32,
                ));
            }
        }
        target.write_at(offset, &buf)?;
        fetched += n as u64;
    }
    Ok(fetched)
}
