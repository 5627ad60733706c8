use rzsync::signature::build_checksum_blocks;
use rzsync::zsync::job::{JobConfig, JobReport, ZsyncJob};
use rzsync::zsync::md4_block;
use rzsync::zsync::output::TargetFile;
use rzsync::ZsyncError;
use std::io::Cursor;
use std::sync::Arc;
use tempfile::TempDir;

fn patterned(len: usize, salt: u32) -> Vec<u8> {
    let mut state = 0x9e3779b9u32 ^ salt;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

fn checksum_blocks_for(data: &[u8], block_size: u32, weak: u8, strong: u8) -> (Vec<u8>, u32) {
    build_checksum_blocks(&mut Cursor::new(data), block_size, weak, strong).unwrap()
}

struct Scenario {
    dir: TempDir,
    job: ZsyncJob,
    blocks: u32,
    block_size: u32,
}

impl Scenario {
    /// One job covering the whole target, seeded from `seed_data` on disk.
    fn new(
        new_data: &[u8],
        seed_data: &[u8],
        block_size: u32,
        weak: u8,
        strong: u8,
        seq: u8,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let seed_path = dir.path().join("seed");
        std::fs::write(&seed_path, seed_data).unwrap();

        let (buf, blocks) = checksum_blocks_for(new_data, block_size, weak, strong);
        let target = Arc::new(TargetFile::create(dir.path().join("out")).unwrap());
        let config = JobConfig {
            block_size,
            block_id_offset: 0,
            blocks,
            weak_bytes: weak,
            strong_bytes: strong,
            seq_matches: seq,
        };
        let job = ZsyncJob::new(config, buf, target, seed_path).unwrap();
        Scenario {
            dir,
            job,
            blocks,
            block_size,
        }
    }

    fn run(&mut self) -> JobReport {
        self.job.run().unwrap()
    }

    /// Output file contents, zero-padded to the full block space.
    fn output(&self) -> Vec<u8> {
        let mut out = std::fs::read(self.dir.path().join("out")).unwrap();
        out.resize(self.blocks as usize * self.block_size as usize, 0);
        out
    }
}

fn range_pairs(report: &JobReport) -> Vec<(u32, u32)> {
    report
        .required_ranges
        .as_deref()
        .unwrap_or(&[])
        .iter()
        .map(|r| (r.first_block, r.last_block))
        .collect()
}

#[test]
fn identical_seed_matches_every_block() {
    let data = vec![0xabu8; 4096];
    let mut scenario = Scenario::new(&data, &data, 1024, 2, 8, 2);
    let report = scenario.run();

    assert_eq!(report.got_blocks, 4);
    assert!(report.required_ranges.is_none());
    assert_eq!(scenario.output(), data);
}

#[test]
fn shifted_seed_matches_at_shifted_positions() {
    let new_data = patterned(8 * 1024, 2);
    let mut seed_data = vec![0x11, 0x22, 0x33];
    seed_data.extend_from_slice(&new_data);

    let mut scenario = Scenario::new(&new_data, &seed_data, 1024, 4, 8, 2);
    let report = scenario.run();

    assert_eq!(report.got_blocks, 8);
    assert!(report.required_ranges.is_none());
    assert_eq!(scenario.output(), new_data);
}

#[test]
fn corrupted_block_is_reported_with_its_checksum() {
    let new_data = patterned(8 * 1024, 3);
    let mut seed_data = new_data.clone();
    seed_data[2048..3072].fill(0);

    let mut scenario = Scenario::new(&new_data, &seed_data, 1024, 4, 8, 2);
    let report = scenario.run();

    assert_eq!(report.got_blocks, 7);
    assert_eq!(range_pairs(&report), vec![(2, 2)]);
    let ranges = report.required_ranges.as_ref().unwrap();
    assert_eq!(
        ranges[0].checksums,
        vec![md4_block(&new_data[2048..3072])[..8].to_vec()]
    );

    // everything but the hole was reconstructed; the hole stays unwritten
    let out = scenario.output();
    assert_eq!(out[..2048], new_data[..2048]);
    assert!(out[2048..3072].iter().all(|&b| b == 0));
    assert_eq!(out[3072..], new_data[3072..]);
}

#[test]
fn disjoint_content_reports_the_whole_window() {
    let new_data = vec![0xffu8; 4096];
    let seed_data = vec![0x00u8; 4096];

    let mut scenario = Scenario::new(&new_data, &seed_data, 1024, 4, 8, 2);
    let report = scenario.run();

    assert_eq!(report.got_blocks, 0);
    assert_eq!(range_pairs(&report), vec![(0, 3)]);
    let ranges = report.required_ranges.as_ref().unwrap();
    assert_eq!(ranges[0].checksums.len(), 4);
    for (i, checksum) in ranges[0].checksums.iter().enumerate() {
        let block = &new_data[i * 1024..(i + 1) * 1024];
        assert_eq!(checksum, &md4_block(block)[..8].to_vec());
    }
    // no writes happened
    assert!(scenario.output().iter().all(|&b| b == 0));
}

#[test]
fn duplicate_target_block_written_from_one_hit() {
    let block_a = patterned(1024, 4);
    let block_b = patterned(1024, 5);
    let block_c = patterned(1024, 6);

    // target repeats block A at the end; the seed holds a single copy
    let mut new_data = Vec::new();
    new_data.extend_from_slice(&block_a);
    new_data.extend_from_slice(&block_b);
    new_data.extend_from_slice(&block_c);
    new_data.extend_from_slice(&block_a);

    let mut seed_data = block_a.clone();
    seed_data.extend_from_slice(&patterned(3 * 1024, 7));

    let mut scenario = Scenario::new(&new_data, &seed_data, 1024, 4, 8, 1);
    let report = scenario.run();

    // one hash hit, chain walk writes both copies
    assert_eq!(report.got_blocks, 2);
    assert_eq!(range_pairs(&report), vec![(1, 2)]);

    let out = scenario.output();
    assert_eq!(out[..1024], block_a[..]);
    assert_eq!(out[3072..], block_a[..]);
    assert!(out[1024..3072].iter().all(|&b| b == 0));
}

#[cfg(unix)]
#[test]
fn unreadable_seed_fails_without_writing() {
    use std::os::unix::fs::PermissionsExt;

    let data = vec![0xabu8; 4096];
    let mut scenario = Scenario::new(&data, &data, 1024, 2, 8, 2);
    let seed_path = scenario.dir.path().join("seed");
    std::fs::set_permissions(&seed_path, std::fs::Permissions::from_mode(0o000)).unwrap();

    let err = scenario.job.run().unwrap_err();
    assert!(matches!(err, ZsyncError::SourceFilePermissionDenied(_)));
    assert_eq!(std::fs::metadata(scenario.dir.path().join("out")).unwrap().len(), 0);
}

#[test]
fn seed_pass_is_idempotent() {
    let new_data = patterned(8 * 1024, 8);
    let mut seed_data = new_data.clone();
    seed_data[5120..6144].fill(0x77);

    let mut scenario = Scenario::new(&new_data, &seed_data, 1024, 4, 8, 2);
    let first = scenario.run();
    let out_first = scenario.output();

    // a second pass over the same seed finds nothing new and changes nothing
    let second = scenario.run();
    assert_eq!(second.got_blocks, 0);
    assert_eq!(range_pairs(&second), range_pairs(&first));
    assert_eq!(scenario.output(), out_first);
}

#[test]
fn matching_works_across_buffer_refills() {
    // larger than one 16-block scratch buffer, shifted so every match sits
    // at an odd offset and runs cross the refill seams
    let new_data = patterned(64 * 1024, 9);
    let mut seed_data = vec![0xde, 0xad, 0xbe, 0xef, 0x01];
    seed_data.extend_from_slice(&new_data);

    let mut scenario = Scenario::new(&new_data, &seed_data, 1024, 4, 8, 2);
    let report = scenario.run();

    assert_eq!(report.got_blocks, 64);
    assert!(report.required_ranges.is_none());
    assert_eq!(scenario.output(), new_data);
}

#[test]
fn exclusivity_and_verification_hold_after_partial_seed() {
    let new_data = patterned(16 * 1024, 10);
    let mut seed_data = new_data.clone();
    seed_data[1024..2048].fill(0x31);
    seed_data[9216..11264].fill(0x32);

    let mut scenario = Scenario::new(&new_data, &seed_data, 1024, 4, 8, 2);
    let report = scenario.run();

    let required: Vec<u32> = report
        .required_ranges
        .as_deref()
        .unwrap_or(&[])
        .iter()
        .flat_map(|r| r.first_block..=r.last_block)
        .collect();

    let out = scenario.output();
    let mut known_count = 0;
    for id in 0..scenario.blocks {
        let known = scenario.job.known_ranges().contains(id);
        // every block is either known or required, never both
        assert_ne!(known, required.contains(&id), "block {}", id);
        if known {
            known_count += 1;
            // and known blocks hold verified target bytes
            let lo = id as usize * 1024;
            assert_eq!(out[lo..lo + 1024], new_data[lo..lo + 1024], "block {}", id);
        }
    }
    assert_eq!(known_count, report.got_blocks);
    assert_eq!(known_count as usize + required.len(), scenario.blocks as usize);
}

#[test]
fn window_order_does_not_change_the_result() {
    let block_size = 1024u32;
    let new_data = patterned(8 * 1024, 11);
    let mut seed_data = new_data.clone();
    seed_data[3072..4096].fill(0x55);

    let run_windows = |order: &[usize]| -> Vec<u8> {
        let dir = tempfile::tempdir().unwrap();
        let seed_path = dir.path().join("seed");
        std::fs::write(&seed_path, &seed_data).unwrap();
        let (buf, blocks) = checksum_blocks_for(&new_data, block_size, 4, 8);
        assert_eq!(blocks, 8);

        let target = Arc::new(TargetFile::create(dir.path().join("out")).unwrap());
        let windows = [(0u32, 4u32), (4, 4)];
        for &w in order {
            let (offset, count) = windows[w];
            let record_len = 12;
            let slice =
                buf[offset as usize * record_len..(offset + count) as usize * record_len].to_vec();
            let config = JobConfig {
                block_size,
                block_id_offset: offset,
                blocks: count,
                weak_bytes: 4,
                strong_bytes: 8,
                seq_matches: 2,
            };
            let mut job =
                ZsyncJob::new(config, slice, Arc::clone(&target), seed_path.as_path()).unwrap();
            job.run().unwrap();
        }

        let mut out = std::fs::read(dir.path().join("out")).unwrap();
        out.resize(8 * 1024, 0);
        out
    };

    assert_eq!(run_windows(&[0, 1]), run_windows(&[1, 0]));
}

#[test]
fn offset_window_writes_at_absolute_positions() {
    let block_size = 1024u32;
    let new_data = patterned(8 * 1024, 12);
    let mut seed_data = new_data.clone();
    seed_data[5120..6144].fill(0x44); // clobber absolute block 5

    let dir = tempfile::tempdir().unwrap();
    let seed_path = dir.path().join("seed");
    std::fs::write(&seed_path, &seed_data).unwrap();

    let (buf, blocks) = checksum_blocks_for(&new_data, block_size, 4, 8);
    assert_eq!(blocks, 8);

    // a job owning only the upper half of the block space
    let record_len = 12;
    let slice = buf[4 * record_len..8 * record_len].to_vec();
    let target = Arc::new(TargetFile::create(dir.path().join("out")).unwrap());
    let config = JobConfig {
        block_size,
        block_id_offset: 4,
        blocks: 4,
        weak_bytes: 4,
        strong_bytes: 8,
        seq_matches: 1,
    };
    let mut job = ZsyncJob::new(config, slice, target, seed_path).unwrap();
    let report = job.run().unwrap();

    assert_eq!(report.got_blocks, 3);
    assert_eq!(range_pairs(&report), vec![(5, 5)]);

    let mut out = std::fs::read(dir.path().join("out")).unwrap();
    out.resize(8 * 1024, 0);
    // the lower half belongs to another job and stays untouched
    assert!(out[..4096].iter().all(|&b| b == 0));
    assert_eq!(out[4096..5120], new_data[4096..5120]);
    assert!(out[5120..6144].iter().all(|&b| b == 0));
    assert_eq!(out[6144..], new_data[6144..]);
}
