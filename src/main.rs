use clap::Parser;
use rzsync::config::Args;
use rzsync::engine::{self, EngineConfig};
use rzsync::signature::build_checksum_blocks;
use rzsync::zsync::output::TargetFile;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        Level::DEBUG
    } else if args.quiet {
        Level::ERROR
    } else {
        Level::INFO
    };

    // log to stderr so piped output stays clean
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting default subscriber failed");

    if let Err(e) = run(&args) {
        error!("Update failed: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn run(args: &Args) -> anyhow::Result<()> {
    let new_len = std::fs::metadata(&args.new)?.len();

    info!("Indexing {:?}...", args.new);
    let mut reader = BufReader::new(File::open(&args.new)?);
    let (checksum_blocks, total_blocks) = build_checksum_blocks(
        &mut reader,
        args.block_size,
        args.weak_bytes,
        args.strong_bytes,
    )?;
    info!(
        "{} blocks of {} bytes ({} bytes of checksums)",
        total_blocks,
        args.block_size,
        checksum_blocks.len()
    );

    let config = EngineConfig {
        block_size: args.block_size,
        weak_bytes: args.weak_bytes,
        strong_bytes: args.strong_bytes,
        seq_matches: args.seq_matches,
        jobs: args.jobs,
        progress: args.progress && !args.quiet,
    };

    let target = Arc::new(TargetFile::create(&args.output)?);
    let outcome = engine::run_seed_pass(
        &config,
        &checksum_blocks,
        total_blocks,
        &args.seed,
        Arc::clone(&target),
        None,
    )?;

    info!(
        "Matched {}/{} blocks from {:?}",
        outcome.got_blocks, total_blocks, args.seed
    );

    if !outcome.required_ranges.is_empty() {
        let bytes: u64 = outcome
            .required_ranges
            .iter()
            .map(|r| r.byte_len(args.block_size))
            .sum();
        info!(
            "Fetching {} ranges ({} bytes) from {:?}...",
            outcome.required_ranges.len(),
            bytes,
            args.new
        );
        let mut source = File::open(&args.new)?;
        engine::fill_ranges_from(&mut source, &target, &outcome.required_ranges, args.block_size)?;
    }

    target.set_len(new_len)?;
    target.sync_all()?;
    info!("Wrote {:?}", args.output);
    Ok(())
}
