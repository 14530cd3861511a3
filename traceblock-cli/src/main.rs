//! TraceBlock CLI - inspect persisted compacted blocks

use anyhow::{bail, Context};
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use traceblock_core::{CompletedBlock, Id};

const USAGE: &str = "usage:
  traceblock inspect <block-dir>
  traceblock find <block-dir> <hex-id>";

/// A parsed command line
#[derive(Debug, PartialEq)]
enum Command {
    Inspect { dir: PathBuf },
    Find { dir: PathBuf, id: String },
}

impl Command {
    fn parse(args: &[String]) -> anyhow::Result<Self> {
        match args {
            [cmd, dir] if cmd == "inspect" => Ok(Command::Inspect { dir: dir.into() }),
            [cmd, dir, id] if cmd == "find" => Ok(Command::Find {
                dir: dir.into(),
                id: id.clone(),
            }),
            _ => bail!("{}", USAGE),
        }
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match Command::parse(&args)? {
        Command::Inspect { dir } => inspect(&dir),
        Command::Find { dir, id } => find(&dir, &id),
    }
}

fn load(dir: &Path) -> anyhow::Result<CompletedBlock> {
    debug!("Loading block artifacts from {:?}", dir);
    CompletedBlock::load(dir)
        .with_context(|| format!("failed to load block from {}", dir.display()))
}

fn inspect(dir: &Path) -> anyhow::Result<()> {
    let block = load(dir)?;
    let meta = &block.meta;

    println!("block:    {}", meta.block_id);
    println!("tenant:   {}", meta.tenant_id);
    println!("time:     {} .. {}", meta.start_time, meta.end_time);
    println!("objects:  {}", meta.total_objects);
    match (&meta.min_id, &meta.max_id) {
        (Some(min), Some(max)) => println!("ids:      {} .. {}", min, max),
        _ => println!("ids:      -"),
    }
    println!(
        "bloom:    {} bits, {} hashes, ~{:.4} fp",
        block.bloom.num_bits(),
        block.bloom.num_hashes(),
        block.bloom.false_positive_rate(meta.total_objects)
    );
    println!("records:  {}", block.records.len());

    for (i, record) in block.records.iter().enumerate() {
        println!(
            "  {:>6}  offset={:<12} length={:<10} {} .. {}",
            i, record.start_offset, record.length, record.min_id, record.max_id
        );
    }

    Ok(())
}

fn find(dir: &Path, id: &str) -> anyhow::Result<()> {
    let block = load(dir)?;
    let id = Id::parse_hex(id)?;

    if !block.bloom.test(id.as_bytes()) {
        println!("{}: not in block (bloom)", id);
        return Ok(());
    }

    match block.find(&id) {
        Some(record) => println!(
            "{}: candidate run offset={} length={}",
            id, record.start_offset, record.length
        ),
        None => println!("{}: bloom match, no index run covers it", id),
    }

    Ok(())
}
