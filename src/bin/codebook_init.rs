//! Codebook generator
//!
//! Writes a deterministic unit-vector codebook blob that `VoltDb::open`
//! can load.
//!
//! Usage:
//!   codebook_init <path> [--entries N] [--seed S]

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context};
use tracing::info;
use tracing_subscriber::EnvFilter;

use voltdb::codebook::CODEBOOK_CAPACITY;
use voltdb::Codebook;

const DEFAULT_SEED: u64 = 0x766f_6c74;

fn parse_flag<T: std::str::FromStr>(args: &[String], flag: &str) -> anyhow::Result<Option<T>> {
    match args.iter().position(|a| a == flag) {
        None => Ok(None),
        Some(i) => {
            let raw = args.get(i + 1).with_context(|| format!("{flag} needs a value"))?;
            match raw.parse() {
                Ok(v) => Ok(Some(v)),
                Err(_) => bail!("invalid value for {flag}: {raw}"),
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 || args.iter().any(|a| a == "--help" || a == "-h") {
        println!("Usage: codebook_init <path> [--entries N] [--seed S]");
        println!();
        println!("  --entries   Number of codebook entries (default: {CODEBOOK_CAPACITY})");
        println!("  --seed      Generator seed (default: {DEFAULT_SEED})");
        return Ok(());
    }

    let path = PathBuf::from(&args[1]);
    if args[1].starts_with("--") {
        bail!("path '{}' looks like a flag", args[1]);
    }
    let entries = parse_flag(&args, "--entries")?.unwrap_or(CODEBOOK_CAPACITY);
    let seed = parse_flag(&args, "--seed")?.unwrap_or(DEFAULT_SEED);
    if entries == 0 || entries > CODEBOOK_CAPACITY {
        bail!("--entries must be in 1..={CODEBOOK_CAPACITY}");
    }

    let start = Instant::now();
    let codebook = Codebook::generate(entries, seed)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    codebook.save(&path).with_context(|| format!("failed to write {}", path.display()))?;
    info!(
        path = %path.display(),
        entries,
        seed,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "codebook written"
    );
    Ok(())
}
