//! Operational inspection of a bucket store and its block archive.

mod config;
mod logging;

use append_log::BlockArchive;
use clap::{Parser, Subcommand};
use config::Config;
use std::io::Write;
use std::path::PathBuf;
use store_core::PooledMemoryPool;

#[derive(Parser)]
#[command(name = "store-inspect")]
#[command(about = "Inspect and maintain bucket store allocations and block archives")]
struct Args {
    /// Path to configuration file
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print per-class allocation statistics
    Stats,

    /// List allocated and free slots
    Slots {
        /// Only list this bucket class
        #[arg(long)]
        class: Option<u8>,
    },

    /// Move every slot owned by a dead writer process to the free list
    Reclaim {
        /// Writer-process id whose slots are reclaimed
        #[arg(long)]
        wpid: u64,
    },

    /// List archived blocks of a stream
    Blocks {
        /// Stream id
        #[arg(long)]
        stream: i64,

        /// First version of interest
        #[arg(long, default_value_t = 0)]
        from: u64,

        /// Last version of interest
        #[arg(long, default_value_t = u64::MAX)]
        to: u64,

        /// Also print each entry's version and length
        #[arg(long)]
        entries: bool,
    },
}

fn main() {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };

    logging::init(&config.logging);

    if let Err(e) = run(&config, args.command) {
        tracing::error!(error = %e, "command failed");
        std::process::exit(1);
    }
}

fn run(config: &Config, command: Command) -> Result<(), Box<dyn std::error::Error>> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    match command {
        Command::Stats => {
            let pool = PooledMemoryPool::open(&config.store)?;
            let stats = pool.stats()?;
            let recovery = pool.allocator().recovery_stats();

            writeln!(out, "path:           {}", config.store.path.display())?;
            writeln!(out, "max total size: {}", stats.max_total_size)?;
            writeln!(out, "mapped bytes:   {}", stats.mapped_bytes)?;
            writeln!(out, "allocated:      {}", stats.allocated_bytes())?;
            writeln!(out, "footprint:      {}", stats.footprint())?;
            writeln!(out, "available:      {}", pool.store().available_free_space())?;
            writeln!(out, "utilization:    {:.1}%", stats.utilization())?;
            writeln!(
                out,
                "foreign slots:  {} (owned by other writer processes)",
                recovery.foreign
            )?;

            for class in &stats.classes {
                writeln!(
                    out,
                    "class {:>2} {:>10}B  allocated {:>6}  free {:>6}  high water {:>6}",
                    class.class, class.bucket_size, class.allocated, class.free, class.high_water
                )?;
            }
        }
        Command::Slots { class } => {
            let pool = PooledMemoryPool::open(&config.store)?;
            pool.print(&mut out, class, None)?;
        }
        Command::Reclaim { wpid } => {
            let pool = PooledMemoryPool::open(&config.store)?;
            let reclaimed = pool.allocator().reclaim(wpid)?;
            writeln!(out, "reclaimed {reclaimed} slots from wpid {wpid}")?;
        }
        Command::Blocks {
            stream,
            from,
            to,
            entries,
        } => {
            let archive = BlockArchive::from_config(&config.log)?;
            for block in archive.range(stream, from..=to)? {
                writeln!(
                    out,
                    "stream {} versions {}..{} ({} entries, {} bytes)",
                    block.stream_id,
                    block.first_version,
                    block.next_version(),
                    block.count,
                    block.data.len()
                )?;

                if entries {
                    for (version, payload) in block.frames() {
                        writeln!(out, "  {version}: {} bytes", payload.len())?;
                    }
                }
            }
        }
    }

    out.flush()?;
    Ok(())
}
