//! CoralFS Journal Tool - Offline journal inspection
//!
//! Resolves a node's journal pointer in a file-backed object store and
//! reads the front journal without ever taking the writer role. Useful
//! for poking at a stopped metadata server's log during support work.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use coralfs_common::JournalLayout;
use coralfs_journal::{
    FileStore, JournalMetrics, JournalPointer, LogEvent, ObjectJournal, ObjectStore,
    STREAM_FORMAT_RESILIENT,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "coralfs-journal-tool")]
#[command(about = "CoralFS metadata journal inspection")]
#[command(version)]
struct Args {
    /// File store directory holding the metadata pool objects
    #[arg(short, long)]
    dir: PathBuf,

    /// Metadata server rank
    #[arg(short, long, default_value_t = 0)]
    node: u64,

    /// Metadata pool id
    #[arg(short, long, default_value_t = 1)]
    pool: u64,

    /// Journal object size the writer was configured with
    #[arg(long, default_value_t = 4 * 1024 * 1024)]
    object_size: u64,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the journal pointer, header fields and stream positions
    Inspect {
        /// Emit JSON instead of plain text
        #[arg(long)]
        json: bool,
    },
    /// Walk the live event range and print one line per event
    Events {
        /// Only print per-type totals
        #[arg(long)]
        count: bool,
    },
}

fn open_front_journal(args: &Args) -> Result<(JournalPointer, ObjectJournal)> {
    let store: Arc<dyn ObjectStore> =
        Arc::new(FileStore::open(&args.dir).context("failed to open object store directory")?);

    let pointer = match JournalPointer::load(store.as_ref(), args.pool, args.node) {
        Ok(p) => p,
        Err(e) if e.is_not_found() => {
            bail!("no journal pointer for node {} (fresh node?)", args.node)
        }
        Err(e) => return Err(e).context("failed to load journal pointer"),
    };

    let journal = ObjectJournal::new(
        pointer.front,
        args.pool,
        store,
        JournalLayout {
            object_size: args.object_size,
        },
        STREAM_FORMAT_RESILIENT,
        Arc::new(JournalMetrics::new()),
    );
    journal
        .recover()
        .context("failed to recover front journal")?;
    Ok((pointer, journal))
}

fn cmd_inspect(args: &Args, json: bool) -> Result<()> {
    let (pointer, journal) = open_front_journal(args)?;

    if json {
        let value = serde_json::json!({
            "pointer": {
                "front": pointer.front,
                "back": pointer.back,
            },
            "stream_format": journal.stream_format(),
            "expire_pos": journal.expire_pos(),
            "read_pos": journal.read_pos(),
            "write_pos": journal.write_pos(),
            "object_size": journal.layout_period(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("pointer.front:  {:#x}", pointer.front);
        println!("pointer.back:   {:#x}", pointer.back);
        println!("stream format:  {}", journal.stream_format());
        println!("expire_pos:     {}", journal.expire_pos());
        println!("read_pos:       {}", journal.read_pos());
        println!("write_pos:      {}", journal.write_pos());
        println!("object_size:    {}", journal.layout_period());
        println!(
            "live bytes:     {}",
            journal.write_pos() - journal.expire_pos()
        );
    }
    Ok(())
}

fn cmd_events(args: &Args, count_only: bool) -> Result<()> {
    let (_, journal) = open_front_journal(args)?;
    journal.set_read_pos(journal.expire_pos());

    let mut totals: BTreeMap<&'static str, u64> = BTreeMap::new();
    loop {
        let pos = journal.read_pos();
        let body = match journal.try_read_entry() {
            Ok(Some(body)) => body,
            Ok(None) => break,
            Err(e) => {
                bail!("failed to read entry at {}: {}", pos, e);
            }
        };
        match LogEvent::decode_body(pos, &body) {
            Ok(event) => {
                *totals.entry(event.event_type().as_str()).or_default() += 1;
                if !count_only {
                    println!(
                        "{:>12}  {:<17} stamp={} payload={}B",
                        pos,
                        event.event_type().as_str(),
                        event.stamp_micros(),
                        event.payload().len()
                    );
                }
            }
            Err(_) => {
                *totals.entry("corrupt").or_default() += 1;
                if !count_only {
                    println!("{:>12}  corrupt entry ({} bytes)", pos, body.len());
                }
            }
        }
    }

    if count_only {
        for (etype, n) in &totals {
            println!("{:<17} {}", etype, n);
        }
    } else {
        let total: u64 = totals.values().sum();
        println!("{} events", total);
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&args.log_level))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match args.command {
        Commands::Inspect { json } => cmd_inspect(&args, json),
        Commands::Events { count } => cmd_events(&args, count),
    }
}
