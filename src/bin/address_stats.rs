// address_stats.rs - CLI tool for inspecting the sender tally
//
// Usage:
//   cargo run --bin address_stats                                   # Top 20 from the default database
//   cargo run --bin address_stats -- --db other.sqlite3 --limit 50
//   cargo run --bin address_stats -- --export snapshot.json         # Also write a full snapshot

use anyhow::Result;
use chainmapper::AddressRecord;
use chainmapper::persistence::SqliteStore;
use chainmapper::settings::DEFAULT_DB_PATH;
use chainmapper::snapshot::write_snapshot;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "address_stats")]
#[command(about = "Show the most active sender addresses from the chainmapper database")]
struct Args {
    /// Database path
    #[arg(long, default_value = DEFAULT_DB_PATH)]
    db: PathBuf,

    /// Number of addresses to show
    #[arg(long, default_value_t = 20)]
    limit: usize,

    /// Write a full ranked snapshot to this path
    #[arg(long)]
    export: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let store = SqliteStore::open(&args.db)?;
    let records = store.top(Some(args.limit))?;
    print_table(&records, store.address_count()?);

    if let Some(path) = args.export {
        let count = write_snapshot(&store, &path)?;
        println!("\nExported {} addresses to {}", count, path.display());
    }

    Ok(())
}

/// Print records as a ranked table
fn print_table(records: &[AddressRecord], total: u64) {
    println!("\n=== TOP SENDERS ===\n");

    if records.is_empty() {
        println!("No addresses recorded yet.");
        return;
    }

    println!("{:>5}  {:<44} {:>10}  {:<19}", "Rank", "Address", "Tx Count", "Last Seen (UTC)");
    println!("{}", "-".repeat(82));

    for (i, record) in records.iter().enumerate() {
        println!("{:>5}  {:<44} {:>10}  {}",
            i + 1,
            truncate_address(&record.address),
            record.occurrence_count,
            record.last_updated.format("%Y-%m-%d %H:%M:%S")
        );
    }

    println!("\nShowing {} of {} addresses", records.len(), total);
}

/// Truncate long addresses for display (first 41 chars + ...)
fn truncate_address(address: &str) -> String {
    if address.chars().count() > 44 {
        let head: String = address.chars().take(41).collect();
        format!("{}...", head)
    } else {
        address.to_string()
    }
}
