use std::path::PathBuf;
use std::process;

use clap::{Parser, ValueEnum};
use cowkv::wal::reader::WalReader;
use cowkv::wal::recovery::{committed_transactions, CommittedTx};
use cowkv::{Event, RecoveryMode};
use tracing_subscriber::EnvFilter;

const EXIT_OK: i32 = 0;
const EXIT_MALFORMED_DETECTED: i32 = 10;
const EXIT_FATAL_ERROR: i32 = 20;

#[derive(Clone, Debug, ValueEnum)]
enum RecoveryModeArg {
    Strict,
    Permissive,
}

impl From<RecoveryModeArg> for RecoveryMode {
    fn from(value: RecoveryModeArg) -> Self {
        match value {
            RecoveryModeArg::Strict => RecoveryMode::Strict,
            RecoveryModeArg::Permissive => RecoveryMode::Permissive,
        }
    }
}

#[derive(Parser)]
#[command(name = "cowkv-wal-inspect", about = "Dump and check a cowkv WAL")]
struct Cli {
    /// WAL file path
    wal: PathBuf,

    /// WAL recovery behavior used while reading
    #[arg(long, value_enum, default_value = "strict")]
    recovery_mode: RecoveryModeArg,

    /// Only report transactions newer than this txid (the master page's
    /// last applied txid)
    #[arg(long, value_name = "TXID", default_value_t = 0)]
    after: u64,

    /// Print only the summary, not every event
    #[arg(long)]
    summary: bool,
}

fn fatal(message: &str) -> ! {
    eprintln!("ERROR: {}", message);
    process::exit(EXIT_FATAL_ERROR);
}

fn print_transaction(tx: &CommittedTx) {
    println!("txid {}:", tx.txid);
    for event in &tx.events {
        println!("  {}", describe(event));
    }
}

/// The raw line, plus decoded names for the events that carry them.
fn describe(event: &Event) -> String {
    match event {
        Event::CreateTable { name } | Event::DeleteTable { name } => {
            format!("{}    # {:?}", event, name)
        }
        Event::InsertEntry { table, .. }
        | Event::UpdateEntry { table, .. }
        | Event::DeleteEntry { table, .. } => format!("{}    # table {:?}", event, table),
        Event::FreePages { pages } => format!("{}    # {} pages", event, pages.len()),
        _ => event.to_string(),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mode: RecoveryMode = cli.recovery_mode.clone().into();

    let contents = WalReader::open(&cli.wal, mode)
        .and_then(|reader| reader.read_all())
        .unwrap_or_else(|e| fatal(&format!("WAL read failed: {}", e)));
    let total_events = contents.events.len();
    let transactions = committed_transactions(contents.events)
        .unwrap_or_else(|e| fatal(&format!("WAL is malformed: {}", e)));

    let pending: Vec<&CommittedTx> = transactions
        .iter()
        .filter(|tx| tx.txid > cli.after)
        .collect();
    if !cli.summary {
        for tx in &pending {
            print_transaction(tx);
        }
    }

    println!("WAL inspection summary:");
    println!("  events: {}", total_events);
    println!("  committed txs: {}", transactions.len());
    println!("  txs after {}: {}", cli.after, pending.len());
    println!("  valid bytes: {}", contents.valid_len);
    println!("  discarded bytes: {}", contents.discarded);

    process::exit(if contents.discarded == 0 {
        EXIT_OK
    } else {
        EXIT_MALFORMED_DETECTED
    });
}
