//! marketindex CLI — inspect configuration and defaults.
//!
//! Usage:
//! ```bash
//! marketindex info
//! marketindex version
//! ```

use std::env;
use std::process;

use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    match args[1].as_str() {
        "info" => cmd_info(),
        "version" | "--version" | "-V" => {
            println!("marketindex {}", env!("CARGO_PKG_VERSION"));
        }
        "help" | "--help" | "-h" => print_usage(),
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    }
}

fn print_usage() {
    println!("marketindex {}", env!("CARGO_PKG_VERSION"));
    println!("Multi-chain NFT marketplace indexer and listing lifecycle engine\n");
    println!("USAGE:");
    println!("    marketindex <COMMAND>\n");
    println!("COMMANDS:");
    println!("    info     Show MarketIndex configuration info");
    println!("    version  Print version");
    println!("    help     Print this help");
}

fn cmd_info() {
    println!("MarketIndex v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default poll interval: 15s per chain source");
    println!("  Default fetch window: 1000 blocks/call");
    println!("  Default Dutch resync cadence: 60s");
    println!("  Default listing duration: 7 days (chain-originated)");
    println!("  Auction extension: bids within 5m of close extend by 2m");
    println!("  Storage backends: memory, SQLite (feature: sqlite)");
    println!("  Chains: EVM (Ethereum, Polygon, Arbitrum, ...), Solana");
}
