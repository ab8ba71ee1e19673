use clap::{Parser, Subcommand};

use spvchain::core::chain::Blockchain;
use spvchain::core::params::Bitcoin;
use spvchain::core::types::{hash_hex, Hash256, Header};
use spvchain::storage::BlockStore;
use spvchain::stream::{HeaderStream, Op, StreamOptions};

const DEFAULT_DATA_DIR: &str = "spvchain_data";

#[derive(Parser)]
#[command(name = "spvchain", version = "0.4.2")]
#[command(about = "Reorg-aware SPV header chain")]
struct Cli {
    #[arg(long, global = true)]
    data_dir: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show chain status
    Status,
    /// Import raw 80-byte headers from a file
    Import {
        /// File of concatenated canonical header encodings
        #[arg(short, long)]
        input: String,
        /// Headers per batch
        #[arg(short, long, default_value_t = 1000)]
        batch: usize,
    },
    /// Follow the chain, printing every add/remove
    Watch {
        /// Hash (reversed hex) to stream from
        #[arg(long)]
        from: Option<String>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("spvchain=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let data_dir = cli.data_dir.unwrap_or_else(|| DEFAULT_DATA_DIR.to_string());

    let rt = tokio::runtime::Runtime::new().unwrap();
    if let Err(e) = rt.block_on(run(cli.command, &data_dir)) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn run(command: Commands, data_dir: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = BlockStore::open(data_dir)?;
    let chain = Blockchain::new(Bitcoin, store);

    match command {
        Commands::Status => {
            let tip = chain.tip().await;
            println!("📊 spvchain");
            println!("  Height:  {}", tip.height);
            println!("  Tip:     {}", hash_hex(&tip.hash()));
            println!("  Bits:    {:08x}", tip.header.bits);
            println!("  Genesis: {}", hash_hex(&chain.genesis().hash()));
            chain.close().await?;
        }

        Commands::Import { input, batch } => {
            let data = std::fs::read(&input)?;
            if data.len() % Header::ENCODED_LEN != 0 {
                return Err(
                    format!("{}: not a multiple of {} bytes", input, Header::ENCODED_LEN).into(),
                );
            }
            let headers: Vec<Header> = data
                .chunks(Header::ENCODED_LEN)
                .map(|chunk| Header::from_bytes(chunk).expect("sized chunk"))
                .collect();
            println!("⛓  importing {} headers", headers.len());

            let mut imported = 0usize;
            for chunk in headers.chunks(batch.max(1)) {
                match chain.add_headers(chunk).await {
                    Ok(accepted) => imported += accepted.len(),
                    Err(e) => {
                        imported += e.accepted.len();
                        chain.close().await?;
                        return Err(
                            format!("import stopped after {} headers: {}", imported, e).into()
                        );
                    }
                }
            }
            let tip = chain.tip().await;
            println!(
                "✅ imported {} headers, tip now #{} {}",
                imported,
                tip.height,
                hash_hex(&tip.hash())
            );
            chain.close().await?;
        }

        Commands::Watch { from } => {
            let from = match from {
                Some(s) => Some(parse_hash(&s)?),
                None => None,
            };
            let mut stream = HeaderStream::new(chain.clone(), StreamOptions { from, stop: None });
            println!("👀 watching chain (ctrl-c to stop)");
            loop {
                tokio::select! {
                    item = stream.next() => match item {
                        Some(Ok(event)) => {
                            let op = match event.op { Op::Add => "+", Op::Remove => "-" };
                            println!("{} #{} {}", op, event.height, hash_hex(&event.header.hash()));
                        }
                        Some(Err(e)) => {
                            eprintln!("stream error: {}", e);
                            break;
                        }
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            chain.close().await?;
        }
    }
    Ok(())
}

fn parse_hash(s: &str) -> Result<Hash256, String> {
    let bytes = hex::decode(s).map_err(|e| format!("bad hash: {}", e))?;
    let mut hash: Hash256 = bytes
        .try_into()
        .map_err(|_| "hash must be 32 bytes".to_string())?;
    hash.reverse(); // display order -> internal order
    Ok(hash)
}
