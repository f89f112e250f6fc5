use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use log::LevelFilter;
use rand::seq::IndexedRandom;
use simple_logger::SimpleLogger;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use ulid::Ulid;

const ENTITIES: &[&str] = &["instance", "user", "service", "device", "transaction", "task", "node"];
const ACTIONS: &[&str] = &["created", "updated", "deleted", "failed", "started", "recovered"];

#[derive(Parser)]
#[command(author, version, about = "Demo producer for a ledgerd ingest node", long_about = None)]
struct Cli {
    /// ingest writer address, e.g. 127.0.0.1:7000
    #[arg(long, default_value = "127.0.0.1:7000")]
    address: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream records one at a time over fast or durable.
    Stream(StreamArgs),
    /// Upload one pre-formed segment over bulk.
    Bulk(BulkArgs),
}

#[derive(Parser)]
struct StreamArgs {
    #[arg(long, default_value_t = 100)]
    count: u32,

    #[arg(long, value_enum, default_value_t = StreamModality::Fast)]
    modality: StreamModality,

    /// Delay between records.
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,
}

#[derive(Parser)]
struct BulkArgs {
    #[arg(long, default_value_t = 100)]
    count: u32,
}

#[derive(Copy, Clone, ValueEnum)]
enum StreamModality {
    Fast,
    Durable,
}

fn generate_record() -> String {
    let mut rng = rand::rng();
    let entity = ENTITIES.choose(&mut rng).unwrap();
    let action = ACTIONS.choose(&mut rng).unwrap();
    format!("{} {} {}", Ulid::new(), entity, action)
}

async fn run_stream(address: &str, args: StreamArgs) -> anyhow::Result<()> {
    let socket = TcpStream::connect(address).await?;
    let (read_half, mut write_half) = tokio::io::split(socket);
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    for i in 0..args.count {
        let record = generate_record();
        write_half.write_all(record.as_bytes()).await?;
        write_half.write_all(b"\n").await?;

        if matches!(args.modality, StreamModality::Durable) {
            line.clear();
            reader.read_line(&mut line).await?;
            if !line.starts_with("OK") {
                log::warn!("record {i} not acknowledged: {}", line.trim_end());
            }
        }

        if args.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(args.delay_ms)).await;
        }
    }

    log::info!("streamed {} records to {}", args.count, address);
    Ok(())
}

async fn run_bulk(address: &str, args: BulkArgs) -> anyhow::Result<()> {
    let mut body = String::new();
    for _ in 0..args.count {
        body.push_str(&generate_record());
        body.push('\n');
    }

    let mut socket = TcpStream::connect(address).await?;
    socket.write_all(body.as_bytes()).await?;
    socket.shutdown().await?;

    let mut response = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut socket, &mut response).await?;
    log::info!("bulk upload of {} records: {}", args.count, String::from_utf8_lossy(&response).trim_end());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    SimpleLogger::new().with_level(LevelFilter::Info).init().unwrap();
    let cli = Cli::parse();

    match cli.command {
        Commands::Stream(args) => run_stream(&cli.address, args).await,
        Commands::Bulk(args) => run_bulk(&cli.address, args).await,
    }
}
