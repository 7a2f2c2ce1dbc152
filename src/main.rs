//! Binary entrypoint for the meshboard server node.
//!
//! Commands:
//! - `init` - write a default config file
//! - `start` - run the server node (UDP demo transport + console CLI)
//! - `status` - print a summary of the node's persisted state

use std::io::Write;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{error, info};
use tokio::io::{AsyncBufReadExt, BufReader};

use meshboard::config::Config;
use meshboard::mesh::crypto::StdCrypto;
use meshboard::mesh::udp::UdpTransport;
use meshboard::server::{ClockService, ServerNode, SystemTimeSource};
use meshboard::storage::BlobStore;

#[derive(Parser)]
#[command(name = "meshboard")]
#[command(about = "A bulletin board server node for LoRa mesh networks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "meshboard.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,
    /// Start the server node
    Start {
        /// Override the UDP bind address from the config
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Show a summary of the persisted node state
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pre_config = Config::load(&cli.config).await.ok();
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Init => {
            Config::create_default(&cli.config).await?;
            println!("wrote default config to {}", cli.config);
            Ok(())
        }
        Commands::Start { bind } => {
            let mut config = Config::load(&cli.config).await?;
            if let Some(bind) = bind {
                config.transport.bind = bind;
            }
            run_server(config).await
        }
        Commands::Status => {
            let config = Config::load(&cli.config).await?;
            print_status(&config)
        }
    }
}

async fn run_server(config: Config) -> Result<()> {
    let mirror = config.storage.mirror_dir.as_ref().map(Into::into);
    let store = BlobStore::open(config.storage.data_dir.clone(), mirror)?;
    let transport = UdpTransport::bind(&config.transport.bind, &config.transport.peers)?;
    let clock = ClockService::new(Box::new(SystemTimeSource::new()));

    let mut node = ServerNode::new(config, store, transport, StdCrypto, clock)?;
    let local_key = node.identity().pub_key;
    node.transport_mut().set_local_key(local_key);
    node.begin()?;

    info!("server node running; type commands at the console (Ctrl-C to stop)");

    let mut tick = tokio::time::interval(Duration::from_millis(50));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut console = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tick.tick() => {
                for frame in node.transport_mut().poll_inbound() {
                    node.handle_frame(frame);
                }
                node.loop_tick();
            }
            line = console.next_line() => {
                match line {
                    Ok(Some(line)) if !line.trim().is_empty() => {
                        let reply = node.handle_command(0, &line);
                        if !reply.is_empty() {
                            println!("{reply}");
                        }
                        let _ = std::io::stdout().flush();
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        // console closed; keep serving the mesh
                    }
                    Err(e) => error!("console read error: {e}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }
    Ok(())
}

fn print_status(config: &Config) -> Result<()> {
    let mirror = config.storage.mirror_dir.as_ref().map(Into::into);
    let store = BlobStore::open(config.storage.data_dir.clone(), mirror)?;

    let boot_count = store
        .read_all("/boot_count")
        .ok()
        .filter(|b| b.len() >= 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .unwrap_or(0);
    println!("data dir:   {}", config.storage.data_dir);
    println!("boot count: {boot_count}");
    for (label, name) in [
        ("identity", "/identity"),
        ("contacts", "/s_contacts"),
        ("posts", "/posts"),
        ("system messages", "/system_msgs"),
        ("netsync config", "/netsync_cfg"),
        ("channel config", "/channel_cfg"),
    ] {
        let state = if store.exists(name) { "present" } else { "absent" };
        println!("{label:16} {state}");
    }
    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    let base_level = match verbosity {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    let mut builder = env_logger::Builder::new();
    builder.filter_level(base_level);
    if verbosity == 0 {
        if let Some(level) = config
            .as_ref()
            .and_then(|c| c.logging.level.as_deref())
            .and_then(|s| s.parse::<log::LevelFilter>().ok())
        {
            builder.filter_level(level);
        }
    }
    builder.format(|fmt, record| {
        use std::io::Write;
        let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
        writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
    });
    let _ = builder.try_init();
}
