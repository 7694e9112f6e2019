use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use splitvpn::config::{Config, TrafficFile};
use splitvpn::device::UdpDevice;
use splitvpn::dns::DnsPacket;
use splitvpn::filter::RouteLog;
use splitvpn::orchestrator::Orchestrator;
use splitvpn::resolver::UpstreamResolver;
use splitvpn::stats::TrafficStore;
use splitvpn::transport::{Wire, query_quota};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "splitvpn")]
#[command(about = "Split-tunnel UDP VPN client", long_about = None)]
struct Cli {
    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect and relay packets until interrupted
    Connect {
        /// Config file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Ask the server for the remaining quota
    Quota {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Zero the persisted traffic totals
    ResetTraffic {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Decode a hex-encoded IPv4 DNS packet
    InspectDns {
        /// Packet bytes as hex
        hex: String,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "splitvpn=debug" } else { "splitvpn=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let config = Config::load(path.as_deref()).context("loading config")?;
    config.validate().context("invalid config")?;
    Ok(config)
}

async fn connect(config: Config) -> Result<()> {
    let device = UdpDevice::bind(config.device.local, config.device.peer)
        .await
        .with_context(|| format!("binding device bridge on {}", config.device.local))?;
    let (reader, writer) = device.split();

    let lookup = Arc::new(UpstreamResolver::for_filter(&config.filter));
    let store = Arc::new(TrafficFile::new(&config.storage.traffic_file));
    let orchestrator = Orchestrator::new(config, Arc::new(RouteLog::new()), lookup, store);

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("interrupted, shutting down");
        token.cancel();
    });

    let totals = orchestrator
        .run(Box::new(reader), Arc::new(writer), shutdown)
        .await?;
    info!(
        rx_total = totals.rx_total,
        tx_total = totals.tx_total,
        "disconnected"
    );
    Ok(())
}

async fn quota(config: Config) -> Result<()> {
    let wire = Wire::new(config.cipher(), config.cipher.length_prefixed);
    let remaining = query_quota(
        SocketAddr::V4(config.server.addr()),
        &config.auth.identification(),
        &wire,
        config.timing.handshake_timeout(),
    )
    .await?;
    println!("{}", remaining);
    Ok(())
}

fn reset_traffic(config: Config) -> Result<()> {
    let file = TrafficFile::new(&config.storage.traffic_file);
    let before = file.read().context("reading traffic totals")?;
    file.save(Default::default());
    println!(
        "reset {} (was rx {} tx {})",
        file.path().display(),
        before.rx_total,
        before.tx_total
    );
    Ok(())
}

fn inspect_dns(hex: &str) -> Result<()> {
    let packet = decode_hex(hex)?;
    let Some(dns) = DnsPacket::parse(&packet)? else {
        bail!("not a DNS packet");
    };

    let kind = if dns.message.is_response() { "response" } else { "query" };
    println!("{} {} -> {} id {:#06x}", kind, dns.src, dns.dst, dns.message.id);
    for name in dns.message.query_names() {
        println!("  question {}", name);
    }
    let mut answers: Vec<_> = dns.message.answer_ips().into_iter().collect();
    answers.sort();
    for (name, addrs) in answers {
        for addr in addrs {
            println!("  answer {} {}", name, addr);
        }
    }
    Ok(())
}

fn decode_hex(hex: &str) -> Result<Vec<u8>> {
    let digits: Vec<u8> = hex.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if digits.len() % 2 != 0 {
        bail!("odd number of hex digits");
    }
    digits
        .chunks(2)
        .map(|pair| {
            let s = std::str::from_utf8(pair)?;
            u8::from_str_radix(s, 16).with_context(|| format!("invalid hex byte '{}'", s))
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Connect { config } => connect(load_config(config)?).await,
        Command::Quota { config } => quota(load_config(config)?).await,
        Command::ResetTraffic { config } => reset_traffic(Config::load(config.as_deref())?),
        Command::InspectDns { hex } => inspect_dns(&hex),
    }
}
