use clap::Parser;
use futures::StreamExt;
use futures::channel::mpsc;
use std::io;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{error, info, info_span};
use tracing_subscriber::EnvFilter;

use mailresolv::{AsyncSession, RecordType, Reply, Resolver, ResolverConfig, UpstreamConfig};

#[derive(Parser)]
#[command(name = "mailresolv")]
#[command(about = "Query DNS records through the mail filter resolver", long_about = None)]
struct Args {
    /// Names to look up; IPv4 addresses are reversed for PTR queries
    #[arg(required = true)]
    names: Vec<String>,

    /// Record type: a, ptr, mx, txt, spf or srv
    #[arg(short = 't', long = "type", default_value = "a")]
    rtype: RecordType,

    /// Upstream DNS server (ip or ip:port), may be repeated
    #[arg(short, long = "server")]
    servers: Vec<UpstreamConfig>,

    /// Read upstream servers from this file when none are given
    #[arg(long, default_value = "/etc/resolv.conf")]
    resolv_conf: String,

    /// Time to wait for each reply before retransmitting
    #[arg(long, default_value = "1000")]
    timeout_ms: u64,

    /// Retransmissions before giving up
    #[arg(short, long, default_value = "3")]
    retransmits: u32,

    /// Log resolver activity to stderr
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn print_reply(name: &str, reply: &Reply) {
    println!("{} ({}): {}", name, reply.record_type(), reply.code());
    for element in reply.elements() {
        println!("    {}", element);
    }
}

async fn run(args: Args) -> io::Result<()> {
    let config = ResolverConfig {
        timeout: Duration::from_millis(args.timeout_ms),
        max_retransmits: args.retransmits,
        ..ResolverConfig::with_servers(args.servers)
    }
    .or_resolv_conf(&args.resolv_conf)
    .map_err(io::Error::other)?;

    let resolver = Resolver::spawn(&config, info_span!("resolver")).await?;
    let session = AsyncSession::new();
    let (tx, mut rx) = mpsc::unbounded::<(String, Reply)>();

    for name in &args.names {
        let tx = tx.clone();
        let label = name.clone();
        let callback = move |reply: Reply| {
            let _ = tx.unbounded_send((label, reply));
        };

        let started = match (args.rtype, name.parse::<Ipv4Addr>()) {
            (RecordType::Ptr, Ok(addr)) => resolver.resolve_ptr(addr, &session, callback),
            _ => resolver.start_request(name, args.rtype, &session, callback),
        };
        if let Err(e) = started {
            error!("{}: {}", name, e);
        }
    }
    drop(tx);

    while let Some((name, reply)) = rx.next().await {
        print_reply(&name, &reply);
    }

    let stats = resolver.stats().snapshot();
    info!(
        requests = stats.requests,
        replies = stats.replies,
        timeouts = stats.timeouts,
        retransmits = stats.retransmits,
        avg_response_ms = stats.avg_response_ms,
        "done"
    );

    resolver.shutdown();
    Ok(())
}

fn main() -> io::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, run(args))
}
