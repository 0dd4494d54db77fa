//! resolvd - lightweight caching DNS proxy and forwarder.
//!
//! Answers queries from a hosts-file overlay, a response cache, or the
//! configured upstream resolvers, with search-domain expansion and
//! stub-zone routing. Intended to shortcircuit /etc/resolv.conf on a
//! single host.

mod resolvconf;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rd_dns::config::{self, Config};
use rd_dns::hosts::HostsSource;
use rd_dns::server;
use rd_dns::{Hooks, ServerState};
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM, SIGUSR1};
use signal_hook_tokio::Signals;
use tokio::net::{TcpListener, UdpSocket};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "resolvd", version)]
#[command(about = "Lightweight caching DNS proxy and forwarder", long_about = None)]
struct Args {
    /// Listen on this address <host[:port]>
    #[arg(short, long, default_value = "127.0.0.1:53")]
    listen: String,

    /// Comma delimited nameservers <host[:port][,host[:port]]> (supersedes resolv.conf)
    #[arg(short, long = "nameservers")]
    nameservers: Vec<String>,

    /// Use different nameservers for given domains <domain[,domain]/host[:port][,host[:port]]>
    #[arg(short = 'z', long = "stubzones")]
    stubzones: Vec<String>,

    /// Path to a hosts file (e.g. /etc/hosts)
    #[arg(short = 'f', long)]
    hostsfile: Option<PathBuf>,

    /// Path to a directory of hosts files, read non-recursively
    #[arg(long)]
    hostsfile_dir: Option<PathBuf>,

    /// How frequently to poll hosts files in seconds (0 to disable)
    #[arg(short = 'p', long, default_value_t = 0)]
    hostsfile_poll: u64,

    /// List of search domains <domain[,domain]> (supersedes resolv.conf)
    #[arg(short, long = "search-domains")]
    search_domains: Vec<String>,

    /// Qualify names with search domains to resolve queries
    #[arg(long)]
    enable_search: bool,

    /// Response cache capacity (0 disables caching)
    #[arg(short, long, default_value_t = 0)]
    rcache: usize,

    /// TTL in seconds for response cache entries
    #[arg(long, default_value_t = 60)]
    rcache_ttl: u64,

    /// Disable recursion
    #[arg(long)]
    no_rec: bool,

    /// Number of dots a name must have before the query is forwarded
    #[arg(long, default_value_t = 0)]
    fwd_ndots: usize,

    /// Number of dots a name must have before an initial absolute query (supersedes resolv.conf)
    #[arg(long)]
    ndots: Option<usize>,

    /// Rotate A/AAAA records in answers served from the hosts overlay
    #[arg(long)]
    round_robin: bool,

    /// Upstream exchange timeout in milliseconds
    #[arg(long, default_value_t = 2000)]
    read_timeout: u64,

    /// TTL in seconds for answers served from the hosts overlay
    #[arg(long, default_value_t = 3600)]
    host_ttl: u32,

    /// Update /etc/resolv.conf with the address of resolvd as nameserver
    #[arg(short, long)]
    default_resolver: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn build_config(args: &Args) -> Result<Config> {
    let listen = config::parse_listen(&args.listen)?;
    let stub_zones = config::parse_stub_zones(&args.stubzones)?;

    let mut nameservers = config::parse_nameservers(&args.nameservers)?;
    let mut search_domains = config::parse_search_domains(&args.search_domains)?;
    let mut ndots = args.ndots;

    // Fall back to the system resolver config for anything not given on
    // the command line.
    if nameservers.is_empty() || search_domains.is_empty() || ndots.is_none() {
        match resolvconf::read(Path::new(resolvconf::RESOLV_CONF_PATH)) {
            Ok(system) => {
                if nameservers.is_empty() {
                    nameservers = system.nameservers;
                }
                if search_domains.is_empty() {
                    search_domains = system.search;
                }
                if ndots.is_none() {
                    ndots = system.ndots;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("parsing resolv.conf"),
        }
    }

    Ok(Config {
        listen,
        nameservers,
        stub_zones,
        search_domains,
        ndots: ndots.unwrap_or(1),
        fwd_ndots: args.fwd_ndots,
        enable_search: args.enable_search,
        no_rec: args.no_rec,
        round_robin: args.round_robin,
        read_timeout: Duration::from_millis(args.read_timeout),
        rcache_cap: args.rcache,
        rcache_ttl: Duration::from_secs(args.rcache_ttl),
        host_ttl: args.host_ttl,
        hostsfile: args.hostsfile.clone(),
        hostsfile_dir: args.hostsfile_dir.clone(),
        poll_interval: Duration::from_secs(args.hostsfile_poll),
        default_resolver: args.default_resolver,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    info!("starting resolvd {}", env!("CARGO_PKG_VERSION"));

    let config = build_config(&args)?;
    info!("nameservers: {:?}", config.nameservers);
    if config.enable_search {
        info!("search domains: {:?}", config.search_domains);
    }

    let cancel = CancellationToken::new();

    let hosts = if let Some(dir) = &config.hostsfile_dir {
        HostsSource::from_dir(dir, config.poll_interval, &cancel).await?
    } else if let Some(file) = &config.hostsfile {
        HostsSource::from_file(file, config.poll_interval, &cancel).await?
    } else {
        HostsSource::empty()
    };

    let listen = config.listen;
    let default_resolver = config.default_resolver;

    let state = Arc::new(ServerState::new(
        config,
        hosts,
        Hooks::default(),
        env!("CARGO_PKG_VERSION"),
    ));

    let udp = UdpSocket::bind(listen)
        .await
        .with_context(|| format!("binding UDP listener on {}", listen))?;
    let tcp = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding TCP listener on {}", listen))?;

    if default_resolver {
        resolvconf::register(listen.ip(), Path::new(resolvconf::RESOLV_CONF_PATH))
            .context("registering as default nameserver")?;
    }

    let tracker = TaskTracker::new();
    let udp_task = tokio::spawn(server::run_udp_server(
        udp,
        state.clone(),
        cancel.clone(),
        tracker.clone(),
    ));
    let tcp_task = tokio::spawn(server::run_tcp_server(
        tcp,
        state.clone(),
        cancel.clone(),
        tracker.clone(),
    ));

    run_signal_loop(&state, &cancel).await?;

    for task in [udp_task, tcp_task] {
        if let Err(e) = task.await? {
            error!("listener error: {:#}", e);
        }
    }

    // Give in-flight queries up to the upstream timeout to finish.
    tracker.close();
    if tokio::time::timeout(state.config.read_timeout, tracker.wait())
        .await
        .is_err()
    {
        warn!("timed out waiting for in-flight queries");
    }

    if default_resolver {
        match resolvconf::unregister(Path::new(resolvconf::RESOLV_CONF_PATH)) {
            Ok(()) => info!("restored {}", resolvconf::RESOLV_CONF_PATH),
            Err(e) => error!("restoring {} failed: {:#}", resolvconf::RESOLV_CONF_PATH, e),
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Block until a shutdown signal arrives; SIGUSR1 dumps the counters.
async fn run_signal_loop(state: &Arc<ServerState>, cancel: &CancellationToken) -> Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM, SIGQUIT, SIGUSR1])?;

    while let Some(signal) = signals.next().await {
        if signal == SIGUSR1 {
            match serde_json::to_string(&state.stats.snapshot()) {
                Ok(json) => info!(
                    "resolvd {} up {}s, stats: {}",
                    state.version,
                    state.started_at.elapsed().as_secs(),
                    json
                ),
                Err(e) => warn!("serializing stats failed: {}", e),
            }
            continue;
        }
        info!("received signal {}, shutting down", signal);
        cancel.cancel();
        break;
    }
    Ok(())
}
