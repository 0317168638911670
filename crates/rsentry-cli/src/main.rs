use anyhow::{Context, Result};
use clap::Parser;
use rsentry_core::{Config, resolve_gateway};
use rsentry_nft::{
    DEFAULT_TABLE_NAME, Firewall, FirewallConfig, MemorySession, NftCli, NftSession, SessionError,
    policy,
};
use rsentry_nl::{MemoryRouteTable, NetlinkRoutes, RouteManager, RouteOutcome, RouteTable};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rsentry-init")]
#[command(
    version,
    about = "Gateway host route and kill switch for tunnel sidecars",
    long_about = None
)]
struct Cli {
    /// Leave the host's existing nftables ruleset in place instead of flushing it
    #[arg(long, env = "RSENTRY_KEEP_RULESET")]
    keep_ruleset: bool,
    /// Name of the filter table to create
    #[arg(long, env = "RSENTRY_TABLE", default_value = DEFAULT_TABLE_NAME)]
    table: String,
    /// Print the ruleset that would be committed without touching the host
    #[arg(long)]
    dry_run: bool,
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    let result = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start runtime")
        .and_then(|rt| rt.block_on(run(cli)));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "provisioning failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(|name| std::env::var(name).ok())?;

    let fw_config = FirewallConfig::default()
        .with_table_name(&cli.table)
        .with_flush_ruleset_on_init(!cli.keep_ruleset);

    if cli.dry_run {
        let routes = RouteManager::new(MemoryRouteTable::new().with_link(&config.egress_iface, 1));
        let mut session = MemorySession::new();
        let opened = std::future::ready(Ok(&mut session));
        provision(&config, &routes, opened, fw_config).await?;

        println!("{}", serde_json::to_string_pretty(&session.ruleset_json())?);
        return Ok(());
    }

    let routes = NetlinkRoutes::new()
        .await
        .context("Failed to open netlink connection")?;

    provision(&config, &RouteManager::new(routes), NftCli::open(), fw_config).await
}

fn load_config<F>(lookup: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    Config::from_lookup(lookup).context("Failed to load configuration")
}

/// Route the gateway out of the egress interface, then engage the kill switch.
/// The firewall session is opened only once the route is in place.
async fn provision<R, S, O>(
    config: &Config,
    routes: &RouteManager<R>,
    open_session: O,
    fw_config: FirewallConfig,
) -> Result<()>
where
    R: RouteTable,
    S: NftSession,
    O: Future<Output = Result<S, SessionError>>,
{
    let gateway = resolve_gateway(&config.gateway_host, &config.gateway_port)
        .await
        .context("Failed to lookup gateway address")?;

    let to = gateway.ip();
    let via = config.egress_iface.as_str();
    info!(%to, via, "adding host route");

    match routes
        .add_host_route(via, to)
        .await
        .context("Failed to add host route")?
    {
        RouteOutcome::Added => info!(%to, via, "host route added"),
        RouteOutcome::AlreadyPresent => info!(%to, via, "route already exists"),
    }

    let session = open_session
        .await
        .context("Failed to open nftables session")?;

    let mut firewall = Firewall::new(session, fw_config)
        .await
        .context("Failed to create firewall")?;

    info!(table = %firewall.table().name, "configuring blackhole firewall");
    policy::configure_blackhole(&mut firewall)
        .await
        .context("Failed to enable kill switch")?;
    info!("firewall is enabled");

    Ok(())
}
