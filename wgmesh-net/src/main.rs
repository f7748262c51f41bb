use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use wgmesh_net::audit::NetAuditLogger;
use wgmesh_net::config::Settings;
use wgmesh_net::model::{ClientUpdate, GroupUpdate, NewClient, NewGroup, SampleOwner, split_list};
use wgmesh_net::sampler::StatsSampler;
use wgmesh_net::service::NetService;
use wgmesh_net::store::Store;
use wgmesh_net::supervisor::InterfaceSupervisor;
use wgmesh_net::wg::WgCli;

#[derive(Parser)]
#[command(name = "wgmesh-net")]
#[command(about = "WireGuard group manager: interfaces, clients and traffic")]
struct Cli {
    /// Database directory [env: WGMESH_DATA_DIR]
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Root directory for rendered configuration [env: WG_CONFIG_PATH]
    #[arg(long)]
    config_root: Option<PathBuf>,

    /// Seconds between traffic samples, 0 disables [env: STATS_COLLECTION_INTERVAL]
    #[arg(long)]
    stats_interval: Option<u64>,

    /// Timeout for each wg / wg-quick call in seconds [env: WG_COMMAND_TIMEOUT]
    #[arg(long)]
    command_timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Restore interfaces and sample traffic until SIGINT/SIGTERM
    Serve,

    /// Manage groups
    #[command(subcommand)]
    Group(GroupCommand),

    /// Manage clients
    #[command(subcommand)]
    Client(ClientCommand),

    /// Show the traffic series of a group or client
    Traffic {
        /// Group ID or name
        #[arg(long, conflicts_with = "client", required_unless_present = "client")]
        group: Option<String>,

        /// Client ID
        #[arg(long)]
        client: Option<i64>,

        /// Only samples recorded at or after this time (RFC 3339)
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        /// Maximum number of points, 0 for all
        #[arg(long, default_value = "100")]
        max_points: usize,

        /// Print per-second rates instead of cumulative totals
        #[arg(long)]
        rates: bool,
    },
}

#[derive(Subcommand)]
enum GroupCommand {
    /// Create a new group
    Create {
        name: String,

        /// IPv4 range, e.g. 10.8.0.0/24
        #[arg(long)]
        ipv4: String,

        /// Optional IPv6 range, e.g. fd00:8::/64
        #[arg(long)]
        ipv6: Option<String>,

        #[arg(long)]
        port: Option<u16>,

        /// Comma separated DNS servers
        #[arg(long)]
        dns: Option<String>,

        /// Public host[:port] clients connect to
        #[arg(long)]
        endpoint: Option<String>,

        #[arg(long)]
        keepalive: Option<u16>,

        #[arg(long)]
        mtu: Option<u16>,

        /// Let clients reach each other through the server
        #[arg(long)]
        client_to_client: bool,

        #[arg(long, default_value = "")]
        description: String,
    },

    /// List all groups
    List,

    /// Show a group and its live interface status
    Show { group: String },

    /// Update a group
    Update {
        group: String,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        description: Option<String>,

        /// New IPv6 range; an empty string clears it
        #[arg(long)]
        ipv6: Option<String>,

        #[arg(long)]
        port: Option<u16>,

        #[arg(long)]
        dns: Option<String>,

        #[arg(long)]
        endpoint: Option<String>,

        #[arg(long)]
        keepalive: Option<u16>,

        #[arg(long)]
        mtu: Option<u16>,

        #[arg(long)]
        client_to_client: Option<bool>,

        #[arg(long)]
        active: Option<bool>,
    },

    /// Delete a group with all its clients
    Delete { group: String },

    /// Bring the group's interface up
    Up { group: String },

    /// Bring the group's interface down
    Down { group: String },

    /// Restart the group's interface
    Restart { group: String },

    /// Print the server configuration
    Config { group: String },
}

#[derive(Subcommand)]
enum ClientCommand {
    /// Add a client to a group
    Add {
        /// Group ID or name
        group: String,

        name: String,

        /// What the client routes through the tunnel
        #[arg(long)]
        allowed_ips: Option<String>,

        /// Comma separated prefixes the server routes to this client
        #[arg(long)]
        routed_prefixes: Option<String>,

        /// Comma separated DNS servers overriding the group's
        #[arg(long)]
        dns: Option<String>,

        /// Expiry time (RFC 3339)
        #[arg(long)]
        expires_at: Option<DateTime<Utc>>,

        /// Issue a preshared key
        #[arg(long)]
        psk: bool,

        /// Keep the client from addressing other peers
        #[arg(long)]
        isolated: bool,

        #[arg(long, default_value = "")]
        description: String,
    },

    /// List the clients of a group
    List { group: String },

    /// Update a client
    Update {
        id: i64,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        description: Option<String>,

        #[arg(long)]
        allowed_ips: Option<String>,

        #[arg(long)]
        routed_prefixes: Option<String>,

        /// DNS override; an empty string falls back to the group's
        #[arg(long)]
        dns: Option<String>,

        #[arg(long)]
        expires_at: Option<DateTime<Utc>>,

        /// Remove the expiry time
        #[arg(long, conflicts_with = "expires_at")]
        no_expiry: bool,

        #[arg(long)]
        can_address_peers: Option<bool>,
    },

    /// Enable a client
    Enable { id: i64 },

    /// Disable a client, keeping its address reserved
    Disable { id: i64 },

    /// Replace a client's keys
    RegenerateKeys {
        id: i64,

        /// Also issue a new preshared key
        #[arg(long)]
        psk: bool,
    },

    /// Delete a client
    Delete { id: i64 },

    /// Print the client configuration
    Config { id: i64 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("wgmesh_net=info".parse()?))
        .init();

    let cli = Cli::parse();
    let settings = resolve_settings(&cli)?;

    match cli.command {
        Commands::Serve => serve(settings).await,
        Commands::Group(command) => {
            let app = App::open(&settings).await?;
            group_command(&app.service, command).await
        }
        Commands::Client(command) => {
            let app = App::open(&settings).await?;
            client_command(&app.service, command).await
        }
        Commands::Traffic {
            group,
            client,
            since,
            max_points,
            rates,
        } => {
            let app = App::open(&settings).await?;
            let owner = match (group, client) {
                (Some(group), _) => SampleOwner::Group(app.service.resolve_group(&group).await?.id),
                (None, Some(client)) => SampleOwner::Client(client),
                (None, None) => bail!("either --group or --client is required"),
            };
            if rates {
                print_json(
                    &app.service
                        .traffic_rates(owner, since, max_points)
                        .await?,
                )
            } else {
                print_json(&app.service.traffic(owner, since, max_points).await?)
            }
        }
    }
}

/// Environment first, then command line flags.
fn resolve_settings(cli: &Cli) -> anyhow::Result<Settings> {
    let mut settings = Settings::from_env().context("invalid environment")?;
    if let Some(dir) = &cli.data_dir {
        settings.data_dir = dir.clone();
    }
    if let Some(root) = &cli.config_root {
        settings.config_root = root.clone();
    }
    if let Some(secs) = cli.stats_interval {
        settings.stats_interval = (secs > 0).then(|| Duration::from_secs(secs));
    }
    if let Some(secs) = cli.command_timeout {
        if secs == 0 {
            bail!("--command-timeout must be at least 1 second");
        }
        settings.command_timeout = Duration::from_secs(secs);
    }
    Ok(settings)
}

struct App {
    store: Arc<Store>,
    supervisor: Arc<InterfaceSupervisor>,
    service: NetService,
}

impl App {
    async fn open(settings: &Settings) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&settings.data_dir)
            .await
            .with_context(|| format!("creating {}", settings.data_dir.display()))?;

        let store = Arc::new(
            Store::new(&settings.data_dir)
                .await
                .context("opening database")?,
        );
        let wg = Arc::new(WgCli::new(settings.command_timeout));
        let audit = Arc::new(NetAuditLogger::new());
        let supervisor = Arc::new(InterfaceSupervisor::new(
            Arc::clone(&store),
            wg.clone(),
            settings.config_root.clone(),
            settings.command_timeout,
            Arc::clone(&audit),
        ));
        let service = NetService::new(
            Arc::clone(&store),
            Arc::clone(&supervisor),
            wg,
            settings.defaults.clone(),
            audit,
        );

        Ok(Self {
            store,
            supervisor,
            service,
        })
    }
}

async fn serve(settings: Settings) -> anyhow::Result<()> {
    info!(
        data_dir = %settings.data_dir.display(),
        config_root = %settings.config_root.display(),
        "Starting wgmesh-net"
    );
    let app = App::open(&settings).await?;

    let report = app.supervisor.reconcile_on_startup().await?;
    for (group_id, reason) in &report.failed {
        error!(group_id, reason = %reason, "Group could not be restored");
    }

    let sampler = settings.stats_interval.map(|interval| {
        Arc::new(StatsSampler::new(
            Arc::clone(&app.store),
            Arc::clone(&app.supervisor),
            interval,
            settings.stats_max_parallel,
        ))
        .spawn()
    });
    if sampler.is_none() {
        info!("Stats sampling disabled");
    }

    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    // Interfaces stay up; the next start adopts them
    if let Some(sampler) = sampler {
        sampler.stop().await;
    }
    info!("Stopped");
    Ok(())
}

async fn group_command(service: &NetService, command: GroupCommand) -> anyhow::Result<()> {
    match command {
        GroupCommand::Create {
            name,
            ipv4,
            ipv6,
            port,
            dns,
            endpoint,
            keepalive,
            mtu,
            client_to_client,
            description,
        } => {
            let group = service
                .create_group(NewGroup {
                    name,
                    description,
                    ipv4_cidr: ipv4,
                    ipv6_cidr: ipv6,
                    listen_port: port,
                    dns: dns.as_deref().map(split_list),
                    endpoint,
                    persistent_keepalive: keepalive,
                    mtu,
                    allow_client_to_client: client_to_client,
                    owner_id: 0,
                })
                .await?;
            print_json(&group)
        }
        GroupCommand::List => print_json(&service.list_groups().await?),
        GroupCommand::Show { group } => {
            let group = service.resolve_group(&group).await?;
            let status = service.group_status(group.id).await?;
            print_json(&serde_json::json!({ "group": group, "status": status }))
        }
        GroupCommand::Update {
            group,
            name,
            description,
            ipv6,
            port,
            dns,
            endpoint,
            keepalive,
            mtu,
            client_to_client,
            active,
        } => {
            let group = service.resolve_group(&group).await?;
            let update = GroupUpdate {
                name,
                description,
                listen_port: port,
                dns: dns.as_deref().map(split_list),
                endpoint,
                persistent_keepalive: keepalive,
                mtu,
                allow_client_to_client: client_to_client,
                is_active: active,
                ipv6_cidr: ipv6.map(|v| Some(v).filter(|s| !s.trim().is_empty())),
            };
            print_json(&service.update_group(group.id, update).await?)
        }
        GroupCommand::Delete { group } => {
            let group = service.resolve_group(&group).await?;
            service.delete_group(group.id).await?;
            println!("Deleted group {}", group.name);
            Ok(())
        }
        GroupCommand::Up { group } => {
            let group = service.resolve_group(&group).await?;
            service.start_group(group.id).await?;
            println!("{} is up", group.interface_name());
            Ok(())
        }
        GroupCommand::Down { group } => {
            let group = service.resolve_group(&group).await?;
            service.stop_group(group.id).await?;
            println!("{} is down", group.interface_name());
            Ok(())
        }
        GroupCommand::Restart { group } => {
            let group = service.resolve_group(&group).await?;
            service.restart_group(group.id).await?;
            println!("{} restarted", group.interface_name());
            Ok(())
        }
        GroupCommand::Config { group } => {
            let group = service.resolve_group(&group).await?;
            let (filename, text) = service.server_config(group.id).await?;
            eprintln!("# {}", filename);
            print!("{}", text);
            Ok(())
        }
    }
}

async fn client_command(service: &NetService, command: ClientCommand) -> anyhow::Result<()> {
    match command {
        ClientCommand::Add {
            group,
            name,
            allowed_ips,
            routed_prefixes,
            dns,
            expires_at,
            psk,
            isolated,
            description,
        } => {
            let group = service.resolve_group(&group).await?;
            let mut request = NewClient::new(name)
                .description(description)
                .can_address_peers(!isolated)
                .routed_prefixes(routed_prefixes.as_deref().map(split_list).unwrap_or_default())
                .dns_override(dns.as_deref().map(split_list))
                .expires_at(expires_at)
                .preshared_key(psk);
            if let Some(allowed_ips) = allowed_ips {
                request = request.allowed_ips(allowed_ips);
            }
            print_json(&service.add_client(group.id, request).await?)
        }
        ClientCommand::List { group } => {
            let group = service.resolve_group(&group).await?;
            print_json(&service.list_clients(group.id).await?)
        }
        ClientCommand::Update {
            id,
            name,
            description,
            allowed_ips,
            routed_prefixes,
            dns,
            expires_at,
            no_expiry,
            can_address_peers,
        } => {
            let expires_at = if no_expiry {
                Some(None)
            } else {
                expires_at.map(Some)
            };
            let update = ClientUpdate {
                name,
                description,
                allowed_ips,
                can_address_peers,
                routed_prefixes: routed_prefixes.as_deref().map(split_list),
                dns_override: dns.as_deref().map(|d| Some(split_list(d))),
                expires_at,
                is_active: None,
            };
            print_json(&service.update_client(id, update).await?)
        }
        ClientCommand::Enable { id } => print_json(&service.set_client_active(id, true).await?),
        ClientCommand::Disable { id } => print_json(&service.set_client_active(id, false).await?),
        ClientCommand::RegenerateKeys { id, psk } => {
            print_json(&service.regenerate_client_keys(id, psk).await?)
        }
        ClientCommand::Delete { id } => {
            service.delete_client(id).await?;
            println!("Deleted client {}", id);
            Ok(())
        }
        ClientCommand::Config { id } => {
            let (filename, text) = service.client_config(id).await?;
            eprintln!("# {}", filename);
            print!("{}", text);
            Ok(())
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
