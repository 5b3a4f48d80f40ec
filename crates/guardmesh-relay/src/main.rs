//! `GuardMesh` node binary.
//!
//! `guardmesh serve` runs the relay (tunnel, peer sync, control API). The
//! remaining subcommands are offline admin tools against the registry.

use std::io::{self, Write};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use guardmesh_core::config::{default_cert_dir, default_database_path, load_config};
use guardmesh_core::tracing_init::init_tracing;
use guardmesh_core::{NodeConfig, NodeRole};
use guardmesh_crypto::KeyPair;
use guardmesh_relay::node::Node;
use guardmesh_relay::storage::{NewServer, NewUser, RegistryDatabase};
use guardmesh_relay::sync::Synchronizer;
use guardmesh_relay::tls::{generate_dev_bundle, load_server_config, write_dev_certs};
use guardmesh_relay::tunnel::{IpCommand, TunnelAdapter, UapiDevice, UapiProvider};

#[derive(Debug, Parser)]
#[command(name = "guardmesh", version, about = "GuardMesh mesh VPN relay node")]
struct Cli {
    /// Node config file (TOML).
    #[arg(long, global = true, env = "GUARDMESH_CONFIG")]
    config: Option<PathBuf>,

    /// Registry database path. Overrides `database.path`.
    #[arg(long, global = true, env = "GUARDMESH_DB")]
    db: Option<PathBuf>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the node until SIGINT/SIGTERM
    Serve(ServeArgs),
    /// Register a relay server
    AddServer(AddServerArgs),
    /// Register a user
    AddUser(AddUserArgs),
    /// Print the relay table as JSON
    ListServers,
    /// Print the id of the user holding an address
    LookupUser {
        #[arg(long)]
        address: IpAddr,
    },
    /// Run one peer synchronization pass against the live interface
    Sync,
    /// Write a development CA plus node and client certificates
    GenCerts {
        /// Output directory (default: `control.cert_dir` or ~/.guardmesh/certs).
        #[arg(long)]
        out: Option<PathBuf>,
        /// Names the node certificate is valid for.
        #[arg(long = "san", default_values = ["localhost", "127.0.0.1"])]
        sans: Vec<String>,
        /// Common name of the client certificate.
        #[arg(long, default_value = "guardmesh-admin")]
        client_cn: String,
    },
    /// Generate a WireGuard key pair (base64)
    GenKey,
}

#[derive(Debug, Args)]
struct ServeArgs {
    #[arg(long, env = "GUARDMESH_ROLE")]
    role: Option<NodeRole>,

    #[arg(long, env = "GUARDMESH_INTERFACE")]
    interface: Option<String>,

    /// Private tunnel address of this node.
    #[arg(long, env = "GUARDMESH_ADDRESS")]
    address: Option<IpAddr>,

    /// Base64 WireGuard private key.
    #[arg(long, env = "GUARDMESH_PRIVATE_KEY", hide_env_values = true)]
    private_key: Option<String>,

    #[arg(long, env = "GUARDMESH_LISTEN_PORT")]
    listen_port: Option<u16>,

    /// 0 selects the default (1500).
    #[arg(long, env = "GUARDMESH_MTU")]
    mtu: Option<u32>,

    /// Control API bind address.
    #[arg(long, env = "GUARDMESH_BIND")]
    bind: Option<SocketAddr>,

    /// Directory holding ca.crt, node.crt and node.key.
    #[arg(long, env = "GUARDMESH_CERT_DIR")]
    cert_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct AddServerArgs {
    #[arg(long, default_value = "")]
    name: String,
    #[arg(long)]
    public_ip: String,
    #[arg(long, default_value_t = 51820)]
    port: u16,
    #[arg(long)]
    private_ip: String,
    /// Base64 tunnel public key.
    #[arg(long)]
    public_key: String,
    /// Base64 pre-shared key.
    #[arg(long)]
    preshared_key: String,
}

#[derive(Debug, Args)]
struct AddUserArgs {
    #[arg(long)]
    username: String,
    #[arg(long)]
    display_name: String,
    /// Base64 public key.
    #[arg(long)]
    public_key: String,
    #[arg(long, default_value = "")]
    latest_ip: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing("guardmesh_relay=info,guardmesh=info", cli.log_json);

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.database.path = Some(db);
    }

    match cli.command {
        Commands::Serve(args) => serve(config, args).await,
        Commands::AddServer(args) => {
            let db = open_registry(&config).await?;
            let id = db
                .add_server(&NewServer {
                    name: &args.name,
                    public_ip: &args.public_ip,
                    port: args.port,
                    private_ip: &args.private_ip,
                    public_key: &args.public_key,
                    preshared_key: &args.preshared_key,
                })
                .await?;
            writeln!(io::stdout(), "{id}")?;
            Ok(())
        }
        Commands::AddUser(args) => {
            let db = open_registry(&config).await?;
            let id = db
                .add_user(&NewUser {
                    username: &args.username,
                    display_name: &args.display_name,
                    public_key: &args.public_key,
                    latest_ip: &args.latest_ip,
                })
                .await?;
            writeln!(io::stdout(), "{id}")?;
            Ok(())
        }
        Commands::ListServers => {
            let db = open_registry(&config).await?;
            let servers = db.list_servers().await?;
            writeln!(io::stdout(), "{}", serde_json::to_string_pretty(&servers)?)?;
            Ok(())
        }
        Commands::LookupUser { address } => {
            let db = open_registry(&config).await?;
            let id = db.lookup_user_by_address(address).await?;
            writeln!(io::stdout(), "{id}")?;
            Ok(())
        }
        Commands::Sync => sync_once(&config).await,
        Commands::GenCerts {
            out,
            sans,
            client_cn,
        } => {
            let dir = match out.or_else(|| config.control.cert_dir.clone()) {
                Some(dir) => dir,
                None => default_cert_dir().context("Cannot determine home directory")?,
            };
            let names = sans.iter().map(String::as_str).collect::<Vec<_>>();
            let bundle = generate_dev_bundle(&names, &client_cn)?;
            write_dev_certs(&dir, &bundle)?;
            writeln!(io::stdout(), "{}", dir.display())?;
            Ok(())
        }
        Commands::GenKey => {
            let keys = KeyPair::generate();
            let mut out = io::stdout();
            writeln!(out, "private_key = {}", keys.private_key().to_base64())?;
            writeln!(out, "public_key  = {}", keys.public_key().to_base64())?;
            Ok(())
        }
    }
}

async fn open_registry(config: &NodeConfig) -> Result<RegistryDatabase> {
    let path = match &config.database.path {
        Some(path) => path.clone(),
        None => default_database_path().context("Cannot determine home directory")?,
    };
    info!(path = %path.display(), "Opening registry database");
    Ok(RegistryDatabase::open(&path).await?)
}

fn apply_overrides(config: &mut NodeConfig, args: ServeArgs) {
    if let Some(role) = args.role {
        config.role = role;
    }
    if let Some(interface) = args.interface {
        config.tunnel.interface = interface;
    }
    if args.address.is_some() {
        config.tunnel.address = args.address;
    }
    if args.private_key.is_some() {
        config.tunnel.private_key = args.private_key;
    }
    if let Some(port) = args.listen_port {
        config.tunnel.listen_port = port;
    }
    if let Some(mtu) = args.mtu {
        config.tunnel.mtu = mtu;
    }
    if let Some(bind) = args.bind {
        config.control.bind = bind;
    }
    if args.cert_dir.is_some() {
        config.control.cert_dir = args.cert_dir;
    }
}

async fn serve(mut config: NodeConfig, args: ServeArgs) -> Result<()> {
    apply_overrides(&mut config, args);
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        role = ?config.role,
        bind = %config.control.bind,
        "Starting guardmesh"
    );

    // Clients run the tunnel only and never touch the registry.
    let (db, tls) = if config.role == NodeRole::Server {
        let cert_dir = match &config.control.cert_dir {
            Some(dir) => dir.clone(),
            None => default_cert_dir().context("Cannot determine home directory")?,
        };
        (
            Some(open_registry(&config).await?),
            Some(load_server_config(&cert_dir)?),
        )
    } else {
        (None, None)
    };

    let provider = UapiProvider::new(&config.tunnel.userspace_binary, &config.tunnel.uapi_dir);
    let node = Node::new(config, db, Box::new(provider), Box::new(IpCommand), tls)?;
    node.run(shutdown_signal()).await?;

    info!("Node stopped");
    Ok(())
}

async fn sync_once(config: &NodeConfig) -> Result<()> {
    let db = open_registry(config).await?;
    let socket = UapiProvider::new(&config.tunnel.userspace_binary, &config.tunnel.uapi_dir)
        .socket_path(&config.tunnel.interface);
    let device = UapiDevice::connect(config.tunnel.interface.clone(), socket);
    let tunnel = TunnelAdapter::attach(Box::new(device), Box::new(IpCommand)).await?;
    let report = Synchronizer::new(db).sync(&tunnel).await?;
    writeln!(
        io::stdout(),
        "relays={} users={} skipped={}",
        report.relays,
        report.users,
        report.skipped
    )?;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C shutdown signal"),
        () = sigterm => info!("Received SIGTERM shutdown signal"),
    }
}
