//! fvps — FVP server daemon and administration CLI
//!
//! Usage:
//!   fvps setup --port 1194 --timeout 30
//!   fvps up
//!   fvps status
//!   fvps add-client / list-clients / remove-client --id N

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::error;

use fvp::config::{self, ServerConfig};
use fvp::crypto;
use fvp::protocol;
use fvp::registry::KeyRegistry;
use fvp::server::{Server, StatusSnapshot, STATUS_FILE, TUN_NAME};
use fvp::signal;
use fvp::tun::TunDevice;

#[derive(Parser)]
#[command(name = "fvps", version, about = "FVP server — fast point-to-multipoint VPN")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = config::CONFIG_FILE)]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the initial server configuration
    Setup {
        /// UDP port to listen on
        #[arg(long)]
        port: String,
        /// Client inactivity timeout in minutes
        #[arg(long)]
        timeout: u64,
    },
    /// Start the VPN server and run until signalled
    Up,
    /// Show server status
    Status,
    /// Provision a new client with a fresh key
    AddClient,
    /// List provisioned clients, merged with the live table when running
    ListClients,
    /// Remove a provisioned client
    RemoveClient {
        /// Client id to remove
        #[arg(long)]
        id: u8,
    },
    /// Show version information
    Version,
}

fn main() {
    if let Err(e) = protocol::init_protocol_version(env!("CARGO_PKG_VERSION")) {
        eprintln!("Warning: failed to initialize protocol version: {}", e);
    }

    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    match cli.command {
        Commands::Setup { port, timeout } => cmd_setup(&cli.config, &port, timeout),
        Commands::Up => cmd_up(&cli.config),
        Commands::Status => cmd_status(),
        Commands::AddClient => cmd_add_client(&cli.config),
        Commands::ListClients => cmd_list_clients(&cli.config),
        Commands::RemoveClient { id } => cmd_remove_client(&cli.config, id),
        Commands::Version => println!("fvps {}", env!("CARGO_PKG_VERSION")),
    }
}

fn cmd_setup(config_path: &Path, port: &str, timeout: u64) {
    if let Err(e) = ServerConfig::create(config_path, port, timeout) {
        eprintln!("Setup failed: {}", e);
        std::process::exit(1);
    }

    println!("Configuration created: {}", config_path.display());
    println!("Server will listen on port {}", port);
    println!("Client timeout: {} minutes", timeout);

    // Probe TUN creation so permission problems surface before `up`.
    match TunDevice::create("fvp-test") {
        Ok(_) => {}
        Err(e) => {
            println!("Warning: TUN interface test failed: {}", e);
            println!("You may need to run with sudo for TUN interface creation");
        }
    }

    println!("Run 'fvps up' to start the server");
}

fn cmd_up(config_path: &Path) {
    let registry = Arc::new(KeyRegistry::load(config_path).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {}", e);
        std::process::exit(1);
    }));

    let tun = TunDevice::create(TUN_NAME).unwrap_or_else(|e| {
        error!("Failed to create TUN interface: {}", e);
        error!("Are you running as root? (sudo fvps up)");
        std::process::exit(1);
    });
    tun.configure("10.0.0.1", 24).unwrap_or_else(|e| {
        error!("Failed to configure {}: {}", TUN_NAME, e);
        std::process::exit(1);
    });

    let server = Server::start(registry, Arc::new(tun)).unwrap_or_else(|e| {
        error!("Failed to start server: {}", e);
        std::process::exit(1);
    });

    let running = server.running();
    signal::install_shutdown_handler(running.clone());
    while running.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(200));
    }

    server.stop();
    println!("Server stopped");
}

fn cmd_status() {
    println!("Server Status:");
    let Some(snapshot) = read_status_snapshot() else {
        println!("  Status: stopped");
        return;
    };

    println!("  Status: {}", if snapshot.server.running { "running" } else { "stopped" });
    println!("  Uptime: {}", format_duration(snapshot.server.uptime_secs));
    println!("  Port: {}", snapshot.server.port);
    println!("  TUN Interface: {}", snapshot.server.interface);
    println!("  Total Clients: {}", snapshot.server.total_peers);
    println!("  Connected Clients: {}", snapshot.server.connected_peers);
}

fn cmd_add_client(config_path: &Path) {
    let registry = load_registry(config_path);

    let id = registry.next_free_id().unwrap_or_else(|| {
        eprintln!("Failed to add client: maximum clients reached (255)");
        std::process::exit(1);
    });
    let key = crypto::generate_key();
    if let Err(e) = registry.add(id, &key) {
        eprintln!("Failed to add client: {}", e);
        std::process::exit(1);
    }

    println!("Client added successfully");
    println!("Client ID: {}", id);
    println!("Key: {}", crypto::encode_key_hex(&key));
    println!("Add this key to your client configuration");
}

fn cmd_list_clients(config_path: &Path) {
    let registry = load_registry(config_path);
    let live: HashMap<u8, (String, bool, u64)> = read_status_snapshot()
        .map(|snapshot| {
            snapshot
                .peers
                .into_iter()
                .map(|p| (p.id, (p.ip, p.connected, p.last_seen_secs)))
                .collect()
        })
        .unwrap_or_default();

    // Provisioned ids plus any live anonymous peers.
    let mut ids = registry.ids();
    for id in live.keys() {
        if !ids.contains(id) {
            ids.push(*id);
        }
    }
    ids.sort_unstable();

    if ids.is_empty() {
        println!("No clients configured");
        return;
    }

    println!("Client Status:");
    println!("ID  IP         Status        Last Connection");
    for id in ids {
        let (ip, status, last) = match live.get(&id) {
            Some((ip, connected, idle)) => (
                ip.clone(),
                if *connected { "Connected" } else { "Disconnected" },
                format!("{} ago", format_duration(*idle)),
            ),
            None => (config::provisioned_ip(id), "Disconnected", "Never".to_string()),
        };
        println!("{:<3} {:<10} {:<13} {}", id, ip, status, last);
    }
}

fn cmd_remove_client(config_path: &Path, id: u8) {
    let registry = load_registry(config_path);
    if let Err(e) = registry.remove(id) {
        eprintln!("Failed to remove client: {}", e);
        std::process::exit(1);
    }
    println!("Client {} removed successfully", id);
}

fn load_registry(config_path: &Path) -> KeyRegistry {
    KeyRegistry::load(config_path).unwrap_or_else(|_| {
        eprintln!("No configuration found, run 'fvps setup' first");
        std::process::exit(1);
    })
}

fn read_status_snapshot() -> Option<StatusSnapshot> {
    let content = std::fs::read_to_string(STATUS_FILE).ok()?;
    serde_json::from_str(&content).ok()
}

fn format_duration(secs: u64) -> String {
    if secs < 60 {
        return format!("{}s", secs);
    }
    if secs < 3600 {
        return format!("{}m {}s", secs / 60, secs % 60);
    }
    if secs < 86400 {
        return format!("{}h {}m", secs / 3600, (secs % 3600) / 60);
    }
    format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
}
