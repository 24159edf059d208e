//! fvpc — FVP client CLI
//!
//! Usage:
//!   fvpc connect --server 192.0.2.1:1194
//!   fvpc status
//!   fvpc disconnect

use std::net::UdpSocket;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::error;

use fvp::client::{self, ClientSession, ClientState, CLIENT_TUN_NAME, STATE_FILE};
use fvp::protocol;
use fvp::signal;
use fvp::tun::TunDevice;

#[derive(Parser)]
#[command(name = "fvpc", version, about = "FVP client — fast point-to-multipoint VPN")]
struct Cli {
    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a VPN server and run until signalled
    Connect {
        /// Server address (host:port)
        #[arg(long)]
        server: String,

        /// Claim a provisioned client id instead of requesting assignment
        #[arg(long, default_value_t = 0)]
        id: u8,
    },
    /// Disconnect from the VPN server
    Disconnect,
    /// Show connection status
    Status,
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
        Commands::Connect { server, id } => cmd_connect(&server, id),
        Commands::Disconnect => cmd_disconnect(),
        Commands::Status => cmd_status(),
        Commands::Version => println!("fvpc {}", env!("CARGO_PKG_VERSION")),
    }
}

fn cmd_connect(server: &str, claimed_id: u8) {
    let socket = UdpSocket::bind("0.0.0.0:0").unwrap_or_else(|e| {
        eprintln!("Failed to bind UDP socket: {}", e);
        std::process::exit(1);
    });
    socket.connect(server).unwrap_or_else(|e| {
        eprintln!("Failed to resolve server address {}: {}", server, e);
        std::process::exit(1);
    });

    let handshake = client::authenticate(&socket, claimed_id).unwrap_or_else(|e| {
        eprintln!("Failed to connect to server: {}", e);
        std::process::exit(1);
    });

    let tun = TunDevice::create(CLIENT_TUN_NAME).unwrap_or_else(|e| {
        error!("Failed to create TUN interface: {}", e);
        error!("Are you running as root? (sudo fvpc connect ...)");
        std::process::exit(1);
    });
    tun.configure(&handshake.inner_ip.to_string(), 24).unwrap_or_else(|e| {
        error!("Failed to configure {}: {}", CLIENT_TUN_NAME, e);
        std::process::exit(1);
    });

    let state = ClientState {
        server: server.to_string(),
        peer_id: handshake.peer_id,
        inner_ip: handshake.inner_ip.to_string(),
        interface: CLIENT_TUN_NAME.to_string(),
    };

    let session = ClientSession::start(socket, Arc::new(tun), handshake).unwrap_or_else(|e| {
        eprintln!("Failed to start tunnel: {}", e);
        std::process::exit(1);
    });

    if let Err(e) = state.write(Path::new(STATE_FILE)) {
        error!("Failed to write client state: {}", e);
    }

    println!("Connected to VPN server at {}", server);
    println!("Client ID: {}", session.peer_id());
    println!("Assigned IP: {}", session.inner_ip());
    println!("Press Ctrl+C to disconnect");

    let running = session.running();
    signal::install_shutdown_handler(running.clone());
    while running.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(200));
    }

    session.shutdown();
    ClientState::clear(Path::new(STATE_FILE));
    println!("Disconnected from VPN server");
}

fn cmd_disconnect() {
    match ClientState::read(Path::new(STATE_FILE)) {
        Ok(state) => {
            println!("Connected to {} as client {}", state.server, state.peer_id);
            println!("The tunnel runs in the foreground; press Ctrl+C in that session to disconnect");
        }
        Err(_) => println!("Not connected"),
    }
}

fn cmd_status() {
    match ClientState::read(Path::new(STATE_FILE)) {
        Ok(state) => {
            println!("Connection Status:");
            println!("  Server: {}", state.server);
            println!("  Client ID: {}", state.peer_id);
            println!("  Assigned IP: {}", state.inner_ip);
            println!("  Interface: {}", state.interface);
        }
        Err(_) => println!("Not connected"),
    }
}
