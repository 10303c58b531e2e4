//! Outway tunnel daemon
//!
//! Connects the device to a Shadowsocks proxy: starts the privileged
//! routing helper and the tun2socks forwarding process, keeps them alive
//! across network changes, and tears both down on Ctrl-C.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};

use outway_core::persisted::LastTunnel;
use outway_core::{TransportConfig, tracing_init::init_tracing};
use outway_tunnel::connectivity;
use outway_tunnel::orchestrator::{PlatformCapabilities, TunnelSession};
use outway_tunnel::routing::OsRoutingDaemon;
use outway_tunnel::store::LastTunnelStore;
use outway_tunnel::tun2socks::Tun2socksController;

#[derive(Parser, Debug)]
#[command(name = "outway-tunnel")]
#[command(version, about = "Outway tunnel daemon - routes device traffic through a proxy")]
struct Args {
    /// Path to the tun2socks binary
    #[arg(long, default_value = "tun2socks", env = "OUTWAY_TUN2SOCKS_BIN")]
    tun2socks_bin: PathBuf,

    /// Path to a JSON transport config (host, port, method, password)
    #[arg(long, env = "OUTWAY_ACCESS_CONFIG")]
    access_config: Option<PathBuf>,

    /// Display name persisted with the tunnel
    #[arg(long, default_value = "Outway Server", env = "OUTWAY_SERVER_NAME")]
    server_name: String,

    /// Unix socket of the privileged routing service
    #[arg(
        long,
        default_value = "/var/run/outway/routing.sock",
        env = "OUTWAY_ROUTING_SOCKET"
    )]
    routing_socket: PathBuf,

    /// TUN device name
    #[arg(long, default_value = "outway-tun0", env = "OUTWAY_TUN_NAME")]
    tun_name: String,

    /// Reconnect to the persisted tunnel, skipping the pre-connect probe
    #[arg(long)]
    auto_connect: bool,

    /// Verbose tun2socks logging and output passthrough
    #[arg(long, env = "OUTWAY_VERBOSE")]
    verbose: bool,

    /// Override the persisted-state file location
    #[arg(long, env = "OUTWAY_STATE_FILE")]
    state_file: Option<PathBuf>,

    /// Output logs as JSON (for structured log aggregation)
    #[arg(long, env = "OUTWAY_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing("outway_tunnel=info", args.log_json);

    let state_path = args
        .state_file
        .clone()
        .or_else(LastTunnelStore::default_path)
        .context("cannot determine a state file location")?;
    let store = LastTunnelStore::new(state_path);

    let (tunnel_id, name, transport, udp_hint) = if args.auto_connect {
        let Some(last) = store.load()? else {
            bail!("--auto-connect requested but no tunnel was persisted");
        };
        (last.id, last.name, last.transport, last.udp_enabled)
    } else {
        let config_path = args
            .access_config
            .as_ref()
            .context("--access-config is required unless --auto-connect is set")?;
        let text = std::fs::read_to_string(config_path)
            .with_context(|| format!("reading {}", config_path.display()))?;
        let transport: TransportConfig = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", config_path.display()))?;
        (
            uuid::Uuid::new_v4().to_string(),
            args.server_name.clone(),
            transport,
            true,
        )
    };
    transport.validate()?;

    // Resolve once: the routing service needs the literal IP, and the
    // resolved config short-circuits the session's own lookup.
    let proxy_ip = connectivity::resolve_proxy_host(&transport.host, transport.port).await?;
    let resolved = transport.with_host(proxy_ip.to_string());

    let routing = OsRoutingDaemon::new(
        args.routing_socket.clone(),
        proxy_ip.to_string(),
        args.auto_connect,
    );
    let forwarder = Tun2socksController::new(args.tun2socks_bin.clone(), args.tun_name.clone());
    forwarder.set_verbose(args.verbose);

    let capabilities = PlatformCapabilities {
        tun_device_name: args.tun_name.clone(),
        ..PlatformCapabilities::default()
    };
    let session = TunnelSession::with_id(tunnel_id.clone(), routing, forwarder, capabilities);
    session.set_udp_enabled(udp_hint);

    let mut status_rx = session.subscribe_status();
    tokio::spawn(async move {
        while let Ok(event) = status_rx.recv().await {
            info!(tunnel_id = %event.tunnel_id, status = %event.status, "tunnel status");
        }
    });

    session.connect(&resolved, args.auto_connect).await?;
    store.save(&LastTunnel {
        id: tunnel_id,
        name,
        transport,
        udp_enabled: session.udp_enabled(),
    })?;
    info!("tunnel established, press Ctrl-C to disconnect");

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("listening for Ctrl-C")?;
            info!("interrupt received, disconnecting");
            if let Err(e) = session.disconnect().await {
                warn!(error = %e, "disconnect reported an error");
            }
            store.clear()?;
        }
        () = session.wait_until_stopped() => {
            warn!("tunnel stopped on its own");
        }
    }
    session.wait_until_stopped().await;
    Ok(())
}
