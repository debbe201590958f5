use anyhow::Context;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use yakphone::application::media::NullAudioDevice;
use yakphone::application::{ControlBridge, Engine, EngineConfig};
use yakphone::config::Settings;
use yakphone::infrastructure::protocols::sip::{Transport, UdpTransport};
use yakphone::interface::api::{build_router, init_metrics};
use yakphone::interface::shutdown_signal;

const INBOUND_QUEUE_DEPTH: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting yakphone {}", env!("CARGO_PKG_VERSION"));
    info!(
        "Extension {} on {}, API on {}",
        settings.extension,
        settings.sip_server,
        settings.api_addr()
    );

    let prometheus_handle = init_metrics().context("Failed to install metrics recorder")?;

    let server_addr = resolve_server(&settings.server_host_port()).await?;
    let local_ip = match &settings.local_ip {
        Some(ip) => ip.parse::<IpAddr>()?,
        None => discover_local_ip(server_addr)?,
    };

    // Start SIP transport; without a socket there is nothing to do
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
    let transport = UdpTransport::bind(settings.sip_bind_addr(), inbound_tx)
        .await
        .context("Failed to start SIP transport")?;
    let advertised = SocketAddr::new(local_ip, transport.local_addr().port());
    let transport = Arc::new(transport.with_advertised_addr(advertised));
    info!("Advertising {} to {}", advertised, server_addr);

    let config = EngineConfig::from_settings(&settings, advertised, server_addr)?;
    let engine = Engine::spawn(config, transport, inbound_rx, Arc::new(NullAudioDevice));

    // Start REST API server
    let app = build_router(ControlBridge::new(engine.clone()), prometheus_handle);
    let listener = tokio::net::TcpListener::bind(settings.api_addr())
        .await
        .with_context(|| format!("Failed to bind API on {}", settings.api_addr()))?;
    info!("REST API server started on {}", settings.api_addr());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.shutdown().await;
    info!("yakphone stopped");
    Ok(())
}

async fn resolve_server(host_port: &str) -> anyhow::Result<SocketAddr> {
    tokio::net::lookup_host(host_port)
        .await
        .with_context(|| format!("Failed to resolve SIP server {}", host_port))?
        .find(|addr| addr.is_ipv4())
        .with_context(|| format!("No IPv4 address for SIP server {}", host_port))
}

/// Address the OS routes towards the server from
fn discover_local_ip(server: SocketAddr) -> anyhow::Result<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
    socket.connect(server)?;
    Ok(socket.local_addr()?.ip())
}
