//! netsession demo node.
//!
//! Echo server for the TLV, WebSocket and HTTP codecs, with idle scanning and
//! graceful shutdown on SIGINT/SIGTERM.

use anyhow::Context;
use clap::Parser;
use netsession_session::{
    listen_tcp, DispatchMode, EventSink, FrameCodec, IdleKind, IoDirection, Server, Session,
    SessionGroup,
};
use netsession_wire::{HttpCodec, HttpMessage, NetMessage, TlvCodec, WebMessage, WebSocketCodec};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
#[macro_use]
mod logging;

use config::{NodeConfig, Protocol};
use logging::NodeLogFormatter;

#[cfg(feature = "tls")]
use netsession_session::{make_server_config, tls_acceptor, TlsServer};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum IdleArg {
    Receive,
    Send,
    Both,
    Either,
}

impl From<IdleArg> for IdleKind {
    fn from(arg: IdleArg) -> Self {
        match arg {
            IdleArg::Receive => IdleKind::Receive,
            IdleArg::Send => IdleKind::Send,
            IdleArg::Both => IdleKind::Both,
            IdleArg::Either => IdleKind::Either,
        }
    }
}

/// Echo node built on netsession
#[derive(Parser, Debug)]
#[command(name = "netsession", version, about = "Echo server for TLV, WebSocket and HTTP sessions")]
struct Args {
    /// Protocol to serve
    #[arg(long, value_enum)]
    protocol: Option<Protocol>,

    /// Listen address, e.g. 0.0.0.0:9000
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Idle threshold, e.g. 30s; 0s disables idle scanning
    #[arg(long)]
    idle_timeout: Option<humantime::Duration>,

    /// Which inactivity counts as idle
    #[arg(long, value_enum)]
    idle_kind: Option<IdleArg>,

    /// Maximum concurrent clients (0 = unlimited)
    #[arg(long)]
    max_clients: Option<usize>,

    /// Deliver each session's messages on one ordered worker
    #[arg(long)]
    ordered: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    // TLS options
    /// Enable TLS
    #[arg(long)]
    tls: bool,

    /// Path to TLS certificate file (PEM format)
    #[arg(long, requires = "tls")]
    tls_cert: Option<PathBuf>,

    /// Path to TLS private key file (PEM format)
    #[arg(long, requires = "tls")]
    tls_key: Option<PathBuf>,

    /// Path to CA certificate file; clients must then present a certificate
    #[arg(long, requires = "tls")]
    tls_ca: Option<PathBuf>,

    /// Configuration file path
    #[arg(long, default_value = "netsession.yaml")]
    config: PathBuf,
}

impl Args {
    fn apply(&self, config: &mut NodeConfig) {
        if let Some(protocol) = self.protocol {
            config.protocol = protocol;
        }
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(threshold) = self.idle_timeout {
            config.idle.threshold = threshold.into();
        }
        if let Some(kind) = self.idle_kind {
            config.idle.kind = kind.into();
        }
        if let Some(max) = self.max_clients {
            config.max_clients = max;
        }
        if self.ordered {
            config.session.dispatch = DispatchMode::Ordered;
        }
        if self.tls {
            config.tls.enabled = true;
        }
        let path = |p: &Option<PathBuf>| p.as_ref().map(|p| p.display().to_string());
        if let Some(cert) = path(&self.tls_cert) {
            config.tls.cert_file = cert;
        }
        if let Some(key) = path(&self.tls_key) {
            config.tls.key_file = key;
        }
        if let Some(ca) = path(&self.tls_ca) {
            config.tls.ca_file = ca;
        }
    }
}

struct TlvEcho;

impl EventSink<TlvCodec> for TlvEcho {
    fn on_connect(&self, session: &Arc<Session<TlvCodec>>) {
        component_info!("echo", "Client {} connected from {:?}", session.id(), session.remote_addr());
    }

    fn on_disconnect(&self, session: &Arc<Session<TlvCodec>>) {
        let stats = session.stats();
        component_info!(
            "echo",
            "Client {} disconnected ({} messages in, {} frames out)",
            session.id(),
            stats.messages_received,
            stats.frames_sent
        );
    }

    fn on_receive(&self, session: &Arc<Session<TlvCodec>>, message: NetMessage) -> anyhow::Result<()> {
        component_debug!(
            "echo",
            "Client {} sent type {} ({} bytes)",
            session.id(),
            message.msg_type,
            message.body.len()
        );
        session.send(message);
        Ok(())
    }

    fn on_idle(&self, session: &Arc<Session<TlvCodec>>, direction: IoDirection) {
        component_warn!("echo", "Client {} idle ({:?}), closing", session.id(), direction);
        session.close(true);
    }
}

struct WebSocketEcho;

impl EventSink<WebSocketCodec> for WebSocketEcho {
    fn on_connect(&self, session: &Arc<Session<WebSocketCodec>>) {
        component_info!("ws", "Client {} connected from {:?}", session.id(), session.remote_addr());
    }

    fn on_receive(&self, session: &Arc<Session<WebSocketCodec>>, message: WebMessage) -> anyhow::Result<()> {
        match message {
            WebMessage::Handshake(handshake) => {
                component_info!(
                    "ws",
                    "Client {} upgraded on {}",
                    session.id(),
                    handshake.path().unwrap_or("/")
                );
            }
            WebMessage::Text(_) | WebMessage::Binary(_) => {
                session.send(message);
            }
            WebMessage::Ping(_) | WebMessage::Pong(_) | WebMessage::Close => {}
        }
        Ok(())
    }
}

struct HttpEcho;

impl EventSink<HttpCodec> for HttpEcho {
    fn on_receive(&self, session: &Arc<Session<HttpCodec>>, request: HttpMessage) -> anyhow::Result<()> {
        let path = request.path().unwrap_or("/").to_string();
        component_debug!(
            "http",
            "Client {} {} {}",
            session.id(),
            request.method().unwrap_or("?"),
            path
        );
        let body = if request.body.is_empty() {
            path.into_bytes().into()
        } else {
            request.body
        };
        session.send(HttpMessage::response(200, "OK").with_body(body));
        Ok(())
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "info,netsession={0},netsession_session={0},netsession_wire={0}",
            args.log_level
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .event_format(NodeLogFormatter::new("netsession"))
        .init();

    info!("Starting netsession node v{}", env!("CARGO_PKG_VERSION"));

    let mut config = NodeConfig::load_from_file(&args.config);
    args.apply(&mut config);

    match config.protocol {
        Protocol::Tlv => {
            let mut codec = TlvCodec::new();
            if config.max_message_size > 0 {
                codec = codec.with_max_message_size(config.max_message_size);
            }
            run(codec, Arc::new(TlvEcho), &config).await
        }
        Protocol::Websocket => {
            let mut codec = WebSocketCodec::new();
            if config.max_message_size > 0 {
                codec = codec.with_max_message_size(config.max_message_size);
            }
            run(codec, Arc::new(WebSocketEcho), &config).await
        }
        Protocol::Http => {
            let mut codec = HttpCodec::new().with_custom_headers([("Server", "netsession")]);
            if config.max_message_size > 0 {
                codec = codec.with_max_message_size(config.max_message_size);
            }
            run(codec, Arc::new(HttpEcho), &config).await
        }
    }
}

async fn run<C: FrameCodec>(
    codec: C,
    sink: Arc<dyn EventSink<C>>,
    config: &NodeConfig,
) -> anyhow::Result<()> {
    let group = SessionGroup::new();
    let server = Server::new(codec, sink)
        .with_group(group.clone())
        .with_session_config(config.session.clone())
        .with_max_clients(config.max_clients);

    #[cfg(feature = "tls")]
    let server = if config.tls.enabled {
        server.with_tls(load_tls(&config.tls).await?)
    } else {
        server
    };

    #[cfg(not(feature = "tls"))]
    if config.tls.enabled {
        anyhow::bail!("TLS requested but not compiled with TLS support. Build with --features tls");
    }

    group
        .set_idle_time(config.idle.kind, config.idle.threshold)
        .await;

    let listener = listen_tcp(config.listen)
        .await
        .with_context(|| format!("Failed to listen on {}", config.listen))?;
    component_info!(
        "node",
        "Serving {:?} on {} (TLS: {})",
        config.protocol,
        config.listen,
        config.tls.enabled
    );

    server.serve(listener, shutdown_signal()).await;

    component_info!("node", "Shutting down, {} session(s) open", group.session_count());
    group.stop_checking_idle().await;
    group.close_all(false);

    let deadline = Instant::now() + SHUTDOWN_GRACE;
    while group.session_count() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    group.close_all(true);

    info!("netsession node shutdown complete");
    Ok(())
}

#[cfg(feature = "tls")]
async fn load_tls(tls: &config::TlsConfig) -> anyhow::Result<TlsServer> {
    if tls.cert_file.is_empty() || tls.key_file.is_empty() {
        anyhow::bail!("TLS enabled but missing certificate files (--tls-cert, --tls-key)");
    }
    let cert_pem = tokio::fs::read_to_string(&tls.cert_file)
        .await
        .with_context(|| format!("Failed to read TLS certificate file: {}", tls.cert_file))?;
    let key_pem = tokio::fs::read_to_string(&tls.key_file)
        .await
        .with_context(|| format!("Failed to read TLS key file: {}", tls.key_file))?;
    let ca_pem = if tls.ca_file.is_empty() {
        None
    } else {
        Some(
            tokio::fs::read_to_string(&tls.ca_file)
                .await
                .with_context(|| format!("Failed to read TLS CA file: {}", tls.ca_file))?,
        )
    };

    let server_config = make_server_config(&cert_pem, &key_pem, ca_pem.as_deref())?;
    Ok(tls_acceptor(server_config))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                component_warn!("node", "Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl-C");
    }
}
