//! Accept and connect glue: turns established streams into open sessions.

use crate::error::{ErrorKind, SessionError};
use crate::event::EventSink;
use crate::group::SessionGroup;
use crate::session::{Session, SessionConfig};
use crate::transport::{connect_tcp, connect_tcp_timeout, IoStream};
use netsession_wire::FrameCodec;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

#[cfg(feature = "tls")]
use crate::transport::tls::{accept_tls, connect_tls, TlsServer};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Counts an accepted connection against the client limit until its session
/// is open and registered
struct PendingSlot(Arc<AtomicUsize>);

impl PendingSlot {
    fn claim(pending: &Arc<AtomicUsize>) -> Self {
        pending.fetch_add(1, Ordering::AcqRel);
        Self(pending.clone())
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Accepts connections and opens a session for each
pub struct Server<C: FrameCodec> {
    codec: Arc<C>,
    sink: Arc<dyn EventSink<C>>,
    group: Arc<SessionGroup<C>>,
    config: SessionConfig,
    max_clients: usize,
    pending: Arc<AtomicUsize>,
    #[cfg(feature = "tls")]
    tls: Option<TlsServer>,
}

impl<C: FrameCodec> Server<C> {
    /// Server with its own group, default session config and no client limit
    pub fn new(codec: C, sink: Arc<dyn EventSink<C>>) -> Self {
        Self {
            codec: Arc::new(codec),
            sink,
            group: SessionGroup::new(),
            config: SessionConfig::default(),
            max_clients: 0,
            pending: Arc::new(AtomicUsize::new(0)),
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    /// Register sessions in `group` instead of a private one
    pub fn with_group(mut self, group: Arc<SessionGroup<C>>) -> Self {
        self.group = group;
        self
    }

    /// Config applied to every accepted session
    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Refuse connections while `max` sessions are open or still completing
    /// their TLS handshake; 0 is unlimited
    pub fn with_max_clients(mut self, max: usize) -> Self {
        self.max_clients = max;
        self
    }

    /// Run a TLS handshake on every accepted connection
    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, acceptor: TlsServer) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// The group accepted sessions join
    pub fn group(&self) -> &Arc<SessionGroup<C>> {
        &self.group
    }

    /// Accept until `shutdown` resolves. Open sessions are left running.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let local = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        info!("Accepting connections on {}", local);
        tokio::pin!(shutdown);

        loop {
            let accepted = tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((tcp_stream, peer_addr)) => self.accept(tcp_stream, peer_addr),
                Err(e) => {
                    error!("Accept error on {} ({:?}): {}", local, ErrorKind::LISTEN, e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        info!("Stopped accepting connections on {}", local);
    }

    /// Whether open sessions plus pending handshakes have reached the limit
    fn at_capacity(&self) -> bool {
        self.max_clients > 0
            && self.group.session_count() + self.pending.load(Ordering::Acquire) >= self.max_clients
    }

    fn accept(&self, tcp_stream: TcpStream, peer_addr: SocketAddr) {
        if self.at_capacity() {
            warn!(
                "Refusing connection from {}: {} clients connected",
                peer_addr, self.max_clients
            );
            return;
        }
        debug!("Accepted TCP connection from {}", peer_addr);

        let id = self.group.next_id();
        let slot = PendingSlot::claim(&self.pending);

        #[cfg(feature = "tls")]
        if let Some(acceptor) = self.tls.clone() {
            let codec = self.codec.clone();
            let sink = self.sink.clone();
            let group = self.group.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                match accept_tls(&acceptor, tcp_stream).await {
                    Ok(stream) => {
                        Session::new(id, stream, codec, sink, Some(&group), config).open();
                    }
                    Err(e) => warn!("TLS handshake failed with {}: {:#}", peer_addr, e),
                }
                drop(slot);
            });
            return;
        }

        Session::new(
            id,
            IoStream::Plain(tcp_stream),
            self.codec.clone(),
            self.sink.clone(),
            Some(&self.group),
            self.config.clone(),
        )
        .open();
        drop(slot);
    }
}

/// Opens outbound sessions
pub struct Client<C: FrameCodec> {
    codec: Arc<C>,
    sink: Arc<dyn EventSink<C>>,
    group: Arc<SessionGroup<C>>,
    config: SessionConfig,
    #[cfg(feature = "tls")]
    tls: Option<(Arc<rustls::ClientConfig>, String)>,
}

impl<C: FrameCodec> Client<C> {
    /// Client with its own group and default session config
    pub fn new(codec: C, sink: Arc<dyn EventSink<C>>) -> Self {
        Self {
            codec: Arc::new(codec),
            sink,
            group: SessionGroup::new(),
            config: SessionConfig::default(),
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    /// Register sessions in `group` instead of a private one
    pub fn with_group(mut self, group: Arc<SessionGroup<C>>) -> Self {
        self.group = group;
        self
    }

    /// Config applied to every session
    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Wrap connections in TLS, verifying the server as `server_name`
    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, config: Arc<rustls::ClientConfig>, server_name: impl Into<String>) -> Self {
        self.tls = Some((config, server_name.into()));
        self
    }

    /// The group connected sessions join
    pub fn group(&self) -> &Arc<SessionGroup<C>> {
        &self.group
    }

    /// Connect and open a session. With `timeout`, a connect still pending
    /// after it is abandoned with [`SessionError::ConnectTimeout`].
    pub async fn connect(
        &self,
        addr: SocketAddr,
        timeout: Option<Duration>,
    ) -> Result<Arc<Session<C>>, SessionError> {
        let result = match timeout {
            Some(timeout) => connect_tcp_timeout(addr, timeout).await,
            None => connect_tcp(addr).await.map_err(SessionError::from),
        };
        let tcp_stream = result.map_err(|e| {
            warn!("Connect to {} failed ({:?}): {}", addr, ErrorKind::CONNECT, e);
            e
        })?;

        let stream = self.secure(tcp_stream).await?;
        let session = Session::new(
            self.group.next_id(),
            stream,
            self.codec.clone(),
            self.sink.clone(),
            Some(&self.group),
            self.config.clone(),
        );
        session.open();
        Ok(session)
    }

    #[cfg(feature = "tls")]
    async fn secure(&self, tcp_stream: TcpStream) -> Result<IoStream, SessionError> {
        match &self.tls {
            Some((config, server_name)) => connect_tls(config.clone(), tcp_stream, server_name)
                .await
                .map_err(|e| SessionError::Tls(format!("{:#}", e))),
            None => Ok(IoStream::Plain(tcp_stream)),
        }
    }

    #[cfg(not(feature = "tls"))]
    async fn secure(&self, tcp_stream: TcpStream) -> Result<IoStream, SessionError> {
        Ok(IoStream::Plain(tcp_stream))
    }
}
