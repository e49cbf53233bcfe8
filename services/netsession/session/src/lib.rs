//! TCP/TLS sessions for netsession: read/write loops, bounded queues,
//! lifecycle callbacks and idle scanning.
//!
//! A [`Session`] wraps one established stream and a [`FrameCodec`]. Once
//! opened it reads, reassembles and decodes frames, dispatches messages to an
//! [`EventSink`], and writes queued frames in order. Sessions live in a
//! [`SessionGroup`], which can scan its members for inactivity.
//!
//! ## Features
//!
//! - **Transports**: plain TCP, in-memory duplex pipes and (feature `tls`)
//!   rustls streams behind one [`IoStream`]
//! - **Backpressure**: per-direction queue bounds with keep-old, keep-new or
//!   report-and-drop overflow policies
//! - **Exactly-once lifecycle**: `on_connect`/`on_disconnect` fire once per
//!   session, whatever mix of errors, idle hits and explicit closes races
//! - **Dispatch modes**: inline, pooled, or one ordered worker per session
//!
//! ## Example
//!
//! ```rust,no_run
//! use netsession_session::{listen_tcp, EventSink, IdleKind, Server, Session};
//! use netsession_wire::{NetMessage, TlvCodec};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct Echo;
//!
//! impl EventSink<TlvCodec> for Echo {
//!     fn on_receive(&self, session: &Arc<Session<TlvCodec>>, message: NetMessage) -> anyhow::Result<()> {
//!         session.send(message);
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let server = Server::new(TlvCodec::new(), Arc::new(Echo));
//! server
//!     .group()
//!     .set_idle_time(IdleKind::Both, Duration::from_secs(30))
//!     .await;
//!
//! let listener = listen_tcp("127.0.0.1:9000".parse()?).await?;
//! server
//!     .serve(listener, async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod context;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod group;
mod panic;
pub mod queue;
pub mod server;
pub mod session;
pub mod transport;

// Re-export main types
pub use context::{AttributeValue, Attributes};
pub use dispatch::{DispatchMode, OrderedWorker};
pub use error::{ErrorKind, IdleKind, IoDirection, SessionError};
pub use event::EventSink;
pub use group::{IdleConfig, SessionGroup};
pub use panic::PanicMessage;
pub use queue::{OverflowPolicy, PushOutcome, QueueConfig, SessionQueue};
pub use server::{Client, Server};
pub use session::{Session, SessionConfig, SessionState, SessionStats};
pub use transport::{connect_tcp, connect_tcp_timeout, listen_tcp, IoStream};

pub use netsession_wire::FrameCodec;

// Re-export TLS functionality when available
#[cfg(feature = "tls")]
pub use transport::tls::{
    accept_tls, connect_tls, make_client_config, make_server_config, tls_acceptor, TlsServer,
};
