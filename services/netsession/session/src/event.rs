//! Application callbacks.

use crate::error::{ErrorKind, IoDirection, SessionError};
use crate::session::Session;
use netsession_wire::FrameCodec;
use std::sync::Arc;
use tracing::{debug, warn};

/// Callbacks the engine invokes on session lifecycle and I/O events.
///
/// Callbacks run synchronously on whichever task completed the triggering
/// I/O or scan; they must not block for long. Panics are caught and reported
/// through [`EventSink::on_error`] as [`ErrorKind::PROCESS`], except panics in
/// `on_error` and `on_disconnect` themselves, which are only logged.
///
/// The session passed to `on_disconnect` is mid-teardown: it is no longer
/// open but still reachable by id until the callback returns.
pub trait EventSink<C: FrameCodec>: Send + Sync + 'static {
    /// Session is open and reading
    fn on_connect(&self, _session: &Arc<Session<C>>) {}

    /// Session left the open state. Fires exactly once per opened session.
    fn on_disconnect(&self, _session: &Arc<Session<C>>) {}

    /// A message handed to [`Session::send`] was fully written
    fn on_send(&self, _session: &Arc<Session<C>>, _message: &C::Message) {}

    /// A decoded message arrived. An `Err` is reported as
    /// `RECEIVE | PROCESS` and does not stop the read loop.
    fn on_receive(&self, session: &Arc<Session<C>>, message: C::Message) -> anyhow::Result<()>;

    /// No traffic for the configured threshold. Closes the session unless
    /// overridden.
    fn on_idle(&self, session: &Arc<Session<C>>, direction: IoDirection) {
        debug!("Closing idle session {} ({:?})", session.id(), direction);
        session.close(true);
    }

    /// Something failed. Closes the session on network errors unless
    /// overridden.
    fn on_error(&self, session: &Arc<Session<C>>, kind: ErrorKind, error: &SessionError) {
        if kind.is_network_error() {
            warn!("Session {} network error: {}", session.id(), error);
            session.close(true);
        } else {
            debug!("Session {} error ({:?}): {}", session.id(), kind, error);
        }
    }
}
