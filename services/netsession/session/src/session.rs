//! Core session state machine.
//!
//! A [`Session`] owns one connection. Opening it spawns a read task and a
//! write task on the current tokio runtime:
//!
//! - the read task appends bytes to the reassembly buffer, runs the codec,
//!   writes back automatic replies, queues decoded messages and dispatches
//!   them to the [`EventSink`]
//! - the write task drains the outbound queue one frame at a time, so at
//!   most one write is in flight and frames hit the wire in queue order
//!
//! Closing is idempotent and may race from any task; exactly one caller
//! performs the teardown and fires `on_disconnect`.

use crate::context::{AttributeValue, Attributes, DecodeContext};
use crate::dispatch::{DispatchMode, OrderedWorker};
use crate::error::{ErrorKind, IdleKind, IoDirection, SessionError};
use crate::event::EventSink;
use crate::group::SessionGroup;
use crate::panic::guarded;
use crate::queue::{OverflowPolicy, PushOutcome, QueueConfig, SessionQueue};
use crate::transport::IoStream;
use bytes::{Bytes, BytesMut};
use netsession_wire::{Decoded, FrameCodec};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use socket2::SockRef;
use std::any::Any;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Read buffer size when neither the config nor the socket provides one
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Default inbound queue bound
pub const DEFAULT_INBOUND_DEPTH: usize = 1024;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Configuration for a session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Read buffer size in bytes; 0 uses the socket's receive buffer size
    pub buffer_size: usize,
    /// Inbound (decoded message) queue
    pub inbound: QueueConfig,
    /// Outbound (encoded frame) queue
    pub outbound: QueueConfig,
    /// How decoded messages reach `on_receive`
    pub dispatch: DispatchMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            buffer_size: 0,
            inbound: QueueConfig::bounded(DEFAULT_INBOUND_DEPTH, OverflowPolicy::KeepDefault),
            outbound: QueueConfig::unbounded(),
            dispatch: DispatchMode::Inline,
        }
    }
}

/// Externally visible session state
#[repr(i8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not yet opened, or closed
    Closed = -1,
    /// Opening or tearing down
    Opening = 0,
    /// Open and usable
    Open = 1,
}

/// Traffic counters for a session
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Total bytes received
    pub bytes_in: u64,
    /// Total bytes written
    pub bytes_out: u64,
    /// Messages decoded
    pub messages_received: u64,
    /// Frames written
    pub frames_sent: u64,
}

#[derive(Default)]
struct Counters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    messages_received: AtomicU64,
    frames_sent: AtomicU64,
}

const PHASE_NEW: u8 = 0;
const PHASE_OPENING: u8 = 1;
const PHASE_OPEN: u8 = 2;
const PHASE_CLOSING: u8 = 3;
const PHASE_CLOSED: u8 = 4;

/// An encoded frame waiting for the writer. `message` is `None` for
/// codec-generated replies, which are not reported through `on_send`.
struct Outgoing<M> {
    message: Option<M>,
    frame: Bytes,
}

/// One managed connection
pub struct Session<C: FrameCodec> {
    id: u64,
    codec: Arc<C>,
    sink: Arc<dyn EventSink<C>>,
    group: Weak<SessionGroup<C>>,
    dispatch: DispatchMode,
    buffer_size: AtomicUsize,

    phase: AtomicU8,
    going_to_close: AtomicBool,
    in_flight: AtomicBool,

    transport: Mutex<Option<IoStream>>,
    socket: Mutex<Option<socket2::Socket>>,
    remote_addr: OnceLock<SocketAddr>,

    last_read: Mutex<Instant>,
    last_write: Mutex<Instant>,
    counters: Counters,

    decode: Mutex<DecodeContext<C>>,
    inbound: SessionQueue<C::Message>,
    outbound: SessionQueue<Outgoing<C::Message>>,
    write_ready: Notify,
    closed_tx: watch::Sender<bool>,
    runtime: OnceLock<Handle>,
    ordered: Mutex<Option<OrderedWorker>>,
    dispatching: AtomicUsize,

    user_data: Mutex<Option<AttributeValue>>,
    attributes: Attributes,
}

impl<C: FrameCodec> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("remote_addr", &self.remote_addr())
            .finish()
    }
}

impl<C: FrameCodec> Session<C> {
    /// Wrap an established stream. The session does nothing until
    /// [`Session::open`] is called.
    pub fn new(
        id: u64,
        stream: IoStream,
        codec: Arc<C>,
        sink: Arc<dyn EventSink<C>>,
        group: Option<&Arc<SessionGroup<C>>>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let (closed_tx, _) = watch::channel(false);
        let now = Instant::now();
        Arc::new(Self {
            id,
            codec,
            sink,
            group: group.map(Arc::downgrade).unwrap_or_default(),
            dispatch: config.dispatch,
            buffer_size: AtomicUsize::new(config.buffer_size),
            phase: AtomicU8::new(PHASE_NEW),
            going_to_close: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
            transport: Mutex::new(Some(stream)),
            socket: Mutex::new(None),
            remote_addr: OnceLock::new(),
            last_read: Mutex::new(now),
            last_write: Mutex::new(now),
            counters: Counters::default(),
            decode: Mutex::new(DecodeContext::default()),
            inbound: SessionQueue::new(config.inbound),
            outbound: SessionQueue::new(config.outbound),
            write_ready: Notify::new(),
            closed_tx,
            runtime: OnceLock::new(),
            ordered: Mutex::new(None),
            dispatching: AtomicUsize::new(0),
            user_data: Mutex::new(None),
            attributes: Attributes::new(),
        })
    }

    /// Session id, unique within its group
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        match self.phase.load(Ordering::Acquire) {
            PHASE_OPEN => SessionState::Open,
            PHASE_OPENING | PHASE_CLOSING => SessionState::Opening,
            _ => SessionState::Closed,
        }
    }

    /// Whether the session is open
    pub fn is_open(&self) -> bool {
        self.phase.load(Ordering::Acquire) == PHASE_OPEN
    }

    /// Whether a graceful close is waiting for the queues to drain
    pub fn is_going_to_close(&self) -> bool {
        self.going_to_close.load(Ordering::Acquire)
    }

    /// Peer address captured when the session opened
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr.get().copied()
    }

    /// The codec this session frames with
    pub fn codec(&self) -> &Arc<C> {
        &self.codec
    }

    /// The group this session belongs to, if it still exists
    pub fn group(&self) -> Option<Arc<SessionGroup<C>>> {
        self.group.upgrade()
    }

    /// Traffic counters
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            bytes_in: self.counters.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.counters.bytes_out.load(Ordering::Relaxed),
            messages_received: self.counters.messages_received.load(Ordering::Relaxed),
            frames_sent: self.counters.frames_sent.load(Ordering::Relaxed),
        }
    }

    /// Session-scoped attributes, cleared on close
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Attach application data, replacing any previous value
    pub fn set_user_data<T: Any + Send + Sync>(&self, data: T) {
        *self.user_data.lock() = Some(Arc::new(data));
    }

    /// Application data of type `T`, if set
    pub fn user_data<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.user_data.lock().clone()?.downcast::<T>().ok()
    }

    fn with_socket<R>(&self, f: impl FnOnce(SockRef<'_>) -> R) -> Option<R> {
        if let Some(socket) = self.socket.lock().as_ref() {
            return Some(f(SockRef::from(socket)));
        }
        let transport = self.transport.lock();
        transport
            .as_ref()
            .and_then(IoStream::tcp)
            .map(|tcp| f(SockRef::from(tcp)))
    }

    /// Kernel buffer size for one direction; `None` without a TCP socket
    pub fn buffer_size(&self, direction: IoDirection) -> Option<usize> {
        self.with_socket(|s| {
            if direction.contains(IoDirection::SEND) && !direction.contains(IoDirection::RECEIVE) {
                s.send_buffer_size()
            } else {
                s.recv_buffer_size()
            }
        })
        .and_then(Result::ok)
    }

    /// Set kernel buffer sizes for one or both directions. Setting the
    /// receive side before `open` also sizes the read buffer.
    pub fn set_buffer_size(&self, direction: IoDirection, size: usize) -> std::io::Result<()> {
        if direction.contains(IoDirection::RECEIVE) {
            self.buffer_size.store(size, Ordering::Release);
        }
        self.with_socket(|s| {
            if direction.contains(IoDirection::RECEIVE) {
                s.set_recv_buffer_size(size)?;
            }
            if direction.contains(IoDirection::SEND) {
                s.set_send_buffer_size(size)?;
            }
            Ok(())
        })
        .unwrap_or(Ok(()))
    }

    /// Change the queue bound for one or both directions; 0 is unbounded
    pub fn set_max_queue_depth(&self, direction: IoDirection, depth: usize) {
        if direction.contains(IoDirection::RECEIVE) {
            self.inbound.set_max_depth(depth);
        }
        if direction.contains(IoDirection::SEND) {
            self.outbound.set_max_depth(depth);
        }
    }

    /// Change the overflow policy for one or both directions
    pub fn set_overflow_policy(&self, direction: IoDirection, policy: OverflowPolicy) {
        if direction.contains(IoDirection::RECEIVE) {
            self.inbound.set_policy(policy);
        }
        if direction.contains(IoDirection::SEND) {
            self.outbound.set_policy(policy);
        }
    }

    /// Queue bound of one direction
    pub fn max_queue_depth(&self, direction: IoDirection) -> usize {
        if direction.contains(IoDirection::SEND) {
            self.outbound.max_depth()
        } else {
            self.inbound.max_depth()
        }
    }

    /// Overflow policy of one direction
    pub fn overflow_policy(&self, direction: IoDirection) -> OverflowPolicy {
        if direction.contains(IoDirection::SEND) {
            self.outbound.policy()
        } else {
            self.inbound.policy()
        }
    }

    /// Items currently queued in one direction
    pub fn queue_len(&self, direction: IoDirection) -> usize {
        if direction.contains(IoDirection::SEND) {
            self.outbound.len()
        } else {
            self.inbound.len()
        }
    }

    /// When data was last read
    pub fn last_read(&self) -> Instant {
        *self.last_read.lock()
    }

    /// When data was last written
    pub fn last_write(&self) -> Instant {
        *self.last_write.lock()
    }

    fn touch_read(&self, n: usize) {
        *self.last_read.lock() = Instant::now();
        self.counters.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn touch_write(&self, n: usize) {
        *self.last_write.lock() = Instant::now();
        self.counters.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
        self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn peer(&self) -> String {
        self.remote_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "local".to_string())
    }

    /// Start the session: register with the group, fire `on_connect` and
    /// spawn the I/O tasks. Only the first call has any effect.
    pub fn open(self: &Arc<Self>) {
        if self
            .phase
            .compare_exchange(PHASE_NEW, PHASE_OPENING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                error!("Cannot open session {}: no tokio runtime", self.id);
                self.report(ErrorKind::RECEIVE, SessionError::NoRuntime);
                self.close(true);
                return;
            }
        };
        self.start(runtime);
    }

    /// Second half of `open`, entered in the OPENING phase. A `close` that
    /// lands while this runs wins: the session is unwound and never reported
    /// as connected.
    fn start(self: &Arc<Self>, runtime: Handle) {
        let Some(stream) = self.transport.lock().take() else {
            self.close(true);
            return;
        };

        if let Ok(addr) = stream.peer_addr() {
            let _ = self.remote_addr.set(addr);
        }
        *self.socket.lock() = stream
            .tcp()
            .and_then(|tcp| SockRef::from(tcp).try_clone().ok());

        if let Some(group) = self.group.upgrade() {
            group.add(self.clone());
        }

        let now = Instant::now();
        *self.last_read.lock() = now;
        *self.last_write.lock() = now;

        let read_size = match self.buffer_size.load(Ordering::Acquire) {
            0 => stream
                .recv_buffer_size()
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_READ_BUFFER_SIZE),
            n => n,
        };

        self.inbound.clear();
        self.outbound.clear();

        let _ = self.runtime.set(runtime.clone());
        if self.dispatch == DispatchMode::Ordered {
            let source = Arc::downgrade(self);
            let target = Arc::downgrade(self);
            *self.ordered.lock() = Some(OrderedWorker::spawn(
                &runtime,
                move || source.upgrade()?.take_for_dispatch(),
                move |message| {
                    if let Some(session) = target.upgrade() {
                        if session.state() != SessionState::Closed {
                            session.deliver(message);
                        }
                        session.dispatched();
                    }
                },
            ));
        }

        if self
            .phase
            .compare_exchange(PHASE_OPENING, PHASE_OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Session {} closed while opening", self.id);
            if let Some(group) = self.group.upgrade() {
                group.remove(self.id);
            }
            self.socket.lock().take();
            if let Some(worker) = self.ordered.lock().take() {
                drop(worker.shutdown());
            }
            return;
        }

        info!(
            "Session {} opened with {} (read buffer {} bytes)",
            self.id,
            self.peer(),
            read_size
        );

        if let Err(panic) = guarded(|| self.sink.on_connect(self)) {
            self.report(ErrorKind::PROCESS, SessionError::Panic(panic.to_string()));
        }

        let (reader, writer) = tokio::io::split(stream);
        runtime.spawn(self.clone().read_loop(reader, read_size));
        runtime.spawn(self.clone().write_loop(writer));
    }

    async fn read_loop(self: Arc<Self>, mut reader: ReadHalf<IoStream>, read_size: usize) {
        let mut closed = self.closed_tx.subscribe();
        let mut buf = vec![0u8; read_size];

        loop {
            if *closed.borrow() {
                break;
            }

            let result = tokio::select! {
                biased;
                _ = closed.changed() => break,
                result = reader.read(&mut buf) => result,
            };

            match result {
                Ok(0) => {
                    debug!("Session {} peer {} closed the connection", self.id, self.peer());
                    self.close(true);
                    break;
                }
                Ok(n) => {
                    self.touch_read(n);
                    if !self.receive(&buf[..n]) {
                        break;
                    }
                }
                Err(e) => {
                    if self.is_open() {
                        self.report(ErrorKind::RECEIVE, e.into());
                    }
                    // never leave an open session without a pending read
                    self.close(true);
                    break;
                }
            }
        }

        trace!("Session {} read loop finished", self.id);
    }

    /// Decode freshly read bytes, send codec replies, queue and dispatch
    /// messages. Returns false once the session must stop reading.
    fn receive(self: &Arc<Self>, data: &[u8]) -> bool {
        let mut out = Decoded::new();
        let result = {
            let mut ctx = self.decode.lock();
            let ctx = &mut *ctx;
            ctx.accumulator.append(data);
            let result = self
                .codec
                .decode(&mut ctx.state, &mut ctx.accumulator, &mut out);
            ctx.accumulator.compact();
            result
        };

        for reply in out.replies.drain(..) {
            self.enqueue(None, reply);
        }

        let decoded = out.messages.len();
        self.counters
            .messages_received
            .fetch_add(decoded as u64, Ordering::Relaxed);
        for message in out.messages.drain(..) {
            self.push_inbound(message);
        }
        self.process_incoming();

        if let Err(e) = result {
            if e.is_protocol_violation() {
                warn!("Session {} protocol violation from {}: {}", self.id, self.peer(), e);
                self.report(ErrorKind::RECEIVE | ErrorKind::CODEC, e.into());
                self.close(true);
                return false;
            }
            self.report(ErrorKind::RECEIVE | ErrorKind::CODEC, e.into());
        }

        if out.close {
            debug!("Session {} closed by peer request", self.id);
            self.close(true);
            return false;
        }

        self.is_open()
    }

    fn push_inbound(self: &Arc<Self>, message: C::Message) {
        match self.inbound.push(message) {
            PushOutcome::Accepted => {}
            PushOutcome::Evicted(_) => {
                trace!("Session {} dropped oldest incoming message", self.id);
            }
            PushOutcome::Rejected(_) => {
                if self.inbound.policy() == OverflowPolicy::KeepDefault {
                    warn!("Session {} incoming queue is full", self.id);
                    self.report(ErrorKind::RECEIVE, SessionError::IncomingQueueFull);
                }
            }
        }
    }

    /// Move queued messages towards the sink, then finish a pending graceful
    /// close if nothing is left.
    ///
    /// Messages leave the inbound queue only when they are about to run, so
    /// the queue bound and overflow policy cover the whole backlog in every
    /// dispatch mode. Pooled dispatch keeps at most `max_depth` messages on
    /// the blocking pool at once.
    fn process_incoming(self: &Arc<Self>) {
        match self.dispatch {
            DispatchMode::Inline => {
                while let Some(message) = self.inbound.pop() {
                    self.deliver(message);
                }
            }
            DispatchMode::Pooled => {
                let Some(runtime) = self.runtime.get() else {
                    return;
                };
                while self.reserve_dispatch(self.inbound.max_depth()) {
                    let Some(message) = self.inbound.pop() else {
                        self.dispatching.fetch_sub(1, Ordering::AcqRel);
                        break;
                    };
                    let session = self.clone();
                    runtime.spawn_blocking(move || {
                        if session.state() != SessionState::Closed {
                            session.deliver(message);
                        }
                        session.dispatched();
                    });
                }
            }
            DispatchMode::Ordered => {
                if let Some(worker) = self.ordered.lock().as_ref() {
                    worker.wake();
                }
            }
        }
        self.finish_graceful_close();
    }

    /// Claim a dispatch slot; `limit == 0` means no limit
    fn reserve_dispatch(&self, limit: usize) -> bool {
        self.dispatching
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (limit == 0 || n < limit).then_some(n + 1)
            })
            .is_ok()
    }

    /// Next message for the ordered worker, holding a dispatch slot for it
    fn take_for_dispatch(self: &Arc<Self>) -> Option<C::Message> {
        self.dispatching.fetch_add(1, Ordering::AcqRel);
        let message = self.inbound.pop();
        if message.is_none() {
            self.dispatching.fetch_sub(1, Ordering::AcqRel);
            // a drain check may have seen the slot we just released
            self.finish_graceful_close();
        }
        message
    }

    /// A handed-off message has finished running
    fn dispatched(self: &Arc<Self>) {
        self.dispatching.fetch_sub(1, Ordering::AcqRel);
        if self.state() == SessionState::Closed {
            return;
        }
        if self.dispatch == DispatchMode::Pooled {
            self.process_incoming();
        } else {
            self.finish_graceful_close();
        }
    }

    fn deliver(self: &Arc<Self>, message: C::Message) {
        match guarded(|| self.sink.on_receive(self, message)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.report(
                ErrorKind::RECEIVE | ErrorKind::PROCESS,
                SessionError::Callback(format!("{:#}", e)),
            ),
            Err(panic) => self.report(
                ErrorKind::RECEIVE | ErrorKind::PROCESS,
                SessionError::Panic(panic.to_string()),
            ),
        }
    }

    /// Encode and queue a message. Returns false, with no side effect, if the
    /// session is not open or is closing; returns false after reporting an
    /// error if the outbound queue is full (`KeepDefault`) or encoding fails.
    pub fn send(self: &Arc<Self>, message: C::Message) -> bool {
        if !self.is_open() || self.is_going_to_close() {
            return false;
        }

        if self.outbound.is_full() {
            match self.outbound.policy() {
                OverflowPolicy::KeepDefault => {
                    warn!("Session {} outgoing queue is full", self.id);
                    self.report(ErrorKind::SEND, SessionError::OutgoingQueueFull);
                    return false;
                }
                OverflowPolicy::KeepOld => return false,
                OverflowPolicy::KeepNew => {}
            }
        }

        let mut buf = BytesMut::new();
        if let Err(e) = self.codec.encode(&message, &mut buf) {
            self.report(ErrorKind::SEND | ErrorKind::CODEC, e.into());
            return false;
        }

        self.enqueue(Some(message), buf.freeze())
    }

    fn enqueue(&self, message: Option<C::Message>, frame: Bytes) -> bool {
        match self.outbound.push(Outgoing { message, frame }) {
            PushOutcome::Accepted => {}
            PushOutcome::Evicted(_) => {
                trace!("Session {} dropped oldest outgoing frame", self.id);
            }
            PushOutcome::Rejected(_) => return false,
        }
        self.write_ready.notify_one();
        true
    }

    async fn write_loop(self: Arc<Self>, mut writer: WriteHalf<IoStream>) {
        let mut closed = self.closed_tx.subscribe();

        loop {
            if *closed.borrow() {
                break;
            }

            // mark in flight before popping so the frame is never invisible
            // to a concurrent close
            self.in_flight.store(true, Ordering::Release);
            let Some(item) = self.outbound.pop() else {
                self.in_flight.store(false, Ordering::Release);
                if self.finish_graceful_close() {
                    break;
                }
                tokio::select! {
                    biased;
                    _ = closed.changed() => break,
                    _ = self.write_ready.notified() => continue,
                }
            };

            let result = tokio::select! {
                biased;
                _ = closed.changed() => break,
                result = async {
                    writer.write_all(&item.frame).await?;
                    writer.flush().await
                } => result,
            };
            self.in_flight.store(false, Ordering::Release);

            match result {
                Ok(()) => {
                    self.touch_write(item.frame.len());
                    if let Some(message) = &item.message {
                        if let Err(panic) = guarded(|| self.sink.on_send(&self, message)) {
                            self.report(
                                ErrorKind::SEND | ErrorKind::PROCESS,
                                SessionError::Panic(panic.to_string()),
                            );
                        }
                    }
                }
                Err(e) => {
                    if self.is_open() {
                        self.report(ErrorKind::SEND, e.into());
                    }
                    self.close(true);
                    break;
                }
            }
        }

        self.in_flight.store(false, Ordering::Release);
        if tokio::time::timeout(SHUTDOWN_GRACE, writer.shutdown())
            .await
            .is_err()
        {
            debug!("Session {} transport shutdown timed out", self.id);
        }
        trace!("Session {} write loop finished", self.id);
    }

    fn has_pending_work(&self) -> bool {
        !self.outbound.is_empty()
            || !self.inbound.is_empty()
            || self.in_flight.load(Ordering::Acquire)
            || self.dispatching.load(Ordering::Acquire) > 0
    }

    fn finish_graceful_close(self: &Arc<Self>) -> bool {
        if self.is_going_to_close() && !self.has_pending_work() {
            debug!("Session {} drained, finishing graceful close", self.id);
            self.close(true);
            return true;
        }
        false
    }

    /// Close the session.
    ///
    /// With `immediate == false` and queued work in either direction, the
    /// session stops accepting sends and closes once both queues drain.
    /// Otherwise it tears down now. Safe to call repeatedly and concurrently;
    /// `on_disconnect` fires once, and only if the session was open.
    pub fn close(self: &Arc<Self>, immediate: bool) {
        if !immediate && self.is_open() && self.has_pending_work() {
            if !self.going_to_close.swap(true, Ordering::AcqRel) {
                debug!("Session {} closing after queues drain", self.id);
            }
            self.write_ready.notify_one();
            return;
        }

        let previous = self
            .phase
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |phase| match phase {
                PHASE_CLOSING | PHASE_CLOSED => None,
                _ => Some(PHASE_CLOSING),
            });
        let previous = match previous {
            Ok(phase) => phase,
            Err(_) => {
                self.inbound.clear();
                self.outbound.clear();
                return;
            }
        };

        if previous == PHASE_OPEN {
            info!("Closing session {} with {}", self.id, self.peer());
            if let Err(panic) = guarded(|| self.sink.on_disconnect(self)) {
                error!("on_disconnect panicked for session {}: {}", self.id, panic);
            }
        }

        self.closed_tx.send_replace(true);
        self.transport.lock().take();
        self.socket.lock().take();
        if let Some(worker) = self.ordered.lock().take() {
            drop(worker.shutdown());
        }

        self.inbound.clear();
        self.outbound.clear();
        self.in_flight.store(false, Ordering::Release);
        self.decode.lock().reset();
        self.attributes.clear();
        self.user_data.lock().take();
        self.going_to_close.store(false, Ordering::Release);

        if let Some(group) = self.group.upgrade() {
            group.remove(self.id);
        }

        self.phase.store(PHASE_CLOSED, Ordering::Release);
    }

    /// Check inactivity against `threshold`. Fires `on_idle` and returns true
    /// when idle; never fires for a session that is not open or is closing.
    pub fn test_idle(self: &Arc<Self>, kind: IdleKind, threshold: Duration) -> bool {
        if !self.is_open() || self.is_going_to_close() || threshold.is_zero() {
            return false;
        }

        let now = Instant::now();
        let read_idle = now.saturating_duration_since(self.last_read()) >= threshold;
        let write_idle = now.saturating_duration_since(self.last_write()) >= threshold;

        let mut idle = IoDirection::empty();
        if read_idle {
            idle |= IoDirection::RECEIVE;
        }
        if write_idle {
            idle |= IoDirection::SEND;
        }

        let direction = match kind {
            IdleKind::Receive => idle & IoDirection::RECEIVE,
            IdleKind::Send => idle & IoDirection::SEND,
            IdleKind::Both if idle == IoDirection::BOTH => IoDirection::BOTH,
            IdleKind::Both => IoDirection::empty(),
            IdleKind::Either => idle,
        };
        if direction.is_empty() {
            return false;
        }

        debug!("Session {} idle ({:?}) for {:?}", self.id, direction, threshold);
        if let Err(panic) = guarded(|| self.sink.on_idle(self, direction)) {
            self.report(ErrorKind::PROCESS, SessionError::Panic(panic.to_string()));
        }
        true
    }

    /// Hand an error to the sink
    pub(crate) fn report(self: &Arc<Self>, kind: ErrorKind, error: SessionError) {
        trace!("Session {} reporting {:?}: {}", self.id, kind, error);
        if let Err(panic) = guarded(|| self.sink.on_error(self, kind, &error)) {
            error!("on_error panicked for session {}: {}", self.id, panic);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsession_wire::{HttpCodec, HttpMessage, NetMessage, TlvCodec};
    use tokio::io::{duplex, DuplexStream};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    #[derive(Debug)]
    enum Event {
        Connect,
        Disconnect,
        Receive(NetMessage),
        Sent(i32),
        Idle(IoDirection),
        Error(ErrorKind, String),
    }

    struct Recorder {
        tx: mpsc::UnboundedSender<Event>,
        close_on_idle: bool,
        close_on_error: bool,
        receive_delay: Duration,
    }

    impl EventSink<TlvCodec> for Recorder {
        fn on_connect(&self, _session: &Arc<Session<TlvCodec>>) {
            let _ = self.tx.send(Event::Connect);
        }

        fn on_disconnect(&self, _session: &Arc<Session<TlvCodec>>) {
            let _ = self.tx.send(Event::Disconnect);
        }

        fn on_send(&self, _session: &Arc<Session<TlvCodec>>, message: &NetMessage) {
            let _ = self.tx.send(Event::Sent(message.msg_type));
        }

        fn on_receive(
            &self,
            _session: &Arc<Session<TlvCodec>>,
            message: NetMessage,
        ) -> anyhow::Result<()> {
            if message.msg_type < 0 {
                anyhow::bail!("negative type {}", message.msg_type);
            }
            if !self.receive_delay.is_zero() {
                std::thread::sleep(self.receive_delay);
            }
            let _ = self.tx.send(Event::Receive(message));
            Ok(())
        }

        fn on_idle(&self, session: &Arc<Session<TlvCodec>>, direction: IoDirection) {
            let _ = self.tx.send(Event::Idle(direction));
            if self.close_on_idle {
                session.close(true);
            }
        }

        fn on_error(&self, session: &Arc<Session<TlvCodec>>, kind: ErrorKind, error: &SessionError) {
            let _ = self.tx.send(Event::Error(kind, error.to_string()));
            if self.close_on_error && kind.is_network_error() {
                session.close(true);
            }
        }
    }

    fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Recorder {
                tx,
                close_on_idle: false,
                close_on_error: true,
                receive_delay: Duration::ZERO,
            }),
            rx,
        )
    }

    fn memory_session(
        sink: Arc<Recorder>,
        config: SessionConfig,
    ) -> (Arc<Session<TlvCodec>>, DuplexStream) {
        let (local, remote) = duplex(64 * 1024);
        let session = Session::new(
            1,
            IoStream::Memory(local),
            Arc::new(TlvCodec::new()),
            sink,
            None,
            config,
        );
        (session, remote)
    }

    fn frame(msg: &NetMessage) -> Vec<u8> {
        let mut buf = BytesMut::new();
        TlvCodec::new().encode(msg, &mut buf).unwrap();
        buf.to_vec()
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_open_receive_and_send() {
        let (sink, mut rx) = recorder();
        let (session, mut remote) = memory_session(sink, SessionConfig::default());
        assert_eq!(session.state(), SessionState::Closed);

        session.open();
        assert!(session.is_open());
        assert!(matches!(next(&mut rx).await, Event::Connect));

        // one message split across two writes
        let bytes = frame(&NetMessage::text(3, "ping"));
        remote.write_all(&bytes[..5]).await.unwrap();
        remote.flush().await.unwrap();
        tokio::task::yield_now().await;
        remote.write_all(&bytes[5..]).await.unwrap();

        match next(&mut rx).await {
            Event::Receive(msg) => assert_eq!(msg.content().unwrap(), "ping"),
            other => panic!("unexpected {:?}", other),
        }

        assert!(session.send(NetMessage::text(4, "pong")));
        assert!(matches!(next(&mut rx).await, Event::Sent(4)));

        let expected = frame(&NetMessage::text(4, "pong"));
        let mut got = vec![0u8; expected.len()];
        remote.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected);

        let stats = session.stats();
        assert_eq!(stats.messages_received, 1);
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(stats.bytes_out, expected.len() as u64);
    }

    #[tokio::test]
    async fn test_send_rejected_when_not_open() {
        let (sink, mut rx) = recorder();
        let (session, _remote) = memory_session(sink, SessionConfig::default());

        assert!(!session.send(NetMessage::text(1, "early")));
        session.open();
        session.close(true);
        assert!(!session.send(NetMessage::text(1, "late")));

        assert!(matches!(next(&mut rx).await, Event::Connect));
        assert!(matches!(next(&mut rx).await, Event::Disconnect));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_peer_eof_closes() {
        let (sink, mut rx) = recorder();
        let (session, remote) = memory_session(sink, SessionConfig::default());
        session.open();
        assert!(matches!(next(&mut rx).await, Event::Connect));

        drop(remote);
        assert!(matches!(next(&mut rx).await, Event::Disconnect));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_bad_sign_closes_without_dispatch() {
        let (sink, mut rx) = recorder();
        let (session, mut remote) = memory_session(sink, SessionConfig::default());
        session.open();
        assert!(matches!(next(&mut rx).await, Event::Connect));

        let mut bytes = BytesMut::new();
        TlvCodec::new()
            .with_sign(77)
            .encode(&NetMessage::text(1, "bad"), &mut bytes)
            .unwrap();
        remote.write_all(&bytes).await.unwrap();

        match next(&mut rx).await {
            Event::Error(kind, _) => assert!(kind.contains(ErrorKind::CODEC)),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(next(&mut rx).await, Event::Disconnect));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_receive_error_reported_as_process() {
        let (sink, mut rx) = recorder();
        let (session, mut remote) = memory_session(sink, SessionConfig::default());
        session.open();
        assert!(matches!(next(&mut rx).await, Event::Connect));

        remote.write_all(&frame(&NetMessage::text(-1, "x"))).await.unwrap();
        remote.write_all(&frame(&NetMessage::text(2, "y"))).await.unwrap();

        match next(&mut rx).await {
            Event::Error(kind, msg) => {
                assert!(kind.is_process_error());
                assert!(msg.contains("negative type -1"));
            }
            other => panic!("unexpected {:?}", other),
        }
        // loop keeps going
        assert!(matches!(next(&mut rx).await, Event::Receive(m) if m.msg_type == 2));
        assert!(session.is_open());
    }

    #[tokio::test]
    async fn test_concurrent_close_fires_disconnect_once() {
        let (sink, mut rx) = recorder();
        let (session, _remote) = memory_session(sink, SessionConfig::default());
        session.open();
        assert!(matches!(next(&mut rx).await, Event::Connect));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let s = session.clone();
                std::thread::spawn(move || s.close(true))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(matches!(next(&mut rx).await, Event::Disconnect));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_keep_new_transmits_latest_two() {
        let (sink, mut rx) = recorder();
        let config = SessionConfig {
            outbound: QueueConfig::bounded(2, OverflowPolicy::KeepNew),
            ..SessionConfig::default()
        };
        let (session, mut remote) = memory_session(sink, config);
        session.open();
        assert!(matches!(next(&mut rx).await, Event::Connect));

        // the writer cannot run until this task yields
        for n in 1..=5 {
            assert!(session.send(NetMessage::text(n, format!("m{}", n))));
        }

        let mut expected = frame(&NetMessage::text(4, "m4"));
        expected.extend(frame(&NetMessage::text(5, "m5")));
        let mut got = vec![0u8; expected.len()];
        remote.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected);

        assert!(matches!(next(&mut rx).await, Event::Sent(4)));
        assert!(matches!(next(&mut rx).await, Event::Sent(5)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_keep_default_reports_queue_full() {
        let (sink, mut rx) = recorder();
        let config = SessionConfig {
            outbound: QueueConfig::bounded(1, OverflowPolicy::KeepDefault),
            ..SessionConfig::default()
        };
        let (session, _remote) = memory_session(sink, config);
        session.open();
        assert!(matches!(next(&mut rx).await, Event::Connect));

        assert!(session.send(NetMessage::text(1, "a")));
        assert!(!session.send(NetMessage::text(2, "b")));

        match next(&mut rx).await {
            Event::Error(kind, msg) => {
                assert_eq!(kind, ErrorKind::SEND);
                assert_eq!(msg, "outgoing queue is full");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_keep_old_rejects_silently() {
        let (sink, mut rx) = recorder();
        let (session, mut remote) = memory_session(sink, SessionConfig::default());
        session.set_max_queue_depth(IoDirection::SEND, 1);
        session.set_overflow_policy(IoDirection::SEND, OverflowPolicy::KeepOld);
        assert_eq!(session.max_queue_depth(IoDirection::SEND), 1);
        assert_eq!(session.overflow_policy(IoDirection::SEND), OverflowPolicy::KeepOld);

        session.open();
        assert!(matches!(next(&mut rx).await, Event::Connect));
        assert!(session.send(NetMessage::text(1, "kept")));
        assert!(!session.send(NetMessage::text(2, "dropped")));

        let expected = frame(&NetMessage::text(1, "kept"));
        let mut got = vec![0u8; expected.len()];
        remote.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected);
        assert!(matches!(next(&mut rx).await, Event::Sent(1)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_graceful_close_drains_outbound() {
        let (sink, mut rx) = recorder();
        let (session, mut remote) = memory_session(sink, SessionConfig::default());
        session.open();
        assert!(matches!(next(&mut rx).await, Event::Connect));

        for n in 0..3 {
            session.send(NetMessage::text(n, "queued"));
        }
        session.close(false);
        assert!(session.is_going_to_close());
        assert!(!session.send(NetMessage::text(9, "refused")));

        let mut all = Vec::new();
        remote.read_to_end(&mut all).await.unwrap();
        let mut expected = Vec::new();
        for n in 0..3 {
            expected.extend(frame(&NetMessage::text(n, "queued")));
        }
        assert_eq!(all, expected);

        for n in 0..3 {
            assert!(matches!(next(&mut rx).await, Event::Sent(m) if m == n));
        }
        assert!(matches!(next(&mut rx).await, Event::Disconnect));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_detection_and_reset() {
        let (sink, mut rx) = recorder();
        let (session, mut remote) = memory_session(sink, SessionConfig::default());
        session.open();
        assert!(matches!(next(&mut rx).await, Event::Connect));

        let threshold = Duration::from_secs(10);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!session.test_idle(IdleKind::Both, threshold));

        // inbound traffic resets the read clock only
        remote.write_all(&frame(&NetMessage::text(1, "hi"))).await.unwrap();
        assert!(matches!(next(&mut rx).await, Event::Receive(_)));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!session.test_idle(IdleKind::Both, threshold));
        assert!(!session.test_idle(IdleKind::Receive, threshold));
        assert!(session.test_idle(IdleKind::Send, threshold));
        assert!(matches!(next(&mut rx).await, Event::Idle(d) if d == IoDirection::SEND));

        assert!(session.test_idle(IdleKind::Either, threshold));
        assert!(matches!(next(&mut rx).await, Event::Idle(d) if d == IoDirection::SEND));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(session.test_idle(IdleKind::Both, threshold));
        assert!(matches!(next(&mut rx).await, Event::Idle(d) if d == IoDirection::BOTH));

        assert!(!session.test_idle(IdleKind::Both, Duration::ZERO));
    }

    #[tokio::test]
    async fn test_user_data_and_attributes_cleared_on_close() {
        let (sink, mut rx) = recorder();
        let (session, _remote) = memory_session(sink, SessionConfig::default());
        session.open();
        assert!(matches!(next(&mut rx).await, Event::Connect));

        session.set_user_data(String::from("player-7"));
        session.attributes().set("room", 12_u32);
        assert_eq!(session.user_data::<String>().as_deref().map(String::as_str), Some("player-7"));
        assert!(session.user_data::<u32>().is_none());

        session.close(true);
        assert!(session.user_data::<String>().is_none());
        assert!(session.attributes().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_ordered_dispatch_preserves_order() {
        let (sink, mut rx) = recorder();
        let config = SessionConfig {
            dispatch: DispatchMode::Ordered,
            ..SessionConfig::default()
        };
        let (session, mut remote) = memory_session(sink, config);
        session.open();
        assert!(matches!(next(&mut rx).await, Event::Connect));

        let mut wire = Vec::new();
        for n in 0..200 {
            wire.extend(frame(&NetMessage::text(n, n.to_string())));
        }
        for chunk in wire.chunks(333) {
            remote.write_all(chunk).await.unwrap();
        }

        for n in 0..200 {
            match next(&mut rx).await {
                Event::Receive(msg) => assert_eq!(msg.msg_type, n),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_open_without_runtime_closes() {
        let (sink, mut rx) = recorder();
        let (local, _remote) = {
            // duplex streams are plain in-memory pipes; no runtime needed to build them
            duplex(64)
        };
        let session = Session::new(
            9,
            IoStream::Memory(local),
            Arc::new(TlvCodec::new()),
            sink,
            None,
            SessionConfig::default(),
        );
        session.open();
        assert_eq!(session.state(), SessionState::Closed);
        match rx.try_recv() {
            Ok(Event::Error(kind, msg)) => {
                assert_eq!(kind, ErrorKind::RECEIVE);
                assert_eq!(msg, "no async runtime available");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    fn slow_recorder(delay: Duration) -> (Arc<Recorder>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Recorder {
                tx,
                close_on_idle: false,
                close_on_error: false,
                receive_delay: delay,
            }),
            rx,
        )
    }

    async fn overflow_with_slow_handler(dispatch: DispatchMode) {
        let (sink, mut rx) = slow_recorder(Duration::from_millis(20));
        let config = SessionConfig {
            inbound: QueueConfig::bounded(1, OverflowPolicy::KeepDefault),
            dispatch,
            ..SessionConfig::default()
        };
        let (session, mut remote) = memory_session(sink, config);
        session.open();
        assert!(matches!(next(&mut rx).await, Event::Connect));

        let mut burst = Vec::new();
        for n in 0..20 {
            burst.extend(frame(&NetMessage::text(n, "x")));
        }
        remote.write_all(&burst).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let mut received = 0;
        let mut queue_full = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                Event::Receive(_) => received += 1,
                Event::Error(kind, text) if text == "incoming queue is full" => {
                    assert_eq!(kind, ErrorKind::RECEIVE);
                    queue_full += 1;
                }
                _ => {}
            }
        }
        assert!(queue_full > 0, "backlog was never bounded");
        assert!(received < 20);
        assert_eq!(received + queue_full, 20);
        assert!(session.is_open());
        session.close(true);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ordered_backlog_respects_inbound_bound() {
        overflow_with_slow_handler(DispatchMode::Ordered).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pooled_backlog_respects_inbound_bound() {
        overflow_with_slow_handler(DispatchMode::Pooled).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_graceful_close_waits_for_ordered_handler() {
        let (sink, mut rx) = slow_recorder(Duration::from_millis(50));
        let config = SessionConfig {
            dispatch: DispatchMode::Ordered,
            ..SessionConfig::default()
        };
        let (session, mut remote) = memory_session(sink, config);
        session.open();
        assert!(matches!(next(&mut rx).await, Event::Connect));

        remote.write_all(&frame(&NetMessage::text(1, "slow"))).await.unwrap();
        while session.stats().messages_received == 0 {
            tokio::task::yield_now().await;
        }
        // the handler holds the message for 50ms
        tokio::time::sleep(Duration::from_millis(10)).await;

        session.close(false);
        assert!(session.is_going_to_close());
        assert!(matches!(next(&mut rx).await, Event::Receive(_)));
        assert!(matches!(next(&mut rx).await, Event::Disconnect));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_close_while_opening_is_final() {
        let (sink, mut rx) = recorder();
        let group = SessionGroup::new();
        let (local, mut remote) = duplex(1024);
        let session = Session::new(
            group.next_id(),
            IoStream::Memory(local),
            Arc::new(TlvCodec::new()),
            sink,
            Some(&group),
            SessionConfig::default(),
        );

        // open has claimed the stream when a close lands
        session.phase.store(PHASE_OPENING, Ordering::Release);
        let stream = session.transport.lock().take();
        session.close(true);
        *session.transport.lock() = stream;
        session.start(Handle::current());

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(group.session_count(), 0);
        assert!(!session.send(NetMessage::text(1, "nope")));
        assert!(rx.try_recv().is_err());

        let mut buf = [0u8; 8];
        let n = timeout(Duration::from_secs(1), remote.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_open_racing_close_never_leaves_session_open() {
        for _ in 0..200 {
            let (sink, mut rx) = recorder();
            let group = SessionGroup::new();
            let (local, _remote) = duplex(1024);
            let session = Session::new(
                group.next_id(),
                IoStream::Memory(local),
                Arc::new(TlvCodec::new()),
                sink,
                Some(&group),
                SessionConfig::default(),
            );

            let opener = {
                let session = session.clone();
                tokio::spawn(async move { session.open() })
            };
            let closer = {
                let session = session.clone();
                let group = group.clone();
                tokio::spawn(async move {
                    group.close_all(true);
                    session.close(true);
                })
            };
            opener.await.unwrap();
            closer.await.unwrap();

            assert_eq!(session.state(), SessionState::Closed);
            assert_eq!(group.session_count(), 0);

            let (mut connects, mut disconnects) = (0, 0);
            while let Ok(event) = rx.try_recv() {
                match event {
                    Event::Connect => connects += 1,
                    Event::Disconnect => disconnects += 1,
                    _ => {}
                }
            }
            assert_eq!(connects, disconnects);
        }
    }

    #[derive(Default)]
    struct HttpTally {
        received: AtomicUsize,
        errors: AtomicUsize,
    }

    impl EventSink<HttpCodec> for HttpTally {
        fn on_receive(&self, _: &Arc<Session<HttpCodec>>, _: HttpMessage) -> anyhow::Result<()> {
            self.received.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_error(&self, _: &Arc<Session<HttpCodec>>, _: ErrorKind, _: &SessionError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_non_utf8_http_head_closes_session() {
        let tally = Arc::new(HttpTally::default());
        let (local, mut remote) = duplex(64 * 1024);
        let session = Session::new(
            1,
            IoStream::Memory(local),
            Arc::new(HttpCodec::new()),
            tally.clone(),
            None,
            SessionConfig::default(),
        );
        session.open();

        remote
            .write_all(b"GET / HTTP/1.1\r\nX-Bad: \xff\xfe\r\n\r\n")
            .await
            .unwrap();
        for _ in 0..3 {
            let _ = remote.write_all(b"GET /ok HTTP/1.1\r\n\r\n").await;
        }

        timeout(Duration::from_secs(2), async {
            while session.is_open() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session stayed open after a malformed head");

        assert_eq!(tally.received.load(Ordering::SeqCst), 0);
        assert_eq!(tally.errors.load(Ordering::SeqCst), 1);
    }
}
