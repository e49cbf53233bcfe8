//! Session registry with periodic idle scanning.

use crate::context::Attributes;
use crate::error::IdleKind;
use crate::panic::guarded;
use crate::session::Session;
use dashmap::DashMap;
use netsession_wire::FrameCodec;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

/// Idle detection settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleConfig {
    /// Which inactivity counts
    pub kind: IdleKind,
    /// Inactivity threshold; zero disables detection
    #[serde(with = "duration_text")]
    pub threshold: Duration,
}

struct Scanner {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// A set of sessions sharing attributes and an idle policy
pub struct SessionGroup<C: FrameCodec> {
    sessions: DashMap<u64, Arc<Session<C>>>,
    next_id: AtomicU64,
    attributes: Attributes,
    idle: Mutex<IdleConfig>,
    scanner: tokio::sync::Mutex<Option<Scanner>>,
}

impl<C: FrameCodec> SessionGroup<C> {
    /// Empty group with idle detection off
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            attributes: Attributes::new(),
            idle: Mutex::new(IdleConfig::default()),
            scanner: tokio::sync::Mutex::new(None),
        })
    }

    /// Allocate a session id. Ids start at 1 and are never reused by this
    /// group.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a session, replacing any session with the same id
    pub fn add(&self, session: Arc<Session<C>>) {
        trace!("Group adding session {}", session.id());
        self.sessions.insert(session.id(), session);
    }

    /// Unregister a session
    pub fn remove(&self, id: u64) -> Option<Arc<Session<C>>> {
        self.sessions.remove(&id).map(|(_, s)| s)
    }

    /// Look up a session
    pub fn get(&self, id: u64) -> Option<Arc<Session<C>>> {
        self.sessions.get(&id).map(|s| s.value().clone())
    }

    /// Snapshot of the current members
    pub fn sessions(&self) -> Vec<Arc<Session<C>>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    /// Number of members
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Forget every member without closing it
    pub fn clear(&self) {
        self.sessions.clear();
    }

    /// Close every member
    pub fn close_all(&self, immediate: bool) {
        for session in self.sessions() {
            session.close(immediate);
        }
    }

    /// Group-scoped attributes
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Current idle settings
    pub fn idle_config(&self) -> IdleConfig {
        *self.idle.lock()
    }

    /// Whether the idle scanner is running
    pub async fn is_checking_idle(&self) -> bool {
        self.scanner.lock().await.is_some()
    }

    /// Replace the idle settings and (re)start the scanner with them. A zero
    /// threshold stops it. Concurrent calls are serialized, so at most one
    /// scanner ever runs.
    pub async fn set_idle_time(self: &Arc<Self>, kind: IdleKind, threshold: Duration) {
        let mut scanner = self.scanner.lock().await;
        stop_scanner(&mut scanner).await;
        *self.idle.lock() = IdleConfig { kind, threshold };
        self.arm_scanner(&mut scanner);
    }

    /// Start the periodic idle scan. No-op if already running or if the
    /// threshold is zero.
    pub async fn start_checking_idle(self: &Arc<Self>) {
        let mut scanner = self.scanner.lock().await;
        self.arm_scanner(&mut scanner);
    }

    /// Stop the idle scan and wait for it to finish. Returns whether a
    /// scanner was running.
    pub async fn stop_checking_idle(&self) -> bool {
        stop_scanner(&mut *self.scanner.lock().await).await
    }

    fn arm_scanner(self: &Arc<Self>, scanner: &mut Option<Scanner>) {
        if scanner.is_some() {
            return;
        }
        let config = self.idle_config();
        if config.threshold.is_zero() {
            debug!("Idle threshold is zero, not starting scanner");
            return;
        }

        let (stop, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(scan(Arc::downgrade(self), config, stop_rx));
        info!(
            "Idle scanner started ({:?}, threshold {:?})",
            config.kind, config.threshold
        );
        *scanner = Some(Scanner { stop, handle });
    }
}

async fn stop_scanner(scanner: &mut Option<Scanner>) -> bool {
    let Some(scanner) = scanner.take() else {
        return false;
    };
    let _ = scanner.stop.send(());
    if let Err(e) = scanner.handle.await {
        error!("Idle scanner task failed: {}", e);
    }
    info!("Idle scanner stopped");
    true
}

async fn scan<C: FrameCodec>(
    group: Weak<SessionGroup<C>>,
    config: IdleConfig,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            _ = tokio::time::sleep(config.threshold) => {}
        }

        let Some(group) = group.upgrade() else { break };
        let sessions = group.sessions();
        drop(group);

        let mut idle = 0usize;
        for session in sessions {
            match guarded(|| session.test_idle(config.kind, config.threshold)) {
                Ok(true) => idle += 1,
                Ok(false) => {}
                Err(panic) => error!("Idle check panicked for session {}: {}", session.id(), panic),
            }
        }
        if idle > 0 {
            debug!("Idle scan found {} idle session(s)", idle);
        }
    }
}

mod duration_text {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IoDirection;
    use crate::event::EventSink;
    use crate::session::SessionConfig;
    use crate::transport::IoStream;
    use netsession_wire::{NetMessage, TlvCodec};
    use std::sync::atomic::AtomicUsize;
    use tokio::io::duplex;

    #[derive(Default)]
    struct IdleCounter {
        idle: AtomicUsize,
        disconnects: AtomicUsize,
        keep_open: bool,
    }

    impl EventSink<TlvCodec> for IdleCounter {
        fn on_receive(&self, _: &Arc<Session<TlvCodec>>, _: NetMessage) -> anyhow::Result<()> {
            Ok(())
        }

        fn on_idle(&self, session: &Arc<Session<TlvCodec>>, _: IoDirection) {
            self.idle.fetch_add(1, Ordering::SeqCst);
            if !self.keep_open {
                session.close(true);
            }
        }

        fn on_disconnect(&self, _: &Arc<Session<TlvCodec>>) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn member(
        group: &Arc<SessionGroup<TlvCodec>>,
        sink: Arc<IdleCounter>,
        id: u64,
    ) -> (Arc<Session<TlvCodec>>, tokio::io::DuplexStream) {
        let (local, remote) = duplex(1024);
        let session = Session::new(
            id,
            IoStream::Memory(local),
            Arc::new(TlvCodec::new()),
            sink,
            Some(group),
            SessionConfig::default(),
        );
        (session, remote)
    }

    #[tokio::test]
    async fn test_membership_follows_lifecycle() {
        let group = SessionGroup::new();
        let sink = Arc::new(IdleCounter::default());
        let (a, _ra) = member(&group, sink.clone(), 1);
        let (b, _rb) = member(&group, sink.clone(), 2);

        assert_eq!(group.session_count(), 0);
        assert_eq!(group.next_id(), 1);
        assert_eq!(group.next_id(), 2);
        a.open();
        b.open();
        assert_eq!(group.session_count(), 2);
        assert_eq!(group.get(2).map(|s| s.id()), Some(2));

        a.close(true);
        assert_eq!(group.session_count(), 1);
        assert!(group.get(1).is_none());

        group.close_all(true);
        assert_eq!(group.session_count(), 0);
        assert_eq!(sink.disconnects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_group_attributes() {
        let group = SessionGroup::<TlvCodec>::new();
        group.attributes().set("motd", String::from("hello"));
        assert_eq!(
            group.attributes().get::<String>("motd").as_deref().map(String::as_str),
            Some("hello")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_scanner_closes_idle_sessions() {
        let group = SessionGroup::new();
        let sink = Arc::new(IdleCounter::default());
        let (session, _remote) = member(&group, sink.clone(), 1);
        session.open();

        group.set_idle_time(IdleKind::Both, Duration::from_secs(2)).await;
        assert!(group.is_checking_idle().await);
        assert_eq!(group.idle_config().threshold, Duration::from_secs(2));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(sink.idle.load(Ordering::SeqCst), 0);

        // first scan at 2s sees exactly 2s of silence
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(sink.idle.load(Ordering::SeqCst), 1);
        assert_eq!(group.session_count(), 0);

        assert!(group.stop_checking_idle().await);
        assert!(!group.is_checking_idle().await);
        assert!(!group.stop_checking_idle().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearming_replaces_scanner() {
        let group = SessionGroup::new();
        let sink = Arc::new(IdleCounter {
            keep_open: true,
            ..IdleCounter::default()
        });
        let (session, _remote) = member(&group, sink.clone(), 1);
        session.open();

        group.set_idle_time(IdleKind::Both, Duration::from_secs(2)).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        group.set_idle_time(IdleKind::Both, Duration::from_secs(3)).await;
        group.set_idle_time(IdleKind::Both, Duration::from_secs(3)).await;
        assert!(group.is_checking_idle().await);

        // the 2s scanner would have fired at t=2
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(sink.idle.load(Ordering::SeqCst), 0);

        // one report per interval while the session stays silent: t=4, 7, 10
        tokio::time::sleep(Duration::from_millis(7000)).await;
        assert_eq!(sink.idle.load(Ordering::SeqCst), 3);
        assert!(session.is_open());
        assert_eq!(group.session_count(), 1);

        assert!(group.stop_checking_idle().await);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sink.idle.load(Ordering::SeqCst), 3);
        session.close(true);
    }

    #[tokio::test]
    async fn test_zero_threshold_never_starts() {
        let group = SessionGroup::<TlvCodec>::new();
        group.start_checking_idle().await;
        assert!(!group.is_checking_idle().await);

        group.set_idle_time(IdleKind::Either, Duration::ZERO).await;
        assert!(!group.is_checking_idle().await);
    }

    #[test]
    fn test_idle_config_yaml() {
        let config: IdleConfig = serde_yaml::from_str("kind: either\nthreshold: 1m 30s\n").unwrap();
        assert_eq!(config.kind, IdleKind::Either);
        assert_eq!(config.threshold, Duration::from_secs(90));
    }
}
