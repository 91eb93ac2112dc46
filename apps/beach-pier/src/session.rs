use std::{
    fmt,
    str::FromStr,
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::{mapref::entry::Entry, DashMap};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info};
use uuid::Uuid;

use crate::protocol::{ClientMessage, IgnoreReason, Inbound, ServerMessage};

/// WebSocket close code for policy violations (RFC 6455 §7.4.1).
pub const CLOSE_POLICY: u16 = 1008;

/// Opaque, never-reused identity of one duplex connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Fresh random (v4) identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Established,
    Closed,
}

/// Work queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Message(ServerMessage),
    Close { code: u16, reason: String },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("session {0} is not registered")]
    NotFound(SessionId),
    #[error("session {id} cannot move from {from:?} to {to:?}")]
    Invalid {
        id: SessionId,
        from: SessionState,
        to: SessionState,
    },
}

/// What the registry did with one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// A reply was queued on the session's outbound channel
    Replied(ServerMessage),
    Ignored(IgnoreReason),
}

/// Handed to the connection that opened a session; the registry keeps the sending half.
#[derive(Debug)]
pub struct SessionRegistration {
    pub session_id: SessionId,
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub state: SessionState,
    pub age_secs: u64,
    pub idle_secs: u64,
}

struct Session {
    state: SessionState,
    opened_at: Instant,
    last_activity: Instant,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl Session {
    fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) >= timeout
    }
}

/// Live-session set. Cloning shares the same underlying map.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<SessionRegistryInner>,
}

#[derive(Default)]
struct SessionRegistryInner {
    sessions: DashMap<SessionId, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection in `Connecting` state under a fresh identifier.
    pub fn open(&self) -> SessionRegistration {
        let (tx, rx) = mpsc::unbounded_channel();
        let now = Instant::now();

        let session_id = loop {
            let candidate = SessionId::generate();
            match self.inner.sessions.entry(candidate) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(entry) => {
                    entry.insert(Session {
                        state: SessionState::Connecting,
                        opened_at: now,
                        last_activity: now,
                        outbound: tx,
                    });
                    break candidate;
                }
            }
        };

        counter!("beach_pier_sessions_opened_total", 1);
        self.record_live_gauge();
        debug!(session_id = %session_id, "session opened");

        SessionRegistration {
            session_id,
            outbound: rx,
        }
    }

    /// `Connecting -> Established`, once the handshake has been written.
    pub fn establish(&self, id: &SessionId) -> Result<(), TransitionError> {
        let mut session = self
            .inner
            .sessions
            .get_mut(id)
            .ok_or(TransitionError::NotFound(*id))?;

        match session.state {
            SessionState::Connecting => {
                session.state = SessionState::Established;
                session.last_activity = Instant::now();
                Ok(())
            }
            from => Err(TransitionError::Invalid {
                id: *id,
                from,
                to: SessionState::Established,
            }),
        }
    }

    /// Handle one decoded frame. Replies are queued on the session's outbound channel,
    /// so per-connection order follows the order frames are dispatched.
    pub fn dispatch(&self, id: &SessionId, inbound: Inbound) -> FrameOutcome {
        let outcome = match self.inner.sessions.get_mut(id) {
            Some(mut session) if session.state == SessionState::Established => {
                session.last_activity = Instant::now();
                match inbound {
                    Inbound::Message(ClientMessage::Ping) => {
                        let reply = ServerMessage::Pong;
                        match session.outbound.send(Outbound::Message(reply.clone())) {
                            Ok(()) => FrameOutcome::Replied(reply),
                            Err(_) => FrameOutcome::Ignored(IgnoreReason::WriterClosed),
                        }
                    }
                    Inbound::Ignored(reason) => FrameOutcome::Ignored(reason),
                }
            }
            _ => FrameOutcome::Ignored(IgnoreReason::NotEstablished),
        };

        match &outcome {
            FrameOutcome::Replied(_) => {
                counter!("beach_pier_pongs_sent_total", 1);
            }
            FrameOutcome::Ignored(reason) => {
                debug!(session_id = %id, ?reason, "ignoring inbound frame");
                counter!(
                    "beach_pier_frames_ignored_total",
                    1,
                    "reason" => reason.metric_label()
                );
            }
        }

        outcome
    }

    /// Remove a session. Dropping its outbound sender ends the writer task.
    /// Returns `false` if the session was already gone.
    pub fn close(&self, id: &SessionId) -> bool {
        let Some((_, mut session)) = self.inner.sessions.remove(id) else {
            return false;
        };
        session.state = SessionState::Closed;

        counter!("beach_pier_sessions_closed_total", 1);
        self.record_live_gauge();
        debug!(
            session_id = %id,
            state = ?session.state,
            lifetime_ms = session.opened_at.elapsed().as_millis() as u64,
            "session closed"
        );
        true
    }

    /// Close every session with no inbound activity for at least `timeout`.
    pub fn close_idle(&self, now: Instant, timeout: Duration) -> usize {
        let candidates: Vec<SessionId> = self
            .inner
            .sessions
            .iter()
            .filter(|entry| entry.value().is_idle(now, timeout))
            .map(|entry| *entry.key())
            .collect();

        let mut closed = 0usize;
        for id in candidates {
            // Re-check under the shard lock; a frame may have arrived since the scan.
            let Some((_, mut session)) = self
                .inner
                .sessions
                .remove_if(&id, |_, session| session.is_idle(now, timeout))
            else {
                continue;
            };
            session.state = SessionState::Closed;
            let _ = session.outbound.send(Outbound::Close {
                code: CLOSE_POLICY,
                reason: "idle timeout".into(),
            });
            counter!("beach_pier_sessions_idle_pruned_total", 1);
            info!(session_id = %id, "closing idle session");
            closed += 1;
        }

        if closed > 0 {
            self.record_live_gauge();
        }
        closed
    }

    /// Periodically prune idle sessions until the returned handle is aborted.
    pub fn spawn_idle_sweeper(&self, interval: Duration, timeout: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let pruned = registry.close_idle(Instant::now(), timeout);
                if pruned > 0 {
                    debug!(pruned, "idle sweep complete");
                }
            }
        })
    }

    pub fn state(&self, id: &SessionId) -> Option<SessionState> {
        self.inner.sessions.get(id).map(|session| session.state)
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let now = Instant::now();
        self.inner
            .sessions
            .iter()
            .map(|entry| SessionSnapshot {
                session_id: *entry.key(),
                state: entry.state,
                age_secs: now.saturating_duration_since(entry.opened_at).as_secs(),
                idle_secs: now.saturating_duration_since(entry.last_activity).as_secs(),
            })
            .collect()
    }

    fn record_live_gauge(&self) {
        gauge!("beach_pier_live_sessions", self.inner.sessions.len() as f64);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::protocol::decode_frame;

    fn established(registry: &SessionRegistry) -> SessionRegistration {
        let registration = registry.open();
        registry
            .establish(&registration.session_id)
            .expect("fresh session establishes");
        registration
    }

    #[test_timeout::timeout]
    fn session_ids_are_distinct_and_parse_back() {
        let ids: HashSet<SessionId> = (0..1_000).map(|_| SessionId::generate()).collect();
        assert_eq!(ids.len(), 1_000);

        let id = SessionId::generate();
        let rendered = id.to_string();
        assert_eq!(rendered.len(), 36);
        assert_eq!(rendered.parse::<SessionId>().unwrap(), id);
    }

    #[test_timeout::timeout]
    fn lifecycle_connecting_established_closed() {
        let registry = SessionRegistry::new();
        let registration = registry.open();
        let id = registration.session_id;

        assert_eq!(registry.state(&id), Some(SessionState::Connecting));
        registry.establish(&id).unwrap();
        assert_eq!(registry.state(&id), Some(SessionState::Established));

        assert_eq!(
            registry.establish(&id),
            Err(TransitionError::Invalid {
                id,
                from: SessionState::Established,
                to: SessionState::Established,
            })
        );

        assert!(registry.close(&id));
        assert_eq!(registry.state(&id), None);
        assert!(!registry.close(&id));
        assert_eq!(registry.establish(&id), Err(TransitionError::NotFound(id)));
    }

    #[test_timeout::timeout]
    fn ping_queues_exactly_one_pong() {
        let registry = SessionRegistry::new();
        let mut registration = established(&registry);

        let outcome = registry.dispatch(&registration.session_id, decode_frame(r#"{"type":"PING"}"#));
        assert_eq!(outcome, FrameOutcome::Replied(ServerMessage::Pong));
        assert_eq!(
            registration.outbound.try_recv().unwrap(),
            Outbound::Message(ServerMessage::Pong)
        );
        assert!(registration.outbound.try_recv().is_err());
    }

    #[test_timeout::timeout]
    fn malformed_frame_is_ignored_and_session_survives() {
        let registry = SessionRegistry::new();
        let mut registration = established(&registry);
        let id = registration.session_id;

        assert_eq!(
            registry.dispatch(&id, decode_frame("{oops")),
            FrameOutcome::Ignored(IgnoreReason::Malformed)
        );
        assert!(registration.outbound.try_recv().is_err());
        assert_eq!(registry.state(&id), Some(SessionState::Established));

        assert_eq!(
            registry.dispatch(&id, decode_frame(r#"{"type":"PING"}"#)),
            FrameOutcome::Replied(ServerMessage::Pong)
        );
    }

    #[test_timeout::timeout]
    fn frames_before_handshake_are_ignored() {
        let registry = SessionRegistry::new();
        let mut registration = registry.open();

        assert_eq!(
            registry.dispatch(&registration.session_id, decode_frame(r#"{"type":"PING"}"#)),
            FrameOutcome::Ignored(IgnoreReason::NotEstablished)
        );
        assert!(registration.outbound.try_recv().is_err());
    }

    #[test_timeout::timeout]
    fn ping_after_writer_exit_is_reported_as_writer_closed() {
        let registry = SessionRegistry::new();
        let registration = established(&registry);
        let id = registration.session_id;
        drop(registration.outbound);

        assert_eq!(
            registry.dispatch(&id, decode_frame(r#"{"type":"PING"}"#)),
            FrameOutcome::Ignored(IgnoreReason::WriterClosed)
        );
        assert_eq!(registry.state(&id), Some(SessionState::Established));
    }

    #[test_timeout::timeout]
    fn close_drops_outbound_sender() {
        let registry = SessionRegistry::new();
        let mut registration = established(&registry);

        registry.close(&registration.session_id);
        assert_eq!(
            registration.outbound.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        );
    }

    #[test_timeout::timeout]
    fn close_idle_prunes_only_idle_sessions() {
        let registry = SessionRegistry::new();
        let mut stale = established(&registry);
        std::thread::sleep(Duration::from_millis(60));
        let fresh = established(&registry);
        assert_eq!(registry.len(), 2);

        let pruned = registry.close_idle(Instant::now(), Duration::from_millis(50));
        assert_eq!(pruned, 1);
        assert_eq!(registry.state(&stale.session_id), None);
        assert_eq!(
            registry.state(&fresh.session_id),
            Some(SessionState::Established)
        );
        assert_eq!(
            stale.outbound.try_recv().unwrap(),
            Outbound::Close {
                code: CLOSE_POLICY,
                reason: "idle timeout".into()
            }
        );

        let later = Instant::now() + Duration::from_secs(60);
        assert_eq!(registry.close_idle(later, Duration::from_secs(30)), 1);
        assert!(registry.is_empty());
    }

    #[test_timeout::timeout]
    fn snapshot_reports_states() {
        let registry = SessionRegistry::new();
        let pending = registry.open();
        let live = established(&registry);

        let mut snapshot = registry.snapshot();
        snapshot.sort_by_key(|s| s.state != SessionState::Connecting);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].session_id, pending.session_id);
        assert_eq!(snapshot[0].state, SessionState::Connecting);
        assert_eq!(snapshot[1].session_id, live.session_id);
        assert_eq!(snapshot[1].state, SessionState::Established);
    }

    #[test_timeout::tokio_timeout_test(30, worker_threads = 4)]
    async fn concurrent_open_close_keeps_count_consistent() {
        let registry = SessionRegistry::new();
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                for _ in 0..50 {
                    let registration = registry.open();
                    registry.establish(&registration.session_id).unwrap();
                    ids.push(registration.session_id);
                }
                for id in &ids {
                    assert!(registry.close(id));
                }
                ids
            }));
        }

        let mut all = HashSet::new();
        for task in tasks {
            for id in task.await.unwrap() {
                assert!(all.insert(id), "session id reused");
            }
        }
        assert_eq!(all.len(), 32 * 50);
        assert!(registry.is_empty());
    }
}
