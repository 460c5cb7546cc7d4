use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use buildspace_core::ids::SessionId;
use buildspace_engine::Conversation;
use buildspace_store::EventEntry;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

/// A live MCP session: one conversation engine plus bookkeeping for the
/// idle reaper.
pub struct Session {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub conversation: Conversation,
    /// Unix millis of the last request or stream activity.
    last_activity: AtomicI64,
    open_streams: AtomicUsize,
}

impl Session {
    fn new(conversation: Conversation) -> Self {
        let now = Utc::now();
        Self {
            id: conversation.session_id().clone(),
            created_at: now,
            conversation,
            last_activity: AtomicI64::new(now.timestamp_millis()),
            open_streams: AtomicUsize::new(0),
        }
    }

    pub fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity.load(Ordering::Relaxed);
        let elapsed = Utc::now().timestamp_millis().saturating_sub(last);
        Duration::from_millis(elapsed.max(0) as u64)
    }

    pub fn is_closed(&self) -> bool {
        self.conversation.is_closed()
    }

    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::Relaxed)
    }

    fn last_activity_millis(&self) -> i64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    fn close(&self) {
        self.conversation.close();
    }
}

/// Keeps a session counted as streaming. When the last stream of a still-open
/// session drops, the session is closed unless the client reconnects or sends
/// a request within the grace period.
pub struct StreamGuard {
    session: Arc<Session>,
    registry: Arc<SessionRegistry>,
    grace: Duration,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let remaining = self.session.open_streams.fetch_sub(1, Ordering::Relaxed) - 1;
        self.session.touch();
        tracing::info!(session_id = %self.session.id, "SSE stream closed");

        if remaining > 0 || self.session.is_closed() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let session = Arc::clone(&self.session);
        let registry = Arc::clone(&self.registry);
        let grace = self.grace;
        let dropped_at = session.last_activity_millis();
        handle.spawn(async move {
            tokio::time::sleep(grace).await;
            let resumed =
                session.open_streams() > 0 || session.last_activity_millis() > dropped_at;
            if !resumed && !session.is_closed() && registry.remove(&session.id).is_some() {
                tracing::info!(session_id = %session.id, "Session closed after stream disconnect");
            }
        });
    }
}

/// Registry of live sessions, shared by every request handler.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Register a conversation under its session id.
    pub fn create(&self, conversation: Conversation) -> Arc<Session> {
        let session = Arc::new(Session::new(conversation));
        self.sessions
            .insert(session.id.clone(), Arc::clone(&session));
        session
    }

    /// Look up a live session.
    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions
            .get(id)
            .map(|s| Arc::clone(s.value()))
            .filter(|s| !s.is_closed())
    }

    /// Remove and close a session. Absent ids yield `None`.
    pub fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(id)?;
        session.close();
        Some(session)
    }

    /// Count an SSE stream on `session` as open until the guard drops.
    pub fn stream_opened(
        self: &Arc<Self>,
        session: &Arc<Session>,
        grace: Duration,
    ) -> StreamGuard {
        session.open_streams.fetch_add(1, Ordering::Relaxed);
        session.touch();
        StreamGuard {
            session: Arc::clone(session),
            registry: Arc::clone(self),
            grace,
        }
    }

    /// Event-log entries after `after` for a session; empty if unknown.
    pub fn replay(&self, id: &SessionId, after: u64) -> Vec<Arc<EventEntry>> {
        self.get(id)
            .map(|s| s.conversation.events().replay(after))
            .unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Close every session. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let ids = self.ids();
        let mut closed = 0;
        for id in ids {
            if self.remove(&id).is_some() {
                tracing::info!(session_id = %id, "Session closed on shutdown");
                closed += 1;
            }
        }
        closed
    }

    /// Close sessions idle longer than `timeout` with no open stream.
    pub fn reap_idle(&self, timeout: Duration) -> usize {
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|e| e.value().open_streams() == 0 && e.value().idle_for() >= timeout)
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        for id in expired {
            if self.remove(&id).is_some() {
                tracing::info!(session_id = %id, "Idle session closed");
                removed += 1;
            }
        }
        removed
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodically close idle sessions until `shutdown` fires.
pub fn start_reaper_task(
    registry: Arc<SessionRegistry>,
    interval: Duration,
    idle_timeout: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = registry.reap_idle(idle_timeout);
                    if removed > 0 {
                        tracing::info!(removed, remaining = registry.count(), "Idle session cleanup");
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildspace_engine::{ServerInfo, ToolRegistry};
    use buildspace_store::EventLog;
    use serde_json::json;

    fn conversation() -> Conversation {
        let events = Arc::new(EventLog::new(SessionId::new()));
        Conversation::new(
            ServerInfo::new("test", "0.0.0"),
            Arc::new(ToolRegistry::new()),
            events,
        )
    }

    #[test]
    fn create_get_remove() {
        let registry = SessionRegistry::new();
        let session = registry.create(conversation());
        let id = session.id.clone();
        assert!(id.as_str().starts_with("sess_"));
        assert_eq!(registry.count(), 1);
        assert!(registry.get(&id).is_some());

        let removed = registry.remove(&id).unwrap();
        assert!(removed.is_closed());
        assert!(registry.get(&id).is_none());
        assert!(registry.remove(&id).is_none());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn ids_are_distinct() {
        let registry = SessionRegistry::new();
        let a = registry.create(conversation());
        let b = registry.create(conversation());
        assert_ne!(a.id, b.id);
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn replay_unknown_session_is_empty() {
        let registry = SessionRegistry::new();
        assert!(registry.replay(&SessionId::new(), 0).is_empty());

        let session = registry.create(conversation());
        session.conversation.events().append(json!({"a": 1})).unwrap();
        session.conversation.events().append(json!({"a": 2})).unwrap();
        let entries = registry.replay(&session.id, 1);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sequence, 2);
    }

    #[test]
    fn close_all_closes_everything() {
        let registry = SessionRegistry::new();
        let a = registry.create(conversation());
        let b = registry.create(conversation());
        assert_eq!(registry.close_all(), 2);
        assert_eq!(registry.count(), 0);
        assert!(a.is_closed());
        assert!(b.is_closed());
    }

    #[test]
    fn reaper_spares_streaming_and_recent_sessions() {
        let registry = Arc::new(SessionRegistry::new());
        let idle = registry.create(conversation());
        let streaming = registry.create(conversation());
        let guard = registry.stream_opened(&streaming, Duration::from_secs(60));

        assert_eq!(registry.reap_idle(Duration::from_secs(60)), 0);
        assert_eq!(registry.reap_idle(Duration::ZERO), 1);
        assert!(idle.is_closed());
        assert!(registry.get(&streaming.id).is_some());

        // No runtime here, so dropping the guard schedules nothing.
        drop(guard);
        assert_eq!(streaming.open_streams(), 0);
        assert_eq!(registry.reap_idle(Duration::ZERO), 1);
    }

    #[tokio::test]
    async fn dropped_stream_closes_session_after_grace() {
        let registry = Arc::new(SessionRegistry::new());
        let session = registry.create(conversation());
        let guard = registry.stream_opened(&session, Duration::from_millis(20));
        drop(guard);

        for _ in 0..100 {
            if session.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(session.is_closed());
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn reconnect_within_grace_keeps_session() {
        let registry = Arc::new(SessionRegistry::new());
        let session = registry.create(conversation());
        let first = registry.stream_opened(&session, Duration::from_millis(50));
        drop(first);
        let _second = registry.stream_opened(&session, Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!session.is_closed());
        assert!(registry.get(&session.id).is_some());
    }

    #[tokio::test]
    async fn reaper_task_stops_on_shutdown() {
        let registry = Arc::new(SessionRegistry::new());
        registry.create(conversation());
        let shutdown = CancellationToken::new();
        let handle = start_reaper_task(
            Arc::clone(&registry),
            Duration::from_millis(10),
            Duration::ZERO,
            shutdown.clone(),
        );

        for _ in 0..100 {
            if registry.count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(registry.count(), 0);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
