//! Per-session, append-only log of outbound protocol messages.
//!
//! Sequence numbers start at 1 and are dense, so entry `n` lives at index
//! `n - 1`. Append, replay and subscribe all take the same lock, which is what
//! makes "replay then follow live" gap-free and duplicate-free.

use std::collections::VecDeque;
use std::sync::Arc;

use buildspace_core::ids::SessionId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::instrument;

use crate::error::StoreError;

/// Live fan-out buffer. Slow subscribers that fall further behind than this
/// re-read from the log instead of blocking the producer.
const LIVE_CAPACITY: usize = 256;

/// One logged outbound message.
#[derive(Clone, Debug, Serialize)]
pub struct EventEntry {
    pub sequence: u64,
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

struct Inner {
    entries: Vec<Arc<EventEntry>>,
    /// `None` once the log is closed.
    live: Option<broadcast::Sender<Arc<EventEntry>>>,
}

pub struct EventLog {
    session_id: SessionId,
    inner: Mutex<Inner>,
}

impl EventLog {
    pub fn new(session_id: SessionId) -> Self {
        let (live, _) = broadcast::channel(LIVE_CAPACITY);
        Self {
            session_id,
            inner: Mutex::new(Inner {
                entries: Vec::new(),
                live: Some(live),
            }),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Append a message and return its sequence number. Never waits on
    /// subscribers.
    #[instrument(level = "trace", skip(self, payload), fields(session_id = %self.session_id))]
    pub fn append(&self, payload: serde_json::Value) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        let Some(live) = inner.live.clone() else {
            return Err(StoreError::Closed(self.session_id.to_string()));
        };

        let sequence = inner.entries.len() as u64 + 1;
        let entry = Arc::new(EventEntry {
            sequence,
            session_id: self.session_id.clone(),
            timestamp: Utc::now(),
            payload,
        });
        inner.entries.push(Arc::clone(&entry));
        // No subscribers is fine; the entry stays in the log for replay.
        let _ = live.send(entry);
        Ok(sequence)
    }

    /// Serialize and append a protocol message.
    pub fn append_message<T: Serialize>(&self, message: &T) -> Result<u64, StoreError> {
        self.append(serde_json::to_value(message)?)
    }

    /// Entries with a sequence number greater than `after`, ascending.
    pub fn replay(&self, after: u64) -> Vec<Arc<EventEntry>> {
        let inner = self.inner.lock();
        let start = (after as usize).min(inner.entries.len());
        inner.entries[start..].to_vec()
    }

    /// Sequence number of the newest entry (0 when empty).
    pub fn last_sequence(&self) -> u64 {
        self.inner.lock().entries.len() as u64
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().live.is_none()
    }

    /// Release all entries and end every subscription.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.live = None;
        inner.entries.clear();
    }

    /// Follow the log. With `after = Some(n)` entries newer than `n` are
    /// replayed first; with `None` only entries appended from now on are
    /// delivered.
    pub fn subscribe(self: &Arc<Self>, after: Option<u64>) -> Subscription {
        let inner = self.inner.lock();
        let len = inner.entries.len() as u64;
        let cursor = after.map_or(len, |n| n.min(len));
        let backlog = inner.entries[cursor as usize..].iter().cloned().collect();
        let receiver = inner.live.as_ref().map(broadcast::Sender::subscribe);
        drop(inner);

        Subscription {
            log: Arc::clone(self),
            backlog,
            receiver,
            cursor,
        }
    }
}

/// Ordered view over an [`EventLog`]: backlog first, then live entries.
pub struct Subscription {
    log: Arc<EventLog>,
    backlog: VecDeque<Arc<EventEntry>>,
    receiver: Option<broadcast::Receiver<Arc<EventEntry>>>,
    /// Sequence number of the last entry handed out.
    cursor: u64,
}

impl Subscription {
    /// Next entry in sequence order, or `None` once the log is closed.
    pub async fn next(&mut self) -> Option<Arc<EventEntry>> {
        loop {
            if let Some(entry) = self.backlog.pop_front() {
                self.cursor = entry.sequence;
                return Some(entry);
            }

            let receiver = self.receiver.as_mut()?;
            match receiver.recv().await {
                Ok(entry) if entry.sequence <= self.cursor => continue,
                Ok(entry) => {
                    self.cursor = entry.sequence;
                    return Some(entry);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(
                        session_id = %self.log.session_id(),
                        skipped,
                        "Subscriber lagged, catching up from log"
                    );
                    self.backlog = self.log.replay(self.cursor).into();
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.receiver = None;
                    return None;
                }
            }
        }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn log() -> Arc<EventLog> {
        Arc::new(EventLog::new(SessionId::new()))
    }

    fn sequences(entries: &[Arc<EventEntry>]) -> Vec<u64> {
        entries.iter().map(|e| e.sequence).collect()
    }

    #[test]
    fn append_assigns_contiguous_sequences_from_one() {
        let log = log();
        for i in 0..5 {
            assert_eq!(log.append(json!({"n": i})).unwrap(), i + 1);
        }
        let all = log.replay(0);
        assert_eq!(sequences(&all), vec![1, 2, 3, 4, 5]);
        for (i, entry) in all.iter().enumerate() {
            assert_eq!(entry.payload["n"], i);
        }
    }

    #[test]
    fn replay_never_returns_seen_entries() {
        let log = log();
        for i in 0..10 {
            log.append(json!(i)).unwrap();
        }
        for after in 0..=12 {
            let entries = log.replay(after);
            assert!(entries.iter().all(|e| e.sequence > after));
            assert_eq!(entries.len() as u64, 10u64.saturating_sub(after));
        }
    }

    #[test]
    fn replay_is_restartable() {
        let log = log();
        log.append(json!("a")).unwrap();
        log.append(json!("b")).unwrap();
        assert_eq!(sequences(&log.replay(1)), vec![2]);
        log.append(json!("c")).unwrap();
        assert_eq!(sequences(&log.replay(1)), vec![2, 3]);
        assert_eq!(sequences(&log.replay(0)), vec![1, 2, 3]);
    }

    #[test]
    fn append_after_close_is_rejected() {
        let log = log();
        log.append(json!(1)).unwrap();
        log.close();
        assert!(log.is_closed());
        assert!(matches!(log.append(json!(2)), Err(StoreError::Closed(_))));
        assert!(log.replay(0).is_empty());
    }

    #[tokio::test]
    async fn subscribe_without_cursor_only_sees_new_entries() {
        let log = log();
        log.append(json!("old")).unwrap();

        let mut sub = log.subscribe(None);
        log.append(json!("new")).unwrap();

        let entry = sub.next().await.unwrap();
        assert_eq!(entry.sequence, 2);
        assert_eq!(entry.payload, json!("new"));
    }

    #[tokio::test]
    async fn subscribe_with_cursor_replays_then_follows() {
        let log = log();
        for i in 1..=3 {
            log.append(json!(i)).unwrap();
        }

        let mut sub = log.subscribe(Some(1));
        log.append(json!(4)).unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(sub.next().await.unwrap().sequence);
        }
        assert_eq!(seen, vec![2, 3, 4]);
        assert_eq!(sub.cursor(), 4);
    }

    #[tokio::test]
    async fn cursor_beyond_end_is_clamped() {
        let log = log();
        log.append(json!(1)).unwrap();
        let mut sub = log.subscribe(Some(99));
        log.append(json!(2)).unwrap();
        assert_eq!(sub.next().await.unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn lagging_subscriber_catches_up_without_gaps() {
        let log = log();
        let mut sub = log.subscribe(Some(0));
        let total = LIVE_CAPACITY as u64 * 2 + 10;
        for i in 0..total {
            log.append(json!(i)).unwrap();
        }

        let mut expected = 1;
        while expected <= total {
            let entry = sub.next().await.unwrap();
            assert_eq!(entry.sequence, expected);
            expected += 1;
        }
    }

    #[tokio::test]
    async fn close_ends_subscription() {
        let log = log();
        let mut sub = log.subscribe(None);

        let closer = Arc::clone(&log);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.close();
        });

        let next = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .expect("subscription should end when the log closes");
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn concurrent_appends_stay_dense() {
        let log = log();
        let mut handles = Vec::new();
        for t in 0..8 {
            let log = Arc::clone(&log);
            handles.push(tokio::spawn(async move {
                for i in 0..50 {
                    log.append(json!({"t": t, "i": i})).unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let all = log.replay(0);
        assert_eq!(sequences(&all), (1..=400).collect::<Vec<_>>());
    }
}
