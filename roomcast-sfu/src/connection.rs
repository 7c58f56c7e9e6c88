//! Connection entries
//!
//! A [`Connection`] binds one participant's transport session to their
//! signaling channel. It owns the session exclusively: closing the entry closes
//! the session and fires the `closed` signal that every task bound to the
//! connection listens on.

use crate::error::SignalError;
use crate::message::{SignalMessage, SignalSink};
use crate::transport::{NegotiationState, TransportSession};
use crate::types::{ConnectionId, ParticipantId, RoomId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Renegotiation bookkeeping, guarded by the connection's negotiation lock
#[derive(Debug, Default)]
pub(crate) struct NegotiationClock {
    /// When the last server offer was sent
    pub last_offer: Option<Instant>,
}

impl NegotiationClock {
    /// Whether an offer was sent less than `window` ago
    pub fn within(&self, window: Duration) -> bool {
        self.last_offer
            .is_some_and(|sent| sent.elapsed() < window)
    }
}

/// One participant's connection to a room
pub struct Connection {
    pub id: ConnectionId,
    pub participant: ParticipantId,
    pub room_id: RoomId,
    pub joined_at: DateTime<Utc>,

    session: Arc<dyn TransportSession>,

    /// Back-reference to the participant's signaling channel
    signal: Arc<dyn SignalSink>,

    closed: CancellationToken,
    close_started: AtomicBool,

    /// Serializes description changes on the session
    negotiation: Mutex<NegotiationClock>,

    /// When the pending retry pass is due; `None` when no retry task runs
    retry_at: SyncMutex<Option<Instant>>,
}

impl Connection {
    pub fn new(
        room_id: RoomId,
        participant: ParticipantId,
        session: Arc<dyn TransportSession>,
        signal: Arc<dyn SignalSink>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            id: ConnectionId::new(),
            participant,
            room_id,
            joined_at: Utc::now(),
            session,
            signal,
            closed,
            close_started: AtomicBool::new(false),
            negotiation: Mutex::new(NegotiationClock::default()),
            retry_at: SyncMutex::new(None),
        }
    }

    pub fn session(&self) -> &Arc<dyn TransportSession> {
        &self.session
    }

    /// Send a message to the participant
    pub fn send(&self, message: SignalMessage) -> Result<(), SignalError> {
        if self.is_closed() {
            return Err(SignalError::ChannelClosed);
        }
        self.signal.send(message)
    }

    /// Signal fired once when the connection closes
    pub fn closed_token(&self) -> &CancellationToken {
        &self.closed
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Negotiation state, `Closed` as soon as the connection is closed
    pub fn negotiation_state(&self) -> NegotiationState {
        if self.is_closed() {
            NegotiationState::Closed
        } else {
            self.session.negotiation_state()
        }
    }

    pub(crate) async fn lock_negotiation(&self) -> MutexGuard<'_, NegotiationClock> {
        self.negotiation.lock().await
    }

    /// Move the pending retry to no earlier than `deadline`.
    ///
    /// Returns true when no retry was pending, i.e. the caller must start
    /// the retry task.
    pub(crate) fn arm_retry(&self, deadline: Instant) -> bool {
        let mut slot = self.retry_at.lock();
        match *slot {
            Some(current) => {
                if deadline > current {
                    *slot = Some(deadline);
                }
                false
            }
            None => {
                *slot = Some(deadline);
                true
            }
        }
    }

    /// Clear the retry once it is due at `now`; otherwise return its later deadline
    pub(crate) fn poll_retry(&self, now: Instant) -> Option<Instant> {
        let mut slot = self.retry_at.lock();
        match *slot {
            Some(deadline) if deadline > now => Some(deadline),
            _ => {
                *slot = None;
                None
            }
        }
    }

    /// Close the connection and its session.
    ///
    /// Returns false when the connection was already closing.
    pub async fn close(&self) -> bool {
        if self.close_started.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.closed.cancel();
        if let Err(e) = self.session.close().await {
            warn!(
                connection_id = %self.id,
                error = %e,
                "Failed to close transport session"
            );
        }
        debug!(
            connection_id = %self.id,
            participant = %self.participant,
            room_id = %self.room_id,
            "Connection closed"
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MockSignalSink, SessionDescription};
    use crate::test_helpers::FakeSession;

    fn connection(sink: MockSignalSink) -> (Connection, Arc<FakeSession>) {
        let session = FakeSession::new();
        let conn = Connection::new(
            RoomId::from("room"),
            ParticipantId::from("alice"),
            session.clone(),
            Arc::new(sink),
            CancellationToken::new(),
        );
        (conn, session)
    }

    #[tokio::test]
    async fn test_close_is_single_fire() {
        let (conn, session) = connection(MockSignalSink::new());

        assert!(conn.close().await);
        assert!(!conn.close().await);
        assert!(conn.is_closed());
        assert_eq!(session.close_calls(), 1);
        assert_eq!(conn.negotiation_state(), NegotiationState::Closed);
    }

    #[tokio::test]
    async fn test_send_after_close_is_rejected() {
        let mut sink = MockSignalSink::new();
        sink.expect_send().times(1).returning(|_| Ok(()));
        let (conn, _session) = connection(sink);

        conn.send(SignalMessage::Offer(SessionDescription::offer("v=0")))
            .unwrap();
        conn.close().await;
        assert!(conn
            .send(SignalMessage::Offer(SessionDescription::offer("v=0")))
            .is_err());
    }

    #[test]
    fn test_retry_deadline_only_moves_later() {
        let (conn, _session) = connection(MockSignalSink::new());
        let now = Instant::now();

        assert!(conn.arm_retry(now + Duration::from_secs(3)));
        assert!(!conn.arm_retry(now + Duration::from_secs(5)));
        assert!(!conn.arm_retry(now + Duration::from_secs(4)));

        assert_eq!(
            conn.poll_retry(now + Duration::from_secs(3)),
            Some(now + Duration::from_secs(5))
        );
        assert_eq!(conn.poll_retry(now + Duration::from_secs(5)), None);
        assert!(conn.arm_retry(now + Duration::from_secs(6)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiation_clock_window() {
        let mut clock = NegotiationClock::default();
        assert!(!clock.within(Duration::from_secs(1)));

        clock.last_offer = Some(Instant::now());
        assert!(clock.within(Duration::from_secs(1)));

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(!clock.within(Duration::from_secs(1)));
    }
}
