//! Signaling & renegotiation engine
//!
//! Inbound offer/answer/candidate messages are applied to a connection's
//! session under its negotiation lock, so one session never sees two
//! description changes at once.
//!
//! Server-driven renegotiation runs per room: every change to the track table
//! wakes the room's negotiator, which reconciles each connection's outbound
//! tracks against the table and sends a fresh offer to the ones that can take
//! it. Requests that arrive while a pass is pending are merged into it.

use crate::config::SfuConfig;
use crate::connection::Connection;
use crate::error::{Result, SfuError};
use crate::message::SignalMessage;
use crate::registry::RoomRegistry;
use crate::room::SfuRoom;
use crate::track::PublishedTrack;
use crate::transport::NegotiationState;
use crate::types::TrackId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::track::track_local::TrackLocal;

/// Why a renegotiation pass was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenegotiationCause {
    TrackAdded,
    TrackRemoved,
    ConnectionJoined,
    ConnectionLeft,
    /// Delayed follow-up of a previously sent offer
    Retry,
    /// Periodic resync timer
    Periodic,
}

impl RenegotiationCause {
    /// Self-healing passes only offer to connections whose view is stale
    #[must_use]
    pub const fn is_self_healing(self) -> bool {
        matches!(self, Self::Retry | Self::Periodic)
    }

    /// Combine two pending requests into the one the pass should honour
    #[must_use]
    pub const fn merge(self, other: Self) -> Self {
        if self.is_self_healing() {
            other
        } else {
            self
        }
    }
}

/// What a renegotiation attempt did for one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationOutcome {
    OfferSent,
    Closed,
    /// An offer was sent inside the debounce window
    Debounced,
    /// A negotiation is in flight
    InFlight(NegotiationState),
    /// Nothing to change (self-healing passes only)
    UpToDate,
}

/// Apply one inbound signaling message to a connection
pub async fn handle_message(connection: &Connection, message: SignalMessage) -> Result<()> {
    let _clock = connection.lock_negotiation().await;
    if connection.is_closed() {
        return Err(SfuError::ConnectionClosed);
    }
    let session = connection.session();

    match message {
        SignalMessage::Offer(offer) => {
            session.set_remote_description(offer).await?;
            let answer = session.create_answer().await?;
            session.set_local_description(answer.clone()).await?;
            connection.send(SignalMessage::Answer(answer))?;
            debug!(connection_id = %connection.id, "Answered client offer");
        }
        SignalMessage::Answer(answer) => {
            let state = connection.negotiation_state();
            if state != NegotiationState::Negotiating {
                warn!(
                    connection_id = %connection.id,
                    state = ?state,
                    "Ignoring answer received while no offer is pending"
                );
                return Ok(());
            }
            session.set_remote_description(answer).await?;
            debug!(connection_id = %connection.id, "Applied client answer");
        }
        SignalMessage::Candidate(candidate) => {
            if let Err(e) = session.add_ice_candidate(candidate).await {
                warn!(
                    connection_id = %connection.id,
                    error = %e,
                    "Failed to apply remote ICE candidate"
                );
            }
        }
    }

    Ok(())
}

/// Run one renegotiation pass over every connection of `room`.
///
/// Returns the number of offers sent. Failures only affect the connection
/// they happened on.
pub async fn renegotiate_room(
    room: &Arc<SfuRoom>,
    cause: RenegotiationCause,
    config: &SfuConfig,
) -> usize {
    let tracks = room.tracks();
    let mut offers = 0;

    for connection in room.connections() {
        let outcome =
            renegotiate_connection(&connection, &tracks, cause, config.renegotiation_debounce())
                .await;
        match outcome {
            Ok(outcome) => {
                if outcome == NegotiationOutcome::OfferSent {
                    offers += 1;
                } else {
                    debug!(
                        room_id = %room.id,
                        connection_id = %connection.id,
                        outcome = ?outcome,
                        "Skipped renegotiation"
                    );
                }
                // Held-back changes are picked up by the retry pass
                let follow_up = matches!(
                    outcome,
                    NegotiationOutcome::OfferSent
                        | NegotiationOutcome::Debounced
                        | NegotiationOutcome::InFlight(_)
                );
                if follow_up && !cause.is_self_healing() {
                    schedule_retry(room, &connection, config.renegotiation_retry());
                }
            }
            Err(e) => {
                warn!(
                    room_id = %room.id,
                    connection_id = %connection.id,
                    error = %e,
                    "Renegotiation failed"
                );
            }
        }
    }

    if offers > 0 {
        debug!(room_id = %room.id, cause = ?cause, offers, "Renegotiation pass finished");
    }
    offers
}

fn same_track(a: &Arc<dyn TrackLocal + Send + Sync>, b: &PublishedTrack) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a).cast::<()>(),
        Arc::as_ptr(&b.forward).cast::<()>(),
    )
}

/// Reconcile one connection's outbound tracks with the track table and offer
pub async fn renegotiate_connection(
    connection: &Connection,
    tracks: &[Arc<PublishedTrack>],
    cause: RenegotiationCause,
    debounce: Duration,
) -> Result<NegotiationOutcome> {
    let mut clock = connection.lock_negotiation().await;

    if connection.is_closed() {
        return Ok(NegotiationOutcome::Closed);
    }
    if clock.within(debounce) {
        return Ok(NegotiationOutcome::Debounced);
    }
    let state = connection.negotiation_state();
    if !state.can_offer() {
        return Ok(NegotiationOutcome::InFlight(state));
    }

    let session = connection.session();
    let desired: HashMap<&TrackId, &Arc<PublishedTrack>> = tracks
        .iter()
        .filter(|t| t.owner != connection.id)
        .map(|t| (&t.id, t))
        .collect();
    let current = session.outbound_tracks().await;

    let mut kept: Vec<TrackId> = Vec::new();
    let mut stale: Vec<TrackId> = Vec::new();
    for track in &current {
        let id = TrackId::from(track.id());
        match desired.get(&id) {
            Some(published) if same_track(track, published) => kept.push(id),
            _ => stale.push(id),
        }
    }
    let missing: Vec<&Arc<PublishedTrack>> = desired
        .values()
        .filter(|t| !kept.contains(&t.id))
        .copied()
        .collect();

    if cause.is_self_healing()
        && stale.is_empty()
        && missing.is_empty()
        && clock.last_offer.is_some()
    {
        return Ok(NegotiationOutcome::UpToDate);
    }

    for track_id in &stale {
        session.remove_track(track_id).await?;
    }
    for track in &missing {
        session.add_track(Arc::clone(&track.forward)).await?;
    }

    let offer = session.create_offer().await?;
    session.set_local_description(offer.clone()).await?;
    connection.send(SignalMessage::Offer(offer))?;
    clock.last_offer = Some(Instant::now());

    debug!(
        connection_id = %connection.id,
        added = missing.len(),
        removed = stale.len(),
        cause = ?cause,
        "Sent renegotiation offer"
    );
    Ok(NegotiationOutcome::OfferSent)
}

/// Make sure a retry pass runs `delay` from now for `connection`.
///
/// One retry task runs per connection; a later call moves its deadline
/// instead of spawning another. The task is dropped when the connection
/// closes or the room goes away.
fn schedule_retry(room: &Arc<SfuRoom>, connection: &Arc<Connection>, delay: Duration) {
    let first = Instant::now() + delay;
    if !connection.arm_retry(first) {
        return;
    }
    let room = Arc::clone(room);
    let connection = Arc::clone(connection);

    tokio::spawn(async move {
        let mut deadline = first;
        loop {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => {}
                () = connection.closed_token().cancelled() => return,
                () = room.closed_token().cancelled() => return,
            }
            match connection.poll_retry(Instant::now()) {
                Some(later) => deadline = later,
                None => break,
            }
        }
        if !room.is_closed() && !connection.is_closed() {
            room.request_renegotiation(RenegotiationCause::Retry);
        }
    });
}

/// Negotiator loop of one room; ends when the room closes
pub(crate) async fn run_negotiator(room: Arc<SfuRoom>, config: Arc<SfuConfig>) {
    loop {
        tokio::select! {
            () = room.closed_token().cancelled() => break,
            () = room.renegotiation_requested() => {}
        }
        let Some(cause) = room.take_pending_cause() else {
            continue;
        };
        renegotiate_room(&room, cause, &config).await;
    }
    debug!(room_id = %room.id, "Room negotiator stopped");
}

/// Periodically ask every room for a self-healing pass
pub(crate) async fn run_periodic_resync(
    registry: Arc<RoomRegistry>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval_secs = period.as_secs(), "Starting renegotiation resync task");

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                for room in registry.rooms() {
                    room.request_renegotiation(RenegotiationCause::Periodic);
                }
            }
        }
    }
}
