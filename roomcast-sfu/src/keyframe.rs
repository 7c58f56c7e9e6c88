//! Periodic key-frame requests
//!
//! Newly subscribed receivers can only start decoding video at a key frame, so
//! every publisher of a video track is asked for one at a fixed interval.

use crate::registry::RoomRegistry;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Send one picture-loss indication per inbound video track of every room.
///
/// Returns the number of indications sent successfully.
pub async fn request_keyframes(registry: &RoomRegistry) -> usize {
    let mut sent = 0;
    for room in registry.rooms() {
        for (connection, ssrc) in room.video_sources() {
            if connection.is_closed() {
                continue;
            }
            match connection.session().send_picture_loss(ssrc).await {
                Ok(()) => sent += 1,
                Err(e) => debug!(
                    room_id = %room.id,
                    connection_id = %connection.id,
                    ssrc,
                    error = %e,
                    "Failed to send picture loss indication"
                ),
            }
        }
    }
    sent
}

/// Key-frame loop; ends on server shutdown
pub(crate) async fn run_keyframe_dispatcher(
    registry: Arc<RoomRegistry>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(interval_ms = period.as_millis() as u64, "Starting key-frame dispatcher");

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                request_keyframes(&registry).await;
            }
        }
    }
}
