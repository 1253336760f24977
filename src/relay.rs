use std::sync::Arc;

use log::{debug, warn};
use serde::Serialize;

use crate::connections::ConnectionRegistry;
use crate::messages::{SignalEnvelope, SignalKind};
use crate::recording::RecordingCoordinator;
use crate::registry::RoomRegistry;
use crate::room::Room;
use crate::types::{ConnectionId, RecordingId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    MissingTarget,
    UnknownRoom,
    UnauthorizedSender,
    TargetUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    /// Best-effort miss; the peers are expected to renegotiate on their own.
    Dropped(DropReason),
    Recording(Option<RecordingId>),
    Ignored,
}

/// Sends `message` to every present participant of `room` except `except`.
/// Returns how many participants it was queued for.
pub async fn broadcast_to_room_except<T: Serialize>(
    room: &Room,
    message: &T,
    connections: &ConnectionRegistry,
    except: Option<&str>,
) -> usize {
    let msg = match serde_json::to_string(message) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("Failed to serialize broadcast for room {}: {}", room.id, e);
            return 0;
        }
    };

    let mut delivered = 0;
    for participant in &room.participants {
        if Some(participant.id.as_str()) == except || !participant.is_present() {
            continue;
        }
        if let Some(connection_id) = &participant.connection_id {
            if connections.send_text(connection_id, msg.clone()).await {
                delivered += 1;
            }
        }
    }
    delivered
}

pub async fn broadcast_to_room<T: Serialize>(
    room: &Room,
    message: &T,
    connections: &ConnectionRegistry,
) -> usize {
    broadcast_to_room_except(room, message, connections, None).await
}

/// Routes negotiation and control signals between the participants of a room.
pub struct SignalingRelay {
    rooms: Arc<RoomRegistry>,
    connections: Arc<ConnectionRegistry>,
    recording: Arc<RecordingCoordinator>,
}

impl SignalingRelay {
    pub fn new(
        rooms: Arc<RoomRegistry>,
        connections: Arc<ConnectionRegistry>,
        recording: Arc<RecordingCoordinator>,
    ) -> Self {
        SignalingRelay {
            rooms,
            connections,
            recording,
        }
    }

    pub async fn route(&self, envelope: SignalEnvelope, sender: &ConnectionId) -> RouteOutcome {
        match &envelope.kind {
            SignalKind::Offer | SignalKind::Answer | SignalKind::IceCandidate => {
                self.forward(envelope, sender).await
            }
            SignalKind::RecordingStart | SignalKind::RecordingStop => {
                if let Err(reason) = self.authorize(&envelope, sender).await {
                    debug!("Dropping {} for room {}: {:?}", envelope.kind, envelope.room_id, reason);
                    return RouteOutcome::Dropped(reason);
                }
                let recording_id = if envelope.kind == SignalKind::RecordingStart {
                    self.recording.start_recording(&envelope.room_id).await
                } else {
                    self.recording.stop_recording(&envelope.room_id).await
                };
                RouteOutcome::Recording(recording_id)
            }
            SignalKind::Join | SignalKind::JoinVideoSession | SignalKind::Leave => {
                debug!("Membership signal {} is not relayed", envelope.kind);
                RouteOutcome::Ignored
            }
            SignalKind::Unknown(kind) => {
                warn!("Ignoring unknown signal type {:?} from connection {}", kind, sender);
                RouteOutcome::Ignored
            }
        }
    }

    async fn authorize(&self, envelope: &SignalEnvelope, sender: &str) -> Result<(), DropReason> {
        let room = self
            .rooms
            .get(&envelope.room_id)
            .await
            .ok_or(DropReason::UnknownRoom)?;
        let room = room.lock().await;
        if room.is_sender(&envelope.from, sender) {
            Ok(())
        } else {
            Err(DropReason::UnauthorizedSender)
        }
    }

    async fn forward(&self, envelope: SignalEnvelope, sender: &str) -> RouteOutcome {
        let Some(to) = envelope.to.clone() else {
            debug!("Dropping {} without a target in room {}", envelope.kind, envelope.room_id);
            return RouteOutcome::Dropped(DropReason::MissingTarget);
        };
        let Some(room) = self.rooms.get(&envelope.room_id).await else {
            debug!("Dropping {} for unknown room {}", envelope.kind, envelope.room_id);
            return RouteOutcome::Dropped(DropReason::UnknownRoom);
        };

        // Held while sending so the target cannot be unbound mid-delivery.
        let mut room = room.lock().await;
        if !room.is_sender(&envelope.from, sender) {
            debug!("Dropping {} from unbound participant {}", envelope.kind, envelope.from);
            return RouteOutcome::Dropped(DropReason::UnauthorizedSender);
        }
        room.mark_connected(&envelope.from);

        let target = room
            .participant(&to)
            .filter(|p| p.is_present())
            .and_then(|p| p.connection_id.clone());
        match target {
            Some(connection_id) if self.connections.send_json(&connection_id, &envelope).await => {
                RouteOutcome::Delivered
            }
            _ => {
                debug!("Dropping {} for unavailable participant {}", envelope.kind, to);
                RouteOutcome::Dropped(DropReason::TargetUnavailable)
            }
        }
    }
}
