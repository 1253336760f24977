use std::sync::Arc;

use log::{info, warn};
use serde_json::json;
use uuid::Uuid;

use crate::clock::Clock;
use crate::connections::ConnectionRegistry;
use crate::gateway::{RecordingMeta, RecordingStatus, SessionGateway};
use crate::messages::{SignalEnvelope, SignalKind};
use crate::registry::RoomRegistry;
use crate::relay::broadcast_to_room;
use crate::room::{EndedRoom, RoomStatus};
use crate::types::RecordingId;

pub struct RecordingCoordinator {
    rooms: Arc<RoomRegistry>,
    connections: Arc<ConnectionRegistry>,
    gateway: Arc<dyn SessionGateway>,
    clock: Arc<dyn Clock>,
}

impl RecordingCoordinator {
    pub fn new(
        rooms: Arc<RoomRegistry>,
        connections: Arc<ConnectionRegistry>,
        gateway: Arc<dyn SessionGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        RecordingCoordinator {
            rooms,
            connections,
            gateway,
            clock,
        }
    }

    /// Starts recording. `None` if the room is unknown, ended, or already recording.
    pub async fn start_recording(&self, room_id: &str) -> Option<RecordingId> {
        let room = self.rooms.get(room_id).await?;
        let mut room = room.lock().await;
        if room.recording || room.status == RoomStatus::Ended {
            return None;
        }

        let recording_id = Uuid::new_v4().to_string();
        let now = self.clock.now();
        room.recording = true;
        room.recording_id = Some(recording_id.clone());

        let meta = RecordingMeta {
            recording_id: recording_id.clone(),
            room_id: room.id.clone(),
            session_id: room.session_id.clone(),
            status: RecordingStatus::Recording,
            started_at: Some(now),
            ended_at: None,
        };
        if let Err(e) = self.gateway.persist_recording_meta(&meta).await {
            warn!("Failed to persist recording {} for room {}: {}", recording_id, room.id, e);
        }

        let signal = SignalEnvelope::new(SignalKind::RecordingStart, room.id.clone())
            .with_data(json!({ "recordingId": recording_id, "startedAt": now }));
        broadcast_to_room(&room, &signal, &self.connections).await;

        info!("Recording {} started in room {}", recording_id, room.id);
        Some(recording_id)
    }

    /// Stops recording. `None` if the room is unknown or not recording.
    pub async fn stop_recording(&self, room_id: &str) -> Option<RecordingId> {
        let room = self.rooms.get(room_id).await?;
        let mut room = room.lock().await;
        if !room.recording {
            return None;
        }

        let now = self.clock.now();
        room.recording = false;
        let recording_id = room.recording_id.clone()?;

        let meta = RecordingMeta {
            recording_id: recording_id.clone(),
            room_id: room.id.clone(),
            session_id: room.session_id.clone(),
            status: RecordingStatus::Completed,
            started_at: None,
            ended_at: Some(now),
        };
        if let Err(e) = self.gateway.persist_recording_meta(&meta).await {
            warn!("Failed to complete recording {} for room {}: {}", recording_id, room.id, e);
        }

        let signal = SignalEnvelope::new(SignalKind::RecordingStop, room.id.clone())
            .with_data(json!({ "recordingId": recording_id, "endedAt": now }));
        broadcast_to_room(&room, &signal, &self.connections).await;

        info!("Recording {} stopped in room {}", recording_id, room.id);
        Some(recording_id)
    }

    /// Completes a recording left running when its room ended.
    pub async fn finalize(&self, ended: &EndedRoom) {
        let Some(recording_id) = &ended.open_recording else {
            return;
        };
        let meta = RecordingMeta {
            recording_id: recording_id.clone(),
            room_id: ended.room_id.clone(),
            session_id: ended.session_id.clone(),
            status: RecordingStatus::Completed,
            started_at: None,
            ended_at: Some(ended.end_time),
        };
        if let Err(e) = self.gateway.persist_recording_meta(&meta).await {
            warn!("Failed to complete recording {} for ended room {}: {}", recording_id, ended.room_id, e);
        }
    }
}
