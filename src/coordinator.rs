use std::sync::Arc;

use log::{debug, error, info, warn};
use serde_json::{json, Value};

use crate::attendance::{AttendanceEngine, FailedCredit, VerificationOutcome};
use crate::clock::{Clock, SystemClock};
use crate::config::ServerConfig;
use crate::connections::ConnectionRegistry;
use crate::error::{CoordinatorError, CreditError, GatewayError};
use crate::gateway::{CertificationService, Notifier, SessionGateway};
use crate::messages::{JoinRequest, ServerMessage, Signal, SignalEnvelope, SignalKind};
use crate::recording::RecordingCoordinator;
use crate::registry::RoomRegistry;
use crate::relay::{broadcast_to_room_except, RouteOutcome, SignalingRelay};
use crate::room::{AttendancePair, EndedRoom, Participant, ParticipantRole, Room};
use crate::types::{ConnectionId, RecordingId};

/// Owns every registry and component of the video-room signaling core.
pub struct Coordinator {
    rooms: Arc<RoomRegistry>,
    connections: Arc<ConnectionRegistry>,
    relay: SignalingRelay,
    recording: Arc<RecordingCoordinator>,
    attendance: AttendanceEngine,
    gateway: Arc<dyn SessionGateway>,
    clock: Arc<dyn Clock>,
    ice_servers: Value,
}

impl Coordinator {
    pub fn new(
        config: &ServerConfig,
        gateway: Arc<dyn SessionGateway>,
        notifier: Arc<dyn Notifier>,
        certification: Arc<dyn CertificationService>,
    ) -> Self {
        Self::with_clock(config, gateway, notifier, certification, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: &ServerConfig,
        gateway: Arc<dyn SessionGateway>,
        notifier: Arc<dyn Notifier>,
        certification: Arc<dyn CertificationService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let rooms = Arc::new(RoomRegistry::new());
        let connections = Arc::new(ConnectionRegistry::new());
        let recording = Arc::new(RecordingCoordinator::new(
            Arc::clone(&rooms),
            Arc::clone(&connections),
            Arc::clone(&gateway),
            Arc::clone(&clock),
        ));
        let relay = SignalingRelay::new(
            Arc::clone(&rooms),
            Arc::clone(&connections),
            Arc::clone(&recording),
        );
        let attendance = AttendanceEngine::new(
            Arc::clone(&gateway),
            notifier,
            certification,
            config.credit_retry,
        );

        Coordinator {
            rooms,
            connections,
            relay,
            recording,
            attendance,
            gateway,
            clock,
            ice_servers: config.ice_servers.clone(),
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    pub fn rooms(&self) -> &Arc<RoomRegistry> {
        &self.rooms
    }

    /// Returns the room for `session_id`, creating it on first use.
    pub async fn create_room(&self, session_id: &str, host_user_id: &str) -> Result<Room, CoordinatorError> {
        if let Some(room) = self.rooms.get_by_session(session_id).await {
            return Ok(room.lock().await.clone());
        }
        if self.rooms.is_session_ended(session_id).await {
            return Err(CoordinatorError::SessionEnded(session_id.to_string()));
        }

        let session = match self.gateway.resolve_session(session_id).await {
            Ok(session) => session,
            Err(GatewayError::NotFound) => {
                return Err(CoordinatorError::SessionNotFound(session_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let (room, created) = self
            .rooms
            .get_or_insert(session_id, || {
                Room::new(
                    session_id.to_string(),
                    host_user_id.to_string(),
                    self.ice_servers.clone(),
                    self.clock.now(),
                )
                .with_session_pair(AttendancePair {
                    student_user_id: session.student_user_id,
                    consultant_user_id: session.consultant_user_id,
                })
            })
            .await?;
        let room = room.lock().await.clone();

        if created {
            info!("Room {} created for session {}", room.id, session_id);
            if let Err(e) = self.gateway.persist_room_created(&room).await {
                warn!("Failed to persist creation of room {}: {}", room.id, e);
            }
        }
        Ok(room)
    }

    pub async fn get_room(&self, room_id: &str) -> Option<Room> {
        self.rooms.snapshot(room_id).await
    }

    /// Adds a participant to a room, or rebinds it if its user is already there.
    pub async fn join(
        &self,
        room_id: &str,
        user_id: &str,
        name: &str,
        role: ParticipantRole,
        connection_id: &str,
    ) -> Result<(Room, Participant), CoordinatorError> {
        let shared = self
            .rooms
            .get(room_id)
            .await
            .ok_or_else(|| CoordinatorError::RoomNotFound(room_id.to_string()))?;
        let mut room = shared.lock().await;

        let now = self.clock.now();
        let outcome = room.join(user_id, name, role, connection_id, now)?;
        let participant = outcome.participant;

        self.connections.bind(connection_id, &room.id, &participant.id).await;
        if let Some(previous) = &outcome.replaced_connection {
            self.connections.unbind(previous, &room.id, &participant.id).await;
        }

        if outcome.rejoined {
            info!("Participant {} rejoined room {}", participant.id, room.id);
        } else {
            info!(
                "Participant {} ({} {}) joined room {}",
                participant.id, role, user_id, room.id
            );
            let signal = SignalEnvelope::new(SignalKind::Join, room.id.clone())
                .from_participant(participant.id.clone())
                .with_data(json!(participant.summary()));
            broadcast_to_room_except(&room, &signal, &self.connections, Some(&participant.id)).await;
        }

        if outcome.activated {
            info!("Room {} is active", room.id);
            match (&room.attendance, room.start_time) {
                (Some(pair), Some(start)) => {
                    self.attendance.on_room_active(&room.session_id, pair, start).await;
                }
                _ => warn!(
                    "Room {} went active without the booked student and consultant; attendance is not tracked",
                    room.id
                ),
            }
        }

        Ok((room.clone(), participant))
    }

    /// Explicit leave. Ends the room when nobody is left.
    pub async fn leave(
        &self,
        room_id: &str,
        participant_id: &str,
    ) -> Result<Option<VerificationOutcome>, CoordinatorError> {
        self.leave_room(room_id, participant_id, None).await
    }

    async fn leave_room(
        &self,
        room_id: &str,
        participant_id: &str,
        only_connection: Option<&str>,
    ) -> Result<Option<VerificationOutcome>, CoordinatorError> {
        let shared = self
            .rooms
            .get(room_id)
            .await
            .ok_or_else(|| CoordinatorError::RoomNotFound(room_id.to_string()))?;

        let ended = {
            let mut room = shared.lock().await;
            let now = self.clock.now();
            let Some(outcome) = room.leave(participant_id, only_connection, now)? else {
                return Ok(None);
            };

            if let Some(connection_id) = &outcome.released_connection {
                self.connections.unbind(connection_id, &room.id, participant_id).await;
            }
            info!("Participant {} left room {}", participant_id, room.id);

            let signal = SignalEnvelope::new(SignalKind::Leave, room.id.clone())
                .from_participant(participant_id)
                .with_data(json!(outcome.participant.summary()));
            broadcast_to_room_except(&room, &signal, &self.connections, Some(participant_id)).await;

            if outcome.room_empty {
                room.end(now)
            } else {
                None
            }
        };

        match ended {
            Some(ended) => self.finish_room(ended).await.map(Some).map_err(Into::into),
            None => Ok(None),
        }
    }

    /// Ends a room regardless of who is still in it. Unknown or ended rooms are a no-op.
    pub async fn end_room(&self, room_id: &str) -> Result<Option<VerificationOutcome>, CreditError> {
        let Some(shared) = self.rooms.get(room_id).await else {
            return Ok(None);
        };
        let ended = shared.lock().await.end(self.clock.now());
        match ended {
            Some(ended) => self.finish_room(ended).await.map(Some),
            None => Ok(None),
        }
    }

    /// Runs exactly once per room, after its status flipped to ended.
    async fn finish_room(&self, ended: EndedRoom) -> Result<VerificationOutcome, CreditError> {
        // Only a room that could have credited hours closes its session for good.
        let tombstone = ended.attendance.is_some() && ended.start_time.is_some();
        self.rooms
            .remove(&ended.room_id, &ended.session_id, tombstone)
            .await;
        self.recording.finalize(&ended).await;
        info!("Room {} for session {} ended", ended.room_id, ended.session_id);
        self.attendance.on_room_ended(&ended).await
    }

    /// Tears down every participant bound to a closed connection.
    pub async fn disconnect(&self, connection_id: &str) {
        let bindings = self.connections.unregister(connection_id).await;
        for (room_id, participant_id) in bindings {
            match self.leave_room(&room_id, &participant_id, Some(connection_id)).await {
                Ok(_) | Err(CoordinatorError::RoomNotFound(_)) => {}
                Err(CoordinatorError::Credit(e)) => {
                    error!("Room {} closed with an uncredited session: {}", room_id, e);
                }
                Err(e) => warn!(
                    "Cleanup of participant {} in room {} failed: {}",
                    participant_id, room_id, e
                ),
            }
        }
        debug!("Connection {} closed", connection_id);
    }

    pub async fn start_recording(&self, room_id: &str) -> Option<RecordingId> {
        self.recording.start_recording(room_id).await
    }

    pub async fn stop_recording(&self, room_id: &str) -> Option<RecordingId> {
        self.recording.stop_recording(room_id).await
    }

    pub async fn route(&self, envelope: SignalEnvelope, sender: &ConnectionId) -> RouteOutcome {
        self.relay.route(envelope, sender).await
    }

    pub async fn failed_credits(&self) -> Vec<FailedCredit> {
        self.attendance.failed_credits().await
    }

    /// Handles one text frame from a client connection.
    pub async fn handle_text(&self, connection_id: &ConnectionId, text: &str) {
        let signal = match Signal::parse(text) {
            Ok(signal) => signal,
            Err(e) => {
                warn!("Unparseable message from connection {}: {}", connection_id, e);
                self.reply_error(connection_id, "Malformed message").await;
                return;
            }
        };

        match signal {
            Signal::Join { room_id, request } => {
                self.handle_join(connection_id, room_id, request).await;
            }
            Signal::Leave {
                room_id,
                participant_id,
            } => {
                let is_sender = match self.rooms.get(&room_id).await {
                    Some(room) => room.lock().await.is_sender(&participant_id, connection_id),
                    None => false,
                };
                if !is_sender {
                    debug!("Ignoring leave for {} from connection {}", participant_id, connection_id);
                    return;
                }
                match self.leave(&room_id, &participant_id).await {
                    Ok(_) => {}
                    Err(CoordinatorError::Credit(e)) => {
                        error!("Room {} closed with an uncredited session: {}", room_id, e);
                    }
                    Err(e) => warn!("Leave from {} failed: {}", participant_id, e),
                }
            }
            Signal::Relay(envelope) => {
                self.route(envelope, connection_id).await;
            }
            Signal::Malformed { kind, reason } => {
                warn!("Malformed {} from connection {}: {}", kind, connection_id, reason);
                self.reply_error(connection_id, &format!("Malformed {kind} message")).await;
            }
        }
    }

    async fn handle_join(&self, connection_id: &ConnectionId, room_id: String, request: JoinRequest) {
        let room_id = match (room_id.is_empty(), &request.session_id) {
            (true, Some(session_id)) => match self.create_room(session_id, &request.user_id).await {
                Ok(room) => room.id,
                Err(e) => {
                    self.reply_error(connection_id, &e.to_string()).await;
                    return;
                }
            },
            _ => room_id,
        };

        match self
            .join(&room_id, &request.user_id, &request.name, request.role, connection_id)
            .await
        {
            Ok((room, participant)) => {
                let reply = ServerMessage::VideoSessionJoined {
                    room_id: room.id.clone(),
                    participant_id: participant.id,
                    initiator_id: room.initiator().map(|p| p.id.clone()),
                    ice_servers: room.ice_servers.clone(),
                    participants: room.summaries(),
                };
                self.connections.send_json(connection_id, &reply).await;
            }
            Err(e) => {
                info!("Join of user {} to room {} refused: {}", request.user_id, room_id, e);
                self.reply_error(connection_id, &e.to_string()).await;
            }
        }
    }

    async fn reply_error(&self, connection_id: &str, message: &str) {
        self.connections
            .send_json(
                connection_id,
                &ServerMessage::Error {
                    message: message.to_string(),
                },
            )
            .await;
    }
}
