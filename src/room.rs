use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::CoordinatorError;
use crate::types::{ConnectionId, ParticipantId, RecordingId, RoomId, SessionId, UserId};

/// A room never holds more non-disconnected participants than this.
pub const MAX_ACTIVE_PARTICIPANTS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Waiting,
    Active,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Student,
    Consultant,
}

impl FromStr for ParticipantRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "student" => Ok(ParticipantRole::Student),
            "consultant" => Ok(ParticipantRole::Consultant),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

impl fmt::Display for ParticipantRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParticipantRole::Student => f.write_str("student"),
            ParticipantRole::Consultant => f.write_str("consultant"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: ParticipantId,
    pub user_id: UserId,
    pub name: String,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    pub connection_state: ConnectionState,
    #[serde(skip)]
    pub connection_id: Option<ConnectionId>,
}

impl Participant {
    pub fn is_present(&self) -> bool {
        self.connection_state != ConnectionState::Disconnected
    }

    pub fn is_bound_to(&self, connection_id: &str) -> bool {
        self.connection_id.as_deref() == Some(connection_id)
    }

    pub fn summary(&self) -> ParticipantSummary {
        ParticipantSummary {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            name: self.name.clone(),
            role: self.role,
            connection_state: self.connection_state,
        }
    }
}

/// What other participants learn about a participant over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSummary {
    pub id: ParticipantId,
    pub user_id: UserId,
    pub name: String,
    pub role: ParticipantRole,
    pub connection_state: ConnectionState,
}

/// The student and consultant whose attendance a room is tracking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendancePair {
    pub student_user_id: UserId,
    pub consultant_user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: RoomId,
    pub session_id: SessionId,
    pub host_user_id: UserId,
    /// Join order matters: index 0 sends the offer.
    pub participants: Vec<Participant>,
    pub recording: bool,
    pub recording_id: Option<RecordingId>,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: RoomStatus,
    pub ice_servers: Value,
    /// Set when the room went active with one student and one consultant present.
    pub attendance: Option<AttendancePair>,
    /// The booked student and consultant. When known, no other pair opens attendance.
    #[serde(skip)]
    pub session_pair: Option<AttendancePair>,
}

#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub participant: Participant,
    /// The participant already existed and was rebound to a new connection.
    pub rejoined: bool,
    /// The connection the participant was bound to before this join, if it changed.
    pub replaced_connection: Option<ConnectionId>,
    /// This join moved the room from `waiting` to `active`.
    pub activated: bool,
}

#[derive(Debug, Clone)]
pub struct LeaveOutcome {
    pub participant: Participant,
    pub released_connection: Option<ConnectionId>,
    /// No non-disconnected participant remains.
    pub room_empty: bool,
}

/// Everything the attendance engine needs once a room has ended.
#[derive(Debug, Clone)]
pub struct EndedRoom {
    pub room_id: RoomId,
    pub session_id: SessionId,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: DateTime<Utc>,
    pub attendance: Option<AttendancePair>,
    /// Recording that was still running when the room ended.
    pub open_recording: Option<RecordingId>,
}

impl Room {
    pub fn new(
        session_id: SessionId,
        host_user_id: UserId,
        ice_servers: Value,
        now: DateTime<Utc>,
    ) -> Self {
        Room {
            id: Uuid::new_v4().to_string(),
            session_id,
            host_user_id,
            participants: Vec::new(),
            recording: false,
            recording_id: None,
            created_at: now,
            start_time: None,
            end_time: None,
            status: RoomStatus::Waiting,
            ice_servers,
            attendance: None,
            session_pair: None,
        }
    }

    #[must_use]
    pub fn with_session_pair(mut self, pair: AttendancePair) -> Self {
        self.session_pair = Some(pair);
        self
    }

    pub fn active_count(&self) -> usize {
        self.participants.iter().filter(|p| p.is_present()).count()
    }

    pub fn participant(&self, participant_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == participant_id)
    }

    fn participant_mut(&mut self, participant_id: &str) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.id == participant_id)
    }

    /// The participant at index 0, once there is someone for it to call.
    pub fn initiator(&self) -> Option<&Participant> {
        if self.participants.len() < MAX_ACTIVE_PARTICIPANTS {
            return None;
        }
        self.participants.first()
    }

    pub fn summaries(&self) -> Vec<ParticipantSummary> {
        self.participants.iter().map(Participant::summary).collect()
    }

    /// Whether `participant_id` belongs to this room and is bound to `connection_id`.
    pub fn is_sender(&self, participant_id: &str, connection_id: &str) -> bool {
        self.participant(participant_id)
            .is_some_and(|p| p.is_present() && p.is_bound_to(connection_id))
    }

    /// Upserts a participant keyed by `user_id`.
    pub fn join(
        &mut self,
        user_id: &str,
        name: &str,
        role: ParticipantRole,
        connection_id: &str,
        now: DateTime<Utc>,
    ) -> Result<JoinOutcome, CoordinatorError> {
        if self.status == RoomStatus::Ended {
            return Err(CoordinatorError::RoomNotFound(self.id.clone()));
        }

        let active = self.active_count();
        let existing_index = self.participants.iter().position(|p| p.user_id == user_id);
        let (participant, rejoined, replaced_connection) =
            if let Some(index) = existing_index {
                if !self.participants[index].is_present() && active >= MAX_ACTIVE_PARTICIPANTS {
                    return Err(CoordinatorError::RoomFull(self.id.clone()));
                }
                let existing = &mut self.participants[index];
                let previous = existing.connection_id.replace(connection_id.to_string());
                existing.connection_state = ConnectionState::Connecting;
                existing.joined_at = now;
                existing.left_at = None;
                existing.name = name.to_string();
                let replaced = previous.filter(|c| c != connection_id);
                (existing.clone(), true, replaced)
            } else {
                if active >= MAX_ACTIVE_PARTICIPANTS {
                    return Err(CoordinatorError::RoomFull(self.id.clone()));
                }
                let participant = Participant {
                    id: Uuid::new_v4().to_string(),
                    user_id: user_id.to_string(),
                    name: name.to_string(),
                    role,
                    joined_at: now,
                    left_at: None,
                    connection_state: ConnectionState::Connecting,
                    connection_id: Some(connection_id.to_string()),
                };
                self.participants.push(participant.clone());
                (participant, false, None)
            };

        let activated = self.status == RoomStatus::Waiting
            && self.active_count() == MAX_ACTIVE_PARTICIPANTS;
        if activated {
            self.status = RoomStatus::Active;
            self.start_time = Some(now);
            self.attendance = self.attendance_pair();
        }

        Ok(JoinOutcome {
            participant,
            rejoined,
            replaced_connection,
            activated,
        })
    }

    /// One present student and one present consultant, matching the booked pair if known.
    fn attendance_pair(&self) -> Option<AttendancePair> {
        let present = |role| {
            self.participants
                .iter()
                .find(|p| p.is_present() && p.role == role)
                .map(|p| p.user_id.clone())
        };
        let pair = AttendancePair {
            student_user_id: present(ParticipantRole::Student)?,
            consultant_user_id: present(ParticipantRole::Consultant)?,
        };
        match &self.session_pair {
            Some(booked) if *booked != pair => None,
            _ => Some(pair),
        }
    }

    /// Marks a participant as negotiating over its bound connection.
    pub fn mark_connected(&mut self, participant_id: &str) {
        if let Some(p) = self.participant_mut(participant_id) {
            if p.connection_state == ConnectionState::Connecting {
                p.connection_state = ConnectionState::Connected;
            }
        }
    }

    /// Disconnects a participant. `Ok(None)` when it had already left.
    ///
    /// With `only_connection` set, the participant is left alone unless it is still
    /// bound to that connection, so a stale socket cannot evict a rebound participant.
    pub fn leave(
        &mut self,
        participant_id: &str,
        only_connection: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<LeaveOutcome>, CoordinatorError> {
        let participant = self
            .participant_mut(participant_id)
            .ok_or_else(|| CoordinatorError::ParticipantNotFound(participant_id.to_string()))?;

        if !participant.is_present() {
            return Ok(None);
        }
        if let Some(connection_id) = only_connection {
            if !participant.is_bound_to(connection_id) {
                return Ok(None);
            }
        }

        participant.connection_state = ConnectionState::Disconnected;
        participant.left_at = Some(now);
        let released_connection = participant.connection_id.take();
        let participant = participant.clone();

        Ok(Some(LeaveOutcome {
            participant,
            released_connection,
            room_empty: self.active_count() == 0,
        }))
    }

    /// Ends the room. Returns `None` if it had already ended.
    pub fn end(&mut self, now: DateTime<Utc>) -> Option<EndedRoom> {
        if self.status == RoomStatus::Ended {
            return None;
        }
        self.status = RoomStatus::Ended;
        self.end_time = Some(now);

        let open_recording = if self.recording {
            self.recording = false;
            self.recording_id.clone()
        } else {
            None
        };

        Some(EndedRoom {
            room_id: self.id.clone(),
            session_id: self.session_id.clone(),
            start_time: self.start_time,
            end_time: now,
            attendance: self.attendance.clone(),
            open_recording,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn room() -> Room {
        Room::new("s1".into(), "host".into(), json!([]), Utc::now())
    }

    #[test]
    fn second_join_activates_and_first_joiner_initiates() {
        let mut room = room();
        let now = Utc::now();
        let a = room.join("u-student", "Ada", ParticipantRole::Student, "c1", now).unwrap();
        assert!(!a.activated);
        assert!(room.initiator().is_none());

        let b = room.join("u-consultant", "Bo", ParticipantRole::Consultant, "c2", now).unwrap();
        assert!(b.activated);
        assert_eq!(room.status, RoomStatus::Active);
        assert_eq!(room.start_time, Some(now));
        assert_eq!(room.initiator().unwrap().id, a.participant.id);
        assert_eq!(
            room.attendance,
            Some(AttendancePair {
                student_user_id: "u-student".into(),
                consultant_user_id: "u-consultant".into(),
            })
        );
    }

    #[test]
    fn only_the_booked_pair_opens_attendance() {
        let booked = AttendancePair {
            student_user_id: "u-student".into(),
            consultant_user_id: "u-consultant".into(),
        };
        let now = Utc::now();

        let mut room = room().with_session_pair(booked.clone());
        room.join("u-other", "Eve", ParticipantRole::Student, "c1", now).unwrap();
        let b = room.join("u-consultant", "Bo", ParticipantRole::Consultant, "c2", now).unwrap();
        assert!(b.activated);
        assert_eq!(room.status, RoomStatus::Active);
        assert_eq!(room.attendance, None);

        let mut room = self::room().with_session_pair(booked.clone());
        room.join("u-student", "Ada", ParticipantRole::Student, "c1", now).unwrap();
        room.join("u-consultant", "Bo", ParticipantRole::Consultant, "c2", now).unwrap();
        assert_eq!(room.attendance, Some(booked));
    }

    #[test]
    fn rejoin_reuses_participant_and_rebinds() {
        let mut room = room();
        let now = Utc::now();
        let first = room.join("u1", "Ada", ParticipantRole::Student, "c1", now).unwrap();
        room.mark_connected(&first.participant.id);

        let later = now + Duration::seconds(5);
        let again = room.join("u1", "Ada", ParticipantRole::Student, "c9", later).unwrap();
        assert!(again.rejoined);
        assert_eq!(again.participant.id, first.participant.id);
        assert_eq!(again.replaced_connection.as_deref(), Some("c1"));
        assert_eq!(again.participant.connection_state, ConnectionState::Connecting);
        assert_eq!(again.participant.joined_at, later);
        assert_eq!(room.participants.len(), 1);
    }

    #[test]
    fn third_participant_is_rejected() {
        let mut room = room();
        let now = Utc::now();
        room.join("u1", "A", ParticipantRole::Student, "c1", now).unwrap();
        room.join("u2", "B", ParticipantRole::Consultant, "c2", now).unwrap();

        let err = room.join("u3", "C", ParticipantRole::Student, "c3", now).unwrap_err();
        assert!(matches!(err, CoordinatorError::RoomFull(_)));
        assert_eq!(room.participants.len(), 2);
    }

    #[test]
    fn disconnected_participant_cannot_rejoin_a_full_room() {
        let mut room = room();
        let now = Utc::now();
        let a = room.join("u1", "A", ParticipantRole::Student, "c1", now).unwrap();
        room.join("u2", "B", ParticipantRole::Consultant, "c2", now).unwrap();
        room.leave(&a.participant.id, None, now).unwrap();
        room.join("u3", "C", ParticipantRole::Student, "c3", now).unwrap();

        let err = room.join("u1", "A", ParticipantRole::Student, "c4", now).unwrap_err();
        assert!(matches!(err, CoordinatorError::RoomFull(_)));
    }

    #[test]
    fn leave_is_idempotent_and_reports_empty_room() {
        let mut room = room();
        let now = Utc::now();
        let a = room.join("u1", "A", ParticipantRole::Student, "c1", now).unwrap();

        let outcome = room.leave(&a.participant.id, None, now).unwrap().unwrap();
        assert!(outcome.room_empty);
        assert_eq!(outcome.released_connection.as_deref(), Some("c1"));
        assert_eq!(outcome.participant.left_at, Some(now));

        assert!(room.leave(&a.participant.id, None, now).unwrap().is_none());
        assert!(matches!(
            room.leave("nobody", None, now),
            Err(CoordinatorError::ParticipantNotFound(_))
        ));
    }

    #[test]
    fn stale_connection_does_not_evict_rebound_participant() {
        let mut room = room();
        let now = Utc::now();
        let a = room.join("u1", "A", ParticipantRole::Student, "old", now).unwrap();
        room.join("u1", "A", ParticipantRole::Student, "new", now).unwrap();

        assert!(room.leave(&a.participant.id, Some("old"), now).unwrap().is_none());
        assert!(room.participant(&a.participant.id).unwrap().is_present());
    }

    #[test]
    fn end_happens_once_and_closes_recording() {
        let mut room = room();
        room.recording = true;
        room.recording_id = Some("rec-1".into());
        let now = Utc::now();

        let ended = room.end(now).unwrap();
        assert_eq!(ended.open_recording.as_deref(), Some("rec-1"));
        assert!(!room.recording);
        assert!(room.end(now).is_none());

        let err = room.join("u1", "A", ParticipantRole::Student, "c1", now).unwrap_err();
        assert!(matches!(err, CoordinatorError::RoomNotFound(_)));
    }

    #[test]
    fn two_students_activate_without_attendance() {
        let mut room = room();
        let now = Utc::now();
        room.join("u1", "A", ParticipantRole::Student, "c1", now).unwrap();
        let b = room.join("u2", "B", ParticipantRole::Student, "c2", now).unwrap();
        assert!(b.activated);
        assert!(room.attendance.is_none());
    }
}
