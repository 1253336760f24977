//! Narrow interfaces onto the collaborators the coordinator does not own: the record
//! store, the notification service and the certification workflow.
//!
//! `MemoryGateway` backs the standalone binary and the tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

use crate::error::{ConfigError, GatewayError};
use crate::room::Room;
use crate::types::{RecordingId, RoomId, SessionId, UserId};

/// A consultation session as known to the record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRef {
    pub session_id: SessionId,
    pub student_user_id: UserId,
    pub consultant_user_id: UserId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingStatus {
    Recording,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingMeta {
    pub recording_id: RecordingId,
    pub room_id: RoomId,
    pub session_id: SessionId,
    pub status: RecordingStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceOpen {
    pub session_id: SessionId,
    pub student_user_id: UserId,
    pub consultant_user_id: UserId,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceClose {
    pub session_id: SessionId,
    pub left_at: DateTime<Utc>,
    pub duration_minutes: i64,
    pub auto_verified: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub session_id: SessionId,
    pub student_user_id: UserId,
    pub consultant_user_id: UserId,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    pub duration_minutes: Option<i64>,
    pub student_confirmed: bool,
    pub consultant_confirmed: bool,
    pub auto_verified: bool,
}

/// A student's verified-hours total immediately before and after one credit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoursBalance {
    pub previous: f64,
    pub total: f64,
}

#[async_trait]
pub trait SessionGateway: Send + Sync {
    async fn resolve_session(&self, session_id: &str) -> Result<SessionRef, GatewayError>;

    async fn persist_room_created(&self, room: &Room) -> Result<(), GatewayError>;

    async fn persist_recording_meta(&self, meta: &RecordingMeta) -> Result<(), GatewayError>;

    async fn open_attendance(&self, record: &AttendanceOpen) -> Result<(), GatewayError>;

    async fn close_attendance(&self, record: &AttendanceClose) -> Result<(), GatewayError>;

    /// Adds `hours` to the student's verified total. Must be atomic per student.
    ///
    /// `session_id` is the idempotency key: crediting a session that was already
    /// credited changes nothing and returns the balance from the first credit.
    async fn credit_verified_hours(
        &self,
        session_id: &str,
        student_id: &str,
        hours: f64,
    ) -> Result<HoursBalance, GatewayError>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_milestone(&self, student_id: &str, total_hours: f64) -> Result<(), GatewayError>;
}

#[async_trait]
pub trait CertificationService: Send + Sync {
    async fn trigger_certification_eligible(&self, student_id: &str) -> Result<(), GatewayError>;
}

#[derive(Default)]
pub struct MemoryGateway {
    sessions: RwLock<HashMap<SessionId, SessionRef>>,
    rooms: Mutex<Vec<RoomId>>,
    recordings: Mutex<HashMap<RecordingId, RecordingMeta>>,
    attendance: Mutex<HashMap<SessionId, AttendanceRecord>>,
    // One lock per student so unrelated credits never serialize on each other.
    hours: RwLock<HashMap<UserId, Arc<Mutex<f64>>>>,
    credited: Mutex<HashMap<SessionId, HoursBalance>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_session(&self, session: SessionRef) {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.session_id.clone(), session);
    }

    /// Seeds sessions from a JSON array of `SessionRef`.
    pub async fn load_sessions_file(&self, path: &Path) -> Result<usize, ConfigError> {
        let raw = fs::read_to_string(path).await.map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let sessions: Vec<SessionRef> =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;

        let count = sessions.len();
        for session in sessions {
            self.add_session(session).await;
        }
        Ok(count)
    }

    pub async fn set_verified_hours(&self, student_id: &str, hours: f64) {
        let slot = self.hours_slot(student_id).await;
        *slot.lock().await = hours;
    }

    pub async fn verified_hours(&self, student_id: &str) -> f64 {
        let slot = self.hours.read().await.get(student_id).cloned();
        match slot {
            Some(slot) => *slot.lock().await,
            None => 0.0,
        }
    }

    pub async fn attendance(&self, session_id: &str) -> Option<AttendanceRecord> {
        self.attendance.lock().await.get(session_id).cloned()
    }

    pub async fn recording(&self, recording_id: &str) -> Option<RecordingMeta> {
        self.recordings.lock().await.get(recording_id).cloned()
    }

    pub async fn created_rooms(&self) -> Vec<RoomId> {
        self.rooms.lock().await.clone()
    }

    async fn hours_slot(&self, student_id: &str) -> Arc<Mutex<f64>> {
        if let Some(slot) = self.hours.read().await.get(student_id) {
            return Arc::clone(slot);
        }
        let mut hours = self.hours.write().await;
        Arc::clone(hours.entry(student_id.to_string()).or_default())
    }
}

#[async_trait]
impl SessionGateway for MemoryGateway {
    async fn resolve_session(&self, session_id: &str) -> Result<SessionRef, GatewayError> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).cloned().ok_or(GatewayError::NotFound)
    }

    async fn persist_room_created(&self, room: &Room) -> Result<(), GatewayError> {
        self.rooms.lock().await.push(room.id.clone());
        Ok(())
    }

    async fn persist_recording_meta(&self, meta: &RecordingMeta) -> Result<(), GatewayError> {
        let mut recordings = self.recordings.lock().await;
        match recordings.get_mut(&meta.recording_id) {
            Some(existing) => {
                existing.status = meta.status;
                existing.started_at = meta.started_at.or(existing.started_at);
                existing.ended_at = meta.ended_at.or(existing.ended_at);
            }
            None => {
                recordings.insert(meta.recording_id.clone(), meta.clone());
            }
        }
        Ok(())
    }

    async fn open_attendance(&self, record: &AttendanceOpen) -> Result<(), GatewayError> {
        let mut attendance = self.attendance.lock().await;
        attendance.insert(
            record.session_id.clone(),
            AttendanceRecord {
                session_id: record.session_id.clone(),
                student_user_id: record.student_user_id.clone(),
                consultant_user_id: record.consultant_user_id.clone(),
                joined_at: record.joined_at,
                left_at: None,
                duration_minutes: None,
                student_confirmed: false,
                consultant_confirmed: false,
                auto_verified: false,
            },
        );
        Ok(())
    }

    async fn close_attendance(&self, record: &AttendanceClose) -> Result<(), GatewayError> {
        let mut attendance = self.attendance.lock().await;
        let existing = attendance
            .get_mut(&record.session_id)
            .ok_or(GatewayError::NotFound)?;
        existing.left_at = Some(record.left_at);
        existing.duration_minutes = Some(record.duration_minutes);
        existing.auto_verified = record.auto_verified;
        existing.student_confirmed = record.auto_verified;
        existing.consultant_confirmed = record.auto_verified;
        Ok(())
    }

    async fn credit_verified_hours(
        &self,
        session_id: &str,
        student_id: &str,
        hours: f64,
    ) -> Result<HoursBalance, GatewayError> {
        let slot = self.hours_slot(student_id).await;
        let mut total = slot.lock().await;
        let mut credited = self.credited.lock().await;
        if let Some(balance) = credited.get(session_id) {
            info!("Session {} was already credited; keeping the existing balance", session_id);
            return Ok(*balance);
        }

        let previous = *total;
        *total += hours;
        let balance = HoursBalance {
            previous,
            total: *total,
        };
        credited.insert(session_id.to_string(), balance);
        Ok(balance)
    }
}

/// Notifier for deployments without an outbound messaging service: records the milestone in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_milestone(&self, student_id: &str, total_hours: f64) -> Result<(), GatewayError> {
        info!("Milestone reached for student {}: {:.2} verified hours", student_id, total_hours);
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogCertification;

#[async_trait]
impl CertificationService for LogCertification {
    async fn trigger_certification_eligible(&self, student_id: &str) -> Result<(), GatewayError> {
        info!("Student {} is now eligible for certification", student_id);
        Ok(())
    }
}
