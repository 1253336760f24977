#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use video_coordinator::clock::ManualClock;
use video_coordinator::config::{CreditRetryPolicy, ServerConfig};
use video_coordinator::connections::ConnectionHandle;
use video_coordinator::coordinator::Coordinator;
use video_coordinator::error::GatewayError;
use video_coordinator::gateway::{
    AttendanceClose, AttendanceOpen, CertificationService, HoursBalance, MemoryGateway, Notifier,
    RecordingMeta, SessionGateway, SessionRef,
};
use video_coordinator::room::Room;

pub const STUDENT: &str = "student-1";
pub const CONSULTANT: &str = "consultant-1";

/// Captures every downstream trigger so tests can count them.
#[derive(Default)]
pub struct Recorder {
    pub milestones: Mutex<Vec<(String, f64)>>,
    pub certifications: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn milestone_count(&self) -> usize {
        self.milestones.lock().unwrap().len()
    }

    pub fn certification_count(&self) -> usize {
        self.certifications.lock().unwrap().len()
    }
}

#[async_trait]
impl Notifier for Recorder {
    async fn notify_milestone(&self, student_id: &str, total_hours: f64) -> Result<(), GatewayError> {
        self.milestones
            .lock()
            .unwrap()
            .push((student_id.to_string(), total_hours));
        Ok(())
    }
}

#[async_trait]
impl CertificationService for Recorder {
    async fn trigger_certification_eligible(&self, student_id: &str) -> Result<(), GatewayError> {
        self.certifications.lock().unwrap().push(student_id.to_string());
        Err(GatewayError::Unavailable("certificate service offline".into()))
    }
}

/// Memory store whose credit path can be switched off.
#[derive(Default)]
pub struct SwitchableGateway {
    pub inner: MemoryGateway,
    pub credits_fail: AtomicBool,
}

#[async_trait]
impl SessionGateway for SwitchableGateway {
    async fn resolve_session(&self, session_id: &str) -> Result<SessionRef, GatewayError> {
        self.inner.resolve_session(session_id).await
    }

    async fn persist_room_created(&self, room: &Room) -> Result<(), GatewayError> {
        self.inner.persist_room_created(room).await
    }

    async fn persist_recording_meta(&self, meta: &RecordingMeta) -> Result<(), GatewayError> {
        self.inner.persist_recording_meta(meta).await
    }

    async fn open_attendance(&self, record: &AttendanceOpen) -> Result<(), GatewayError> {
        self.inner.open_attendance(record).await
    }

    async fn close_attendance(&self, record: &AttendanceClose) -> Result<(), GatewayError> {
        self.inner.close_attendance(record).await
    }

    async fn credit_verified_hours(
        &self,
        session_id: &str,
        student_id: &str,
        hours: f64,
    ) -> Result<HoursBalance, GatewayError> {
        if self.credits_fail.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable("ledger offline".into()));
        }
        self.inner
            .credit_verified_hours(session_id, student_id, hours)
            .await
    }
}

pub struct Harness {
    pub coordinator: Arc<Coordinator>,
    pub gateway: Arc<SwitchableGateway>,
    pub recorder: Arc<Recorder>,
    pub clock: Arc<ManualClock>,
    pub config: ServerConfig,
}

pub fn test_config() -> ServerConfig {
    ServerConfig {
        credit_retry: CreditRetryPolicy {
            attempts: 2,
            base_backoff: Duration::from_millis(1),
        },
        ..ServerConfig::default()
    }
}

pub async fn harness() -> Harness {
    let gateway = Arc::new(SwitchableGateway::default());
    for session in ["s1", "s2", "s3", "s4"] {
        gateway
            .inner
            .add_session(SessionRef {
                session_id: session.to_string(),
                student_user_id: STUDENT.to_string(),
                consultant_user_id: CONSULTANT.to_string(),
            })
            .await;
    }
    let recorder = Arc::new(Recorder::default());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let config = test_config();
    let coordinator = Arc::new(Coordinator::with_clock(
        &config,
        gateway.clone(),
        recorder.clone(),
        recorder.clone(),
        clock.clone(),
    ));
    Harness {
        coordinator,
        gateway,
        recorder,
        clock,
        config,
    }
}

impl Harness {
    pub async fn connect(&self) -> ConnectionHandle {
        self.coordinator.connections().register().await
    }

    pub async fn verified_hours(&self) -> f64 {
        self.gateway.inner.verified_hours(STUDENT).await
    }
}

/// Next JSON message queued for a connection, failing the test after a second.
pub async fn recv_json(handle: &mut ConnectionHandle) -> Value {
    let text = tokio::time::timeout(Duration::from_secs(1), handle.outbound.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("connection closed");
    serde_json::from_str(&text).expect("valid json")
}

pub fn assert_no_message(handle: &mut ConnectionHandle) {
    if let Ok(text) = handle.outbound.try_recv() {
        panic!("unexpected message: {text}");
    }
}

/// Polls `check` until it holds, for work that was spawned fire-and-forget.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
