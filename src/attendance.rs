use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::CreditRetryPolicy;
use crate::error::{CreditError, GatewayError};
use crate::gateway::{
    AttendanceClose, AttendanceOpen, CertificationService, HoursBalance, Notifier, SessionGateway,
};
use crate::room::{AttendancePair, EndedRoom};
use crate::types::{SessionId, UserId};

/// Sessions shorter than this are recorded but never credited.
pub const VERIFICATION_THRESHOLD_MINUTES: i64 = 30;
pub const WARNING_MILESTONE_HOURS: f64 = 35.0;
pub const CERTIFICATION_MILESTONE_HOURS: f64 = 40.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Milestone {
    Warning,
    CertificationEligible,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VerificationOutcome {
    /// The room never had a student and a consultant present together.
    NotTracked,
    BelowThreshold {
        duration_minutes: i64,
    },
    Verified {
        duration_minutes: i64,
        hours_earned: f64,
        balance: HoursBalance,
        milestones: Vec<Milestone>,
    },
}

/// A credit that exhausted its retries and needs an operator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedCredit {
    pub session_id: SessionId,
    pub student_user_id: UserId,
    pub hours: f64,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Whole minutes between `start` and `end`, truncated. Never negative.
pub fn duration_minutes(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    (end - start).num_minutes().max(0)
}

/// Hours credited for a session. Minutes are already floored; the quotient is not rounded.
#[allow(clippy::cast_precision_loss)]
pub fn hours_for(minutes: i64) -> f64 {
    minutes as f64 / 60.0
}

pub fn crossed_milestones(balance: HoursBalance) -> Vec<Milestone> {
    let crossed = |threshold: f64| balance.previous < threshold && balance.total >= threshold;
    let mut milestones = Vec::new();
    if crossed(WARNING_MILESTONE_HOURS) {
        milestones.push(Milestone::Warning);
    }
    if crossed(CERTIFICATION_MILESTONE_HOURS) {
        milestones.push(Milestone::CertificationEligible);
    }
    milestones
}

pub struct AttendanceEngine {
    gateway: Arc<dyn SessionGateway>,
    notifier: Arc<dyn Notifier>,
    certification: Arc<dyn CertificationService>,
    retry: CreditRetryPolicy,
    failed: Mutex<Vec<FailedCredit>>,
}

impl AttendanceEngine {
    pub fn new(
        gateway: Arc<dyn SessionGateway>,
        notifier: Arc<dyn Notifier>,
        certification: Arc<dyn CertificationService>,
        retry: CreditRetryPolicy,
    ) -> Self {
        AttendanceEngine {
            gateway,
            notifier,
            certification,
            retry,
            failed: Mutex::new(Vec::new()),
        }
    }

    /// Opens the attendance record when a room goes active. Failures are logged only.
    pub async fn on_room_active(&self, session_id: &str, pair: &AttendancePair, joined_at: DateTime<Utc>) {
        let record = AttendanceOpen {
            session_id: session_id.to_string(),
            student_user_id: pair.student_user_id.clone(),
            consultant_user_id: pair.consultant_user_id.clone(),
            joined_at,
        };
        match self.gateway.open_attendance(&record).await {
            Ok(()) => info!(
                "Attendance opened for session {} (student {}, consultant {})",
                session_id, pair.student_user_id, pair.consultant_user_id
            ),
            Err(e) => warn!("Failed to open attendance for session {}: {}", session_id, e),
        }
    }

    /// Closes attendance for an ended room and credits verified hours when the session
    /// was long enough. Only a failed credit is reported as an error.
    pub async fn on_room_ended(&self, ended: &EndedRoom) -> Result<VerificationOutcome, CreditError> {
        let (Some(pair), Some(start)) = (&ended.attendance, ended.start_time) else {
            return Ok(VerificationOutcome::NotTracked);
        };

        let minutes = duration_minutes(start, ended.end_time);
        let verified = minutes >= VERIFICATION_THRESHOLD_MINUTES;

        let close = AttendanceClose {
            session_id: ended.session_id.clone(),
            left_at: ended.end_time,
            duration_minutes: minutes,
            auto_verified: verified,
        };
        if let Err(e) = self.gateway.close_attendance(&close).await {
            warn!("Failed to close attendance for session {}: {}", ended.session_id, e);
        }

        if !verified {
            info!(
                "Session {} lasted {} minutes; below the {} minute verification threshold",
                ended.session_id, minutes, VERIFICATION_THRESHOLD_MINUTES
            );
            return Ok(VerificationOutcome::BelowThreshold {
                duration_minutes: minutes,
            });
        }

        let hours = hours_for(minutes);
        let balance = match self
            .credit_with_retry(&ended.session_id, &pair.student_user_id, hours)
            .await
        {
            Ok(balance) => balance,
            Err(e) => {
                error!("Verified hours for session {} were not credited: {}", ended.session_id, e);
                self.failed.lock().await.push(FailedCredit {
                    session_id: ended.session_id.clone(),
                    student_user_id: pair.student_user_id.clone(),
                    hours,
                    attempts: e.attempts,
                    error: e.last_error.to_string(),
                    failed_at: Utc::now(),
                });
                return Err(e);
            }
        };
        info!(
            "Credited {:.3}h to student {} for session {} (total {:.3}h)",
            hours, pair.student_user_id, ended.session_id, balance.total
        );

        let milestones = crossed_milestones(balance);
        for milestone in &milestones {
            self.dispatch_milestone(*milestone, &pair.student_user_id, balance.total);
        }

        Ok(VerificationOutcome::Verified {
            duration_minutes: minutes,
            hours_earned: hours,
            balance,
            milestones,
        })
    }

    /// Retries are safe because the store dedupes credits on `session_id`.
    async fn credit_with_retry(
        &self,
        session_id: &str,
        student_id: &str,
        hours: f64,
    ) -> Result<HoursBalance, CreditError> {
        let attempts = self.retry.attempts.max(1);
        let mut last_error = GatewayError::Unavailable("no attempt made".to_string());
        for attempt in 1..=attempts {
            match self
                .gateway
                .credit_verified_hours(session_id, student_id, hours)
                .await
            {
                Ok(balance) => return Ok(balance),
                Err(e) => {
                    warn!(
                        "Credit attempt {}/{} for student {} failed: {}",
                        attempt, attempts, student_id, e
                    );
                    last_error = e;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.retry.backoff(attempt)).await;
            }
        }
        Err(CreditError {
            student_id: student_id.to_string(),
            hours,
            attempts,
            last_error,
        })
    }

    /// Fire-and-forget: the outcome of the downstream workflow never reaches the room.
    fn dispatch_milestone(&self, milestone: Milestone, student_id: &str, total_hours: f64) {
        let student_id = student_id.to_string();
        match milestone {
            Milestone::Warning => {
                let notifier = Arc::clone(&self.notifier);
                tokio::spawn(async move {
                    if let Err(e) = notifier.notify_milestone(&student_id, total_hours).await {
                        warn!("Milestone notification for student {} failed: {}", student_id, e);
                    }
                });
            }
            Milestone::CertificationEligible => {
                let certification = Arc::clone(&self.certification);
                tokio::spawn(async move {
                    if let Err(e) = certification.trigger_certification_eligible(&student_id).await {
                        error!("Certification trigger for student {} failed: {}", student_id, e);
                    }
                });
            }
        }
    }

    pub async fn failed_credits(&self) -> Vec<FailedCredit> {
        self.failed.lock().await.clone()
    }
}
