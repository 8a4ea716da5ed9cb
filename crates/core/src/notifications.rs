use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::domain::approval::ApprovalId;
use crate::domain::report::ReportId;
use crate::domain::UserId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ApprovalNeeded,
    ApprovalApproved,
    ApprovalRejected,
    ApprovalEscalated,
    ReportSubmitted,
    ReportApproved,
    ReportRejected,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApprovalNeeded => "approval_needed",
            Self::ApprovalApproved => "approval_approved",
            Self::ApprovalRejected => "approval_rejected",
            Self::ApprovalEscalated => "approval_escalated",
            Self::ReportSubmitted => "report_submitted",
            Self::ReportApproved => "report_approved",
            Self::ReportRejected => "report_rejected",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub notification_id: String,
    pub kind: NotificationKind,
    pub recipient: UserId,
    pub report_id: ReportId,
    pub approval_id: Option<ApprovalId>,
    pub metadata: BTreeMap<String, String>,
    pub occurred_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(kind: NotificationKind, recipient: UserId, report_id: ReportId) -> Self {
        Self {
            notification_id: Uuid::new_v4().to_string(),
            kind,
            recipient,
            report_id,
            approval_id: None,
            metadata: BTreeMap::new(),
            occurred_at: Utc::now(),
        }
    }

    pub fn for_approval(mut self, approval_id: ApprovalId) -> Self {
        self.approval_id = Some(approval_id);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Outbound notification port. Delivery is fire-and-forget: a sink reports
/// failure through its return value and callers only log it.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification) -> Result<(), String>;
}

/// Writes every notification as a structured log event.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotificationSink;

impl NotificationSink for TracingNotificationSink {
    fn notify(&self, notification: Notification) -> Result<(), String> {
        info!(
            event_name = "notification.dispatched",
            notification_id = %notification.notification_id,
            kind = notification.kind.as_str(),
            recipient = %notification.recipient,
            report_id = %notification.report_id,
            approval_id = notification.approval_id.as_ref().map(ApprovalId::as_str),
            "notification dispatched"
        );
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopNotificationSink;

impl NotificationSink for NoopNotificationSink {
    fn notify(&self, _notification: Notification) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryNotificationSink {
    notifications: Arc<Mutex<Vec<Notification>>>,
    failing: bool,
}

impl InMemoryNotificationSink {
    /// A sink that records nothing and rejects every delivery.
    pub fn failing() -> Self {
        Self { failing: true, ..Self::default() }
    }

    pub fn notifications(&self) -> Vec<Notification> {
        match self.notifications.lock() {
            Ok(notifications) => notifications.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn kinds(&self) -> Vec<NotificationKind> {
        self.notifications().into_iter().map(|notification| notification.kind).collect()
    }
}

impl NotificationSink for InMemoryNotificationSink {
    fn notify(&self, notification: Notification) -> Result<(), String> {
        if self.failing {
            return Err("notification transport unavailable".to_owned());
        }

        match self.notifications.lock() {
            Ok(mut notifications) => notifications.push(notification),
            Err(poisoned) => poisoned.into_inner().push(notification),
        }
        Ok(())
    }
}
