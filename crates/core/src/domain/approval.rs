use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::report::ReportId;
use crate::domain::{string_id, UserId};
use crate::errors::DomainError;

string_id!(ApprovalId, ApprovalHistoryId);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Escalated,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Escalated => "escalated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "escalated" => Some(Self::Escalated),
            _ => None,
        }
    }

    /// Every row starts pending and leaves it exactly once.
    pub fn can_transition_to(self, next: ApprovalStatus) -> bool {
        self == Self::Pending && next != Self::Pending
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub id: ApprovalId,
    pub report_id: ReportId,
    pub approver_id: UserId,
    pub level: u32,
    pub status: ApprovalStatus,
    pub comments: Option<String>,
    pub approved_amount: Option<Decimal>,
    pub decision_date: Option<DateTime<Utc>>,
    pub escalation_date: Option<DateTime<Utc>>,
    pub escalated_to: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Approval {
    pub fn pending(report_id: ReportId, approver_id: UserId, level: u32) -> Self {
        let now = Utc::now();
        Self {
            id: ApprovalId::generate(),
            report_id,
            approver_id,
            level,
            status: ApprovalStatus::Pending,
            comments: None,
            approved_amount: None,
            decision_date: None,
            escalation_date: None,
            escalated_to: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn approve(
        &mut self,
        comments: Option<String>,
        approved_amount: Option<Decimal>,
    ) -> Result<(), DomainError> {
        self.transition_to(ApprovalStatus::Approved)?;
        self.decision_date = Some(self.updated_at);
        if comments.is_some() {
            self.comments = comments;
        }
        if approved_amount.is_some() {
            self.approved_amount = approved_amount;
        }
        Ok(())
    }

    pub fn reject(&mut self, reason: impl Into<String>) -> Result<(), DomainError> {
        self.transition_to(ApprovalStatus::Rejected)?;
        self.decision_date = Some(self.updated_at);
        self.comments = Some(reason.into());
        Ok(())
    }

    pub fn escalate(&mut self, escalated_to: UserId) -> Result<(), DomainError> {
        self.transition_to(ApprovalStatus::Escalated)?;
        self.escalation_date = Some(self.updated_at);
        self.escalated_to = Some(escalated_to);
        Ok(())
    }

    fn transition_to(&mut self, next: ApprovalStatus) -> Result<(), DomainError> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::InvalidApprovalTransition { from: self.status, to: next });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAction {
    Created,
    Approved,
    Rejected,
    Escalated,
    Reassigned,
    Commented,
}

impl ApprovalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Escalated => "escalated",
            Self::Reassigned => "reassigned",
            Self::Commented => "commented",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "created" => Some(Self::Created),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "escalated" => Some(Self::Escalated),
            "reassigned" => Some(Self::Reassigned),
            "commented" => Some(Self::Commented),
            _ => None,
        }
    }
}

/// Immutable audit row, one per approval state transition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalHistory {
    pub id: ApprovalHistoryId,
    pub approval_id: ApprovalId,
    pub report_id: ReportId,
    pub actor_id: UserId,
    pub action: ApprovalAction,
    pub previous_status: Option<ApprovalStatus>,
    pub new_status: Option<ApprovalStatus>,
    pub comments: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl ApprovalHistory {
    /// `created` row for a freshly inserted pending approval.
    pub fn created(approval: &Approval, actor_id: UserId) -> Self {
        Self::new(approval, actor_id, ApprovalAction::Created, None)
            .with_metadata("level", approval.level.to_string())
            .with_metadata("approver_id", approval.approver_id.to_string())
    }

    /// Row for a pending -> `approval.status` decision. Call after the approval was mutated.
    pub fn decided(approval: &Approval, actor_id: UserId, action: ApprovalAction) -> Self {
        let mut history =
            Self::new(approval, actor_id, action, Some(ApprovalStatus::Pending));
        history.comments = approval.comments.clone();
        history
    }

    fn new(
        approval: &Approval,
        actor_id: UserId,
        action: ApprovalAction,
        previous_status: Option<ApprovalStatus>,
    ) -> Self {
        Self {
            id: ApprovalHistoryId::generate(),
            approval_id: approval.id.clone(),
            report_id: approval.report_id.clone(),
            actor_id,
            action,
            previous_status,
            new_status: Some(approval.status),
            comments: None,
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_comments(mut self, comments: impl Into<String>) -> Self {
        self.comments = Some(comments.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
