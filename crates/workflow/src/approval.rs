use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::info;

use expensa_core::domain::approval::{
    Approval, ApprovalAction, ApprovalHistory, ApprovalId, ApprovalStatus,
};
use expensa_core::domain::report::{ExpenseReport, ReportId, ReportStatus};
use expensa_core::domain::UserId;
use expensa_core::notifications::{Notification, NotificationKind, NotificationSink};

use crate::error::{PersistenceContext, WorkflowError};
use crate::{dispatch, Repositories};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApproveDecision {
    pub comments: Option<String>,
    pub approved_amount: Option<Decimal>,
}

/// Decisions taken by an assigned approver on a single approval row.
#[derive(Clone)]
pub struct ApprovalService {
    repositories: Repositories,
    notifications: Arc<dyn NotificationSink>,
}

impl ApprovalService {
    pub fn new(repositories: Repositories, notifications: Arc<dyn NotificationSink>) -> Self {
        Self { repositories, notifications }
    }

    pub async fn approve(
        &self,
        approval_id: &ApprovalId,
        approver_id: &UserId,
        decision: ApproveDecision,
    ) -> Result<Approval, WorkflowError> {
        let mut approval = self.load_assigned_pending(approval_id, approver_id).await?;
        let report = self.load_report(&approval.report_id).await?;
        approval.approve(decision.comments, decision.approved_amount)?;
        self.commit_decision(&approval).await?;

        let mut entry =
            ApprovalHistory::decided(&approval, approver_id.clone(), ApprovalAction::Approved);
        if let Some(amount) = approval.approved_amount {
            entry = entry.with_metadata("approved_amount", amount.to_string());
        }
        self.repositories.history.append(&entry).await.during("approval_history.append")?;

        info!(
            event_name = "workflow.approval.approved",
            correlation_id = %approval.id,
            approval_id = %approval.id,
            report_id = %approval.report_id,
            level = approval.level,
            "approval approved"
        );

        dispatch(
            self.notifications.as_ref(),
            Notification::new(NotificationKind::ApprovalApproved, report.user_id, report.id)
                .for_approval(approval.id.clone()),
        );

        self.refresh_report_status(&approval.report_id).await?;
        Ok(approval)
    }

    /// Rejects the approval and, at any level, immediately rejects the report.
    pub async fn reject(
        &self,
        approval_id: &ApprovalId,
        approver_id: &UserId,
        reason: &str,
    ) -> Result<Approval, WorkflowError> {
        let mut approval = self.load_assigned_pending(approval_id, approver_id).await?;
        let mut report = self.load_report(&approval.report_id).await?;
        approval.reject(reason)?;
        self.commit_decision(&approval).await?;

        self.repositories
            .history
            .append(&ApprovalHistory::decided(
                &approval,
                approver_id.clone(),
                ApprovalAction::Rejected,
            ))
            .await
            .during("approval_history.append")?;

        if report.status != ReportStatus::Rejected {
            report.transition_to(ReportStatus::Rejected)?;
            report.rejection_reason = Some(reason.to_owned());
            self.repositories.reports.update_status(&report).await.during("report.update_status")?;
        }

        info!(
            event_name = "workflow.approval.rejected",
            correlation_id = %approval.id,
            approval_id = %approval.id,
            report_id = %approval.report_id,
            level = approval.level,
            "approval rejected; report rejected"
        );

        dispatch(
            self.notifications.as_ref(),
            Notification::new(
                NotificationKind::ApprovalRejected,
                report.user_id.clone(),
                report.id.clone(),
            )
            .for_approval(approval.id.clone())
            .with_metadata("reason", reason),
        );
        dispatch(
            self.notifications.as_ref(),
            Notification::new(NotificationKind::ReportRejected, report.user_id, report.id),
        );

        Ok(approval)
    }

    /// Hands a pending approval to another approver.
    ///
    /// Manual escalation keeps the level: the replacement row sits at the same
    /// level as the escalated one. Automatic escalation in
    /// [`crate::WorkflowEngine::escalate_approval`] moves to the next level instead.
    pub async fn escalate(
        &self,
        approval_id: &ApprovalId,
        current_approver_id: &UserId,
        new_approver_id: &UserId,
        reason: &str,
    ) -> Result<Approval, WorkflowError> {
        let mut approval = self.load_assigned_pending(approval_id, current_approver_id).await?;
        approval.escalate(new_approver_id.clone())?;
        self.commit_decision(&approval).await?;

        self.repositories
            .history
            .append(
                &ApprovalHistory::decided(
                    &approval,
                    current_approver_id.clone(),
                    ApprovalAction::Escalated,
                )
                .with_comments(reason)
                .with_metadata("escalated_to", new_approver_id.as_str()),
            )
            .await
            .during("approval_history.append")?;

        let replacement =
            Approval::pending(approval.report_id.clone(), new_approver_id.clone(), approval.level);
        self.repositories.approvals.create(&replacement).await.during("approval.create")?;
        self.repositories
            .history
            .append(
                &ApprovalHistory::created(&replacement, current_approver_id.clone())
                    .with_comments(reason)
                    .with_metadata("escalated_from", approval.id.as_str()),
            )
            .await
            .during("approval_history.append")?;

        info!(
            event_name = "workflow.approval.escalated",
            correlation_id = %approval.id,
            approval_id = %approval.id,
            replacement_id = %replacement.id,
            report_id = %approval.report_id,
            level = approval.level,
            "approval reassigned within its level"
        );

        dispatch(
            self.notifications.as_ref(),
            Notification::new(
                NotificationKind::ApprovalEscalated,
                new_approver_id.clone(),
                replacement.report_id.clone(),
            )
            .for_approval(replacement.id.clone())
            .with_metadata("escalated_from", approval.id.as_str()),
        );

        Ok(replacement)
    }

    pub async fn get_pending_approvals(
        &self,
        approver_id: &UserId,
    ) -> Result<Vec<Approval>, WorkflowError> {
        self.repositories
            .approvals
            .list_pending_by_approver(approver_id)
            .await
            .during("approval.list_pending_by_approver")
    }

    pub async fn get_pending_by_report(
        &self,
        report_id: &ReportId,
    ) -> Result<Vec<Approval>, WorkflowError> {
        self.repositories
            .approvals
            .list_pending_by_report(report_id)
            .await
            .during("approval.list_pending_by_report")
    }

    pub async fn get_approvals_by_report(
        &self,
        report_id: &ReportId,
    ) -> Result<Vec<Approval>, WorkflowError> {
        self.repositories.approvals.list_by_report(report_id).await.during("approval.list_by_report")
    }

    /// History of every approval on the report, grouped per approval in chain
    /// order. Entries are not globally sorted by time.
    pub async fn get_history(
        &self,
        report_id: &ReportId,
    ) -> Result<Vec<ApprovalHistory>, WorkflowError> {
        let approvals = self.get_approvals_by_report(report_id).await?;
        let mut history = Vec::new();
        for approval in &approvals {
            history.extend(self.get_approval_history(&approval.id).await?);
        }
        Ok(history)
    }

    pub async fn get_approval_history(
        &self,
        approval_id: &ApprovalId,
    ) -> Result<Vec<ApprovalHistory>, WorkflowError> {
        self.repositories
            .history
            .list_by_approval(approval_id)
            .await
            .during("approval_history.list_by_approval")
    }

    async fn load_assigned_pending(
        &self,
        approval_id: &ApprovalId,
        user_id: &UserId,
    ) -> Result<Approval, WorkflowError> {
        let approval = self
            .repositories
            .approvals
            .find_by_id(approval_id)
            .await
            .during("approval.find")?
            .ok_or_else(|| WorkflowError::ApprovalNotFound(approval_id.clone()))?;

        if &approval.approver_id != user_id {
            return Err(WorkflowError::NotAuthorizedApprover {
                approval_id: approval.id,
                user_id: user_id.clone(),
            });
        }
        if approval.status != ApprovalStatus::Pending {
            return Err(WorkflowError::ApprovalNotPending { id: approval.id, status: approval.status });
        }
        Ok(approval)
    }

    /// Persists a decision only if nobody else decided the row first.
    async fn commit_decision(&self, approval: &Approval) -> Result<(), WorkflowError> {
        let applied = self
            .repositories
            .approvals
            .transition(approval, ApprovalStatus::Pending)
            .await
            .during("approval.transition")?;
        if applied {
            return Ok(());
        }

        let current = self
            .repositories
            .approvals
            .find_by_id(&approval.id)
            .await
            .during("approval.find")?
            .map_or(ApprovalStatus::Pending, |stored| stored.status);
        Err(WorkflowError::ApprovalNotPending { id: approval.id.clone(), status: current })
    }

    /// Decisions load their report before committing.
    async fn load_report(&self, report_id: &ReportId) -> Result<ExpenseReport, WorkflowError> {
        self.repositories
            .reports
            .find_by_id(report_id)
            .await
            .during("report.find")?
            .ok_or_else(|| WorkflowError::ReportNotFound(report_id.clone()))
    }

    /// Marks the report approved once no approval is pending and none was rejected.
    async fn refresh_report_status(&self, report_id: &ReportId) -> Result<(), WorkflowError> {
        let approvals = self.get_approvals_by_report(report_id).await?;
        if approvals.iter().any(|approval| {
            matches!(approval.status, ApprovalStatus::Pending | ApprovalStatus::Rejected)
        }) {
            return Ok(());
        }

        let mut report = self.load_report(report_id).await?;
        if report.status == ReportStatus::Approved {
            return Ok(());
        }

        report.transition_to(ReportStatus::Approved)?;
        self.repositories.reports.update_status(&report).await.during("report.update_status")?;

        info!(
            event_name = "workflow.report.approved",
            correlation_id = %report.id,
            report_id = %report.id,
            "every approval resolved; report approved"
        );
        dispatch(
            self.notifications.as_ref(),
            Notification::new(NotificationKind::ReportApproved, report.user_id, report.id),
        );
        Ok(())
    }
}
