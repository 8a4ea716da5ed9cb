use std::sync::Arc;

use tracing::{info, warn};

use expensa_core::domain::approval::{
    Approval, ApprovalAction, ApprovalHistory, ApprovalId, ApprovalStatus,
};
use expensa_core::domain::policy::Policy;
use expensa_core::domain::report::{ExpenseReport, ReportId, ReportStatus};
use expensa_core::domain::UserId;
use expensa_core::notifications::{Notification, NotificationKind, NotificationSink};
use expensa_core::rules::{ApproverInfo, ExpenseValidationInput, RuleEngine};

use crate::error::{PersistenceContext, WorkflowError};
use crate::{dispatch, Repositories};

pub(crate) const AUTOMATIC_ESCALATION_REASON: &str = "automatic escalation";

/// Level-aware orchestration of a report's approval chain.
#[derive(Clone)]
pub struct WorkflowEngine {
    repositories: Repositories,
    rules: RuleEngine,
    notifications: Arc<dyn NotificationSink>,
}

impl WorkflowEngine {
    pub fn new(repositories: Repositories, notifications: Arc<dyn NotificationSink>) -> Self {
        Self { repositories, rules: RuleEngine::new(), notifications }
    }

    /// Opens one pending approval per approver whose range covers the report total.
    ///
    /// Rows are created one by one without a surrounding transaction: when a later
    /// write fails the error is returned and the approvals created so far remain.
    pub async fn create_approvals(
        &self,
        report: &ExpenseReport,
    ) -> Result<Vec<Approval>, WorkflowError> {
        let (_, approvers) = self.resolve_approvers(report).await?;

        let mut created = Vec::with_capacity(approvers.len());
        for approver in approvers {
            let approval = Approval::pending(report.id.clone(), approver.user_id, approver.level);
            self.repositories.approvals.create(&approval).await.during("approval.create")?;
            self.repositories
                .history
                .append(&ApprovalHistory::created(&approval, report.user_id.clone()))
                .await
                .during("approval_history.append")?;

            dispatch(
                self.notifications.as_ref(),
                Notification::new(
                    NotificationKind::ApprovalNeeded,
                    approval.approver_id.clone(),
                    report.id.clone(),
                )
                .for_approval(approval.id.clone())
                .with_metadata("level", approval.level.to_string()),
            );
            created.push(approval);
        }

        info!(
            event_name = "workflow.approvals.created",
            correlation_id = %report.id,
            report_id = %report.id,
            approvals = created.len(),
            "approval chain opened"
        );
        Ok(created)
    }

    /// Moves the report forward after `approval` was decided and returns its status.
    pub async fn process_approval(
        &self,
        approval: &Approval,
    ) -> Result<ReportStatus, WorkflowError> {
        if !matches!(approval.status, ApprovalStatus::Approved | ApprovalStatus::Rejected) {
            return Err(WorkflowError::ApprovalNotCompleted {
                id: approval.id.clone(),
                status: approval.status,
            });
        }

        let mut report = self.load_report(&approval.report_id).await?;

        if approval.status == ApprovalStatus::Rejected {
            if report.status != ReportStatus::Rejected {
                report.transition_to(ReportStatus::Rejected)?;
                self.repositories
                    .reports
                    .update_status(&report)
                    .await
                    .during("report.update_status")?;
            }
            return Ok(report.status);
        }

        let approvals = self
            .repositories
            .approvals
            .list_by_report(&report.id)
            .await
            .during("approval.list_by_report")?;
        let chain: Vec<&Approval> = approvals
            .iter()
            .filter(|candidate| candidate.status != ApprovalStatus::Escalated)
            .collect();

        let settled = chain.iter().filter(|candidate| candidate.level <= approval.level);
        let mut rejected = false;
        for candidate in settled {
            match candidate.status {
                ApprovalStatus::Pending => return Ok(report.status),
                ApprovalStatus::Rejected => rejected = true,
                ApprovalStatus::Approved | ApprovalStatus::Escalated => {}
            }
        }
        if rejected {
            return Ok(report.status);
        }

        let next_level_waiting = chain.iter().any(|candidate| {
            candidate.level > approval.level && candidate.status == ApprovalStatus::Pending
        });
        let target =
            if next_level_waiting { ReportStatus::UnderReview } else { ReportStatus::Approved };

        if report.status == target || !report.status.can_transition_to(target) {
            return Ok(report.status);
        }

        report.transition_to(target)?;
        self.repositories.reports.update_status(&report).await.during("report.update_status")?;
        info!(
            event_name = "workflow.report.advanced",
            correlation_id = %approval.id,
            report_id = %report.id,
            approval_id = %approval.id,
            status = report.status.as_str(),
            "report advanced after approval"
        );

        if target == ReportStatus::Approved {
            dispatch(
                self.notifications.as_ref(),
                Notification::new(
                    NotificationKind::ReportApproved,
                    report.user_id.clone(),
                    report.id.clone(),
                ),
            );
        }
        Ok(report.status)
    }

    /// Reassigns a pending approval to the approver one level up.
    ///
    /// Unlike manual [`crate::ApprovalService::escalate`], which keeps the level,
    /// the replacement created here sits at `level + 1`. When no approver exists
    /// at that level, or the report is no longer awaiting decisions, nothing is
    /// modified.
    pub async fn escalate_approval(
        &self,
        approval_id: &ApprovalId,
    ) -> Result<Approval, WorkflowError> {
        let mut approval = self
            .repositories
            .approvals
            .find_by_id(approval_id)
            .await
            .during("approval.find")?
            .ok_or_else(|| WorkflowError::ApprovalNotFound(approval_id.clone()))?;
        if approval.status != ApprovalStatus::Pending {
            return Err(WorkflowError::ApprovalNotPending {
                id: approval.id,
                status: approval.status,
            });
        }

        let report = self.load_report(&approval.report_id).await?;
        if !matches!(report.status, ReportStatus::Submitted | ReportStatus::UnderReview) {
            return Err(WorkflowError::ReportClosed { id: report.id, status: report.status });
        }
        let Some(next_level) = approval.level.checked_add(1) else {
            return Err(WorkflowError::NoNextApprover {
                approval_id: approval.id,
                level: approval.level,
            });
        };
        let (_, approvers) = self.resolve_approvers(&report).await?;
        let Some(next) = approvers.into_iter().find(|approver| approver.level == next_level) else {
            return Err(WorkflowError::NoNextApprover {
                approval_id: approval.id,
                level: approval.level,
            });
        };

        approval.escalate(next.user_id.clone())?;
        let applied = self
            .repositories
            .approvals
            .transition(&approval, ApprovalStatus::Pending)
            .await
            .during("approval.transition")?;
        if !applied {
            return Err(WorkflowError::ApprovalNotPending {
                id: approval.id,
                status: ApprovalStatus::Escalated,
            });
        }

        self.repositories
            .history
            .append(
                &ApprovalHistory::decided(&approval, UserId::system(), ApprovalAction::Escalated)
                    .with_comments(AUTOMATIC_ESCALATION_REASON)
                    .with_metadata("escalated_to", next.user_id.as_str())
                    .with_metadata("level", next_level.to_string()),
            )
            .await
            .during("approval_history.append")?;

        let replacement = Approval::pending(report.id.clone(), next.user_id, next_level);
        self.repositories.approvals.create(&replacement).await.during("approval.create")?;
        self.repositories
            .history
            .append(
                &ApprovalHistory::created(&replacement, UserId::system())
                    .with_comments(AUTOMATIC_ESCALATION_REASON)
                    .with_metadata("escalated_from", approval.id.as_str()),
            )
            .await
            .during("approval_history.append")?;

        info!(
            event_name = "workflow.approval.auto_escalated",
            correlation_id = %approval.id,
            approval_id = %approval.id,
            replacement_id = %replacement.id,
            report_id = %report.id,
            from_level = approval.level,
            to_level = next_level,
            "stale approval escalated to next level"
        );

        dispatch(
            self.notifications.as_ref(),
            Notification::new(
                NotificationKind::ApprovalEscalated,
                replacement.approver_id.clone(),
                report.id.clone(),
            )
            .for_approval(replacement.id.clone())
            .with_metadata("escalated_from", approval.id.as_str()),
        );

        Ok(replacement)
    }

    /// The first approver at `current_level + 1`, or `None` when the chain ends there.
    pub async fn get_next_approver(
        &self,
        report_id: &ReportId,
        current_level: u32,
    ) -> Result<Option<ApproverInfo>, WorkflowError> {
        let report = self.load_report(report_id).await?;
        let policy = self.load_policy(&report).await?;
        let Some(next_level) = current_level.checked_add(1) else {
            return Ok(None);
        };

        Ok(self
            .rules
            .get_approvers(&report_input(&report), &policy)
            .into_iter()
            .find(|approver| approver.level == next_level))
    }

    /// Loads the report policy and the approver chain for the report total.
    pub(crate) async fn resolve_approvers(
        &self,
        report: &ExpenseReport,
    ) -> Result<(Policy, Vec<ApproverInfo>), WorkflowError> {
        let policy = self.load_policy(report).await?;
        let approvers = self.rules.get_approvers(&report_input(report), &policy);
        if approvers.is_empty() {
            warn!(
                event_name = "workflow.approvals.none_found",
                correlation_id = %report.id,
                report_id = %report.id,
                policy_id = %policy.id,
                total_amount = %report.total_amount,
                "no approver covers report total"
            );
            return Err(WorkflowError::NoApproversFound {
                report_id: report.id.clone(),
                policy_id: policy.id,
            });
        }
        Ok((policy, approvers))
    }

    pub(crate) fn rules(&self) -> &RuleEngine {
        &self.rules
    }

    pub(crate) async fn load_policy(&self, report: &ExpenseReport) -> Result<Policy, WorkflowError> {
        let Some(policy_id) = report.policy_id.as_ref() else {
            return Err(WorkflowError::NoPolicyAssigned(report.id.clone()));
        };
        self.repositories
            .policies
            .find_by_id(policy_id)
            .await
            .during("policy.find")?
            .ok_or_else(|| WorkflowError::PolicyNotFound(policy_id.clone()))
    }

    async fn load_report(&self, report_id: &ReportId) -> Result<ExpenseReport, WorkflowError> {
        self.repositories
            .reports
            .find_by_id(report_id)
            .await
            .during("report.find")?
            .ok_or_else(|| WorkflowError::ReportNotFound(report_id.clone()))
    }
}

/// Report-level rule input: the whole total, no category.
pub(crate) fn report_input(report: &ExpenseReport) -> ExpenseValidationInput {
    ExpenseValidationInput {
        user_id: report.user_id.clone(),
        category_id: None,
        amount: report.total_amount,
        currency: report.currency.clone(),
    }
}
