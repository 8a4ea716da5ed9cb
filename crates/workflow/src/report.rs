use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::info;

use expensa_core::domain::approval::{Approval, ApprovalId};
use expensa_core::domain::expense::ExpenseId;
use expensa_core::domain::policy::PolicyId;
use expensa_core::domain::report::{ExpenseReport, ReportId, ReportStatus};
use expensa_core::domain::UserId;
use expensa_core::errors::DomainError;
use expensa_core::notifications::{Notification, NotificationKind, NotificationSink};
use expensa_core::rules::{ExpenseValidationInput, Violation};
use expensa_db::repositories::ReportFilter;

use crate::approval::{ApprovalService, ApproveDecision};
use crate::engine::WorkflowEngine;
use crate::error::{PersistenceContext, WorkflowError};
use crate::{dispatch, Repositories};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewReport {
    pub title: String,
    pub description: Option<String>,
    pub policy_id: Option<PolicyId>,
    pub currency: String,
}

/// Editable draft fields; `None` leaves a field untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReportChanges {
    pub title: Option<String>,
    pub description: Option<String>,
}

/// One page of a user's reports; `total` counts every match, not just the page.
#[derive(Clone, Debug, PartialEq)]
pub struct ReportPage {
    pub reports: Vec<ExpenseReport>,
    pub total: u64,
}

/// Owner-facing report lifecycle from draft to submission, plus the
/// approver-facing decisions that route through the workflow engine.
#[derive(Clone)]
pub struct ReportService {
    repositories: Repositories,
    approvals: ApprovalService,
    engine: WorkflowEngine,
    notifications: Arc<dyn NotificationSink>,
}

impl ReportService {
    pub fn new(repositories: Repositories, notifications: Arc<dyn NotificationSink>) -> Self {
        Self {
            approvals: ApprovalService::new(repositories.clone(), notifications.clone()),
            engine: WorkflowEngine::new(repositories.clone(), notifications.clone()),
            repositories,
            notifications,
        }
    }

    pub async fn create_report(
        &self,
        user_id: &UserId,
        new_report: NewReport,
    ) -> Result<ExpenseReport, WorkflowError> {
        let title = required_title(&new_report.title)?;
        let report = ExpenseReport::new_draft(
            user_id.clone(),
            new_report.policy_id,
            title,
            new_report.description,
            new_report.currency,
        );
        self.repositories.reports.create(&report).await.during("report.create")?;

        info!(
            event_name = "workflow.report.created",
            correlation_id = %report.id,
            report_id = %report.id,
            user_id = %user_id,
            "draft report created"
        );
        Ok(report)
    }

    pub async fn get_report(&self, report_id: &ReportId) -> Result<ExpenseReport, WorkflowError> {
        self.repositories
            .reports
            .find_by_id(report_id)
            .await
            .during("report.find")?
            .ok_or_else(|| WorkflowError::ReportNotFound(report_id.clone()))
    }

    /// The user's reports, newest first. A zero limit falls back to the default page size.
    pub async fn list_reports(
        &self,
        user_id: &UserId,
        mut filter: ReportFilter,
    ) -> Result<ReportPage, WorkflowError> {
        if filter.limit == 0 {
            filter.limit = ReportFilter::default().limit;
        }
        let (reports, total) = self
            .repositories
            .reports
            .list_by_user(user_id, &filter)
            .await
            .during("report.list_by_user")?;
        Ok(ReportPage { reports, total })
    }

    pub async fn update_report(
        &self,
        report_id: &ReportId,
        user_id: &UserId,
        changes: ReportChanges,
    ) -> Result<ExpenseReport, WorkflowError> {
        let mut report = self.load_owned_draft(report_id, user_id).await?;
        if let Some(title) = changes.title.as_deref() {
            report.title = required_title(title)?;
        }
        if changes.description.is_some() {
            report.description = changes.description;
        }
        report.updated_at = Utc::now();
        self.repositories.reports.update(&report).await.during("report.update")?;
        Ok(report)
    }

    pub async fn delete_report(
        &self,
        report_id: &ReportId,
        user_id: &UserId,
    ) -> Result<(), WorkflowError> {
        self.load_owned_draft(report_id, user_id).await?;
        self.repositories.reports.soft_delete(report_id, Utc::now()).await.during("report.delete")?;

        info!(
            event_name = "workflow.report.deleted",
            correlation_id = %report_id,
            report_id = %report_id,
            "draft report deleted"
        );
        Ok(())
    }

    /// Attaches expenses to a draft and returns the recomputed total.
    ///
    /// An expense can belong to one active report at a time; the first
    /// conflicting expense stops the batch.
    pub async fn add_expenses(
        &self,
        report_id: &ReportId,
        user_id: &UserId,
        expense_ids: &[ExpenseId],
    ) -> Result<Decimal, WorkflowError> {
        self.load_owned_draft(report_id, user_id).await?;

        for expense_id in expense_ids {
            self.repositories
                .expenses
                .find_by_id(expense_id)
                .await
                .during("expense.find")?
                .ok_or_else(|| WorkflowError::ExpenseNotFound(expense_id.clone()))?;

            if let Some(attached_to) = self
                .repositories
                .reports
                .find_report_for_expense(expense_id)
                .await
                .during("report.find_for_expense")?
            {
                return Err(WorkflowError::ExpenseAlreadyInReport {
                    expense_id: expense_id.clone(),
                    report_id: attached_to,
                });
            }

            self.repositories
                .reports
                .add_item(report_id, expense_id)
                .await
                .during("report.add_item")?;
        }

        self.repositories.reports.recalculate_total(report_id).await.during("report.recalculate_total")
    }

    pub async fn remove_expense(
        &self,
        report_id: &ReportId,
        user_id: &UserId,
        expense_id: &ExpenseId,
    ) -> Result<Decimal, WorkflowError> {
        self.load_owned_draft(report_id, user_id).await?;

        let items =
            self.repositories.reports.list_items(report_id).await.during("report.list_items")?;
        if !items.iter().any(|item| &item.expense_id == expense_id) {
            return Err(WorkflowError::ExpenseNotInReport {
                expense_id: expense_id.clone(),
                report_id: report_id.clone(),
            });
        }

        self.repositories
            .reports
            .remove_item(report_id, expense_id)
            .await
            .during("report.remove_item")?;
        self.repositories.reports.recalculate_total(report_id).await.during("report.recalculate_total")
    }

    /// Runs the policy's `limit` and `reject` rules over every attached expense.
    pub async fn validate_report(
        &self,
        report_id: &ReportId,
    ) -> Result<Vec<Violation>, WorkflowError> {
        let report = self.get_report(report_id).await?;
        self.validate_expenses(&report).await
    }

    /// Submits a draft and opens its approval chain.
    ///
    /// Approvers are resolved before the status changes, so a report whose
    /// policy covers nobody stays in draft.
    pub async fn submit_report(
        &self,
        report_id: &ReportId,
        user_id: &UserId,
    ) -> Result<(ExpenseReport, Vec<Approval>), WorkflowError> {
        let mut report = self.load_owned(report_id, user_id).await?;
        if report.status != ReportStatus::Draft {
            return Err(WorkflowError::ReportNotSubmittable {
                id: report.id,
                status: report.status,
            });
        }
        if self.item_count(report_id).await? == 0 {
            return Err(WorkflowError::ReportEmpty(report.id));
        }

        let violations: Vec<Violation> = self
            .validate_expenses(&report)
            .await?
            .into_iter()
            .filter(Violation::is_blocking)
            .collect();
        if !violations.is_empty() {
            return Err(WorkflowError::PolicyViolations { report_id: report.id, violations });
        }
        self.engine.resolve_approvers(&report).await?;

        report.transition_to(ReportStatus::Submitted)?;
        self.repositories.reports.update_status(&report).await.during("report.update_status")?;

        info!(
            event_name = "workflow.report.submitted",
            correlation_id = %report.id,
            report_id = %report.id,
            total_amount = %report.total_amount,
            "report submitted"
        );
        dispatch(
            self.notifications.as_ref(),
            Notification::new(
                NotificationKind::ReportSubmitted,
                report.user_id.clone(),
                report.id.clone(),
            ),
        );

        let approvals = self.engine.create_approvals(&report).await?;
        Ok((report, approvals))
    }

    pub async fn approve_report(
        &self,
        approval_id: &ApprovalId,
        approver_id: &UserId,
        decision: ApproveDecision,
    ) -> Result<ReportStatus, WorkflowError> {
        let approval = self.approvals.approve(approval_id, approver_id, decision).await?;
        self.engine.process_approval(&approval).await
    }

    pub async fn reject_report(
        &self,
        approval_id: &ApprovalId,
        approver_id: &UserId,
        reason: &str,
    ) -> Result<ReportStatus, WorkflowError> {
        let approval = self.approvals.reject(approval_id, approver_id, reason).await?;
        self.engine.process_approval(&approval).await
    }

    pub async fn can_edit_report(
        &self,
        report_id: &ReportId,
        user_id: &UserId,
    ) -> Result<bool, WorkflowError> {
        let report = self.get_report(report_id).await?;
        Ok(&report.user_id == user_id && report.is_editable())
    }

    pub async fn can_delete_report(
        &self,
        report_id: &ReportId,
        user_id: &UserId,
    ) -> Result<bool, WorkflowError> {
        self.can_edit_report(report_id, user_id).await
    }

    /// Owner, draft, at least one expense and a policy to route it through.
    pub async fn can_submit_report(
        &self,
        report_id: &ReportId,
        user_id: &UserId,
    ) -> Result<bool, WorkflowError> {
        let report = self.get_report(report_id).await?;
        if &report.user_id != user_id || !report.is_editable() || report.policy_id.is_none() {
            return Ok(false);
        }
        Ok(self.item_count(report_id).await? > 0)
    }

    async fn validate_expenses(
        &self,
        report: &ExpenseReport,
    ) -> Result<Vec<Violation>, WorkflowError> {
        let policy = self.engine.load_policy(report).await?;
        let items =
            self.repositories.reports.list_items(&report.id).await.during("report.list_items")?;

        let mut violations = Vec::new();
        for item in &items {
            let Some(expense) = self
                .repositories
                .expenses
                .find_by_id(&item.expense_id)
                .await
                .during("expense.find")?
            else {
                continue;
            };
            let input = ExpenseValidationInput {
                user_id: expense.user_id,
                category_id: Some(expense.category_id),
                amount: expense.amount,
                currency: expense.currency,
            };
            violations.extend(self.engine.rules().validate_expense(&input, &policy));
        }
        Ok(violations)
    }

    async fn item_count(&self, report_id: &ReportId) -> Result<usize, WorkflowError> {
        Ok(self.repositories.reports.list_items(report_id).await.during("report.list_items")?.len())
    }

    async fn load_owned(
        &self,
        report_id: &ReportId,
        user_id: &UserId,
    ) -> Result<ExpenseReport, WorkflowError> {
        let report = self.get_report(report_id).await?;
        if &report.user_id != user_id {
            return Err(WorkflowError::NotReportOwner {
                report_id: report.id,
                user_id: user_id.clone(),
            });
        }
        Ok(report)
    }

    async fn load_owned_draft(
        &self,
        report_id: &ReportId,
        user_id: &UserId,
    ) -> Result<ExpenseReport, WorkflowError> {
        let report = self.load_owned(report_id, user_id).await?;
        if !report.is_editable() {
            return Err(WorkflowError::ReportNotEditable { id: report.id, status: report.status });
        }
        Ok(report)
    }
}

fn required_title(title: &str) -> Result<String, WorkflowError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(DomainError::InvariantViolation("report title must not be blank".to_owned())
            .into());
    }
    Ok(title.to_owned())
}
