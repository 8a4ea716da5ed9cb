use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::RwLock;

use expensa_core::domain::approval::{Approval, ApprovalHistory, ApprovalId, ApprovalStatus};
use expensa_core::domain::comment::{CommentId, ExpenseComment};
use expensa_core::domain::expense::{Expense, ExpenseId};
use expensa_core::domain::policy::{Policy, PolicyId};
use expensa_core::domain::report::{ExpenseReport, ExpenseReportItem, ReportId, ReportItemId};
use expensa_core::domain::{RecordState, UserId};

use super::{
    stale_cutoff, ApprovalHistoryRepository, ApprovalRepository, CommentRepository,
    ExpenseRepository, PolicyRepository, ReportFilter, ReportRepository, RepositoryError,
};

#[derive(Default)]
pub struct InMemoryPolicyRepository {
    policies: RwLock<HashMap<String, Policy>>,
}

#[async_trait::async_trait]
impl PolicyRepository for InMemoryPolicyRepository {
    async fn find_by_id(&self, id: &PolicyId) -> Result<Option<Policy>, RepositoryError> {
        let policies = self.policies.read().await;
        Ok(policies.get(&id.0).filter(|policy| policy.state.is_active()).cloned())
    }

    async fn save(&self, policy: Policy) -> Result<(), RepositoryError> {
        policy.validate().map_err(|error| RepositoryError::Constraint(error.to_string()))?;
        let mut policies = self.policies.write().await;
        policies.insert(policy.id.0.clone(), policy);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryExpenseRepository {
    expenses: RwLock<HashMap<String, Expense>>,
}

#[async_trait::async_trait]
impl ExpenseRepository for InMemoryExpenseRepository {
    async fn find_by_id(&self, id: &ExpenseId) -> Result<Option<Expense>, RepositoryError> {
        let expenses = self.expenses.read().await;
        Ok(expenses.get(&id.0).cloned())
    }

    async fn save(&self, expense: Expense) -> Result<(), RepositoryError> {
        let mut expenses = self.expenses.write().await;
        expenses.insert(expense.id.0.clone(), expense);
        Ok(())
    }
}

/// Report store that reads amounts from a shared expense store when recomputing totals.
#[derive(Default)]
pub struct InMemoryReportRepository {
    expenses: Arc<InMemoryExpenseRepository>,
    reports: RwLock<HashMap<String, ExpenseReport>>,
    items: RwLock<Vec<ExpenseReportItem>>,
}

impl InMemoryReportRepository {
    pub fn new(expenses: Arc<InMemoryExpenseRepository>) -> Self {
        Self { expenses, reports: RwLock::default(), items: RwLock::default() }
    }

    async fn with_active_report<T>(
        &self,
        id: &ReportId,
        apply: impl FnOnce(&mut ExpenseReport) -> T + Send,
    ) -> Result<T, RepositoryError> {
        let mut reports = self.reports.write().await;
        match reports.get_mut(&id.0).filter(|report| report.state.is_active()) {
            Some(report) => Ok(apply(report)),
            None => Err(RepositoryError::not_found("report", id)),
        }
    }
}

#[async_trait::async_trait]
impl ReportRepository for InMemoryReportRepository {
    async fn create(&self, report: &ExpenseReport) -> Result<(), RepositoryError> {
        let mut reports = self.reports.write().await;
        if reports.contains_key(&report.id.0) {
            return Err(RepositoryError::Constraint(format!("report `{}` already exists", report.id)));
        }
        reports.insert(report.id.0.clone(), report.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &ReportId) -> Result<Option<ExpenseReport>, RepositoryError> {
        let reports = self.reports.read().await;
        Ok(reports.get(&id.0).filter(|report| report.state.is_active()).cloned())
    }

    async fn update(&self, report: &ExpenseReport) -> Result<(), RepositoryError> {
        let updated = report.clone();
        self.with_active_report(&report.id, move |stored| {
            stored.title = updated.title;
            stored.description = updated.description;
            stored.policy_id = updated.policy_id;
            stored.currency = updated.currency;
            stored.updated_at = updated.updated_at;
        })
        .await
    }

    async fn soft_delete(&self, id: &ReportId, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        self.with_active_report(id, move |stored| {
            stored.state = RecordState::Deleted { at };
            stored.updated_at = at;
        })
        .await
    }

    async fn update_status(&self, report: &ExpenseReport) -> Result<(), RepositoryError> {
        let updated = report.clone();
        self.with_active_report(&report.id, move |stored| {
            stored.status = updated.status;
            stored.submission_date = updated.submission_date;
            stored.approval_date = updated.approval_date;
            stored.payment_date = updated.payment_date;
            stored.rejection_reason = updated.rejection_reason;
            stored.updated_at = updated.updated_at;
        })
        .await
    }

    async fn recalculate_total(&self, id: &ReportId) -> Result<Decimal, RepositoryError> {
        let expense_ids: Vec<ExpenseId> = {
            let items = self.items.read().await;
            items
                .iter()
                .filter(|item| &item.report_id == id)
                .map(|item| item.expense_id.clone())
                .collect()
        };

        let mut total = Decimal::ZERO;
        for expense_id in &expense_ids {
            if let Some(expense) = self.expenses.find_by_id(expense_id).await? {
                total += expense.amount;
            }
        }

        self.with_active_report(id, move |stored| {
            stored.total_amount = total;
            stored.updated_at = Utc::now();
        })
        .await?;
        Ok(total)
    }

    async fn add_item(
        &self,
        report_id: &ReportId,
        expense_id: &ExpenseId,
    ) -> Result<ExpenseReportItem, RepositoryError> {
        let mut items = self.items.write().await;
        if items.iter().any(|item| &item.report_id == report_id && &item.expense_id == expense_id) {
            return Err(RepositoryError::Constraint(format!(
                "expense `{expense_id}` is already on report `{report_id}`"
            )));
        }

        let next = items
            .iter()
            .filter(|item| &item.report_id == report_id)
            .map(|item| item.sequence_number)
            .max()
            .unwrap_or(0)
            + 1;
        let item = ExpenseReportItem {
            id: ReportItemId::generate(),
            report_id: report_id.clone(),
            expense_id: expense_id.clone(),
            sequence_number: next,
            created_at: Utc::now(),
        };
        items.push(item.clone());
        Ok(item)
    }

    async fn remove_item(
        &self,
        report_id: &ReportId,
        expense_id: &ExpenseId,
    ) -> Result<(), RepositoryError> {
        let mut items = self.items.write().await;
        let before = items.len();
        items.retain(|item| !(&item.report_id == report_id && &item.expense_id == expense_id));
        if items.len() == before {
            return Err(RepositoryError::not_found("report item", expense_id));
        }
        Ok(())
    }

    async fn list_items(
        &self,
        report_id: &ReportId,
    ) -> Result<Vec<ExpenseReportItem>, RepositoryError> {
        let items = self.items.read().await;
        let mut found: Vec<ExpenseReportItem> =
            items.iter().filter(|item| &item.report_id == report_id).cloned().collect();
        found.sort_by_key(|item| item.sequence_number);
        Ok(found)
    }

    async fn find_report_for_expense(
        &self,
        expense_id: &ExpenseId,
    ) -> Result<Option<ReportId>, RepositoryError> {
        let items = self.items.read().await;
        let reports = self.reports.read().await;
        Ok(items
            .iter()
            .filter(|item| &item.expense_id == expense_id)
            .find(|item| {
                reports.get(&item.report_id.0).is_some_and(|report| report.state.is_active())
            })
            .map(|item| item.report_id.clone()))
    }

    async fn list_by_user(
        &self,
        user_id: &UserId,
        filter: &ReportFilter,
    ) -> Result<(Vec<ExpenseReport>, u64), RepositoryError> {
        let reports = self.reports.read().await;
        let mut matching: Vec<ExpenseReport> = reports
            .values()
            .filter(|report| &report.user_id == user_id && report.state.is_active())
            .filter(|report| filter.status.map_or(true, |status| report.status == status))
            .cloned()
            .collect();
        matching.sort_by(|left, right| right.created_at.cmp(&left.created_at));

        let total = matching.len() as u64;
        let page = matching
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.limit as usize)
            .collect();
        Ok((page, total))
    }
}

#[derive(Default)]
pub struct InMemoryApprovalRepository {
    approvals: RwLock<HashMap<String, Approval>>,
}

impl InMemoryApprovalRepository {
    async fn select(&self, keep: impl Fn(&Approval) -> bool + Send) -> Vec<Approval> {
        let approvals = self.approvals.read().await;
        let mut selected: Vec<Approval> =
            approvals.values().filter(|approval| keep(approval)).cloned().collect();
        selected.sort_by(|left, right| {
            (left.level, left.created_at, &left.id.0).cmp(&(right.level, right.created_at, &right.id.0))
        });
        selected
    }
}

#[async_trait::async_trait]
impl ApprovalRepository for InMemoryApprovalRepository {
    async fn create(&self, approval: &Approval) -> Result<(), RepositoryError> {
        let mut approvals = self.approvals.write().await;
        if approvals.contains_key(&approval.id.0) {
            return Err(RepositoryError::Constraint(format!(
                "approval `{}` already exists",
                approval.id
            )));
        }
        approvals.insert(approval.id.0.clone(), approval.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &ApprovalId) -> Result<Option<Approval>, RepositoryError> {
        let approvals = self.approvals.read().await;
        Ok(approvals.get(&id.0).cloned())
    }

    async fn update(&self, approval: &Approval) -> Result<(), RepositoryError> {
        let mut approvals = self.approvals.write().await;
        match approvals.get_mut(&approval.id.0) {
            Some(stored) => {
                *stored = approval.clone();
                Ok(())
            }
            None => Err(RepositoryError::not_found("approval", &approval.id)),
        }
    }

    async fn transition(
        &self,
        approval: &Approval,
        expected: ApprovalStatus,
    ) -> Result<bool, RepositoryError> {
        let mut approvals = self.approvals.write().await;
        match approvals.get_mut(&approval.id.0) {
            Some(stored) if stored.status == expected => {
                *stored = approval.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_by_report(&self, report_id: &ReportId) -> Result<Vec<Approval>, RepositoryError> {
        Ok(self.select(|approval| &approval.report_id == report_id).await)
    }

    async fn list_pending_by_approver(
        &self,
        approver_id: &UserId,
    ) -> Result<Vec<Approval>, RepositoryError> {
        let mut pending = self
            .select(|approval| {
                approval.status == ApprovalStatus::Pending && &approval.approver_id == approver_id
            })
            .await;
        pending.sort_by_key(|approval| approval.created_at);
        Ok(pending)
    }

    async fn list_pending_by_report(
        &self,
        report_id: &ReportId,
    ) -> Result<Vec<Approval>, RepositoryError> {
        Ok(self
            .select(|approval| {
                approval.status == ApprovalStatus::Pending && &approval.report_id == report_id
            })
            .await)
    }

    async fn list_stale(&self, older_than_hours: u32) -> Result<Vec<Approval>, RepositoryError> {
        let cutoff = stale_cutoff(older_than_hours);
        let mut stale = self
            .select(|approval| {
                approval.status == ApprovalStatus::Pending && approval.created_at < cutoff
            })
            .await;
        stale.sort_by_key(|approval| approval.created_at);
        Ok(stale)
    }
}

#[derive(Default)]
pub struct InMemoryApprovalHistoryRepository {
    entries: RwLock<Vec<ApprovalHistory>>,
}

#[async_trait::async_trait]
impl ApprovalHistoryRepository for InMemoryApprovalHistoryRepository {
    async fn append(&self, entry: &ApprovalHistory) -> Result<(), RepositoryError> {
        self.entries.write().await.push(entry.clone());
        Ok(())
    }

    async fn list_by_approval(
        &self,
        approval_id: &ApprovalId,
    ) -> Result<Vec<ApprovalHistory>, RepositoryError> {
        let entries = self.entries.read().await;
        Ok(entries.iter().filter(|entry| &entry.approval_id == approval_id).cloned().collect())
    }
}

#[derive(Default)]
pub struct InMemoryCommentRepository {
    comments: RwLock<Vec<ExpenseComment>>,
}

#[async_trait::async_trait]
impl CommentRepository for InMemoryCommentRepository {
    async fn create(&self, comment: &ExpenseComment) -> Result<(), RepositoryError> {
        self.comments.write().await.push(comment.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &CommentId) -> Result<Option<ExpenseComment>, RepositoryError> {
        let comments = self.comments.read().await;
        Ok(comments
            .iter()
            .find(|comment| &comment.id == id && comment.state.is_active())
            .cloned())
    }

    async fn list_by_report(
        &self,
        report_id: &ReportId,
        include_internal: bool,
    ) -> Result<Vec<ExpenseComment>, RepositoryError> {
        let comments = self.comments.read().await;
        Ok(comments
            .iter()
            .filter(|comment| comment.report_id.as_ref() == Some(report_id))
            .filter(|comment| comment.state.is_active())
            .filter(|comment| include_internal || !comment.is_internal)
            .cloned()
            .collect())
    }

    async fn list_by_expense(
        &self,
        expense_id: &ExpenseId,
    ) -> Result<Vec<ExpenseComment>, RepositoryError> {
        let comments = self.comments.read().await;
        Ok(comments
            .iter()
            .filter(|comment| comment.expense_id.as_ref() == Some(expense_id))
            .filter(|comment| comment.state.is_active())
            .cloned()
            .collect())
    }

    async fn update(&self, comment: &ExpenseComment) -> Result<(), RepositoryError> {
        let mut comments = self.comments.write().await;
        match comments.iter_mut().find(|stored| stored.id == comment.id && stored.state.is_active()) {
            Some(stored) => {
                stored.content = comment.content.clone();
                stored.comment_type = comment.comment_type;
                stored.is_internal = comment.is_internal;
                stored.updated_at = comment.updated_at;
                Ok(())
            }
            None => Err(RepositoryError::not_found("comment", &comment.id)),
        }
    }

    async fn soft_delete(&self, id: &CommentId, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        let mut comments = self.comments.write().await;
        match comments.iter_mut().find(|stored| &stored.id == id && stored.state.is_active()) {
            Some(stored) => {
                stored.state = RecordState::Deleted { at };
                stored.updated_at = at;
                Ok(())
            }
            None => Err(RepositoryError::not_found("comment", id)),
        }
    }
}
