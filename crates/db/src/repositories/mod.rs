use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use expensa_core::domain::approval::{Approval, ApprovalHistory, ApprovalId, ApprovalStatus};
use expensa_core::domain::comment::{CommentId, ExpenseComment};
use expensa_core::domain::expense::{Expense, ExpenseId};
use expensa_core::domain::policy::{Policy, PolicyId};
use expensa_core::domain::report::{ExpenseReport, ExpenseReportItem, ReportId, ReportStatus};
use expensa_core::domain::UserId;

pub mod approval;
pub mod comment;
pub mod expense;
pub mod history;
pub mod memory;
pub mod policy;
pub mod report;

pub use approval::SqlApprovalRepository;
pub use comment::SqlCommentRepository;
pub use expense::SqlExpenseRepository;
pub use history::SqlApprovalHistoryRepository;
pub use memory::{
    InMemoryApprovalHistoryRepository, InMemoryApprovalRepository, InMemoryCommentRepository,
    InMemoryExpenseRepository, InMemoryPolicyRepository, InMemoryReportRepository,
};
pub use policy::SqlPolicyRepository;
pub use report::SqlReportRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },
    #[error("constraint violation: {0}")]
    Constraint(String),
}

impl RepositoryError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound { entity, id: id.to_string() }
    }
}

#[async_trait]
pub trait PolicyRepository: Send + Sync {
    /// Loads the policy with its rules, approvers and submitters. Soft-deleted
    /// policies are reported as absent.
    async fn find_by_id(&self, id: &PolicyId) -> Result<Option<Policy>, RepositoryError>;
    async fn save(&self, policy: Policy) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait ExpenseRepository: Send + Sync {
    async fn find_by_id(&self, id: &ExpenseId) -> Result<Option<Expense>, RepositoryError>;
    async fn save(&self, expense: Expense) -> Result<(), RepositoryError>;
}

/// Paging and status filter for a user's report listing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReportFilter {
    pub status: Option<ReportStatus>,
    pub limit: u32,
    pub offset: u32,
}

impl Default for ReportFilter {
    fn default() -> Self {
        Self { status: None, limit: 20, offset: 0 }
    }
}

#[async_trait]
pub trait ReportRepository: Send + Sync {
    async fn create(&self, report: &ExpenseReport) -> Result<(), RepositoryError>;
    async fn find_by_id(&self, id: &ReportId) -> Result<Option<ExpenseReport>, RepositoryError>;
    /// Persists the editable fields: title, description, policy and currency.
    async fn update(&self, report: &ExpenseReport) -> Result<(), RepositoryError>;
    async fn soft_delete(&self, id: &ReportId, at: DateTime<Utc>) -> Result<(), RepositoryError>;
    /// Persists status, lifecycle dates and rejection reason.
    async fn update_status(&self, report: &ExpenseReport) -> Result<(), RepositoryError>;
    /// Recomputes `total_amount` from the attached expenses and returns it.
    async fn recalculate_total(&self, id: &ReportId) -> Result<Decimal, RepositoryError>;
    async fn add_item(
        &self,
        report_id: &ReportId,
        expense_id: &ExpenseId,
    ) -> Result<ExpenseReportItem, RepositoryError>;
    async fn remove_item(
        &self,
        report_id: &ReportId,
        expense_id: &ExpenseId,
    ) -> Result<(), RepositoryError>;
    async fn list_items(
        &self,
        report_id: &ReportId,
    ) -> Result<Vec<ExpenseReportItem>, RepositoryError>;
    /// The active report an expense is attached to, if any.
    async fn find_report_for_expense(
        &self,
        expense_id: &ExpenseId,
    ) -> Result<Option<ReportId>, RepositoryError>;
    /// One page of the user's active reports, newest first, plus the total
    /// number of matching reports.
    async fn list_by_user(
        &self,
        user_id: &UserId,
        filter: &ReportFilter,
    ) -> Result<(Vec<ExpenseReport>, u64), RepositoryError>;
}

#[async_trait]
pub trait ApprovalRepository: Send + Sync {
    async fn create(&self, approval: &Approval) -> Result<(), RepositoryError>;
    async fn find_by_id(&self, id: &ApprovalId) -> Result<Option<Approval>, RepositoryError>;
    async fn update(&self, approval: &Approval) -> Result<(), RepositoryError>;
    /// Writes `approval` only if the stored status still equals `expected`.
    /// Returns `false` when another writer got there first.
    async fn transition(
        &self,
        approval: &Approval,
        expected: ApprovalStatus,
    ) -> Result<bool, RepositoryError>;
    /// All approvals of a report, ascending by level then creation.
    async fn list_by_report(&self, report_id: &ReportId) -> Result<Vec<Approval>, RepositoryError>;
    async fn list_pending_by_approver(
        &self,
        approver_id: &UserId,
    ) -> Result<Vec<Approval>, RepositoryError>;
    async fn list_pending_by_report(
        &self,
        report_id: &ReportId,
    ) -> Result<Vec<Approval>, RepositoryError>;
    /// Pending approvals created more than `older_than_hours` ago, oldest first.
    async fn list_stale(&self, older_than_hours: u32) -> Result<Vec<Approval>, RepositoryError>;
}

/// Append-only audit log; rows are never updated or deleted.
#[async_trait]
pub trait ApprovalHistoryRepository: Send + Sync {
    async fn append(&self, entry: &ApprovalHistory) -> Result<(), RepositoryError>;
    async fn list_by_approval(
        &self,
        approval_id: &ApprovalId,
    ) -> Result<Vec<ApprovalHistory>, RepositoryError>;
}

#[async_trait]
pub trait CommentRepository: Send + Sync {
    async fn create(&self, comment: &ExpenseComment) -> Result<(), RepositoryError>;
    async fn find_by_id(&self, id: &CommentId) -> Result<Option<ExpenseComment>, RepositoryError>;
    async fn list_by_report(
        &self,
        report_id: &ReportId,
        include_internal: bool,
    ) -> Result<Vec<ExpenseComment>, RepositoryError>;
    async fn list_by_expense(
        &self,
        expense_id: &ExpenseId,
    ) -> Result<Vec<ExpenseComment>, RepositoryError>;
    async fn update(&self, comment: &ExpenseComment) -> Result<(), RepositoryError>;
    async fn soft_delete(&self, id: &CommentId, at: DateTime<Utc>) -> Result<(), RepositoryError>;
}

pub(crate) fn stale_cutoff(older_than_hours: u32) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::hours(i64::from(older_than_hours))
}

/// Fixed-width UTC form so that timestamps compare correctly as TEXT.
pub(crate) fn encode_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_timestamp(column: &str, raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|error| RepositoryError::Decode(format!("{column} `{raw}`: {error}")))
}

pub(crate) fn decode_optional_timestamp(
    column: &str,
    raw: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    raw.map(|raw| decode_timestamp(column, &raw)).transpose()
}

pub(crate) fn decode_decimal(column: &str, raw: &str) -> Result<Decimal, RepositoryError> {
    Decimal::from_str(raw)
        .map_err(|error| RepositoryError::Decode(format!("{column} `{raw}`: {error}")))
}

pub(crate) fn decode_optional_decimal(
    column: &str,
    raw: Option<String>,
) -> Result<Option<Decimal>, RepositoryError> {
    raw.map(|raw| decode_decimal(column, &raw)).transpose()
}

pub(crate) fn decode_level(raw: i64) -> Result<u32, RepositoryError> {
    u32::try_from(raw)
        .ok()
        .filter(|level| *level > 0)
        .ok_or_else(|| RepositoryError::Decode(format!("approval level `{raw}` out of range")))
}

pub(crate) fn decode_error(error: sqlx::Error) -> RepositoryError {
    RepositoryError::Decode(error.to_string())
}
