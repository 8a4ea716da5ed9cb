//! Approval workflow for expense reports: approver decisions, level routing,
//! report lifecycle, comments, and automatic escalation of stale approvals.

pub mod approval;
pub mod comments;
pub mod engine;
pub mod error;
pub mod report;
pub mod scheduler;

use std::sync::Arc;

use expensa_core::notifications::{Notification, NotificationSink};
use expensa_db::repositories::{
    ApprovalHistoryRepository, ApprovalRepository, CommentRepository, ExpenseRepository,
    InMemoryApprovalHistoryRepository, InMemoryApprovalRepository, InMemoryCommentRepository,
    InMemoryExpenseRepository, InMemoryPolicyRepository, InMemoryReportRepository,
    PolicyRepository, ReportRepository, SqlApprovalHistoryRepository, SqlApprovalRepository,
    SqlCommentRepository, SqlExpenseRepository, SqlPolicyRepository, SqlReportRepository,
};
use expensa_db::DbPool;
use tracing::warn;

pub use approval::{ApprovalService, ApproveDecision};
pub use comments::{CommentService, NewComment};
pub use engine::WorkflowEngine;
pub use error::{ErrorKind, WorkflowError};
pub use expensa_db::repositories::ReportFilter;
pub use report::{NewReport, ReportChanges, ReportPage, ReportService};
pub use scheduler::{EscalationScheduler, EscalationSummary, SchedulerHandle};

/// The persistence ports every workflow service draws from.
#[derive(Clone)]
pub struct Repositories {
    pub policies: Arc<dyn PolicyRepository>,
    pub expenses: Arc<dyn ExpenseRepository>,
    pub reports: Arc<dyn ReportRepository>,
    pub approvals: Arc<dyn ApprovalRepository>,
    pub history: Arc<dyn ApprovalHistoryRepository>,
    pub comments: Arc<dyn CommentRepository>,
}

impl Repositories {
    pub fn sql(pool: DbPool) -> Self {
        Self {
            policies: Arc::new(SqlPolicyRepository::new(pool.clone())),
            expenses: Arc::new(SqlExpenseRepository::new(pool.clone())),
            reports: Arc::new(SqlReportRepository::new(pool.clone())),
            approvals: Arc::new(SqlApprovalRepository::new(pool.clone())),
            history: Arc::new(SqlApprovalHistoryRepository::new(pool.clone())),
            comments: Arc::new(SqlCommentRepository::new(pool)),
        }
    }

    pub fn in_memory() -> Self {
        let expenses = Arc::new(InMemoryExpenseRepository::default());
        Self {
            policies: Arc::new(InMemoryPolicyRepository::default()),
            reports: Arc::new(InMemoryReportRepository::new(expenses.clone())),
            expenses,
            approvals: Arc::new(InMemoryApprovalRepository::default()),
            history: Arc::new(InMemoryApprovalHistoryRepository::default()),
            comments: Arc::new(InMemoryCommentRepository::default()),
        }
    }
}

/// Delivers a notification without letting a sink failure reach the caller.
pub(crate) fn dispatch(sink: &dyn NotificationSink, notification: Notification) {
    let kind = notification.kind;
    let report_id = notification.report_id.clone();
    if let Err(error) = sink.notify(notification) {
        warn!(
            event_name = "workflow.notification.failed",
            kind = kind.as_str(),
            report_id = %report_id,
            error = %error,
            "notification delivery failed"
        );
    }
}
