use thiserror::Error;

use expensa_core::domain::approval::{ApprovalId, ApprovalStatus};
use expensa_core::domain::comment::CommentId;
use expensa_core::domain::expense::ExpenseId;
use expensa_core::domain::policy::PolicyId;
use expensa_core::domain::report::{ReportId, ReportStatus};
use expensa_core::domain::UserId;
use expensa_core::errors::{ApplicationError, DomainError};
use expensa_core::rules::Violation;
use expensa_db::repositories::RepositoryError;

/// Coarse classification so callers can tell a misconfigured policy from an
/// unavailable database without matching on every variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    Unauthorized,
    PolicyConfiguration,
    EscalationExhausted,
    Persistence,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::InvalidState => "invalid_state",
            Self::Unauthorized => "unauthorized",
            Self::PolicyConfiguration => "policy_configuration",
            Self::EscalationExhausted => "escalation_exhausted",
            Self::Persistence => "persistence",
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("policy `{0}` not found")]
    PolicyNotFound(PolicyId),
    #[error("report `{0}` not found")]
    ReportNotFound(ReportId),
    #[error("approval `{0}` not found")]
    ApprovalNotFound(ApprovalId),
    #[error("expense `{0}` not found")]
    ExpenseNotFound(ExpenseId),
    #[error("comment `{0}` not found")]
    CommentNotFound(CommentId),

    #[error("approval `{id}` is {status:?}, not pending")]
    ApprovalNotPending { id: ApprovalId, status: ApprovalStatus },
    #[error("approval `{id}` is still {status:?}; only approved or rejected approvals can be processed")]
    ApprovalNotCompleted { id: ApprovalId, status: ApprovalStatus },
    #[error("report `{id}` is {status:?}; only draft reports can be changed")]
    ReportNotEditable { id: ReportId, status: ReportStatus },
    #[error("report `{id}` is {status:?}; only draft reports can be submitted")]
    ReportNotSubmittable { id: ReportId, status: ReportStatus },
    #[error("report `{id}` is {status:?} and no longer awaits approval decisions")]
    ReportClosed { id: ReportId, status: ReportStatus },
    #[error("report `{0}` has no expenses")]
    ReportEmpty(ReportId),
    #[error("expense `{expense_id}` is already attached to report `{report_id}`")]
    ExpenseAlreadyInReport { expense_id: ExpenseId, report_id: ReportId },
    #[error("expense `{expense_id}` is not attached to report `{report_id}`")]
    ExpenseNotInReport { expense_id: ExpenseId, report_id: ReportId },
    #[error("report `{report_id}` violates its policy: {}", summarize(.violations))]
    PolicyViolations { report_id: ReportId, violations: Vec<Violation> },
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("user `{user_id}` is not the assigned approver of approval `{approval_id}`")]
    NotAuthorizedApprover { approval_id: ApprovalId, user_id: UserId },
    #[error("user `{user_id}` does not own report `{report_id}`")]
    NotReportOwner { report_id: ReportId, user_id: UserId },
    #[error("user `{user_id}` is not the author of comment `{comment_id}`")]
    NotCommentAuthor { comment_id: CommentId, user_id: UserId },

    #[error("report `{0}` has no policy assigned")]
    NoPolicyAssigned(ReportId),
    #[error("policy `{policy_id}` has no approver covering report `{report_id}`")]
    NoApproversFound { report_id: ReportId, policy_id: PolicyId },

    #[error("no next approver found for escalation of approval `{approval_id}` above level {level}")]
    NoNextApprover { approval_id: ApprovalId, level: u32 },

    #[error("{operation} failed: {source}")]
    Persistence {
        operation: &'static str,
        #[source]
        source: RepositoryError,
    },
}

fn summarize(violations: &[Violation]) -> String {
    violations.iter().map(|violation| violation.message.as_str()).collect::<Vec<_>>().join("; ")
}

impl WorkflowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PolicyNotFound(_)
            | Self::ReportNotFound(_)
            | Self::ApprovalNotFound(_)
            | Self::ExpenseNotFound(_)
            | Self::CommentNotFound(_) => ErrorKind::NotFound,
            Self::ApprovalNotPending { .. }
            | Self::ApprovalNotCompleted { .. }
            | Self::ReportNotEditable { .. }
            | Self::ReportNotSubmittable { .. }
            | Self::ReportClosed { .. }
            | Self::ReportEmpty(_)
            | Self::ExpenseAlreadyInReport { .. }
            | Self::ExpenseNotInReport { .. }
            | Self::PolicyViolations { .. }
            | Self::Domain(_) => ErrorKind::InvalidState,
            Self::NotAuthorizedApprover { .. }
            | Self::NotReportOwner { .. }
            | Self::NotCommentAuthor { .. } => ErrorKind::Unauthorized,
            Self::NoPolicyAssigned(_) | Self::NoApproversFound { .. } => {
                ErrorKind::PolicyConfiguration
            }
            Self::NoNextApprover { .. } => ErrorKind::EscalationExhausted,
            Self::Persistence { .. } => ErrorKind::Persistence,
        }
    }
}

impl From<WorkflowError> for ApplicationError {
    fn from(value: WorkflowError) -> Self {
        match value {
            WorkflowError::Domain(error) => Self::Domain(error),
            other => match other.kind() {
                ErrorKind::Persistence => Self::Persistence(other.to_string()),
                ErrorKind::PolicyConfiguration | ErrorKind::EscalationExhausted => {
                    Self::PolicyConfiguration(other.to_string())
                }
                ErrorKind::NotFound | ErrorKind::InvalidState | ErrorKind::Unauthorized => {
                    Self::Domain(DomainError::InvariantViolation(other.to_string()))
                }
            },
        }
    }
}

/// Attaches the operation name to repository failures.
pub(crate) trait PersistenceContext<T> {
    fn during(self, operation: &'static str) -> Result<T, WorkflowError>;
}

impl<T> PersistenceContext<T> for Result<T, RepositoryError> {
    fn during(self, operation: &'static str) -> Result<T, WorkflowError> {
        self.map_err(|source| WorkflowError::Persistence { operation, source })
    }
}
