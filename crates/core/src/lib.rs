pub mod config;
pub mod domain;
pub mod errors;
pub mod notifications;
pub mod rules;

pub use domain::approval::{Approval, ApprovalAction, ApprovalHistory, ApprovalId, ApprovalStatus};
pub use domain::comment::{CommentId, CommentType, ExpenseComment};
pub use domain::expense::{Expense, ExpenseId};
pub use domain::policy::{Policy, PolicyApprover, PolicyId, PolicySubmitter};
pub use domain::report::{ExpenseReport, ExpenseReportItem, ReportId, ReportStatus};
pub use domain::{CategoryId, RecordState, UserId};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use notifications::{
    InMemoryNotificationSink, NoopNotificationSink, Notification, NotificationKind,
    NotificationSink, TracingNotificationSink,
};
pub use rules::{
    ApprovalRequirement, ApproverInfo, ExpenseValidationInput, PolicyRule, RuleAction,
    RuleCondition, RuleConfigError, RuleEngine, RuleType, Severity, Violation,
};
