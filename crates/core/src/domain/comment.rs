use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::expense::ExpenseId;
use crate::domain::report::ReportId;
use crate::domain::{string_id, RecordState, UserId};
use crate::errors::DomainError;

string_id!(CommentId);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommentType {
    #[default]
    General,
    Question,
    Clarification,
    ApprovalNote,
    RejectionNote,
    System,
}

impl CommentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Question => "question",
            Self::Clarification => "clarification",
            Self::ApprovalNote => "approval_note",
            Self::RejectionNote => "rejection_note",
            Self::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "general" => Some(Self::General),
            "question" => Some(Self::Question),
            "clarification" => Some(Self::Clarification),
            "approval_note" => Some(Self::ApprovalNote),
            "rejection_note" => Some(Self::RejectionNote),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// Discussion attached to a report, an expense, or both.
///
/// Internal comments are visible to approvers only and are filtered out of
/// the owner-facing listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpenseComment {
    pub id: CommentId,
    pub report_id: Option<ReportId>,
    pub expense_id: Option<ExpenseId>,
    pub author_id: UserId,
    pub content: String,
    pub comment_type: CommentType,
    pub is_internal: bool,
    pub parent_comment_id: Option<CommentId>,
    pub state: RecordState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExpenseComment {
    pub fn new(
        report_id: Option<ReportId>,
        expense_id: Option<ExpenseId>,
        author_id: UserId,
        content: impl Into<String>,
    ) -> Result<Self, DomainError> {
        if report_id.is_none() && expense_id.is_none() {
            return Err(DomainError::InvariantViolation(
                "comment must reference a report or an expense".to_string(),
            ));
        }

        let content = content.into();
        if content.trim().is_empty() {
            return Err(DomainError::InvariantViolation("comment content is empty".to_string()));
        }

        let now = Utc::now();
        Ok(Self {
            id: CommentId::generate(),
            report_id,
            expense_id,
            author_id,
            content,
            comment_type: CommentType::General,
            is_internal: false,
            parent_comment_id: None,
            state: RecordState::Active,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_visible_to_owner(&self) -> bool {
        self.state.is_active() && !self.is_internal
    }
}
