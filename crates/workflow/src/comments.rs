use chrono::Utc;
use tracing::info;

use expensa_core::domain::comment::{CommentId, CommentType, ExpenseComment};
use expensa_core::domain::expense::ExpenseId;
use expensa_core::domain::report::ReportId;
use expensa_core::domain::UserId;
use expensa_core::errors::DomainError;

use crate::error::{PersistenceContext, WorkflowError};
use crate::Repositories;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NewComment {
    pub report_id: Option<ReportId>,
    pub expense_id: Option<ExpenseId>,
    pub content: String,
    pub comment_type: Option<CommentType>,
    pub is_internal: bool,
    pub parent_comment_id: Option<CommentId>,
}

/// Discussion threads on reports and expenses. Comments are separate from the
/// approval audit trail and never write approval history.
#[derive(Clone)]
pub struct CommentService {
    repositories: Repositories,
}

impl CommentService {
    pub fn new(repositories: Repositories) -> Self {
        Self { repositories }
    }

    pub async fn add_comment(
        &self,
        author_id: &UserId,
        new_comment: NewComment,
    ) -> Result<ExpenseComment, WorkflowError> {
        if let Some(report_id) = new_comment.report_id.as_ref() {
            self.repositories
                .reports
                .find_by_id(report_id)
                .await
                .during("report.find")?
                .ok_or_else(|| WorkflowError::ReportNotFound(report_id.clone()))?;
        }
        if let Some(parent_id) = new_comment.parent_comment_id.as_ref() {
            self.load(parent_id).await?;
        }

        let mut comment = ExpenseComment::new(
            new_comment.report_id,
            new_comment.expense_id,
            author_id.clone(),
            new_comment.content,
        )?;
        comment.comment_type = new_comment.comment_type.unwrap_or_default();
        comment.is_internal = new_comment.is_internal;
        comment.parent_comment_id = new_comment.parent_comment_id;

        self.repositories.comments.create(&comment).await.during("comment.create")?;
        info!(
            event_name = "workflow.comment.added",
            correlation_id = %comment.id,
            comment_id = %comment.id,
            report_id = comment.report_id.as_ref().map(ReportId::as_str),
            comment_type = comment.comment_type.as_str(),
            "comment added"
        );
        Ok(comment)
    }

    pub async fn list_report_comments(
        &self,
        report_id: &ReportId,
        include_internal: bool,
    ) -> Result<Vec<ExpenseComment>, WorkflowError> {
        self.repositories
            .comments
            .list_by_report(report_id, include_internal)
            .await
            .during("comment.list_by_report")
    }

    pub async fn list_expense_comments(
        &self,
        expense_id: &ExpenseId,
    ) -> Result<Vec<ExpenseComment>, WorkflowError> {
        self.repositories.comments.list_by_expense(expense_id).await.during("comment.list_by_expense")
    }

    pub async fn update_comment(
        &self,
        comment_id: &CommentId,
        author_id: &UserId,
        content: &str,
    ) -> Result<ExpenseComment, WorkflowError> {
        let mut comment = self.load_authored(comment_id, author_id).await?;
        let content = content.trim();
        if content.is_empty() {
            return Err(
                DomainError::InvariantViolation("comment content must not be blank".to_owned())
                    .into(),
            );
        }

        comment.content = content.to_owned();
        comment.updated_at = Utc::now();
        self.repositories.comments.update(&comment).await.during("comment.update")?;
        Ok(comment)
    }

    pub async fn delete_comment(
        &self,
        comment_id: &CommentId,
        author_id: &UserId,
    ) -> Result<(), WorkflowError> {
        self.load_authored(comment_id, author_id).await?;
        self.repositories
            .comments
            .soft_delete(comment_id, Utc::now())
            .await
            .during("comment.delete")
    }

    async fn load(&self, comment_id: &CommentId) -> Result<ExpenseComment, WorkflowError> {
        self.repositories
            .comments
            .find_by_id(comment_id)
            .await
            .during("comment.find")?
            .ok_or_else(|| WorkflowError::CommentNotFound(comment_id.clone()))
    }

    async fn load_authored(
        &self,
        comment_id: &CommentId,
        author_id: &UserId,
    ) -> Result<ExpenseComment, WorkflowError> {
        let comment = self.load(comment_id).await?;
        if &comment.author_id != author_id {
            return Err(WorkflowError::NotCommentAuthor {
                comment_id: comment.id,
                user_id: author_id.clone(),
            });
        }
        Ok(comment)
    }
}
