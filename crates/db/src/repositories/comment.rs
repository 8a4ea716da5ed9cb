use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use expensa_core::domain::comment::{CommentId, CommentType, ExpenseComment};
use expensa_core::domain::expense::ExpenseId;
use expensa_core::domain::report::ReportId;
use expensa_core::domain::{RecordState, UserId};

use super::{
    decode_error, decode_optional_timestamp, decode_timestamp, encode_timestamp,
    CommentRepository, RepositoryError,
};
use crate::DbPool;

const COMMENT_COLUMNS: &str = "id, report_id, expense_id, author_id, content, comment_type,
    is_internal, parent_comment_id, created_at, updated_at, deleted_at";

pub struct SqlCommentRepository {
    pool: DbPool,
}

impl SqlCommentRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_comment(row: &SqliteRow) -> Result<ExpenseComment, RepositoryError> {
    let comment_type: String = row.try_get("comment_type").map_err(decode_error)?;
    let created_at: String = row.try_get("created_at").map_err(decode_error)?;
    let updated_at: String = row.try_get("updated_at").map_err(decode_error)?;

    Ok(ExpenseComment {
        id: CommentId(row.try_get("id").map_err(decode_error)?),
        report_id: row.try_get::<Option<String>, _>("report_id").map_err(decode_error)?.map(ReportId),
        expense_id: row
            .try_get::<Option<String>, _>("expense_id")
            .map_err(decode_error)?
            .map(ExpenseId),
        author_id: UserId(row.try_get("author_id").map_err(decode_error)?),
        content: row.try_get("content").map_err(decode_error)?,
        comment_type: CommentType::parse(&comment_type).ok_or_else(|| {
            RepositoryError::Decode(format!("unknown comment type `{comment_type}`"))
        })?,
        is_internal: row.try_get("is_internal").map_err(decode_error)?,
        parent_comment_id: row
            .try_get::<Option<String>, _>("parent_comment_id")
            .map_err(decode_error)?
            .map(CommentId),
        state: RecordState::from_deleted_at(decode_optional_timestamp(
            "deleted_at",
            row.try_get("deleted_at").map_err(decode_error)?,
        )?),
        created_at: decode_timestamp("created_at", &created_at)?,
        updated_at: decode_timestamp("updated_at", &updated_at)?,
    })
}

#[async_trait::async_trait]
impl CommentRepository for SqlCommentRepository {
    async fn create(&self, comment: &ExpenseComment) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO expense_comment (id, report_id, expense_id, author_id, content,
                                          comment_type, is_internal, parent_comment_id,
                                          created_at, updated_at, deleted_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(comment.id.as_str())
        .bind(comment.report_id.as_ref().map(ReportId::as_str))
        .bind(comment.expense_id.as_ref().map(ExpenseId::as_str))
        .bind(comment.author_id.as_str())
        .bind(&comment.content)
        .bind(comment.comment_type.as_str())
        .bind(comment.is_internal)
        .bind(comment.parent_comment_id.as_ref().map(CommentId::as_str))
        .bind(encode_timestamp(comment.created_at))
        .bind(encode_timestamp(comment.updated_at))
        .bind(comment.state.deleted_at().map(encode_timestamp))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_id(&self, id: &CommentId) -> Result<Option<ExpenseComment>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {COMMENT_COLUMNS} FROM expense_comment WHERE id = ? AND deleted_at IS NULL"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_comment).transpose()
    }

    async fn list_by_report(
        &self,
        report_id: &ReportId,
        include_internal: bool,
    ) -> Result<Vec<ExpenseComment>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {COMMENT_COLUMNS} FROM expense_comment
             WHERE report_id = ? AND deleted_at IS NULL AND (? OR is_internal = 0)
             ORDER BY created_at ASC, rowid ASC"
        ))
        .bind(report_id.as_str())
        .bind(include_internal)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_comment).collect()
    }

    async fn list_by_expense(
        &self,
        expense_id: &ExpenseId,
    ) -> Result<Vec<ExpenseComment>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {COMMENT_COLUMNS} FROM expense_comment
             WHERE expense_id = ? AND deleted_at IS NULL
             ORDER BY created_at ASC, rowid ASC"
        ))
        .bind(expense_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_comment).collect()
    }

    async fn update(&self, comment: &ExpenseComment) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE expense_comment
             SET content = ?, comment_type = ?, is_internal = ?, updated_at = ?
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(&comment.content)
        .bind(comment.comment_type.as_str())
        .bind(comment.is_internal)
        .bind(encode_timestamp(comment.updated_at))
        .bind(comment.id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::not_found("comment", &comment.id));
        }
        Ok(())
    }

    async fn soft_delete(&self, id: &CommentId, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE expense_comment SET deleted_at = ?, updated_at = ?
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(encode_timestamp(at))
        .bind(encode_timestamp(at))
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::not_found("comment", id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use expensa_core::domain::comment::{CommentType, ExpenseComment};
    use expensa_core::domain::report::{ExpenseReport, ReportId};
    use expensa_core::domain::UserId;

    use super::SqlCommentRepository;
    use crate::repositories::{CommentRepository, ReportRepository, SqlReportRepository};
    use crate::{connect_with_settings, migrations};

    async fn setup() -> (SqlCommentRepository, ReportId) {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        let report =
            ExpenseReport::new_draft(UserId("u-owner".to_string()), None, "Trip", None, "CLP");
        SqlReportRepository::new(pool.clone()).create(&report).await.expect("report");
        (SqlCommentRepository::new(pool), report.id)
    }

    fn comment(report_id: &ReportId, content: &str, internal: bool) -> ExpenseComment {
        let mut comment = ExpenseComment::new(
            Some(report_id.clone()),
            None,
            UserId("u-a".to_string()),
            content,
        )
        .expect("comment");
        comment.is_internal = internal;
        comment
    }

    #[tokio::test]
    async fn list_by_report_filters_internal_comments() {
        let (repo, report_id) = setup().await;
        repo.create(&comment(&report_id, "Please attach receipts", false)).await.expect("public");
        repo.create(&comment(&report_id, "Owner expensed this twice last year", true))
            .await
            .expect("internal");

        let everything = repo.list_by_report(&report_id, true).await.expect("all");
        let visible = repo.list_by_report(&report_id, false).await.expect("visible");

        assert_eq!(everything.len(), 2);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].content, "Please attach receipts");
    }

    #[tokio::test]
    async fn update_and_soft_delete() {
        let (repo, report_id) = setup().await;
        let mut stored = comment(&report_id, "Is this billable?", false);
        repo.create(&stored).await.expect("create");

        stored.content = "Is this billable to the client?".to_string();
        stored.comment_type = CommentType::Question;
        stored.updated_at = Utc::now();
        repo.update(&stored).await.expect("update");

        let found = repo.find_by_id(&stored.id).await.expect("find").expect("exists");
        assert_eq!(found.comment_type, CommentType::Question);
        assert_eq!(found.content, "Is this billable to the client?");

        repo.soft_delete(&stored.id, Utc::now()).await.expect("delete");
        assert!(repo.find_by_id(&stored.id).await.expect("find").is_none());
        assert!(repo.list_by_report(&report_id, true).await.expect("list").is_empty());
        assert!(repo.soft_delete(&stored.id, Utc::now()).await.is_err());
    }
}
