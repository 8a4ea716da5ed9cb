use std::collections::BTreeMap;

use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use expensa_core::domain::approval::{
    ApprovalAction, ApprovalHistory, ApprovalHistoryId, ApprovalId,
};
use expensa_core::domain::report::ReportId;
use expensa_core::domain::UserId;

use super::approval::parse_status;
use super::{
    decode_error, decode_timestamp, encode_timestamp, ApprovalHistoryRepository, RepositoryError,
};
use crate::DbPool;

pub struct SqlApprovalHistoryRepository {
    pool: DbPool,
}

impl SqlApprovalHistoryRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_history(row: &SqliteRow) -> Result<ApprovalHistory, RepositoryError> {
    let action: String = row.try_get("action").map_err(decode_error)?;
    let previous_status: Option<String> = row.try_get("previous_status").map_err(decode_error)?;
    let new_status: Option<String> = row.try_get("new_status").map_err(decode_error)?;
    let metadata_json: String = row.try_get("metadata_json").map_err(decode_error)?;
    let created_at: String = row.try_get("created_at").map_err(decode_error)?;

    let metadata: BTreeMap<String, String> = serde_json::from_str(&metadata_json)
        .map_err(|error| RepositoryError::Decode(format!("history metadata: {error}")))?;

    Ok(ApprovalHistory {
        id: ApprovalHistoryId(row.try_get("id").map_err(decode_error)?),
        approval_id: ApprovalId(row.try_get("approval_id").map_err(decode_error)?),
        report_id: ReportId(row.try_get("report_id").map_err(decode_error)?),
        actor_id: UserId(row.try_get("actor_id").map_err(decode_error)?),
        action: ApprovalAction::parse(&action)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown history action `{action}`")))?,
        previous_status: previous_status.as_deref().map(parse_status).transpose()?,
        new_status: new_status.as_deref().map(parse_status).transpose()?,
        comments: row.try_get("comments").map_err(decode_error)?,
        metadata,
        created_at: decode_timestamp("created_at", &created_at)?,
    })
}

#[async_trait::async_trait]
impl ApprovalHistoryRepository for SqlApprovalHistoryRepository {
    async fn append(&self, entry: &ApprovalHistory) -> Result<(), RepositoryError> {
        let metadata_json = serde_json::to_string(&entry.metadata)
            .map_err(|error| RepositoryError::Decode(format!("history metadata: {error}")))?;

        sqlx::query(
            "INSERT INTO approval_history (id, approval_id, report_id, actor_id, action,
                                           previous_status, new_status, comments, metadata_json,
                                           created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.id.as_str())
        .bind(entry.approval_id.as_str())
        .bind(entry.report_id.as_str())
        .bind(entry.actor_id.as_str())
        .bind(entry.action.as_str())
        .bind(entry.previous_status.map(|status| status.as_str()))
        .bind(entry.new_status.map(|status| status.as_str()))
        .bind(&entry.comments)
        .bind(metadata_json)
        .bind(encode_timestamp(entry.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_by_approval(
        &self,
        approval_id: &ApprovalId,
    ) -> Result<Vec<ApprovalHistory>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, approval_id, report_id, actor_id, action, previous_status, new_status,
                    comments, metadata_json, created_at
             FROM approval_history WHERE approval_id = ?
             ORDER BY created_at ASC, rowid ASC",
        )
        .bind(approval_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_history).collect()
    }
}
