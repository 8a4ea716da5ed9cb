use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use expensa_core::domain::approval::{Approval, ApprovalId, ApprovalStatus};
use expensa_core::domain::report::ReportId;
use expensa_core::domain::UserId;

use super::{
    decode_error, decode_level, decode_optional_decimal, decode_optional_timestamp,
    decode_timestamp, encode_timestamp, stale_cutoff, ApprovalRepository, RepositoryError,
};
use crate::DbPool;

const APPROVAL_COLUMNS: &str = "id, report_id, approver_id, level, status, comments,
    approved_amount, decision_date, escalation_date, escalated_to, created_at, updated_at";

pub struct SqlApprovalRepository {
    pool: DbPool,
}

impl SqlApprovalRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn fetch_where(
        &self,
        clause: &str,
        binds: &[&str],
    ) -> Result<Vec<Approval>, RepositoryError> {
        let sql = format!("SELECT {APPROVAL_COLUMNS} FROM approval WHERE {clause}");
        let mut query = sqlx::query(&sql);
        for value in binds {
            query = query.bind(*value);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_approval).collect()
    }
}

pub(crate) fn parse_status(raw: &str) -> Result<ApprovalStatus, RepositoryError> {
    ApprovalStatus::parse(raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown approval status `{raw}`")))
}

fn row_to_approval(row: &SqliteRow) -> Result<Approval, RepositoryError> {
    let status: String = row.try_get("status").map_err(decode_error)?;
    let created_at: String = row.try_get("created_at").map_err(decode_error)?;
    let updated_at: String = row.try_get("updated_at").map_err(decode_error)?;

    Ok(Approval {
        id: ApprovalId(row.try_get("id").map_err(decode_error)?),
        report_id: ReportId(row.try_get("report_id").map_err(decode_error)?),
        approver_id: UserId(row.try_get("approver_id").map_err(decode_error)?),
        level: decode_level(row.try_get("level").map_err(decode_error)?)?,
        status: parse_status(&status)?,
        comments: row.try_get("comments").map_err(decode_error)?,
        approved_amount: decode_optional_decimal(
            "approved_amount",
            row.try_get("approved_amount").map_err(decode_error)?,
        )?,
        decision_date: decode_optional_timestamp(
            "decision_date",
            row.try_get("decision_date").map_err(decode_error)?,
        )?,
        escalation_date: decode_optional_timestamp(
            "escalation_date",
            row.try_get("escalation_date").map_err(decode_error)?,
        )?,
        escalated_to: row.try_get::<Option<String>, _>("escalated_to").map_err(decode_error)?.map(UserId),
        created_at: decode_timestamp("created_at", &created_at)?,
        updated_at: decode_timestamp("updated_at", &updated_at)?,
    })
}

#[async_trait::async_trait]
impl ApprovalRepository for SqlApprovalRepository {
    async fn create(&self, approval: &Approval) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO approval (id, report_id, approver_id, level, status, comments,
                                   approved_amount, decision_date, escalation_date, escalated_to,
                                   created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(approval.id.as_str())
        .bind(approval.report_id.as_str())
        .bind(approval.approver_id.as_str())
        .bind(i64::from(approval.level))
        .bind(approval.status.as_str())
        .bind(&approval.comments)
        .bind(approval.approved_amount.map(|amount| amount.to_string()))
        .bind(approval.decision_date.map(encode_timestamp))
        .bind(approval.escalation_date.map(encode_timestamp))
        .bind(approval.escalated_to.as_ref().map(UserId::as_str))
        .bind(encode_timestamp(approval.created_at))
        .bind(encode_timestamp(approval.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_id(&self, id: &ApprovalId) -> Result<Option<Approval>, RepositoryError> {
        Ok(self.fetch_where("id = ?", &[id.as_str()]).await?.into_iter().next())
    }

    async fn update(&self, approval: &Approval) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE approval
             SET approver_id = ?, level = ?, status = ?, comments = ?, approved_amount = ?,
                 decision_date = ?, escalation_date = ?, escalated_to = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(approval.approver_id.as_str())
        .bind(i64::from(approval.level))
        .bind(approval.status.as_str())
        .bind(&approval.comments)
        .bind(approval.approved_amount.map(|amount| amount.to_string()))
        .bind(approval.decision_date.map(encode_timestamp))
        .bind(approval.escalation_date.map(encode_timestamp))
        .bind(approval.escalated_to.as_ref().map(UserId::as_str))
        .bind(encode_timestamp(approval.updated_at))
        .bind(approval.id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::not_found("approval", &approval.id));
        }
        Ok(())
    }

    async fn transition(
        &self,
        approval: &Approval,
        expected: ApprovalStatus,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE approval
             SET status = ?, comments = ?, approved_amount = ?, decision_date = ?,
                 escalation_date = ?, escalated_to = ?, updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(approval.status.as_str())
        .bind(&approval.comments)
        .bind(approval.approved_amount.map(|amount| amount.to_string()))
        .bind(approval.decision_date.map(encode_timestamp))
        .bind(approval.escalation_date.map(encode_timestamp))
        .bind(approval.escalated_to.as_ref().map(UserId::as_str))
        .bind(encode_timestamp(approval.updated_at))
        .bind(approval.id.as_str())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_by_report(&self, report_id: &ReportId) -> Result<Vec<Approval>, RepositoryError> {
        self.fetch_where(
            "report_id = ? ORDER BY level ASC, created_at ASC, rowid ASC",
            &[report_id.as_str()],
        )
        .await
    }

    async fn list_pending_by_approver(
        &self,
        approver_id: &UserId,
    ) -> Result<Vec<Approval>, RepositoryError> {
        self.fetch_where(
            "approver_id = ? AND status = 'pending' ORDER BY created_at ASC, rowid ASC",
            &[approver_id.as_str()],
        )
        .await
    }

    async fn list_pending_by_report(
        &self,
        report_id: &ReportId,
    ) -> Result<Vec<Approval>, RepositoryError> {
        self.fetch_where(
            "report_id = ? AND status = 'pending' ORDER BY level ASC, created_at ASC, rowid ASC",
            &[report_id.as_str()],
        )
        .await
    }

    async fn list_stale(&self, older_than_hours: u32) -> Result<Vec<Approval>, RepositoryError> {
        let cutoff = encode_timestamp(stale_cutoff(older_than_hours));
        self.fetch_where(
            "status = 'pending' AND created_at < ? ORDER BY created_at ASC, rowid ASC",
            &[cutoff.as_str()],
        )
        .await
    }
}
