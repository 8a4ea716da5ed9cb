use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use expensa_core::domain::expense::ExpenseId;
use expensa_core::domain::policy::PolicyId;
use expensa_core::domain::report::{
    ExpenseReport, ExpenseReportItem, ReportId, ReportItemId, ReportStatus,
};
use expensa_core::domain::{RecordState, UserId};

use super::{
    decode_decimal, decode_error, decode_optional_timestamp, decode_timestamp, encode_timestamp,
    ReportFilter, ReportRepository, RepositoryError,
};
use crate::DbPool;

const REPORT_COLUMNS: &str = "id, user_id, policy_id, title, description, status, total_amount,
    currency, submission_date, approval_date, payment_date, rejection_reason,
    created_at, updated_at, deleted_at";

pub struct SqlReportRepository {
    pool: DbPool,
}

impl SqlReportRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_report(row: &SqliteRow) -> Result<ExpenseReport, RepositoryError> {
    let status: String = row.try_get("status").map_err(decode_error)?;
    let total_amount: String = row.try_get("total_amount").map_err(decode_error)?;
    let created_at: String = row.try_get("created_at").map_err(decode_error)?;
    let updated_at: String = row.try_get("updated_at").map_err(decode_error)?;

    Ok(ExpenseReport {
        id: ReportId(row.try_get("id").map_err(decode_error)?),
        user_id: UserId(row.try_get("user_id").map_err(decode_error)?),
        policy_id: row.try_get::<Option<String>, _>("policy_id").map_err(decode_error)?.map(PolicyId),
        title: row.try_get("title").map_err(decode_error)?,
        description: row.try_get("description").map_err(decode_error)?,
        status: ReportStatus::parse(&status)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown report status `{status}`")))?,
        total_amount: decode_decimal("total_amount", &total_amount)?,
        currency: row.try_get("currency").map_err(decode_error)?,
        submission_date: decode_optional_timestamp(
            "submission_date",
            row.try_get("submission_date").map_err(decode_error)?,
        )?,
        approval_date: decode_optional_timestamp(
            "approval_date",
            row.try_get("approval_date").map_err(decode_error)?,
        )?,
        payment_date: decode_optional_timestamp(
            "payment_date",
            row.try_get("payment_date").map_err(decode_error)?,
        )?,
        rejection_reason: row.try_get("rejection_reason").map_err(decode_error)?,
        state: RecordState::from_deleted_at(decode_optional_timestamp(
            "deleted_at",
            row.try_get("deleted_at").map_err(decode_error)?,
        )?),
        created_at: decode_timestamp("created_at", &created_at)?,
        updated_at: decode_timestamp("updated_at", &updated_at)?,
    })
}

fn row_to_item(row: &SqliteRow) -> Result<ExpenseReportItem, RepositoryError> {
    let sequence_number: i64 = row.try_get("sequence_number").map_err(decode_error)?;
    let created_at: String = row.try_get("created_at").map_err(decode_error)?;

    Ok(ExpenseReportItem {
        id: ReportItemId(row.try_get("id").map_err(decode_error)?),
        report_id: ReportId(row.try_get("report_id").map_err(decode_error)?),
        expense_id: ExpenseId(row.try_get("expense_id").map_err(decode_error)?),
        sequence_number: u32::try_from(sequence_number).map_err(|_| {
            RepositoryError::Decode(format!("sequence number `{sequence_number}` out of range"))
        })?,
        created_at: decode_timestamp("created_at", &created_at)?,
    })
}

#[async_trait::async_trait]
impl ReportRepository for SqlReportRepository {
    async fn create(&self, report: &ExpenseReport) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO expense_report (id, user_id, policy_id, title, description, status,
                                         total_amount, currency, submission_date, approval_date,
                                         payment_date, rejection_reason, created_at, updated_at,
                                         deleted_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(report.id.as_str())
        .bind(report.user_id.as_str())
        .bind(report.policy_id.as_ref().map(PolicyId::as_str))
        .bind(&report.title)
        .bind(&report.description)
        .bind(report.status.as_str())
        .bind(report.total_amount.to_string())
        .bind(&report.currency)
        .bind(report.submission_date.map(encode_timestamp))
        .bind(report.approval_date.map(encode_timestamp))
        .bind(report.payment_date.map(encode_timestamp))
        .bind(&report.rejection_reason)
        .bind(encode_timestamp(report.created_at))
        .bind(encode_timestamp(report.updated_at))
        .bind(report.state.deleted_at().map(encode_timestamp))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_id(&self, id: &ReportId) -> Result<Option<ExpenseReport>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {REPORT_COLUMNS} FROM expense_report WHERE id = ? AND deleted_at IS NULL"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_report).transpose()
    }

    async fn update(&self, report: &ExpenseReport) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE expense_report
             SET title = ?, description = ?, policy_id = ?, currency = ?, updated_at = ?
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(&report.title)
        .bind(&report.description)
        .bind(report.policy_id.as_ref().map(PolicyId::as_str))
        .bind(&report.currency)
        .bind(encode_timestamp(report.updated_at))
        .bind(report.id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::not_found("report", &report.id));
        }
        Ok(())
    }

    async fn soft_delete(&self, id: &ReportId, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE expense_report SET deleted_at = ?, updated_at = ?
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(encode_timestamp(at))
        .bind(encode_timestamp(at))
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::not_found("report", id));
        }
        Ok(())
    }

    async fn update_status(&self, report: &ExpenseReport) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE expense_report
             SET status = ?, submission_date = ?, approval_date = ?, payment_date = ?,
                 rejection_reason = ?, updated_at = ?
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(report.status.as_str())
        .bind(report.submission_date.map(encode_timestamp))
        .bind(report.approval_date.map(encode_timestamp))
        .bind(report.payment_date.map(encode_timestamp))
        .bind(&report.rejection_reason)
        .bind(encode_timestamp(report.updated_at))
        .bind(report.id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::not_found("report", &report.id));
        }
        Ok(())
    }

    async fn recalculate_total(&self, id: &ReportId) -> Result<Decimal, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        // SQLite SUM would coerce the TEXT amounts to floating point.
        let amounts: Vec<String> = sqlx::query_scalar(
            "SELECT e.amount FROM expense_report_item i
             JOIN expense e ON e.id = i.expense_id
             WHERE i.report_id = ?",
        )
        .bind(id.as_str())
        .fetch_all(&mut *tx)
        .await?;

        let mut total = Decimal::ZERO;
        for amount in &amounts {
            total += decode_decimal("amount", amount)?;
        }

        let result = sqlx::query(
            "UPDATE expense_report SET total_amount = ?, updated_at = ?
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(total.to_string())
        .bind(encode_timestamp(Utc::now()))
        .bind(id.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::not_found("report", id));
        }

        tx.commit().await?;
        Ok(total)
    }

    async fn add_item(
        &self,
        report_id: &ReportId,
        expense_id: &ExpenseId,
    ) -> Result<ExpenseReportItem, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let max_sequence: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(sequence_number) FROM expense_report_item WHERE report_id = ?",
        )
        .bind(report_id.as_str())
        .fetch_one(&mut *tx)
        .await?;
        let next = max_sequence.unwrap_or(0) + 1;

        let item = ExpenseReportItem {
            id: ReportItemId::generate(),
            report_id: report_id.clone(),
            expense_id: expense_id.clone(),
            sequence_number: u32::try_from(next).map_err(|_| {
                RepositoryError::Constraint(format!("report `{report_id}` has too many items"))
            })?,
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO expense_report_item (id, report_id, expense_id, sequence_number, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(item.id.as_str())
        .bind(item.report_id.as_str())
        .bind(item.expense_id.as_str())
        .bind(next)
        .bind(encode_timestamp(item.created_at))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(item)
    }

    async fn remove_item(
        &self,
        report_id: &ReportId,
        expense_id: &ExpenseId,
    ) -> Result<(), RepositoryError> {
        let result =
            sqlx::query("DELETE FROM expense_report_item WHERE report_id = ? AND expense_id = ?")
                .bind(report_id.as_str())
                .bind(expense_id.as_str())
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::not_found("report item", expense_id));
        }
        Ok(())
    }

    async fn list_items(
        &self,
        report_id: &ReportId,
    ) -> Result<Vec<ExpenseReportItem>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, report_id, expense_id, sequence_number, created_at
             FROM expense_report_item WHERE report_id = ? ORDER BY sequence_number ASC",
        )
        .bind(report_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_item).collect()
    }

    async fn find_report_for_expense(
        &self,
        expense_id: &ExpenseId,
    ) -> Result<Option<ReportId>, RepositoryError> {
        let report_id: Option<String> = sqlx::query_scalar(
            "SELECT r.id FROM expense_report_item i
             JOIN expense_report r ON r.id = i.report_id
             WHERE i.expense_id = ? AND r.deleted_at IS NULL
             LIMIT 1",
        )
        .bind(expense_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(report_id.map(ReportId))
    }

    async fn list_by_user(
        &self,
        user_id: &UserId,
        filter: &ReportFilter,
    ) -> Result<(Vec<ExpenseReport>, u64), RepositoryError> {
        let status = filter.status.map(|status| status.as_str());
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM expense_report
             WHERE user_id = ? AND deleted_at IS NULL AND (? IS NULL OR status = ?)",
        )
        .bind(user_id.as_str())
        .bind(status)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(&format!(
            "SELECT {REPORT_COLUMNS} FROM expense_report
             WHERE user_id = ? AND deleted_at IS NULL AND (? IS NULL OR status = ?)
             ORDER BY created_at DESC, rowid DESC
             LIMIT ? OFFSET ?"
        ))
        .bind(user_id.as_str())
        .bind(status)
        .bind(status)
        .bind(i64::from(filter.limit))
        .bind(i64::from(filter.offset))
        .fetch_all(&self.pool)
        .await?;

        let reports = rows.iter().map(row_to_report).collect::<Result<Vec<_>, _>>()?;
        Ok((reports, u64::try_from(total).unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use expensa_core::domain::expense::{Expense, ExpenseId};
    use expensa_core::domain::report::{ExpenseReport, ReportStatus};
    use expensa_core::domain::{CategoryId, UserId};

    use super::SqlReportRepository;
    use crate::repositories::{
        ExpenseRepository, ReportFilter, ReportRepository, RepositoryError, SqlExpenseRepository,
    };
    use crate::{connect_with_settings, migrations};

    async fn setup() -> sqlx::SqlitePool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    async fn insert_expense(pool: &sqlx::SqlitePool, id: &str, amount: Decimal) -> ExpenseId {
        let expense = Expense {
            id: ExpenseId(id.to_string()),
            user_id: UserId("u-owner".to_string()),
            category_id: CategoryId("travel".to_string()),
            amount,
            currency: "CLP".to_string(),
            description: None,
            created_at: Utc::now(),
        };
        SqlExpenseRepository::new(pool.clone()).save(expense).await.expect("insert expense");
        ExpenseId(id.to_string())
    }

    fn draft() -> ExpenseReport {
        ExpenseReport::new_draft(UserId("u-owner".to_string()), None, "March travel", None, "CLP")
    }

    #[tokio::test]
    async fn create_and_find_by_id() {
        let repo = SqlReportRepository::new(setup().await);
        let report = draft();

        repo.create(&report).await.expect("create");
        let found = repo.find_by_id(&report.id).await.expect("find").expect("should exist");

        assert_eq!(found.title, "March travel");
        assert_eq!(found.status, ReportStatus::Draft);
        assert_eq!(found.total_amount, Decimal::ZERO);
        assert!(found.state.is_active());
    }

    #[tokio::test]
    async fn items_get_increasing_sequence_and_total_is_exact() {
        let pool = setup().await;
        let repo = SqlReportRepository::new(pool.clone());
        let report = draft();
        repo.create(&report).await.expect("create");

        let taxi = insert_expense(&pool, "E-1", Decimal::new(1_999, 2)).await;
        let hotel = insert_expense(&pool, "E-2", Decimal::new(45_001, 2)).await;

        let first = repo.add_item(&report.id, &taxi).await.expect("add taxi");
        let second = repo.add_item(&report.id, &hotel).await.expect("add hotel");
        assert_eq!((first.sequence_number, second.sequence_number), (1, 2));

        let total = repo.recalculate_total(&report.id).await.expect("recalculate");
        assert_eq!(total, Decimal::new(47_000, 2));

        repo.remove_item(&report.id, &taxi).await.expect("remove taxi");
        let hotel_only = insert_expense(&pool, "E-3", Decimal::ONE).await;
        let third = repo.add_item(&report.id, &hotel_only).await.expect("add third");
        assert_eq!(third.sequence_number, 3);

        let items = repo.list_items(&report.id).await.expect("list");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].expense_id, hotel);
    }

    #[tokio::test]
    async fn find_report_for_expense_ignores_deleted_reports() {
        let pool = setup().await;
        let repo = SqlReportRepository::new(pool.clone());
        let report = draft();
        repo.create(&report).await.expect("create");
        let expense = insert_expense(&pool, "E-1", Decimal::TEN).await;
        repo.add_item(&report.id, &expense).await.expect("add");

        assert_eq!(
            repo.find_report_for_expense(&expense).await.expect("lookup"),
            Some(report.id.clone())
        );

        repo.soft_delete(&report.id, Utc::now()).await.expect("delete");
        assert_eq!(repo.find_report_for_expense(&expense).await.expect("lookup"), None);
        assert!(repo.find_by_id(&report.id).await.expect("find").is_none());
    }

    #[tokio::test]
    async fn list_by_user_pages_newest_first_and_filters_by_status() {
        let repo = SqlReportRepository::new(setup().await);
        let older = draft();
        let mut submitted = draft();
        let deleted = draft();
        let foreign =
            ExpenseReport::new_draft(UserId("u-other".to_string()), None, "Offsite", None, "CLP");
        for report in [&older, &submitted, &deleted, &foreign] {
            repo.create(report).await.expect("create");
        }
        submitted.transition_to(ReportStatus::Submitted).expect("submit");
        repo.update_status(&submitted).await.expect("update status");
        repo.soft_delete(&deleted.id, Utc::now()).await.expect("delete");

        let owner = UserId("u-owner".to_string());
        let (all, total) = repo.list_by_user(&owner, &ReportFilter::default()).await.expect("list");
        assert_eq!(total, 2);
        let ids: Vec<_> = all.iter().map(|report| report.id.clone()).collect();
        assert_eq!(ids, vec![submitted.id.clone(), older.id.clone()]);

        let second_page = ReportFilter { limit: 1, offset: 1, ..ReportFilter::default() };
        let (page, total) = repo.list_by_user(&owner, &second_page).await.expect("page");
        assert_eq!(total, 2);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, older.id);

        let drafts = ReportFilter { status: Some(ReportStatus::Draft), ..ReportFilter::default() };
        let (page, total) = repo.list_by_user(&owner, &drafts).await.expect("drafts");
        assert_eq!(total, 1);
        assert_eq!(page[0].id, older.id);
    }

    #[tokio::test]
    async fn update_status_persists_lifecycle_dates() {
        let repo = SqlReportRepository::new(setup().await);
        let mut report = draft();
        repo.create(&report).await.expect("create");

        report.transition_to(ReportStatus::Submitted).expect("submit");
        report.transition_to(ReportStatus::Rejected).expect("reject");
        report.rejection_reason = Some("duplicate receipt".to_string());
        repo.update_status(&report).await.expect("update status");

        let found = repo.find_by_id(&report.id).await.expect("find").expect("exists");
        assert_eq!(found.status, ReportStatus::Rejected);
        assert!(found.submission_date.is_some());
        assert_eq!(found.rejection_reason.as_deref(), Some("duplicate receipt"));
    }

    #[tokio::test]
    async fn update_of_missing_report_is_not_found() {
        let repo = SqlReportRepository::new(setup().await);
        let error = repo.update(&draft()).await.expect_err("missing");
        assert!(matches!(error, RepositoryError::NotFound { entity: "report", .. }));
    }
}
