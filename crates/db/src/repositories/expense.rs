use sqlx::Row;

use expensa_core::domain::expense::{Expense, ExpenseId};
use expensa_core::domain::{CategoryId, UserId};

use super::{
    decode_decimal, decode_error, decode_timestamp, encode_timestamp, ExpenseRepository,
    RepositoryError,
};
use crate::DbPool;

pub struct SqlExpenseRepository {
    pool: DbPool,
}

impl SqlExpenseRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ExpenseRepository for SqlExpenseRepository {
    async fn find_by_id(&self, id: &ExpenseId) -> Result<Option<Expense>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, user_id, category_id, amount, currency, description, created_at
             FROM expense WHERE id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let amount: String = row.try_get("amount").map_err(decode_error)?;
        let created_at: String = row.try_get("created_at").map_err(decode_error)?;
        Ok(Some(Expense {
            id: ExpenseId(row.try_get("id").map_err(decode_error)?),
            user_id: UserId(row.try_get("user_id").map_err(decode_error)?),
            category_id: CategoryId(row.try_get("category_id").map_err(decode_error)?),
            amount: decode_decimal("amount", &amount)?,
            currency: row.try_get("currency").map_err(decode_error)?,
            description: row.try_get("description").map_err(decode_error)?,
            created_at: decode_timestamp("created_at", &created_at)?,
        }))
    }

    async fn save(&self, expense: Expense) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO expense (id, user_id, category_id, amount, currency, description, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 category_id = excluded.category_id,
                 amount = excluded.amount,
                 currency = excluded.currency,
                 description = excluded.description",
        )
        .bind(expense.id.as_str())
        .bind(expense.user_id.as_str())
        .bind(expense.category_id.as_str())
        .bind(expense.amount.to_string())
        .bind(&expense.currency)
        .bind(&expense.description)
        .bind(encode_timestamp(expense.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
