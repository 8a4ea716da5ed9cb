use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use expensa_core::domain::policy::{
    Policy, PolicyApprover, PolicyApproverId, PolicyId, PolicySubmitter, PolicySubmitterId,
};
use expensa_core::domain::{CategoryId, RecordState, UserId};
use expensa_core::rules::{PolicyRule, PolicyRuleId, RuleParts};

use super::{
    decode_error, decode_level, decode_optional_decimal, decode_optional_timestamp,
    decode_timestamp, encode_timestamp, PolicyRepository, RepositoryError,
};
use crate::DbPool;

pub struct SqlPolicyRepository {
    pool: DbPool,
}

impl SqlPolicyRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn load_rules(&self, policy_id: &PolicyId) -> Result<Vec<PolicyRule>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, category_id, rule_type, condition_json, action_json, priority, active,
                    created_at, updated_at
             FROM policy_rule WHERE policy_id = ?
             ORDER BY created_at ASC, rowid ASC",
        )
        .bind(policy_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| row_to_rule(policy_id, row)).collect()
    }

    async fn load_approvers(
        &self,
        policy_id: &PolicyId,
    ) -> Result<Vec<PolicyApprover>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, user_id, level, amount_min, amount_max, created_at
             FROM policy_approver WHERE policy_id = ?
             ORDER BY level ASC, created_at ASC, rowid ASC",
        )
        .bind(policy_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<PolicyApprover, RepositoryError> {
                let created_at: String = row.try_get("created_at").map_err(decode_error)?;
                Ok(PolicyApprover {
                    id: PolicyApproverId(row.try_get("id").map_err(decode_error)?),
                    policy_id: policy_id.clone(),
                    user_id: UserId(row.try_get("user_id").map_err(decode_error)?),
                    level: decode_level(row.try_get("level").map_err(decode_error)?)?,
                    amount_min: decode_optional_decimal(
                        "amount_min",
                        row.try_get("amount_min").map_err(decode_error)?,
                    )?,
                    amount_max: decode_optional_decimal(
                        "amount_max",
                        row.try_get("amount_max").map_err(decode_error)?,
                    )?,
                    created_at: decode_timestamp("created_at", &created_at)?,
                })
            })
            .collect()
    }

    async fn load_submitters(
        &self,
        policy_id: &PolicyId,
    ) -> Result<Vec<PolicySubmitter>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, user_id, role_id, department, created_at
             FROM policy_submitter WHERE policy_id = ?
             ORDER BY created_at ASC, rowid ASC",
        )
        .bind(policy_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<PolicySubmitter, RepositoryError> {
                let created_at: String = row.try_get("created_at").map_err(decode_error)?;
                Ok(PolicySubmitter {
                    id: PolicySubmitterId(row.try_get("id").map_err(decode_error)?),
                    policy_id: policy_id.clone(),
                    user_id: UserId(row.try_get("user_id").map_err(decode_error)?),
                    role_id: row.try_get("role_id").map_err(decode_error)?,
                    department: row.try_get("department").map_err(decode_error)?,
                    created_at: decode_timestamp("created_at", &created_at)?,
                })
            })
            .collect()
    }
}

fn parse_json(column: &str, raw: Option<String>) -> Result<Option<serde_json::Value>, RepositoryError> {
    raw.map(|raw| {
        serde_json::from_str(&raw)
            .map_err(|error| RepositoryError::Decode(format!("{column} `{raw}`: {error}")))
    })
    .transpose()
}

fn row_to_rule(policy_id: &PolicyId, row: &SqliteRow) -> Result<PolicyRule, RepositoryError> {
    let id = PolicyRuleId(row.try_get("id").map_err(decode_error)?);
    let rule_type: String = row.try_get("rule_type").map_err(decode_error)?;
    let condition = parse_json("condition_json", row.try_get("condition_json").map_err(decode_error)?)?;
    let action = parse_json("action_json", row.try_get("action_json").map_err(decode_error)?)?;
    let created_at: String = row.try_get("created_at").map_err(decode_error)?;
    let updated_at: String = row.try_get("updated_at").map_err(decode_error)?;

    PolicyRule::from_parts(
        id.clone(),
        policy_id.clone(),
        CategoryId(row.try_get("category_id").map_err(decode_error)?),
        RuleParts { rule_type: &rule_type, condition: condition.as_ref(), action: action.as_ref() },
        row.try_get("priority").map_err(decode_error)?,
        row.try_get("active").map_err(decode_error)?,
        decode_timestamp("created_at", &created_at)?,
        decode_timestamp("updated_at", &updated_at)?,
    )
    .map_err(|error| RepositoryError::Decode(format!("policy rule `{id}`: {error}")))
}

#[async_trait::async_trait]
impl PolicyRepository for SqlPolicyRepository {
    async fn find_by_id(&self, id: &PolicyId) -> Result<Option<Policy>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, name, description, policy_type, active, config_json, created_by,
                    created_at, updated_at, deleted_at
             FROM policy WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let config_json: String = row.try_get("config_json").map_err(decode_error)?;
        let created_at: String = row.try_get("created_at").map_err(decode_error)?;
        let updated_at: String = row.try_get("updated_at").map_err(decode_error)?;
        let deleted_at = decode_optional_timestamp(
            "deleted_at",
            row.try_get("deleted_at").map_err(decode_error)?,
        )?;

        Ok(Some(Policy {
            id: id.clone(),
            name: row.try_get("name").map_err(decode_error)?,
            description: row.try_get("description").map_err(decode_error)?,
            policy_type: row.try_get("policy_type").map_err(decode_error)?,
            active: row.try_get("active").map_err(decode_error)?,
            config: parse_json("config_json", Some(config_json))?.unwrap_or_default(),
            created_by: UserId(row.try_get("created_by").map_err(decode_error)?),
            rules: self.load_rules(id).await?,
            approvers: self.load_approvers(id).await?,
            submitters: self.load_submitters(id).await?,
            state: RecordState::from_deleted_at(deleted_at),
            created_at: decode_timestamp("created_at", &created_at)?,
            updated_at: decode_timestamp("updated_at", &updated_at)?,
        }))
    }

    /// Upserts the policy row and replaces its rules, approvers and submitters
    /// in one transaction.
    async fn save(&self, policy: Policy) -> Result<(), RepositoryError> {
        policy.validate().map_err(|error| RepositoryError::Constraint(error.to_string()))?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO policy (id, name, description, policy_type, active, config_json,
                                 created_by, created_at, updated_at, deleted_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 description = excluded.description,
                 policy_type = excluded.policy_type,
                 active = excluded.active,
                 config_json = excluded.config_json,
                 updated_at = excluded.updated_at,
                 deleted_at = excluded.deleted_at",
        )
        .bind(policy.id.as_str())
        .bind(&policy.name)
        .bind(&policy.description)
        .bind(&policy.policy_type)
        .bind(policy.active)
        .bind(policy.config.to_string())
        .bind(policy.created_by.as_str())
        .bind(encode_timestamp(policy.created_at))
        .bind(encode_timestamp(policy.updated_at))
        .bind(policy.state.deleted_at().map(encode_timestamp))
        .execute(&mut *tx)
        .await?;

        for table in ["policy_rule", "policy_approver", "policy_submitter"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE policy_id = ?"))
                .bind(policy.id.as_str())
                .execute(&mut *tx)
                .await?;
        }

        for rule in &policy.rules {
            sqlx::query(
                "INSERT INTO policy_rule (id, policy_id, category_id, rule_type, condition_json,
                                          action_json, priority, active, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(rule.id.as_str())
            .bind(policy.id.as_str())
            .bind(rule.category_id.as_str())
            .bind(rule.rule_type.as_str())
            .bind(rule.condition.to_json().to_string())
            .bind(rule.action.to_json().to_string())
            .bind(rule.priority)
            .bind(rule.active)
            .bind(encode_timestamp(rule.created_at))
            .bind(encode_timestamp(rule.updated_at))
            .execute(&mut *tx)
            .await?;
        }

        for approver in &policy.approvers {
            sqlx::query(
                "INSERT INTO policy_approver (id, policy_id, user_id, level, amount_min,
                                              amount_max, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(approver.id.as_str())
            .bind(policy.id.as_str())
            .bind(approver.user_id.as_str())
            .bind(i64::from(approver.level))
            .bind(approver.amount_min.map(|amount| amount.to_string()))
            .bind(approver.amount_max.map(|amount| amount.to_string()))
            .bind(encode_timestamp(approver.created_at))
            .execute(&mut *tx)
            .await?;
        }

        for submitter in &policy.submitters {
            sqlx::query(
                "INSERT INTO policy_submitter (id, policy_id, user_id, role_id, department,
                                               created_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(submitter.id.as_str())
            .bind(policy.id.as_str())
            .bind(submitter.user_id.as_str())
            .bind(&submitter.role_id)
            .bind(&submitter.department)
            .bind(encode_timestamp(submitter.created_at))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;
    use serde_json::json;

    use expensa_core::domain::policy::{Policy, PolicyApprover, PolicyApproverId, PolicyId};
    use expensa_core::domain::{CategoryId, RecordState, UserId};
    use expensa_core::rules::{PolicyRule, PolicyRuleId, RuleAction, RuleCondition, RuleParts};

    use super::SqlPolicyRepository;
    use crate::repositories::{PolicyRepository, RepositoryError};
    use crate::{connect_with_settings, migrations, DbPool};

    async fn pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn travel_policy() -> Policy {
        let now = Utc::now();
        let policy_id = PolicyId("POL-travel".to_string());
        let limit = PolicyRule::from_parts(
            PolicyRuleId("R-limit".to_string()),
            policy_id.clone(),
            CategoryId("meals".to_string()),
            RuleParts {
                rule_type: "limit",
                condition: Some(&json!({ "max_amount": "50000" })),
                action: None,
            },
            10,
            true,
            now,
            now,
        )
        .expect("limit rule");
        let escalate = PolicyRule::from_parts(
            PolicyRuleId("R-approval".to_string()),
            policy_id.clone(),
            CategoryId("flights".to_string()),
            RuleParts {
                rule_type: "require_approval",
                condition: Some(&json!({ "min_amount": 300000 })),
                action: Some(&json!({ "approval_level": 2 })),
            },
            5,
            true,
            now,
            now,
        )
        .expect("approval rule");

        Policy {
            id: policy_id.clone(),
            name: "Travel".to_string(),
            description: Some("Domestic travel".to_string()),
            policy_type: "travel".to_string(),
            active: true,
            config: json!({ "per_diem": 45000 }),
            created_by: UserId("u-admin".to_string()),
            rules: vec![limit, escalate],
            approvers: vec![
                PolicyApprover {
                    id: PolicyApproverId("PA-2".to_string()),
                    policy_id: policy_id.clone(),
                    user_id: UserId("u-b".to_string()),
                    level: 2,
                    amount_min: Some(Decimal::from(100_001)),
                    amount_max: None,
                    created_at: now,
                },
                PolicyApprover {
                    id: PolicyApproverId("PA-1".to_string()),
                    policy_id,
                    user_id: UserId("u-a".to_string()),
                    level: 1,
                    amount_min: Some(Decimal::ZERO),
                    amount_max: Some(Decimal::from(100_000)),
                    created_at: now,
                },
            ],
            submitters: Vec::new(),
            state: RecordState::Active,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn save_and_load_aggregate_with_typed_rules() {
        let repo = SqlPolicyRepository::new(pool().await);
        let policy = travel_policy();
        repo.save(policy.clone()).await.expect("save");

        let loaded = repo.find_by_id(&policy.id).await.expect("find").expect("exists");
        assert_eq!(loaded.config, json!({ "per_diem": 45000 }));
        assert_eq!(loaded.rules.len(), 2);
        assert_eq!(
            loaded.rules[0].condition,
            RuleCondition::AmountRange { min: None, max: Some(Decimal::from(50_000)) }
        );
        assert_eq!(loaded.rules[1].action, RuleAction::ApprovalLevel { level: 2 });

        let levels: Vec<u32> = loaded.approvers.iter().map(|approver| approver.level).collect();
        assert_eq!(levels, vec![1, 2]);
        assert_eq!(loaded.approvers[1].amount_max, None);
    }

    #[tokio::test]
    async fn save_replaces_children() {
        let repo = SqlPolicyRepository::new(pool().await);
        let mut policy = travel_policy();
        repo.save(policy.clone()).await.expect("save");

        policy.rules.truncate(1);
        policy.approvers.retain(|approver| approver.level == 1);
        repo.save(policy.clone()).await.expect("resave");

        let loaded = repo.find_by_id(&policy.id).await.expect("find").expect("exists");
        assert_eq!(loaded.rules.len(), 1);
        assert_eq!(loaded.approvers.len(), 1);
    }

    #[tokio::test]
    async fn soft_deleted_policy_is_absent() {
        let repo = SqlPolicyRepository::new(pool().await);
        let mut policy = travel_policy();
        policy.state = RecordState::Deleted { at: Utc::now() };
        repo.save(policy.clone()).await.expect("save");

        assert!(repo.find_by_id(&policy.id).await.expect("find").is_none());
    }

    #[tokio::test]
    async fn save_rejects_invalid_approver_level() {
        let repo = SqlPolicyRepository::new(pool().await);
        let mut policy = travel_policy();
        policy.approvers[0].level = 0;

        let error = repo.save(policy).await.expect_err("level 0 rejected");
        assert!(matches!(error, RepositoryError::Constraint(_)));
    }

    #[tokio::test]
    async fn malformed_stored_rule_is_a_decode_error() {
        let pool = pool().await;
        let repo = SqlPolicyRepository::new(pool.clone());
        let policy = travel_policy();
        repo.save(policy.clone()).await.expect("save");

        sqlx::query("UPDATE policy_rule SET condition_json = ? WHERE id = 'R-limit'")
            .bind(r#"{"max_amount": "lots"}"#)
            .execute(&pool)
            .await
            .expect("corrupt rule");

        let error = repo.find_by_id(&policy.id).await.expect_err("malformed rule");
        assert!(matches!(error, RepositoryError::Decode(ref message) if message.contains("R-limit")));
    }
}
