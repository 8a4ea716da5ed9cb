use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{string_id, RecordState, UserId};
use crate::errors::DomainError;
use crate::rules::PolicyRule;

string_id!(PolicyId, PolicyApproverId, PolicySubmitterId);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: PolicyId,
    pub name: String,
    pub description: Option<String>,
    /// Free-form classification such as `travel`, `daily` or `project`.
    pub policy_type: String,
    pub active: bool,
    pub config: serde_json::Value,
    pub created_by: UserId,
    pub rules: Vec<PolicyRule>,
    pub approvers: Vec<PolicyApprover>,
    pub submitters: Vec<PolicySubmitter>,
    pub state: RecordState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Policy {
    /// Checks the structural invariants a policy must satisfy before it is stored.
    pub fn validate(&self) -> Result<(), DomainError> {
        for approver in &self.approvers {
            if approver.policy_id != self.id {
                return Err(DomainError::InvariantViolation(format!(
                    "approver `{}` belongs to policy `{}`, not `{}`",
                    approver.id, approver.policy_id, self.id
                )));
            }
            approver.validate()?;
        }

        for rule in &self.rules {
            if rule.policy_id != self.id {
                return Err(DomainError::InvariantViolation(format!(
                    "rule `{}` belongs to policy `{}`, not `{}`",
                    rule.id, rule.policy_id, self.id
                )));
            }
            rule.validate()?;
        }

        Ok(())
    }
}

/// A user allowed to approve at `level`, optionally restricted to an amount range.
///
/// Open bounds are unbounded. Ranges of different approvers may overlap; every approver
/// whose range covers an amount takes part in the chain for that amount.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyApprover {
    pub id: PolicyApproverId,
    pub policy_id: PolicyId,
    pub user_id: UserId,
    pub level: u32,
    pub amount_min: Option<Decimal>,
    pub amount_max: Option<Decimal>,
    pub created_at: DateTime<Utc>,
}

impl PolicyApprover {
    pub fn covers(&self, amount: Decimal) -> bool {
        amount_in_range(amount, self.amount_min, self.amount_max)
    }

    fn validate(&self) -> Result<(), DomainError> {
        if self.level == 0 {
            return Err(DomainError::InvariantViolation(format!(
                "approver `{}` has level 0; levels start at 1",
                self.id
            )));
        }

        if let (Some(min), Some(max)) = (self.amount_min, self.amount_max) {
            if min > max {
                return Err(DomainError::InvariantViolation(format!(
                    "approver `{}` has amount_min {min} above amount_max {max}",
                    self.id
                )));
            }
        }

        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySubmitter {
    pub id: PolicySubmitterId,
    pub policy_id: PolicyId,
    pub user_id: UserId,
    pub role_id: Option<String>,
    pub department: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub(crate) fn amount_in_range(amount: Decimal, min: Option<Decimal>, max: Option<Decimal>) -> bool {
    if let Some(min) = min {
        if amount < min {
            return false;
        }
    }

    if let Some(max) = max {
        if amount > max {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::{Policy, PolicyApprover, PolicyApproverId, PolicyId};
    use crate::domain::{RecordState, UserId};
    use crate::errors::DomainError;

    fn approver(level: u32, min: Option<i64>, max: Option<i64>) -> PolicyApprover {
        PolicyApprover {
            id: PolicyApproverId("PA-1".to_string()),
            policy_id: PolicyId("POL-1".to_string()),
            user_id: UserId("u-approver".to_string()),
            level,
            amount_min: min.map(Decimal::from),
            amount_max: max.map(Decimal::from),
            created_at: Utc::now(),
        }
    }

    fn policy(approvers: Vec<PolicyApprover>) -> Policy {
        let now = Utc::now();
        Policy {
            id: PolicyId("POL-1".to_string()),
            name: "Travel".to_string(),
            description: None,
            policy_type: "travel".to_string(),
            active: true,
            config: serde_json::Value::Null,
            created_by: UserId("u-admin".to_string()),
            rules: Vec::new(),
            approvers,
            submitters: Vec::new(),
            state: RecordState::Active,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn open_ended_range_covers_large_amounts() {
        let approver = approver(2, Some(100_001), None);
        assert!(approver.covers(Decimal::from(150_000)));
        assert!(approver.covers(Decimal::from(100_001)));
        assert!(!approver.covers(Decimal::from(100_000)));
    }

    #[test]
    fn range_bounds_are_inclusive() {
        let approver = approver(1, Some(0), Some(100_000));
        assert!(approver.covers(Decimal::ZERO));
        assert!(approver.covers(Decimal::from(100_000)));
        assert!(!approver.covers(Decimal::new(10_000_001, 2)));
    }

    #[test]
    fn validate_rejects_level_zero() {
        let error = policy(vec![approver(0, None, None)]).validate().expect_err("level 0");
        assert!(matches!(error, DomainError::InvariantViolation(ref message) if message.contains("level 0")));
    }

    #[test]
    fn validate_rejects_inverted_range() {
        let error =
            policy(vec![approver(1, Some(500), Some(100))]).validate().expect_err("inverted");
        assert!(matches!(error, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn validate_accepts_non_contiguous_levels() {
        policy(vec![approver(1, None, None), approver(3, None, None)])
            .validate()
            .expect("levels need not be contiguous");
    }
}
