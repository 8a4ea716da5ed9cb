//! Typed policy rules and the engine that evaluates them.
//!
//! Rule conditions and actions are stored as JSON objects. They are parsed into
//! closed variants when a rule is created or loaded, so evaluation never has to
//! guess at the meaning of an unexpected payload.

mod engine;

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::policy::{amount_in_range, PolicyId};
use crate::domain::{string_id, CategoryId};

pub use engine::{ApprovalRequirement, ApproverInfo, ExpenseValidationInput, RuleEngine, Severity, Violation};

string_id!(PolicyRuleId);

pub const DEFAULT_REJECT_MESSAGE: &str = "Expense rejected by policy rule";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Limit,
    Reject,
    RequireApproval,
    AutoApprove,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Limit => "limit",
            Self::Reject => "reject",
            Self::RequireApproval => "require_approval",
            Self::AutoApprove => "auto_approve",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "limit" => Some(Self::Limit),
            "reject" => Some(Self::Reject),
            "require_approval" => Some(Self::RequireApproval),
            "auto_approve" => Some(Self::AutoApprove),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RuleConfigError {
    #[error("unknown rule type `{0}`")]
    UnknownRuleType(String),
    #[error("rule {field} must be a JSON object or null, got `{value}`")]
    NotAnObject { field: &'static str, value: String },
    #[error("unknown rule {field} key `{key}`")]
    UnknownKey { field: &'static str, key: String },
    #[error("`{key}` must be a decimal amount, got `{value}`")]
    InvalidAmount { key: &'static str, value: String },
    #[error("min_amount {min} is above max_amount {max}")]
    InvertedRange { min: Decimal, max: Decimal },
    #[error("`approval_level` must be a positive integer, got `{0}`")]
    InvalidApprovalLevel(String),
    #[error("`message` must be a non-empty string")]
    InvalidMessage,
    #[error("rule action may carry either `message` or `approval_level`, not both")]
    ConflictingAction,
    #[error("`{rule_type}` rule cannot carry action `{action}`")]
    ActionNotAllowed { rule_type: &'static str, action: &'static str },
    #[error("limit rule requires `max_amount` in its condition")]
    LimitWithoutMax,
}

/// When a rule applies. An absent condition always holds.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleCondition {
    #[default]
    Always,
    AmountRange { min: Option<Decimal>, max: Option<Decimal> },
}

impl RuleCondition {
    pub fn from_json(value: &Value) -> Result<Self, RuleConfigError> {
        let Some(object) = as_object("condition", value)? else {
            return Ok(Self::Always);
        };

        let mut min = None;
        let mut max = None;
        for (key, raw) in object {
            match key.as_str() {
                "min_amount" => min = Some(parse_amount("min_amount", raw)?),
                "max_amount" => max = Some(parse_amount("max_amount", raw)?),
                other => {
                    return Err(RuleConfigError::UnknownKey {
                        field: "condition",
                        key: other.to_owned(),
                    })
                }
            }
        }

        match (min, max) {
            (None, None) => Ok(Self::Always),
            (Some(min), Some(max)) if min > max => Err(RuleConfigError::InvertedRange { min, max }),
            (min, max) => Ok(Self::AmountRange { min, max }),
        }
    }

    pub fn to_json(&self) -> Value {
        let mut object = Map::new();
        if let Self::AmountRange { min, max } = self {
            if let Some(min) = min {
                object.insert("min_amount".to_owned(), Value::String(min.to_string()));
            }
            if let Some(max) = max {
                object.insert("max_amount".to_owned(), Value::String(max.to_string()));
            }
        }
        Value::Object(object)
    }

    pub fn is_satisfied_by(&self, amount: Decimal) -> bool {
        match self {
            Self::Always => true,
            Self::AmountRange { min, max } => amount_in_range(amount, *min, *max),
        }
    }

    pub fn max_amount(&self) -> Option<Decimal> {
        match self {
            Self::Always => None,
            Self::AmountRange { max, .. } => *max,
        }
    }
}

/// What a rule does once its condition holds.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleAction {
    #[default]
    None,
    RejectMessage { text: String },
    ApprovalLevel { level: u32 },
}

impl RuleAction {
    pub fn from_json(value: &Value) -> Result<Self, RuleConfigError> {
        let Some(object) = as_object("action", value)? else {
            return Ok(Self::None);
        };

        let mut action = Self::None;
        for (key, raw) in object {
            let parsed = match key.as_str() {
                "message" => match raw.as_str().map(str::trim) {
                    Some(text) if !text.is_empty() => {
                        Self::RejectMessage { text: text.to_owned() }
                    }
                    _ => return Err(RuleConfigError::InvalidMessage),
                },
                "approval_level" => {
                    let level = raw
                        .as_u64()
                        .and_then(|level| u32::try_from(level).ok())
                        .filter(|level| *level > 0)
                        .ok_or_else(|| RuleConfigError::InvalidApprovalLevel(raw.to_string()))?;
                    Self::ApprovalLevel { level }
                }
                other => {
                    return Err(RuleConfigError::UnknownKey {
                        field: "action",
                        key: other.to_owned(),
                    })
                }
            };

            if action != Self::None {
                return Err(RuleConfigError::ConflictingAction);
            }
            action = parsed;
        }

        Ok(action)
    }

    pub fn to_json(&self) -> Value {
        let mut object = Map::new();
        match self {
            Self::None => {}
            Self::RejectMessage { text } => {
                object.insert("message".to_owned(), Value::String(text.clone()));
            }
            Self::ApprovalLevel { level } => {
                object.insert("approval_level".to_owned(), Value::from(*level));
            }
        }
        Value::Object(object)
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::RejectMessage { .. } => "message",
            Self::ApprovalLevel { .. } => "approval_level",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: PolicyRuleId,
    pub policy_id: PolicyId,
    pub category_id: CategoryId,
    pub rule_type: RuleType,
    pub condition: RuleCondition,
    pub action: RuleAction,
    /// Higher priorities are evaluated first.
    pub priority: i32,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Raw storage shape of a rule, before its payloads are validated.
#[derive(Clone, Debug, PartialEq)]
pub struct RuleParts<'a> {
    pub rule_type: &'a str,
    pub condition: Option<&'a Value>,
    pub action: Option<&'a Value>,
}

impl PolicyRule {
    /// Builds a rule from its stored representation, rejecting payloads that
    /// do not fit the rule type.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        id: PolicyRuleId,
        policy_id: PolicyId,
        category_id: CategoryId,
        parts: RuleParts<'_>,
        priority: i32,
        active: bool,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Result<Self, RuleConfigError> {
        let rule_type = RuleType::parse(parts.rule_type)
            .ok_or_else(|| RuleConfigError::UnknownRuleType(parts.rule_type.to_owned()))?;
        let condition = parts.condition.map(RuleCondition::from_json).transpose()?.unwrap_or_default();
        let action = parts.action.map(RuleAction::from_json).transpose()?.unwrap_or_default();

        let rule = Self {
            id,
            policy_id,
            category_id,
            rule_type,
            condition,
            action,
            priority,
            active,
            created_at,
            updated_at,
        };
        rule.validate()?;
        Ok(rule)
    }

    /// Checks that condition and action make sense for the rule type.
    pub fn validate(&self) -> Result<(), RuleConfigError> {
        let action_allowed = match self.rule_type {
            RuleType::Limit | RuleType::AutoApprove => matches!(self.action, RuleAction::None),
            RuleType::Reject => {
                matches!(self.action, RuleAction::None | RuleAction::RejectMessage { .. })
            }
            RuleType::RequireApproval => {
                matches!(self.action, RuleAction::None | RuleAction::ApprovalLevel { .. })
            }
        };
        if !action_allowed {
            return Err(RuleConfigError::ActionNotAllowed {
                rule_type: self.rule_type.as_str(),
                action: self.action.kind(),
            });
        }

        if self.rule_type == RuleType::Limit && self.condition.max_amount().is_none() {
            return Err(RuleConfigError::LimitWithoutMax);
        }

        Ok(())
    }

    pub fn applies_to(&self, category_id: Option<&CategoryId>) -> bool {
        self.active && category_id == Some(&self.category_id)
    }
}

fn as_object<'a>(
    field: &'static str,
    value: &'a Value,
) -> Result<Option<&'a Map<String, Value>>, RuleConfigError> {
    match value {
        Value::Null => Ok(None),
        Value::Object(object) => Ok(Some(object)),
        other => Err(RuleConfigError::NotAnObject { field, value: other.to_string() }),
    }
}

fn parse_amount(key: &'static str, value: &Value) -> Result<Decimal, RuleConfigError> {
    let text = match value {
        Value::Number(number) => number.to_string(),
        Value::String(text) => text.trim().to_owned(),
        other => {
            return Err(RuleConfigError::InvalidAmount { key, value: other.to_string() });
        }
    };

    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|_| RuleConfigError::InvalidAmount { key, value: value.to_string() })
}
