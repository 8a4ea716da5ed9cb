use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::policy::Policy;
use crate::domain::{CategoryId, UserId};
use crate::rules::{PolicyRule, RuleAction, RuleType, DEFAULT_REJECT_MESSAGE};

/// The slice of an expense (or a whole report) that rule evaluation looks at.
///
/// Report-level checks carry no category, so category-scoped rules never
/// match them and routing falls back to the approver ranges.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpenseValidationInput {
    pub user_id: UserId,
    pub category_id: Option<CategoryId>,
    pub amount: Decimal,
    pub currency: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub field: String,
    pub message: String,
    pub severity: Severity,
}

impl Violation {
    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Error
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequirement {
    pub requires_approval: bool,
    /// Zero when no approval is required, otherwise at least 1.
    pub level: u32,
}

impl ApprovalRequirement {
    fn not_required() -> Self {
        Self::default()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproverInfo {
    pub user_id: UserId,
    pub level: u32,
    pub amount_min: Option<Decimal>,
    pub amount_max: Option<Decimal>,
}

/// Stateless evaluator over a loaded policy aggregate.
#[derive(Clone, Copy, Debug, Default)]
pub struct RuleEngine;

impl RuleEngine {
    pub fn new() -> Self {
        Self
    }

    /// Runs `limit` and `reject` rules for the expense category, highest priority first.
    pub fn validate_expense(
        &self,
        input: &ExpenseValidationInput,
        policy: &Policy,
    ) -> Vec<Violation> {
        applicable_rules(policy, input)
            .into_iter()
            .filter_map(|rule| match rule.rule_type {
                RuleType::Limit => limit_violation(rule, input.amount),
                RuleType::Reject => reject_violation(rule, input.amount),
                RuleType::RequireApproval | RuleType::AutoApprove => None,
            })
            .collect()
    }

    /// Decides whether the expense needs approval and at which level.
    ///
    /// A satisfied `auto_approve` rule wins over everything else. Otherwise the
    /// highest `approval_level` among satisfied `require_approval` rules is used,
    /// and when none fires the approver amount ranges decide.
    pub fn check_approval_required(
        &self,
        input: &ExpenseValidationInput,
        policy: &Policy,
    ) -> ApprovalRequirement {
        let rules = applicable_rules(policy, input);

        let auto_approved = rules
            .iter()
            .filter(|rule| rule.rule_type == RuleType::AutoApprove)
            .any(|rule| rule.condition.is_satisfied_by(input.amount));
        if auto_approved {
            return ApprovalRequirement::not_required();
        }

        let mut requirement = ApprovalRequirement::not_required();
        for rule in rules.iter().filter(|rule| rule.rule_type == RuleType::RequireApproval) {
            if rule.condition.is_satisfied_by(input.amount) {
                requirement.requires_approval = true;
                requirement.level = requirement.level.max(approval_level(&rule.action));
            }
        }

        if !requirement.requires_approval {
            for approver in policy.approvers.iter().filter(|approver| approver.covers(input.amount))
            {
                requirement.requires_approval = true;
                requirement.level = requirement.level.max(approver.level);
            }
        }

        if requirement.requires_approval && requirement.level == 0 {
            requirement.level = 1;
        }
        requirement
    }

    /// Every approver whose range covers the amount, ascending by level.
    ///
    /// Approvers sharing a level keep their configured order.
    pub fn get_approvers(
        &self,
        input: &ExpenseValidationInput,
        policy: &Policy,
    ) -> Vec<ApproverInfo> {
        let mut approvers: Vec<ApproverInfo> = policy
            .approvers
            .iter()
            .filter(|approver| approver.covers(input.amount))
            .map(|approver| ApproverInfo {
                user_id: approver.user_id.clone(),
                level: approver.level,
                amount_min: approver.amount_min,
                amount_max: approver.amount_max,
            })
            .collect();
        approvers.sort_by_key(|approver| approver.level);
        approvers
    }
}

/// Active rules for the input category, sorted by descending priority.
/// `sort_by` is stable, so equal priorities keep their stored order.
fn applicable_rules<'a>(policy: &'a Policy, input: &ExpenseValidationInput) -> Vec<&'a PolicyRule> {
    let mut rules: Vec<&PolicyRule> =
        policy.rules.iter().filter(|rule| rule.applies_to(input.category_id.as_ref())).collect();
    rules.sort_by(|left, right| right.priority.cmp(&left.priority));
    rules
}

fn limit_violation(rule: &PolicyRule, amount: Decimal) -> Option<Violation> {
    let max_amount = rule.condition.max_amount()?;
    if amount <= max_amount {
        return None;
    }

    Some(Violation {
        field: "amount".to_owned(),
        message: format!(
            "Amount {:.2} exceeds limit of {:.2} for this category",
            amount, max_amount
        ),
        severity: Severity::Error,
    })
}

fn reject_violation(rule: &PolicyRule, amount: Decimal) -> Option<Violation> {
    if !rule.condition.is_satisfied_by(amount) {
        return None;
    }

    let message = match &rule.action {
        RuleAction::RejectMessage { text } => text.clone(),
        RuleAction::None | RuleAction::ApprovalLevel { .. } => DEFAULT_REJECT_MESSAGE.to_owned(),
    };
    Some(Violation { field: "expense".to_owned(), message, severity: Severity::Error })
}

fn approval_level(action: &RuleAction) -> u32 {
    match action {
        RuleAction::ApprovalLevel { level } => *level,
        RuleAction::None | RuleAction::RejectMessage { .. } => 1,
    }
}
