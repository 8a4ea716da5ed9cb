use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::expense::ExpenseId;
use crate::domain::policy::PolicyId;
use crate::domain::{string_id, RecordState, UserId};
use crate::errors::DomainError;

string_id!(ReportId, ReportItemId);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Draft,
    Submitted,
    UnderReview,
    Approved,
    Rejected,
    Paid,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Submitted => "submitted",
            Self::UnderReview => "under_review",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Paid => "paid",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "draft" => Some(Self::Draft),
            "submitted" => Some(Self::Submitted),
            "under_review" => Some(Self::UnderReview),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "paid" => Some(Self::Paid),
            _ => None,
        }
    }

    /// Legal report moves. Re-entering the current state is accepted so that
    /// recomputation after each decision stays idempotent.
    pub fn can_transition_to(self, next: ReportStatus) -> bool {
        use ReportStatus::{Approved, Draft, Paid, Rejected, Submitted, UnderReview};

        self == next
            || matches!(
                (self, next),
                (Draft, Submitted)
                    | (Submitted, UnderReview)
                    | (Submitted, Approved)
                    | (Submitted, Rejected)
                    | (UnderReview, Approved)
                    | (UnderReview, Rejected)
                    | (Approved, Paid)
            )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExpenseReport {
    pub id: ReportId,
    pub user_id: UserId,
    pub policy_id: Option<PolicyId>,
    pub title: String,
    pub description: Option<String>,
    pub status: ReportStatus,
    /// Sum of the attached expense amounts; recomputed whenever items change.
    pub total_amount: Decimal,
    pub currency: String,
    pub submission_date: Option<DateTime<Utc>>,
    pub approval_date: Option<DateTime<Utc>>,
    pub payment_date: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub state: RecordState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExpenseReport {
    pub fn new_draft(
        user_id: UserId,
        policy_id: Option<PolicyId>,
        title: impl Into<String>,
        description: Option<String>,
        currency: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ReportId::generate(),
            user_id,
            policy_id,
            title: title.into(),
            description,
            status: ReportStatus::Draft,
            total_amount: Decimal::ZERO,
            currency: currency.into(),
            submission_date: None,
            approval_date: None,
            payment_date: None,
            rejection_reason: None,
            state: RecordState::Active,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_editable(&self) -> bool {
        self.status == ReportStatus::Draft && self.state.is_active()
    }

    pub fn transition_to(&mut self, next: ReportStatus) -> Result<(), DomainError> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::InvalidReportTransition { from: self.status, to: next });
        }

        let now = Utc::now();
        if self.status != next {
            match next {
                ReportStatus::Submitted => self.submission_date = Some(now),
                ReportStatus::Approved => self.approval_date = Some(now),
                ReportStatus::Paid => self.payment_date = Some(now),
                _ => {}
            }
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}

/// Join row between a report and one of its expenses, ordered by `sequence_number`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpenseReportItem {
    pub id: ReportItemId,
    pub report_id: ReportId,
    pub expense_id: ExpenseId,
    pub sequence_number: u32,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::{ExpenseReport, ReportStatus};
    use crate::domain::UserId;
    use crate::errors::DomainError;

    fn draft() -> ExpenseReport {
        ExpenseReport::new_draft(UserId("u-owner".to_string()), None, "Q3 trip", None, "CLP")
    }

    #[test]
    fn happy_path_with_review_stamps_dates() {
        let mut report = draft();
        report.transition_to(ReportStatus::Submitted).expect("draft -> submitted");
        assert!(report.submission_date.is_some());

        report.transition_to(ReportStatus::UnderReview).expect("submitted -> under_review");
        report.transition_to(ReportStatus::Approved).expect("under_review -> approved");
        assert!(report.approval_date.is_some());

        report.transition_to(ReportStatus::Paid).expect("approved -> paid");
        assert!(report.payment_date.is_some());
    }

    #[test]
    fn rejection_is_reachable_from_open_states_only() {
        assert!(ReportStatus::Submitted.can_transition_to(ReportStatus::Rejected));
        assert!(ReportStatus::UnderReview.can_transition_to(ReportStatus::Rejected));
        assert!(!ReportStatus::Draft.can_transition_to(ReportStatus::Rejected));
        assert!(!ReportStatus::Approved.can_transition_to(ReportStatus::Rejected));
    }

    #[test]
    fn re_entering_current_state_is_a_no_op() {
        let mut report = draft();
        report.transition_to(ReportStatus::Submitted).expect("submit");
        report.transition_to(ReportStatus::Approved).expect("approve");
        let approved_at = report.approval_date;

        report.transition_to(ReportStatus::Approved).expect("approve again");
        assert_eq!(report.approval_date, approved_at);
    }

    #[test]
    fn draft_cannot_jump_to_approved() {
        let mut report = draft();
        let error = report.transition_to(ReportStatus::Approved).expect_err("draft -> approved");
        assert_eq!(
            error,
            DomainError::InvalidReportTransition {
                from: ReportStatus::Draft,
                to: ReportStatus::Approved
            }
        );
    }

    #[test]
    fn parse_accepts_stored_spelling_and_rejects_unknown() {
        assert_eq!(ReportStatus::parse(" UNDER_REVIEW "), Some(ReportStatus::UnderReview));
        assert_eq!(ReportStatus::parse("archived"), None);
    }
}
