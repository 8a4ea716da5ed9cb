use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;

use expensa_core::config::EscalationConfig;
use expensa_core::domain::approval::{Approval, ApprovalAction, ApprovalStatus};
use expensa_core::domain::expense::{Expense, ExpenseId};
use expensa_core::domain::policy::{Policy, PolicyApprover, PolicyApproverId, PolicyId};
use expensa_core::domain::report::{ExpenseReport, ReportId, ReportStatus};
use expensa_core::domain::{CategoryId, RecordState, UserId};
use expensa_core::notifications::{InMemoryNotificationSink, NotificationKind};
use expensa_core::rules::{PolicyRule, PolicyRuleId, RuleParts};
use expensa_workflow::{
    ApprovalService, ApproveDecision, ErrorKind, EscalationScheduler, NewReport, Repositories,
    ReportFilter, ReportService, WorkflowEngine, WorkflowError,
};

const POLICY: &str = "POL-travel";

fn user(id: &str) -> UserId {
    UserId(id.to_string())
}

fn approver(id: &str, user_id: &str, level: u32, min: i64, max: Option<i64>) -> PolicyApprover {
    PolicyApprover {
        id: PolicyApproverId(id.to_string()),
        policy_id: PolicyId(POLICY.to_string()),
        user_id: user(user_id),
        level,
        amount_min: Some(Decimal::from(min)),
        amount_max: max.map(Decimal::from),
        created_at: Utc::now(),
    }
}

/// Level 1 covers every amount (A); level 2 starts above 100000 (B).
fn two_level_policy() -> Policy {
    let now = Utc::now();
    Policy {
        id: PolicyId(POLICY.to_string()),
        name: "Travel".to_string(),
        description: None,
        policy_type: "travel".to_string(),
        active: true,
        config: serde_json::Value::Null,
        created_by: user("u-admin"),
        rules: Vec::new(),
        approvers: vec![
            approver("PA-1", "u-a", 1, 0, None),
            approver("PA-2", "u-b", 2, 100_001, None),
        ],
        submitters: Vec::new(),
        state: RecordState::Active,
        created_at: now,
        updated_at: now,
    }
}

struct Harness {
    repositories: Repositories,
    sink: InMemoryNotificationSink,
    reports: ReportService,
    approvals: ApprovalService,
    engine: WorkflowEngine,
}

impl Harness {
    async fn new(policy: Policy) -> Self {
        Self::with_sink(policy, InMemoryNotificationSink::default()).await
    }

    async fn with_sink(policy: Policy, sink: InMemoryNotificationSink) -> Self {
        let repositories = Repositories::in_memory();
        repositories.policies.save(policy).await.expect("save policy");
        let notifications = Arc::new(sink.clone());
        Self {
            reports: ReportService::new(repositories.clone(), notifications.clone()),
            approvals: ApprovalService::new(repositories.clone(), notifications.clone()),
            engine: WorkflowEngine::new(repositories.clone(), notifications),
            repositories,
            sink,
        }
    }

    async fn expense(&self, id: &str, category: &str, amount: i64) -> ExpenseId {
        let expense = Expense {
            id: ExpenseId(id.to_string()),
            user_id: user("u-owner"),
            category_id: CategoryId(category.to_string()),
            amount: Decimal::from(amount),
            currency: "CLP".to_string(),
            description: None,
            created_at: Utc::now(),
        };
        self.repositories.expenses.save(expense.clone()).await.expect("save expense");
        expense.id
    }

    async fn draft(&self, amounts: &[i64]) -> ExpenseReport {
        let report = self
            .reports
            .create_report(
                &user("u-owner"),
                NewReport {
                    title: "Santiago offsite".to_string(),
                    description: None,
                    policy_id: Some(PolicyId(POLICY.to_string())),
                    currency: "CLP".to_string(),
                },
            )
            .await
            .expect("create report");

        let mut expense_ids = Vec::new();
        for (index, amount) in amounts.iter().enumerate() {
            let id = format!("{}-E{index}", report.id);
            expense_ids.push(self.expense(&id, "lodging", *amount).await);
        }
        self.reports
            .add_expenses(&report.id, &user("u-owner"), &expense_ids)
            .await
            .expect("add expenses");
        self.reports.get_report(&report.id).await.expect("reload")
    }

    async fn submitted(&self, amounts: &[i64]) -> (ExpenseReport, Vec<Approval>) {
        let draft = self.draft(amounts).await;
        self.reports.submit_report(&draft.id, &user("u-owner")).await.expect("submit")
    }

    async fn report_status(&self, report: &ExpenseReport) -> ReportStatus {
        self.reports.get_report(&report.id).await.expect("report").status
    }
}

#[tokio::test]
async fn two_level_report_gets_one_pending_approval_per_level() {
    let harness = Harness::new(two_level_policy()).await;
    let (report, approvals) = harness.submitted(&[90_000, 60_000]).await;

    assert_eq!(report.total_amount, Decimal::from(150_000));
    let chain: Vec<(String, u32, ApprovalStatus)> = approvals
        .iter()
        .map(|approval| (approval.approver_id.0.clone(), approval.level, approval.status))
        .collect();
    assert_eq!(
        chain,
        vec![
            ("u-a".to_string(), 1, ApprovalStatus::Pending),
            ("u-b".to_string(), 2, ApprovalStatus::Pending),
        ]
    );
    assert_eq!(harness.report_status(&report).await, ReportStatus::Submitted);
    assert_eq!(
        harness.sink.kinds(),
        vec![
            NotificationKind::ReportSubmitted,
            NotificationKind::ApprovalNeeded,
            NotificationKind::ApprovalNeeded,
        ]
    );
}

#[tokio::test]
async fn report_moves_to_under_review_then_approved_as_levels_clear() {
    let harness = Harness::new(two_level_policy()).await;
    let (report, approvals) = harness.submitted(&[150_000]).await;

    let status = harness
        .reports
        .approve_report(&approvals[0].id, &user("u-a"), ApproveDecision::default())
        .await
        .expect("level 1 approves");
    assert_eq!(status, ReportStatus::UnderReview);

    let status = harness
        .reports
        .approve_report(
            &approvals[1].id,
            &user("u-b"),
            ApproveDecision {
                comments: Some("ok".to_string()),
                approved_amount: Some(Decimal::from(150_000)),
            },
        )
        .await
        .expect("level 2 approves");
    assert_eq!(status, ReportStatus::Approved);

    let stored = harness.reports.get_report(&report.id).await.expect("report");
    assert!(stored.approval_date.is_some());
    let approved_notices = harness
        .sink
        .kinds()
        .into_iter()
        .filter(|kind| *kind == NotificationKind::ReportApproved)
        .count();
    assert_eq!(approved_notices, 1);
}

#[tokio::test]
async fn higher_level_deciding_first_waits_for_lower_level() {
    let harness = Harness::new(two_level_policy()).await;
    let (report, approvals) = harness.submitted(&[150_000]).await;

    let status = harness
        .reports
        .approve_report(&approvals[1].id, &user("u-b"), ApproveDecision::default())
        .await
        .expect("level 2 approves first");
    assert_eq!(status, ReportStatus::Submitted);

    harness
        .reports
        .approve_report(&approvals[0].id, &user("u-a"), ApproveDecision::default())
        .await
        .expect("level 1 approves");
    assert_eq!(harness.report_status(&report).await, ReportStatus::Approved);
}

#[tokio::test]
async fn rejection_at_any_level_rejects_the_report_immediately() {
    let harness = Harness::new(two_level_policy()).await;
    let (report, approvals) = harness.submitted(&[150_000]).await;

    let status = harness
        .reports
        .reject_report(&approvals[0].id, &user("u-a"), "duplicate hotel invoice")
        .await
        .expect("reject");
    assert_eq!(status, ReportStatus::Rejected);

    let stored = harness.reports.get_report(&report.id).await.expect("report");
    assert_eq!(stored.rejection_reason.as_deref(), Some("duplicate hotel invoice"));

    let all = harness.approvals.get_approvals_by_report(&report.id).await.expect("approvals");
    assert!(all.iter().any(|approval| approval.status == ApprovalStatus::Rejected));
    assert_eq!(all[1].status, ApprovalStatus::Pending);

    // The remaining approver can still act, but the report stays rejected.
    harness
        .reports
        .approve_report(&approvals[1].id, &user("u-b"), ApproveDecision::default())
        .await
        .expect("late approval");
    assert_eq!(harness.report_status(&report).await, ReportStatus::Rejected);
}

#[tokio::test]
async fn approving_twice_fails_without_duplicate_history() {
    let harness = Harness::new(two_level_policy()).await;
    let (_, approvals) = harness.submitted(&[50_000]).await;
    let approval = &approvals[0];

    harness
        .approvals
        .approve(&approval.id, &user("u-a"), ApproveDecision::default())
        .await
        .expect("first approve");
    let error = harness
        .approvals
        .approve(&approval.id, &user("u-a"), ApproveDecision::default())
        .await
        .expect_err("second approve");

    assert!(matches!(
        error,
        WorkflowError::ApprovalNotPending { status: ApprovalStatus::Approved, .. }
    ));
    let history = harness.approvals.get_approval_history(&approval.id).await.expect("history");
    let actions: Vec<ApprovalAction> = history.iter().map(|entry| entry.action).collect();
    assert_eq!(actions, vec![ApprovalAction::Created, ApprovalAction::Approved]);
}

#[tokio::test]
async fn decision_on_an_orphaned_approval_leaves_it_pending() {
    let harness = Harness::new(two_level_policy()).await;
    let orphan = Approval::pending(ReportId("R-gone".to_string()), user("u-a"), 1);
    harness.repositories.approvals.create(&orphan).await.expect("orphan approval");

    let error = harness
        .approvals
        .approve(&orphan.id, &user("u-a"), ApproveDecision::default())
        .await
        .expect_err("report missing");
    assert!(matches!(error, WorkflowError::ReportNotFound(_)));

    let stored = harness.repositories.approvals.find_by_id(&orphan.id).await.expect("find");
    assert_eq!(stored.map(|approval| approval.status), Some(ApprovalStatus::Pending));
    let history = harness.approvals.get_approval_history(&orphan.id).await.expect("history");
    assert!(history.is_empty());
}

#[tokio::test]
async fn only_the_assigned_approver_may_decide() {
    let harness = Harness::new(two_level_policy()).await;
    let (_, approvals) = harness.submitted(&[50_000]).await;

    let error = harness
        .approvals
        .reject(&approvals[0].id, &user("u-b"), "not mine")
        .await
        .expect_err("wrong approver");
    assert_eq!(error.kind(), ErrorKind::Unauthorized);

    let pending = harness.approvals.get_pending_approvals(&user("u-a")).await.expect("pending");
    assert_eq!(pending.len(), 1);
}

#[tokio::test]
async fn racing_decisions_on_one_approval_let_exactly_one_win() {
    let harness = Harness::new(two_level_policy()).await;
    let (_, approvals) = harness.submitted(&[50_000]).await;
    let approval_id = approvals[0].id.clone();
    let approver_a = user("u-a");
    let approver_c = user("u-c");

    let (approved, escalated) = tokio::join!(
        harness.approvals.approve(&approval_id, &approver_a, ApproveDecision::default()),
        harness.approvals.escalate(&approval_id, &approver_a, &approver_c, "on leave"),
    );

    assert_eq!(usize::from(approved.is_ok()) + usize::from(escalated.is_ok()), 1);
    let loser = approved.err().or(escalated.err()).expect("one side fails");
    assert!(matches!(loser, WorkflowError::ApprovalNotPending { .. }));

    let history = harness.approvals.get_approval_history(&approval_id).await.expect("history");
    assert_eq!(history.len(), 2);
}

#[tokio::test]
async fn manual_escalation_reassigns_within_the_same_level() {
    let harness = Harness::new(two_level_policy()).await;
    let (report, approvals) = harness.submitted(&[150_000]).await;

    let replacement = harness
        .approvals
        .escalate(&approvals[1].id, &user("u-b"), &user("u-c"), "travelling")
        .await
        .expect("escalate");
    assert_eq!(replacement.level, 2);
    assert_eq!(replacement.approver_id, user("u-c"));

    let original = harness.approvals.get_approval_history(&approvals[1].id).await.expect("history");
    assert_eq!(original.last().map(|entry| entry.action), Some(ApprovalAction::Escalated));
    let created = harness.approvals.get_approval_history(&replacement.id).await.expect("history");
    assert_eq!(
        created[0].metadata.get("escalated_from").map(String::as_str),
        Some(approvals[1].id.as_str())
    );

    let report_history = harness.approvals.get_history(&report.id).await.expect("report history");
    assert_eq!(report_history.len(), 4);
}

#[tokio::test]
async fn automatic_escalation_without_next_level_leaves_approval_pending() {
    let harness = Harness::new(two_level_policy()).await;
    let (_, approvals) = harness.submitted(&[150_000]).await;

    let error = harness.engine.escalate_approval(&approvals[1].id).await.expect_err("no level 3");
    assert!(matches!(error, WorkflowError::NoNextApprover { level: 2, .. }));
    assert_eq!(error.kind(), ErrorKind::EscalationExhausted);
    assert!(error.to_string().contains("no next approver found"));

    let stored = harness.approvals.get_approvals_by_report(&approvals[1].report_id).await.expect("list");
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(|approval| approval.status == ApprovalStatus::Pending));
}

#[tokio::test]
async fn automatic_escalation_moves_to_the_next_level() {
    let harness = Harness::new(two_level_policy()).await;
    let (report, approvals) = harness.submitted(&[150_000]).await;

    let mut policy = two_level_policy();
    policy.approvers.push(approver("PA-3", "u-cfo", 3, 100_001, None));
    harness.repositories.policies.save(policy).await.expect("add level 3");

    let next = harness.engine.get_next_approver(&report.id, 2).await.expect("lookup");
    assert_eq!(next.map(|info| info.user_id), Some(user("u-cfo")));

    let replacement = harness.engine.escalate_approval(&approvals[1].id).await.expect("escalate");
    assert_eq!(replacement.level, 3);

    let all = harness.approvals.get_approvals_by_report(&report.id).await.expect("list");
    let level_three: Vec<&Approval> = all.iter().filter(|approval| approval.level == 3).collect();
    assert_eq!(level_three.len(), 1);
    assert_eq!(level_three[0].status, ApprovalStatus::Pending);
    let escalated = all.iter().find(|approval| approval.id == approvals[1].id).expect("original");
    assert_eq!(escalated.status, ApprovalStatus::Escalated);
    assert_eq!(escalated.escalated_to, Some(user("u-cfo")));

    let history = harness.approvals.get_approval_history(&approvals[1].id).await.expect("history");
    let last = history.last().expect("escalation entry");
    assert!(last.actor_id.is_system());
    assert_eq!(last.comments.as_deref(), Some("automatic escalation"));

    assert_eq!(harness.engine.get_next_approver(&report.id, 3).await.expect("lookup"), None);
}

#[tokio::test]
async fn next_level_lookup_past_the_top_level_finds_nobody() {
    let harness = Harness::new(two_level_policy()).await;
    let (report, _) = harness.submitted(&[150_000]).await;

    let next = harness.engine.get_next_approver(&report.id, u32::MAX).await.expect("lookup");
    assert_eq!(next, None);
}

#[tokio::test]
async fn automatic_escalation_at_the_highest_level_is_exhausted() {
    let harness = Harness::new(two_level_policy()).await;
    let (report, _) = harness.submitted(&[150_000]).await;
    let top = Approval::pending(report.id.clone(), user("u-top"), u32::MAX);
    harness.repositories.approvals.create(&top).await.expect("top-level approval");

    let error = harness.engine.escalate_approval(&top.id).await.expect_err("no level above");
    assert!(matches!(error, WorkflowError::NoNextApprover { level: u32::MAX, .. }));

    let stored = harness.repositories.approvals.find_by_id(&top.id).await.expect("find");
    assert_eq!(stored.map(|approval| approval.status), Some(ApprovalStatus::Pending));
}

#[tokio::test]
async fn automatic_escalation_skips_reports_that_are_already_decided() {
    let mut policy = two_level_policy();
    policy.approvers.push(approver("PA-3", "u-cfo", 3, 100_001, None));
    let harness = Harness::new(policy).await;
    let (report, approvals) = harness.submitted(&[150_000]).await;
    harness
        .reports
        .reject_report(&approvals[0].id, &user("u-a"), "missing receipts")
        .await
        .expect("reject");

    let error = harness.engine.escalate_approval(&approvals[1].id).await.expect_err("closed");
    assert!(matches!(error, WorkflowError::ReportClosed { status: ReportStatus::Rejected, .. }));
    assert_eq!(error.kind(), ErrorKind::InvalidState);

    let all = harness.approvals.get_approvals_by_report(&report.id).await.expect("list");
    assert_eq!(all.len(), 2);
    assert_eq!(all[1].status, ApprovalStatus::Pending);
    assert!(!harness.sink.kinds().contains(&NotificationKind::ApprovalEscalated));
}

#[tokio::test]
async fn escalated_rows_do_not_block_final_approval() {
    let harness = Harness::new(two_level_policy()).await;
    let (report, approvals) = harness.submitted(&[50_000]).await;

    let replacement = harness
        .approvals
        .escalate(&approvals[0].id, &user("u-a"), &user("u-c"), "out of office")
        .await
        .expect("escalate");
    let status = harness
        .reports
        .approve_report(&replacement.id, &user("u-c"), ApproveDecision::default())
        .await
        .expect("approve replacement");

    assert_eq!(status, ReportStatus::Approved);
    assert_eq!(harness.report_status(&report).await, ReportStatus::Approved);
}

#[tokio::test]
async fn processing_a_pending_approval_is_refused() {
    let harness = Harness::new(two_level_policy()).await;
    let (_, approvals) = harness.submitted(&[50_000]).await;

    let error = harness.engine.process_approval(&approvals[0]).await.expect_err("still pending");
    assert!(matches!(error, WorkflowError::ApprovalNotCompleted { .. }));
}

#[tokio::test]
async fn submission_requires_policy_items_and_coverage() {
    let harness = Harness::new(two_level_policy()).await;
    let owner = user("u-owner");

    let unassigned = harness
        .reports
        .create_report(
            &owner,
            NewReport {
                title: "No policy".to_string(),
                description: None,
                policy_id: None,
                currency: "CLP".to_string(),
            },
        )
        .await
        .expect("create");
    let expense = harness.expense("E-unassigned", "lodging", 10_000).await;
    harness.reports.add_expenses(&unassigned.id, &owner, &[expense]).await.expect("add");
    assert!(!harness.reports.can_submit_report(&unassigned.id, &owner).await.expect("check"));
    let error = harness.reports.submit_report(&unassigned.id, &owner).await.expect_err("no policy");
    assert!(matches!(error, WorkflowError::NoPolicyAssigned(_)));
    assert_eq!(error.kind(), ErrorKind::PolicyConfiguration);

    let empty = harness.draft(&[]).await;
    let error = harness.reports.submit_report(&empty.id, &owner).await.expect_err("empty");
    assert!(matches!(error, WorkflowError::ReportEmpty(_)));

    let mut senior_only = two_level_policy();
    senior_only.approvers.retain(|approver| approver.level == 2);
    harness.repositories.policies.save(senior_only).await.expect("senior-only policy");
    let small = harness.draft(&[50_000]).await;
    let error = harness.reports.submit_report(&small.id, &owner).await.expect_err("uncovered");
    assert!(matches!(error, WorkflowError::NoApproversFound { .. }));
    assert_eq!(harness.report_status(&small).await, ReportStatus::Draft);
}

#[tokio::test]
async fn blocking_policy_violations_keep_the_report_in_draft() {
    let mut policy = two_level_policy();
    let now = Utc::now();
    policy.rules.push(
        PolicyRule::from_parts(
            PolicyRuleId("R-lodging-cap".to_string()),
            PolicyId(POLICY.to_string()),
            CategoryId("lodging".to_string()),
            RuleParts {
                rule_type: "limit",
                condition: Some(&json!({ "max_amount": 50000 })),
                action: None,
            },
            1,
            true,
            now,
            now,
        )
        .expect("limit rule"),
    );
    let harness = Harness::new(policy).await;
    let report = harness.draft(&[60_000]).await;

    let violations = harness.reports.validate_report(&report.id).await.expect("validate");
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].field, "amount");

    let error =
        harness.reports.submit_report(&report.id, &user("u-owner")).await.expect_err("violations");
    assert!(matches!(error, WorkflowError::PolicyViolations { .. }));
    assert_eq!(harness.report_status(&report).await, ReportStatus::Draft);
}

#[tokio::test]
async fn draft_editing_is_owner_only_and_stops_at_submission() {
    let harness = Harness::new(two_level_policy()).await;
    let owner = user("u-owner");
    let report = harness.draft(&[10_000, 5_000]).await;

    assert!(harness.reports.can_edit_report(&report.id, &owner).await.expect("check"));
    assert!(!harness.reports.can_delete_report(&report.id, &user("u-a")).await.expect("check"));

    let total = harness
        .reports
        .remove_expense(&report.id, &owner, &ExpenseId(format!("{}-E1", report.id)))
        .await
        .expect("remove");
    assert_eq!(total, Decimal::from(10_000));

    let missing = harness
        .reports
        .remove_expense(&report.id, &owner, &ExpenseId("E-elsewhere".to_string()))
        .await
        .expect_err("not attached");
    assert!(matches!(missing, WorkflowError::ExpenseNotInReport { .. }));

    let other = harness.draft(&[]).await;
    let taken = harness
        .reports
        .add_expenses(&other.id, &owner, &[ExpenseId(format!("{}-E0", report.id))])
        .await
        .expect_err("already attached");
    assert!(matches!(taken, WorkflowError::ExpenseAlreadyInReport { .. }));

    harness.reports.submit_report(&report.id, &owner).await.expect("submit");
    assert!(!harness.reports.can_edit_report(&report.id, &owner).await.expect("check"));
    let error = harness.reports.delete_report(&report.id, &owner).await.expect_err("submitted");
    assert!(matches!(error, WorkflowError::ReportNotEditable { .. }));
}

#[tokio::test]
async fn owners_list_their_own_reports_newest_first() {
    let harness = Harness::new(two_level_policy()).await;
    let owner = user("u-owner");
    let first = harness.draft(&[20_000]).await;
    let (second, _) = harness.submitted(&[30_000]).await;
    harness
        .reports
        .create_report(
            &user("u-other"),
            NewReport {
                title: "Someone else's trip".to_string(),
                description: None,
                policy_id: None,
                currency: "CLP".to_string(),
            },
        )
        .await
        .expect("foreign report");

    let unbounded = ReportFilter { limit: 0, ..ReportFilter::default() };
    let page = harness.reports.list_reports(&owner, unbounded).await.expect("list");
    assert_eq!(page.total, 2);
    assert_eq!(page.reports.len(), 2);
    assert!(page.reports.iter().all(|report| report.user_id == owner));
    assert!(page.reports[0].created_at >= page.reports[1].created_at);

    let submitted = ReportFilter { status: Some(ReportStatus::Submitted), ..ReportFilter::default() };
    let page = harness.reports.list_reports(&owner, submitted).await.expect("filtered");
    assert_eq!(page.total, 1);
    assert_eq!(page.reports[0].id, second.id);

    harness.reports.delete_report(&first.id, &owner).await.expect("delete draft");
    let page = harness.reports.list_reports(&owner, ReportFilter::default()).await.expect("list");
    assert_eq!(page.total, 1);
}

#[tokio::test]
async fn failing_notifications_never_fail_the_workflow() {
    let harness =
        Harness::with_sink(two_level_policy(), InMemoryNotificationSink::failing()).await;
    let (report, approvals) = harness.submitted(&[50_000]).await;

    harness
        .reports
        .approve_report(&approvals[0].id, &user("u-a"), ApproveDecision::default())
        .await
        .expect("approve despite sink failure");
    assert_eq!(harness.report_status(&report).await, ReportStatus::Approved);
}

async fn age(harness: &Harness, approval: &Approval, hours: i64) {
    let mut stale = approval.clone();
    stale.created_at = Utc::now() - chrono::Duration::hours(hours);
    harness.repositories.approvals.update(&stale).await.expect("age approval");
}

fn escalation_config() -> EscalationConfig {
    EscalationConfig { enabled: true, stale_after_hours: 24, interval_secs: 3600 }
}

#[tokio::test]
async fn scheduler_tick_escalates_what_it_can_and_skips_failures() {
    let harness = Harness::new(two_level_policy()).await;
    let (_, approvals) = harness.submitted(&[150_000]).await;
    age(&harness, &approvals[0], 30).await;
    age(&harness, &approvals[1], 30).await;

    let scheduler = EscalationScheduler::new(
        harness.engine.clone(),
        harness.repositories.approvals.clone(),
        &escalation_config(),
    );
    let summary = scheduler.run_once().await.expect("tick");

    assert_eq!(summary.examined, 2);
    assert_eq!(summary.escalated, 1);
    assert_eq!(summary.failed, 1);

    let level_one = harness
        .approvals
        .get_approval_history(&approvals[0].id)
        .await
        .expect("history");
    assert_eq!(level_one.last().map(|entry| entry.action), Some(ApprovalAction::Escalated));
    let second_pass = scheduler.run_once().await.expect("second tick");
    assert_eq!(second_pass.examined, 1);
}

#[tokio::test]
async fn spawned_scheduler_runs_immediately_and_stops_cleanly() {
    let harness = Harness::new(two_level_policy()).await;
    let (_, approvals) = harness.submitted(&[50_000]).await;
    age(&harness, &approvals[0], 48).await;

    let mut policy = two_level_policy();
    policy.approvers.push(approver("PA-1b", "u-lead", 2, 0, Some(100_000)));
    harness.repositories.policies.save(policy).await.expect("add level 2 cover");

    let handle = EscalationScheduler::new(
        harness.engine.clone(),
        harness.repositories.approvals.clone(),
        &escalation_config(),
    )
    .with_interval(Duration::from_secs(3600))
    .spawn();
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.stop().await;

    let pending = harness.approvals.get_pending_approvals(&user("u-lead")).await.expect("pending");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].level, 2);
}
