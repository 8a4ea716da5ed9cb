use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use expensa_core::config::EscalationConfig;
use expensa_db::repositories::ApprovalRepository;

use crate::engine::WorkflowEngine;
use crate::error::{PersistenceContext, WorkflowError};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EscalationSummary {
    pub examined: usize,
    pub escalated: usize,
    pub failed: usize,
}

/// Periodically escalates approvals left pending past the staleness threshold.
#[derive(Clone)]
pub struct EscalationScheduler {
    engine: WorkflowEngine,
    approvals: Arc<dyn ApprovalRepository>,
    stale_after_hours: u32,
    interval: Duration,
}

impl EscalationScheduler {
    pub fn new(
        engine: WorkflowEngine,
        approvals: Arc<dyn ApprovalRepository>,
        config: &EscalationConfig,
    ) -> Self {
        Self {
            engine,
            approvals,
            stale_after_hours: config.stale_after_hours,
            interval: Duration::from_secs(config.interval_secs),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One pass over every stale approval.
    pub async fn run_once(&self) -> Result<EscalationSummary, WorkflowError> {
        let (_, stop) = watch::channel(false);
        self.tick(&stop).await
    }

    /// Starts the loop on the runtime. The first tick runs immediately.
    pub fn spawn(self) -> SchedulerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(stop_rx));
        SchedulerHandle { stop_tx, task }
    }

    async fn run(self, mut stop: watch::Receiver<bool>) {
        info!(
            event_name = "scheduler.started",
            correlation_id = "scheduler",
            stale_after_hours = self.stale_after_hours,
            interval_secs = self.interval.as_secs(),
            "escalation scheduler started"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(error) = self.tick(&stop).await {
                        error!(
                            event_name = "scheduler.tick.failed",
                            correlation_id = "scheduler",
                            error = %error,
                            "escalation tick could not list stale approvals"
                        );
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
            if *stop.borrow() {
                break;
            }
        }

        info!(
            event_name = "scheduler.stopped",
            correlation_id = "scheduler",
            "escalation scheduler stopped"
        );
    }

    /// Escalates stale approvals one at a time. A failed escalation is logged and
    /// skipped; a stop request is honoured between approvals.
    async fn tick(&self, stop: &watch::Receiver<bool>) -> Result<EscalationSummary, WorkflowError> {
        let stale = self
            .approvals
            .list_stale(self.stale_after_hours)
            .await
            .during("approval.list_stale")?;

        let mut summary = EscalationSummary::default();
        for approval in &stale {
            if *stop.borrow() {
                warn!(
                    event_name = "scheduler.tick.interrupted",
                    correlation_id = "scheduler",
                    remaining = stale.len() - summary.examined,
                    "stop requested; leaving remaining approvals for the next run"
                );
                break;
            }

            summary.examined += 1;
            match self.engine.escalate_approval(&approval.id).await {
                Ok(replacement) => {
                    summary.escalated += 1;
                    info!(
                        event_name = "scheduler.approval.escalated",
                        correlation_id = %approval.id,
                        approval_id = %approval.id,
                        replacement_id = %replacement.id,
                        report_id = %approval.report_id,
                        "stale approval escalated"
                    );
                }
                Err(error) => {
                    summary.failed += 1;
                    warn!(
                        event_name = "scheduler.approval.failed",
                        correlation_id = %approval.id,
                        approval_id = %approval.id,
                        report_id = %approval.report_id,
                        error_kind = error.kind().as_str(),
                        error = %error,
                        "stale approval could not be escalated"
                    );
                }
            }
        }

        info!(
            event_name = "scheduler.tick.completed",
            correlation_id = "scheduler",
            examined = summary.examined,
            escalated = summary.escalated,
            failed = summary.failed,
            "escalation tick completed"
        );
        Ok(summary)
    }
}

pub struct SchedulerHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signals the loop and waits for the in-flight approval, if any, to finish.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(error) = self.task.await {
            error!(
                event_name = "scheduler.join_failed",
                correlation_id = "scheduler",
                error = %error,
                "escalation scheduler task ended abnormally"
            );
        }
    }
}
