use std::sync::Arc;

use expensa_core::config::ConfigOverrides;
use expensa_core::errors::ApplicationError;
use expensa_core::notifications::TracingNotificationSink;
use expensa_db::{connect_with_config, migrations};
use expensa_workflow::{EscalationScheduler, Repositories, WorkflowEngine};

use crate::commands::{load_config, runtime, CommandResult};

/// Runs exactly one scheduler tick against the configured database.
///
/// Refuses to run on a schema with pending migrations.
pub fn run(stale_after_hours: Option<u32>) -> CommandResult {
    let overrides = ConfigOverrides { stale_after_hours, ..ConfigOverrides::default() };
    let config = match load_config("escalate", overrides) {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime("escalate") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        let pending = migrations::pending_versions(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;
        if !pending.is_empty() {
            pool.close().await;
            return Err((
                "migration_pending",
                format!("{} migration(s) pending; run `expensa migrate` first", pending.len()),
                5u8,
            ));
        }

        let repositories = Repositories::sql(pool.clone());
        let scheduler = EscalationScheduler::new(
            WorkflowEngine::new(repositories.clone(), Arc::new(TracingNotificationSink)),
            repositories.approvals,
            &config.escalation,
        );
        let summary = scheduler.run_once().await;
        pool.close().await;
        summary.map_err(|error| {
            let error_class = error.kind().as_str();
            let interface = ApplicationError::from(error).into_interface("cli-escalate");
            (error_class, format!("{} {interface}", interface.user_message()), 6u8)
        })
    });

    match result {
        Ok(summary) => CommandResult::success_with_details(
            "escalate",
            format!(
                "examined {} stale approval(s), escalated {}, failed {}",
                summary.examined, summary.escalated, summary.failed
            ),
            serde_json::to_value(summary).ok(),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("escalate", error_class, message, exit_code)
        }
    }
}
