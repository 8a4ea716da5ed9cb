use std::sync::Arc;

use expensa_core::config::{AppConfig, ConfigError, LoadOptions};
use expensa_core::notifications::{NotificationSink, TracingNotificationSink};
use expensa_db::{connect_with_config, migrations, DbPool};
use expensa_workflow::{EscalationScheduler, Repositories, WorkflowEngine};
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub repositories: Repositories,
    pub notifications: Arc<dyn NotificationSink>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}

impl Application {
    pub fn escalation_scheduler(&self) -> EscalationScheduler {
        EscalationScheduler::new(
            WorkflowEngine::new(self.repositories.clone(), self.notifications.clone()),
            self.repositories.approvals.clone(),
            &self.config.escalation,
        )
    }
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool =
        connect_with_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        max_connections = config.database.max_connections,
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    Ok(Application {
        repositories: Repositories::sql(db_pool.clone()),
        notifications: Arc::new(TracingNotificationSink),
        config,
        db_pool,
    })
}
