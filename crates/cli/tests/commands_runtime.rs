use std::env;
use std::sync::{Mutex, OnceLock};

use expensa_cli::commands::{config, doctor, escalate, migrate};
use serde_json::Value;
use tempfile::TempDir;

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(&[("EXPENSA_DATABASE_URL", "sqlite::memory:")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
        assert_eq!(payload["message"], "applied 1 pending migration(s)");
    });
}

#[test]
fn migrate_returns_config_failure_for_non_sqlite_url() {
    with_env(&[("EXPENSA_DATABASE_URL", "postgres://localhost/expensa")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn escalate_refuses_to_run_before_migrations() {
    with_env(&[("EXPENSA_DATABASE_URL", "sqlite::memory:")], || {
        let result = escalate::run(None);
        assert_eq!(result.exit_code, 5);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "escalate");
        assert_eq!(payload["error_class"], "migration_pending");
    });
}

#[test]
fn escalate_prints_summary_after_migrate() {
    let dir = TempDir::new().expect("temp dir");
    let url = format!("sqlite://{}", dir.path().join("expensa.db").display());

    with_env(&[("EXPENSA_DATABASE_URL", url.as_str())], || {
        assert_eq!(migrate::run().exit_code, 0, "migrate should prepare the file database");

        let result = escalate::run(Some(48));
        assert_eq!(result.exit_code, 0, "unexpected output: {}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["status"], "ok");
        assert_eq!(payload["details"]["examined"], 0);
        assert_eq!(payload["details"]["escalated"], 0);
        assert_eq!(payload["details"]["failed"], 0);
    });
}

#[test]
fn doctor_flags_pending_migrations_then_passes() {
    let dir = TempDir::new().expect("temp dir");
    let url = format!("sqlite://{}", dir.path().join("expensa.db").display());

    with_env(&[("EXPENSA_DATABASE_URL", url.as_str())], || {
        let before = doctor::run(true);
        assert_eq!(before.exit_code, 1);
        let report = parse_payload(&before.output);
        assert_eq!(report["overall_status"], "fail");
        let migration_check = report["checks"]
            .as_array()
            .and_then(|checks| checks.iter().find(|check| check["name"] == "migration_state"))
            .expect("migration check present");
        assert_eq!(migration_check["status"], "fail");

        migrate::run();
        let after = doctor::run(true);
        assert_eq!(after.exit_code, 0, "unexpected report: {}", after.output);
        assert_eq!(parse_payload(&after.output)["overall_status"], "pass");
    });
}

#[test]
fn config_attributes_env_sources() {
    with_env(
        &[("EXPENSA_ESCALATION_STALE_AFTER_HOURS", "48"), ("EXPENSA_LOG_LEVEL", "debug")],
        || {
            let output = config::run();
            assert!(output.contains(
                "- escalation.stale_after_hours = 48 (source: env (EXPENSA_ESCALATION_STALE_AFTER_HOURS))"
            ));
            assert!(output.contains("- logging.level = debug (source: env (EXPENSA_LOG_LEVEL))"));
            assert!(output.contains("- escalation.interval_secs = 3600 (source: default)"));
        },
    );
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "EXPENSA_CONFIG",
        "EXPENSA_DATABASE_URL",
        "EXPENSA_DATABASE_MAX_CONNECTIONS",
        "EXPENSA_DATABASE_TIMEOUT_SECS",
        "EXPENSA_ESCALATION_ENABLED",
        "EXPENSA_ESCALATION_STALE_AFTER_HOURS",
        "EXPENSA_ESCALATION_INTERVAL_SECS",
        "EXPENSA_SERVER_BIND_ADDRESS",
        "EXPENSA_SERVER_HEALTH_CHECK_PORT",
        "EXPENSA_SERVER_GRACEFUL_SHUTDOWN_SECS",
        "EXPENSA_LOGGING_LEVEL",
        "EXPENSA_LOGGING_FORMAT",
        "EXPENSA_LOG_LEVEL",
        "EXPENSA_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
