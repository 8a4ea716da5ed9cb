use std::env;
use std::fs;
use std::path::Path;

use expensa_core::config::{resolve_config_path, AppConfig, LoadOptions};
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = resolve_config_path(None);
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let fields: [(&str, String, &[&str]); 12] = [
        ("database.url", config.database.url.clone(), &["EXPENSA_DATABASE_URL"]),
        (
            "database.max_connections",
            config.database.max_connections.to_string(),
            &["EXPENSA_DATABASE_MAX_CONNECTIONS"],
        ),
        (
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            &["EXPENSA_DATABASE_TIMEOUT_SECS"],
        ),
        (
            "escalation.enabled",
            config.escalation.enabled.to_string(),
            &["EXPENSA_ESCALATION_ENABLED"],
        ),
        (
            "escalation.stale_after_hours",
            config.escalation.stale_after_hours.to_string(),
            &["EXPENSA_ESCALATION_STALE_AFTER_HOURS"],
        ),
        (
            "escalation.interval_secs",
            config.escalation.interval_secs.to_string(),
            &["EXPENSA_ESCALATION_INTERVAL_SECS"],
        ),
        ("server.bind_address", config.server.bind_address.clone(), &["EXPENSA_SERVER_BIND_ADDRESS"]),
        (
            "server.health_check_port",
            config.server.health_check_port.to_string(),
            &["EXPENSA_SERVER_HEALTH_CHECK_PORT"],
        ),
        (
            "server.graceful_shutdown_secs",
            config.server.graceful_shutdown_secs.to_string(),
            &["EXPENSA_SERVER_GRACEFUL_SHUTDOWN_SECS"],
        ),
        (
            "logging.level",
            config.logging.level.clone(),
            &["EXPENSA_LOGGING_LEVEL", "EXPENSA_LOG_LEVEL"],
        ),
        (
            "logging.format",
            format!("{:?}", config.logging.format).to_ascii_lowercase(),
            &["EXPENSA_LOGGING_FORMAT", "EXPENSA_LOG_FORMAT"],
        ),
        (
            "config_file",
            config_file_path
                .as_deref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string()),
            &["EXPENSA_CONFIG"],
        ),
    ];

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key, value, env_keys) in fields {
        let source =
            field_source(key, env_keys, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(format!("- {key} = {value} (source: {source})"));
    }

    lines.join("\n")
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}
