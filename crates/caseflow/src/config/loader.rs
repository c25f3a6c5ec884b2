use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::config::schema::Config;
use crate::error::ConfigError;

/// `~/.caseflow/config.json`, used when no path is given explicitly.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".caseflow").join("config.json"))
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(content)?;

    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if config.worker_count == 0 {
        return Err(ConfigError::Validation {
            message: "worker_count must be at least 1".to_string(),
        });
    }
    if config.poll_interval_ms == 0 {
        return Err(ConfigError::Validation {
            message: "poll_interval_ms must be positive".to_string(),
        });
    }
    if config.heartbeat_interval_secs == 0 {
        return Err(ConfigError::Validation {
            message: "heartbeat_interval_secs must be positive".to_string(),
        });
    }
    // Leases must outlive several missed heartbeats or live jobs get reaped.
    if config.lease_timeout_secs < config.heartbeat_interval_secs.saturating_mul(2) {
        return Err(ConfigError::Validation {
            message: format!(
                "lease_timeout_secs ({}) must be at least twice heartbeat_interval_secs ({})",
                config.lease_timeout_secs, config.heartbeat_interval_secs
            ),
        });
    }

    if config.retry.max_attempts == 0 {
        return Err(ConfigError::Validation {
            message: "retry.max_attempts must be at least 1".to_string(),
        });
    }
    if config.retry.initial_backoff_ms > config.retry.max_backoff_ms {
        return Err(ConfigError::Validation {
            message: "retry.initial_backoff_ms exceeds retry.max_backoff_ms".to_string(),
        });
    }

    if config.stages.is_empty() {
        return Err(ConfigError::Validation {
            message: "at least one stage must be configured".to_string(),
        });
    }
    let mut seen = HashSet::new();
    for stage in &config.stages {
        if !seen.insert(stage.kind) {
            return Err(ConfigError::InvalidStage {
                kind: stage.kind.to_string(),
                reason: "Duplicate stage".to_string(),
            });
        }
        if stage.command.trim().is_empty() {
            return Err(ConfigError::InvalidStage {
                kind: stage.kind.to_string(),
                reason: "command is empty".to_string(),
            });
        }
        if stage.timeout_secs == 0 {
            return Err(ConfigError::InvalidStage {
                kind: stage.kind.to_string(),
                reason: "timeout_secs must be positive".to_string(),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecoveryPolicy;
    use crate::stage::StageKind;

    #[test]
    fn test_load_minimal_config() {
        let config = load_config_from_str(r#"{ "version": "1.0" }"#).unwrap();
        assert_eq!(config.version, "1.0");
        assert_eq!(config.recovery, RecoveryPolicy::Resume);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.stages.len(), 4);
        assert!(config.worker_count >= 1);
    }

    #[test]
    fn test_load_full_config() {
        let config_json = r#"
        {
            "version": "1.0",
            "database_path": "/var/lib/caseflow/jobs.db",
            "artifact_root": "/var/lib/caseflow/artifacts",
            "worker_count": 4,
            "poll_interval_ms": 200,
            "lease_timeout_secs": 90,
            "heartbeat_interval_secs": 15,
            "recovery": "fail",
            "max_recoveries": 1,
            "retry": { "max_attempts": 2, "initial_backoff_ms": 50, "max_backoff_ms": 500 },
            "stages": [
                { "kind": "transcribe", "command": "/opt/asr/run", "args": ["--fast"], "timeout_secs": 600 },
                { "kind": "extract_entities", "command": "/opt/ner/run" }
            ]
        }
        "#;

        let config = load_config_from_str(config_json).unwrap();
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.recovery, RecoveryPolicy::Fail);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.stages.len(), 2);
        assert_eq!(config.stages[0].kind, StageKind::Transcribe);
        assert_eq!(config.stages[0].args, vec!["--fast".to_string()]);
        assert_eq!(config.stages[1].timeout_secs, 3_600);
    }

    #[test]
    fn test_invalid_version() {
        let result = load_config_from_str(r#"{ "version": "2.0" }"#);
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn test_unknown_stage_kind() {
        let result = load_config_from_str(
            r#"{ "version": "1.0", "stages": [{ "kind": "translate", "command": "x" }] }"#,
        );
        assert!(matches!(result, Err(ConfigError::ParseJson(_))));
    }

    #[test]
    fn test_duplicate_stage() {
        let result = load_config_from_str(
            r#"{ "version": "1.0", "stages": [
                { "kind": "diarize", "command": "a" },
                { "kind": "diarize", "command": "b" }
            ] }"#,
        );
        assert!(matches!(result, Err(ConfigError::InvalidStage { .. })));
    }

    #[test]
    fn test_empty_stage_list() {
        let result = load_config_from_str(r#"{ "version": "1.0", "stages": [] }"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_lease_must_outlive_heartbeats() {
        let result = load_config_from_str(
            r#"{ "version": "1.0", "lease_timeout_secs": 10, "heartbeat_interval_secs": 10 }"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let result = load_config_from_str(r#"{ "version": "1.0", "retry": { "max_attempts": 0 } }"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("caseflow.json");
        std::fs::write(&path, r#"{ "version": "1.0", "worker_count": 2 }"#).unwrap();
        assert_eq!(load_config(&path).unwrap().worker_count, 2);

        let missing = load_config(dir.path().join("missing.json"));
        assert!(matches!(missing, Err(ConfigError::ReadFile { .. })));
    }
}
