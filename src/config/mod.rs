use crate::constants::*;
use crate::{FleetError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub store_path: String,
    pub orchestrator: OrchestratorConfig,
    pub confidence: ConfidenceConfig,
    pub quality_gate: QualityGateConfig,
    pub event_bus: EventBusConfig,
    pub api: ApiConfig,
    pub vcs: VcsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub max_agents: usize,
    pub heartbeat_interval: Duration,
    pub timeout_threshold: Duration,
    pub max_consecutive_failures: u32,
    pub max_recovery_attempts: u32,
    pub task_timeout: Duration,
    pub queue_max_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceConfig {
    pub min_samples: u32,
    pub high_success_threshold: f64,
    pub base_threshold: f64,
    pub high_risk_threshold: f64,
    pub risk_weights: HashMap<String, f64>,
    pub fingerprint_features: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityGateConfig {
    pub max_pr_size: usize,
    pub min_coverage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    pub buffer_size: usize,
    pub flush_interval: Duration,
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VcsConfig {
    pub github_owner: Option<String>,
    pub github_repo: Option<String>,
    pub github_token: Option<String>,
    pub branch_prefix_filter: Option<String>,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_duration_secs(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

impl Config {
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!("loaded .env file from: {:?}", path),
            Err(e) => tracing::debug!("no .env file loaded: {}", e),
        }

        let orchestrator = OrchestratorConfig {
            max_agents: env_parse("FLEET_MAX_AGENTS", DEFAULT_MAX_AGENTS),
            heartbeat_interval: env_duration_secs(
                "FLEET_HEARTBEAT_INTERVAL_SECS",
                DEFAULT_HEARTBEAT_INTERVAL,
            ),
            timeout_threshold: env_duration_secs(
                "FLEET_TIMEOUT_THRESHOLD_SECS",
                DEFAULT_TIMEOUT_THRESHOLD,
            ),
            max_consecutive_failures: env_parse(
                "FLEET_MAX_CONSECUTIVE_FAILURES",
                DEFAULT_MAX_CONSECUTIVE_FAILURES,
            ),
            max_recovery_attempts: env_parse(
                "FLEET_MAX_RECOVERY_ATTEMPTS",
                DEFAULT_MAX_RECOVERY_ATTEMPTS,
            ),
            task_timeout: env_duration_secs("FLEET_TASK_TIMEOUT_SECS", DEFAULT_TASK_TIMEOUT),
            queue_max_size: env_parse("FLEET_QUEUE_MAX_SIZE", DEFAULT_QUEUE_MAX_SIZE),
        };

        let mut risk_weights = HashMap::new();
        risk_weights.insert("security".to_string(), 0.4);
        risk_weights.insert("architecture".to_string(), 0.3);
        risk_weights.insert("performance".to_string(), 0.2);
        risk_weights.insert("customer_facing".to_string(), 0.3);
        risk_weights.insert("critical_path".to_string(), 0.4);

        let confidence = ConfidenceConfig {
            min_samples: env_parse("FLEET_MIN_SAMPLES", DEFAULT_MIN_SAMPLES),
            high_success_threshold: env_parse(
                "FLEET_HIGH_SUCCESS_THRESHOLD",
                DEFAULT_HIGH_SUCCESS_THRESHOLD,
            ),
            base_threshold: env_parse("FLEET_BASE_THRESHOLD", DEFAULT_BASE_CONFIDENCE_THRESHOLD),
            high_risk_threshold: env_parse(
                "FLEET_HIGH_RISK_THRESHOLD",
                DEFAULT_HIGH_RISK_CONFIDENCE_THRESHOLD,
            ),
            risk_weights,
            fingerprint_features: vec![
                "task_type".to_string(),
                "complexity".to_string(),
                "has_security_implications".to_string(),
                "has_architecture_changes".to_string(),
                "affects_performance".to_string(),
                "is_customer_facing".to_string(),
                "modifies_critical_path".to_string(),
            ],
        };

        let quality_gate = QualityGateConfig {
            max_pr_size: env_parse("FLEET_MAX_PR_SIZE", DEFAULT_MAX_PR_SIZE),
            min_coverage: env_parse("FLEET_MIN_COVERAGE", DEFAULT_MIN_COVERAGE),
        };

        let event_bus = EventBusConfig {
            buffer_size: env_parse("FLEET_EVENT_BUFFER", DEFAULT_EVENT_BUFFER),
            flush_interval: env_duration_secs(
                "FLEET_FLUSH_INTERVAL_MS",
                DEFAULT_FLUSH_INTERVAL,
            ),
            batch_size: env_parse("FLEET_BATCH_SIZE", DEFAULT_BATCH_SIZE),
            max_retries: env_parse("FLEET_MAX_RETRIES", DEFAULT_MAX_RETRIES),
            retry_delay: env_duration_secs("FLEET_RETRY_DELAY_MS", DEFAULT_RETRY_DELAY),
        };

        let api_key = env::var("FLEET_API_KEY").ok();
        match &api_key {
            Some(key) if key.trim().is_empty() => {
                return Err(FleetError::Configuration(
                    "FLEET_API_KEY cannot be blank".to_string(),
                ));
            }
            Some(key) if key.len() < 32 => {
                return Err(FleetError::Configuration(
                    "FLEET_API_KEY must be at least 32 characters".to_string(),
                ));
            }
            _ => {}
        }

        let allowed_origins = env::var("FLEET_ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let api = ApiConfig {
            host: env::var("FLEET_API_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env_parse("FLEET_API_PORT", 7870u16),
            api_key,
            allowed_origins,
        };

        let vcs = VcsConfig {
            github_owner: env::var("FLEET_GITHUB_OWNER").ok(),
            github_repo: env::var("FLEET_GITHUB_REPO").ok(),
            github_token: env::var("FLEET_GITHUB_TOKEN").ok(),
            branch_prefix_filter: env::var("FLEET_BRANCH_PREFIX_FILTER").ok(),
        };

        let store_path = env::var("FLEET_STORE_PATH").unwrap_or_else(|_| "fleet.db".to_string());

        Ok(Config {
            store_path,
            orchestrator,
            confidence,
            quality_gate,
            event_bus,
            api,
            vcs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_env() {
        std::env::remove_var("FLEET_API_KEY");
        let config = Config::load().expect("config should load with defaults");
        assert_eq!(config.orchestrator.max_agents, DEFAULT_MAX_AGENTS);
        assert_eq!(config.confidence.fingerprint_features.len(), 7);
    }

    #[test]
    fn rejects_short_api_key() {
        std::env::set_var("FLEET_API_KEY", "short");
        let result = Config::load();
        std::env::remove_var("FLEET_API_KEY");
        assert!(result.is_err());
    }
}
