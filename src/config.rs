use std::str::FromStr;
use std::time::Duration;

use crate::event_sourcing::publishing::DEFAULT_PUBLISHER_CAPACITY;
use crate::event_sourcing::store::DEFAULT_SNAPSHOT_INTERVAL;

// ============================================================================
// Configuration
// ============================================================================
//
// Read once from the environment at startup. Unset variables fall back to
// local development defaults; set-but-invalid variables are an error.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
#[error("Invalid value {value:?} for {key}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KafkaConfig {
    pub brokers: String,
    pub client_id: String,
    pub topic_partitions: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub kafka: KafkaConfig,
    /// Postgres URL; in-memory stores are used when unset.
    pub database_url: Option<String>,
    pub snapshot_interval: u64,
    pub publisher_capacity: usize,
    pub rpc_retries: u32,
    pub rpc_retry_min_delay: Duration,
    pub metrics_port: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            kafka: KafkaConfig {
                brokers: "127.0.0.1:9092".to_string(),
                client_id: "event_bridge".to_string(),
                topic_partitions: 1,
            },
            database_url: None,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            publisher_capacity: DEFAULT_PUBLISHER_CAPACITY,
            rpc_retries: 2,
            rpc_retry_min_delay: Duration::from_millis(50),
            metrics_port: 9090,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        Ok(Self {
            kafka: KafkaConfig {
                brokers: lookup("KAFKA_BROKERS").unwrap_or(defaults.kafka.brokers),
                client_id: lookup("KAFKA_CLIENT_ID").unwrap_or(defaults.kafka.client_id),
                topic_partitions: parse(&lookup, "KAFKA_TOPIC_PARTITIONS", defaults.kafka.topic_partitions)?,
            },
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            snapshot_interval: parse(&lookup, "SNAPSHOT_INTERVAL", defaults.snapshot_interval)?,
            publisher_capacity: parse(&lookup, "PUBLISHER_CAPACITY", defaults.publisher_capacity)?,
            rpc_retries: parse(&lookup, "RPC_RETRIES", defaults.rpc_retries)?,
            rpc_retry_min_delay: Duration::from_millis(parse(
                &lookup,
                "RPC_RETRY_MIN_DELAY_MS",
                defaults.rpc_retry_min_delay.as_millis() as u64,
            )?),
            metrics_port: parse(&lookup, "METRICS_PORT", defaults.metrics_port)?,
        })
    }
}

fn parse<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError { key, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.snapshot_interval, 50);
        assert_eq!(config.rpc_retries, 2);
        assert_eq!(config.rpc_retry_min_delay, Duration::from_millis(50));
        assert!(config.database_url.is_none());
        assert_eq!(config.metrics_port, 9090);
    }

    #[test]
    fn test_overrides() {
        let config = AppConfig::from_lookup(lookup(&[
            ("KAFKA_BROKERS", "kafka-1:9092,kafka-2:9092"),
            ("KAFKA_TOPIC_PARTITIONS", "6"),
            ("DATABASE_URL", "postgres://localhost/events"),
            ("SNAPSHOT_INTERVAL", "10"),
            ("RPC_RETRY_MIN_DELAY_MS", "5"),
            ("METRICS_PORT", "9464"),
        ]))
        .unwrap();

        assert_eq!(config.kafka.brokers, "kafka-1:9092,kafka-2:9092");
        assert_eq!(config.kafka.topic_partitions, 6);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/events"));
        assert_eq!(config.snapshot_interval, 10);
        assert_eq!(config.rpc_retry_min_delay, Duration::from_millis(5));
        assert_eq!(config.metrics_port, 9464);
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let err = AppConfig::from_lookup(lookup(&[("PUBLISHER_CAPACITY", "lots")])).unwrap_err();
        assert_eq!(err.key, "PUBLISHER_CAPACITY");
        assert_eq!(err.value, "lots");
    }
}
