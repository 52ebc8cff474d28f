//! Engine configuration
//!
//! Settings loaded from environment variables. Every setting has a default so
//! the engine starts with an empty environment.

use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_LEASE_DURATION_SECS: u64 = 60;
pub const DEFAULT_SCAN_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_BATCH_SIZE: usize = 20;
pub const DEFAULT_MAX_CONCURRENT_EXECUTIONS: usize = 10;
pub const DEFAULT_WORKERS_PER_KIND: usize = 1;
pub const DEFAULT_DRIVER_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 300_000;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_CASCADE_INTERVAL_SECS: u64 = 10;
/// Three days between subscription expiry and deletion
pub const DEFAULT_SUBSCRIPTION_GRACE_SECS: u64 = 3 * 24 * 60 * 60;
pub const DEFAULT_METRICS_PORT: u16 = 8080;

/// Where resource records live
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// Process-local store; records vanish with the process
    Memory,
    /// `ManagedResource` custom resources in one namespace
    Kubernetes { namespace: String },
}

/// Engine-level configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Lease length; a crashed worker's claim is reclaimable after this long
    pub lease_duration_secs: u64,
    /// Pause between candidate scans of one kind
    pub scan_interval_ms: u64,
    /// Candidates fetched per scan
    pub batch_size: usize,
    /// Driver calls in flight per scheduler loop
    pub max_concurrent_executions: usize,
    /// Scheduler loops per kind in this process
    pub workers_per_kind: usize,
    /// Upper bound on a single driver call; must be shorter than the lease
    pub driver_timeout_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Retryable outcomes tolerated before a transition is failed
    pub max_attempts: u32,
    pub cascade_interval_secs: u64,
    /// Time between subscription expiry and subscription deletion
    pub subscription_grace_secs: u64,
    pub store: StoreBackend,
    /// Base URL of the provisioning webhook; `None` accepts every action locally
    pub driver_endpoint: Option<String>,
    pub metrics_port: u16,
    /// Log format (json, text)
    pub log_format: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lease_duration_secs: DEFAULT_LEASE_DURATION_SECS,
            scan_interval_ms: DEFAULT_SCAN_INTERVAL_MS,
            batch_size: DEFAULT_BATCH_SIZE,
            max_concurrent_executions: DEFAULT_MAX_CONCURRENT_EXECUTIONS,
            workers_per_kind: DEFAULT_WORKERS_PER_KIND,
            driver_timeout_secs: DEFAULT_DRIVER_TIMEOUT_SECS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            cascade_interval_secs: DEFAULT_CASCADE_INTERVAL_SECS,
            subscription_grace_secs: DEFAULT_SUBSCRIPTION_GRACE_SECS,
            store: StoreBackend::Memory,
            driver_endpoint: None,
            metrics_port: DEFAULT_METRICS_PORT,
            log_format: "json".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let store = match env_var_or_default_str("STORE_BACKEND", "memory")
            .to_lowercase()
            .as_str()
        {
            "kubernetes" | "kube" => StoreBackend::Kubernetes {
                namespace: env_var_or_default_str("NAMESPACE", "default"),
            },
            _ => StoreBackend::Memory,
        };

        Self {
            lease_duration_secs: env_var_or_default(
                "LEASE_DURATION_SECS",
                DEFAULT_LEASE_DURATION_SECS,
            ),
            scan_interval_ms: env_var_or_default("SCAN_INTERVAL_MS", DEFAULT_SCAN_INTERVAL_MS),
            batch_size: env_var_or_default("BATCH_SIZE", DEFAULT_BATCH_SIZE),
            max_concurrent_executions: env_var_or_default(
                "MAX_CONCURRENT_EXECUTIONS",
                DEFAULT_MAX_CONCURRENT_EXECUTIONS,
            ),
            workers_per_kind: env_var_or_default("WORKERS_PER_KIND", DEFAULT_WORKERS_PER_KIND),
            driver_timeout_secs: env_var_or_default(
                "DRIVER_TIMEOUT_SECS",
                DEFAULT_DRIVER_TIMEOUT_SECS,
            ),
            backoff_base_ms: env_var_or_default("BACKOFF_BASE_MS", DEFAULT_BACKOFF_BASE_MS),
            backoff_max_ms: env_var_or_default("BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS),
            max_attempts: env_var_or_default("MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS),
            cascade_interval_secs: env_var_or_default(
                "CASCADE_INTERVAL_SECS",
                DEFAULT_CASCADE_INTERVAL_SECS,
            ),
            subscription_grace_secs: env_var_or_default(
                "SUBSCRIPTION_GRACE_SECS",
                DEFAULT_SUBSCRIPTION_GRACE_SECS,
            ),
            store,
            driver_endpoint: std::env::var("DRIVER_ENDPOINT")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            metrics_port: env_var_or_default("METRICS_PORT", DEFAULT_METRICS_PORT),
            log_format: env_var_or_default_str("LOG_FORMAT", "json"),
        }
    }

    /// Reject settings the lease protocol cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.lease_duration_secs == 0 {
            return Err(Error::config("LEASE_DURATION_SECS must be greater than zero"));
        }
        if self.driver_timeout_secs >= self.lease_duration_secs {
            return Err(Error::config(format!(
                "DRIVER_TIMEOUT_SECS ({}) must be shorter than LEASE_DURATION_SECS ({})",
                self.driver_timeout_secs, self.lease_duration_secs
            )));
        }
        if self.batch_size == 0 || self.max_concurrent_executions == 0 {
            return Err(Error::config(
                "BATCH_SIZE and MAX_CONCURRENT_EXECUTIONS must be greater than zero",
            ));
        }
        if self.workers_per_kind == 0 {
            return Err(Error::config("WORKERS_PER_KIND must be greater than zero"));
        }
        if self.max_attempts == 0 {
            return Err(Error::config("MAX_ATTEMPTS must be greater than zero"));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(Error::config("BACKOFF_BASE_MS must not exceed BACKOFF_MAX_MS"));
        }
        Ok(())
    }

    pub fn lease_duration(&self) -> chrono::Duration {
        seconds(self.lease_duration_secs)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn driver_timeout(&self) -> Duration {
        Duration::from_secs(self.driver_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn cascade_interval(&self) -> Duration {
        Duration::from_secs(self.cascade_interval_secs)
    }

    pub fn subscription_grace(&self) -> chrono::Duration {
        seconds(self.subscription_grace_secs)
    }
}

/// Whole seconds as a chrono duration, saturating at chrono's range
fn seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1_000))
}

/// Read environment variable or return default value
fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read environment variable as string or return default
fn env_var_or_default_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn driver_timeout_must_fit_inside_lease() {
        let config = EngineConfig {
            lease_duration_secs: 30,
            driver_timeout_secs: 30,
            ..EngineConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("DRIVER_TIMEOUT_SECS"));
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let config = EngineConfig {
            batch_size: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            max_attempts: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn durations_follow_settings() {
        let config = EngineConfig {
            lease_duration_secs: 45,
            scan_interval_ms: 250,
            ..EngineConfig::default()
        };
        assert_eq!(config.lease_duration(), chrono::Duration::seconds(45));
        assert_eq!(config.scan_interval(), Duration::from_millis(250));
    }
}
