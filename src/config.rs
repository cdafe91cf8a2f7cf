//! Cascade configuration.
//!
//! All knobs live in one immutable [`CascadeConfig`] handed to the tree
//! builder and the maintainer at construction. Durations are read from
//! `CASCADE_<OPTION>_SECS` environment variables; anything unset or
//! unparseable keeps its default.

use std::time::Duration;

use thiserror::Error;

use crate::types::DEFAULT_MAX_ERROR_RECORDS;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

const DEFAULT_ACTION_TIMEOUT_SECS: u64 = 15 * MINUTE;
const DEFAULT_RETRY_INTERVAL_SECS: u64 = MINUTE;
const DEFAULT_POLLING_INTERVAL_SECS: u64 = 4;
const DEFAULT_POLL_CASCADE_INTERVAL_SECS: u64 = 10;
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = DAY;
const DEFAULT_LIFESPAN_SECS: u64 = 7 * DAY;
const DEFAULT_RECONCILIATION_TIMEOUT_SECS: u64 = 7 * DAY;
const DEFAULT_ORPHAN_MITIGATION_TIMEOUT_SECS: u64 = 7 * DAY;

/// Default label key that marks a resource as belonging to a tenant.
pub const DEFAULT_TENANT_LABEL_KEY: &str = "tenant";

/// Environment variable naming the optional repository snapshot file.
pub const STATE_FILE_VAR: &str = "CASCADE_STATE_FILE";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{option} must be greater than zero")]
    Zero { option: &'static str },

    #[error("tenant label key must not be empty")]
    EmptyTenantLabelKey,
}

/// Timing and sizing options for cascades.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeConfig {
    /// Upper bound on a single deletion action or status poll.
    pub action_timeout: Duration,

    /// Delay before retrying a transient failure or an orphan-mitigated
    /// deletion.
    pub maintainer_retry_interval: Duration,

    /// Interval between maintainer passes.
    pub polling_interval: Duration,

    /// Minimum interval between two status polls of the same broker job.
    pub poll_cascade_interval: Duration,

    /// Interval between reaper runs.
    pub cleanup_interval: Duration,

    /// How long a finished tree is kept before the reaper removes it.
    pub lifespan: Duration,

    /// Overall budget of a tree, measured from the root's creation. Retries
    /// stop once it is exhausted.
    pub reconciliation_operation_timeout: Duration,

    /// How long an ambiguous deletion keeps being retried.
    pub cascade_orphan_mitigation_timeout: Duration,

    /// Cap on aggregated failure records per operation.
    pub max_error_records: usize,

    /// Label key selecting a tenant's platforms, brokers and instances.
    pub tenant_label_key: String,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl CascadeConfig {
    pub fn new() -> Self {
        CascadeConfig {
            action_timeout: Duration::from_secs(DEFAULT_ACTION_TIMEOUT_SECS),
            maintainer_retry_interval: Duration::from_secs(DEFAULT_RETRY_INTERVAL_SECS),
            polling_interval: Duration::from_secs(DEFAULT_POLLING_INTERVAL_SECS),
            poll_cascade_interval: Duration::from_secs(DEFAULT_POLL_CASCADE_INTERVAL_SECS),
            cleanup_interval: Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS),
            lifespan: Duration::from_secs(DEFAULT_LIFESPAN_SECS),
            reconciliation_operation_timeout: Duration::from_secs(
                DEFAULT_RECONCILIATION_TIMEOUT_SECS,
            ),
            cascade_orphan_mitigation_timeout: Duration::from_secs(
                DEFAULT_ORPHAN_MITIGATION_TIMEOUT_SECS,
            ),
            max_error_records: DEFAULT_MAX_ERROR_RECORDS,
            tenant_label_key: DEFAULT_TENANT_LABEL_KEY.to_string(),
        }
    }

    /// Reads the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, which maps a variable name
    /// to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::new();
        let secs = |name: &str, default: Duration| {
            lookup(&format!("CASCADE_{name}_SECS"))
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        CascadeConfig {
            action_timeout: secs("ACTION_TIMEOUT", defaults.action_timeout),
            maintainer_retry_interval: secs(
                "MAINTAINER_RETRY_INTERVAL",
                defaults.maintainer_retry_interval,
            ),
            polling_interval: secs("POLLING_INTERVAL", defaults.polling_interval),
            poll_cascade_interval: secs("POLL_CASCADE_INTERVAL", defaults.poll_cascade_interval),
            cleanup_interval: secs("CLEANUP_INTERVAL", defaults.cleanup_interval),
            lifespan: secs("LIFESPAN", defaults.lifespan),
            reconciliation_operation_timeout: secs(
                "RECONCILIATION_OPERATION_TIMEOUT",
                defaults.reconciliation_operation_timeout,
            ),
            cascade_orphan_mitigation_timeout: secs(
                "ORPHAN_MITIGATION_TIMEOUT",
                defaults.cascade_orphan_mitigation_timeout,
            ),
            max_error_records: lookup("CASCADE_MAX_ERROR_RECORDS")
                .and_then(|s| s.trim().parse::<usize>().ok())
                .unwrap_or(defaults.max_error_records),
            tenant_label_key: lookup("CASCADE_TENANT_LABEL_KEY")
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.tenant_label_key),
        }
    }

    /// Rejects configurations the maintainer cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("action_timeout", self.action_timeout),
            ("maintainer_retry_interval", self.maintainer_retry_interval),
            ("polling_interval", self.polling_interval),
            ("poll_cascade_interval", self.poll_cascade_interval),
            ("cleanup_interval", self.cleanup_interval),
            ("lifespan", self.lifespan),
            (
                "reconciliation_operation_timeout",
                self.reconciliation_operation_timeout,
            ),
            (
                "cascade_orphan_mitigation_timeout",
                self.cascade_orphan_mitigation_timeout,
            ),
        ];
        if let Some(&(option, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::Zero { option });
        }
        if self.max_error_records == 0 {
            return Err(ConfigError::Zero {
                option: "max_error_records",
            });
        }
        if self.tenant_label_key.is_empty() {
            return Err(ConfigError::EmptyTenantLabelKey);
        }
        Ok(())
    }
}
