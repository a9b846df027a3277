use crate::error::TidedbError;

/// Runtime configuration for a tidedb instance.
#[derive(Debug, Clone)]
pub struct TidedbConfig {
    /// Database name; scopes the advisory lock names (`push:<name>`,
    /// `pull:<name>`) so instances of different databases never contend.
    pub name: String,
    /// Window during which concurrent initial reads share one read-only
    /// overlay transaction.
    pub read_batch_window_ms: u64,
    /// Interval of the scheduled pull loop; only runs while a puller is
    /// configured.
    pub pull_interval_ms: u64,
    /// Lease the push phase declares when taking its advisory lock;
    /// waiters steal the lock once the lease lapses.
    pub push_lock_lease_ms: u64,
    /// Lease the pull phase declares when taking its advisory lock.
    pub pull_lock_lease_ms: u64,
    /// Poll interval while waiting on a held advisory lock.
    pub lock_poll_interval_ms: u64,
    /// A waiter that has polled this long force-removes the lock even if
    /// its lease has not lapsed; advisory locks coordinate instances,
    /// they are not a safety primitive.
    pub lock_timeout_ms: u64,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
}

impl Default for TidedbConfig {
    fn default() -> Self {
        Self {
            name: "tidedb".to_string(),
            read_batch_window_ms: 5,
            pull_interval_ms: 30_000,
            push_lock_lease_ms: 120_000,
            pull_lock_lease_ms: 120_000,
            lock_poll_interval_ms: 1_000,
            lock_timeout_ms: 300_000,
            retry_initial_backoff_ms: 1_000,
            retry_max_backoff_ms: 10_000,
        }
    }
}

impl TidedbConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Profile with short waits, for tests and local development.
    pub fn development() -> Self {
        Self {
            pull_interval_ms: 2_000,
            lock_poll_interval_ms: 20,
            lock_timeout_ms: 2_000,
            retry_initial_backoff_ms: 10,
            retry_max_backoff_ms: 100,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), TidedbError> {
        if self.name.is_empty() {
            return Err(TidedbError::InvalidConfig {
                message: "name must not be empty".into(),
            });
        }
        if self.retry_initial_backoff_ms == 0 {
            return Err(TidedbError::InvalidConfig {
                message: "retry_initial_backoff_ms must be positive".into(),
            });
        }
        if self.retry_max_backoff_ms < self.retry_initial_backoff_ms {
            return Err(TidedbError::InvalidConfig {
                message: "retry_max_backoff_ms must be >= retry_initial_backoff_ms".into(),
            });
        }
        if self.lock_poll_interval_ms == 0 {
            return Err(TidedbError::InvalidConfig {
                message: "lock_poll_interval_ms must be positive".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::TidedbConfig;

    #[test]
    fn default_config_validates() {
        TidedbConfig::default().validate().expect("default is valid");
        TidedbConfig::development()
            .validate()
            .expect("development is valid");
    }

    #[test]
    fn empty_name_is_rejected() {
        let config = TidedbConfig::named("");
        assert!(config.validate().is_err());
    }

    #[test]
    fn inverted_backoff_bounds_are_rejected() {
        let config = TidedbConfig {
            retry_initial_backoff_ms: 5_000,
            retry_max_backoff_ms: 1_000,
            ..TidedbConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
