//! Pool configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_POOL_SIZE: usize = 20;
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_CHECKOUT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is not valid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("pool size must be at least 1")]
    EmptyPool,
}

/// Tunables for the worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of pre-forked workers.
    pub size: usize,
    /// Upper bound on concurrently running overflow workers. 0 disables overflow.
    pub max_overflow: usize,
    /// Bound on one transaction. `None` waits forever.
    pub transaction_timeout: Option<Duration>,
    /// How long `checkout` may wait for a worker once pool and overflow are full.
    pub checkout_timeout: Duration,
    /// How long an overflow worker has to open its FIFOs.
    pub rendezvous_timeout: Duration,
    /// Where rendezvous FIFOs are created.
    pub fifo_dir: PathBuf,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_POOL_SIZE,
            max_overflow: DEFAULT_POOL_SIZE,
            transaction_timeout: Some(DEFAULT_TRANSACTION_TIMEOUT),
            checkout_timeout: DEFAULT_CHECKOUT_TIMEOUT,
            rendezvous_timeout: DEFAULT_RENDEZVOUS_TIMEOUT,
            fifo_dir: default_fifo_dir(),
        }
    }
}

fn default_fifo_dir() -> PathBuf {
    std::env::temp_dir().join(format!("dreadnought-{}", std::process::id()))
}

impl PoolConfig {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            max_overflow: size,
            ..Self::default()
        }
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn with_max_overflow(mut self, max_overflow: usize) -> Self {
        self.max_overflow = max_overflow;
        self
    }

    pub fn with_transaction_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    pub fn with_checkout_timeout(mut self, timeout: Duration) -> Self {
        self.checkout_timeout = timeout;
        self
    }

    pub fn with_rendezvous_timeout(mut self, timeout: Duration) -> Self {
        self.rendezvous_timeout = timeout;
        self
    }

    pub fn with_fifo_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.fifo_dir = dir.into();
        self
    }

    pub fn overflow_enabled(&self) -> bool {
        self.max_overflow > 0
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.size == 0 {
            return Err(ConfigError::EmptyPool);
        }
        Ok(())
    }

    /// Defaults overridden by `DN_*` environment variables.
    ///
    /// `DN_MAX_OVERFLOW` defaults to the pool size;
    /// `DN_TRANSACTION_TIMEOUT_SECS=0` disables the transaction bound.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let size = parse_var(&lookup, "DN_POOL_SIZE")?.unwrap_or(DEFAULT_POOL_SIZE);
        let max_overflow = parse_var(&lookup, "DN_MAX_OVERFLOW")?.unwrap_or(size);
        let transaction_timeout = match parse_var::<u64>(&lookup, "DN_TRANSACTION_TIMEOUT_SECS")? {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => Some(DEFAULT_TRANSACTION_TIMEOUT),
        };
        let checkout_timeout = parse_var(&lookup, "DN_CHECKOUT_TIMEOUT_SECS")?
            .map_or(DEFAULT_CHECKOUT_TIMEOUT, Duration::from_secs);
        let rendezvous_timeout = parse_var(&lookup, "DN_RENDEZVOUS_TIMEOUT_SECS")?
            .map_or(DEFAULT_RENDEZVOUS_TIMEOUT, Duration::from_secs);
        let fifo_dir = lookup("DN_FIFO_DIR")
            .filter(|v| !v.is_empty())
            .map_or_else(default_fifo_dir, PathBuf::from);

        let config = Self {
            size,
            max_overflow,
            transaction_timeout,
            checkout_timeout,
            rendezvous_timeout,
            fifo_dir,
        };
        config.validate()?;
        Ok(config)
    }
}

pub(crate) fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) if value.trim().is_empty() => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            }),
    }
}
