use crate::error::{LinklockError, Result};
use crate::logging;
use std::time::Duration;

pub const DEFAULT_MIN_SLEEP: Duration = Duration::from_secs(2);
pub const DEFAULT_SLEEP_INC: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_SLEEP: Duration = Duration::from_secs(32);
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(3600);
pub const DEFAULT_SUSPEND: Duration = Duration::from_secs(64);
pub const DEFAULT_REFRESH: Duration = Duration::from_secs(8);
pub const DEFAULT_POLL_RETRIES: u32 = 16;
pub const DEFAULT_POLL_MAX_SLEEP: Duration = Duration::from_millis(80);

/// Per-handle lock configuration.
///
/// The field set is closed: every tunable the lock understands is listed
/// here, so a misspelled option is a compile error rather than a silently
/// ignored key.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Bound on backoff retries of the full polling+sleep unit. `None` retries forever.
    pub retries: Option<u32>,
    /// Shortest backoff sleep.
    pub min_sleep: Duration,
    /// Longest backoff sleep.
    pub max_sleep: Duration,
    /// Step between successive backoff sleeps.
    pub sleep_inc: Duration,
    /// Lockfiles older than this may be stolen. `None` disables theft.
    pub max_age: Option<Duration>,
    /// Pause after stealing, so the previous owner can notice the loss.
    pub suspend: Duration,
    /// Interval between background mtime refreshes. `None` disables the refresher.
    pub refresh: Option<Duration>,
    /// Wall-clock bound on the entire acquire. `None` waits forever.
    pub timeout: Option<Duration>,
    /// Link-and-verify attempts within one polling phase.
    pub poll_retries: u32,
    /// Cap on the random sleep between polling attempts.
    pub poll_max_sleep: Duration,
    /// Skip registration of the process-exit cleanup handler.
    pub dont_clean: bool,
    /// Skip the sweep for dead-peer staging debris at acquire time.
    pub dont_sweep: bool,
    /// Debug tracing, seeded from the `LOCKFILE_DEBUG` environment variable.
    pub debug: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            retries: None,
            min_sleep: DEFAULT_MIN_SLEEP,
            max_sleep: DEFAULT_MAX_SLEEP,
            sleep_inc: DEFAULT_SLEEP_INC,
            max_age: Some(DEFAULT_MAX_AGE),
            suspend: DEFAULT_SUSPEND,
            refresh: Some(DEFAULT_REFRESH),
            timeout: None,
            poll_retries: DEFAULT_POLL_RETRIES,
            poll_max_sleep: DEFAULT_POLL_MAX_SLEEP,
            dont_clean: false,
            dont_sweep: false,
            debug: logging::debug_env_enabled(),
        }
    }
}

impl LockConfig {
    pub fn with_retries(mut self, retries: Option<u32>) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_sleep(mut self, min: Duration, inc: Duration, max: Duration) -> Self {
        self.min_sleep = min;
        self.sleep_inc = inc;
        self.max_sleep = max;
        self
    }

    pub fn with_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_suspend(mut self, suspend: Duration) -> Self {
        self.suspend = suspend;
        self
    }

    pub fn with_refresh(mut self, refresh: Option<Duration>) -> Self {
        self.refresh = refresh;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_polling(mut self, retries: u32, max_sleep: Duration) -> Self {
        self.poll_retries = retries;
        self.poll_max_sleep = max_sleep;
        self
    }

    pub fn with_dont_clean(mut self, dont_clean: bool) -> Self {
        self.dont_clean = dont_clean;
        self
    }

    pub fn with_dont_sweep(mut self, dont_sweep: bool) -> Self {
        self.dont_sweep = dont_sweep;
        self
    }

    /// Checks the internal consistency of the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.min_sleep.is_zero() {
            return Err(LinklockError::InvalidConfig(
                "min_sleep must be positive".to_string(),
            ));
        }
        if self.sleep_inc.is_zero() {
            return Err(LinklockError::InvalidConfig(
                "sleep_inc must be positive".to_string(),
            ));
        }
        if self.max_sleep < self.min_sleep {
            return Err(LinklockError::InvalidConfig(format!(
                "max_sleep ({:?}) must not be shorter than min_sleep ({:?})",
                self.max_sleep, self.min_sleep
            )));
        }
        if self.poll_max_sleep.is_zero() {
            return Err(LinklockError::InvalidConfig(
                "poll_max_sleep must be positive".to_string(),
            ));
        }
        if matches!(self.max_age, Some(age) if age.is_zero()) {
            return Err(LinklockError::InvalidConfig(
                "max_age must be positive when set".to_string(),
            ));
        }
        if matches!(self.refresh, Some(refresh) if refresh.is_zero()) {
            return Err(LinklockError::InvalidConfig(
                "refresh must be positive when set".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        LockConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_sleeps_are_rejected() {
        let config = LockConfig::default().with_sleep(
            Duration::ZERO,
            DEFAULT_SLEEP_INC,
            DEFAULT_MAX_SLEEP,
        );
        assert!(matches!(
            config.validate(),
            Err(LinklockError::InvalidConfig(_))
        ));

        let config = LockConfig::default().with_sleep(
            DEFAULT_MIN_SLEEP,
            Duration::ZERO,
            DEFAULT_MAX_SLEEP,
        );
        assert!(matches!(
            config.validate(),
            Err(LinklockError::InvalidConfig(_))
        ));
    }

    #[test]
    fn inverted_sleep_bounds_are_rejected() {
        let config = LockConfig::default().with_sleep(
            Duration::from_secs(10),
            Duration::from_secs(1),
            Duration::from_secs(2),
        );
        assert!(matches!(
            config.validate(),
            Err(LinklockError::InvalidConfig(_))
        ));
    }

    #[test]
    fn zero_max_age_is_rejected_but_none_is_fine() {
        let config = LockConfig::default().with_max_age(Some(Duration::ZERO));
        assert!(config.validate().is_err());

        let config = LockConfig::default().with_max_age(None);
        config.validate().unwrap();
    }

    #[test]
    fn zero_refresh_is_rejected_but_none_is_fine() {
        let config = LockConfig::default().with_refresh(Some(Duration::ZERO));
        assert!(config.validate().is_err());

        let config = LockConfig::default().with_refresh(None);
        config.validate().unwrap();
    }

    #[test]
    fn zero_timeout_and_zero_retries_are_allowed() {
        let config = LockConfig::default()
            .with_timeout(Some(Duration::ZERO))
            .with_retries(Some(0));
        config.validate().unwrap();
    }
}
