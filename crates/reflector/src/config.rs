use std::time::Duration;

/// Initial delay before retrying a failed list or watch.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Default cap on the retry delay.
pub const DEFAULT_BACKOFF_MAX_SECS: u64 = 30;

/// Reflector tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectorConfig {
    /// Forced re-list period while watching. Zero disables it.
    pub resync_period: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Consecutive list failures tolerated before giving up. `None` retries forever.
    pub max_list_attempts: Option<u32>,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            resync_period: Duration::ZERO,
            backoff_initial: INITIAL_BACKOFF,
            backoff_max: Duration::from_secs(DEFAULT_BACKOFF_MAX_SECS),
            max_list_attempts: None,
        }
    }
}

impl ReflectorConfig {
    /// Defaults overridden by `KREFLECT_RESYNC_SECS`, `KREFLECT_BACKOFF_MAX_SECS`
    /// and `KREFLECT_MAX_LIST_ATTEMPTS`. Unparsable values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(secs) = get("KREFLECT_RESYNC_SECS").and_then(|s| s.parse::<u64>().ok()) {
            cfg.resync_period = Duration::from_secs(secs);
        }
        if let Some(secs) = get("KREFLECT_BACKOFF_MAX_SECS").and_then(|s| s.parse::<u64>().ok()) {
            cfg.backoff_max = Duration::from_secs(secs);
        }
        if let Some(n) = get("KREFLECT_MAX_LIST_ATTEMPTS").and_then(|s| s.parse::<u32>().ok()) {
            cfg.max_list_attempts = (n > 0).then_some(n);
        }
        cfg
    }

    pub fn with_resync_period(mut self, period: Duration) -> Self {
        self.resync_period = period;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff_initial = initial;
        self.backoff_max = max;
        self
    }

    pub fn with_max_list_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_list_attempts = attempts;
        self
    }
}
