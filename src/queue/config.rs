//! Configuration for the request queue.

use std::time::Duration;

use crate::storage::LAST_DISPATCH_KEY;

/// Default spacing between two dispatches, kept just under the provider's
/// per-minute request ceiling.
pub const DEFAULT_MIN_DELAY: Duration = Duration::from_millis(5500);

/// Configuration for [`RequestQueue`](super::RequestQueue).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use sluice::queue::QueueConfig;
///
/// let config = QueueConfig::default().min_delay(Duration::from_millis(250));
/// assert_eq!(config.min_delay, Duration::from_millis(250));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Minimum gap between the start of two consecutive dispatches.
    pub min_delay: Duration,

    /// Key under which the last-dispatch timestamp is persisted.
    pub storage_key: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            min_delay: DEFAULT_MIN_DELAY,
            storage_key: LAST_DISPATCH_KEY.to_string(),
        }
    }
}

impl QueueConfig {
    /// Sets the minimum spacing between dispatches.
    #[must_use]
    pub fn min_delay(mut self, min_delay: Duration) -> Self {
        self.min_delay = min_delay;
        self
    }

    /// Sets the persistence key for the last-dispatch timestamp.
    #[must_use]
    pub fn storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }

    /// Create config from environment variables.
    ///
    /// Reads `SLUICE_MIN_DELAY_MS` and `SLUICE_STORAGE_KEY`; values that fail
    /// to parse leave the default in place.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(ms) = lookup("SLUICE_MIN_DELAY_MS").and_then(|val| val.trim().parse().ok()) {
            config.min_delay = Duration::from_millis(ms);
        }

        if let Some(key) = lookup("SLUICE_STORAGE_KEY").filter(|val| !val.trim().is_empty()) {
            config.storage_key = key;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = QueueConfig::default();
        assert_eq!(config.min_delay, Duration::from_millis(5500));
        assert_eq!(config.storage_key, LAST_DISPATCH_KEY);
    }

    #[test]
    fn builder_overrides() {
        let config = QueueConfig::default()
            .min_delay(Duration::from_millis(100))
            .storage_key("tests.last");
        assert_eq!(config.min_delay, Duration::from_millis(100));
        assert_eq!(config.storage_key, "tests.last");
    }

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let pairs: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| {
            pairs
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
        }
    }

    #[test]
    fn env_values_override_defaults() {
        let config = QueueConfig::from_lookup(vars(&[
            ("SLUICE_MIN_DELAY_MS", " 1200 "),
            ("SLUICE_STORAGE_KEY", "app.queue.last"),
        ]));
        assert_eq!(config.min_delay, Duration::from_millis(1200));
        assert_eq!(config.storage_key, "app.queue.last");
    }

    #[test]
    fn unparseable_env_values_are_ignored() {
        let config = QueueConfig::from_lookup(vars(&[
            ("SLUICE_MIN_DELAY_MS", "soon"),
            ("SLUICE_STORAGE_KEY", "   "),
        ]));
        assert_eq!(config, QueueConfig::default());

        let negative = QueueConfig::from_lookup(vars(&[("SLUICE_MIN_DELAY_MS", "-5")]));
        assert_eq!(negative.min_delay, DEFAULT_MIN_DELAY);
    }

    #[test]
    fn missing_env_values_keep_defaults() {
        assert_eq!(QueueConfig::from_lookup(|_| None), QueueConfig::default());
    }
}
