//! Engine-wide settings
//!
//! Knobs that apply to every delegation an engine runs rather than to one
//! delegation document. Read from the environment by the host application.

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_park_paused() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Used when a parallel policy asks for a non-positive concurrency
    #[serde(default)]
    pub default_max_concurrency: Option<usize>,

    /// Applied to parallel units whose policy has no timeout
    #[serde(default)]
    pub default_unit_timeout: Option<Duration>,

    /// Keep paused delegations so they can be resumed later
    #[serde(default = "default_park_paused")]
    pub park_paused: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_max_concurrency: None,
            default_unit_timeout: None,
            park_paused: default_park_paused(),
        }
    }
}

impl EngineSettings {
    /// Read `NAMING_MAX_CONCURRENCY`, `NAMING_UNIT_TIMEOUT_SECS` and
    /// `NAMING_PARK_PAUSED`. Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        settings.apply_env_overrides();
        settings
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(max) = std::env::var("NAMING_MAX_CONCURRENCY") {
            if let Ok(max) = max.trim().parse::<usize>() {
                if max > 0 {
                    self.default_max_concurrency = Some(max);
                }
            }
        }
        if let Ok(secs) = std::env::var("NAMING_UNIT_TIMEOUT_SECS") {
            if let Ok(secs) = secs.trim().parse::<u64>() {
                if secs > 0 {
                    self.default_unit_timeout = Some(Duration::from_secs(secs));
                }
            }
        }
        if let Ok(park) = std::env::var("NAMING_PARK_PAUSED") {
            self.park_paused = park.trim().to_lowercase() != "false";
        }
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.default_max_concurrency = Some(max).filter(|m| *m > 0);
        self
    }

    pub fn with_unit_timeout(mut self, timeout: Duration) -> Self {
        self.default_unit_timeout = Some(timeout);
        self
    }

    pub fn with_park_paused(mut self, park: bool) -> Self {
        self.park_paused = park;
        self
    }

    /// Number of units allowed in flight for a policy asking for `requested`.
    ///
    /// Non-positive requests fall back to the configured default, then to the
    /// machine's logical core count. Never returns zero.
    pub fn effective_concurrency(&self, requested: i64) -> usize {
        if requested > 0 {
            return usize::try_from(requested).unwrap_or(usize::MAX);
        }
        self.default_max_concurrency.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    /// Per-unit timeout for a policy that configured `timeout_ms`
    pub fn unit_timeout(&self, timeout_ms: Option<u64>) -> Option<Duration> {
        match timeout_ms {
            Some(ms) if ms > 0 => Some(Duration::from_millis(ms)),
            _ => self.default_unit_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_concurrency() {
        let settings = EngineSettings::default();
        assert_eq!(settings.effective_concurrency(4), 4);
        assert!(settings.effective_concurrency(0) >= 1);
        assert!(settings.effective_concurrency(-3) >= 1);

        let settings = EngineSettings::default().with_max_concurrency(2);
        assert_eq!(settings.effective_concurrency(0), 2);
        assert_eq!(settings.effective_concurrency(-1), 2);
        assert_eq!(settings.effective_concurrency(7), 7);
    }

    #[test]
    fn test_zero_default_is_ignored() {
        let settings = EngineSettings::default().with_max_concurrency(0);
        assert_eq!(settings.default_max_concurrency, None);
    }

    #[test]
    fn test_unit_timeout() {
        let settings = EngineSettings::default();
        assert_eq!(settings.unit_timeout(None), None);
        assert_eq!(
            settings.unit_timeout(Some(250)),
            Some(Duration::from_millis(250))
        );

        let settings = settings.with_unit_timeout(Duration::from_secs(5));
        assert_eq!(settings.unit_timeout(None), Some(Duration::from_secs(5)));
        assert_eq!(
            settings.unit_timeout(Some(10)),
            Some(Duration::from_millis(10))
        );
    }

    #[test]
    fn test_env_overrides() {
        unsafe {
            std::env::set_var("NAMING_MAX_CONCURRENCY", "6");
            std::env::set_var("NAMING_UNIT_TIMEOUT_SECS", "not-a-number");
            std::env::set_var("NAMING_PARK_PAUSED", "FALSE");
        }

        let settings = EngineSettings::from_env();
        assert_eq!(settings.default_max_concurrency, Some(6));
        assert_eq!(settings.default_unit_timeout, None);
        assert!(!settings.park_paused);

        unsafe {
            std::env::remove_var("NAMING_MAX_CONCURRENCY");
            std::env::remove_var("NAMING_UNIT_TIMEOUT_SECS");
            std::env::remove_var("NAMING_PARK_PAUSED");
        }
    }
}
