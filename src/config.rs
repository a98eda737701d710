//! Engine configuration.
//!
//! This engine has enough independently-tunable timings (device liveness
//! windows, retry backoff, bootstrap jitter) that bundling them into one
//! validated struct, the way a long-running service typically does, beats
//! scattering `const`s across modules.

use std::time::Duration;

use crate::error::EngineError;

/// Tunable timings for the engine's background subsystems. All fields have
/// sensible defaults; `validate` enforces the bounds and cross-field
/// orderings a correctly-configured engine must satisfy.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How often the device registry re-evaluates online/expiry status.
    pub device_check_interval: Duration,
    /// Per-check timeout for an online-check round trip.
    pub device_check_timeout: Duration,
    /// A device with no heartbeat in this window is considered offline.
    pub online_threshold: Duration,
    /// A device with no heartbeat in this window is forgotten entirely.
    pub expiry_threshold: Duration,
    /// Maximum retry attempts before a pending message is marked failed.
    pub max_retries: u32,
    /// Base retry backoff; actual delay grows with attempt count.
    pub retry_backoff_base: Duration,
    /// Timeout for a single request/response round trip (router default).
    pub request_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device_check_interval: Duration::from_secs(20),
            device_check_timeout: Duration::from_secs(5),
            online_threshold: Duration::from_secs(10 * 60),
            expiry_threshold: Duration::from_secs(3 * 24 * 60 * 60),
            max_retries: 5,
            retry_backoff_base: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    /// Enforces the bounds a correctly-configured engine must satisfy.
    /// Anything it doesn't name (retry backoff, request timeout) is left to
    /// the caller's judgment. Violations are reported as
    /// `EngineError::InvalidConfig`, distinct from a storage failure — this
    /// is a caller mistake, not something the injected store did.
    pub fn validate(&self) -> Result<(), EngineError> {
        let interval = self.device_check_interval;
        if interval < Duration::from_secs(5) || interval > Duration::from_secs(600) {
            return Err(EngineError::InvalidConfig(format!(
                "device_check_interval must be between 5s and 600s, got {:?}",
                interval
            )));
        }
        if self.device_check_timeout >= self.device_check_interval {
            return Err(EngineError::InvalidConfig(
                "device_check_timeout must be smaller than device_check_interval".to_string(),
            ));
        }
        if self.online_threshold >= self.expiry_threshold {
            return Err(EngineError::InvalidConfig(
                "online_threshold must be smaller than expiry_threshold".to_string(),
            ));
        }
        Ok(())
    }
}
