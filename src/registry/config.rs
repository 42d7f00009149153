//! Registry configuration

use std::time::Duration;

/// Stream fan-out settings
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Messages queued per consumer before the oldest are dropped
    pub consumer_capacity: usize,

    /// How long a consumer may stay saturated before it is detached
    pub saturation_grace: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            consumer_capacity: 1024,
            saturation_grace: Duration::from_secs(5),
        }
    }
}

impl RegistryConfig {
    /// Set the per-consumer queue capacity (at least 1)
    pub fn consumer_capacity(mut self, capacity: usize) -> Self {
        self.consumer_capacity = capacity.max(1);
        self
    }

    /// Set the saturation grace period
    pub fn saturation_grace(mut self, grace: Duration) -> Self {
        self.saturation_grace = grace;
        self
    }
}
