//! Lifecycle configuration types

use serde::Serialize;
use std::time::Duration;

use crate::config::ThreadsConfig;

/// Settings the lifecycle manager runs with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LifecycleConfig {
    /// Sessions idle for more than this many ticks are evicted
    pub timeout_ticks: u64,
    #[serde(with = "duration_ms")]
    pub tick_interval: Duration,
    /// Dump state every N ticks; 0 disables the dump
    pub debug_dump_every: u64,
}

impl LifecycleConfig {
    /// Whether the periodic state dump is due after `tick` ticks
    pub fn dump_due(&self, tick: u64) -> bool {
        self.debug_dump_every > 0 && tick % self.debug_dump_every == 0
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self::from(&ThreadsConfig::default())
    }
}

impl From<&ThreadsConfig> for LifecycleConfig {
    fn from(config: &ThreadsConfig) -> Self {
        Self {
            timeout_ticks: config.effective_timeout(),
            tick_interval: config.tick_interval(),
            debug_dump_every: config.debug_dump_every,
        }
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}
