use std::time::Duration;

/// Tunables for call sessions.
#[derive(Clone, Debug)]
pub struct CallConfig {
    /// How long an outgoing call may ring before it fails with `Timeout`.
    pub ring_timeout: Duration,
    /// Interval of `DurationTick` events while connected.
    pub duration_tick: Duration,
    /// Buffer size of each event bus channel.
    pub event_capacity: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(45),
            duration_tick: Duration::from_secs(1),
            event_capacity: 100,
        }
    }
}

impl CallConfig {
    pub fn with_ring_timeout(mut self, ring_timeout: Duration) -> Self {
        self.ring_timeout = ring_timeout;
        self
    }

    pub fn with_duration_tick(mut self, duration_tick: Duration) -> Self {
        self.duration_tick = duration_tick;
        self
    }
}
