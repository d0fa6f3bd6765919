//! Silent-connection detection.
//!
//! The monitor remembers when the network last said anything. The provider
//! checks it on every tick of [`LivenessMonitor::tick_interval`] and closes
//! a connection that has been quiet for longer than the timeout.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone)]
pub(crate) struct LivenessMonitor {
    timeout: Duration,
    last_message: Instant,
}

impl LivenessMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_message: Instant::now(),
        }
    }

    /// Record inbound activity (connection open or any frame).
    pub fn touch(&mut self) {
        self.last_message = Instant::now();
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// How often the provider should call [`Self::is_stale`].
    pub fn tick_interval(&self) -> Duration {
        (self.timeout / 10).max(Duration::from_millis(1))
    }

    pub fn is_stale(&self) -> bool {
        self.last_message.elapsed() > self.timeout
    }

    pub fn last_message(&self) -> Instant {
        self.last_message
    }
}
