use std::time::Duration;

/// Controls how long the client waits before reconnecting and how the
/// server waits before re-opening a serial port
pub trait RetryStrategy: Send {
    /// Reset internal state. Called when a connection is established or a port is opened
    fn reset(&mut self);
    /// Return the delay before making another connection/open attempt after a failure
    fn after_failed_connect(&mut self) -> Duration;
    /// Return the delay to wait after a disconnect before attempting to reconnect
    fn after_disconnect(&mut self) -> Duration;
}

/// Return a [`RetryStrategy`] that always waits `delay`
pub fn fixed_retry_strategy(delay: Duration) -> Box<dyn RetryStrategy> {
    doubling_retry_strategy(delay, delay)
}

/// Return a [`RetryStrategy`] that doubles on each failed attempt up to a maximum value
///
/// A `max` smaller than `min` is treated as equal to `min`.
pub fn doubling_retry_strategy(min: Duration, max: Duration) -> Box<dyn RetryStrategy> {
    Box::new(Doubling::new(min, max))
}

struct Doubling {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Doubling {
    fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            current: min,
        }
    }
}

impl RetryStrategy for Doubling {
    fn reset(&mut self) {
        self.current = self.min;
    }

    fn after_failed_connect(&mut self) -> Duration {
        let ret = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        ret
    }

    fn after_disconnect(&mut self) -> Duration {
        self.min
    }
}
