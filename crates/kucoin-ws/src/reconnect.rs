//! Reconnect policy for the connection loop
//!
//! [`ReconnectConfig`] holds the tunables. [`ReconnectTracker`] applies them
//! to the failures of one socket manager and decides whether the next attempt
//! runs, how long it waits and which advertised endpoint it dials.

use kucoin_types::StreamError;
use rand::Rng;
use std::time::Duration;

/// Backoff and give-up settings
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Wait before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any wait
    pub max_delay: Duration,
    /// Growth factor between consecutive waits
    pub multiplier: f64,
    /// Fraction of each wait randomised in both directions
    pub jitter: f64,
    /// Failed attempts in a row before giving up, `None` for no limit
    pub max_attempts: Option<u32>,
    /// Failed bullet token requests in a row before giving up
    pub max_token_failures: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: None,
            max_token_failures: 5,
        }
    }
}

impl ReconnectConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Give up after `max` failed attempts in a row
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }

    /// Give up after `max` failed token requests in a row (at least one)
    pub fn with_max_token_failures(mut self, max: u32) -> Self {
        self.max_token_failures = max.max(1);
        self
    }

    /// Never reconnect: the first failure is terminal
    pub fn disabled() -> Self {
        Self {
            max_attempts: Some(0),
            ..Default::default()
        }
    }

    /// Wait before retrying after `failures` consecutive failed attempts, without jitter
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32) as i32;
        let grown = self.initial_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        Duration::from_secs_f64(grown.min(self.max_delay.as_secs_f64()))
    }

    fn jittered(&self, base: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        base.mul_f64(1.0 + spread)
    }
}

/// What the connection loop does after a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum NextStep {
    /// Wait `delay`, then run attempt number `attempt`
    Retry { attempt: u32, delay: Duration },
    /// Stop for good with this error
    GiveUp(StreamError),
}

/// Failure bookkeeping for one socket manager
///
/// Consecutive failed attempts pick the endpoint: the n-th retry after a
/// welcome frame dials server `n` of the freshly fetched token, wrapping
/// around the list. Token failures are counted separately because they never
/// reach an endpoint.
#[derive(Debug, Clone)]
pub struct ReconnectTracker {
    config: ReconnectConfig,
    failures: u32,
    token_failures: u32,
}

impl ReconnectTracker {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            failures: 0,
            token_failures: 0,
        }
    }

    /// Failed attempts since the last welcome frame
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Failed token requests in a row
    pub fn token_failures(&self) -> u32 {
        self.token_failures
    }

    /// Position in the token's endpoint list for the next attempt
    pub fn endpoint_index(&self) -> usize {
        self.failures as usize
    }

    pub fn token_fetched(&mut self) {
        self.token_failures = 0;
    }

    /// Count a failed token request, returning the streak length
    pub fn token_failed(&mut self) -> u32 {
        self.token_failures += 1;
        self.token_failures
    }

    /// Welcome frame received: the next failure starts over at the first endpoint
    pub fn connected(&mut self) {
        self.failures = 0;
    }

    /// Record a failed attempt and decide what happens next
    ///
    /// Rejected credentials end the manager at once. A token outage ends it
    /// once `max_token_failures` requests failed in a row. Every other error
    /// is retried until `max_attempts` runs out.
    pub fn failed(&mut self, error: &StreamError) -> NextStep {
        match error {
            StreamError::Auth(_) => return NextStep::GiveUp(error.clone()),
            StreamError::TokenFetch(_)
                if self.token_failures >= self.config.max_token_failures.max(1) =>
            {
                return NextStep::GiveUp(StreamError::ReconnectExhausted {
                    attempts: self.token_failures,
                    last_error: error.to_string(),
                });
            }
            _ => {}
        }

        self.failures += 1;
        if let Some(max) = self.config.max_attempts {
            if self.failures >= max {
                return NextStep::GiveUp(StreamError::ReconnectExhausted {
                    attempts: self.failures,
                    last_error: error.to_string(),
                });
            }
        }

        NextStep::Retry {
            attempt: self.failures,
            delay: self.config.jittered(self.config.backoff(self.failures)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steady() -> ReconnectConfig {
        ReconnectConfig::new().with_jitter(0.0)
    }

    fn transport_error() -> StreamError {
        StreamError::Transport("connection reset".into())
    }

    fn token_error() -> StreamError {
        StreamError::TokenFetch("bullet-public returned 503".into())
    }

    #[test]
    fn test_backoff_doubles_from_one_second_up_to_thirty() {
        let config = steady();
        let waits: Vec<u64> = (1..=7).map(|n| config.backoff(n).as_secs()).collect();
        assert_eq!(waits, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(config.backoff(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_with_degenerate_multiplier() {
        let config = steady().with_multiplier(0.5);
        assert_eq!(config.backoff(4), Duration::from_secs(1));
    }

    #[test]
    fn test_retry_delays_stay_within_jitter() {
        let mut tracker = ReconnectTracker::new(ReconnectConfig::new().with_jitter(0.2));
        tracker.failed(&transport_error());
        for _ in 0..50 {
            let mut next = tracker.clone();
            let NextStep::Retry { attempt, delay } = next.failed(&transport_error()) else {
                panic!("expected a retry");
            };
            assert_eq!(attempt, 2);
            assert!(delay >= Duration::from_millis(1599), "{:?}", delay);
            assert!(delay <= Duration::from_millis(2401), "{:?}", delay);
        }
    }

    #[test]
    fn test_failures_walk_the_endpoint_list() {
        let mut tracker = ReconnectTracker::new(steady());
        assert_eq!(tracker.endpoint_index(), 0);

        tracker.failed(&transport_error());
        tracker.failed(&StreamError::HeartbeatTimeout {
            timeout: Duration::from_secs(10),
        });
        assert_eq!(tracker.endpoint_index(), 2);

        tracker.connected();
        assert_eq!(tracker.endpoint_index(), 0);
        assert_eq!(
            tracker.failed(&transport_error()),
            NextStep::Retry {
                attempt: 1,
                delay: Duration::from_secs(1)
            }
        );
    }

    #[test]
    fn test_rejected_credentials_end_immediately() {
        let mut tracker = ReconnectTracker::new(steady());
        let error = StreamError::Auth("invalid API key".into());
        assert_eq!(tracker.failed(&error), NextStep::GiveUp(error));
        assert_eq!(tracker.failures(), 0);
    }

    #[test]
    fn test_token_outage_budget() {
        let mut tracker = ReconnectTracker::new(steady().with_max_token_failures(2));

        assert_eq!(tracker.token_failed(), 1);
        assert!(matches!(tracker.failed(&token_error()), NextStep::Retry { attempt: 1, .. }));

        assert_eq!(tracker.token_failed(), 2);
        match tracker.failed(&token_error()) {
            NextStep::GiveUp(StreamError::ReconnectExhausted { attempts, .. }) => {
                assert_eq!(attempts, 2)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_successful_token_resets_budget() {
        let mut tracker = ReconnectTracker::new(steady().with_max_token_failures(2));
        tracker.token_failed();
        tracker.token_fetched();
        tracker.token_failed();
        assert_eq!(tracker.token_failures(), 1);
        assert!(matches!(tracker.failed(&token_error()), NextStep::Retry { .. }));
    }

    #[test]
    fn test_zero_token_budget_still_allows_one_failure() {
        let config = steady().with_max_token_failures(0);
        assert_eq!(config.max_token_failures, 1);

        let mut tracker = ReconnectTracker::new(config);
        tracker.token_failed();
        assert!(matches!(tracker.failed(&token_error()), NextStep::GiveUp(_)));
    }

    #[test]
    fn test_attempt_cap() {
        let mut tracker = ReconnectTracker::new(steady().with_max_attempts(3));
        assert!(matches!(tracker.failed(&transport_error()), NextStep::Retry { attempt: 1, .. }));
        assert!(matches!(tracker.failed(&transport_error()), NextStep::Retry { attempt: 2, .. }));
        assert!(matches!(
            tracker.failed(&transport_error()),
            NextStep::GiveUp(StreamError::ReconnectExhausted { attempts: 3, .. })
        ));
    }

    #[test]
    fn test_disabled_gives_up_on_first_failure() {
        let mut tracker = ReconnectTracker::new(ReconnectConfig::disabled());
        assert!(matches!(
            tracker.failed(&transport_error()),
            NextStep::GiveUp(StreamError::ReconnectExhausted { attempts: 1, .. })
        ));
    }
}
