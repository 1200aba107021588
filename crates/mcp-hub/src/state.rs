//! Connection lifecycle states and reconnection backoff

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Lifecycle state of a server connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Configured, never connected (initial)
    Disconnected,
    /// Transport being established and handshake in progress
    Connecting,
    /// Handshake done, tools registered
    Connected,
    /// Transport reported an error; reconnection pending
    Degraded,
    /// Reconnect attempt in progress
    Reconnecting,
    /// Initial connect or retry budget exhausted
    Failed,
    /// Terminal: removed explicitly or by shutdown
    Removed,
}

impl ConnectionState {
    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Removed, _) => false,
            (_, Removed) => true,
            (Disconnected, Connecting)
            | (Connecting, Connected)
            | (Connecting, Failed)
            | (Connected, Degraded)
            | (Degraded, Reconnecting)
            | (Reconnecting, Connected)
            | (Reconnecting, Degraded)
            | (Reconnecting, Failed)
            | (Degraded, Failed)
            | (Failed, Connecting) => true,
            _ => false,
        }
    }

    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }

    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Removed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
            Self::Removed => "removed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capped exponential backoff used for reconnection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first attempt in milliseconds
    pub base_delay_ms: u64,
    /// Growth factor between attempts
    pub multiplier: f64,
    /// Upper bound for a single delay in milliseconds
    pub max_delay_ms: u64,
    /// Attempts before the server is marked failed
    pub max_attempts: u32,
    /// Jitter factor (0.0 - 1.0); 0 disables jitter
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            max_attempts: 5,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Policy with a fixed delay, mostly useful in tests
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay_ms: delay.as_millis() as u64,
            multiplier: 1.0,
            max_delay_ms: delay.as_millis() as u64,
            max_attempts,
            jitter: 0.0,
        }
    }

    /// Delay before the given attempt (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let mut delay_ms = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);

        if self.jitter > 0.0 {
            let jitter = self.jitter.min(1.0);
            delay_ms *= 1.0 + (fastrand::f64() - 0.5) * 2.0 * jitter;
        }

        let capped = delay_ms.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Whether another attempt is allowed after `attempts` have been made
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn test_happy_path_transitions() {
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Degraded));
        assert!(Degraded.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Connected));
        assert!(Reconnecting.can_transition_to(Failed));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Connected.can_transition_to(Connected));
        assert!(!Degraded.can_transition_to(Degraded));
        assert!(!Failed.can_transition_to(Connected));
    }

    #[test]
    fn test_removed_is_terminal() {
        for state in [
            Disconnected,
            Connecting,
            Connected,
            Degraded,
            Reconnecting,
            Failed,
        ] {
            assert!(state.can_transition_to(Removed));
            assert!(!Removed.can_transition_to(state));
        }
        assert!(!Removed.can_transition_to(Removed));
    }

    #[test]
    fn test_default_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_millis(1000));
        assert_eq!(policy.delay(3), Duration::from_millis(2000));
        assert_eq!(policy.delay(10), Duration::from_secs(30));
        assert!(policy.allows(5));
        assert!(!policy.allows(6));
    }

    #[test]
    fn test_jitter_stays_within_cap() {
        let policy = RetryPolicy {
            jitter: 0.5,
            ..RetryPolicy::default()
        };
        for attempt in 1..20 {
            assert!(policy.delay(attempt) <= Duration::from_secs(30));
        }
    }

    #[test]
    fn test_fixed_policy() {
        let policy = RetryPolicy::fixed(Duration::from_millis(20), 2);
        assert_eq!(policy.delay(1), Duration::from_millis(20));
        assert_eq!(policy.delay(4), Duration::from_millis(20));
    }
}
