//! Pure reconnection and token refresh decisions
//!
//! Nothing here performs I/O; the publisher's driver task and the
//! subscriber's listener loop ask these functions what to do next.

use super::connection::ConnectionState;
use crate::config::MqttConfig;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{error, info};

/// Fraction of a token's remaining lifetime after which it is refreshed
pub const TOKEN_REFRESH_RATIO: f64 = 0.8;

/// Refreshes are never scheduled sooner than this
pub const MIN_TOKEN_REFRESH_DELAY: Duration = Duration::from_secs(60);

/// Retry policy derived from `reconnect_interval` and `max_reconnect_attempts`
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// 0 means unlimited
    pub max_attempts: u32,
    pub delay: Duration,
}

impl ReconnectPolicy {
    pub fn from_config(config: &MqttConfig) -> Self {
        Self {
            max_attempts: config.max_reconnect_attempts,
            delay: config.reconnect_delay(),
        }
    }

    /// Decide whether attempt `current_attempts + 1` should happen
    pub fn decide(&self, current_attempts: u32, shutdown_requested: bool) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if self.max_attempts > 0 && current_attempts >= self.max_attempts {
            return ReconnectionDecision::AbortMaxAttemptsExceeded;
        }

        ReconnectionDecision::Proceed {
            attempt: current_attempts + 1,
            delay: self.delay,
        }
    }

    /// Human readable attempt bound for log lines
    pub fn max_display(&self) -> String {
        if self.max_attempts == 0 {
            "∞".to_string()
        } else {
            self.max_attempts.to_string()
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Proceed with reconnection attempt
    Proceed { attempt: u32, delay: Duration },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - max attempts exceeded
    AbortMaxAttemptsExceeded,
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    ConnAckReceived,
    DisconnectedByBroker,
    NetworkError(String),
    ReconnectionStarted(u32),
    PermanentFailure(String),
}

/// Next connection state after an event, logging the transition
pub fn determine_next_state(event: ConnectionEvent) -> ConnectionState {
    match event {
        ConnectionEvent::ConnAckReceived => {
            info!("MQTT connection established");
            ConnectionState::Connected
        }
        ConnectionEvent::DisconnectedByBroker => {
            info!("MQTT broker closed the connection");
            ConnectionState::Disconnected("Broker disconnected".to_string())
        }
        ConnectionEvent::NetworkError(error) => {
            error!("MQTT event loop error: {}", error);
            ConnectionState::Disconnected(error)
        }
        ConnectionEvent::ReconnectionStarted(attempt) => {
            info!("Starting reconnection attempt {}", attempt);
            ConnectionState::Reconnecting(attempt)
        }
        ConnectionEvent::PermanentFailure(reason) => {
            error!("Permanent connection failure: {}", reason);
            ConnectionState::PermanentlyDisconnected(reason)
        }
    }
}

/// Delay before a token expiring at `expires_at` should be refreshed:
/// `max(0.8 * remaining, 60s)`.
pub fn token_refresh_delay(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    let remaining_ms = (expires_at - now).num_milliseconds().max(0) as f64;
    let delay = Duration::from_millis((remaining_ms * TOKEN_REFRESH_RATIO) as u64);
    delay.max(MIN_TOKEN_REFRESH_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            delay: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_unlimited_policy_always_proceeds() {
        let policy = policy(0);
        assert_eq!(
            policy.decide(0, false),
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay: Duration::from_secs(5)
            }
        );
        assert_eq!(
            policy.decide(10_000, false),
            ReconnectionDecision::Proceed {
                attempt: 10_001,
                delay: Duration::from_secs(5)
            }
        );
        assert_eq!(policy.max_display(), "∞");
    }

    #[test]
    fn test_bounded_policy_aborts_after_max() {
        let policy = policy(3);
        assert!(matches!(
            policy.decide(2, false),
            ReconnectionDecision::Proceed { attempt: 3, .. }
        ));
        assert_eq!(
            policy.decide(3, false),
            ReconnectionDecision::AbortMaxAttemptsExceeded
        );
        assert_eq!(policy.max_display(), "3");
    }

    #[test]
    fn test_shutdown_wins() {
        assert_eq!(
            policy(0).decide(0, true),
            ReconnectionDecision::AbortShutdownRequested
        );
    }

    #[test]
    fn test_policy_from_config() {
        let mut config = MqttConfig::default();
        config.reconnect_interval = 0.5;
        config.max_reconnect_attempts = 7;

        let policy = ReconnectPolicy::from_config(&config);
        assert_eq!(policy.max_attempts, 7);
        assert_eq!(policy.delay, Duration::from_millis(500));
    }

    #[test]
    fn test_determine_next_state() {
        assert_eq!(
            determine_next_state(ConnectionEvent::ConnAckReceived),
            ConnectionState::Connected
        );
        assert_eq!(
            determine_next_state(ConnectionEvent::NetworkError("timeout".to_string())),
            ConnectionState::Disconnected("timeout".to_string())
        );
        assert_eq!(
            determine_next_state(ConnectionEvent::ReconnectionStarted(2)),
            ConnectionState::Reconnecting(2)
        );
        assert!(matches!(
            determine_next_state(ConnectionEvent::PermanentFailure("x".to_string())),
            ConnectionState::PermanentlyDisconnected(_)
        ));
    }

    #[test]
    fn test_token_refresh_at_eighty_percent() {
        let now = Utc::now();
        let delay = token_refresh_delay(now + TimeDelta::seconds(100), now);
        assert_eq!(delay, Duration::from_secs(80));

        let delay = token_refresh_delay(now + TimeDelta::seconds(3600), now);
        assert_eq!(delay, Duration::from_secs(2880));
    }

    #[test]
    fn test_token_refresh_floor() {
        let now = Utc::now();
        assert_eq!(
            token_refresh_delay(now + TimeDelta::seconds(30), now),
            MIN_TOKEN_REFRESH_DELAY
        );
        // Already expired tokens still wait for the floor
        assert_eq!(
            token_refresh_delay(now - TimeDelta::seconds(30), now),
            MIN_TOKEN_REFRESH_DELAY
        );
    }
}
