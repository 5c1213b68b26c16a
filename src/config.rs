//! Tunable policies for retries, shutdown budgets, and forwarding defaults.
//!
//! Settings are plain serde structs so they can be loaded from a TOML file
//! and layered: a later source overrides scalar values that differ from the
//! defaults, mirroring how the embedding runtime merges its configuration
//! sources.

use serde::Deserialize;
use std::time::Duration;

/// Retry policy for bridge launches and per-connection guest dials.
///
/// Delays grow exponentially from `base_delay_ms` and are capped at
/// `max_delay_ms`. The base delay is also used as the sleep between
/// relaunches inside the guest-side restart loop.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Number of retries after the initial attempt.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// The base delay as a [`Duration`].
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// The delay cap as a [`Duration`].
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Delay to wait after the given zero-based attempt.
    ///
    /// Doubles per attempt, capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        // Cap the shift so large attempt numbers cannot overflow the factor.
        let factor = 1u64 << attempt.min(16);
        let millis = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(millis)
    }
}

/// Time budgets for the cascading workload teardown.
///
/// Each phase is bounded independently; the master budget is the final
/// backstop for the whole sequence. The phase budgets summing to less than
/// the master budget is a design target, not an enforced invariant.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TimeoutBudget {
    /// Overall ceiling for the teardown sequence, in seconds.
    pub master_secs: u64,
    /// Budget for stopping the port forwarding service, in seconds.
    pub forwarder_secs: u64,
    /// Budget for disconnecting the control channel, in seconds.
    pub channel_secs: u64,
    /// Budget for stopping the execution context, in seconds. The longest
    /// phase since context teardown is the most expensive step.
    pub context_secs: u64,
}

impl Default for TimeoutBudget {
    fn default() -> Self {
        Self {
            master_secs: 30,
            forwarder_secs: 5,
            channel_secs: 3,
            context_secs: 15,
        }
    }
}

impl TimeoutBudget {
    /// Master budget as a [`Duration`].
    pub fn master(&self) -> Duration {
        Duration::from_secs(self.master_secs)
    }

    /// Forwarder phase budget as a [`Duration`].
    pub fn forwarder(&self) -> Duration {
        Duration::from_secs(self.forwarder_secs)
    }

    /// Control channel phase budget as a [`Duration`].
    pub fn channel(&self) -> Duration {
        Duration::from_secs(self.channel_secs)
    }

    /// Execution context phase budget as a [`Duration`].
    pub fn context(&self) -> Duration {
        Duration::from_secs(self.context_secs)
    }
}

/// Port and timing defaults for a forwarding rule.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ForwardSettings {
    /// TCP port to listen on host-side. 0 means "not configured".
    pub host_port: u16,
    /// Transport port the guest-side bridge listens on. 0 means "not configured".
    pub transport_port: u32,
    /// Guest-local TCP port the bridge forwards to. 0 means "not configured".
    pub guest_port: u16,
    /// Pause between bridge launch and listener start, in milliseconds.
    pub settle_delay_ms: u64,
    /// How long to wait for the host listener to become ready, in milliseconds.
    pub ready_timeout_ms: u64,
}

impl Default for ForwardSettings {
    fn default() -> Self {
        Self {
            host_port: 0,
            transport_port: 0,
            guest_port: 0,
            settle_delay_ms: 300,
            ready_timeout_ms: 5_000,
        }
    }
}

impl ForwardSettings {
    /// Settle delay as a [`Duration`].
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Listener readiness timeout as a [`Duration`].
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

/// Top-level settings, loadable from TOML.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Forwarding rule defaults.
    pub forward: ForwardSettings,
    /// Retry policy for bridge launches and guest dials.
    pub retry: RetryPolicy,
    /// Teardown time budgets.
    pub shutdown: TimeoutBudget,
}

impl Settings {
    /// Parse settings from a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }

    /// Merge another settings layer into this one.
    ///
    /// Scalars that differ from their defaults override; untouched values
    /// keep the lower layer's value.
    pub fn merge(&mut self, other: Settings) {
        let forward_defaults = ForwardSettings::default();
        if other.forward.host_port != forward_defaults.host_port {
            self.forward.host_port = other.forward.host_port;
        }
        if other.forward.transport_port != forward_defaults.transport_port {
            self.forward.transport_port = other.forward.transport_port;
        }
        if other.forward.guest_port != forward_defaults.guest_port {
            self.forward.guest_port = other.forward.guest_port;
        }
        if other.forward.settle_delay_ms != forward_defaults.settle_delay_ms {
            self.forward.settle_delay_ms = other.forward.settle_delay_ms;
        }
        if other.forward.ready_timeout_ms != forward_defaults.ready_timeout_ms {
            self.forward.ready_timeout_ms = other.forward.ready_timeout_ms;
        }
        if other.retry != RetryPolicy::default() {
            self.retry = other.retry;
        }
        if other.shutdown != TimeoutBudget::default() {
            self.shutdown = other.shutdown;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
        };

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        // Capped at max_delay_ms
        assert_eq!(policy.delay_for(4), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_retry_delay_overflow_safe() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay_ms: u64::MAX / 2,
            max_delay_ms: u64::MAX,
        };
        // Must not panic on multiply overflow
        let _ = policy.delay_for(16);
    }

    #[test]
    fn test_budget_defaults() {
        let budget = TimeoutBudget::default();
        assert_eq!(budget.master(), Duration::from_secs(30));
        assert_eq!(budget.forwarder(), Duration::from_secs(5));
        assert_eq!(budget.channel(), Duration::from_secs(3));
        assert_eq!(budget.context(), Duration::from_secs(15));
    }

    #[test]
    fn test_settings_from_toml() {
        let settings = Settings::from_toml_str(
            r#"
            [forward]
            host_port = 8080
            transport_port = 9000
            guest_port = 3000

            [retry]
            max_retries = 2
            base_delay_ms = 250

            [shutdown]
            master_secs = 10
            "#,
        )
        .unwrap();

        assert_eq!(settings.forward.host_port, 8080);
        assert_eq!(settings.forward.transport_port, 9000);
        assert_eq!(settings.forward.guest_port, 3000);
        assert_eq!(settings.retry.max_retries, 2);
        assert_eq!(settings.retry.base_delay_ms, 250);
        // Unset fields fall back to defaults
        assert_eq!(settings.retry.max_delay_ms, 5_000);
        assert_eq!(settings.shutdown.master_secs, 10);
        assert_eq!(settings.shutdown.context_secs, 15);
    }

    #[test]
    fn test_settings_from_toml_empty() {
        let settings = Settings::from_toml_str("").unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_settings_merge_overrides_non_default() {
        let mut base = Settings::from_toml_str(
            r#"
            [forward]
            host_port = 8080
            guest_port = 3000
            "#,
        )
        .unwrap();

        let overlay = Settings::from_toml_str(
            r#"
            [forward]
            host_port = 9090

            [shutdown]
            master_secs = 12
            "#,
        )
        .unwrap();

        base.merge(overlay);

        assert_eq!(base.forward.host_port, 9090);
        // Kept from the base layer
        assert_eq!(base.forward.guest_port, 3000);
        assert_eq!(base.shutdown.master_secs, 12);
    }
}
