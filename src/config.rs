// src/config.rs
// Runtime tunables for the MCP client runtime

use std::time::Duration;

use crate::config_helpers::{env_or, env_u64, env_usize};

/// Protocol versions this client can negotiate, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// Tunables for the connection manager, tool-call engine, and governance
/// log. All fields have sane defaults so a host can embed the runtime
/// without any environment configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Base delay for reconnect backoff.
    pub reconnect_base: Duration,
    /// Cap for reconnect backoff.
    pub reconnect_max: Duration,
    /// Number of automatic reconnect attempts before giving up.
    pub reconnect_max_attempts: u32,
    /// Metadata cache staleness threshold.
    pub metadata_ttl: Duration,
    /// Poll interval for the descriptor-set configuration watcher.
    pub config_watch_interval: Duration,
    /// Poll interval for the managed tool-call watchdog.
    pub watchdog_tick: Duration,
    /// Capacity of the bounded governance log ring.
    pub governance_log_capacity: usize,
    /// Default idle timeout for a managed tool call when the host doesn't
    /// specify one.
    pub default_idle_timeout: Duration,
    /// Default total timeout for a managed tool call when the host doesn't
    /// specify one.
    pub default_total_timeout: Duration,
    /// Grace period after a call reaches a terminal state before it is
    /// pruned from the active-call table.
    pub terminal_grace: Duration,
    /// Client name/version advertised during `initialize` unless a
    /// descriptor overrides it.
    pub client_name: String,
    pub client_version: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            reconnect_max_attempts: 5,
            metadata_ttl: Duration::from_secs(300),
            config_watch_interval: Duration::from_secs(2),
            watchdog_tick: Duration::from_millis(250),
            governance_log_capacity: 1_200,
            default_idle_timeout: Duration::from_secs(60),
            default_total_timeout: Duration::from_secs(300),
            terminal_grace: Duration::from_secs(1),
            client_name: "mcp-client-runtime".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Load tunables from the environment, falling back to defaults for
    /// anything unset. Unlike the host application's own config, none of
    /// these are mandatory — a missing or unparsable value just keeps the
    /// default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            reconnect_base: Duration::from_millis(env_u64(
                "MCP_RECONNECT_BASE_MS",
                defaults.reconnect_base.as_millis() as u64,
            )),
            reconnect_max: Duration::from_millis(env_u64(
                "MCP_RECONNECT_MAX_MS",
                defaults.reconnect_max.as_millis() as u64,
            )),
            reconnect_max_attempts: env_usize(
                "MCP_RECONNECT_MAX_ATTEMPTS",
                defaults.reconnect_max_attempts as usize,
            ) as u32,
            metadata_ttl: Duration::from_secs(env_u64(
                "MCP_METADATA_TTL_SECS",
                defaults.metadata_ttl.as_secs(),
            )),
            config_watch_interval: Duration::from_millis(env_u64(
                "MCP_CONFIG_WATCH_MS",
                defaults.config_watch_interval.as_millis() as u64,
            )),
            watchdog_tick: Duration::from_millis(env_u64(
                "MCP_WATCHDOG_TICK_MS",
                defaults.watchdog_tick.as_millis() as u64,
            )),
            governance_log_capacity: env_usize(
                "MCP_GOVERNANCE_LOG_CAP",
                defaults.governance_log_capacity,
            ),
            default_idle_timeout: Duration::from_millis(env_u64(
                "MCP_DEFAULT_IDLE_TIMEOUT_MS",
                defaults.default_idle_timeout.as_millis() as u64,
            )),
            default_total_timeout: Duration::from_millis(env_u64(
                "MCP_DEFAULT_TOTAL_TIMEOUT_MS",
                defaults.default_total_timeout.as_millis() as u64,
            )),
            terminal_grace: Duration::from_millis(env_u64(
                "MCP_TERMINAL_GRACE_MS",
                defaults.terminal_grace.as_millis() as u64,
            )),
            client_name: env_or("MCP_CLIENT_NAME", &defaults.client_name),
            client_version: defaults.client_version,
        }
    }

    /// Backoff delay for the nth reconnect attempt (1-indexed), per
    /// `delay(n) = min(max, base * 2^(n-1))`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
        let base_ms = self.reconnect_base.as_millis() as u64;
        let scaled = base_ms.saturating_mul(factor);
        Duration::from_millis(scaled.min(self.reconnect_max.as_millis() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(cfg.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(cfg.backoff_delay(3), Duration::from_secs(4));
        assert_eq!(cfg.backoff_delay(4), Duration::from_secs(8));
        assert_eq!(cfg.backoff_delay(5), Duration::from_secs(16));
        // 2^5 = 32s, capped at 30s
        assert_eq!(cfg.backoff_delay(6), Duration::from_secs(30));
        assert_eq!(cfg.backoff_delay(100), Duration::from_secs(30));
    }

    #[test]
    fn defaults_match_spec() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.reconnect_max_attempts, 5);
        assert_eq!(cfg.metadata_ttl, Duration::from_secs(300));
        assert_eq!(cfg.governance_log_capacity, 1_200);
    }
}
