// src/config_helpers.rs
// Helper functions for loading environment variables

use std::env;

pub fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

pub fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_falls_back_when_unset() {
        assert_eq!(env_or("MCP_CLIENT_RUNTIME_TEST_UNSET", "fallback"), "fallback");
    }

    #[test]
    fn env_usize_falls_back_on_unparsable() {
        unsafe {
            env::set_var("MCP_CLIENT_RUNTIME_TEST_USIZE", "not-a-number");
        }
        assert_eq!(env_usize("MCP_CLIENT_RUNTIME_TEST_USIZE", 42), 42);
        unsafe {
            env::remove_var("MCP_CLIENT_RUNTIME_TEST_USIZE");
        }
    }
}
