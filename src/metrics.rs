// src/metrics.rs
// Thin instrumentation points via the `metrics` crate facade. The host
// installs whatever recorder it wants (Prometheus, statsd, none); this
// crate only records counters/gauges/histograms at the seams the
// connection manager and tool-call engine already pass through. Carried
// even though the distilled spec's Non-goals exclude a metrics *system*
// (SPEC_FULL.md §1.1) — the instrumentation points are ambient stack, not
// a feature.

use std::time::Duration;

use metrics::{counter, gauge, histogram};

/// A connect attempt resolved, one way or the other.
pub fn record_connect(server_name: &str, success: bool) {
    let status = if success { "ok" } else { "failed" };
    counter!("mcp_connect_attempts_total", "server" => server_name.to_string(), "status" => status).increment(1);
}

/// A reconnect was scheduled after a connect/refresh failure.
pub fn record_reconnect_scheduled(server_name: &str, attempt: u32) {
    counter!("mcp_reconnect_scheduled_total", "server" => server_name.to_string()).increment(1);
    gauge!("mcp_reconnect_attempt", "server" => server_name.to_string()).set(attempt as f64);
}

/// Number of servers currently in the `ready` state.
pub fn set_ready_server_count(count: usize) {
    gauge!("mcp_ready_servers").set(count as f64);
}

/// A managed tool call reached a terminal state.
pub fn record_tool_call(tool_id: &str, outcome: &'static str, elapsed: Duration) {
    counter!("mcp_tool_calls_total", "tool" => tool_id.to_string(), "outcome" => outcome).increment(1);
    histogram!("mcp_tool_call_duration_seconds", "tool" => tool_id.to_string())
        .record(elapsed.as_secs_f64());
}

/// Metadata refresh completed (successfully or not).
pub fn record_metadata_refresh(server_name: &str, success: bool) {
    let status = if success { "ok" } else { "failed" };
    counter!("mcp_metadata_refresh_total", "server" => server_name.to_string(), "status" => status).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    // `metrics` is a no-op facade without an installed recorder; these
    // calls only need to not panic when no recorder is present.
    #[test]
    fn instrumentation_calls_do_not_panic_without_a_recorder() {
        record_connect("test-server", true);
        record_reconnect_scheduled("test-server", 2);
        set_ready_server_count(3);
        record_tool_call("calc", "succeeded", Duration::from_millis(50));
        record_metadata_refresh("test-server", false);
    }
}
