// src/state.rs
// Connection state machine (distilled §4.5).
//
//            connect()           initialize ok
//   idle ─────────────────▶ connecting ─────────────▶ ready
//    ▲                         │                       │
//    │                         │ initialize fail       │ disconnect / delete
//    │                         ▼                       ▼
//    │                      failed ◀──────────── (disconnect from any state)
//    │                         │
//    │              retry_on_failure & selected
//    │                         ▼
//    └──────── reconnecting (attempt, scheduled_at) ── fires ──▶ connect()
//
// Invariant: at most one of `{Connecting, Reconnecting}` plus one retry
// task may exist per server at any time; `disconnect` from any state
// cancels pending work and drives to `Idle`.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Ready,
    Reconnecting {
        attempt: u32,
        scheduled_at: DateTime<Utc>,
        reason: String,
    },
    Failed {
        reason: String,
    },
}

impl ConnectionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }

    pub fn is_settling(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Reconnecting { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Reconnecting { .. } => "reconnecting",
            ConnectionState::Failed { .. } => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_is_the_only_ready_state() {
        assert!(ConnectionState::Ready.is_ready());
        assert!(!ConnectionState::Idle.is_ready());
        assert!(!ConnectionState::Failed { reason: "x".into() }.is_ready());
    }

    #[test]
    fn settling_covers_connecting_and_reconnecting() {
        assert!(ConnectionState::Connecting.is_settling());
        assert!(ConnectionState::Reconnecting {
            attempt: 1,
            scheduled_at: Utc::now(),
            reason: "x".into()
        }
        .is_settling());
        assert!(!ConnectionState::Ready.is_settling());
    }
}
