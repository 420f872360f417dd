//! Session counters reported by the orchestrator and exposed on `/health`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::session::TerminationCause;

#[derive(Debug, Default)]
pub struct SessionMetrics {
    active: AtomicU64,
    total: AtomicU64,
    rejected: AtomicU64,
    ended: [AtomicU64; TerminationCause::ALL.len()],
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub active_sessions: u64,
    pub total_sessions: u64,
    pub rejected_connections: u64,
    pub terminations: Vec<TerminationCount>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TerminationCount {
    pub cause: &'static str,
    pub count: u64,
}

impl SessionMetrics {
    pub fn session_started(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_ended(&self, cause: TerminationCause) {
        let _ = self
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        self.ended[cause as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// A connection that never reached a running session (forbidden host,
    /// spawn failure, bad token).
    pub fn rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_sessions: self.active.load(Ordering::Relaxed),
            total_sessions: self.total.load(Ordering::Relaxed),
            rejected_connections: self.rejected.load(Ordering::Relaxed),
            terminations: TerminationCause::ALL
                .iter()
                .map(|cause| TerminationCount {
                    cause: cause.as_str(),
                    count: self.ended[*cause as usize].load(Ordering::Relaxed),
                })
                .collect(),
        }
    }
}
