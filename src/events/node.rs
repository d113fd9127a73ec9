use serde::Serialize;

/// Node run transition.
#[derive(Debug, Clone, PartialEq, Serialize, strum::AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NodeEvent {
    Pending,
    Dispatched {
        attempt: u32,
    },
    Running,
    AwaitingApproval {
        approval_id: String,
    },
    Succeeded,
    Failed {
        error: String,
    },
    Skipped,
    TimedOut,
    Cancelled,
    /// a failed or timed out node was re-queued for another attempt
    Retry {
        attempt: u32,
    },
}
