//! Error types for Orchflow.
//!
//! All errors in Orchflow are represented by the `OrchflowError` enum.
//! Structural definition problems are reported separately as [`CompileError`]
//! and callback rejections as [`RejectReason`], both of which nest into it.

use std::{io::ErrorKind, string::FromUtf8Error};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for all Orchflow operations.
#[derive(Deserialize, Serialize, Error, Debug, Clone, PartialEq)]
pub enum OrchflowError {
    /// Engine-level errors (startup, shutdown, lifecycle).
    #[error("{0}")]
    Engine(String),

    /// Configuration parsing or validation errors.
    #[error("{0}")]
    Config(String),

    /// Data conversion errors (JSON, TOML).
    #[error("{0}")]
    Convert(String),

    /// The workflow definition failed to compile.
    #[error("compile error: {0}")]
    Compile(#[from] CompileError),

    /// The agent runtime could not be reached, or quota denied the dispatch.
    #[error("dispatch error: {0}")]
    Dispatch(String),

    /// A completion callback was rejected.
    #[error("callback rejected: {0}")]
    Callback(RejectReason),

    /// A deadline was exceeded.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Control signal: the node is waiting for a human decision.
    #[error("approval required: {0}")]
    ApprovalRequired(String),

    /// Malformed node config or input payload.
    #[error("validation error: {0}")]
    Validation(String),

    /// Approval decision errors (unknown request, already decided, missing comment).
    #[error("{0}")]
    Approval(String),

    /// Run lookup or lifecycle errors.
    #[error("{0}")]
    Run(String),

    /// Illegal node run state transition.
    #[error("{0}")]
    Transition(String),

    /// Storage operation errors.
    #[error("{0}")]
    Store(String),

    /// I/O operation errors.
    #[error("{0}")]
    IoError(String),

    /// Message queue errors.
    #[error("{0}")]
    Queue(String),
}

/// Structural problems found while compiling a workflow definition.
#[derive(Deserialize, Serialize, Error, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompileError {
    #[error("cycle detected at node '{node}' (cycles are only allowed through a loop node)")]
    CycleDetected {
        node: String,
    },

    #[error("node '{node}' references unknown node '{reference}'")]
    UnknownReference {
        node: String,
        reference: String,
    },

    #[error("node '{node}' has missing or invalid config: {reason}")]
    MissingConfig {
        node: String,
        reason: String,
    },

    #[error("loop node '{node}' has a conflicting bound: {reason}")]
    ConflictingLoopBound {
        node: String,
        reason: String,
    },

    #[error("duplicate node id '{node}'")]
    DuplicateNode {
        node: String,
    },

    #[error("node '{node}' has unknown type '{node_type}'")]
    UnknownNodeType {
        node: String,
        node_type: String,
    },

    #[error("workflow has no trigger node")]
    MissingTrigger,

    #[error("invalid edge {from} -> {to}: {reason}")]
    InvalidEdge {
        from: String,
        to: String,
        reason: String,
    },

    #[error("loop node '{node}' has an invalid body: {reason}")]
    InvalidLoopBody {
        node: String,
        reason: String,
    },

    #[error("node '{node}' has no incoming edge and is not a trigger")]
    Unreachable {
        node: String,
    },
}

/// Reasons a completion callback is rejected by the ingress.
#[derive(Deserialize, Serialize, Error, Debug, Clone, Copy, PartialEq, Eq, strum::AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RejectReason {
    #[error("unknown_run")]
    UnknownRun,
    #[error("secret_mismatch")]
    SecretMismatch,
    #[error("already_terminal")]
    AlreadyTerminal,
    #[error("malformed_payload")]
    MalformedPayload,
    /// the run's command queue is full; the callback may be retried
    #[error("queue_full")]
    QueueFull,
}

impl From<OrchflowError> for String {
    fn from(val: OrchflowError) -> Self {
        val.to_string()
    }
}

impl From<RejectReason> for OrchflowError {
    fn from(reason: RejectReason) -> Self {
        OrchflowError::Callback(reason)
    }
}

impl From<std::io::Error> for OrchflowError {
    fn from(error: std::io::Error) -> Self {
        OrchflowError::IoError(error.to_string())
    }
}

impl From<OrchflowError> for std::io::Error {
    fn from(val: OrchflowError) -> Self {
        #[allow(clippy::io_other_error)]
        std::io::Error::new(ErrorKind::Other, val.to_string())
    }
}

impl From<FromUtf8Error> for OrchflowError {
    fn from(_: FromUtf8Error) -> Self {
        OrchflowError::Convert("Error with utf-8 string convert".to_string())
    }
}

impl From<serde_json::Error> for OrchflowError {
    fn from(error: serde_json::Error) -> Self {
        OrchflowError::Convert(error.to_string())
    }
}

impl From<toml::de::Error> for OrchflowError {
    fn from(error: toml::de::Error) -> Self {
        OrchflowError::Config(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_error_nests() {
        let err: OrchflowError = CompileError::MissingTrigger.into();
        assert!(matches!(err, OrchflowError::Compile(CompileError::MissingTrigger)));
        assert_eq!(err.to_string(), "compile error: workflow has no trigger node");
    }

    #[test]
    fn test_reject_reason_serializes_snake_case() {
        let value = serde_json::to_value(RejectReason::SecretMismatch).unwrap();
        assert_eq!(value, serde_json::json!("secret_mismatch"));
        assert_eq!(RejectReason::AlreadyTerminal.as_ref(), "already_terminal");
    }
}
