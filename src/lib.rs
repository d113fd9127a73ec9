//! # Orchflow
//!
//! Orchflow is an event-driven orchestration core for asynchronous multi-agent
//! workflows. It is designed to be embedded in applications that hand work to an
//! external agent runtime and wait for completion callbacks.
//!
//! ## Core Features
//!
//! - **Compiled definitions**: workflow documents are validated and turned into an
//!   execution plan before any run starts
//! - **One coordinator per run**: every state change of a run is serialized through
//!   its own command queue
//! - **Callback security**: each agent dispatch carries a one-time secret that the
//!   completion callback must echo
//! - **Human-in-the-loop**: agent outputs can be gated behind approval decisions
//! - **Loops, branches and merges**: bounded loops with generation-tagged node runs
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use orchflow::{EngineBuilder, WorkflowModel};
//!
//! let engine = EngineBuilder::new().agent_runtime(runtime).build()?;
//! engine.launch();
//!
//! let workflow = WorkflowModel::from_json(json_str)?;
//! engine.deploy(&workflow)?;
//! let run_id = engine.start_run(&workflow.id, serde_json::json!({}))?;
//! ```

mod builder;
mod common;
pub mod config;
pub mod coordinator;
mod engine;
mod error;
pub mod events;
pub mod gateway;
pub mod hitl;
pub mod ingress;
mod model;
pub mod runtime;
pub mod server;
pub mod store;
mod utils;
pub mod workflow;

use std::sync::{Arc, RwLock};

pub use builder::EngineBuilder;
pub use config::Config;
pub use engine::{Engine, Schedule};
pub use error::{CompileError, OrchflowError, RejectReason};
pub use model::*;
pub use runtime::{ChannelEvent, ChannelOptions};
pub use workflow::{ExecutionPlan, compile};

/// Result type alias for Orchflow operations.
pub type Result<T> = std::result::Result<T, OrchflowError>;

/// Thread-safe shared lock wrapper using Arc<RwLock<T>>.
pub(crate) type ShareLock<T> = Arc<RwLock<T>>;
