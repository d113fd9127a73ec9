//! Workflow compilation: typed nodes, edges, the execution plan and the pure
//! evaluators the coordinator runs inline.

pub mod compiler;
pub mod edge;
pub mod eval;
pub mod node;
pub mod plan;
pub mod template;

pub use compiler::{Compiler, compile};
pub use plan::ExecutionPlan;
