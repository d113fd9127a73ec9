//! Pure evaluators used by the run coordinator.

mod condition;
mod filter;
mod loops;
mod merge;
mod path;

pub use condition::{Operator, Predicate, compare};
pub use filter::apply_filter;
pub use loops::{LoopBound, LoopCursor};
pub use merge::{MergeStrategy, merge};
pub use path::lookup;
