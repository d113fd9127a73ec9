mod event;
mod workflow;

pub use event::EventRecord;
pub use workflow::WorkflowRecord;
