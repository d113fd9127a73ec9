mod channel;
mod run;

pub use channel::{Channel, ChannelEvent, ChannelOptions};
pub use run::{NodeRun, NodeRunKey, NodeRunStatus, RunId, RunStatus, WorkflowRun};
