use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use tokio::runtime::Handle;

use crate::{
    OrchflowError, Result, ShareLock,
    common::{BroadcastQueue, Shutdown},
    events::{Event, Message},
    runtime::RunId,
};

macro_rules! dispatch_event {
    ($handles:expr, $(&$item:ident), +) => {
        if let Ok(handlers) = $handles.read() {
            for handle in handlers.iter() {
                (handle)($(&$item),+);
            }
        }
    };
}

macro_rules! dispatch_event_async {
    ($handles:expr, $(&$item:ident), +) => {
        let handles = $handles.clone();

        tokio::spawn(async move {
            let handlers = match handles.read() {
                Ok(handlers) => handlers.clone(),
                Err(_) => return,
            };
            for handle in handlers.iter() {
                (handle)($(&$item),+).await;
            }
        });
    };
}

const EVENT_QUEUE_SIZE: usize = 4096;

pub type RunEventHandle = Arc<dyn Fn(&Event<Message>) + Send + Sync>;
pub type RunEventHandleAsync = Arc<dyn Fn(&Event<Message>) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// use the glob pattern to match the run id
    /// eg. 3f2a*
    pub run_id: String,

    /// use the glob pattern to match the node id
    /// eg. review_*
    pub node_id: String,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            run_id: "*".to_string(),
            node_id: "*".to_string(),
        }
    }
}

impl ChannelOptions {
    pub fn new(
        run_id: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            node_id: node_id.into(),
        }
    }

    pub fn with_run(run_id: impl Into<String>) -> Self {
        Self::new(run_id, "*")
    }

    pub fn with_node(node_id: impl Into<String>) -> Self {
        Self::new("*", node_id)
    }
}

/// Fan-out of run and node events to registered handlers.
#[derive(Clone)]
pub struct Channel {
    event_queue: Arc<BroadcastQueue<Event<Message>>>,

    events: ShareLock<Vec<RunEventHandle>>,
    events_async: ShareLock<Vec<RunEventHandleAsync>>,

    runtime: Handle,
    shutdown: Arc<Shutdown>,
}

impl Channel {
    pub(crate) fn new(runtime: Handle) -> Self {
        Self {
            event_queue: BroadcastQueue::new(EVENT_QUEUE_SIZE),
            events: Arc::new(RwLock::new(Vec::new())),
            events_async: Arc::new(RwLock::new(Vec::new())),
            runtime,
            shutdown: Arc::new(Shutdown::new()),
        }
    }

    pub(crate) fn event_queue(&self) -> Arc<BroadcastQueue<Event<Message>>> {
        self.event_queue.clone()
    }

    pub(crate) fn publish(
        &self,
        message: &Message,
    ) {
        let _ = self.event_queue.send(Event::new(message));
    }

    pub(crate) fn listen(&self) {
        let mut event_queue = self.event_queue.subscribe();
        let events = self.events.clone();
        let events_async = self.events_async.clone();

        let shutdown = self.shutdown.clone();
        self.runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    Ok(e) = event_queue.recv() => {
                        let evt = e.clone();
                        dispatch_event!(events, &evt);
                        dispatch_event_async!(events_async, &e);
                    }
                }
            }
        });
    }

    pub(crate) fn shutdown(&self) {
        self.shutdown.shutdown();
    }

    fn register(
        &self,
        handle: RunEventHandle,
    ) {
        if let Ok(mut events) = self.events.write() {
            events.push(handle);
        }
    }
}

/// Filtered subscription to a [`Channel`].
#[derive(Clone)]
pub struct ChannelEvent {
    channel: Arc<Channel>,

    glob: (globset::GlobMatcher, globset::GlobMatcher),
}

impl ChannelEvent {
    pub fn channel(
        channel: Arc<Channel>,
        options: ChannelOptions,
    ) -> Result<Self> {
        let matcher = |pattern: &str| {
            globset::Glob::new(pattern).map(|g| g.compile_matcher()).map_err(|e| OrchflowError::Validation(format!("invalid channel pattern '{}': {}", pattern, e)))
        };

        Ok(Self {
            channel,
            glob: (matcher(&options.run_id)?, matcher(&options.node_id)?),
        })
    }

    /// Called once per run when it reaches a terminal status.
    pub fn on_complete(
        &self,
        f: impl Fn(RunId) + Send + Sync + 'static,
    ) {
        let glob = self.glob.clone();

        self.channel.register(Arc::new(move |e| {
            if e.event.is_complete() && is_match(&glob, e) {
                f(e.run_id.clone());
            }
        }));
    }

    pub fn on_error(
        &self,
        f: impl Fn(&Event<Message>) + Send + Sync + 'static,
    ) {
        let glob = self.glob.clone();

        self.channel.register(Arc::new(move |e| {
            if e.event.is_error() && is_match(&glob, e) {
                f(e);
            }
        }));
    }

    pub fn on_event(
        &self,
        f: impl Fn(&Event<Message>) + Send + Sync + 'static,
    ) {
        let glob = self.glob.clone();

        self.channel.register(Arc::new(move |e| {
            if is_match(&glob, e) {
                f(e);
            }
        }));
    }

    pub fn on_event_async<F>(
        &self,
        f: F,
    ) where
        F: Fn(&Event<Message>) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let glob = self.glob.clone();

        if let Ok(mut events) = self.channel.events_async.write() {
            events.push(Arc::new(move |e| {
                if is_match(&glob, e) {
                    f(e)
                } else {
                    Box::pin(async {})
                }
            }));
        }
    }
}

/// Run events carry an empty node id and are matched on the run id only.
fn is_match(
    glob: &(globset::GlobMatcher, globset::GlobMatcher),
    e: &Event<Message>,
) -> bool {
    let (pat_run, pat_node) = glob;
    pat_run.is_match(&e.run_id) && (e.node_id.is_empty() || pat_node.is_match(&e.node_id))
}
