use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::warn;

use crate::{
    common::Shutdown,
    runtime::Channel,
    store::{Store, data},
    utils,
};

/// Persists every channel event so run histories stay queryable.
pub struct Monitor {
    store: Arc<Store>,
    channel: Arc<Channel>,

    runtime: Handle,
    shutdown: Arc<Shutdown>,
}

impl Monitor {
    pub fn new(
        store: Arc<Store>,
        channel: Arc<Channel>,
        runtime: Handle,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        Self {
            store,
            channel,
            runtime,
            shutdown,
        }
    }

    pub fn monitor(&self) {
        let store = self.store.clone();
        let mut event_queue = self.channel.event_queue().subscribe();
        let shutdown = self.shutdown.clone();

        self.runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    Ok(event_msg) = event_queue.recv() => {
                        let message = match serde_json::to_string(&event_msg.event) {
                            Ok(message) => message,
                            Err(e) => {
                                warn!(run_id = %event_msg.run_id, error = %e, "failed to encode event");
                                continue;
                            }
                        };
                        let record = data::EventRecord {
                            id: utils::shortid(),
                            run_id: event_msg.run_id.clone(),
                            node_id: event_msg.node_id.clone(),
                            generation: event_msg.generation,
                            name: event_msg.event.name().to_string(),
                            message,
                            timestamp: event_msg.timestamp,
                        };
                        if let Err(e) = store.events().create(&record) {
                            warn!(run_id = %record.run_id, error = %e, "failed to persist event");
                        }
                    }
                }
            }
        });
    }
}
