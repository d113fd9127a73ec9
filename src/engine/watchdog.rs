use std::{sync::Arc, time::Duration};

use tracing::trace;

use crate::utils;

use super::inner::Core;

/// Periodic scan for expired agent deadlines, archivable runs and due schedules.
pub struct Watchdog {
    core: Arc<Core>,
    interval: Duration,
}

impl Watchdog {
    pub(crate) fn new(core: Arc<Core>) -> Self {
        let interval = Duration::from_millis(core.config.watchdog.interval_ms.max(1));
        Self {
            core,
            interval,
        }
    }

    pub fn watch(&self) {
        let core = self.core.clone();
        let interval = self.interval;
        let shutdown = core.shutdown.clone();
        let handle = core.handle.clone();

        handle.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = tokio::time::sleep(interval) => {
                        trace!("watchdog tick");
                        core.tick(utils::time::time_millis());
                    }
                }
            }
        });
    }
}
