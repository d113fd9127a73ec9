//! One-shot shutdown signal shared between a component and its spawned tasks.

use std::future::Future;

use tokio::sync::watch;

pub struct Shutdown {
    sender: watch::Sender<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender,
        }
    }

    /// Trigger the signal. Later calls are no-ops.
    pub fn shutdown(&self) {
        self.sender.send_replace(true);
    }

    /// Resolves once `shutdown` has been called, including calls made before
    /// this future was created.
    pub fn wait(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut receiver = self.sender.subscribe();
        async move {
            let _ = receiver.wait_for(|terminated| *terminated).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::Shutdown;

    #[tokio::test]
    async fn test_wait_resolves_after_shutdown() {
        let shutdown = Shutdown::new();
        let wait = shutdown.wait();
        assert!(tokio::time::timeout(Duration::from_millis(20), shutdown.wait()).await.is_err());
        shutdown.shutdown();
        tokio::time::timeout(Duration::from_secs(1), wait).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_created_after_shutdown() {
        let shutdown = Shutdown::new();
        shutdown.shutdown();
        tokio::time::timeout(Duration::from_secs(1), shutdown.wait()).await.unwrap();
    }
}
