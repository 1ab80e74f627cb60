//! Shutdown coordination for the server.

use tokio_util::sync::CancellationToken;

/// Coordinator for graceful shutdown.
///
/// Wraps a cancellation token that long-running tasks can wait on.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// A token cancelled when either this coordinator or `other` fires.
    ///
    /// Cancelling the returned token also ends the background link.
    pub fn link(&self, other: &CancellationToken) -> CancellationToken {
        let merged = self.token.child_token();
        let external = other.clone();
        let linked = merged.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = external.cancelled() => linked.cancel(),
                _ = linked.cancelled() => {}
            }
        });
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn trigger_cancels_linked_token() {
        let shutdown = Shutdown::new();
        let merged = shutdown.link(&CancellationToken::new());
        assert!(!merged.is_cancelled());

        shutdown.trigger();
        assert!(merged.is_cancelled());
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn external_token_cancels_linked_token() {
        let shutdown = Shutdown::new();
        let external = CancellationToken::new();
        let merged = shutdown.link(&external);

        external.cancel();
        tokio::time::timeout(Duration::from_secs(1), merged.cancelled())
            .await
            .unwrap();
        assert!(!shutdown.is_triggered());
    }
}
