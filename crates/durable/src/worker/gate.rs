//! Admission control for new claims
//!
//! Every claim attempt holds a read guard on the gate for its duration.
//! [`ClaimGate::close`] takes the write side, so once it returns no claim is
//! in flight and none will start again in this process.

use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::warn;

/// Shared between the pool's slots and whoever may need to stop them claiming
#[derive(Debug, Default)]
pub struct ClaimGate {
    closed: RwLock<bool>,
}

/// Held by a slot while it checks the breaker and claims
pub type ClaimPermit<'a> = RwLockReadGuard<'a, bool>;

impl ClaimGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit one claim attempt, or `None` once the gate is closed
    pub async fn enter(&self) -> Option<ClaimPermit<'_>> {
        let permit = self.closed.read().await;
        if *permit {
            None
        } else {
            Some(permit)
        }
    }

    /// Close for good, waiting out claims already in flight
    pub async fn close(&self) {
        let mut closed = self.closed.write().await;
        if !*closed {
            warn!("claim gate closed, no further jobs will be claimed");
            *closed = true;
        }
    }

    pub async fn is_closed(&self) -> bool {
        *self.closed.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_open_gate_admits() {
        let gate = ClaimGate::new();
        assert!(gate.enter().await.is_some());
        assert!(!gate.is_closed().await);
    }

    #[tokio::test]
    async fn test_closed_gate_refuses() {
        let gate = ClaimGate::new();
        gate.close().await;
        gate.close().await;
        assert!(gate.enter().await.is_none());
        assert!(gate.is_closed().await);
    }

    #[tokio::test]
    async fn test_close_waits_for_claim_in_flight() {
        let gate = Arc::new(ClaimGate::new());
        let permit = gate.enter().await.unwrap();

        let closer = tokio::spawn({
            let gate = gate.clone();
            async move { gate.close().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!closer.is_finished());

        drop(permit);
        tokio::time::timeout(Duration::from_secs(1), closer)
            .await
            .unwrap()
            .unwrap();
        assert!(gate.enter().await.is_none());
    }
}
