// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Request scoped context handed through every informer, worker and reconcile call.

use crate::client::Branch;
use tokio::sync::watch;

/// Branch and cancellation signal of one run
#[derive(Clone, Debug)]
pub struct RunContext {
    branch: Branch,
    cancelled: watch::Receiver<bool>,
}

/// Cancels every task holding the paired [`RunContext`]
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl RunContext {
    pub fn new(branch: Branch) -> (Self, CancelHandle) {
        let (tx, cancelled) = watch::channel(false);
        (Self { branch, cancelled }, CancelHandle { tx })
    }

    pub fn branch(&self) -> &Branch {
        &self.branch
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Resolves once the run is cancelled or its handle is dropped
    pub async fn cancelled(&self) {
        let mut rx = self.cancelled.clone();
        // an error means the handle is gone, nothing can run anymore
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_cancel_wakes_all_clones() {
        let (ctx, handle) = RunContext::new(Branch::new("main"));
        let other = ctx.clone();
        let waiter = tokio::spawn(async move { other.cancelled().await });

        assert!(!ctx.is_cancelled());
        handle.cancel();

        timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.branch().name, "main");
    }

    #[tokio::test]
    async fn test_dropped_handle_counts_as_cancelled() {
        let (ctx, handle) = RunContext::new(Branch::new("main"));
        drop(handle);

        timeout(Duration::from_secs(1), ctx.cancelled()).await.unwrap();
    }
}
