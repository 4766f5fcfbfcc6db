//! Cancellation and pause propagation.
//!
//! A [`RunControl`] pairs a hierarchical cancellation token with a pause gate.
//! Every state entry runs under a child of its machine's control, and a nested
//! machine runs under the control of the state that embeds it, so aborting a parent
//! state reaches every action and sub-machine beneath it. The pause gate is shared
//! by the whole tree: pausing the root holds the next transition of every nested
//! machine as well.

use futures::future::select_all;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug)]
struct TokenInner {
    cancelled: watch::Sender<bool>,
    parent: Option<CancelToken>,
}

/// Cancellation token that also reports cancelled when any ancestor is.
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// A fresh root token.
    pub fn new() -> Self {
        let (cancelled, _) = watch::channel(false);
        Self {
            inner: Arc::new(TokenInner {
                cancelled,
                parent: None,
            }),
        }
    }

    /// A token cancelled together with `self`, which can also be cancelled alone.
    pub fn child(&self) -> Self {
        let (cancelled, _) = watch::channel(false);
        Self {
            inner: Arc::new(TokenInner {
                cancelled,
                parent: Some(self.clone()),
            }),
        }
    }

    /// Cancel this token and every child.
    pub fn cancel(&self) {
        self.inner.cancelled.send_replace(true);
    }

    /// Whether this token or an ancestor is cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.chain().any(|token| *token.inner.cancelled.borrow())
    }

    /// Resolves once this token or any ancestor is cancelled.
    pub async fn cancelled(&self) {
        let mut receivers: Vec<watch::Receiver<bool>> = self
            .chain()
            .map(|token| token.inner.cancelled.subscribe())
            .collect();
        let waits = receivers.iter_mut().map(|rx| {
            Box::pin(async move {
                // The sender lives as long as `self`, so this only returns on cancel.
                let _ = rx.wait_for(|cancelled| *cancelled).await;
            })
        });
        select_all(waits).await;
    }

    fn chain(&self) -> impl Iterator<Item = &CancelToken> {
        std::iter::successors(Some(self), |token| token.inner.parent.as_ref())
    }
}

/// Shared pause flag.
#[derive(Debug, Clone)]
pub struct PauseGate {
    paused: Arc<watch::Sender<bool>>,
}

impl Default for PauseGate {
    fn default() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            paused: Arc::new(paused),
        }
    }
}

impl PauseGate {
    /// Hold transitions until [`PauseGate::resume`].
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    /// Let held transitions through.
    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    /// Whether transitions are currently held.
    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Resolves immediately when not paused, else once resumed.
    pub async fn wait_resumed(&self) {
        let mut rx = self.paused.subscribe();
        let _ = rx.wait_for(|paused| !*paused).await;
    }
}

/// What a running machine, state entry or action is governed by.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    token: CancelToken,
    gate: PauseGate,
}

impl RunControl {
    /// Uncancelled and unpaused.
    pub fn new() -> Self {
        Self::default()
    }

    /// Child control: own cancellation, shared pause gate.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child(),
            gate: self.gate.clone(),
        }
    }

    /// Cancel this control and its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Cancellation token of this control.
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// The pause gate shared with nested machines.
    pub fn gate(&self) -> &PauseGate {
        &self.gate
    }

    /// Wait for the gate to open. Returns `false` if cancelled first.
    pub async fn pass_gate(&self) -> bool {
        if !self.gate.is_paused() {
            return !self.is_cancelled();
        }
        tokio::select! {
            _ = self.gate.wait_resumed() => !self.is_cancelled(),
            _ = self.cancelled() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_parent_cancel_reaches_grandchild() {
        let root = CancelToken::new();
        let child = root.child();
        let grandchild = child.child();

        assert!(!grandchild.is_cancelled());
        let waiter = tokio::spawn({
            let grandchild = grandchild.clone();
            async move { grandchild.cancelled().await }
        });
        root.cancel();
        timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(grandchild.is_cancelled());
    }

    #[tokio::test]
    async fn test_child_cancel_stays_local() {
        let root = CancelToken::new();
        let child = root.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!root.is_cancelled());
    }

    #[tokio::test]
    async fn test_gate_is_shared_with_children() {
        let control = RunControl::new();
        let nested = control.child().child();
        control.gate().pause();
        assert!(nested.gate().is_paused());

        let passing = tokio::spawn({
            let nested = nested.clone();
            async move { nested.pass_gate().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!passing.is_finished());

        control.gate().resume();
        assert!(timeout(Duration::from_secs(1), passing).await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_gate_reports_cancel() {
        let control = RunControl::new();
        control.gate().pause();
        let child = control.child();
        control.cancel();
        assert!(!child.pass_gate().await);
    }
}
