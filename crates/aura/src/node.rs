// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Node abstraction for graph workflows.
//!
//! A node is a pure-ish async function over the graph state: it receives the
//! current state and returns a patched state. Nodes must be idempotent over
//! their patches - the runtime guarantees at-least-once execution when a
//! thread is resumed after a crash.

use crate::error::Result;
use crate::state::GraphState;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by function nodes.
pub type NodeFuture<S> = Pin<Box<dyn Future<Output = Result<S>> + Send>>;

/// A unit of work in a workflow graph.
#[async_trait::async_trait]
pub trait Node<S: GraphState>: Send + Sync {
    /// Execute this node against the current state, returning the new state.
    async fn execute(&self, state: S) -> Result<S>;

    /// Stable name used for scheduling, checkpoints, and interrupts.
    fn name(&self) -> String;
}

/// Adapter turning a plain async closure into a [`Node`].
pub(crate) struct FnNode<S> {
    name: String,
    #[allow(clippy::type_complexity)]
    func: Arc<dyn Fn(S) -> NodeFuture<S> + Send + Sync>,
}

impl<S> FnNode<S> {
    pub(crate) fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(S) -> NodeFuture<S> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }
}

#[async_trait::async_trait]
impl<S: GraphState> Node<S> for FnNode<S> {
    async fn execute(&self, state: S) -> Result<S> {
        (self.func)(state).await
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}
