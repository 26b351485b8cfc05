// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Superstep execution of compiled graphs.
//!
//! Execution proceeds in supersteps: materialise state from the latest
//! checkpoint, run the scheduled node, record its output as a pending write,
//! persist a checkpoint whose parent is the prior checkpoint, then fold the
//! write away. Supersteps within a thread are strictly serialised and
//! monotonically numbered; there is no ordering across threads.
//!
//! Failure semantics follow the error taxonomy: retryable failures re-run
//! the node with exponential backoff up to the retry budget, then fail the
//! thread; non-retryable failures fail the thread immediately. Cancellation
//! is cooperative and observed at superstep boundaries, writing a terminal
//! `cancelled` checkpoint. A per-node timeout feeds the retryable path.

use crate::checkpoint::{status, Checkpoint, CheckpointMetadata, Checkpointer, PendingWrite};
use crate::error::{CheckpointError, Error, Result};
use crate::graph::{Edge, END, START};
use crate::node::Node;
use crate::retry::RetryPolicy;
use crate::state::{GraphState, MergeableState};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Metadata key recording where execution paused for an interrupt-before.
const META_INTERRUPTED_AT: &str = "interrupted_at";
/// Metadata key recording the failure message on a failed thread.
const META_ERROR: &str = "error";

/// Outcome of one `invoke()`/`resume()` call.
#[derive(Clone, Debug)]
pub struct ExecutionResult<S> {
    /// State after the last executed node.
    pub final_state: S,
    /// Names of nodes executed during this call, in order.
    pub nodes_executed: Vec<String>,
    /// Nodes scheduled next (non-empty only when interrupted).
    pub next_nodes: Vec<String>,
    /// Node at which execution paused, if an interrupt fired.
    pub interrupted_at: Option<String>,
    /// Superstep count of the thread after this call.
    pub supersteps: u64,
}

/// An executable workflow graph.
///
/// Built by [`StateGraph::compile`](crate::graph::StateGraph::compile);
/// configured with builder methods; cheap to clone (all heavy parts are
/// shared). A clone configured with a different thread id executes an
/// independent thread over the same graph.
pub struct CompiledGraph<S: GraphState> {
    nodes: Arc<HashMap<String, Arc<dyn Node<S>>>>,
    edges: Arc<HashMap<String, Edge<S>>>,
    entry_point: String,
    checkpointer: Option<Arc<dyn Checkpointer<S>>>,
    thread_id: Option<String>,
    interrupt_before: HashSet<String>,
    interrupt_after: HashSet<String>,
    retry_policy: RetryPolicy,
    node_timeout: Option<Duration>,
    max_supersteps: u64,
    cancellations: Arc<DashMap<String, Arc<AtomicBool>>>,
}

impl<S: GraphState> Clone for CompiledGraph<S> {
    fn clone(&self) -> Self {
        Self {
            nodes: Arc::clone(&self.nodes),
            edges: Arc::clone(&self.edges),
            entry_point: self.entry_point.clone(),
            checkpointer: self.checkpointer.clone(),
            thread_id: self.thread_id.clone(),
            interrupt_before: self.interrupt_before.clone(),
            interrupt_after: self.interrupt_after.clone(),
            retry_policy: self.retry_policy.clone(),
            node_timeout: self.node_timeout,
            max_supersteps: self.max_supersteps,
            cancellations: Arc::clone(&self.cancellations),
        }
    }
}

impl<S: GraphState> CompiledGraph<S> {
    pub(crate) fn new(
        nodes: Arc<HashMap<String, Arc<dyn Node<S>>>>,
        edges: Arc<HashMap<String, Edge<S>>>,
        entry_point: String,
    ) -> Self {
        Self {
            nodes,
            edges,
            entry_point,
            checkpointer: None,
            thread_id: None,
            interrupt_before: HashSet::new(),
            interrupt_after: HashSet::new(),
            retry_policy: RetryPolicy::default(),
            node_timeout: None,
            max_supersteps: 64,
            cancellations: Arc::new(DashMap::new()),
        }
    }

    /// Attach a checkpointer.
    #[must_use]
    pub fn with_checkpointer(mut self, checkpointer: impl Checkpointer<S> + 'static) -> Self {
        self.checkpointer = Some(Arc::new(checkpointer));
        self
    }

    /// Attach an already-shared checkpointer.
    #[must_use]
    pub fn with_checkpointer_arc(mut self, checkpointer: Arc<dyn Checkpointer<S>>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    /// Set the thread this instance executes. An existing thread id resumes
    /// its prior state.
    #[must_use]
    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    /// Pause before executing any of the named nodes.
    #[must_use]
    pub fn with_interrupt_before<I, T>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.interrupt_before = nodes.into_iter().map(Into::into).collect();
        self
    }

    /// Pause after executing any of the named nodes.
    #[must_use]
    pub fn with_interrupt_after<I, T>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.interrupt_after = nodes.into_iter().map(Into::into).collect();
        self
    }

    /// Override the retry policy applied to retryable node failures.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set a per-node timeout. Expiry raises the retryable path.
    #[must_use]
    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = Some(timeout);
        self
    }

    /// Cap the number of supersteps a single thread may take. Guards against
    /// unbounded loops in cyclic graphs.
    #[must_use]
    pub fn with_max_supersteps(mut self, max: u64) -> Self {
        self.max_supersteps = max;
        self
    }

    /// The configured thread id, if any.
    #[must_use]
    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    /// Request cooperative cancellation of a thread. The flag is observed at
    /// the next superstep boundary; an in-flight node may complete but its
    /// thread terminates with a `cancelled` checkpoint.
    pub fn cancel(&self, thread_id: &str) {
        self.cancellation_handle(thread_id)
            .store(true, Ordering::SeqCst);
    }

    /// Shared cancellation flag for a thread. Long-running nodes may poll it
    /// at their own suspension points.
    #[must_use]
    pub fn cancellation_handle(&self, thread_id: &str) -> Arc<AtomicBool> {
        Arc::clone(
            &self
                .cancellations
                .entry(thread_id.to_string())
                .or_insert_with(|| Arc::new(AtomicBool::new(false))),
        )
    }

    fn is_cancelled(&self, thread_id: &str) -> bool {
        self.cancellations
            .get(thread_id)
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn clear_cancellation(&self, thread_id: &str) {
        self.cancellations.remove(thread_id);
    }

    /// Resolve the successor of `node` given the current state. `None` means
    /// execution reached [`END`].
    fn next_node(&self, node: &str, state: &S) -> Result<Option<String>> {
        match self.edges.get(node) {
            None => Ok(None),
            Some(Edge::Direct(to)) => {
                if to == END {
                    Ok(None)
                } else {
                    Ok(Some(to.clone()))
                }
            }
            Some(Edge::Conditional { router, routes }) => {
                let label = router(state);
                let target = routes.get(&label).ok_or_else(|| {
                    Error::Validation(format!(
                        "router for '{node}' returned unknown route label '{label}'"
                    ))
                })?;
                if target == END {
                    Ok(None)
                } else {
                    Ok(Some(target.clone()))
                }
            }
        }
    }

    fn require_interrupt_support(&self) -> Result<()> {
        if self.interrupt_before.is_empty() && self.interrupt_after.is_empty() {
            return Ok(());
        }
        let names: Vec<&str> = self
            .interrupt_before
            .iter()
            .chain(self.interrupt_after.iter())
            .map(String::as_str)
            .collect();
        if self.checkpointer.is_none() {
            return Err(Error::InterruptWithoutCheckpointer(names.join(", ")));
        }
        if self.thread_id.is_none() {
            return Err(Error::InterruptWithoutThreadId(names.join(", ")));
        }
        Ok(())
    }

    /// Execute one node with per-node timeout and retry with backoff.
    async fn run_node(&self, name: &str, node: &Arc<dyn Node<S>>, state: &S) -> Result<S> {
        let mut attempt: u32 = 0;
        loop {
            let fut = node.execute(state.clone());
            let result = match self.node_timeout {
                Some(limit) => match tokio::time::timeout(limit, fut).await {
                    Ok(inner) => inner,
                    Err(_) => Err(Error::timeout(format!(
                        "node '{name}' exceeded {}ms",
                        limit.as_millis()
                    ))),
                },
                None => fut.await,
            };

            match result {
                Ok(next_state) => return Ok(next_state),
                Err(err) => match self.retry_policy.delay_for(attempt, &err) {
                    Some(delay) => {
                        warn!(
                            node = name,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Retryable node failure, backing off"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => return Err(err),
                },
            }
        }
    }
}

/// Position from which the run loop continues.
struct RunPlan<S> {
    state: S,
    next: Option<String>,
    parent_id: Option<String>,
    superstep: u64,
    /// Skip the interrupt-before check for the first node (we are resuming
    /// into the node that triggered the interrupt).
    bypass_first_interrupt: bool,
}

impl<S: GraphState + MergeableState> CompiledGraph<S> {
    /// Execute the graph.
    ///
    /// With a checkpointer and thread id configured, an existing thread is
    /// resumed from its latest checkpoint and `initial` is ignored; a
    /// completed thread returns its stored state without executing anything.
    pub async fn invoke(&self, initial: S) -> Result<ExecutionResult<S>> {
        self.require_interrupt_support()?;

        if let (Some(checkpointer), Some(thread_id)) = (&self.checkpointer, &self.thread_id) {
            if let Some(latest) = checkpointer.get_latest(thread_id).await? {
                match latest.status() {
                    Some(status::COMPLETED) => {
                        debug!(thread_id, "Thread already completed; returning stored state");
                        return Ok(ExecutionResult {
                            final_state: latest.state,
                            nodes_executed: Vec::new(),
                            next_nodes: Vec::new(),
                            interrupted_at: None,
                            supersteps: latest.superstep,
                        });
                    }
                    Some(status::FAILED) => {
                        return Err(Error::Conflict(format!(
                            "thread '{thread_id}' already failed: {}",
                            latest.metadata.get(META_ERROR).cloned().unwrap_or_default()
                        )));
                    }
                    Some(status::CANCELLED) => {
                        return Err(Error::Cancelled(thread_id.clone()));
                    }
                    _ => {
                        let plan = self.plan_from_checkpoint(latest).await?;
                        return self.run_loop(plan).await;
                    }
                }
            }
        }

        let plan = RunPlan {
            state: initial,
            next: Some(self.entry_point.clone()),
            parent_id: None,
            superstep: 0,
            bypass_first_interrupt: false,
        };
        self.run_loop(plan).await
    }

    /// Resume an interrupted or crashed thread from its latest checkpoint.
    pub async fn resume(&self) -> Result<ExecutionResult<S>> {
        let checkpointer = self
            .checkpointer
            .as_ref()
            .ok_or(Error::ResumeWithoutCheckpointer)?;
        let thread_id = self.thread_id.as_ref().ok_or(Error::ResumeWithoutThreadId)?;

        let latest = checkpointer
            .get_latest(thread_id)
            .await?
            .ok_or_else(|| Error::NoCheckpointToResume(thread_id.clone()))?;

        if latest.status() == Some(status::COMPLETED) {
            return Ok(ExecutionResult {
                final_state: latest.state,
                nodes_executed: Vec::new(),
                next_nodes: Vec::new(),
                interrupted_at: None,
                supersteps: latest.superstep,
            });
        }

        let plan = self.plan_from_checkpoint(latest).await?;
        self.run_loop(plan).await
    }

    /// Latest persisted state for the configured thread.
    pub async fn get_current_state(&self) -> Result<S> {
        let checkpointer = self
            .checkpointer
            .as_ref()
            .ok_or_else(|| Error::internal("get_current_state requires a checkpointer"))?;
        let thread_id = self
            .thread_id
            .as_ref()
            .ok_or_else(|| Error::internal("get_current_state requires a thread id"))?;
        let latest = checkpointer
            .get_latest(thread_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("no checkpoint for thread '{thread_id}'")))?;
        Ok(latest.state)
    }

    /// Apply an out-of-band state edit, persisted as its own checkpoint.
    pub async fn update_state<F>(&self, f: F) -> Result<S>
    where
        F: FnOnce(S) -> S,
    {
        let checkpointer = self
            .checkpointer
            .as_ref()
            .ok_or_else(|| Error::internal("update_state requires a checkpointer"))?;
        let thread_id = self
            .thread_id
            .as_ref()
            .ok_or_else(|| Error::internal("update_state requires a thread id"))?;
        let latest = checkpointer
            .get_latest(thread_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("no checkpoint for thread '{thread_id}'")))?;

        let updated = f(latest.state);
        let mut checkpoint = Checkpoint::new(
            thread_id.clone(),
            updated.clone(),
            "__update__".to_string(),
            latest.superstep + 1,
            Some(latest.id),
        );
        for (key, value) in &latest.metadata {
            checkpoint.metadata.insert(key.clone(), value.clone());
        }
        checkpointer.save(checkpoint).await?;
        Ok(updated)
    }

    /// Checkpoint history for the configured thread, newest first.
    pub async fn history(&self) -> Result<Vec<CheckpointMetadata>> {
        let checkpointer = self
            .checkpointer
            .as_ref()
            .ok_or_else(|| Error::internal("history requires a checkpointer"))?;
        let thread_id = self
            .thread_id
            .as_ref()
            .ok_or_else(|| Error::internal("history requires a thread id"))?;
        checkpointer.list(thread_id).await
    }

    /// Work out where to continue from a restored checkpoint, folding any
    /// pending writes left by a task that completed without its checkpoint
    /// landing.
    async fn plan_from_checkpoint(&self, latest: Checkpoint<S>) -> Result<RunPlan<S>> {
        // Interrupt-before pause: the recorded node has not executed yet.
        if latest.status() == Some(status::INTERRUPTED) {
            if let Some(pending_node) = latest.metadata.get(META_INTERRUPTED_AT) {
                return Ok(RunPlan {
                    next: Some(pending_node.clone()),
                    parent_id: Some(latest.id.clone()),
                    superstep: latest.superstep,
                    state: latest.state,
                    bypass_first_interrupt: true,
                });
            }
            // Interrupt-after pause: continue with the successor.
            let next = self.next_node(&latest.node, &latest.state)?;
            return Ok(RunPlan {
                next,
                parent_id: Some(latest.id.clone()),
                superstep: latest.superstep,
                state: latest.state,
                bypass_first_interrupt: false,
            });
        }

        // Crash recovery: a task may have completed and recorded its write
        // without the checkpoint landing. Fold it instead of re-executing.
        if let (Some(checkpointer), Some(thread_id)) = (&self.checkpointer, &self.thread_id) {
            let writes = checkpointer.get_writes(thread_id).await?;
            let next_superstep = latest.superstep + 1;
            let folded = writes.iter().find(|w| {
                w.task_id
                    .starts_with(&format!("{thread_id}:{next_superstep}:"))
            });
            if let Some(write) = folded {
                let node = write
                    .task_id
                    .rsplit(':')
                    .next()
                    .unwrap_or_default()
                    .to_string();
                let patch: S = bincode::deserialize(&write.payload).map_err(|e| {
                    CheckpointError::DeserializationFailed {
                        reason: format!("Failed to deserialize pending write payload: {e}"),
                    }
                })?;
                let mut state = latest.state.clone();
                state.merge(&patch);

                debug!(
                    thread_id,
                    node, next_superstep, "Folding pending write from interrupted superstep"
                );

                let next = self.next_node(&node, &state)?;
                let mut checkpoint = Checkpoint::new(
                    thread_id.clone(),
                    state.clone(),
                    node,
                    next_superstep,
                    Some(latest.id.clone()),
                );
                checkpoint.metadata.insert(
                    status::KEY.to_string(),
                    if next.is_none() {
                        status::COMPLETED.to_string()
                    } else {
                        status::RUNNING.to_string()
                    },
                );
                let checkpoint_id = checkpoint.id.clone();
                checkpointer.save(checkpoint).await?;
                checkpointer.clear_writes(thread_id).await?;

                return Ok(RunPlan {
                    next,
                    parent_id: Some(checkpoint_id),
                    superstep: next_superstep,
                    state,
                    bypass_first_interrupt: false,
                });
            }
        }

        let next = self.next_node(&latest.node, &latest.state)?;
        Ok(RunPlan {
            next,
            parent_id: Some(latest.id.clone()),
            superstep: latest.superstep,
            state: latest.state,
            bypass_first_interrupt: false,
        })
    }

    async fn write_terminal_checkpoint(
        &self,
        state: &S,
        node: &str,
        superstep: u64,
        parent_id: Option<String>,
        thread_status: &str,
        error: Option<&Error>,
    ) -> Result<()> {
        let (Some(checkpointer), Some(thread_id)) = (&self.checkpointer, &self.thread_id) else {
            return Ok(());
        };
        let mut checkpoint = Checkpoint::new(
            thread_id.clone(),
            state.clone(),
            node.to_string(),
            superstep,
            parent_id,
        );
        checkpoint
            .metadata
            .insert(status::KEY.to_string(), thread_status.to_string());
        if let Some(err) = error {
            checkpoint
                .metadata
                .insert(META_ERROR.to_string(), err.to_string());
        }
        checkpointer.save(checkpoint).await?;
        // A terminal thread keeps no outstanding writes.
        checkpointer.clear_writes(thread_id).await?;
        Ok(())
    }

    async fn run_loop(&self, plan: RunPlan<S>) -> Result<ExecutionResult<S>> {
        let RunPlan {
            mut state,
            mut next,
            mut parent_id,
            mut superstep,
            mut bypass_first_interrupt,
        } = plan;

        let mut nodes_executed = Vec::new();
        let mut last_executed = START.to_string();

        while let Some(node_name) = next.clone() {
            if superstep >= self.max_supersteps {
                let err = Error::internal(format!(
                    "superstep budget of {} exceeded at node '{node_name}'",
                    self.max_supersteps
                ));
                self.write_terminal_checkpoint(
                    &state,
                    &last_executed,
                    superstep + 1,
                    parent_id.clone(),
                    status::FAILED,
                    Some(&err),
                )
                .await?;
                return Err(err);
            }

            // Cooperative cancellation at the superstep boundary.
            if let Some(thread_id) = &self.thread_id {
                if self.is_cancelled(thread_id) {
                    self.write_terminal_checkpoint(
                        &state,
                        &last_executed,
                        superstep + 1,
                        parent_id.clone(),
                        status::CANCELLED,
                        None,
                    )
                    .await?;
                    self.clear_cancellation(thread_id);
                    return Err(Error::Cancelled(thread_id.clone()));
                }
            }

            if !bypass_first_interrupt && self.interrupt_before.contains(&node_name) {
                if let (Some(checkpointer), Some(thread_id)) =
                    (&self.checkpointer, &self.thread_id)
                {
                    let mut checkpoint = Checkpoint::new(
                        thread_id.clone(),
                        state.clone(),
                        last_executed.clone(),
                        superstep + 1,
                        parent_id.clone(),
                    );
                    checkpoint
                        .metadata
                        .insert(status::KEY.to_string(), status::INTERRUPTED.to_string());
                    checkpoint
                        .metadata
                        .insert(META_INTERRUPTED_AT.to_string(), node_name.clone());
                    checkpointer.save(checkpoint).await?;
                }
                return Ok(ExecutionResult {
                    final_state: state,
                    nodes_executed,
                    next_nodes: vec![node_name.clone()],
                    interrupted_at: Some(node_name),
                    supersteps: superstep,
                });
            }
            bypass_first_interrupt = false;

            let node = self
                .nodes
                .get(&node_name)
                .ok_or_else(|| Error::Validation(format!("unknown node '{node_name}'")))?;

            debug!(node = %node_name, superstep = superstep + 1, "Executing node");
            let new_state = match self.run_node(&node_name, node, &state).await {
                Ok(s) => s,
                Err(err) => {
                    self.write_terminal_checkpoint(
                        &state,
                        &node_name,
                        superstep + 1,
                        parent_id.clone(),
                        status::FAILED,
                        Some(&err),
                    )
                    .await?;
                    return Err(Error::NodeExecution {
                        node: node_name,
                        source: Box::new(err),
                    });
                }
            };

            superstep += 1;
            let successor = self.next_node(&node_name, &new_state)?;

            if let (Some(checkpointer), Some(thread_id)) = (&self.checkpointer, &self.thread_id) {
                // Record the task's output before the checkpoint lands so a
                // crash in between never re-executes the node on resume.
                let payload = bincode::serialize(&new_state).map_err(|e| {
                    CheckpointError::SerializationFailed {
                        reason: format!("Failed to serialize pending write payload: {e}"),
                    }
                })?;
                checkpointer
                    .put_writes(vec![PendingWrite {
                        thread_id: thread_id.clone(),
                        checkpoint_id: parent_id.clone().unwrap_or_default(),
                        task_id: PendingWrite::task_id_for(thread_id, superstep, &node_name),
                        idx: 0,
                        channel: "state".to_string(),
                        payload,
                    }])
                    .await?;

                let thread_status = if successor.is_none() {
                    status::COMPLETED
                } else if self.interrupt_after.contains(&node_name) {
                    status::INTERRUPTED
                } else {
                    status::RUNNING
                };
                let mut checkpoint = Checkpoint::new(
                    thread_id.clone(),
                    new_state.clone(),
                    node_name.clone(),
                    superstep,
                    parent_id.clone(),
                );
                checkpoint
                    .metadata
                    .insert(status::KEY.to_string(), thread_status.to_string());
                let checkpoint_id = checkpoint.id.clone();
                checkpointer.save(checkpoint).await?;
                checkpointer.clear_writes(thread_id).await?;
                parent_id = Some(checkpoint_id);
            }

            nodes_executed.push(node_name.clone());
            last_executed = node_name.clone();
            state = new_state;

            if self.interrupt_after.contains(&node_name) {
                return Ok(ExecutionResult {
                    next_nodes: successor.clone().into_iter().collect(),
                    final_state: state,
                    nodes_executed,
                    interrupted_at: Some(node_name),
                    supersteps: superstep,
                });
            }

            next = successor;
        }

        if let Some(thread_id) = &self.thread_id {
            self.clear_cancellation(thread_id);
        }

        Ok(ExecutionResult {
            final_state: state,
            nodes_executed,
            next_nodes: Vec::new(),
            interrupted_at: None,
            supersteps: superstep,
        })
    }
}
