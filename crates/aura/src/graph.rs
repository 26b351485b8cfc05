// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Graph construction: nodes, edges, and compile-time validation.

use crate::error::{Error, Result};
use crate::executor::CompiledGraph;
use crate::node::{FnNode, Node, NodeFuture};
use crate::state::GraphState;
use std::collections::HashMap;
use std::sync::Arc;

/// Sentinel name terminating execution.
pub const END: &str = "__end__";

/// Sentinel name for the virtual start of execution.
pub const START: &str = "__start__";

/// Routing out of a node: either a fixed successor or a conditional router
/// mapping route labels to successors.
#[derive(Clone)]
pub(crate) enum Edge<S> {
    Direct(String),
    Conditional {
        #[allow(clippy::type_complexity)]
        router: Arc<dyn Fn(&S) -> String + Send + Sync>,
        routes: HashMap<String, String>,
    },
}

/// Builder for a workflow graph over state type `S`.
///
/// # Example
///
/// ```rust,ignore
/// let mut graph: StateGraph<MyState> = StateGraph::new();
/// graph.add_node_from_fn("detect", |state| Box::pin(async move { Ok(state) }));
/// graph.set_entry_point("detect");
/// graph.add_edge("detect", END);
/// let app = graph.compile()?;
/// ```
pub struct StateGraph<S: GraphState> {
    pub(crate) nodes: HashMap<String, Arc<dyn Node<S>>>,
    pub(crate) edges: HashMap<String, Edge<S>>,
    pub(crate) entry_point: Option<String>,
    node_order: Vec<String>,
}

impl<S: GraphState> Default for StateGraph<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: GraphState> StateGraph<S> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            edges: HashMap::new(),
            entry_point: None,
            node_order: Vec::new(),
        }
    }

    /// Add a node. Re-adding a name replaces the previous node.
    pub fn add_node(&mut self, name: impl Into<String>, node: impl Node<S> + 'static) -> &mut Self {
        let name = name.into();
        if !self.nodes.contains_key(&name) {
            self.node_order.push(name.clone());
        }
        self.nodes.insert(name, Arc::new(node));
        self
    }

    /// Add a node from a plain async closure.
    pub fn add_node_from_fn<F>(&mut self, name: impl Into<String>, func: F) -> &mut Self
    where
        F: Fn(S) -> NodeFuture<S> + Send + Sync + 'static,
    {
        let name = name.into();
        self.add_node(name.clone(), FnNode::new(name, func))
    }

    /// Add an unconditional edge `from -> to`. `to` may be [`END`].
    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.edges.insert(from.into(), Edge::Direct(to.into()));
        self
    }

    /// Add conditional routing out of `from`: the router inspects the state
    /// and returns a route label, which is resolved through `routes` to a
    /// successor node (or [`END`]).
    pub fn add_conditional_edges<F>(
        &mut self,
        from: impl Into<String>,
        router: F,
        routes: HashMap<String, String>,
    ) -> &mut Self
    where
        F: Fn(&S) -> String + Send + Sync + 'static,
    {
        self.edges.insert(
            from.into(),
            Edge::Conditional {
                router: Arc::new(router),
                routes,
            },
        );
        self
    }

    /// Set the node execution starts at.
    pub fn set_entry_point(&mut self, name: impl Into<String>) -> &mut Self {
        self.entry_point = Some(name.into());
        self
    }

    /// Validate the graph and produce an executable [`CompiledGraph`].
    ///
    /// Validation rejects: a missing or unknown entry point, edges from or to
    /// unknown nodes, conditional routes to unknown nodes, nodes with no
    /// outgoing edge, and nodes unreachable from the entry point. Cycles are
    /// permitted (loops are bounded at runtime by the superstep cap).
    pub fn compile(self) -> Result<CompiledGraph<S>> {
        let entry = self
            .entry_point
            .clone()
            .ok_or_else(|| Error::Validation("no entry point set".to_string()))?;

        if !self.nodes.contains_key(&entry) {
            return Err(Error::Validation(format!(
                "entry point '{entry}' is not a node"
            )));
        }

        let check_target = |from: &str, to: &str| -> Result<()> {
            if to != END && !self.nodes.contains_key(to) {
                return Err(Error::Validation(format!(
                    "edge from '{from}' targets unknown node '{to}'"
                )));
            }
            Ok(())
        };

        for name in &self.node_order {
            match self.edges.get(name) {
                None => {
                    return Err(Error::Validation(format!(
                        "node '{name}' has no outgoing edge; route it to another node or to END"
                    )));
                }
                Some(Edge::Direct(to)) => check_target(name, to)?,
                Some(Edge::Conditional { routes, .. }) => {
                    if routes.is_empty() {
                        return Err(Error::Validation(format!(
                            "conditional edge from '{name}' has no routes"
                        )));
                    }
                    for to in routes.values() {
                        check_target(name, to)?;
                    }
                }
            }
        }

        for from in self.edges.keys() {
            if !self.nodes.contains_key(from) {
                return Err(Error::Validation(format!(
                    "edge from unknown node '{from}'"
                )));
            }
        }

        self.check_reachability(&entry)?;

        Ok(CompiledGraph::new(
            Arc::new(self.nodes),
            Arc::new(self.edges),
            entry,
        ))
    }

    /// Every node must be reachable from the entry point; an unreachable
    /// node is almost always a wiring mistake.
    fn check_reachability(&self, entry: &str) -> Result<()> {
        use petgraph::graph::DiGraph;
        use petgraph::visit::Dfs;

        let mut graph = DiGraph::<&str, ()>::new();
        let mut indices = HashMap::new();
        for name in self.nodes.keys() {
            indices.insert(name.as_str(), graph.add_node(name.as_str()));
        }

        for (from, edge) in &self.edges {
            let Some(&from_ix) = indices.get(from.as_str()) else {
                continue;
            };
            match edge {
                Edge::Direct(to) => {
                    if let Some(&to_ix) = indices.get(to.as_str()) {
                        graph.add_edge(from_ix, to_ix, ());
                    }
                }
                Edge::Conditional { routes, .. } => {
                    for to in routes.values() {
                        if let Some(&to_ix) = indices.get(to.as_str()) {
                            graph.add_edge(from_ix, to_ix, ());
                        }
                    }
                }
            }
        }

        let entry_ix = indices[entry];
        let mut reached = std::collections::HashSet::new();
        let mut dfs = Dfs::new(&graph, entry_ix);
        while let Some(ix) = dfs.next(&graph) {
            reached.insert(graph[ix]);
        }

        for name in self.nodes.keys() {
            if !reached.contains(name.as_str()) {
                return Err(Error::Validation(format!(
                    "node '{name}' is unreachable from entry point '{entry}'"
                )));
            }
        }
        Ok(())
    }
}
