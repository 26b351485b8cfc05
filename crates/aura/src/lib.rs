// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! # Aura core
//!
//! The framework underneath Aura's struggle-detection backend: checkpointed
//! graph workflows, an LLM invocation layer with tiered caching, knowledge
//! retrieval over a vector index, and the shared error taxonomy.
//!
//! ## Graph workflows
//!
//! Build a [`StateGraph`] over a typed state, compile it, and execute it as
//! a thread identified by a `thread_id`. Every superstep persists a
//! [`Checkpoint`] through a [`Checkpointer`], so a crashed or paused thread
//! resumes from where it stopped:
//!
//! ```rust,ignore
//! let mut graph: StateGraph<LessonState> = StateGraph::new();
//! graph.add_node("detect", DetectNode::new(config));
//! graph.add_node("generate", GenerateNode::new(llm));
//! graph.set_entry_point("detect");
//! graph.add_edge("detect", "generate");
//! graph.add_edge("generate", END);
//!
//! let app = graph
//!     .compile()?
//!     .with_checkpointer(FileCheckpointer::new("./checkpoints")?)
//!     .with_thread_id("src/main.rs:171");
//! let result = app.invoke(LessonState::from(request)).await?;
//! ```
//!
//! ## LLM invocation
//!
//! [`LlmClient`] wraps any [`CompletionModel`] with response caching
//! (distributed tier plus local LRU fallback), retry with exponential
//! backoff and jitter, per-call timeouts, and positional batch execution.

pub mod checkpoint;
pub mod embeddings;
pub mod error;
pub mod executor;
pub mod graph;
pub mod language_models;
pub mod llm;
pub mod node;
pub mod rate_limiters;
pub mod retrieval;
pub mod retry;
pub mod scrub;
pub mod state;

pub use checkpoint::{
    Checkpoint, CheckpointId, CheckpointMetadata, Checkpointer, FileCheckpointer,
    MemoryCheckpointer, PendingWrite, ThreadId, ThreadInfo,
};
pub use error::{CheckpointError, Error, ErrorKind, Result};
pub use executor::{CompiledGraph, ExecutionResult};
pub use graph::{StateGraph, END, START};
pub use language_models::{
    CompletionModel, CompletionRequest, CompletionResponse, MockCompletionModel, Usage,
};
pub use llm::cache::{CacheStats, CachedResponse, ResponseCache};
pub use llm::{LlmClient, LlmOptions};
pub use node::Node;
pub use retrieval::{
    Citation, KnowledgeChunk, KnowledgeRetriever, KnowledgeStore, RetrievedContext,
};
pub use retry::RetryPolicy;
pub use scrub::Scrubber;
pub use state::{GraphState, MergeableState};
