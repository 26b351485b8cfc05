//! The struggle workflow: `detect -> maybe_retrieve -> generate -> finalize`.
//!
//! State is a typed schema, not an open-ended bag: inputs, the struggle
//! verdict, retrieved context, and the lesson recommendation each have their
//! own field. Nodes are idempotent over their patches, which the runtime
//! relies on for at-least-once execution.

use crate::config::ServiceConfig;
use crate::dto::TriggerRequest;
use aura::{
    CompletionRequest, KnowledgeRetriever, LlmClient, MergeableState, Node, Result, Scrubber,
    StateGraph, END,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Thread lifecycle as recorded in the state itself.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ThreadStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Submission fields the workflow reads.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StruggleInputs {
    pub edit_frequency: f64,
    pub error_logs: Vec<String>,
    pub history: Vec<String>,
    pub source: String,
    pub file_path: Option<String>,
    pub language_id: Option<String>,
    pub code_snippet: Option<String>,
    pub client_timestamp: i64,
    pub struggle_reason: Option<String>,
    pub retry_count: Option<u32>,
    pub combined_score: Option<f64>,
    pub primary_signal: Option<String>,
    pub undo_redo_pattern: Option<String>,
    pub hesitation_ms: Option<u64>,
    pub terminal_errors: Vec<String>,
    pub debug_breakpoint_changes: Option<u32>,
}

impl From<&TriggerRequest> for StruggleInputs {
    fn from(request: &TriggerRequest) -> Self {
        Self {
            edit_frequency: request.edit_frequency,
            error_logs: request.error_logs.clone(),
            history: request.history.clone(),
            source: request.source.clone(),
            file_path: request.file_path.clone(),
            language_id: request.language_id.clone(),
            code_snippet: request.code_snippet.clone(),
            client_timestamp: request.client_timestamp,
            struggle_reason: request.struggle_reason.clone(),
            retry_count: request.retry_count,
            combined_score: request.combined_score,
            primary_signal: request.primary_signal.clone(),
            undo_redo_pattern: request.undo_redo_pattern.clone(),
            hesitation_ms: request.hesitation_ms,
            terminal_errors: request.terminal_errors.clone().unwrap_or_default(),
            debug_breakpoint_changes: request.debug_breakpoint_changes,
        }
    }
}

/// Typed state for the struggle graph.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StruggleState {
    pub inputs: StruggleInputs,
    pub status: ThreadStatus,
    pub is_struggling: bool,
    #[serde(default)]
    pub rag_context: Option<String>,
    #[serde(default)]
    pub lesson_recommendation: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl StruggleState {
    #[must_use]
    pub fn from_request(request: &TriggerRequest) -> Self {
        Self {
            inputs: StruggleInputs::from(request),
            status: ThreadStatus::Pending,
            ..Self::default()
        }
    }
}

impl MergeableState for StruggleState {
    fn merge(&mut self, other: &Self) {
        self.is_struggling |= other.is_struggling;
        self.status = other.status;
        if other.rag_context.is_some() {
            self.rag_context.clone_from(&other.rag_context);
        }
        if other.lesson_recommendation.is_some() {
            self.lesson_recommendation
                .clone_from(&other.lesson_recommendation);
        }
        if other.error.is_some() {
            self.error.clone_from(&other.error);
        }
    }
}

/// Route label returned by the detect router.
const ROUTE_STRUGGLING: &str = "struggling";
const ROUTE_OK: &str = "ok";

/// Sets `is_struggling` from the submitted aggregate plus coarse sanity
/// checks: rapid edits, at least one error log, or a combined score over the
/// trigger threshold.
struct DetectNode {
    edit_frequency_threshold: f64,
    trigger_threshold: f64,
}

#[async_trait::async_trait]
impl Node<StruggleState> for DetectNode {
    async fn execute(&self, mut state: StruggleState) -> Result<StruggleState> {
        let inputs = &state.inputs;
        let rapid_edits = inputs.edit_frequency >= self.edit_frequency_threshold;
        let has_errors = !inputs.error_logs.is_empty() || !inputs.terminal_errors.is_empty();
        let over_threshold = inputs
            .combined_score
            .is_some_and(|score| score >= self.trigger_threshold);

        state.is_struggling = rapid_edits || has_errors || over_threshold;
        state.status = ThreadStatus::Running;
        debug!(
            is_struggling = state.is_struggling,
            rapid_edits, has_errors, over_threshold, "Struggle detection"
        );
        Ok(state)
    }

    fn name(&self) -> String {
        "detect".to_string()
    }
}

/// Fetches knowledge context when struggling. Advisory: an unavailable
/// index yields an empty context, never a failure.
struct RetrieveNode {
    retriever: Arc<KnowledgeRetriever>,
}

#[async_trait::async_trait]
impl Node<StruggleState> for RetrieveNode {
    async fn execute(&self, mut state: StruggleState) -> Result<StruggleState> {
        let mut error_patterns = state.inputs.error_logs.clone();
        error_patterns.extend(state.inputs.terminal_errors.iter().cloned());

        let query = match &state.inputs.language_id {
            Some(language) => format!("{language} {}", error_patterns.join(" | ")),
            None => error_patterns.join(" | "),
        };

        let retrieved = self.retriever.query(&query, &error_patterns).await;
        if !retrieved.context.is_empty() {
            state.rag_context = Some(retrieved.context);
        }
        Ok(state)
    }

    fn name(&self) -> String {
        "maybe_retrieve".to_string()
    }
}

/// Deterministic prompt template for lesson generation.
fn lesson_prompt(state: &StruggleState, scrubber: &Scrubber) -> String {
    let inputs = &state.inputs;
    let mut prompt = String::from(
        "You are a coding mentor. A developer appears to be struggling. \
         Produce one short, actionable micro-lesson.\n\n",
    );

    if let Some(language) = &inputs.language_id {
        prompt.push_str(&format!("Language: {language}\n"));
    }
    if let Some(reason) = &inputs.struggle_reason {
        prompt.push_str(&format!("Reported reason: {reason}\n"));
    }
    if !inputs.error_logs.is_empty() {
        prompt.push_str("Recent errors:\n");
        for error in &inputs.error_logs {
            prompt.push_str(&format!("- {error}\n"));
        }
    }
    if !inputs.terminal_errors.is_empty() {
        prompt.push_str("Terminal output:\n");
        for error in &inputs.terminal_errors {
            prompt.push_str(&format!("- {error}\n"));
        }
    }
    if let Some(snippet) = &inputs.code_snippet {
        prompt.push_str(&format!("Code under edit:\n```\n{snippet}\n```\n"));
    }
    if !inputs.history.is_empty() {
        prompt.push_str("Lessons already shown this session (do not repeat):\n");
        for lesson in &inputs.history {
            prompt.push_str(&format!("- {lesson}\n"));
        }
    }
    if let Some(context) = &state.rag_context {
        prompt.push_str(&format!("Reference material:\n{context}\n"));
    }
    prompt.push_str("\nRespond with the lesson only.");

    scrubber.scrub(&prompt)
}

/// Calls the LLM with the scrubbed prompt and stores the generated lesson.
struct GenerateNode {
    llm: Arc<LlmClient>,
    scrubber: Scrubber,
}

#[async_trait::async_trait]
impl Node<StruggleState> for GenerateNode {
    async fn execute(&self, mut state: StruggleState) -> Result<StruggleState> {
        let prompt = lesson_prompt(&state, &self.scrubber);
        let request = CompletionRequest::new(prompt).with_temperature(0.3);
        let response = self.llm.invoke(&request).await?;
        state.lesson_recommendation = Some(response.text);
        Ok(state)
    }

    fn name(&self) -> String {
        "generate".to_string()
    }
}

/// Marks the thread completed.
struct FinalizeNode;

#[async_trait::async_trait]
impl Node<StruggleState> for FinalizeNode {
    async fn execute(&self, mut state: StruggleState) -> Result<StruggleState> {
        state.status = ThreadStatus::Completed;
        Ok(state)
    }

    fn name(&self) -> String {
        "finalize".to_string()
    }
}

/// Build the struggle graph over the injected services.
pub fn build_struggle_graph(
    config: &ServiceConfig,
    retriever: Arc<KnowledgeRetriever>,
    llm: Arc<LlmClient>,
) -> Result<aura::CompiledGraph<StruggleState>> {
    let mut graph: StateGraph<StruggleState> = StateGraph::new();

    graph.add_node(
        "detect",
        DetectNode {
            edit_frequency_threshold: config.detector.edit_frequency_threshold_per_min,
            trigger_threshold: config.aggregator.trigger_threshold,
        },
    );
    graph.add_node("maybe_retrieve", RetrieveNode { retriever });
    graph.add_node(
        "generate",
        GenerateNode {
            llm,
            scrubber: Scrubber::new(),
        },
    );
    graph.add_node("finalize", FinalizeNode);

    graph.set_entry_point("detect");

    let mut routes = HashMap::new();
    routes.insert(ROUTE_STRUGGLING.to_string(), "maybe_retrieve".to_string());
    routes.insert(ROUTE_OK.to_string(), "finalize".to_string());
    graph.add_conditional_edges(
        "detect",
        |state: &StruggleState| {
            if state.is_struggling {
                ROUTE_STRUGGLING.to_string()
            } else {
                ROUTE_OK.to_string()
            }
        },
        routes,
    );
    graph.add_edge("maybe_retrieve", "generate");
    graph.add_edge("generate", "finalize");
    graph.add_edge("finalize", END);

    Ok(graph
        .compile()?
        .with_max_supersteps(config.max_supersteps))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aura::retrieval::InMemoryKnowledgeStore;
    use aura::{LlmOptions, MockCompletionModel};

    fn services() -> (Arc<KnowledgeRetriever>, Arc<LlmClient>, Arc<MockCompletionModel>) {
        let store = Arc::new(InMemoryKnowledgeStore::new(Arc::new(
            aura::embeddings::MockEmbeddings::new(32),
        )));
        let retriever = Arc::new(KnowledgeRetriever::new(store));
        let model = MockCompletionModel::answering("Lesson: read the borrow checker error.");
        let llm = Arc::new(LlmClient::new(
            Arc::clone(&model) as Arc<dyn aura::CompletionModel>,
            LlmOptions::default(),
            100,
        ));
        (retriever, llm, model)
    }

    fn struggling_request() -> TriggerRequest {
        TriggerRequest {
            edit_frequency: 14.0,
            error_logs: vec!["E0382: borrow of moved value".to_string()],
            language_id: Some("rust".to_string()),
            source: "vscode".to_string(),
            ..TriggerRequest::default()
        }
    }

    #[tokio::test]
    async fn struggling_submission_generates_a_lesson() {
        let (retriever, llm, model) = services();
        let graph =
            build_struggle_graph(&ServiceConfig::default(), retriever, llm).unwrap();

        let state = StruggleState::from_request(&struggling_request());
        let result = graph.invoke(state).await.unwrap();

        assert!(result.final_state.is_struggling);
        assert_eq!(result.final_state.status, ThreadStatus::Completed);
        assert!(result
            .final_state
            .lesson_recommendation
            .as_deref()
            .unwrap()
            .contains("Lesson"));
        assert_eq!(model.call_count(), 1);
        assert_eq!(
            result.nodes_executed,
            vec!["detect", "maybe_retrieve", "generate", "finalize"]
        );
    }

    #[tokio::test]
    async fn calm_submission_skips_retrieval_and_generation() {
        let (retriever, llm, model) = services();
        let graph =
            build_struggle_graph(&ServiceConfig::default(), retriever, llm).unwrap();

        let request = TriggerRequest {
            edit_frequency: 1.0,
            source: "vscode".to_string(),
            ..TriggerRequest::default()
        };
        let result = graph
            .invoke(StruggleState::from_request(&request))
            .await
            .unwrap();

        assert!(!result.final_state.is_struggling);
        assert!(result.final_state.lesson_recommendation.is_none());
        assert_eq!(model.call_count(), 0);
        assert_eq!(result.nodes_executed, vec!["detect", "finalize"]);
    }

    #[tokio::test]
    async fn combined_score_alone_can_mark_struggling() {
        let (retriever, llm, _model) = services();
        let graph =
            build_struggle_graph(&ServiceConfig::default(), retriever, llm).unwrap();

        let request = TriggerRequest {
            edit_frequency: 0.5,
            combined_score: Some(0.7),
            source: "vscode".to_string(),
            ..TriggerRequest::default()
        };
        let result = graph
            .invoke(StruggleState::from_request(&request))
            .await
            .unwrap();
        assert!(result.final_state.is_struggling);
    }

    #[test]
    fn prompt_includes_inputs_and_scrubs_secrets() {
        let request = TriggerRequest {
            error_logs: vec!["E0308".to_string()],
            code_snippet: Some("let key = \"sk-abcdefghijklmnopqrstuvwxyz123456\";".to_string()),
            language_id: Some("rust".to_string()),
            history: vec!["Ownership basics".to_string()],
            ..TriggerRequest::default()
        };
        let mut state = StruggleState::from_request(&request);
        state.rag_context = Some("Borrowing 101".to_string());

        let prompt = lesson_prompt(&state, &Scrubber::new());
        assert!(prompt.contains("E0308"));
        assert!(prompt.contains("Borrowing 101"));
        assert!(prompt.contains("Ownership basics"));
        assert!(prompt.contains("[REDACTED:api_key]"));
        assert!(!prompt.contains("sk-abcdef"));
    }

    #[test]
    fn merge_prefers_populated_fields() {
        let mut base = StruggleState::default();
        let mut patch = StruggleState::default();
        patch.is_struggling = true;
        patch.rag_context = Some("ctx".to_string());
        patch.status = ThreadStatus::Running;

        base.merge(&patch);
        assert!(base.is_struggling);
        assert_eq!(base.rag_context.as_deref(), Some("ctx"));

        // Merging the same patch twice is idempotent.
        let snapshot = base.clone();
        base.merge(&patch);
        assert_eq!(base, snapshot);
    }
}
