//! The code-audit workflow:
//! `parse_diff -> enrich_context -> classify_violations ->
//! filter_false_positives -> finalize`.
//!
//! Structurally the twin of the struggle graph: same runtime, same
//! checkpointing, same advisory retrieval. Ambiguous violations are batched
//! through the LLM layer; a per-item failure keeps the item (conservative)
//! without losing the batch.

use crate::struggle::ThreadStatus;
use aura::{
    CompletionRequest, KnowledgeRetriever, LlmClient, MergeableState, Node, Result, StateGraph,
    END,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// One added line from a parsed diff.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AddedLine {
    pub file: String,
    pub line: u32,
    pub content: String,
}

/// A rule violation found in the diff.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub rule: String,
    pub file: String,
    pub line: u32,
    pub message: String,
    /// Ambiguous violations go through the LLM false-positive filter.
    pub ambiguous: bool,
    pub confirmed: bool,
}

/// Typed state for the audit graph.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditState {
    /// The unified diff under audit.
    pub diff: String,
    pub source: String,
    pub status: ThreadStatus,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub added_lines: Vec<AddedLine>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub violations: Vec<Violation>,
    #[serde(default)]
    pub error: Option<String>,
}

impl AuditState {
    #[must_use]
    pub fn new(diff: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            diff: diff.into(),
            source: source.into(),
            ..Self::default()
        }
    }
}

impl MergeableState for AuditState {
    fn merge(&mut self, other: &Self) {
        self.status = other.status;
        if !other.files_changed.is_empty() {
            self.files_changed.clone_from(&other.files_changed);
        }
        if !other.added_lines.is_empty() {
            self.added_lines.clone_from(&other.added_lines);
        }
        if other.context.is_some() {
            self.context.clone_from(&other.context);
        }
        if !other.violations.is_empty() {
            self.violations.clone_from(&other.violations);
        }
        if other.error.is_some() {
            self.error.clone_from(&other.error);
        }
    }
}

/// Extract changed files and added lines from a unified diff.
struct ParseDiffNode;

#[async_trait::async_trait]
impl Node<AuditState> for ParseDiffNode {
    async fn execute(&self, mut state: AuditState) -> Result<AuditState> {
        let mut current_file = String::new();
        let mut current_line: u32 = 0;
        let mut files = Vec::new();
        let mut added = Vec::new();

        for line in state.diff.lines() {
            if let Some(path) = line.strip_prefix("+++ b/") {
                current_file = path.to_string();
                if !files.contains(&current_file) {
                    files.push(current_file.clone());
                }
            } else if let Some(rest) = line.strip_prefix("@@ ") {
                // Hunk header: "@@ -a,b +c,d @@"; c is the new-file start.
                current_line = rest
                    .split_whitespace()
                    .find(|token| token.starts_with('+'))
                    .and_then(|token| {
                        token
                            .trim_start_matches('+')
                            .split(',')
                            .next()
                            .and_then(|n| n.parse::<u32>().ok())
                    })
                    .unwrap_or(0);
            } else if let Some(content) = line.strip_prefix('+') {
                if !line.starts_with("+++") && !current_file.is_empty() {
                    added.push(AddedLine {
                        file: current_file.clone(),
                        line: current_line,
                        content: content.to_string(),
                    });
                    current_line += 1;
                }
            } else if !line.starts_with('-') && !line.starts_with("---") {
                current_line = current_line.saturating_add(1);
            }
        }

        debug!(files = files.len(), added = added.len(), "Parsed diff");
        state.files_changed = files;
        state.added_lines = added;
        state.status = ThreadStatus::Running;
        Ok(state)
    }

    fn name(&self) -> String {
        "parse_diff".to_string()
    }
}

/// Advisory retrieval of review guidance for the touched files.
struct EnrichContextNode {
    retriever: Arc<KnowledgeRetriever>,
}

#[async_trait::async_trait]
impl Node<AuditState> for EnrichContextNode {
    async fn execute(&self, mut state: AuditState) -> Result<AuditState> {
        if state.files_changed.is_empty() {
            return Ok(state);
        }
        let query = format!("code review guidance for {}", state.files_changed.join(", "));
        let retrieved = self.retriever.query(&query, &[]).await;
        if !retrieved.context.is_empty() {
            state.context = Some(retrieved.context);
        }
        Ok(state)
    }

    fn name(&self) -> String {
        "enrich_context".to_string()
    }
}

fn is_test_file(file: &str) -> bool {
    file.contains("/tests/") || file.ends_with("_test.rs") || file.contains("test_")
}

/// Rule-based classification over added lines.
struct ClassifyViolationsNode;

#[async_trait::async_trait]
impl Node<AuditState> for ClassifyViolationsNode {
    async fn execute(&self, mut state: AuditState) -> Result<AuditState> {
        let mut violations = Vec::new();
        for added in &state.added_lines {
            let content = added.content.trim();

            if content.contains(".unwrap()") && !is_test_file(&added.file) {
                violations.push(Violation {
                    rule: "no-unwrap".to_string(),
                    file: added.file.clone(),
                    line: added.line,
                    message: "unwrap() outside tests; propagate the error instead".to_string(),
                    ambiguous: true,
                    confirmed: false,
                });
            }
            if content.contains("println!") && !is_test_file(&added.file) {
                violations.push(Violation {
                    rule: "no-debug-print".to_string(),
                    file: added.file.clone(),
                    line: added.line,
                    message: "println! in library code; use tracing instead".to_string(),
                    ambiguous: true,
                    confirmed: false,
                });
            }
            if content.contains("password=") || content.contains("api_key=") {
                violations.push(Violation {
                    rule: "hardcoded-secret".to_string(),
                    file: added.file.clone(),
                    line: added.line,
                    message: "possible hardcoded credential".to_string(),
                    ambiguous: false,
                    confirmed: true,
                });
            }
            if added.content.len() > 120 {
                violations.push(Violation {
                    rule: "line-length".to_string(),
                    file: added.file.clone(),
                    line: added.line,
                    message: format!("line is {} chars (max 120)", added.content.len()),
                    ambiguous: false,
                    confirmed: true,
                });
            }
        }

        debug!(count = violations.len(), "Classified violations");
        state.violations = violations;
        Ok(state)
    }

    fn name(&self) -> String {
        "classify_violations".to_string()
    }
}

/// Batches ambiguous violations through the LLM layer. Position `i` of the
/// batch result belongs to ambiguous violation `i`; a failed item keeps its
/// violation confirmed (conservative) and never aborts siblings.
struct FilterFalsePositivesNode {
    llm: Arc<LlmClient>,
}

#[async_trait::async_trait]
impl Node<AuditState> for FilterFalsePositivesNode {
    async fn execute(&self, mut state: AuditState) -> Result<AuditState> {
        let ambiguous_ix: Vec<usize> = state
            .violations
            .iter()
            .enumerate()
            .filter(|(_, v)| v.ambiguous)
            .map(|(i, _)| i)
            .collect();
        if ambiguous_ix.is_empty() {
            return Ok(state);
        }

        let requests: Vec<CompletionRequest> = ambiguous_ix
            .iter()
            .map(|&i| {
                let violation = &state.violations[i];
                CompletionRequest::new(format!(
                    "A static check flagged `{}` at {}:{} with rule '{}'.\n\
                     Is this a real issue worth surfacing to a reviewer? \
                     Answer exactly 'yes' or 'no'.",
                    violation.message, violation.file, violation.line, violation.rule
                ))
                .with_temperature(0.0)
            })
            .collect();

        let results = self.llm.invoke_batch(requests).await;
        for (&violation_ix, result) in ambiguous_ix.iter().zip(results.iter()) {
            match result {
                Ok(response) => {
                    let verdict = response.text.trim().to_lowercase();
                    state.violations[violation_ix].confirmed = !verdict.starts_with("no");
                }
                Err(e) => {
                    warn!(error = %e, "False-positive check failed; keeping violation");
                    state.violations[violation_ix].confirmed = true;
                }
            }
        }
        Ok(state)
    }

    fn name(&self) -> String {
        "filter_false_positives".to_string()
    }
}

/// Keep confirmed violations and mark the thread completed.
struct FinalizeAuditNode;

#[async_trait::async_trait]
impl Node<AuditState> for FinalizeAuditNode {
    async fn execute(&self, mut state: AuditState) -> Result<AuditState> {
        state.violations.retain(|v| v.confirmed);
        state.status = ThreadStatus::Completed;
        Ok(state)
    }

    fn name(&self) -> String {
        "finalize".to_string()
    }
}

/// Build the audit graph over the injected services.
pub fn build_audit_graph(
    retriever: Arc<KnowledgeRetriever>,
    llm: Arc<LlmClient>,
) -> Result<aura::CompiledGraph<AuditState>> {
    let mut graph: StateGraph<AuditState> = StateGraph::new();

    graph.add_node("parse_diff", ParseDiffNode);
    graph.add_node("enrich_context", EnrichContextNode { retriever });
    graph.add_node("classify_violations", ClassifyViolationsNode);
    graph.add_node("filter_false_positives", FilterFalsePositivesNode { llm });
    graph.add_node("finalize", FinalizeAuditNode);

    graph.set_entry_point("parse_diff");
    graph.add_edge("parse_diff", "enrich_context");
    graph.add_edge("enrich_context", "classify_violations");
    graph.add_edge("classify_violations", "filter_false_positives");
    graph.add_edge("filter_false_positives", "finalize");
    graph.add_edge("finalize", END);

    graph.compile()
}
