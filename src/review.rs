use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{FailureAction, ReviewConfig};
use crate::error::Result;
use crate::executor::{ExecutionEngine, synthetic_issue};
use crate::filter::build_allowed_lines;
use crate::llm::{CallManager, HttpTransport, LlmTransport, RunContext, UsageContextProvider};
use crate::planner;
use crate::types::{
    AstMap, DiagnosticsMap, DiffMap, Issue, LoadedFile, Severity, normalize_path,
};

/// One configured review pipeline. `review()` may be called repeatedly; all
/// per-run state (continuation caches, processed-unit guard) is scoped to a
/// fresh `RunContext` per call, never shared across runs.
pub struct ReviewSession {
    config: Arc<ReviewConfig>,
    transport: Arc<dyn LlmTransport>,
    context_provider: Option<Arc<dyn UsageContextProvider>>,
}

impl ReviewSession {
    pub fn new(config: ReviewConfig, transport: Arc<dyn LlmTransport>) -> Self {
        Self {
            config: Arc::new(config),
            transport,
            context_provider: None,
        }
    }

    /// Session backed by the production HTTP transport.
    pub fn with_http(config: ReviewConfig) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(&config)?);
        Ok(Self::new(config, transport))
    }

    /// Attach an optional usage-context source (e.g. LSP references) whose
    /// output is appended to scoped prompts. Lookup failures are tolerated.
    pub fn with_context_provider(mut self, provider: Arc<dyn UsageContextProvider>) -> Self {
        self.context_provider = Some(provider);
        self
    }

    /// Review a set of loaded files with optional AST-snippet, diff, and
    /// diagnostics context, returning the flattened issues in batch order.
    pub async fn review(
        &self,
        files: &[LoadedFile],
        ast_map: &AstMap,
        diff_map: &DiffMap,
        diagnostics: &DiagnosticsMap,
    ) -> Result<Vec<Issue>> {
        self.config.validate()?;
        self.config.validate_endpoint()?;

        let ast_map = normalize_keys(ast_map);
        let diff_map = normalize_keys(diff_map);
        let diagnostics = normalize_keys(diagnostics);

        let units = planner::build_units(files, &ast_map, &diff_map, &self.config);
        if units.is_empty() {
            info!("Nothing to review");
            return Ok(Vec::new());
        }
        let batches = Arc::new(planner::plan_batches(units, &self.config));
        let allowed = build_allowed_lines(&ast_map, &diff_map);

        let ctx = Arc::new(RunContext::new());
        let mut engine = ExecutionEngine::new(
            CallManager::new(Arc::clone(&self.transport), Arc::clone(&self.config)),
            Arc::clone(&self.config),
            allowed,
            ast_map,
            diagnostics,
        );
        if let Some(provider) = &self.context_provider {
            engine = engine.with_context_provider(Arc::clone(provider));
        }
        let engine = Arc::new(engine);

        let outcomes = engine.run_batches(ctx, Arc::clone(&batches)).await?;

        let mut issues = Vec::new();
        for (index, outcome) in outcomes {
            match outcome {
                Ok(batch_issues) => issues.extend(batch_issues),
                Err(e) if self.config.action == FailureAction::BlockCommit => {
                    // Other batches already ran to completion; their results
                    // are dropped because the review as a whole failed.
                    return Err(e);
                }
                Err(e) => {
                    warn!(batch = index, error = %e, "Batch failed, reporting as issue");
                    issues.push(synthetic_issue(&batches[index], &e));
                }
            }
        }

        for issue in issues.iter_mut() {
            issue.severity = remap_severity(self.config.action, issue.severity);
        }

        info!(issues = issues.len(), "Review complete");
        Ok(issues)
    }
}

/// Severity mapping per failure action: block_commit promotes info to
/// warning, warning demotes error to warning, log forces everything to
/// info.
pub fn remap_severity(action: FailureAction, severity: Severity) -> Severity {
    match (action, severity) {
        (FailureAction::BlockCommit, Severity::Info) => Severity::Warning,
        (FailureAction::BlockCommit, s) => s,
        (FailureAction::Warning, Severity::Error) => Severity::Warning,
        (FailureAction::Warning, s) => s,
        (FailureAction::Log, _) => Severity::Info,
    }
}

fn normalize_keys<V: Clone>(
    map: &std::collections::HashMap<String, V>,
) -> std::collections::HashMap<String, V> {
    map.iter()
        .map(|(k, v)| (normalize_path(k), v.clone()))
        .collect()
}
