use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, info, warn};

use crate::config::ReviewConfig;
use crate::error::{ReviewError, Result};
use crate::filter;
use crate::llm::{CallManager, RunContext, UsageContextProvider};
use crate::planner;
use crate::prompt;
use crate::types::{
    AllowedLines, AstMap, Diagnostic, DiagnosticsMap, Issue, IssuesPayload, ReviewUnit, Severity,
    SourceType,
};

/// Bounded-concurrency batch executor. Workers pull batch indices from a
/// shared atomic cursor and write each result into its positional slot, so
/// the flattened output preserves batch order no matter which worker
/// finishes first.
///
/// Known gap, accepted by design: there is no cross-batch cancellation. If
/// the caller abandons the review, in-flight batches still run to
/// completion.
pub struct ExecutionEngine {
    manager: CallManager,
    config: Arc<ReviewConfig>,
    allowed: AllowedLines,
    ast_map: AstMap,
    diagnostics: DiagnosticsMap,
    context_provider: Option<Arc<dyn UsageContextProvider>>,
}

impl ExecutionEngine {
    pub fn new(
        manager: CallManager,
        config: Arc<ReviewConfig>,
        allowed: AllowedLines,
        ast_map: AstMap,
        diagnostics: DiagnosticsMap,
    ) -> Self {
        Self {
            manager,
            config,
            allowed,
            ast_map,
            diagnostics,
            context_provider: None,
        }
    }

    pub fn with_context_provider(mut self, provider: Arc<dyn UsageContextProvider>) -> Self {
        self.context_provider = Some(provider);
        self
    }

    /// Run all batches with `min(configured, N)` workers and return the
    /// per-batch outcomes in batch-index order.
    pub async fn run_batches(
        self: Arc<Self>,
        ctx: Arc<RunContext>,
        batches: Arc<Vec<Vec<ReviewUnit>>>,
    ) -> Result<Vec<(usize, Result<Vec<Issue>>)>> {
        let total = batches.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        let workers = self.config.batch_concurrency.clamp(1, 8).min(total);
        info!(batches = total, workers, "Executing review batches");

        let cursor = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let engine = Arc::clone(&self);
            let ctx = Arc::clone(&ctx);
            let batches = Arc::clone(&batches);
            let cursor = Arc::clone(&cursor);

            handles.push(tokio::spawn(async move {
                let mut outcomes = Vec::new();
                loop {
                    let index = cursor.fetch_add(1, Ordering::SeqCst);
                    if index >= batches.len() {
                        break;
                    }
                    let units = batches[index].clone();
                    debug!(index, units = units.len(), "Worker claimed batch");
                    let result = engine.run_one(&ctx, units).await;
                    outcomes.push((index, result));
                }
                outcomes
            }));
        }

        // Slot per batch, written once, read only after all workers join.
        let mut slots: Vec<Option<Result<Vec<Issue>>>> = (0..total).map(|_| None).collect();
        for handle in handles {
            let outcomes = handle
                .await
                .map_err(|e| ReviewError::Other(format!("worker task failed: {e}")))?;
            for (index, result) in outcomes {
                slots[index] = Some(result);
            }
        }

        Ok(slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| {
                let result =
                    slot.unwrap_or_else(|| Err(ReviewError::Other(format!("batch {i} never ran"))));
                (i, result)
            })
            .collect())
    }

    async fn run_one(&self, ctx: &RunContext, units: Vec<ReviewUnit>) -> Result<Vec<Issue>> {
        // Claim before any work so a unit runs at most once per review.
        let fresh = ctx.claim_units(units);
        if fresh.is_empty() {
            warn!("All units of this batch were already processed, skipping");
            return Ok(Vec::new());
        }
        self.execute_batch(ctx, fresh, true, true).await
    }

    /// Depth-limited recursive execution: one proactive size split before
    /// the call, then at most one reactive split after a context-overflow
    /// failure. A single unit cannot split; its error propagates.
    fn execute_batch<'a>(
        &'a self,
        ctx: &'a RunContext,
        units: Vec<ReviewUnit>,
        allow_split: bool,
        allow_resplit: bool,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Issue>>> + Send + 'a>> {
        Box::pin(async move {
            if units.len() > 1 && allow_split {
                let estimated = prompt::estimate_request_chars(&units);
                if estimated > self.config.max_request_chars {
                    debug!(
                        estimated,
                        cap = self.config.max_request_chars,
                        "Estimated request size over cap, bisecting before call"
                    );
                    let (front, back) = planner::bisect(units);
                    let mut issues = self.execute_batch(ctx, front, false, true).await?;
                    issues.extend(self.execute_batch(ctx, back, false, true).await?);
                    return Ok(issues);
                }
            }

            let scoped_paths: HashSet<String> = units
                .iter()
                .filter(|u| u.source_type != SourceType::Full)
                .map(|u| u.path.clone())
                .collect();
            let full_paths: HashSet<String> = units
                .iter()
                .filter(|u| u.source_type == SourceType::Full)
                .map(|u| u.path.clone())
                .collect();
            let diagnostics = self.batch_diagnostics(&units);
            let usage_context = self.gather_usage_context(&scoped_paths).await;

            match self
                .manager
                .call(ctx, &units, !scoped_paths.is_empty(), &diagnostics, &usage_context)
                .await
            {
                Ok(payload) => Ok(self.postprocess(&units, payload, &scoped_paths, &full_paths)),
                Err(e) if e.is_context_overflow() && units.len() > 1 && allow_resplit => {
                    warn!(units = units.len(), error = %e, "Context overflow, bisecting batch");
                    let (front, back) = planner::bisect(units);
                    let mut issues = self.execute_batch(ctx, front, false, false).await?;
                    issues.extend(self.execute_batch(ctx, back, false, false).await?);
                    Ok(issues)
                }
                Err(e) => Err(e),
            }
        })
    }

    /// Usage context for the batch's scoped files, best effort: a provider
    /// failure degrades to no context for that file and never fails the
    /// batch.
    async fn gather_usage_context(&self, scoped_paths: &HashSet<String>) -> String {
        let provider = match &self.context_provider {
            Some(provider) => provider,
            None => return String::new(),
        };

        let mut paths: Vec<&String> = scoped_paths.iter().collect();
        paths.sort();

        let mut sections = Vec::new();
        for path in paths {
            let snippets = match self.ast_map.get(path) {
                Some(scope) if !scope.snippets.is_empty() => &scope.snippets,
                _ => continue,
            };
            match provider.usage_context(path, snippets).await {
                Ok(context) if !context.is_empty() => sections.push(context),
                Ok(_) => {}
                Err(e) => {
                    warn!(path = %path, error = %e, "Usage context lookup failed, continuing without it");
                }
            }
        }
        sections.join("\n")
    }

    /// Diagnostics relevant to this batch's files, flattened for the prompt.
    /// Chunked units share a path, so each file contributes once.
    fn batch_diagnostics(&self, units: &[ReviewUnit]) -> Vec<(String, Diagnostic)> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for unit in units {
            if !seen.insert(unit.path.as_str()) {
                continue;
            }
            if let Some(diags) = self.diagnostics.get(&unit.path) {
                for diag in diags {
                    out.push((unit.path.clone(), diag.clone()));
                }
            }
        }
        out
    }

    fn postprocess(
        &self,
        units: &[ReviewUnit],
        payload: IssuesPayload,
        scoped_paths: &HashSet<String>,
        full_paths: &HashSet<String>,
    ) -> Vec<Issue> {
        let issues = transform_issues(payload);
        let issues = filter::apply_allowed_lines(issues, &self.allowed, scoped_paths, full_paths);
        let mut issues = issues;
        filter::attach_ast_ranges(&mut issues, &self.ast_map);
        let issues = filter::dedup_against_diagnostics(issues, &self.diagnostics);
        debug!(
            batch_files = units.len(),
            issues = issues.len(),
            "Batch post-filter complete"
        );
        issues
    }
}

/// Map the wire payload into caller-facing issues with normalized paths.
pub fn transform_issues(payload: IssuesPayload) -> Vec<Issue> {
    payload
        .issues
        .into_iter()
        .map(|raw| Issue {
            file: crate::types::normalize_path(&raw.file),
            line: raw.line.max(1),
            column: raw.column.max(1),
            message: raw.message,
            severity: raw.severity,
            rule: "ai_review".to_string(),
            ast_range: None,
        })
        .collect()
}

/// Synthetic issue carrying a terminal batch error, so one bad batch never
/// erases the rest of the review's results.
pub fn synthetic_issue(units: &[ReviewUnit], err: &ReviewError) -> Issue {
    Issue {
        file: units.first().map(|u| u.path.clone()).unwrap_or_default(),
        line: 1,
        column: 1,
        message: format!("AI review failed for this batch: {err}"),
        severity: Severity::Error,
        rule: err.synthetic_rule().to_string(),
        ast_range: None,
    }
}
