use tracing::debug;

use crate::config::{BatchingMode, ChunkStrategy, ReviewConfig};
use crate::types::{
    AstMap, DiffMap, LoadedFile, ReviewUnit, ScopeSnippet, SourceType, normalize_path,
};

/// Build review units from loaded files plus optional AST-snippet and diff
/// context. One unit per file, except a file whose snippet count exceeds the
/// budget in ast_snippet mode, which is split into per-chunk units.
pub fn build_units(
    files: &[LoadedFile],
    ast_map: &AstMap,
    diff_map: &DiffMap,
    config: &ReviewConfig,
) -> Vec<ReviewUnit> {
    let budget = config.snippet_budget();
    let mut units = Vec::new();

    for file in files {
        let path = normalize_path(&file.path);
        let snippets = ast_map.get(&path).map(|r| r.snippets.as_slice());

        if let Some(snippets) = snippets.filter(|s| !s.is_empty()) {
            if config.batching_mode == BatchingMode::AstSnippet && snippets.len() > budget {
                let chunks = chunk_snippets(snippets, budget, config.ast_chunk_strategy);
                debug!(
                    path = %path,
                    snippets = snippets.len(),
                    chunks = chunks.len(),
                    "Splitting over-budget file into snippet chunks"
                );
                for (i, chunk) in chunks.iter().enumerate() {
                    units.push(ReviewUnit::new(
                        format!("{path}::{i}"),
                        &path,
                        render_snippets(chunk),
                        chunk.len(),
                        SourceType::Ast,
                    ));
                }
            } else {
                units.push(ReviewUnit::new(
                    path.clone(),
                    &path,
                    file.content.clone(),
                    snippets.len(),
                    SourceType::Ast,
                ));
            }
            continue;
        }

        if let Some(diff) = diff_map.get(&path) {
            if diff.format_only || diff.comment_only {
                debug!(path = %path, "Skipping formatting/comment-only change");
                continue;
            }
            if !diff.hunks.is_empty() {
                units.push(ReviewUnit::new(
                    path.clone(),
                    &path,
                    file.content.clone(),
                    diff.hunks.len(),
                    SourceType::Diff,
                ));
                continue;
            }
        }

        units.push(ReviewUnit::new(
            path.clone(),
            &path,
            file.content.clone(),
            1,
            SourceType::Full,
        ));
    }

    units
}

/// Split one file's snippets into ceil(n/budget) chunks, each at most
/// budget-many snippets. Snippet order is preserved in both strategies.
pub fn chunk_snippets(
    snippets: &[ScopeSnippet],
    budget: usize,
    strategy: ChunkStrategy,
) -> Vec<Vec<ScopeSnippet>> {
    let budget = budget.max(1);
    if snippets.is_empty() {
        return Vec::new();
    }

    match strategy {
        ChunkStrategy::Contiguous => snippets.chunks(budget).map(|c| c.to_vec()).collect(),
        ChunkStrategy::Even => {
            let n = snippets.len();
            let chunk_count = n.div_ceil(budget);
            let base = n / chunk_count;
            let remainder = n % chunk_count;

            let mut chunks = Vec::with_capacity(chunk_count);
            let mut offset = 0;
            for i in 0..chunk_count {
                let size = if i < remainder { base + 1 } else { base };
                chunks.push(snippets[offset..offset + size].to_vec());
                offset += size;
            }
            chunks
        }
    }
}

fn render_snippets(snippets: &[ScopeSnippet]) -> String {
    snippets
        .iter()
        .map(|s| format!("[lines {}-{}]\n{}", s.start_line, s.end_line, s.source))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Group units into batches. file_count mode uses fixed groups of K;
/// ast_snippet mode packs greedily under the weight budget. A single unit
/// heavier than the budget still gets its own oversized batch: work is
/// never dropped.
pub fn plan_batches(units: Vec<ReviewUnit>, config: &ReviewConfig) -> Vec<Vec<ReviewUnit>> {
    if units.is_empty() {
        return Vec::new();
    }

    match config.batching_mode {
        BatchingMode::FileCount => {
            let k = config.batch_size.max(1);
            let mut batches = Vec::new();
            let mut current = Vec::with_capacity(k);
            for unit in units {
                current.push(unit);
                if current.len() == k {
                    batches.push(std::mem::take(&mut current));
                }
            }
            if !current.is_empty() {
                batches.push(current);
            }
            batches
        }
        BatchingMode::AstSnippet => {
            let budget = config.snippet_budget();
            let mut batches: Vec<Vec<ReviewUnit>> = Vec::new();
            let mut current: Vec<ReviewUnit> = Vec::new();
            let mut current_weight = 0usize;

            for unit in units {
                let weight = unit.weight();
                if !current.is_empty() && current_weight + weight > budget {
                    batches.push(std::mem::take(&mut current));
                    current_weight = 0;
                }
                current_weight += weight;
                current.push(unit);
            }
            if !current.is_empty() {
                batches.push(current);
            }
            batches
        }
    }
}

/// Midpoint split at ceil(n/2). Used for proactive size-cap splitting and
/// reactive splitting after a context-overflow failure.
pub fn bisect(units: Vec<ReviewUnit>) -> (Vec<ReviewUnit>, Vec<ReviewUnit>) {
    let mid = units.len().div_ceil(2);
    let mut front = units;
    let back = front.split_off(mid);
    (front, back)
}
