pub mod config;
pub mod error;
pub mod executor;
pub mod filter;
pub mod llm;
pub mod parser;
pub mod planner;
pub mod prompt;
pub mod review;
pub mod types;

pub use config::{BatchingMode, ChunkStrategy, FailureAction, ProviderKind, ReviewConfig};
pub use error::{ReviewError, Result};
pub use llm::{HttpTransport, LlmTransport, RunContext, TransportReply, UsageContextProvider};
pub use review::ReviewSession;
pub use types::{
    AffectedScopeResult, AstRange, Diagnostic, DiffHunk, FileDiff, Issue, LoadedFile, ReviewUnit,
    ScopeSnippet, Severity, SourceType,
};
