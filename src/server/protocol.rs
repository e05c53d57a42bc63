//! Domain protocol: parameters and payloads of the query server operations.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::database::{DatabaseItem, UpgradeStatus};

// ============================================================================
// Method Names
// ============================================================================

/// Query server method names. Each client operation maps to exactly one.
pub mod methods {
    pub const COMPILE: &str = "query.compile";
    pub const RUN: &str = "query.run";
    pub const RESOLVE_UPGRADES: &str = "database.resolve_upgrades";
    pub const UPGRADE: &str = "database.upgrade";
    pub const CLEAR_CACHE: &str = "cache.clear";
    pub const RESOLVE_METADATA: &str = "query.resolve_metadata";
    pub const SHUTDOWN: &str = "server.shutdown";
}

// ============================================================================
// Shared Parameter Types
// ============================================================================

/// Database context included in most requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseParams {
    /// Path to the database content.
    pub database: PathBuf,
    /// Declared source archive, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_archive: Option<PathBuf>,
}

impl From<&DatabaseItem> for DatabaseParams {
    fn from(item: &DatabaseItem) -> Self {
        Self {
            database: item.path.clone(),
            source_archive: item.source_archive.clone(),
        }
    }
}

/// Worker-side resource limits for one query execution.
///
/// The timeout is enforced by the server, not by a client-side deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub threads: u32,
    pub memory_mb: u32,
    pub timeout_secs: u64,
}

// ============================================================================
// Compilation
// ============================================================================

/// A selected sub-expression compiled as an ad-hoc query (quick evaluation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    /// The selected expression text.
    pub text: String,
    /// 1-based position of the selection in the enclosing query file.
    pub line: u32,
    pub column: u32,
}

/// Parameters for `query.compile`.
#[derive(Debug, Clone, Serialize)]
pub struct CompileParams {
    #[serde(flatten)]
    pub database: DatabaseParams,
    /// Full query source text.
    pub source: String,
    /// When present, compile only this fragment against the same database.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fragment: Option<Fragment>,
    /// Token correlating this request's progress notifications.
    pub progress_token: u64,
}

/// Severity of a compile diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// One compiler diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub line: Option<u32>,
    #[serde(default)]
    pub column: Option<u32>,
}

/// Response from `query.compile`.
#[derive(Debug, Clone, Deserialize)]
pub struct CompileResponse {
    /// Handle to the compiled plan; absent when compilation failed.
    #[serde(default)]
    pub handle: Option<String>,
    /// Compiler diagnostics, possibly non-empty even on success.
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
}

/// Opaque handle to a compiled query plan held by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledQueryHandle(pub String);

impl CompiledQueryHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Outcome of a compile operation on a live server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome {
    /// The query compiled; execution may proceed.
    Compiled(CompiledQueryHandle),
    /// The query did not compile. Surfaced as the query's result, never as a
    /// system failure, and execution is never attempted.
    Failed(Vec<Diagnostic>),
}

// ============================================================================
// Execution
// ============================================================================

/// Parameters for `query.run`.
#[derive(Debug, Clone, Serialize)]
pub struct RunParams {
    #[serde(flatten)]
    pub database: DatabaseParams,
    /// Compiled plan to execute.
    pub handle: String,
    #[serde(flatten)]
    pub limits: ResourceLimits,
    /// Token correlating this request's progress notifications.
    pub progress_token: u64,
}

/// Response from `query.run`.
#[derive(Debug, Clone, Deserialize)]
pub struct RunResponse {
    /// Where the server wrote the results; absent when evaluation failed.
    #[serde(default)]
    pub result_location: Option<PathBuf>,
    /// Evaluation failure message, when the run failed.
    #[serde(default)]
    pub error: Option<String>,
    /// Where the server wrote its evaluator log, if anywhere.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
}

/// Opaque location of a completed run's results. The display collaborator
/// knows how to read it; this crate only hands it around.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultLocation(pub PathBuf);

impl ResultLocation {
    pub fn as_path(&self) -> &std::path::Path {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.as_os_str().is_empty()
    }
}

/// Outcome of executing a compiled query on a live server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Evaluation completed and produced results.
    Completed {
        results: ResultLocation,
        log: Option<PathBuf>,
    },
    /// The live server reported an evaluation failure (including a
    /// server-side timeout). Surfaced as the query's result.
    Failed { message: String },
}

// ============================================================================
// Database Maintenance
// ============================================================================

/// Parameters for `database.resolve_upgrades` and `database.upgrade`.
#[derive(Debug, Clone, Serialize)]
pub struct UpgradeParams {
    #[serde(flatten)]
    pub database: DatabaseParams,
    /// Progress token; upgrades can be long-running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_token: Option<u64>,
}

/// Response from `database.resolve_upgrades`.
#[derive(Debug, Clone, Deserialize)]
pub struct ResolveUpgradesResponse {
    pub status: UpgradeStatus,
}

/// Parameters for `cache.clear`.
#[derive(Debug, Clone, Serialize)]
pub struct ClearCacheParams {
    #[serde(flatten)]
    pub database: DatabaseParams,
}

/// Response from `cache.clear`. Clearing an already-empty cache succeeds with
/// an equivalent acknowledgment; the operation is idempotent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ClearCacheResult {
    #[serde(default)]
    pub message: Option<String>,
}

// ============================================================================
// Metadata
// ============================================================================

/// Parameters for `query.resolve_metadata`.
#[derive(Debug, Clone, Serialize)]
pub struct ResolveMetadataParams {
    pub query_path: PathBuf,
}

/// Declared metadata of a query, resolved by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct QueryMetadata {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
}
