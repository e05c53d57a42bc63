//! The query server client.
//!
//! Owns at most one live connection (supervised process + RPC correlation
//! layer) and exposes the typed operations on top of it. Operations lazily
//! start a connection when none exists, share a live one concurrently
//! (distinguished purely by request id), and fail with `WorkerCrashed` when
//! the server dies mid-flight. A crashed connection is never restarted
//! silently -- in-flight assumptions about server state are no longer valid,
//! so the caller must stop or restart explicitly.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

use super::error::{ServerError, ServerResult};
use super::protocol::{
    self, ClearCacheParams, ClearCacheResult, CompileOutcome, CompileParams, CompileResponse,
    CompiledQueryHandle, DatabaseParams, Fragment, QueryMetadata, ResolveMetadataParams,
    ResolveUpgradesResponse, ResourceLimits, ResultLocation, RunOutcome, RunParams, RunResponse,
    UpgradeParams,
};
use crate::config::QueryServerConfig;
use crate::database::{DatabaseItem, UpgradeStatus};
use crate::dist::DistributionResolver;
use crate::eval::info::EvaluationInfo;
use crate::eval::progress::{ProgressRegistry, ProgressSender};
use crate::process::{self, ExitCallback, ExitInfo, SupervisedProcess};
use crate::rpc::protocol as wire;
use crate::rpc::{RpcConnection, RpcError};

/// Bounded wait for the server to acknowledge a graceful shutdown request.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Bounded wait for the process to exit after the transport is closed.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle notifications for observers of the client.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A connection was started and is ready for requests.
    ConnectionStarted,
    /// The server process exited outside of a requested stop.
    ConnectionDied { exit: Option<ExitInfo> },
    /// An evaluation run reached a terminal state.
    EvaluationFinished(Arc<EvaluationInfo>),
}

/// The typed operations the query server offers.
///
/// `QueryServerClient` is the production implementation; the trait is the
/// seam test doubles stand in at.
#[async_trait]
pub trait QueryServer: Send + Sync {
    /// Compile a query (or just a fragment of one, for quick evaluation)
    /// against a database context.
    async fn compile_query(
        &self,
        database: &DatabaseItem,
        source: &str,
        fragment: Option<Fragment>,
        progress: Option<ProgressSender>,
        cancel: &CancellationToken,
    ) -> ServerResult<CompileOutcome>;

    /// Execute a compiled plan against a database under resource limits.
    async fn run_compiled_query(
        &self,
        handle: &CompiledQueryHandle,
        database: &DatabaseItem,
        limits: ResourceLimits,
        progress: Option<ProgressSender>,
        cancel: &CancellationToken,
    ) -> ServerResult<RunOutcome>;

    /// Resolve whether a database needs an upgrade before queries can run.
    async fn resolve_upgrades(
        &self,
        database: &DatabaseItem,
        cancel: &CancellationToken,
    ) -> ServerResult<UpgradeStatus>;

    /// Upgrade a database in place.
    async fn run_upgrade(
        &self,
        database: &DatabaseItem,
        progress: Option<ProgressSender>,
        cancel: &CancellationToken,
    ) -> ServerResult<()>;

    /// Clear the evaluation cache for a database. Idempotent.
    async fn clear_cache(
        &self,
        database: &DatabaseItem,
        cancel: &CancellationToken,
    ) -> ServerResult<ClearCacheResult>;

    /// Resolve a query file's declared metadata.
    async fn resolve_metadata(
        &self,
        query_path: &Path,
        cancel: &CancellationToken,
    ) -> ServerResult<QueryMetadata>;
}

struct ServerConnection {
    rpc: Arc<RpcConnection>,
    process: SupervisedProcess,
    /// Set before a requested stop so the exit callback can tell a graceful
    /// exit from a crash.
    stopping: Arc<AtomicBool>,
}

/// Domain-facing client for one query server.
pub struct QueryServerClient {
    config: Mutex<QueryServerConfig>,
    dist: Arc<dyn DistributionResolver>,
    inner: Mutex<Option<ServerConnection>>,
    events: broadcast::Sender<ServerEvent>,
    progress: Arc<ProgressRegistry>,
    next_progress_token: AtomicU64,
    last_exit: Arc<std::sync::Mutex<Option<ExitInfo>>>,
}

impl QueryServerClient {
    pub fn new(config: QueryServerConfig, dist: Arc<dyn DistributionResolver>) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            config: Mutex::new(config),
            dist,
            inner: Mutex::new(None),
            events,
            progress: Arc::new(ProgressRegistry::new()),
            next_progress_token: AtomicU64::new(1),
            last_exit: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// The event sender, for collaborators that emit on the same channel.
    pub fn events(&self) -> broadcast::Sender<ServerEvent> {
        self.events.clone()
    }

    /// Replace the desired configuration. A live connection keeps its
    /// snapshot; the change is picked up on the next (re)start.
    pub async fn set_config(&self, config: QueryServerConfig) {
        *self.config.lock().await = config;
    }

    /// Whether a usable connection is up right now.
    pub async fn is_connected(&self) -> bool {
        let inner = self.inner.lock().await;
        inner
            .as_ref()
            .map(|conn| conn.rpc.is_open() && conn.process.is_alive())
            .unwrap_or(false)
    }

    /// Start the server if it is not already running. Idempotent; an
    /// explicit start also replaces a connection whose process has died.
    pub async fn start(&self) -> ServerResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(conn) = inner.as_ref() {
            if conn.rpc.is_open() && conn.process.is_alive() {
                return Ok(());
            }
            // Explicitly requested: clear the dead remnant and start fresh.
            inner.take();
        }
        self.start_locked(&mut inner).await?;
        Ok(())
    }

    /// Stop the server: graceful shutdown request with a bounded wait, then
    /// process-tree termination, then transport close. Idempotent -- stopping
    /// a stopped client is a no-op.
    pub async fn stop(&self) -> ServerResult<()> {
        let mut inner = self.inner.lock().await;
        let Some(conn) = inner.take() else {
            return Ok(());
        };
        conn.stopping.store(true, Ordering::SeqCst);

        if conn.rpc.is_open() && conn.process.is_alive() {
            let shutdown = conn.rpc.send(protocol::methods::SHUTDOWN, Value::Null);
            match tokio::time::timeout(SHUTDOWN_GRACE, shutdown).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::debug!(error = %e, "graceful shutdown request failed"),
                Err(_) => tracing::debug!("query server did not acknowledge shutdown in time"),
            }
        }
        conn.rpc.close().await;

        if !conn.process.wait_exited(EXIT_GRACE).await {
            conn.process.terminate_tree();
            conn.process.wait_exited(EXIT_GRACE).await;
        }
        tracing::info!("query server stopped");
        Ok(())
    }

    /// Stop if alive, then start with the current configuration.
    pub async fn restart(&self) -> ServerResult<()> {
        self.stop().await?;
        self.start().await
    }

    async fn start_locked(
        &self,
        inner: &mut Option<ServerConnection>,
    ) -> ServerResult<Arc<RpcConnection>> {
        let config = self.config.lock().await.clone();
        let program = match &config.server_path {
            Some(path) => path.clone(),
            None => self
                .dist
                .executable_path()
                .ok_or(ServerError::NoExecutable)?,
        };
        let args = config.to_server_args();

        if let Ok(mut last) = self.last_exit.lock() {
            *last = None;
        }

        let stopping = Arc::new(AtomicBool::new(false));
        let on_exit: ExitCallback = Box::new({
            let events = self.events.clone();
            let stopping = stopping.clone();
            let last_exit = self.last_exit.clone();
            move |info| {
                if let Ok(mut last) = last_exit.lock() {
                    *last = Some(info);
                }
                if stopping.load(Ordering::SeqCst) {
                    tracing::debug!(%info, "query server exited after shutdown request");
                } else {
                    tracing::warn!(%info, "query server exited unexpectedly");
                    let _ = events.send(ServerEvent::ConnectionDied { exit: Some(info) });
                }
            }
        });

        let mut process = process::spawn(&program, &args, &[], on_exit)?;
        let (stdin, stdout) = process
            .take_stdio()
            .ok_or_else(|| ServerError::Protocol("server stdio already taken".to_string()))?;
        let rpc = Arc::new(RpcConnection::new(stdout, stdin));

        let progress = self.progress.clone();
        rpc.on_notification(wire::methods::PROGRESS, move |params| {
            progress.dispatch(params);
        })
        .await;
        rpc.on_notification(wire::methods::LOG, |params| {
            match serde_json::from_value::<wire::LogParams>(params) {
                Ok(log) => tracing::info!(target: "quarry::server_log", "{}", log.line),
                Err(e) => tracing::debug!(error = %e, "malformed log notification"),
            }
        })
        .await;

        tracing::info!(program = %program.display(), pid = process.pid(), "query server started");
        *inner = Some(ServerConnection {
            rpc: rpc.clone(),
            process,
            stopping,
        });
        let _ = self.events.send(ServerEvent::ConnectionStarted);
        Ok(rpc)
    }

    /// A connection to send on: the live one, or a lazily started one if none
    /// was ever started. A connection that died is NOT replaced here -- that
    /// would be a silent restart -- so sends fail with `ConnectionClosed`
    /// until the caller stops or restarts.
    async fn ensure_connected(&self) -> ServerResult<Arc<RpcConnection>> {
        let mut inner = self.inner.lock().await;
        if let Some(conn) = inner.as_ref() {
            if conn.rpc.is_open() && conn.process.is_alive() {
                return Ok(conn.rpc.clone());
            }
            return Err(ServerError::ConnectionClosed);
        }
        self.start_locked(&mut inner).await
    }

    async fn request(
        &self,
        method: &str,
        params: Value,
        cancel: &CancellationToken,
    ) -> ServerResult<Value> {
        let rpc = self.ensure_connected().await?;
        match rpc.send_with_token(method, params, cancel).await {
            Ok(value) => Ok(value),
            Err(RpcError::WorkerCrashed) => Err(ServerError::WorkerCrashed {
                exit: self.last_exit(),
            }),
            Err(other) => Err(other.into()),
        }
    }

    fn last_exit(&self) -> Option<ExitInfo> {
        self.last_exit.lock().ok().and_then(|guard| *guard)
    }

    fn fresh_progress_token(&self) -> u64 {
        self.next_progress_token.fetch_add(1, Ordering::SeqCst)
    }

    fn parse<T: serde::de::DeserializeOwned>(context: &str, value: Value) -> ServerResult<T> {
        serde_json::from_value(value)
            .map_err(|e| ServerError::Protocol(format!("bad {context} response: {e}")))
    }
}

#[async_trait]
impl QueryServer for QueryServerClient {
    async fn compile_query(
        &self,
        database: &DatabaseItem,
        source: &str,
        fragment: Option<Fragment>,
        progress: Option<ProgressSender>,
        cancel: &CancellationToken,
    ) -> ServerResult<CompileOutcome> {
        let token = self.fresh_progress_token();
        let params = serde_json::to_value(CompileParams {
            database: DatabaseParams::from(database),
            source: source.to_string(),
            fragment,
            progress_token: token,
        })
        .map_err(ServerError::Encode)?;

        if let Some(sink) = progress {
            self.progress.register(token, sink);
        }
        let result = self.request(protocol::methods::COMPILE, params, cancel).await;
        self.progress.unregister(token);

        let response: CompileResponse = Self::parse("compile", result?)?;
        match response.handle {
            Some(handle) => Ok(CompileOutcome::Compiled(CompiledQueryHandle(handle))),
            None => Ok(CompileOutcome::Failed(response.diagnostics)),
        }
    }

    async fn run_compiled_query(
        &self,
        handle: &CompiledQueryHandle,
        database: &DatabaseItem,
        limits: ResourceLimits,
        progress: Option<ProgressSender>,
        cancel: &CancellationToken,
    ) -> ServerResult<RunOutcome> {
        let token = self.fresh_progress_token();
        let params = serde_json::to_value(RunParams {
            database: DatabaseParams::from(database),
            handle: handle.as_str().to_string(),
            limits,
            progress_token: token,
        })
        .map_err(ServerError::Encode)?;

        if let Some(sink) = progress {
            self.progress.register(token, sink);
        }
        let result = self.request(protocol::methods::RUN, params, cancel).await;
        self.progress.unregister(token);

        let response: RunResponse = Self::parse("run", result?)?;
        match response.result_location {
            Some(path) => Ok(RunOutcome::Completed {
                results: ResultLocation(path),
                log: response.log_path,
            }),
            None => Ok(RunOutcome::Failed {
                message: response
                    .error
                    .unwrap_or_else(|| "query evaluation failed".to_string()),
            }),
        }
    }

    async fn resolve_upgrades(
        &self,
        database: &DatabaseItem,
        cancel: &CancellationToken,
    ) -> ServerResult<UpgradeStatus> {
        let params = serde_json::to_value(UpgradeParams {
            database: DatabaseParams::from(database),
            progress_token: None,
        })
        .map_err(ServerError::Encode)?;

        let value = self
            .request(protocol::methods::RESOLVE_UPGRADES, params, cancel)
            .await?;
        let response: ResolveUpgradesResponse = Self::parse("resolve_upgrades", value)?;
        Ok(response.status)
    }

    async fn run_upgrade(
        &self,
        database: &DatabaseItem,
        progress: Option<ProgressSender>,
        cancel: &CancellationToken,
    ) -> ServerResult<()> {
        let token = self.fresh_progress_token();
        let params = serde_json::to_value(UpgradeParams {
            database: DatabaseParams::from(database),
            progress_token: Some(token),
        })
        .map_err(ServerError::Encode)?;

        if let Some(sink) = progress {
            self.progress.register(token, sink);
        }
        let result = self.request(protocol::methods::UPGRADE, params, cancel).await;
        self.progress.unregister(token);

        result.map(|_| ())
    }

    async fn clear_cache(
        &self,
        database: &DatabaseItem,
        cancel: &CancellationToken,
    ) -> ServerResult<ClearCacheResult> {
        let params = serde_json::to_value(ClearCacheParams {
            database: DatabaseParams::from(database),
        })
        .map_err(ServerError::Encode)?;

        let value = self
            .request(protocol::methods::CLEAR_CACHE, params, cancel)
            .await?;
        Self::parse("clear_cache", value)
    }

    async fn resolve_metadata(
        &self,
        query_path: &Path,
        cancel: &CancellationToken,
    ) -> ServerResult<QueryMetadata> {
        let params = serde_json::to_value(ResolveMetadataParams {
            query_path: query_path.to_path_buf(),
        })
        .map_err(ServerError::Encode)?;

        let value = self
            .request(protocol::methods::RESOLVE_METADATA, params, cancel)
            .await?;
        Self::parse("resolve_metadata", value)
    }
}
