//! Explicit host-session lifecycle.
//!
//! The host entry point owns one `ExtensionSession` and passes it to whatever
//! needs to check lifecycle state -- there is no process-wide "activation
//! began" flag. Initialization is staged: first the distribution must
//! resolve, then the client and evaluator come up.

use std::sync::Arc;

use thiserror::Error;

use crate::config::{Settings, SettingsError};
use crate::database::DatabaseRegistry;
use crate::dist::{DistError, DistributionResolver};
use crate::eval::{EvaluationHistory, Evaluator, ResultDisplay};
use crate::server::{QueryServer, QueryServerClient, ServerError};

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing resolved yet.
    Uninitialized,
    /// A server distribution is available; the client is not up yet.
    DistributionReady,
    /// Client and evaluator are ready for use.
    FullyActive,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Dist(#[from] DistError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Server(#[from] ServerError),
}

/// One host session: settings, collaborators, and the client/evaluator pair.
pub struct ExtensionSession {
    state: SessionState,
    settings: Settings,
    dist: Arc<dyn DistributionResolver>,
    display: Arc<dyn ResultDisplay>,
    databases: Arc<DatabaseRegistry>,
    history: Arc<EvaluationHistory>,
    client: Option<Arc<QueryServerClient>>,
    evaluator: Option<Arc<Evaluator>>,
}

impl ExtensionSession {
    pub fn new(
        settings: Settings,
        dist: Arc<dyn DistributionResolver>,
        display: Arc<dyn ResultDisplay>,
    ) -> Self {
        let history = Arc::new(EvaluationHistory::new(settings.history.capacity));
        Self {
            state: SessionState::Uninitialized,
            settings,
            dist,
            display,
            databases: Arc::new(DatabaseRegistry::new()),
            history,
            client: None,
            evaluator: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn databases(&self) -> &Arc<DatabaseRegistry> {
        &self.databases
    }

    pub fn history(&self) -> &Arc<EvaluationHistory> {
        &self.history
    }

    /// The client, once the session is fully active.
    pub fn client(&self) -> Option<&Arc<QueryServerClient>> {
        self.client.as_ref()
    }

    /// The evaluator, once the session is fully active.
    pub fn evaluator(&self) -> Option<&Arc<Evaluator>> {
        self.evaluator.as_ref()
    }

    /// Bring the session up. Idempotent: initializing an already-active
    /// session is a no-op, which is what makes repeated host activation safe.
    pub async fn initialize(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::FullyActive {
            return Ok(());
        }

        if self.state == SessionState::Uninitialized {
            if self.dist.executable_path().is_none() {
                self.dist.install_or_update(None).await?;
            }
            self.state = SessionState::DistributionReady;
        }

        let config = self.settings.server.to_query_server_config()?;
        let client = Arc::new(QueryServerClient::new(config.clone(), self.dist.clone()));
        let server: Arc<dyn QueryServer> = client.clone();
        let evaluator = Evaluator::new(
            server,
            self.databases.clone(),
            self.history.clone(),
            self.display.clone(),
            config.limits(),
        )
        .with_events(client.events());

        self.client = Some(client);
        self.evaluator = Some(Arc::new(evaluator));
        self.state = SessionState::FullyActive;
        tracing::debug!("session fully active");
        Ok(())
    }

    /// Adopt new settings. A live connection keeps its snapshot; the change
    /// takes effect on the next server (re)start.
    pub async fn update_settings(&mut self, settings: Settings) -> Result<(), SessionError> {
        self.settings = settings;
        if let Some(client) = &self.client {
            let config = self.settings.server.to_query_server_config()?;
            client.set_config(config).await;
        }
        Ok(())
    }

    /// Stop the server and drop back to `DistributionReady`.
    pub async fn shutdown(&mut self) -> Result<(), SessionError> {
        if let Some(client) = self.client.take() {
            client.stop().await?;
        }
        self.evaluator = None;
        if self.state == SessionState::FullyActive {
            self.state = SessionState::DistributionReady;
        }
        Ok(())
    }
}
