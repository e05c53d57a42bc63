//! The selected analysis target and its manager interface.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Whether a database's on-disk format matches what the server expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeStatus {
    /// Up to date; queries can run directly.
    Current,
    /// Must be upgraded before queries can run.
    NeedsUpgrade,
    /// Not yet resolved against the server.
    Unknown,
}

/// The currently selected analysis target.
///
/// Mutated only by explicit user selection; each evaluation run captures a
/// snapshot at start and never observes a mid-run change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseItem {
    /// Path to the database content.
    pub path: PathBuf,
    /// Declared source archive location, if any.
    pub source_archive: Option<PathBuf>,
    /// Upgrade status as last resolved.
    pub upgrade_status: UpgradeStatus,
}

impl DatabaseItem {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            source_archive: None,
            upgrade_status: UpgradeStatus::Unknown,
        }
    }

    pub fn with_source_archive(mut self, archive: impl Into<PathBuf>) -> Self {
        self.source_archive = Some(archive.into());
        self
    }
}

/// Change notification from a database manager.
#[derive(Debug, Clone)]
pub enum DatabaseEvent {
    /// The active selection changed (possibly to none).
    SelectionChanged(Option<DatabaseItem>),
}

/// External collaborator interface: tracks which database is selected.
pub trait DatabaseManager: Send + Sync {
    /// The current selection, if any.
    fn active_database(&self) -> Option<DatabaseItem>;

    /// Subscribe to selection changes.
    fn subscribe(&self) -> broadcast::Receiver<DatabaseEvent>;
}

/// In-process database manager keyed by explicit selection.
pub struct DatabaseRegistry {
    active: std::sync::Mutex<Option<DatabaseItem>>,
    events: broadcast::Sender<DatabaseEvent>,
}

impl DatabaseRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            active: std::sync::Mutex::new(None),
            events,
        }
    }

    /// Select a database (or clear the selection with `None`).
    pub fn set_active(&self, item: Option<DatabaseItem>) {
        if let Ok(mut active) = self.active.lock() {
            *active = item.clone();
        }
        let _ = self.events.send(DatabaseEvent::SelectionChanged(item));
    }
}

impl Default for DatabaseRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DatabaseManager for DatabaseRegistry {
    fn active_database(&self) -> Option<DatabaseItem> {
        self.active.lock().ok().and_then(|guard| guard.clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<DatabaseEvent> {
        self.events.subscribe()
    }
}
